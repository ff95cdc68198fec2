use std::net::Ipv4Addr;

use get_if_addrs::{get_if_addrs, IfAddr, Ifv4Addr};

use crate::settings::NetworkSettings;

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("Not connected to a Wi-Fi network (no usable IPv4 interface)")]
    NotConnected,

    #[error("Could not list network interfaces: {0}")]
    Interfaces(#[from] std::io::Error),
}

/// The IPv4 network discovery runs against.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LocalNetwork {
    pub ip: Ipv4Addr,
    pub broadcast: Ipv4Addr,
}

impl LocalNetwork {
    /// Assumes a /24 when nothing better is known, like most home routers.
    pub fn from_ip(ip: Ipv4Addr) -> LocalNetwork {
        LocalNetwork {
            ip,
            broadcast: broadcast_address(ip, Ipv4Addr::new(255, 255, 255, 0)),
        }
    }

    /// The 254 host addresses of the /24 containing our own address.
    pub fn scan_hosts(&self) -> Vec<Ipv4Addr> {
        let [a, b, c, _] = self.ip.octets();
        (1..=254).map(|d| Ipv4Addr::new(a, b, c, d)).collect()
    }
}

pub fn broadcast_address(ip: Ipv4Addr, netmask: Ipv4Addr) -> Ipv4Addr {
    let ip = u32::from(ip);
    let netmask = u32::from(netmask);
    Ipv4Addr::from((ip & netmask) | !netmask)
}

fn usable(addr: &Ifv4Addr) -> bool {
    !addr.ip.is_loopback() && !addr.ip.is_link_local() && !addr.ip.is_unspecified()
}

/// Picks the interface to discover on. Private (RFC 1918) addresses are
/// preferred over anything else that is not loopback or link-local.
pub fn local_network(settings: &NetworkSettings) -> Result<LocalNetwork, NetworkError> {
    if let Some(ip) = settings.local_ip {
        let network = LocalNetwork::from_ip(ip);
        return Ok(LocalNetwork {
            broadcast: settings.broadcast_addr.unwrap_or(network.broadcast),
            ..network
        });
    }

    let candidates: Vec<Ifv4Addr> = get_if_addrs()?
        .into_iter()
        .filter_map(|interface| match interface.addr {
            IfAddr::V4(addr) => Some(addr),
            IfAddr::V6(_) => None,
        })
        .filter(usable)
        .collect();

    let chosen = candidates
        .iter()
        .find(|addr| addr.ip.is_private())
        .or_else(|| candidates.first())
        .ok_or(NetworkError::NotConnected)?;

    let broadcast = settings
        .broadcast_addr
        .or(chosen.broadcast)
        .unwrap_or_else(|| broadcast_address(chosen.ip, chosen.netmask));

    Ok(LocalNetwork {
        ip: chosen.ip,
        broadcast,
    })
}
