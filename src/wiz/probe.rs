use std::{
    net::{Ipv4Addr, SocketAddr},
    time::Duration,
};

use serde::Deserialize;
use tokio::net::UdpSocket;

use crate::{bulb::DiscoveredBulb, protocols::udp::RECV_BUFFER_SIZE};

use super::protocol::WizRequest;

#[derive(Deserialize, Debug)]
struct MacResult {
    mac: Option<String>,
}

/// Anything that parses as JSON counts as a bulb. Older firmware puts the
/// MAC at the top level instead of inside `result`.
#[derive(Deserialize, Debug)]
struct ProbeReply {
    result: Option<MacResult>,
    mac: Option<String>,
}

/// Turns any reply datagram from `address` into a discovered bulb, or `None`
/// if it is not JSON.
pub fn parse_probe_reply(bytes: &[u8], address: Ipv4Addr) -> Option<DiscoveredBulb> {
    let reply: ProbeReply = match serde_json::from_slice(bytes) {
        Ok(reply) => reply,
        Err(e) => {
            log::debug!("Reply from {address} is not a bulb: {e}");
            return None;
        }
    };

    let mac = reply.result.and_then(|result| result.mac).or(reply.mac);

    Some(DiscoveredBulb::from_wifi(address, mac))
}

/// Checks whether `address` hosts a bulb by sending `getPilot` from a fresh
/// socket and waiting up to `timeout` for a reply.
///
/// Probes bypass the shared socket so a range scan can run many of them at
/// once. Every failure means "not a bulb", which is the normal outcome for
/// almost every address on a subnet.
pub async fn probe_bulb(address: Ipv4Addr, port: u16, timeout: Duration) -> Option<DiscoveredBulb> {
    let result = tokio::time::timeout(timeout, exchange(address, port)).await;

    match result {
        Ok(Ok(Some(bulb))) => Some(bulb),
        Ok(Ok(None)) => None,
        Ok(Err(e)) => {
            log::trace!("Probe of {address} failed: {e}");
            None
        }
        Err(_) => None,
    }
}

async fn exchange(address: Ipv4Addr, port: u16) -> std::io::Result<Option<DiscoveredBulb>> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    let target = SocketAddr::from((address, port));

    let request = WizRequest::get_pilot().to_bytes()?;
    socket.send_to(&request, target).await?;

    let mut buf = [0u8; RECV_BUFFER_SIZE];
    loop {
        let (len, from) = socket.recv_from(&mut buf).await?;

        if from.ip() == target.ip() {
            return Ok(parse_probe_reply(&buf[..len], address));
        }

        log::debug!("Ignoring stray datagram from {from} while probing {address}");
    }
}
