use std::{
    collections::HashSet,
    future::Future,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use futures::future::join_all;
use tokio::{net::UdpSocket, sync::watch, time::Instant};

use crate::{
    bulb::{Bulb, DiscoveredBulb},
    protocols::udp::RECV_BUFFER_SIZE,
    settings::Settings,
};

use super::{
    ble::{to_discovered, BleScanner},
    network::{local_network, LocalNetwork, NetworkError},
    probe::{parse_probe_reply, probe_bulb},
    protocol::WizRequest,
};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum DiscoveryState {
    #[default]
    Idle,
    Scanning,
    Success,
    NoDevicesFound,
    Error(String),
}

pub type DiscoveredList = Arc<Vec<DiscoveredBulb>>;

/// Unions the results of every strategy, keeping the first bulb seen for
/// each MAC, and drops bulbs that are already adopted.
pub fn merge_discovered<I>(strategies: I, existing: &[Bulb]) -> Vec<DiscoveredBulb>
where
    I: IntoIterator<Item = Vec<DiscoveredBulb>>,
{
    let mut seen = HashSet::new();

    strategies
        .into_iter()
        .flatten()
        .filter(|bulb| seen.insert(bulb.mac.clone()))
        .filter(|bulb| !existing.iter().any(|adopted| adopted.matches_discovered(bulb)))
        .collect()
}

/// Probes `hosts` in batches of `batch_size`, never running more than one
/// batch at a time.
pub async fn scan_range<F, Fut>(hosts: &[Ipv4Addr], batch_size: usize, probe: F) -> Vec<DiscoveredBulb>
where
    F: Fn(Ipv4Addr) -> Fut,
    Fut: Future<Output = Option<DiscoveredBulb>>,
{
    let mut found = vec![];

    for batch in hosts.chunks(batch_size.max(1)) {
        let results = join_all(batch.iter().map(|host| probe(*host))).await;
        found.extend(results.into_iter().flatten());
    }

    found
}

/// Sends one `registration` broadcast and collects every bulb that answers
/// within `listen`.
pub async fn discover_via_broadcast(
    network: &LocalNetwork,
    port: u16,
    phone_mac: &str,
    listen: Duration,
) -> std::io::Result<Vec<DiscoveredBulb>> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    socket.set_broadcast(true)?;

    let request = WizRequest::registration(phone_mac).to_bytes()?;
    log::debug!("Sending registration broadcast to {}:{}", network.broadcast, port);
    socket
        .send_to(&request, SocketAddr::from((network.broadcast, port)))
        .await?;

    let deadline = Instant::now() + listen;
    let mut responders = HashSet::new();
    let mut found = vec![];
    let mut buf = [0u8; RECV_BUFFER_SIZE];

    loop {
        let received = tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await;

        let (len, from) = match received {
            Ok(Ok(received)) => received,
            Ok(Err(e)) => {
                log::warn!("Stopped listening for broadcast replies: {e}");
                break;
            }
            Err(_) => break,
        };

        let IpAddr::V4(address) = from.ip() else {
            continue;
        };

        if !responders.insert(address) {
            continue;
        }

        if let Some(bulb) = parse_probe_reply(&buf[..len], address) {
            log::debug!("Discovered {} at {}", bulb.mac, bulb.address);
            found.push(bulb);
        }
    }

    Ok(found)
}

/// Puts the state back to `Idle` when a run is dropped before it finishes,
/// unless a newer run or a reset has taken over.
struct RunGuard<'a> {
    discovery: &'a Discovery,
    generation: u64,
    finished: bool,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if self.finished || self.discovery.generation.load(Ordering::SeqCst) != self.generation {
            return;
        }

        log::debug!("Discovery run cancelled");
        self.discovery.state.send_replace(DiscoveryState::Idle);
    }
}

/// Finds bulbs that are not adopted yet.
///
/// Wi-Fi discovery tries a broadcast first and only scans the /24 when the
/// broadcast found nothing. A BLE scan runs alongside when a scanner is
/// configured. Progress and results are published through watch channels,
/// each update replacing the whole value.
pub struct Discovery {
    settings: Settings,
    ble: Option<Arc<dyn BleScanner>>,
    state: watch::Sender<DiscoveryState>,
    found: watch::Sender<DiscoveredList>,
    generation: AtomicU64,
}

impl Discovery {
    pub fn new(settings: &Settings, ble: Option<Arc<dyn BleScanner>>) -> Discovery {
        let (state, _) = watch::channel(DiscoveryState::Idle);
        let (found, _) = watch::channel(Arc::new(vec![]));

        Discovery {
            settings: settings.clone(),
            ble,
            state,
            found,
            generation: AtomicU64::new(0),
        }
    }

    pub fn subscribe_state(&self) -> watch::Receiver<DiscoveryState> {
        self.state.subscribe()
    }

    pub fn subscribe_found(&self) -> watch::Receiver<DiscoveredList> {
        self.found.subscribe()
    }

    pub fn state(&self) -> DiscoveryState {
        self.state.borrow().clone()
    }

    pub fn found(&self) -> DiscoveredList {
        self.found.borrow().clone()
    }

    /// Back to `Idle` with an empty result list.
    pub fn reset(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.state.send_replace(DiscoveryState::Idle);
        self.found.send_replace(Arc::new(vec![]));
    }

    /// Drops one bulb from the published results, e.g. after adopting it.
    pub fn remove_found(&self, mac: &str) {
        let remaining: Vec<DiscoveredBulb> = self
            .found()
            .iter()
            .filter(|bulb| bulb.mac != mac)
            .cloned()
            .collect();

        self.found.send_replace(Arc::new(remaining));
    }

    /// Runs one discovery pass and returns its terminal state.
    ///
    /// Starting a new pass while another is scanning restarts from scratch:
    /// the result list is cleared immediately and the older pass no longer
    /// publishes anything when it finishes. Dropping the returned future
    /// cancels the pass and publishes `Idle`.
    pub async fn run(&self, existing: &[Bulb]) -> DiscoveryState {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        self.state.send_replace(DiscoveryState::Scanning);
        self.found.send_replace(Arc::new(vec![]));
        log::info!("Starting bulb discovery");
        let mut guard = RunGuard {
            discovery: self,
            generation,
            finished: false,
        };

        let (wifi, ble) = tokio::join!(self.discover_wifi(), self.discover_ble());

        let (state, found) = match wifi {
            Ok(wifi) => {
                let found = merge_discovered([wifi, ble], existing);
                let state = if found.is_empty() {
                    DiscoveryState::NoDevicesFound
                } else {
                    DiscoveryState::Success
                };
                (state, found)
            }
            Err(e) => {
                log::warn!("Discovery failed: {e}");
                (DiscoveryState::Error(e.to_string()), vec![])
            }
        };

        guard.finished = true;

        if self.generation.load(Ordering::SeqCst) != generation {
            log::debug!("Discarding results of superseded discovery run");
            return state;
        }

        log::info!("Discovery finished with {state:?}, {} new bulb(s)", found.len());
        self.found.send_replace(Arc::new(found));
        self.state.send_replace(state.clone());

        state
    }

    async fn discover_wifi(&self) -> Result<Vec<DiscoveredBulb>, NetworkError> {
        let network = local_network(&self.settings.network)?;
        let settings = &self.settings.network;

        let broadcast = tokio::time::timeout(
            settings.discovery_timeout(),
            discover_via_broadcast(
                &network,
                settings.port,
                &settings.phone_mac,
                settings.broadcast_listen(),
            ),
        )
        .await;

        let found = match broadcast {
            Ok(Ok(found)) => found,
            Ok(Err(e)) => {
                log::warn!("Broadcast discovery failed: {e}");
                vec![]
            }
            Err(_) => {
                log::warn!("Broadcast discovery timed out");
                vec![]
            }
        };

        if !found.is_empty() {
            return Ok(found);
        }

        log::info!("Broadcast found nothing, scanning {}/24", network.ip);

        let port = settings.port;
        let timeout = settings.probe_timeout();
        let found = scan_range(
            &network.scan_hosts(),
            settings.ip_scan_batch_size,
            |host| probe_bulb(host, port, timeout),
        )
        .await;

        Ok(found)
    }

    async fn discover_ble(&self) -> Vec<DiscoveredBulb> {
        let Some(scanner) = &self.ble else {
            return vec![];
        };

        let duration = Duration::from_secs(self.settings.ble.scan_seconds);
        match scanner.scan(duration).await {
            Ok(advertisements) => advertisements.iter().filter_map(to_discovered).collect(),
            Err(e) => {
                log::warn!("BLE scan failed: {e:?}");
                vec![]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;

    use super::*;
    use crate::{
        bulb::BulbBuilder,
        wiz::{ble::BleAdvertisement, fake_bulb::FakeBulb},
    };

    fn discovered(mac: &str, address: &str) -> DiscoveredBulb {
        DiscoveredBulb {
            name: format!("WiZ Bulb ({mac})"),
            address: address.to_string(),
            mac: mac.to_string(),
            is_ble: false,
        }
    }

    fn adopted(id: &str, address: &str) -> Bulb {
        BulbBuilder::default()
            .id(id)
            .name(id)
            .address(address)
            .build()
            .unwrap()
    }

    fn loopback_settings(port: u16) -> Settings {
        let mut settings = Settings::default();
        settings.network.port = port;
        settings.network.local_ip = Some(Ipv4Addr::LOCALHOST);
        settings.network.broadcast_addr = Some(Ipv4Addr::LOCALHOST);
        settings.network.broadcast_listen_ms = 200;
        settings.network.discovery_timeout_ms = 1000;
        settings.network.probe_timeout_ms = 100;
        settings
    }

    struct FixedScanner(Vec<BleAdvertisement>);

    #[async_trait]
    impl BleScanner for FixedScanner {
        async fn scan(&self, _duration: Duration) -> color_eyre::Result<Vec<BleAdvertisement>> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn merge_keeps_first_bulb_per_mac() {
        let broadcast = vec![discovered("aa", "10.0.0.2"), discovered("bb", "10.0.0.3")];
        let scan = vec![discovered("bb", "10.0.0.99"), discovered("cc", "10.0.0.4")];

        let once = merge_discovered([broadcast.clone(), scan.clone()], &[]);
        let macs: Vec<&str> = once.iter().map(|bulb| bulb.mac.as_str()).collect();
        assert_eq!(macs, ["aa", "bb", "cc"]);
        assert_eq!(once[1].address, "10.0.0.3");

        let twice = merge_discovered([once.clone(), broadcast, scan], &[]);
        assert_eq!(twice, once);
    }

    #[test]
    fn merge_excludes_adopted_bulbs_by_ip_or_mac() {
        let found = vec![
            discovered("aa", "192.168.1.10"),
            discovered("bb", "192.168.1.11"),
            discovered("cc", "192.168.1.12"),
        ];
        let existing = [
            adopted("manual-1", "192.168.1.10"),
            adopted("manual-2", "192.168.1.11"),
            adopted("cc", "192.168.1.200"),
        ];

        assert!(merge_discovered([found], &existing).is_empty());
    }

    #[tokio::test]
    async fn scan_never_exceeds_batch_size() {
        let hosts = LocalNetwork::from_ip(Ipv4Addr::new(192, 168, 1, 1)).scan_hosts();
        let in_flight = AtomicUsize::new(0);
        let max_in_flight = AtomicUsize::new(0);

        let found = scan_range(&hosts, 50, |host| {
            let in_flight = &in_flight;
            let max_in_flight = &max_in_flight;
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                max_in_flight.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);

                (host.octets()[3] % 100 == 0).then(|| DiscoveredBulb::from_wifi(host, None))
            }
        })
        .await;

        assert_eq!(max_in_flight.load(Ordering::SeqCst), 50);
        assert_eq!(found.len(), 2);
    }

    #[tokio::test]
    async fn broadcast_discovery_finds_bulb() {
        let bulb = FakeBulb::start("a8bb50000001").await;
        let discovery = Discovery::new(&loopback_settings(bulb.port()), None);
        let mut state = discovery.subscribe_state();

        let result = discovery.run(&[]).await;

        assert_eq!(result, DiscoveryState::Success);
        assert_eq!(*state.borrow_and_update(), DiscoveryState::Success);

        let found = discovery.found();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].mac, "a8bb50000001");
        assert_eq!(found[0].address, "127.0.0.1");
        assert_eq!(found[0].name, "WiZ Bulb (1)");
    }

    #[tokio::test]
    async fn already_adopted_bulbs_are_not_new() {
        let bulb = FakeBulb::start("a8bb50000002").await;
        let discovery = Discovery::new(&loopback_settings(bulb.port()), None);

        let result = discovery.run(&[adopted("manual", "127.0.0.1")]).await;

        assert_eq!(result, DiscoveryState::NoDevicesFound);
        assert!(discovery.found().is_empty());
    }

    #[tokio::test]
    async fn falls_back_to_ip_scan() {
        let bulb = FakeBulb::start("a8bb50000003").await;
        bulb.update(|state| state.answer_registration = false);
        let discovery = Discovery::new(&loopback_settings(bulb.port()), None);

        let result = discovery.run(&[]).await;

        assert_eq!(result, DiscoveryState::Success);
        assert_eq!(discovery.found()[0].mac, "a8bb50000003");
        assert!(bulb
            .received()
            .iter()
            .any(|request| matches!(request, WizRequest::GetPilot(_))));
    }

    #[tokio::test]
    async fn ble_results_are_merged() {
        let bulb = FakeBulb::start("a8bb50000004").await;
        let scanner = FixedScanner(vec![
            BleAdvertisement {
                address: "A4:C1:38:00:00:01".to_string(),
                name: Some("Wipro Smart Bulb".to_string()),
                services: vec![],
            },
            BleAdvertisement {
                address: "A4:C1:38:00:00:02".to_string(),
                name: Some("Headphones".to_string()),
                services: vec![],
            },
        ]);
        let discovery = Discovery::new(&loopback_settings(bulb.port()), Some(Arc::new(scanner)));

        discovery.run(&[]).await;

        let found = discovery.found();
        assert_eq!(found.len(), 2);
        assert!(found.iter().any(|bulb| bulb.is_ble && bulb.mac == "A4:C1:38:00:00:01"));
    }

    #[tokio::test]
    async fn reset_and_remove_replace_results() {
        let bulb = FakeBulb::start("a8bb50000005").await;
        let discovery = Discovery::new(&loopback_settings(bulb.port()), None);
        discovery.run(&[]).await;

        discovery.remove_found("a8bb50000005");
        assert!(discovery.found().is_empty());
        assert_eq!(discovery.state(), DiscoveryState::Success);

        discovery.reset();
        assert_eq!(discovery.state(), DiscoveryState::Idle);
    }

    #[tokio::test]
    async fn dropped_run_returns_to_idle() {
        let bulb = FakeBulb::start("a8bb50000006").await;
        let discovery = Discovery::new(&loopback_settings(bulb.port()), None);
        let mut state = discovery.subscribe_state();

        let outcome = tokio::time::timeout(Duration::from_millis(50), discovery.run(&[])).await;

        assert!(outcome.is_err());
        assert_eq!(discovery.state(), DiscoveryState::Idle);
        assert!(discovery.found().is_empty());
        assert!(state.has_changed().unwrap());
        assert_eq!(*state.borrow_and_update(), DiscoveryState::Idle);
    }

    #[tokio::test]
    async fn dropped_run_leaves_newer_state_alone() {
        let bulb = FakeBulb::start("a8bb50000007").await;
        let discovery = Discovery::new(&loopback_settings(bulb.port()), None);

        {
            let run = discovery.run(&[]);
            tokio::pin!(run);
            let _ = tokio::time::timeout(Duration::from_millis(50), &mut run).await;
            assert_eq!(discovery.state(), DiscoveryState::Scanning);

            let newer = discovery.run(&[]).await;
            assert_eq!(newer, DiscoveryState::Success);
        }

        assert_eq!(discovery.state(), DiscoveryState::Success);
    }
}
