use std::{sync::Arc, time::Instant};

use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{energy::EnergyLedger, registry::BulbRegistry, settings::PollingSettings};

/// Runs one refresh cycle as of `now`.
///
/// Every bulb that is on accrues one interval worth of energy. Bulbs that
/// received a command within the cooldown window are not queried this cycle,
/// all others are queried concurrently. Replies are merged into the registry
/// in a single write, skipping any bulb that was commanded while the queries
/// were in flight. Returns how many bulbs were queried.
pub async fn refresh_once(
    registry: &BulbRegistry,
    energy: &dyn EnergyLedger,
    settings: &PollingSettings,
    now: Instant,
) -> usize {
    let started = Instant::now();
    let bulbs = registry.bulbs();
    let hours = settings.interval().as_secs_f64() / 3600.0;

    let mut total_wh = 0.0;
    for bulb in bulbs.iter().filter(|bulb| bulb.is_on) {
        let wh = f64::from(bulb.power_draw()) * hours;
        energy.add_bulb_usage(&bulb.id, wh);
        total_wh += wh;
    }
    energy.add_usage(total_wh);

    let cooldowns = registry.cooldowns();
    let due: Vec<_> = bulbs
        .iter()
        .filter(|bulb| {
            let cooling = cooldowns.is_cooling(&bulb.id, now, settings.cooldown());
            if cooling {
                log::trace!("Skipping status of {}, recently commanded", bulb.name);
            }
            !cooling
        })
        .collect();

    let controller = registry.controller();
    let fetched = join_all(due.iter().map(|bulb| controller.fetch_status(bulb))).await;
    let queried = fetched.len();

    registry
        .write_bulbs(|bulbs| {
            for status in fetched {
                if cooldowns
                    .last_command(&status.id)
                    .is_some_and(|at| at >= started)
                {
                    continue;
                }

                let Some(cached) = bulbs.iter_mut().find(|bulb| bulb.id == status.id) else {
                    continue;
                };

                if cached.available && !status.available {
                    log::info!("{} ({}) stopped responding", cached.name, cached.address);
                }

                cached.is_on = status.is_on;
                cached.brightness = status.brightness;
                cached.mode = status.mode;
                cached.available = status.available;
                if cached.mac.is_none() {
                    cached.mac = status.mac;
                }
            }
        })
        .await;

    queried
}

/// Periodically reconciles cached bulb state with the bulbs themselves until
/// `cancel` fires. A cycle in progress is abandoned on cancellation; the
/// registry write at its end happens in full or not at all.
pub fn start_refresh_loop(
    settings: &PollingSettings,
    registry: Arc<BulbRegistry>,
    energy: Arc<dyn EnergyLedger>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let settings = settings.clone();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(settings.interval()) => {}
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                queried = refresh_once(&registry, energy.as_ref(), &settings, Instant::now()) => {
                    log::trace!("Refreshed {queried} bulb(s)");
                }
            }
        }

        log::debug!("Refresh loop stopped");
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        bulb::{Bulb, BulbBuilder, BulbMode},
        energy::JsonEnergyLedger,
        protocols::udp::SocketManager,
        settings::NetworkSettings,
        store::{BulbStore, MemoryStore},
        wiz::{
            controller::BulbController,
            fake_bulb::FakeBulb,
            protocol::{SetPilotParams, WizRequest},
            scenes::SceneId,
        },
    };

    fn registry(port: u16, bulbs: Vec<Bulb>) -> (Arc<BulbRegistry>, Arc<MemoryStore>) {
        registry_with_timeout(port, 200, bulbs)
    }

    fn registry_with_timeout(
        port: u16,
        socket_timeout_ms: u64,
        bulbs: Vec<Bulb>,
    ) -> (Arc<BulbRegistry>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        store.save_bulbs(&bulbs).unwrap();

        let network = NetworkSettings {
            port,
            socket_timeout_ms,
            ..Default::default()
        };
        let controller = BulbController::new(Arc::new(SocketManager::default()), &network);

        (
            Arc::new(BulbRegistry::load(store.clone(), controller).unwrap()),
            store,
        )
    }

    fn bulb(id: &str, address: &str) -> Bulb {
        BulbBuilder::default()
            .id(id)
            .name(id)
            .address(address)
            .build()
            .unwrap()
    }

    fn get_pilots(fake: &FakeBulb) -> usize {
        fake.received()
            .iter()
            .filter(|request| matches!(request, WizRequest::GetPilot(_)))
            .count()
    }

    #[tokio::test]
    async fn recently_commanded_bulb_is_skipped() {
        let fake = FakeBulb::start("a8bb50000020").await;
        let (registry, _) = registry(fake.port(), vec![bulb("desk", "127.0.0.1")]);
        let energy = JsonEnergyLedger::in_memory();
        let settings = PollingSettings::default();

        let t = Instant::now();
        registry.cooldowns().mark("desk", t);

        let queried = refresh_once(&registry, &energy, &settings, t + Duration::from_secs(1)).await;
        assert_eq!(queried, 0);
        assert_eq!(get_pilots(&fake), 0);

        let queried = refresh_once(&registry, &energy, &settings, t + Duration::from_secs(4)).await;
        assert_eq!(queried, 1);
        assert_eq!(get_pilots(&fake), 1);
    }

    #[tokio::test]
    async fn status_is_reconciled_and_persisted() {
        let fake = FakeBulb::start("a8bb50000021").await;
        fake.set_pilot(SetPilotParams {
            state: Some(true),
            dimming: Some(80),
            scene_id: Some(5),
            ..Default::default()
        });
        let (registry, store) = registry(fake.port(), vec![bulb("desk", "127.0.0.1")]);
        let energy = JsonEnergyLedger::in_memory();

        refresh_once(&registry, &energy, &PollingSettings::default(), Instant::now()).await;

        let cached = registry.bulb("desk").unwrap();
        assert!(cached.is_on);
        assert_eq!(cached.brightness, 80.0);
        assert_eq!(cached.mode, Some(BulbMode::Scene(SceneId::new(5).unwrap())));
        assert_eq!(cached.mac.as_deref(), Some("a8bb50000021"));
        assert_eq!(store.load_bulbs().unwrap(), vec![cached]);
    }

    #[tokio::test]
    async fn unchanged_state_is_not_republished() {
        let fake = FakeBulb::start("a8bb50000022").await;
        let (registry, _) = registry(fake.port(), vec![bulb("desk", "127.0.0.1")]);
        let energy = JsonEnergyLedger::in_memory();
        let settings = PollingSettings::default();

        refresh_once(&registry, &energy, &settings, Instant::now()).await;
        let first = registry.bulbs();
        refresh_once(&registry, &energy, &settings, Instant::now()).await;

        assert!(Arc::ptr_eq(&first, &registry.bulbs()));
    }

    #[tokio::test]
    async fn one_silent_bulb_does_not_affect_others() {
        let good = FakeBulb::start("a8bb50000023").await;
        good.set_pilot(SetPilotParams {
            state: Some(true),
            dimming: Some(30),
            ..Default::default()
        });
        let (registry, _) = registry(
            good.port(),
            vec![bulb("good", "127.0.0.1"), bulb("gone", "127.0.0.2")],
        );
        let energy = JsonEnergyLedger::in_memory();

        refresh_once(&registry, &energy, &PollingSettings::default(), Instant::now()).await;

        let good = registry.bulb("good").unwrap();
        assert!(good.available);
        assert!(good.is_on);
        assert_eq!(good.brightness, 30.0);

        let gone = registry.bulb("gone").unwrap();
        assert!(!gone.available);
        assert!(!gone.is_on);
    }

    #[tokio::test]
    async fn energy_accrues_for_bulbs_that_are_on() {
        let mut on = bulb("on", "127.0.0.1");
        on.is_on = true;
        on.wattage = 10.0;
        on.brightness = 50.0;
        let off = bulb("off", "127.0.0.1");
        let (registry, _) = registry(9, vec![on, off]);
        let energy = JsonEnergyLedger::in_memory();

        let now = Instant::now();
        registry.cooldowns().mark("on", now);
        registry.cooldowns().mark("off", now);

        refresh_once(&registry, &energy, &PollingSettings::default(), now).await;

        // 5 W for 3 s
        let expected = 5.0 * 3.0 / 3600.0;
        assert!((energy.bulb_usage_today("on") - expected).abs() < 1e-9);
        assert_eq!(energy.bulb_usage_today("off"), 0.0);
        assert!((energy.total_usage_today() - expected).abs() < 1e-9);
    }

    #[tokio::test]
    async fn loop_stops_when_cancelled() {
        let (registry, _) = registry(9, vec![]);
        let settings = PollingSettings {
            interval_ms: 10,
            ..Default::default()
        };
        let cancel = CancellationToken::new();

        let handle = start_refresh_loop(
            &settings,
            registry,
            Arc::new(JsonEnergyLedger::in_memory()),
            cancel.clone(),
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn cancel_interrupts_a_cycle_in_progress() {
        let fake = FakeBulb::start("a8bb50000024").await;
        fake.update(|state| state.silent = true);
        let bulbs = (0..4)
            .map(|i| bulb(&format!("silent-{i}"), "127.0.0.1"))
            .collect();
        let (registry, _) = registry_with_timeout(fake.port(), 500, bulbs);
        let settings = PollingSettings {
            interval_ms: 10,
            ..Default::default()
        };
        let cancel = CancellationToken::new();

        let handle = start_refresh_loop(
            &settings,
            registry,
            Arc::new(JsonEnergyLedger::in_memory()),
            cancel.clone(),
        );

        // The first cycle is now waiting on the shared socket.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let cancelled_at = Instant::now();
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(cancelled_at.elapsed() < Duration::from_millis(500));
    }
}
