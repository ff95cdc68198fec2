use std::sync::Arc;

use color_eyre::Result;
use tokio_util::sync::CancellationToken;

use wiz_control::{
    bulb::{Bulb, BulbMode},
    energy::{EnergyLedger, JsonEnergyLedger},
    protocols::udp::SocketManager,
    registry::BulbRegistry,
    settings::{read_settings, Settings},
    store::JsonFileStore,
    wiz::{
        ble::BleScanner,
        controller::BulbController,
        discovery::{Discovery, DiscoveryState},
        polling::start_refresh_loop,
    },
};

#[cfg(feature = "ble")]
async fn mk_ble_scanner() -> Option<Arc<dyn BleScanner>> {
    match wiz_control::wiz::ble::btle::BtleScanner::new().await {
        Ok(scanner) => Some(Arc::new(scanner)),
        Err(e) => {
            log::warn!("BLE scanning unavailable: {:?}", e);
            None
        }
    }
}

#[cfg(not(feature = "ble"))]
async fn mk_ble_scanner() -> Option<Arc<dyn BleScanner>> {
    log::warn!("BLE scanning is enabled but this build does not include the \"ble\" feature");
    None
}

fn summary(bulb: &Bulb) -> String {
    if !bulb.available {
        return format!("{} ({}): unavailable", bulb.name, bulb.address);
    }

    if !bulb.is_on {
        return format!("{} ({}): off", bulb.name, bulb.address);
    }

    let mode = match bulb.mode {
        Some(BulbMode::Color(color)) => format!("rgb({}, {}, {})", color.red, color.green, color.blue),
        Some(BulbMode::Temperature(kelvin)) => format!("{kelvin}K"),
        Some(BulbMode::Scene(scene)) => scene.to_string(),
        None => "unknown mode".to_string(),
    };

    format!("{} ({}): on, {:.0}%, {}", bulb.name, bulb.address, bulb.brightness, mode)
}

async fn discover_on_startup(settings: &Settings, registry: &BulbRegistry, discovery: &Discovery) {
    let state = discovery.run(&registry.bulbs()).await;

    match state {
        DiscoveryState::Success if settings.discovery.auto_adopt => {
            registry.adopt_all(discovery).await;
        }
        DiscoveryState::Success => {
            for bulb in discovery.found().iter() {
                log::info!("Found new bulb {} at {} ({})", bulb.name, bulb.address, bulb.mac);
            }
        }
        DiscoveryState::NoDevicesFound => log::info!("No new bulbs found"),
        DiscoveryState::Error(message) => log::warn!("Discovery failed: {message}"),
        DiscoveryState::Idle | DiscoveryState::Scanning => {}
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    pretty_env_logger::init();

    let settings = read_settings()?;

    let store = Arc::new(JsonFileStore::new(&settings.storage.devices_path));
    let energy: Arc<dyn EnergyLedger> = Arc::new(JsonEnergyLedger::open(&settings.storage.energy_path)?);
    let socket = Arc::new(SocketManager::new());
    let controller = BulbController::new(socket, &settings.network);
    let registry = Arc::new(BulbRegistry::load(store, controller)?);

    let ble = if settings.ble.enabled {
        mk_ble_scanner().await
    } else {
        None
    };
    let discovery = Discovery::new(&settings, ble);

    if settings.discovery.on_startup {
        discover_on_startup(&settings, &registry, &discovery).await;
    }

    let cancel = CancellationToken::new();
    let refresh_loop = start_refresh_loop(&settings.polling, registry.clone(), energy.clone(), cancel.clone());

    let observer = {
        let mut bulbs = registry.subscribe_bulbs();
        let cancel = cancel.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = bulbs.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }

                let snapshot = bulbs.borrow_and_update().clone();
                for bulb in snapshot.iter() {
                    log::debug!("{}", summary(bulb));
                }
            }
        })
    };

    tokio::signal::ctrl_c().await?;
    log::info!("Shutting down");

    cancel.cancel();
    refresh_loop.await?;
    observer.await?;

    for bulb in registry.bulbs().iter() {
        log::info!("{}: {:.2} Wh today", bulb.name, energy.bulb_usage_today(&bulb.id));
    }
    for day in energy.daily_usage(7) {
        log::info!("{}: {:.2} Wh", day.date, day.wh);
    }

    Ok(())
}
