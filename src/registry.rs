use std::{
    collections::HashMap,
    net::Ipv4Addr,
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, Instant},
};

use color_eyre::Result;
use futures::future::join_all;
use tokio::sync::{watch, Mutex as AsyncMutex};
use uuid::Uuid;

use crate::{
    bulb::{Bulb, BulbBuilder, BulbGroup, DiscoveredBulb, DEFAULT_BRIGHTNESS},
    store::BulbStore,
    wiz::{
        controller::{BulbController, CommandError, Intent},
        discovery::Discovery,
        scenes::SceneId,
    },
};

pub type BulbList = Arc<Vec<Bulb>>;
pub type GroupList = Arc<Vec<BulbGroup>>;

/// Members of a group that did not accept a fanned out command.
pub type GroupFailures = Vec<(String, CommandError)>;

/// When each bulb last received an explicit command.
#[derive(Debug, Default)]
pub struct Cooldowns {
    last_command: Mutex<HashMap<String, Instant>>,
}

impl Cooldowns {
    pub fn mark(&self, bulb_id: &str, at: Instant) {
        self.last_command
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(bulb_id.to_string(), at);
    }

    pub fn last_command(&self, bulb_id: &str) -> Option<Instant> {
        self.last_command
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(bulb_id)
            .copied()
    }

    /// True while `now` is less than `window` after the last command.
    pub fn is_cooling(&self, bulb_id: &str, now: Instant, window: Duration) -> bool {
        self.last_command(bulb_id)
            .is_some_and(|at| now.saturating_duration_since(at) < window)
    }

    fn forget(&self, bulb_id: &str) {
        self.last_command
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(bulb_id);
    }
}

/// The adopted bulbs and groups.
///
/// Both collections are published as immutable snapshots. Every change builds
/// a new collection, persists it, and replaces the published one, so readers
/// never see a half applied update. Writers are serialized.
pub struct BulbRegistry {
    store: Arc<dyn BulbStore>,
    controller: BulbController,
    bulbs: watch::Sender<BulbList>,
    groups: watch::Sender<GroupList>,
    writes: AsyncMutex<()>,
    cooldowns: Cooldowns,
}

impl BulbRegistry {
    pub fn load(store: Arc<dyn BulbStore>, controller: BulbController) -> Result<BulbRegistry> {
        let bulbs = store.load_bulbs()?;
        let groups = store.load_groups()?;
        log::info!("Loaded {} bulb(s) and {} group(s)", bulbs.len(), groups.len());

        let (bulbs, _) = watch::channel(Arc::new(bulbs));
        let (groups, _) = watch::channel(Arc::new(groups));

        Ok(BulbRegistry {
            store,
            controller,
            bulbs,
            groups,
            writes: AsyncMutex::new(()),
            cooldowns: Cooldowns::default(),
        })
    }

    pub fn bulbs(&self) -> BulbList {
        self.bulbs.borrow().clone()
    }

    pub fn groups(&self) -> GroupList {
        self.groups.borrow().clone()
    }

    pub fn subscribe_bulbs(&self) -> watch::Receiver<BulbList> {
        self.bulbs.subscribe()
    }

    pub fn subscribe_groups(&self) -> watch::Receiver<GroupList> {
        self.groups.subscribe()
    }

    pub fn bulb(&self, id: &str) -> Option<Bulb> {
        self.bulbs.borrow().iter().find(|bulb| bulb.id == id).cloned()
    }

    pub fn group(&self, id: &str) -> Option<BulbGroup> {
        self.groups.borrow().iter().find(|group| group.id == id).cloned()
    }

    pub fn controller(&self) -> &BulbController {
        &self.controller
    }

    pub fn cooldowns(&self) -> &Cooldowns {
        &self.cooldowns
    }

    /// Applies `f` to a copy of the bulb list and publishes the copy if it
    /// differs from the current snapshot.
    pub async fn write_bulbs<T>(&self, f: impl FnOnce(&mut Vec<Bulb>) -> T) -> T {
        let _guard = self.writes.lock().await;

        let current = self.bulbs();
        let mut next = current.as_ref().clone();
        let out = f(&mut next);

        if next != *current {
            if let Err(e) = self.store.save_bulbs(&next) {
                log::warn!("Failed to save bulbs: {e:?}");
            }
            self.bulbs.send_replace(Arc::new(next));
        }

        out
    }

    async fn write_groups<T>(&self, f: impl FnOnce(&mut Vec<BulbGroup>) -> T) -> T {
        let _guard = self.writes.lock().await;

        let current = self.groups();
        let mut next = current.as_ref().clone();
        let out = f(&mut next);

        if next != *current {
            if let Err(e) = self.store.save_groups(&next) {
                log::warn!("Failed to save groups: {e:?}");
            }
            self.groups.send_replace(Arc::new(next));
        }

        out
    }

    async fn update_bulb(
        &self,
        id: &str,
        f: impl FnOnce(&mut Bulb),
    ) -> Result<Bulb, CommandError> {
        self.write_bulbs(|bulbs| {
            let bulb = bulbs.iter_mut().find(|bulb| bulb.id == id)?;
            f(bulb);
            Some(bulb.clone())
        })
        .await
        .ok_or_else(|| CommandError::UnknownBulb(id.to_string()))
    }

    /// Sends `intent` to one bulb and writes the outcome through to the cache.
    ///
    /// The cache only changes once the bulb has accepted the command. A bulb
    /// that does not answer is marked unavailable, a rejected command leaves
    /// the cache untouched.
    pub async fn apply(&self, id: &str, intent: &Intent) -> Result<Bulb, CommandError> {
        let bulb = self
            .bulb(id)
            .ok_or_else(|| CommandError::UnknownBulb(id.to_string()))?;

        self.cooldowns.mark(id, Instant::now());
        let outcome = self.controller.apply(&bulb, intent).await;
        self.cooldowns.mark(id, Instant::now());

        match outcome {
            Ok(updated) => {
                self.update_bulb(id, |cached| {
                    cached.is_on = updated.is_on;
                    cached.brightness = updated.brightness;
                    cached.mode = updated.mode;
                    cached.available = true;
                })
                .await
            }
            Err(e @ CommandError::NoResponse(_)) => {
                self.update_bulb(id, |cached| cached.available = false).await?;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn add_bulb(&self, name: &str, address: &str) -> Result<Bulb, CommandError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(CommandError::Invalid("bulb name is empty".to_string()));
        }

        let ip: Ipv4Addr = address
            .trim()
            .parse()
            .map_err(|_| CommandError::InvalidAddress(address.to_string()))?;

        let bulb = BulbBuilder::default()
            .id(Uuid::new_v4().to_string())
            .name(name)
            .address(ip.to_string())
            .build()
            .map_err(|e| CommandError::Invalid(e.to_string()))?;

        self.write_bulbs(|bulbs| bulbs.push(bulb.clone())).await;
        log::info!("Added {} at {}", bulb.name, bulb.address);

        Ok(bulb)
    }

    /// Adopts one discovered bulb and drops it from the discovery results.
    /// Returns `None` if a bulb with the same id is already adopted.
    pub async fn adopt(&self, discovered: &DiscoveredBulb, discovery: &Discovery) -> Option<Bulb> {
        let bulb = Bulb::from(discovered);

        let added = self
            .write_bulbs(|bulbs| {
                if bulbs.iter().any(|existing| existing.id == bulb.id) {
                    return false;
                }
                bulbs.push(bulb.clone());
                true
            })
            .await;

        if !added {
            return None;
        }

        log::info!("Adopted {} ({})", bulb.name, bulb.address);
        discovery.remove_found(&discovered.mac);
        Some(bulb)
    }

    /// Adopts everything discovery found, then resets discovery to `Idle`.
    pub async fn adopt_all(&self, discovery: &Discovery) -> Vec<Bulb> {
        let found = discovery.found();

        let adopted = self
            .write_bulbs(|bulbs| {
                let mut adopted = vec![];
                for discovered in found.iter() {
                    let bulb = Bulb::from(discovered);
                    if bulbs.iter().any(|existing| existing.id == bulb.id) {
                        continue;
                    }
                    bulbs.push(bulb.clone());
                    adopted.push(bulb);
                }
                adopted
            })
            .await;

        log::info!("Adopted {} discovered bulb(s)", adopted.len());
        discovery.reset();
        adopted
    }

    pub async fn delete_bulb(&self, id: &str) -> Result<(), CommandError> {
        match self.delete_bulbs(&[id.to_string()]).await {
            0 => Err(CommandError::UnknownBulb(id.to_string())),
            _ => Ok(()),
        }
    }

    /// Deletes every listed bulb and removes it from all groups. Returns how
    /// many bulbs were deleted; unknown ids are skipped.
    pub async fn delete_bulbs(&self, ids: &[String]) -> usize {
        let removed = self
            .write_bulbs(|bulbs| {
                let before = bulbs.len();
                bulbs.retain(|bulb| !ids.contains(&bulb.id));
                before - bulbs.len()
            })
            .await;

        self.write_groups(|groups| {
            for group in groups.iter_mut() {
                group.bulb_ids.retain(|id| !ids.contains(id));
            }
        })
        .await;

        for id in ids {
            self.cooldowns.forget(id);
        }

        removed
    }

    pub async fn rename_bulb(&self, id: &str, name: &str) -> Result<Bulb, CommandError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(CommandError::Invalid("bulb name is empty".to_string()));
        }

        self.update_bulb(id, |bulb| bulb.name = name.to_string()).await
    }

    /// Rated power of the bulb at full brightness, used for energy estimates.
    pub async fn set_wattage(&self, id: &str, watts: f32) -> Result<Bulb, CommandError> {
        if !watts.is_finite() || watts < 0.0 {
            return Err(CommandError::Invalid(format!("wattage {watts}")));
        }

        self.update_bulb(id, |bulb| bulb.wattage = watts).await
    }

    pub async fn create_group(&self, name: &str, bulb_ids: Vec<String>) -> Result<BulbGroup, CommandError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(CommandError::Invalid("group name is empty".to_string()));
        }

        if let Some(unknown) = bulb_ids.iter().find(|id| self.bulb(id).is_none()) {
            return Err(CommandError::UnknownBulb(unknown.clone()));
        }

        let group = BulbGroup {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            bulb_ids,
            is_on: false,
            brightness: DEFAULT_BRIGHTNESS,
        };

        self.write_groups(|groups| groups.push(group.clone())).await;
        log::info!("Created group {} with {} bulb(s)", group.name, group.bulb_ids.len());

        Ok(group)
    }

    pub async fn delete_group(&self, id: &str) -> Result<(), CommandError> {
        let removed = self
            .write_groups(|groups| {
                let before = groups.len();
                groups.retain(|group| group.id != id);
                before != groups.len()
            })
            .await;

        removed
            .then_some(())
            .ok_or_else(|| CommandError::UnknownGroup(id.to_string()))
    }

    async fn update_group(
        &self,
        id: &str,
        f: impl FnOnce(&mut BulbGroup),
    ) -> Result<BulbGroup, CommandError> {
        self.write_groups(|groups| {
            let group = groups.iter_mut().find(|group| group.id == id)?;
            f(group);
            Some(group.clone())
        })
        .await
        .ok_or_else(|| CommandError::UnknownGroup(id.to_string()))
    }

    async fn fan_out(&self, group: &BulbGroup, intent: Intent) -> GroupFailures {
        let results = join_all(group.bulb_ids.iter().map(|id| {
            let intent = &intent;
            async move { (id.clone(), self.apply(id, intent).await) }
        }))
        .await;

        let failures: GroupFailures = results
            .into_iter()
            .filter_map(|(id, result)| result.err().map(|e| (id, e)))
            .collect();

        if !failures.is_empty() {
            log::warn!(
                "{} of {} bulb(s) in {} did not accept {:?}",
                failures.len(),
                group.bulb_ids.len(),
                group.name,
                intent
            );
        }

        failures
    }

    /// Flips the group's power state and drives every member to it.
    pub async fn toggle_group(&self, id: &str) -> Result<GroupFailures, CommandError> {
        let group = self.update_group(id, |group| group.is_on = !group.is_on).await?;
        let intent = if group.is_on {
            Intent::TurnOn
        } else {
            Intent::TurnOff
        };

        Ok(self.fan_out(&group, intent).await)
    }

    pub async fn set_group_brightness(&self, id: &str, brightness: f32) -> Result<GroupFailures, CommandError> {
        let group = self
            .update_group(id, |group| {
                if !brightness.is_nan() {
                    group.brightness = brightness.clamp(0.0, 100.0);
                }
            })
            .await?;

        Ok(self.fan_out(&group, Intent::Brightness(brightness)).await)
    }

    pub async fn set_group_color(
        &self,
        id: &str,
        color: palette::Srgb<u8>,
    ) -> Result<GroupFailures, CommandError> {
        let group = self
            .group(id)
            .ok_or_else(|| CommandError::UnknownGroup(id.to_string()))?;

        Ok(self.fan_out(&group, Intent::Color(color)).await)
    }

    pub async fn set_group_temperature(&self, id: &str, kelvin: u16) -> Result<GroupFailures, CommandError> {
        let group = self
            .group(id)
            .ok_or_else(|| CommandError::UnknownGroup(id.to_string()))?;

        Ok(self.fan_out(&group, Intent::Temperature(kelvin)).await)
    }

    pub async fn set_group_scene(&self, id: &str, scene: &str) -> Result<GroupFailures, CommandError> {
        let group = self
            .group(id)
            .ok_or_else(|| CommandError::UnknownGroup(id.to_string()))?;

        if SceneId::from_name(scene).is_none() {
            return Err(CommandError::UnknownScene(scene.to_string()));
        }

        Ok(self.fan_out(&group, Intent::Scene(scene.to_string())).await)
    }
}
