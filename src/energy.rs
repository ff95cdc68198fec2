//! Estimated energy consumption, accumulated per local calendar day.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Mutex,
};

use chrono::{Days, Local, NaiveDate};
use color_eyre::Result;
use eyre::WrapErr;
use serde::{Deserialize, Serialize};

/// Running totals in watt-hours. Recording never fails from the caller's
/// point of view; persistence problems are logged.
pub trait EnergyLedger: Send + Sync {
    fn add_usage(&self, wh: f64);
    fn add_bulb_usage(&self, bulb_id: &str, wh: f64);
    fn total_usage_today(&self) -> f64;
    fn bulb_usage_today(&self, bulb_id: &str) -> f64;

    /// The last `days` days including today, oldest first.
    fn daily_usage(&self, days: u32) -> Vec<DailyUsage>;

    /// Every day on which `bulb_id` used energy, oldest first.
    fn bulb_usage_history(&self, bulb_id: &str) -> Vec<DailyUsage>;
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct DailyUsage {
    pub date: NaiveDate,
    pub wh: f64,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
struct Usage {
    #[serde(default)]
    total: BTreeMap<NaiveDate, f64>,

    #[serde(default)]
    bulbs: BTreeMap<String, BTreeMap<NaiveDate, f64>>,
}

fn today() -> NaiveDate {
    Local::now().date_naive()
}

/// Ledger kept in memory and, unless created with [`JsonEnergyLedger::in_memory`],
/// mirrored to a JSON file after every update.
#[derive(Debug)]
pub struct JsonEnergyLedger {
    path: Option<PathBuf>,
    usage: Mutex<Usage>,
}

impl JsonEnergyLedger {
    pub fn open(path: impl AsRef<Path>) -> Result<JsonEnergyLedger> {
        let path = path.as_ref().to_path_buf();

        let usage = if path.exists() {
            let json = std::fs::read_to_string(&path)
                .wrap_err_with(|| format!("Failed to read {}", path.display()))?;
            let de = &mut serde_json::Deserializer::from_str(&json);
            serde_path_to_error::deserialize(de)
                .wrap_err_with(|| format!("Failed to parse {}", path.display()))?
        } else {
            Usage::default()
        };

        Ok(JsonEnergyLedger {
            path: Some(path),
            usage: Mutex::new(usage),
        })
    }

    pub fn in_memory() -> JsonEnergyLedger {
        JsonEnergyLedger {
            path: None,
            usage: Mutex::new(Usage::default()),
        }
    }

    fn update(&self, f: impl FnOnce(&mut Usage)) {
        let Ok(mut usage) = self.usage.lock() else {
            log::error!("Energy ledger lock poisoned, dropping update");
            return;
        };

        f(&mut usage);

        if let Some(path) = &self.path {
            if let Err(e) = persist(path, &usage) {
                log::warn!("Failed to save energy usage: {e:?}");
            }
        }
    }

    fn read<T>(&self, f: impl FnOnce(&Usage) -> T) -> Option<T> {
        self.usage.lock().ok().map(|usage| f(&usage))
    }

    pub fn add_usage_on(&self, date: NaiveDate, wh: f64) {
        if !wh.is_finite() || wh <= 0.0 {
            return;
        }

        self.update(|usage| *usage.total.entry(date).or_default() += wh);
    }

    pub fn add_bulb_usage_on(&self, date: NaiveDate, bulb_id: &str, wh: f64) {
        if !wh.is_finite() || wh <= 0.0 {
            return;
        }

        self.update(|usage| {
            *usage
                .bulbs
                .entry(bulb_id.to_string())
                .or_default()
                .entry(date)
                .or_default() += wh
        });
    }

    pub fn usage_on(&self, date: NaiveDate) -> f64 {
        self.read(|usage| usage.total.get(&date).copied().unwrap_or_default())
            .unwrap_or_default()
    }

    /// The last `days` days up to and including `until`, oldest first. Days
    /// without usage are reported as zero.
    pub fn daily_usage_until(&self, until: NaiveDate, days: u32) -> Vec<DailyUsage> {
        (0..days)
            .rev()
            .filter_map(|back| until.checked_sub_days(Days::new(back.into())))
            .map(|date| DailyUsage {
                date,
                wh: self.usage_on(date),
            })
            .collect()
    }
}

fn persist(path: &Path, usage: &Usage) -> Result<()> {
    let json = serde_json::to_string(usage)?;
    let tmp = path.with_extension("json.tmp");

    std::fs::write(&tmp, json).wrap_err_with(|| format!("Failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path).wrap_err_with(|| format!("Failed to replace {}", path.display()))?;

    Ok(())
}

impl EnergyLedger for JsonEnergyLedger {
    fn add_usage(&self, wh: f64) {
        self.add_usage_on(today(), wh);
    }

    fn add_bulb_usage(&self, bulb_id: &str, wh: f64) {
        self.add_bulb_usage_on(today(), bulb_id, wh);
    }

    fn total_usage_today(&self) -> f64 {
        self.usage_on(today())
    }

    fn bulb_usage_today(&self, bulb_id: &str) -> f64 {
        let date = today();
        self.read(|usage| {
            usage
                .bulbs
                .get(bulb_id)
                .and_then(|days| days.get(&date).copied())
                .unwrap_or_default()
        })
        .unwrap_or_default()
    }

    fn daily_usage(&self, days: u32) -> Vec<DailyUsage> {
        self.daily_usage_until(today(), days)
    }

    fn bulb_usage_history(&self, bulb_id: &str) -> Vec<DailyUsage> {
        self.read(|usage| {
            usage
                .bulbs
                .get(bulb_id)
                .map(|days| {
                    days.iter()
                        .map(|(date, wh)| DailyUsage { date: *date, wh: *wh })
                        .collect()
                })
                .unwrap_or_default()
        })
        .unwrap_or_default()
    }
}
