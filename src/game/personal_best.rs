use std::collections::HashMap;

use log::warn;

use super::puzzle::Variant;
use crate::store::DeviceStore;

pub fn store_key(variant: Variant) -> String {
    format!("simulator_best_ms_{}", variant.as_str())
}

/// Best completion time per variant, in milliseconds.
///
/// Absent and non-finite bests are treated alike: the next completion is
/// always a new best. Recorded values only ever go down.
#[derive(Debug, Clone, Default)]
pub struct PersonalBests {
    best_ms: HashMap<Variant, f64>,
}

impl PersonalBests {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, variant: Variant) -> Option<f64> {
        self.best_ms.get(&variant).copied().filter(|ms| ms.is_finite())
    }

    /// Seeds the cache for one variant from the remote value and the local
    /// cached value. A finite remote value wins; otherwise the local one is used.
    pub fn prime(&mut self, variant: Variant, remote_ms: Option<f64>, local_ms: Option<f64>) {
        let chosen = remote_ms
            .filter(|ms| ms.is_finite())
            .or_else(|| local_ms.filter(|ms| ms.is_finite()));
        match chosen {
            Some(ms) => {
                self.best_ms.insert(variant, ms);
            }
            None => {
                self.best_ms.remove(&variant);
            }
        }
    }

    /// Returns true when `completion_ms` is a new best and stores it.
    pub fn record(&mut self, variant: Variant, completion_ms: u64) -> bool {
        let candidate = completion_ms as f64;
        let is_new_best = match self.get(variant) {
            Some(current) => candidate < current,
            None => true,
        };
        if is_new_best {
            self.best_ms.insert(variant, candidate);
        }
        is_new_best
    }
}

pub async fn load_local(store: &DeviceStore, variant: Variant) -> Option<f64> {
    match store.get(&store_key(variant)).await {
        Ok(value) => value.and_then(|raw| raw.parse::<f64>().ok()),
        Err(err) => {
            warn!("Failed to read cached personal best for {variant}: {err:#}");
            None
        }
    }
}

pub async fn save_local(store: &DeviceStore, variant: Variant, best_ms: u64) {
    if let Err(err) = store.set(&store_key(variant), &best_ms.to_string()).await {
        warn!("Failed to cache personal best for {variant}: {err:#}");
    }
}
