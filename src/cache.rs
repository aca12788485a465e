//! Read cache in front of the registry backend.
//!
//! Only raw records are cached, never evaluation results. Values are stored
//! as `Arc` snapshots so a reader holds either the old or the new record and
//! never a half-written one.

use crate::feature::{CompanyFeatureOverride, Feature};
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

/// Result of a cache lookup.
#[derive(Debug)]
pub enum CacheLookup<V> {
    Fresh(Arc<V>),
    /// An entry exists but is older than the staleness window.
    Stale,
    Miss,
}

struct CacheEntry<V> {
    value: Arc<V>,
    fetched_at: Instant,
}

struct CacheState<V> {
    entries: HashMap<String, CacheEntry<V>>,
    /// Bumped by every invalidation. Fills that started under an older epoch
    /// are dropped so they cannot reinstate data a write just replaced.
    epoch: u64,
}

pub struct TtlCache<V> {
    state: RwLock<CacheState<V>>,
    ttl: Duration,
}

impl<V> TtlCache<V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            state: RwLock::new(CacheState {
                entries: HashMap::new(),
                epoch: 0,
            }),
            ttl,
        }
    }

    // The map stays consistent even if a holder panicked, so poisoning is ignored.
    fn read(&self) -> RwLockReadGuard<'_, CacheState<V>> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, CacheState<V>> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, key: &str) -> CacheLookup<V> {
        let state = self.read();
        match state.entries.get(key) {
            Some(entry) if entry.fetched_at.elapsed() < self.ttl => {
                CacheLookup::Fresh(Arc::clone(&entry.value))
            }
            Some(_) => CacheLookup::Stale,
            None => CacheLookup::Miss,
        }
    }

    /// Epoch to pass to [`TtlCache::insert_if_current`] when starting a fill.
    pub fn epoch(&self) -> u64 {
        self.read().epoch
    }

    /// Insert `value` unless an invalidation happened since `epoch` was read.
    pub fn insert_if_current(&self, key: &str, value: Arc<V>, epoch: u64) -> bool {
        let mut state = self.write();
        if state.epoch != epoch {
            return false;
        }
        state.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                fetched_at: Instant::now(),
            },
        );
        true
    }

    pub fn invalidate(&self, key: &str) {
        let mut state = self.write();
        state.epoch += 1;
        state.entries.remove(key);
    }

    pub fn invalidate_all(&self) {
        let mut state = self.write();
        state.epoch += 1;
        state.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Override records of one company, keyed by feature key.
pub type CompanyOverrides = HashMap<String, CompanyFeatureOverride>;

/// The two caches the evaluator reads through.
pub struct FeatureCache {
    pub features: TtlCache<Feature>,
    pub overrides: TtlCache<CompanyOverrides>,
}

impl FeatureCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            features: TtlCache::new(ttl),
            overrides: TtlCache::new(ttl),
        }
    }

    pub fn invalidate_feature(&self, key: &str) {
        tracing::debug!(feature = key, "Invalidating cached feature");
        self.features.invalidate(key);
    }

    pub fn invalidate_company(&self, company_id: &str) {
        tracing::debug!(company = company_id, "Invalidating cached overrides");
        self.overrides.invalidate(company_id);
    }

    pub fn invalidate_all(&self) {
        tracing::debug!("Invalidating all cached entries");
        self.features.invalidate_all();
        self.overrides.invalidate_all();
    }
}
