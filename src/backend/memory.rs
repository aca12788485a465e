use super::RegistryBackend;
use crate::error::Result;
use crate::feature::{CompanyFeatureOverride, Feature};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

#[derive(Default)]
struct MemoryState {
    features: HashMap<String, Feature>,
    /// company id -> feature key -> override
    overrides: HashMap<String, BTreeMap<String, CompanyFeatureOverride>>,
}

/// In-process backend used for tests and single-node development.
#[derive(Default)]
pub struct MemoryBackend {
    state: RwLock<MemoryState>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RegistryBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get_feature(&self, key: &str) -> Result<Option<Feature>> {
        let state = self.state.read().await;
        Ok(state.features.get(key).cloned())
    }

    async fn list_features(&self) -> Result<Vec<Feature>> {
        let state = self.state.read().await;
        Ok(state.features.values().cloned().collect())
    }

    async fn put_feature(&self, feature: &Feature, expected_version: Option<u64>) -> Result<bool> {
        let mut state = self.state.write().await;
        let stored_version = state.features.get(&feature.key).map(|f| f.version);
        if stored_version != expected_version {
            return Ok(false);
        }
        state.features.insert(feature.key.clone(), feature.clone());
        Ok(true)
    }

    async fn delete_feature(&self, key: &str) -> Result<bool> {
        let mut state = self.state.write().await;
        let removed = state.features.remove(key).is_some();
        for overrides in state.overrides.values_mut() {
            overrides.remove(key);
        }
        state.overrides.retain(|_, overrides| !overrides.is_empty());
        Ok(removed)
    }

    async fn get_overrides(&self, company_id: &str) -> Result<Vec<CompanyFeatureOverride>> {
        let state = self.state.read().await;
        Ok(state
            .overrides
            .get(company_id)
            .map(|overrides| overrides.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn put_override(&self, record: &CompanyFeatureOverride) -> Result<()> {
        let mut state = self.state.write().await;
        state
            .overrides
            .entry(record.company_id.clone())
            .or_default()
            .insert(record.feature_key.clone(), record.clone());
        Ok(())
    }

    async fn delete_override(&self, company_id: &str, feature_key: &str) -> Result<bool> {
        let mut state = self.state.write().await;
        let Some(overrides) = state.overrides.get_mut(company_id) else {
            return Ok(false);
        };
        let removed = overrides.remove(feature_key).is_some();
        if overrides.is_empty() {
            state.overrides.remove(company_id);
        }
        Ok(removed)
    }

    async fn delete_company(&self, company_id: &str) -> Result<usize> {
        let mut state = self.state.write().await;
        Ok(state
            .overrides
            .remove(company_id)
            .map(|overrides| overrides.len())
            .unwrap_or(0))
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
