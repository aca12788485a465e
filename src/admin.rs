use crate::cache::FeatureCache;
use crate::error::{EntitlementError, Result};
use crate::feature::{CompanyFeatureOverride, Feature, FeaturePatch, FeatureSpec};
use crate::overrides::{OverrideStore, OverrideUpsert};
use crate::registry::FeatureRegistry;
use std::sync::Arc;
use tracing::{debug, info};

/// Administrative write path.
///
/// Every method performs the registry or override write, then invalidates
/// the affected cache entries, and only then returns. Invalidation also runs
/// when the write fails, since a backend error does not prove nothing was
/// written.
pub struct AdminService {
    registry: Arc<FeatureRegistry>,
    overrides: Arc<OverrideStore>,
    cache: Arc<FeatureCache>,
}

impl AdminService {
    pub fn new(
        registry: Arc<FeatureRegistry>,
        overrides: Arc<OverrideStore>,
        cache: Arc<FeatureCache>,
    ) -> Self {
        Self {
            registry,
            overrides,
            cache,
        }
    }

    pub fn registry(&self) -> &FeatureRegistry {
        &self.registry
    }

    pub fn overrides(&self) -> &OverrideStore {
        &self.overrides
    }

    fn settle<T>(&self, key: &str, result: Result<T>) -> Result<T> {
        self.cache.invalidate_feature(key);
        result
    }

    pub async fn create_feature(&self, spec: FeatureSpec) -> Result<Feature> {
        let key = spec.key.clone();
        let result = self.registry.create(spec).await;
        self.settle(&key, result)
    }

    /// Full replace, creating the feature when it does not exist yet.
    pub async fn put_feature(
        &self,
        key: &str,
        spec: FeatureSpec,
        expected_version: Option<u64>,
    ) -> Result<(Feature, bool)> {
        let result = self.registry.upsert(key, spec, expected_version).await;
        self.settle(key, result)
    }

    pub async fn update_feature(
        &self,
        key: &str,
        patch: FeaturePatch,
        expected_version: Option<u64>,
    ) -> Result<Feature> {
        let result = self.registry.update(key, patch, expected_version).await;
        self.settle(key, result)
    }

    pub async fn set_rollout(
        &self,
        key: &str,
        percentage: i64,
        expected_version: Option<u64>,
    ) -> Result<Feature> {
        let result = self
            .registry
            .set_rollout(key, percentage, expected_version)
            .await;
        self.settle(key, result)
    }

    pub async fn set_enabled(
        &self,
        key: &str,
        enabled: bool,
        expected_version: Option<u64>,
    ) -> Result<Feature> {
        let result = self.registry.set_enabled(key, enabled, expected_version).await;
        self.settle(key, result)
    }

    pub async fn delete_feature(&self, key: &str) -> Result<Feature> {
        let result = self.registry.delete(key).await;
        self.cache.invalidate_feature(key);
        // The backend dropped this feature's overrides across all companies.
        self.cache.overrides.invalidate_all();
        result
    }

    pub async fn set_override(
        &self,
        company_id: &str,
        feature_key: &str,
        enabled: bool,
        priority: i32,
    ) -> Result<CompanyFeatureOverride> {
        let result = self
            .overrides
            .set_override(company_id, feature_key, enabled, priority)
            .await;
        self.cache.invalidate_company(company_id);
        result
    }

    pub async fn clear_override(&self, company_id: &str, feature_key: &str) -> Result<()> {
        let result = self.overrides.clear_override(company_id, feature_key).await;
        self.cache.invalidate_company(company_id);
        result
    }

    pub async fn upsert_company_overrides(
        &self,
        company_id: &str,
        entries: Vec<OverrideUpsert>,
    ) -> Result<Vec<CompanyFeatureOverride>> {
        let result = self.overrides.upsert_many(company_id, entries).await;
        self.cache.invalidate_company(company_id);
        result
    }

    pub async fn delete_company(&self, company_id: &str) -> Result<usize> {
        let result = self.overrides.clear_company(company_id).await;
        self.cache.invalidate_company(company_id);
        result
    }

    /// Create the given features, skipping keys that already exist.
    /// Returns how many were created.
    pub async fn seed(&self, specs: Vec<FeatureSpec>) -> Result<usize> {
        let mut created = 0;
        for spec in specs {
            let key = spec.key.clone();
            match self.create_feature(spec).await {
                Ok(_) => created += 1,
                // Present already, possibly from another seeding instance.
                Err(EntitlementError::AlreadyExists(_)) => {
                    debug!(feature = %key, "Seed feature exists, skipping");
                }
                Err(err) => return Err(err),
            }
        }
        info!(created, "Seeded features");
        Ok(created)
    }
}
