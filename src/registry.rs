use crate::backend::RegistryBackend;
use crate::error::{EntitlementError, Result};
use crate::feature::{Feature, FeatureFilter, FeaturePatch, FeatureSpec};
use crate::validation::RequestValidator;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::info;

/// Per-key async locks serializing registry writes within this process.
/// An entry lives only while a guard holds it or a task waits on it.
#[derive(Default)]
struct KeyLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl KeyLocks {
    fn map(&self) -> MutexGuard<'_, HashMap<String, Arc<AsyncMutex<()>>>> {
        self.locks.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn acquire(&self, key: &str) -> KeyGuard<'_> {
        let lock = Arc::clone(self.map().entry(key.to_string()).or_default());
        KeyGuard {
            locks: self,
            key: key.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.map().len()
    }
}

/// Write lock on one feature key, released on drop.
pub(crate) struct KeyGuard<'a> {
    locks: &'a KeyLocks,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        // Waiters clone the Arc under the map lock, so a count of one here
        // means nobody else holds or awaits this key.
        let mut locks = self.locks.map();
        self.guard.take();
        if locks
            .get(&self.key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.key);
        }
    }
}

/// Validated access to feature records.
pub struct FeatureRegistry {
    backend: Arc<dyn RegistryBackend>,
    locks: KeyLocks,
    /// Known subscription tiers. Empty disables the check.
    tier_catalogue: BTreeSet<String>,
}

impl FeatureRegistry {
    pub fn new(backend: Arc<dyn RegistryBackend>) -> Self {
        Self {
            backend,
            locks: KeyLocks::default(),
            tier_catalogue: BTreeSet::new(),
        }
    }

    pub fn with_tier_catalogue<I, S>(mut self, tiers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tier_catalogue = tiers.into_iter().map(Into::into).collect();
        self
    }

    pub fn backend(&self) -> &Arc<dyn RegistryBackend> {
        &self.backend
    }

    /// Hold the write lock for `key`. Override writes take it too so they
    /// cannot interleave with a mandatory-flag change on the same feature.
    pub(crate) async fn lock(&self, key: &str) -> KeyGuard<'_> {
        self.locks.acquire(key).await
    }

    pub async fn find(&self, key: &str) -> Result<Option<Feature>> {
        self.backend.get_feature(key).await
    }

    pub async fn get(&self, key: &str) -> Result<Feature> {
        self.find(key)
            .await?
            .ok_or_else(|| EntitlementError::NotFound(format!("feature '{}'", key)))
    }

    pub async fn list(&self, filter: &FeatureFilter) -> Result<Vec<Feature>> {
        let mut features: Vec<Feature> = self
            .backend
            .list_features()
            .await?
            .into_iter()
            .filter(|feature| filter.matches(feature))
            .collect();
        features.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.key.cmp(&b.key)));
        Ok(features)
    }

    pub async fn create(&self, spec: FeatureSpec) -> Result<Feature> {
        let _guard = self.lock(&spec.key).await;
        self.create_locked(spec).await
    }

    /// Full replace of an existing feature.
    pub async fn replace(
        &self,
        key: &str,
        spec: FeatureSpec,
        expected_version: Option<u64>,
    ) -> Result<Feature> {
        Self::check_path_key(key, &spec)?;
        let _guard = self.lock(key).await;
        let current = self.get(key).await?;
        self.write_locked(current, spec, expected_version).await
    }

    /// Replace when the feature exists, create otherwise. Returns whether it was created.
    pub async fn upsert(
        &self,
        key: &str,
        spec: FeatureSpec,
        expected_version: Option<u64>,
    ) -> Result<(Feature, bool)> {
        Self::check_path_key(key, &spec)?;
        let _guard = self.lock(key).await;
        match self.find(key).await? {
            Some(current) => Ok((self.write_locked(current, spec, expected_version).await?, false)),
            None if expected_version.is_some() => Err(EntitlementError::NotFound(format!(
                "feature '{}'",
                key
            ))),
            None => Ok((self.create_locked(spec).await?, true)),
        }
    }

    pub async fn update(
        &self,
        key: &str,
        patch: FeaturePatch,
        expected_version: Option<u64>,
    ) -> Result<Feature> {
        let _guard = self.lock(key).await;
        let current = self.get(key).await?;
        let mut spec = current.to_spec();
        patch.apply(&mut spec);
        self.write_locked(current, spec, expected_version).await
    }

    pub async fn set_rollout(
        &self,
        key: &str,
        percentage: i64,
        expected_version: Option<u64>,
    ) -> Result<Feature> {
        let percentage = RequestValidator::validate_percentage(percentage)?;
        let _guard = self.lock(key).await;
        let current = self.get(key).await?;
        let previous = current.rollout_percentage;
        let mut spec = current.to_spec();
        spec.rollout_percentage = i64::from(percentage);
        let feature = self.write_locked(current, spec, expected_version).await?;

        if percentage == 100 && previous < 100 {
            info!(feature = key, "Feature fully released");
        }
        Ok(feature)
    }

    pub async fn set_enabled(
        &self,
        key: &str,
        enabled: bool,
        expected_version: Option<u64>,
    ) -> Result<Feature> {
        let _guard = self.lock(key).await;
        let current = self.get(key).await?;
        let mut spec = current.to_spec();
        spec.is_enabled = enabled;
        self.write_locked(current, spec, expected_version).await
    }

    pub async fn delete(&self, key: &str) -> Result<Feature> {
        let _guard = self.lock(key).await;
        let current = self.get(key).await?;
        if current.is_mandatory {
            return Err(EntitlementError::MandatoryFeature(key.to_string()));
        }
        if !self.backend.delete_feature(key).await? {
            return Err(EntitlementError::NotFound(format!("feature '{}'", key)));
        }
        info!(feature = key, "Feature deleted");
        Ok(current)
    }

    fn check_path_key(key: &str, spec: &FeatureSpec) -> Result<()> {
        if spec.key != key {
            return Err(EntitlementError::InvalidRequest(format!(
                "Body key '{}' does not match path key '{}'",
                spec.key, key
            )));
        }
        Ok(())
    }

    fn check_tiers(&self, spec: &FeatureSpec) -> Result<()> {
        if self.tier_catalogue.is_empty() {
            return Ok(());
        }
        match spec
            .subscription_tiers
            .iter()
            .find(|tier| !self.tier_catalogue.contains(*tier))
        {
            Some(tier) => Err(EntitlementError::Validation(format!(
                "Unknown subscription tier '{}'",
                tier
            ))),
            None => Ok(()),
        }
    }

    async fn create_locked(&self, spec: FeatureSpec) -> Result<Feature> {
        spec.check()?;
        self.check_tiers(&spec)?;

        let feature = Feature::from_spec(spec, 1);
        if !self.backend.put_feature(&feature, None).await? {
            return Err(EntitlementError::AlreadyExists(feature.key));
        }

        info!(
            feature = %feature.key,
            rollout = feature.rollout_percentage,
            mandatory = feature.is_mandatory,
            "Feature created"
        );
        Ok(feature)
    }

    /// Validate `spec` as the next state of `current` and store it.
    async fn write_locked(
        &self,
        current: Feature,
        spec: FeatureSpec,
        expected_version: Option<u64>,
    ) -> Result<Feature> {
        if let Some(expected) = expected_version {
            if expected != current.version {
                return Err(EntitlementError::Conflict {
                    key: current.key,
                    expected,
                    actual: current.version,
                });
            }
        }

        if current.is_mandatory && (!spec.is_mandatory || !spec.is_enabled) {
            return Err(EntitlementError::MandatoryFeature(current.key));
        }
        spec.check()?;
        self.check_tiers(&spec)?;

        let feature = Feature::from_spec(spec, current.version + 1);
        if !self.backend.put_feature(&feature, Some(current.version)).await? {
            // Another process wrote between our read and the compare-and-set.
            let actual = self
                .find(&current.key)
                .await?
                .map(|f| f.version)
                .unwrap_or(0);
            return Err(EntitlementError::Conflict {
                key: current.key,
                expected: current.version,
                actual,
            });
        }

        info!(
            feature = %feature.key,
            version = feature.version,
            enabled = feature.is_enabled,
            rollout = feature.rollout_percentage,
            "Feature updated"
        );
        Ok(feature)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::feature::FeatureStatus;

    pub(crate) fn spec(key: &str) -> FeatureSpec {
        FeatureSpec {
            key: key.to_string(),
            name: key.replace('_', " "),
            description: String::new(),
            category: "general".to_string(),
            is_enabled: true,
            is_mandatory: false,
            subscription_tiers: vec!["pro".to_string(), "enterprise".to_string()],
            rollout_percentage: 100,
            order: 0,
        }
    }

    pub(crate) fn mandatory_spec(key: &str) -> FeatureSpec {
        FeatureSpec {
            is_mandatory: true,
            ..spec(key)
        }
    }

    fn registry() -> FeatureRegistry {
        FeatureRegistry::new(Arc::new(MemoryBackend::new()))
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let registry = registry();
        let created = registry.create(spec("inventory_forecast")).await.unwrap();
        assert_eq!(created.version, 1);
        assert_eq!(registry.get("inventory_forecast").await.unwrap(), created);
    }

    #[tokio::test]
    async fn test_create_rejects_duplicate_key() {
        let registry = registry();
        registry.create(spec("reports")).await.unwrap();
        let err = registry.create(spec("reports")).await.unwrap_err();
        assert!(matches!(err, EntitlementError::AlreadyExists(key) if key == "reports"));
    }

    #[tokio::test]
    async fn test_create_validation() {
        let registry = registry();
        let mut bad = spec("reports");
        bad.subscription_tiers.clear();
        assert!(matches!(
            registry.create(bad).await,
            Err(EntitlementError::Validation(_))
        ));

        let mut bad = spec("reports");
        bad.rollout_percentage = 120;
        assert!(matches!(
            registry.create(bad).await,
            Err(EntitlementError::Validation(_))
        ));

        assert!(matches!(
            registry.create(spec("Bad-Key")).await,
            Err(EntitlementError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_tier_catalogue() {
        let registry = registry().with_tier_catalogue(["free", "pro"]);
        assert!(matches!(
            registry.create(spec("reports")).await,
            Err(EntitlementError::Validation(msg)) if msg.contains("enterprise")
        ));
    }

    #[tokio::test]
    async fn test_mandatory_cannot_be_deleted_or_disabled() {
        let registry = registry();
        registry.create(mandatory_spec("mandatory_feature")).await.unwrap();

        assert!(matches!(
            registry.delete("mandatory_feature").await,
            Err(EntitlementError::MandatoryFeature(_))
        ));
        assert!(matches!(
            registry.set_enabled("mandatory_feature", false, None).await,
            Err(EntitlementError::MandatoryFeature(_))
        ));
        let demote = FeaturePatch {
            is_mandatory: Some(false),
            ..Default::default()
        };
        assert!(matches!(
            registry.update("mandatory_feature", demote, None).await,
            Err(EntitlementError::MandatoryFeature(_))
        ));
        assert!(registry.get("mandatory_feature").await.unwrap().is_enabled);
    }

    #[tokio::test]
    async fn test_set_rollout_bounds() {
        let registry = registry();
        registry.create(spec("reports")).await.unwrap();

        assert!(matches!(
            registry.set_rollout("reports", 101, None).await,
            Err(EntitlementError::Validation(_))
        ));
        let feature = registry.set_rollout("reports", 0, None).await.unwrap();
        assert_eq!(feature.rollout_percentage, 0);
        assert_eq!(feature.version, 2);
        // Zero rollout keeps the feature around.
        assert!(registry.find("reports").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_version_conflict() {
        let registry = registry();
        registry.create(spec("reports")).await.unwrap();
        registry.set_rollout("reports", 50, Some(1)).await.unwrap();

        let err = registry.set_enabled("reports", false, Some(1)).await.unwrap_err();
        assert!(matches!(
            err,
            EntitlementError::Conflict { expected: 1, actual: 2, .. }
        ));
        assert!(registry.get("reports").await.unwrap().is_enabled);
    }

    #[tokio::test]
    async fn test_upsert_creates_then_replaces() {
        let registry = registry();
        let (feature, created) = registry.upsert("reports", spec("reports"), None).await.unwrap();
        assert!(created);
        assert_eq!(feature.version, 1);

        let mut next = spec("reports");
        next.category = "analytics".to_string();
        let (feature, created) = registry.upsert("reports", next, Some(1)).await.unwrap();
        assert!(!created);
        assert_eq!(feature.category, "analytics");
        assert_eq!(feature.version, 2);

        assert!(matches!(
            registry.upsert("other", spec("reports"), None).await,
            Err(EntitlementError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_operations_on_missing_feature() {
        let registry = registry();
        assert!(matches!(registry.get("nope").await, Err(EntitlementError::NotFound(_))));
        assert!(matches!(
            registry.set_rollout("nope", 10, None).await,
            Err(EntitlementError::NotFound(_))
        ));
        assert!(matches!(registry.delete("nope").await, Err(EntitlementError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_list_filters_and_order() {
        let registry = registry();
        let mut a = spec("a_feature");
        a.order = 2;
        a.category = "analytics".to_string();
        let mut b = spec("b_feature");
        b.order = 1;
        b.rollout_percentage = 25;
        let mut c = spec("c_feature");
        c.order = 1;
        c.subscription_tiers = vec!["free".to_string()];
        for s in [a, b, c] {
            registry.create(s).await.unwrap();
        }

        let all = registry.list(&FeatureFilter::default()).await.unwrap();
        let keys: Vec<_> = all.iter().map(|f| f.key.as_str()).collect();
        assert_eq!(keys, ["b_feature", "c_feature", "a_feature"]);

        let analytics = registry
            .list(&FeatureFilter {
                category: Some("analytics".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(analytics.len(), 1);

        let partial = registry
            .list(&FeatureFilter {
                status: Some(FeatureStatus::Partial),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(partial[0].key, "b_feature");

        let free = registry
            .list(&FeatureFilter {
                tier: Some("free".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(free.len(), 1);
        assert_eq!(free[0].key, "c_feature");
    }

    #[tokio::test]
    async fn test_concurrent_rollout_writes_are_serialized() {
        let registry = Arc::new(registry());
        registry.create(spec("reports")).await.unwrap();

        let handles: Vec<_> = (0..20)
            .map(|i| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move { registry.set_rollout("reports", i, None).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(registry.get("reports").await.unwrap().version, 21);
        assert_eq!(registry.locks.len(), 0);
    }

    #[tokio::test]
    async fn test_writes_to_missing_keys_leave_no_locks() {
        let registry = registry();
        for i in 0..1000 {
            let key = format!("missing_{}", i);
            assert!(matches!(
                registry.set_rollout(&key, 10, None).await,
                Err(EntitlementError::NotFound(_))
            ));
        }
        assert!(registry.delete("missing_feature").await.is_err());
        assert_eq!(registry.locks.len(), 0);

        let guard = registry.lock("reports").await;
        assert_eq!(registry.locks.len(), 1);
        drop(guard);
        assert_eq!(registry.locks.len(), 0);
    }
}
