//! Entitlement evaluation.
//!
//! [`evaluate_feature`] is the pure decision over already fetched records.
//! [`Entitlements`] fetches those records through the cache with a bounded
//! wait and turns any fetch failure into [`EvaluationResult::Unavailable`].
//!
//! The fallback policy is fail-closed everywhere: `Unavailable` is never
//! active, whether the registry is down, slow, or the feature is unknown.

use crate::bucketing::bucket;
use crate::cache::{CacheLookup, CompanyOverrides, FeatureCache};
use crate::error::{EntitlementError, Result};
use crate::feature::{Feature, FeatureFilter, FeatureStatus, UserContext};
use crate::registry::FeatureRegistry;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationResult {
    Enabled,
    DisabledGlobally,
    TierNotAllowed,
    RolloutExcluded,
    OverriddenEnabled,
    OverriddenDisabled,
    /// Registry unreachable or feature unknown.
    Unavailable,
}

impl EvaluationResult {
    /// Whether the caller should render the feature rather than its fallback.
    pub fn is_active(&self) -> bool {
        matches!(self, EvaluationResult::Enabled | EvaluationResult::OverriddenEnabled)
    }
}

/// Decide entitlement for `user` given the feature record and the company override.
pub fn evaluate_feature(
    feature: Option<&Feature>,
    override_enabled: Option<bool>,
    user: &UserContext,
) -> EvaluationResult {
    evaluate_with_bucket(feature, override_enabled, user, |feature| {
        bucket(&feature.key, &user.id)
    })
}

/// Same as [`evaluate_feature`] with the bucketing function supplied by the
/// caller. The bucket is only computed when the rollout step is reached.
pub fn evaluate_with_bucket<F>(
    feature: Option<&Feature>,
    override_enabled: Option<bool>,
    user: &UserContext,
    bucket_of: F,
) -> EvaluationResult
where
    F: FnOnce(&Feature) -> u8,
{
    let Some(feature) = feature else {
        return EvaluationResult::Unavailable;
    };

    match override_enabled {
        Some(true) => return EvaluationResult::OverriddenEnabled,
        // A mandatory feature cannot be forced off; such a record is ignored.
        Some(false) if !feature.is_mandatory => return EvaluationResult::OverriddenDisabled,
        _ => {}
    }

    if feature.is_mandatory {
        return EvaluationResult::Enabled;
    }
    if !feature.is_enabled {
        return EvaluationResult::DisabledGlobally;
    }
    if !feature.allows_tier(&user.subscription_tier) {
        return EvaluationResult::TierNotAllowed;
    }
    if feature.rollout_percentage >= 100 {
        return EvaluationResult::Enabled;
    }

    if bucket_of(feature) < feature.rollout_percentage {
        EvaluationResult::Enabled
    } else {
        EvaluationResult::RolloutExcluded
    }
}

/// A feature merged with one company's override, for admin and settings screens.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompanyFeatureView {
    #[serde(flatten)]
    pub feature: Feature,
    #[serde(rename = "override")]
    pub override_enabled: Option<bool>,
    pub status: FeatureStatus,
    /// Global state with the override applied. Ignores tier and rollout,
    /// which depend on the individual user.
    pub effective_enabled: bool,
}

/// Read side of the service: cached fetches plus evaluation.
pub struct Entitlements {
    registry: Arc<FeatureRegistry>,
    cache: Arc<FeatureCache>,
    fetch_timeout: Duration,
}

impl Entitlements {
    pub fn new(
        registry: Arc<FeatureRegistry>,
        cache: Arc<FeatureCache>,
        fetch_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            cache,
            fetch_timeout,
        }
    }

    async fn bounded<T>(&self, fetch: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.fetch_timeout, fetch)
            .await
            .map_err(|_| {
                EntitlementError::RegistryUnavailable(format!(
                    "registry fetch exceeded {}ms",
                    self.fetch_timeout.as_millis()
                ))
            })?
    }

    /// Feature record via the cache. `Ok(None)` when the key does not exist.
    pub async fn feature(&self, key: &str) -> Result<Option<Arc<Feature>>> {
        if let CacheLookup::Fresh(feature) = self.cache.features.get(key) {
            return Ok(Some(feature));
        }

        let epoch = self.cache.features.epoch();
        let fetched = self.bounded(self.registry.find(key)).await?;
        Ok(fetched.map(|feature| {
            let feature = Arc::new(feature);
            self.cache
                .features
                .insert_if_current(key, Arc::clone(&feature), epoch);
            feature
        }))
    }

    /// All overrides of a company via the cache.
    pub async fn company_overrides(&self, company_id: &str) -> Result<Arc<CompanyOverrides>> {
        if let CacheLookup::Fresh(overrides) = self.cache.overrides.get(company_id) {
            return Ok(overrides);
        }

        let epoch = self.cache.overrides.epoch();
        let records = self
            .bounded(self.registry.backend().get_overrides(company_id))
            .await?;
        let overrides: Arc<CompanyOverrides> = Arc::new(
            records
                .into_iter()
                .map(|record| (record.feature_key.clone(), record))
                .collect(),
        );
        self.cache
            .overrides
            .insert_if_current(company_id, Arc::clone(&overrides), epoch);
        Ok(overrides)
    }

    pub async fn evaluate(
        &self,
        feature_key: &str,
        user: &UserContext,
        company_id: &str,
    ) -> EvaluationResult {
        let feature = match self.feature(feature_key).await {
            Ok(Some(feature)) => feature,
            Ok(None) => {
                debug!(feature = feature_key, "Unknown feature evaluated");
                return EvaluationResult::Unavailable;
            }
            Err(err) => {
                warn!(feature = feature_key, error = %err, "Feature fetch failed");
                return EvaluationResult::Unavailable;
            }
        };

        let overrides = match self.company_overrides(company_id).await {
            Ok(overrides) => overrides,
            Err(err) => {
                warn!(company = company_id, error = %err, "Override fetch failed");
                return EvaluationResult::Unavailable;
            }
        };

        let override_enabled = overrides.get(feature_key).map(|record| record.enabled);
        evaluate_feature(Some(&feature), override_enabled, user)
    }

    /// Evaluate several features for one render pass, fetching the company
    /// override set once.
    pub async fn evaluate_many(
        &self,
        feature_keys: &[String],
        user: &UserContext,
        company_id: &str,
    ) -> BTreeMap<String, EvaluationResult> {
        let overrides = match self.company_overrides(company_id).await {
            Ok(overrides) => Some(overrides),
            Err(err) => {
                warn!(company = company_id, error = %err, "Override fetch failed");
                None
            }
        };

        let mut results = BTreeMap::new();
        for key in feature_keys {
            let result = match (&overrides, self.feature(key).await) {
                (Some(overrides), Ok(feature)) => evaluate_feature(
                    feature.as_deref(),
                    overrides.get(key).map(|record| record.enabled),
                    user,
                ),
                (_, Err(err)) => {
                    warn!(feature = %key, error = %err, "Feature fetch failed");
                    EvaluationResult::Unavailable
                }
                (None, Ok(_)) => EvaluationResult::Unavailable,
            };
            results.insert(key.clone(), result);
        }
        results
    }

    /// Every feature merged with the company's overrides.
    pub async fn company_features(&self, company_id: &str) -> Result<Vec<CompanyFeatureView>> {
        let features = self
            .bounded(self.registry.list(&FeatureFilter::default()))
            .await?;
        let overrides = self.company_overrides(company_id).await?;

        Ok(features
            .into_iter()
            .map(|feature| {
                let override_enabled = overrides.get(&feature.key).map(|record| record.enabled);
                let effective_enabled = feature.is_mandatory
                    || override_enabled.unwrap_or(feature.is_enabled);
                CompanyFeatureView {
                    status: feature.status(),
                    feature,
                    override_enabled,
                    effective_enabled,
                }
            })
            .collect())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::backend::{MemoryBackend, RegistryBackend};
    use crate::feature::{CompanyFeatureOverride, FeatureSpec};
    use async_trait::async_trait;

    fn ai_recommendations() -> Feature {
        Feature::from_spec(
            FeatureSpec {
                key: "ai_recommendations".to_string(),
                name: "AI recommendations".to_string(),
                description: String::new(),
                category: "insights".to_string(),
                is_enabled: true,
                is_mandatory: false,
                subscription_tiers: vec!["enterprise".to_string()],
                rollout_percentage: 50,
                order: 0,
            },
            1,
        )
    }

    fn enterprise_user() -> UserContext {
        UserContext::new("u42", "enterprise")
    }

    #[test]
    fn test_end_to_end_example() {
        let feature = ai_recommendations();
        let user = enterprise_user();
        assert_eq!(
            evaluate_with_bucket(Some(&feature), None, &user, |_| 30),
            EvaluationResult::Enabled
        );
        assert_eq!(
            evaluate_with_bucket(Some(&feature), None, &user, |_| 70),
            EvaluationResult::RolloutExcluded
        );
        let pro = UserContext::new("u42", "pro");
        for bucket in [0, 30, 70, 99] {
            assert_eq!(
                evaluate_with_bucket(Some(&feature), None, &pro, |_| bucket),
                EvaluationResult::TierNotAllowed
            );
        }
    }

    #[test]
    fn test_rollout_boundaries() {
        let mut feature = ai_recommendations();
        let user = enterprise_user();

        feature.rollout_percentage = 0;
        for bucket in [0, 1, 50, 99] {
            assert_eq!(
                evaluate_with_bucket(Some(&feature), None, &user, |_| bucket),
                EvaluationResult::RolloutExcluded
            );
        }

        feature.rollout_percentage = 100;
        for bucket in [0, 50, 99] {
            assert_eq!(
                evaluate_with_bucket(Some(&feature), None, &user, |_| bucket),
                EvaluationResult::Enabled
            );
        }
    }

    #[test]
    fn test_full_rollout_skips_bucketing() {
        let mut feature = ai_recommendations();
        feature.rollout_percentage = 100;
        let result = evaluate_with_bucket(Some(&feature), None, &enterprise_user(), |_| {
            panic!("bucket must not be computed at 100%")
        });
        assert_eq!(result, EvaluationResult::Enabled);
    }

    #[test]
    fn test_override_precedence() {
        let mut feature = ai_recommendations();
        feature.rollout_percentage = 100;
        let user = enterprise_user();

        assert_eq!(
            evaluate_feature(Some(&feature), Some(false), &user),
            EvaluationResult::OverriddenDisabled
        );
        assert_eq!(evaluate_feature(Some(&feature), None, &user), EvaluationResult::Enabled);

        // Enabling override bypasses the global switch and tier gating.
        feature.is_enabled = false;
        let free = UserContext::new("u1", "free");
        assert_eq!(
            evaluate_feature(Some(&feature), Some(true), &free),
            EvaluationResult::OverriddenEnabled
        );
    }

    #[test]
    fn test_global_disable() {
        let mut feature = ai_recommendations();
        feature.is_enabled = false;
        assert_eq!(
            evaluate_feature(Some(&feature), None, &enterprise_user()),
            EvaluationResult::DisabledGlobally
        );
    }

    #[test]
    fn test_mandatory_survives_corrupt_record() {
        let mut feature = ai_recommendations();
        feature.is_mandatory = true;
        feature.is_enabled = false;
        feature.rollout_percentage = 0;
        let free = UserContext::new("u1", "free");

        assert_eq!(evaluate_feature(Some(&feature), None, &free), EvaluationResult::Enabled);
        assert_eq!(
            evaluate_feature(Some(&feature), Some(false), &free),
            EvaluationResult::Enabled
        );
    }

    #[test]
    fn test_missing_feature_is_unavailable() {
        let result = evaluate_feature(None, Some(true), &enterprise_user());
        assert_eq!(result, EvaluationResult::Unavailable);
        assert!(!result.is_active());
    }

    #[test]
    fn test_evaluation_is_deterministic() {
        let feature = ai_recommendations();
        for id in 0..200 {
            let user = UserContext::new(format!("user{}", id), "enterprise");
            assert_eq!(
                evaluate_feature(Some(&feature), None, &user),
                evaluate_feature(Some(&feature), None, &user)
            );
        }
    }

    #[test]
    fn test_result_serialization() {
        assert_eq!(
            serde_json::to_string(&EvaluationResult::TierNotAllowed).unwrap(),
            "\"tier_not_allowed\""
        );
        assert!(EvaluationResult::OverriddenEnabled.is_active());
        assert!(!EvaluationResult::OverriddenDisabled.is_active());
    }

    /// Backend that fails or hangs every call.
    /// Backend whose calls fail, or never complete when `hang` is set.
    pub(crate) struct BrokenBackend {
        pub(crate) hang: bool,
    }

    #[async_trait]
    impl RegistryBackend for BrokenBackend {
        fn name(&self) -> &'static str {
            "broken"
        }

        async fn get_feature(&self, _key: &str) -> Result<Option<Feature>> {
            if self.hang {
                std::future::pending::<()>().await;
            }
            Err(EntitlementError::RegistryUnavailable("connection refused".into()))
        }

        async fn list_features(&self) -> Result<Vec<Feature>> {
            Err(EntitlementError::RegistryUnavailable("connection refused".into()))
        }

        async fn put_feature(&self, _feature: &Feature, _expected: Option<u64>) -> Result<bool> {
            Err(EntitlementError::RegistryUnavailable("connection refused".into()))
        }

        async fn delete_feature(&self, _key: &str) -> Result<bool> {
            Err(EntitlementError::RegistryUnavailable("connection refused".into()))
        }

        async fn get_overrides(&self, _company_id: &str) -> Result<Vec<CompanyFeatureOverride>> {
            Ok(Vec::new())
        }

        async fn put_override(&self, _record: &CompanyFeatureOverride) -> Result<()> {
            Err(EntitlementError::RegistryUnavailable("connection refused".into()))
        }

        async fn delete_override(&self, _company_id: &str, _feature_key: &str) -> Result<bool> {
            Err(EntitlementError::RegistryUnavailable("connection refused".into()))
        }

        async fn delete_company(&self, _company_id: &str) -> Result<usize> {
            Err(EntitlementError::RegistryUnavailable("connection refused".into()))
        }

        async fn ping(&self) -> Result<()> {
            if self.hang {
                std::future::pending::<()>().await;
            }
            Err(EntitlementError::RegistryUnavailable("connection refused".into()))
        }
    }

    fn entitlements(backend: Arc<dyn RegistryBackend>) -> (Arc<FeatureRegistry>, Entitlements) {
        let registry = Arc::new(FeatureRegistry::new(backend));
        let cache = Arc::new(FeatureCache::new(Duration::from_secs(60)));
        let entitlements =
            Entitlements::new(Arc::clone(&registry), cache, Duration::from_millis(50));
        (registry, entitlements)
    }

    #[tokio::test]
    async fn test_registry_failure_fails_closed() {
        let (_, entitlements) = entitlements(Arc::new(BrokenBackend { hang: false }));
        let result = entitlements
            .evaluate("ai_recommendations", &enterprise_user(), "acme")
            .await;
        assert_eq!(result, EvaluationResult::Unavailable);
    }

    #[tokio::test]
    async fn test_registry_timeout_fails_closed() {
        let (_, entitlements) = entitlements(Arc::new(BrokenBackend { hang: true }));
        let result = entitlements
            .evaluate("ai_recommendations", &enterprise_user(), "acme")
            .await;
        assert_eq!(result, EvaluationResult::Unavailable);
    }

    #[tokio::test]
    async fn test_reads_are_served_from_cache() {
        let backend = Arc::new(MemoryBackend::new());
        let (registry, entitlements) = entitlements(backend.clone());
        registry
            .create(ai_recommendations().to_spec())
            .await
            .unwrap();

        let first = entitlements.feature("ai_recommendations").await.unwrap().unwrap();
        // Bypass the registry; the cached snapshot is still served.
        backend.delete_feature("ai_recommendations").await.unwrap();
        let second = entitlements.feature("ai_recommendations").await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_evaluate_many() {
        let (registry, entitlements) = entitlements(Arc::new(MemoryBackend::new()));
        let mut spec = ai_recommendations().to_spec();
        spec.rollout_percentage = 100;
        registry.create(spec).await.unwrap();

        let keys = vec!["ai_recommendations".to_string(), "unknown".to_string()];
        let results = entitlements
            .evaluate_many(&keys, &enterprise_user(), "acme")
            .await;
        assert_eq!(results["ai_recommendations"], EvaluationResult::Enabled);
        assert_eq!(results["unknown"], EvaluationResult::Unavailable);
    }
}
