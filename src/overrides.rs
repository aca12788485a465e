use crate::error::{EntitlementError, Result};
use crate::feature::CompanyFeatureOverride;
use crate::registry::FeatureRegistry;
use crate::validation::RequestValidator;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::info;

/// One entry of a bulk override upsert. `enabled: null` clears the override.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverrideUpsert {
    pub feature_key: String,
    pub enabled: Option<bool>,
    #[serde(default)]
    pub priority: i32,
}

/// Per-company overrides. Reads and writes go through the registry backend;
/// feature existence and the mandatory rule are checked against the registry.
pub struct OverrideStore {
    registry: Arc<FeatureRegistry>,
}

impl OverrideStore {
    pub fn new(registry: Arc<FeatureRegistry>) -> Self {
        Self { registry }
    }

    pub async fn set_override(
        &self,
        company_id: &str,
        feature_key: &str,
        enabled: bool,
        priority: i32,
    ) -> Result<CompanyFeatureOverride> {
        RequestValidator::validate_company_id(company_id)?;
        RequestValidator::validate_key(feature_key)?;

        let _guard = self.registry.lock(feature_key).await;
        self.check_allowed(feature_key, enabled).await?;
        self.put_locked(company_id, feature_key, enabled, priority).await
    }

    /// Remove an override. Fails with `NotFound` when there was none.
    pub async fn clear_override(&self, company_id: &str, feature_key: &str) -> Result<()> {
        RequestValidator::validate_company_id(company_id)?;
        let _guard = self.registry.lock(feature_key).await;
        self.delete_locked(company_id, feature_key).await
    }

    /// The feature must exist, and a mandatory one cannot be forced off.
    /// Caller holds the feature's lock.
    async fn check_allowed(&self, feature_key: &str, enabled: bool) -> Result<()> {
        let feature = self.registry.get(feature_key).await?;
        if feature.is_mandatory && !enabled {
            return Err(EntitlementError::MandatoryFeature(feature.key));
        }
        Ok(())
    }

    async fn put_locked(
        &self,
        company_id: &str,
        feature_key: &str,
        enabled: bool,
        priority: i32,
    ) -> Result<CompanyFeatureOverride> {
        let record = CompanyFeatureOverride::new(company_id, feature_key, enabled, priority);
        self.registry.backend().put_override(&record).await?;

        info!(
            company = company_id,
            feature = feature_key,
            enabled,
            "Company override set"
        );
        Ok(record)
    }

    async fn delete_locked(&self, company_id: &str, feature_key: &str) -> Result<()> {
        if !self
            .registry
            .backend()
            .delete_override(company_id, feature_key)
            .await?
        {
            return Err(EntitlementError::NotFound(format!(
                "override of '{}' for company '{}'",
                feature_key, company_id
            )));
        }
        info!(company = company_id, feature = feature_key, "Company override cleared");
        Ok(())
    }

    pub async fn get_override(&self, company_id: &str, feature_key: &str) -> Result<Option<bool>> {
        Ok(self
            .list_overrides(company_id)
            .await?
            .into_iter()
            .find(|record| record.feature_key == feature_key)
            .map(|record| record.enabled))
    }

    pub async fn list_overrides(&self, company_id: &str) -> Result<Vec<CompanyFeatureOverride>> {
        RequestValidator::validate_company_id(company_id)?;
        let mut overrides = self.registry.backend().get_overrides(company_id).await?;
        overrides.sort_by(|a, b| a.feature_key.cmp(&b.feature_key));
        Ok(overrides)
    }

    /// Drop every override of a company, as part of deleting the company.
    pub async fn clear_company(&self, company_id: &str) -> Result<usize> {
        RequestValidator::validate_company_id(company_id)?;
        let removed = self.registry.backend().delete_company(company_id).await?;
        info!(company = company_id, removed, "Company overrides removed");
        Ok(removed)
    }

    /// Apply a batch of overrides. The locks of every feature in the batch
    /// are held, in key order, while all entries are checked and then
    /// written, so no entry is written unless every entry is valid.
    pub async fn upsert_many(
        &self,
        company_id: &str,
        entries: Vec<OverrideUpsert>,
    ) -> Result<Vec<CompanyFeatureOverride>> {
        RequestValidator::validate_company_id(company_id)?;
        for entry in &entries {
            RequestValidator::validate_key(&entry.feature_key)?;
        }

        let keys: BTreeSet<&str> = entries.iter().map(|e| e.feature_key.as_str()).collect();
        let mut guards = Vec::with_capacity(keys.len());
        for key in keys {
            guards.push(self.registry.lock(key).await);
        }

        for entry in &entries {
            self.check_allowed(&entry.feature_key, entry.enabled.unwrap_or(true))
                .await?;
        }

        for entry in &entries {
            match entry.enabled {
                Some(enabled) => {
                    self.put_locked(company_id, &entry.feature_key, enabled, entry.priority)
                        .await?;
                }
                None => match self.delete_locked(company_id, &entry.feature_key).await {
                    Ok(()) | Err(EntitlementError::NotFound(_)) => {}
                    Err(err) => return Err(err),
                },
            }
        }
        drop(guards);

        self.list_overrides(company_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::registry::tests::{mandatory_spec, spec};

    async fn store() -> OverrideStore {
        let registry = Arc::new(FeatureRegistry::new(Arc::new(MemoryBackend::new())));
        registry.create(spec("reports")).await.unwrap();
        registry.create(spec("exports")).await.unwrap();
        registry.create(mandatory_spec("core_inventory")).await.unwrap();
        OverrideStore::new(registry)
    }

    #[tokio::test]
    async fn test_set_get_clear() {
        let store = store().await;
        assert_eq!(store.get_override("acme", "reports").await.unwrap(), None);

        store.set_override("acme", "reports", false, 0).await.unwrap();
        assert_eq!(store.get_override("acme", "reports").await.unwrap(), Some(false));
        // Overrides are company scoped.
        assert_eq!(store.get_override("globex", "reports").await.unwrap(), None);

        store.clear_override("acme", "reports").await.unwrap();
        assert_eq!(store.get_override("acme", "reports").await.unwrap(), None);
        assert!(matches!(
            store.clear_override("acme", "reports").await,
            Err(EntitlementError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_mandatory_cannot_be_forced_off() {
        let store = store().await;
        assert!(matches!(
            store.set_override("acme", "core_inventory", false, 0).await,
            Err(EntitlementError::MandatoryFeature(_))
        ));
        assert!(store.set_override("acme", "core_inventory", true, 0).await.is_ok());
    }

    #[tokio::test]
    async fn test_override_requires_existing_feature() {
        let store = store().await;
        assert!(matches!(
            store.set_override("acme", "missing", true, 0).await,
            Err(EntitlementError::NotFound(_))
        ));
        assert!(matches!(
            store.set_override("", "reports", true, 0).await,
            Err(EntitlementError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_upsert_many_validates_before_writing() {
        let store = store().await;
        let entries = vec![
            OverrideUpsert {
                feature_key: "reports".to_string(),
                enabled: Some(true),
                priority: 0,
            },
            OverrideUpsert {
                feature_key: "core_inventory".to_string(),
                enabled: Some(false),
                priority: 0,
            },
        ];
        assert!(matches!(
            store.upsert_many("acme", entries).await,
            Err(EntitlementError::MandatoryFeature(_))
        ));
        assert!(store.list_overrides("acme").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upsert_many_rechecks_under_locks() {
        let store = Arc::new(store().await);

        // Hold one feature of the batch so the batch stalls mid-way.
        let held = store.registry.lock("reports").await;
        let batch = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                let entries = vec![
                    OverrideUpsert {
                        feature_key: "exports".to_string(),
                        enabled: Some(true),
                        priority: 0,
                    },
                    OverrideUpsert {
                        feature_key: "reports".to_string(),
                        enabled: Some(false),
                        priority: 0,
                    },
                ];
                store.upsert_many("acme", entries).await
            })
        };
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        // Another process promotes the feature while the batch waits.
        let mut promoted = store.registry.get("reports").await.unwrap();
        promoted.is_mandatory = true;
        promoted.version += 1;
        assert!(store
            .registry
            .backend()
            .put_feature(&promoted, Some(1))
            .await
            .unwrap());
        drop(held);

        assert!(matches!(
            batch.await.unwrap(),
            Err(EntitlementError::MandatoryFeature(_))
        ));
        assert!(store.list_overrides("acme").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upsert_many_sets_and_clears() {
        let store = store().await;
        store.set_override("acme", "exports", true, 0).await.unwrap();

        let entries = vec![
            OverrideUpsert {
                feature_key: "reports".to_string(),
                enabled: Some(false),
                priority: 5,
            },
            OverrideUpsert {
                feature_key: "exports".to_string(),
                enabled: None,
                priority: 0,
            },
        ];
        let overrides = store.upsert_many("acme", entries).await.unwrap();
        assert_eq!(overrides.len(), 1);
        assert_eq!(overrides[0].feature_key, "reports");
        assert!(!overrides[0].enabled);
        assert_eq!(overrides[0].priority, 5);
    }

    #[tokio::test]
    async fn test_clear_company() {
        let store = store().await;
        store.set_override("acme", "reports", true, 0).await.unwrap();
        store.set_override("acme", "exports", false, 0).await.unwrap();
        assert_eq!(store.clear_company("acme").await.unwrap(), 2);
        assert!(store.list_overrides("acme").await.unwrap().is_empty());
    }
}
