//! Durable storage for feature and override records.
//!
//! Backends are dumb stores: validation and invariants live in
//! [`FeatureRegistry`](crate::registry::FeatureRegistry) and
//! [`OverrideStore`](crate::overrides::OverrideStore). The one guarantee a
//! backend must provide is the compare-and-set in [`RegistryBackend::put_feature`].

mod memory;
mod redis;

pub use self::memory::MemoryBackend;
pub use self::redis::RedisBackend;

use crate::error::Result;
use crate::feature::{CompanyFeatureOverride, Feature};
use async_trait::async_trait;

#[async_trait]
pub trait RegistryBackend: Send + Sync {
    /// Short backend name for health reporting.
    fn name(&self) -> &'static str;

    async fn get_feature(&self, key: &str) -> Result<Option<Feature>>;

    async fn list_features(&self) -> Result<Vec<Feature>>;

    /// Store `feature` only if the stored version equals `expected_version`.
    /// `None` requires that no record exists yet. Returns `false` when the
    /// precondition does not hold and nothing was written.
    async fn put_feature(&self, feature: &Feature, expected_version: Option<u64>) -> Result<bool>;

    /// Remove a feature and every override that references it.
    async fn delete_feature(&self, key: &str) -> Result<bool>;

    async fn get_overrides(&self, company_id: &str) -> Result<Vec<CompanyFeatureOverride>>;

    async fn put_override(&self, record: &CompanyFeatureOverride) -> Result<()>;

    async fn delete_override(&self, company_id: &str, feature_key: &str) -> Result<bool>;

    /// Remove all overrides of a company. Returns how many were removed.
    async fn delete_company(&self, company_id: &str) -> Result<usize>;

    async fn ping(&self) -> Result<()>;
}
