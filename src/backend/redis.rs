use super::RegistryBackend;
use crate::error::{EntitlementError, Result};
use crate::feature::{CompanyFeatureOverride, Feature};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, Script};
use std::collections::HashMap;

/// Compare-and-set on the `version` field of the stored JSON record.
/// KEYS: feature record, feature index. ARGV: expected version ('' = absent),
/// record JSON, feature key.
const PUT_FEATURE_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if ARGV[1] == '' then
    if current then return 0 end
else
    if not current then return 0 end
    local stored = cjson.decode(current)
    if tostring(stored['version']) ~= ARGV[1] then return 0 end
end
redis.call('SET', KEYS[1], ARGV[2])
redis.call('SADD', KEYS[2], ARGV[3])
return 1
"#;

/// Redis layout, all under a configurable prefix:
///
/// - `{prefix}:feature:{key}`            JSON feature record
/// - `{prefix}:features`                 set of feature keys
/// - `{prefix}:overrides:{company}`      hash feature key -> JSON override
/// - `{prefix}:override_index:{key}`     set of companies overriding a feature
pub struct RedisBackend {
    connection: MultiplexedConnection,
    prefix: String,
    put_feature_script: Script,
}

impl RedisBackend {
    pub async fn connect(redis_url: &str, prefix: &str) -> Result<Self> {
        let client = Client::open(redis_url).map_err(|e| {
            EntitlementError::RegistryUnavailable(format!("Failed to create Redis client: {}", e))
        })?;
        let connection = client.get_multiplexed_async_connection().await.map_err(|e| {
            EntitlementError::RegistryUnavailable(format!("Failed to connect to Redis: {}", e))
        })?;

        Ok(Self {
            connection,
            prefix: prefix.trim_end_matches(':').to_string(),
            put_feature_script: Script::new(PUT_FEATURE_SCRIPT),
        })
    }

    fn feature_key(&self, key: &str) -> String {
        format!("{}:feature:{}", self.prefix, key)
    }

    fn index_key(&self) -> String {
        format!("{}:features", self.prefix)
    }

    fn overrides_key(&self, company_id: &str) -> String {
        format!("{}:overrides:{}", self.prefix, company_id)
    }

    fn override_index_key(&self, feature_key: &str) -> String {
        format!("{}:override_index:{}", self.prefix, feature_key)
    }
}

#[async_trait]
impl RegistryBackend for RedisBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get_feature(&self, key: &str) -> Result<Option<Feature>> {
        let mut conn = self.connection.clone();
        let raw: Option<String> = conn.get(self.feature_key(key)).await?;
        raw.map(|json| serde_json::from_str(&json).map_err(EntitlementError::from))
            .transpose()
    }

    async fn list_features(&self) -> Result<Vec<Feature>> {
        let mut conn = self.connection.clone();
        let keys: Vec<String> = conn.smembers(self.index_key()).await?;
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let record_keys: Vec<String> = keys.iter().map(|k| self.feature_key(k)).collect();
        let raw: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&record_keys)
            .query_async(&mut conn)
            .await?;

        // Index entries can briefly outlive a deleted record; skip them.
        raw.into_iter()
            .flatten()
            .map(|json| serde_json::from_str(&json).map_err(EntitlementError::from))
            .collect()
    }

    async fn put_feature(&self, feature: &Feature, expected_version: Option<u64>) -> Result<bool> {
        let mut conn = self.connection.clone();
        let json = serde_json::to_string(feature)?;
        let expected = expected_version.map(|v| v.to_string()).unwrap_or_default();

        let applied: i32 = self
            .put_feature_script
            .key(self.feature_key(&feature.key))
            .key(self.index_key())
            .arg(expected)
            .arg(json)
            .arg(&feature.key)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| {
                EntitlementError::RegistryUnavailable(format!("Script execution failed: {}", e))
            })?;
        Ok(applied == 1)
    }

    async fn delete_feature(&self, key: &str) -> Result<bool> {
        let mut conn = self.connection.clone();
        let companies: Vec<String> = conn.smembers(self.override_index_key(key)).await?;

        let mut pipe = redis::pipe();
        pipe.atomic()
            .del(self.feature_key(key))
            .srem(self.index_key(), key)
            .ignore();
        for company in &companies {
            pipe.hdel(self.overrides_key(company), key).ignore();
        }
        pipe.del(self.override_index_key(key)).ignore();

        let (removed,): (i64,) = pipe.query_async(&mut conn).await?;
        Ok(removed > 0)
    }

    async fn get_overrides(&self, company_id: &str) -> Result<Vec<CompanyFeatureOverride>> {
        let mut conn = self.connection.clone();
        let raw: HashMap<String, String> = conn.hgetall(self.overrides_key(company_id)).await?;
        raw.into_values()
            .map(|json| serde_json::from_str(&json).map_err(EntitlementError::from))
            .collect()
    }

    async fn put_override(&self, record: &CompanyFeatureOverride) -> Result<()> {
        let mut conn = self.connection.clone();
        let json = serde_json::to_string(record)?;

        let mut pipe = redis::pipe();
        pipe.atomic()
            .hset(self.overrides_key(&record.company_id), &record.feature_key, json)
            .ignore()
            .sadd(self.override_index_key(&record.feature_key), &record.company_id)
            .ignore();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn delete_override(&self, company_id: &str, feature_key: &str) -> Result<bool> {
        let mut conn = self.connection.clone();

        let mut pipe = redis::pipe();
        pipe.atomic()
            .hdel(self.overrides_key(company_id), feature_key)
            .srem(self.override_index_key(feature_key), company_id)
            .ignore();
        let (removed,): (i64,) = pipe.query_async(&mut conn).await?;
        Ok(removed > 0)
    }

    async fn delete_company(&self, company_id: &str) -> Result<usize> {
        let mut conn = self.connection.clone();
        let features: Vec<String> = conn.hkeys(self.overrides_key(company_id)).await?;
        if features.is_empty() {
            return Ok(0);
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for feature_key in &features {
            pipe.srem(self.override_index_key(feature_key), company_id).ignore();
        }
        pipe.del(self.overrides_key(company_id)).ignore();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(features.len())
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.connection.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| EntitlementError::RegistryUnavailable(format!("Ping failed: {}", e)))?;
        Ok(())
    }
}
