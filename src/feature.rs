use crate::error::EntitlementError;
use crate::validation::{validate_feature_key, validate_tier_names, RequestValidator};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::{SystemTime, UNIX_EPOCH};
use validator::Validate;

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// A feature flag record as stored in the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Feature {
    pub key: String,
    pub name: String,
    pub description: String,
    pub category: String,
    /// Global kill switch.
    pub is_enabled: bool,
    /// Mandatory features can never be disabled or deleted.
    pub is_mandatory: bool,
    pub subscription_tiers: BTreeSet<String>,
    pub rollout_percentage: u8,
    /// Display priority only.
    pub order: i32,
    /// Incremented on every successful write.
    pub version: u64,
    pub updated_at: u64,
}

impl Feature {
    /// Build a record from an already validated spec.
    pub(crate) fn from_spec(spec: FeatureSpec, version: u64) -> Self {
        Self {
            key: spec.key,
            name: spec.name,
            description: spec.description,
            category: spec.category,
            is_enabled: spec.is_enabled,
            is_mandatory: spec.is_mandatory,
            subscription_tiers: spec.subscription_tiers.into_iter().collect(),
            // Range was checked by `FeatureSpec::validate`.
            rollout_percentage: spec.rollout_percentage.clamp(0, 100) as u8,
            order: spec.order,
            version,
            updated_at: unix_now(),
        }
    }

    pub fn to_spec(&self) -> FeatureSpec {
        FeatureSpec {
            key: self.key.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            category: self.category.clone(),
            is_enabled: self.is_enabled,
            is_mandatory: self.is_mandatory,
            subscription_tiers: self.subscription_tiers.iter().cloned().collect(),
            rollout_percentage: i64::from(self.rollout_percentage),
            order: self.order,
        }
    }

    pub fn allows_tier(&self, tier: &str) -> bool {
        self.subscription_tiers.contains(tier)
    }

    pub fn status(&self) -> FeatureStatus {
        if self.is_mandatory {
            FeatureStatus::Mandatory
        } else if !self.is_enabled {
            FeatureStatus::Disabled
        } else if (1..100).contains(&self.rollout_percentage) {
            FeatureStatus::Partial
        } else {
            FeatureStatus::Enabled
        }
    }
}

fn default_category() -> String {
    "general".to_string()
}

fn default_true() -> bool {
    true
}

fn default_rollout() -> i64 {
    100
}

/// Input for creating or fully replacing a feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct FeatureSpec {
    #[validate(custom(function = "validate_feature_key"))]
    pub key: String,

    #[validate(length(min = 1, max = 120, message = "name must be 1-120 characters"))]
    pub name: String,

    #[serde(default)]
    #[validate(length(max = 1000))]
    pub description: String,

    #[serde(default = "default_category")]
    #[validate(length(min = 1, max = 64, message = "category must be 1-64 characters"))]
    pub category: String,

    #[serde(default = "default_true")]
    pub is_enabled: bool,

    #[serde(default)]
    pub is_mandatory: bool,

    #[validate(
        length(min = 1, message = "subscriptionTiers must not be empty"),
        custom(function = "validate_tier_names")
    )]
    pub subscription_tiers: Vec<String>,

    #[serde(default = "default_rollout")]
    #[validate(range(min = 0, max = 100, message = "rolloutPercentage must be between 0 and 100"))]
    pub rollout_percentage: i64,

    #[serde(default)]
    pub order: i32,
}

impl FeatureSpec {
    /// Field-level validation plus the cross-field rules of a feature record.
    pub fn check(&self) -> Result<(), EntitlementError> {
        self.validate()?;
        if self.is_mandatory && !self.is_enabled {
            return Err(EntitlementError::Validation(format!(
                "Mandatory feature '{}' must be enabled",
                self.key
            )));
        }
        Ok(())
    }
}

/// Partial update; absent fields are left untouched.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeaturePatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub category: Option<String>,
    pub is_enabled: Option<bool>,
    pub is_mandatory: Option<bool>,
    pub subscription_tiers: Option<Vec<String>>,
    pub rollout_percentage: Option<i64>,
    pub order: Option<i32>,
}

impl FeaturePatch {
    pub fn apply(self, spec: &mut FeatureSpec) {
        if let Some(name) = self.name {
            spec.name = name;
        }
        if let Some(description) = self.description {
            spec.description = description;
        }
        if let Some(category) = self.category {
            spec.category = category;
        }
        if let Some(is_enabled) = self.is_enabled {
            spec.is_enabled = is_enabled;
        }
        if let Some(is_mandatory) = self.is_mandatory {
            spec.is_mandatory = is_mandatory;
        }
        if let Some(tiers) = self.subscription_tiers {
            spec.subscription_tiers = tiers;
        }
        if let Some(percentage) = self.rollout_percentage {
            spec.rollout_percentage = percentage;
        }
        if let Some(order) = self.order {
            spec.order = order;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeatureStatus {
    Enabled,
    Disabled,
    Mandatory,
    /// Enabled and rolled out to some, but not all, eligible users.
    Partial,
}

impl FeatureStatus {
    pub fn matches(&self, feature: &Feature) -> bool {
        match self {
            FeatureStatus::Enabled => feature.is_enabled,
            FeatureStatus::Disabled => !feature.is_enabled,
            FeatureStatus::Mandatory => feature.is_mandatory,
            FeatureStatus::Partial => {
                feature.is_enabled
                    && !feature.is_mandatory
                    && (1..100).contains(&feature.rollout_percentage)
            }
        }
    }
}

/// Query filters for listing features.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FeatureFilter {
    pub category: Option<String>,
    pub tier: Option<String>,
    pub status: Option<FeatureStatus>,
}

impl FeatureFilter {
    pub fn matches(&self, feature: &Feature) -> bool {
        self.category
            .as_deref()
            .map_or(true, |category| feature.category == category)
            && self.tier.as_deref().map_or(true, |tier| feature.allows_tier(tier))
            && self.status.map_or(true, |status| status.matches(feature))
    }
}

/// Layer an override was set at. Only company-level overrides exist today;
/// `priority` orders layers once more than one is present.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverrideScope {
    #[default]
    Company,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompanyFeatureOverride {
    pub company_id: String,
    pub feature_key: String,
    pub enabled: bool,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub scope: OverrideScope,
    pub updated_at: u64,
}

impl CompanyFeatureOverride {
    pub fn new(company_id: &str, feature_key: &str, enabled: bool, priority: i32) -> Self {
        Self {
            company_id: company_id.to_string(),
            feature_key: feature_key.to_string(),
            enabled,
            priority,
            scope: OverrideScope::Company,
            updated_at: unix_now(),
        }
    }
}

/// Identity supplied by the session provider. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserContext {
    pub id: String,
    pub subscription_tier: String,
}

impl UserContext {
    pub fn new(id: impl Into<String>, subscription_tier: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            subscription_tier: subscription_tier.into(),
        }
    }

    pub fn validate(&self) -> Result<(), EntitlementError> {
        RequestValidator::validate_user_id(&self.id)?;
        if self.subscription_tier.trim().is_empty() {
            return Err(EntitlementError::InvalidRequest(
                "Subscription tier cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}
