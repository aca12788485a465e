use crate::error::EntitlementError;
use regex::Regex;
use std::borrow::Cow;
use std::sync::LazyLock;
use validator::ValidationError;

pub const MAX_KEY_LEN: usize = 64;
pub const MAX_COMPANY_ID_LEN: usize = 128;

static FEATURE_KEY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9_]*$").expect("feature key pattern is valid"));

static TIER_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9_-]*$").expect("tier pattern is valid"));

fn invalid(code: &'static str, message: String) -> ValidationError {
    let mut err = ValidationError::new(code);
    err.message = Some(Cow::from(message));
    err
}

/// Feature keys are lowercase identifiers: a letter followed by letters, digits or `_`.
pub fn validate_feature_key(key: &str) -> Result<(), ValidationError> {
    if key.len() > MAX_KEY_LEN {
        return Err(invalid(
            "feature_key",
            format!("feature key must be at most {} characters", MAX_KEY_LEN),
        ));
    }
    if !FEATURE_KEY.is_match(key) {
        return Err(invalid(
            "feature_key",
            format!("'{}' is not a valid feature key (expected lowercase letters, digits and underscores)", key),
        ));
    }
    Ok(())
}

pub fn validate_tier_names(tiers: &[String]) -> Result<(), ValidationError> {
    match tiers.iter().find(|tier| !TIER_NAME.is_match(tier)) {
        Some(tier) => Err(invalid(
            "subscription_tier",
            format!("'{}' is not a valid subscription tier identifier", tier),
        )),
        None => Ok(()),
    }
}

/// Request validation utilities
pub struct RequestValidator;

impl RequestValidator {
    /// Validate a feature key taken from a request path.
    pub fn validate_key(key: &str) -> Result<(), EntitlementError> {
        validate_feature_key(key).map_err(|err| {
            EntitlementError::Validation(
                err.message
                    .map(|m| m.into_owned())
                    .unwrap_or_else(|| "invalid feature key".to_string()),
            )
        })
    }

    pub fn validate_company_id(company_id: &str) -> Result<(), EntitlementError> {
        let company_id = company_id.trim();
        if company_id.is_empty() {
            return Err(EntitlementError::Validation(
                "Company ID cannot be empty".to_string(),
            ));
        }
        if company_id.len() > MAX_COMPANY_ID_LEN {
            return Err(EntitlementError::Validation(format!(
                "Company ID must be at most {} characters",
                MAX_COMPANY_ID_LEN
            )));
        }
        if !company_id
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.')
        {
            return Err(EntitlementError::Validation(
                "Company ID can only contain alphanumeric characters, hyphens, underscores and dots"
                    .to_string(),
            ));
        }
        Ok(())
    }

    /// Validate the identity supplied by the session provider.
    pub fn validate_user_id(user_id: &str) -> Result<(), EntitlementError> {
        if user_id.trim().is_empty() {
            return Err(EntitlementError::InvalidRequest(
                "User ID cannot be empty".to_string(),
            ));
        }
        if !user_id
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '@' || c == '.')
        {
            return Err(EntitlementError::InvalidRequest(
                "User ID contains invalid characters".to_string(),
            ));
        }
        Ok(())
    }

    pub fn validate_percentage(percentage: i64) -> Result<u8, EntitlementError> {
        u8::try_from(percentage)
            .ok()
            .filter(|p| *p <= 100)
            .ok_or_else(|| {
                EntitlementError::Validation(format!(
                    "Rollout percentage must be between 0 and 100, got {}",
                    percentage
                ))
            })
    }
}
