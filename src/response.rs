use crate::evaluator::EvaluationResult;
use serde::Serialize;
use std::collections::BTreeMap;

/// `ETag` value for a feature version.
pub fn etag(version: u64) -> String {
    format!("\"{}\"", version)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationResponse {
    pub feature_key: String,
    pub result: EvaluationResult,
    pub active: bool,
}

impl EvaluationResponse {
    pub fn new(feature_key: impl Into<String>, result: EvaluationResult) -> Self {
        Self {
            feature_key: feature_key.into(),
            result,
            active: result.is_active(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct EvaluationOutcome {
    pub result: EvaluationResult,
    pub active: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchEvaluationResponse {
    pub user_id: String,
    pub company_id: String,
    pub results: BTreeMap<String, EvaluationOutcome>,
}

impl BatchEvaluationResponse {
    pub fn new(
        user_id: &str,
        company_id: &str,
        results: BTreeMap<String, EvaluationResult>,
    ) -> Self {
        Self {
            user_id: user_id.to_string(),
            company_id: company_id.to_string(),
            results: results
                .into_iter()
                .map(|(key, result)| {
                    let active = result.is_active();
                    (key, EvaluationOutcome { result, active })
                })
                .collect(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct DeletedResponse {
    pub status: String,
    pub message: String,
    pub key: String,
}

impl DeletedResponse {
    pub fn feature(key: &str) -> Self {
        Self {
            status: "success".to_string(),
            message: "Feature deleted".to_string(),
            key: key.to_string(),
        }
    }

    pub fn company_override(company_id: &str, key: &str) -> Self {
        Self {
            status: "success".to_string(),
            message: format!("Override cleared for company '{}'", company_id),
            key: key.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompanyDeletedResponse {
    pub company_id: String,
    pub removed_overrides: usize,
}
