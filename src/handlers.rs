use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use std::sync::Arc;

use crate::admin::AdminService;
use crate::error::EntitlementError;
use crate::evaluator::Entitlements;
use crate::extract::{ExpectedVersion, Session};
use crate::feature::{Feature, FeatureFilter, FeaturePatch, FeatureSpec};
use crate::health::HealthChecker;
use crate::overrides::OverrideUpsert;
use crate::response::{
    etag, BatchEvaluationResponse, CompanyDeletedResponse, DeletedResponse, EvaluationResponse,
};
use crate::validation::RequestValidator;

/// Shared application state
pub type SharedState = Arc<AppState>;

/// Read path, write path and health checks over one registry and cache
pub struct AppState {
    pub entitlements: Entitlements,
    pub admin: AdminService,
    pub health: HealthChecker,
}

#[derive(Debug, Deserialize)]
pub struct BatchEvaluateRequest {
    pub features: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RolloutRequest {
    pub percentage: i64,
    #[serde(default)]
    pub expected_version: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToggleRequest {
    pub is_enabled: bool,
    #[serde(default)]
    pub expected_version: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct BulkOverrideRequest {
    pub overrides: Vec<OverrideUpsert>,
}

/// Body of a full replace. The key comes from the path and may be omitted.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PutFeatureRequest {
    #[serde(default)]
    pub key: Option<String>,
    #[serde(flatten)]
    pub rest: serde_json::Map<String, serde_json::Value>,
}

impl PutFeatureRequest {
    fn into_spec(self, key: &str) -> Result<FeatureSpec, EntitlementError> {
        if let Some(body_key) = &self.key {
            if body_key != key {
                return Err(EntitlementError::InvalidRequest(format!(
                    "Body key '{}' does not match path key '{}'",
                    body_key, key
                )));
            }
        }
        let mut fields = self.rest;
        fields.insert("key".to_string(), serde_json::Value::String(key.to_string()));
        serde_json::from_value(serde_json::Value::Object(fields))
            .map_err(|e| EntitlementError::InvalidRequest(format!("Invalid feature body: {}", e)))
    }
}

fn with_etag(feature: Feature) -> impl IntoResponse {
    ([(header::ETAG, etag(feature.version))], Json(feature))
}

/// Get a feature by key
pub async fn get_feature(
    State(state): State<SharedState>,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, EntitlementError> {
    RequestValidator::validate_key(&key)?;
    let feature = state.admin.registry().get(&key).await?;
    Ok(with_etag(feature))
}

/// List features, filtered by category, tier and status
pub async fn list_features(
    State(state): State<SharedState>,
    Query(filter): Query<FeatureFilter>,
) -> Result<impl IntoResponse, EntitlementError> {
    let features = state.admin.registry().list(&filter).await?;
    Ok(Json(features))
}

/// Evaluate one feature for the calling session
pub async fn evaluate_feature(
    State(state): State<SharedState>,
    Path(key): Path<String>,
    session: Session,
) -> Result<impl IntoResponse, EntitlementError> {
    RequestValidator::validate_key(&key)?;
    let result = state
        .entitlements
        .evaluate(&key, &session.user, &session.company_id)
        .await;

    tracing::debug!(
        feature = %key,
        user = %session.user.id,
        company = %session.company_id,
        ?result,
        "Feature evaluated"
    );
    Ok(Json(EvaluationResponse::new(key, result)))
}

/// Evaluate several features for the calling session
pub async fn evaluate_batch(
    State(state): State<SharedState>,
    session: Session,
    Json(payload): Json<BatchEvaluateRequest>,
) -> Result<impl IntoResponse, EntitlementError> {
    for key in &payload.features {
        RequestValidator::validate_key(key)?;
    }
    let results = state
        .entitlements
        .evaluate_many(&payload.features, &session.user, &session.company_id)
        .await;
    Ok(Json(BatchEvaluationResponse::new(
        &session.user.id,
        &session.company_id,
        results,
    )))
}

/// Features merged with a company's overrides
pub async fn company_features(
    State(state): State<SharedState>,
    Path(company_id): Path<String>,
) -> Result<impl IntoResponse, EntitlementError> {
    RequestValidator::validate_company_id(&company_id)?;
    let view = state.entitlements.company_features(&company_id).await?;
    Ok(Json(view))
}

/// Create a feature
pub async fn create_feature(
    State(state): State<SharedState>,
    Json(spec): Json<FeatureSpec>,
) -> Result<impl IntoResponse, EntitlementError> {
    let feature = state.admin.create_feature(spec).await?;
    Ok((StatusCode::CREATED, with_etag(feature)))
}

/// Replace a feature, creating it when absent
pub async fn put_feature(
    State(state): State<SharedState>,
    Path(key): Path<String>,
    ExpectedVersion(expected): ExpectedVersion,
    Json(payload): Json<PutFeatureRequest>,
) -> Result<impl IntoResponse, EntitlementError> {
    RequestValidator::validate_key(&key)?;
    let spec = payload.into_spec(&key)?;
    let (feature, created) = state.admin.put_feature(&key, spec, expected).await?;
    let status = if created { StatusCode::CREATED } else { StatusCode::OK };
    Ok((status, with_etag(feature)))
}

/// Partially update a feature
pub async fn patch_feature(
    State(state): State<SharedState>,
    Path(key): Path<String>,
    ExpectedVersion(expected): ExpectedVersion,
    Json(patch): Json<FeaturePatch>,
) -> Result<impl IntoResponse, EntitlementError> {
    RequestValidator::validate_key(&key)?;
    let feature = state.admin.update_feature(&key, patch, expected).await?;
    Ok(with_etag(feature))
}

/// Change the rollout percentage of a feature
pub async fn set_rollout(
    State(state): State<SharedState>,
    Path(key): Path<String>,
    if_match: ExpectedVersion,
    Json(payload): Json<RolloutRequest>,
) -> Result<impl IntoResponse, EntitlementError> {
    RequestValidator::validate_key(&key)?;
    let expected = if_match.with_body(payload.expected_version)?;
    let feature = state
        .admin
        .set_rollout(&key, payload.percentage, expected)
        .await?;
    Ok(with_etag(feature))
}

/// Globally enable or disable a feature
pub async fn toggle_feature(
    State(state): State<SharedState>,
    Path(key): Path<String>,
    if_match: ExpectedVersion,
    Json(payload): Json<ToggleRequest>,
) -> Result<impl IntoResponse, EntitlementError> {
    RequestValidator::validate_key(&key)?;
    let expected = if_match.with_body(payload.expected_version)?;
    let feature = state
        .admin
        .set_enabled(&key, payload.is_enabled, expected)
        .await?;
    Ok(with_etag(feature))
}

/// Delete a feature
pub async fn delete_feature(
    State(state): State<SharedState>,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, EntitlementError> {
    RequestValidator::validate_key(&key)?;
    state.admin.delete_feature(&key).await?;
    Ok(Json(DeletedResponse::feature(&key)))
}

/// Upsert or clear several overrides of one company
pub async fn upsert_company_overrides(
    State(state): State<SharedState>,
    Path(company_id): Path<String>,
    Json(payload): Json<BulkOverrideRequest>,
) -> Result<impl IntoResponse, EntitlementError> {
    let overrides = state
        .admin
        .upsert_company_overrides(&company_id, payload.overrides)
        .await?;
    Ok(Json(overrides))
}

/// Clear one override of a company
pub async fn clear_company_override(
    State(state): State<SharedState>,
    Path((company_id, key)): Path<(String, String)>,
) -> Result<impl IntoResponse, EntitlementError> {
    RequestValidator::validate_key(&key)?;
    state.admin.clear_override(&company_id, &key).await?;
    Ok(Json(DeletedResponse::company_override(&company_id, &key)))
}

/// Remove everything this service holds for a deleted company
pub async fn delete_company(
    State(state): State<SharedState>,
    Path(company_id): Path<String>,
) -> Result<impl IntoResponse, EntitlementError> {
    let removed_overrides = state.admin.delete_company(&company_id).await?;
    Ok(Json(CompanyDeletedResponse {
        company_id,
        removed_overrides,
    }))
}

/// Health check endpoint
pub async fn health_check(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.health.check_health().await)
}

/// Readiness check endpoint
pub async fn readiness_check(State(state): State<SharedState>) -> impl IntoResponse {
    let registry = state.health.check_registry().await;

    if registry.is_healthy() {
        (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "registry": registry.backend
            })),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "registry": registry.backend,
                "error": registry.error
            })),
        )
    }
}
