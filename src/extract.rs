//! Request extractors for session identity and optimistic concurrency.

use crate::error::EntitlementError;
use crate::feature::UserContext;
use crate::validation::RequestValidator;
use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::header::IF_MATCH;
use axum::http::request::Parts;
use axum::http::HeaderMap;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const TIER_HEADER: &str = "x-subscription-tier";
pub const COMPANY_ID_HEADER: &str = "x-company-id";

/// Identity resolved upstream by the session provider and forwarded as headers.
#[derive(Debug, Clone)]
pub struct Session {
    pub user: UserContext,
    pub company_id: String,
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str, EntitlementError> {
    headers
        .get(name)
        .ok_or_else(|| EntitlementError::InvalidRequest(format!("Missing '{}' header", name)))?
        .to_str()
        .map(str::trim)
        .map_err(|_| EntitlementError::InvalidRequest(format!("Invalid '{}' header", name)))
}

impl Session {
    pub fn from_headers(headers: &HeaderMap) -> Result<Self, EntitlementError> {
        let user = UserContext::new(header(headers, USER_ID_HEADER)?, header(headers, TIER_HEADER)?);
        user.validate()?;
        let company_id = header(headers, COMPANY_ID_HEADER)?.to_string();
        RequestValidator::validate_company_id(&company_id)?;
        Ok(Self { user, company_id })
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for Session
where
    S: Send + Sync,
{
    type Rejection = EntitlementError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Session::from_headers(&parts.headers)
    }
}

/// Feature version from an `If-Match` header. Absent or `*` means no check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExpectedVersion(pub Option<u64>);

impl ExpectedVersion {
    pub fn from_headers(headers: &HeaderMap) -> Result<Self, EntitlementError> {
        let Some(value) = headers.get(IF_MATCH) else {
            return Ok(Self(None));
        };
        let value = value
            .to_str()
            .map_err(|_| EntitlementError::InvalidRequest("Invalid If-Match header".to_string()))?
            .trim();
        if value == "*" {
            return Ok(Self(None));
        }

        value
            .trim_start_matches("W/")
            .trim_matches('"')
            .parse::<u64>()
            .map(|version| Self(Some(version)))
            .map_err(|_| {
                EntitlementError::InvalidRequest(format!(
                    "If-Match must carry a feature version, got '{}'",
                    value
                ))
            })
    }
}

impl ExpectedVersion {
    /// Combine with an `expectedVersion` sent in the body. Both may be
    /// given only when they agree.
    pub fn with_body(self, body: Option<u64>) -> Result<Option<u64>, EntitlementError> {
        match (self.0, body) {
            (Some(header), Some(body)) if header != body => {
                Err(EntitlementError::InvalidRequest(format!(
                    "If-Match version {} does not match expectedVersion {}",
                    header, body
                )))
            }
            (header, body) => Ok(header.or(body)),
        }
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for ExpectedVersion
where
    S: Send + Sync,
{
    type Rejection = EntitlementError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        ExpectedVersion::from_headers(&parts.headers)
    }
}
