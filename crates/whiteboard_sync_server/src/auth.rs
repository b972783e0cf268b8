//! Access gate.
//!
//! Identity and permissions are decided upstream; this server only checks an
//! optional shared token and passes along whatever user id the caller claims.

use axum::extract::{FromRequestParts, Query};
use axum::http::{HeaderMap, header, request::Parts};
use serde::Deserialize;

use crate::handlers::{ApiError, AppState};

/// Checks the optional `ACCESS_TOKEN` shared secret.
#[derive(Debug, Clone, Default)]
pub struct AccessGate {
    token: Option<String>,
}

impl AccessGate {
    pub fn new(token: Option<String>) -> Self {
        Self { token }
    }

    pub fn is_open(&self) -> bool {
        self.token.is_none()
    }

    /// Accept a `Bearer` authorization header or a `?token=` query value.
    pub fn allows(&self, headers: &HeaderMap, query_token: Option<&str>) -> bool {
        let Some(expected) = self.token.as_deref() else {
            return true;
        };
        bearer_token(headers)
            .or(query_token)
            .is_some_and(|presented| presented == expected)
    }
}

/// Extract the token from an `Authorization: Bearer ...` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

#[derive(Debug, Default, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// Extractor that rejects the request with 401 unless the gate allows it.
pub struct RequireAccess;

impl FromRequestParts<AppState> for RequireAccess {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        if state.gate.is_open() {
            return Ok(RequireAccess);
        }
        let query = Query::<TokenQuery>::try_from_uri(&parts.uri)
            .map(|Query(query)| query)
            .unwrap_or_default();
        if state.gate.allows(&parts.headers, query.token.as_deref()) {
            Ok(RequireAccess)
        } else {
            Err(ApiError::Unauthorized)
        }
    }
}
