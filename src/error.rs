//! Error types for the admin API.
//!
//! [`AdminError`] models the admin CRUD outcomes from §6/§7: a client that
//! already exists, a client that doesn't, or a malformed request body. These
//! map directly to the contractual status codes (404/409/400) rather than a
//! generic 500 — the request-plane pipeline has its own terminal statuses
//! (429/503/502/504) and never goes through this type.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Outcomes of admin `/api/ratelimit/clients` CRUD (§6, §7's
/// `AdminNotFound` / `AdminConflict`).
#[derive(Debug, thiserror::Error)]
pub enum AdminError {
    #[error("client `{0}` not found")]
    NotFound(String),
    #[error("client `{0}` already exists")]
    Conflict(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        let status = match &self {
            AdminError::NotFound(_) => StatusCode::NOT_FOUND,
            AdminError::Conflict(_) => StatusCode::CONFLICT,
            AdminError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
