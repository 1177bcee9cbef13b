//! Admin REST API — §6's contract table, nested under `/api/ratelimit`.
//!
//! Grounded on original_source's `internal/handler/rate_limit.go` for the
//! route table and status codes, and on the teacher's `api/admin.rs` for
//! axum routing idiom (`Router::new().route(...).with_state(state)`,
//! `Json<Value>` bodies).

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;

use crate::error::AdminError;
use crate::ratelimit::RateLimiter;

/// Build the admin router. Mounted at `/api/ratelimit` by the caller.
pub fn router(rate_limiter: Arc<RateLimiter>) -> Router {
    Router::new()
        .route("/clients", get(list_clients).post(create_client))
        .route("/clients/{id}", get(get_client).put(update_client).delete(delete_client))
        .route("/clients/{id}/tokens", get(get_tokens))
        .with_state(rate_limiter)
}

#[derive(Deserialize)]
pub struct ClientRequest {
    #[serde(default)]
    pub client_id: Option<String>,
    pub capacity: u32,
    pub rate_per_sec: f64,
}

fn validate(capacity: u32, rate_per_sec: f64) -> Result<(), AdminError> {
    if capacity < 1 {
        return Err(AdminError::InvalidRequest("capacity must be >= 1".into()));
    }
    if rate_per_sec < 0.1 {
        return Err(AdminError::InvalidRequest("rate_per_sec must be >= 0.1".into()));
    }
    Ok(())
}

fn client_json(id: &str, policy: crate::ratelimit::ClientPolicy) -> serde_json::Value {
    json!({ "client_id": id, "capacity": policy.capacity, "rate_per_sec": policy.refill_rate })
}

/// `GET /api/ratelimit/clients`
async fn list_clients(State(limiter): State<Arc<RateLimiter>>) -> impl IntoResponse {
    let clients: Vec<_> = limiter.list_clients().into_iter().map(|(id, policy)| client_json(&id, policy)).collect();
    let total = clients.len();
    Json(json!({ "clients": clients, "total": total }))
}

/// `POST /api/ratelimit/clients`
async fn create_client(
    State(limiter): State<Arc<RateLimiter>>,
    Json(req): Json<ClientRequest>,
) -> Result<impl IntoResponse, AdminError> {
    let id = req.client_id.ok_or_else(|| AdminError::InvalidRequest("client_id is required".into()))?;
    validate(req.capacity, req.rate_per_sec)?;

    if limiter.get_client(&id).is_some() {
        return Err(AdminError::Conflict(id));
    }
    limiter.upsert_client(&id, req.capacity, req.rate_per_sec);
    Ok((StatusCode::CREATED, Json(json!({ "status": "success" }))))
}

/// `GET /api/ratelimit/clients/{id}`
async fn get_client(State(limiter): State<Arc<RateLimiter>>, Path(id): Path<String>) -> Result<impl IntoResponse, AdminError> {
    let policy = limiter.get_client(&id).ok_or_else(|| AdminError::NotFound(id.clone()))?;
    Ok(Json(client_json(&id, policy)))
}

#[derive(Deserialize)]
pub struct UpdateRequest {
    pub capacity: u32,
    pub rate_per_sec: f64,
}

/// `PUT /api/ratelimit/clients/{id}`
async fn update_client(
    State(limiter): State<Arc<RateLimiter>>,
    Path(id): Path<String>,
    Json(req): Json<UpdateRequest>,
) -> Result<impl IntoResponse, AdminError> {
    validate(req.capacity, req.rate_per_sec)?;
    if limiter.get_client(&id).is_none() {
        return Err(AdminError::NotFound(id));
    }
    limiter.upsert_client(&id, req.capacity, req.rate_per_sec);
    Ok(Json(json!({ "status": "success" })))
}

/// `DELETE /api/ratelimit/clients/{id}`
async fn delete_client(State(limiter): State<Arc<RateLimiter>>, Path(id): Path<String>) -> Result<impl IntoResponse, AdminError> {
    if !limiter.delete_client(&id) {
        return Err(AdminError::NotFound(id));
    }
    Ok(Json(json!({ "status": "success" })))
}

/// `GET /api/ratelimit/clients/{id}/tokens`
async fn get_tokens(State(limiter): State<Arc<RateLimiter>>, Path(id): Path<String>) -> Result<impl IntoResponse, AdminError> {
    let tokens = limiter.tokens_remaining(&id).ok_or_else(|| AdminError::NotFound(id.clone()))?;
    Ok(Json(json!({ "client_id": id, "tokens": tokens })))
}
