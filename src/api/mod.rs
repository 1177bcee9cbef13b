//! HTTP-facing modules external to the request-plane core: the admin REST
//! surface, the liveness probe, and the request-id correlation middleware.

pub mod admin;
pub mod health;
pub mod request_id;
