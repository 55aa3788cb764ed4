//! HTTP/REST API layer for Loomflow.
//!
//! Axum-based REST API at `/api/v1/` with tenant scoping, envelope
//! response format, a WebSocket event stream and CORS support.

pub mod error;
pub mod extractors;
pub mod handlers;
pub mod response;
pub mod router;
