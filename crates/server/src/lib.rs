//! HTTP ingestion service for code-intelligence index uploads.
//!
//! This crate provides:
//! - The external (bearer token) and internal upload endpoints
//! - Request validation and repository/commit resolution
//! - Per-code-host authorization of external uploads
//! - The single-payload and multipart upload state machine
//! - Failure annotation of uploads whose bytes could not be stored

pub mod auth;
pub mod authz;
pub mod bootstrap;
pub mod error;
pub mod git;
pub mod handlers;
pub mod metrics;
pub mod routes;
pub mod state;
pub mod uploads;

pub use auth::TraceId;
pub use error::ApiError;
pub use routes::{create_internal_router, create_router};
pub use state::AppState;
