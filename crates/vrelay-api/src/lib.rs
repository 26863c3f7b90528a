//! Axum HTTP API server.
//!
//! This crate provides:
//! - The runner protocol gateway and its endpoints
//! - Administrator endpoints for creating, inspecting and cancelling jobs
//! - Rate limiting, request logging and Prometheus metrics

pub mod config;
pub mod error;
pub mod gateway;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod routes;
pub mod state;

pub use config::ApiConfig;
pub use error::{ApiError, ApiResult};
pub use gateway::RunnerGateway;
pub use routes::create_router;
pub use state::AppState;
