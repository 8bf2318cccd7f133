//! Cluster metrics HTTP service
//!
//! Router, handlers, middleware and configuration for the `k8s-metrics-api`
//! binary.

pub mod api;
pub mod config;
pub mod middleware;

pub use api::{create_router, serve, AppState};
pub use config::ApiConfig;
