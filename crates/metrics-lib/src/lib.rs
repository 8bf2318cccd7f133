//! Cluster inventory aggregation library
//!
//! This crate provides the core functionality for:
//! - Listing nodes, pods, deployments, services and namespaces
//! - Folding the listings into a cluster snapshot
//! - Maintaining the process-wide gauge set for Prometheus exposition
//! - Health checks and observability

pub mod aggregator;
pub mod cluster;
pub mod gauges;
pub mod health;
pub mod models;
pub mod observability;

pub use aggregator::{Aggregator, CollectError};
pub use cluster::{ClusterReader, InMemoryClusterReader, KubeClusterReader, ListError, ResourceKind};
pub use gauges::{GaugeSet, GaugeUpdate, LabeledFamily, MetricRegistry, MetricsError};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, LivenessResponse,
    ReadinessResponse,
};
pub use models::*;
pub use observability::{PollMetrics, StructuredLogger};
