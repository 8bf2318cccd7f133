//! Core data models for cluster aggregation

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Aggregate view of one poll, served by the snapshot endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSnapshot {
    pub node_count: usize,
    pub pod_count: usize,
    pub deployment_count: usize,
    pub service_count: usize,
    pub namespace_count: usize,
    /// Pod count keyed by the phase string reported by the control plane
    pub pod_phases: BTreeMap<String, usize>,
    pub timestamp: DateTime<Utc>,
}

impl ClusterSnapshot {
    /// Serialize the snapshot as the JSON document returned to API consumers
    pub fn render(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Per-node readiness and capacity
#[derive(Debug, Clone, PartialEq)]
pub struct NodeObservation {
    pub name: String,
    pub ready: bool,
    pub cpu_allocatable_cores: f64,
    pub memory_allocatable_bytes: f64,
}

/// Summed container requests and limits for one namespace
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NamespaceAggregate {
    pub cpu_requests_cores: f64,
    pub memory_requests_bytes: f64,
    pub cpu_limits_cores: f64,
    pub memory_limits_bytes: f64,
}

/// Desired and available replicas of one deployment
#[derive(Debug, Clone, PartialEq)]
pub struct DeploymentObservation {
    pub namespace: String,
    pub name: String,
    pub desired_replicas: i32,
    pub available_replicas: i32,
}

/// Current restart count of one container, as maintained by the control plane
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerRestartObservation {
    pub namespace: String,
    pub pod: String,
    pub container: String,
    pub restart_count: i32,
}
