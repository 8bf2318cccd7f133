//! Cluster inventory listing
//!
//! This module defines the `ClusterReader` capability used by the aggregator,
//! the plain records it returns, and two implementations: a kube-backed
//! reader talking to the control-plane API and an in-memory reader.

mod kube_reader;
mod memory;
pub mod quantity;

pub use kube_reader::{KubeClusterReader, DEFAULT_PAGE_SIZE};
pub use memory::{ClusterInventory, InMemoryClusterReader};

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

pub use async_trait::async_trait;

/// Resource name -> quantity, as found in allocatable, requests and limits
pub type ResourceList = BTreeMap<String, Quantity>;

/// The five resource kinds listed on every poll
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    Nodes,
    Pods,
    Namespaces,
    Deployments,
    Services,
}

impl ResourceKind {
    /// Listing order used by a poll
    pub const ALL: [ResourceKind; 5] = [
        ResourceKind::Nodes,
        ResourceKind::Pods,
        ResourceKind::Namespaces,
        ResourceKind::Deployments,
        ResourceKind::Services,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Nodes => "nodes",
            ResourceKind::Pods => "pods",
            ResourceKind::Namespaces => "namespaces",
            ResourceKind::Deployments => "deployments",
            ResourceKind::Services => "services",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of a single listing call
#[derive(Debug, thiserror::Error)]
pub enum ListError {
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("listing timed out after {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionRecord {
    pub kind: String,
    pub status: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeRecord {
    pub name: String,
    pub conditions: Vec<ConditionRecord>,
    pub allocatable: ResourceList,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerRecord {
    pub name: String,
    pub requests: ResourceList,
    pub limits: ResourceList,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerStatusRecord {
    pub name: String,
    pub restart_count: i32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PodRecord {
    pub namespace: String,
    pub name: String,
    pub phase: String,
    pub containers: Vec<ContainerRecord>,
    pub container_statuses: Vec<ContainerStatusRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeploymentRecord {
    pub namespace: String,
    pub name: String,
    /// `spec.replicas`; absent when the object omits it
    pub spec_replicas: Option<i32>,
    pub available_replicas: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceRecord {
    pub namespace: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NamespaceRecord {
    pub name: String,
}

/// Read-only access to the cluster inventory.
///
/// Every call returns the complete list for its kind or an error;
/// implementations handle pagination internally.
#[async_trait]
pub trait ClusterReader: Send + Sync {
    async fn list_nodes(&self) -> Result<Vec<NodeRecord>, ListError>;

    async fn list_pods(&self) -> Result<Vec<PodRecord>, ListError>;

    async fn list_namespaces(&self) -> Result<Vec<NamespaceRecord>, ListError>;

    async fn list_deployments(&self) -> Result<Vec<DeploymentRecord>, ListError>;

    async fn list_services(&self) -> Result<Vec<ServiceRecord>, ListError>;
}

/// Build a `ResourceList` from `(name, quantity)` pairs
pub fn resource_list<'a>(entries: impl IntoIterator<Item = (&'a str, &'a str)>) -> ResourceList {
    entries
        .into_iter()
        .map(|(name, value)| (name.to_string(), Quantity(value.to_string())))
        .collect()
}
