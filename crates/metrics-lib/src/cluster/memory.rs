//! In-memory cluster reader
//!
//! Serves a fixed inventory that can be swapped between polls. Listing
//! failures and latency can be injected per call, and every call is counted
//! per resource kind.

use super::{
    async_trait, ClusterReader, DeploymentRecord, ListError, NamespaceRecord, NodeRecord,
    PodRecord, ResourceKind, ServiceRecord,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::time::Duration;

/// Complete set of listings returned by one pass
#[derive(Debug, Clone, Default)]
pub struct ClusterInventory {
    pub nodes: Vec<NodeRecord>,
    pub pods: Vec<PodRecord>,
    pub namespaces: Vec<NamespaceRecord>,
    pub deployments: Vec<DeploymentRecord>,
    pub services: Vec<ServiceRecord>,
}

#[derive(Default)]
pub struct InMemoryClusterReader {
    inventory: RwLock<ClusterInventory>,
    failures: RwLock<HashMap<ResourceKind, String>>,
    latency: RwLock<Option<Duration>>,
    calls: Mutex<HashMap<ResourceKind, usize>>,
}

impl InMemoryClusterReader {
    pub fn new(inventory: ClusterInventory) -> Self {
        Self {
            inventory: RwLock::new(inventory),
            ..Default::default()
        }
    }

    /// Replace the inventory served by subsequent calls
    pub fn set_inventory(&self, inventory: ClusterInventory) {
        *self.inventory.write() = inventory;
    }

    /// Make every listing of `kind` fail with `message`
    pub fn fail(&self, kind: ResourceKind, message: impl Into<String>) {
        self.failures.write().insert(kind, message.into());
    }

    /// Clear an injected failure
    pub fn recover(&self, kind: ResourceKind) {
        self.failures.write().remove(&kind);
    }

    /// Delay every listing call by `latency`
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.write() = Some(latency);
    }

    /// Number of listing calls received for `kind`
    pub fn call_count(&self, kind: ResourceKind) -> usize {
        self.calls.lock().get(&kind).copied().unwrap_or(0)
    }

    /// Number of listing calls received across all kinds
    pub fn total_calls(&self) -> usize {
        self.calls.lock().values().sum()
    }

    async fn serve<T>(
        &self,
        kind: ResourceKind,
        select: impl FnOnce(&ClusterInventory) -> Vec<T>,
    ) -> Result<Vec<T>, ListError> {
        *self.calls.lock().entry(kind).or_insert(0) += 1;

        let latency = *self.latency.read();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        if let Some(message) = self.failures.read().get(&kind) {
            return Err(ListError::Unavailable(message.clone()));
        }

        Ok(select(&*self.inventory.read()))
    }
}

#[async_trait]
impl ClusterReader for InMemoryClusterReader {
    async fn list_nodes(&self) -> Result<Vec<NodeRecord>, ListError> {
        self.serve(ResourceKind::Nodes, |inv| inv.nodes.clone()).await
    }

    async fn list_pods(&self) -> Result<Vec<PodRecord>, ListError> {
        self.serve(ResourceKind::Pods, |inv| inv.pods.clone()).await
    }

    async fn list_namespaces(&self) -> Result<Vec<NamespaceRecord>, ListError> {
        self.serve(ResourceKind::Namespaces, |inv| inv.namespaces.clone())
            .await
    }

    async fn list_deployments(&self) -> Result<Vec<DeploymentRecord>, ListError> {
        self.serve(ResourceKind::Deployments, |inv| inv.deployments.clone())
            .await
    }

    async fn list_services(&self) -> Result<Vec<ServiceRecord>, ListError> {
        self.serve(ResourceKind::Services, |inv| inv.services.clone())
            .await
    }
}
