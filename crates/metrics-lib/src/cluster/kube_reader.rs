//! Cluster reader backed by the Kubernetes API
//!
//! Lists every resource kind cluster-wide, following `continue` tokens until
//! the server reports the final page, and converts the API objects into the
//! plain records consumed by the aggregator.

use super::{
    async_trait, ClusterReader, ConditionRecord, ContainerRecord, ContainerStatusRecord,
    DeploymentRecord, ListError, NamespaceRecord, NodeRecord, PodRecord, ServiceRecord,
};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Container, Namespace, Node, Pod, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ListMeta;
use kube::{
    api::{Api, ListParams},
    Client, Resource,
};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::future::Future;
use tracing::{debug, info};

/// Default number of objects requested per page
pub const DEFAULT_PAGE_SIZE: u32 = 500;

/// Phase reported for pods whose status carries none
const UNKNOWN_PHASE: &str = "Unknown";

/// Kubernetes-backed cluster reader.
///
/// The underlying `Client` is cheap to clone and shares one connection pool
/// across all concurrent polls.
#[derive(Clone)]
pub struct KubeClusterReader {
    client: Client,
    page_size: u32,
}

impl KubeClusterReader {
    pub fn new(client: Client, page_size: u32) -> Self {
        Self {
            client,
            page_size: page_size.max(1),
        }
    }

    /// Connect using in-cluster configuration, falling back to the local kubeconfig
    pub async fn try_default(page_size: u32) -> Result<Self, ListError> {
        debug!("Initializing Kubernetes client");
        let client = Client::try_default().await?;
        info!("Successfully connected to Kubernetes cluster");
        Ok(Self::new(client, page_size))
    }

    async fn list_all<K>(&self) -> Result<Vec<K>, ListError>
    where
        K: Resource + Clone + DeserializeOwned + Debug,
        K::DynamicType: Default,
    {
        let api: Api<K> = Api::all(self.client.clone());
        let page_size = self.page_size;

        collect_pages(|token| {
            let api = api.clone();
            async move {
                let mut params = ListParams::default().limit(page_size);
                if let Some(token) = token {
                    params = params.continue_token(&token);
                }
                api.list(&params)
                    .await
                    .map(|page| (page.items, page.metadata))
                    .map_err(ListError::from)
            }
        })
        .await
    }
}

/// Fetch pages until the server stops handing out a `continue` token.
/// `fetch` receives the token of the page to request, `None` for the first.
async fn collect_pages<T, F, Fut>(mut fetch: F) -> Result<Vec<T>, ListError>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = Result<(Vec<T>, ListMeta), ListError>>,
{
    let mut items = Vec::new();
    let mut token = None;

    loop {
        let (page, metadata) = fetch(token).await?;
        items.extend(page);

        token = next_page_token(&metadata);
        if token.is_none() {
            return Ok(items);
        }
    }
}

/// An absent or empty `continue` marks the last page
fn next_page_token(metadata: &ListMeta) -> Option<String> {
    metadata
        .continue_
        .as_ref()
        .filter(|token| !token.is_empty())
        .cloned()
}

#[async_trait]
impl ClusterReader for KubeClusterReader {
    async fn list_nodes(&self) -> Result<Vec<NodeRecord>, ListError> {
        let nodes: Vec<Node> = self.list_all().await?;
        Ok(nodes.iter().map(node_record).collect())
    }

    async fn list_pods(&self) -> Result<Vec<PodRecord>, ListError> {
        let pods: Vec<Pod> = self.list_all().await?;
        Ok(pods.iter().map(pod_record).collect())
    }

    async fn list_namespaces(&self) -> Result<Vec<NamespaceRecord>, ListError> {
        let namespaces: Vec<Namespace> = self.list_all().await?;
        Ok(namespaces
            .iter()
            .map(|ns| NamespaceRecord {
                name: ns.metadata.name.clone().unwrap_or_default(),
            })
            .collect())
    }

    async fn list_deployments(&self) -> Result<Vec<DeploymentRecord>, ListError> {
        let deployments: Vec<Deployment> = self.list_all().await?;
        Ok(deployments.iter().map(deployment_record).collect())
    }

    async fn list_services(&self) -> Result<Vec<ServiceRecord>, ListError> {
        let services: Vec<Service> = self.list_all().await?;
        Ok(services
            .iter()
            .map(|svc| ServiceRecord {
                namespace: svc.metadata.namespace.clone().unwrap_or_default(),
                name: svc.metadata.name.clone().unwrap_or_default(),
            })
            .collect())
    }
}

fn node_record(node: &Node) -> NodeRecord {
    let status = node.status.as_ref();

    NodeRecord {
        name: node.metadata.name.clone().unwrap_or_default(),
        conditions: status
            .and_then(|s| s.conditions.as_ref())
            .map(|conditions| {
                conditions
                    .iter()
                    .map(|c| ConditionRecord {
                        kind: c.type_.clone(),
                        status: c.status.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default(),
        allocatable: status
            .and_then(|s| s.allocatable.clone())
            .unwrap_or_default(),
    }
}

fn pod_record(pod: &Pod) -> PodRecord {
    let status = pod.status.as_ref();

    PodRecord {
        namespace: pod.metadata.namespace.clone().unwrap_or_default(),
        name: pod.metadata.name.clone().unwrap_or_default(),
        phase: status
            .and_then(|s| s.phase.clone())
            .unwrap_or_else(|| UNKNOWN_PHASE.to_string()),
        containers: pod
            .spec
            .as_ref()
            .map(|spec| spec.containers.iter().map(container_record).collect())
            .unwrap_or_default(),
        container_statuses: status
            .and_then(|s| s.container_statuses.as_ref())
            .map(|statuses| {
                statuses
                    .iter()
                    .map(|cs| ContainerStatusRecord {
                        name: cs.name.clone(),
                        restart_count: cs.restart_count,
                    })
                    .collect()
            })
            .unwrap_or_default(),
    }
}

fn container_record(container: &Container) -> ContainerRecord {
    let resources = container.resources.as_ref();

    ContainerRecord {
        name: container.name.clone(),
        requests: resources
            .and_then(|r| r.requests.clone())
            .unwrap_or_default(),
        limits: resources.and_then(|r| r.limits.clone()).unwrap_or_default(),
    }
}

fn deployment_record(deployment: &Deployment) -> DeploymentRecord {
    DeploymentRecord {
        namespace: deployment.metadata.namespace.clone().unwrap_or_default(),
        name: deployment.metadata.name.clone().unwrap_or_default(),
        spec_replicas: deployment.spec.as_ref().and_then(|s| s.replicas),
        available_replicas: deployment
            .status
            .as_ref()
            .and_then(|s| s.available_replicas)
            .unwrap_or(0),
    }
}
