//! Cluster aggregation
//!
//! The aggregator lists the five resource kinds in a fixed order under one
//! deadline, folds each listing into observations, and overwrites the gauges
//! belonging to that listing as soon as it is folded. The first failed or
//! timed out listing aborts the poll; gauges written earlier in the same
//! poll keep their new values.

#[cfg(test)]
mod tests;

use crate::cluster::quantity::{self, QuantityError};
use crate::cluster::{
    ClusterReader, DeploymentRecord, ListError, NodeRecord, PodRecord, ResourceKind, ResourceList,
};
use crate::gauges::{names, GaugeSet, GaugeUpdate, MetricsError, Series};
use crate::models::{
    ClusterSnapshot, ContainerRestartObservation, DeploymentObservation, NamespaceAggregate,
    NodeObservation,
};
use crate::observability::{PollMetrics, StructuredLogger};
use chrono::Utc;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

const CPU: &str = "cpu";
const MEMORY: &str = "memory";
const READY_CONDITION: &str = "Ready";
const CONDITION_TRUE: &str = "True";

#[derive(Debug, thiserror::Error)]
pub enum CollectError {
    #[error("failed to list {kind}: {source}")]
    Listing {
        kind: ResourceKind,
        #[source]
        source: ListError,
    },

    #[error("failed to update gauges: {0}")]
    Metrics(#[from] MetricsError),
}

impl CollectError {
    /// Resource kind whose listing aborted the poll
    pub fn kind(&self) -> Option<ResourceKind> {
        match self {
            CollectError::Listing { kind, .. } => Some(*kind),
            CollectError::Metrics(_) => None,
        }
    }
}

/// Turns cluster listings into a snapshot and the resident gauge values
#[derive(Clone)]
pub struct Aggregator {
    reader: Arc<dyn ClusterReader>,
    gauges: GaugeSet,
    poll_metrics: PollMetrics,
    logger: StructuredLogger,
}

impl Aggregator {
    pub fn new(
        reader: Arc<dyn ClusterReader>,
        gauges: GaugeSet,
        poll_metrics: PollMetrics,
        logger: StructuredLogger,
    ) -> Self {
        Self {
            reader,
            gauges,
            poll_metrics,
            logger,
        }
    }

    pub fn gauges(&self) -> &GaugeSet {
        &self.gauges
    }

    pub fn poll_metrics(&self) -> &PollMetrics {
        &self.poll_metrics
    }

    /// Run one poll bounded by `budget`.
    /// A budget too large to add to the clock leaves the poll unbounded.
    pub async fn collect(&self, budget: Duration) -> Result<ClusterSnapshot, CollectError> {
        let started = Instant::now();
        let deadline = started.checked_add(budget);
        let result = self.poll(deadline, budget).await;
        let elapsed = started.elapsed();

        self.poll_metrics.observe_poll(elapsed, result.is_ok());
        if let Ok(snapshot) = &result {
            self.logger.log_poll_completed(
                snapshot.node_count,
                snapshot.pod_count,
                snapshot.namespace_count,
                snapshot.deployment_count,
                snapshot.service_count,
                elapsed,
            );
        }

        result
    }

    async fn poll(
        &self,
        deadline: Option<Instant>,
        budget: Duration,
    ) -> Result<ClusterSnapshot, CollectError> {
        let timestamp = Utc::now();

        let nodes = self
            .list(ResourceKind::Nodes, deadline, budget, self.reader.list_nodes())
            .await?;
        let observations = fold_nodes(&nodes, &self.logger);
        self.gauges.overwrite(&node_update(&observations))?;

        let pods = self
            .list(ResourceKind::Pods, deadline, budget, self.reader.list_pods())
            .await?;
        let pod_fold = fold_pods(&pods, &self.logger);
        self.gauges.overwrite(&pod_fold.update())?;

        let namespaces = self
            .list(ResourceKind::Namespaces, deadline, budget, self.reader.list_namespaces())
            .await?;
        self.gauges.overwrite(
            &GaugeUpdate::new().scalar(names::NAMESPACES_TOTAL, namespaces.len() as f64),
        )?;

        let deployments = self
            .list(ResourceKind::Deployments, deadline, budget, self.reader.list_deployments())
            .await?;
        let deployment_observations = fold_deployments(&deployments, &self.logger);
        self.gauges
            .overwrite(&deployment_update(&deployment_observations))?;

        let services = self
            .list(ResourceKind::Services, deadline, budget, self.reader.list_services())
            .await?;
        self.gauges.overwrite(
            &GaugeUpdate::new().scalar(names::SERVICES_TOTAL, services.len() as f64),
        )?;

        Ok(ClusterSnapshot {
            node_count: nodes.len(),
            pod_count: pods.len(),
            deployment_count: deployments.len(),
            service_count: services.len(),
            namespace_count: namespaces.len(),
            pod_phases: pod_fold.phases,
            timestamp,
        })
    }

    async fn list<T, F>(
        &self,
        kind: ResourceKind,
        deadline: Option<Instant>,
        budget: Duration,
        call: F,
    ) -> Result<Vec<T>, CollectError>
    where
        F: Future<Output = Result<Vec<T>, ListError>>,
    {
        let outcome = match deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, call).await {
                Ok(result) => result,
                Err(_) => Err(ListError::Timeout(budget)),
            },
            None => call.await,
        };

        match outcome {
            Ok(items) => {
                debug!(resource = %kind, count = items.len(), "Listed cluster resources");
                Ok(items)
            }
            Err(source) => {
                self.poll_metrics.inc_listing_failure(kind);
                self.logger.log_listing_failed(kind, &source.to_string());
                Err(CollectError::Listing { kind, source })
            }
        }
    }
}

/// A node is ready iff its first `Ready` condition has status `True`
pub fn is_ready(node: &NodeRecord) -> bool {
    node.conditions
        .iter()
        .find(|condition| condition.kind == READY_CONDITION)
        .map(|condition| condition.status == CONDITION_TRUE)
        .unwrap_or(false)
}

pub fn fold_nodes(nodes: &[NodeRecord], logger: &StructuredLogger) -> Vec<NodeObservation> {
    nodes
        .iter()
        .map(|node| NodeObservation {
            name: node.name.clone(),
            ready: is_ready(node),
            cpu_allocatable_cores: read_quantity(
                &node.allocatable,
                CPU,
                quantity::cpu_cores,
                &node.name,
                logger,
            ),
            memory_allocatable_bytes: read_quantity(
                &node.allocatable,
                MEMORY,
                quantity::bytes,
                &node.name,
                logger,
            ),
        })
        .collect()
}

/// Everything derived from one pod listing
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PodFold {
    pub pod_count: usize,
    /// Cluster-wide tally keyed by phase
    pub phases: BTreeMap<String, usize>,
    /// Tally keyed by `(namespace, phase)`
    pub namespace_phases: BTreeMap<(String, String), usize>,
    /// One entry per namespace that owns at least one pod
    pub namespaces: BTreeMap<String, NamespaceAggregate>,
    pub restarts: Vec<ContainerRestartObservation>,
}

pub fn fold_pods(pods: &[PodRecord], logger: &StructuredLogger) -> PodFold {
    let mut fold = PodFold {
        pod_count: pods.len(),
        ..Default::default()
    };

    for pod in pods {
        *fold.phases.entry(pod.phase.clone()).or_insert(0) += 1;
        *fold
            .namespace_phases
            .entry((pod.namespace.clone(), pod.phase.clone()))
            .or_insert(0) += 1;

        let object = format!("{}/{}", pod.namespace, pod.name);
        let totals = fold.namespaces.entry(pod.namespace.clone()).or_default();
        for container in &pod.containers {
            totals.cpu_requests_cores +=
                read_quantity(&container.requests, CPU, quantity::cpu_cores, &object, logger);
            totals.memory_requests_bytes +=
                read_quantity(&container.requests, MEMORY, quantity::bytes, &object, logger);
            totals.cpu_limits_cores +=
                read_quantity(&container.limits, CPU, quantity::cpu_cores, &object, logger);
            totals.memory_limits_bytes +=
                read_quantity(&container.limits, MEMORY, quantity::bytes, &object, logger);
        }

        fold.restarts
            .extend(pod.container_statuses.iter().map(|status| ContainerRestartObservation {
                namespace: pod.namespace.clone(),
                pod: pod.name.clone(),
                container: status.name.clone(),
                restart_count: status.restart_count,
            }));
    }

    fold
}

impl PodFold {
    /// Gauge values owned by the pod listing
    pub fn update(&self) -> GaugeUpdate {
        let phases: Series = self
            .namespace_phases
            .iter()
            .map(|((namespace, phase), count)| {
                (vec![namespace.clone(), phase.clone()], *count as f64)
            })
            .collect();

        let restarts: Series = self
            .restarts
            .iter()
            .map(|r| {
                (
                    vec![r.namespace.clone(), r.pod.clone(), r.container.clone()],
                    f64::from(r.restart_count),
                )
            })
            .collect();

        let per_namespace = |value: fn(&NamespaceAggregate) -> f64| -> Series {
            self.namespaces
                .iter()
                .map(|(namespace, totals)| (vec![namespace.clone()], value(totals)))
                .collect()
        };

        GaugeUpdate::new()
            .scalar(names::PODS_TOTAL, self.pod_count as f64)
            .family(names::POD_STATUS_PHASE, phases)
            .family(names::CONTAINER_RESTARTS, restarts)
            .family(
                names::NAMESPACE_CPU_REQUESTS,
                per_namespace(|t| t.cpu_requests_cores),
            )
            .family(
                names::NAMESPACE_MEMORY_REQUESTS,
                per_namespace(|t| t.memory_requests_bytes),
            )
            .family(
                names::NAMESPACE_CPU_LIMITS,
                per_namespace(|t| t.cpu_limits_cores),
            )
            .family(
                names::NAMESPACE_MEMORY_LIMITS,
                per_namespace(|t| t.memory_limits_bytes),
            )
    }
}

/// Unset `spec.replicas` counts as 0 desired and is logged
pub fn fold_deployments(
    deployments: &[DeploymentRecord],
    logger: &StructuredLogger,
) -> Vec<DeploymentObservation> {
    deployments
        .iter()
        .map(|deployment| {
            let desired_replicas = deployment.spec_replicas.unwrap_or_else(|| {
                logger.log_missing_replicas(&deployment.namespace, &deployment.name);
                0
            });
            DeploymentObservation {
                namespace: deployment.namespace.clone(),
                name: deployment.name.clone(),
                desired_replicas,
                available_replicas: deployment.available_replicas,
            }
        })
        .collect()
}

pub fn node_update(nodes: &[NodeObservation]) -> GaugeUpdate {
    let per_node = |value: fn(&NodeObservation) -> f64| -> Series {
        nodes
            .iter()
            .map(|node| (vec![node.name.clone()], value(node)))
            .collect()
    };

    GaugeUpdate::new()
        .scalar(names::NODES_TOTAL, nodes.len() as f64)
        .family(
            names::NODE_STATUS_READY,
            per_node(|n| if n.ready { 1.0 } else { 0.0 }),
        )
        .family(
            names::NODE_CPU_ALLOCATABLE,
            per_node(|n| n.cpu_allocatable_cores),
        )
        .family(
            names::NODE_MEMORY_ALLOCATABLE,
            per_node(|n| n.memory_allocatable_bytes),
        )
}

pub fn deployment_update(deployments: &[DeploymentObservation]) -> GaugeUpdate {
    let per_deployment = |value: fn(&DeploymentObservation) -> i32| -> Series {
        deployments
            .iter()
            .map(|d| {
                (
                    vec![d.namespace.clone(), d.name.clone()],
                    f64::from(value(d)),
                )
            })
            .collect()
    };

    GaugeUpdate::new()
        .scalar(names::DEPLOYMENTS_TOTAL, deployments.len() as f64)
        .family(
            names::DEPLOYMENT_DESIRED,
            per_deployment(|d| d.desired_replicas),
        )
        .family(
            names::DEPLOYMENT_AVAILABLE,
            per_deployment(|d| d.available_replicas),
        )
}

/// Value of `resource` in `list`; absent or unparsable quantities count as 0
fn read_quantity(
    list: &ResourceList,
    resource: &str,
    convert: fn(&Quantity) -> Result<f64, QuantityError>,
    object: &str,
    logger: &StructuredLogger,
) -> f64 {
    match list.get(resource) {
        Some(value) => convert(value).unwrap_or_else(|err| {
            logger.log_unparsable_quantity(object, resource, &err.to_string());
            0.0
        }),
        None => 0.0,
    }
}
