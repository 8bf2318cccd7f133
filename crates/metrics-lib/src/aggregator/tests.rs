//! Aggregator tests
//!
//! These drive the aggregator against the in-memory cluster reader and
//! inspect both the returned snapshot and the resident gauge values.

use super::*;
use crate::cluster::{
    resource_list, ClusterInventory, ConditionRecord, ContainerRecord, ContainerStatusRecord,
    InMemoryClusterReader, NamespaceRecord, ServiceRecord,
};
use crate::gauges::MetricRegistry;
use proptest::prelude::*;

const BUDGET: Duration = Duration::from_secs(5);

fn condition(kind: &str, status: &str) -> ConditionRecord {
    ConditionRecord {
        kind: kind.to_string(),
        status: status.to_string(),
    }
}

fn node(name: &str, conditions: Vec<ConditionRecord>, cpu: &str, memory: &str) -> NodeRecord {
    NodeRecord {
        name: name.to_string(),
        conditions,
        allocatable: resource_list([(CPU, cpu), (MEMORY, memory)]),
    }
}

fn container(name: &str, requests: &[(&str, &str)], limits: &[(&str, &str)]) -> ContainerRecord {
    ContainerRecord {
        name: name.to_string(),
        requests: resource_list(requests.iter().copied()),
        limits: resource_list(limits.iter().copied()),
    }
}

fn pod(namespace: &str, name: &str, phase: &str, containers: Vec<ContainerRecord>) -> PodRecord {
    PodRecord {
        namespace: namespace.to_string(),
        name: name.to_string(),
        phase: phase.to_string(),
        containers,
        container_statuses: Vec::new(),
    }
}

fn deployment(namespace: &str, name: &str, desired: Option<i32>, available: i32) -> DeploymentRecord {
    DeploymentRecord {
        namespace: namespace.to_string(),
        name: name.to_string(),
        spec_replicas: desired,
        available_replicas: available,
    }
}

fn small_cluster() -> ClusterInventory {
    ClusterInventory {
        nodes: vec![node("node-1", vec![condition("Ready", "True")], "2", "4Gi")],
        pods: vec![pod(
            "default",
            "web-0",
            "Running",
            vec![container("app", &[("cpu", "500m"), ("memory", "512Mi")], &[])],
        )],
        namespaces: vec![NamespaceRecord {
            name: "default".to_string(),
        }],
        deployments: Vec::new(),
        services: vec![ServiceRecord {
            namespace: "default".to_string(),
            name: "web".to_string(),
        }],
    }
}

struct Harness {
    reader: Arc<InMemoryClusterReader>,
    registry: MetricRegistry,
    aggregator: Aggregator,
}

impl Harness {
    fn new(inventory: ClusterInventory) -> Self {
        let reader = Arc::new(InMemoryClusterReader::new(inventory));
        let registry = MetricRegistry::new().unwrap();
        let aggregator = Aggregator::new(
            reader.clone(),
            GaugeSet::new(&registry).unwrap(),
            PollMetrics::new(&registry).unwrap(),
            StructuredLogger::new("test"),
        );
        Self {
            reader,
            registry,
            aggregator,
        }
    }

    fn scalar(&self, name: &str) -> f64 {
        self.aggregator.gauges().scalar(name).unwrap()
    }

    fn family(&self, name: &str) -> Series {
        self.aggregator.gauges().family(name).unwrap().series()
    }
}

fn key(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

fn logger() -> StructuredLogger {
    StructuredLogger::new("test")
}

#[tokio::test]
async fn test_small_cluster_end_to_end() {
    let harness = Harness::new(small_cluster());

    let snapshot = harness.aggregator.collect(BUDGET).await.unwrap();

    assert_eq!(snapshot.node_count, 1);
    assert_eq!(snapshot.pod_count, 1);
    assert_eq!(snapshot.deployment_count, 0);
    assert_eq!(snapshot.service_count, 1);
    assert_eq!(snapshot.namespace_count, 1);
    assert_eq!(
        snapshot.pod_phases,
        BTreeMap::from([("Running".to_string(), 1)])
    );

    assert_eq!(harness.scalar(names::NODES_TOTAL), 1.0);
    assert_eq!(harness.scalar(names::SERVICES_TOTAL), 1.0);
    assert_eq!(
        harness.family(names::NODE_STATUS_READY),
        Series::from([(key(&["node-1"]), 1.0)])
    );
    assert_eq!(
        harness.family(names::NODE_CPU_ALLOCATABLE),
        Series::from([(key(&["node-1"]), 2.0)])
    );
    assert_eq!(
        harness.family(names::NODE_MEMORY_ALLOCATABLE),
        Series::from([(key(&["node-1"]), 4_294_967_296.0)])
    );
    assert_eq!(
        harness.family(names::NAMESPACE_CPU_REQUESTS),
        Series::from([(key(&["default"]), 0.5)])
    );
    assert_eq!(
        harness.family(names::NAMESPACE_MEMORY_REQUESTS),
        Series::from([(key(&["default"]), 536_870_912.0)])
    );
    assert_eq!(
        harness.family(names::NAMESPACE_CPU_LIMITS),
        Series::from([(key(&["default"]), 0.0)])
    );
    assert_eq!(
        harness.family(names::POD_STATUS_PHASE),
        Series::from([(key(&["default", "Running"]), 1.0)])
    );
}

#[tokio::test]
async fn test_empty_cluster() {
    let harness = Harness::new(ClusterInventory::default());

    let snapshot = harness.aggregator.collect(BUDGET).await.unwrap();

    assert_eq!(snapshot.node_count, 0);
    assert_eq!(snapshot.pod_count, 0);
    assert_eq!(snapshot.deployment_count, 0);
    assert_eq!(snapshot.service_count, 0);
    assert_eq!(snapshot.namespace_count, 0);
    assert!(snapshot.pod_phases.is_empty());

    for name in harness.aggregator.gauges().family_names() {
        assert!(harness.family(name).is_empty(), "{name} has series");
    }
}

#[tokio::test]
async fn test_listings_run_in_order_once_each() {
    let harness = Harness::new(small_cluster());

    harness.aggregator.collect(BUDGET).await.unwrap();

    for kind in ResourceKind::ALL {
        assert_eq!(harness.reader.call_count(kind), 1, "{kind}");
    }
}

#[test]
fn test_readiness_ignores_condition_order() {
    let ready_last = node(
        "a",
        vec![
            condition("MemoryPressure", "False"),
            condition("DiskPressure", "False"),
            condition("Ready", "True"),
        ],
        "1",
        "1Gi",
    );
    let ready_first = node(
        "b",
        vec![condition("Ready", "True"), condition("PIDPressure", "True")],
        "1",
        "1Gi",
    );

    assert!(is_ready(&ready_last));
    assert!(is_ready(&ready_first));
}

#[test]
fn test_readiness_requires_ready_true() {
    let no_ready = node("a", vec![condition("MemoryPressure", "True")], "1", "1Gi");
    let not_true = node("b", vec![condition("Ready", "Unknown")], "1", "1Gi");
    let no_conditions = node("c", Vec::new(), "1", "1Gi");

    assert!(!is_ready(&no_ready));
    assert!(!is_ready(&not_true));
    assert!(!is_ready(&no_conditions));
}

#[test]
fn test_first_ready_condition_wins() {
    let first_false = node(
        "a",
        vec![condition("Ready", "False"), condition("Ready", "True")],
        "1",
        "1Gi",
    );

    assert!(!is_ready(&first_false));
}

#[tokio::test]
async fn test_repeated_polls_are_idempotent() {
    let mut inventory = small_cluster();
    inventory.deployments = vec![deployment("default", "web", Some(2), 2)];
    let harness = Harness::new(inventory);

    let first = harness.aggregator.collect(BUDGET).await.unwrap();
    let families_after_first: Vec<Series> = harness
        .aggregator
        .gauges()
        .family_names()
        .map(|name| harness.family(name))
        .collect();

    let second = harness.aggregator.collect(BUDGET).await.unwrap();
    let families_after_second: Vec<Series> = harness
        .aggregator
        .gauges()
        .family_names()
        .map(|name| harness.family(name))
        .collect();

    assert_eq!(
        ClusterSnapshot {
            timestamp: second.timestamp,
            ..first
        },
        second
    );
    assert_eq!(families_after_first, families_after_second);
}

#[tokio::test]
async fn test_vanished_namespace_is_pruned() {
    let mut inventory = small_cluster();
    inventory.pods.push(pod("batch", "job-1", "Pending", Vec::new()));
    let harness = Harness::new(inventory);

    harness.aggregator.collect(BUDGET).await.unwrap();
    assert!(harness
        .family(names::POD_STATUS_PHASE)
        .contains_key(&key(&["batch", "Pending"])));

    harness.reader.set_inventory(small_cluster());
    harness.aggregator.collect(BUDGET).await.unwrap();

    let phases = harness.family(names::POD_STATUS_PHASE);
    assert!(phases.keys().all(|labels| labels[0] != "batch"));
    assert!(!harness
        .family(names::NAMESPACE_CPU_REQUESTS)
        .contains_key(&key(&["batch"])));
}

#[tokio::test]
async fn test_deployments_failure_keeps_earlier_gauges() {
    let harness = Harness::new(small_cluster());
    harness
        .aggregator
        .gauges()
        .overwrite(&GaugeUpdate::new().scalar(names::DEPLOYMENTS_TOTAL, 7.0))
        .unwrap();
    harness
        .reader
        .fail(ResourceKind::Deployments, "connection reset");

    let err = harness.aggregator.collect(BUDGET).await.unwrap_err();

    assert_eq!(err.kind(), Some(ResourceKind::Deployments));
    assert!(err.to_string().contains("deployments"));
    assert_eq!(harness.scalar(names::NODES_TOTAL), 1.0);
    assert_eq!(harness.scalar(names::PODS_TOTAL), 1.0);
    assert_eq!(harness.scalar(names::NAMESPACES_TOTAL), 1.0);
    assert_eq!(harness.scalar(names::DEPLOYMENTS_TOTAL), 7.0);
    assert_eq!(harness.reader.call_count(ResourceKind::Services), 0);

    let metrics = harness.aggregator.poll_metrics();
    assert_eq!(metrics.polls(false), 1);
    assert_eq!(metrics.listing_failures(ResourceKind::Deployments), 1);
}

#[tokio::test]
async fn test_first_failure_aborts_remaining_listings() {
    let harness = Harness::new(small_cluster());
    harness.reader.fail(ResourceKind::Nodes, "forbidden");

    let err = harness.aggregator.collect(BUDGET).await.unwrap_err();

    assert_eq!(err.kind(), Some(ResourceKind::Nodes));
    assert_eq!(err.to_string(), "failed to list nodes: forbidden");
    assert_eq!(harness.reader.total_calls(), 1);
    assert_eq!(harness.scalar(names::NODES_TOTAL), 0.0);
}

#[tokio::test]
async fn test_budget_expiry_is_a_listing_failure() {
    let harness = Harness::new(small_cluster());
    harness.reader.set_latency(Duration::from_millis(200));

    let err = harness
        .aggregator
        .collect(Duration::from_millis(20))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        CollectError::Listing {
            kind: ResourceKind::Nodes,
            source: ListError::Timeout(_),
        }
    ));
    assert_eq!(harness.reader.call_count(ResourceKind::Pods), 0);
}

#[tokio::test]
async fn test_unrepresentable_budget_polls_without_deadline() {
    let harness = Harness::new(small_cluster());

    let snapshot = harness
        .aggregator
        .collect(Duration::from_secs(u64::MAX))
        .await
        .unwrap();

    assert_eq!(snapshot.node_count, 1);
    assert_eq!(harness.reader.total_calls(), 5);
}

#[tokio::test]
async fn test_successful_poll_is_counted() {
    let harness = Harness::new(small_cluster());

    harness.aggregator.collect(BUDGET).await.unwrap();

    assert_eq!(harness.aggregator.poll_metrics().polls(true), 1);
    let text = harness.registry.encode_text().unwrap();
    assert!(text.contains("k8s_metrics_api_poll_duration_seconds_count 1"));
}

#[tokio::test]
async fn test_missing_desired_replicas_reads_as_zero() {
    let mut inventory = small_cluster();
    inventory.deployments = vec![
        deployment("default", "api", None, 1),
        deployment("default", "web", Some(3), 2),
    ];
    let harness = Harness::new(inventory);

    let snapshot = harness.aggregator.collect(BUDGET).await.unwrap();

    assert_eq!(snapshot.deployment_count, 2);
    assert_eq!(
        harness.family(names::DEPLOYMENT_DESIRED),
        Series::from([
            (key(&["default", "api"]), 0.0),
            (key(&["default", "web"]), 3.0),
        ])
    );
    assert_eq!(
        harness.family(names::DEPLOYMENT_AVAILABLE),
        Series::from([
            (key(&["default", "api"]), 1.0),
            (key(&["default", "web"]), 2.0),
        ])
    );
}

#[tokio::test]
async fn test_restart_counts_are_last_write() {
    let mut inventory = small_cluster();
    inventory.pods[0].container_statuses = vec![ContainerStatusRecord {
        name: "app".to_string(),
        restart_count: 4,
    }];
    let harness = Harness::new(inventory);

    harness.aggregator.collect(BUDGET).await.unwrap();
    harness.aggregator.collect(BUDGET).await.unwrap();

    assert_eq!(
        harness.family(names::CONTAINER_RESTARTS),
        Series::from([(key(&["default", "web-0", "app"]), 4.0)])
    );
}

#[test]
fn test_requests_and_limits_sum_per_namespace() {
    let pods = vec![
        pod(
            "default",
            "a",
            "Running",
            vec![
                container("one", &[("cpu", "250m"), ("memory", "128Mi")], &[("cpu", "1")]),
                container("two", &[("cpu", "250m")], &[("memory", "1Gi")]),
            ],
        ),
        pod(
            "default",
            "b",
            "Running",
            vec![container("one", &[("cpu", "1500m")], &[])],
        ),
        pod("kube-system", "c", "Running", Vec::new()),
    ];

    let fold = fold_pods(&pods, &logger());

    let default = &fold.namespaces["default"];
    assert_eq!(default.cpu_requests_cores, 2.0);
    assert_eq!(default.memory_requests_bytes, 134_217_728.0);
    assert_eq!(default.cpu_limits_cores, 1.0);
    assert_eq!(default.memory_limits_bytes, 1_073_741_824.0);
    assert_eq!(fold.namespaces["kube-system"], NamespaceAggregate::default());
}

#[test]
fn test_unparsable_quantity_contributes_zero() {
    let pods = vec![pod(
        "default",
        "a",
        "Running",
        vec![
            container("bad", &[("cpu", "lots")], &[]),
            container("good", &[("cpu", "100m")], &[]),
        ],
    )];

    let fold = fold_pods(&pods, &logger());

    assert_eq!(fold.namespaces["default"].cpu_requests_cores, 0.1);
}

#[test]
fn test_pod_phases_accept_any_string() {
    let pods = vec![
        pod("a", "1", "Running", Vec::new()),
        pod("a", "2", "Evicted", Vec::new()),
        pod("b", "3", "Running", Vec::new()),
    ];

    let fold = fold_pods(&pods, &logger());

    assert_eq!(fold.phases["Running"], 2);
    assert_eq!(fold.phases["Evicted"], 1);
    assert_eq!(fold.namespace_phases[&("a".to_string(), "Running".to_string())], 1);
    assert_eq!(fold.namespace_phases[&("b".to_string(), "Running".to_string())], 1);
}

fn arb_pod() -> impl Strategy<Value = PodRecord> {
    let phase = prop_oneof![
        Just("Pending".to_string()),
        Just("Running".to_string()),
        Just("Succeeded".to_string()),
        Just("Failed".to_string()),
        Just("Unknown".to_string()),
        "[A-Za-z]{1,12}",
    ];
    ("[a-z]{1,6}", "[a-z0-9-]{1,10}", phase)
        .prop_map(|(namespace, name, phase)| pod(&namespace, &name, &phase, Vec::new()))
}

proptest! {
    #[test]
    fn prop_phase_tally_sums_to_pod_count(pods in prop::collection::vec(arb_pod(), 0..64)) {
        let fold = fold_pods(&pods, &logger());

        prop_assert_eq!(fold.phases.values().sum::<usize>(), pods.len());
        prop_assert_eq!(fold.namespace_phases.values().sum::<usize>(), pods.len());
        prop_assert_eq!(fold.pod_count, pods.len());
    }

    #[test]
    fn prop_namespace_aggregate_per_pod_namespace(pods in prop::collection::vec(arb_pod(), 0..32)) {
        let fold = fold_pods(&pods, &logger());
        let seen: std::collections::BTreeSet<&str> =
            pods.iter().map(|p| p.namespace.as_str()).collect();

        prop_assert_eq!(
            fold.namespaces.keys().map(String::as_str).collect::<std::collections::BTreeSet<_>>(),
            seen
        );
    }
}
