//! Metric registry and the cluster gauge set
//!
//! `MetricRegistry` wraps a prefixed Prometheus registry and hands out
//! collectors by name: asking twice for the same name returns the handle
//! registered the first time. `GaugeSet` is the fixed collection of cluster
//! gauges written by the aggregator and read by the exposition endpoint.
//!
//! Each labeled family is guarded by its own lock. An overwrite clears and
//! refills the family under the write lock while exposition collects it under
//! the read lock, so a reader never sees a partially replaced family.

use parking_lot::{Mutex, RwLock};
use prometheus::core::{Collector, Desc};
use prometheus::proto::MetricFamily;
use prometheus::{
    Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, IntCounterVec, Opts, Registry,
    TextEncoder,
};
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Prefix applied to every metric exposed by this process
pub const REGISTRY_PREFIX: &str = "k8s";

/// Label tuple -> value for one labeled family
pub type Series = BTreeMap<Vec<String>, f64>;

#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),

    #[error("metric {0} is already registered with a different type")]
    KindMismatch(String),

    #[error("unknown gauge {0}")]
    UnknownGauge(String),

    #[error("gauge {name} expects {expected} label values, got {actual}")]
    LabelArity {
        name: String,
        expected: usize,
        actual: usize,
    },

    #[error("exposition is not valid UTF-8: {0}")]
    Encoding(#[from] std::string::FromUtf8Error),
}

struct RegistryInner {
    registry: Registry,
    collectors: Mutex<HashMap<String, Box<dyn Any + Send + Sync>>>,
}

/// Process-wide metric registry, shared by cloning
#[derive(Clone)]
pub struct MetricRegistry {
    inner: Arc<RegistryInner>,
}

impl MetricRegistry {
    /// Create a registry whose metrics are exposed with the `k8s_` prefix
    pub fn new() -> Result<Self, MetricsError> {
        Self::with_prefix(REGISTRY_PREFIX)
    }

    pub fn with_prefix(prefix: &str) -> Result<Self, MetricsError> {
        let registry = Registry::new_custom(Some(prefix.to_string()), None)?;
        Ok(Self {
            inner: Arc::new(RegistryInner {
                registry,
                collectors: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Return the collector registered under `name`, building and registering
    /// it on first use
    pub fn get_or_register<C, F>(&self, name: &str, build: F) -> Result<C, MetricsError>
    where
        C: Collector + Clone + 'static,
        F: FnOnce() -> Result<C, prometheus::Error>,
    {
        let mut collectors = self.inner.collectors.lock();

        if let Some(existing) = collectors.get(name) {
            return existing
                .downcast_ref::<C>()
                .cloned()
                .ok_or_else(|| MetricsError::KindMismatch(name.to_string()));
        }

        let collector = build()?;
        self.inner.registry.register(Box::new(collector.clone()))?;
        collectors.insert(name.to_string(), Box::new(collector.clone()));
        Ok(collector)
    }

    pub fn gauge(&self, name: &str, help: &str) -> Result<Gauge, MetricsError> {
        self.get_or_register(name, || Gauge::with_opts(Opts::new(name, help)))
    }

    pub fn labeled_family(
        &self,
        name: &str,
        help: &str,
        labels: &[&str],
    ) -> Result<LabeledFamily, MetricsError> {
        self.get_or_register(name, || LabeledFamily::new(name, help, labels))
    }

    pub fn histogram(
        &self,
        name: &str,
        help: &str,
        buckets: &[f64],
    ) -> Result<Histogram, MetricsError> {
        self.get_or_register(name, || {
            Histogram::with_opts(HistogramOpts::new(name, help).buckets(buckets.to_vec()))
        })
    }

    pub fn counter_vec(
        &self,
        name: &str,
        help: &str,
        labels: &[&str],
    ) -> Result<IntCounterVec, MetricsError> {
        self.get_or_register(name, || IntCounterVec::new(Opts::new(name, help), labels))
    }

    pub fn gather(&self) -> Vec<MetricFamily> {
        self.inner.registry.gather()
    }

    /// Encode every registered metric in the Prometheus text format
    pub fn encode_text(&self) -> Result<String, MetricsError> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

/// Gauge family whose label tuples are replaced as a unit
#[derive(Clone)]
pub struct LabeledFamily {
    name: String,
    label_names: Arc<[String]>,
    vec: GaugeVec,
    lock: Arc<RwLock<()>>,
}

impl LabeledFamily {
    fn new(name: &str, help: &str, labels: &[&str]) -> Result<Self, prometheus::Error> {
        Ok(Self {
            name: name.to_string(),
            label_names: labels.iter().map(|l| l.to_string()).collect(),
            vec: GaugeVec::new(Opts::new(name, help), labels)?,
            lock: Arc::new(RwLock::new(())),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn label_names(&self) -> &[String] {
        &self.label_names
    }

    fn check_arity(&self, series: &Series) -> Result<(), MetricsError> {
        let expected = self.label_names.len();
        match series.keys().find(|labels| labels.len() != expected) {
            Some(labels) => Err(MetricsError::LabelArity {
                name: self.name.clone(),
                expected,
                actual: labels.len(),
            }),
            None => Ok(()),
        }
    }

    /// Drop every existing label tuple and set the given ones
    pub fn replace(&self, series: &Series) -> Result<(), MetricsError> {
        self.check_arity(series)?;

        let _guard = self.lock.write();
        self.vec.reset();
        for (labels, value) in series {
            let values: Vec<&str> = labels.iter().map(String::as_str).collect();
            self.vec.get_metric_with_label_values(&values)?.set(*value);
        }
        Ok(())
    }

    /// Current label tuples, in declared label order
    pub fn series(&self) -> Series {
        let families = self.collect();
        let mut series = Series::new();

        for metric in families.iter().flat_map(|mf| mf.get_metric()) {
            let pairs = metric.get_label();
            let labels = self
                .label_names
                .iter()
                .map(|name| {
                    pairs
                        .iter()
                        .find(|pair| pair.get_name() == name.as_str())
                        .map(|pair| pair.get_value().to_string())
                        .unwrap_or_default()
                })
                .collect();
            series.insert(labels, metric.get_gauge().get_value());
        }

        series
    }
}

impl Collector for LabeledFamily {
    fn desc(&self) -> Vec<&Desc> {
        self.vec.desc()
    }

    fn collect(&self) -> Vec<MetricFamily> {
        let _guard = self.lock.read();
        self.vec.collect()
    }
}

/// Gauge names, registered without the registry prefix
pub mod names {
    pub const NODES_TOTAL: &str = "nodes_total";
    pub const PODS_TOTAL: &str = "pods_total";
    pub const DEPLOYMENTS_TOTAL: &str = "deployments_total";
    pub const SERVICES_TOTAL: &str = "services_total";
    pub const NAMESPACES_TOTAL: &str = "namespaces_total";

    pub const NODE_STATUS_READY: &str = "node_status_ready";
    pub const NODE_CPU_ALLOCATABLE: &str = "node_cpu_allocatable_cores";
    pub const NODE_MEMORY_ALLOCATABLE: &str = "node_memory_allocatable_bytes";
    pub const POD_STATUS_PHASE: &str = "pod_status_phase";
    pub const CONTAINER_RESTARTS: &str = "container_restarts_total";
    pub const NAMESPACE_CPU_REQUESTS: &str = "namespace_cpu_requests_cores";
    pub const NAMESPACE_MEMORY_REQUESTS: &str = "namespace_memory_requests_bytes";
    pub const NAMESPACE_CPU_LIMITS: &str = "namespace_cpu_limits_cores";
    pub const NAMESPACE_MEMORY_LIMITS: &str = "namespace_memory_limits_bytes";
    pub const DEPLOYMENT_DESIRED: &str = "deployment_replicas_desired";
    pub const DEPLOYMENT_AVAILABLE: &str = "deployment_replicas_available";
}

const SCALARS: &[(&str, &str)] = &[
    (names::NODES_TOTAL, "Total number of nodes"),
    (names::PODS_TOTAL, "Total number of pods"),
    (names::DEPLOYMENTS_TOTAL, "Total number of deployments"),
    (names::SERVICES_TOTAL, "Total number of services"),
    (names::NAMESPACES_TOTAL, "Total number of namespaces"),
];

const FAMILIES: &[(&str, &str, &[&str])] = &[
    (names::NODE_STATUS_READY, "1 if the node is Ready, 0 otherwise", &["node"]),
    (names::NODE_CPU_ALLOCATABLE, "Allocatable CPU in cores", &["node"]),
    (names::NODE_MEMORY_ALLOCATABLE, "Allocatable memory in bytes", &["node"]),
    (names::POD_STATUS_PHASE, "Number of pods per namespace and phase", &["namespace", "phase"]),
    (
        names::CONTAINER_RESTARTS,
        "Container restart count reported by the control plane",
        &["namespace", "pod", "container"],
    ),
    (names::NAMESPACE_CPU_REQUESTS, "Sum of container CPU requests in cores", &["namespace"]),
    (names::NAMESPACE_MEMORY_REQUESTS, "Sum of container memory requests in bytes", &["namespace"]),
    (names::NAMESPACE_CPU_LIMITS, "Sum of container CPU limits in cores", &["namespace"]),
    (names::NAMESPACE_MEMORY_LIMITS, "Sum of container memory limits in bytes", &["namespace"]),
    (names::DEPLOYMENT_DESIRED, "Desired replicas", &["namespace", "deployment"]),
    (names::DEPLOYMENT_AVAILABLE, "Available replicas", &["namespace", "deployment"]),
];

/// Values to write into the gauge set
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GaugeUpdate {
    pub scalars: BTreeMap<String, f64>,
    pub families: BTreeMap<String, Series>,
}

impl GaugeUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scalar(mut self, name: &str, value: f64) -> Self {
        self.scalars.insert(name.to_string(), value);
        self
    }

    pub fn family(mut self, name: &str, series: Series) -> Self {
        self.families.insert(name.to_string(), series);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.scalars.is_empty() && self.families.is_empty()
    }
}

/// The fixed set of cluster gauges
#[derive(Clone)]
pub struct GaugeSet {
    scalars: Arc<BTreeMap<&'static str, Gauge>>,
    families: Arc<BTreeMap<&'static str, LabeledFamily>>,
}

impl GaugeSet {
    /// Register the cluster gauges, or pick up the ones already registered
    pub fn new(registry: &MetricRegistry) -> Result<Self, MetricsError> {
        let mut scalars = BTreeMap::new();
        for &(name, help) in SCALARS {
            scalars.insert(name, registry.gauge(name, help)?);
        }

        let mut families = BTreeMap::new();
        for &(name, help, labels) in FAMILIES {
            families.insert(name, registry.labeled_family(name, help, labels)?);
        }

        Ok(Self {
            scalars: Arc::new(scalars),
            families: Arc::new(families),
        })
    }

    /// Set every named scalar and replace every named family.
    ///
    /// Names and label arities are validated before anything is written.
    pub fn overwrite(&self, update: &GaugeUpdate) -> Result<(), MetricsError> {
        for name in update.scalars.keys() {
            self.scalar_gauge(name)?;
        }
        for (name, series) in &update.families {
            self.family_or_err(name)?.check_arity(series)?;
        }

        for (name, value) in &update.scalars {
            self.scalar_gauge(name)?.set(*value);
        }
        for (name, series) in &update.families {
            self.family_or_err(name)?.replace(series)?;
        }
        Ok(())
    }

    /// Current value of a scalar gauge
    pub fn scalar(&self, name: &str) -> Option<f64> {
        self.scalars.get(name).map(Gauge::get)
    }

    pub fn family(&self, name: &str) -> Option<&LabeledFamily> {
        self.families.get(name)
    }

    pub fn family_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.families.keys().copied()
    }

    fn scalar_gauge(&self, name: &str) -> Result<&Gauge, MetricsError> {
        self.scalars
            .get(name)
            .ok_or_else(|| MetricsError::UnknownGauge(name.to_string()))
    }

    fn family_or_err(&self, name: &str) -> Result<&LabeledFamily, MetricsError> {
        self.families
            .get(name)
            .ok_or_else(|| MetricsError::UnknownGauge(name.to_string()))
    }
}
