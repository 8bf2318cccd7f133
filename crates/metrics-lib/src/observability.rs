//! Observability infrastructure for the metrics API
//!
//! Provides:
//! - Prometheus self-metrics for the poll loop (duration, outcomes, listing failures)
//! - Structured JSON logging with tracing

use crate::cluster::ResourceKind;
use crate::gauges::{MetricRegistry, MetricsError};
use prometheus::{Histogram, IntCounterVec};
use std::time::Duration;
use tracing::{info, warn};

/// Histogram buckets for poll durations (in seconds)
const POLL_BUCKETS: &[f64] = &[0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 15.0];

pub const POLL_DURATION: &str = "metrics_api_poll_duration_seconds";
pub const POLLS_TOTAL: &str = "metrics_api_polls_total";
pub const LISTING_FAILURES_TOTAL: &str = "metrics_api_listing_failures_total";

/// Outcome label values for `polls_total`
pub mod outcome {
    pub const SUCCESS: &str = "success";
    pub const FAILURE: &str = "failure";
}

/// Self-metrics describing the poll loop.
///
/// Cloning shares the underlying collectors.
#[derive(Clone)]
pub struct PollMetrics {
    poll_duration_seconds: Histogram,
    polls_total: IntCounterVec,
    listing_failures_total: IntCounterVec,
}

impl PollMetrics {
    /// Register the poll metrics, or pick up the ones already registered
    pub fn new(registry: &MetricRegistry) -> Result<Self, MetricsError> {
        Ok(Self {
            poll_duration_seconds: registry.histogram(
                POLL_DURATION,
                "Time spent listing the cluster and refreshing gauges",
                POLL_BUCKETS,
            )?,
            polls_total: registry.counter_vec(
                POLLS_TOTAL,
                "Number of polls by outcome",
                &["outcome"],
            )?,
            listing_failures_total: registry.counter_vec(
                LISTING_FAILURES_TOTAL,
                "Number of failed listing calls by resource kind",
                &["resource"],
            )?,
        })
    }

    /// Record a finished poll
    pub fn observe_poll(&self, elapsed: Duration, success: bool) {
        self.poll_duration_seconds.observe(elapsed.as_secs_f64());
        let label = if success {
            outcome::SUCCESS
        } else {
            outcome::FAILURE
        };
        self.polls_total.with_label_values(&[label]).inc();
    }

    /// Record a failed listing call
    pub fn inc_listing_failure(&self, kind: ResourceKind) {
        self.listing_failures_total
            .with_label_values(&[kind.as_str()])
            .inc();
    }

    pub fn polls(&self, success: bool) -> u64 {
        let label = if success {
            outcome::SUCCESS
        } else {
            outcome::FAILURE
        };
        self.polls_total.with_label_values(&[label]).get()
    }

    pub fn listing_failures(&self, kind: ResourceKind) -> u64 {
        self.listing_failures_total
            .with_label_values(&[kind.as_str()])
            .get()
    }
}

/// Structured logger for service events
///
/// Provides consistent JSON-formatted logging for polls, listing
/// failures and lifecycle events.
#[derive(Clone)]
pub struct StructuredLogger {
    instance: String,
}

impl StructuredLogger {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
        }
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// Log service startup
    pub fn log_startup(&self, version: &str, port: u16) {
        info!(
            event = "service_started",
            instance = %self.instance,
            version = %version,
            port = port,
            "Cluster metrics API started"
        );
    }

    /// Log service shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "service_shutdown",
            instance = %self.instance,
            reason = %reason,
            "Cluster metrics API shutting down"
        );
    }

    /// Log a completed poll
    pub fn log_poll_completed(
        &self,
        nodes: usize,
        pods: usize,
        namespaces: usize,
        deployments: usize,
        services: usize,
        elapsed: Duration,
    ) {
        info!(
            event = "poll_completed",
            instance = %self.instance,
            nodes = nodes,
            pods = pods,
            namespaces = namespaces,
            deployments = deployments,
            services = services,
            duration_ms = elapsed.as_millis() as u64,
            "Cluster poll completed"
        );
    }

    /// Log a failed listing call
    pub fn log_listing_failed(&self, kind: ResourceKind, error: &str) {
        warn!(
            event = "listing_failed",
            instance = %self.instance,
            resource = %kind,
            error = %error,
            "Failed to list cluster resources"
        );
    }

    /// Log a resource quantity that could not be parsed
    pub fn log_unparsable_quantity(&self, object: &str, resource: &str, error: &str) {
        warn!(
            event = "quantity_unparsable",
            instance = %self.instance,
            object = %object,
            resource = %resource,
            error = %error,
            "Ignoring unparsable resource quantity"
        );
    }

    /// Log a deployment whose spec omits the replica count
    pub fn log_missing_replicas(&self, namespace: &str, deployment: &str) {
        warn!(
            event = "replicas_missing",
            instance = %self.instance,
            namespace = %namespace,
            deployment = %deployment,
            "Deployment has no spec.replicas, reporting 0 desired"
        );
    }
}
