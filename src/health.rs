//! Subsystem health and readiness.

use serde::Serialize;

use crate::cache::MetricsSnapshot;

/// Overall subsystem status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Both tiers reachable, upstreams healthy
    Healthy,
    /// Serving, but local-only or during an upstream cascade
    Degraded,
    /// Shut down; not serving
    Unhealthy,
}

impl HealthStatus {
    /// Degraded still serves traffic
    pub fn is_ready(&self) -> bool {
        !matches!(self, HealthStatus::Unhealthy)
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Point-in-time readiness report, served on `/readyz`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: HealthStatus,
    pub shared_tier_reachable: bool,
    pub cascading_failure: bool,
    pub shut_down: bool,
    pub pending_deletes: usize,
    pub warming_queue_depth: usize,
    pub revalidations_in_flight: usize,
    pub local_entries: usize,
    /// Local tier bytes over its budget
    pub local_utilization: f64,
    pub refreshes_running: usize,
    pub metrics: MetricsSnapshot,
}

/// Inputs gathered from the running components
#[derive(Debug, Clone, Default)]
pub struct HealthInputs {
    pub shared_tier_reachable: bool,
    pub cascading_failure: bool,
    pub shut_down: bool,
    pub pending_deletes: usize,
    pub warming_queue_depth: usize,
    pub revalidations_in_flight: usize,
    pub local_entries: usize,
    pub local_utilization: f64,
    pub refreshes_running: usize,
}

impl HealthReport {
    pub fn evaluate(inputs: HealthInputs, metrics: MetricsSnapshot) -> Self {
        let status = if inputs.shut_down {
            HealthStatus::Unhealthy
        } else if !inputs.shared_tier_reachable || inputs.cascading_failure {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        Self {
            status,
            shared_tier_reachable: inputs.shared_tier_reachable,
            cascading_failure: inputs.cascading_failure,
            shut_down: inputs.shut_down,
            pending_deletes: inputs.pending_deletes,
            warming_queue_depth: inputs.warming_queue_depth,
            revalidations_in_flight: inputs.revalidations_in_flight,
            local_entries: inputs.local_entries,
            local_utilization: inputs.local_utilization,
            refreshes_running: inputs.refreshes_running,
            metrics,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.status.is_ready()
    }
}

// =============================================================================
// Tests
// =============================================================================
