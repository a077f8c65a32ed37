//! The endpoint — the unit of deployment

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The canonical status a [`crate::libs::providers::DeploymentProvider`]
/// derives for an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppStatus {
    Running,
    Stopped,
    Pending,
    Creating,
    Updating,
    Terminating,
    Failed,
    Unknown,
}

impl AppStatus {
    /// Map a back-end-native status string to the canonical status, via a
    /// fixed mapping table
    #[must_use]
    pub fn from_backend_str(raw: &str) -> AppStatus {
        match raw.to_ascii_lowercase().as_str() {
            "serving" | "running" => AppStatus::Running,
            "stopped" => AppStatus::Stopped,
            "failed" => AppStatus::Failed,
            "pending" => AppStatus::Pending,
            "creating" => AppStatus::Creating,
            "updating" => AppStatus::Updating,
            "deleting" => AppStatus::Terminating,
            _ => AppStatus::Unknown,
        }
    }

    /// Derive status from replica counts directly:
    /// Running iff available == desired > 0; Stopped iff desired == 0.
    #[must_use]
    pub fn from_replicas(desired: u32, available: u32) -> Option<AppStatus> {
        if desired == 0 {
            Some(AppStatus::Stopped)
        } else if available == desired {
            Some(AppStatus::Running)
        } else {
            None
        }
    }
}

/// The scaling policy attached to an autoscaling-enabled endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoscalingPolicy {
    pub min_replicas: u32,
    pub max_replicas: u32,
    /// Pending-task threshold that triggers a scale-up proposal
    pub scale_up_threshold: u32,
    /// How many consecutive seconds of zero pending + all-idle workers
    /// before a scale-down is proposed
    pub scale_down_idle_time: u64,
    pub scale_up_cooldown: u64,
    pub scale_down_cooldown: u64,
    /// Base priority used to order endpoints competing for admission
    pub base_priority: i32,
    /// Whether dynamic priority boosting under high load is enabled
    pub dynamic_priority: bool,
    /// Pending count above which the dynamic priority boost applies
    pub high_load_threshold: u32,
    /// Added to `base_priority` when `pending >= high_load_threshold`
    pub priority_boost: i32,
    /// How long a denied scale-up may go unfulfilled before this endpoint
    /// is promoted to the head of the queue
    pub starvation_time: u64,
    /// How many replicas to add per scale-up step
    pub scale_step: u32,
}

impl Default for AutoscalingPolicy {
    fn default() -> Self {
        AutoscalingPolicy {
            min_replicas: 0,
            max_replicas: 1,
            scale_up_threshold: 1,
            scale_down_idle_time: 300,
            scale_up_cooldown: 30,
            scale_down_cooldown: 60,
            base_priority: 0,
            dynamic_priority: false,
            high_load_threshold: u32::MAX,
            priority_boost: 0,
            starvation_time: 120,
            scale_step: 1,
        }
    }
}

/// The observed runtime state of an endpoint's back-end deployment
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeState {
    pub observed_replicas: u32,
    pub ready_replicas: u32,
    pub available_replicas: u32,
    pub last_status: Option<AppStatus>,
    /// Failed workers / total workers, refreshed by the resource releaser
    pub health_ratio: f32,
}

/// An endpoint: the unit of deployment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Unique, stable identifier
    pub name: String,
    /// The resource profile this endpoint's workers run under
    pub spec_name: String,
    /// The back-end/cluster this endpoint is deployed to
    pub backend: String,
    pub image: String,
    /// Desired replica count for a fixed-size endpoint, or None for an
    /// autoscaling endpoint (which instead carries min/max in `autoscaling`)
    pub desired_replicas: Option<u32>,
    pub autoscaling: Option<AutoscalingPolicy>,
    pub task_timeout: u64,
    pub env: HashMap<String, String>,
    pub mounts: Vec<String>,
    pub runtime: RuntimeState,
    pub created_at: DateTime<Utc>,
}

impl Endpoint {
    /// Whether this endpoint is under autoscaler control
    #[must_use]
    pub fn is_autoscaling(&self) -> bool {
        self.autoscaling.is_some()
    }

    /// The replica count the endpoint is currently configured for, for
    /// either a fixed-size or autoscaling endpoint
    #[must_use]
    pub fn current_replicas(&self) -> u32 {
        self.desired_replicas.unwrap_or(self.runtime.observed_replicas)
    }
}

/// The canonicalised view returned by [`Deploy`]/[`Get`]/[`List`]
///
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppInfo {
    pub name: String,
    pub backend: String,
    pub status: AppStatus,
    pub replicas: u32,
    pub ready_replicas: u32,
    pub available_replicas: u32,
    pub image: String,
    pub labels: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub mounts: Option<Vec<String>>,
}
