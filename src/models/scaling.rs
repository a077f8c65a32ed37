//! Persisted records of autoscaler decisions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Why the autoscaler changed (or refused to change) an endpoint's replicas
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScalingReason {
    ScaleUp,
    ScaleDown,
    NoChange,
    CapacityDenied,
    Starvation,
}

/// A row recording a single autoscaler decision for an endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingEvent {
    pub endpoint: String,
    pub at: DateTime<Utc>,
    pub from: u32,
    pub to: u32,
    pub reason: ScalingReason,
}
