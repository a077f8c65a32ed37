//! The events the Event Ingestor fans in from back-ends

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A raw observation of a worker's status, as reported by a back-end,
/// before the reconciler has parsed/merged it into a [`crate::models::Worker`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerObservation {
    pub worker_id: String,
    pub endpoint: String,
    pub phase: String,
    pub status: String,
    pub reason: Option<String>,
    pub message: Option<String>,
    pub ip: Option<String>,
    pub node: Option<String>,
    pub healthy: bool,
    pub created_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
}

/// Ingestor event stream payloads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IngestEvent {
    /// Emitted on creation, phase/status/reason/message change, IP
    /// assignment, or timestamp acquisition
    WorkerStatusChange(WorkerObservation),
    /// Emitted when the back-end tombstones the worker
    WorkerDelete { worker_id: String, endpoint: String },
    /// Emitted when any of desired/ready/available/conditions change
    ReplicaChange {
        endpoint: String,
        desired: u32,
        ready: u32,
        available: u32,
        conditions: Vec<String>,
    },
    /// Emitted when the back-end's desired configuration changes; used
    /// only for the rolling-update deletion-cost optimization
    DeploymentSpecChange { endpoint: String },
    /// Optional: emitted when preemption is imminent for a worker
    SpotInterruption {
        worker_id: String,
        endpoint: String,
        reason: String,
    },
}

impl IngestEvent {
    /// The dispatch subject this event must be serialized against: a
    /// worker id for worker-scoped events, an endpoint name otherwise
    ///
    #[must_use]
    pub fn subject(&self) -> &str {
        match self {
            IngestEvent::WorkerStatusChange(obs) => &obs.worker_id,
            IngestEvent::WorkerDelete { worker_id, .. } => worker_id,
            IngestEvent::ReplicaChange { endpoint, .. } => endpoint,
            IngestEvent::DeploymentSpecChange { endpoint } => endpoint,
            IngestEvent::SpotInterruption { worker_id, .. } => worker_id,
        }
    }
}

/// A lifecycle event emitted by the reconciler/drain coordinator, useful
/// for observability and for tests asserting on side effects
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleEvent {
    WorkerStarted { worker_id: String, endpoint: String },
    WorkerOffline { worker_id: String, endpoint: String },
    WorkerDraining { worker_id: String, endpoint: String },
}
