//! The worker record — one executing replica of an endpoint

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::spec::Resources;

/// The lifecycle a worker moves through
///
/// `OFFLINE` is terminal. Only `Starting`/`Running` are eligible for task
/// dispatch; a worker record is the sole authority for that predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Lifecycle {
    Starting,
    Running,
    Draining,
    Offline,
}

impl Lifecycle {
    /// Whether a worker in this lifecycle state may be picked for new work
    #[must_use]
    pub fn dispatchable(self) -> bool {
        matches!(self, Lifecycle::Starting | Lifecycle::Running)
    }

    /// The ordering used to prevent downgrading a lifecycle on reconcile:
    /// higher rank must never be overwritten by a lower one except via an
    /// explicit drain/offline transition.
    fn rank(self) -> u8 {
        match self {
            Lifecycle::Starting => 0,
            Lifecycle::Running => 1,
            Lifecycle::Draining => 2,
            Lifecycle::Offline => 3,
        }
    }

    /// Whether transitioning from `self` to `next` is a downgrade that the
    /// reconciler must refuse to apply from a mere status observation
    #[must_use]
    pub fn would_downgrade(self, next: Lifecycle) -> bool {
        next.rank() < self.rank()
    }
}

/// The portable failure taxonomy classification maps back-end signals to
///
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureType {
    ImagePull,
    ContainerCrash,
    ResourceLimit,
    Timeout,
    Unknown,
}

impl FailureType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureType::ImagePull => "ImagePull",
            FailureType::ContainerCrash => "ContainerCrash",
            FailureType::ResourceLimit => "ResourceLimit",
            FailureType::Timeout => "Timeout",
            FailureType::Unknown => "Unknown",
        }
    }
}

/// A classified, sanitized failure attached to a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub failure_type: FailureType,
    pub raw_reason: String,
    pub raw_message: String,
    pub sanitized_message: String,
    pub occurred_at: DateTime<Utc>,
}

/// One executing replica of an endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worker {
    /// The back-end's own pod/worker identifier; globally unique
    pub id: String,
    /// The endpoint this worker belongs to
    pub endpoint: String,
    /// The back-end-native phase string (e.g. "Running", "Pending")
    pub phase: String,
    /// A free-form status string from the back-end
    pub status: String,
    /// A short machine-oriented reason, if the back-end provided one
    pub reason: Option<String>,
    /// A longer human-oriented message, if the back-end provided one
    pub message: Option<String>,
    /// The worker's assigned IP, once known
    pub ip: Option<String>,
    /// The node this worker landed on, for back-ends that expose this
    pub node: Option<String>,
    /// When the back-end created this pod. Write-once: never overwritten
    /// by a later observation.
    pub pod_created_at: Option<DateTime<Utc>>,
    /// When the back-end started this pod's container. Write-once.
    pub pod_started_at: Option<DateTime<Utc>>,
    /// The jobs currently claimed by this worker
    pub jobs_in_progress: HashSet<String>,
    /// `jobs_in_progress.len()`, denormalized for cheap reads
    pub current_jobs: u32,
    /// The resources this worker consumes
    pub resources: Resources,
    /// The last classified failure, if any; cleared on a healthy transition
    pub failure: Option<FailureRecord>,
    /// This worker's lifecycle state
    pub lifecycle: Lifecycle,
    /// When this record was first created
    pub first_seen_at: DateTime<Utc>,
    /// When this record was last updated by any observation
    pub last_seen_at: DateTime<Utc>,
}

impl Worker {
    /// Build a brand-new worker record from a first observation
    pub fn new_starting(id: impl Into<String>, endpoint: impl Into<String>, now: DateTime<Utc>) -> Self {
        Worker {
            id: id.into(),
            endpoint: endpoint.into(),
            phase: String::new(),
            status: String::new(),
            reason: None,
            message: None,
            ip: None,
            node: None,
            pod_created_at: None,
            pod_started_at: None,
            jobs_in_progress: HashSet::new(),
            current_jobs: 0,
            resources: Resources::default(),
            failure: None,
            lifecycle: Lifecycle::Starting,
            first_seen_at: now,
            last_seen_at: now,
        }
    }

    /// Whether this worker is eligible to be picked for new work — the
    /// worker record is the sole authority for this predicate
    #[must_use]
    pub fn dispatchable(&self) -> bool {
        self.lifecycle.dispatchable()
    }
}
