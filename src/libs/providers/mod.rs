//! The deployment back-end abstraction
//!
//! Modeled as a capability set behind one trait, the same shape as the
//! teacher's `Scheduler` trait (`scaler/src/libs/schedulers.rs`): a
//! `HashMap<String, Box<dyn DeploymentProvider>>` keyed by back-end/cluster
//! name lets multiple clusters or provider accounts coexist side by side.
//! Optional capabilities (logs, pod yaml, describe, pvc listing, exec)
//! default to [`ErrorKind::Unsupported`] so a back-end only needs to
//! override what it actually implements.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind};
use crate::models::{AppInfo, AppStatus};

use super::cancellation::CancellationToken;

pub mod k8s;
pub mod remote;
pub mod stub;

pub use k8s::K8sProvider;
pub use remote::{HttpRemoteClient, RemoteProvider};
pub use stub::StubProvider;

/// Everything needed to create a new endpoint on a back-end
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployRequest {
    pub endpoint: String,
    pub spec_name: String,
    pub image: String,
    pub replicas: u32,
    pub env: HashMap<String, String>,
    pub task_timeout: u64,
    pub mounts: Vec<String>,
}

/// A partial update to an endpoint's desired configuration. `None` fields
/// are left unchanged; back-ends whose update API is total rather than
/// partial must read-modify-write around the unset fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdatePatch {
    pub image: Option<String>,
    pub env: Option<HashMap<String, String>>,
    pub min_replicas: Option<u32>,
    pub max_replicas: Option<u32>,
    pub mounts: Option<Vec<String>>,
}

/// A raw worker-status observation pushed by a watch/poll adapter, before
/// the Event Ingestor wraps it as an [`crate::models::IngestEvent`]
pub use crate::models::WorkerObservation;

/// Raw payload for a replica-change watch tick
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicaDelta {
    pub endpoint: String,
    pub desired: u32,
    pub ready: u32,
    pub available: u32,
    pub conditions: Vec<String>,
}

/// Pod counts for one spec, as reported directly by the back-end
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PodCounts {
    pub running: u32,
    pub pending: u32,
}

/// A capability set for one deployment back-end
///
/// Every `Watch*` method spawns its own background task against `cancel`
/// and returns immediately once the subscription is registered; delivery
/// to `sink` is asynchronous.
#[async_trait]
pub trait DeploymentProvider: Send + Sync {
    /// A short name for this back-end, used in logs and provider routing
    fn name(&self) -> &str;

    async fn deploy(&self, req: DeployRequest) -> Result<(), Error>;
    async fn get(&self, endpoint: &str) -> Result<AppInfo, Error>;
    async fn list(&self) -> Result<Vec<AppInfo>, Error>;

    /// Idempotent: `NotFound` on a repeated delete is not an error
    async fn delete(&self, endpoint: &str) -> Result<(), Error>;

    /// Sets min=max=replicas; autoscaling endpoints should call
    /// [`DeploymentProvider::update`] with explicit bounds instead
    async fn scale(&self, endpoint: &str, replicas: u32) -> Result<(), Error>;

    async fn update(&self, endpoint: &str, patch: UpdatePatch) -> Result<(), Error>;

    /// Derived status, from the fixed replica-count mapping table
    async fn get_status(&self, endpoint: &str) -> Result<AppStatus, Error>;

    async fn list_specs(&self) -> Result<Vec<crate::models::Spec>, Error>;
    async fn get_spec(&self, name: &str) -> Result<Option<crate::models::Spec>, Error>;

    /// A dry-run preview of what `deploy`/`update` would materialize,
    /// without mutating the back-end
    async fn preview(&self, req: &DeployRequest) -> Result<String, Error> {
        Ok(format!(
            "{} would deploy '{}' with {} replica(s) of {}",
            self.name(),
            req.endpoint,
            req.replicas,
            req.image
        ))
    }

    async fn watch_replicas(
        &self,
        sink: tokio::sync::mpsc::Sender<ReplicaDelta>,
        cancel: CancellationToken,
    ) -> Result<(), Error>;

    async fn watch_pod_status_change(
        &self,
        sink: tokio::sync::mpsc::Sender<WorkerObservation>,
        cancel: CancellationToken,
    ) -> Result<(), Error>;

    async fn watch_pod_delete(
        &self,
        sink: tokio::sync::mpsc::Sender<(String, String)>,
        cancel: CancellationToken,
    ) -> Result<(), Error>;

    /// Fired when the back-end marks an individual worker for termination
    /// (rolling update, manual scale-down, eviction) — distinct from
    /// `watch_pod_delete`, which fires once the pod is actually gone
    async fn watch_pod_terminating(
        &self,
        sink: tokio::sync::mpsc::Sender<(String, String)>,
        cancel: CancellationToken,
    ) -> Result<(), Error>;

    async fn watch_deployment_spec_change(
        &self,
        sink: tokio::sync::mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> Result<(), Error>;

    /// Optional: not every back-end can signal preemption
    async fn watch_spot_interruption(
        &self,
        _sink: tokio::sync::mpsc::Sender<(String, String, String)>,
        _cancel: CancellationToken,
    ) -> Result<(), Error> {
        Err(Error::new(ErrorKind::Unsupported, "spot interruption watch unsupported"))
    }

    /// Sets a back-end deletion-priority hint; advisory only — low values are deleted first
    async fn set_pod_deletion_cost(&self, worker_id: &str, cost: i64) -> Result<(), Error>;

    /// Marks a worker for draining on the back-end side (e.g. an
    /// annotation), for operator visibility; does not itself delete anything
    async fn mark_pod_draining(&self, worker_id: &str) -> Result<(), Error>;

    async fn get_pod_counts_by_spec(&self) -> Result<HashMap<String, PodCounts>, Error>;

    /// Delete a single worker directly, used by the resource releaser to
    /// clear a worker stuck in a terminal failure. Idempotent:
    /// deleting an already-gone worker is not an error.
    async fn delete_worker(&self, worker_id: &str) -> Result<(), Error>;

    fn get_default_env(&self) -> HashMap<String, String> {
        HashMap::new()
    }

    // optional capabilities; default to Unsupported

    async fn logs(&self, _worker_id: &str) -> Result<String, Error> {
        Err(Error::new(ErrorKind::Unsupported, "logs unsupported"))
    }

    async fn pod_yaml(&self, _worker_id: &str) -> Result<String, Error> {
        Err(Error::new(ErrorKind::Unsupported, "pod yaml unsupported"))
    }

    async fn describe(&self, _worker_id: &str) -> Result<String, Error> {
        Err(Error::new(ErrorKind::Unsupported, "describe unsupported"))
    }

    async fn list_pvcs(&self, _endpoint: &str) -> Result<Vec<String>, Error> {
        Err(Error::new(ErrorKind::Unsupported, "pvc listing unsupported"))
    }

    async fn exec(&self, _worker_id: &str, _command: &[String]) -> Result<String, Error> {
        Err(Error::new(ErrorKind::Unsupported, "exec unsupported"))
    }
}

/// Helper used by back-ends deriving status purely from replica counts
/// before falling back to a raw status string
#[must_use]
pub fn derive_status(desired: u32, available: u32, raw: &str) -> AppStatus {
    AppStatus::from_replicas(desired, available).unwrap_or_else(|| AppStatus::from_backend_str(raw))
}

/// A single `AppInfo` timestamp placeholder used by back-ends that don't
/// track creation time themselves
#[must_use]
pub fn now() -> DateTime<Utc> {
    Utc::now()
}
