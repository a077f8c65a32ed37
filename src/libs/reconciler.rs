//! Worker State Reconciler
//!
//! Mirrors back-end worker observations into the durable [`Worker`] record,
//! enforcing the write-once billing timestamps and the lifecycle
//! no-downgrade rule at the repository layer. Grounded on
//! the teacher's `Cache::load_*` upsert loops (`cache.rs`) and its
//! `#[instrument(err(Debug))]` convention.

use std::sync::Arc;

use tracing::{event, instrument, Level};

use crate::error::Error;
use crate::libs::providers::WorkerObservation;
use crate::models::{FailureRecord, Lifecycle, LifecycleEvent, Worker};
use crate::repository::WorkerRepository;

use super::classifier;

/// The Worker State Reconciler
pub struct Reconciler {
    workers: Arc<dyn WorkerRepository>,
}

impl Reconciler {
    #[must_use]
    pub fn new(workers: Arc<dyn WorkerRepository>) -> Self {
        Reconciler { workers }
    }

    /// Derive the lifecycle a fresh observation implies, before the
    /// repository's no-downgrade rule is applied against the existing record
    fn observed_lifecycle(existing: Option<&Worker>, obs: &WorkerObservation) -> Lifecycle {
        // a worker already DRAINING/OFFLINE only changes lifecycle through
        // an explicit drain trigger or a WorkerDelete, never through a
        // plain status observation — start from the existing state
        let base = existing.map_or(Lifecycle::Starting, |w| w.lifecycle);
        if base == Lifecycle::Draining || base == Lifecycle::Offline {
            return base;
        }
        // first heartbeat or observed phase=Running & healthy promotes
        // STARTING -> RUNNING
        if obs.healthy && obs.phase.eq_ignore_ascii_case("running") {
            Lifecycle::Running
        } else {
            base
        }
    }

    /// Handle a `WorkerStatusChange` event end to end: parse, upsert (with
    /// write-once/no-downgrade enforced by the repository), emit
    /// `WORKER_STARTED` on first appearance, then classify/refresh failure
    #[instrument(name = "Reconciler::on_status_change", skip(self), err(Debug))]
    pub async fn on_status_change(&self, obs: WorkerObservation) -> Result<Option<LifecycleEvent>, Error> {
        let existing = self.workers.get(&obs.endpoint, &obs.worker_id).await?;
        let pre_existed = existing.is_some();
        let now = chrono::Utc::now();

        let mut worker = existing.clone().unwrap_or_else(|| {
            Worker::new_starting(obs.worker_id.clone(), obs.endpoint.clone(), now)
        });
        worker.phase = obs.phase.clone();
        worker.status = obs.status.clone();
        worker.reason = obs.reason.clone();
        worker.message = obs.message.clone();
        if obs.ip.is_some() {
            worker.ip = obs.ip.clone();
        }
        if obs.node.is_some() {
            worker.node = obs.node.clone();
        }
        // write-once: only ever proposed here, the repository drops these
        // if the existing row already has them set
        worker.pod_created_at = obs.created_at.or(worker.pod_created_at);
        worker.pod_started_at = obs.started_at.or(worker.pod_started_at);
        worker.lifecycle = Self::observed_lifecycle(existing.as_ref(), &obs);
        worker.last_seen_at = now;

        let upserted = self.workers.upsert(worker).await?;

        let lifecycle_event = if !pre_existed {
            event!(Level::INFO, worker = %obs.worker_id, endpoint = %obs.endpoint, "worker started");
            Some(LifecycleEvent::WorkerStarted {
                worker_id: obs.worker_id.clone(),
                endpoint: obs.endpoint.clone(),
            })
        } else {
            None
        };

        self.refresh_failure(&upserted, &obs).await?;
        Ok(lifecycle_event)
    }

    /// Classify the observation and write/refresh the failure record only
    /// if it differs from what's already stored, to avoid log/write churn
    ///
    async fn refresh_failure(&self, worker: &Worker, obs: &WorkerObservation) -> Result<(), Error> {
        let reason = obs.reason.as_deref().unwrap_or_default();
        let message = obs.message.as_deref().unwrap_or_default();
        if obs.healthy {
            // a healthy transition explicitly clears any stale failure
            // record
            if worker.failure.is_some() {
                self.workers.clear_failure(&worker.endpoint, &worker.id).await?;
            }
            return Ok(());
        }
        if reason.is_empty() && message.is_empty() {
            return Ok(());
        }
        let classified: FailureRecord = classifier::classify_and_sanitize(reason, message, chrono::Utc::now());
        let changed = worker
            .failure
            .as_ref()
            .map_or(true, |existing| existing.failure_type != classified.failure_type || existing.raw_message != classified.raw_message);
        if changed {
            event!(
                Level::WARN,
                worker = %worker.id,
                endpoint = %worker.endpoint,
                failure_type = classified.failure_type.as_str(),
                "worker failure classified"
            );
            self.workers.update_failure(&worker.endpoint, &worker.id, classified).await?;
        }
        Ok(())
    }

    /// Handle a `WorkerDelete` event: mark the record OFFLINE, never
    /// deleting the row since history is preserved for statistics
    #[instrument(name = "Reconciler::on_delete", skip(self), err(Debug))]
    pub async fn on_delete(&self, endpoint: &str, worker_id: &str) -> Result<LifecycleEvent, Error> {
        self.workers.mark_offline(endpoint, worker_id).await?;
        event!(Level::INFO, worker = %worker_id, endpoint = %endpoint, "worker offline");
        Ok(LifecycleEvent::WorkerOffline {
            worker_id: worker_id.to_string(),
            endpoint: endpoint.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::MemoryWorkerRepository;
    use chrono::Utc;

    fn obs(worker_id: &str, endpoint: &str, healthy: bool) -> WorkerObservation {
        WorkerObservation {
            worker_id: worker_id.to_string(),
            endpoint: endpoint.to_string(),
            phase: if healthy { "Running".into() } else { "Pending".into() },
            status: "ok".into(),
            reason: None,
            message: None,
            ip: None,
            node: None,
            healthy,
            created_at: None,
            started_at: None,
        }
    }

    #[tokio::test]
    async fn reconciling_same_event_twice_is_idempotent() {
        let repo = Arc::new(MemoryWorkerRepository::new());
        let reconciler = Reconciler::new(repo.clone());
        let event1 = obs("w1", "e1", true);
        reconciler.on_status_change(event1.clone()).await.unwrap();
        let first = repo.get("e1", "w1").await.unwrap().unwrap();
        reconciler.on_status_change(event1).await.unwrap();
        let second = repo.get("e1", "w1").await.unwrap().unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn write_once_timestamps_survive_restart_style_reingest() {
        let repo = Arc::new(MemoryWorkerRepository::new());
        let reconciler = Reconciler::new(repo.clone());
        let t0 = Utc::now();
        let mut e1 = obs("w1", "e1", true);
        e1.created_at = Some(t0);
        e1.started_at = Some(t0);
        reconciler.on_status_change(e1).await.unwrap();

        // simulate a controller restart: in-memory cache is gone, but the
        // repository state persists. a later event reports a later time.
        let t1 = t0 + chrono::Duration::seconds(60);
        let mut e2 = obs("w1", "e1", true);
        e2.created_at = Some(t1);
        e2.started_at = Some(t1);
        reconciler.on_status_change(e2).await.unwrap();

        let worker = repo.get("e1", "w1").await.unwrap().unwrap();
        assert_eq!(worker.pod_created_at, Some(t0));
        assert_eq!(worker.pod_started_at, Some(t0));
    }

    #[tokio::test]
    async fn first_appearance_emits_worker_started() {
        let repo = Arc::new(MemoryWorkerRepository::new());
        let reconciler = Reconciler::new(repo);
        let event = reconciler.on_status_change(obs("w1", "e1", true)).await.unwrap();
        assert_eq!(
            event,
            Some(LifecycleEvent::WorkerStarted { worker_id: "w1".into(), endpoint: "e1".into() })
        );
    }

    #[tokio::test]
    async fn lifecycle_never_downgrades_from_running() {
        let repo = Arc::new(MemoryWorkerRepository::new());
        let reconciler = Reconciler::new(repo.clone());
        reconciler.on_status_change(obs("w1", "e1", true)).await.unwrap();
        // a later, unhealthy-but-not-terminal observation must not
        // downgrade RUNNING back to STARTING
        reconciler.on_status_change(obs("w1", "e1", false)).await.unwrap();
        let worker = repo.get("e1", "w1").await.unwrap().unwrap();
        assert_eq!(worker.lifecycle, Lifecycle::Running);
    }

    #[tokio::test]
    async fn delete_marks_offline_without_removing_history() {
        let repo = Arc::new(MemoryWorkerRepository::new());
        let reconciler = Reconciler::new(repo.clone());
        reconciler.on_status_change(obs("w1", "e1", true)).await.unwrap();
        let event = reconciler.on_delete("e1", "w1").await.unwrap();
        assert_eq!(event, LifecycleEvent::WorkerOffline { worker_id: "w1".into(), endpoint: "e1".into() });
        let worker = repo.get("e1", "w1").await.unwrap().unwrap();
        assert_eq!(worker.lifecycle, Lifecycle::Offline);
    }
}
