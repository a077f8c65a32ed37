//! Drain Coordinator
//!
//! Handles the three drain triggers — back-end deletion marker, spot
//! interruption, and deployment spec change — and is the sole writer of the
//! DRAINING lifecycle transition. Worker-selection filtering is grounded on
//! `allocatable.rs`'s filter-then-count idiom: the worker record itself is
//! always the authority, never a duplicated in-memory flag.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{event, instrument, Level};

use crate::error::Error;
use crate::libs::providers::DeploymentProvider;
use crate::models::{LifecycleEvent, Worker};
use crate::repository::WorkerRepository;

/// Deletion-cost hints applied on a deployment spec change: idle workers
/// are cheap to delete, busy ones expensive
const IDLE_DELETION_COST: i64 = -1000;
const BUSY_DELETION_COST: i64 = 1000;

pub struct DrainCoordinator {
    workers: Arc<dyn WorkerRepository>,
}

impl DrainCoordinator {
    #[must_use]
    pub fn new(workers: Arc<dyn WorkerRepository>) -> Self {
        DrainCoordinator { workers }
    }

    /// Transition a single worker to DRAINING and tag it on the back-end
    /// for operator visibility. Idempotent: draining an already-draining
    /// or offline worker is a no-op on the lifecycle, though the back-end
    /// annotation call is retried regardless since it's advisory.
    async fn drain_one(
        &self,
        provider: &dyn DeploymentProvider,
        endpoint: &str,
        worker_id: &str,
    ) -> Result<Option<LifecycleEvent>, Error> {
        let Some(mut worker) = self.workers.get(endpoint, worker_id).await? else {
            return Ok(None);
        };
        if worker.lifecycle == crate::models::Lifecycle::Offline {
            return Ok(None);
        }
        let was_draining = worker.lifecycle == crate::models::Lifecycle::Draining;
        worker.lifecycle = crate::models::Lifecycle::Draining;
        self.workers.upsert(worker.clone()).await?;
        provider.mark_pod_draining(worker_id).await?;
        if was_draining {
            return Ok(None);
        }
        Ok(Some(LifecycleEvent::WorkerDraining {
            worker_id: worker_id.to_string(),
            endpoint: endpoint.to_string(),
        }))
    }

    /// Trigger: the back-end marked an individual worker for termination
    /// (rolling update, manual scale-down, eviction)
    #[instrument(name = "DrainCoordinator::on_terminating", skip(self, provider), err(Debug))]
    pub async fn on_terminating(
        &self,
        provider: &dyn DeploymentProvider,
        endpoint: &str,
        worker_id: &str,
    ) -> Result<Option<LifecycleEvent>, Error> {
        let result = self.drain_one(provider, endpoint, worker_id).await?;
        if result.is_some() {
            event!(Level::INFO, worker = %worker_id, endpoint = %endpoint, "worker draining (back-end terminating)");
        }
        Ok(result)
    }

    /// Trigger: spot interruption — same transition, logged at a higher
    /// severity; in-flight jobs are enumerated for observability only, not
    /// cancelled
    #[instrument(name = "DrainCoordinator::on_spot_interruption", skip(self, provider), err(Debug))]
    pub async fn on_spot_interruption(
        &self,
        provider: &dyn DeploymentProvider,
        endpoint: &str,
        worker_id: &str,
        reason: &str,
    ) -> Result<Option<LifecycleEvent>, Error> {
        let jobs_in_progress = self
            .workers
            .get(endpoint, worker_id)
            .await?
            .map(|w| w.jobs_in_progress.len())
            .unwrap_or(0);
        event!(
            Level::WARN,
            worker = %worker_id,
            endpoint = %endpoint,
            reason = reason,
            jobs_in_progress,
            "spot interruption: draining worker, in-flight jobs left to finish within the grace window"
        );
        self.drain_one(provider, endpoint, worker_id).await
    }

    /// Trigger: the back-end's desired configuration changed (rolling
    /// update). Sets a deletion-cost hint per worker based on current load
    /// but does NOT transition anyone to DRAINING yet — that happens
    /// lazily when the back-end actually marks a worker for termination
    ///
    #[instrument(name = "DrainCoordinator::on_spec_change", skip(self, provider), err(Debug))]
    pub async fn on_spec_change(&self, provider: &dyn DeploymentProvider, endpoint: &str) -> Result<(), Error> {
        let workers = self.workers.list_by_endpoint(endpoint).await?;
        for worker in workers.iter().filter(|w| w.lifecycle != crate::models::Lifecycle::Offline) {
            let cost = if worker.current_jobs == 0 { IDLE_DELETION_COST } else { BUSY_DELETION_COST };
            provider.set_pod_deletion_cost(&worker.id, cost).await?;
        }
        event!(Level::INFO, endpoint = %endpoint, workers = workers.len(), "deletion-cost hints refreshed for rolling update");
        Ok(())
    }
}

/// Pick the next dispatchable worker for an endpoint, or `None` if none are
/// eligible. The worker record's lifecycle is the sole authority for this
/// predicate — no separate
/// in-memory "is busy" flag is consulted.
#[must_use]
pub fn pick_worker(workers: &[Worker]) -> Option<&Worker> {
    workers
        .iter()
        .filter(|w| w.dispatchable())
        .min_by_key(|w| w.current_jobs)
}

/// Count workers by dispatchability, used by the autoscaler to read
/// "worker counts by lifecycle status"
#[must_use]
pub fn counts_by_lifecycle(workers: &[Worker]) -> HashMap<crate::models::Lifecycle, u32> {
    let mut counts = HashMap::new();
    for worker in workers {
        *counts.entry(worker.lifecycle).or_insert(0) += 1;
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::libs::providers::StubProvider;
    use crate::models::{Lifecycle, Worker};
    use crate::repository::MemoryWorkerRepository;
    use chrono::Utc;

    async fn seeded_repo(endpoint: &str, id: &str, lifecycle: Lifecycle, current_jobs: u32) -> Arc<MemoryWorkerRepository> {
        let repo = Arc::new(MemoryWorkerRepository::new());
        let mut w = Worker::new_starting(id, endpoint, Utc::now());
        w.lifecycle = lifecycle;
        w.current_jobs = current_jobs;
        repo.upsert(w).await.unwrap();
        repo
    }

    #[tokio::test]
    async fn spec_change_sets_cost_without_draining() {
        let repo = Arc::new(MemoryWorkerRepository::new());
        let mut idle1 = Worker::new_starting("w1", "e1", Utc::now());
        idle1.lifecycle = Lifecycle::Running;
        let mut idle2 = Worker::new_starting("w2", "e1", Utc::now());
        idle2.lifecycle = Lifecycle::Running;
        let mut busy = Worker::new_starting("w3", "e1", Utc::now());
        busy.lifecycle = Lifecycle::Running;
        busy.current_jobs = 3;
        repo.upsert(idle1).await.unwrap();
        repo.upsert(idle2).await.unwrap();
        repo.upsert(busy).await.unwrap();

        let provider = StubProvider::new("stub-k8s");
        provider.allow_mutations();
        let coordinator = DrainCoordinator::new(repo.clone());
        coordinator.on_spec_change(&provider, "e1").await.unwrap();

        for w in repo.list_by_endpoint("e1").await.unwrap() {
            assert_eq!(w.lifecycle, Lifecycle::Running, "no worker should be draining yet");
        }
    }

    #[tokio::test]
    async fn spot_interruption_drains_and_excludes_from_pick_worker() {
        let repo = seeded_repo("e1", "w1", Lifecycle::Running, 2).await;
        let provider = StubProvider::new("stub");
        provider.allow_mutations();
        let coordinator = DrainCoordinator::new(repo.clone());
        let event = coordinator
            .on_spot_interruption(&provider, "e1", "w1", "SIGTERM_2m")
            .await
            .unwrap();
        assert!(event.is_some());
        let workers = repo.list_by_endpoint("e1").await.unwrap();
        assert_eq!(workers[0].lifecycle, Lifecycle::Draining);
        assert!(pick_worker(&workers).is_none());
    }

    #[test]
    fn pick_worker_excludes_draining_and_offline() {
        let now = Utc::now();
        let mut running = Worker::new_starting("w1", "e1", now);
        running.lifecycle = Lifecycle::Running;
        let mut draining = Worker::new_starting("w2", "e1", now);
        draining.lifecycle = Lifecycle::Draining;
        let mut offline = Worker::new_starting("w3", "e1", now);
        offline.lifecycle = Lifecycle::Offline;
        let workers = vec![draining, offline, running.clone()];
        assert_eq!(pick_worker(&workers), Some(&running));
    }
}
