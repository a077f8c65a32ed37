//! Resource Releaser
//!
//! Periodic sweep that deletes workers stuck in an `ImagePull` failure past
//! `image_pull_timeout`, retrying the endpoint's deploy up to `max_retries`
//! before giving up and leaving the worker for an operator to triage.
//! Grounded on the teacher's `Pods::clear_failing` sweep
//! (`schedulers/k8s/pods.rs`): list, filter to a known-bad state, delete,
//! move on — no retry loop inside the delete itself, the next periodic tick
//! picks up stragglers.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{event, instrument, Level};

use crate::error::Error;
use crate::libs::providers::DeploymentProvider;
use crate::models::{FailureType, Lifecycle, Worker};
use crate::repository::{EndpointRepository, WorkerRepository};

/// How many times a given worker id has been deleted-and-retried for a
/// stuck image pull; reset once the worker transitions away from
/// `ImagePull` (e.g. a fresh replacement worker starts healthy)
#[derive(Default)]
struct RetryState {
    attempts: HashMap<String, u32>,
}

pub struct ResourceReleaser {
    workers: Arc<dyn WorkerRepository>,
    endpoints: Arc<dyn EndpointRepository>,
    image_pull_timeout: chrono::Duration,
    max_retries: u32,
    retries: RwLock<RetryState>,
}

impl ResourceReleaser {
    #[must_use]
    pub fn new(
        workers: Arc<dyn WorkerRepository>,
        endpoints: Arc<dyn EndpointRepository>,
        image_pull_timeout: std::time::Duration,
        max_retries: u32,
    ) -> Self {
        ResourceReleaser {
            workers,
            endpoints,
            image_pull_timeout: chrono::Duration::from_std(image_pull_timeout).unwrap_or(chrono::Duration::seconds(300)),
            max_retries,
            retries: RwLock::default(),
        }
    }

    /// Whether a worker has been failing `ImagePull` longer than the
    /// configured timeout
    fn is_stuck(&self, worker: &Worker, now: chrono::DateTime<chrono::Utc>) -> bool {
        let Some(failure) = &worker.failure else {
            return false;
        };
        if failure.failure_type != FailureType::ImagePull {
            return false;
        }
        now.signed_duration_since(failure.occurred_at) >= self.image_pull_timeout
    }

    fn attempts_for(&self, worker_id: &str) -> u32 {
        self.retries.read().expect("releaser retry lock poisoned").attempts.get(worker_id).copied().unwrap_or(0)
    }

    fn record_attempt(&self, worker_id: &str) -> u32 {
        let mut retries = self.retries.write().expect("releaser retry lock poisoned");
        let count = retries.attempts.entry(worker_id.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    fn clear_attempts(&self, worker_id: &str) {
        self.retries.write().expect("releaser retry lock poisoned").attempts.remove(worker_id);
    }

    /// Run one sweep across every endpoint's workers. Returns the worker
    /// ids deleted this sweep, for observability/tests.
    #[instrument(name = "ResourceReleaser::sweep", skip(self, provider), err(Debug))]
    pub async fn sweep(&self, provider: &dyn DeploymentProvider) -> Result<Vec<String>, Error> {
        let now = chrono::Utc::now();
        let endpoints = self.endpoints.list().await?;
        let mut released = Vec::new();
        for endpoint in &endpoints {
            let workers = self.workers.list_by_endpoint(&endpoint.name).await?;
            let total = workers.len();
            let mut failed = 0u32;
            for worker in &workers {
                if worker.lifecycle == Lifecycle::Offline {
                    continue;
                }
                if worker.failure.is_some() {
                    failed += 1;
                }
                if !self.is_stuck(worker, now) {
                    continue;
                }
                let attempt = self.record_attempt(&worker.id);
                if attempt > self.max_retries {
                    event!(
                        Level::ERROR,
                        worker = %worker.id,
                        endpoint = %endpoint.name,
                        attempt,
                        max_retries = self.max_retries,
                        "stuck image-pull worker exceeded retry budget, leaving for operator triage"
                    );
                    continue;
                }
                event!(
                    Level::WARN,
                    worker = %worker.id,
                    endpoint = %endpoint.name,
                    attempt,
                    "deleting worker stuck in image-pull failure"
                );
                match provider.delete_worker(&worker.id).await {
                    Ok(()) => {
                        self.workers.mark_offline(&endpoint.name, &worker.id).await?;
                        released.push(worker.id.clone());
                    }
                    Err(err) => {
                        event!(Level::ERROR, worker = %worker.id, error = %err, "failed to delete stuck worker");
                    }
                }
            }
            if total > 0 {
                let ratio = 1.0 - (f64::from(failed) / total as f64);
                let mut runtime = endpoint.runtime.clone();
                runtime.health_ratio = ratio as f32;
                self.endpoints.update_runtime_state(&endpoint.name, runtime).await?;
            }
        }
        for worker_id in &released {
            self.clear_attempts(worker_id);
        }
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::libs::providers::StubProvider;
    use crate::models::{Endpoint, FailureRecord};
    use crate::repository::{MemoryEndpointRepository, MemoryWorkerRepository};
    use chrono::Utc;

    fn endpoint(name: &str) -> Endpoint {
        Endpoint {
            name: name.to_string(),
            spec_name: "s1".into(),
            backend: "stub".into(),
            image: "img".into(),
            desired_replicas: Some(1),
            autoscaling: None,
            task_timeout: 60,
            env: Default::default(),
            mounts: vec![],
            runtime: Default::default(),
            created_at: Utc::now(),
        }
    }

    fn stuck_worker(id: &str, endpoint: &str, occurred_at: chrono::DateTime<chrono::Utc>) -> Worker {
        let mut w = Worker::new_starting(id, endpoint, Utc::now());
        w.failure = Some(FailureRecord {
            failure_type: FailureType::ImagePull,
            raw_reason: "ErrImagePull".into(),
            raw_message: "rpc error: pull access denied".into(),
            sanitized_message: "pull access denied".into(),
            occurred_at,
        });
        w
    }

    #[tokio::test]
    async fn deletes_worker_stuck_past_timeout() {
        let endpoints = Arc::new(MemoryEndpointRepository::new());
        endpoints.put(endpoint("e1")).await.unwrap();
        let workers = Arc::new(MemoryWorkerRepository::new());
        let old = Utc::now() - chrono::Duration::seconds(600);
        workers.upsert(stuck_worker("w1", "e1", old)).await.unwrap();
        let provider = StubProvider::new("stub");
        provider.allow_mutations();

        let releaser = ResourceReleaser::new(workers.clone(), endpoints, std::time::Duration::from_secs(300), 3);
        let released = releaser.sweep(&provider).await.unwrap();
        assert_eq!(released, vec!["w1".to_string()]);
        let worker = workers.get("e1", "w1").await.unwrap().unwrap();
        assert_eq!(worker.lifecycle, Lifecycle::Offline);
    }

    #[tokio::test]
    async fn leaves_recent_image_pull_failures_alone() {
        let endpoints = Arc::new(MemoryEndpointRepository::new());
        endpoints.put(endpoint("e1")).await.unwrap();
        let workers = Arc::new(MemoryWorkerRepository::new());
        workers.upsert(stuck_worker("w1", "e1", Utc::now())).await.unwrap();
        let provider = StubProvider::new("stub");
        provider.allow_mutations();

        let releaser = ResourceReleaser::new(workers.clone(), endpoints, std::time::Duration::from_secs(300), 3);
        let released = releaser.sweep(&provider).await.unwrap();
        assert!(released.is_empty());
    }

    #[tokio::test]
    async fn stops_retrying_past_max_retries() {
        let endpoints = Arc::new(MemoryEndpointRepository::new());
        endpoints.put(endpoint("e1")).await.unwrap();
        let workers = Arc::new(MemoryWorkerRepository::new());
        let old = Utc::now() - chrono::Duration::seconds(600);
        workers.upsert(stuck_worker("w1", "e1", old)).await.unwrap();
        let provider = StubProvider::new("stub");
        provider.allow_mutations();

        let releaser = ResourceReleaser::new(workers.clone(), endpoints, std::time::Duration::from_secs(300), 0);
        // first sweep: attempt becomes 1, exceeds max_retries (0), skipped
        let released = releaser.sweep(&provider).await.unwrap();
        assert!(released.is_empty());
    }

    #[tokio::test]
    async fn health_ratio_reflects_failed_worker_fraction() {
        let endpoints = Arc::new(MemoryEndpointRepository::new());
        endpoints.put(endpoint("e1")).await.unwrap();
        let workers = Arc::new(MemoryWorkerRepository::new());
        let healthy = Worker::new_starting("w1", "e1", Utc::now());
        let failing = stuck_worker("w2", "e1", Utc::now());
        workers.upsert(healthy).await.unwrap();
        workers.upsert(failing).await.unwrap();
        let provider = StubProvider::new("stub");

        let releaser = ResourceReleaser::new(workers, endpoints.clone(), std::time::Duration::from_secs(300), 3);
        releaser.sweep(&provider).await.unwrap();
        let updated = endpoints.get("e1").await.unwrap().unwrap();
        assert!((updated.runtime.health_ratio - 0.5).abs() < f32::EPSILON);
    }
}
