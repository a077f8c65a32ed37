//! An in-memory implementation of the repository traits
//!
//! Grounded on the teacher's `test_utilities`/`DryRun` pattern: a
//! deliberately simple stand-in for the real SQL/KV store, used both by
//! unit tests and as the default store when this engine runs standalone.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::Error;
use crate::models::{Endpoint, FailureRecord, Lifecycle, RuntimeState, Worker};

use super::{EndpointRepository, WorkerRepository};

/// Key a worker row by `(endpoint, worker id)`, matching the invariant
/// that this pair resolves to exactly one worker
type WorkerKey = (String, String);

#[derive(Default)]
pub struct MemoryWorkerRepository {
    rows: RwLock<HashMap<WorkerKey, Worker>>,
}

impl MemoryWorkerRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkerRepository for MemoryWorkerRepository {
    async fn get(&self, endpoint: &str, worker_id: &str) -> Result<Option<Worker>, Error> {
        let rows = self.rows.read().expect("worker repository lock poisoned");
        Ok(rows.get(&(endpoint.to_string(), worker_id.to_string())).cloned())
    }

    async fn list_by_endpoint(&self, endpoint: &str) -> Result<Vec<Worker>, Error> {
        let rows = self.rows.read().expect("worker repository lock poisoned");
        Ok(rows
            .values()
            .filter(|w| w.endpoint == endpoint)
            .cloned()
            .collect())
    }

    async fn upsert(&self, mut worker: Worker) -> Result<Worker, Error> {
        let key = (worker.endpoint.clone(), worker.id.clone());
        let mut rows = self.rows.write().expect("worker repository lock poisoned");
        if let Some(existing) = rows.get(&key) {
            // an id that reappears after going OFFLINE is treated as a new
            // worker we explicitly reject (DESIGN.md, Open Question (a)):
            // refuse the update, keep the OFFLINE row
            if existing.lifecycle == Lifecycle::Offline {
                return Ok(existing.clone());
            }
            // write-once billing timestamps: never let a later observation
            // overwrite an already-set value
            if existing.pod_created_at.is_some() {
                worker.pod_created_at = existing.pod_created_at;
            }
            if existing.pod_started_at.is_some() {
                worker.pod_started_at = existing.pod_started_at;
            }
            // never let a mere status observation downgrade the lifecycle
            if existing.lifecycle.would_downgrade(worker.lifecycle) {
                worker.lifecycle = existing.lifecycle;
            }
            worker.first_seen_at = existing.first_seen_at;
        }
        rows.insert(key, worker.clone());
        Ok(worker)
    }

    async fn mark_offline(&self, endpoint: &str, worker_id: &str) -> Result<(), Error> {
        let mut rows = self.rows.write().expect("worker repository lock poisoned");
        if let Some(worker) = rows.get_mut(&(endpoint.to_string(), worker_id.to_string())) {
            worker.lifecycle = Lifecycle::Offline;
            worker.last_seen_at = Utc::now();
        }
        Ok(())
    }

    async fn clear_failure(&self, endpoint: &str, worker_id: &str) -> Result<(), Error> {
        let mut rows = self.rows.write().expect("worker repository lock poisoned");
        if let Some(worker) = rows.get_mut(&(endpoint.to_string(), worker_id.to_string())) {
            worker.failure = None;
        }
        Ok(())
    }

    async fn update_failure(
        &self,
        endpoint: &str,
        worker_id: &str,
        failure: FailureRecord,
    ) -> Result<(), Error> {
        let mut rows = self.rows.write().expect("worker repository lock poisoned");
        if let Some(worker) = rows.get_mut(&(endpoint.to_string(), worker_id.to_string())) {
            worker.failure = Some(failure);
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryEndpointRepository {
    rows: RwLock<HashMap<String, Endpoint>>,
}

impl MemoryEndpointRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EndpointRepository for MemoryEndpointRepository {
    async fn get(&self, name: &str) -> Result<Option<Endpoint>, Error> {
        let rows = self.rows.read().expect("endpoint repository lock poisoned");
        Ok(rows.get(name).cloned())
    }

    async fn list(&self) -> Result<Vec<Endpoint>, Error> {
        let rows = self.rows.read().expect("endpoint repository lock poisoned");
        Ok(rows.values().cloned().collect())
    }

    async fn put(&self, endpoint: Endpoint) -> Result<(), Error> {
        let mut rows = self.rows.write().expect("endpoint repository lock poisoned");
        rows.insert(endpoint.name.clone(), endpoint);
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), Error> {
        let mut rows = self.rows.write().expect("endpoint repository lock poisoned");
        rows.remove(name);
        Ok(())
    }

    async fn update_runtime_state(&self, name: &str, runtime: RuntimeState) -> Result<(), Error> {
        let mut rows = self.rows.write().expect("endpoint repository lock poisoned");
        if let Some(endpoint) = rows.get_mut(name) {
            // desired-replica fields live outside `runtime` and are
            // untouched here: observed state never overwrites desired
            // configuration
            endpoint.runtime = runtime;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Worker;

    #[tokio::test]
    async fn upsert_is_idempotent() {
        let repo = MemoryWorkerRepository::new();
        let now = Utc::now();
        let w = Worker::new_starting("w1", "e1", now);
        let first = repo.upsert(w.clone()).await.unwrap();
        let second = repo.upsert(w).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn write_once_timestamps_survive_later_observations() {
        let repo = MemoryWorkerRepository::new();
        let t0 = Utc::now();
        let mut w = Worker::new_starting("w1", "e1", t0);
        w.pod_created_at = Some(t0);
        w.pod_started_at = Some(t0);
        repo.upsert(w.clone()).await.unwrap();

        let t1 = t0 + chrono::Duration::seconds(30);
        let mut later = w;
        later.pod_created_at = Some(t1);
        later.pod_started_at = Some(t1);
        let result = repo.upsert(later).await.unwrap();
        assert_eq!(result.pod_created_at, Some(t0));
        assert_eq!(result.pod_started_at, Some(t0));
    }

    #[tokio::test]
    async fn offline_is_terminal() {
        let repo = MemoryWorkerRepository::new();
        let now = Utc::now();
        let w = Worker::new_starting("w1", "e1", now);
        repo.upsert(w).await.unwrap();
        repo.mark_offline("e1", "w1").await.unwrap();

        let mut reappeared = Worker::new_starting("w1", "e1", now);
        reappeared.lifecycle = Lifecycle::Running;
        let result = repo.upsert(reappeared).await.unwrap();
        assert_eq!(result.lifecycle, Lifecycle::Offline);
    }
}
