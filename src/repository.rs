//! The persistence boundary
//!
//! The real backing store (a relational database and/or a key-value store)
//! is an external collaborator out of scope for this crate; these traits
//! are the narrow interface the rest of the engine is written against, and
//! [`memory`] ships an in-memory implementation used by tests and as the
//! default store for a standalone deployment of this engine.

use async_trait::async_trait;

use crate::error::Error;
use crate::models::{Endpoint, RuntimeState, Worker};

/// Persists worker observations and lifecycle transitions
///
/// Implementations MUST enforce the write-once rule on `pod_created_at`/
/// `pod_started_at` at this layer — callers should not rely on an
/// in-memory cache to guard it.
#[async_trait]
pub trait WorkerRepository: Send + Sync {
    /// Fetch a worker by `(endpoint, worker id)`
    async fn get(&self, endpoint: &str, worker_id: &str) -> Result<Option<Worker>, Error>;

    /// List every worker recorded for an endpoint, including offline ones
    async fn list_by_endpoint(&self, endpoint: &str) -> Result<Vec<Worker>, Error>;

    /// Upsert a worker record from an observation. The write-once fields
    /// and lifecycle no-downgrade rule are enforced here, not by the caller.
    async fn upsert(&self, worker: Worker) -> Result<Worker, Error>;

    /// Mark a worker offline in place; the row is never deleted so history
    /// is preserved for statistics
    async fn mark_offline(&self, endpoint: &str, worker_id: &str) -> Result<(), Error>;

    /// Clear a worker's failure record, e.g. on a healthy transition
    async fn clear_failure(&self, endpoint: &str, worker_id: &str) -> Result<(), Error>;

    /// Set (or replace) a worker's failure record, e.g. from the classifier
    async fn update_failure(
        &self,
        endpoint: &str,
        worker_id: &str,
        failure: crate::models::FailureRecord,
    ) -> Result<(), Error>;
}

/// Persists endpoint desired configuration and observed runtime state
#[async_trait]
pub trait EndpointRepository: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<Endpoint>, Error>;
    async fn list(&self) -> Result<Vec<Endpoint>, Error>;
    async fn put(&self, endpoint: Endpoint) -> Result<(), Error>;
    async fn delete(&self, name: &str) -> Result<(), Error>;
    /// Replace only the observed runtime-state blob; desired configuration
    /// fields are untouched
    async fn update_runtime_state(&self, name: &str, runtime: RuntimeState) -> Result<(), Error>;
}

pub mod memory;
pub use memory::{MemoryEndpointRepository, MemoryWorkerRepository};
