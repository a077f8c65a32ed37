//! The stub back-end: every operation fails with `UNSUPPORTED`
//!
//! Grounded on the teacher's `DryRun` scheduler (`schedulers/dry_run.rs`)
//! as "the scheduler you get when a real one isn't wired up yet", but
//! simpler: this provider's every method fails,
//! not a pretend cluster. [`StubProvider`] doubles as the scriptable fake
//! used across this crate's tests.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::{Error, ErrorKind};
use crate::libs::providers::{
    DeployRequest, DeploymentProvider, PodCounts, ReplicaDelta, UpdatePatch, WorkerObservation,
};
use crate::models::{AppInfo, AppStatus, Spec};

use super::super::cancellation::CancellationToken;

fn unsupported(op: &str) -> Error {
    Error::new(ErrorKind::Unsupported, format!("stub provider does not implement {op}"))
}

/// A back-end not yet wired up; every method returns `UNSUPPORTED`
///
/// Tests that need a scriptable provider instead should seed
/// [`StubProvider::apps`]/[`StubProvider::specs`] directly rather than
/// relying on this type's `Unsupported` behavior. Calling
/// [`StubProvider::allow_mutations`] additionally makes `scale`/`update`
/// succeed against the seeded `apps` map, for tests exercising a
/// successful mutation path without a real back-end.
#[derive(Default)]
pub struct StubProvider {
    name: String,
    pub apps: RwLock<HashMap<String, AppInfo>>,
    pub specs: RwLock<HashMap<String, Spec>>,
    mutable: RwLock<bool>,
}

impl StubProvider {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        StubProvider {
            name: name.into(),
            apps: RwLock::default(),
            specs: RwLock::default(),
            mutable: RwLock::default(),
        }
    }

    /// Make `scale`/`update` succeed instead of returning `Unsupported`
    pub fn allow_mutations(&self) {
        *self.mutable.write().expect("stub mutable flag lock poisoned") = true;
    }
}

#[async_trait]
impl DeploymentProvider for StubProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deploy(&self, _req: DeployRequest) -> Result<(), Error> {
        Err(unsupported("deploy"))
    }

    async fn get(&self, endpoint: &str) -> Result<AppInfo, Error> {
        let apps = self.apps.read().expect("stub apps lock poisoned");
        apps.get(endpoint)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("no such endpoint: {endpoint}")))
    }

    async fn list(&self) -> Result<Vec<AppInfo>, Error> {
        let apps = self.apps.read().expect("stub apps lock poisoned");
        Ok(apps.values().cloned().collect())
    }

    async fn delete(&self, _endpoint: &str) -> Result<(), Error> {
        // idempotent delete is part of the trait contract even here: a
        // stub with nothing deployed has nothing to fail to delete
        Ok(())
    }

    async fn scale(&self, endpoint: &str, replicas: u32) -> Result<(), Error> {
        if !*self.mutable.read().expect("stub mutable flag lock poisoned") {
            return Err(unsupported("scale"));
        }
        let mut apps = self.apps.write().expect("stub apps lock poisoned");
        if let Some(app) = apps.get_mut(endpoint) {
            app.replicas = replicas;
            app.ready_replicas = replicas;
            app.available_replicas = replicas;
        }
        Ok(())
    }

    async fn update(&self, endpoint: &str, patch: UpdatePatch) -> Result<(), Error> {
        if !*self.mutable.read().expect("stub mutable flag lock poisoned") {
            return Err(unsupported("update"));
        }
        let mut apps = self.apps.write().expect("stub apps lock poisoned");
        if let Some(app) = apps.get_mut(endpoint) {
            if let Some(replicas) = patch.max_replicas {
                app.replicas = replicas;
                app.ready_replicas = replicas;
                app.available_replicas = replicas;
            }
            if let Some(image) = patch.image {
                app.image = image;
            }
        }
        Ok(())
    }

    async fn get_status(&self, endpoint: &str) -> Result<AppStatus, Error> {
        let apps = self.apps.read().expect("stub apps lock poisoned");
        Ok(apps.get(endpoint).map(|a| a.status).unwrap_or(AppStatus::Unknown))
    }

    async fn list_specs(&self) -> Result<Vec<Spec>, Error> {
        let specs = self.specs.read().expect("stub specs lock poisoned");
        Ok(specs.values().cloned().collect())
    }

    async fn get_spec(&self, name: &str) -> Result<Option<Spec>, Error> {
        let specs = self.specs.read().expect("stub specs lock poisoned");
        Ok(specs.get(name).cloned())
    }

    async fn watch_replicas(
        &self,
        _sink: tokio::sync::mpsc::Sender<ReplicaDelta>,
        _cancel: CancellationToken,
    ) -> Result<(), Error> {
        Err(unsupported("watch_replicas"))
    }

    async fn watch_pod_status_change(
        &self,
        _sink: tokio::sync::mpsc::Sender<WorkerObservation>,
        _cancel: CancellationToken,
    ) -> Result<(), Error> {
        Err(unsupported("watch_pod_status_change"))
    }

    async fn watch_pod_delete(
        &self,
        _sink: tokio::sync::mpsc::Sender<(String, String)>,
        _cancel: CancellationToken,
    ) -> Result<(), Error> {
        Err(unsupported("watch_pod_delete"))
    }

    async fn watch_pod_terminating(
        &self,
        _sink: tokio::sync::mpsc::Sender<(String, String)>,
        _cancel: CancellationToken,
    ) -> Result<(), Error> {
        Err(unsupported("watch_pod_terminating"))
    }

    async fn watch_deployment_spec_change(
        &self,
        _sink: tokio::sync::mpsc::Sender<String>,
        _cancel: CancellationToken,
    ) -> Result<(), Error> {
        Err(unsupported("watch_deployment_spec_change"))
    }

    async fn set_pod_deletion_cost(&self, worker_id: &str, _cost: i64) -> Result<(), Error> {
        if *self.mutable.read().expect("stub mutable flag lock poisoned") {
            return Ok(());
        }
        Err(unsupported(&format!("set_pod_deletion_cost({worker_id})")))
    }

    async fn mark_pod_draining(&self, worker_id: &str) -> Result<(), Error> {
        if *self.mutable.read().expect("stub mutable flag lock poisoned") {
            return Ok(());
        }
        Err(unsupported(&format!("mark_pod_draining({worker_id})")))
    }

    async fn get_pod_counts_by_spec(&self) -> Result<HashMap<String, PodCounts>, Error> {
        Ok(HashMap::new())
    }

    async fn delete_worker(&self, worker_id: &str) -> Result<(), Error> {
        if *self.mutable.read().expect("stub mutable flag lock poisoned") {
            return Ok(());
        }
        Err(unsupported(&format!("delete_worker({worker_id})")))
    }
}

/// Build a minimal `AppInfo` for seeding a [`StubProvider`] in tests
#[must_use]
pub fn fake_app_info(name: &str, image: &str, replicas: u32) -> AppInfo {
    AppInfo {
        name: name.to_string(),
        backend: "stub".to_string(),
        status: AppStatus::Running,
        replicas,
        ready_replicas: replicas,
        available_replicas: replicas,
        image: image.to_string(),
        labels: HashMap::new(),
        created_at: Utc::now(),
        mounts: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn every_mutating_method_is_unsupported() {
        let stub = StubProvider::new("stub");
        let req = DeployRequest {
            endpoint: "e1".into(),
            spec_name: "s1".into(),
            image: "img".into(),
            replicas: 1,
            env: HashMap::new(),
            task_timeout: 60,
            mounts: vec![],
        };
        assert_eq!(stub.deploy(req).await.unwrap_err().kind(), ErrorKind::Unsupported);
        assert_eq!(stub.scale("e1", 2).await.unwrap_err().kind(), ErrorKind::Unsupported);
        assert_eq!(
            stub.update("e1", UpdatePatch::default()).await.unwrap_err().kind(),
            ErrorKind::Unsupported
        );
    }

    #[tokio::test]
    async fn delete_is_idempotent_even_with_nothing_deployed() {
        let stub = StubProvider::new("stub");
        stub.delete("does-not-exist").await.unwrap();
    }
}
