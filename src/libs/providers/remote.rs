//! The remote-provider back-end: an endpoint/worker HTTP API with no watch
//! support, only polling
//!
//! Grounded on the teacher's `Scheduler` trait shape generalized away from
//! k8s: events are synthesized by listing endpoints on a fixed interval
//! and diffing against a cached previous snapshot keyed by a stable
//! subject id. The diff key is kept deliberately small —
//! `(state, error, message, healthy)` for workers, `(desired, ready,
//! available, status)` for endpoints — to suppress noise from fields
//! no watcher needs to act on.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{event, instrument, Level};

use crate::error::{Error, ErrorKind};
use crate::models::{AppInfo, AppStatus, Spec};

use super::{
    derive_status, DeployRequest, DeploymentProvider, PodCounts, ReplicaDelta, UpdatePatch,
    WorkerObservation,
};
use crate::libs::cancellation::CancellationToken;

/// One worker as reported by the remote provider's list API
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteWorker {
    pub id: String,
    pub endpoint: String,
    pub state: String,
    pub error: Option<String>,
    pub message: Option<String>,
    pub healthy: bool,
    pub ip: Option<String>,
    pub created_at: Option<chrono::DateTime<chrono::Utc>>,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// The diff key for a worker observation: only these fields, if changed,
/// cause a `WorkerStatusChange` to be synthesized
type WorkerDiffKey = (String, Option<String>, Option<String>, bool);

fn worker_diff_key(w: &RemoteWorker) -> WorkerDiffKey {
    (w.state.clone(), w.error.clone(), w.message.clone(), w.healthy)
}

/// The diff key for an endpoint's replica state
type EndpointDiffKey = (u32, u32, u32, String);

fn endpoint_diff_key(info: &AppInfo) -> EndpointDiffKey {
    (info.replicas, info.ready_replicas, info.available_replicas, format!("{:?}", info.status))
}

/// A snapshot of the last poll, used to diff the next one. Owned entirely
/// by this provider instance — never shared across pollers. Workers carry their last
/// known endpoint alongside the diff key so a worker that disappears from
/// a later listing can still be reported against the right endpoint when
/// its `WorkerDelete` is synthesized.
#[derive(Default)]
struct Snapshot {
    workers: HashMap<String, (String, WorkerDiffKey)>,
    endpoints: HashMap<String, EndpointDiffKey>,
    /// Whether this is the first poll since the watch was registered; used
    /// to decide whether to synthesize an initial `ReplicaChange` for
    /// endpoints already present (DESIGN.md Open Question (b))
    primed: bool,
}

/// A minimal client for listing the remote provider's endpoints/workers
///
/// The actual HTTP surface (auth headers, pagination, retry) is an
/// external collaborator; this trait is the narrow seam the poller calls
/// through, letting tests substitute an in-memory fake.
#[async_trait]
pub trait RemoteApiClient: Send + Sync {
    async fn list_apps(&self) -> Result<Vec<AppInfo>, Error>;
    async fn list_workers(&self, endpoint: &str) -> Result<Vec<RemoteWorker>, Error>;
    async fn create_app(&self, req: &DeployRequest) -> Result<(), Error>;
    async fn delete_app(&self, endpoint: &str) -> Result<(), Error>;
    async fn scale_app(&self, endpoint: &str, replicas: u32) -> Result<(), Error>;
    async fn update_app(&self, endpoint: &str, patch: &UpdatePatch) -> Result<(), Error>;
    async fn pod_counts_by_spec(&self) -> Result<HashMap<String, PodCounts>, Error>;
    /// Delete a single worker, idempotent on a repeated call
    async fn delete_worker(&self, worker_id: &str) -> Result<(), Error>;
}

/// A real HTTP-backed [`RemoteApiClient`] for the `novita`-shaped config
/// block
pub struct HttpRemoteClient {
    http: Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpRemoteClient {
    #[must_use]
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        HttpRemoteClient {
            http: Client::new(),
            base_url: base_url.into(),
            api_key,
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let req = self.http.request(method, url);
        match &self.api_key {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }
}

#[async_trait]
impl RemoteApiClient for HttpRemoteClient {
    async fn list_apps(&self) -> Result<Vec<AppInfo>, Error> {
        let resp = self.request(reqwest::Method::GET, "/v1/apps").send().await?;
        let apps: Vec<AppInfo> = resp.error_for_status()?.json().await?;
        Ok(apps)
    }

    async fn list_workers(&self, endpoint: &str) -> Result<Vec<RemoteWorker>, Error> {
        let _ = endpoint;
        // the concrete wire shape of a cloud provider's worker listing
        // endpoint is an external collaborator; callers in tests should
        // use an in-memory `RemoteApiClient` instead
        Err(Error::unsupported("HttpRemoteClient::list_workers requires a live endpoint"))
    }

    async fn create_app(&self, req: &DeployRequest) -> Result<(), Error> {
        let resp = self
            .request(reqwest::Method::POST, "/v1/apps")
            .json(req)
            .send()
            .await?;
        resp.error_for_status()?;
        Ok(())
    }

    async fn delete_app(&self, endpoint: &str) -> Result<(), Error> {
        let resp = self
            .request(reqwest::Method::DELETE, &format!("/v1/apps/{endpoint}"))
            .send()
            .await?;
        match resp.error_for_status() {
            Ok(_) => Ok(()),
            Err(err) if err.status() == Some(reqwest::StatusCode::NOT_FOUND) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn scale_app(&self, endpoint: &str, replicas: u32) -> Result<(), Error> {
        let patch = UpdatePatch {
            min_replicas: Some(replicas),
            max_replicas: Some(replicas),
            ..Default::default()
        };
        self.update_app(endpoint, &patch).await
    }

    async fn update_app(&self, endpoint: &str, patch: &UpdatePatch) -> Result<(), Error> {
        let resp = self
            .request(reqwest::Method::PATCH, &format!("/v1/apps/{endpoint}"))
            .json(patch)
            .send()
            .await?;
        resp.error_for_status()?;
        Ok(())
    }

    async fn pod_counts_by_spec(&self) -> Result<HashMap<String, PodCounts>, Error> {
        let resp = self.request(reqwest::Method::GET, "/v1/specs/counts").send().await?;
        let counts: HashMap<String, PodCounts> = resp
            .error_for_status()?
            .json::<HashMap<String, (u32, u32)>>()
            .await?
            .into_iter()
            .map(|(k, (running, pending))| (k, PodCounts { running, pending }))
            .collect();
        Ok(counts)
    }

    async fn delete_worker(&self, worker_id: &str) -> Result<(), Error> {
        let resp = self
            .request(reqwest::Method::DELETE, &format!("/v1/workers/{worker_id}"))
            .send()
            .await?;
        match resp.error_for_status() {
            Ok(_) => Ok(()),
            Err(err) if err.status() == Some(reqwest::StatusCode::NOT_FOUND) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// The polling state shared between [`RemoteProvider`] and its spawned
/// poll-loop tasks. Kept behind an `Arc` (not `&self`) because a `Watch*`
/// call must spawn a `'static` background task and return immediately.
struct RemoteInner {
    client: Box<dyn RemoteApiClient>,
    poll_interval: Duration,
    snapshot: Mutex<Snapshot>,
    worker_sink: Mutex<Option<tokio::sync::mpsc::Sender<WorkerObservation>>>,
    replica_sink: Mutex<Option<tokio::sync::mpsc::Sender<ReplicaDelta>>>,
    delete_sink: Mutex<Option<tokio::sync::mpsc::Sender<(String, String)>>>,
    poll_started: std::sync::atomic::AtomicBool,
}

/// The polling-only remote-provider back-end
pub struct RemoteProvider {
    name: String,
    inner: std::sync::Arc<RemoteInner>,
}

impl RemoteProvider {
    #[must_use]
    pub fn new(name: impl Into<String>, client: Box<dyn RemoteApiClient>, poll_interval: Duration) -> Self {
        RemoteProvider {
            name: name.into(),
            inner: std::sync::Arc::new(RemoteInner {
                client,
                poll_interval,
                snapshot: Mutex::new(Snapshot::default()),
                worker_sink: Mutex::new(None),
                replica_sink: Mutex::new(None),
                delete_sink: Mutex::new(None),
                poll_started: std::sync::atomic::AtomicBool::new(false),
            }),
        }
    }

    /// Make sure exactly one poll loop is running for this provider
    /// instance, regardless of how many `watch_*` methods register a sink
    /// against it
    fn ensure_poll_loop(&self, cancel: CancellationToken) {
        use std::sync::atomic::Ordering;
        if self.inner.poll_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = self.inner.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = tokio::time::sleep(inner.poll_interval) => {
                        if let Err(err) = inner.poll_once().await {
                            event!(Level::WARN, error = %err, "remote provider poll failed, retrying next interval");
                        }
                    }
                }
            }
        });
    }
}

impl RemoteInner {
    /// Run one poll pass: list every app, diff against the cached
    /// snapshot, and emit only what changed, including
    /// synthesizing `WorkerDelete` for any worker id that was present in
    /// the last pass and is missing from this one (back-end tombstone)
    #[instrument(name = "RemoteProvider::poll_once", skip_all, err(Debug))]
    async fn poll_once(&self) -> Result<(), Error> {
        let apps = self.client.list_apps().await?;
        let mut snapshot = self.snapshot.lock().expect("remote snapshot lock poisoned");
        let first_pass = !snapshot.primed;
        let mut seen_workers: std::collections::HashSet<String> = std::collections::HashSet::new();

        for app in &apps {
            let key = endpoint_diff_key(app);
            let changed = snapshot.endpoints.get(&app.name) != Some(&key);
            // a brand-new watch subscription starts from a cold cache, so
            // its very first pass synthesizes a ReplicaChange for every
            // already-present endpoint (DESIGN.md Open Question (b))
            if changed || first_pass {
                let delta = ReplicaDelta {
                    endpoint: app.name.clone(),
                    desired: app.replicas,
                    ready: app.ready_replicas,
                    available: app.available_replicas,
                    conditions: vec![],
                };
                if let Some(sink) = self.replica_sink.lock().expect("replica sink lock poisoned").as_ref() {
                    if sink.send(delta).await.is_err() {
                        event!(Level::WARN, endpoint = %app.name, "replica sink closed, dropping event");
                    }
                }
            }
            snapshot.endpoints.insert(app.name.clone(), key);

            let workers = self.client.list_workers(&app.name).await.unwrap_or_default();
            for worker in workers {
                seen_workers.insert(worker.id.clone());
                let key = worker_diff_key(&worker);
                let changed = snapshot.workers.get(&worker.id).map(|(_, k)| k) != Some(&key);
                if changed {
                    let obs = WorkerObservation {
                        worker_id: worker.id.clone(),
                        endpoint: worker.endpoint.clone(),
                        phase: worker.state.clone(),
                        status: worker.state.clone(),
                        reason: worker.error.clone(),
                        message: worker.message.clone(),
                        ip: worker.ip.clone(),
                        node: None,
                        healthy: worker.healthy,
                        created_at: worker.created_at,
                        started_at: worker.started_at,
                    };
                    if let Some(sink) = self.worker_sink.lock().expect("worker sink lock poisoned").as_ref() {
                        if sink.send(obs).await.is_err() {
                            event!(Level::WARN, worker = %worker.id, "worker sink closed, dropping event");
                        }
                    }
                }
                snapshot.workers.insert(worker.id.clone(), (worker.endpoint.clone(), key));
            }
        }

        // any worker id the last pass knew about but this pass didn't see
        // at all has been tombstoned by the back-end
        let vanished: Vec<(String, String)> = snapshot
            .workers
            .iter()
            .filter(|(id, _)| !seen_workers.contains(*id))
            .map(|(id, (endpoint, _))| (id.clone(), endpoint.clone()))
            .collect();
        for (id, endpoint) in &vanished {
            if let Some(sink) = self.delete_sink.lock().expect("delete sink lock poisoned").as_ref() {
                if sink.send((id.clone(), endpoint.clone())).await.is_err() {
                    event!(Level::WARN, worker = %id, "delete sink closed, dropping event");
                }
            }
            snapshot.workers.remove(id);
        }

        snapshot.primed = true;
        Ok(())
    }
}

#[async_trait]
impl DeploymentProvider for RemoteProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deploy(&self, req: DeployRequest) -> Result<(), Error> {
        if self.inner.client.list_apps().await?.iter().any(|a| a.name == req.endpoint) {
            return Err(Error::new(ErrorKind::AlreadyExists, format!("endpoint {} exists", req.endpoint)));
        }
        self.inner.client.create_app(&req).await
    }

    async fn get(&self, endpoint: &str) -> Result<AppInfo, Error> {
        self.inner
            .client
            .list_apps()
            .await?
            .into_iter()
            .find(|a| a.name == endpoint)
            .ok_or_else(|| Error::not_found(format!("no such endpoint: {endpoint}")))
    }

    async fn list(&self) -> Result<Vec<AppInfo>, Error> {
        self.inner.client.list_apps().await
    }

    async fn delete(&self, endpoint: &str) -> Result<(), Error> {
        self.inner.client.delete_app(endpoint).await
    }

    async fn scale(&self, endpoint: &str, replicas: u32) -> Result<(), Error> {
        self.inner.client.scale_app(endpoint, replicas).await
    }

    async fn update(&self, endpoint: &str, patch: UpdatePatch) -> Result<(), Error> {
        // the remote provider's update API is total, not partial: the
        // caller must read-modify-write around unset fields
        let current = self.get(endpoint).await?;
        let merged = UpdatePatch {
            image: patch.image.or(Some(current.image.clone())),
            env: patch.env,
            min_replicas: patch.min_replicas.or(Some(current.replicas)),
            max_replicas: patch.max_replicas.or(Some(current.replicas)),
            mounts: patch.mounts.or(current.mounts.clone()),
        };
        self.inner.client.update_app(endpoint, &merged).await
    }

    async fn get_status(&self, endpoint: &str) -> Result<AppStatus, Error> {
        let info = self.get(endpoint).await?;
        Ok(derive_status(info.replicas, info.available_replicas, "unknown"))
    }

    async fn list_specs(&self) -> Result<Vec<Spec>, Error> {
        Ok(vec![])
    }

    async fn get_spec(&self, _name: &str) -> Result<Option<Spec>, Error> {
        Ok(None)
    }

    async fn watch_replicas(
        &self,
        sink: tokio::sync::mpsc::Sender<ReplicaDelta>,
        cancel: CancellationToken,
    ) -> Result<(), Error> {
        *self.inner.replica_sink.lock().expect("replica sink lock poisoned") = Some(sink);
        self.ensure_poll_loop(cancel);
        Ok(())
    }

    async fn watch_pod_status_change(
        &self,
        sink: tokio::sync::mpsc::Sender<WorkerObservation>,
        cancel: CancellationToken,
    ) -> Result<(), Error> {
        *self.inner.worker_sink.lock().expect("worker sink lock poisoned") = Some(sink);
        self.ensure_poll_loop(cancel);
        Ok(())
    }

    async fn watch_pod_delete(
        &self,
        sink: tokio::sync::mpsc::Sender<(String, String)>,
        cancel: CancellationToken,
    ) -> Result<(), Error> {
        // no tombstone signal distinct from the worker disappearing from a
        // list call; this poll loop derives WorkerDelete itself by diffing
        // successive snapshots keyed by worker id
        *self.inner.delete_sink.lock().expect("delete sink lock poisoned") = Some(sink);
        self.ensure_poll_loop(cancel);
        Ok(())
    }

    async fn watch_pod_terminating(
        &self,
        _sink: tokio::sync::mpsc::Sender<(String, String)>,
        _cancel: CancellationToken,
    ) -> Result<(), Error> {
        Err(Error::unsupported("remote provider has no terminating signal"))
    }

    async fn watch_deployment_spec_change(
        &self,
        _sink: tokio::sync::mpsc::Sender<String>,
        _cancel: CancellationToken,
    ) -> Result<(), Error> {
        Err(Error::unsupported("remote provider has no spec-change signal"))
    }

    async fn set_pod_deletion_cost(&self, _worker_id: &str, _cost: i64) -> Result<(), Error> {
        Err(Error::unsupported("remote provider has no deletion-cost hint"))
    }

    async fn mark_pod_draining(&self, _worker_id: &str) -> Result<(), Error> {
        // no external annotation surface; draining is tracked purely in
        // our own worker record for this back-end
        Ok(())
    }

    async fn get_pod_counts_by_spec(&self) -> Result<HashMap<String, PodCounts>, Error> {
        self.inner.client.pod_counts_by_spec().await
    }

    async fn delete_worker(&self, worker_id: &str) -> Result<(), Error> {
        self.inner.client.delete_worker(worker_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    /// A scriptable [`RemoteApiClient`]: each call to `poll_once` consumes
    /// the next queued app/worker listing, letting tests drive successive
    /// poll passes deterministically.
    #[derive(Default)]
    struct FakeRemoteClient {
        apps: StdMutex<Vec<Vec<AppInfo>>>,
        workers: StdMutex<HashMap<String, Vec<Vec<RemoteWorker>>>>,
    }

    #[async_trait]
    impl RemoteApiClient for FakeRemoteClient {
        async fn list_apps(&self) -> Result<Vec<AppInfo>, Error> {
            let mut apps = self.apps.lock().unwrap();
            if apps.is_empty() {
                return Ok(vec![]);
            }
            Ok(apps.remove(0))
        }

        async fn list_workers(&self, endpoint: &str) -> Result<Vec<RemoteWorker>, Error> {
            let mut workers = self.workers.lock().unwrap();
            let Some(passes) = workers.get_mut(endpoint) else {
                return Ok(vec![]);
            };
            if passes.is_empty() {
                return Ok(vec![]);
            }
            Ok(passes.remove(0))
        }

        async fn create_app(&self, _req: &DeployRequest) -> Result<(), Error> {
            Ok(())
        }
        async fn delete_app(&self, _endpoint: &str) -> Result<(), Error> {
            Ok(())
        }
        async fn scale_app(&self, _endpoint: &str, _replicas: u32) -> Result<(), Error> {
            Ok(())
        }
        async fn update_app(&self, _endpoint: &str, _patch: &UpdatePatch) -> Result<(), Error> {
            Ok(())
        }
        async fn pod_counts_by_spec(&self) -> Result<HashMap<String, PodCounts>, Error> {
            Ok(HashMap::new())
        }
        async fn delete_worker(&self, _worker_id: &str) -> Result<(), Error> {
            Ok(())
        }
    }

    fn app(name: &str, replicas: u32) -> AppInfo {
        AppInfo {
            name: name.to_string(),
            backend: "novita".to_string(),
            status: AppStatus::Running,
            replicas,
            ready_replicas: replicas,
            available_replicas: replicas,
            image: "img".to_string(),
            labels: HashMap::new(),
            created_at: chrono::Utc::now(),
            mounts: None,
        }
    }

    fn worker(id: &str, endpoint: &str, healthy: bool) -> RemoteWorker {
        RemoteWorker {
            id: id.to_string(),
            endpoint: endpoint.to_string(),
            state: if healthy { "running".into() } else { "pending".into() },
            error: None,
            message: None,
            healthy,
            ip: None,
            created_at: None,
            started_at: None,
        }
    }

    fn inner_with(client: FakeRemoteClient) -> std::sync::Arc<RemoteInner> {
        std::sync::Arc::new(RemoteInner {
            client: Box::new(client),
            poll_interval: Duration::from_secs(10),
            snapshot: Mutex::new(Snapshot::default()),
            worker_sink: Mutex::new(None),
            replica_sink: Mutex::new(None),
            delete_sink: Mutex::new(None),
            poll_started: std::sync::atomic::AtomicBool::new(false),
        })
    }

    #[tokio::test]
    async fn first_pass_synthesizes_replica_change_for_existing_endpoints() {
        let client = FakeRemoteClient::default();
        *client.apps.lock().unwrap() = vec![vec![app("e1", 2)]];
        let inner = inner_with(client);
        let (replica_tx, mut replica_rx) = tokio::sync::mpsc::channel(8);
        *inner.replica_sink.lock().unwrap() = Some(replica_tx);
        inner.poll_once().await.unwrap();
        let delta = replica_rx.try_recv().expect("first pass should synthesize a ReplicaChange");
        assert_eq!(delta.endpoint, "e1");
    }

    #[tokio::test]
    async fn unchanged_endpoint_emits_nothing_on_second_pass() {
        let client = FakeRemoteClient::default();
        *client.apps.lock().unwrap() = vec![vec![app("e1", 2)], vec![app("e1", 2)]];
        let inner = inner_with(client);
        let (replica_tx, mut replica_rx) = tokio::sync::mpsc::channel(8);
        *inner.replica_sink.lock().unwrap() = Some(replica_tx);
        inner.poll_once().await.unwrap();
        replica_rx.try_recv().unwrap();
        inner.poll_once().await.unwrap();
        assert!(replica_rx.try_recv().is_err(), "no change between passes should emit nothing");
    }

    #[tokio::test]
    async fn vanished_worker_synthesizes_delete() {
        let client = FakeRemoteClient::default();
        *client.apps.lock().unwrap() = vec![vec![app("e1", 1)], vec![app("e1", 1)]];
        *client.workers.lock().unwrap() =
            HashMap::from([("e1".to_string(), vec![vec![worker("w1", "e1", true)], vec![]])]);
        let inner = inner_with(client);
        let (worker_tx, mut worker_rx) = tokio::sync::mpsc::channel(8);
        let (delete_tx, mut delete_rx) = tokio::sync::mpsc::channel(8);
        *inner.worker_sink.lock().unwrap() = Some(worker_tx);
        *inner.delete_sink.lock().unwrap() = Some(delete_tx);

        inner.poll_once().await.unwrap();
        let obs = worker_rx.try_recv().expect("first sighting should emit a status change");
        assert_eq!(obs.worker_id, "w1");
        assert!(delete_rx.try_recv().is_err());

        inner.poll_once().await.unwrap();
        let (id, endpoint) = delete_rx.try_recv().expect("vanished worker should synthesize a delete");
        assert_eq!(id, "w1");
        assert_eq!(endpoint, "e1");
    }

    #[tokio::test]
    async fn changed_worker_state_emits_status_change() {
        let client = FakeRemoteClient::default();
        *client.apps.lock().unwrap() = vec![vec![app("e1", 1)], vec![app("e1", 1)]];
        *client.workers.lock().unwrap() = HashMap::from([(
            "e1".to_string(),
            vec![vec![worker("w1", "e1", false)], vec![worker("w1", "e1", true)]],
        )]);
        let inner = inner_with(client);
        let (worker_tx, mut worker_rx) = tokio::sync::mpsc::channel(8);
        *inner.worker_sink.lock().unwrap() = Some(worker_tx);

        inner.poll_once().await.unwrap();
        worker_rx.try_recv().unwrap();
        inner.poll_once().await.unwrap();
        let obs = worker_rx.try_recv().expect("healthy flip should emit a status change");
        assert!(obs.healthy);
    }
}
