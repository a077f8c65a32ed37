//! The cluster-orchestrator back-end: a pod/deployment-based provider with
//! a rich watch API, deletion-cost annotations, and node-pool queries
//!
//! Grounded on the teacher's `schedulers/k8s.rs` + `k8s/pods.rs` (kube
//! `Api<Pod>`/`Api<Deployment>` CRUD, `ListParams`/`DeleteParams`,
//! 404-is-not-an-error delete idiom) and `k8s/nodes.rs` (per-node
//! allocatable resource queries, generalized here into the node-pool
//! capacity hook). Each endpoint is materialized as one k8s `Deployment`
//! whose pods this provider watches.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::{watcher, WatchStreamExt};
use serde_json::json;
use tracing::{event, instrument, Level};

use crate::error::{Error, ErrorKind};
use crate::models::{AppInfo, AppStatus, Spec};

use super::{
    derive_status, DeployRequest, DeploymentProvider, PodCounts, ReplicaDelta, UpdatePatch,
    WorkerObservation,
};
use crate::libs::cancellation::CancellationToken;

/// The label this provider stamps on every `Deployment`/`Pod` it owns, used
/// to scope watches and list calls to just this control plane's workloads
const OWNER_LABEL: &str = "fleet.io/endpoint";
/// Annotation carrying the back-end deletion-priority hint — modeled on k8s's own
/// `controller.kubernetes.io/pod-deletion-cost` annotation
const DELETION_COST_ANNOTATION: &str = "controller.kubernetes.io/pod-deletion-cost";
/// Annotation this provider sets for operator visibility once a worker is
/// draining
const DRAINING_ANNOTATION: &str = "fleet.io/draining";

/// The cluster-orchestrator deployment provider
pub struct K8sProvider {
    name: String,
    namespace: String,
    client: kube::Client,
    /// Resource profiles this cluster knows about; specs are a configured
    /// catalog, not something the orchestrator API itself reports, so they
    /// are seeded at construction time rather than listed live
    specs: RwLock<HashMap<String, Spec>>,
}

impl K8sProvider {
    #[must_use]
    pub fn new(name: impl Into<String>, namespace: impl Into<String>, client: kube::Client, specs: Vec<Spec>) -> Self {
        K8sProvider {
            name: name.into(),
            namespace: namespace.into(),
            client,
            specs: RwLock::new(specs.into_iter().map(|s| (s.name.clone(), s)).collect()),
        }
    }

    fn deployments(&self) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn list_params(&self) -> ListParams {
        ListParams::default().labels(OWNER_LABEL)
    }

    /// Build the `Deployment` manifest for a new/updated endpoint
    fn build_deployment(&self, req: &DeployRequest) -> Deployment {
        let env: Vec<serde_json::Value> = req
            .env
            .iter()
            .map(|(k, v)| json!({ "name": k, "value": v }))
            .collect();
        let raw = json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {
                "name": req.endpoint,
                "namespace": self.namespace,
                "labels": { OWNER_LABEL: req.endpoint, "fleet.io/spec": req.spec_name },
            },
            "spec": {
                "replicas": req.replicas,
                "selector": { "matchLabels": { OWNER_LABEL: req.endpoint } },
                "template": {
                    "metadata": { "labels": { OWNER_LABEL: req.endpoint, "fleet.io/spec": req.spec_name } },
                    "spec": {
                        "containers": [{
                            "name": "worker",
                            "image": req.image,
                            "env": env,
                        }],
                        "terminationGracePeriodSeconds": req.task_timeout,
                    }
                }
            }
        });
        serde_json::from_value(raw).expect("statically valid deployment manifest")
    }

    /// Map a live `Deployment` to the canonical [`AppInfo`] view
    fn to_app_info(&self, dep: &Deployment) -> AppInfo {
        let name = dep.metadata.name.clone().unwrap_or_default();
        let spec = dep.spec.as_ref();
        let status = dep.status.as_ref();
        let replicas = spec.and_then(|s| s.replicas).unwrap_or(0) as u32;
        let ready = status.and_then(|s| s.ready_replicas).unwrap_or(0) as u32;
        let available = status.and_then(|s| s.available_replicas).unwrap_or(0) as u32;
        let image = spec
            .and_then(|s| s.template.spec.as_ref())
            .and_then(|p| p.containers.first())
            .and_then(|c| c.image.clone())
            .unwrap_or_default();
        let labels = dep.metadata.labels.clone().unwrap_or_default().into_iter().collect();
        let created_at = dep
            .metadata
            .creation_timestamp
            .as_ref()
            .map(|t| t.0)
            .unwrap_or_else(chrono::Utc::now);
        let status = derive_status(replicas, available, "unknown").clone_for_dep(status);
        AppInfo {
            name,
            backend: self.name.clone(),
            status,
            replicas,
            ready_replicas: ready,
            available_replicas: available,
            image,
            labels,
            created_at,
            mounts: None,
        }
    }
}

/// Small helper trait so [`K8sProvider::to_app_info`] can fall back to a
/// raw condition-derived status when the replica-count derivation is
/// ambiguous (neither `Running` nor `Stopped`)
trait DeploymentStatusFallback {
    fn clone_for_dep(self, status: Option<&k8s_openapi::api::apps::v1::DeploymentStatus>) -> AppStatus;
}

impl DeploymentStatusFallback for AppStatus {
    fn clone_for_dep(self, status: Option<&k8s_openapi::api::apps::v1::DeploymentStatus>) -> AppStatus {
        if !matches!(self, AppStatus::Unknown) {
            return self;
        }
        let raw = status
            .and_then(|s| s.conditions.as_ref())
            .and_then(|conds| conds.first())
            .map(|c| c.reason.clone().unwrap_or_default())
            .unwrap_or_default();
        AppStatus::from_backend_str(&raw)
    }
}

#[async_trait]
impl DeploymentProvider for K8sProvider {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(name = "K8sProvider::deploy", skip(self), err(Debug))]
    async fn deploy(&self, req: DeployRequest) -> Result<(), Error> {
        let api = self.deployments();
        if api.get_opt(&req.endpoint).await?.is_some() {
            return Err(Error::new(ErrorKind::AlreadyExists, format!("endpoint {} exists", req.endpoint)));
        }
        let deployment = self.build_deployment(&req);
        api.create(&PostParams::default(), &deployment).await?;
        Ok(())
    }

    #[instrument(name = "K8sProvider::get", skip(self), err(Debug))]
    async fn get(&self, endpoint: &str) -> Result<AppInfo, Error> {
        let dep = self
            .deployments()
            .get_opt(endpoint)
            .await?
            .ok_or_else(|| Error::not_found(format!("no such endpoint: {endpoint}")))?;
        Ok(self.to_app_info(&dep))
    }

    #[instrument(name = "K8sProvider::list", skip(self), err(Debug))]
    async fn list(&self) -> Result<Vec<AppInfo>, Error> {
        let deployments = self.deployments().list(&self.list_params()).await?;
        Ok(deployments.iter().map(|d| self.to_app_info(d)).collect())
    }

    #[instrument(name = "K8sProvider::delete", skip(self), err(Debug))]
    async fn delete(&self, endpoint: &str) -> Result<(), Error> {
        match self.deployments().delete(endpoint, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(api_err)) if api_err.code == 404 => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    #[instrument(name = "K8sProvider::scale", skip(self), err(Debug))]
    async fn scale(&self, endpoint: &str, replicas: u32) -> Result<(), Error> {
        let patch = json!({ "spec": { "replicas": replicas } });
        self.deployments()
            .patch(endpoint, &PatchParams::default(), &Patch::Merge(patch))
            .await?;
        Ok(())
    }

    #[instrument(name = "K8sProvider::update", skip(self), err(Debug))]
    async fn update(&self, endpoint: &str, patch: UpdatePatch) -> Result<(), Error> {
        // Deployment's PATCH API is a strategic/JSON merge patch, not a
        // full replace, but we still read-modify-write the container spec
        // ourselves so a partial `UpdatePatch` (e.g. image only) doesn't
        // accidentally clear the rest of the container list
        let current = self
            .deployments()
            .get_opt(endpoint)
            .await?
            .ok_or_else(|| Error::not_found(format!("no such endpoint: {endpoint}")))?;
        let mut container = current
            .spec
            .as_ref()
            .and_then(|s| s.template.spec.as_ref())
            .and_then(|p| p.containers.first())
            .cloned()
            .unwrap_or_default();
        if let Some(image) = patch.image {
            container.image = Some(image);
        }
        if let Some(env) = patch.env {
            container.env = Some(
                env.into_iter()
                    .map(|(name, value)| k8s_openapi::api::core::v1::EnvVar { name, value: Some(value), value_from: None })
                    .collect(),
            );
        }
        let replicas = patch.max_replicas.or(patch.min_replicas);
        let merge = json!({
            "spec": {
                "replicas": replicas,
                "template": { "spec": { "containers": [container] } }
            }
        });
        self.deployments()
            .patch(endpoint, &PatchParams::default(), &Patch::Merge(merge))
            .await?;
        Ok(())
    }

    #[instrument(name = "K8sProvider::get_status", skip(self), err(Debug))]
    async fn get_status(&self, endpoint: &str) -> Result<AppStatus, Error> {
        Ok(self.get(endpoint).await?.status)
    }

    async fn list_specs(&self) -> Result<Vec<Spec>, Error> {
        Ok(self.specs.read().expect("specs lock poisoned").values().cloned().collect())
    }

    async fn get_spec(&self, name: &str) -> Result<Option<Spec>, Error> {
        Ok(self.specs.read().expect("specs lock poisoned").get(name).cloned())
    }

    #[instrument(name = "K8sProvider::watch_replicas", skip(self, sink), err(Debug))]
    async fn watch_replicas(
        &self,
        sink: tokio::sync::mpsc::Sender<ReplicaDelta>,
        cancel: CancellationToken,
    ) -> Result<(), Error> {
        let api = self.deployments();
        tokio::spawn(async move {
            let stream = watcher(api, watcher::Config::default().labels(OWNER_LABEL)).touched_objects();
            futures::pin_mut!(stream);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    next = stream.next() => {
                        match next {
                            Some(Ok(dep)) => {
                                let delta = deployment_to_delta(&dep);
                                if sink.send(delta).await.is_err() {
                                    break;
                                }
                            }
                            Some(Err(err)) => {
                                event!(Level::WARN, error = %err, "k8s replica watch error, continuing");
                            }
                            None => break,
                        }
                    }
                }
            }
        });
        Ok(())
    }

    #[instrument(name = "K8sProvider::watch_pod_status_change", skip(self, sink), err(Debug))]
    async fn watch_pod_status_change(
        &self,
        sink: tokio::sync::mpsc::Sender<WorkerObservation>,
        cancel: CancellationToken,
    ) -> Result<(), Error> {
        let api = self.pods();
        tokio::spawn(async move {
            let stream = watcher(api, watcher::Config::default()).touched_objects();
            futures::pin_mut!(stream);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    next = stream.next() => {
                        match next {
                            Some(Ok(pod)) => {
                                if let Some(obs) = pod_to_observation(&pod) {
                                    if sink.send(obs).await.is_err() {
                                        break;
                                    }
                                }
                            }
                            Some(Err(err)) => {
                                event!(Level::WARN, error = %err, "k8s pod watch error, continuing");
                            }
                            None => break,
                        }
                    }
                }
            }
        });
        Ok(())
    }

    #[instrument(name = "K8sProvider::watch_pod_delete", skip(self, sink), err(Debug))]
    async fn watch_pod_delete(
        &self,
        sink: tokio::sync::mpsc::Sender<(String, String)>,
        cancel: CancellationToken,
    ) -> Result<(), Error> {
        let api = self.pods();
        tokio::spawn(async move {
            let stream = watcher(api, watcher::Config::default());
            futures::pin_mut!(stream);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    next = stream.next() => {
                        match next {
                            Some(Ok(watcher::Event::Delete(pod))) => {
                                let id = pod.metadata.name.clone().unwrap_or_default();
                                let endpoint = pod_endpoint(&pod);
                                if sink.send((id, endpoint)).await.is_err() {
                                    break;
                                }
                            }
                            Some(Ok(_)) => {}
                            Some(Err(err)) => {
                                event!(Level::WARN, error = %err, "k8s pod delete watch error, continuing");
                            }
                            None => break,
                        }
                    }
                }
            }
        });
        Ok(())
    }

    #[instrument(name = "K8sProvider::watch_pod_terminating", skip(self, sink), err(Debug))]
    async fn watch_pod_terminating(
        &self,
        sink: tokio::sync::mpsc::Sender<(String, String)>,
        cancel: CancellationToken,
    ) -> Result<(), Error> {
        let api = self.pods();
        tokio::spawn(async move {
            let stream = watcher(api, watcher::Config::default()).touched_objects();
            futures::pin_mut!(stream);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    next = stream.next() => {
                        match next {
                            // a non-null deletionTimestamp means the back-end has
                            // marked this pod for termination but it isn't gone
                            // yet
                            Some(Ok(pod)) if pod.metadata.deletion_timestamp.is_some() => {
                                let id = pod.metadata.name.clone().unwrap_or_default();
                                let endpoint = pod_endpoint(&pod);
                                if sink.send((id, endpoint)).await.is_err() {
                                    break;
                                }
                            }
                            Some(Ok(_)) => {}
                            Some(Err(err)) => {
                                event!(Level::WARN, error = %err, "k8s pod terminating watch error, continuing");
                            }
                            None => break,
                        }
                    }
                }
            }
        });
        Ok(())
    }

    #[instrument(name = "K8sProvider::watch_deployment_spec_change", skip(self, sink), err(Debug))]
    async fn watch_deployment_spec_change(
        &self,
        sink: tokio::sync::mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> Result<(), Error> {
        let api = self.deployments();
        tokio::spawn(async move {
            let mut last_gen: HashMap<String, i64> = HashMap::new();
            let stream = watcher(api, watcher::Config::default()).touched_objects();
            futures::pin_mut!(stream);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    next = stream.next() => {
                        match next {
                            Some(Ok(dep)) => {
                                let name = dep.metadata.name.clone().unwrap_or_default();
                                // `metadata.generation` only increments on spec
                                // changes, never on status-only updates — exactly
                                // the "desired config changed" signal a
                                // spec-change watcher needs
                                let gen = dep.metadata.generation.unwrap_or(0);
                                if last_gen.get(&name) != Some(&gen) {
                                    last_gen.insert(name.clone(), gen);
                                    if sink.send(name).await.is_err() {
                                        break;
                                    }
                                }
                            }
                            Some(Err(err)) => {
                                event!(Level::WARN, error = %err, "k8s spec-change watch error, continuing");
                            }
                            None => break,
                        }
                    }
                }
            }
        });
        Ok(())
    }

    #[instrument(name = "K8sProvider::set_pod_deletion_cost", skip(self), err(Debug))]
    async fn set_pod_deletion_cost(&self, worker_id: &str, cost: i64) -> Result<(), Error> {
        let patch = json!({ "metadata": { "annotations": { DELETION_COST_ANNOTATION: cost.to_string() } } });
        self.pods()
            .patch(worker_id, &PatchParams::default(), &Patch::Merge(patch))
            .await?;
        Ok(())
    }

    #[instrument(name = "K8sProvider::mark_pod_draining", skip(self), err(Debug))]
    async fn mark_pod_draining(&self, worker_id: &str) -> Result<(), Error> {
        let patch = json!({ "metadata": { "annotations": { DRAINING_ANNOTATION: "true" } } });
        self.pods()
            .patch(worker_id, &PatchParams::default(), &Patch::Merge(patch))
            .await?;
        Ok(())
    }

    #[instrument(name = "K8sProvider::delete_worker", skip(self), err(Debug))]
    async fn delete_worker(&self, worker_id: &str) -> Result<(), Error> {
        match self.pods().delete(worker_id, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(api_err)) if api_err.code == 404 => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    #[instrument(name = "K8sProvider::get_pod_counts_by_spec", skip(self), err(Debug))]
    async fn get_pod_counts_by_spec(&self) -> Result<HashMap<String, PodCounts>, Error> {
        let pods = self.pods().list(&ListParams::default()).await?;
        let mut counts: HashMap<String, PodCounts> = HashMap::new();
        for pod in &pods {
            let Some(spec_name) = pod.metadata.labels.as_ref().and_then(|l| l.get("fleet.io/spec")) else {
                continue;
            };
            let entry = counts.entry(spec_name.clone()).or_default();
            match pod.status.as_ref().and_then(|s| s.phase.as_deref()) {
                Some("Running") => entry.running += 1,
                Some("Pending") => entry.pending += 1,
                _ => {}
            }
        }
        Ok(counts)
    }
}

fn pod_endpoint(pod: &Pod) -> String {
    pod.metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(OWNER_LABEL))
        .cloned()
        .unwrap_or_default()
}

fn deployment_to_delta(dep: &Deployment) -> ReplicaDelta {
    let endpoint = dep.metadata.name.clone().unwrap_or_default();
    let spec = dep.spec.as_ref();
    let status = dep.status.as_ref();
    let desired = spec.and_then(|s| s.replicas).unwrap_or(0) as u32;
    let ready = status.and_then(|s| s.ready_replicas).unwrap_or(0) as u32;
    let available = status.and_then(|s| s.available_replicas).unwrap_or(0) as u32;
    let conditions = status
        .and_then(|s| s.conditions.as_ref())
        .map(|conds| conds.iter().filter_map(|c| c.reason.clone()).collect())
        .unwrap_or_default();
    ReplicaDelta { endpoint, desired, ready, available, conditions }
}

fn pod_to_observation(pod: &Pod) -> Option<WorkerObservation> {
    let id = pod.metadata.name.clone()?;
    let endpoint = pod_endpoint(pod);
    if endpoint.is_empty() {
        // not one of ours
        return None;
    }
    let status = pod.status.as_ref();
    let phase = status.and_then(|s| s.phase.clone()).unwrap_or_default();
    let container_status = status
        .and_then(|s| s.container_statuses.as_ref())
        .and_then(|cs| cs.first());
    let (reason, message) = container_status
        .and_then(|cs| cs.state.as_ref())
        .map(|state| {
            if let Some(waiting) = &state.waiting {
                (waiting.reason.clone(), waiting.message.clone())
            } else if let Some(terminated) = &state.terminated {
                (terminated.reason.clone(), terminated.message.clone())
            } else {
                (None, None)
            }
        })
        .unwrap_or((None, None));
    let healthy = phase.eq_ignore_ascii_case("running")
        && container_status.is_none_or(|cs| cs.ready);
    let ip = status.and_then(|s| s.pod_ip.clone());
    let node = pod.spec.as_ref().and_then(|s| s.node_name.clone());
    let created_at = pod.metadata.creation_timestamp.as_ref().map(|t| t.0);
    let started_at = status.and_then(|s| s.start_time.as_ref()).map(|t| t.0);
    Some(WorkerObservation {
        worker_id: id,
        endpoint,
        phase,
        status: status.and_then(|s| s.phase.clone()).unwrap_or_default(),
        reason,
        message,
        ip,
        node,
        healthy,
        created_at,
        started_at,
    })
}
