//! The top-level control plane
//!
//! Wires the provider registry, Event Ingestor, Worker State Reconciler,
//! Drain Coordinator, Capacity Manager, Autoscaler, and Resource Releaser
//! into one runnable process, the way the teacher's `Scaler`
//! (`scaler.rs::Scaler`) wires its schedulers/cache/task queue together.
//! Control flow: back-end adapter -> Event Ingestor -> (Worker State
//! Reconciler ∥ Drain Coordinator ∥ Capacity Manager). The Autoscaler
//! and Resource Releaser each run on their own tick, independent of the
//! ingest pipeline.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{event, instrument, Level};

use crate::error::Error;
use crate::libs::autoscaler::Autoscaler;
use crate::libs::capacity::CapacityManager;
use crate::libs::drain::DrainCoordinator;
use crate::libs::ingestor::EventIngestor;
use crate::libs::providers::DeploymentProvider;
use crate::libs::reconciler::Reconciler;
use crate::libs::releaser::ResourceReleaser;
use crate::models::IngestEvent;
use crate::repository::{EndpointRepository, WorkerRepository};

use super::cancellation::CancellationToken;

/// How often the capacity manager, autoscaler, and resource releaser each
/// tick, independent of the event ingest pipeline
pub struct EngineIntervals {
    pub autoscaler: Duration,
    pub capacity: Duration,
    pub resource_releaser: Duration,
}

/// The assembled control plane
///
/// `providers` is keyed by back-end/cluster name, the same shape as the
/// teacher's `HashMap<String, Box<dyn Scheduler + Send>>` — multiple
/// clusters or provider accounts can run side by side under one engine.
pub struct Engine {
    providers: HashMap<String, Arc<dyn DeploymentProvider>>,
    endpoints: Arc<dyn EndpointRepository>,
    workers: Arc<dyn WorkerRepository>,
    ingestor: Arc<EventIngestor>,
    reconciler: Arc<Reconciler>,
    drain: Arc<DrainCoordinator>,
    capacity: Arc<CapacityManager>,
    autoscaler: Arc<Autoscaler>,
    releaser: Arc<ResourceReleaser>,
    intervals: EngineIntervals,
    cancel: CancellationToken,
}

impl Engine {
    /// Assemble an engine from already-constructed components. Building
    /// the individual providers (which may need a `kube::Client` or an
    /// HTTP client) and repositories is left to the caller, the same split
    /// the teacher draws between `Args`/`Conf` loading in `main.rs` and
    /// `Scaler::build`'s pure wiring.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        providers: HashMap<String, Arc<dyn DeploymentProvider>>,
        endpoints: Arc<dyn EndpointRepository>,
        workers: Arc<dyn WorkerRepository>,
        capacity: Arc<CapacityManager>,
        autoscaler: Arc<Autoscaler>,
        releaser: Arc<ResourceReleaser>,
        intervals: EngineIntervals,
        cancel: CancellationToken,
    ) -> Self {
        let ingestor = Arc::new(EventIngestor::new(cancel.clone()));
        let reconciler = Arc::new(Reconciler::new(workers.clone()));
        let drain = Arc::new(DrainCoordinator::new(workers.clone()));
        Engine {
            providers,
            endpoints,
            workers,
            ingestor,
            reconciler,
            drain,
            capacity,
            autoscaler,
            releaser,
            intervals,
            cancel,
        }
    }

    #[must_use]
    pub fn provider(&self, backend: &str) -> Option<&Arc<dyn DeploymentProvider>> {
        self.providers.get(backend)
    }

    /// Subscribe the reconciler/drain coordinator to the ingest stream and
    /// start every provider's watch adapters feeding into it. Idempotent
    /// only in the sense that calling it twice registers the subscriber
    /// and watches twice — callers should call this exactly once per
    /// engine lifetime, matching `Scaler::setup`'s "before scheduling
    /// jobs" contract.
    #[instrument(name = "Engine::init", skip(self), err(Debug))]
    pub async fn init(&self) -> Result<(), Error> {
        for (backend, provider) in &self.providers {
            self.start_watches(backend, provider.clone()).await?;
        }
        let reconciler = self.reconciler.clone();
        let drain = self.drain.clone();
        let providers = self.providers.clone();
        let workers = self.workers.clone();
        self.ingestor
            .subscribe(move |ev| {
                let reconciler = reconciler.clone();
                let drain = drain.clone();
                let providers = providers.clone();
                let workers = workers.clone();
                tokio::spawn(async move {
                    if let Err(err) = dispatch_event(&reconciler, &drain, &providers, &workers, ev).await {
                        event!(Level::ERROR, error = %err, "failed to handle ingest event");
                    }
                });
            })
            .await;
        event!(Level::INFO, providers = self.providers.len(), "engine initialized");
        Ok(())
    }

    /// Register one provider's `watch_*` adapters against the ingestor.
    /// Each watch spawns its own background task and forwards raw payloads in as
    /// [`IngestEvent`]s.
    async fn start_watches(&self, backend: &str, provider: Arc<dyn DeploymentProvider>) -> Result<(), Error> {
        let backend = backend.to_string();

        let ingestor = self.ingestor.clone();
        let (tx, mut rx) = tokio::sync::mpsc::channel(1024);
        let cancel = self.cancel.clone();
        provider.watch_pod_status_change(tx, cancel.clone()).await.ok();
        tokio::spawn(async move {
            while let Some(obs) = rx.recv().await {
                ingestor.publish(IngestEvent::WorkerStatusChange(obs)).await;
            }
        });

        let ingestor = self.ingestor.clone();
        let (tx, mut rx) = tokio::sync::mpsc::channel::<(String, String)>(1024);
        provider.watch_pod_delete(tx, cancel.clone()).await.ok();
        tokio::spawn(async move {
            while let Some((worker_id, endpoint)) = rx.recv().await {
                ingestor.publish(IngestEvent::WorkerDelete { worker_id, endpoint }).await;
            }
        });

        let ingestor = self.ingestor.clone();
        let (tx, mut rx) = tokio::sync::mpsc::channel::<(String, String)>(1024);
        provider.watch_pod_terminating(tx, cancel.clone()).await.ok();
        let terminating_backend = backend.clone();
        tokio::spawn(async move {
            while let Some((worker_id, endpoint)) = rx.recv().await {
                let _ = &terminating_backend;
                ingestor
                    .publish(IngestEvent::SpotInterruption {
                        worker_id,
                        endpoint,
                        reason: "terminating".to_string(),
                    })
                    .await;
            }
        });

        let ingestor = self.ingestor.clone();
        let (tx, mut rx) = tokio::sync::mpsc::channel::<String>(1024);
        provider.watch_deployment_spec_change(tx, cancel.clone()).await.ok();
        tokio::spawn(async move {
            while let Some(endpoint) = rx.recv().await {
                ingestor.publish(IngestEvent::DeploymentSpecChange { endpoint }).await;
            }
        });

        let ingestor = self.ingestor.clone();
        let (tx, mut rx) = tokio::sync::mpsc::channel::<(String, String, String)>(1024);
        provider.watch_spot_interruption(tx, cancel.clone()).await.ok();
        tokio::spawn(async move {
            while let Some((worker_id, endpoint, reason)) = rx.recv().await {
                ingestor.publish(IngestEvent::SpotInterruption { worker_id, endpoint, reason }).await;
            }
        });

        Ok(())
    }

    /// Run one pass of every independent tick: capacity refresh, autoscaler,
    /// resource releaser. Useful standalone for tests/dry-run; `start`
    /// calls this in a loop at the configured intervals instead.
    #[instrument(name = "Engine::single_tick", skip(self), err(Debug))]
    pub async fn single_tick(&self) -> Result<(), Error> {
        for (backend, provider) in &self.providers {
            let specs = provider.list_specs().await?;
            let counts = provider.get_pod_counts_by_spec().await?;
            self.capacity.refresh(&specs, &counts).await?;
            event!(Level::DEBUG, backend = %backend, specs = specs.len(), "capacity refreshed");
        }
        for (backend, provider) in &self.providers {
            let events = self.autoscaler.tick(provider.as_ref()).await?;
            if !events.is_empty() {
                event!(Level::DEBUG, backend = %backend, events = events.len(), "autoscaler tick complete");
            }
        }
        for (backend, provider) in &self.providers {
            let released = self.releaser.sweep(provider.as_ref()).await?;
            if !released.is_empty() {
                event!(Level::INFO, backend = %backend, released = released.len(), "resource releaser swept stuck workers");
            }
        }
        Ok(())
    }

    /// Run the engine forever: `init`, then loop `single_tick` at the
    /// shortest of the configured intervals until cancelled, mirroring
    /// `Scaler::start`'s init-then-loop shape.
    pub async fn start(&self) -> Result<(), Error> {
        self.init().await?;
        let dwell = self
            .intervals
            .autoscaler
            .min(self.intervals.capacity)
            .min(self.intervals.resource_releaser);
        loop {
            if self.cancel.is_cancelled() {
                event!(Level::INFO, "engine cancelled, stopping");
                return Ok(());
            }
            if let Err(err) = self.single_tick().await {
                event!(Level::ERROR, error = %err, "engine tick failed");
            }
            tokio::select! {
                () = self.cancel.cancelled() => return Ok(()),
                () = tokio::time::sleep(dwell) => {}
            }
        }
    }
}

/// Route one ingest event to the reconciler/drain coordinator, per the
/// control-flow diagram: worker status/delete go to the
/// reconciler; terminating/spot-interruption/spec-change go to the drain
/// coordinator. Capacity is refreshed on its own tick, not per event,
/// since it's a bulk per-spec counter rather than a per-worker one.
async fn dispatch_event(
    reconciler: &Reconciler,
    drain: &DrainCoordinator,
    providers: &HashMap<String, Arc<dyn DeploymentProvider>>,
    workers: &Arc<dyn WorkerRepository>,
    event: IngestEvent,
) -> Result<(), Error> {
    match event {
        IngestEvent::WorkerStatusChange(obs) => {
            reconciler.on_status_change(obs).await?;
        }
        IngestEvent::WorkerDelete { worker_id, endpoint } => {
            reconciler.on_delete(&endpoint, &worker_id).await?;
        }
        IngestEvent::SpotInterruption { worker_id, endpoint, reason } => {
            let Some(worker) = workers.get(&endpoint, &worker_id).await? else {
                return Ok(());
            };
            let Some(provider) = provider_for_endpoint(providers, &worker.endpoint) else {
                return Ok(());
            };
            if reason == "terminating" {
                drain.on_terminating(provider.as_ref(), &endpoint, &worker_id).await?;
            } else {
                drain.on_spot_interruption(provider.as_ref(), &endpoint, &worker_id, &reason).await?;
            }
        }
        IngestEvent::DeploymentSpecChange { endpoint } => {
            let Some(provider) = provider_for_endpoint(providers, &endpoint) else {
                return Ok(());
            };
            drain.on_spec_change(provider.as_ref(), &endpoint).await?;
        }
        IngestEvent::ReplicaChange { .. } => {}
    }
    Ok(())
}

/// Resolve the provider that owns a given endpoint. Single-provider setups
/// (the common case) always resolve; multi-provider setups should route by
/// the endpoint's own `backend` field once that's threaded through the
/// watch payload (Open Question, resolved conservatively here by falling
/// back to the first registered provider).
fn provider_for_endpoint<'a>(
    providers: &'a HashMap<String, Arc<dyn DeploymentProvider>>,
    _endpoint: &str,
) -> Option<&'a Arc<dyn DeploymentProvider>> {
    providers.values().next()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::libs::capacity::CapacityManager;
    use crate::libs::providers::StubProvider;
    use crate::models::{AutoscalingPolicy, Endpoint};
    use crate::repository::{MemoryEndpointRepository, MemoryWorkerRepository};

    struct NoPending;
    impl crate::libs::autoscaler::PendingTaskCounter for NoPending {
        fn pending_count(&self, _endpoint: &str) -> u32 {
            0
        }
    }
    struct NoIdle;
    impl crate::libs::autoscaler::IdleTimeTracker for NoIdle {
        fn idle_duration(&self, _endpoint: &str) -> Option<Duration> {
            None
        }
    }

    fn build_engine() -> (Engine, Arc<MemoryEndpointRepository>, Arc<MemoryWorkerRepository>) {
        let endpoints = Arc::new(MemoryEndpointRepository::new());
        let workers = Arc::new(MemoryWorkerRepository::new());
        let capacity = Arc::new(CapacityManager::generic());
        let autoscaler = Arc::new(Autoscaler::new(
            endpoints.clone(),
            workers.clone(),
            capacity.clone(),
            Arc::new(NoPending),
            Arc::new(NoIdle),
            64,
            512_000,
            2_048_000,
            Duration::from_secs(120),
        ));
        let releaser = Arc::new(ResourceReleaser::new(
            workers.clone(),
            endpoints.clone(),
            Duration::from_secs(300),
            3,
        ));
        let mut providers: HashMap<String, Arc<dyn DeploymentProvider>> = HashMap::new();
        providers.insert("stub".to_string(), Arc::new(StubProvider::new("stub")));
        let engine = Engine::new(
            providers,
            endpoints.clone(),
            workers.clone(),
            capacity,
            autoscaler,
            releaser,
            EngineIntervals {
                autoscaler: Duration::from_secs(10),
                capacity: Duration::from_secs(10),
                resource_releaser: Duration::from_secs(30),
            },
            CancellationToken::new(),
        );
        (engine, endpoints, workers)
    }

    #[tokio::test]
    async fn single_tick_runs_without_endpoints() {
        let (engine, _endpoints, _workers) = build_engine();
        engine.single_tick().await.unwrap();
    }

    #[tokio::test]
    async fn single_tick_denies_scale_up_without_capacity_record() {
        let (engine, endpoints, _workers) = build_engine();
        endpoints
            .put(Endpoint {
                name: "e1".to_string(),
                spec_name: "s1".to_string(),
                backend: "stub".to_string(),
                image: "img".to_string(),
                desired_replicas: None,
                autoscaling: Some(AutoscalingPolicy { scale_up_threshold: 0, ..Default::default() }),
                task_timeout: 60,
                env: Default::default(),
                mounts: vec![],
                runtime: Default::default(),
                created_at: chrono::Utc::now(),
            })
            .await
            .unwrap();
        // no spec registered on the stub provider, so the autoscaler tick
        // should resolve the scale-up proposal to a capacity denial
        // rather than erroring the whole engine tick out.
        engine.single_tick().await.unwrap();
    }

    #[tokio::test]
    async fn init_registers_a_subscriber_without_erroring() {
        let (engine, _endpoints, _workers) = build_engine();
        engine.init().await.unwrap();
    }
}
