//! The control plane daemon entry point

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use fleet_scaler::args::Args;
use fleet_scaler::config::{Config, DeploymentBackend};
use fleet_scaler::libs::autoscaler::{Autoscaler, IdleTimeTracker, PendingTaskCounter};
use fleet_scaler::libs::capacity::CapacityManager;
use fleet_scaler::libs::providers::{DeploymentProvider, K8sProvider, RemoteProvider, StubProvider};
use fleet_scaler::libs::releaser::ResourceReleaser;
use fleet_scaler::libs::{CancellationToken, Engine};
use fleet_scaler::logging;
use fleet_scaler::models::Spec;
use fleet_scaler::repository::{MemoryEndpointRepository, MemoryWorkerRepository};

/// The queue subsystem's pending-task counts are an external collaborator
///; a control plane with nothing else wired up reports zero
/// pending everywhere so the autoscaler never fabricates a scale-up.
struct NoPendingTasks;
impl PendingTaskCounter for NoPendingTasks {
    fn pending_count(&self, _endpoint: &str) -> u32 {
        0
    }
}

struct NoIdleTracking;
impl IdleTimeTracker for NoIdleTracking {
    fn idle_duration(&self, _endpoint: &str) -> Option<Duration> {
        None
    }
}

/// Build the one `DeploymentProvider` this process targets, per
/// `providers.deployment`. `--dry-run` always forces the stub
/// regardless of config, for exercising the engine without a live back-end.
async fn build_provider(conf: &Config, dry_run: bool) -> Arc<dyn DeploymentProvider> {
    if dry_run {
        return Arc::new(StubProvider::new("dry-run"));
    }
    match conf.providers.deployment {
        DeploymentBackend::K8s if conf.k8s.enabled => {
            let client = kube::Client::try_default()
                .await
                .expect("failed to build kubernetes client");
            let specs: Vec<Spec> = Vec::new();
            Arc::new(K8sProvider::new("k8s", conf.k8s.namespace.clone(), client, specs))
        }
        DeploymentBackend::Novita if conf.novita.enabled => {
            let base_url = conf.novita.base_url.clone().unwrap_or_default();
            let client = fleet_scaler::libs::providers::HttpRemoteClient::new(base_url, conf.novita.api_key.clone());
            Arc::new(RemoteProvider::new(
                "novita",
                Box::new(client),
                Duration::from_secs(conf.novita.poll_interval),
            ))
        }
        // docker/custom back-ends, or a configured provider that isn't
        // actually enabled in this config: not yet implemented, so every
        // call fails with UNSUPPORTED rather than panicking at startup
        //
        _ => Arc::new(StubProvider::new("unconfigured")),
    }
}

#[tokio::main]
async fn main() {
    // install a crypto provider for rustls; required once rustls 0.23
    // stops auto-selecting one, safe to ignore if already installed
    // https://github.com/rustls/rustls/issues/1938
    let _ = rustls::crypto::ring::default_provider().install_default();

    let args = Args::parse();
    let conf = Config::load(std::path::Path::new(&args.config)).expect("failed to load config");
    logging::init("fleet-scaler");

    let provider = build_provider(&conf, args.dry_run).await;
    let mut providers: HashMap<String, Arc<dyn DeploymentProvider>> = HashMap::new();
    providers.insert(provider.name().to_string(), provider);

    let endpoints = Arc::new(MemoryEndpointRepository::new());
    let workers = Arc::new(MemoryWorkerRepository::new());
    let capacity = Arc::new(CapacityManager::generic());
    let autoscaler = Arc::new(Autoscaler::new(
        endpoints.clone(),
        workers.clone(),
        capacity.clone(),
        Arc::new(NoPendingTasks),
        Arc::new(NoIdleTracking),
        conf.autoscaler.max_gpu_count,
        u64::from(conf.autoscaler.max_cpu_cores) * 1000,
        u64::from(conf.autoscaler.max_memory_gb) * 1024,
        Duration::from_secs(conf.autoscaler.starvation_time),
    ));
    let releaser = Arc::new(ResourceReleaser::new(
        workers.clone(),
        endpoints.clone(),
        Duration::from_secs(conf.resource_releaser.image_pull_timeout),
        conf.resource_releaser.max_retries,
    ));

    let cancel = CancellationToken::new();
    let engine = Engine::new(
        providers,
        endpoints,
        workers,
        capacity,
        autoscaler,
        releaser,
        fleet_scaler::libs::engine::EngineIntervals {
            autoscaler: Duration::from_secs(conf.autoscaler.interval),
            capacity: Duration::from_secs(conf.resource_releaser.check_interval),
            resource_releaser: Duration::from_secs(conf.resource_releaser.check_interval),
        },
        cancel.clone(),
    );

    // propagate ctrl-c into the root cancellation token so every long-lived
    // task, provider call, and subscriber callback winds down together
    //
    let shutdown_cancel = cancel.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::event!(tracing::Level::INFO, "shutdown signal received, cancelling");
        shutdown_cancel.cancel();
    });

    engine.start().await.expect("engine crashed");
}
