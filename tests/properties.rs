//! Property-based tests for the system's core invariants, complementing
//! the table-driven unit tests already living alongside each component.

use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;

use fleet_scaler::config::Config;
use fleet_scaler::libs::autoscaler::{Autoscaler, IdleTimeTracker, PendingTaskCounter};
use fleet_scaler::libs::capacity::CapacityManager;
use fleet_scaler::libs::classifier;
use fleet_scaler::libs::providers::StubProvider;
use fleet_scaler::libs::reconciler::Reconciler;
use fleet_scaler::models::{AutoscalingPolicy, Endpoint, RuntimeState, Spec, Resources, WorkerObservation};
use fleet_scaler::repository::{EndpointRepository, MemoryEndpointRepository, MemoryWorkerRepository, WorkerRepository};

fn arb_observation() -> impl Strategy<Value = WorkerObservation> {
    (
        "[a-z0-9]{1,8}",
        "[a-z0-9]{1,8}",
        prop::sample::select(vec!["Running", "Pending", "Failed"]),
        any::<bool>(),
        prop::option::of("[a-z ]{0,16}"),
        prop::option::of("[a-z ]{0,16}"),
    )
        .prop_map(|(worker_id, endpoint, phase, healthy, reason, message)| WorkerObservation {
            worker_id,
            endpoint,
            phase: phase.to_string(),
            status: "status".to_string(),
            reason,
            message,
            ip: None,
            node: None,
            healthy,
            created_at: Some(chrono::Utc::now()),
            started_at: Some(chrono::Utc::now()),
        })
}

proptest! {
    /// Property 1: reconciling the same event twice yields the same record.
    #[test]
    fn reconcile_is_idempotent(obs in arb_observation()) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            let repo = Arc::new(MemoryWorkerRepository::new());
            let reconciler = Reconciler::new(repo.clone());
            reconciler.on_status_change(obs.clone()).await.unwrap();
            let first = repo.get(&obs.endpoint, &obs.worker_id).await.unwrap().unwrap();
            reconciler.on_status_change(obs.clone()).await.unwrap();
            let second = repo.get(&obs.endpoint, &obs.worker_id).await.unwrap().unwrap();
            prop_assert_eq!(first, second);
            Ok(())
        })?;
    }

    /// Property 3: `classify` is a pure function of its inputs.
    #[test]
    fn classify_is_pure(reason in "[a-zA-Z ]{0,24}", message in "[a-zA-Z ]{0,24}") {
        prop_assert_eq!(classifier::classify(&reason, &message), classifier::classify(&reason, &message));
    }

    /// Property 4: validate is idempotent, and non-positive duration/count
    /// fields fall back to their documented defaults.
    #[test]
    fn validate_is_idempotent_for_any_interval(
        queue_concurrency in any::<u32>(),
        autoscaler_interval in any::<u64>(),
        max_retries in any::<u32>(),
    ) {
        let mut cfg = Config::default();
        cfg.queue.concurrency = queue_concurrency;
        cfg.autoscaler.interval = autoscaler_interval;
        cfg.resource_releaser.max_retries = max_retries;

        let once = cfg.clone().validate();
        let twice = once.clone().validate();
        prop_assert_eq!(serde_json::to_string(&once).unwrap(), serde_json::to_string(&twice).unwrap());
    }
}

struct FixedPending(u32);
impl PendingTaskCounter for FixedPending {
    fn pending_count(&self, _endpoint: &str) -> u32 {
        self.0
    }
}

struct NoIdle;
impl IdleTimeTracker for NoIdle {
    fn idle_duration(&self, _endpoint: &str) -> Option<Duration> {
        None
    }
}

proptest! {
    /// Property 6: an autoscaler tick never proposes a scale-up that would
    /// push the cluster over its configured GPU ceiling.
    #[test]
    fn autoscaler_never_exceeds_gpu_ceiling(
        gpu_per_replica in 1u32..8,
        current in 0u32..8,
        pending in 1u32..100,
    ) {
        // keep the starting point itself within the ceiling; the property
        // under test is that the autoscaler's own scale-up never pushes
        // past it, not that it corrects a pre-existing over-allocation
        let current = current.min(64 / gpu_per_replica);
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            const MAX_GPU: u32 = 64;
            let endpoints = Arc::new(MemoryEndpointRepository::new());
            let endpoint = Endpoint {
                name: "e1".to_string(),
                spec_name: "s1".to_string(),
                backend: "stub".to_string(),
                image: "img".to_string(),
                desired_replicas: None,
                autoscaling: Some(AutoscalingPolicy { min_replicas: 0, max_replicas: 200, scale_up_threshold: 1, ..Default::default() }),
                task_timeout: 60,
                env: Default::default(),
                mounts: vec![],
                runtime: RuntimeState { observed_replicas: current, ready_replicas: current, available_replicas: current, ..Default::default() },
                created_at: chrono::Utc::now(),
            };
            endpoints.put(endpoint).await.unwrap();
            let workers = Arc::new(MemoryWorkerRepository::new());
            let capacity = Arc::new(CapacityManager::generic());
            let autoscaler = Autoscaler::new(
                endpoints,
                workers,
                capacity.clone(),
                Arc::new(FixedPending(pending)),
                Arc::new(NoIdle),
                MAX_GPU,
                u64::MAX,
                u64::MAX,
                Duration::from_secs(120),
            );
            let provider = StubProvider::new("stub");
            provider.allow_mutations();
            let spec = Spec {
                name: "s1".to_string(),
                gpu_type: "a100".to_string(),
                resources: Resources { gpu_count: gpu_per_replica, ..Default::default() },
                spot: false,
                bindings: Default::default(),
            };
            provider.specs.write().unwrap().insert("s1".to_string(), spec.clone());
            capacity.refresh(&[spec], &Default::default()).await.unwrap();

            let events = autoscaler.tick(&provider).await.unwrap();
            prop_assert_eq!(events.len(), 1);
            prop_assert!(u64::from(events[0].to) * u64::from(gpu_per_replica) <= u64::from(MAX_GPU));
            Ok(())
        })?;
    }
}
