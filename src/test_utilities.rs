//! Builders for the fakes used across this crate's test suites, feature
//! gated the way the teacher gates its own `test-utilities` feature so
//! integration tests in `tests/` can depend on `fleet-scaler/test-utilities`
//! without pulling test code into release builds.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;

use crate::libs::providers::StubProvider;
use crate::models::{AppInfo, AppStatus, AutoscalingPolicy, Endpoint, RuntimeState};
use crate::repository::{MemoryEndpointRepository, MemoryWorkerRepository};

/// A fresh pair of in-memory repositories, the default store for any test
/// that doesn't care which concrete `EndpointRepository`/`WorkerRepository`
/// it gets
#[must_use]
pub fn memory_repositories() -> (Arc<MemoryEndpointRepository>, Arc<MemoryWorkerRepository>) {
    (Arc::new(MemoryEndpointRepository::new()), Arc::new(MemoryWorkerRepository::new()))
}

/// An autoscaling-enabled endpoint with sane defaults, for tests that only
/// care about one or two overridden fields
#[must_use]
pub fn fake_endpoint(name: &str, spec_name: &str) -> Endpoint {
    Endpoint {
        name: name.to_string(),
        spec_name: spec_name.to_string(),
        backend: "stub".to_string(),
        image: "img:latest".to_string(),
        desired_replicas: None,
        autoscaling: Some(AutoscalingPolicy::default()),
        task_timeout: 60,
        env: HashMap::new(),
        mounts: Vec::new(),
        runtime: RuntimeState::default(),
        created_at: Utc::now(),
    }
}

/// A fixed-size (non-autoscaling) endpoint at a given replica count
#[must_use]
pub fn fake_fixed_endpoint(name: &str, spec_name: &str, replicas: u32) -> Endpoint {
    let mut endpoint = fake_endpoint(name, spec_name);
    endpoint.autoscaling = None;
    endpoint.desired_replicas = Some(replicas);
    endpoint.runtime.observed_replicas = replicas;
    endpoint.runtime.ready_replicas = replicas;
    endpoint.runtime.available_replicas = replicas;
    endpoint
}

/// A [`StubProvider`] pre-seeded with one app and mutations enabled, for
/// tests that exercise a successful scale/update path without a live
/// back-end
#[must_use]
pub fn seeded_stub_provider(name: &str, endpoint: &str, replicas: u32) -> StubProvider {
    let stub = StubProvider::new(name);
    stub.allow_mutations();
    let mut apps = stub.apps.write().expect("stub apps lock poisoned");
    apps.insert(
        endpoint.to_string(),
        AppInfo {
            name: endpoint.to_string(),
            backend: name.to_string(),
            status: AppStatus::Running,
            replicas,
            ready_replicas: replicas,
            available_replicas: replicas,
            image: "img:latest".to_string(),
            labels: HashMap::new(),
            created_at: Utc::now(),
            mounts: None,
        },
    );
    drop(apps);
    stub
}
