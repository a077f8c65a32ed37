//! Data types shared across the control plane

mod endpoint;
mod events;
mod scaling;
mod spec;
mod worker;

pub use endpoint::{AppInfo, AppStatus, AutoscalingPolicy, Endpoint, RuntimeState};
pub use events::{IngestEvent, LifecycleEvent, WorkerObservation};
pub use scaling::{ScalingEvent, ScalingReason};
pub use spec::{PlatformBinding, Resources, Spec, SpecCapacity};
pub use worker::{FailureRecord, FailureType, Lifecycle, Worker};
