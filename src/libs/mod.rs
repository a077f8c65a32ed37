//! The control plane's engine internals
//!
//! Laid out the way the teacher's `scaler::libs` module is: one file (or
//! submodule) per component, wired together by [`engine`].

pub mod autoscaler;
pub mod cancellation;
pub mod capacity;
pub mod classifier;
pub mod drain;
pub mod engine;
pub mod ingestor;
pub mod providers;
pub mod reconciler;
pub mod releaser;

pub use cancellation::CancellationToken;
pub use engine::Engine;
