//! `fleet-scaler`: the reconciliation and lifecycle engine for a
//! serverless GPU-workload control plane.
//!
//! This crate is the reconciliation core — the provider abstraction, the
//! watch/poll ingest pipeline, the worker lifecycle state machine, the
//! autoscaler, the rolling-update drain policy, and the capacity tracker.
//! HTTP handlers, the SQL/Scylla repositories, the metrics collector, and
//! cloud-SDK clients sit outside this crate and are consumed here only
//! through the narrow interfaces in [`repository`] and [`libs::providers`].

pub mod args;
pub mod config;
pub mod error;
pub mod libs;
pub mod logging;
pub mod models;
pub mod repository;

#[cfg(any(test, feature = "test-utilities"))]
pub mod test_utilities;
