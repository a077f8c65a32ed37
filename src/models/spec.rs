//! Resource profiles and the per-spec capacity view

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::ops::{AddAssign, SubAssign};

/// GPU/CPU/memory/storage a worker of a given [`Spec`] consumes
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Resources {
    /// Number of GPUs
    pub gpu_count: u32,
    /// CPU in millicores
    pub cpu_millicores: u64,
    /// Memory in MB
    pub memory_mb: u64,
    /// Ephemeral storage in MB
    pub ephemeral_storage_mb: u64,
}

impl Resources {
    /// Multiply every field by `n`, used when projecting a per-worker cost
    /// across a proposed replica count
    #[must_use]
    pub fn scaled(&self, n: u32) -> Resources {
        Resources {
            gpu_count: self.gpu_count.saturating_mul(n),
            cpu_millicores: self.cpu_millicores.saturating_mul(u64::from(n)),
            memory_mb: self.memory_mb.saturating_mul(u64::from(n)),
            ephemeral_storage_mb: self.ephemeral_storage_mb.saturating_mul(u64::from(n)),
        }
    }

    /// Whether `self` fits within `ceiling`
    #[must_use]
    pub fn within(&self, ceiling: &Resources) -> bool {
        self.gpu_count <= ceiling.gpu_count
            && self.cpu_millicores <= ceiling.cpu_millicores
            && self.memory_mb <= ceiling.memory_mb
    }
}

impl AddAssign for Resources {
    fn add_assign(&mut self, rhs: Self) {
        self.gpu_count += rhs.gpu_count;
        self.cpu_millicores += rhs.cpu_millicores;
        self.memory_mb += rhs.memory_mb;
        self.ephemeral_storage_mb += rhs.ephemeral_storage_mb;
    }
}

impl SubAssign for Resources {
    fn sub_assign(&mut self, rhs: Self) {
        self.gpu_count = self.gpu_count.saturating_sub(rhs.gpu_count);
        self.cpu_millicores = self.cpu_millicores.saturating_sub(rhs.cpu_millicores);
        self.memory_mb = self.memory_mb.saturating_sub(rhs.memory_mb);
        self.ephemeral_storage_mb = self
            .ephemeral_storage_mb
            .saturating_sub(rhs.ephemeral_storage_mb);
    }
}

/// Platform-specific bindings a [`Spec`] may carry
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlatformBinding {
    /// The provider-side product/SKU id for this spec, if any
    pub product_id: Option<String>,
    /// The region this binding applies to
    pub region: Option<String>,
    /// The node pool this binding should be scheduled into, for cluster
    /// orchestrators that support node-pool-scoped capacity
    pub node_pool: Option<String>,
    /// The cloud instance type backing this node pool, used by the spot
    /// checker when node-pool instance types aren't queryable directly
    pub instance_type: Option<String>,
}

/// A resource profile: GPU type/count, CPU, memory, storage, and the
/// platform-specific bindings needed to request it from a back-end
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Spec {
    /// The unique name of this spec
    pub name: String,
    /// The GPU model this spec requests, e.g. `a100-40gb`
    pub gpu_type: String,
    /// The raw resources this spec consumes per worker
    pub resources: Resources,
    /// Whether this spec should be scheduled on spot/preemptible capacity
    pub spot: bool,
    /// Per-platform bindings, keyed by back-end/cluster name
    pub bindings: std::collections::HashMap<String, PlatformBinding>,
}

impl Spec {
    /// Get the platform binding for a given back-end, if one exists
    #[must_use]
    pub fn binding(&self, backend: &str) -> Option<&PlatformBinding> {
        self.bindings.get(backend)
    }
}

/// Per-spec capacity counters, refreshed once per autoscaler/capacity tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpecCapacity {
    /// Pods currently running for this spec
    pub running: u32,
    /// Pods currently pending (not yet ready) for this spec
    pub pending: u32,
    /// Whether the provider reports headroom for this spec right now
    pub provider_available: bool,
    /// Whether spot capacity is currently available for this spec
    pub spot_available: bool,
    /// When this record was last refreshed
    pub updated_at: DateTime<Utc>,
}

impl SpecCapacity {
    /// A freshly-initialized, optimistic capacity record (both availability
    /// flags default true until an availability/spot provider says otherwise)
    #[must_use]
    pub fn new() -> Self {
        SpecCapacity {
            running: 0,
            pending: 0,
            provider_available: true,
            spot_available: true,
            updated_at: Utc::now(),
        }
    }

    /// Total pods (running + pending) tracked for this spec
    #[must_use]
    pub fn total(&self) -> u32 {
        self.running + self.pending
    }
}

impl Default for SpecCapacity {
    fn default() -> Self {
        Self::new()
    }
}
