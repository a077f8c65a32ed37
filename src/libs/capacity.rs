//! Capacity Manager
//!
//! Maintains per-spec `{running, pending, provider_available, spot_available,
//! updated_at}`, refreshed once per tick from a `PodCountProvider` plus two
//! pluggable providers (generic/node-pool-aware availability, optional spot
//! checker). Grounded on `allocatable.rs`'s per-resource counters
//! (`NodeResources`/`AllocatableUpdate`), generalized here from per-node to
//! per-spec bookkeeping.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{event, instrument, Level};

use crate::error::Error;
use crate::libs::providers::PodCounts;
use crate::models::{PlatformBinding, Spec, SpecCapacity};

/// Reports whether a back-end has headroom to schedule more of a given
/// spec right now. The *generic* provider always says yes; a
/// *node-pool-aware* provider (e.g. querying node-pool/claim status on a
/// cluster orchestrator) can say no when the pool is saturated.
#[async_trait]
pub trait AvailabilityProvider: Send + Sync {
    async fn is_available(&self, spec: &Spec) -> Result<bool, Error>;
}

/// Always reports availability; the default for back-ends that don't
/// expose node-pool-scoped capacity
pub struct GenericAvailabilityProvider;

#[async_trait]
impl AvailabilityProvider for GenericAvailabilityProvider {
    async fn is_available(&self, _spec: &Spec) -> Result<bool, Error> {
        Ok(true)
    }
}

/// Queries node-pool claim status for clusters that expose it; reports
/// false once a pool has reached its claimed-node limit
pub struct NodePoolAvailabilityProvider {
    /// `node_pool -> (claimed, limit)`, refreshed by whatever wires this
    /// provider up (e.g. a periodic node-list against the cluster
    /// orchestrator); kept as a narrow seam so the k8s-specific query logic
    /// doesn't leak into the capacity manager itself
    pool_claims: RwLock<HashMap<String, (u32, u32)>>,
    backend: String,
}

impl NodePoolAvailabilityProvider {
    #[must_use]
    pub fn new(backend: impl Into<String>) -> Self {
        NodePoolAvailabilityProvider {
            pool_claims: RwLock::default(),
            backend: backend.into(),
        }
    }

    /// Update the claimed/limit counters for a node pool, called by the
    /// periodic node-pool query this provider wraps
    pub fn set_pool_claims(&self, node_pool: &str, claimed: u32, limit: u32) {
        let mut claims = self.pool_claims.write().expect("pool claims lock poisoned");
        claims.insert(node_pool.to_string(), (claimed, limit));
    }
}

#[async_trait]
impl AvailabilityProvider for NodePoolAvailabilityProvider {
    async fn is_available(&self, spec: &Spec) -> Result<bool, Error> {
        let Some(binding) = spec.binding(&self.backend) else {
            // no node-pool binding for this back-end: nothing to check
            return Ok(true);
        };
        let Some(node_pool) = &binding.node_pool else {
            return Ok(true);
        };
        let claims = self.pool_claims.read().expect("pool claims lock poisoned");
        Ok(claims.get(node_pool).is_none_or(|(claimed, limit)| claimed < limit))
    }
}

/// Queries whether spot/preemptible capacity is currently available for a
/// spec. Optional: specs not targeting spot never consult this.
#[async_trait]
pub trait SpotChecker: Send + Sync {
    /// `instance_types` is the spec's own instance-type config, falling
    /// back to the instance types associated with the spec's node pool
    /// when the spec doesn't name one directly
    async fn is_spot_available(&self, instance_types: &[String]) -> Result<bool, Error>;
}

/// A spot checker that always reports availability, used when no cloud-SDK
/// spot checker is wired up (spot-checker clients are an out-of-scope
/// external collaborator)
pub struct AlwaysSpotAvailable;

#[async_trait]
impl SpotChecker for AlwaysSpotAvailable {
    async fn is_spot_available(&self, _instance_types: &[String]) -> Result<bool, Error> {
        Ok(true)
    }
}

/// Queries running/pending pod counts per spec directly from a back-end
#[async_trait]
pub trait PodCountProvider: Send + Sync {
    async fn counts_by_spec(&self) -> Result<HashMap<String, PodCounts>, Error>;
}

/// The per-spec capacity view, refreshed once per tick
pub struct CapacityManager {
    capacities: RwLock<HashMap<String, SpecCapacity>>,
    availability: Box<dyn AvailabilityProvider>,
    spot_checker: Box<dyn SpotChecker>,
}

/// Resolve the instance types a spot checker should query for a spec: its
/// own binding's instance type if set, else the node pool's associated
/// types — here represented simply as the binding's
/// `instance_type` field, since node-pool-to-instance-type resolution is
/// back-end specific and out of this crate's scope
fn spot_instance_types(spec: &Spec) -> Vec<String> {
    spec.bindings
        .values()
        .filter_map(|binding: &PlatformBinding| binding.instance_type.clone())
        .collect()
}

impl CapacityManager {
    #[must_use]
    pub fn new(availability: Box<dyn AvailabilityProvider>, spot_checker: Box<dyn SpotChecker>) -> Self {
        CapacityManager {
            capacities: RwLock::default(),
            availability,
            spot_checker,
        }
    }

    /// A [`CapacityManager`] with generic (always-available) providers,
    /// suitable for back-ends without node-pool or spot semantics
    #[must_use]
    pub fn generic() -> Self {
        Self::new(Box::new(GenericAvailabilityProvider), Box::new(AlwaysSpotAvailable))
    }

    /// Read the current capacity snapshot for a spec, if one has been
    /// refreshed yet
    #[must_use]
    pub fn get(&self, spec_name: &str) -> Option<SpecCapacity> {
        self.capacities.read().expect("capacity lock poisoned").get(spec_name).cloned()
    }

    /// Refresh every tracked spec's counters from `counts` (reported by the
    /// back-end) plus the availability/spot providers
    #[instrument(name = "CapacityManager::refresh", skip(self, specs, counts), err(Debug))]
    pub async fn refresh(&self, specs: &[Spec], counts: &HashMap<String, PodCounts>) -> Result<(), Error> {
        for spec in specs {
            let pod_counts = counts.get(&spec.name).copied().unwrap_or_default();
            let provider_available = self.availability.is_available(spec).await?;
            let spot_available = if spec.spot {
                self.spot_checker.is_spot_available(&spot_instance_types(spec)).await?
            } else {
                true
            };
            let capacity = SpecCapacity {
                running: pod_counts.running,
                pending: pod_counts.pending,
                provider_available,
                spot_available,
                updated_at: Utc::now(),
            };
            event!(
                Level::DEBUG,
                spec = %spec.name,
                running = capacity.running,
                pending = capacity.pending,
                provider_available,
                spot_available,
                "spec capacity refreshed"
            );
            self.capacities
                .write()
                .expect("capacity lock poisoned")
                .insert(spec.name.clone(), capacity);
        }
        Ok(())
    }

    /// Autoscaler admission rule: a scale-up is rejected if the
    /// provider reports no headroom, or if the spec targets spot and spot
    /// capacity is currently unavailable
    #[must_use]
    pub fn admits_scale_up(&self, spec: &Spec) -> bool {
        match self.get(&spec.name) {
            Some(capacity) => capacity.provider_available && (!spec.spot || capacity.spot_available),
            // no capacity record yet: be conservative and deny, the next
            // tick's refresh will populate one
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Resources;
    use std::collections::HashMap as StdHashMap;

    fn spec(name: &str, spot: bool) -> Spec {
        Spec {
            name: name.to_string(),
            gpu_type: "a100".to_string(),
            resources: Resources::default(),
            spot,
            bindings: StdHashMap::new(),
        }
    }

    #[tokio::test]
    async fn running_plus_pending_matches_provider_counts() {
        let manager = CapacityManager::generic();
        let specs = vec![spec("s1", false)];
        let mut counts = StdHashMap::new();
        counts.insert("s1".to_string(), PodCounts { running: 3, pending: 2 });
        manager.refresh(&specs, &counts).await.unwrap();
        let capacity = manager.get("s1").unwrap();
        assert_eq!(capacity.running + capacity.pending, 5);
    }

    #[tokio::test]
    async fn scale_up_denied_without_a_capacity_record() {
        let manager = CapacityManager::generic();
        assert!(!manager.admits_scale_up(&spec("unknown", false)));
    }

    #[tokio::test]
    async fn spot_unavailable_denies_spot_targeted_spec() {
        struct NeverSpot;
        #[async_trait::async_trait]
        impl SpotChecker for NeverSpot {
            async fn is_spot_available(&self, _instance_types: &[String]) -> Result<bool, Error> {
                Ok(false)
            }
        }
        let manager = CapacityManager::new(Box::new(GenericAvailabilityProvider), Box::new(NeverSpot));
        let specs = vec![spec("spot-spec", true)];
        manager.refresh(&specs, &StdHashMap::new()).await.unwrap();
        assert!(!manager.admits_scale_up(&spec("spot-spec", true)));
    }

    #[tokio::test]
    async fn node_pool_provider_denies_at_claim_limit() {
        let provider = NodePoolAvailabilityProvider::new("k8s-cluster");
        provider.set_pool_claims("gpu-pool", 4, 4);
        let mut bindings = StdHashMap::new();
        bindings.insert(
            "k8s-cluster".to_string(),
            PlatformBinding { product_id: None, region: None, node_pool: Some("gpu-pool".into()), instance_type: None },
        );
        let s = Spec { name: "s1".into(), gpu_type: "a100".into(), resources: Resources::default(), spot: false, bindings };
        assert!(!provider.is_available(&s).await.unwrap());
    }
}
