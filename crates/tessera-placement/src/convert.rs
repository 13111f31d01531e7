//! Conversions from workload types to placement inputs.
//!
//! Bridges `tessera_state::PodSet` to the placer's [`PlacementRequest`] and
//! places a whole workload pod set by pod set.

use serde::{Deserialize, Serialize};
use tracing::debug;

use tessera_state::{PodSet, ResourceList, TopologyRequest};
use tessera_topology::{ClusterSnapshot, TopologyUsage};

use crate::error::{PlacementError, PlacementResult};
use crate::placer::{Placement, place};

/// What the placer needs to know about one pod set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementRequest {
    pub pod_set: String,
    pub count: u32,
    pub per_replica: ResourceList,
    pub topology_request: TopologyRequest,
}

impl From<&PodSet> for PlacementRequest {
    fn from(ps: &PodSet) -> Self {
        Self {
            pod_set: ps.name.clone(),
            count: ps.count,
            per_replica: ps.requests.clone(),
            topology_request: ps.topology_request.clone(),
        }
    }
}

/// Place every pod set of a workload that lands on a topology-bound flavor.
///
/// `pod_sets` pairs each pod set with the flavor it was assigned. Pod sets
/// are placed in order and each placement is assumed before the next, so
/// one workload never double-books a domain. `assumed` is only updated when
/// every pod set fits.
///
/// Unconstrained pod sets are placed too when their flavor has a topology,
/// starting from the coarsest level, so their capacity is accounted for.
/// They yield `None` only on flavors without a topology.
pub fn place_workload(
    snapshot: &ClusterSnapshot,
    pod_sets: &[(&PodSet, &str)],
    assumed: &mut TopologyUsage,
) -> PlacementResult<Vec<Option<Placement>>> {
    let mut scratch = assumed.clone();
    let mut placements = Vec::with_capacity(pod_sets.len());

    for (ps, flavor) in pod_sets {
        let topology = match snapshot.for_flavor(flavor) {
            Some(topology) => topology,
            None if ps.topology_request.is_constrained() => {
                return Err(PlacementError::NoTopology(flavor.to_string()));
            }
            None => {
                placements.push(None);
                continue;
            }
        };
        let placement = place(topology, &PlacementRequest::from(*ps), &scratch)?;
        scratch.add(flavor, &placement.assignment, &ps.requests);
        placements.push(Some(placement));
    }

    debug!(
        pod_sets = pod_sets.len(),
        placed = placements.iter().filter(|p| p.is_some()).count(),
        snapshot = snapshot.generation,
        "workload placed"
    );
    *assumed = scratch;
    Ok(placements)
}
