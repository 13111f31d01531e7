//! Node inventory → topology snapshot.
//!
//! For every flavor bound to a topology, nodes are filtered by the flavor's
//! node labels and grouped by their topology label values. A node's free
//! capacity is `allocatable - allocated`; the usage of already-admitted
//! placements is then netted out per finest-level domain, and coarser
//! domains aggregate their children.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::{debug, trace};

use tessera_state::{ClusterDefinition, NodeInfo, ResourceFlavor, ResourceList, Topology};

use crate::error::{TopologyError, TopologyResult};
use crate::snapshot::{ClusterSnapshot, Domain, TopologySnapshot};
use crate::usage::TopologyUsage;

/// Build the domain tree of one flavor.
pub fn build_topology_snapshot(
    flavor: &ResourceFlavor,
    topology: &Topology,
    nodes: &[NodeInfo],
    usage: &TopologyUsage,
) -> TopologySnapshot {
    let levels = topology.levels.clone();
    let depth = levels.len();

    // Finest-level path → free capacity. BTreeMap keeps paths sorted, which
    // makes every level's arena sorted as well.
    let mut leaves: BTreeMap<Vec<String>, ResourceList> = BTreeMap::new();
    for node in nodes {
        if !node.schedulable {
            trace!(node = %node.name, "skipping unschedulable node");
            continue;
        }
        let matches_flavor = flavor
            .node_labels
            .iter()
            .all(|(k, v)| node.labels.get(k) == Some(v));
        if !matches_flavor {
            continue;
        }
        let path: Option<Vec<String>> =
            levels.iter().map(|l| node.labels.get(l).cloned()).collect();
        let Some(path) = path else {
            debug!(
                node = %node.name,
                flavor = %flavor.name,
                "node lacks topology labels, skipping"
            );
            continue;
        };
        let free = node.allocatable.saturating_sub(&node.allocated);
        leaves.entry(path).or_default().add(&free);
    }

    for (path, free) in leaves.iter_mut() {
        if let Some(used) = usage.leaf(&flavor.name, path) {
            *free = free.saturating_sub(used);
        }
    }

    let mut domains: Vec<Vec<Domain>> = Vec::with_capacity(depth);
    let mut index: Vec<HashMap<Vec<String>, usize>> = Vec::with_capacity(depth);
    for level in 0..depth {
        let mut arena: Vec<Domain> = Vec::new();
        let mut by_path: HashMap<Vec<String>, usize> = HashMap::new();
        for path in leaves.keys() {
            let prefix = &path[..=level];
            if arena.last().is_some_and(|d| d.path == prefix) {
                continue;
            }
            let parent = if level == 0 {
                None
            } else {
                index[level - 1].get(&path[..level]).copied()
            };
            by_path.insert(prefix.to_vec(), arena.len());
            arena.push(Domain {
                path: prefix.to_vec(),
                parent,
                children: Vec::new(),
                free: ResourceList::new(),
            });
        }
        if level > 0 {
            for (i, d) in arena.iter().enumerate() {
                if let Some(p) = d.parent {
                    domains[level - 1][p].children.push(i);
                }
            }
        }
        domains.push(arena);
        index.push(by_path);
    }

    if depth > 0 {
        let leaf_level = depth - 1;
        for d in domains[leaf_level].iter_mut() {
            if let Some(free) = leaves.get(&d.path) {
                d.free = free.clone();
            }
        }
        for level in (0..leaf_level).rev() {
            let (coarse, fine) = domains.split_at_mut(level + 1);
            for d in coarse[level].iter_mut() {
                let mut free = ResourceList::new();
                for &c in &d.children {
                    free.add(&fine[0][c].free);
                }
                d.free = free;
            }
        }
    }

    let leaf_index = index.pop().unwrap_or_default();
    debug!(
        flavor = %flavor.name,
        topology = %topology.name,
        leaves = leaf_index.len(),
        "topology snapshot built"
    );

    TopologySnapshot {
        flavor: flavor.name.clone(),
        topology: topology.name.clone(),
        levels,
        domains,
        leaf_index,
    }
}

/// Build snapshots for every topology-bound flavor in `definition`.
pub fn build_cluster_snapshot(
    definition: &ClusterDefinition,
    nodes: &[NodeInfo],
    usage: &TopologyUsage,
    generation: u64,
    inventory_generation: u64,
) -> TopologyResult<ClusterSnapshot> {
    let mut flavors = BTreeMap::new();
    for flavor in &definition.flavors {
        let Some(topology_name) = flavor.topology_name.as_deref() else {
            continue;
        };
        let topology =
            definition
                .topology(topology_name)
                .ok_or_else(|| TopologyError::UnknownTopology {
                    flavor: flavor.name.clone(),
                    topology: topology_name.to_string(),
                })?;
        tessera_state::validate_topology(topology)?;
        let snapshot = build_topology_snapshot(flavor, topology, nodes, usage);
        flavors.insert(flavor.name.clone(), Arc::new(snapshot));
    }
    Ok(ClusterSnapshot {
        generation,
        inventory_generation,
        flavors,
    })
}
