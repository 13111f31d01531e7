//! Replica fit per domain.
//!
//! A finest-level domain hosts `floor(free / per_replica)` replicas, taking
//! the minimum over requested resources, after subtracting usage assumed
//! earlier in the cycle. A coarser domain hosts the sum of its children:
//! replicas are never split across nodes, so aggregating free capacity
//! first and dividing afterwards would over-count.

use std::cmp::Ordering;

use tessera_state::ResourceList;
use tessera_topology::{TopologySnapshot, TopologyUsage};

/// Replica fit of every domain of one snapshot, indexed like its arenas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainFits {
    per_level: Vec<Vec<u32>>,
}

impl DomainFits {
    pub fn compute(
        snapshot: &TopologySnapshot,
        per_replica: &ResourceList,
        assumed: &TopologyUsage,
    ) -> Self {
        let depth = snapshot.levels().len();
        let mut per_level: Vec<Vec<u32>> = vec![Vec::new(); depth];
        if depth == 0 {
            return Self { per_level };
        }

        let leaf = snapshot.leaf_level();
        per_level[leaf] = snapshot
            .domains_at(leaf)
            .iter()
            .map(|d| {
                let free = match assumed.leaf(snapshot.flavor(), &d.path) {
                    Some(used) => d.free.saturating_sub(used),
                    None => d.free.clone(),
                };
                free.max_replicas(per_replica)
            })
            .collect();

        for level in (0..leaf).rev() {
            let fits: Vec<u32> = snapshot
                .domains_at(level)
                .iter()
                .map(|d| {
                    d.children
                        .iter()
                        .map(|&c| per_level[level + 1][c])
                        .fold(0u32, u32::saturating_add)
                })
                .collect();
            per_level[level] = fits;
        }

        Self { per_level }
    }

    pub fn at(&self, level: usize, index: usize) -> u32 {
        self.per_level
            .get(level)
            .and_then(|l| l.get(index))
            .copied()
            .unwrap_or(0)
    }

    /// Sum of fits over a whole level.
    pub fn level_total(&self, level: usize) -> u32 {
        self.per_level
            .get(level)
            .map(|l| l.iter().copied().fold(0u32, u32::saturating_add))
            .unwrap_or(0)
    }

    /// Order `candidates` (domain indices at `level`) by fit descending,
    /// then path ascending.
    pub fn rank(&self, snapshot: &TopologySnapshot, level: usize, candidates: &mut [usize]) {
        let domains = snapshot.domains_at(level);
        candidates.sort_by(|&a, &b| match self.at(level, b).cmp(&self.at(level, a)) {
            Ordering::Equal => domains[a].path.cmp(&domains[b].path),
            other => other,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_state::{
        Labels, NodeInfo, Quantity, ResourceFlavor, Topology, TopologyAssignment,
        TopologyDomainAssignment,
    };
    use tessera_topology::build_topology_snapshot;

    fn snapshot(nodes: &[(&str, &str, u64, u64)]) -> TopologySnapshot {
        let topology = Topology {
            name: "dc".into(),
            levels: vec!["rack".into(), "host".into()],
        };
        let flavor = ResourceFlavor {
            name: "tas".into(),
            node_labels: Labels::new(),
            topology_name: Some("dc".into()),
        };
        let nodes: Vec<NodeInfo> = nodes
            .iter()
            .map(|(host, rack, cpu, mem)| NodeInfo {
                name: (*host).into(),
                labels: Labels::from([
                    ("rack".into(), (*rack).into()),
                    ("host".into(), (*host).into()),
                ]),
                allocatable: ResourceList::new()
                    .with("cpu", Quantity::units(*cpu))
                    .with("memory", Quantity::units(*mem)),
                allocated: ResourceList::new(),
                schedulable: true,
            })
            .collect();
        build_topology_snapshot(&flavor, &topology, &nodes, &TopologyUsage::new())
    }

    fn request(cpu: u64, mem: u64) -> ResourceList {
        ResourceList::new()
            .with("cpu", Quantity::units(cpu))
            .with("memory", Quantity::units(mem))
    }

    #[test]
    fn leaf_fit_is_bounded_by_scarcest_resource() {
        let snap = snapshot(&[("h1", "r1", 8, 3)]);
        let fits = DomainFits::compute(&snap, &request(2, 1), &TopologyUsage::new());
        assert_eq!(fits.at(1, 0), 3);
    }

    #[test]
    fn parent_fit_sums_children_not_capacity() {
        // Each host has 1.5 replicas worth of cpu; the rack holds 2, not 3.
        let snap = snapshot(&[("h1", "r1", 3, 10), ("h2", "r1", 3, 10)]);
        let fits = DomainFits::compute(&snap, &request(2, 1), &TopologyUsage::new());
        assert_eq!(fits.at(1, 0), 1);
        assert_eq!(fits.at(1, 1), 1);
        assert_eq!(fits.at(0, 0), 2);
        assert_eq!(fits.level_total(0), 2);
    }

    #[test]
    fn assumed_usage_reduces_fit() {
        let snap = snapshot(&[("h1", "r1", 4, 4)]);
        let mut assumed = TopologyUsage::new();
        assumed.add(
            "tas",
            &TopologyAssignment {
                levels: vec!["rack".into(), "host".into()],
                domains: vec![TopologyDomainAssignment {
                    values: vec!["r1".into(), "h1".into()],
                    count: 3,
                }],
            },
            &request(1, 1),
        );
        let fits = DomainFits::compute(&snap, &request(1, 1), &assumed);
        assert_eq!(fits.at(1, 0), 1);
    }

    #[test]
    fn rank_orders_by_fit_then_path() {
        let snap = snapshot(&[
            ("h1", "r1", 1, 1),
            ("h2", "r2", 2, 2),
            ("h3", "r3", 2, 2),
        ]);
        let fits = DomainFits::compute(&snap, &request(1, 1), &TopologyUsage::new());
        let mut racks = vec![0, 1, 2];
        fits.rank(&snap, 0, &mut racks);
        assert_eq!(racks, vec![1, 2, 0]);
    }

    #[test]
    fn out_of_range_lookups_are_zero() {
        let snap = snapshot(&[("h1", "r1", 1, 1)]);
        let fits = DomainFits::compute(&snap, &request(1, 1), &TopologyUsage::new());
        assert_eq!(fits.at(5, 0), 0);
        assert_eq!(fits.at(0, 9), 0);
    }
}
