//! Snapshot data structures.
//!
//! Domains are stored in one arena per level, coarsest level first. Links
//! between levels are plain indices (`parent`, `children`) into the
//! neighbouring arena, and each arena is sorted by domain path so iteration
//! order is deterministic.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tessera_state::ResourceList;

/// One concrete value at one topology level, e.g. rack `r7` of block `b2`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Domain {
    /// Values from the coarsest level down to this domain's level.
    pub path: Vec<String>,
    /// Index into the previous (coarser) level's arena.
    pub parent: Option<usize>,
    /// Indices into the next (finer) level's arena.
    pub children: Vec<usize>,
    /// Remaining capacity, aggregated over descendants.
    pub free: ResourceList,
}

/// The domain tree of one flavor's nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologySnapshot {
    pub(crate) flavor: String,
    pub(crate) topology: String,
    pub(crate) levels: Vec<String>,
    pub(crate) domains: Vec<Vec<Domain>>,
    pub(crate) leaf_index: HashMap<Vec<String>, usize>,
}

impl TopologySnapshot {
    pub fn flavor(&self) -> &str {
        &self.flavor
    }

    pub fn topology(&self) -> &str {
        &self.topology
    }

    /// Level keys, coarsest first.
    pub fn levels(&self) -> &[String] {
        &self.levels
    }

    pub fn level_index(&self, level: &str) -> Option<usize> {
        self.levels.iter().position(|l| l == level)
    }

    /// Index of the finest level.
    pub fn leaf_level(&self) -> usize {
        self.levels.len().saturating_sub(1)
    }

    /// Domains at `level`, sorted by path.
    pub fn domains_at(&self, level: usize) -> &[Domain] {
        self.domains.get(level).map(Vec::as_slice).unwrap_or_default()
    }

    /// Finest-level domain index for a full path.
    pub fn leaf(&self, path: &[String]) -> Option<usize> {
        self.leaf_index.get(path).copied()
    }

    /// Total remaining capacity across all domains.
    pub fn total_free(&self) -> ResourceList {
        let mut total = ResourceList::new();
        for d in self.domains_at(0) {
            total.add(&d.free);
        }
        total
    }

    pub fn is_empty(&self) -> bool {
        self.domains.first().is_none_or(Vec::is_empty)
    }
}

/// Snapshots of every topology-bound flavor, published together.
#[derive(Debug, Clone, Default)]
pub struct ClusterSnapshot {
    /// Monotonic snapshot number.
    pub generation: u64,
    /// Inventory generation the snapshot was built from.
    pub inventory_generation: u64,
    pub flavors: BTreeMap<String, Arc<TopologySnapshot>>,
}

impl ClusterSnapshot {
    pub fn for_flavor(&self, flavor: &str) -> Option<&TopologySnapshot> {
        self.flavors.get(flavor).map(Arc::as_ref)
    }
}
