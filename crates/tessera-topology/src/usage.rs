//! Usage of admitted placements, keyed by finest-level domain.
//!
//! The same structure serves two purposes: the scheduler's record of
//! committed placements (netted out when a snapshot is built), and the
//! in-cycle "assumed" usage of placements decided after the snapshot was
//! taken.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tessera_state::{ResourceList, TopologyAssignment};

/// flavor → finest-level domain path → resources in use.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyUsage {
    by_flavor: BTreeMap<String, BTreeMap<Vec<String>, ResourceList>>,
}

impl TopologyUsage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Charge every domain of `assignment` with `count × per_replica`.
    pub fn add(
        &mut self,
        flavor: &str,
        assignment: &TopologyAssignment,
        per_replica: &ResourceList,
    ) {
        let domains = self.by_flavor.entry(flavor.to_string()).or_default();
        for d in &assignment.domains {
            domains
                .entry(d.values.clone())
                .or_default()
                .add(&per_replica.scaled(d.count));
        }
    }

    /// Undo [`add`](Self::add). Entries that drop to zero are removed.
    pub fn remove(
        &mut self,
        flavor: &str,
        assignment: &TopologyAssignment,
        per_replica: &ResourceList,
    ) {
        let Some(domains) = self.by_flavor.get_mut(flavor) else {
            return;
        };
        for d in &assignment.domains {
            if let Some(used) = domains.get_mut(&d.values) {
                *used = used.saturating_sub(&per_replica.scaled(d.count));
                if used.is_zero() {
                    domains.remove(&d.values);
                }
            }
        }
        if domains.is_empty() {
            self.by_flavor.remove(flavor);
        }
    }

    /// Usage recorded for one finest-level domain.
    pub fn leaf(&self, flavor: &str, path: &[String]) -> Option<&ResourceList> {
        self.by_flavor.get(flavor).and_then(|d| d.get(path))
    }

    pub fn is_empty(&self) -> bool {
        self.by_flavor.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_state::{Quantity, TopologyDomainAssignment};

    fn assignment(domains: &[(&str, u32)]) -> TopologyAssignment {
        TopologyAssignment {
            levels: vec!["block".into(), "host".into()],
            domains: domains
                .iter()
                .map(|(host, count)| TopologyDomainAssignment {
                    values: vec!["b1".into(), (*host).into()],
                    count: *count,
                })
                .collect(),
        }
    }

    fn gpu(n: u64) -> ResourceList {
        ResourceList::new().with("gpu", Quantity::units(n))
    }

    #[test]
    fn add_scales_by_domain_count() {
        let mut usage = TopologyUsage::new();
        usage.add("tas", &assignment(&[("h1", 2), ("h2", 1)]), &gpu(1));
        let h1 = vec!["b1".to_string(), "h1".to_string()];
        let h2 = vec!["b1".to_string(), "h2".to_string()];
        assert_eq!(usage.leaf("tas", &h1), Some(&gpu(2)));
        assert_eq!(usage.leaf("tas", &h2), Some(&gpu(1)));
        assert_eq!(usage.leaf("other", &h1), None);
    }

    #[test]
    fn remove_restores_empty_state() {
        let mut usage = TopologyUsage::new();
        let a = assignment(&[("h1", 2)]);
        usage.add("tas", &a, &gpu(1));
        usage.add("tas", &a, &gpu(1));
        usage.remove("tas", &a, &gpu(1));
        let h1 = vec!["b1".to_string(), "h1".to_string()];
        assert_eq!(usage.leaf("tas", &h1), Some(&gpu(2)));
        usage.remove("tas", &a, &gpu(1));
        assert!(usage.is_empty());
    }

    #[test]
    fn removing_unknown_usage_is_harmless() {
        let mut usage = TopologyUsage::new();
        usage.remove("tas", &assignment(&[("h1", 1)]), &gpu(1));
        assert!(usage.is_empty());
    }
}
