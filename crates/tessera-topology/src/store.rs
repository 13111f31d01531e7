//! Snapshot publication.
//!
//! The store owns the node inventory and the currently published
//! [`ClusterSnapshot`]. Rebuilds run outside the publication lock and the
//! result is swapped in as a whole, so a reader either gets the previous
//! snapshot or the new one, never a half-built tree.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::RwLock;
use tracing::{debug, info};

use tessera_state::{ClusterDefinition, NodeInfo};

use crate::builder::build_cluster_snapshot;
use crate::error::TopologyResult;
use crate::snapshot::ClusterSnapshot;
use crate::usage::TopologyUsage;

pub struct SnapshotStore {
    current: RwLock<Arc<ClusterSnapshot>>,
    /// Node name → node, as last reported by the inventory feed.
    inventory: RwLock<BTreeMap<String, NodeInfo>>,
    inventory_generation: AtomicU64,
    next_generation: AtomicU64,
}

impl SnapshotStore {
    /// Create a store with an empty inventory and an empty snapshot.
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(ClusterSnapshot::default())),
            inventory: RwLock::new(BTreeMap::new()),
            inventory_generation: AtomicU64::new(0),
            next_generation: AtomicU64::new(1),
        }
    }

    /// The currently published snapshot.
    pub async fn load(&self) -> Arc<ClusterSnapshot> {
        self.current.read().await.clone()
    }

    /// Replace the whole node inventory.
    pub async fn replace_nodes(&self, nodes: Vec<NodeInfo>) {
        let mut inventory = self.inventory.write().await;
        *inventory = nodes.into_iter().map(|n| (n.name.clone(), n)).collect();
        let generation = self.inventory_generation.fetch_add(1, Ordering::SeqCst) + 1;
        info!(nodes = inventory.len(), generation, "node inventory replaced");
    }

    /// Insert or update one node.
    pub async fn upsert_node(&self, node: NodeInfo) {
        let mut inventory = self.inventory.write().await;
        debug!(node = %node.name, "node inventory updated");
        inventory.insert(node.name.clone(), node);
        self.inventory_generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Remove one node. Returns true if it was known.
    pub async fn remove_node(&self, name: &str) -> bool {
        let mut inventory = self.inventory.write().await;
        let existed = inventory.remove(name).is_some();
        if existed {
            self.inventory_generation.fetch_add(1, Ordering::SeqCst);
            debug!(node = %name, "node removed from inventory");
        }
        existed
    }

    pub async fn node_count(&self) -> usize {
        self.inventory.read().await.len()
    }

    pub fn inventory_generation(&self) -> u64 {
        self.inventory_generation.load(Ordering::SeqCst)
    }

    /// True when the inventory changed after `snapshot` was built.
    pub fn is_stale(&self, snapshot: &ClusterSnapshot) -> bool {
        snapshot.inventory_generation < self.inventory_generation()
    }

    /// Build a snapshot from the current inventory and publish it.
    ///
    /// A concurrent rebuild that already published a snapshot from a newer
    /// inventory wins; the older result is returned but not published.
    pub async fn rebuild(
        &self,
        definition: &ClusterDefinition,
        usage: &TopologyUsage,
    ) -> TopologyResult<Arc<ClusterSnapshot>> {
        let (nodes, inventory_generation) = {
            let inventory = self.inventory.read().await;
            let nodes: Vec<NodeInfo> = inventory.values().cloned().collect();
            (nodes, self.inventory_generation())
        };

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let snapshot = Arc::new(build_cluster_snapshot(
            definition,
            &nodes,
            usage,
            generation,
            inventory_generation,
        )?);

        let mut current = self.current.write().await;
        if current.inventory_generation <= snapshot.inventory_generation {
            *current = snapshot.clone();
            debug!(
                generation,
                inventory_generation,
                flavors = snapshot.flavors.len(),
                "snapshot published"
            );
        }
        Ok(snapshot)
    }
}

impl Default for SnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_state::{Labels, Quantity, ResourceFlavor, ResourceList, Topology};

    fn definition() -> ClusterDefinition {
        ClusterDefinition {
            topologies: vec![Topology {
                name: "dc".into(),
                levels: vec!["rack".into(), "host".into()],
            }],
            flavors: vec![ResourceFlavor {
                name: "tas".into(),
                node_labels: Labels::new(),
                topology_name: Some("dc".into()),
            }],
            ..Default::default()
        }
    }

    fn node(name: &str, rack: &str) -> NodeInfo {
        NodeInfo {
            name: name.into(),
            labels: Labels::from([("rack".into(), rack.into()), ("host".into(), name.into())]),
            allocatable: ResourceList::new().with("cpu", Quantity::units(4)),
            allocated: ResourceList::new(),
            schedulable: true,
        }
    }

    #[tokio::test]
    async fn starts_with_empty_snapshot() {
        let store = SnapshotStore::new();
        let snap = store.load().await;
        assert!(snap.flavors.is_empty());
        assert_eq!(store.inventory_generation(), 0);
        assert!(!store.is_stale(&snap));
    }

    #[tokio::test]
    async fn rebuild_publishes_new_snapshot() {
        let store = SnapshotStore::new();
        store.replace_nodes(vec![node("h1", "r1"), node("h2", "r1")]).await;

        let built = store.rebuild(&definition(), &TopologyUsage::new()).await.unwrap();
        let loaded = store.load().await;
        assert_eq!(built.generation, loaded.generation);
        let tas = loaded.for_flavor("tas").unwrap();
        assert_eq!(tas.total_free().get("cpu"), Quantity::units(8));
    }

    #[tokio::test]
    async fn readers_keep_their_version_across_rebuilds() {
        let store = SnapshotStore::new();
        store.replace_nodes(vec![node("h1", "r1")]).await;
        store.rebuild(&definition(), &TopologyUsage::new()).await.unwrap();
        let old = store.load().await;

        store.upsert_node(node("h2", "r2")).await;
        assert!(store.is_stale(&old));
        store.rebuild(&definition(), &TopologyUsage::new()).await.unwrap();

        let new = store.load().await;
        assert!(new.generation > old.generation);
        assert_eq!(old.for_flavor("tas").unwrap().domains_at(0).len(), 1);
        assert_eq!(new.for_flavor("tas").unwrap().domains_at(0).len(), 2);
        assert!(!store.is_stale(&new));
    }

    #[tokio::test]
    async fn remove_node_bumps_generation_only_when_known() {
        let store = SnapshotStore::new();
        store.upsert_node(node("h1", "r1")).await;
        let before = store.inventory_generation();
        assert!(!store.remove_node("nope").await);
        assert_eq!(store.inventory_generation(), before);
        assert!(store.remove_node("h1").await);
        assert_eq!(store.inventory_generation(), before + 1);
        assert_eq!(store.node_count().await, 0);
    }
}
