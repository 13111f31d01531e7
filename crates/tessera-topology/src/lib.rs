//! tessera-topology — immutable topology snapshots for placement.
//!
//! A snapshot is built once per admission cycle (or when the inventory
//! changes) from the node inventory and the usage of already-admitted
//! placements. It is never mutated afterwards: the [`SnapshotStore`]
//! publishes a fresh `Arc` and readers keep whatever version they loaded.
//!
//! # Components
//!
//! - **`snapshot`** — arena-per-level domain tree (`TopologySnapshot`, `ClusterSnapshot`)
//! - **`usage`** — committed/assumed usage per finest-level domain
//! - **`builder`** — node inventory → snapshot
//! - **`store`** — atomic snapshot publication and inventory tracking

pub mod builder;
pub mod error;
pub mod snapshot;
pub mod store;
pub mod usage;

pub use builder::{build_cluster_snapshot, build_topology_snapshot};
pub use error::{TopologyError, TopologyResult};
pub use snapshot::{ClusterSnapshot, Domain, TopologySnapshot};
pub use store::SnapshotStore;
pub use usage::TopologyUsage;
