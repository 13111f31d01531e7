//! Tessera placement — topology-aware bin-packing.
//!
//! Given a flavor's [`TopologySnapshot`](tessera_topology::TopologySnapshot)
//! and a pod set's replica count, per-replica request and locality request,
//! the placer decides which finest-level domains receive how many replicas.
//! Placement is pure computation: it never blocks and never mutates the
//! snapshot. Decisions made earlier in the same admission cycle are passed in
//! as assumed usage.
//!
//! # Components
//!
//! - **`fit`** — how many replicas each domain can host
//! - **`placer`** — level search, relaxation and descent
//! - **`convert`** — pod sets to placement requests, workloads to placements

pub mod convert;
pub mod error;
pub mod fit;
pub mod placer;

pub use convert::{PlacementRequest, place_workload};
pub use error::{PlacementError, PlacementResult};
pub use fit::DomainFits;
pub use placer::{Placement, place};
