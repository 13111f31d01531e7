//! tessera-state — shared domain model for the Tessera admission engine.
//!
//! Every other crate speaks in these types: workloads and their pod sets,
//! cluster/local queues with their flavor quotas, resource flavors bound to
//! topologies, the node inventory, and the admission records the scheduler
//! attaches to workloads once they are accepted.
//!
//! # Modules
//!
//! - **`quantity`** — milli-unit resource quantities and `ResourceList`
//! - **`types`** — workloads, queues, flavors, topologies, admissions
//! - **`job`** — conversion from a submitted job to a `Workload`
//! - **`validate`** — structural validation of submitted definitions
//! - **`error`** — `ValidationError`

pub mod error;
pub mod job;
pub mod quantity;
pub mod types;
pub mod validate;

pub use error::{ValidationError, ValidationResult};
pub use job::{JobSpec, PREFERRED_TOPOLOGY_ANNOTATION, REQUIRED_TOPOLOGY_ANNOTATION};
pub use quantity::{Quantity, ResourceList};
pub use types::*;
pub use validate::{validate_cluster_queue, validate_flavor, validate_topology, validate_workload};
