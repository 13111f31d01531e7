//! tessera-scheduler — quota admission orchestration.
//!
//! Drives workloads from submission to admission. The scheduler:
//!
//! - Keeps submitted workloads in a priority-ordered pending queue
//! - Assigns a resource flavor per pod set in cluster queue preference order
//! - Reserves quota in the shared [`QuotaLedger`](tessera_quota::QuotaLedger)
//! - Places topology-constrained pod sets on the cycle's snapshot
//! - Commits the admission and publishes a start directive
//!
//! # Architecture
//!
//! ```text
//! AdmissionScheduler
//!   ├── PendingQueue (priority desc, submission order)
//!   ├── SnapshotStore (node inventory → topology snapshots)
//!   ├── QuotaLedger (cohort books, reservation tokens)
//!   └── ExecutionAdapter (start / stop directives)
//! ```

pub mod error;
pub mod execution;
pub mod queue;
pub mod scheduler;

pub use error::{SchedulerError, SchedulerResult};
pub use execution::{
    ChannelAdapter, ExecutionAdapter, ExecutionCommand, PodSetStart, StartDirective, node_selector,
};
pub use queue::PendingQueue;
pub use scheduler::{AdmissionScheduler, CycleReport, SchedulerConfig};
