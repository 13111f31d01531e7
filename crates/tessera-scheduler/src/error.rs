//! Scheduler error types.

use thiserror::Error;

use tessera_state::{WorkloadKey, WorkloadPhase};

/// Errors returned by scheduler operations.
///
/// Per-workload admission failures are not errors: they leave the workload
/// pending with a reason. These variants cover misuse of the API and
/// failures of the collaborators.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("workload not found: {0}")]
    WorkloadNotFound(WorkloadKey),

    #[error("workload already exists: {0}")]
    AlreadyExists(WorkloadKey),

    #[error("local queue {namespace}/{name} does not resolve to a cluster queue")]
    UnknownLocalQueue { namespace: String, name: String },

    #[error("workload {key} cannot go from {from:?} to {to:?}")]
    InvalidTransition {
        key: WorkloadKey,
        from: WorkloadPhase,
        to: WorkloadPhase,
    },

    #[error("snapshot generation {0} is stale")]
    SnapshotStale(u64),

    #[error("execution adapter unavailable: {0}")]
    Execution(String),

    #[error(transparent)]
    Validation(#[from] tessera_state::ValidationError),

    #[error(transparent)]
    Quota(#[from] tessera_quota::QuotaError),

    #[error(transparent)]
    Placement(#[from] tessera_placement::PlacementError),

    #[error(transparent)]
    Topology(#[from] tessera_topology::TopologyError),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
