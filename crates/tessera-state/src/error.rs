//! Error types for Tessera domain definitions.

use thiserror::Error;

/// Result type alias for validation and parsing.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Errors raised when a definition or submission is structurally invalid.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("invalid quantity {input:?}: {reason}")]
    Quantity { input: String, reason: String },

    #[error("workload {0} has no pod sets")]
    NoPodSets(String),

    #[error("workload {workload} has duplicate pod set {pod_set}")]
    DuplicatePodSet { workload: String, pod_set: String },

    #[error("pod set {pod_set} of workload {workload} must have at least one replica")]
    ZeroReplicas { workload: String, pod_set: String },

    #[error("pod set {pod_set} of workload {workload} requests no resources")]
    EmptyRequest { workload: String, pod_set: String },

    #[error("pod set {0} declares both a required and a preferred topology level")]
    ConflictingTopologyRequest(String),

    #[error("topology {0} has no levels")]
    EmptyTopology(String),

    #[error("topology {topology} repeats level {level}")]
    DuplicateLevel { topology: String, level: String },

    #[error("cluster queue {queue} lists flavor {flavor} more than once")]
    DuplicateFlavor { queue: String, flavor: String },

    #[error("cluster queue {queue}: lending limit for {flavor}/{resource} exceeds nominal quota")]
    LendingAboveNominal {
        queue: String,
        flavor: String,
        resource: String,
    },

    #[error("invalid {field}: {reason}")]
    Field { field: String, reason: String },
}
