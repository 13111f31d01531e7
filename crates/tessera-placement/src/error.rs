use thiserror::Error;

pub type PlacementResult<T> = Result<T, PlacementError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlacementError {
    #[error(
        "pod set {pod_set}: {requested} replicas do not fit at level {level} (best fit {best_fit})"
    )]
    Infeasible {
        pod_set: String,
        level: String,
        requested: u32,
        best_fit: u32,
    },

    #[error("pod set {pod_set}: level {level} is not part of topology {topology}")]
    UnknownLevel {
        pod_set: String,
        level: String,
        topology: String,
    },

    #[error("flavor {0} has no topology snapshot")]
    NoTopology(String),
}
