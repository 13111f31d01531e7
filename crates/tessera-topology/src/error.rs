//! Topology snapshot errors.

use thiserror::Error;

pub type TopologyResult<T> = Result<T, TopologyError>;

#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("flavor {flavor} references unknown topology {topology}")]
    UnknownTopology { flavor: String, topology: String },

    #[error(transparent)]
    Invalid(#[from] tessera_state::ValidationError),
}
