//! Quota ledger errors.

use thiserror::Error;

use tessera_state::Quantity;

pub type QuotaResult<T> = Result<T, QuotaError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QuotaError {
    #[error(
        "insufficient quota in {queue} for {flavor}/{resource}: requested {requested}, available {available}"
    )]
    InsufficientQuota {
        queue: String,
        flavor: String,
        resource: String,
        requested: Quantity,
        available: Quantity,
    },

    #[error("reservation {token} cannot be committed: {reason}")]
    Conflict { token: u64, reason: String },

    #[error("unknown cluster queue: {0}")]
    UnknownQueue(String),
}
