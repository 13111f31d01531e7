//! tessera-quota — the quota ledger.
//!
//! The ledger is the single source of truth for admission feasibility. It
//! tracks, per cluster queue and `(flavor, resource)`, the nominal quota,
//! the borrowing and lending limits, and the usage of live reservations.
//!
//! Queues sharing a cohort are kept in one book behind one async mutex, so
//! every reservation decision that may borrow from siblings is made against
//! a consistent view of the whole cohort. A queue without a cohort is a
//! cohort of one.
//!
//! # Lifecycle of a reservation
//!
//! ```text
//! try_reserve ──► Reserved ──commit──► Committed
//!                    │                    │
//!                    └──────release───────┴──► (gone; release again is a no-op)
//! ```

pub mod book;
pub mod error;
pub mod ledger;
pub mod types;

pub use error::{QuotaError, QuotaResult};
pub use ledger::QuotaLedger;
pub use types::{FlavorResource, QueueUsage, QuotaUsage, ReservationToken, ResourceUsage};
