//! The async ledger front-end.
//!
//! Each cohort book sits behind its own `tokio::sync::Mutex`, so operations
//! on different cohorts proceed in parallel while operations within one
//! cohort are linearizable. The maps from queue to cohort are only written
//! when queue definitions change.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, info, warn};

use tessera_state::{ClusterQueue, Quantity};

use crate::book::{CohortBook, QueueBook, Reservation, ReservationState};
use crate::error::{QuotaError, QuotaResult};
use crate::types::{FlavorResource, QueueUsage, QuotaUsage, ReservationToken};

/// Lookup attempts before a queue is reported unknown. A queue can move
/// between cohorts while a caller waits for the old cohort's lock.
const LOOKUP_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum CohortKey {
    Named(String),
    Solo(String),
}

impl CohortKey {
    fn for_queue(queue: &str, cohort: Option<&str>) -> Self {
        match cohort {
            Some(c) => CohortKey::Named(c.to_string()),
            None => CohortKey::Solo(queue.to_string()),
        }
    }
}

#[derive(Default)]
struct Directory {
    books: HashMap<CohortKey, Arc<Mutex<CohortBook>>>,
    queues: HashMap<String, CohortKey>,
}

/// Quota ledger shared by all admission attempts.
pub struct QuotaLedger {
    directory: RwLock<Directory>,
    next_token: AtomicU64,
}

impl QuotaLedger {
    pub fn new() -> Self {
        Self {
            directory: RwLock::new(Directory::default()),
            next_token: AtomicU64::new(1),
        }
    }

    /// Build a ledger from queue definitions.
    pub async fn with_queues(queues: &[ClusterQueue]) -> Self {
        let ledger = Self::new();
        for q in queues {
            ledger.upsert_queue(q).await;
        }
        ledger
    }

    /// Add a queue or update its quotas and cohort. Usage and live
    /// reservations survive the update.
    ///
    /// The queue is never absent from its cohort while another caller can
    /// observe the book: an in-place update happens under one lock hold,
    /// and a move between cohorts holds both books until it is done.
    pub async fn upsert_queue(&self, spec: &ClusterQueue) {
        let mut dir = self.directory.write().await;
        let new_key = CohortKey::for_queue(&spec.name, spec.cohort.as_deref());
        let mut fresh = QueueBook::from_spec(spec);
        let old_key = dir.queues.get(&spec.name).cloned();

        let new_book = dir
            .books
            .entry(new_key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(CohortBook::default())))
            .clone();
        let mut book = new_book.lock().await;

        match old_key {
            Some(old_key) if old_key == new_key => {
                if let Some(previous) = book.members.get_mut(&spec.name) {
                    fresh.used = std::mem::take(&mut previous.used);
                }
                book.members.insert(spec.name.clone(), fresh);
            }
            Some(old_key) => {
                // The directory write lock serializes upserts, and every
                // other caller holds at most one book, so taking a second
                // book lock here cannot deadlock.
                let mut old_empty = false;
                if let Some(old_book) = dir.books.get(&old_key).cloned() {
                    let mut old = old_book.lock().await;
                    if let Some(previous) = old.members.remove(&spec.name) {
                        fresh.used = previous.used;
                    }
                    let ids: Vec<u64> = old
                        .reservations
                        .iter()
                        .filter(|(_, r)| r.queue == spec.name)
                        .map(|(id, _)| *id)
                        .collect();
                    for id in ids {
                        if let Some(r) = old.reservations.remove(&id) {
                            book.reservations.insert(id, r);
                        }
                    }
                    old_empty = old.members.is_empty();
                }
                book.members.insert(spec.name.clone(), fresh);
                if old_empty {
                    dir.books.remove(&old_key);
                }
                debug!(
                    queue = %spec.name,
                    from = ?old_key,
                    to = ?new_key,
                    "queue moved between cohorts"
                );
            }
            None => {
                book.members.insert(spec.name.clone(), fresh);
            }
        }
        drop(book);

        dir.queues.insert(spec.name.clone(), new_key);
        info!(queue = %spec.name, cohort = ?spec.cohort, "cluster queue registered in ledger");
    }

    /// Cohort the queue belongs to, if any.
    pub async fn cohort_of(&self, queue: &str) -> Option<String> {
        let dir = self.directory.read().await;
        match dir.queues.get(queue)? {
            CohortKey::Named(c) => Some(c.clone()),
            CohortKey::Solo(_) => None,
        }
    }

    /// Lock the book that currently holds `queue`.
    async fn lock_book(&self, queue: &str) -> QuotaResult<OwnedMutexGuard<CohortBook>> {
        for _ in 0..LOOKUP_ATTEMPTS {
            let book = {
                let dir = self.directory.read().await;
                let key = dir
                    .queues
                    .get(queue)
                    .ok_or_else(|| QuotaError::UnknownQueue(queue.to_string()))?;
                dir.books
                    .get(key)
                    .cloned()
                    .ok_or_else(|| QuotaError::UnknownQueue(queue.to_string()))?
            };
            let guard = book.lock_owned().await;
            if guard.members.contains_key(queue) {
                return Ok(guard);
            }
        }
        Err(QuotaError::UnknownQueue(queue.to_string()))
    }

    /// Atomically check and debit `usage` against `queue`.
    pub async fn try_reserve(
        &self,
        queue: &str,
        usage: &QuotaUsage,
    ) -> QuotaResult<ReservationToken> {
        let mut book = self.lock_book(queue).await?;
        book.reserve(queue, usage)?;

        let id = self.next_token.fetch_add(1, Ordering::SeqCst);
        book.reservations.insert(
            id,
            Reservation {
                queue: queue.to_string(),
                usage: usage.clone(),
                state: ReservationState::Reserved,
            },
        );
        debug!(%queue, token = id, "quota reserved");
        Ok(ReservationToken {
            id,
            queue: queue.to_string(),
        })
    }

    /// Finalize a reservation as durable usage of `workload`.
    pub async fn commit(&self, token: &ReservationToken, workload: &str) -> QuotaResult<()> {
        let mut book = self.lock_book(&token.queue).await.map_err(|_| QuotaError::Conflict {
            token: token.id,
            reason: format!("queue {} is gone", token.queue),
        })?;
        let reservation = book
            .reservations
            .get_mut(&token.id)
            .ok_or_else(|| QuotaError::Conflict {
                token: token.id,
                reason: "reservation is no longer live".into(),
            })?;

        match &reservation.state {
            ReservationState::Reserved => {
                reservation.state = ReservationState::Committed {
                    workload: workload.to_string(),
                };
                debug!(queue = %token.queue, token = token.id, %workload, "reservation committed");
                Ok(())
            }
            ReservationState::Committed { workload: owner } if owner == workload => Ok(()),
            ReservationState::Committed { workload: owner } => Err(QuotaError::Conflict {
                token: token.id,
                reason: format!("already committed to {owner}"),
            }),
        }
    }

    /// Credit a reservation back. Returns false when the token was already
    /// released or never existed.
    pub async fn release(&self, token: &ReservationToken) -> bool {
        let mut book = match self.lock_book(&token.queue).await {
            Ok(book) => book,
            Err(e) => {
                warn!(token = token.id, error = %e, "release for unknown queue ignored");
                return false;
            }
        };
        let Some(reservation) = book.reservations.remove(&token.id) else {
            return false;
        };
        book.credit(&reservation.queue, &reservation.usage);
        debug!(queue = %token.queue, token = token.id, "quota released");
        true
    }

    /// True while the reservation is reserved or committed.
    pub async fn is_live(&self, token: &ReservationToken) -> bool {
        match self.lock_book(&token.queue).await {
            Ok(book) => book.reservations.contains_key(&token.id),
            Err(_) => false,
        }
    }

    /// What `queue` could reserve right now in one cell.
    pub async fn available(
        &self,
        queue: &str,
        flavor: &str,
        resource: &str,
    ) -> QuotaResult<Quantity> {
        let book = self.lock_book(queue).await?;
        Ok(book.available(queue, &FlavorResource::new(flavor, resource)))
    }

    /// Accounting report of one queue.
    pub async fn queue_usage(&self, queue: &str) -> QuotaResult<QueueUsage> {
        let book = self.lock_book(queue).await?;
        book.report(queue)
            .ok_or_else(|| QuotaError::UnknownQueue(queue.to_string()))
    }
}

impl Default for QuotaLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use tessera_state::{FlavorQuotas, QueueingStrategy, ResourceQuota};

    fn queue(name: &str, cohort: Option<&str>, nominal: u64) -> ClusterQueue {
        ClusterQueue {
            name: name.into(),
            cohort: cohort.map(Into::into),
            flavors: vec![FlavorQuotas {
                flavor: "tas".into(),
                resources: BTreeMap::from([(
                    "gpu".into(),
                    ResourceQuota::nominal(Quantity::units(nominal)),
                )]),
            }],
            queueing_strategy: QueueingStrategy::BestEffortFifo,
        }
    }

    fn gpus(n: u64) -> QuotaUsage {
        QuotaUsage::new().with("tas", "gpu", Quantity::units(n))
    }

    #[tokio::test]
    async fn reserve_commit_release_cycle() {
        let ledger = QuotaLedger::with_queues(&[queue("cq", None, 8)]).await;

        let token = ledger.try_reserve("cq", &gpus(3)).await.unwrap();
        assert_eq!(ledger.available("cq", "tas", "gpu").await.unwrap(), Quantity::units(5));

        ledger.commit(&token, "ns/job").await.unwrap();
        assert!(ledger.is_live(&token).await);
        assert_eq!(ledger.available("cq", "tas", "gpu").await.unwrap(), Quantity::units(5));

        assert!(ledger.release(&token).await);
        assert_eq!(ledger.available("cq", "tas", "gpu").await.unwrap(), Quantity::units(8));
    }

    #[tokio::test]
    async fn double_release_is_a_noop() {
        let ledger = QuotaLedger::with_queues(&[queue("cq", None, 8)]).await;
        let token = ledger.try_reserve("cq", &gpus(2)).await.unwrap();

        assert!(ledger.release(&token).await);
        assert!(!ledger.release(&token).await);
        assert_eq!(ledger.available("cq", "tas", "gpu").await.unwrap(), Quantity::units(8));
    }

    #[tokio::test]
    async fn commit_after_release_conflicts() {
        let ledger = QuotaLedger::with_queues(&[queue("cq", None, 8)]).await;
        let token = ledger.try_reserve("cq", &gpus(2)).await.unwrap();
        ledger.release(&token).await;

        let err = ledger.commit(&token, "ns/job").await.unwrap_err();
        assert!(matches!(err, QuotaError::Conflict { .. }));
    }

    #[tokio::test]
    async fn commit_is_idempotent_for_same_workload() {
        let ledger = QuotaLedger::with_queues(&[queue("cq", None, 8)]).await;
        let token = ledger.try_reserve("cq", &gpus(2)).await.unwrap();
        ledger.commit(&token, "ns/a").await.unwrap();
        ledger.commit(&token, "ns/a").await.unwrap();
        assert!(ledger.commit(&token, "ns/b").await.is_err());
    }

    #[tokio::test]
    async fn insufficient_quota_names_the_cell() {
        let ledger = QuotaLedger::with_queues(&[queue("cq", None, 2)]).await;
        let err = ledger.try_reserve("cq", &gpus(3)).await.unwrap_err();
        assert_eq!(
            err,
            QuotaError::InsufficientQuota {
                queue: "cq".into(),
                flavor: "tas".into(),
                resource: "gpu".into(),
                requested: Quantity::units(3),
                available: Quantity::units(2),
            }
        );
    }

    #[tokio::test]
    async fn unknown_queue() {
        let ledger = QuotaLedger::new();
        assert!(matches!(
            ledger.try_reserve("nope", &gpus(1)).await,
            Err(QuotaError::UnknownQueue(_))
        ));
        let token = ReservationToken {
            id: 42,
            queue: "nope".into(),
        };
        assert!(!ledger.release(&token).await);
    }

    #[tokio::test]
    async fn cohort_members_share_idle_quota() {
        let ledger =
            QuotaLedger::with_queues(&[queue("a", Some("pool"), 4), queue("b", Some("pool"), 4)])
                .await;
        assert_eq!(ledger.cohort_of("a").await.as_deref(), Some("pool"));

        let token = ledger.try_reserve("a", &gpus(7)).await.unwrap();
        assert_eq!(ledger.available("b", "tas", "gpu").await.unwrap(), Quantity::units(1));

        let report = ledger.queue_usage("a").await.unwrap();
        let cell = report.cell("tas", "gpu").unwrap();
        assert_eq!(cell.used, Quantity::units(7));
        assert_eq!(cell.borrowed, Quantity::units(3));

        ledger.release(&token).await;
        assert_eq!(ledger.available("b", "tas", "gpu").await.unwrap(), Quantity::units(8));
    }

    #[tokio::test]
    async fn moving_a_queue_keeps_its_reservations() {
        let ledger = QuotaLedger::with_queues(&[queue("a", None, 4), queue("b", Some("pool"), 4)])
            .await;
        let token = ledger.try_reserve("a", &gpus(3)).await.unwrap();

        ledger.upsert_queue(&queue("a", Some("pool"), 4)).await;
        assert_eq!(ledger.cohort_of("a").await.as_deref(), Some("pool"));
        assert!(ledger.is_live(&token).await);
        assert_eq!(ledger.available("b", "tas", "gpu").await.unwrap(), Quantity::units(5));

        assert!(ledger.release(&token).await);
        assert_eq!(ledger.available("b", "tas", "gpu").await.unwrap(), Quantity::units(8));
    }

    #[tokio::test]
    async fn updating_quota_keeps_usage() {
        let ledger = QuotaLedger::with_queues(&[queue("cq", None, 4)]).await;
        ledger.try_reserve("cq", &gpus(3)).await.unwrap();
        ledger.upsert_queue(&queue("cq", None, 10)).await;
        assert_eq!(ledger.available("cq", "tas", "gpu").await.unwrap(), Quantity::units(7));
    }
}
