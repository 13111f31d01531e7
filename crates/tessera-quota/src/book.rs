//! Cohort books — the synchronous accounting behind the ledger.
//!
//! For one quota cell and a queue `q` of cohort `C`:
//!
//! ```text
//! G_q  = nominal_q - min(lending_limit_q, nominal_q)     guaranteed, never lent
//! P    = Σ_C min(lending_limit, nominal)                  cohort lendable pool
//! S    = Σ_C max(0, used - G)                             pool already consumed
//! available_q = min( nominal_q + borrowing_limit_q - used_q,
//!                    max(0, G_q - used_q) + (P - S) )
//! ```
//!
//! A queue alone in its cohort reduces to `nominal - used`.

use std::collections::{BTreeMap, HashMap};

use tessera_state::{ClusterQueue, Quantity, ResourceQuota};

use crate::error::{QuotaError, QuotaResult};
use crate::types::{FlavorResource, QueueUsage, QuotaUsage, ResourceUsage};

/// Quotas and usage of one cluster queue.
#[derive(Debug, Clone, Default)]
pub(crate) struct QueueBook {
    pub(crate) cohort: Option<String>,
    pub(crate) quotas: BTreeMap<FlavorResource, ResourceQuota>,
    pub(crate) used: BTreeMap<FlavorResource, Quantity>,
}

impl QueueBook {
    pub(crate) fn from_spec(spec: &ClusterQueue) -> Self {
        let mut quotas = BTreeMap::new();
        for fq in &spec.flavors {
            for (resource, quota) in &fq.resources {
                quotas.insert(FlavorResource::new(&fq.flavor, resource), quota.clone());
            }
        }
        Self {
            cohort: spec.cohort.clone(),
            quotas,
            used: BTreeMap::new(),
        }
    }

    fn used(&self, cell: &FlavorResource) -> Quantity {
        self.used.get(cell).copied().unwrap_or_default()
    }

    fn guaranteed(&self, cell: &FlavorResource) -> Quantity {
        self.quotas
            .get(cell)
            .map(|q| q.nominal.saturating_sub(lendable(q)))
            .unwrap_or_default()
    }
}

/// The part of `nominal` offered to the cohort.
fn lendable(quota: &ResourceQuota) -> Quantity {
    match quota.lending_limit {
        Some(limit) => limit.min(quota.nominal),
        None => quota.nominal,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ReservationState {
    Reserved,
    Committed { workload: String },
}

#[derive(Debug, Clone)]
pub(crate) struct Reservation {
    pub(crate) queue: String,
    pub(crate) usage: QuotaUsage,
    pub(crate) state: ReservationState,
}

/// All queues of one cohort plus their live reservations.
#[derive(Debug, Default)]
pub(crate) struct CohortBook {
    pub(crate) members: BTreeMap<String, QueueBook>,
    pub(crate) reservations: HashMap<u64, Reservation>,
}

impl CohortBook {
    pub(crate) fn available(&self, queue: &str, cell: &FlavorResource) -> Quantity {
        let Some(book) = self.members.get(queue) else {
            return Quantity::ZERO;
        };
        let Some(quota) = book.quotas.get(cell) else {
            return Quantity::ZERO;
        };
        let used = book.used(cell);

        let local_room = match quota.borrowing_limit {
            Some(limit) => (quota.nominal + limit).saturating_sub(used),
            None => Quantity::from_milli(u64::MAX),
        };

        let mut pool = Quantity::ZERO;
        let mut consumed = Quantity::ZERO;
        for member in self.members.values() {
            if let Some(q) = member.quotas.get(cell) {
                pool += lendable(q);
            }
            consumed += member.used(cell).saturating_sub(member.guaranteed(cell));
        }
        let pool_room = pool.saturating_sub(consumed);
        let guaranteed_room = book.guaranteed(cell).saturating_sub(used);

        local_room.min(guaranteed_room + pool_room)
    }

    /// Check every cell of `usage` and charge it to `queue` if all fit.
    pub(crate) fn reserve(&mut self, queue: &str, usage: &QuotaUsage) -> QuotaResult<()> {
        if !self.members.contains_key(queue) {
            return Err(QuotaError::UnknownQueue(queue.to_string()));
        }
        for (cell, requested) in usage.iter() {
            let available = self.available(queue, cell);
            if *requested > available {
                return Err(QuotaError::InsufficientQuota {
                    queue: queue.to_string(),
                    flavor: cell.flavor.clone(),
                    resource: cell.resource.clone(),
                    requested: *requested,
                    available,
                });
            }
        }
        if let Some(book) = self.members.get_mut(queue) {
            for (cell, requested) in usage.iter() {
                *book.used.entry(cell.clone()).or_default() += *requested;
            }
        }
        Ok(())
    }

    /// Credit `usage` back to `queue`.
    pub(crate) fn credit(&mut self, queue: &str, usage: &QuotaUsage) {
        if let Some(book) = self.members.get_mut(queue) {
            for (cell, amount) in usage.iter() {
                if let Some(used) = book.used.get_mut(cell) {
                    *used = used.saturating_sub(*amount);
                    if used.is_zero() {
                        book.used.remove(cell);
                    }
                }
            }
        }
    }

    pub(crate) fn report(&self, queue: &str) -> Option<QueueUsage> {
        let book = self.members.get(queue)?;
        let resources = book
            .quotas
            .iter()
            .map(|(cell, quota)| {
                let used = book.used(cell);
                (
                    cell.to_string(),
                    ResourceUsage {
                        nominal: quota.nominal,
                        borrowing_limit: quota.borrowing_limit,
                        lending_limit: quota.lending_limit,
                        used,
                        borrowed: used.saturating_sub(quota.nominal),
                        available: self.available(queue, cell),
                    },
                )
            })
            .collect();
        Some(QueueUsage {
            queue: queue.to_string(),
            cohort: book.cohort.clone(),
            resources,
        })
    }
}
