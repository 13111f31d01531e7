//! Ledger value types.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use tessera_state::Quantity;

/// A quota cell: one resource of one flavor.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FlavorResource {
    pub flavor: String,
    pub resource: String,
}

impl FlavorResource {
    pub fn new(flavor: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            flavor: flavor.into(),
            resource: resource.into(),
        }
    }
}

impl fmt::Display for FlavorResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.flavor, self.resource)
    }
}

/// Amounts per quota cell, as requested by or charged to a workload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuotaUsage(BTreeMap<FlavorResource, Quantity>);

impl QuotaUsage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, flavor: &str, resource: &str, quantity: Quantity) -> Self {
        self.add(FlavorResource::new(flavor, resource), quantity);
        self
    }

    pub fn add(&mut self, cell: FlavorResource, quantity: Quantity) {
        *self.0.entry(cell).or_default() += quantity;
    }

    pub fn get(&self, cell: &FlavorResource) -> Quantity {
        self.0.get(cell).copied().unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&FlavorResource, &Quantity)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Handle to a live reservation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReservationToken {
    pub id: u64,
    pub queue: String,
}

/// Per-cell accounting of one queue, for reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub nominal: Quantity,
    pub borrowing_limit: Option<Quantity>,
    pub lending_limit: Option<Quantity>,
    /// Reserved plus committed.
    pub used: Quantity,
    /// Usage above nominal, i.e. taken from the cohort.
    pub borrowed: Quantity,
    /// What the queue could still reserve right now.
    pub available: Quantity,
}

/// Accounting of one queue across all its cells.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueUsage {
    pub queue: String,
    pub cohort: Option<String>,
    pub resources: BTreeMap<String, ResourceUsage>,
}

impl QueueUsage {
    pub fn cell(&self, flavor: &str, resource: &str) -> Option<&ResourceUsage> {
        self.resources.get(&format!("{flavor}/{resource}"))
    }
}
