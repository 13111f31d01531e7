//! Domain types for the Tessera admission engine.
//!
//! These types describe what is submitted (workloads and their pod sets),
//! what capacity exists (flavors, topologies, nodes), who is entitled to it
//! (cluster and local queues), and what was decided (admissions and
//! topology assignments). All types are serde-serializable so they can be
//! loaded from configuration and reported as JSON.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::quantity::{Quantity, ResourceList};

/// Name of a cluster queue.
pub type QueueName = String;

/// Name of a resource flavor.
pub type FlavorName = String;

/// Node-label style key/value map.
pub type Labels = BTreeMap<String, String>;

// ── Workload ───────────────────────────────────────────────────────

/// `{namespace}/{name}` identity of a workload.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WorkloadKey {
    pub namespace: String,
    pub name: String,
}

impl WorkloadKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for WorkloadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// The unit of admission: one submitted job's full resource ask.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workload {
    pub namespace: String,
    pub name: String,
    /// Local queue (in `namespace`) the workload was submitted through.
    pub queue_name: String,
    /// Higher values are admitted first.
    #[serde(default)]
    pub priority: i32,
    /// Submission order; assigned by the scheduler on submit.
    #[serde(default)]
    pub created_seq: u64,
    pub pod_sets: Vec<PodSet>,
    #[serde(default)]
    pub status: WorkloadStatus,
}

impl Workload {
    pub fn key(&self) -> WorkloadKey {
        WorkloadKey::new(&self.namespace, &self.name)
    }

    /// True when any pod set carries a topology request.
    pub fn is_topology_constrained(&self) -> bool {
        self.pod_sets.iter().any(|ps| ps.topology_request.is_constrained())
    }

    /// Total resources requested across all pod sets and replicas.
    pub fn total_requests(&self) -> ResourceList {
        let mut total = ResourceList::new();
        for ps in &self.pod_sets {
            total.add(&ps.total_requests());
        }
        total
    }
}

/// A named, homogeneous group of replicas sharing one resource request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodSet {
    pub name: String,
    /// Concurrently running replicas.
    pub count: u32,
    /// Per-replica resource request.
    pub requests: ResourceList,
    #[serde(default)]
    pub topology_request: TopologyRequest,
}

impl PodSet {
    pub fn total_requests(&self) -> ResourceList {
        self.requests.scaled(self.count)
    }
}

/// Locality constraint attached to a pod set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "mode", content = "level", rename_all = "snake_case")]
pub enum TopologyRequest {
    /// No locality constraint.
    #[default]
    None,
    /// All replicas must land in a single domain of this level.
    Required(String),
    /// Prefer a single domain of this level, relax towards coarser levels.
    Preferred(String),
}

impl TopologyRequest {
    pub fn is_constrained(&self) -> bool {
        !matches!(self, TopologyRequest::None)
    }

    /// The level named by the request, if any.
    pub fn level(&self) -> Option<&str> {
        match self {
            TopologyRequest::None => None,
            TopologyRequest::Required(level) | TopologyRequest::Preferred(level) => Some(level),
        }
    }
}

/// Lifecycle phase of a workload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadPhase {
    #[default]
    Pending,
    QuotaReserved,
    Admitted,
    Finished,
    Failed,
}

impl WorkloadPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkloadPhase::Finished | WorkloadPhase::Failed)
    }
}

/// Machine-readable reason a workload is still pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingReason {
    /// The cluster queue (including what it may borrow) cannot cover the request.
    InsufficientQuota,
    /// No topology domain arrangement can host the constrained pod sets.
    TopologyInfeasible,
    /// No flavor of the cluster queue covers the requested resources.
    NoFlavorCovers,
    /// The workload was admitted and then evicted.
    Evicted,
}

impl fmt::Display for PendingReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PendingReason::InsufficientQuota => "InsufficientQuota",
            PendingReason::TopologyInfeasible => "TopologyInfeasible",
            PendingReason::NoFlavorCovers => "NoFlavorCovers",
            PendingReason::Evicted => "Evicted",
        };
        f.write_str(s)
    }
}

/// Observable status of a workload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkloadStatus {
    pub phase: WorkloadPhase,
    pub admission: Option<Admission>,
    pub pending_reason: Option<PendingReason>,
    pub message: Option<String>,
    /// How many times the workload went back to the pending queue.
    #[serde(default)]
    pub requeue_count: u32,
    /// Unix timestamp (seconds) of the last phase change.
    pub last_transition: Option<u64>,
}

// ── Admission ──────────────────────────────────────────────────────

/// Accepted placement-and-quota decision for a workload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Admission {
    pub cluster_queue: QueueName,
    pub pod_set_assignments: Vec<PodSetAssignment>,
}

/// Per pod set part of an admission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodSetAssignment {
    pub name: String,
    pub flavor: FlavorName,
    pub count: u32,
    /// Total resources charged to the queue for this pod set.
    pub resource_usage: ResourceList,
    pub topology_assignment: Option<TopologyAssignment>,
}

/// Binding of a pod set's replicas to concrete topology domains.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyAssignment {
    /// Level keys, coarsest first, down to the finest level.
    pub levels: Vec<String>,
    pub domains: Vec<TopologyDomainAssignment>,
}

impl TopologyAssignment {
    /// Sum of replica counts over all domains.
    pub fn total_count(&self) -> u32 {
        self.domains.iter().map(|d| d.count).sum()
    }
}

/// Replicas bound to one domain, identified by its path (one value per level).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyDomainAssignment {
    pub values: Vec<String>,
    pub count: u32,
}

// ── Capacity definitions ───────────────────────────────────────────

/// Ordered hierarchy of locality levels, coarsest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    pub name: String,
    /// Node label keys, e.g. `["block", "rack", "kubernetes.io/hostname"]`.
    pub levels: Vec<String>,
}

impl Topology {
    pub fn level_index(&self, level: &str) -> Option<usize> {
        self.levels.iter().position(|l| l == level)
    }
}

/// A named capacity class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceFlavor {
    pub name: FlavorName,
    /// Labels a node must carry to belong to this flavor.
    #[serde(default)]
    pub node_labels: Labels,
    /// Topology the flavor's nodes are arranged in.
    #[serde(default)]
    pub topology_name: Option<String>,
}

/// Quota for one resource within one flavor of a cluster queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceQuota {
    pub nominal: Quantity,
    /// How much more than `nominal` the queue may borrow from its cohort.
    #[serde(default)]
    pub borrowing_limit: Option<Quantity>,
    /// How much of `nominal` the queue lends to its cohort.
    #[serde(default)]
    pub lending_limit: Option<Quantity>,
}

impl ResourceQuota {
    pub fn nominal(nominal: Quantity) -> Self {
        Self {
            nominal,
            borrowing_limit: None,
            lending_limit: None,
        }
    }
}

/// Quotas of one flavor within a cluster queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlavorQuotas {
    pub flavor: FlavorName,
    pub resources: BTreeMap<String, ResourceQuota>,
}

impl FlavorQuotas {
    /// True when the flavor has quota for every requested resource.
    pub fn covers(&self, requests: &ResourceList) -> bool {
        requests.names().all(|r| self.resources.contains_key(r))
    }
}

/// How a cluster queue treats a head workload that cannot be admitted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueingStrategy {
    /// Keep evaluating workloads behind an inadmissible one.
    #[default]
    BestEffortFifo,
    /// Stop evaluating the queue for the cycle once one workload is blocked.
    StrictFifo,
}

/// Quota-owning queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterQueue {
    pub name: QueueName,
    /// Cohort the queue borrows from and lends to.
    #[serde(default)]
    pub cohort: Option<String>,
    /// Flavors in preference order.
    pub flavors: Vec<FlavorQuotas>,
    #[serde(default)]
    pub queueing_strategy: QueueingStrategy,
}

/// Namespaced handle through which workloads reach a cluster queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalQueue {
    pub namespace: String,
    pub name: String,
    pub cluster_queue: QueueName,
}

/// A node as reported by the inventory feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub name: String,
    #[serde(default)]
    pub labels: Labels,
    pub allocatable: ResourceList,
    /// Usage by pods the admission engine does not account for.
    #[serde(default)]
    pub allocated: ResourceList,
    #[serde(default = "default_true")]
    pub schedulable: bool,
}

fn default_true() -> bool {
    true
}

/// Static definitions the engine is configured with.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterDefinition {
    #[serde(default)]
    pub topologies: Vec<Topology>,
    #[serde(default)]
    pub flavors: Vec<ResourceFlavor>,
    #[serde(default)]
    pub cluster_queues: Vec<ClusterQueue>,
    #[serde(default)]
    pub local_queues: Vec<LocalQueue>,
}

impl ClusterDefinition {
    pub fn topology(&self, name: &str) -> Option<&Topology> {
        self.topologies.iter().find(|t| t.name == name)
    }

    pub fn flavor(&self, name: &str) -> Option<&ResourceFlavor> {
        self.flavors.iter().find(|f| f.name == name)
    }

    pub fn cluster_queue(&self, name: &str) -> Option<&ClusterQueue> {
        self.cluster_queues.iter().find(|q| q.name == name)
    }

    /// Resolve `namespace/local_queue` to its cluster queue.
    pub fn resolve_local_queue(&self, namespace: &str, name: &str) -> Option<&ClusterQueue> {
        self.local_queues
            .iter()
            .find(|lq| lq.namespace == namespace && lq.name == name)
            .and_then(|lq| self.cluster_queue(&lq.cluster_queue))
    }

    /// Topology bound to a flavor, if the flavor names one that exists.
    pub fn flavor_topology(&self, flavor: &str) -> Option<&Topology> {
        self.flavor(flavor)
            .and_then(|f| f.topology_name.as_deref())
            .and_then(|t| self.topology(t))
    }
}
