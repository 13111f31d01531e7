//! Admission scheduler — turns pending workloads into admissions.
//!
//! One admission cycle:
//!
//! ```text
//! rebuild snapshot ─► drain pending queue (priority, then FIFO)
//!   └─ per workload: assign flavors ─► try_reserve ─► place
//!        └─ commit (per cluster queue lock) ─► Admitted ─► StartDirective
//! ```
//!
//! A workload that does not fit stays pending with a reason. One that lost a
//! race (stale snapshot, commit conflict) is requeued without a reason. Both
//! go back in the queue for the next cycle.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock, watch};
use tracing::{debug, error, info, warn};

use tessera_placement::{Placement, place_workload};
use tessera_quota::{FlavorResource, QuotaError, QuotaLedger, QuotaUsage, ReservationToken};
use tessera_state::{
    Admission, ClusterDefinition, ClusterQueue, JobSpec, NodeInfo, PendingReason, PodSet,
    PodSetAssignment, QueueingStrategy, ResourceList, Workload, WorkloadKey, WorkloadPhase,
    WorkloadStatus, validate_cluster_queue, validate_workload,
};
use tessera_topology::{ClusterSnapshot, SnapshotStore, TopologyUsage};

use crate::error::{SchedulerError, SchedulerResult};
use crate::execution::{ExecutionAdapter, PodSetStart, StartDirective, node_selector};
use crate::queue::PendingQueue;

/// Scheduler tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Attempts per workload per cycle when a commit loses a race.
    pub max_commit_attempts: u32,
    /// Delay between cycles in [`AdmissionScheduler::run`].
    pub cycle_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_commit_attempts: 3,
            cycle_interval: Duration::from_secs(1),
        }
    }
}

/// What one cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleReport {
    pub snapshot_generation: u64,
    pub admitted: Vec<WorkloadKey>,
    pub pending: Vec<(WorkloadKey, PendingReason)>,
    /// Requeued without a reason (stale snapshot, lost commit race,
    /// cluster queue blocked by a strict FIFO head).
    pub requeued: usize,
}

/// A workload plus bookkeeping the scheduler keeps next to it.
struct Tracked {
    workload: Workload,
    /// Changes whenever the key is re-submitted, so an evaluation can tell
    /// its workload from a replacement with the same name.
    uid: u64,
    /// Committed reservation while admitted.
    token: Option<ReservationToken>,
}

/// Outcome of evaluating one workload.
enum Attempt {
    Admitted,
    Pending(PendingReason, String),
    /// Put back without a reason.
    Requeue,
    /// The workload was cancelled or replaced mid-evaluation.
    Gone,
}

/// Flavor choice and quota charge for a whole workload.
struct FlavorPlan {
    flavors: Vec<String>,
    usage: QuotaUsage,
}

pub struct AdmissionScheduler {
    definition: RwLock<ClusterDefinition>,
    ledger: Arc<QuotaLedger>,
    store: Arc<SnapshotStore>,
    adapter: Arc<dyn ExecutionAdapter>,
    config: SchedulerConfig,
    workloads: RwLock<HashMap<WorkloadKey, Tracked>>,
    pending: Mutex<PendingQueue>,
    /// Topology usage of admitted workloads, netted out of every snapshot.
    committed: RwLock<TopologyUsage>,
    commit_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    cycle: Mutex<()>,
    next_seq: AtomicU64,
    next_uid: AtomicU64,
}

impl AdmissionScheduler {
    /// Create a scheduler over `definition`. Cluster queues are validated
    /// and registered in `ledger`.
    pub async fn new(
        definition: ClusterDefinition,
        ledger: Arc<QuotaLedger>,
        store: Arc<SnapshotStore>,
        adapter: Arc<dyn ExecutionAdapter>,
        config: SchedulerConfig,
    ) -> SchedulerResult<Self> {
        for topology in &definition.topologies {
            tessera_state::validate_topology(topology)?;
        }
        for flavor in &definition.flavors {
            tessera_state::validate_flavor(flavor)?;
        }
        for cq in &definition.cluster_queues {
            validate_cluster_queue(cq)?;
            ledger.upsert_queue(cq).await;
        }
        info!(
            cluster_queues = definition.cluster_queues.len(),
            flavors = definition.flavors.len(),
            topologies = definition.topologies.len(),
            "admission scheduler initialized"
        );
        Ok(Self {
            definition: RwLock::new(definition),
            ledger,
            store,
            adapter,
            config,
            workloads: RwLock::new(HashMap::new()),
            pending: Mutex::new(PendingQueue::new()),
            committed: RwLock::new(TopologyUsage::new()),
            commit_locks: Mutex::new(HashMap::new()),
            cycle: Mutex::new(()),
            next_seq: AtomicU64::new(1),
            next_uid: AtomicU64::new(1),
        })
    }

    pub fn ledger(&self) -> &Arc<QuotaLedger> {
        &self.ledger
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    // ── Submissions ─────────────────────────────────────────────────

    /// Accept a workload into the pending queue.
    pub async fn submit(&self, mut workload: Workload) -> SchedulerResult<WorkloadKey> {
        validate_workload(&workload)?;
        {
            let definition = self.definition.read().await;
            if definition
                .resolve_local_queue(&workload.namespace, &workload.queue_name)
                .is_none()
            {
                return Err(SchedulerError::UnknownLocalQueue {
                    namespace: workload.namespace.clone(),
                    name: workload.queue_name.clone(),
                });
            }
        }

        let key = workload.key();
        let mut workloads = self.workloads.write().await;
        if workloads.contains_key(&key) {
            return Err(SchedulerError::AlreadyExists(key));
        }

        workload.created_seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        workload.status = WorkloadStatus {
            last_transition: Some(epoch_secs()),
            ..WorkloadStatus::default()
        };
        let uid = self.next_uid.fetch_add(1, Ordering::SeqCst);

        self.pending
            .lock()
            .await
            .push(key.clone(), workload.priority, workload.created_seq);
        info!(
            workload = %key,
            queue = %workload.queue_name,
            priority = workload.priority,
            pod_sets = workload.pod_sets.len(),
            "workload submitted"
        );
        workloads.insert(
            key.clone(),
            Tracked {
                workload,
                uid,
                token: None,
            },
        );
        Ok(key)
    }

    /// Convert a job to its workload and submit it.
    pub async fn submit_job(&self, job: &JobSpec) -> SchedulerResult<WorkloadKey> {
        let workload = Workload::from_job(job)?;
        self.submit(workload).await
    }

    /// Withdraw a workload. Any quota it holds is released.
    pub async fn cancel(&self, key: &WorkloadKey) -> SchedulerResult<()> {
        let mut tracked = self
            .workloads
            .write()
            .await
            .remove(key)
            .ok_or_else(|| SchedulerError::WorkloadNotFound(key.clone()))?;
        self.pending.lock().await.remove(key);

        let was_admitted = tracked.workload.status.phase == WorkloadPhase::Admitted;
        self.release_admission(&mut tracked).await;
        if was_admitted && let Err(e) = self.adapter.stop(key, "cancelled") {
            warn!(workload = %key, error = %e, "failed to publish stop directive");
        }
        info!(workload = %key, was_admitted, "workload cancelled");
        Ok(())
    }

    // ── Execution feedback ──────────────────────────────────────────

    /// The workload ran to completion.
    pub async fn finish(&self, key: &WorkloadKey) -> SchedulerResult<()> {
        self.complete(key, WorkloadPhase::Finished, None).await
    }

    /// The workload failed while running.
    pub async fn fail(&self, key: &WorkloadKey, message: &str) -> SchedulerResult<()> {
        self.complete(key, WorkloadPhase::Failed, Some(message.to_string()))
            .await
    }

    async fn complete(
        &self,
        key: &WorkloadKey,
        phase: WorkloadPhase,
        message: Option<String>,
    ) -> SchedulerResult<()> {
        let mut workloads = self.workloads.write().await;
        let tracked = workloads
            .get_mut(key)
            .ok_or_else(|| SchedulerError::WorkloadNotFound(key.clone()))?;
        let from = tracked.workload.status.phase;
        if from != WorkloadPhase::Admitted {
            return Err(SchedulerError::InvalidTransition {
                key: key.clone(),
                from,
                to: phase,
            });
        }

        self.release_admission(tracked).await;
        let status = &mut tracked.workload.status;
        status.phase = phase;
        status.message = message;
        status.last_transition = Some(epoch_secs());
        info!(workload = %key, ?phase, "workload completed");
        Ok(())
    }

    /// Take an admitted workload back to pending, releasing its quota.
    pub async fn evict(&self, key: &WorkloadKey, reason: &str) -> SchedulerResult<()> {
        {
            let mut workloads = self.workloads.write().await;
            let tracked = workloads
                .get_mut(key)
                .ok_or_else(|| SchedulerError::WorkloadNotFound(key.clone()))?;
            let from = tracked.workload.status.phase;
            if from != WorkloadPhase::Admitted {
                return Err(SchedulerError::InvalidTransition {
                    key: key.clone(),
                    from,
                    to: WorkloadPhase::Pending,
                });
            }

            self.release_admission(tracked).await;
            let status = &mut tracked.workload.status;
            status.phase = WorkloadPhase::Pending;
            status.admission = None;
            status.pending_reason = Some(PendingReason::Evicted);
            status.message = Some(reason.to_string());
            status.requeue_count += 1;
            status.last_transition = Some(epoch_secs());

            self.pending.lock().await.push(
                key.clone(),
                tracked.workload.priority,
                tracked.workload.created_seq,
            );
        }

        if let Err(e) = self.adapter.stop(key, reason) {
            warn!(workload = %key, error = %e, "failed to publish stop directive");
        }
        info!(workload = %key, %reason, "workload evicted");
        Ok(())
    }

    /// Release the committed reservation and topology usage of an admitted
    /// workload. A no-op once the reservation has been released.
    async fn release_admission(&self, tracked: &mut Tracked) {
        let Some(token) = tracked.token.take() else {
            return;
        };
        self.ledger.release(&token).await;
        let Some(admission) = &tracked.workload.status.admission else {
            return;
        };
        let mut committed = self.committed.write().await;
        for psa in &admission.pod_set_assignments {
            let Some(assignment) = &psa.topology_assignment else {
                continue;
            };
            if let Some(ps) = tracked.workload.pod_sets.iter().find(|p| p.name == psa.name) {
                committed.remove(&psa.flavor, assignment, &ps.requests);
            }
        }
    }

    // ── Inventory and definitions ───────────────────────────────────

    /// Replace the node inventory. The next cycle builds a fresh snapshot;
    /// evaluations still running against the old one will not commit.
    pub async fn update_nodes(&self, nodes: Vec<NodeInfo>) {
        self.store.replace_nodes(nodes).await;
    }

    /// Add or update one node of the inventory.
    pub async fn upsert_node(&self, node: NodeInfo) {
        self.store.upsert_node(node).await;
    }

    /// Drop a node from the inventory. Returns false for an unknown node.
    pub async fn remove_node(&self, name: &str) -> bool {
        self.store.remove_node(name).await
    }

    /// The most recently published topology snapshot.
    pub async fn snapshot(&self) -> Arc<ClusterSnapshot> {
        self.store.load().await
    }

    /// Add or replace a cluster queue definition.
    pub async fn upsert_cluster_queue(&self, cq: ClusterQueue) -> SchedulerResult<()> {
        validate_cluster_queue(&cq)?;
        self.ledger.upsert_queue(&cq).await;
        let mut definition = self.definition.write().await;
        match definition
            .cluster_queues
            .iter_mut()
            .find(|q| q.name == cq.name)
        {
            Some(existing) => *existing = cq,
            None => definition.cluster_queues.push(cq),
        }
        Ok(())
    }

    // ── Queries ─────────────────────────────────────────────────────

    pub async fn workload(&self, key: &WorkloadKey) -> Option<Workload> {
        self.workloads
            .read()
            .await
            .get(key)
            .map(|t| t.workload.clone())
    }

    /// All known workloads, ordered by key.
    pub async fn workloads(&self) -> Vec<Workload> {
        let mut all: Vec<Workload> = self
            .workloads
            .read()
            .await
            .values()
            .map(|t| t.workload.clone())
            .collect();
        all.sort_by_key(|w| w.key());
        all
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    // ── Admission cycle ─────────────────────────────────────────────

    /// Run one admission cycle over everything currently pending.
    pub async fn run_cycle(&self) -> SchedulerResult<CycleReport> {
        let _cycle = self.cycle.lock().await;

        let definition = self.definition.read().await.clone();
        let committed = self.committed.read().await.clone();
        let snapshot = self.store.rebuild(&definition, &committed).await?;
        let order = self.pending.lock().await.drain();

        let mut report = CycleReport {
            snapshot_generation: snapshot.generation,
            ..CycleReport::default()
        };
        if order.is_empty() {
            return Ok(report);
        }
        debug!(
            pending = order.len(),
            snapshot = snapshot.generation,
            "admission cycle started"
        );

        let mut assumed = TopologyUsage::new();
        let mut blocked: HashSet<String> = HashSet::new();
        let mut stale = false;

        for key in order {
            let Some((workload, uid)) = self.pending_workload(&key).await else {
                continue;
            };
            if stale {
                self.requeue(&workload).await;
                report.requeued += 1;
                continue;
            }

            let Some(cq) = definition
                .resolve_local_queue(&workload.namespace, &workload.queue_name)
                .cloned()
            else {
                let message = format!("local queue {} not found", workload.queue_name);
                self.mark_pending(&key, uid, PendingReason::NoFlavorCovers, message)
                    .await;
                report.pending.push((key, PendingReason::NoFlavorCovers));
                continue;
            };
            if blocked.contains(&cq.name) {
                self.requeue(&workload).await;
                report.requeued += 1;
                continue;
            }

            match self
                .attempt(&definition, &snapshot, &cq, &workload, uid, &mut assumed)
                .await
            {
                Attempt::Admitted => report.admitted.push(key),
                Attempt::Pending(reason, message) => {
                    self.mark_pending(&key, uid, reason, message).await;
                    report.pending.push((key, reason));
                    if cq.queueing_strategy == QueueingStrategy::StrictFifo {
                        blocked.insert(cq.name.clone());
                    }
                }
                Attempt::Requeue => {
                    if self.store.is_stale(&snapshot) {
                        stale = true;
                    }
                    self.requeue(&workload).await;
                    report.requeued += 1;
                    if cq.queueing_strategy == QueueingStrategy::StrictFifo {
                        blocked.insert(cq.name.clone());
                    }
                }
                Attempt::Gone => {}
            }
        }

        info!(
            snapshot = report.snapshot_generation,
            admitted = report.admitted.len(),
            pending = report.pending.len(),
            requeued = report.requeued,
            "admission cycle finished"
        );
        Ok(report)
    }

    /// Cycle every `cycle_interval` until `shutdown` changes.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let interval = self.config.cycle_interval;
        info!(interval_ms = interval.as_millis() as u64, "admission loop started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.run_cycle().await {
                        error!(error = %e, "admission cycle failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("admission loop shutting down");
                    break;
                }
            }
        }
    }

    /// Evaluate one workload, retrying when the commit loses a race.
    async fn attempt(
        &self,
        definition: &ClusterDefinition,
        snapshot: &ClusterSnapshot,
        cq: &ClusterQueue,
        workload: &Workload,
        uid: u64,
        assumed: &mut TopologyUsage,
    ) -> Attempt {
        let key = workload.key();

        for attempt in 1..=self.config.max_commit_attempts.max(1) {
            let plan = match self.assign_flavors(definition, cq, workload).await {
                Ok(plan) => plan,
                Err((reason, message)) => return Attempt::Pending(reason, message),
            };

            let token = match self.ledger.try_reserve(&cq.name, &plan.usage).await {
                Ok(token) => token,
                Err(e @ QuotaError::InsufficientQuota { .. }) => {
                    return Attempt::Pending(PendingReason::InsufficientQuota, e.to_string());
                }
                Err(e) => {
                    warn!(workload = %key, error = %e, "quota reservation failed, requeueing");
                    return Attempt::Requeue;
                }
            };
            self.set_phase(&key, uid, WorkloadPhase::QuotaReserved).await;

            let pod_sets: Vec<(&PodSet, &str)> = workload
                .pod_sets
                .iter()
                .zip(plan.flavors.iter().map(String::as_str))
                .collect();
            let mut scratch = assumed.clone();
            let placements = match place_workload(snapshot, &pod_sets, &mut scratch) {
                Ok(p) => p,
                Err(e) => {
                    self.ledger.release(&token).await;
                    debug!(workload = %key, error = %e, "placement infeasible");
                    return Attempt::Pending(PendingReason::TopologyInfeasible, e.to_string());
                }
            };

            match self
                .commit(definition, snapshot, cq, workload, uid, &token, &plan, &placements)
                .await
            {
                Ok(true) => {
                    *assumed = scratch;
                    return Attempt::Admitted;
                }
                Ok(false) => {
                    self.ledger.release(&token).await;
                    debug!(workload = %key, "workload vanished before commit");
                    return Attempt::Gone;
                }
                Err(SchedulerError::SnapshotStale(generation)) => {
                    self.ledger.release(&token).await;
                    debug!(workload = %key, generation, "snapshot went stale, requeueing");
                    return Attempt::Requeue;
                }
                Err(SchedulerError::Quota(QuotaError::Conflict { reason, .. })) => {
                    self.ledger.release(&token).await;
                    warn!(workload = %key, attempt, %reason, "commit conflict, retrying");
                }
                Err(e) => {
                    self.ledger.release(&token).await;
                    warn!(workload = %key, error = %e, "commit failed, requeueing");
                    return Attempt::Requeue;
                }
            }
        }

        warn!(workload = %key, "commit attempts exhausted");
        Attempt::Requeue
    }

    /// Pick a flavor per pod set, in the cluster queue's preference order.
    async fn assign_flavors(
        &self,
        definition: &ClusterDefinition,
        cq: &ClusterQueue,
        workload: &Workload,
    ) -> Result<FlavorPlan, (PendingReason, String)> {
        let mut plan = FlavorPlan {
            flavors: Vec::with_capacity(workload.pod_sets.len()),
            usage: QuotaUsage::new(),
        };

        for ps in &workload.pod_sets {
            let total = ps.total_requests();
            let mut shortfall: Option<String> = None;
            let mut chosen: Option<&str> = None;

            for fq in &cq.flavors {
                if !fq.covers(&ps.requests) {
                    continue;
                }
                if let Some(level) = ps.topology_request.level() {
                    let has_level = definition
                        .flavor_topology(&fq.flavor)
                        .is_some_and(|t| t.level_index(level).is_some());
                    if !has_level {
                        continue;
                    }
                }
                match self.quota_shortfall(cq, &fq.flavor, &total, &plan.usage).await {
                    None => {
                        chosen = Some(fq.flavor.as_str());
                        break;
                    }
                    Some(message) => {
                        shortfall.get_or_insert(message);
                    }
                }
            }

            let Some(flavor) = chosen else {
                return Err(match shortfall {
                    Some(message) => (PendingReason::InsufficientQuota, message),
                    None if ps.topology_request.is_constrained() => (
                        PendingReason::TopologyInfeasible,
                        format!(
                            "pod set {}: no flavor of {} has topology level {}",
                            ps.name,
                            cq.name,
                            ps.topology_request.level().unwrap_or_default()
                        ),
                    ),
                    None => (
                        PendingReason::NoFlavorCovers,
                        format!(
                            "pod set {}: no flavor of {} covers its resources",
                            ps.name, cq.name
                        ),
                    ),
                });
            };

            for (resource, quantity) in total.iter() {
                plan.usage.add(FlavorResource::new(flavor, resource), *quantity);
            }
            plan.flavors.push(flavor.to_string());
        }
        Ok(plan)
    }

    /// None when `total` fits in what remains of `flavor` after `planned`.
    async fn quota_shortfall(
        &self,
        cq: &ClusterQueue,
        flavor: &str,
        total: &ResourceList,
        planned: &QuotaUsage,
    ) -> Option<String> {
        for (resource, quantity) in total.iter() {
            let available = match self.ledger.available(&cq.name, flavor, resource).await {
                Ok(q) => q,
                Err(e) => return Some(e.to_string()),
            };
            let already = planned.get(&FlavorResource::new(flavor, resource));
            let remaining = available.saturating_sub(already);
            if *quantity > remaining {
                return Some(format!(
                    "insufficient quota in {} for {flavor}/{resource}: \
                     requested {quantity}, available {remaining}",
                    cq.name
                ));
            }
        }
        None
    }

    /// Make the admission durable. `Ok(false)` when the workload was
    /// cancelled or replaced while it was being evaluated.
    #[allow(clippy::too_many_arguments)]
    async fn commit(
        &self,
        definition: &ClusterDefinition,
        snapshot: &ClusterSnapshot,
        cq: &ClusterQueue,
        workload: &Workload,
        uid: u64,
        token: &ReservationToken,
        plan: &FlavorPlan,
        placements: &[Option<Placement>],
    ) -> SchedulerResult<bool> {
        let key = workload.key();
        let lock = self.commit_lock(&cq.name).await;
        let _guard = lock.lock().await;

        let mut workloads = self.workloads.write().await;
        let Some(tracked) = workloads.get_mut(&key).filter(|t| t.uid == uid) else {
            return Ok(false);
        };
        if self.store.is_stale(snapshot) {
            return Err(SchedulerError::SnapshotStale(snapshot.generation));
        }
        self.ledger.commit(token, &key.to_string()).await?;

        let mut pod_set_assignments = Vec::with_capacity(workload.pod_sets.len());
        let mut starts = Vec::with_capacity(workload.pod_sets.len());
        {
            let mut committed = self.committed.write().await;
            for ((ps, flavor), placement) in workload
                .pod_sets
                .iter()
                .zip(&plan.flavors)
                .zip(placements)
            {
                if let Some(p) = placement {
                    committed.add(flavor, &p.assignment, &ps.requests);
                }
                let selector = match definition.flavor(flavor) {
                    Some(f) => node_selector(f, placement.as_ref()),
                    None => Default::default(),
                };
                let topology_assignment = placement.as_ref().map(|p| p.assignment.clone());
                pod_set_assignments.push(PodSetAssignment {
                    name: ps.name.clone(),
                    flavor: flavor.clone(),
                    count: ps.count,
                    resource_usage: ps.total_requests(),
                    topology_assignment: topology_assignment.clone(),
                });
                starts.push(PodSetStart {
                    name: ps.name.clone(),
                    count: ps.count,
                    flavor: flavor.clone(),
                    node_selector: selector,
                    topology_assignment,
                });
            }
        }

        tracked.token = Some(token.clone());
        let status = &mut tracked.workload.status;
        status.phase = WorkloadPhase::Admitted;
        status.admission = Some(Admission {
            cluster_queue: cq.name.clone(),
            pod_set_assignments,
        });
        status.pending_reason = None;
        status.message = None;
        status.last_transition = Some(epoch_secs());
        drop(workloads);

        info!(
            workload = %key,
            cluster_queue = %cq.name,
            flavors = ?plan.flavors,
            snapshot = snapshot.generation,
            "workload admitted"
        );

        let directive = StartDirective {
            workload: key.clone(),
            cluster_queue: cq.name.clone(),
            pod_sets: starts,
        };
        if let Err(e) = self.adapter.start(&directive) {
            error!(workload = %key, error = %e, "failed to publish start directive");
        }
        Ok(true)
    }

    async fn commit_lock(&self, queue: &str) -> Arc<Mutex<()>> {
        self.commit_locks
            .lock()
            .await
            .entry(queue.to_string())
            .or_default()
            .clone()
    }

    // ── Status helpers ──────────────────────────────────────────────

    /// Clone of a workload that is still waiting for admission.
    async fn pending_workload(&self, key: &WorkloadKey) -> Option<(Workload, u64)> {
        let workloads = self.workloads.read().await;
        let tracked = workloads.get(key)?;
        (tracked.workload.status.phase == WorkloadPhase::Pending)
            .then(|| (tracked.workload.clone(), tracked.uid))
    }

    async fn set_phase(&self, key: &WorkloadKey, uid: u64, phase: WorkloadPhase) {
        let mut workloads = self.workloads.write().await;
        if let Some(t) = workloads.get_mut(key).filter(|t| t.uid == uid) {
            t.workload.status.phase = phase;
            t.workload.status.last_transition = Some(epoch_secs());
        }
    }

    async fn mark_pending(
        &self,
        key: &WorkloadKey,
        uid: u64,
        reason: PendingReason,
        message: String,
    ) {
        let requeue = {
            let mut workloads = self.workloads.write().await;
            match workloads.get_mut(key).filter(|t| t.uid == uid) {
                Some(t) => {
                    let status = &mut t.workload.status;
                    status.phase = WorkloadPhase::Pending;
                    status.pending_reason = Some(reason);
                    status.message = Some(message.clone());
                    status.requeue_count += 1;
                    status.last_transition = Some(epoch_secs());
                    Some((t.workload.priority, t.workload.created_seq))
                }
                None => None,
            }
        };
        if let Some((priority, seq)) = requeue {
            debug!(workload = %key, %reason, %message, "workload left pending");
            self.pending.lock().await.push(key.clone(), priority, seq);
        }
    }

    async fn requeue(&self, workload: &Workload) {
        let key = workload.key();
        {
            let mut workloads = self.workloads.write().await;
            match workloads.get_mut(&key) {
                Some(t) if !t.workload.status.phase.is_terminal() => {
                    t.workload.status.phase = WorkloadPhase::Pending;
                }
                _ => return,
            }
        }
        self.pending
            .lock()
            .await
            .push(key, workload.priority, workload.created_seq);
    }
}

/// Current Unix epoch in seconds.
fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::execution::{ChannelAdapter, ExecutionCommand};
    use tessera_state::{
        FlavorQuotas, Labels, LocalQueue, Quantity, ResourceFlavor, ResourceQuota, Topology,
        TopologyRequest,
    };
    use tokio::sync::{OwnedMutexGuard, mpsc};
    use tokio::task::JoinHandle;

    fn definition(cpu_quota: u64, strategy: QueueingStrategy) -> ClusterDefinition {
        ClusterDefinition {
            topologies: vec![Topology {
                name: "dc".into(),
                levels: vec!["rack".into(), "hostname".into()],
            }],
            flavors: vec![ResourceFlavor {
                name: "default".into(),
                node_labels: Labels::new(),
                topology_name: Some("dc".into()),
            }],
            cluster_queues: vec![ClusterQueue {
                name: "cq".into(),
                cohort: None,
                flavors: vec![FlavorQuotas {
                    flavor: "default".into(),
                    resources: BTreeMap::from([(
                        "cpu".into(),
                        ResourceQuota::nominal(Quantity::units(cpu_quota)),
                    )]),
                }],
                queueing_strategy: strategy,
            }],
            local_queues: vec![LocalQueue {
                namespace: "default".into(),
                name: "main".into(),
                cluster_queue: "cq".into(),
            }],
        }
    }

    fn node(name: &str, rack: &str, cpu: u64) -> NodeInfo {
        NodeInfo {
            name: name.into(),
            labels: Labels::from([
                ("rack".into(), rack.into()),
                ("hostname".into(), name.into()),
            ]),
            allocatable: ResourceList::new().with("cpu", Quantity::units(cpu)),
            allocated: ResourceList::new(),
            schedulable: true,
        }
    }

    fn workload(name: &str, priority: i32, cpu: u64) -> Workload {
        Workload {
            namespace: "default".into(),
            name: name.into(),
            queue_name: "main".into(),
            priority,
            created_seq: 0,
            pod_sets: vec![PodSet {
                name: "main".into(),
                count: 1,
                requests: ResourceList::new().with("cpu", Quantity::units(cpu)),
                topology_request: TopologyRequest::None,
            }],
            status: WorkloadStatus::default(),
        }
    }

    async fn scheduler(
        cpu_quota: u64,
        strategy: QueueingStrategy,
    ) -> (AdmissionScheduler, mpsc::UnboundedReceiver<ExecutionCommand>) {
        scheduler_with(cpu_quota, strategy, SchedulerConfig::default()).await
    }

    async fn scheduler_with(
        cpu_quota: u64,
        strategy: QueueingStrategy,
        config: SchedulerConfig,
    ) -> (AdmissionScheduler, mpsc::UnboundedReceiver<ExecutionCommand>) {
        let (adapter, rx) = ChannelAdapter::new();
        let store = Arc::new(SnapshotStore::new());
        store.replace_nodes(vec![node("h1", "r1", 8), node("h2", "r2", 8)]).await;
        let sched = AdmissionScheduler::new(
            definition(cpu_quota, strategy),
            Arc::new(QuotaLedger::new()),
            store,
            Arc::new(adapter),
            config,
        )
        .await
        .unwrap();
        (sched, rx)
    }

    fn key(name: &str) -> WorkloadKey {
        WorkloadKey::new("default", name)
    }

    async fn available_cpu(sched: &AdmissionScheduler) -> Quantity {
        sched.ledger().available("cq", "default", "cpu").await.unwrap()
    }

    /// Start a cycle and hold it at the commit of `waiting`, after its quota
    /// has been reserved. Dropping the guard lets the cycle continue.
    async fn cycle_held_at_commit(
        sched: &Arc<AdmissionScheduler>,
        waiting: &WorkloadKey,
    ) -> (OwnedMutexGuard<()>, JoinHandle<SchedulerResult<CycleReport>>) {
        let guard = sched.commit_lock("cq").await.lock_owned().await;
        let cycle = tokio::spawn({
            let sched = sched.clone();
            async move { sched.run_cycle().await }
        });
        tokio::time::timeout(Duration::from_secs(5), async {
            while sched.workload(waiting).await.map(|w| w.status.phase)
                != Some(WorkloadPhase::QuotaReserved)
            {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("cycle never reserved quota");
        (guard, cycle)
    }

    fn assert_requeued_clean(w: &Workload) {
        assert_eq!(w.status.phase, WorkloadPhase::Pending);
        assert_eq!(w.status.pending_reason, None);
        assert!(w.status.admission.is_none());
    }

    #[tokio::test]
    async fn admits_within_quota_and_publishes_start() {
        let (sched, mut rx) = scheduler(4, QueueingStrategy::BestEffortFifo).await;
        sched.submit(workload("a", 0, 2)).await.unwrap();

        let report = sched.run_cycle().await.unwrap();
        assert_eq!(report.admitted, vec![key("a")]);

        let w = sched.workload(&key("a")).await.unwrap();
        assert_eq!(w.status.phase, WorkloadPhase::Admitted);
        let admission = w.status.admission.unwrap();
        assert_eq!(admission.cluster_queue, "cq");
        assert_eq!(admission.pod_set_assignments[0].flavor, "default");
        // Unconstrained, but the flavor has a topology, so capacity is tracked.
        let assignment = admission.pod_set_assignments[0]
            .topology_assignment
            .as_ref()
            .unwrap();
        assert_eq!(assignment.total_count(), 1);

        match rx.recv().await {
            Some(ExecutionCommand::Start(d)) => assert_eq!(d.workload, key("a")),
            other => panic!("expected start, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn over_quota_stays_pending() {
        let (sched, _rx) = scheduler(4, QueueingStrategy::BestEffortFifo).await;
        sched.submit(workload("big", 0, 5)).await.unwrap();

        let report = sched.run_cycle().await.unwrap();
        assert_eq!(report.pending, vec![(key("big"), PendingReason::InsufficientQuota)]);

        let w = sched.workload(&key("big")).await.unwrap();
        assert_eq!(w.status.phase, WorkloadPhase::Pending);
        assert_eq!(w.status.pending_reason, Some(PendingReason::InsufficientQuota));
        assert!(w.status.admission.is_none());
        assert_eq!(sched.pending_count().await, 1);
    }

    #[tokio::test]
    async fn priority_beats_submission_order() {
        let (sched, _rx) = scheduler(4, QueueingStrategy::BestEffortFifo).await;
        sched.submit(workload("early-low", 0, 3)).await.unwrap();
        sched.submit(workload("late-high", 10, 3)).await.unwrap();

        let report = sched.run_cycle().await.unwrap();
        assert_eq!(report.admitted, vec![key("late-high")]);
        assert_eq!(report.pending, vec![(key("early-low"), PendingReason::InsufficientQuota)]);
    }

    #[tokio::test]
    async fn best_effort_admits_behind_blocked_head() {
        let (sched, _rx) = scheduler(4, QueueingStrategy::BestEffortFifo).await;
        sched.submit(workload("big", 0, 5)).await.unwrap();
        sched.submit(workload("small", 0, 1)).await.unwrap();

        let report = sched.run_cycle().await.unwrap();
        assert_eq!(report.admitted, vec![key("small")]);
    }

    #[tokio::test]
    async fn strict_fifo_blocks_behind_head() {
        let (sched, _rx) = scheduler(4, QueueingStrategy::StrictFifo).await;
        sched.submit(workload("big", 0, 5)).await.unwrap();
        sched.submit(workload("small", 0, 1)).await.unwrap();

        let report = sched.run_cycle().await.unwrap();
        assert!(report.admitted.is_empty());
        assert_eq!(report.requeued, 1);
        assert_eq!(sched.pending_count().await, 2);
    }

    #[tokio::test]
    async fn finish_releases_quota() {
        let (sched, _rx) = scheduler(4, QueueingStrategy::BestEffortFifo).await;
        sched.submit(workload("a", 0, 4)).await.unwrap();
        sched.submit(workload("b", 0, 4)).await.unwrap();
        sched.run_cycle().await.unwrap();
        assert_eq!(sched.pending_count().await, 1);

        sched.finish(&key("a")).await.unwrap();
        assert_eq!(
            sched.workload(&key("a")).await.unwrap().status.phase,
            WorkloadPhase::Finished
        );

        let report = sched.run_cycle().await.unwrap();
        assert_eq!(report.admitted, vec![key("b")]);
    }

    #[tokio::test]
    async fn finish_requires_admission() {
        let (sched, _rx) = scheduler(1, QueueingStrategy::BestEffortFifo).await;
        sched.submit(workload("a", 0, 4)).await.unwrap();
        let err = sched.finish(&key("a")).await.unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn evict_returns_to_pending_and_stops() {
        let (sched, mut rx) = scheduler(4, QueueingStrategy::BestEffortFifo).await;
        sched.submit(workload("a", 0, 4)).await.unwrap();
        sched.run_cycle().await.unwrap();
        let _start = rx.recv().await;

        sched.evict(&key("a"), "node drained").await.unwrap();
        let w = sched.workload(&key("a")).await.unwrap();
        assert_eq!(w.status.phase, WorkloadPhase::Pending);
        assert_eq!(w.status.pending_reason, Some(PendingReason::Evicted));
        assert_eq!(w.status.requeue_count, 1);
        assert!(w.status.admission.is_none());
        assert!(matches!(rx.recv().await, Some(ExecutionCommand::Stop { .. })));

        let report = sched.run_cycle().await.unwrap();
        assert_eq!(report.admitted, vec![key("a")]);
    }

    #[tokio::test]
    async fn cancel_releases_and_forgets() {
        let (sched, _rx) = scheduler(4, QueueingStrategy::BestEffortFifo).await;
        sched.submit(workload("a", 0, 4)).await.unwrap();
        sched.run_cycle().await.unwrap();

        sched.cancel(&key("a")).await.unwrap();
        assert!(sched.workload(&key("a")).await.is_none());
        assert_eq!(
            sched.ledger().available("cq", "default", "cpu").await.unwrap(),
            Quantity::units(4)
        );
        assert!(matches!(
            sched.cancel(&key("a")).await,
            Err(SchedulerError::WorkloadNotFound(_))
        ));
    }

    #[tokio::test]
    async fn duplicate_and_unknown_queue_are_rejected() {
        let (sched, _rx) = scheduler(4, QueueingStrategy::BestEffortFifo).await;
        sched.submit(workload("a", 0, 1)).await.unwrap();
        assert!(matches!(
            sched.submit(workload("a", 0, 1)).await,
            Err(SchedulerError::AlreadyExists(_))
        ));

        let mut lost = workload("lost", 0, 1);
        lost.queue_name = "nowhere".into();
        assert!(matches!(
            sched.submit(lost).await,
            Err(SchedulerError::UnknownLocalQueue { .. })
        ));
    }

    #[tokio::test]
    async fn unknown_resource_has_no_flavor() {
        let (sched, _rx) = scheduler(4, QueueingStrategy::BestEffortFifo).await;
        let mut w = workload("gpu", 0, 1);
        w.pod_sets[0].requests = ResourceList::new().with("gpu", Quantity::units(1));
        sched.submit(w).await.unwrap();

        let report = sched.run_cycle().await.unwrap();
        assert_eq!(report.pending, vec![(key("gpu"), PendingReason::NoFlavorCovers)]);
    }

    #[tokio::test]
    async fn upserted_queue_takes_effect_next_cycle() {
        let (sched, _rx) = scheduler(1, QueueingStrategy::BestEffortFifo).await;
        sched.submit(workload("a", 0, 4)).await.unwrap();
        sched.run_cycle().await.unwrap();

        let cq = definition(8, QueueingStrategy::BestEffortFifo).cluster_queues.remove(0);
        sched.upsert_cluster_queue(cq).await.unwrap();

        let report = sched.run_cycle().await.unwrap();
        assert_eq!(report.admitted, vec![key("a")]);
    }

    #[tokio::test]
    async fn topology_usage_is_carried_across_cycles() {
        let (sched, _rx) = scheduler(16, QueueingStrategy::BestEffortFifo).await;
        let mut first = workload("first", 0, 8);
        first.pod_sets[0].topology_request = TopologyRequest::Required("rack".into());
        sched.submit(first).await.unwrap();
        sched.run_cycle().await.unwrap();

        let mut second = workload("second", 0, 8);
        second.pod_sets[0].topology_request = TopologyRequest::Required("rack".into());
        sched.submit(second).await.unwrap();
        sched.run_cycle().await.unwrap();

        let rack_of = |w: Workload| {
            w.status.admission.unwrap().pod_set_assignments[0]
                .topology_assignment
                .clone()
                .unwrap()
                .domains[0]
                .values[0]
                .clone()
        };
        let a = rack_of(sched.workload(&key("first")).await.unwrap());
        let b = rack_of(sched.workload(&key("second")).await.unwrap());
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn run_loop_stops_on_shutdown() {
        let (adapter, _rx) = ChannelAdapter::new();
        let sched = Arc::new(
            AdmissionScheduler::new(
                definition(4, QueueingStrategy::BestEffortFifo),
                Arc::new(QuotaLedger::new()),
                Arc::new(SnapshotStore::new()),
                Arc::new(adapter),
                SchedulerConfig {
                    cycle_interval: Duration::from_millis(10),
                    ..SchedulerConfig::default()
                },
            )
            .await
            .unwrap(),
        );
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn({
            let sched = sched.clone();
            async move { sched.run(rx).await }
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn cancel_during_evaluation_releases_the_reservation() {
        let (sched, mut rx) = scheduler(4, QueueingStrategy::BestEffortFifo).await;
        let sched = Arc::new(sched);
        sched.submit(workload("a", 0, 4)).await.unwrap();

        let (guard, cycle) = cycle_held_at_commit(&sched, &key("a")).await;
        assert_eq!(available_cpu(&sched).await, Quantity::ZERO);
        sched.cancel(&key("a")).await.unwrap();
        drop(guard);

        let report = cycle.await.unwrap().unwrap();
        assert!(report.admitted.is_empty());
        assert!(report.pending.is_empty());
        assert_eq!(report.requeued, 0);
        assert!(sched.workload(&key("a")).await.is_none());
        assert_eq!(available_cpu(&sched).await, Quantity::units(4));
        assert_eq!(sched.pending_count().await, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn resubmission_during_evaluation_is_not_admitted_by_the_old_one() {
        let (sched, _rx) = scheduler(4, QueueingStrategy::BestEffortFifo).await;
        let sched = Arc::new(sched);
        sched.submit(workload("a", 0, 4)).await.unwrap();

        let (guard, cycle) = cycle_held_at_commit(&sched, &key("a")).await;
        sched.cancel(&key("a")).await.unwrap();
        sched.submit(workload("a", 0, 4)).await.unwrap();
        drop(guard);

        let report = cycle.await.unwrap().unwrap();
        assert!(report.admitted.is_empty());
        assert_requeued_clean(&sched.workload(&key("a")).await.unwrap());
        assert_eq!(available_cpu(&sched).await, Quantity::units(4));

        let report = sched.run_cycle().await.unwrap();
        assert_eq!(report.admitted, vec![key("a")]);
        assert_eq!(available_cpu(&sched).await, Quantity::ZERO);
    }

    #[tokio::test]
    async fn inventory_change_before_commit_requeues_the_rest_of_the_cycle() {
        let (sched, _rx) = scheduler(8, QueueingStrategy::BestEffortFifo).await;
        let sched = Arc::new(sched);
        sched.submit(workload("a", 10, 4)).await.unwrap();
        sched.submit(workload("b", 0, 4)).await.unwrap();

        let (guard, cycle) = cycle_held_at_commit(&sched, &key("a")).await;
        sched.upsert_node(node("h3", "r3", 8)).await;
        drop(guard);

        let report = cycle.await.unwrap().unwrap();
        assert!(report.admitted.is_empty());
        assert!(report.pending.is_empty());
        assert_eq!(report.requeued, 2);
        for name in ["a", "b"] {
            assert_requeued_clean(&sched.workload(&key(name)).await.unwrap());
        }
        assert_eq!(available_cpu(&sched).await, Quantity::units(8));
        assert_eq!(sched.pending_count().await, 2);

        let report = sched.run_cycle().await.unwrap();
        assert_eq!(report.admitted, vec![key("a"), key("b")]);
        assert_eq!(report.snapshot_generation, sched.snapshot().await.generation);
    }

    #[tokio::test]
    async fn removed_node_invalidates_the_snapshot() {
        let (sched, _rx) = scheduler(8, QueueingStrategy::BestEffortFifo).await;
        let before = sched.run_cycle().await.unwrap().snapshot_generation;
        assert!(sched.remove_node("h2").await);
        assert!(!sched.remove_node("h2").await);

        let after = sched.run_cycle().await.unwrap().snapshot_generation;
        assert!(after > before);
        let snapshot = sched.snapshot().await;
        assert_eq!(snapshot.generation, after);
        assert_eq!(snapshot.for_flavor("default").unwrap().domains_at(1).len(), 1);
    }

    #[tokio::test]
    async fn commit_conflict_is_retried_within_the_cycle() {
        let (sched, _rx) = scheduler(4, QueueingStrategy::BestEffortFifo).await;
        let sched = Arc::new(sched);
        sched.submit(workload("a", 0, 4)).await.unwrap();

        let (guard, cycle) = cycle_held_at_commit(&sched, &key("a")).await;
        // First reservation of a fresh ledger.
        let first = ReservationToken {
            id: 1,
            queue: "cq".into(),
        };
        assert!(sched.ledger().release(&first).await);
        drop(guard);

        let report = cycle.await.unwrap().unwrap();
        assert_eq!(report.admitted, vec![key("a")]);
        assert_eq!(available_cpu(&sched).await, Quantity::ZERO);
    }

    #[tokio::test]
    async fn exhausted_commit_attempts_requeue_without_a_reason() {
        let config = SchedulerConfig {
            max_commit_attempts: 1,
            ..SchedulerConfig::default()
        };
        let (sched, _rx) = scheduler_with(4, QueueingStrategy::BestEffortFifo, config).await;
        let sched = Arc::new(sched);
        sched.submit(workload("a", 0, 4)).await.unwrap();

        let (guard, cycle) = cycle_held_at_commit(&sched, &key("a")).await;
        let first = ReservationToken {
            id: 1,
            queue: "cq".into(),
        };
        assert!(sched.ledger().release(&first).await);
        drop(guard);

        let report = cycle.await.unwrap().unwrap();
        assert!(report.admitted.is_empty());
        assert!(report.pending.is_empty());
        assert_eq!(report.requeued, 1);
        assert_requeued_clean(&sched.workload(&key("a")).await.unwrap());
        assert_eq!(available_cpu(&sched).await, Quantity::units(4));

        let report = sched.run_cycle().await.unwrap();
        assert_eq!(report.admitted, vec![key("a")]);
    }
}
