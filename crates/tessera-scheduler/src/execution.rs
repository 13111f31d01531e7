//! Execution adapter — the boundary to the workload execution controller.
//!
//! Once a workload is admitted the scheduler publishes a [`StartDirective`]:
//! unsuspend the job and constrain each pod set with a node selector. The
//! controller reports completion back through the scheduler's `finish` and
//! `fail` operations.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info};

use tessera_placement::Placement;
use tessera_state::{Labels, ResourceFlavor, TopologyAssignment, WorkloadKey};

use crate::error::{SchedulerError, SchedulerResult};

/// Start instruction for one pod set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodSetStart {
    pub name: String,
    pub count: u32,
    pub flavor: String,
    pub node_selector: Labels,
    pub topology_assignment: Option<TopologyAssignment>,
}

/// Unsuspend an admitted workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartDirective {
    pub workload: WorkloadKey,
    pub cluster_queue: String,
    pub pod_sets: Vec<PodSetStart>,
}

/// What travels over a [`ChannelAdapter`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ExecutionCommand {
    Start(StartDirective),
    Stop { workload: WorkloadKey, reason: String },
}

/// Receiver of admission decisions.
pub trait ExecutionAdapter: Send + Sync {
    fn start(&self, directive: &StartDirective) -> SchedulerResult<()>;

    /// Suspend a workload that lost its admission (eviction, cancellation).
    fn stop(&self, workload: &WorkloadKey, reason: &str) -> SchedulerResult<()>;
}

/// Forwards commands over an unbounded tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelAdapter {
    tx: mpsc::UnboundedSender<ExecutionCommand>,
}

impl ChannelAdapter {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ExecutionCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, command: ExecutionCommand) -> SchedulerResult<()> {
        self.tx
            .send(command)
            .map_err(|_| SchedulerError::Execution("command channel closed".into()))
    }
}

impl ExecutionAdapter for ChannelAdapter {
    fn start(&self, directive: &StartDirective) -> SchedulerResult<()> {
        info!(
            workload = %directive.workload,
            pod_sets = directive.pod_sets.len(),
            "start directive published"
        );
        self.send(ExecutionCommand::Start(directive.clone()))
    }

    fn stop(&self, workload: &WorkloadKey, reason: &str) -> SchedulerResult<()> {
        info!(%workload, %reason, "stop directive published");
        self.send(ExecutionCommand::Stop {
            workload: workload.clone(),
            reason: reason.to_string(),
        })
    }
}

/// Node selector for a pod set: the flavor's node labels, plus the
/// finest-level label when every replica landed in one finest-level domain.
/// Replicas spread over several domains cannot be expressed by one
/// selector, so only the flavor labels are used then.
pub fn node_selector(flavor: &ResourceFlavor, placement: Option<&Placement>) -> Labels {
    let mut selector = flavor.node_labels.clone();
    if let Some(p) = placement
        && let Some(leaf) = p.single_leaf()
        && let (Some(key), Some(value)) = (p.assignment.levels.last(), leaf.values.last())
    {
        selector.insert(key.clone(), value.clone());
    }
    debug!(flavor = %flavor.name, labels = selector.len(), "node selector built");
    selector
}
