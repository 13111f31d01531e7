//! Daemon configuration.
//!
//! One TOML file carries the scheduler settings, the cluster definition
//! (topologies, flavors, cluster queues, local queues), the node inventory
//! and an optional list of jobs to submit at startup.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};

use tessera_scheduler::SchedulerConfig;
use tessera_state::{
    ClusterDefinition, ClusterQueue, JobSpec, LocalQueue, NodeInfo, ResourceFlavor, Topology,
    Workload, validate_cluster_queue, validate_flavor, validate_topology, validate_workload,
};

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TesseraConfig {
    #[serde(default)]
    pub scheduler: SchedulerSection,
    #[serde(default)]
    pub topologies: Vec<Topology>,
    #[serde(default)]
    pub flavors: Vec<ResourceFlavor>,
    #[serde(default)]
    pub cluster_queues: Vec<ClusterQueue>,
    #[serde(default)]
    pub local_queues: Vec<LocalQueue>,
    #[serde(default)]
    pub nodes: Vec<NodeInfo>,
    /// Jobs submitted when the daemon starts.
    #[serde(default)]
    pub jobs: Vec<JobSpec>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerSection {
    pub max_commit_attempts: Option<u32>,
    /// Delay between admission cycles, e.g. `"1s"` or `"250ms"`.
    pub cycle_interval: Option<String>,
}

impl TesseraConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_toml(&content).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Scheduler settings with unset fields at their defaults.
    pub fn scheduler_config(&self) -> anyhow::Result<SchedulerConfig> {
        let mut config = SchedulerConfig::default();
        if let Some(attempts) = self.scheduler.max_commit_attempts {
            if attempts == 0 {
                bail!("scheduler.max_commit_attempts must be at least 1");
            }
            config.max_commit_attempts = attempts;
        }
        if let Some(interval) = &self.scheduler.cycle_interval {
            config.cycle_interval = parse_duration(interval)
                .context("scheduler.cycle_interval")?;
        }
        Ok(config)
    }

    pub fn definition(&self) -> ClusterDefinition {
        ClusterDefinition {
            topologies: self.topologies.clone(),
            flavors: self.flavors.clone(),
            cluster_queues: self.cluster_queues.clone(),
            local_queues: self.local_queues.clone(),
        }
    }

    /// Check the file for structural errors and dangling references.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.scheduler_config()?;

        unique("topology", self.topologies.iter().map(|t| t.name.as_str()))?;
        for topology in &self.topologies {
            validate_topology(topology)?;
        }

        unique("flavor", self.flavors.iter().map(|f| f.name.as_str()))?;
        for flavor in &self.flavors {
            validate_flavor(flavor)?;
            if let Some(topology) = &flavor.topology_name
                && !self.topologies.iter().any(|t| &t.name == topology)
            {
                bail!("flavor {} references unknown topology {topology}", flavor.name);
            }
        }

        unique("cluster queue", self.cluster_queues.iter().map(|q| q.name.as_str()))?;
        for queue in &self.cluster_queues {
            validate_cluster_queue(queue)?;
            for fq in &queue.flavors {
                if !self.flavors.iter().any(|f| f.name == fq.flavor) {
                    bail!("cluster queue {} references unknown flavor {}", queue.name, fq.flavor);
                }
            }
        }

        let mut local = HashSet::new();
        for lq in &self.local_queues {
            if !local.insert((lq.namespace.as_str(), lq.name.as_str())) {
                bail!("duplicate local queue {}/{}", lq.namespace, lq.name);
            }
            if !self.cluster_queues.iter().any(|q| q.name == lq.cluster_queue) {
                bail!(
                    "local queue {}/{} references unknown cluster queue {}",
                    lq.namespace,
                    lq.name,
                    lq.cluster_queue
                );
            }
        }

        unique("node", self.nodes.iter().map(|n| n.name.as_str()))?;

        let definition = self.definition();
        let mut jobs = HashSet::new();
        for job in &self.jobs {
            if !jobs.insert((job.namespace.as_str(), job.name.as_str())) {
                bail!("duplicate job {}/{}", job.namespace, job.name);
            }
            let workload = Workload::from_job(job)?;
            validate_workload(&workload)?;
            if definition.resolve_local_queue(&job.namespace, &job.queue).is_none() {
                bail!(
                    "job {}/{} targets unknown local queue {}",
                    job.namespace,
                    job.name,
                    job.queue
                );
            }
        }
        Ok(())
    }
}

fn unique<'a>(kind: &str, names: impl Iterator<Item = &'a str>) -> anyhow::Result<()> {
    let mut seen = HashSet::new();
    for name in names {
        if !seen.insert(name) {
            bail!("duplicate {kind} {name}");
        }
    }
    Ok(())
}

/// Parse `"500ms"`, `"5s"`, `"1m"` or `"2h"`. A bare number is seconds.
pub fn parse_duration(input: &str) -> anyhow::Result<Duration> {
    let s = input.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    if digits.is_empty() {
        bail!("invalid duration {input:?}: missing number");
    }
    let n: u64 = digits
        .parse()
        .with_context(|| format!("invalid duration {input:?}"))?;
    let seconds = |factor: u64| {
        n.checked_mul(factor)
            .map(Duration::from_secs)
            .with_context(|| format!("invalid duration {input:?}: too large"))
    };
    let duration = match unit.trim() {
        "ms" => Duration::from_millis(n),
        "" | "s" => Duration::from_secs(n),
        "m" => seconds(60)?,
        "h" => seconds(3600)?,
        other => bail!("invalid duration {input:?}: unknown unit {other:?}"),
    };
    if duration.is_zero() {
        bail!("invalid duration {input:?}: must be positive");
    }
    Ok(duration)
}
