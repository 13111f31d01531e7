//! Structural validation of definitions and submissions.

use std::collections::HashSet;

use crate::error::{ValidationError, ValidationResult};
use crate::types::{ClusterQueue, ResourceFlavor, Topology, Workload};

/// Check a workload before it enters the pending queue.
pub fn validate_workload(workload: &Workload) -> ValidationResult<()> {
    let key = workload.key().to_string();
    if workload.name.is_empty() {
        return Err(ValidationError::Field {
            field: "workload.name".into(),
            reason: "must not be empty".into(),
        });
    }
    if workload.pod_sets.is_empty() {
        return Err(ValidationError::NoPodSets(key));
    }

    let mut seen = HashSet::new();
    for ps in &workload.pod_sets {
        if !seen.insert(ps.name.as_str()) {
            return Err(ValidationError::DuplicatePodSet {
                workload: key,
                pod_set: ps.name.clone(),
            });
        }
        if ps.count == 0 {
            return Err(ValidationError::ZeroReplicas {
                workload: key,
                pod_set: ps.name.clone(),
            });
        }
        if ps.requests.is_empty() || ps.requests.is_zero() {
            return Err(ValidationError::EmptyRequest {
                workload: key,
                pod_set: ps.name.clone(),
            });
        }
    }
    Ok(())
}

pub fn validate_topology(topology: &Topology) -> ValidationResult<()> {
    if topology.levels.is_empty() {
        return Err(ValidationError::EmptyTopology(topology.name.clone()));
    }
    let mut seen = HashSet::new();
    for level in &topology.levels {
        if !seen.insert(level.as_str()) {
            return Err(ValidationError::DuplicateLevel {
                topology: topology.name.clone(),
                level: level.clone(),
            });
        }
    }
    Ok(())
}

pub fn validate_flavor(flavor: &ResourceFlavor) -> ValidationResult<()> {
    if flavor.name.is_empty() {
        return Err(ValidationError::Field {
            field: "flavor.name".into(),
            reason: "must not be empty".into(),
        });
    }
    Ok(())
}

pub fn validate_cluster_queue(queue: &ClusterQueue) -> ValidationResult<()> {
    let mut seen = HashSet::new();
    for fq in &queue.flavors {
        if !seen.insert(fq.flavor.as_str()) {
            return Err(ValidationError::DuplicateFlavor {
                queue: queue.name.clone(),
                flavor: fq.flavor.clone(),
            });
        }
        for (resource, quota) in &fq.resources {
            if quota.lending_limit.is_some_and(|l| l > quota.nominal) {
                return Err(ValidationError::LendingAboveNominal {
                    queue: queue.name.clone(),
                    flavor: fq.flavor.clone(),
                    resource: resource.clone(),
                });
            }
        }
    }
    Ok(())
}
