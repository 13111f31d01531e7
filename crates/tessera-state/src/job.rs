//! Conversion from a submitted job to a [`Workload`].
//!
//! Jobs express locality through pod-template annotations. They are read
//! once here and turned into a [`TopologyRequest`]; nothing downstream looks
//! at annotation strings again.

use serde::{Deserialize, Serialize};

use crate::error::{ValidationError, ValidationResult};
use crate::quantity::ResourceList;
use crate::types::{Labels, PodSet, TopologyRequest, Workload, WorkloadStatus};

/// Pod-template annotation pinning all replicas to one domain of a level.
pub const REQUIRED_TOPOLOGY_ANNOTATION: &str = "tessera.dev/podset-required-topology";

/// Pod-template annotation preferring one domain of a level.
pub const PREFERRED_TOPOLOGY_ANNOTATION: &str = "tessera.dev/podset-preferred-topology";

/// Name of the single pod set derived from a job.
const MAIN_POD_SET: &str = "main";

/// A batch job as submitted to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub namespace: String,
    pub name: String,
    /// Local queue name.
    pub queue: String,
    #[serde(default)]
    pub priority: i32,
    /// Pods running at the same time.
    pub parallelism: u32,
    /// Successful pods needed over the job's lifetime.
    #[serde(default)]
    pub completions: Option<u32>,
    /// Per-pod resource requests.
    pub requests: ResourceList,
    #[serde(default)]
    pub pod_annotations: Labels,
}

impl JobSpec {
    /// Concurrently running pods: parallelism, capped by completions.
    pub fn pods_count(&self) -> u32 {
        match self.completions {
            Some(completions) => self.parallelism.min(completions),
            None => self.parallelism,
        }
    }

    /// Read the topology request from the pod-template annotations.
    pub fn topology_request(&self) -> ValidationResult<TopologyRequest> {
        let required = self.pod_annotations.get(REQUIRED_TOPOLOGY_ANNOTATION);
        let preferred = self.pod_annotations.get(PREFERRED_TOPOLOGY_ANNOTATION);
        match (required, preferred) {
            (Some(_), Some(_)) => Err(ValidationError::ConflictingTopologyRequest(format!(
                "{}/{}",
                self.namespace, self.name
            ))),
            (Some(level), None) => Ok(TopologyRequest::Required(level.clone())),
            (None, Some(level)) => Ok(TopologyRequest::Preferred(level.clone())),
            (None, None) => Ok(TopologyRequest::None),
        }
    }
}

impl Workload {
    /// Build the workload for a job: one pod set sized by the job's
    /// concurrently running pods, never by its total completions.
    pub fn from_job(job: &JobSpec) -> ValidationResult<Workload> {
        let topology_request = job.topology_request()?;
        Ok(Workload {
            namespace: job.namespace.clone(),
            name: job.name.clone(),
            queue_name: job.queue.clone(),
            priority: job.priority,
            created_seq: 0,
            pod_sets: vec![PodSet {
                name: MAIN_POD_SET.to_string(),
                count: job.pods_count(),
                requests: job.requests.clone(),
                topology_request,
            }],
            status: WorkloadStatus::default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quantity::Quantity;

    fn job(parallelism: u32, completions: Option<u32>) -> JobSpec {
        JobSpec {
            namespace: "team-a".into(),
            name: "train".into(),
            queue: "main".into(),
            priority: 0,
            parallelism,
            completions,
            requests: ResourceList::new().with("example.com/gpu", Quantity::units(1)),
            pod_annotations: Labels::new(),
        }
    }

    #[test]
    fn pod_count_follows_parallelism_not_completions() {
        let wl = Workload::from_job(&job(2, Some(3))).unwrap();
        assert_eq!(wl.pod_sets.len(), 1);
        assert_eq!(wl.pod_sets[0].count, 2);
    }

    #[test]
    fn completions_below_parallelism_caps_count() {
        assert_eq!(job(4, Some(1)).pods_count(), 1);
        assert_eq!(job(4, None).pods_count(), 4);
    }

    #[test]
    fn reads_required_annotation() {
        let mut j = job(3, Some(3));
        j.pod_annotations
            .insert(REQUIRED_TOPOLOGY_ANNOTATION.into(), "rack".into());
        let wl = Workload::from_job(&j).unwrap();
        assert_eq!(
            wl.pod_sets[0].topology_request,
            TopologyRequest::Required("rack".into())
        );
    }

    #[test]
    fn reads_preferred_annotation() {
        let mut j = job(3, Some(3));
        j.pod_annotations
            .insert(PREFERRED_TOPOLOGY_ANNOTATION.into(), "rack".into());
        assert_eq!(
            j.topology_request().unwrap(),
            TopologyRequest::Preferred("rack".into())
        );
    }

    #[test]
    fn both_annotations_conflict() {
        let mut j = job(3, None);
        j.pod_annotations
            .insert(REQUIRED_TOPOLOGY_ANNOTATION.into(), "rack".into());
        j.pod_annotations
            .insert(PREFERRED_TOPOLOGY_ANNOTATION.into(), "block".into());
        assert!(matches!(
            Workload::from_job(&j),
            Err(ValidationError::ConflictingTopologyRequest(_))
        ));
    }

    #[test]
    fn unannotated_job_is_unconstrained() {
        let wl = Workload::from_job(&job(1, None)).unwrap();
        assert!(!wl.is_topology_constrained());
        assert_eq!(wl.queue_name, "main");
    }
}
