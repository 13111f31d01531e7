//! Level search and descent.
//!
//! 1. Start at the requested level (`Required`/`Preferred`) or at the
//!    coarsest level (`None`).
//! 2. Rank that level's domains by fit and take the first one if it hosts
//!    every replica.
//! 3. Otherwise `Required` fails, while `Preferred` and `None` move one level
//!    coarser. At the coarsest level the replicas may spread over several
//!    domains, taking as few as possible.
//! 4. Walk down to the finest level, filling the best-fitting children of
//!    the chosen domains first.

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use tessera_state::{TopologyAssignment, TopologyDomainAssignment, TopologyRequest};
use tessera_topology::{TopologySnapshot, TopologyUsage};

use crate::convert::PlacementRequest;
use crate::error::{PlacementError, PlacementResult};
use crate::fit::DomainFits;

/// A placed pod set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement {
    pub assignment: TopologyAssignment,
    /// Level key at which a domain (or, at the coarsest level, a set of
    /// domains) was found to host every replica.
    pub fit_level: String,
}

impl Placement {
    /// True when every replica landed in one finest-level domain.
    pub fn single_leaf(&self) -> Option<&TopologyDomainAssignment> {
        match self.assignment.domains.as_slice() {
            [only] => Some(only),
            _ => None,
        }
    }
}

/// Place one pod set on `snapshot`.
pub fn place(
    snapshot: &TopologySnapshot,
    request: &PlacementRequest,
    assumed: &TopologyUsage,
) -> PlacementResult<Placement> {
    let levels = snapshot.levels();
    if levels.is_empty() {
        return Err(PlacementError::NoTopology(snapshot.flavor().to_string()));
    }

    let (start, relax) = match &request.topology_request {
        TopologyRequest::Required(level) => (level_index(snapshot, request, level)?, false),
        TopologyRequest::Preferred(level) => (level_index(snapshot, request, level)?, true),
        TopologyRequest::None => (0, true),
    };

    let fits = DomainFits::compute(snapshot, &request.per_replica, assumed);
    let count = request.count;

    let mut level = start;
    let chosen: Vec<usize> = loop {
        let mut ranked: Vec<usize> = (0..snapshot.domains_at(level).len()).collect();
        fits.rank(snapshot, level, &mut ranked);
        let best_fit = ranked.first().map(|&i| fits.at(level, i)).unwrap_or(0);
        trace!(
            pod_set = %request.pod_set,
            level = %levels[level],
            best_fit,
            count,
            "evaluating level"
        );

        if best_fit >= count {
            break ranked.into_iter().take(1).collect();
        }
        if !relax {
            return Err(PlacementError::Infeasible {
                pod_set: request.pod_set.clone(),
                level: levels[level].clone(),
                requested: count,
                best_fit,
            });
        }
        if level == 0 {
            if fits.level_total(0) < count {
                return Err(PlacementError::Infeasible {
                    pod_set: request.pod_set.clone(),
                    level: levels[0].clone(),
                    requested: count,
                    best_fit: fits.level_total(0),
                });
            }
            break fewest_domains(&fits, &ranked, count);
        }
        debug!(
            pod_set = %request.pod_set,
            from = %levels[level],
            to = %levels[level - 1],
            "relaxing topology level"
        );
        level -= 1;
    };

    let fit_level = level;
    let leaves = descend(snapshot, &fits, fit_level, chosen, count);

    let leaf_domains = snapshot.domains_at(snapshot.leaf_level());
    let mut domains: Vec<TopologyDomainAssignment> = leaves
        .into_iter()
        .map(|(idx, n)| TopologyDomainAssignment {
            values: leaf_domains[idx].path.clone(),
            count: n,
        })
        .collect();
    domains.sort_by(|a, b| a.values.cmp(&b.values));

    debug!(
        pod_set = %request.pod_set,
        flavor = %snapshot.flavor(),
        fit_level = %levels[fit_level],
        domains = domains.len(),
        count,
        "pod set placed"
    );

    Ok(Placement {
        assignment: TopologyAssignment {
            levels: levels.to_vec(),
            domains,
        },
        fit_level: levels[fit_level].clone(),
    })
}

fn level_index(
    snapshot: &TopologySnapshot,
    request: &PlacementRequest,
    level: &str,
) -> PlacementResult<usize> {
    snapshot
        .level_index(level)
        .ok_or_else(|| PlacementError::UnknownLevel {
            pod_set: request.pod_set.clone(),
            level: level.to_string(),
            topology: snapshot.topology().to_string(),
        })
}

/// Greedy prefix of `ranked` (already ordered by fit) whose fits cover `count`.
fn fewest_domains(fits: &DomainFits, ranked: &[usize], count: u32) -> Vec<usize> {
    let mut covered = 0u32;
    let mut chosen = Vec::new();
    for &idx in ranked {
        if covered >= count {
            break;
        }
        let fit = fits.at(0, idx);
        if fit == 0 {
            break;
        }
        covered = covered.saturating_add(fit);
        chosen.push(idx);
    }
    chosen
}

/// Walk from `level` down to the finest level, returning finest-level
/// domain indices with replica counts summing to `count`.
fn descend(
    snapshot: &TopologySnapshot,
    fits: &DomainFits,
    level: usize,
    chosen: Vec<usize>,
    count: u32,
) -> Vec<(usize, u32)> {
    let mut current = chosen;
    for lower in level + 1..=snapshot.leaf_level() {
        let mut children: Vec<usize> = current
            .iter()
            .flat_map(|&p| snapshot.domains_at(lower - 1)[p].children.iter().copied())
            .collect();
        fits.rank(snapshot, lower, &mut children);

        let mut covered = 0u32;
        current = children
            .into_iter()
            .take_while(|&c| {
                let take = covered < count && fits.at(lower, c) > 0;
                if take {
                    covered = covered.saturating_add(fits.at(lower, c));
                }
                take
            })
            .collect();
    }

    let leaf = snapshot.leaf_level();
    let mut remaining = count;
    let mut ranked = current;
    fits.rank(snapshot, leaf, &mut ranked);
    let mut out = Vec::with_capacity(ranked.len());
    for idx in ranked {
        if remaining == 0 {
            break;
        }
        let n = fits.at(leaf, idx).min(remaining);
        if n == 0 {
            continue;
        }
        out.push((idx, n));
        remaining -= n;
    }
    out
}
