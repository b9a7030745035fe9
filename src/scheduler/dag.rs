//! Dependency DAG batching for bulk orchestration (spec §4.5 "Bulk
//! orchestration"). Edges come from `UpdatePolicy::dependencies`, restricted
//! to the bulk's own targets; anything outside the target set is ignored.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::error::{EngineError, ErrorKind, Result};

/// One node in the graph: a container id plus the *names* it depends on.
/// Names are resolved to ids by the caller before batching, since
/// `UpdatePolicy::dependencies` stores names.
pub struct Node {
    pub container_id: i64,
    pub depends_on: Vec<i64>,
}

/// Splits `nodes` into ordered batches by Kahn's algorithm: every id in
/// batch `k` depends only on ids in batches `0..k`. Returns
/// `DependencyCycle` if the restricted graph isn't a DAG.
pub fn topological_batches(nodes: &[Node]) -> Result<Vec<Vec<i64>>> {
    let targets: HashSet<i64> = nodes.iter().map(|n| n.container_id).collect();
    let mut indegree: HashMap<i64, usize> = HashMap::new();
    let mut dependents: HashMap<i64, Vec<i64>> = HashMap::new();

    for node in nodes {
        indegree.entry(node.container_id).or_insert(0);
        for &dep in &node.depends_on {
            if !targets.contains(&dep) {
                // Dependency outside this bulk's target set: not our concern
                // to order against, so it doesn't add an edge.
                continue;
            }
            *indegree.entry(node.container_id).or_insert(0) += 1;
            dependents.entry(dep).or_default().push(node.container_id);
        }
    }

    let mut ready: VecDeque<i64> = indegree
        .iter()
        .filter(|(_, &deg)| deg == 0)
        .map(|(&id, _)| id)
        .collect();
    // Stable ordering within a batch, for deterministic tests.
    let mut ready_vec: Vec<i64> = ready.drain(..).collect();
    ready_vec.sort_unstable();
    ready.extend(ready_vec);

    let mut batches = Vec::new();
    let mut remaining = indegree.len();

    while !ready.is_empty() {
        let mut batch: Vec<i64> = ready.drain(..).collect();
        batch.sort_unstable();
        remaining -= batch.len();

        let mut next_ready = Vec::new();
        for &id in &batch {
            if let Some(children) = dependents.get(&id) {
                for &child in children {
                    let deg = indegree.get_mut(&child).unwrap();
                    *deg -= 1;
                    if *deg == 0 {
                        next_ready.push(child);
                    }
                }
            }
        }
        next_ready.sort_unstable();
        ready.extend(next_ready);
        batches.push(batch);
    }

    if remaining != 0 {
        return Err(EngineError::new(
            ErrorKind::DependencyCycle,
            "bulk target dependency graph has a cycle",
        ));
    }

    Ok(batches)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_chain_batches_one_at_a_time() {
        let nodes = vec![
            Node { container_id: 1, depends_on: vec![] },
            Node { container_id: 2, depends_on: vec![1] },
            Node { container_id: 3, depends_on: vec![2] },
        ];
        let batches = topological_batches(&nodes).unwrap();
        assert_eq!(batches, vec![vec![1], vec![2], vec![3]]);
    }

    #[test]
    fn independent_nodes_share_a_batch() {
        let nodes = vec![
            Node { container_id: 1, depends_on: vec![] },
            Node { container_id: 2, depends_on: vec![] },
        ];
        let batches = topological_batches(&nodes).unwrap();
        assert_eq!(batches, vec![vec![1, 2]]);
    }

    #[test]
    fn cycle_is_rejected() {
        let nodes = vec![
            Node { container_id: 1, depends_on: vec![2] },
            Node { container_id: 2, depends_on: vec![1] },
        ];
        let err = topological_batches(&nodes).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DependencyCycle);
    }

    #[test]
    fn dependency_outside_target_set_is_ignored() {
        let nodes = vec![Node { container_id: 1, depends_on: vec![99] }];
        let batches = topological_batches(&nodes).unwrap();
        assert_eq!(batches, vec![vec![1]]);
    }
}
