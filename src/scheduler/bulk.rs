//! Bulk orchestration helpers (spec §4.5 "Bulk orchestration"): DAG
//! restriction to targets and strategy-specific batch shaping. The actual
//! driving loop lives in `scheduler::Scheduler::run_bulk`, which calls these
//! pure functions and owns all persistence/executor side effects.

use std::collections::HashMap;

use crate::model::{BulkStrategy, ManagedContainer};
use crate::scheduler::dag::Node;

/// Builds DAG nodes for a bulk's targets, resolving each container's
/// `dependencies` (a list of container *names*) to ids, dropping any name
/// that isn't itself a target of this bulk.
pub fn build_nodes(containers: &[ManagedContainer]) -> Vec<Node> {
    let name_to_id: HashMap<&str, i64> = containers.iter().map(|c| (c.name.as_str(), c.id)).collect();
    containers
        .iter()
        .map(|c| Node {
            container_id: c.id,
            depends_on: c
                .update_policy
                .dependencies
                .iter()
                .filter_map(|name| name_to_id.get(name.as_str()).copied())
                .collect(),
        })
        .collect()
}

/// Reshapes DAG-ordered batches per strategy:
/// - `sequential`: every id runs alone, preserving DAG order.
/// - `parallel`: DAG batches are left as-is; `Scheduler::run_bulk` bounds
///   concurrency within each batch to `max_concurrency` via
///   `buffer_unordered`.
/// - `rolling`: each DAG batch is further split into sub-batches of size
///   `ceil(batch_len / max_concurrency)`, run one sub-batch at a time.
pub fn shape_batches(strategy: BulkStrategy, dag_batches: Vec<Vec<i64>>, max_concurrency: usize) -> Vec<Vec<i64>> {
    let k = max_concurrency.max(1);
    match strategy {
        BulkStrategy::Sequential => dag_batches.into_iter().flatten().map(|id| vec![id]).collect(),
        BulkStrategy::Parallel => dag_batches,
        BulkStrategy::Rolling => dag_batches
            .into_iter()
            .flat_map(|batch| rolling_chunks(&batch, k))
            .collect(),
    }
}

fn rolling_chunks(batch: &[i64], k: usize) -> Vec<Vec<i64>> {
    if batch.is_empty() {
        return Vec::new();
    }
    let chunk_len = (batch.len() + k - 1) / k; // ceil(N/k)
    batch.chunks(chunk_len.max(1)).map(|c| c.to_vec()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_flattens_to_singletons() {
        let batches = vec![vec![1, 2], vec![3]];
        let shaped = shape_batches(BulkStrategy::Sequential, batches, 3);
        assert_eq!(shaped, vec![vec![1], vec![2], vec![3]]);
    }

    #[test]
    fn parallel_leaves_dag_batches_untouched() {
        let batches = vec![vec![1, 2], vec![3]];
        let shaped = shape_batches(BulkStrategy::Parallel, batches.clone(), 2);
        assert_eq!(shaped, batches);
    }

    #[test]
    fn rolling_splits_into_ceil_chunks() {
        let batches = vec![vec![1, 2, 3, 4, 5]];
        let shaped = shape_batches(BulkStrategy::Rolling, batches, 2);
        assert_eq!(shaped, vec![vec![1, 2, 3], vec![4, 5]]);
    }
}
