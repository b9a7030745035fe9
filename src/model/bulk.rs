//! `BulkUpdate` — a coordinated group of jobs sharing admission and
//! cancellation semantics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BulkStrategy {
    Sequential,
    Parallel,
    Rolling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BulkState {
    Queued,
    Running,
    Succeeded,
    Failed,
    CompletedWithErrors,
    Cancelled,
}

impl BulkState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BulkState::Succeeded
                | BulkState::Failed
                | BulkState::CompletedWithErrors
                | BulkState::Cancelled
        )
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BulkProgress {
    pub completed: u32,
    pub failed: u32,
    pub pending: u32,
}

/// A request to update many containers together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkUpdate {
    pub id: Uuid,
    pub targets: Vec<i64>,
    pub strategy: BulkStrategy,
    pub max_concurrency: usize,
    pub respect_dependencies: bool,
    pub continue_on_error: bool,
    pub state: BulkState,
    pub progress: BulkProgress,
    pub created_at: DateTime<Utc>,
    pub cancel_requested: bool,
}

impl BulkUpdate {
    pub fn new(
        targets: Vec<i64>,
        strategy: BulkStrategy,
        max_concurrency: usize,
        respect_dependencies: bool,
        continue_on_error: bool,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            progress: BulkProgress {
                pending: targets.len() as u32,
                ..Default::default()
            },
            targets,
            strategy,
            max_concurrency: max_concurrency.max(1),
            respect_dependencies,
            continue_on_error,
            state: BulkState::Queued,
            created_at: Utc::now(),
            cancel_requested: false,
        }
    }
}
