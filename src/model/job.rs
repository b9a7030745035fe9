//! `AvailableUpdate`, `UpdateJob`, and `UpdateStepRecord`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorKind;
use crate::model::container::UpdateStrategy;

/// Risk classification derived by the watcher, carried as metadata only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

/// A divergence between a container's in-use digest and the registry's
/// current digest for its configured tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvailableUpdate {
    pub container_id: i64,
    pub from_digest: String,
    pub to_digest: String,
    pub to_size_bytes: u64,
    pub published_at: Option<DateTime<Utc>>,
    pub observed_at: DateTime<Utc>,
    pub risk_level: RiskLevel,
    pub security_flag: bool,
    /// `false` once superseded by a newer observation for the same container.
    pub active: bool,
}

/// Who/what caused an `UpdateJob` to be created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Auto,
    Cron,
    Manual,
    Bulk,
}

/// States of the executor state machine, spec §4.4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Preflight,
    Pulling,
    Stopping,
    Creating,
    Starting,
    HealthCheck,
    Committing,
    Succeeded,
    Degraded,
    RollingBack,
    RolledBack,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::RolledBack | JobState::Failed | JobState::Cancelled
        )
    }

    /// Whether cancellation may be honored immediately in this state
    /// (before `Committing`, per spec §4.4 point 9).
    pub fn is_cancel_safe_point(self) -> bool {
        matches!(
            self,
            JobState::Queued
                | JobState::Preflight
                | JobState::Pulling
                | JobState::Stopping
                | JobState::Creating
                | JobState::Starting
                | JobState::HealthCheck
        )
    }
}

/// One attempt to update one container from one digest to another.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateJob {
    pub id: Uuid,
    pub container_id: i64,
    pub from_digest: String,
    pub to_digest: String,
    pub strategy: UpdateStrategy,
    pub state: JobState,
    pub attempt: u32,
    pub max_retries: u32,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub triggered_by: TriggerSource,
    pub parent_bulk_id: Option<Uuid>,
    pub cancel_requested: bool,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    /// Engine instance id + deadline, for multi-instance coordination (§5).
    pub lease_owner: Option<String>,
    pub lease_deadline: Option<DateTime<Utc>>,
}

impl UpdateJob {
    pub fn new(
        container_id: i64,
        from_digest: String,
        to_digest: String,
        strategy: UpdateStrategy,
        max_retries: u32,
        triggered_by: TriggerSource,
        parent_bulk_id: Option<Uuid>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            container_id,
            from_digest,
            to_digest,
            strategy,
            state: JobState::Queued,
            attempt: 1,
            max_retries,
            scheduled_at: Utc::now(),
            started_at: None,
            finished_at: None,
            triggered_by,
            parent_bulk_id,
            cancel_requested: false,
            error_kind: None,
            error_message: None,
            lease_owner: None,
            lease_deadline: None,
        }
    }

    pub fn can_retry(&self) -> bool {
        self.attempt < self.max_retries
    }
}

/// Outcome of a single executor step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Ok,
    Failed,
    Skipped,
}

/// Append-only per-job step history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateStepRecord {
    pub job_id: Uuid,
    pub sequence: u32,
    pub name: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: Option<StepOutcome>,
    pub detail: serde_json::Value,
    pub log_tail: Vec<String>,
}
