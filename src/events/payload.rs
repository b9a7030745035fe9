//! Event payloads published on the bus (spec §6 "Event payloads on the bus").

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorKind;
use crate::model::{JobState, RiskLevel};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    UpdateAvailable {
        container_id: i64,
        from_digest: String,
        to_digest: String,
        risk_level: RiskLevel,
        security_flag: bool,
    },
    JobState {
        job_id: Uuid,
        container_id: i64,
        state: JobState,
        attempt: u32,
    },
    JobStep {
        job_id: Uuid,
        step_name: String,
        sequence: u32,
        outcome: Option<String>,
    },
    JobPullProgress {
        job_id: Uuid,
        bytes_done: u64,
        bytes_total: u64,
    },
    JobTerminal {
        job_id: Uuid,
        state: JobState,
        error_kind: Option<ErrorKind>,
        error_message: Option<String>,
    },
    ContainerStatus {
        container_id: i64,
        old_status: String,
        new_status: String,
    },
    SubscriberEvicted {
        subscription_id: Uuid,
        reason: String,
    },
}

impl EventPayload {
    /// The topic this event is published under: `"container.{id}"` for
    /// container/job events scoped to one container, or a fixed name for
    /// bus-wide events. Subscribers filter by topic prefix.
    pub fn topic(&self) -> String {
        match self {
            EventPayload::UpdateAvailable { container_id, .. }
            | EventPayload::ContainerStatus { container_id, .. } => {
                format!("container.{}", container_id)
            }
            EventPayload::JobState { container_id, .. } => format!("container.{}", container_id),
            EventPayload::JobStep { job_id, .. }
            | EventPayload::JobPullProgress { job_id, .. }
            | EventPayload::JobTerminal { job_id, .. } => format!("job.{}", job_id),
            EventPayload::SubscriberEvicted { .. } => "subscriber".to_string(),
        }
    }
}

/// The envelope every subscriber receives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_type: &'static str,
    pub timestamp: DateTime<Utc>,
    pub topic: String,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(payload: EventPayload) -> Self {
        let event_type = match &payload {
            EventPayload::UpdateAvailable { .. } => "update.available",
            EventPayload::JobState { .. } => "job.state",
            EventPayload::JobStep { .. } => "job.step",
            EventPayload::JobPullProgress { .. } => "job.pull_progress",
            EventPayload::JobTerminal { .. } => "job.terminal",
            EventPayload::ContainerStatus { .. } => "container.status",
            EventPayload::SubscriberEvicted { .. } => "subscriber.evicted",
        };
        Self {
            event_type,
            timestamp: Utc::now(),
            topic: payload.topic(),
            payload,
        }
    }
}
