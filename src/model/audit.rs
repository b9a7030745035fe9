//! Append-only audit records and the digest cache entry shape.
//!
//! `AuditRecord` rows are never updated or deleted except by the age-based
//! retention sweep (spec Invariant 5); see `persistence::gateway::purge_audit_older_than`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Ok,
    Error,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    /// User id, or the literal string `"system"` for engine-originated rows.
    pub actor: String,
    pub subject: String,
    pub action: String,
    pub outcome: AuditOutcome,
    pub details: serde_json::Value,
}

impl AuditRecord {
    pub fn system(subject: impl Into<String>, action: impl Into<String>, outcome: AuditOutcome) -> Self {
        Self {
            id: 0,
            timestamp: Utc::now(),
            actor: "system".to_string(),
            subject: subject.into(),
            action: action.into(),
            outcome,
            details: serde_json::Value::Null,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

/// `(registry, repository, tag) -> {digest, size, fetched_at}`, TTL-based.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DigestCacheEntry {
    pub registry: String,
    pub repository: String,
    pub tag: String,
    pub digest: String,
    pub size_bytes: u64,
    pub published_at: Option<DateTime<Utc>>,
    pub fetched_at: DateTime<Utc>,
    /// Negative-cache rows (permanent-failure results) carry a short TTL and
    /// this flag, so `AuthFailed`/`ImageNotFound` results aren't sticky.
    pub is_negative: bool,
}

impl DigestCacheEntry {
    pub fn is_fresh(&self, ttl_sec: i64, now: DateTime<Utc>) -> bool {
        (now - self.fetched_at).num_seconds() < ttl_sec
    }
}
