//! Persistence Gateway (C7): the single trait every other component goes
//! through to read or write durable state. The only concrete implementation
//! is `sqlite::SqliteGateway`; tests use an in-memory SQLite database behind
//! the same trait rather than a hand-rolled fake, so gateway tests exercise
//! real SQL.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::model::{
    AuditRecord, AvailableUpdate, BulkUpdate, ManagedContainer, UpdateJob, UpdatePolicy,
    UpdateStepRecord,
};

/// Pagination cursor shared by every list operation.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub limit: u32,
    pub offset: u32,
}

#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub container_id: Option<i64>,
    pub non_terminal_only: bool,
    pub parent_bulk_id: Option<Uuid>,
}

#[derive(Debug, Clone, Default)]
pub struct AvailableUpdateFilter {
    pub container_id: Option<i64>,
    pub active_only: bool,
}

/// Transactional CRUD plus the two lease-based coordination primitives from
/// spec §4.7. All reads consumed by the executor's state machine must be
/// snapshot-consistent with respect to concurrent writers.
#[async_trait]
pub trait Gateway: Send + Sync {
    // -- ManagedContainer --

    async fn insert_container(&self, container: &ManagedContainer) -> Result<i64>;
    async fn get_container(&self, id: i64) -> Result<Option<ManagedContainer>>;
    async fn get_container_by_name(&self, name: &str) -> Result<Option<ManagedContainer>>;
    async fn list_containers(&self) -> Result<Vec<ManagedContainer>>;
    async fn update_container(&self, container: &ManagedContainer) -> Result<()>;
    async fn update_policy(&self, container_id: i64, policy: &UpdatePolicy) -> Result<()>;
    async fn delete_container(&self, id: i64) -> Result<()>;

    // -- AvailableUpdate --

    /// Upserts the active `AvailableUpdate` row for a container, marking any
    /// prior active row for the same container `stale` in the same
    /// transaction.
    async fn upsert_available_update(&self, update: &AvailableUpdate) -> Result<()>;
    async fn clear_available_update(&self, container_id: i64) -> Result<()>;
    async fn list_available_updates(
        &self,
        filter: AvailableUpdateFilter,
        page: Page,
    ) -> Result<Vec<AvailableUpdate>>;

    // -- UpdateJob --

    async fn insert_job(&self, job: &UpdateJob) -> Result<()>;
    async fn get_job(&self, id: Uuid) -> Result<Option<UpdateJob>>;
    async fn update_job(&self, job: &UpdateJob) -> Result<()>;
    async fn list_jobs(&self, filter: JobFilter, page: Page) -> Result<Vec<UpdateJob>>;
    /// The non-terminal job for a container, if any — used to enforce the
    /// one-active-job-per-container invariant at admission time.
    async fn active_job_for_container(&self, container_id: i64) -> Result<Option<UpdateJob>>;

    /// Atomically selects the oldest `queued` job not already leased by a
    /// live engine instance, and marks it leased to `engine_id` until
    /// `lease_deadline`.
    async fn claim_next_update_job(
        &self,
        engine_id: &str,
        lease_deadline: DateTime<Utc>,
    ) -> Result<Option<UpdateJob>>;

    /// Jobs whose lease expired before `now` — candidates for re-drive after
    /// a crash or a dead peer instance.
    async fn recover_orphan_jobs(&self, now: DateTime<Utc>) -> Result<Vec<UpdateJob>>;

    // -- UpdateStepRecord --

    async fn append_step(&self, step: &UpdateStepRecord) -> Result<()>;
    async fn update_step(&self, step: &UpdateStepRecord) -> Result<()>;
    async fn list_steps(&self, job_id: Uuid) -> Result<Vec<UpdateStepRecord>>;

    // -- BulkUpdate --

    async fn insert_bulk(&self, bulk: &BulkUpdate) -> Result<()>;
    async fn get_bulk(&self, id: Uuid) -> Result<Option<BulkUpdate>>;
    async fn update_bulk(&self, bulk: &BulkUpdate) -> Result<()>;

    // -- AuditRecord --

    async fn insert_audit(&self, record: &AuditRecord) -> Result<()>;
    async fn list_audit(&self, subject: Option<&str>, page: Page) -> Result<Vec<AuditRecord>>;
    /// Age-based retention sweep (spec Invariant 5); returns rows deleted.
    async fn purge_audit_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}
