//! SQLite-backed `Gateway` implementation. WAL mode, one connection guarded
//! by a `tokio::sync::Mutex` — adequate for the single-process deployment
//! this engine targets; multi-instance coordination goes through the
//! `lease_owner`/`lease_deadline` columns rather than a second connection.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use crate::error::{EngineError, ErrorKind, Result};
use crate::model::{
    AuditOutcome, AuditRecord, AvailableUpdate, BulkProgress, BulkState, BulkStrategy, BulkUpdate,
    ContainerStatus, DesiredConfig, ImageRef, ManagedContainer, RiskLevel, StepOutcome,
    TriggerSource, UpdateJob, UpdatePolicy, UpdateStepRecord, UpdateStrategy,
};
use crate::persistence::gateway::{AvailableUpdateFilter, Gateway, JobFilter, Page};
use crate::persistence::schema::SCHEMA;

pub struct SqliteGateway {
    conn: Mutex<Connection>,
}

impl SqliteGateway {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| EngineError::with_source(ErrorKind::InternalError, "failed to create database directory", e))?;
        }
        let conn = Connection::open(path).map_err(sqlite_err)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;").map_err(sqlite_err)?;
        conn.execute_batch(SCHEMA).map_err(sqlite_err)?;
        info!("persistence gateway opened at {:?}", path);
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(sqlite_err)?;
        conn.execute_batch(SCHEMA).map_err(sqlite_err)?;
        Ok(Self { conn: Mutex::new(conn) })
    }
}

fn sqlite_err(e: rusqlite::Error) -> EngineError {
    EngineError::with_source(ErrorKind::InternalError, "sqlite error", e)
}

fn parse_dt(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc.timestamp_opt(0, 0).unwrap())
}

fn opt_dt(s: Option<String>) -> Option<DateTime<Utc>> {
    s.map(|s| parse_dt(&s))
}

fn row_to_container(row: &Row) -> rusqlite::Result<ManagedContainer> {
    let desired_config: String = row.get("desired_config")?;
    let update_policy: String = row.get("update_policy")?;
    let status: String = row.get("status")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;

    Ok(ManagedContainer {
        id: row.get("id")?,
        name: row.get("name")?,
        image_ref: ImageRef {
            registry: row.get("registry")?,
            repository: row.get("repository")?,
            tag: row.get("tag")?,
        },
        runtime_id: row.get("runtime_id")?,
        current_digest: row.get("current_digest")?,
        desired_config: serde_json::from_str::<DesiredConfig>(&desired_config)
            .unwrap_or_else(|_| DesiredConfig::default()),
        update_policy: serde_json::from_str::<UpdatePolicy>(&update_policy)
            .unwrap_or_else(|_| UpdatePolicy::default()),
        status: serde_json::from_value(serde_json::Value::String(status))
            .unwrap_or(ContainerStatus::Pending),
        created_at: parse_dt(&created_at),
        updated_at: parse_dt(&updated_at),
    })
}

fn row_to_job(row: &Row) -> rusqlite::Result<UpdateJob> {
    let id: String = row.get("id")?;
    let strategy: String = row.get("strategy")?;
    let state: String = row.get("state")?;
    let triggered_by: String = row.get("triggered_by")?;
    let parent_bulk_id: Option<String> = row.get("parent_bulk_id")?;
    let error_kind: Option<String> = row.get("error_kind")?;
    let scheduled_at: String = row.get("scheduled_at")?;
    let started_at: Option<String> = row.get("started_at")?;
    let finished_at: Option<String> = row.get("finished_at")?;
    let lease_deadline: Option<String> = row.get("lease_deadline")?;

    Ok(UpdateJob {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        container_id: row.get("container_id")?,
        from_digest: row.get("from_digest")?,
        to_digest: row.get("to_digest")?,
        strategy: serde_json::from_value(serde_json::Value::String(strategy)).unwrap_or(UpdateStrategy::Recreate),
        state: serde_json::from_value(serde_json::Value::String(state)).unwrap_or(crate::model::JobState::Queued),
        attempt: row.get("attempt")?,
        max_retries: row.get("max_retries")?,
        scheduled_at: parse_dt(&scheduled_at),
        started_at: opt_dt(started_at),
        finished_at: opt_dt(finished_at),
        triggered_by: serde_json::from_value(serde_json::Value::String(triggered_by)).unwrap_or(TriggerSource::Manual),
        parent_bulk_id: parent_bulk_id.and_then(|s| Uuid::parse_str(&s).ok()),
        cancel_requested: row.get::<_, i64>("cancel_requested")? != 0,
        error_kind: error_kind.and_then(|s| serde_json::from_value(serde_json::Value::String(s)).ok()),
        error_message: row.get("error_message")?,
        lease_owner: row.get("lease_owner")?,
        lease_deadline: opt_dt(lease_deadline),
    })
}

const NON_TERMINAL_STATES: &[&str] = &[
    "queued",
    "preflight",
    "pulling",
    "stopping",
    "creating",
    "starting",
    "health_check",
    "committing",
    "degraded",
    "rolling_back",
];

#[async_trait]
impl Gateway for SqliteGateway {
    async fn insert_container(&self, container: &ManagedContainer) -> Result<i64> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO managed_containers
                (name, registry, repository, tag, runtime_id, current_digest,
                 desired_config, update_policy, status, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
            params![
                container.name,
                container.image_ref.registry,
                container.image_ref.repository,
                container.image_ref.tag,
                container.runtime_id,
                container.current_digest,
                serde_json::to_string(&container.desired_config).unwrap_or_default(),
                serde_json::to_string(&container.update_policy).unwrap_or_default(),
                serde_json::to_string(&container.status).unwrap_or_default().trim_matches('"'),
                container.created_at.to_rfc3339(),
                container.updated_at.to_rfc3339(),
            ],
        )
        .map_err(|e| {
            if let rusqlite::Error::SqliteFailure(ref se, _) = e {
                if se.code == rusqlite::ErrorCode::ConstraintViolation {
                    return EngineError::new(ErrorKind::NameConflict, format!("container name {} already in use", container.name));
                }
            }
            sqlite_err(e)
        })?;
        Ok(conn.last_insert_rowid())
    }

    async fn get_container(&self, id: i64) -> Result<Option<ManagedContainer>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT * FROM managed_containers WHERE id = ?1",
            params![id],
            row_to_container,
        )
        .optional()
        .map_err(sqlite_err)
    }

    async fn get_container_by_name(&self, name: &str) -> Result<Option<ManagedContainer>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT * FROM managed_containers WHERE name = ?1",
            params![name],
            row_to_container,
        )
        .optional()
        .map_err(sqlite_err)
    }

    async fn list_containers(&self) -> Result<Vec<ManagedContainer>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT * FROM managed_containers ORDER BY id")
            .map_err(sqlite_err)?;
        let rows = stmt
            .query_map([], row_to_container)
            .map_err(sqlite_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(sqlite_err)?;
        Ok(rows)
    }

    async fn update_container(&self, container: &ManagedContainer) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            UPDATE managed_containers SET
                name = ?1, registry = ?2, repository = ?3, tag = ?4, runtime_id = ?5,
                current_digest = ?6, desired_config = ?7, update_policy = ?8,
                status = ?9, updated_at = ?10
            WHERE id = ?11
            "#,
            params![
                container.name,
                container.image_ref.registry,
                container.image_ref.repository,
                container.image_ref.tag,
                container.runtime_id,
                container.current_digest,
                serde_json::to_string(&container.desired_config).unwrap_or_default(),
                serde_json::to_string(&container.update_policy).unwrap_or_default(),
                serde_json::to_string(&container.status).unwrap_or_default().trim_matches('"'),
                Utc::now().to_rfc3339(),
                container.id,
            ],
        )
        .map_err(sqlite_err)?;
        Ok(())
    }

    async fn update_policy(&self, container_id: i64, policy: &UpdatePolicy) -> Result<()> {
        let conn = self.conn.lock().await;
        let n = conn
            .execute(
                "UPDATE managed_containers SET update_policy = ?1, updated_at = ?2 WHERE id = ?3",
                params![
                    serde_json::to_string(policy).unwrap_or_default(),
                    Utc::now().to_rfc3339(),
                    container_id
                ],
            )
            .map_err(sqlite_err)?;
        if n == 0 {
            return Err(EngineError::new(ErrorKind::NotFound, format!("container {} not found", container_id)));
        }
        Ok(())
    }

    async fn delete_container(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM managed_containers WHERE id = ?1", params![id])
            .map_err(sqlite_err)?;
        Ok(())
    }

    async fn upsert_available_update(&self, update: &AvailableUpdate) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE available_updates SET active = 0 WHERE container_id = ?1 AND active = 1",
            params![update.container_id],
        )
        .map_err(sqlite_err)?;
        conn.execute(
            r#"
            INSERT INTO available_updates
                (container_id, from_digest, to_digest, to_size_bytes, published_at,
                 observed_at, risk_level, security_flag, active)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1)
            "#,
            params![
                update.container_id,
                update.from_digest,
                update.to_digest,
                update.to_size_bytes as i64,
                update.published_at.map(|d| d.to_rfc3339()),
                update.observed_at.to_rfc3339(),
                serde_json::to_string(&update.risk_level).unwrap_or_default().trim_matches('"'),
                update.security_flag as i64,
            ],
        )
        .map_err(sqlite_err)?;
        Ok(())
    }

    async fn clear_available_update(&self, container_id: i64) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE available_updates SET active = 0 WHERE container_id = ?1 AND active = 1",
            params![container_id],
        )
        .map_err(sqlite_err)?;
        Ok(())
    }

    async fn list_available_updates(
        &self,
        filter: AvailableUpdateFilter,
        page: Page,
    ) -> Result<Vec<AvailableUpdate>> {
        let conn = self.conn.lock().await;
        let limit = if page.limit == 0 { 100 } else { page.limit };
        let mut sql = String::from(
            "SELECT container_id, from_digest, to_digest, to_size_bytes, published_at, \
             observed_at, risk_level, security_flag, active FROM available_updates WHERE 1=1",
        );
        if filter.container_id.is_some() {
            sql.push_str(" AND container_id = :container_id");
        }
        if filter.active_only {
            sql.push_str(" AND active = 1");
        }
        sql.push_str(" ORDER BY observed_at DESC LIMIT :limit OFFSET :offset");

        let mut stmt = conn.prepare(&sql).map_err(sqlite_err)?;
        let rows = stmt
            .query_map(
                rusqlite::named_params! {
                    ":container_id": filter.container_id,
                    ":limit": limit,
                    ":offset": page.offset,
                },
                |row| {
                    let risk_level: String = row.get(6)?;
                    Ok(AvailableUpdate {
                        container_id: row.get(0)?,
                        from_digest: row.get(1)?,
                        to_digest: row.get(2)?,
                        to_size_bytes: row.get::<_, i64>(3)? as u64,
                        published_at: opt_dt(row.get(4)?),
                        observed_at: parse_dt(&row.get::<_, String>(5)?),
                        risk_level: serde_json::from_value(serde_json::Value::String(risk_level))
                            .unwrap_or(RiskLevel::Medium),
                        security_flag: row.get::<_, i64>(7)? != 0,
                        active: row.get::<_, i64>(8)? != 0,
                    })
                },
            )
            .map_err(sqlite_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(sqlite_err)?;
        Ok(rows)
    }

    async fn insert_job(&self, job: &UpdateJob) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO update_jobs
                (id, container_id, from_digest, to_digest, strategy, state, attempt,
                 max_retries, scheduled_at, started_at, finished_at, triggered_by,
                 parent_bulk_id, cancel_requested, error_kind, error_message,
                 lease_owner, lease_deadline)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
            "#,
            params![
                job.id.to_string(),
                job.container_id,
                job.from_digest,
                job.to_digest,
                serde_json::to_string(&job.strategy).unwrap_or_default().trim_matches('"'),
                serde_json::to_string(&job.state).unwrap_or_default().trim_matches('"'),
                job.attempt,
                job.max_retries,
                job.scheduled_at.to_rfc3339(),
                job.started_at.map(|d| d.to_rfc3339()),
                job.finished_at.map(|d| d.to_rfc3339()),
                serde_json::to_string(&job.triggered_by).unwrap_or_default().trim_matches('"'),
                job.parent_bulk_id.map(|u| u.to_string()),
                job.cancel_requested as i64,
                job.error_kind.map(|k| serde_json::to_string(&k).unwrap_or_default().trim_matches('"').to_string()),
                job.error_message,
                job.lease_owner,
                job.lease_deadline.map(|d| d.to_rfc3339()),
            ],
        )
        .map_err(sqlite_err)?;
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<UpdateJob>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT * FROM update_jobs WHERE id = ?1",
            params![id.to_string()],
            row_to_job,
        )
        .optional()
        .map_err(sqlite_err)
    }

    async fn update_job(&self, job: &UpdateJob) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            UPDATE update_jobs SET
                state = ?1, attempt = ?2, started_at = ?3, finished_at = ?4,
                cancel_requested = ?5, error_kind = ?6, error_message = ?7,
                lease_owner = ?8, lease_deadline = ?9, to_digest = ?10
            WHERE id = ?11
            "#,
            params![
                serde_json::to_string(&job.state).unwrap_or_default().trim_matches('"'),
                job.attempt,
                job.started_at.map(|d| d.to_rfc3339()),
                job.finished_at.map(|d| d.to_rfc3339()),
                job.cancel_requested as i64,
                job.error_kind.map(|k| serde_json::to_string(&k).unwrap_or_default().trim_matches('"').to_string()),
                job.error_message,
                job.lease_owner,
                job.lease_deadline.map(|d| d.to_rfc3339()),
                job.to_digest,
                job.id.to_string(),
            ],
        )
        .map_err(sqlite_err)?;
        Ok(())
    }

    async fn list_jobs(&self, filter: JobFilter, page: Page) -> Result<Vec<UpdateJob>> {
        let conn = self.conn.lock().await;
        let limit = if page.limit == 0 { 100 } else { page.limit };
        let placeholders = NON_TERMINAL_STATES
            .iter()
            .map(|s| format!("'{}'", s))
            .collect::<Vec<_>>()
            .join(",");
        let mut sql = String::from("SELECT * FROM update_jobs WHERE 1=1");
        if filter.container_id.is_some() {
            sql.push_str(" AND container_id = :container_id");
        }
        if filter.parent_bulk_id.is_some() {
            sql.push_str(" AND parent_bulk_id = :parent_bulk_id");
        }
        if filter.non_terminal_only {
            sql.push_str(&format!(" AND state IN ({})", placeholders));
        }
        sql.push_str(" ORDER BY scheduled_at DESC LIMIT :limit OFFSET :offset");

        let mut stmt = conn.prepare(&sql).map_err(sqlite_err)?;
        let rows = stmt
            .query_map(
                rusqlite::named_params! {
                    ":container_id": filter.container_id,
                    ":parent_bulk_id": filter.parent_bulk_id.map(|u| u.to_string()),
                    ":limit": limit,
                    ":offset": page.offset,
                },
                row_to_job,
            )
            .map_err(sqlite_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(sqlite_err)?;
        Ok(rows)
    }

    async fn active_job_for_container(&self, container_id: i64) -> Result<Option<UpdateJob>> {
        let conn = self.conn.lock().await;
        let placeholders = NON_TERMINAL_STATES
            .iter()
            .map(|s| format!("'{}'", s))
            .collect::<Vec<_>>()
            .join(",");
        let sql = format!(
            "SELECT * FROM update_jobs WHERE container_id = ?1 AND state IN ({}) LIMIT 1",
            placeholders
        );
        conn.query_row(&sql, params![container_id], row_to_job)
            .optional()
            .map_err(sqlite_err)
    }

    async fn claim_next_update_job(
        &self,
        engine_id: &str,
        lease_deadline: DateTime<Utc>,
    ) -> Result<Option<UpdateJob>> {
        let conn = self.conn.lock().await;
        conn.execute_batch("BEGIN IMMEDIATE").map_err(sqlite_err)?;

        let now = Utc::now().to_rfc3339();
        let candidate = conn
            .query_row(
                r#"
                SELECT * FROM update_jobs
                WHERE state = 'queued'
                  AND scheduled_at <= ?1
                  AND (lease_owner IS NULL OR lease_deadline < ?1)
                ORDER BY scheduled_at ASC
                LIMIT 1
                "#,
                params![now],
                row_to_job,
            )
            .optional();

        let candidate = match candidate {
            Ok(c) => c,
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                return Err(sqlite_err(e));
            }
        };

        let Some(mut job) = candidate else {
            conn.execute_batch("COMMIT").map_err(sqlite_err)?;
            return Ok(None);
        };

        let update_result = conn.execute(
            "UPDATE update_jobs SET lease_owner = ?1, lease_deadline = ?2 WHERE id = ?3",
            params![engine_id, lease_deadline.to_rfc3339(), job.id.to_string()],
        );
        if let Err(e) = update_result {
            let _ = conn.execute_batch("ROLLBACK");
            return Err(sqlite_err(e));
        }
        conn.execute_batch("COMMIT").map_err(sqlite_err)?;

        job.lease_owner = Some(engine_id.to_string());
        job.lease_deadline = Some(lease_deadline);
        Ok(Some(job))
    }

    async fn recover_orphan_jobs(&self, now: DateTime<Utc>) -> Result<Vec<UpdateJob>> {
        let conn = self.conn.lock().await;
        let placeholders = NON_TERMINAL_STATES
            .iter()
            .map(|s| format!("'{}'", s))
            .collect::<Vec<_>>()
            .join(",");
        let sql = format!(
            "SELECT * FROM update_jobs WHERE state IN ({}) AND lease_deadline IS NOT NULL AND lease_deadline < ?1",
            placeholders
        );
        let mut stmt = conn.prepare(&sql).map_err(sqlite_err)?;
        let rows = stmt
            .query_map(params![now.to_rfc3339()], row_to_job)
            .map_err(sqlite_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(sqlite_err)?;
        Ok(rows)
    }

    async fn append_step(&self, step: &UpdateStepRecord) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO update_step_records
                (job_id, sequence, name, started_at, finished_at, outcome, detail, log_tail)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                step.job_id.to_string(),
                step.sequence,
                step.name,
                step.started_at.to_rfc3339(),
                step.finished_at.map(|d| d.to_rfc3339()),
                step.outcome.map(|o| serde_json::to_string(&o).unwrap_or_default().trim_matches('"').to_string()),
                step.detail.to_string(),
                serde_json::to_string(&step.log_tail).unwrap_or_default(),
            ],
        )
        .map_err(sqlite_err)?;
        Ok(())
    }

    async fn update_step(&self, step: &UpdateStepRecord) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            UPDATE update_step_records SET
                finished_at = ?1, outcome = ?2, detail = ?3, log_tail = ?4
            WHERE job_id = ?5 AND sequence = ?6
            "#,
            params![
                step.finished_at.map(|d| d.to_rfc3339()),
                step.outcome.map(|o| serde_json::to_string(&o).unwrap_or_default().trim_matches('"').to_string()),
                step.detail.to_string(),
                serde_json::to_string(&step.log_tail).unwrap_or_default(),
                step.job_id.to_string(),
                step.sequence,
            ],
        )
        .map_err(sqlite_err)?;
        Ok(())
    }

    async fn list_steps(&self, job_id: Uuid) -> Result<Vec<UpdateStepRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT * FROM update_step_records WHERE job_id = ?1 ORDER BY sequence ASC")
            .map_err(sqlite_err)?;
        let rows = stmt
            .query_map(params![job_id.to_string()], |row| {
                let outcome: Option<String> = row.get("outcome")?;
                let detail: String = row.get("detail")?;
                let log_tail: String = row.get("log_tail")?;
                Ok(UpdateStepRecord {
                    job_id,
                    sequence: row.get("sequence")?,
                    name: row.get("name")?,
                    started_at: parse_dt(&row.get::<_, String>("started_at")?),
                    finished_at: opt_dt(row.get("finished_at")?),
                    outcome: outcome.and_then(|s| serde_json::from_value(serde_json::Value::String(s)).ok()),
                    detail: serde_json::from_str(&detail).unwrap_or(serde_json::Value::Null),
                    log_tail: serde_json::from_str(&log_tail).unwrap_or_default(),
                })
            })
            .map_err(sqlite_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(sqlite_err)?;
        Ok(rows)
    }

    async fn insert_bulk(&self, bulk: &BulkUpdate) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO bulk_updates
                (id, targets, strategy, max_concurrency, respect_dependencies,
                 continue_on_error, state, progress, created_at, cancel_requested)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                bulk.id.to_string(),
                serde_json::to_string(&bulk.targets).unwrap_or_default(),
                serde_json::to_string(&bulk.strategy).unwrap_or_default().trim_matches('"'),
                bulk.max_concurrency as i64,
                bulk.respect_dependencies as i64,
                bulk.continue_on_error as i64,
                serde_json::to_string(&bulk.state).unwrap_or_default().trim_matches('"'),
                serde_json::to_string(&bulk.progress).unwrap_or_default(),
                bulk.created_at.to_rfc3339(),
                bulk.cancel_requested as i64,
            ],
        )
        .map_err(sqlite_err)?;
        Ok(())
    }

    async fn get_bulk(&self, id: Uuid) -> Result<Option<BulkUpdate>> {
        let conn = self.conn.lock().await;
        conn.query_row("SELECT * FROM bulk_updates WHERE id = ?1", params![id.to_string()], |row| {
            let targets: String = row.get("targets")?;
            let strategy: String = row.get("strategy")?;
            let state: String = row.get("state")?;
            let progress: String = row.get("progress")?;
            let created_at: String = row.get("created_at")?;
            Ok(BulkUpdate {
                id,
                targets: serde_json::from_str(&targets).unwrap_or_default(),
                strategy: serde_json::from_value(serde_json::Value::String(strategy)).unwrap_or(BulkStrategy::Sequential),
                max_concurrency: row.get::<_, i64>("max_concurrency")? as usize,
                respect_dependencies: row.get::<_, i64>("respect_dependencies")? != 0,
                continue_on_error: row.get::<_, i64>("continue_on_error")? != 0,
                state: serde_json::from_value(serde_json::Value::String(state)).unwrap_or(BulkState::Queued),
                progress: serde_json::from_str(&progress).unwrap_or_else(|_| BulkProgress::default()),
                created_at: parse_dt(&created_at),
                cancel_requested: row.get::<_, i64>("cancel_requested")? != 0,
            })
        })
        .optional()
        .map_err(sqlite_err)
    }

    async fn update_bulk(&self, bulk: &BulkUpdate) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            UPDATE bulk_updates SET state = ?1, progress = ?2, cancel_requested = ?3 WHERE id = ?4
            "#,
            params![
                serde_json::to_string(&bulk.state).unwrap_or_default().trim_matches('"'),
                serde_json::to_string(&bulk.progress).unwrap_or_default(),
                bulk.cancel_requested as i64,
                bulk.id.to_string(),
            ],
        )
        .map_err(sqlite_err)?;
        Ok(())
    }

    async fn insert_audit(&self, record: &AuditRecord) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO audit_records (timestamp, actor, subject, action, outcome, details)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                record.timestamp.to_rfc3339(),
                record.actor,
                record.subject,
                record.action,
                serde_json::to_string(&record.outcome).unwrap_or_default().trim_matches('"'),
                record.details.to_string(),
            ],
        )
        .map_err(sqlite_err)?;
        Ok(())
    }

    async fn list_audit(&self, subject: Option<&str>, page: Page) -> Result<Vec<AuditRecord>> {
        let conn = self.conn.lock().await;
        let limit = if page.limit == 0 { 100 } else { page.limit };
        let mut sql = String::from(
            "SELECT id, timestamp, actor, subject, action, outcome, details FROM audit_records WHERE 1=1",
        );
        if subject.is_some() {
            sql.push_str(" AND subject = :subject");
        }
        sql.push_str(" ORDER BY timestamp DESC LIMIT :limit OFFSET :offset");

        let mut stmt = conn.prepare(&sql).map_err(sqlite_err)?;
        let rows = stmt
            .query_map(
                rusqlite::named_params! { ":subject": subject, ":limit": limit, ":offset": page.offset },
                |row| {
                    let outcome: String = row.get(5)?;
                    let details: String = row.get(6)?;
                    Ok(AuditRecord {
                        id: row.get(0)?,
                        timestamp: parse_dt(&row.get::<_, String>(1)?),
                        actor: row.get(2)?,
                        subject: row.get(3)?,
                        action: row.get(4)?,
                        outcome: serde_json::from_value(serde_json::Value::String(outcome)).unwrap_or(AuditOutcome::Ok),
                        details: serde_json::from_str(&details).unwrap_or(serde_json::Value::Null),
                    })
                },
            )
            .map_err(sqlite_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(sqlite_err)?;
        Ok(rows)
    }

    async fn purge_audit_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let conn = self.conn.lock().await;
        let deleted = conn
            .execute(
                "DELETE FROM audit_records WHERE timestamp < ?1",
                params![cutoff.to_rfc3339()],
            )
            .map_err(sqlite_err)?;
        Ok(deleted as u64)
    }
}

/// Convenience constructor used by the engine bootstrap.
pub fn open_gateway(path: impl AsRef<Path>) -> Result<Arc<dyn Gateway>> {
    Ok(Arc::new(SqliteGateway::open(path)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ContainerStatus, DesiredConfig, JobState, UpdatePolicy};

    fn sample_container(name: &str) -> ManagedContainer {
        ManagedContainer {
            id: 0,
            name: name.to_string(),
            image_ref: ImageRef::new("docker.io", "library/nginx").with_tag("1.24"),
            runtime_id: None,
            current_digest: None,
            desired_config: DesiredConfig::default(),
            update_policy: UpdatePolicy::default(),
            status: ContainerStatus::Pending,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn insert_and_fetch_container() {
        let gw = SqliteGateway::open_in_memory().unwrap();
        let id = gw.insert_container(&sample_container("web")).await.unwrap();
        let fetched = gw.get_container(id).await.unwrap().unwrap();
        assert_eq!(fetched.name, "web");
        assert_eq!(fetched.status, ContainerStatus::Pending);
    }

    #[tokio::test]
    async fn duplicate_name_is_name_conflict() {
        let gw = SqliteGateway::open_in_memory().unwrap();
        gw.insert_container(&sample_container("web")).await.unwrap();
        let err = gw.insert_container(&sample_container("web")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NameConflict);
    }

    #[tokio::test]
    async fn claim_next_update_job_is_exclusive() {
        let gw = SqliteGateway::open_in_memory().unwrap();
        let container_id = gw.insert_container(&sample_container("web")).await.unwrap();
        let job = UpdateJob::new(
            container_id,
            "sha256:a".into(),
            "sha256:b".into(),
            UpdateStrategy::Recreate,
            3,
            TriggerSource::Manual,
            None,
        );
        gw.insert_job(&job).await.unwrap();

        let claimed = gw
            .claim_next_update_job("engine-1", Utc::now() + chrono::Duration::seconds(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, job.id);
        assert_eq!(claimed.lease_owner.as_deref(), Some("engine-1"));

        // A second instance may not claim it before the lease expires.
        let second = gw
            .claim_next_update_job("engine-2", Utc::now() + chrono::Duration::seconds(30))
            .await
            .unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn recover_orphan_jobs_finds_expired_leases() {
        let gw = SqliteGateway::open_in_memory().unwrap();
        let container_id = gw.insert_container(&sample_container("web")).await.unwrap();
        let mut job = UpdateJob::new(
            container_id,
            "sha256:a".into(),
            "sha256:b".into(),
            UpdateStrategy::Recreate,
            3,
            TriggerSource::Manual,
            None,
        );
        job.state = JobState::Pulling;
        job.lease_owner = Some("dead-engine".into());
        job.lease_deadline = Some(Utc::now() - chrono::Duration::seconds(5));
        gw.insert_job(&job).await.unwrap();
        gw.update_job(&job).await.unwrap();

        let orphans = gw.recover_orphan_jobs(Utc::now()).await.unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].id, job.id);
    }

    #[tokio::test]
    async fn audit_retention_purges_old_rows() {
        let gw = SqliteGateway::open_in_memory().unwrap();
        let mut record = AuditRecord::system("1", "watch", AuditOutcome::Ok);
        record.timestamp = Utc::now() - chrono::Duration::days(10);
        gw.insert_audit(&record).await.unwrap();

        let deleted = gw
            .purge_audit_older_than(Utc::now() - chrono::Duration::days(1))
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert!(gw.list_audit(None, Page::default()).await.unwrap().is_empty());
    }
}
