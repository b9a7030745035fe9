//! Update Executor (C4): drives one `UpdateJob` through its state machine
//! (spec §4.4) and guarantees that any terminal failure either rolls the
//! container back to its pre-update running state or leaves it in an
//! unambiguous `failed` state.

pub mod hooks;

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use crate::error::{EngineError, ErrorKind, Result};
use crate::events::EventBus;
use crate::model::{
    ContainerStatus, JobState, ManagedContainer, StepOutcome, UpdateJob, UpdateStepRecord,
    UpdateStrategy,
};
use crate::executor::hooks::run_hook;
use crate::persistence::Gateway;
use crate::registry::RegistryClient;
use crate::runtime::{run_health_check, CreateSpec, PullProgress, RuntimeAdapter};

const DEFAULT_STOP_TIMEOUT_SEC: u64 = 30;
const DEFAULT_START_TIMEOUT_SEC: u64 = 60;
const PULL_PROGRESS_THROTTLE: Duration = Duration::from_millis(250); // at most 4/sec

/// Drives jobs to completion. One instance is shared by every executor
/// worker in the pool (spec §5: "a pool of executor workers, default 5").
pub struct Executor {
    runtime: Arc<dyn RuntimeAdapter>,
    registry: Arc<RegistryClient>,
    persistence: Arc<dyn Gateway>,
    bus: EventBus,
    /// Per-container mutex: held for the entire job; a worker that cannot
    /// acquire it immediately signals `ContainerBusy` rather than queueing
    /// (the scheduler's admission control already prevents two active jobs
    /// per container, so contention here indicates a bug upstream).
    container_locks: DashMap<i64, Arc<AsyncMutex<()>>>,
}

/// State captured in `preflight`, used to undo a failed update.
#[derive(Debug, Clone)]
struct RollbackSnapshot {
    previous_runtime_id: Option<String>,
    previous_name: String,
}

impl Executor {
    pub fn new(
        runtime: Arc<dyn RuntimeAdapter>,
        registry: Arc<RegistryClient>,
        persistence: Arc<dyn Gateway>,
        bus: EventBus,
    ) -> Self {
        Self {
            runtime,
            registry,
            persistence,
            bus,
            container_locks: DashMap::new(),
        }
    }

    fn lock_for(&self, container_id: i64) -> Arc<AsyncMutex<()>> {
        self.container_locks
            .entry(container_id)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Runs `job` to completion, persisting every transition and publishing
    /// `job.step`/`job.state`/`job.terminal` events as it goes. Returns the
    /// final job record; the scheduler is responsible for retry enqueueing.
    pub async fn execute(&self, mut job: UpdateJob, ctx: CancellationToken) -> Result<UpdateJob> {
        let lock = self.lock_for(job.container_id);
        let guard = match lock.try_lock() {
            Ok(g) => g,
            Err(_) => return Err(EngineError::new(ErrorKind::ContainerBusy, "container has an active job")),
        };

        self.drive(&mut job, ctx).await;
        drop(guard);
        Ok(job)
    }

    async fn drive(&self, job: &mut UpdateJob, ctx: CancellationToken) {
        let mut sequence = 0u32;
        job.started_at = Some(chrono::Utc::now());
        if self.transition(job, JobState::Preflight).await.is_err() {
            return;
        }

        let container = match self.persistence.get_container(job.container_id).await {
            Ok(Some(c)) => c,
            Ok(None) => {
                self.fail(job, EngineError::new(ErrorKind::NotFound, "container no longer exists")).await;
                return;
            }
            Err(e) => {
                self.fail(job, e).await;
                return;
            }
        };

        let snapshot = match self.step_preflight(job, &container, &mut sequence, ctx.clone()).await {
            Ok(s) => s,
            Err(e) => return self.fail_before_stop(job, e).await,
        };

        if self.should_cancel(job) {
            return self.cancel(job).await;
        }

        if self.transition(job, JobState::Pulling).await.is_err() {
            return;
        }
        if let Err(e) = self.step_pull(job, &mut sequence, ctx.clone()).await {
            return self.fail_before_stop(job, e).await;
        }

        if self.should_cancel(job) {
            return self.cancel(job).await;
        }

        if let Err(e) = self.step_pre_hook(job, &container, &mut sequence, ctx.clone()).await {
            return self.fail_before_stop(job, e).await;
        }

        if self.transition(job, JobState::Stopping).await.is_err() {
            return;
        }
        let (new_name, old_renamed) = match self.step_stop(job, &container, &mut sequence, ctx.clone()).await {
            Ok(v) => v,
            Err(e) => return self.rollback_or_fail(job, &container, &snapshot, e).await,
        };

        if self.transition(job, JobState::Creating).await.is_err() {
            return;
        }
        let new_runtime_id = match self.step_create(job, &container, &new_name, &mut sequence, ctx.clone()).await {
            Ok(id) => id,
            Err(e) => return self.rollback_or_fail(job, &container, &snapshot, e).await,
        };

        if self.should_cancel(job) {
            let cause = EngineError::new(ErrorKind::Cancelled, "cancelled after container creation");
            return self.rollback(job, &container, &snapshot, cause).await;
        }

        if self.transition(job, JobState::Starting).await.is_err() {
            return;
        }
        if let Err(e) = self.step_start(job, &new_runtime_id, &mut sequence, ctx.clone()).await {
            return self.rollback_or_fail(job, &container, &snapshot, e).await;
        }

        if self.transition(job, JobState::HealthCheck).await.is_err() {
            return;
        }
        if let Err(e) = self
            .step_health_check(job, &container, &new_runtime_id, &mut sequence, ctx.clone())
            .await
        {
            return self.rollback_or_fail(job, &container, &snapshot, e).await;
        }

        if let Err(e) = self.step_post_hook(job, &container, &new_runtime_id, &mut sequence, ctx.clone()).await {
            return self.rollback_or_fail(job, &container, &snapshot, e).await;
        }

        if self.transition(job, JobState::Committing).await.is_err() {
            return;
        }
        if let Err(e) = self
            .step_commit(job, &container, &new_runtime_id, old_renamed, &mut sequence, ctx.clone())
            .await
        {
            return self.rollback_or_fail(job, &container, &snapshot, e).await;
        }

        job.finished_at = Some(chrono::Utc::now());
        let _ = self.transition(job, JobState::Succeeded).await;
        self.publish_terminal(job);
    }

    fn should_cancel(&self, job: &UpdateJob) -> bool {
        job.cancel_requested && job.state.is_cancel_safe_point()
    }

    // -- steps --

    async fn step_preflight(
        &self,
        job: &mut UpdateJob,
        container: &ManagedContainer,
        sequence: &mut u32,
        ctx: CancellationToken,
    ) -> Result<RollbackSnapshot> {
        let job_id = job.id;
        let image_ref = container.image_ref.clone();
        let runtime_id = container.runtime_id.clone();
        let previous_name = container.name.clone();

        let (digest, snapshot) = self
            .record_step(job_id, sequence, "preflight", async {
                let resolved = self.registry.resolve(&image_ref).await?;
                if ctx.is_cancelled() {
                    return Err(EngineError::new(ErrorKind::Cancelled, "cancelled during preflight"));
                }
                if let Some(id) = &runtime_id {
                    self.runtime.inspect(id, ctx.clone()).await?;
                }
                Ok((
                    resolved.digest,
                    RollbackSnapshot {
                        previous_runtime_id: runtime_id.clone(),
                        previous_name,
                    },
                ))
            })
            .await?;

        job.to_digest = digest;
        Ok(snapshot)
    }

    async fn step_pull(&self, job: &mut UpdateJob, sequence: &mut u32, ctx: CancellationToken) -> Result<()> {
        let job_id = job.id;
        let to_digest = job.to_digest.clone();
        let container_id = job.container_id;
        let bus = self.bus.clone();
        let throttle = SyncMutex::new(Instant::now() - PULL_PROGRESS_THROTTLE);
        let image = format!("container-{}@{}", container_id, to_digest);

        self.record_step(job_id, sequence, "pulling", async {
            let on_progress: Box<dyn Fn(PullProgress) + Send + Sync> = Box::new(move |p: PullProgress| {
                let mut last = throttle.lock();
                if last.elapsed() >= PULL_PROGRESS_THROTTLE {
                    *last = Instant::now();
                    bus.publish(crate::events::EventPayload::JobPullProgress {
                        job_id,
                        bytes_done: p.bytes_done,
                        bytes_total: p.bytes_total,
                    });
                }
            });
            self.runtime.pull(&image, ctx, Some(on_progress)).await
        })
        .await
    }

    /// Runs the policy's pre-update hook inside the still-running old
    /// container. A non-zero exit aborts before `stopping` — nothing has
    /// been touched yet, so no rollback is needed (spec §4.4).
    async fn step_pre_hook(
        &self,
        job: &mut UpdateJob,
        container: &ManagedContainer,
        sequence: &mut u32,
        ctx: CancellationToken,
    ) -> Result<()> {
        let job_id = job.id;
        let Some(command) = container.update_policy.pre_update_hook.clone() else {
            return Ok(());
        };
        let Some(runtime_id) = container.runtime_id.clone() else {
            return Ok(());
        };
        let timeout_sec = container.update_policy.hook_timeout_sec;

        self.record_step(job_id, sequence, "pre_hook", async {
            let exit_code = run_hook(self.runtime.as_ref(), &runtime_id, &command, timeout_sec, ctx).await?;
            if exit_code != 0 {
                return Err(EngineError::new(ErrorKind::HookFailed, format!("pre_update_hook exited {}", exit_code)));
            }
            Ok(())
        })
        .await
    }

    /// Runs the policy's post-update hook inside the freshly started new
    /// container. A non-zero exit is treated as a health-check failure and
    /// follows the same rollback-or-fail path (spec §4.4).
    async fn step_post_hook(
        &self,
        job: &mut UpdateJob,
        container: &ManagedContainer,
        new_runtime_id: &str,
        sequence: &mut u32,
        ctx: CancellationToken,
    ) -> Result<()> {
        let job_id = job.id;
        let Some(command) = container.update_policy.post_update_hook.clone() else {
            return Ok(());
        };
        let timeout_sec = container.update_policy.hook_timeout_sec;
        let runtime_id = new_runtime_id.to_string();

        self.record_step(job_id, sequence, "post_hook", async {
            let exit_code = run_hook(self.runtime.as_ref(), &runtime_id, &command, timeout_sec, ctx).await?;
            if exit_code != 0 {
                return Err(EngineError::new(ErrorKind::HealthCheckFailed, format!("post_update_hook exited {}", exit_code)));
            }
            Ok(())
        })
        .await
    }

    async fn step_stop(
        &self,
        job: &mut UpdateJob,
        container: &ManagedContainer,
        sequence: &mut u32,
        ctx: CancellationToken,
    ) -> Result<(String, bool)> {
        let job_id = job.id;
        let strategy = job.strategy;
        let runtime_id = container.runtime_id.clone();
        let name = container.name.clone();
        let stop_timeout = container.update_policy.stop_timeout_sec.unwrap_or(DEFAULT_STOP_TIMEOUT_SEC);

        self.record_step(job_id, sequence, "stopping", async {
            match strategy {
                UpdateStrategy::Recreate => {
                    if let Some(id) = &runtime_id {
                        self.runtime.stop(id, stop_timeout, ctx.clone()).await?;
                        let renamed = format!("{}-prev-{}", name, chrono::Utc::now().timestamp());
                        self.runtime.rename(id, &renamed, ctx.clone()).await?;
                    }
                    Ok((name, true))
                }
                UpdateStrategy::Rolling | UpdateStrategy::BlueGreen | UpdateStrategy::Canary => {
                    let new_name = format!("{}-new-{}", name, chrono::Utc::now().timestamp());
                    Ok((new_name, false))
                }
            }
        })
        .await
    }

    async fn step_create(
        &self,
        job: &mut UpdateJob,
        container: &ManagedContainer,
        new_name: &str,
        sequence: &mut u32,
        ctx: CancellationToken,
    ) -> Result<String> {
        let job_id = job.id;
        let image = format!("container-{}@{}", job.container_id, job.to_digest);
        let spec = CreateSpec {
            name: new_name.to_string(),
            image,
            config: container.desired_config.clone(),
        };
        self.record_step(job_id, sequence, "creating", self.runtime.create(spec, ctx)).await
    }

    async fn step_start(
        &self,
        job: &mut UpdateJob,
        runtime_id: &str,
        sequence: &mut u32,
        ctx: CancellationToken,
    ) -> Result<()> {
        let job_id = job.id;
        self.record_step(job_id, sequence, "starting", async {
            self.runtime.start(runtime_id, ctx.clone()).await?;
            let deadline = Instant::now() + Duration::from_secs(DEFAULT_START_TIMEOUT_SEC);
            loop {
                let info = self.runtime.inspect(runtime_id, ctx.clone()).await?;
                if info.running {
                    return Ok(());
                }
                if Instant::now() >= deadline {
                    return Err(EngineError::new(ErrorKind::Timeout, "container did not reach running state"));
                }
                if ctx.is_cancelled() {
                    return Err(EngineError::new(ErrorKind::Cancelled, "cancelled while waiting to start"));
                }
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        })
        .await
    }

    async fn step_health_check(
        &self,
        job: &mut UpdateJob,
        container: &ManagedContainer,
        runtime_id: &str,
        sequence: &mut u32,
        ctx: CancellationToken,
    ) -> Result<()> {
        let job_id = job.id;
        let spec = container.desired_config.health_check.clone();
        let timeout_sec = container.update_policy.health_check_timeout_sec;

        self.record_step(job_id, sequence, "health_check", async {
            let deadline = Instant::now() + Duration::from_secs(timeout_sec);
            let test = spec.test.clone().unwrap_or_default();

            if test.is_empty() {
                // No health check defined: running continuously for 10s with
                // no exit counts as healthy.
                let observe_until = Instant::now() + Duration::from_secs(10);
                while Instant::now() < observe_until {
                    let info = self.runtime.inspect(runtime_id, ctx.clone()).await?;
                    if !info.running {
                        return Err(EngineError::new(ErrorKind::HealthCheckFailed, "container exited before health window elapsed"));
                    }
                    if ctx.is_cancelled() {
                        return Err(EngineError::new(ErrorKind::Cancelled, "cancelled during health observation"));
                    }
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                return Ok(());
            }

            let interval = Duration::from_secs(spec.interval_sec.unwrap_or(10).max(1));
            loop {
                match run_health_check(self.runtime.as_ref(), runtime_id, &test, ctx.clone()).await {
                    Ok(true) => return Ok(()),
                    Ok(false) | Err(_) => {}
                }
                if Instant::now() >= deadline {
                    return Err(EngineError::new(ErrorKind::HealthCheckFailed, "health check did not pass before timeout"));
                }
                if ctx.is_cancelled() {
                    return Err(EngineError::new(ErrorKind::Cancelled, "cancelled during health check"));
                }
                tokio::time::sleep(interval).await;
            }
        })
        .await
    }

    async fn step_commit(
        &self,
        job: &mut UpdateJob,
        container: &ManagedContainer,
        new_runtime_id: &str,
        old_renamed: bool,
        sequence: &mut u32,
        ctx: CancellationToken,
    ) -> Result<()> {
        let job_id = job.id;
        let strategy = job.strategy;
        let to_digest = job.to_digest.clone();
        let container_id = job.container_id;
        let backup_previous = container.update_policy.backup_previous;
        let retention_sec = container.update_policy.retention_sec;
        let previous_runtime_id = container.runtime_id.clone();
        let original_name = container.name.clone();
        let old_status = container.status;
        let persistence = self.persistence.clone();
        let runtime = self.runtime.clone();
        let bus = self.bus.clone();

        self.record_step(job_id, sequence, "committing", async {
            match strategy {
                UpdateStrategy::Recreate => {
                    if old_renamed {
                        if backup_previous {
                            schedule_delayed_removal(runtime.clone(), previous_runtime_id.clone(), retention_sec);
                        } else if let Some(prev) = &previous_runtime_id {
                            runtime.remove(prev, true, ctx.clone()).await.ok();
                        }
                    }
                }
                UpdateStrategy::Rolling | UpdateStrategy::BlueGreen | UpdateStrategy::Canary => {
                    if let Some(prev) = &previous_runtime_id {
                        runtime.stop(prev, DEFAULT_STOP_TIMEOUT_SEC, ctx.clone()).await.ok();
                        if backup_previous {
                            schedule_delayed_removal(runtime.clone(), Some(prev.clone()), retention_sec);
                        } else {
                            runtime.remove(prev, true, ctx.clone()).await.ok();
                        }
                    }
                    runtime.rename(new_runtime_id, &original_name, ctx.clone()).await?;
                }
            }

            if let Some(mut updated) = persistence.get_container(container_id).await? {
                updated.runtime_id = Some(new_runtime_id.to_string());
                updated.current_digest = Some(to_digest);
                updated.status = ContainerStatus::Running;
                updated.name = original_name;
                updated.updated_at = chrono::Utc::now();
                persistence.update_container(&updated).await?;
                bus.publish(crate::events::EventPayload::ContainerStatus {
                    container_id,
                    old_status: format!("{:?}", old_status).to_lowercase(),
                    new_status: format!("{:?}", ContainerStatus::Running).to_lowercase(),
                });
            }
            Ok(())
        })
        .await
    }

    // -- failure handling --

    async fn rollback_or_fail(
        &self,
        job: &mut UpdateJob,
        container: &ManagedContainer,
        snapshot: &RollbackSnapshot,
        cause: EngineError,
    ) {
        if container.update_policy.rollback_on_failure {
            self.rollback(job, container, snapshot, cause).await;
        } else {
            self.fail(job, cause).await;
        }
    }

    async fn rollback(&self, job: &mut UpdateJob, container: &ManagedContainer, snapshot: &RollbackSnapshot, cause: EngineError) {
        if self.transition(job, JobState::Degraded).await.is_err() {
            return;
        }
        if self.transition(job, JobState::RollingBack).await.is_err() {
            return;
        }
        let ctx = CancellationToken::new();

        let rollback_result: Result<()> = async {
            if let Some(previous_id) = &snapshot.previous_runtime_id {
                let _ = self.runtime.stop(previous_id, DEFAULT_STOP_TIMEOUT_SEC, ctx.clone()).await;
                self.runtime.rename(previous_id, &snapshot.previous_name, ctx.clone()).await?;
                self.runtime.start(previous_id, ctx.clone()).await?;
                let healthy = run_health_check(
                    self.runtime.as_ref(),
                    previous_id,
                    container.desired_config.health_check.test.as_deref().unwrap_or(&[]),
                    ctx.clone(),
                )
                .await
                .unwrap_or(true);
                if !healthy {
                    return Err(EngineError::new(ErrorKind::RollbackFailed, "rolled-back container failed health re-verification"));
                }
            }
            Ok(())
        }
        .await;

        match rollback_result {
            Ok(()) => {
                job.error_kind = Some(cause.kind());
                job.error_message = Some(cause.message.clone());
                job.finished_at = Some(chrono::Utc::now());
                if self.transition(job, JobState::RolledBack).await.is_ok() {
                    self.publish_terminal(job);
                }
            }
            Err(e) => {
                warn!("rollback failed for job {}: {}", job.id, e);
                self.fail(job, EngineError::new(ErrorKind::RollbackFailed, e.message)).await;
            }
        }
    }

    async fn fail(&self, job: &mut UpdateJob, cause: EngineError) {
        job.error_kind = Some(cause.kind());
        job.error_message = Some(cause.message.clone());
        job.finished_at = Some(chrono::Utc::now());
        if self.transition(job, JobState::Failed).await.is_err() {
            return;
        }
        if let Ok(Some(mut container)) = self.persistence.get_container(job.container_id).await {
            container.status = ContainerStatus::Failed;
            container.updated_at = chrono::Utc::now();
            let _ = self.persistence.update_container(&container).await;
        }
        self.publish_terminal(job);
    }

    async fn fail_before_stop(&self, job: &mut UpdateJob, cause: EngineError) {
        // No external state touched yet (pre-`stopping`) — no rollback needed.
        self.fail(job, cause).await;
    }

    async fn cancel(&self, job: &mut UpdateJob) {
        job.finished_at = Some(chrono::Utc::now());
        if self.transition(job, JobState::Cancelled).await.is_ok() {
            self.publish_terminal(job);
        }
    }

    // -- bookkeeping --

    async fn transition(&self, job: &mut UpdateJob, new_state: JobState) -> Result<()> {
        job.state = new_state;
        self.persistence.update_job(job).await?;
        self.bus.publish(crate::events::EventPayload::JobState {
            job_id: job.id,
            container_id: job.container_id,
            state: new_state,
            attempt: job.attempt,
        });
        Ok(())
    }

    fn publish_terminal(&self, job: &UpdateJob) {
        self.bus.publish(crate::events::EventPayload::JobTerminal {
            job_id: job.id,
            state: job.state,
            error_kind: job.error_kind,
            error_message: job.error_message.clone(),
        });
    }

    async fn record_step<T, F>(&self, job_id: Uuid, sequence: &mut u32, name: &str, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        let seq = *sequence;
        *sequence += 1;
        let mut record = UpdateStepRecord {
            job_id,
            sequence: seq,
            name: name.to_string(),
            started_at: chrono::Utc::now(),
            finished_at: None,
            outcome: None,
            detail: serde_json::Value::Null,
            log_tail: Vec::new(),
        };
        self.persistence.append_step(&record).await?;
        self.bus.publish(crate::events::EventPayload::JobStep {
            job_id,
            step_name: name.to_string(),
            sequence: seq,
            outcome: None,
        });

        let result = fut.await;
        record.finished_at = Some(chrono::Utc::now());
        record.outcome = Some(match &result {
            Ok(_) => StepOutcome::Ok,
            Err(e) if e.kind() == ErrorKind::Cancelled => StepOutcome::Skipped,
            Err(_) => StepOutcome::Failed,
        });
        if let Err(e) = &result {
            record.detail = serde_json::json!({ "error_kind": e.kind(), "message": e.message });
        }
        let _ = self.persistence.update_step(&record).await;
        self.bus.publish(crate::events::EventPayload::JobStep {
            job_id,
            step_name: name.to_string(),
            sequence: seq,
            outcome: record.outcome.map(|o| format!("{:?}", o).to_lowercase()),
        });

        result
    }
}

/// Removes a container after `retention_sec`, used when `backup_previous`
/// keeps the old instance around for a grace window (spec §4.4 step 7).
fn schedule_delayed_removal(runtime: Arc<dyn RuntimeAdapter>, runtime_id: Option<String>, retention_sec: u64) {
    let Some(id) = runtime_id else { return };
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(retention_sec)).await;
        let ctx = CancellationToken::new();
        if let Err(e) = runtime.remove(&id, true, ctx).await {
            warn!("delayed removal of {} failed: {}", id, e);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TriggerSource;

    #[test]
    fn rollback_snapshot_carries_previous_identity() {
        let snapshot = RollbackSnapshot {
            previous_runtime_id: Some("abc".into()),
            previous_name: "web".into(),
        };
        assert_eq!(snapshot.previous_name, "web");
    }

    #[test]
    fn should_cancel_respects_safe_points() {
        let mut job = UpdateJob::new(
            1,
            "sha256:a".into(),
            "sha256:b".into(),
            UpdateStrategy::Recreate,
            3,
            TriggerSource::Manual,
            None,
        );
        job.cancel_requested = true;
        job.state = JobState::Committing;
        assert!(!job.state.is_cancel_safe_point());
        job.state = JobState::Pulling;
        assert!(job.state.is_cancel_safe_point());
    }
}
