//! Scheduler (C5): admission control, the executor worker pool's ready
//! queue, cron dispatch, and bulk orchestration.
//!
//! Owns no container state directly — every decision is made against the
//! Persistence Gateway so a second engine instance sharing the same store
//! cooperates correctly via `claim_next_update_job`'s lease.

pub mod bulk;
pub mod cron;
pub mod dag;
pub mod retry;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{EngineError, ErrorKind, Result};
use crate::events::{EventBus, EventPayload, TopicFilter};
use crate::executor::Executor;
use crate::model::{
    AuditOutcome, AuditRecord, BulkProgress, BulkState, BulkStrategy, BulkUpdate, JobState,
    ManagedContainer, PolicyMode, TriggerSource, UpdateJob, UpdateStrategy,
};
use crate::persistence::{Gateway, JobFilter, Page};
use crate::registry::RegistryClient;
use crate::watcher::AutoEnqueuer;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Size of the executor worker pool (spec §5 default 5).
    pub executor_workers: usize,
    /// How long a claimed job's lease is held before another instance may
    /// steal it as orphaned.
    pub lease_ttl_sec: i64,
    /// How often an idle worker polls for newly queued work.
    pub claim_poll_interval: Duration,
    /// How often the cron loop re-evaluates per-container schedules.
    pub cron_poll_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            executor_workers: 5,
            lease_ttl_sec: 300,
            claim_poll_interval: Duration::from_secs(2),
            cron_poll_interval: Duration::from_secs(30),
        }
    }
}

/// Coordinates admission, the shared ready-queue worker pool, cron firing,
/// and bulk orchestration. Cheap to clone: every field is an `Arc` or a
/// `Copy`/cheap-`Clone` value.
#[derive(Clone)]
pub struct Scheduler {
    persistence: Arc<dyn Gateway>,
    executor: Arc<Executor>,
    registry: Arc<RegistryClient>,
    bus: EventBus,
    engine_id: String,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        persistence: Arc<dyn Gateway>,
        executor: Arc<Executor>,
        registry: Arc<RegistryClient>,
        bus: EventBus,
        engine_id: String,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            persistence,
            executor,
            registry,
            bus,
            engine_id,
            config,
        }
    }

    // -- admission --

    /// Merges into the container's active job if it already targets
    /// `to_digest` (idempotent enqueue), otherwise rejects with `Conflict`,
    /// otherwise creates and persists a new `queued` job.
    async fn admit(
        &self,
        container_id: i64,
        from_digest: String,
        to_digest: String,
        strategy: UpdateStrategy,
        max_retries: u32,
        triggered_by: TriggerSource,
        parent_bulk_id: Option<Uuid>,
    ) -> Result<Uuid> {
        if let Some(active) = self.persistence.active_job_for_container(container_id).await? {
            if active.to_digest == to_digest {
                return Ok(active.id);
            }
            return Err(EngineError::new(
                ErrorKind::Conflict,
                "container already has a non-terminal job targeting a different digest",
            ));
        }
        let job = UpdateJob::new(container_id, from_digest, to_digest, strategy, max_retries, triggered_by, parent_bulk_id);
        self.persistence.insert_job(&job).await?;
        Ok(job.id)
    }

    /// Manual, on-demand dispatch. `target_digest = None` resolves the
    /// container's currently configured tag against the registry.
    pub async fn request_update(&self, container_id: i64, target_digest: Option<String>) -> Result<Uuid> {
        let container = self
            .persistence
            .get_container(container_id)
            .await?
            .ok_or_else(|| EngineError::new(ErrorKind::NotFound, "container not found"))?;

        if container.update_policy.mode == PolicyMode::Disabled {
            return Err(EngineError::new(ErrorKind::PolicyDisabled, "container's update policy is disabled"));
        }

        let from_digest = container.current_digest.clone().unwrap_or_default();
        let to_digest = match target_digest {
            Some(d) => d,
            None => self.registry.resolve(&container.image_ref).await?.digest,
        };

        self.admit(
            container_id,
            from_digest,
            to_digest,
            container.update_policy.strategy,
            container.update_policy.max_retries,
            TriggerSource::Manual,
            None,
        )
        .await
    }

    pub async fn cancel_job(&self, job_id: Uuid) -> Result<()> {
        let mut job = self
            .persistence
            .get_job(job_id)
            .await?
            .ok_or_else(|| EngineError::new(ErrorKind::NotFound, "job not found"))?;
        if job.state.is_terminal() {
            return Err(EngineError::new(ErrorKind::AlreadyTerminal, "job has already reached a terminal state"));
        }
        job.cancel_requested = true;
        self.persistence.update_job(&job).await
    }

    // -- bulk orchestration --

    pub async fn bulk_update(
        &self,
        targets: Vec<i64>,
        strategy: BulkStrategy,
        max_concurrency: usize,
        respect_dependencies: bool,
        continue_on_error: bool,
    ) -> Result<Uuid> {
        if targets.is_empty() {
            return Err(EngineError::new(ErrorKind::EmptyTargets, "bulk update requires at least one target"));
        }

        let mut containers = Vec::with_capacity(targets.len());
        for &id in &targets {
            if let Some(c) = self.persistence.get_container(id).await? {
                containers.push(c);
            }
        }

        let dag_batches = if respect_dependencies {
            let nodes = bulk::build_nodes(&containers);
            dag::topological_batches(&nodes)?
        } else {
            vec![containers.iter().map(|c| c.id).collect()]
        };
        let shaped = bulk::shape_batches(strategy, dag_batches, max_concurrency);

        let record = BulkUpdate::new(targets, strategy, max_concurrency, respect_dependencies, continue_on_error);
        let bulk_id = record.id;
        self.persistence.insert_bulk(&record).await?;

        let this = self.clone();
        tokio::spawn(async move {
            this.run_bulk(bulk_id, shaped).await;
        });

        Ok(bulk_id)
    }

    async fn run_bulk(&self, bulk_id: Uuid, batches: Vec<Vec<i64>>) {
        let Ok(Some(mut record)) = self.persistence.get_bulk(bulk_id).await else {
            error!("run_bulk: bulk {} vanished before it could start", bulk_id);
            return;
        };
        record.state = BulkState::Running;
        let _ = self.persistence.update_bulk(&record).await;

        let mut completed = 0u32;
        let mut failed = 0u32;
        let mut aborted = false;
        let mut cancelled = false;

        for batch in batches {
            if aborted {
                break;
            }
            if let Ok(Some(live)) = self.persistence.get_bulk(bulk_id).await {
                if live.cancel_requested {
                    cancelled = true;
                    break;
                }
            }

            let max_concurrency = record.max_concurrency.max(1);
            let outcomes: Vec<Result<bool>> = stream::iter(batch.iter().copied().collect::<Vec<i64>>())
                .map(|container_id| {
                    let this = self.clone();
                    async move { this.run_bulk_child(bulk_id, container_id).await }
                })
            .buffer_unordered(max_concurrency)
            .collect()
            .await;

            for outcome in outcomes {
                match outcome {
                    Ok(true) => completed += 1,
                    Ok(false) => {
                        failed += 1;
                        if !record.continue_on_error {
                            aborted = true;
                        }
                    }
                    Err(e) => {
                        warn!("bulk {} child failed to admit: {}", bulk_id, e);
                        failed += 1;
                        if !record.continue_on_error {
                            aborted = true;
                        }
                    }
                }
            }
        }

        let total = record.targets.len() as u32;
        record.progress = BulkProgress {
            completed,
            failed,
            pending: total.saturating_sub(completed + failed),
        };
        record.state = if cancelled {
            BulkState::Cancelled
        } else if aborted {
            BulkState::Failed
        } else if failed == 0 {
            BulkState::Succeeded
        } else {
            BulkState::CompletedWithErrors
        };
        let _ = self.persistence.update_bulk(&record).await;

        if aborted || cancelled {
            self.cancel_bulk_children(bulk_id).await;
        }
    }

    async fn cancel_bulk_children(&self, bulk_id: Uuid) {
        let filter = JobFilter {
            parent_bulk_id: Some(bulk_id),
            non_terminal_only: true,
            ..Default::default()
        };
        if let Ok(children) = self.persistence.list_jobs(filter, Page::default()).await {
            for mut child in children {
                child.cancel_requested = true;
                let _ = self.persistence.update_job(&child).await;
            }
        }
    }

    /// Admits one bulk child and blocks until its job reaches a terminal
    /// state, so the bulk loop's own batch-level concurrency is authoritative
    /// (the job itself still runs through the shared worker pool).
    async fn run_bulk_child(&self, bulk_id: Uuid, container_id: i64) -> Result<bool> {
        let container = self
            .persistence
            .get_container(container_id)
            .await?
            .ok_or_else(|| EngineError::new(ErrorKind::NotFound, "container not found"))?;
        let from_digest = container.current_digest.clone().unwrap_or_default();
        let resolved = self.registry.resolve(&container.image_ref).await?;

        let job_id = self
            .admit(
                container_id,
                from_digest,
                resolved.digest,
                container.update_policy.strategy,
                container.update_policy.max_retries,
                TriggerSource::Bulk,
                Some(bulk_id),
            )
            .await?;

        let finished = self.await_job_terminal(job_id).await?;
        Ok(finished.state == JobState::Succeeded)
    }

    async fn await_job_terminal(&self, job_id: Uuid) -> Result<UpdateJob> {
        let mut sub = self.bus.subscribe(TopicFilter::Exact(format!("job.{}", job_id)), 32);
        loop {
            if let Some(job) = self.persistence.get_job(job_id).await? {
                if job.state.is_terminal() {
                    self.bus.unsubscribe(sub.id);
                    return Ok(job);
                }
            }
            tokio::select! {
                event = sub.receiver.recv() => {
                    match event {
                        Some(e) if matches!(e.payload, EventPayload::JobTerminal { .. }) => continue,
                        Some(_) => continue,
                        None => tokio::time::sleep(Duration::from_millis(500)).await,
                    }
                }
                _ = tokio::time::sleep(Duration::from_secs(5)) => continue,
            }
        }
    }

    // -- retries --

    async fn handle_terminal(&self, job: &UpdateJob) {
        if !matches!(job.state, JobState::Failed | JobState::RolledBack) {
            return;
        }
        let Some(kind) = job.error_kind else { return };
        if !kind.retryable() {
            return;
        }
        let Ok(Some(container)) = self.persistence.get_container(job.container_id).await else {
            return;
        };
        match retry::enqueue_retry(&self.persistence, job, &container.update_policy).await {
            Ok(Some(next)) => info!("job {} retrying as {} (attempt {})", job.id, next.id, next.attempt),
            Ok(None) => info!("job {} exhausted its retry budget", job.id),
            Err(e) => error!("failed to enqueue retry for job {}: {}", job.id, e),
        }
    }

    // -- worker pool --

    /// Spawns the configured number of executor workers plus the cron and
    /// orphan-recovery loops. Workers claim from the shared ready queue
    /// (`Gateway::claim_next_update_job`) so bulk- and watcher-originated
    /// jobs share the same pool as manual ones.
    pub fn spawn(self: &Arc<Self>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        {
            let this = self.clone();
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                this.recover_orphans().await;
            }));
        }

        for _ in 0..self.config.executor_workers.max(1) {
            let this = self.clone();
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                this.worker_loop(shutdown).await;
            }));
        }

        {
            let this = self.clone();
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                this.cron_loop(shutdown).await;
            }));
        }

        handles
    }

    async fn recover_orphans(&self) {
        let jobs = match self.persistence.recover_orphan_jobs(Utc::now()).await {
            Ok(j) => j,
            Err(e) => {
                error!("recover_orphan_jobs failed: {}", e);
                return;
            }
        };
        for mut job in jobs {
            warn!("re-queuing orphaned job {} (was in {:?})", job.id, job.state);
            job.state = JobState::Queued;
            job.lease_owner = None;
            job.lease_deadline = None;
            if let Err(e) = self.persistence.update_job(&job).await {
                error!("failed to re-queue orphaned job {}: {}", job.id, e);
            }
        }
    }

    async fn worker_loop(&self, shutdown: CancellationToken) {
        loop {
            if shutdown.is_cancelled() {
                return;
            }
            let lease_deadline = Utc::now() + chrono::Duration::seconds(self.config.lease_ttl_sec);
            let claimed = self.persistence.claim_next_update_job(&self.engine_id, lease_deadline).await;
            let job = match claimed {
                Ok(Some(job)) => job,
                Ok(None) => {
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = tokio::time::sleep(self.config.claim_poll_interval) => continue,
                    }
                }
                Err(e) => {
                    error!("claim_next_update_job failed: {}", e);
                    tokio::time::sleep(self.config.claim_poll_interval).await;
                    continue;
                }
            };

            let ctx = CancellationToken::new();
            match self.executor.execute(job, ctx).await {
                Ok(finished) => self.handle_terminal(&finished).await,
                Err(e) if e.kind() == ErrorKind::ContainerBusy => {
                    warn!("executor rejected job: {}", e);
                }
                Err(e) => {
                    error!("executor.execute returned an unexpected error: {}", e);
                }
            }
        }
    }

    // -- cron --

    async fn cron_loop(&self, shutdown: CancellationToken) {
        let mut next_fire: HashMap<i64, DateTime<Utc>> = HashMap::new();
        let mut ticker = interval(self.config.cron_poll_interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => {
                    self.cron_tick(&mut next_fire).await;
                }
            }
        }
    }

    async fn cron_tick(&self, next_fire: &mut HashMap<i64, DateTime<Utc>>) {
        let containers = match self.persistence.list_containers().await {
            Ok(c) => c,
            Err(e) => {
                error!("cron_tick: failed to list containers: {}", e);
                return;
            }
        };
        let now = Utc::now();
        let live_ids: std::collections::HashSet<i64> = containers.iter().map(|c| c.id).collect();
        next_fire.retain(|id, _| live_ids.contains(id));

        for container in &containers {
            if container.update_policy.mode != PolicyMode::Scheduled {
                next_fire.remove(&container.id);
                continue;
            }
            let Some(expr) = container.update_policy.cron_expression.clone() else {
                continue;
            };

            let due = match next_fire.get(&container.id) {
                Some(t) => *t,
                None => {
                    // First observation of this schedule: arm it without
                    // firing, so engine restarts don't immediately re-fire
                    // every scheduled container.
                    if let Ok(t) = cron::next_fire_after(&expr, container.update_policy.timezone.as_deref(), now) {
                        next_fire.insert(container.id, t);
                    }
                    continue;
                }
            };

            if now < due {
                continue;
            }

            self.fire_cron(container).await;
            // Coalesces any number of missed fires into this single one:
            // the next arm point is computed from `now`, not from `due`.
            match cron::next_fire_after(&expr, container.update_policy.timezone.as_deref(), now) {
                Ok(t) => {
                    next_fire.insert(container.id, t);
                }
                Err(e) => {
                    warn!("cron expression for container {} became invalid: {}", container.id, e);
                    next_fire.remove(&container.id);
                }
            }
        }
    }

    async fn fire_cron(&self, container: &ManagedContainer) {
        let from_digest = container.current_digest.clone().unwrap_or_default();
        let to_digest = match self.registry.resolve(&container.image_ref).await {
            Ok(r) => r.digest,
            Err(e) => {
                warn!("cron fire for container {} could not resolve registry: {}", container.id, e);
                return;
            }
        };
        if to_digest == from_digest {
            return;
        }

        let outcome = self
            .admit(
                container.id,
                from_digest,
                to_digest,
                container.update_policy.strategy,
                container.update_policy.max_retries,
                TriggerSource::Cron,
                None,
            )
            .await;

        let audit = match &outcome {
            Ok(_) => AuditRecord::system(container.id.to_string(), "cron_fire", AuditOutcome::Ok),
            Err(e) if e.kind() == ErrorKind::Conflict => {
                AuditRecord::system(container.id.to_string(), "cron_fire", AuditOutcome::Skipped)
                    .with_details(serde_json::json!({ "reason": "conflict" }))
            }
            Err(e) => {
                warn!("cron fire for container {} failed: {}", container.id, e);
                AuditRecord::system(container.id.to_string(), "cron_fire", AuditOutcome::Error)
                    .with_details(serde_json::json!({ "error_kind": e.kind() }))
            }
        };
        if let Err(e) = self.persistence.insert_audit(&audit).await {
            error!("failed to persist cron_fire audit record: {}", e);
        }
    }
}

#[async_trait]
impl AutoEnqueuer for Scheduler {
    async fn enqueue_automatic(
        &self,
        container_id: i64,
        from_digest: String,
        to_digest: String,
        strategy: UpdateStrategy,
    ) -> Result<()> {
        let max_retries = self
            .persistence
            .get_container(container_id)
            .await?
            .map(|c| c.update_policy.max_retries)
            .unwrap_or(3);
        self.admit(container_id, from_digest, to_digest, strategy, max_retries, TriggerSource::Auto, None)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::model::{ContainerStatus, DesiredConfig, ImageRef, UpdatePolicy};
    use crate::persistence::SqliteGateway;
    use crate::runtime::RuntimeAdapter;

    fn sample_container(name: &str) -> ManagedContainer {
        ManagedContainer {
            id: 0,
            name: name.to_string(),
            image_ref: ImageRef::new("docker.io", "library/nginx").with_tag("1.24"),
            runtime_id: Some("rt".into()),
            current_digest: Some("sha256:old".into()),
            desired_config: DesiredConfig::default(),
            update_policy: UpdatePolicy::default(),
            status: ContainerStatus::Running,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    struct NoopRuntime;
    #[async_trait]
    impl RuntimeAdapter for NoopRuntime {
        async fn inspect(&self, id: &str, _ctx: CancellationToken) -> Result<crate::runtime::InspectInfo> {
            Ok(crate::runtime::InspectInfo {
                runtime_id: id.to_string(),
                name: id.to_string(),
                image_digest: None,
                running: true,
                started_at: None,
                exit_code: None,
                oom_killed: false,
            })
        }
        async fn list(&self, _filter: crate::runtime::ListFilter, _ctx: CancellationToken) -> Result<Vec<crate::runtime::InspectInfo>> {
            Ok(vec![])
        }
        async fn pull(&self, _image: &str, _ctx: CancellationToken, _on_progress: Option<crate::runtime::PullProgressCallback>) -> Result<()> {
            Ok(())
        }
        async fn create(&self, spec: crate::runtime::CreateSpec, _ctx: CancellationToken) -> Result<String> {
            Ok(spec.name)
        }
        async fn start(&self, _id: &str, _ctx: CancellationToken) -> Result<()> {
            Ok(())
        }
        async fn stop(&self, _id: &str, _grace_sec: u64, _ctx: CancellationToken) -> Result<()> {
            Ok(())
        }
        async fn rename(&self, _id: &str, _new_name: &str, _ctx: CancellationToken) -> Result<()> {
            Ok(())
        }
        async fn remove(&self, _id: &str, _force: bool, _ctx: CancellationToken) -> Result<()> {
            Ok(())
        }
        async fn exec(&self, _id: &str, _cmd: Vec<String>, _ctx: CancellationToken) -> Result<i64> {
            Ok(0)
        }
        async fn logs(&self, _id: &str, _tail_lines: usize, _ctx: CancellationToken) -> Result<Vec<String>> {
            Ok(vec![])
        }
        async fn stats(&self, _id: &str, _ctx: CancellationToken) -> Result<crate::runtime::StatsSnapshot> {
            Ok(crate::runtime::StatsSnapshot::default())
        }
    }

    fn test_scheduler() -> (Scheduler, Arc<dyn Gateway>) {
        let persistence: Arc<dyn Gateway> = Arc::new(SqliteGateway::open_in_memory().unwrap());
        let bus = EventBus::new();
        let registry = Arc::new(RegistryClient::new(60));
        let executor = Arc::new(Executor::new(Arc::new(NoopRuntime), registry.clone(), persistence.clone(), bus.clone()));
        let scheduler = Scheduler::new(persistence.clone(), executor, registry, bus, "engine-test".into(), SchedulerConfig::default());
        (scheduler, persistence)
    }

    #[tokio::test]
    async fn second_request_for_same_digest_merges() {
        let (scheduler, persistence) = test_scheduler();
        let container_id = persistence.insert_container(&sample_container("web")).await.unwrap();

        let job_id_1 = scheduler
            .admit(container_id, "sha256:old".into(), "sha256:new".into(), UpdateStrategy::Recreate, 3, TriggerSource::Manual, None)
            .await
            .unwrap();
        let job_id_2 = scheduler
            .admit(container_id, "sha256:old".into(), "sha256:new".into(), UpdateStrategy::Recreate, 3, TriggerSource::Manual, None)
            .await
            .unwrap();
        assert_eq!(job_id_1, job_id_2);
    }

    #[tokio::test]
    async fn conflicting_digest_is_rejected() {
        let (scheduler, persistence) = test_scheduler();
        let container_id = persistence.insert_container(&sample_container("web")).await.unwrap();

        scheduler
            .admit(container_id, "sha256:old".into(), "sha256:new".into(), UpdateStrategy::Recreate, 3, TriggerSource::Manual, None)
            .await
            .unwrap();
        let err = scheduler
            .admit(container_id, "sha256:old".into(), "sha256:other".into(), UpdateStrategy::Recreate, 3, TriggerSource::Manual, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn bulk_update_rejects_empty_targets() {
        let (scheduler, _persistence) = test_scheduler();
        let err = scheduler
            .bulk_update(vec![], BulkStrategy::Parallel, 2, true, true)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EmptyTargets);
    }
}
