//! Engine facade: the programmatic API table from spec §6, and the
//! supervisor that wires the Registry Client, Runtime Adapter, Watcher,
//! Executor, Scheduler, Event Bus, and Persistence Gateway together.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Configuration;
use crate::error::{EngineError, ErrorKind, Result};
use crate::events::{EventBus, Subscription, TopicFilter};
use crate::executor::Executor;
use crate::model::{
    AvailableUpdate, BulkStrategy, ManagedContainer, UpdateJob, UpdatePolicy,
};
use crate::persistence::{AvailableUpdateFilter, Gateway, JobFilter, Page};
use crate::registry::RegistryClient;
use crate::runtime::{DockerRuntimeAdapter, RuntimeAdapter};
use crate::scheduler::{Scheduler, SchedulerConfig};
use crate::watcher::{AutoEnqueuer, Watcher, WatcherConfig};

/// The assembled engine: every component plus the background tasks keeping
/// them running. Constructed once per process via `Engine::bootstrap`.
pub struct Engine {
    persistence: Arc<dyn Gateway>,
    registry: Arc<RegistryClient>,
    bus: EventBus,
    scheduler: Arc<Scheduler>,
    shutdown: CancellationToken,
    config: Configuration,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Builds every component from `config` and starts the watcher loop,
    /// the executor worker pool, the cron loop, and orphan-job recovery.
    pub fn bootstrap(config: Configuration) -> Result<Arc<Self>> {
        let persistence: Arc<dyn Gateway> = crate::persistence::open_gateway(&config.database_path)?;
        let registry = Arc::new(RegistryClient::new(config.digest_cache_ttl_sec));
        let runtime: Arc<dyn RuntimeAdapter> = Arc::new(DockerRuntimeAdapter::connect_local()?);
        let bus = EventBus::new();

        let executor = Arc::new(Executor::new(runtime, registry.clone(), persistence.clone(), bus.clone()));

        let scheduler_config = SchedulerConfig {
            executor_workers: config.executor_workers,
            ..SchedulerConfig::default()
        };
        let scheduler = Arc::new(Scheduler::new(
            persistence.clone(),
            executor,
            registry.clone(),
            bus.clone(),
            config.engine_id.clone(),
            scheduler_config,
        ));

        let watcher_config = WatcherConfig {
            poll_interval: Duration::from_secs(config.watch_interval_sec),
            registry_concurrency: config.registry_concurrency,
        };
        let watcher = Arc::new(Watcher::new(
            registry.clone(),
            persistence.clone(),
            bus.clone(),
            scheduler.clone() as Arc<dyn AutoEnqueuer>,
            watcher_config,
        ));

        let shutdown = CancellationToken::new();
        let mut tasks = scheduler.spawn(shutdown.clone());
        tasks.push(watcher.spawn(shutdown.clone()));

        Ok(Arc::new(Self {
            persistence,
            registry,
            bus,
            scheduler,
            shutdown,
            config,
            tasks: std::sync::Mutex::new(tasks),
        }))
    }

    /// Fires every cancellation token and waits up to `shutdown_grace_sec`
    /// for tasks to drain (spec §5 "Hard cancel").
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap());
        let grace = Duration::from_secs(self.config.shutdown_grace_sec);
        let drain = futures::future::join_all(tasks);
        if tokio::time::timeout(grace, drain).await.is_err() {
            warn!("shutdown_grace_sec elapsed before every task drained; abandoning the rest");
        } else {
            info!("engine shut down cleanly");
        }
    }

    // -- programmatic API (spec §6) --

    pub async fn register_container(&self, mut container: ManagedContainer) -> Result<i64> {
        if container.update_policy.stop_timeout_sec.is_none() {
            container.update_policy.stop_timeout_sec = Some(self.config.default_stop_timeout_sec);
        }
        container.update_policy.validate().map_err(|msg| EngineError::new(ErrorKind::InvalidConfig, msg))?;
        container.check_invariants().map_err(|msg| EngineError::new(ErrorKind::InvalidConfig, msg))?;
        if self.persistence.get_container_by_name(&container.name).await?.is_some() {
            return Err(EngineError::new(ErrorKind::NameConflict, format!("a container named '{}' is already registered", container.name)));
        }
        self.persistence.insert_container(&container).await
    }

    pub async fn update_policy(&self, container_id: i64, policy: UpdatePolicy) -> Result<()> {
        policy.validate().map_err(|msg| EngineError::new(ErrorKind::InvalidConfig, msg))?;
        if self.persistence.get_container(container_id).await?.is_none() {
            return Err(EngineError::new(ErrorKind::NotFound, "container not found"));
        }
        self.persistence.update_policy(container_id, &policy).await
    }

    pub async fn request_update(&self, container_id: i64, target_digest: Option<String>) -> Result<Uuid> {
        self.scheduler.request_update(container_id, target_digest).await
    }

    pub async fn cancel_job(&self, job_id: Uuid, force: bool) -> Result<()> {
        // `force` is accepted for API-table parity; this engine does not yet
        // draw a behavioral distinction between soft and forced cancel at
        // the facade layer beyond what the executor's cancel-safe-point
        // check already provides.
        let _ = force;
        self.scheduler.cancel_job(job_id).await
    }

    pub async fn bulk_update(
        &self,
        targets: Vec<i64>,
        strategy: BulkStrategy,
        max_concurrency: usize,
        respect_dependencies: bool,
        continue_on_error: bool,
    ) -> Result<Uuid> {
        self.scheduler
            .bulk_update(targets, strategy, max_concurrency, respect_dependencies, continue_on_error)
            .await
    }

    pub async fn list_available_updates(&self, filter: AvailableUpdateFilter, page: Page) -> Result<Vec<AvailableUpdate>> {
        self.persistence.list_available_updates(filter, page).await
    }

    pub async fn list_jobs(&self, filter: JobFilter, page: Page) -> Result<Vec<UpdateJob>> {
        self.persistence.list_jobs(filter, page).await
    }

    pub fn subscribe_events(&self, filter: TopicFilter, queue_capacity: usize) -> Subscription {
        self.bus.subscribe(filter, queue_capacity)
    }

    pub fn registry(&self) -> &Arc<RegistryClient> {
        &self.registry
    }

    pub fn persistence(&self) -> &Arc<dyn Gateway> {
        &self.persistence
    }
}
