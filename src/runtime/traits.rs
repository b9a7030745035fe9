//! Container Runtime Adapter (C2): a thin, cancellable capability layer over
//! the container daemon. All calls are context-cancellable and fail with a
//! kind drawn from `ErrorKind`.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::model::DesiredConfig;

/// Observed state of a runtime-level container instance.
#[derive(Debug, Clone)]
pub struct InspectInfo {
    pub runtime_id: String,
    pub name: String,
    pub image_digest: Option<String>,
    pub running: bool,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub exit_code: Option<i64>,
    pub oom_killed: bool,
}

/// Resource usage snapshot, `stats(id)`.
#[derive(Debug, Clone, Default)]
pub struct StatsSnapshot {
    pub memory_bytes: u64,
    pub memory_limit_bytes: u64,
    pub cpu_percent: f64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// A spec to hand to `create`, produced from `ManagedContainer::desired_config`.
#[derive(Debug, Clone)]
pub struct CreateSpec {
    pub name: String,
    pub image: String,
    pub config: DesiredConfig,
}

/// Filter for `list`.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub name_prefix: Option<String>,
    pub label: Option<(String, String)>,
}

/// Progress update forwarded by `pull`, consumed by the executor to publish
/// throttled `job.pull_progress` events.
#[derive(Debug, Clone)]
pub struct PullProgress {
    pub bytes_done: u64,
    pub bytes_total: u64,
}

pub type PullProgressCallback = Box<dyn Fn(PullProgress) + Send + Sync>;

/// Capability set exposed by a container daemon. `bollard`-backed in
/// production; fakeable in tests.
#[async_trait]
pub trait RuntimeAdapter: Send + Sync {
    async fn inspect(&self, id: &str, ctx: CancellationToken) -> Result<InspectInfo>;

    async fn list(&self, filter: ListFilter, ctx: CancellationToken) -> Result<Vec<InspectInfo>>;

    async fn pull(
        &self,
        image: &str,
        ctx: CancellationToken,
        on_progress: Option<PullProgressCallback>,
    ) -> Result<()>;

    async fn create(&self, spec: CreateSpec, ctx: CancellationToken) -> Result<String>;

    async fn start(&self, id: &str, ctx: CancellationToken) -> Result<()>;

    async fn stop(&self, id: &str, grace_sec: u64, ctx: CancellationToken) -> Result<()>;

    async fn rename(&self, id: &str, new_name: &str, ctx: CancellationToken) -> Result<()>;

    async fn remove(&self, id: &str, force: bool, ctx: CancellationToken) -> Result<()>;

    async fn exec(&self, id: &str, cmd: Vec<String>, ctx: CancellationToken) -> Result<i64>;

    async fn logs(&self, id: &str, tail_lines: usize, ctx: CancellationToken) -> Result<Vec<String>>;

    async fn stats(&self, id: &str, ctx: CancellationToken) -> Result<StatsSnapshot>;
}
