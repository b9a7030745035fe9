//! `ManagedContainer` and its embedded `UpdatePolicy` value object.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A `(registry, repository, tag)` triple identifying an image without
/// pinning it to a digest. `tag` defaults to `latest`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageRef {
    pub registry: String,
    pub repository: String,
    #[serde(default = "default_tag")]
    pub tag: String,
}

fn default_tag() -> String {
    "latest".to_string()
}

impl ImageRef {
    pub fn new(registry: impl Into<String>, repository: impl Into<String>) -> Self {
        Self {
            registry: registry.into(),
            repository: repository.into(),
            tag: default_tag(),
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }

    /// `registry/repository:tag`, the form passed to the runtime adapter's pull.
    pub fn full_name(&self) -> String {
        format!("{}/{}:{}", self.registry, self.repository, self.tag)
    }
}

/// *How* an update is applied at the container level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateStrategy {
    Recreate,
    Rolling,
    BlueGreen,
    Canary,
}

/// *When/whether* an update is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyMode {
    Disabled,
    ManualApproval,
    Scheduled,
    Automatic,
}

/// Update policy, embedded in `ManagedContainer`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdatePolicy {
    pub mode: PolicyMode,
    pub strategy: UpdateStrategy,
    #[serde(default)]
    pub cron_expression: Option<String>,
    /// IANA timezone the cron expression is evaluated in (e.g.
    /// `"America/New_York"`); the fire time is converted back to UTC before
    /// comparison. `None` means UTC.
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default = "default_health_timeout")]
    pub health_check_timeout_sec: u64,
    #[serde(default = "default_true")]
    pub rollback_on_failure: bool,
    #[serde(default = "default_true")]
    pub backup_previous: bool,
    #[serde(default = "default_retention")]
    pub retention_sec: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_sec: Vec<u64>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Exec'd in the old container before `stopping`; non-zero exit aborts
    /// the update without rollback.
    #[serde(default)]
    pub pre_update_hook: Option<Vec<String>>,
    /// Exec'd in the new container before `committing`; non-zero exit is
    /// treated as a health-check failure.
    #[serde(default)]
    pub post_update_hook: Option<Vec<String>>,
    #[serde(default)]
    pub hook_timeout_sec: Option<u64>,
    #[serde(default)]
    pub stop_timeout_sec: Option<u64>,
}

fn default_health_timeout() -> u64 {
    300
}
fn default_true() -> bool {
    true
}
fn default_retention() -> u64 {
    3600
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_backoff() -> Vec<u64> {
    vec![30, 60, 120]
}

impl UpdatePolicy {
    /// Backoff delay for the given 1-based attempt, clamped to the last
    /// configured entry when `attempt` exceeds the table length.
    pub fn backoff_for_attempt(&self, attempt: u32) -> u64 {
        let idx = (attempt.saturating_sub(1)) as usize;
        self.retry_backoff_sec
            .get(idx)
            .or_else(|| self.retry_backoff_sec.last())
            .copied()
            .unwrap_or(30)
    }

    /// Validates invariants that `register_container`/`update_policy` must
    /// enforce before accepting a policy.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_retries == 0 {
            return Err("max_retries must be >= 1".into());
        }
        if self.mode == PolicyMode::Scheduled && self.cron_expression.is_none() {
            return Err("scheduled mode requires a cron_expression".into());
        }
        if let Some(expr) = &self.cron_expression {
            crate::scheduler::cron::validate_expression(expr).map_err(|e| e.message)?;
        }
        if let Some(tz) = &self.timezone {
            crate::scheduler::cron::validate_timezone(tz).map_err(|e| e.message)?;
        }
        Ok(())
    }
}

impl Default for UpdatePolicy {
    fn default() -> Self {
        Self {
            mode: PolicyMode::Disabled,
            strategy: UpdateStrategy::Recreate,
            cron_expression: None,
            timezone: None,
            health_check_timeout_sec: default_health_timeout(),
            rollback_on_failure: true,
            backup_previous: true,
            retention_sec: default_retention(),
            max_retries: default_max_retries(),
            retry_backoff_sec: default_retry_backoff(),
            dependencies: Vec::new(),
            pre_update_hook: None,
            post_update_hook: None,
            hook_timeout_sec: None,
            stop_timeout_sec: None,
        }
    }
}

/// Lifecycle states of a `ManagedContainer`. Driven solely by the Executor
/// and the Runtime Adapter's observed state — the Watcher never mutates this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerStatus {
    Pending,
    Creating,
    Starting,
    Running,
    Stopping,
    Stopped,
    Updating,
    RollingBack,
    Failed,
    Removed,
}

/// Health-check specification, part of `desired_config`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthCheckSpec {
    pub test: Option<Vec<String>>,
    pub interval_sec: Option<u64>,
    pub timeout_sec: Option<u64>,
    pub retries: Option<u32>,
}

/// A port mapping: container port/protocol to optional host binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortMapping {
    pub container_port: u16,
    pub protocol: String,
    pub host_ip: Option<String>,
    pub host_port: Option<u16>,
}

/// A bind or named-volume mount.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountSpec {
    pub source: String,
    pub target: String,
    pub read_only: bool,
    pub is_volume: bool,
}

/// Restart policy, mirrored 1:1 onto the runtime adapter's capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartPolicy {
    No,
    Always,
    OnFailure,
    UnlessStopped,
}

/// Resource limits, forwarded verbatim into the runtime adapter's create spec.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub memory_bytes: Option<i64>,
    pub memory_swap_bytes: Option<i64>,
    pub cpu_shares: Option<i64>,
    pub nano_cpus: Option<i64>,
}

/// A frozen configuration snapshot for (re)creating a container instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DesiredConfig {
    pub ports: Vec<PortMapping>,
    pub env: HashMap<String, String>,
    pub mounts: Vec<MountSpec>,
    pub restart_policy: RestartPolicy,
    pub resources: ResourceLimits,
    pub health_check: HealthCheckSpec,
    pub labels: HashMap<String, String>,
    pub network: Option<String>,
}

impl Default for DesiredConfig {
    fn default() -> Self {
        Self {
            ports: Vec::new(),
            env: HashMap::new(),
            mounts: Vec::new(),
            restart_policy: RestartPolicy::UnlessStopped,
            resources: ResourceLimits::default(),
            health_check: HealthCheckSpec::default(),
            labels: HashMap::new(),
            network: None,
        }
    }
}

/// A container the engine is responsible for keeping up to date.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagedContainer {
    pub id: i64,
    pub name: String,
    pub image_ref: ImageRef,
    pub runtime_id: Option<String>,
    pub current_digest: Option<String>,
    pub desired_config: DesiredConfig,
    pub update_policy: UpdatePolicy,
    pub status: ContainerStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ManagedContainer {
    /// Enforces the invariant "if status = running then runtime_id is non-null".
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.name.is_empty() || self.name.len() > 253 {
            return Err("name must be 1..=253 characters".into());
        }
        if self.status == ContainerStatus::Running && self.runtime_id.is_none() {
            return Err("running container must have a runtime_id".into());
        }
        Ok(())
    }
}
