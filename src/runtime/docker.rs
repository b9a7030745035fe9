//! Bollard-backed `RuntimeAdapter`.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogsOptions, RemoveContainerOptions,
    RenameContainerOptions, StatsOptions, StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, MountTypeEnum, PortBinding};
use bollard::Docker;
use futures_util::stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{EngineError, ErrorKind, Result};
use crate::model::RestartPolicy as EngineRestartPolicy;
use crate::runtime::traits::{
    CreateSpec, InspectInfo, ListFilter, PullProgress, PullProgressCallback, RuntimeAdapter,
    StatsSnapshot,
};

pub struct DockerRuntimeAdapter {
    client: Docker,
}

impl DockerRuntimeAdapter {
    pub fn connect_local() -> Result<Self> {
        let client = Docker::connect_with_local_defaults()
            .map_err(|e| EngineError::with_source(ErrorKind::RuntimeUnavailable, "cannot reach docker daemon", e))?;
        Ok(Self { client })
    }

    pub fn with_client(client: Docker) -> Self {
        Self { client }
    }

    fn map_bollard_err(e: bollard::errors::Error, id: &str) -> EngineError {
        match &e {
            bollard::errors::Error::DockerResponseServerError { status_code: 404, .. } => {
                EngineError::with_source(ErrorKind::NotFound, format!("container {} not found", id), e)
            }
            bollard::errors::Error::DockerResponseServerError { status_code: 409, .. } => {
                EngineError::with_source(ErrorKind::RuntimeConflict, format!("conflict on container {}", id), e)
            }
            _ => EngineError::with_source(ErrorKind::RuntimeUnavailable, "docker daemon call failed", e),
        }
    }
}

/// Runs a future racing a cancellation token; the future is dropped (not
/// awaited to completion) if cancelled, same semantics as every suspension
/// point in spec §5.
async fn cancellable<T>(
    ctx: CancellationToken,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = ctx.cancelled() => Err(EngineError::new(ErrorKind::Cancelled, "operation cancelled")),
        result = fut => result,
    }
}

#[async_trait]
impl RuntimeAdapter for DockerRuntimeAdapter {
    async fn inspect(&self, id: &str, ctx: CancellationToken) -> Result<InspectInfo> {
        cancellable(ctx, async {
            let info = self
                .client
                .inspect_container(id, None)
                .await
                .map_err(|e| Self::map_bollard_err(e, id))?;

            let state = info.state.unwrap_or_default();
            let started_at = state
                .started_at
                .as_deref()
                .filter(|s| !s.is_empty() && *s != "0001-01-01T00:00:00Z")
                .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&chrono::Utc));

            Ok(InspectInfo {
                runtime_id: info.id.unwrap_or_default(),
                name: info.name.unwrap_or_default().trim_start_matches('/').to_string(),
                image_digest: info.image,
                running: state.running.unwrap_or(false),
                started_at,
                exit_code: state.exit_code,
                oom_killed: state.oom_killed.unwrap_or(false),
            })
        })
        .await
    }

    async fn list(&self, filter: ListFilter, ctx: CancellationToken) -> Result<Vec<InspectInfo>> {
        cancellable(ctx.clone(), async {
            let mut filters: HashMap<String, Vec<String>> = HashMap::new();
            if let Some((k, v)) = &filter.label {
                filters.insert("label".into(), vec![format!("{}={}", k, v)]);
            }
            if let Some(prefix) = &filter.name_prefix {
                filters.insert("name".into(), vec![prefix.clone()]);
            }

            let options = Some(ListContainersOptions::<String> {
                all: true,
                filters: filters.into_iter().map(|(k, v)| (k, v)).collect(),
                ..Default::default()
            });

            let containers = self
                .client
                .list_containers(options)
                .await
                .map_err(|e| EngineError::with_source(ErrorKind::RuntimeUnavailable, "list failed", e))?;

            let mut result = Vec::with_capacity(containers.len());
            for c in containers {
                let id = c.id.clone().unwrap_or_default();
                result.push(self.inspect(&id, ctx.clone()).await?);
            }
            Ok(result)
        })
        .await
    }

    async fn pull(
        &self,
        image: &str,
        ctx: CancellationToken,
        on_progress: Option<PullProgressCallback>,
    ) -> Result<()> {
        cancellable(ctx, async {
            let options = Some(CreateImageOptions {
                from_image: image,
                ..Default::default()
            });

            let mut stream = self.client.create_image(options, None, None);
            let mut bytes_done = 0u64;
            let mut bytes_total = 0u64;

            while let Some(item) = stream.next().await {
                match item {
                    Ok(info) => {
                        if let Some(detail) = &info.progress_detail {
                            bytes_done += detail.current.unwrap_or(0) as u64;
                            bytes_total = bytes_total.max(detail.total.unwrap_or(0) as u64);
                        }
                        if let Some(cb) = &on_progress {
                            cb(PullProgress { bytes_done, bytes_total });
                        }
                        if let Some(status) = info.status {
                            debug!("pull {}: {}", image, status);
                        }
                    }
                    Err(e) => {
                        return Err(match &e {
                            bollard::errors::Error::DockerResponseServerError { status_code: 404, .. } => {
                                EngineError::with_source(ErrorKind::ImageNotFound, "image not found", e)
                            }
                            _ => EngineError::with_source(ErrorKind::RegistryUnavailable, "pull failed", e),
                        });
                    }
                }
            }

            Ok(())
        })
        .await
    }

    async fn create(&self, spec: CreateSpec, ctx: CancellationToken) -> Result<String> {
        cancellable(ctx, async {
            let port_bindings: HashMap<String, Option<Vec<PortBinding>>> = spec
                .config
                .ports
                .iter()
                .map(|p| {
                    let key = format!("{}/{}", p.container_port, p.protocol);
                    let binding = PortBinding {
                        host_ip: p.host_ip.clone(),
                        host_port: p.host_port.map(|hp| hp.to_string()),
                    };
                    (key, Some(vec![binding]))
                })
                .collect();

            let exposed_ports: HashMap<String, HashMap<(), ()>> = spec
                .config
                .ports
                .iter()
                .map(|p| (format!("{}/{}", p.container_port, p.protocol), HashMap::new()))
                .collect();

            let mounts = spec
                .config
                .mounts
                .iter()
                .map(|m| bollard::models::Mount {
                    source: Some(m.source.clone()),
                    target: Some(m.target.clone()),
                    typ: Some(if m.is_volume { MountTypeEnum::VOLUME } else { MountTypeEnum::BIND }),
                    read_only: Some(m.read_only),
                    ..Default::default()
                })
                .collect::<Vec<_>>();

            let restart_policy_name = match spec.config.restart_policy {
                EngineRestartPolicy::No => bollard::models::RestartPolicyNameEnum::NO,
                EngineRestartPolicy::Always => bollard::models::RestartPolicyNameEnum::ALWAYS,
                EngineRestartPolicy::OnFailure => bollard::models::RestartPolicyNameEnum::ON_FAILURE,
                EngineRestartPolicy::UnlessStopped => bollard::models::RestartPolicyNameEnum::UNLESS_STOPPED,
            };

            let host_config = HostConfig {
                port_bindings: if port_bindings.is_empty() { None } else { Some(port_bindings) },
                mounts: if mounts.is_empty() { None } else { Some(mounts) },
                memory: spec.config.resources.memory_bytes,
                memory_swap: spec.config.resources.memory_swap_bytes,
                cpu_shares: spec.config.resources.cpu_shares,
                nano_cpus: spec.config.resources.nano_cpus,
                network_mode: spec.config.network.clone(),
                restart_policy: Some(bollard::models::RestartPolicy {
                    name: Some(restart_policy_name),
                    maximum_retry_count: None,
                }),
                ..Default::default()
            };

            let env: Vec<String> = spec
                .config
                .env
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();

            let config = Config {
                image: Some(spec.image.clone()),
                env: if env.is_empty() { None } else { Some(env) },
                labels: if spec.config.labels.is_empty() { None } else { Some(spec.config.labels.clone()) },
                exposed_ports: if exposed_ports.is_empty() { None } else { Some(exposed_ports) },
                host_config: Some(host_config),
                ..Default::default()
            };

            let options = CreateContainerOptions {
                name: spec.name.clone(),
                platform: None,
            };

            let response = self
                .client
                .create_container(Some(options), config)
                .await
                .map_err(|e| Self::map_bollard_err(e, &spec.name))?;

            for warning in response.warnings {
                warn!("create_container warning for {}: {}", spec.name, warning);
            }

            Ok(response.id)
        })
        .await
    }

    async fn start(&self, id: &str, ctx: CancellationToken) -> Result<()> {
        cancellable(ctx, async {
            self.client
                .start_container::<String>(id, None)
                .await
                .map_err(|e| Self::map_bollard_err(e, id))
        })
        .await
    }

    async fn stop(&self, id: &str, grace_sec: u64, ctx: CancellationToken) -> Result<()> {
        cancellable(ctx, async {
            let options = Some(StopContainerOptions { t: grace_sec as i64 });
            self.client
                .stop_container(id, options)
                .await
                .map_err(|e| Self::map_bollard_err(e, id))
        })
        .await
    }

    async fn rename(&self, id: &str, new_name: &str, ctx: CancellationToken) -> Result<()> {
        cancellable(ctx, async {
            self.client
                .rename_container(id, RenameContainerOptions { name: new_name })
                .await
                .map_err(|e| Self::map_bollard_err(e, id))
        })
        .await
    }

    async fn remove(&self, id: &str, force: bool, ctx: CancellationToken) -> Result<()> {
        cancellable(ctx, async {
            let options = Some(RemoveContainerOptions { force, ..Default::default() });
            self.client
                .remove_container(id, options)
                .await
                .map_err(|e| Self::map_bollard_err(e, id))
        })
        .await
    }

    async fn exec(&self, id: &str, cmd: Vec<String>, ctx: CancellationToken) -> Result<i64> {
        cancellable(ctx, async {
            let exec = self
                .client
                .create_exec(
                    id,
                    CreateExecOptions {
                        cmd: Some(cmd),
                        attach_stdout: Some(true),
                        attach_stderr: Some(true),
                        ..Default::default()
                    },
                )
                .await
                .map_err(|e| Self::map_bollard_err(e, id))?;

            if let StartExecResults::Attached { mut output, .. } =
                self.client.start_exec(&exec.id, None).await.map_err(|e| Self::map_bollard_err(e, id))?
            {
                while output.next().await.is_some() {}
            }

            let inspect = self
                .client
                .inspect_exec(&exec.id)
                .await
                .map_err(|e| Self::map_bollard_err(e, id))?;

            Ok(inspect.exit_code.unwrap_or(-1))
        })
        .await
    }

    async fn logs(&self, id: &str, tail_lines: usize, ctx: CancellationToken) -> Result<Vec<String>> {
        cancellable(ctx, async {
            let options = Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                tail: tail_lines.to_string(),
                ..Default::default()
            });

            let mut stream = self.client.logs(id, options);
            let mut lines = Vec::new();
            while let Some(item) = stream.next().await {
                match item {
                    Ok(output) => {
                        let line = output.to_string();
                        if !line.is_empty() {
                            lines.push(line);
                        }
                    }
                    Err(e) => return Err(Self::map_bollard_err(e, id)),
                }
            }
            Ok(lines)
        })
        .await
    }

    async fn stats(&self, id: &str, ctx: CancellationToken) -> Result<StatsSnapshot> {
        cancellable(ctx, async {
            let options = Some(StatsOptions { stream: false, one_shot: true });
            let mut stream = self.client.stats(id, options);

            let Some(item) = stream.next().await else {
                return Err(EngineError::new(ErrorKind::RuntimeUnavailable, "no stats returned"));
            };
            let stats = item.map_err(|e| Self::map_bollard_err(e, id))?;

            let memory_bytes = stats.memory_stats.usage.unwrap_or(0);
            let memory_limit_bytes = stats.memory_stats.limit.unwrap_or(0);

            let cpu_delta = stats.cpu_stats.cpu_usage.total_usage as i64
                - stats.precpu_stats.cpu_usage.total_usage as i64;
            let system_delta = stats.cpu_stats.system_cpu_usage.unwrap_or(0) as i64
                - stats.precpu_stats.system_cpu_usage.unwrap_or(0) as i64;
            let cpu_percent = if system_delta > 0 && cpu_delta > 0 {
                let cores = stats
                    .cpu_stats
                    .cpu_usage
                    .percpu_usage
                    .map(|v| v.len())
                    .unwrap_or(1)
                    .max(1) as f64;
                (cpu_delta as f64 / system_delta as f64) * cores * 100.0
            } else {
                0.0
            };

            let (rx_bytes, tx_bytes) = stats
                .networks
                .unwrap_or_default()
                .values()
                .fold((0u64, 0u64), |(rx, tx), n| (rx + n.rx_bytes, tx + n.tx_bytes));

            Ok(StatsSnapshot {
                memory_bytes,
                memory_limit_bytes,
                cpu_percent,
                rx_bytes,
                tx_bytes,
            })
        })
        .await
    }
}

/// Runs a health-check command inside a container and returns whether it
/// succeeded. Used by the executor's `health_check` step.
pub async fn run_health_check(
    adapter: &dyn RuntimeAdapter,
    runtime_id: &str,
    command: &[String],
    ctx: CancellationToken,
) -> Result<bool> {
    if command.is_empty() {
        return Ok(true);
    }
    let exit_code = adapter.exec(runtime_id, command.to_vec(), ctx).await?;
    info!("health check on {} exited with {}", runtime_id, exit_code);
    Ok(exit_code == 0)
}
