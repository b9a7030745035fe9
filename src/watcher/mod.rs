//! Image-Version Watcher (C3).
//!
//! Runs on its own cooperative loop (spec §5: "one watcher loop task,
//! single-threaded, with a bounded worker pool of ≤8 for registry calls").
//! Consults the Registry Client for digests and the Persistence Gateway for
//! the list of managed containers; on divergence it writes an
//! `AvailableUpdate` row and publishes on the Event Bus. In `automatic` mode
//! it also asks its `AutoEnqueuer` collaborator (implemented by the
//! scheduler) to create an `UpdateJob`.

pub mod risk;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::model::{AuditOutcome, AuditRecord, AvailableUpdate, ImageRef, ManagedContainer, PolicyMode, UpdateStrategy};
use crate::persistence::Gateway;
use crate::registry::RegistryClient;
use crate::watcher::risk::derive_risk_level;
use crate::events::EventBus;

/// Implemented by the scheduler so the watcher can hand off automatic-mode
/// divergences without depending on the scheduler's concrete type.
#[async_trait]
pub trait AutoEnqueuer: Send + Sync {
    async fn enqueue_automatic(
        &self,
        container_id: i64,
        from_digest: String,
        to_digest: String,
        strategy: UpdateStrategy,
    ) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub poll_interval: Duration,
    pub registry_concurrency: usize,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(3600),
            registry_concurrency: 8,
        }
    }
}

pub struct Watcher {
    registry: Arc<RegistryClient>,
    persistence: Arc<dyn Gateway>,
    bus: EventBus,
    enqueuer: Arc<dyn AutoEnqueuer>,
    config: WatcherConfig,
}

/// Containers that share `(registry, repository, tag)` are coalesced to a
/// single `resolve` call per tick.
struct Group {
    image_ref: ImageRef,
    members: Vec<ManagedContainer>,
}

impl Watcher {
    pub fn new(
        registry: Arc<RegistryClient>,
        persistence: Arc<dyn Gateway>,
        bus: EventBus,
        enqueuer: Arc<dyn AutoEnqueuer>,
        config: WatcherConfig,
    ) -> Self {
        Self {
            registry,
            persistence,
            bus,
            enqueuer,
            config,
        }
    }

    /// Spawns the cooperative polling loop. Honors `shutdown` at tick
    /// boundaries; an in-flight tick's registry calls are bounded by their
    /// own per-call timeout rather than the loop's cancellation token, since
    /// a half-finished tick is safe to abandon (next tick re-observes).
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.config.poll_interval);
            ticker.tick().await; // first tick fires immediately; consume it, then run once up front
            self.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("watcher loop stopping on shutdown");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.tick().await;
                    }
                }
            }
        })
    }

    /// One pass over all managed containers consulting their registries.
    pub async fn tick(&self) {
        let containers = match self.persistence.list_containers().await {
            Ok(c) => c,
            Err(e) => {
                error!("watcher: failed to list managed containers: {}", e);
                return;
            }
        };

        let groups = coalesce(
            containers
                .into_iter()
                .filter(|c| c.update_policy.mode != PolicyMode::Disabled)
                .collect(),
        );

        stream::iter(groups)
            .for_each_concurrent(self.config.registry_concurrency, |group| async move {
                self.resolve_group(group).await;
            })
            .await;
    }

    async fn resolve_group(&self, group: Group) {
        match self.registry.resolve(&group.image_ref).await {
            Ok(resolved) => {
                for container in &group.members {
                    self.handle_resolved(container, &resolved.digest, resolved.size_bytes, resolved.security_advisory)
                        .await;
                }
            }
            Err(e) => {
                warn!(
                    "watcher: resolve({}) failed: {}",
                    group.image_ref.full_name(),
                    e
                );
                for container in &group.members {
                    let record = AuditRecord::system(
                        container.id.to_string(),
                        "watch",
                        AuditOutcome::Error,
                    )
                    .with_details(serde_json::json!({
                        "source": "watcher",
                        "error_kind": e.kind(),
                        "message": e.message,
                    }));
                    if let Err(persist_err) = self.persistence.insert_audit(&record).await {
                        error!("watcher: failed to persist audit record: {}", persist_err);
                    }
                }
            }
        }
    }

    async fn handle_resolved(
        &self,
        container: &ManagedContainer,
        to_digest: &str,
        to_size_bytes: u64,
        security_advisory: bool,
    ) {
        if container.current_digest.as_deref() == Some(to_digest) {
            return; // registry returns same digest: watcher emits nothing
        }

        let from_digest = container.current_digest.clone().unwrap_or_default();
        let security_patched_label = container
            .desired_config
            .labels
            .get("security.patched")
            .map(|v| v == "true")
            .unwrap_or(false);
        let risk_level = derive_risk_level(&container.image_ref.tag, security_advisory, security_patched_label);
        let security_flag = security_advisory || security_patched_label;

        let update = AvailableUpdate {
            container_id: container.id,
            from_digest: from_digest.clone(),
            to_digest: to_digest.to_string(),
            to_size_bytes,
            published_at: None,
            observed_at: chrono::Utc::now(),
            risk_level,
            security_flag,
            active: true,
        };

        if let Err(e) = self.persistence.upsert_available_update(&update).await {
            error!("watcher: failed to persist available update: {}", e);
            return;
        }

        debug!(
            "watcher: container {} digest diverged {} -> {}",
            container.id, from_digest, to_digest
        );

        self.bus.publish(crate::events::EventPayload::UpdateAvailable {
            container_id: container.id,
            from_digest: from_digest.clone(),
            to_digest: to_digest.to_string(),
            risk_level,
            security_flag,
        });

        if container.update_policy.mode == PolicyMode::Automatic {
            if let Err(e) = self
                .enqueuer
                .enqueue_automatic(
                    container.id,
                    from_digest,
                    to_digest.to_string(),
                    container.update_policy.strategy,
                )
                .await
            {
                warn!(
                    "watcher: automatic enqueue for container {} failed: {}",
                    container.id, e
                );
            }
        }
    }
}

/// Groups containers by `(registry, repository, tag)` so one `resolve` call
/// serves every container pointed at the same image.
fn coalesce(containers: Vec<ManagedContainer>) -> Vec<Group> {
    let mut groups: HashMap<ImageRef, Vec<ManagedContainer>> = HashMap::new();
    for container in containers {
        groups
            .entry(container.image_ref.clone())
            .or_default()
            .push(container);
    }
    groups
        .into_iter()
        .map(|(image_ref, members)| Group { image_ref, members })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ContainerStatus, DesiredConfig, UpdatePolicy};
    use chrono::Utc;

    fn sample(id: i64, registry: &str, repo: &str, tag: &str) -> ManagedContainer {
        ManagedContainer {
            id,
            name: format!("c{}", id),
            image_ref: ImageRef::new(registry, repo).with_tag(tag),
            runtime_id: Some(format!("rt{}", id)),
            current_digest: Some("sha256:old".into()),
            desired_config: DesiredConfig::default(),
            update_policy: UpdatePolicy::default(),
            status: ContainerStatus::Running,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn coalesces_containers_sharing_an_image_ref() {
        let containers = vec![
            sample(1, "docker.io", "library/nginx", "1.24"),
            sample(2, "docker.io", "library/nginx", "1.24"),
            sample(3, "docker.io", "library/redis", "7"),
        ];
        let groups = coalesce(containers);
        assert_eq!(groups.len(), 2);
        let nginx_group = groups
            .iter()
            .find(|g| g.image_ref.repository == "library/nginx")
            .unwrap();
        assert_eq!(nginx_group.members.len(), 2);
    }
}
