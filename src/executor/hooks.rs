//! Pre/post-update hooks (spec §4.4 "Pre/post hooks").

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{EngineError, ErrorKind, Result};
use crate::runtime::RuntimeAdapter;

const DEFAULT_HOOK_TIMEOUT_SEC: u64 = 60;

/// Runs `command` inside `runtime_id` with a timeout, racing the supplied
/// cancellation token. Returns the exit code, or `Timeout`/`Cancelled`.
pub async fn run_hook(
    adapter: &dyn RuntimeAdapter,
    runtime_id: &str,
    command: &[String],
    timeout_sec: Option<u64>,
    ctx: CancellationToken,
) -> Result<i64> {
    if command.is_empty() {
        return Ok(0);
    }
    let timeout = Duration::from_secs(timeout_sec.unwrap_or(DEFAULT_HOOK_TIMEOUT_SEC));

    tokio::select! {
        result = tokio::time::timeout(timeout, adapter.exec(runtime_id, command.to_vec(), ctx.clone())) => {
            match result {
                Ok(inner) => inner,
                Err(_) => {
                    warn!("hook on {} timed out after {:?}", runtime_id, timeout);
                    Err(EngineError::new(ErrorKind::Timeout, "hook execution timed out"))
                }
            }
        }
        _ = ctx.cancelled() => Err(EngineError::new(ErrorKind::Cancelled, "hook cancelled")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{CreateSpec, InspectInfo, ListFilter, PullProgressCallback, StatsSnapshot};
    use async_trait::async_trait;

    struct NoopRuntime;
    #[async_trait]
    impl RuntimeAdapter for NoopRuntime {
        async fn inspect(&self, id: &str, _ctx: CancellationToken) -> Result<InspectInfo> {
            Ok(InspectInfo {
                runtime_id: id.to_string(),
                name: id.to_string(),
                image_digest: None,
                running: true,
                started_at: None,
                exit_code: None,
                oom_killed: false,
            })
        }
        async fn list(&self, _filter: ListFilter, _ctx: CancellationToken) -> Result<Vec<InspectInfo>> {
            Ok(vec![])
        }
        async fn pull(&self, _image: &str, _ctx: CancellationToken, _on_progress: Option<PullProgressCallback>) -> Result<()> {
            Ok(())
        }
        async fn create(&self, spec: CreateSpec, _ctx: CancellationToken) -> Result<String> {
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
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(1)
        }
        async fn logs(&self, _id: &str, _tail_lines: usize, _ctx: CancellationToken) -> Result<Vec<String>> {
            Ok(vec![])
        }
        async fn stats(&self, _id: &str, _ctx: CancellationToken) -> Result<StatsSnapshot> {
            Ok(StatsSnapshot::default())
        }
    }

    #[tokio::test]
    async fn empty_command_is_a_no_op_success() {
        let adapter = NoopRuntime;
        let exit_code = run_hook(&adapter, "c1", &[], None, CancellationToken::new()).await.unwrap();
        assert_eq!(exit_code, 0);
    }

    #[tokio::test]
    async fn non_empty_command_returns_adapters_exit_code() {
        let adapter = NoopRuntime;
        let exit_code = run_hook(&adapter, "c1", &["true".to_string()], None, CancellationToken::new()).await.unwrap();
        assert_eq!(exit_code, 1);
    }

    #[tokio::test]
    async fn already_cancelled_token_is_honored() {
        let adapter = NoopRuntime;
        let ctx = CancellationToken::new();
        ctx.cancel();
        let err = run_hook(&adapter, "c1", &["true".to_string()], Some(5), ctx).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
    }
}
