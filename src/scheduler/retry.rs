//! Retry enqueueing (spec §4.5 "Retries"): a retryable terminal failure gets
//! a follow-up job at `attempt + 1`, delayed by the policy's backoff table.

use std::sync::Arc;

use chrono::Duration as ChronoDuration;

use crate::error::Result;
use crate::model::{TriggerSource, UpdateJob, UpdatePolicy};
use crate::persistence::Gateway;

/// Builds and persists the follow-up job for a retryable failure, or
/// returns `None` if the policy's retry budget is exhausted.
pub async fn enqueue_retry(
    persistence: &Arc<dyn Gateway>,
    failed: &UpdateJob,
    policy: &UpdatePolicy,
) -> Result<Option<UpdateJob>> {
    if !failed.can_retry() {
        return Ok(None);
    }

    let delay_sec = policy.backoff_for_attempt(failed.attempt);
    let mut next = UpdateJob::new(
        failed.container_id,
        failed.from_digest.clone(),
        failed.to_digest.clone(),
        failed.strategy,
        failed.max_retries,
        TriggerSource::Auto,
        failed.parent_bulk_id,
    );
    next.attempt = failed.attempt + 1;
    next.scheduled_at = chrono::Utc::now() + ChronoDuration::seconds(delay_sec as i64);

    persistence.insert_job(&next).await?;
    Ok(Some(next))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::UpdateStrategy;

    #[test]
    fn backoff_grows_with_attempt_and_clamps() {
        let policy = UpdatePolicy { retry_backoff_sec: vec![30, 60, 120], ..Default::default() };
        assert_eq!(policy.backoff_for_attempt(1), 30);
        assert_eq!(policy.backoff_for_attempt(2), 60);
        assert_eq!(policy.backoff_for_attempt(3), 120);
        assert_eq!(policy.backoff_for_attempt(10), 120);
    }

    #[tokio::test]
    async fn exhausted_retries_yield_nothing() {
        let gw: Arc<dyn Gateway> = Arc::new(crate::persistence::SqliteGateway::open_in_memory().unwrap());
        let mut job = UpdateJob::new(
            1,
            "sha256:a".into(),
            "sha256:b".into(),
            UpdateStrategy::Recreate,
            2,
            TriggerSource::Auto,
            None,
        );
        job.attempt = 2;
        let policy = UpdatePolicy::default();
        let next = enqueue_retry(&gw, &job, &policy).await.unwrap();
        assert!(next.is_none());
    }
}
