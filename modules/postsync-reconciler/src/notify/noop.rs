use async_trait::async_trait;
use uuid::Uuid;

use postsync_common::{AggregateSnapshot, TrackedRecord};

use super::backend::Broadcaster;

/// Broadcaster used when no endpoint is configured.
pub struct NoopBroadcaster;

#[async_trait]
impl Broadcaster for NoopBroadcaster {
    async fn notify_status_changed(&self, _record: &TrackedRecord) -> anyhow::Result<()> {
        Ok(())
    }

    async fn notify_metrics_updated(&self, _record_id: Uuid, _snapshot: &AggregateSnapshot) -> anyhow::Result<()> {
        Ok(())
    }
}
