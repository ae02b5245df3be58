use async_trait::async_trait;
use uuid::Uuid;

use postsync_common::{AggregateSnapshot, TrackedRecord};

/// Change notifications for downstream listeners. Fire-and-forget: callers
/// log failures and carry on.
#[async_trait]
pub trait Broadcaster: Send + Sync {
    /// A record's status changed on some channel (resolved or failed).
    async fn notify_status_changed(&self, record: &TrackedRecord) -> anyhow::Result<()>;

    /// A record's aggregate metrics were recomputed.
    async fn notify_metrics_updated(&self, record_id: Uuid, snapshot: &AggregateSnapshot) -> anyhow::Result<()>;
}
