// Trait seams for the reconciliation engine.
//
// PlatformClient: the platform side of the join (recent items, items by id, rate limits).
// RecordStore: tracked records and their per-channel state transitions.
//
// Broadcaster lives in notify::backend. All three have in-memory doubles in
// `testing`, so the orchestrator runs without network or disk in tests.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use postsync_common::{AggregateSnapshot, Channel, ExternalItem, MetricSnapshot, TrackedRecord};

use crate::rate_limit::RateLimitState;
use crate::selector::DueQuery;

// ---------------------------------------------------------------------------
// PlatformClient
// ---------------------------------------------------------------------------

#[async_trait]
pub trait PlatformClient: Send + Sync {
    /// Most recently created items on the channel's account, newest first or
    /// in any order; at most `limit`.
    async fn list_recent_items(&self, channel: Channel, limit: u32) -> Result<Vec<ExternalItem>>;

    /// Current state of specific items. Items the platform no longer serves are
    /// simply absent from the result.
    async fn fetch_items(&self, channel: Channel, external_ids: &[String]) -> Result<Vec<ExternalItem>>;

    /// Last known rate-limit state for the channel.
    async fn rate_limit_state(&self, channel: Channel) -> Result<RateLimitState>;
}

// ---------------------------------------------------------------------------
// RecordStore
// ---------------------------------------------------------------------------

/// Reads return point-in-time copies. Writes are idempotent upserts; a write
/// whose lifecycle precondition no longer holds returns `Ok(None)`.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Resolved records on `channel` admitted by `query`.
    async fn find_due_for_refresh(&self, channel: Channel, query: &DueQuery) -> Result<Vec<TrackedRecord>>;

    /// In-flight records on `channel` with no external id whose trigger or
    /// schedule time lies in `[start, end]`. Insertion order is preserved.
    async fn find_unresolved_in_window(
        &self,
        channel: Channel,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TrackedRecord>>;

    /// In-flight records on `channel` with no external id triggered before `cutoff`.
    async fn find_stale_in_flight(&self, channel: Channel, cutoff: DateTime<Utc>) -> Result<Vec<TrackedRecord>>;

    /// The record already resolved to `external_id` on `channel`, if any.
    async fn find_by_external_id(&self, channel: Channel, external_id: &str) -> Result<Option<TrackedRecord>>;

    /// `in_flight → resolved`. `None` if the record is no longer awaiting a
    /// match or another record already owns `external_id`.
    async fn apply_match(
        &self,
        record_id: Uuid,
        channel: Channel,
        external_id: &str,
        posted_at: DateTime<Utc>,
        metrics: &MetricSnapshot,
    ) -> Result<Option<TrackedRecord>>;

    /// Replace the channel snapshot of a resolved record.
    async fn apply_metrics_refresh(
        &self,
        record_id: Uuid,
        channel: Channel,
        metrics: &MetricSnapshot,
    ) -> Result<Option<TrackedRecord>>;

    /// `in_flight → failed`. `None` if the record left `in_flight` meanwhile.
    async fn mark_failed(
        &self,
        record_id: Uuid,
        channel: Channel,
        reason: &str,
        failed_at: DateTime<Utc>,
    ) -> Result<Option<TrackedRecord>>;

    /// Recompute the cross-channel aggregate from the record's channels as
    /// stored now, in the same critical section as the write.
    async fn update_aggregate(&self, record_id: Uuid) -> Result<AggregateSnapshot>;
}
