// Test doubles for the reconciliation engine.
//
// MockPlatform (PlatformClient): per-channel recent lists and items by id.
// RecordingBroadcaster (Broadcaster): remembers every notification.
// FlakyStore (RecordStore): a MemoryRecordStore whose writes fail for chosen records,
// or find them already claimed.
//
// Plus builders for records, items and snapshots.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use postsync_common::{
    AggregateSnapshot, Channel, ChannelPost, ExternalItem, MetricCounts, MetricSnapshot, PostStatus,
    TrackedRecord,
};

use crate::notify::Broadcaster;
use crate::rate_limit::RateLimitState;
use crate::selector::DueQuery;
use crate::store::MemoryRecordStore;
use crate::traits::{PlatformClient, RecordStore};

// ---------------------------------------------------------------------------
// MockPlatform
// ---------------------------------------------------------------------------

/// Builder pattern: `.on_recent()`, `.on_item()`, `.limited()`, `.failing()`.
/// Unregistered channels list nothing; unregistered ids are absent from fetches.
#[derive(Default)]
pub struct MockPlatform {
    recent: HashMap<Channel, Vec<ExternalItem>>,
    items: HashMap<(Channel, String), ExternalItem>,
    limits: Mutex<HashMap<Channel, RateLimitState>>,
    limit_after_fetches: HashMap<Channel, usize>,
    failing: bool,
    list_calls: AtomicUsize,
    fetch_calls: AtomicUsize,
    fetched_ids: Mutex<Vec<String>>,
}

impl MockPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_recent(mut self, channel: Channel, items: Vec<ExternalItem>) -> Self {
        self.recent.insert(channel, items);
        self
    }

    pub fn on_item(mut self, channel: Channel, item: ExternalItem) -> Self {
        self.items.insert((channel, item.external_id.clone()), item);
        self
    }

    pub fn limited(self, channel: Channel, reset_at: Option<DateTime<Utc>>) -> Self {
        self.set_limited(channel, reset_at);
        self
    }

    /// Report a limit (with no known reset) once `n` by-id fetches have happened.
    pub fn limited_after_fetches(mut self, channel: Channel, n: usize) -> Self {
        self.limit_after_fetches.insert(channel, n);
        self
    }

    /// Every list call errors.
    pub fn failing(mut self) -> Self {
        self.failing = true;
        self
    }

    fn set_limited(&self, channel: Channel, reset_at: Option<DateTime<Utc>>) {
        let mut limits = self.limits.lock().unwrap_or_else(|e| e.into_inner());
        limits.insert(channel, RateLimitState::limited_until(reset_at));
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    /// Every id requested through `fetch_items`, in request order.
    pub fn fetched_ids(&self) -> Vec<String> {
        self.fetched_ids.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl PlatformClient for MockPlatform {
    async fn list_recent_items(&self, channel: Channel, limit: u32) -> Result<Vec<ExternalItem>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing {
            bail!("MockPlatform: listing {channel} failed");
        }
        Ok(self
            .recent
            .get(&channel)
            .map(|items| items.iter().take(limit as usize).cloned().collect())
            .unwrap_or_default())
    }

    async fn fetch_items(&self, channel: Channel, external_ids: &[String]) -> Result<Vec<ExternalItem>> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.fetched_ids
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(external_ids.iter().cloned());
        Ok(external_ids
            .iter()
            .filter_map(|id| self.items.get(&(channel, id.clone())).cloned())
            .collect())
    }

    async fn rate_limit_state(&self, channel: Channel) -> Result<RateLimitState> {
        if let Some(&n) = self.limit_after_fetches.get(&channel) {
            if self.fetch_calls() >= n {
                return Ok(RateLimitState::limited_until(None));
            }
        }
        let limits = self.limits.lock().unwrap_or_else(|e| e.into_inner());
        Ok(limits.get(&channel).copied().unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// RecordingBroadcaster
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingBroadcaster {
    status_changes: Mutex<Vec<Uuid>>,
    metrics_updates: Mutex<Vec<(Uuid, AggregateSnapshot)>>,
}

impl RecordingBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status_changes(&self) -> Vec<Uuid> {
        self.status_changes.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn metrics_updates(&self) -> Vec<(Uuid, AggregateSnapshot)> {
        self.metrics_updates.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl Broadcaster for RecordingBroadcaster {
    async fn notify_status_changed(&self, record: &TrackedRecord) -> Result<()> {
        self.status_changes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record.id);
        Ok(())
    }

    async fn notify_metrics_updated(&self, record_id: Uuid, snapshot: &AggregateSnapshot) -> Result<()> {
        self.metrics_updates
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((record_id, snapshot.clone()));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FlakyStore
// ---------------------------------------------------------------------------

/// Reads always succeed. Writes to records in `broken` error out.
/// Matches against records in `claimed` find them no longer awaiting one,
/// as if another writer got there between the read and the write.
/// Also counts successful writes.
pub struct FlakyStore {
    inner: MemoryRecordStore,
    broken: HashSet<Uuid>,
    claimed: HashSet<Uuid>,
    writes: AtomicUsize,
}

impl FlakyStore {
    pub fn new(records: Vec<TrackedRecord>) -> Self {
        Self {
            inner: MemoryRecordStore::with_records(records),
            broken: HashSet::new(),
            claimed: HashSet::new(),
            writes: AtomicUsize::new(0),
        }
    }

    pub fn break_record(mut self, id: Uuid) -> Self {
        self.broken.insert(id);
        self
    }

    pub fn claim_record(mut self, id: Uuid) -> Self {
        self.claimed.insert(id);
        self
    }

    pub fn get(&self, id: Uuid) -> Option<TrackedRecord> {
        self.inner.get(id)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn check(&self, id: Uuid) -> Result<()> {
        if self.broken.contains(&id) {
            bail!("FlakyStore: write to {id} failed");
        }
        Ok(())
    }

    fn count<T>(&self, result: Option<T>) -> Option<T> {
        if result.is_some() {
            self.writes.fetch_add(1, Ordering::SeqCst);
        }
        result
    }
}

#[async_trait]
impl RecordStore for FlakyStore {
    async fn find_due_for_refresh(&self, channel: Channel, query: &DueQuery) -> Result<Vec<TrackedRecord>> {
        self.inner.find_due_for_refresh(channel, query).await
    }

    async fn find_unresolved_in_window(
        &self,
        channel: Channel,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TrackedRecord>> {
        self.inner.find_unresolved_in_window(channel, start, end).await
    }

    async fn find_stale_in_flight(&self, channel: Channel, cutoff: DateTime<Utc>) -> Result<Vec<TrackedRecord>> {
        self.inner.find_stale_in_flight(channel, cutoff).await
    }

    async fn find_by_external_id(&self, channel: Channel, external_id: &str) -> Result<Option<TrackedRecord>> {
        self.inner.find_by_external_id(channel, external_id).await
    }

    async fn apply_match(
        &self,
        record_id: Uuid,
        channel: Channel,
        external_id: &str,
        posted_at: DateTime<Utc>,
        metrics: &MetricSnapshot,
    ) -> Result<Option<TrackedRecord>> {
        self.check(record_id)?;
        if self.claimed.contains(&record_id) {
            return Ok(None);
        }
        let result = self
            .inner
            .apply_match(record_id, channel, external_id, posted_at, metrics)
            .await?;
        Ok(self.count(result))
    }

    async fn apply_metrics_refresh(
        &self,
        record_id: Uuid,
        channel: Channel,
        metrics: &MetricSnapshot,
    ) -> Result<Option<TrackedRecord>> {
        self.check(record_id)?;
        let result = self.inner.apply_metrics_refresh(record_id, channel, metrics).await?;
        Ok(self.count(result))
    }

    async fn mark_failed(
        &self,
        record_id: Uuid,
        channel: Channel,
        reason: &str,
        failed_at: DateTime<Utc>,
    ) -> Result<Option<TrackedRecord>> {
        self.check(record_id)?;
        let result = self.inner.mark_failed(record_id, channel, reason, failed_at).await?;
        Ok(self.count(result))
    }

    async fn update_aggregate(&self, record_id: Uuid) -> Result<AggregateSnapshot> {
        self.check(record_id)?;
        let snapshot = self.inner.update_aggregate(record_id).await?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(snapshot)
    }
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

/// A record in flight on `channel`, triggered (and scheduled) at `trigger_at`.
pub fn in_flight_record(caption: &str, channel: Channel, trigger_at: DateTime<Utc>) -> TrackedRecord {
    let mut record = TrackedRecord::new(caption);
    record.trigger_at = Some(trigger_at);
    record.scheduled_at = Some(trigger_at);
    record.channels.insert(channel, ChannelPost::in_flight());
    record
}

/// A record already resolved on `channel` to `external_id`.
pub fn resolved_record(
    caption: &str,
    channel: Channel,
    external_id: &str,
    posted_at: DateTime<Utc>,
    metrics: Option<MetricSnapshot>,
) -> TrackedRecord {
    let mut record = TrackedRecord::new(caption);
    record.trigger_at = Some(posted_at);
    record.scheduled_at = Some(posted_at);
    let mut post = ChannelPost::with_status(PostStatus::Resolved);
    post.external_id = Some(external_id.to_string());
    post.external_posted_at = Some(posted_at);
    post.metrics = metrics;
    record.channels.insert(channel, post);
    record
}

pub fn external_item(external_id: &str, caption: &str, created_at: DateTime<Utc>) -> ExternalItem {
    ExternalItem {
        external_id: external_id.to_string(),
        created_at,
        caption: caption.to_string(),
        url: None,
        metrics: MetricCounts::default(),
    }
}

/// An item carrying view and like counts.
pub fn external_item_with_counts(
    external_id: &str,
    caption: &str,
    created_at: DateTime<Utc>,
    views: u64,
    likes: u64,
) -> ExternalItem {
    ExternalItem {
        metrics: MetricCounts {
            views,
            likes,
            ..Default::default()
        },
        ..external_item(external_id, caption, created_at)
    }
}

pub fn metrics(views: u64, likes: u64, fetched_at: DateTime<Utc>) -> MetricSnapshot {
    MetricSnapshot::from_counts(
        &MetricCounts {
            views,
            likes,
            ..Default::default()
        },
        fetched_at,
    )
}

