use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use postsync_common::{
    AggregateSnapshot, Channel, MetricSnapshot, PostStatus, StoreError, TrackedRecord,
};

use crate::aggregate::aggregate;
use crate::selector::DueQuery;
use crate::traits::RecordStore;

/// Insertion-ordered in-memory record store.
///
/// Enforces the lifecycle rules itself: a post resolves at most once, an
/// external id belongs to at most one record per channel, and only in-flight
/// posts can fail.
#[derive(Default)]
pub struct MemoryRecordStore {
    records: Mutex<Vec<TrackedRecord>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: Vec<TrackedRecord>) -> Self {
        Self {
            records: Mutex::new(records),
        }
    }

    /// Insert or replace a record by id.
    pub fn upsert(&self, record: TrackedRecord) {
        let mut records = self.lock();
        match records.iter_mut().find(|r| r.id == record.id) {
            Some(existing) => *existing = record,
            None => records.push(record),
        }
    }

    pub fn get(&self, id: Uuid) -> Option<TrackedRecord> {
        self.lock().iter().find(|r| r.id == id).cloned()
    }

    pub fn all(&self) -> Vec<TrackedRecord> {
        self.lock().clone()
    }

    pub fn remove(&self, id: Uuid) {
        self.lock().retain(|r| r.id != id);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<TrackedRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn select<F>(&self, predicate: F) -> Vec<TrackedRecord>
    where
        F: Fn(&TrackedRecord) -> bool,
    {
        self.lock().iter().filter(|r| predicate(r)).cloned().collect()
    }

    /// Apply `change` to the record; `change` returns false when its
    /// precondition does not hold, leaving the record untouched.
    fn modify<F>(&self, id: Uuid, change: F) -> Result<Option<TrackedRecord>, StoreError>
    where
        F: FnOnce(&mut TrackedRecord, &[TrackedRecord]) -> bool,
    {
        let mut records = self.lock();
        let idx = records
            .iter()
            .position(|r| r.id == id)
            .ok_or(StoreError::NotFound(id))?;

        let mut record = records[idx].clone();
        if !change(&mut record, &records) {
            return Ok(None);
        }
        records[idx] = record.clone();
        Ok(Some(record))
    }
}

fn in_window(t: Option<DateTime<Utc>>, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
    t.is_some_and(|t| t >= start && t <= end)
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn find_due_for_refresh(&self, channel: Channel, query: &DueQuery) -> Result<Vec<TrackedRecord>> {
        Ok(self.select(|r| query.admits_record(r, channel)))
    }

    async fn find_unresolved_in_window(
        &self,
        channel: Channel,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TrackedRecord>> {
        Ok(self.select(|r| {
            r.channel(channel).is_some_and(|p| p.awaiting_match())
                && (in_window(r.trigger_at, start, end) || in_window(r.scheduled_at, start, end))
        }))
    }

    async fn find_stale_in_flight(&self, channel: Channel, cutoff: DateTime<Utc>) -> Result<Vec<TrackedRecord>> {
        Ok(self.select(|r| {
            r.channel(channel).is_some_and(|p| p.awaiting_match())
                && r.match_reference_time().is_some_and(|t| t < cutoff)
        }))
    }

    async fn find_by_external_id(&self, channel: Channel, external_id: &str) -> Result<Option<TrackedRecord>> {
        Ok(self
            .select(|r| r.external_id_on(channel) == Some(external_id))
            .into_iter()
            .next())
    }

    async fn apply_match(
        &self,
        record_id: Uuid,
        channel: Channel,
        external_id: &str,
        posted_at: DateTime<Utc>,
        metrics: &MetricSnapshot,
    ) -> Result<Option<TrackedRecord>> {
        Ok(self.modify(record_id, |record, all| {
            let claimed = all
                .iter()
                .any(|other| other.id != record_id && other.external_id_on(channel) == Some(external_id));
            if claimed {
                return false;
            }
            let Some(post) = record.channels.get_mut(&channel) else {
                return false;
            };
            if !post.awaiting_match() {
                return false;
            }
            post.status = PostStatus::Resolved;
            post.external_id = Some(external_id.to_string());
            post.external_posted_at = Some(posted_at);
            post.metrics = Some(metrics.clone());
            true
        })?)
    }

    async fn apply_metrics_refresh(
        &self,
        record_id: Uuid,
        channel: Channel,
        metrics: &MetricSnapshot,
    ) -> Result<Option<TrackedRecord>> {
        Ok(self.modify(record_id, |record, _| {
            match record.channels.get_mut(&channel) {
                Some(post) if post.status == PostStatus::Resolved => {
                    post.metrics = Some(metrics.clone());
                    true
                }
                _ => false,
            }
        })?)
    }

    async fn mark_failed(
        &self,
        record_id: Uuid,
        channel: Channel,
        reason: &str,
        failed_at: DateTime<Utc>,
    ) -> Result<Option<TrackedRecord>> {
        Ok(self.modify(record_id, |record, _| {
            match record.channels.get_mut(&channel) {
                Some(post) if post.awaiting_match() => {
                    post.status = PostStatus::Failed;
                    post.failed_at = Some(failed_at);
                    post.failure_reason = Some(reason.to_string());
                    true
                }
                _ => false,
            }
        })?)
    }

    async fn update_aggregate(&self, record_id: Uuid) -> Result<AggregateSnapshot> {
        let mut snapshot = AggregateSnapshot::default();
        self.modify(record_id, |record, _| {
            snapshot = aggregate(&record.channels);
            record.aggregate = Some(snapshot.clone());
            true
        })?;
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{in_flight_record, metrics};
    use chrono::Duration;

    #[tokio::test]
    async fn apply_match_resolves_once() {
        let now = Utc::now();
        let record = in_flight_record("caption", Channel::TikTok, now);
        let store = MemoryRecordStore::with_records(vec![record.clone()]);
        let snapshot = metrics(10, 1, now);

        let first = store
            .apply_match(record.id, Channel::TikTok, "v1", now, &snapshot)
            .await
            .unwrap();
        assert_eq!(first.unwrap().external_id_on(Channel::TikTok), Some("v1"));

        let second = store
            .apply_match(record.id, Channel::TikTok, "v2", now, &snapshot)
            .await
            .unwrap();
        assert!(second.is_none());
        assert_eq!(store.get(record.id).unwrap().external_id_on(Channel::TikTok), Some("v1"));
    }

    #[tokio::test]
    async fn external_id_is_exclusive_per_channel() {
        let now = Utc::now();
        let a = in_flight_record("a", Channel::TikTok, now);
        let b = in_flight_record("b", Channel::TikTok, now);
        let store = MemoryRecordStore::with_records(vec![a.clone(), b.clone()]);
        let snapshot = metrics(0, 0, now);

        assert!(store.apply_match(a.id, Channel::TikTok, "v1", now, &snapshot).await.unwrap().is_some());
        assert!(store.apply_match(b.id, Channel::TikTok, "v1", now, &snapshot).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn mark_failed_only_from_in_flight() {
        let now = Utc::now();
        let record = in_flight_record("caption", Channel::TikTok, now - Duration::days(3));
        let store = MemoryRecordStore::with_records(vec![record.clone()]);
        store
            .apply_match(record.id, Channel::TikTok, "v1", now, &metrics(0, 0, now))
            .await
            .unwrap();

        let result = store.mark_failed(record.id, Channel::TikTok, "late", now).await.unwrap();
        assert!(result.is_none());
        assert_eq!(store.get(record.id).unwrap().status_on(Channel::TikTok), Some(PostStatus::Resolved));
    }

    #[tokio::test]
    async fn refresh_requires_resolved_post() {
        let now = Utc::now();
        let record = in_flight_record("caption", Channel::TikTok, now);
        let store = MemoryRecordStore::with_records(vec![record.clone()]);
        let result = store
            .apply_metrics_refresh(record.id, Channel::TikTok, &metrics(5, 1, now))
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn aggregate_is_recomputed_from_stored_channels() {
        let now = Utc::now();
        let mut record = in_flight_record("caption", Channel::TikTok, now);
        record.channels.insert(Channel::Instagram, postsync_common::ChannelPost::in_flight());
        let store = MemoryRecordStore::with_records(vec![record.clone()]);

        store
            .apply_match(record.id, Channel::TikTok, "tt1", now, &metrics(100, 10, now))
            .await
            .unwrap();
        store
            .apply_match(record.id, Channel::Instagram, "ig1", now, &metrics(1000, 500, now))
            .await
            .unwrap();

        let snapshot = store.update_aggregate(record.id).await.unwrap();
        assert_eq!(snapshot.views, 1100);
        assert_eq!(snapshot.likes, 510);
        assert_eq!(snapshot.channels, 2);
        assert_eq!(store.get(record.id).unwrap().aggregate, Some(snapshot));
    }

    #[tokio::test]
    async fn unknown_record_is_an_error() {
        let store = MemoryRecordStore::new();
        let err = store
            .update_aggregate(Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
