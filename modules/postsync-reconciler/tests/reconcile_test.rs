//! Integration tests: full reconciliation runs against in-memory doubles.
//!
//! Every run uses a fixed `now` so tier boundaries and deadlines are exact.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use tokio::sync::Notify;

use postsync_common::{
    AggregateSnapshot, Channel, ChannelPost, ExternalItem, MetricSnapshot, PostStatus, TrackedRecord,
};
use uuid::Uuid;
use postsync_reconciler::aggregate::aggregate;
use postsync_reconciler::rate_limit::RateLimitState;
use postsync_reconciler::selector::DueQuery;
use postsync_reconciler::store::MemoryRecordStore;
use postsync_reconciler::testing::{
    external_item, external_item_with_counts, in_flight_record, metrics, resolved_record, FlakyStore,
    MockPlatform, RecordingBroadcaster,
};
use postsync_reconciler::traits::{PlatformClient, RecordStore};
use postsync_reconciler::{
    Orchestrator, ReconcileDeps, ReconcileSettings, RunReport, RunStatus, SkipReason,
};

const TT: Channel = Channel::TikTok;

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
}

struct Harness {
    platform: Arc<MockPlatform>,
    store: Arc<MemoryRecordStore>,
    broadcaster: Arc<RecordingBroadcaster>,
    orchestrator: Orchestrator,
}

impl Harness {
    fn new(platform: MockPlatform, records: Vec<TrackedRecord>) -> Self {
        Self::with_settings(platform, records, ReconcileSettings::default())
    }

    fn with_settings(platform: MockPlatform, records: Vec<TrackedRecord>, settings: ReconcileSettings) -> Self {
        let platform = Arc::new(platform);
        let store = Arc::new(MemoryRecordStore::with_records(records));
        let broadcaster = Arc::new(RecordingBroadcaster::new());
        let deps = ReconcileDeps::builder()
            .platform(platform.clone())
            .store(store.clone())
            .broadcaster(broadcaster.clone())
            .build();
        Self {
            orchestrator: Orchestrator::new(TT, settings, deps),
            platform,
            store,
            broadcaster,
        }
    }

    async fn run(&self) -> RunReport {
        self.orchestrator.trigger_at(now()).await
    }

    fn record(&self, record: &TrackedRecord) -> TrackedRecord {
        self.store.get(record.id).unwrap()
    }
}

// ---------------------------------------------------------------------------
// Matching
// ---------------------------------------------------------------------------

#[tokio::test]
async fn matches_in_flight_record_and_stores_metrics() {
    let record = in_flight_record("Spring launch #ad", TT, now() - Duration::hours(3));
    let item = external_item_with_counts("v1", "Spring launch", now() - Duration::hours(2), 150, 15);
    let h = Harness::new(MockPlatform::new().on_recent(TT, vec![item]), vec![record.clone()]);

    let report = h.run().await;

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.stats.fetched, 1);
    assert_eq!(report.stats.matched, 1);
    assert_eq!(report.stats.errors, 0);

    let stored = h.record(&record);
    let post = stored.channel(TT).unwrap();
    assert_eq!(post.status, PostStatus::Resolved);
    assert_eq!(post.external_id.as_deref(), Some("v1"));
    assert_eq!(post.external_posted_at, Some(now() - Duration::hours(2)));
    assert_eq!(post.metrics.as_ref().unwrap().last_fetched_at, now());

    let aggregate = stored.aggregate.unwrap();
    assert_eq!(aggregate.views, 150);
    assert_eq!(aggregate.channels, 1);
    assert!((aggregate.engagement_rate - 10.0).abs() < 1e-9);

    assert_eq!(h.broadcaster.status_changes(), vec![record.id]);
    assert_eq!(h.broadcaster.metrics_updates().len(), 1);
}

#[tokio::test]
async fn second_run_over_same_items_writes_nothing() {
    let record = in_flight_record("Spring launch", TT, now() - Duration::hours(3));
    let item = external_item_with_counts("v1", "Spring launch", now() - Duration::hours(2), 150, 15);
    let h = Harness::new(MockPlatform::new().on_recent(TT, vec![item]), vec![record]);

    h.run().await;
    let after_first = h.store.all();

    let report = h.orchestrator.trigger_at(now() + Duration::minutes(10)).await;

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.stats.matched, 0);
    assert_eq!(report.stats.already_known, 1);
    assert_eq!(report.stats.metrics_updated, 0);
    assert_eq!(report.stats.refresh_due, 0);
    assert_eq!(h.store.all(), after_first);
    assert_eq!(h.broadcaster.status_changes().len(), 1);
    assert_eq!(h.platform.fetch_calls(), 0);
}

#[tokio::test]
async fn one_item_resolves_only_the_closest_record() {
    let early = in_flight_record("Launch day", TT, now() - Duration::hours(3));
    let late = in_flight_record("Launch day", TT, now() - Duration::hours(1));
    let item = external_item("v1", "Launch day", now() - Duration::minutes(50));
    let h = Harness::new(MockPlatform::new().on_recent(TT, vec![item]), vec![early.clone(), late.clone()]);

    let report = h.run().await;

    assert_eq!(report.stats.matched, 1);
    assert_eq!(h.record(&late).external_id_on(TT), Some("v1"));
    assert_eq!(h.record(&early).status_on(TT), Some(PostStatus::InFlight));
    assert_eq!(h.record(&early).external_id_on(TT), None);
}

#[tokio::test]
async fn a_record_is_claimed_by_one_item_per_run() {
    let record = in_flight_record("Launch day", TT, now() - Duration::minutes(90));
    let items = vec![
        external_item("b", "Launch day", now() - Duration::hours(1)),
        external_item("a", "Launch day", now() - Duration::hours(2)),
    ];
    let h = Harness::new(MockPlatform::new().on_recent(TT, items), vec![record.clone()]);

    let report = h.run().await;

    assert_eq!(report.stats.matched, 1);
    assert_eq!(report.stats.unmatched, 1);
    // Oldest item goes first.
    assert_eq!(h.record(&record).external_id_on(TT), Some("a"));
}

#[tokio::test]
async fn items_outside_lookback_are_ignored() {
    let record = in_flight_record("Throwback", TT, now() - Duration::hours(36));
    let item = external_item("v1", "Throwback", now() - Duration::hours(36));
    let settings = ReconcileSettings {
        lookback: Duration::days(1),
        ..Default::default()
    };
    let h = Harness::with_settings(MockPlatform::new().on_recent(TT, vec![item]), vec![record.clone()], settings);

    let report = h.run().await;

    assert_eq!(report.stats.fetched, 1);
    assert_eq!(report.stats.in_window, 0);
    assert_eq!(report.stats.matched, 0);
    assert_eq!(h.record(&record).status_on(TT), Some(PostStatus::InFlight));
}

#[tokio::test]
async fn other_channels_are_left_alone() {
    let mut record = in_flight_record("Cross post", TT, now() - Duration::hours(2));
    record.channels.insert(Channel::Instagram, ChannelPost::in_flight());
    let item = external_item_with_counts("v1", "Cross post", now() - Duration::hours(1), 40, 4);
    let h = Harness::new(MockPlatform::new().on_recent(TT, vec![item]), vec![record.clone()]);

    h.run().await;

    let stored = h.record(&record);
    assert_eq!(stored.status_on(TT), Some(PostStatus::Resolved));
    assert_eq!(stored.status_on(Channel::Instagram), Some(PostStatus::InFlight));
    assert_eq!(stored.aggregate.unwrap().channels, 1);
}

#[tokio::test]
async fn write_failure_on_one_item_does_not_abort_the_run() {
    let alpha = in_flight_record("Alpha drop", TT, now() - Duration::hours(4));
    let beta = in_flight_record("Beta drop", TT, now() - Duration::hours(2));
    let store = Arc::new(FlakyStore::new(vec![alpha.clone(), beta.clone()]).break_record(alpha.id));
    let platform = Arc::new(MockPlatform::new().on_recent(
        TT,
        vec![
            external_item("a", "Alpha drop", now() - Duration::hours(4)),
            external_item("b", "Beta drop", now() - Duration::hours(2)),
        ],
    ));
    let deps = ReconcileDeps::builder().platform(platform).store(store.clone()).build();
    let orchestrator = Orchestrator::new(TT, ReconcileSettings::default(), deps);

    let report = orchestrator.trigger_at(now()).await;

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.stats.errors, 1);
    assert_eq!(report.stats.matched, 1);
    assert_eq!(store.get(alpha.id).unwrap().status_on(TT), Some(PostStatus::InFlight));
    assert_eq!(store.get(beta.id).unwrap().external_id_on(TT), Some("b"));
}

#[tokio::test]
async fn record_claimed_between_read_and_write_counts_as_unmatched() {
    let record = in_flight_record("Gamma drop", TT, now() - Duration::hours(2));
    let store = Arc::new(FlakyStore::new(vec![record.clone()]).claim_record(record.id));
    let platform = Arc::new(MockPlatform::new().on_recent(
        TT,
        vec![external_item("g", "Gamma drop", now() - Duration::hours(1))],
    ));
    let deps = ReconcileDeps::builder().platform(platform).store(store.clone()).build();
    let orchestrator = Orchestrator::new(TT, ReconcileSettings::default(), deps);

    let report = orchestrator.trigger_at(now()).await;

    assert_eq!(report.stats.in_window, 1);
    assert_eq!(report.stats.matched, 0);
    assert_eq!(report.stats.unmatched, 1);
    assert_eq!(report.stats.errors, 0);
    assert_eq!(store.writes(), 0);
}

// ---------------------------------------------------------------------------
// Timeouts
// ---------------------------------------------------------------------------

#[tokio::test]
async fn timed_out_records_fail_and_stay_failed() {
    let stale = in_flight_record("Never posted", TT, now() - Duration::hours(49));
    let item = external_item("late", "Never posted", now() - Duration::hours(48));
    let h = Harness::new(MockPlatform::new().on_recent(TT, vec![item]), vec![stale.clone()]);

    let first = h.run().await;
    assert_eq!(first.stats.timeouts, 1);
    assert_eq!(first.stats.matched, 0);

    let post = h.record(&stale).channel(TT).cloned().unwrap();
    assert_eq!(post.status, PostStatus::Failed);
    assert_eq!(post.failed_at, Some(now()));
    assert!(post.external_id.is_none());

    let second = h.orchestrator.trigger_at(now() + Duration::hours(1)).await;
    assert_eq!(second.stats.timeouts, 0);
    assert_eq!(second.stats.matched, 0);
    assert_eq!(h.record(&stale).status_on(TT), Some(PostStatus::Failed));
}

// ---------------------------------------------------------------------------
// Rate limits and failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn rate_limited_run_skips_fetch_but_still_sweeps() {
    let reset = now() + Duration::hours(1);
    let stale = in_flight_record("Gone", TT, now() - Duration::hours(50));
    let platform = MockPlatform::new()
        .on_recent(TT, vec![external_item("v1", "Gone", now())])
        .limited(TT, Some(reset));
    let h = Harness::new(platform, vec![stale.clone()]);

    let report = h.run().await;

    assert_eq!(
        report.status,
        RunStatus::Skipped(SkipReason::RateLimited { reset_at: Some(reset) })
    );
    assert!(report.is_skipped());
    assert_eq!(h.platform.list_calls(), 0);
    assert_eq!(report.stats.timeouts, 1);
    assert_eq!(h.record(&stale).status_on(TT), Some(PostStatus::Failed));
}

#[tokio::test]
async fn expired_limit_does_not_block() {
    let platform = MockPlatform::new().limited(TT, Some(now() - Duration::minutes(1)));
    let h = Harness::new(platform, vec![]);

    let report = h.run().await;

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(h.platform.list_calls(), 1);
}

#[tokio::test]
async fn list_failure_fails_the_run() {
    let record = in_flight_record("Anything", TT, now() - Duration::hours(1));
    let h = Harness::new(MockPlatform::new().failing(), vec![record.clone()]);

    let report = h.run().await;

    match &report.status {
        RunStatus::Failed { error } => assert!(error.contains("listing recent platform items")),
        other => panic!("expected failed run, got {other}"),
    }
    assert_eq!(h.record(&record), record);

    let status = h.orchestrator.status();
    assert!(!status.running);
    assert_eq!(status.last_run.unwrap().status, report.status);
}

// ---------------------------------------------------------------------------
// Tiered refresh
// ---------------------------------------------------------------------------

#[tokio::test]
async fn refreshes_only_records_due_for_their_tier() {
    let posted = now() - Duration::days(3);
    // "recent" tier refreshes every 6h.
    let stale = resolved_record("Old post", TT, "old1", posted, Some(metrics(100, 5, now() - Duration::hours(7))));
    let fresh = resolved_record("Other post", TT, "old2", posted, Some(metrics(100, 5, now() - Duration::hours(1))));
    let platform = MockPlatform::new()
        .on_item(TT, external_item_with_counts("old1", "Old post", posted, 500, 50))
        .on_item(TT, external_item_with_counts("old2", "Other post", posted, 900, 90));
    let h = Harness::new(platform, vec![stale.clone(), fresh.clone()]);

    let report = h.run().await;

    assert_eq!(report.stats.refresh_due, 1);
    assert_eq!(report.stats.metrics_updated, 1);
    assert_eq!(h.platform.fetched_ids(), vec!["old1".to_string()]);

    let refreshed = h.record(&stale);
    let snapshot = refreshed.channel(TT).unwrap().metrics.clone().unwrap();
    assert_eq!(snapshot.views, 500);
    assert_eq!(snapshot.last_fetched_at, now());
    assert_eq!(refreshed.aggregate.unwrap().views, 500);

    assert_eq!(h.record(&fresh), fresh);
    assert_eq!(h.broadcaster.metrics_updates().len(), 1);
}

#[tokio::test]
async fn never_fetched_records_are_refreshed() {
    let record = resolved_record("Imported", TT, "imp1", now() - Duration::days(90), None);
    let platform = MockPlatform::new().on_item(TT, external_item_with_counts("imp1", "Imported", now(), 10, 1));
    let h = Harness::new(platform, vec![record.clone()]);

    let report = h.run().await;

    assert_eq!(report.stats.metrics_updated, 1);
    assert!(h.record(&record).last_fetched_on(TT).is_some());
}

#[tokio::test]
async fn known_item_in_recent_list_is_refreshed_once() {
    let posted = now() - Duration::hours(2);
    // "fresh" tier refreshes hourly; last fetch was two hours ago.
    let record = resolved_record("Known", TT, "k1", posted, Some(metrics(10, 1, posted)));
    let item = external_item_with_counts("k1", "Known", posted, 999, 99);
    let h = Harness::new(MockPlatform::new().on_recent(TT, vec![item]), vec![record.clone()]);

    let report = h.run().await;

    assert_eq!(report.stats.already_known, 1);
    assert_eq!(report.stats.metrics_updated, 1);
    assert_eq!(report.stats.refresh_due, 0);
    assert_eq!(h.platform.fetch_calls(), 0);
    assert_eq!(h.record(&record).channel(TT).unwrap().metrics.as_ref().unwrap().views, 999);
}

#[tokio::test]
async fn refresh_stops_when_limit_closes_between_batches() {
    let posted = now() - Duration::days(3);
    let mut platform = MockPlatform::new().limited_after_fetches(TT, 1);
    let mut records = Vec::new();
    for i in 0..5 {
        let id = format!("p{i}");
        records.push(resolved_record("Batch", TT, &id, posted, None));
        platform = platform.on_item(TT, external_item_with_counts(&id, "Batch", posted, 10, 1));
    }
    let settings = ReconcileSettings {
        refresh_batch_size: 2,
        ..Default::default()
    };
    let h = Harness::with_settings(platform, records, settings);

    let report = h.run().await;

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.stats.refresh_due, 5);
    assert_eq!(report.stats.metrics_updated, 2);
    assert_eq!(report.stats.refresh_deferred, 3);
    assert_eq!(h.platform.fetch_calls(), 1);
}

/// Lands an Instagram refresh and its aggregate between the TikTok refresh
/// write and the TikTok aggregate write.
struct InterleavingStore {
    inner: MemoryRecordStore,
    instagram: MetricSnapshot,
}

#[async_trait]
impl RecordStore for InterleavingStore {
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
        self.inner
            .apply_match(record_id, channel, external_id, posted_at, metrics)
            .await
    }

    async fn apply_metrics_refresh(
        &self,
        record_id: Uuid,
        channel: Channel,
        metrics: &MetricSnapshot,
    ) -> Result<Option<TrackedRecord>> {
        let updated = self.inner.apply_metrics_refresh(record_id, channel, metrics).await?;
        if channel == TT {
            self.inner
                .apply_metrics_refresh(record_id, Channel::Instagram, &self.instagram)
                .await?;
            self.inner.update_aggregate(record_id).await?;
        }
        Ok(updated)
    }

    async fn mark_failed(
        &self,
        record_id: Uuid,
        channel: Channel,
        reason: &str,
        failed_at: DateTime<Utc>,
    ) -> Result<Option<TrackedRecord>> {
        self.inner.mark_failed(record_id, channel, reason, failed_at).await
    }

    async fn update_aggregate(&self, record_id: Uuid) -> Result<AggregateSnapshot> {
        self.inner.update_aggregate(record_id).await
    }
}

#[tokio::test]
async fn aggregate_reflects_a_concurrent_write_on_another_channel() {
    let posted = now() - Duration::days(3);
    let mut record = resolved_record("Cross post", TT, "tt1", posted, Some(metrics(50, 5, now() - Duration::hours(7))));
    let mut instagram = ChannelPost::with_status(PostStatus::Resolved);
    instagram.external_id = Some("ig1".to_string());
    instagram.external_posted_at = Some(posted);
    instagram.metrics = Some(metrics(900, 400, now() - Duration::hours(1)));
    record.channels.insert(Channel::Instagram, instagram);

    let store = Arc::new(InterleavingStore {
        inner: MemoryRecordStore::with_records(vec![record.clone()]),
        instagram: metrics(1000, 500, now()),
    });
    let platform = Arc::new(MockPlatform::new().on_item(TT, external_item_with_counts("tt1", "Cross post", posted, 100, 10)));
    let broadcaster = Arc::new(RecordingBroadcaster::new());
    let deps = ReconcileDeps::builder()
        .platform(platform)
        .store(store.clone())
        .broadcaster(broadcaster.clone())
        .build();
    let orchestrator = Orchestrator::new(TT, ReconcileSettings::default(), deps);

    let report = orchestrator.trigger_at(now()).await;
    assert_eq!(report.stats.metrics_updated, 1);

    let stored = store.inner.get(record.id).unwrap();
    let stored_aggregate = stored.aggregate.clone().unwrap();
    assert_eq!(stored_aggregate.views, 1100);
    assert_eq!(stored_aggregate.likes, 510);
    assert_eq!(stored_aggregate.channels, 2);
    assert_eq!(stored_aggregate, aggregate(&stored.channels));

    let updates = broadcaster.metrics_updates();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].1, stored_aggregate);
}

// ---------------------------------------------------------------------------
// Re-entrancy
// ---------------------------------------------------------------------------

/// Blocks inside `list_recent_items` until released.
#[derive(Default)]
struct GatedPlatform {
    entered: Notify,
    release: Notify,
}

#[async_trait]
impl PlatformClient for GatedPlatform {
    async fn list_recent_items(&self, _channel: Channel, _limit: u32) -> Result<Vec<ExternalItem>> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok(Vec::new())
    }

    async fn fetch_items(&self, _channel: Channel, _external_ids: &[String]) -> Result<Vec<ExternalItem>> {
        Ok(Vec::new())
    }

    async fn rate_limit_state(&self, _channel: Channel) -> Result<RateLimitState> {
        Ok(RateLimitState::open())
    }
}

#[tokio::test]
async fn trigger_during_a_run_is_skipped() {
    let platform = Arc::new(GatedPlatform::default());
    let store: Arc<dyn RecordStore> = Arc::new(MemoryRecordStore::new());
    let deps = ReconcileDeps::builder().platform(platform.clone()).store(store).build();
    let orchestrator = Arc::new(Orchestrator::new(TT, ReconcileSettings::default(), deps));

    let first = tokio::spawn({
        let orchestrator = orchestrator.clone();
        async move { orchestrator.trigger_at(now()).await }
    });
    platform.entered.notified().await;

    assert!(orchestrator.status().running);
    let second = orchestrator.trigger_at(now()).await;
    assert_eq!(second.status, RunStatus::Skipped(SkipReason::AlreadyRunning));
    assert!(orchestrator.status().last_run.is_none());

    platform.release.notify_one();
    let first = first.await.unwrap();
    assert_eq!(first.status, RunStatus::Completed);

    let status = orchestrator.status();
    assert!(!status.running);
    assert_eq!(status.last_run.unwrap().run_id, first.run_id);
    assert_eq!(status.last_run_at, Some(now()));
}
