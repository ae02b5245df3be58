//! One channel's reconciliation run: sweep, gate, fetch, match, refresh.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use postsync_common::{Channel, Config, ExternalItem, MetricSnapshot, TierSchedule, TrackedRecord};

use crate::freshness::classify_record;
use crate::matcher::{EntityMatcher, MatchResult};
use crate::notify::{Broadcaster, NoopBroadcaster};
use crate::rate_limit::RateLimitGuard;
use crate::selector::{CandidateSelector, CandidateWindow, DueQuery};
use crate::sentinel::TimeoutSentinel;
use crate::traits::{PlatformClient, RecordStore};
use crate::types::{ChannelStatus, RunReport, RunStats, RunStatus, SkipReason};

/// Tunables for a run. Defaults mirror the configuration defaults.
#[derive(Debug, Clone)]
pub struct ReconcileSettings {
    pub match_window: Duration,
    pub lookback: Duration,
    pub in_flight_timeout: Duration,
    pub fetch_limit: u32,
    pub refresh_batch_size: usize,
    pub caption_prefix_chars: usize,
    pub tiers: TierSchedule,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            match_window: Duration::hours(24),
            lookback: Duration::days(14),
            in_flight_timeout: Duration::hours(48),
            fetch_limit: 50,
            refresh_batch_size: 20,
            caption_prefix_chars: 50,
            tiers: TierSchedule::default(),
        }
    }
}

impl ReconcileSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            match_window: config.match_window,
            lookback: config.lookback,
            in_flight_timeout: config.in_flight_timeout,
            fetch_limit: config.fetch_limit,
            refresh_batch_size: config.refresh_batch_size,
            caption_prefix_chars: config.caption_prefix_chars,
            tiers: config.tiers.clone(),
        }
    }
}

/// Collaborators shared by every channel orchestrator.
#[derive(Clone, TypedBuilder)]
pub struct ReconcileDeps {
    pub platform: Arc<dyn PlatformClient>,
    pub store: Arc<dyn RecordStore>,
    #[builder(default = Arc::new(NoopBroadcaster))]
    pub broadcaster: Arc<dyn Broadcaster>,
}

/// Clears the running flag when the run ends, however it ends.
struct RunningGuard<'a>(&'a AtomicBool);

impl<'a> RunningGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Reconciles one channel. Owns its own running flag and last-run record, so
/// several channels can run side by side in one process.
pub struct Orchestrator {
    channel: Channel,
    settings: ReconcileSettings,
    platform: Arc<dyn PlatformClient>,
    store: Arc<dyn RecordStore>,
    broadcaster: Arc<dyn Broadcaster>,
    selector: CandidateSelector,
    matcher: EntityMatcher,
    sentinel: TimeoutSentinel,
    guard: RateLimitGuard,
    running: AtomicBool,
    last_run: Mutex<Option<RunReport>>,
}

impl Orchestrator {
    pub fn new(channel: Channel, settings: ReconcileSettings, deps: ReconcileDeps) -> Self {
        let selector = CandidateSelector::new(deps.store.clone(), settings.tiers.clone());
        let matcher = EntityMatcher::new(settings.match_window, settings.caption_prefix_chars);
        let sentinel = TimeoutSentinel::new(
            deps.store.clone(),
            deps.broadcaster.clone(),
            settings.in_flight_timeout,
        );
        let guard = RateLimitGuard::new(deps.platform.clone());
        Self {
            channel,
            settings,
            platform: deps.platform,
            store: deps.store,
            broadcaster: deps.broadcaster,
            selector,
            matcher,
            sentinel,
            guard,
            running: AtomicBool::new(false),
            last_run: Mutex::new(None),
        }
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn status(&self) -> ChannelStatus {
        let last_run = self.last_run.lock().unwrap_or_else(|e| e.into_inner()).clone();
        ChannelStatus {
            channel: self.channel,
            running: self.running.load(Ordering::Acquire),
            last_run_at: last_run.as_ref().map(|r| r.started_at),
            last_run,
        }
    }

    /// Run now. A trigger while a run is in progress returns a skipped report
    /// immediately and leaves the last-run record alone.
    pub async fn trigger_now(&self) -> RunReport {
        self.trigger_at(Utc::now()).await
    }

    pub async fn trigger_at(&self, now: DateTime<Utc>) -> RunReport {
        let run_id = Uuid::new_v4();
        let Some(_running) = RunningGuard::acquire(&self.running) else {
            info!(channel = %self.channel, "Reconciliation already running, ignoring trigger");
            return RunReport {
                run_id,
                channel: self.channel,
                started_at: now,
                finished_at: Utc::now(),
                status: RunStatus::Skipped(SkipReason::AlreadyRunning),
                stats: RunStats::default(),
            };
        };

        info!(channel = %self.channel, %run_id, "Reconciliation run starting");
        let mut stats = RunStats::default();
        let status = match self.run(now, &mut stats).await {
            Ok(status) => status,
            Err(e) => {
                let error = format!("{e:#}");
                warn!(channel = %self.channel, %run_id, %error, "Reconciliation run failed");
                RunStatus::Failed { error }
            }
        };

        let report = RunReport {
            run_id,
            channel: self.channel,
            started_at: now,
            finished_at: Utc::now(),
            status,
            stats,
        };
        info!("Reconciliation run finished. {report}");

        *self.last_run.lock().unwrap_or_else(|e| e.into_inner()) = Some(report.clone());
        report
    }

    async fn run(&self, now: DateTime<Utc>, stats: &mut RunStats) -> Result<RunStatus> {
        let channel = self.channel;

        // Phase 1: fail records stuck past the deadline (store only, runs even when rate limited)
        match self.sentinel.sweep(channel, now).await {
            Ok(sweep) => {
                stats.sweep_checked = sweep.checked;
                stats.timeouts = sweep.marked_failed;
                stats.errors += sweep.errors;
            }
            Err(e) => {
                stats.errors += 1;
                warn!(channel = %channel, error = %e, "Timeout sweep failed");
            }
        }

        // Phase 2: rate-limit gate
        let decision = self
            .guard
            .check_and_maybe_skip(channel, now)
            .await
            .context("reading rate-limit state")?;
        if !decision.allowed {
            return Ok(RunStatus::Skipped(SkipReason::RateLimited {
                reset_at: decision.reset_at,
            }));
        }

        // Phase 3: fetch the recent window
        let items = self
            .platform
            .list_recent_items(channel, self.settings.fetch_limit)
            .await
            .context("listing recent platform items")?;
        stats.fetched = items.len() as u64;

        // Phase 4: bound to the lookback horizon, oldest first
        let items = prepare_items(items, now - self.settings.lookback);
        stats.in_window = items.len() as u64;

        // Phase 5: match or refresh each item
        let touched = self.reconcile_items(&items, now, stats).await;

        // Phase 6: refresh resolved records whose tier interval elapsed
        self.refresh_due(now, &touched, stats).await?;

        Ok(RunStatus::Completed)
    }

    /// Returns the ids of records written during this pass.
    async fn reconcile_items(&self, items: &[ExternalItem], now: DateTime<Utc>, stats: &mut RunStats) -> HashSet<Uuid> {
        let channel = self.channel;
        let due_query = DueQuery::for_tiers(&self.settings.tiers, now);
        let mut touched = HashSet::new();

        let mut candidates = match CandidateWindow::around(items, self.settings.match_window) {
            Some(window) => match self.selector.select_unresolved(channel, &window).await {
                Ok(candidates) => candidates,
                Err(e) => {
                    stats.errors += 1;
                    warn!(channel = %channel, error = %e, "Failed to load match candidates");
                    Vec::new()
                }
            },
            None => Vec::new(),
        };

        for item in items {
            match self.store.find_by_external_id(channel, &item.external_id).await {
                Ok(Some(record)) => {
                    stats.already_known += 1;
                    if due_query.admits_record(&record, channel) && self.refresh_record(&record, item, now, stats).await {
                        touched.insert(record.id);
                    }
                    continue;
                }
                Ok(None) => {}
                Err(e) => {
                    stats.errors += 1;
                    warn!(channel = %channel, external_id = %item.external_id, error = %e, "Failed to look up external id");
                    continue;
                }
            }

            let matched = match self.matcher.match_item(item, &candidates, channel) {
                MatchResult::Matched(m) => m,
                MatchResult::Unmatched(reason) => {
                    stats.unmatched += 1;
                    debug!(channel = %channel, external_id = %item.external_id, %reason, "No tracked record matched item");
                    continue;
                }
            };

            let metrics = MetricSnapshot::from_counts(&item.metrics, now);
            match self
                .store
                .apply_match(matched.record_id, channel, &item.external_id, item.created_at, &metrics)
                .await
            {
                Ok(Some(updated)) => {
                    stats.matched += 1;
                    touched.insert(updated.id);
                    info!(
                        channel = %channel,
                        record_id = %updated.id,
                        external_id = %item.external_id,
                        method = %matched.method,
                        time_delta_minutes = matched.time_delta.num_minutes(),
                        score = matched.score,
                        "Matched platform item to record"
                    );
                    self.broadcast_status(&updated).await;
                    self.reaggregate(updated.id, stats).await;
                }
                Ok(None) => {
                    stats.unmatched += 1;
                    debug!(record_id = %matched.record_id, external_id = %item.external_id, "Record no longer awaiting a match");
                }
                Err(e) => {
                    stats.errors += 1;
                    warn!(
                        channel = %channel,
                        record_id = %matched.record_id,
                        external_id = %item.external_id,
                        error = %e,
                        "Failed to apply match"
                    );
                }
            }
            // Consumed either way: the record is resolved now or was not eligible.
            candidates.retain(|c| c.id != matched.record_id);
        }

        touched
    }

    /// Batched metric refresh of due records not already written this run.
    /// Stops early, deferring the rest, if the rate limit closes between batches.
    async fn refresh_due(&self, now: DateTime<Utc>, touched: &HashSet<Uuid>, stats: &mut RunStats) -> Result<()> {
        let channel = self.channel;
        let due = match self.selector.select_due(channel, now).await {
            Ok(due) => due,
            Err(e) => {
                stats.errors += 1;
                warn!(channel = %channel, error = %e, "Failed to select records due for refresh");
                return Ok(());
            }
        };

        let due: Vec<TrackedRecord> = due.into_iter().filter(|r| !touched.contains(&r.id)).collect();
        stats.refresh_due = due.len() as u64;
        if due.is_empty() {
            return Ok(());
        }

        let by_external_id: HashMap<&str, &TrackedRecord> = due
            .iter()
            .filter_map(|r| r.external_id_on(channel).map(|id| (id, r)))
            .collect();

        let batch_size = self.settings.refresh_batch_size.max(1);
        for (i, batch) in due.chunks(batch_size).enumerate() {
            let decision = self
                .guard
                .check_and_maybe_skip(channel, now)
                .await
                .context("reading rate-limit state")?;
            if !decision.allowed {
                stats.refresh_deferred = (due.len() - i * batch_size) as u64;
                info!(channel = %channel, deferred = stats.refresh_deferred, "Rate limited mid-refresh, deferring the rest");
                break;
            }

            let ids: Vec<String> = batch
                .iter()
                .filter_map(|r| r.external_id_on(channel).map(str::to_string))
                .collect();
            let fetched = self
                .platform
                .fetch_items(channel, &ids)
                .await
                .context("fetching items for metric refresh")?;

            for item in &fetched {
                if let Some(record) = by_external_id.get(item.external_id.as_str()) {
                    self.refresh_record(record, item, now, stats).await;
                }
            }
        }

        Ok(())
    }

    /// Write a fresh snapshot for `record` from `item`, then recompute the aggregate.
    async fn refresh_record(&self, record: &TrackedRecord, item: &ExternalItem, now: DateTime<Utc>, stats: &mut RunStats) -> bool {
        let metrics = MetricSnapshot::from_counts(&item.metrics, now);
        match self.store.apply_metrics_refresh(record.id, self.channel, &metrics).await {
            Ok(Some(updated)) => {
                stats.metrics_updated += 1;
                debug!(
                    channel = %self.channel,
                    record_id = %record.id,
                    tier = %classify_record(&self.settings.tiers, record, self.channel, now).name,
                    views = metrics.views,
                    "Refreshed metrics"
                );
                self.reaggregate(updated.id, stats).await;
                true
            }
            Ok(None) => false,
            Err(e) => {
                stats.errors += 1;
                warn!(
                    channel = %self.channel,
                    record_id = %record.id,
                    external_id = %item.external_id,
                    error = %e,
                    "Failed to refresh metrics"
                );
                false
            }
        }
    }

    async fn reaggregate(&self, record_id: Uuid, stats: &mut RunStats) {
        let snapshot = match self.store.update_aggregate(record_id).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                stats.errors += 1;
                warn!(%record_id, error = %e, "Failed to store aggregate metrics");
                return;
            }
        };
        if let Err(e) = self.broadcaster.notify_metrics_updated(record_id, &snapshot).await {
            warn!(%record_id, error = %e, "Failed to broadcast metrics update");
        }
    }

    async fn broadcast_status(&self, record: &TrackedRecord) {
        if let Err(e) = self.broadcaster.notify_status_changed(record).await {
            warn!(record_id = %record.id, error = %e, "Failed to broadcast status change");
        }
    }
}

/// Drop items older than `horizon` and duplicate ids, then sort oldest first
/// so earlier items claim matches first.
fn prepare_items(items: Vec<ExternalItem>, horizon: DateTime<Utc>) -> Vec<ExternalItem> {
    let mut seen = HashSet::new();
    let mut items: Vec<ExternalItem> = items
        .into_iter()
        .filter(|i| i.created_at >= horizon)
        .filter(|i| seen.insert(i.external_id.clone()))
        .collect();
    items.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.external_id.cmp(&b.external_id))
    });
    items
}
