//! Candidate selection: which records are due for a metric refresh, and which
//! in-flight records may claim a newly seen platform item.
//!
//! The due query is a list of disjoint per-tier clauses, each an age bucket
//! AND a staleness cutoff, plus a never-fetched override. Stores evaluate it
//! as-is; [`DueQuery::admits`] is the reference semantics.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use postsync_common::{Channel, ExternalItem, PostStatus, TierSchedule, TrackedRecord};

use crate::traits::RecordStore;

/// One tier's slice of the due query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DueClause {
    pub tier: String,
    /// Reference time must be strictly after this (age below the tier's max). `None` when unbounded.
    pub referenced_after: Option<DateTime<Utc>>,
    /// Reference time must be at or before this (age at or above the previous tier's max).
    /// `None` for the freshest tier.
    pub referenced_at_or_before: Option<DateTime<Utc>>,
    /// Records with no reference time at all belong here.
    pub includes_undated: bool,
    /// A snapshot fetched at or before this instant is stale.
    pub fetched_at_or_before: DateTime<Utc>,
}

impl DueClause {
    fn contains_age(&self, reference: Option<DateTime<Utc>>) -> bool {
        match reference {
            None => self.includes_undated,
            Some(r) => {
                self.referenced_after.map_or(true, |after| r > after)
                    && self.referenced_at_or_before.map_or(true, |before| r <= before)
            }
        }
    }

    pub fn admits(&self, reference: Option<DateTime<Utc>>, last_fetched: DateTime<Utc>) -> bool {
        self.contains_age(reference) && last_fetched <= self.fetched_at_or_before
    }
}

/// Typed "due for refresh" predicate for resolved records on one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DueQuery {
    pub clauses: Vec<DueClause>,
    /// Resolved records with no snapshot are due regardless of tier.
    pub include_never_fetched: bool,
}

impl DueQuery {
    pub fn for_tiers(tiers: &TierSchedule, now: DateTime<Utc>) -> Self {
        let mut clauses = Vec::with_capacity(tiers.tiers().len());
        let mut previous_max: Option<Duration> = None;
        for (i, tier) in tiers.tiers().iter().enumerate() {
            clauses.push(DueClause {
                tier: tier.name.clone(),
                referenced_after: tier.max_age.map(|max| now - max),
                referenced_at_or_before: previous_max.map(|max| now - max),
                includes_undated: i == 0,
                fetched_at_or_before: now - tier.refresh_interval,
            });
            previous_max = tier.max_age;
        }
        Self {
            clauses,
            include_never_fetched: true,
        }
    }

    pub fn admits(&self, reference: Option<DateTime<Utc>>, last_fetched: Option<DateTime<Utc>>) -> bool {
        match last_fetched {
            None => self.include_never_fetched,
            Some(fetched) => self.clauses.iter().any(|c| c.admits(reference, fetched)),
        }
    }

    /// Applies the query to a record: only resolved posts with an external id qualify.
    pub fn admits_record(&self, record: &TrackedRecord, channel: Channel) -> bool {
        let Some(post) = record.channel(channel) else {
            return false;
        };
        if post.status != PostStatus::Resolved || post.external_id.is_none() {
            return false;
        }
        self.admits(record.freshness_reference(channel), record.last_fetched_on(channel))
    }
}

/// Time range in which a record's trigger or schedule must fall to be a match
/// candidate for a batch of external items.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CandidateWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl CandidateWindow {
    /// Span of the items' creation times widened by the match window on both
    /// sides. `None` for an empty batch.
    pub fn around(items: &[ExternalItem], match_window: Duration) -> Option<Self> {
        let earliest = items.iter().map(|i| i.created_at).min()?;
        let latest = items.iter().map(|i| i.created_at).max()?;
        Some(Self {
            start: earliest - match_window,
            end: latest + match_window,
        })
    }
}

pub struct CandidateSelector {
    store: Arc<dyn RecordStore>,
    tiers: TierSchedule,
}

impl CandidateSelector {
    pub fn new(store: Arc<dyn RecordStore>, tiers: TierSchedule) -> Self {
        Self { store, tiers }
    }

    /// Resolved records on `channel` whose snapshot is stale for their tier,
    /// plus every resolved record never fetched. Each record appears once.
    pub async fn select_due(&self, channel: Channel, now: DateTime<Utc>) -> Result<Vec<TrackedRecord>> {
        let query = DueQuery::for_tiers(&self.tiers, now);
        let rows = self.store.find_due_for_refresh(channel, &query).await?;

        let mut seen = HashSet::new();
        let due: Vec<TrackedRecord> = rows
            .into_iter()
            .filter(|r| query.admits_record(r, channel))
            .filter(|r| seen.insert(r.id))
            .collect();
        debug!(channel = %channel, due = due.len(), "Selected records due for refresh");
        Ok(due)
    }

    /// In-flight records on `channel` without an external id, timed within `window`.
    pub async fn select_unresolved(&self, channel: Channel, window: &CandidateWindow) -> Result<Vec<TrackedRecord>> {
        let rows = self
            .store
            .find_unresolved_in_window(channel, window.start, window.end)
            .await?;

        let mut seen = HashSet::new();
        let candidates: Vec<TrackedRecord> = rows
            .into_iter()
            .filter(|r| r.channel(channel).is_some_and(|p| p.awaiting_match()))
            .filter(|r| seen.insert(r.id))
            .collect();
        debug!(channel = %channel, candidates = candidates.len(), "Selected unresolved candidates");
        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::freshness::is_due;
    use crate::store::MemoryRecordStore;
    use crate::testing::{external_item, in_flight_record, metrics, resolved_record};

    #[test]
    fn clauses_partition_ages_like_classify() {
        let tiers = TierSchedule::default();
        let now = Utc::now();
        let query = DueQuery::for_tiers(&tiers, now);

        for hours in [0i64, 1, 23, 24, 25, 24 * 7, 24 * 30, 24 * 365] {
            let reference = Some(now - Duration::hours(hours));
            let containing: Vec<&str> = query
                .clauses
                .iter()
                .filter(|c| c.contains_age(reference))
                .map(|c| c.tier.as_str())
                .collect();
            assert_eq!(containing, vec![tiers.classify(reference, now).name.as_str()], "age {hours}h");
        }
    }

    #[test]
    fn undated_records_fall_in_freshest_clause_only() {
        let query = DueQuery::for_tiers(&TierSchedule::default(), Utc::now());
        let containing: Vec<&str> = query
            .clauses
            .iter()
            .filter(|c| c.contains_age(None))
            .map(|c| c.tier.as_str())
            .collect();
        assert_eq!(containing, vec!["fresh"]);
    }

    #[test]
    fn query_agrees_with_per_record_due_check() {
        let tiers = TierSchedule::default();
        let now = Utc::now();
        let query = DueQuery::for_tiers(&tiers, now);

        for posted_hours in [1i64, 30, 200, 1000] {
            for fetched_minutes in [10i64, 59, 60, 61, 400, 2000, 20000] {
                let record = resolved_record(
                    "x",
                    Channel::TikTok,
                    "v",
                    now - Duration::hours(posted_hours),
                    Some(metrics(1, 0, now - Duration::minutes(fetched_minutes))),
                );
                assert_eq!(
                    query.admits_record(&record, Channel::TikTok),
                    is_due(&tiers, &record, Channel::TikTok, now),
                    "posted {posted_hours}h ago, fetched {fetched_minutes}m ago"
                );
            }
        }
    }

    #[test]
    fn never_fetched_overrides_tier_policy() {
        let now = Utc::now();
        let query = DueQuery::for_tiers(&TierSchedule::default(), now);
        let record = resolved_record("x", Channel::TikTok, "v", now - Duration::days(400), None);
        assert!(query.admits_record(&record, Channel::TikTok));
    }

    #[test]
    fn unresolved_records_are_not_due() {
        let now = Utc::now();
        let query = DueQuery::for_tiers(&TierSchedule::default(), now);
        let record = in_flight_record("x", Channel::TikTok, now - Duration::hours(1));
        assert!(!query.admits_record(&record, Channel::TikTok));
    }

    #[test]
    fn candidate_window_spans_items_plus_match_window() {
        let now = Utc::now();
        let items = vec![
            external_item("a", "one", now - Duration::hours(5)),
            external_item("b", "two", now - Duration::hours(1)),
        ];
        let window = CandidateWindow::around(&items, Duration::hours(24)).unwrap();
        assert_eq!(window.start, now - Duration::hours(29));
        assert_eq!(window.end, now + Duration::hours(23));
        assert!(CandidateWindow::around(&[], Duration::hours(24)).is_none());
    }

    #[tokio::test]
    async fn select_due_returns_stale_and_never_fetched() {
        let now = Utc::now();
        let posted = now - Duration::hours(3);
        let stale = resolved_record("s", Channel::TikTok, "v1", posted, Some(metrics(1, 0, now - Duration::hours(2))));
        let fresh = resolved_record("f", Channel::TikTok, "v2", posted, Some(metrics(1, 0, now - Duration::minutes(5))));
        let never = resolved_record("n", Channel::TikTok, "v3", posted, None);
        let pending = in_flight_record("p", Channel::TikTok, posted);

        let store = Arc::new(MemoryRecordStore::with_records(vec![
            stale.clone(),
            fresh,
            never.clone(),
            pending,
        ]));
        let selector = CandidateSelector::new(store, TierSchedule::default());

        let due = selector.select_due(Channel::TikTok, now).await.unwrap();
        let ids: Vec<_> = due.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![stale.id, never.id]);
    }

    #[tokio::test]
    async fn select_unresolved_respects_window_and_channel() {
        let now = Utc::now();
        let inside = in_flight_record("in", Channel::TikTok, now - Duration::hours(2));
        let outside = in_flight_record("out", Channel::TikTok, now - Duration::days(5));
        let other_channel = in_flight_record("ig", Channel::Instagram, now - Duration::hours(2));

        let store = Arc::new(MemoryRecordStore::with_records(vec![
            inside.clone(),
            outside,
            other_channel,
        ]));
        let selector = CandidateSelector::new(store, TierSchedule::default());
        let window = CandidateWindow {
            start: now - Duration::days(1),
            end: now,
        };

        let candidates = selector.select_unresolved(Channel::TikTok, &window).await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].id, inside.id);
    }
}
