//! Freshness classification for tracked records.

use chrono::{DateTime, Utc};

use postsync_common::{Channel, Tier, TierSchedule, TrackedRecord};

/// Tier for a record on `channel`, from its best available live timestamp
/// (posted, then triggered, then scheduled). Records with none of these are
/// treated as brand new so they get checked often.
pub fn classify_record<'a>(
    tiers: &'a TierSchedule,
    record: &TrackedRecord,
    channel: Channel,
    now: DateTime<Utc>,
) -> &'a Tier {
    tiers.classify(record.freshness_reference(channel), now)
}

/// Whether the channel snapshot is older than the tier's refresh interval.
/// Never-fetched snapshots are always due.
pub fn is_due(tiers: &TierSchedule, record: &TrackedRecord, channel: Channel, now: DateTime<Utc>) -> bool {
    match record.last_fetched_on(channel) {
        None => true,
        Some(fetched) => now - fetched >= classify_record(tiers, record, channel, now).refresh_interval,
    }
}
