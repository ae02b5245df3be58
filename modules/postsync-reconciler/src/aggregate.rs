//! Cross-channel metric aggregation.
//!
//! Always recomputed from every resolved channel: reach is a max and the
//! engagement rate is derived from the summed counters, so neither can be
//! patched incrementally from a single channel's change.

use std::collections::BTreeMap;

use postsync_common::{engagement_rate, AggregateSnapshot, Channel, ChannelPost, PostStatus};

/// Summarize the snapshots of all resolved channels.
pub fn aggregate(channels: &BTreeMap<Channel, ChannelPost>) -> AggregateSnapshot {
    let mut summary = AggregateSnapshot::default();

    for post in channels.values().filter(|p| p.status == PostStatus::Resolved) {
        let Some(metrics) = &post.metrics else {
            continue;
        };
        summary.views += metrics.views;
        summary.likes += metrics.likes;
        summary.comments += metrics.comments;
        summary.shares += metrics.shares;
        summary.saved += metrics.saved;
        summary.reach = summary.reach.max(metrics.reach);
        summary.channels += 1;
    }

    summary.engagement_rate = engagement_rate(summary.likes, summary.comments, summary.shares, summary.views);
    summary
}
