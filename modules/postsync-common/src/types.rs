use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ConfigError;

// --- Channels ---

/// A platform channel content is published to. Each channel is reconciled
/// independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Channel {
    #[serde(rename = "tiktok")]
    TikTok,
    #[serde(rename = "instagram")]
    Instagram,
    #[serde(rename = "youtube")]
    YouTube,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::TikTok, Channel::Instagram, Channel::YouTube];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TikTok => "tiktok",
            Self::Instagram => "instagram",
            Self::YouTube => "youtube",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tiktok" => Ok(Self::TikTok),
            "instagram" => Ok(Self::Instagram),
            "youtube" => Ok(Self::YouTube),
            other => Err(ConfigError::UnknownChannel(other.to_string())),
        }
    }
}

// --- Lifecycle ---

/// Per-channel lifecycle of a tracked post.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostStatus {
    /// Scheduled, trigger not fired yet.
    Pending,
    /// Trigger fired; waiting for the platform item to show up.
    InFlight,
    Resolved,
    Failed,
}

impl fmt::Display for PostStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::InFlight => write!(f, "in_flight"),
            Self::Resolved => write!(f, "resolved"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

// --- Metrics ---

/// Raw engagement counters as observed on the platform.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricCounts {
    pub views: u64,
    pub likes: u64,
    pub comments: u64,
    pub shares: u64,
    pub saved: u64,
    pub reach: u64,
}

/// `(likes + comments + shares) / views * 100`, or 0 with no views.
pub fn engagement_rate(likes: u64, comments: u64, shares: u64, views: u64) -> f64 {
    if views == 0 {
        return 0.0;
    }
    (likes + comments + shares) as f64 / views as f64 * 100.0
}

/// Metrics for one record on one channel, as of `last_fetched_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSnapshot {
    pub views: u64,
    pub likes: u64,
    pub comments: u64,
    pub shares: u64,
    pub saved: u64,
    pub reach: u64,
    pub engagement_rate: f64,
    pub last_fetched_at: DateTime<Utc>,
}

impl MetricSnapshot {
    pub fn from_counts(counts: &MetricCounts, fetched_at: DateTime<Utc>) -> Self {
        Self {
            views: counts.views,
            likes: counts.likes,
            comments: counts.comments,
            shares: counts.shares,
            saved: counts.saved,
            reach: counts.reach,
            engagement_rate: engagement_rate(counts.likes, counts.comments, counts.shares, counts.views),
            last_fetched_at: fetched_at,
        }
    }
}

/// Cross-channel summary. Always recomputed from every resolved channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateSnapshot {
    pub views: u64,
    pub likes: u64,
    pub comments: u64,
    pub shares: u64,
    pub saved: u64,
    pub reach: u64,
    pub engagement_rate: f64,
    pub channels: u32,
}

// --- Records ---

/// State of a record on a single channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelPost {
    pub status: PostStatus,
    pub external_id: Option<String>,
    pub external_posted_at: Option<DateTime<Utc>>,
    pub metrics: Option<MetricSnapshot>,
    pub failed_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
}

impl ChannelPost {
    pub fn with_status(status: PostStatus) -> Self {
        Self {
            status,
            external_id: None,
            external_posted_at: None,
            metrics: None,
            failed_at: None,
            failure_reason: None,
        }
    }

    pub fn pending() -> Self {
        Self::with_status(PostStatus::Pending)
    }

    pub fn in_flight() -> Self {
        Self::with_status(PostStatus::InFlight)
    }

    /// In flight and no external identity yet: a legal target for a match or a timeout.
    pub fn awaiting_match(&self) -> bool {
        self.status == PostStatus::InFlight && self.external_id.is_none()
    }
}

/// One piece of content scheduled for publication through the external pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedRecord {
    pub id: Uuid,
    pub caption: String,
    pub scheduled_at: Option<DateTime<Utc>>,
    /// When the external pipeline was actually invoked.
    pub trigger_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub channels: BTreeMap<Channel, ChannelPost>,
    #[serde(default)]
    pub aggregate: Option<AggregateSnapshot>,
}

impl TrackedRecord {
    pub fn new(caption: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            caption: caption.into(),
            scheduled_at: None,
            trigger_at: None,
            channels: BTreeMap::new(),
            aggregate: None,
        }
    }

    pub fn channel(&self, channel: Channel) -> Option<&ChannelPost> {
        self.channels.get(&channel)
    }

    pub fn status_on(&self, channel: Channel) -> Option<PostStatus> {
        self.channel(channel).map(|p| p.status)
    }

    pub fn external_id_on(&self, channel: Channel) -> Option<&str> {
        self.channel(channel).and_then(|p| p.external_id.as_deref())
    }

    pub fn last_fetched_on(&self, channel: Channel) -> Option<DateTime<Utc>> {
        self.channel(channel)
            .and_then(|p| p.metrics.as_ref())
            .map(|m| m.last_fetched_at)
    }

    /// Time used to compare against an external item's creation time:
    /// the trigger if known, else the schedule.
    pub fn match_reference_time(&self) -> Option<DateTime<Utc>> {
        self.trigger_at.or(self.scheduled_at)
    }

    /// Best guess at when the content went live on `channel`, used for tiering.
    pub fn freshness_reference(&self, channel: Channel) -> Option<DateTime<Utc>> {
        self.channel(channel)
            .and_then(|p| p.external_posted_at)
            .or(self.trigger_at)
            .or(self.scheduled_at)
    }
}

/// An item observed on the platform during one reconciliation pass. Not persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalItem {
    pub external_id: String,
    pub created_at: DateTime<Utc>,
    pub caption: String,
    pub url: Option<String>,
    pub metrics: MetricCounts,
}
