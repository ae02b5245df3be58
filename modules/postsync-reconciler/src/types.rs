use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use postsync_common::Channel;

/// Counters from one reconciliation run.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct RunStats {
    /// Items returned by the platform.
    pub fetched: u64,
    /// Items inside the lookback horizon.
    pub in_window: u64,
    pub matched: u64,
    pub unmatched: u64,
    /// Items whose external id was already resolved to a record.
    pub already_known: u64,
    pub metrics_updated: u64,
    pub errors: u64,
    /// Records failed by the timeout sweep.
    pub timeouts: u64,
    pub sweep_checked: u64,
    /// Resolved records due for a refresh after the matching pass.
    pub refresh_due: u64,
    /// Due records left for the next run because the rate limit closed mid-refresh.
    pub refresh_deferred: u64,
}

impl fmt::Display for RunStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "fetched={} in_window={} matched={} unmatched={} already_known={} metrics_updated={} errors={} timeouts={} refresh_due={} refresh_deferred={}",
            self.fetched,
            self.in_window,
            self.matched,
            self.unmatched,
            self.already_known,
            self.metrics_updated,
            self.errors,
            self.timeouts,
            self.refresh_due,
            self.refresh_deferred,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    RateLimited { reset_at: Option<DateTime<Utc>> },
    AlreadyRunning,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RateLimited { .. } => write!(f, "rate_limited"),
            Self::AlreadyRunning => write!(f, "already_running"),
        }
    }
}

/// Terminal state of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Skipped(SkipReason),
    Failed { error: String },
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Skipped(reason) => write!(f, "skipped({reason})"),
            Self::Failed { error } => write!(f, "failed({error})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub channel: Channel,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    pub stats: RunStats,
}

impl RunReport {
    pub fn is_skipped(&self) -> bool {
        matches!(self.status, RunStatus::Skipped(_))
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "channel={} status={} {}", self.channel, self.status, self.stats)
    }
}

/// Snapshot of one channel orchestrator for status reporting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelStatus {
    pub channel: Channel,
    pub running: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_run: Option<RunReport>,
}
