use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{info, warn};

use postsync_common::Channel;

use crate::notify::Broadcaster;
use crate::traits::RecordStore;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SweepStats {
    pub checked: u64,
    pub marked_failed: u64,
    pub errors: u64,
}

/// Fails in-flight records that never showed up on the platform.
///
/// Failure is terminal for this engine; a failed record only comes back
/// through a manual retry elsewhere.
pub struct TimeoutSentinel {
    store: Arc<dyn RecordStore>,
    broadcaster: Arc<dyn Broadcaster>,
    timeout: Duration,
}

impl TimeoutSentinel {
    pub fn new(store: Arc<dyn RecordStore>, broadcaster: Arc<dyn Broadcaster>, timeout: Duration) -> Self {
        Self {
            store,
            broadcaster,
            timeout,
        }
    }

    pub async fn sweep(&self, channel: Channel, now: DateTime<Utc>) -> Result<SweepStats> {
        let cutoff = now - self.timeout;
        let stale = self.store.find_stale_in_flight(channel, cutoff).await?;
        let mut stats = SweepStats {
            checked: stale.len() as u64,
            ..Default::default()
        };

        for record in stale {
            let elapsed = record.match_reference_time().map(|t| now - t).unwrap_or(self.timeout);
            let reason = format!(
                "no {channel} post matched within {} of trigger (timeout {})",
                format_elapsed(elapsed),
                format_elapsed(self.timeout),
            );

            match self.store.mark_failed(record.id, channel, &reason, now).await {
                Ok(Some(updated)) => {
                    stats.marked_failed += 1;
                    info!(record_id = %record.id, channel = %channel, %reason, "Marked in-flight record failed");
                    if let Err(e) = self.broadcaster.notify_status_changed(&updated).await {
                        warn!(record_id = %record.id, error = %e, "Failed to broadcast status change");
                    }
                }
                Ok(None) => {
                    // Resolved or failed by someone else since the read.
                }
                Err(e) => {
                    stats.errors += 1;
                    warn!(record_id = %record.id, channel = %channel, error = %e, "Failed to mark record failed");
                }
            }
        }

        Ok(stats)
    }
}

/// `49h 12m` style rendering for failure reasons.
pub fn format_elapsed(d: Duration) -> String {
    let minutes = d.num_minutes().max(0);
    format!("{}h {}m", minutes / 60, minutes % 60)
}
