//! Rate-limit gate in front of every bulk platform fetch.
//!
//! The platform client owns the limit state (it sees the 429s); the guard only
//! decides whether a run may fetch now. A fetch under rate pressure is never
//! attempted partially.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use postsync_common::Channel;

use crate::traits::PlatformClient;

/// Rate-limit state as reported by a platform client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RateLimitState {
    pub limited: bool,
    pub reset_at: Option<DateTime<Utc>>,
}

impl RateLimitState {
    pub fn open() -> Self {
        Self::default()
    }

    pub fn limited_until(reset_at: Option<DateTime<Utc>>) -> Self {
        Self {
            limited: true,
            reset_at,
        }
    }

    /// Limited and, if a reset time is known, not yet past it.
    pub fn blocks_at(&self, now: DateTime<Utc>) -> bool {
        self.limited && self.reset_at.map_or(true, |reset| reset > now)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub reset_at: Option<DateTime<Utc>>,
}

pub struct RateLimitGuard {
    platform: Arc<dyn PlatformClient>,
}

impl RateLimitGuard {
    pub fn new(platform: Arc<dyn PlatformClient>) -> Self {
        Self { platform }
    }

    /// Whether a bulk fetch on `channel` may proceed at `now`.
    pub async fn check_and_maybe_skip(&self, channel: Channel, now: DateTime<Utc>) -> Result<RateLimitDecision> {
        let state = self.platform.rate_limit_state(channel).await?;
        if state.blocks_at(now) {
            info!(
                channel = %channel,
                reset_at = ?state.reset_at,
                "Platform rate limited, skipping bulk fetch"
            );
            return Ok(RateLimitDecision {
                allowed: false,
                reset_at: state.reset_at,
            });
        }
        Ok(RateLimitDecision {
            allowed: true,
            reset_at: None,
        })
    }
}

/// Per-channel limit state for clients that learn about limits from responses.
#[derive(Default)]
pub struct RateLimitTracker {
    states: Mutex<HashMap<Channel, RateLimitState>>,
}

impl RateLimitTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_limited(&self, channel: Channel, reset_at: Option<DateTime<Utc>>) {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        states.insert(channel, RateLimitState::limited_until(reset_at));
    }

    pub fn record_success(&self, channel: Channel) {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        states.remove(&channel);
    }

    pub fn state(&self, channel: Channel) -> RateLimitState {
        let states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        states.get(&channel).copied().unwrap_or_default()
    }
}
