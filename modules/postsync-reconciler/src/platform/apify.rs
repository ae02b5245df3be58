// Apify-backed platform client (TikTok, Instagram, YouTube).

use std::collections::HashMap;

use anyhow::{anyhow, Context, Result};
use apify_client::{ApifyClient, ApifyError, PlatformPost};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use tracing::{info, warn};

use postsync_common::{Channel, ExternalItem, MetricCounts};

use crate::rate_limit::{RateLimitState, RateLimitTracker};
use crate::traits::PlatformClient;

/// Back-off assumed when a 429 arrives without a `Retry-After` header.
const DEFAULT_RATE_LIMIT_BACKOFF_MINUTES: i64 = 15;

pub struct ApifyPlatform {
    client: ApifyClient,
    profiles: HashMap<Channel, String>,
    limits: RateLimitTracker,
}

impl ApifyPlatform {
    pub fn new(client: ApifyClient, profiles: HashMap<Channel, String>) -> Self {
        Self {
            client,
            profiles,
            limits: RateLimitTracker::new(),
        }
    }

    fn profile(&self, channel: Channel) -> Result<&str> {
        self.profiles
            .get(&channel)
            .map(String::as_str)
            .ok_or_else(|| anyhow!("No account profile configured for {channel}"))
    }

    /// Track limit state from the outcome of an Apify call.
    fn observe(&self, channel: Channel, result: apify_client::Result<Vec<PlatformPost>>) -> Result<Vec<ExternalItem>> {
        match result {
            Ok(posts) => {
                self.limits.record_success(channel);
                Ok(posts.into_iter().map(to_external_item).collect())
            }
            Err(ApifyError::RateLimited { retry_after_secs }) => {
                let backoff = retry_after_secs
                    .and_then(|s| i64::try_from(s).ok())
                    .map(Duration::seconds)
                    .unwrap_or_else(|| Duration::minutes(DEFAULT_RATE_LIMIT_BACKOFF_MINUTES));
                let reset_at = Utc::now() + backoff;
                warn!(channel = %channel, %reset_at, "Apify rate limited");
                self.limits.record_limited(channel, Some(reset_at));
                Err(anyhow!(ApifyError::RateLimited { retry_after_secs }))
            }
            Err(e) => Err(anyhow!(e)),
        }
    }
}

#[async_trait]
impl PlatformClient for ApifyPlatform {
    async fn list_recent_items(&self, channel: Channel, limit: u32) -> Result<Vec<ExternalItem>> {
        let profile = self.profile(channel)?;
        info!(channel = %channel, profile, limit, "Listing recent platform items");

        let result = match channel {
            Channel::TikTok => self.client.tiktok_profile_videos(profile, limit).await,
            Channel::Instagram => self.client.instagram_profile_posts(profile, limit).await,
            Channel::YouTube => self.client.youtube_channel_videos(profile, limit).await,
        };
        self.observe(channel, result)
            .with_context(|| format!("Apify listing for {channel} profile {profile}"))
    }

    async fn fetch_items(&self, channel: Channel, external_ids: &[String]) -> Result<Vec<ExternalItem>> {
        if external_ids.is_empty() {
            return Ok(Vec::new());
        }
        let profile = self.profile(channel)?;
        let urls: Vec<String> = external_ids
            .iter()
            .map(|id| item_url(channel, profile, id))
            .collect();
        info!(channel = %channel, count = urls.len(), "Fetching platform items by id");

        let result = match channel {
            Channel::TikTok => self.client.tiktok_videos(&urls).await,
            Channel::Instagram => self.client.instagram_posts(&urls).await,
            Channel::YouTube => self.client.youtube_videos(&urls).await,
        };
        self.observe(channel, result)
            .with_context(|| format!("Apify item fetch for {channel}"))
    }

    async fn rate_limit_state(&self, channel: Channel) -> Result<RateLimitState> {
        Ok(self.limits.state(channel))
    }
}

/// Canonical public URL of an item, which is what the scrapers accept as input.
fn item_url(channel: Channel, profile: &str, external_id: &str) -> String {
    match channel {
        Channel::TikTok => format!("https://www.tiktok.com/@{profile}/video/{external_id}"),
        Channel::Instagram => format!("https://www.instagram.com/p/{external_id}/"),
        Channel::YouTube => format!("https://www.youtube.com/watch?v={external_id}"),
    }
}

fn to_external_item(post: PlatformPost) -> ExternalItem {
    ExternalItem {
        external_id: post.id,
        created_at: post.created_at,
        caption: post.caption,
        url: post.url,
        metrics: MetricCounts {
            views: post.views,
            likes: post.likes,
            comments: post.comments,
            shares: post.shares,
            saved: post.saved,
            reach: post.reach,
        },
    }
}
