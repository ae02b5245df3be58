use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// --- Platform-agnostic post type ---

/// A published post from any supported platform, with its engagement counters.
/// Platform-specific dataset rows convert into this.
#[derive(Debug, Clone, PartialEq)]
pub struct PlatformPost {
    /// Platform-native identifier (TikTok video id, Instagram shortcode, YouTube video id).
    pub id: String,
    pub caption: String,
    pub url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub views: u64,
    pub likes: u64,
    pub comments: u64,
    pub shares: u64,
    pub saved: u64,
    /// Only reported by some actors; zero when unknown.
    pub reach: u64,
}

fn count(value: Option<i64>) -> u64 {
    value.map(|v| v.max(0) as u64).unwrap_or(0)
}

fn parse_timestamp(raw: Option<&str>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// Wrapper for Apify API responses.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiResponse<T> {
    pub data: T,
}

/// A start URL entry for actors that take `startUrls`.
#[derive(Debug, Clone, Serialize)]
pub struct StartUrl {
    pub url: String,
}

// --- TikTok (clockworks/tiktok-scraper) ---

/// Input for the clockworks/tiktok-scraper actor.
/// Either `profiles` or `post_urls` is populated, never both.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TikTokScraperInput {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub profiles: Vec<String>,
    #[serde(rename = "postURLs", skip_serializing_if = "Vec::is_empty")]
    pub post_urls: Vec<String>,
    #[serde(rename = "resultsPerPage")]
    pub results_per_page: u32,
}

/// A single TikTok video from the Apify dataset.
#[derive(Debug, Clone, Deserialize)]
pub struct TikTokVideo {
    pub id: Option<String>,
    pub text: Option<String>,
    #[serde(rename = "webVideoUrl")]
    pub web_video_url: Option<String>,
    #[serde(rename = "createTimeISO")]
    pub create_time_iso: Option<String>,
    #[serde(rename = "diggCount")]
    pub digg_count: Option<i64>,
    #[serde(rename = "shareCount")]
    pub share_count: Option<i64>,
    #[serde(rename = "playCount")]
    pub play_count: Option<i64>,
    #[serde(rename = "commentCount")]
    pub comment_count: Option<i64>,
    #[serde(rename = "collectCount")]
    pub collect_count: Option<i64>,
}

impl TikTokVideo {
    /// Rows without an id or creation time cannot be reconciled and are dropped.
    pub fn into_platform_post(self) -> Option<PlatformPost> {
        let created_at = parse_timestamp(self.create_time_iso.as_deref())?;
        Some(PlatformPost {
            id: self.id?,
            caption: self.text.unwrap_or_default(),
            url: self.web_video_url,
            created_at,
            views: count(self.play_count),
            likes: count(self.digg_count),
            comments: count(self.comment_count),
            shares: count(self.share_count),
            saved: count(self.collect_count),
            reach: 0,
        })
    }
}

// --- Instagram (apify/instagram-scraper) ---

/// Input for the apify/instagram-scraper actor.
#[derive(Debug, Clone, Serialize)]
pub struct InstagramScraperInput {
    #[serde(rename = "directUrls")]
    pub direct_urls: Vec<String>,
    #[serde(rename = "resultsType")]
    pub results_type: String,
    #[serde(rename = "resultsLimit")]
    pub results_limit: u32,
}

/// A single Instagram post from the Apify dataset.
#[derive(Debug, Clone, Deserialize)]
pub struct InstagramPost {
    pub id: Option<String>,
    pub caption: Option<String>,
    pub url: Option<String>,
    #[serde(rename = "shortCode")]
    pub short_code: Option<String>,
    #[serde(rename = "likesCount")]
    pub likes_count: Option<i64>,
    #[serde(rename = "commentsCount")]
    pub comments_count: Option<i64>,
    #[serde(rename = "videoViewCount")]
    pub video_view_count: Option<i64>,
    #[serde(rename = "videoPlayCount")]
    pub video_play_count: Option<i64>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl InstagramPost {
    /// The shortcode is the identifier used in post URLs, so it is preferred
    /// over the numeric id.
    pub fn into_platform_post(self) -> Option<PlatformPost> {
        let id = self.short_code.or(self.id)?;
        let views = self.video_play_count.or(self.video_view_count);
        Some(PlatformPost {
            id,
            caption: self.caption.unwrap_or_default(),
            url: self.url,
            created_at: self.timestamp?,
            views: count(views),
            likes: count(self.likes_count),
            comments: count(self.comments_count),
            shares: 0,
            saved: 0,
            reach: 0,
        })
    }
}

// --- YouTube (streamers/youtube-scraper) ---

/// Input for the streamers/youtube-scraper actor.
#[derive(Debug, Clone, Serialize)]
pub struct YouTubeScraperInput {
    #[serde(rename = "startUrls")]
    pub start_urls: Vec<StartUrl>,
    #[serde(rename = "maxResults")]
    pub max_results: u32,
}

/// A single YouTube video from the Apify dataset.
#[derive(Debug, Clone, Deserialize)]
pub struct YouTubeVideo {
    pub id: Option<String>,
    pub title: Option<String>,
    pub text: Option<String>,
    pub url: Option<String>,
    pub date: Option<String>,
    #[serde(rename = "viewCount")]
    pub view_count: Option<i64>,
    pub likes: Option<i64>,
    #[serde(rename = "commentsCount")]
    pub comments_count: Option<i64>,
}

impl YouTubeVideo {
    /// Shorts carry the caption in `title`; long descriptions go to `text`.
    pub fn into_platform_post(self) -> Option<PlatformPost> {
        let created_at = parse_timestamp(self.date.as_deref())?;
        let caption = self.title.or(self.text).unwrap_or_default();
        Some(PlatformPost {
            id: self.id?,
            caption,
            url: self.url,
            created_at,
            views: count(self.view_count),
            likes: count(self.likes),
            comments: count(self.comments_count),
            shares: 0,
            saved: 0,
            reach: 0,
        })
    }
}

/// Apify actor run metadata.
#[derive(Debug, Clone, Deserialize)]
pub struct RunData {
    pub id: String,
    pub status: String,
    #[serde(rename = "defaultDatasetId")]
    pub default_dataset_id: String,
    #[serde(rename = "startedAt")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(rename = "finishedAt")]
    pub finished_at: Option<DateTime<Utc>>,
}
