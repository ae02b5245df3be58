pub mod error;
pub mod types;

pub use error::{ApifyError, Result};
pub use types::{
    InstagramPost, InstagramScraperInput, PlatformPost, RunData, StartUrl, TikTokScraperInput,
    TikTokVideo, YouTubeScraperInput, YouTubeVideo,
};

use serde::de::DeserializeOwned;
use serde::Serialize;
use types::ApiResponse;

const BASE_URL: &str = "https://api.apify.com/v2";

/// Actor ID for clockworks/tiktok-scraper.
const TIKTOK_SCRAPER: &str = "GdWCkxBtKWOsKjdch";

/// Actor ID for apify/instagram-scraper.
const INSTAGRAM_SCRAPER: &str = "shu8hvrXbJbY3Eb9W";

/// Actor ID for streamers/youtube-scraper.
const YOUTUBE_SCRAPER: &str = "h7sDV53CddomktSi5";

pub struct ApifyClient {
    client: reqwest::Client,
    token: String,
    base_url: String,
}

impl ApifyClient {
    pub fn new(token: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            token,
            base_url: BASE_URL.to_string(),
        }
    }

    /// Point the client at a different API root (proxies, local stubs).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Map a non-success response to an error. 429 becomes `RateLimited`.
    async fn check(resp: reqwest::Response) -> Result<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok());
            return Err(ApifyError::RateLimited { retry_after_secs });
        }

        let body = resp.text().await.unwrap_or_default();
        Err(ApifyError::Api {
            status: status.as_u16(),
            message: body,
        })
    }

    /// Start an actor run. Returns immediately with run metadata.
    pub async fn start_run<I: Serialize + ?Sized>(&self, actor_id: &str, input: &I) -> Result<RunData> {
        let url = format!("{}/acts/{}/runs", self.base_url, actor_id);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(input)
            .send()
            .await?;

        let api_resp: ApiResponse<RunData> = Self::check(resp).await?.json().await?;
        Ok(api_resp.data)
    }

    /// Poll until a run completes. Uses `waitForFinish=60` for efficient long-polling.
    pub async fn wait_for_run(&self, run_id: &str) -> Result<RunData> {
        loop {
            let url = format!("{}/actor-runs/{}?waitForFinish=60", self.base_url, run_id);
            let resp = self
                .client
                .get(&url)
                .bearer_auth(&self.token)
                .send()
                .await?;

            let api_resp: ApiResponse<RunData> = Self::check(resp).await?.json().await?;
            match api_resp.data.status.as_str() {
                "SUCCEEDED" => return Ok(api_resp.data),
                "FAILED" | "ABORTED" | "TIMED-OUT" => {
                    return Err(ApifyError::RunFailed(api_resp.data.status));
                }
                _ => {
                    tracing::debug!(run_id, status = %api_resp.data.status, "Run still in progress");
                    continue;
                }
            }
        }
    }

    /// Fetch dataset items from a completed run.
    pub async fn get_dataset_items<T: DeserializeOwned>(&self, dataset_id: &str) -> Result<Vec<T>> {
        let url = format!("{}/datasets/{}/items?format=json", self.base_url, dataset_id);
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await?;

        let items: Vec<T> = Self::check(resp).await?.json().await?;
        Ok(items)
    }

    /// Run an actor end-to-end: start, poll, fetch the default dataset.
    async fn run_actor<I, T>(&self, actor_id: &str, input: &I) -> Result<Vec<T>>
    where
        I: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let run = self.start_run(actor_id, input).await?;
        tracing::info!(run_id = %run.id, actor_id, "Apify run started, polling for completion");

        let completed = self.wait_for_run(&run.id).await?;
        tracing::info!(
            run_id = %completed.id,
            dataset_id = %completed.default_dataset_id,
            "Run completed, fetching results"
        );

        self.get_dataset_items(&completed.default_dataset_id).await
    }

    /// Most recent videos on a TikTok profile.
    pub async fn tiktok_profile_videos(&self, profile: &str, limit: u32) -> Result<Vec<PlatformPost>> {
        tracing::info!(profile, limit, "Starting TikTok profile scrape");
        let input = TikTokScraperInput {
            profiles: vec![profile.to_string()],
            results_per_page: limit,
            ..Default::default()
        };
        let rows: Vec<TikTokVideo> = self.run_actor(TIKTOK_SCRAPER, &input).await?;
        let posts: Vec<PlatformPost> = rows.into_iter().filter_map(TikTokVideo::into_platform_post).collect();
        tracing::info!(count = posts.len(), "Fetched TikTok videos");
        Ok(posts)
    }

    /// Current state of specific TikTok videos, by URL.
    pub async fn tiktok_videos(&self, urls: &[String]) -> Result<Vec<PlatformPost>> {
        if urls.is_empty() {
            return Ok(Vec::new());
        }
        let input = TikTokScraperInput {
            post_urls: urls.to_vec(),
            results_per_page: urls.len() as u32,
            ..Default::default()
        };
        let rows: Vec<TikTokVideo> = self.run_actor(TIKTOK_SCRAPER, &input).await?;
        Ok(rows.into_iter().filter_map(TikTokVideo::into_platform_post).collect())
    }

    /// Most recent posts on an Instagram profile.
    pub async fn instagram_profile_posts(&self, username: &str, limit: u32) -> Result<Vec<PlatformPost>> {
        tracing::info!(username, limit, "Starting Instagram profile scrape");
        let input = InstagramScraperInput {
            direct_urls: vec![format!("https://www.instagram.com/{username}/")],
            results_type: "posts".to_string(),
            results_limit: limit,
        };
        let rows: Vec<InstagramPost> = self.run_actor(INSTAGRAM_SCRAPER, &input).await?;
        let posts: Vec<PlatformPost> = rows.into_iter().filter_map(InstagramPost::into_platform_post).collect();
        tracing::info!(count = posts.len(), "Fetched Instagram posts");
        Ok(posts)
    }

    /// Current state of specific Instagram posts, by URL.
    pub async fn instagram_posts(&self, urls: &[String]) -> Result<Vec<PlatformPost>> {
        if urls.is_empty() {
            return Ok(Vec::new());
        }
        let input = InstagramScraperInput {
            direct_urls: urls.to_vec(),
            results_type: "details".to_string(),
            results_limit: urls.len() as u32,
        };
        let rows: Vec<InstagramPost> = self.run_actor(INSTAGRAM_SCRAPER, &input).await?;
        Ok(rows.into_iter().filter_map(InstagramPost::into_platform_post).collect())
    }

    /// Most recent videos on a YouTube channel.
    pub async fn youtube_channel_videos(&self, handle: &str, limit: u32) -> Result<Vec<PlatformPost>> {
        tracing::info!(handle, limit, "Starting YouTube channel scrape");
        let input = YouTubeScraperInput {
            start_urls: vec![StartUrl {
                url: format!("https://www.youtube.com/@{}/shorts", handle.trim_start_matches('@')),
            }],
            max_results: limit,
        };
        let rows: Vec<YouTubeVideo> = self.run_actor(YOUTUBE_SCRAPER, &input).await?;
        let posts: Vec<PlatformPost> = rows.into_iter().filter_map(YouTubeVideo::into_platform_post).collect();
        tracing::info!(count = posts.len(), "Fetched YouTube videos");
        Ok(posts)
    }

    /// Current state of specific YouTube videos, by URL.
    pub async fn youtube_videos(&self, urls: &[String]) -> Result<Vec<PlatformPost>> {
        if urls.is_empty() {
            return Ok(Vec::new());
        }
        let input = YouTubeScraperInput {
            start_urls: urls.iter().map(|url| StartUrl { url: url.clone() }).collect(),
            max_results: urls.len() as u32,
        };
        let rows: Vec<YouTubeVideo> = self.run_actor(YOUTUBE_SCRAPER, &input).await?;
        Ok(rows.into_iter().filter_map(YouTubeVideo::into_platform_post).collect())
    }
}
