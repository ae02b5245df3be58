use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

use chrono::Duration;
use tracing::info;

use crate::error::ConfigError;
use crate::tier::TierSchedule;
use crate::types::Channel;

const DEFAULT_TIERS: &str = "fresh:24h:1h,recent:7days:6h,established:30days:24h,archive:*:7days";

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub channels: Vec<Channel>,

    // Matching
    pub match_window: Duration,
    pub lookback: Duration,
    pub caption_prefix_chars: usize,

    // Deadlines and cadence
    pub in_flight_timeout: Duration,
    pub run_interval: std::time::Duration,

    // Fetch sizing
    pub fetch_limit: u32,
    pub refresh_batch_size: usize,

    pub tiers: TierSchedule,

    // Platform access
    pub apify_api_token: Option<String>,
    pub profiles: HashMap<Channel, String>,

    // Collaborators
    pub webhook_url: Option<String>,
    pub store_path: PathBuf,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let channels = get("POSTSYNC_CHANNELS")
            .unwrap_or_else(|| "tiktok".to_string())
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::parse::<Channel>)
            .collect::<Result<Vec<_>, _>>()?;
        if channels.is_empty() {
            return Err(ConfigError::Invalid {
                key: "POSTSYNC_CHANNELS".into(),
                message: "at least one channel is required".into(),
            });
        }

        let duration = |key: &str, default: &str| -> Result<Duration, ConfigError> {
            parse_duration(key, &get(key).unwrap_or_else(|| default.to_string()))
        };

        let run_interval = duration("POSTSYNC_RUN_INTERVAL", "15m")?
            .to_std()
            .map_err(|e| invalid("POSTSYNC_RUN_INTERVAL", e))?;

        let tiers = TierSchedule::parse(&get("POSTSYNC_TIERS").unwrap_or_else(|| DEFAULT_TIERS.to_string()))?;

        let profiles = channels
            .iter()
            .filter_map(|ch| {
                let key = format!("POSTSYNC_PROFILE_{}", ch.as_str().to_ascii_uppercase());
                get(&key).map(|profile| (*ch, profile))
            })
            .collect();

        Ok(Self {
            match_window: duration("POSTSYNC_MATCH_WINDOW", "24h")?,
            lookback: duration("POSTSYNC_LOOKBACK", "14days")?,
            caption_prefix_chars: number("POSTSYNC_CAPTION_PREFIX", get("POSTSYNC_CAPTION_PREFIX"), 50)?,
            in_flight_timeout: duration("POSTSYNC_INFLIGHT_TIMEOUT", "48h")?,
            run_interval,
            fetch_limit: number("POSTSYNC_FETCH_LIMIT", get("POSTSYNC_FETCH_LIMIT"), 50)?,
            refresh_batch_size: number("POSTSYNC_REFRESH_BATCH", get("POSTSYNC_REFRESH_BATCH"), 20)?,
            tiers,
            apify_api_token: get("APIFY_API_TOKEN"),
            profiles,
            webhook_url: get("POSTSYNC_WEBHOOK_URL"),
            store_path: PathBuf::from(
                get("POSTSYNC_STORE_PATH").unwrap_or_else(|| "data/records.json".to_string()),
            ),
            channels,
        })
    }

    /// Log the effective configuration without secrets.
    pub fn log_redacted(&self) {
        let channels: Vec<&str> = self.channels.iter().map(Channel::as_str).collect();
        let tiers: Vec<String> = self
            .tiers
            .tiers()
            .iter()
            .map(|t| match t.max_age {
                Some(max) => format!("{}<{}h/{}m", t.name, max.num_hours(), t.refresh_interval.num_minutes()),
                None => format!("{}/{}m", t.name, t.refresh_interval.num_minutes()),
            })
            .collect();
        info!(
            channels = channels.join(","),
            match_window_hours = self.match_window.num_hours(),
            lookback_days = self.lookback.num_days(),
            in_flight_timeout_hours = self.in_flight_timeout.num_hours(),
            run_interval_secs = self.run_interval.as_secs(),
            fetch_limit = self.fetch_limit,
            refresh_batch_size = self.refresh_batch_size,
            tiers = tiers.join(" "),
            apify_token_set = self.apify_api_token.is_some(),
            webhook_set = self.webhook_url.is_some(),
            store_path = %self.store_path.display(),
            "Loaded configuration"
        );
    }
}

fn invalid(key: &str, err: impl std::fmt::Display) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        message: err.to_string(),
    }
}

fn number<T: std::str::FromStr>(key: &str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match raw {
        Some(v) => v.trim().parse().map_err(|e| invalid(key, e)),
        None => Ok(default),
    }
}

/// Parse a human duration (`90s`, `15m`, `24h`, `14days`).
pub fn parse_duration(key: &str, raw: &str) -> Result<Duration, ConfigError> {
    let std_duration = humantime::parse_duration(raw.trim()).map_err(|e| invalid(key, e))?;
    Duration::from_std(std_duration).map_err(|e| invalid(key, e))
}
