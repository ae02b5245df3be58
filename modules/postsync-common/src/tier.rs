//! Age-based refresh tiers.
//!
//! A tier covers every record whose age is below its `max_age` and at or above
//! the previous tier's. Younger content changes fastest, so tiers are expected
//! to refresh no more often as age grows.

use chrono::{DateTime, Duration, Utc};

use crate::config::parse_duration;
use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tier {
    pub name: String,
    /// Exclusive upper bound on age. `None` only for the last tier.
    pub max_age: Option<Duration>,
    pub refresh_interval: Duration,
}

impl Tier {
    pub fn bounded(name: &str, max_age: Duration, refresh_interval: Duration) -> Self {
        Self {
            name: name.to_string(),
            max_age: Some(max_age),
            refresh_interval,
        }
    }

    pub fn unbounded(name: &str, refresh_interval: Duration) -> Self {
        Self {
            name: name.to_string(),
            max_age: None,
            refresh_interval,
        }
    }
}

/// Validated, ordered tier list. Construct through [`TierSchedule::new`] or
/// [`TierSchedule::parse`]; both reject overlapping or unordered boundaries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierSchedule {
    tiers: Vec<Tier>,
}

impl TierSchedule {
    pub fn new(tiers: Vec<Tier>) -> Result<Self, ConfigError> {
        if tiers.is_empty() {
            return Err(ConfigError::Tiers("at least one tier is required".into()));
        }

        let last = tiers.len() - 1;
        let mut previous: Option<&Tier> = None;
        for (i, tier) in tiers.iter().enumerate() {
            if tier.refresh_interval <= Duration::zero() {
                return Err(ConfigError::Tiers(format!(
                    "tier '{}' needs a positive refresh interval",
                    tier.name
                )));
            }
            match (tier.max_age, i == last) {
                (None, false) => {
                    return Err(ConfigError::Tiers(format!(
                        "only the last tier may be unbounded, '{}' is not last",
                        tier.name
                    )));
                }
                (Some(_), true) => {
                    return Err(ConfigError::Tiers(format!(
                        "last tier '{}' must be unbounded",
                        tier.name
                    )));
                }
                (Some(max_age), false) if max_age <= Duration::zero() => {
                    return Err(ConfigError::Tiers(format!(
                        "tier '{}' needs a positive max age",
                        tier.name
                    )));
                }
                _ => {}
            }

            if let Some(prev) = previous {
                if let (Some(prev_max), Some(max)) = (prev.max_age, tier.max_age) {
                    if max <= prev_max {
                        return Err(ConfigError::Tiers(format!(
                            "tier '{}' must cover older content than '{}'",
                            tier.name, prev.name
                        )));
                    }
                }
                if tier.refresh_interval < prev.refresh_interval {
                    return Err(ConfigError::Tiers(format!(
                        "tier '{}' refreshes more often than younger tier '{}'",
                        tier.name, prev.name
                    )));
                }
            }
            previous = Some(tier);
        }

        Ok(Self { tiers })
    }

    /// Parse `name:max_age:refresh_interval` entries separated by commas.
    /// `*` as the max age marks the unbounded tier, e.g.
    /// `fresh:24h:1h,recent:7days:6h,archive:*:7days`.
    pub fn parse(list: &str) -> Result<Self, ConfigError> {
        let mut tiers = Vec::new();
        for entry in list.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let parts: Vec<&str> = entry.split(':').map(str::trim).collect();
            let [name, max_age, refresh] = parts.as_slice() else {
                return Err(ConfigError::Tiers(format!(
                    "expected name:max_age:refresh_interval, got '{entry}'"
                )));
            };
            let key = format!("tier {name}");
            let refresh_interval = parse_duration(&key, refresh)?;
            let max_age = match *max_age {
                "*" => None,
                raw => Some(parse_duration(&key, raw)?),
            };
            tiers.push(Tier {
                name: name.to_string(),
                max_age,
                refresh_interval,
            });
        }
        Self::new(tiers)
    }

    pub fn tiers(&self) -> &[Tier] {
        &self.tiers
    }

    pub fn freshest(&self) -> &Tier {
        &self.tiers[0]
    }

    /// First tier whose `max_age` exceeds the age of `reference`; the unbounded
    /// tier otherwise. A missing reference is treated as brand new.
    pub fn classify(&self, reference: Option<DateTime<Utc>>, now: DateTime<Utc>) -> &Tier {
        let Some(reference) = reference else {
            return self.freshest();
        };
        let age = now - reference;
        self.tiers
            .iter()
            .find(|tier| tier.max_age.map_or(true, |max| max > age))
            .unwrap_or(&self.tiers[self.tiers.len() - 1])
    }
}

impl Default for TierSchedule {
    fn default() -> Self {
        Self {
            tiers: vec![
                Tier::bounded("fresh", Duration::hours(24), Duration::hours(1)),
                Tier::bounded("recent", Duration::days(7), Duration::hours(6)),
                Tier::bounded("established", Duration::days(30), Duration::hours(24)),
                Tier::unbounded("archive", Duration::days(7)),
            ],
        }
    }
}
