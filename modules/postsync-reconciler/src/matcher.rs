//! Entity matching between platform items and in-flight records.
//!
//! There is no shared key: the only evidence is the caption and the timing.
//! Matching runs in two passes. The exact pass compares normalized captions
//! case-sensitively; only when nothing matches exactly does the fuzzy pass test
//! containment between lower-cased captions. In both passes the candidate
//! closest in time wins, and the winner is accepted only within the match window.

use std::fmt;
use std::sync::LazyLock;

use chrono::Duration;
use regex::Regex;
use serde::Serialize;
use uuid::Uuid;

use postsync_common::{Channel, ExternalItem, TrackedRecord};

static HASHTAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"#[\p{L}\p{N}_]+").expect("valid regex"));
static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));

/// Strip hashtags, collapse whitespace runs to one space, trim. Case is kept.
pub fn normalize_caption(raw: &str) -> String {
    let without_tags = HASHTAG.replace_all(raw, " ");
    WHITESPACE.replace_all(&without_tags, " ").trim().to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMethod {
    CaptionExact,
    CaptionContains,
}

impl fmt::Display for MatchMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CaptionExact => write!(f, "caption_exact"),
            Self::CaptionContains => write!(f, "caption_contains"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnmatchedReason {
    /// The item's caption is empty once hashtags and whitespace are removed.
    EmptyCaption,
    NoCandidates,
    NoCaptionMatch,
    /// Best caption match was further away in time than the match window.
    OutsideWindow { best_delta: Duration },
}

impl fmt::Display for UnmatchedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyCaption => write!(f, "empty_caption"),
            Self::NoCandidates => write!(f, "no_candidates"),
            Self::NoCaptionMatch => write!(f, "no_caption_match"),
            Self::OutsideWindow { best_delta } => {
                write!(f, "outside_window(best_delta={}m)", best_delta.num_minutes())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchedRecord {
    pub record_id: Uuid,
    pub method: MatchMethod,
    pub time_delta: Duration,
    /// `1 - time_delta / match_window`, in `[0, 1]`.
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MatchResult {
    Matched(MatchedRecord),
    Unmatched(UnmatchedReason),
}

impl MatchResult {
    pub fn is_matched(&self) -> bool {
        matches!(self, Self::Matched(_))
    }
}

/// A candidate prepared once per item: normalized caption and reference time.
struct Prepared<'a> {
    record: &'a TrackedRecord,
    caption: String,
    delta: Duration,
}

pub struct EntityMatcher {
    max_match_window: Duration,
    prefix_chars: usize,
}

impl EntityMatcher {
    pub fn new(max_match_window: Duration, prefix_chars: usize) -> Self {
        Self {
            max_match_window,
            prefix_chars: prefix_chars.max(1),
        }
    }

    pub fn max_match_window(&self) -> Duration {
        self.max_match_window
    }

    /// Pick the in-flight record `item` most plausibly resolves on `channel`.
    ///
    /// Candidates already holding an external id on the channel, or with no
    /// trigger/schedule time, or with an empty normalized caption, are ignored.
    /// Ties on time delta go to the earlier candidate in `candidates`.
    pub fn match_item(&self, item: &ExternalItem, candidates: &[TrackedRecord], channel: Channel) -> MatchResult {
        let item_caption = normalize_caption(&item.caption);
        if item_caption.is_empty() {
            return MatchResult::Unmatched(UnmatchedReason::EmptyCaption);
        }

        let prepared: Vec<Prepared<'_>> = candidates
            .iter()
            .filter(|r| r.external_id_on(channel).is_none())
            .filter_map(|record| {
                let reference = record.match_reference_time()?;
                let caption = normalize_caption(&record.caption);
                if caption.is_empty() {
                    return None;
                }
                Some(Prepared {
                    record,
                    caption,
                    delta: abs_delta(item.created_at - reference),
                })
            })
            .collect();

        if prepared.is_empty() {
            return MatchResult::Unmatched(UnmatchedReason::NoCandidates);
        }

        let exact = closest(prepared.iter().filter(|c| c.caption == item_caption));
        let (best, method) = match exact {
            Some(best) => (best, MatchMethod::CaptionExact),
            None => {
                let item_lower = item_caption.to_lowercase();
                let fuzzy = closest(
                    prepared
                        .iter()
                        .filter(|c| self.contains_either_way(&item_lower, &c.caption.to_lowercase())),
                );
                match fuzzy {
                    Some(best) => (best, MatchMethod::CaptionContains),
                    None => return MatchResult::Unmatched(UnmatchedReason::NoCaptionMatch),
                }
            }
        };

        if best.delta > self.max_match_window {
            return MatchResult::Unmatched(UnmatchedReason::OutsideWindow { best_delta: best.delta });
        }

        MatchResult::Matched(MatchedRecord {
            record_id: best.record.id,
            method,
            time_delta: best.delta,
            score: self.score(best.delta),
        })
    }

    /// Either caption contains the other's leading `prefix_chars` characters.
    fn contains_either_way(&self, a: &str, b: &str) -> bool {
        a.contains(prefix(b, self.prefix_chars)) || b.contains(prefix(a, self.prefix_chars))
    }

    fn score(&self, delta: Duration) -> f64 {
        let window_ms = self.max_match_window.num_milliseconds();
        if window_ms <= 0 {
            return 1.0;
        }
        (1.0 - delta.num_milliseconds() as f64 / window_ms as f64).clamp(0.0, 1.0)
    }
}

fn abs_delta(delta: Duration) -> Duration {
    if delta < Duration::zero() {
        -delta
    } else {
        delta
    }
}

/// First `n` characters of `s`, on a char boundary.
fn prefix(s: &str, n: usize) -> &str {
    match s.char_indices().nth(n) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Smallest delta; the first one seen wins ties.
fn closest<'p, 'a: 'p>(candidates: impl Iterator<Item = &'p Prepared<'a>>) -> Option<&'p Prepared<'a>> {
    let mut best: Option<&Prepared<'a>> = None;
    for candidate in candidates {
        if best.map_or(true, |b| candidate.delta < b.delta) {
            best = Some(candidate);
        }
    }
    best
}
