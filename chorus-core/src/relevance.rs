// ABOUTME: Topic relevance from keyword overlap with an interest vocabulary, and time-of-day weighting.
// ABOUTME: Relevance has diminishing returns per extra match and never drops below a configured floor.

use chrono::{DateTime, Timelike, Utc};
use chrono_tz::Tz;
use std::collections::HashSet;

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "with", "about", "that", "this", "from", "into", "your", "what", "how",
    "are", "was", "you", "our", "but", "not", "all", "any", "can", "has", "have", "just",
];

/// Lowercased word tokens of at least three characters, minus stopwords
pub fn tokenize(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() >= 3)
        .map(|w| w.to_lowercase())
        .filter(|w| !STOPWORDS.contains(&w.as_str()))
        .collect()
}

/// Number of interests that share at least one keyword with `text`
pub fn keyword_matches(text: &str, interests: &[String]) -> usize {
    let words = tokenize(text);
    if words.is_empty() {
        return 0;
    }
    interests
        .iter()
        .filter(|interest| tokenize(interest).iter().any(|k| words.contains(k)))
        .count()
}

/// Relevance in `[floor, 1)`: each extra match closes half the remaining gap.
pub fn topic_relevance(text: &str, interests: &[String], floor: f64) -> f64 {
    let floor = floor.clamp(0.0, 1.0);
    let matches = keyword_matches(text, interests);
    floor + (1.0 - floor) * (1.0 - 0.5_f64.powi(matches as i32))
}

/// Whether `hour` falls in the quiet window `[start, end)`, wrapping past midnight.
pub fn in_quiet_hours(hour: u32, start: Option<u8>, end: Option<u8>) -> bool {
    let (Some(start), Some(end)) = (start, end) else {
        return false;
    };
    let (start, end) = (u32::from(start), u32::from(end));
    if start == end {
        false
    } else if start < end {
        hour >= start && hour < end
    } else {
        hour >= start || hour < end
    }
}

/// Initiation weight for the local hour: `quiet_weight` in quiet hours, otherwise 1.
pub fn time_of_day_weight(
    now: DateTime<Utc>,
    tz: Tz,
    quiet_start: Option<u8>,
    quiet_end: Option<u8>,
    quiet_weight: f64,
) -> f64 {
    let hour = now.with_timezone(&tz).hour();
    if in_quiet_hours(hour, quiet_start, quiet_end) {
        quiet_weight.clamp(0.0, 1.0)
    } else {
        1.0
    }
}
