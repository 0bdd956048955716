//! JSON decoding into typed results.
//!
//! `Strict` requires every mandatory field with a valid value and rejects any
//! invalid optional field. `Lenient` keeps whatever validates and fills the
//! rest with defaults, failing only when nothing was recovered.

use crate::outcome::{
    ContentResult, HashtagResult, RankedHashtag, ScheduleResult, ScheduleSlot, SentimentLabel,
    SentimentResult, TaskResult, Urgency, DEFAULT_ENGAGEMENT, DEFAULT_PLATFORM, DEFAULT_TONE,
};
use crate::task::{TaskPayload, TaskType};
use chrono::Weekday;
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mode {
    Strict,
    Lenient,
}

/// Decode `value` as the result schema for `task_type`.
pub(crate) fn decode(
    task_type: TaskType,
    payload: &TaskPayload,
    value: &Value,
    mode: Mode,
) -> Option<TaskResult> {
    match task_type {
        TaskType::ContentGen => decode_content(payload, value, mode).map(TaskResult::Content),
        TaskType::Sentiment => decode_sentiment(value, mode).map(TaskResult::Sentiment),
        TaskType::Hashtag => decode_hashtags(value, mode).map(TaskResult::Hashtags),
        TaskType::Schedule => decode_schedule(value, mode).map(TaskResult::Schedule),
    }
}

/// Outcome of reading one optional field.
enum Field<T> {
    Missing,
    Invalid,
    Valid(T),
}

impl<T> Field<T> {
    /// Strict mode fails on invalid values; lenient mode treats them as missing.
    fn resolve(self, mode: Mode) -> Result<Option<T>, ()> {
        match self {
            Field::Valid(v) => Ok(Some(v)),
            Field::Missing => Ok(None),
            Field::Invalid if mode == Mode::Strict => Err(()),
            Field::Invalid => Ok(None),
        }
    }
}

fn lookup<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|key| obj.get(*key))
}

fn string_field(obj: &Map<String, Value>, keys: &[&str]) -> Field<String> {
    match lookup(obj, keys) {
        None | Some(Value::Null) => Field::Missing,
        Some(Value::String(s)) if !s.trim().is_empty() => Field::Valid(s.trim().to_string()),
        Some(_) => Field::Invalid,
    }
}

/// A fraction in [0, 1]. Lenient mode also accepts numeric strings and
/// percentages in (1, 100].
fn unit_field(obj: &Map<String, Value>, keys: &[&str], mode: Mode) -> Field<f64> {
    let raw = match lookup(obj, keys) {
        None | Some(Value::Null) => return Field::Missing,
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) if mode == Mode::Lenient => {
            s.trim().trim_end_matches('%').trim().parse::<f64>().ok()
        }
        Some(_) => None,
    };
    match raw {
        Some(v) if (0.0..=1.0).contains(&v) => Field::Valid(v),
        Some(v) if mode == Mode::Lenient && v > 1.0 && v <= 100.0 => Field::Valid(v / 100.0),
        _ => Field::Invalid,
    }
}

fn parsed_field<T: std::str::FromStr>(obj: &Map<String, Value>, keys: &[&str]) -> Field<T> {
    match string_field(obj, keys) {
        Field::Valid(s) => s.parse().map(Field::Valid).unwrap_or(Field::Invalid),
        Field::Missing => Field::Missing,
        Field::Invalid => Field::Invalid,
    }
}

fn decode_sentiment(value: &Value, mode: Mode) -> Option<SentimentResult> {
    let obj = value.as_object()?;
    let sentiment = parsed_field::<SentimentLabel>(obj, &["sentiment", "label"])
        .resolve(mode)
        .ok()?;
    let confidence = unit_field(obj, &["confidence", "score"], mode)
        .resolve(mode)
        .ok()?;
    let emotion = string_field(obj, &["emotion"]).resolve(mode).ok()?;
    let urgency = parsed_field::<Urgency>(obj, &["urgency"]).resolve(mode).ok()?;
    let suggested_tone = string_field(obj, &["suggested_tone", "tone"])
        .resolve(mode)
        .ok()?;

    let recovered = sentiment.is_some()
        || confidence.is_some()
        || emotion.is_some()
        || urgency.is_some()
        || suggested_tone.is_some();
    match mode {
        Mode::Strict if sentiment.is_none() || confidence.is_none() => return None,
        Mode::Lenient if !recovered => return None,
        _ => {}
    }

    let defaults = SentimentResult::default();
    Some(SentimentResult {
        sentiment: sentiment.unwrap_or(defaults.sentiment),
        confidence: confidence.unwrap_or(defaults.confidence),
        emotion: emotion.map(|e| e.to_lowercase()).unwrap_or(defaults.emotion),
        urgency: urgency.unwrap_or(defaults.urgency),
        suggested_tone: suggested_tone
            .map(|t| t.to_lowercase())
            .unwrap_or(defaults.suggested_tone),
    })
}

fn decode_content(payload: &TaskPayload, value: &Value, mode: Mode) -> Option<ContentResult> {
    let obj = value.as_object()?;
    let text = string_field(obj, &["text", "content", "post", "caption"])
        .resolve(mode)
        .ok()??;
    let platform = string_field(obj, &["platform"]).resolve(mode).ok()?;
    let tone = string_field(obj, &["tone"]).resolve(mode).ok()?;

    Some(ContentResult {
        text,
        platform: platform.unwrap_or_else(|| payload.platform_or(DEFAULT_PLATFORM).to_string()),
        tone: tone.unwrap_or_else(|| payload.tone_or(DEFAULT_TONE).to_string()),
    })
}

fn decode_hashtags(value: &Value, mode: Mode) -> Option<HashtagResult> {
    let items = match value {
        Value::Object(obj) => lookup(obj, &["hashtags", "tags"])?.as_array()?,
        Value::Array(items) if mode == Mode::Lenient => items,
        _ => return None,
    };

    let mut hashtags = Vec::with_capacity(items.len());
    for (position, item) in items.iter().enumerate() {
        let parsed = match item {
            Value::Object(obj) => {
                let score = unit_field(obj, &["score", "relevance"], mode);
                match (string_field(obj, &["tag", "hashtag"]), score) {
                    (Field::Valid(tag), Field::Valid(score)) => RankedHashtag::new(&tag, score),
                    (Field::Valid(tag), Field::Missing) if mode == Mode::Lenient => {
                        RankedHashtag::new(&tag, positional_score(position))
                    }
                    _ => None,
                }
            }
            Value::String(tag) if mode == Mode::Lenient => {
                RankedHashtag::new(tag, positional_score(position))
            }
            _ => None,
        };
        match parsed {
            Some(tag) => hashtags.push(tag),
            None if mode == Mode::Strict => return None,
            None => {}
        }
    }

    if mode == Mode::Lenient && hashtags.is_empty() {
        return None;
    }
    Some(HashtagResult::ranked(hashtags))
}

/// Score for a hashtag given only by rank: 1.0, 0.9, ... floored at 0.1.
pub(crate) fn positional_score(position: usize) -> f64 {
    (1.0 - 0.1 * position as f64).max(0.1)
}

fn decode_schedule(value: &Value, mode: Mode) -> Option<ScheduleResult> {
    let items = match value {
        Value::Object(obj) => {
            lookup(obj, &["slots", "schedule", "best_times", "times"])?.as_array()?
        }
        Value::Array(items) if mode == Mode::Lenient => items,
        _ => return None,
    };

    let mut slots = Vec::with_capacity(items.len());
    for item in items {
        let slot = item.as_object().and_then(|obj| {
            let day = parse_weekday(&string_field(obj, &["day", "weekday"]).resolve(mode).ok()??)?;
            let time = normalize_time(&string_field(obj, &["time", "hour"]).resolve(mode).ok()??)?;
            let engagement = match unit_field(obj, &["expected_engagement", "engagement", "score"], mode) {
                Field::Valid(v) => v,
                Field::Missing if mode == Mode::Lenient => DEFAULT_ENGAGEMENT,
                _ => return None,
            };
            Some(ScheduleSlot {
                day,
                time,
                expected_engagement: engagement,
            })
        });
        match slot {
            Some(slot) => slots.push(slot),
            None if mode == Mode::Strict => return None,
            None => {}
        }
    }

    if slots.is_empty() {
        return None;
    }
    Some(ScheduleResult::ranked(slots))
}

pub(crate) fn parse_weekday(raw: &str) -> Option<Weekday> {
    raw.trim().parse::<Weekday>().ok()
}

/// `H:MM` or `HH:MM` in 24-hour time, normalized to `HH:MM`.
pub(crate) fn normalize_time(raw: &str) -> Option<String> {
    let (hours, minutes) = raw.trim().split_once(':')?;
    if hours.is_empty() || hours.len() > 2 || minutes.len() != 2 {
        return None;
    }
    let hours: u32 = hours.parse().ok()?;
    let minutes: u32 = minutes.parse().ok()?;
    if hours > 23 || minutes > 59 {
        return None;
    }
    Some(format!("{:02}:{:02}", hours, minutes))
}
