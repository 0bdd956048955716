//! Free-text recovery: fence stripping, embedded JSON discovery and
//! per-type pattern extraction.

use super::json::{normalize_time, parse_weekday, positional_score};
use crate::outcome::{
    ContentResult, HashtagResult, RankedHashtag, ScheduleResult, ScheduleSlot, SentimentLabel,
    SentimentResult, TaskResult, Urgency, DEFAULT_ENGAGEMENT, DEFAULT_PLATFORM, DEFAULT_TONE,
};
use crate::task::{TaskPayload, TaskType};
use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

/// Upper bound on embedded JSON candidates tried per body.
const MAX_EMBEDDED_CANDIDATES: usize = 16;

static FENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```[A-Za-z0-9_-]*[ \t]*\r?\n?(.*?)```").unwrap());
static SENTIMENT_KEYED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:sentiment|label)\b\W{0,3}\s*(positive|negative|neutral|mixed)\b").unwrap()
});
static SENTIMENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(positive|negative|neutral|mixed)\b").unwrap());
static CONFIDENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:confidence|certainty)\b\W{0,3}\s*(\d{1,3}(?:\.\d+)?)\s*(%)?").unwrap()
});
static EMOTION_KEYED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bemotion\b\s*[:=-]\s*([a-z]+)").unwrap());
static EMOTION_WORD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(joy|happiness|excitement|gratitude|love|anger|frustration|sadness|disappointment|fear|anxiety|surprise|trust|disgust)\b",
    )
    .unwrap()
});
static URGENCY_KEYED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\burgency\b\W{0,3}\s*(low|medium|moderate|high)\b").unwrap()
});
static URGENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(urgent|asap|immediately)\b").unwrap());
static TONE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:suggested[ _]tone|tone)\b\s*[:=-]\s*([a-z]+)").unwrap()
});
static HASHTAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"#([A-Za-z0-9_]*[A-Za-z][A-Za-z0-9_]*)").unwrap());
static SLOT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(monday|tuesday|wednesday|thursday|friday|saturday|sunday|mon|tues|tue|wed|thurs|thur|thu|fri|sat|sun)\b[^\d\n]{0,20}?(\d{1,2})(?::(\d{2}))?\s*([ap])?\.?m?\b",
    )
    .unwrap()
});
static ENGAGEMENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:engagement|score)\b\W{0,3}\s*(\d{1,3}(?:\.\d+)?)\s*(%)?").unwrap()
});
static CONTENT_LABEL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(?:content|post|caption|text|output|here(?:'s| is)[^:\n]{0,40})\s*:\s*")
        .unwrap()
});
static NUMBERED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*(?:\[(\d+)\]|(\d+)(?:[.)]|:(?:[ \t]|$)))\s*").unwrap());

/// Inner text when `body` is exactly one fenced block, otherwise the trimmed body.
pub(crate) fn strip_single_fence(body: &str) -> &str {
    let trimmed = body.trim();
    if let Some(caps) = FENCE_RE.captures(trimmed) {
        if let (Some(whole), Some(inner)) = (caps.get(0), caps.get(1)) {
            if whole.start() == 0 && whole.end() == trimmed.len() {
                return inner.as_str().trim();
            }
        }
    }
    trimmed
}

/// JSON values embedded anywhere in `body`, in order of appearance.
/// Fenced blocks are tried before bare brace spans.
pub(crate) fn embedded_json(body: &str, arrays: bool) -> Vec<Value> {
    let mut found = Vec::new();
    for caps in FENCE_RE.captures_iter(body) {
        if let Some(inner) = caps.get(1) {
            if let Ok(value) = serde_json::from_str::<Value>(inner.as_str().trim()) {
                if value.is_object() || (arrays && value.is_array()) {
                    found.push(value);
                }
            }
        }
    }

    let bytes = body.as_bytes();
    let mut i = 0;
    let mut tried = 0;
    while i < bytes.len() && tried < MAX_EMBEDDED_CANDIDATES {
        let opens = bytes[i] == b'{' || (arrays && bytes[i] == b'[');
        if !opens {
            i += 1;
            continue;
        }
        tried += 1;
        match balanced_end(bytes, i) {
            Some(end) => match serde_json::from_str::<Value>(&body[i..=end]) {
                Ok(value) => {
                    found.push(value);
                    i = end + 1;
                }
                Err(_) => i += 1,
            },
            None => i += 1,
        }
    }
    found
}

/// Index of the bracket closing the one at `start`, ignoring brackets in strings.
fn balanced_end(bytes: &[u8], start: usize) -> Option<usize> {
    let close = match bytes[start] {
        b'{' => b'}',
        b'[' => b']',
        _ => return None,
    };
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' | b'[' => depth += 1,
            b'}' | b']' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return (b == close).then_some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Split a combined reply into numbered segments (`1.`, `2)`, `[3]`),
/// keyed by their 1-based number.
pub(crate) fn numbered_segments(body: &str) -> Vec<(usize, &str)> {
    let markers: Vec<(usize, usize, usize)> = NUMBERED_RE
        .captures_iter(body)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let number = caps.get(1).or_else(|| caps.get(2))?.as_str().parse().ok()?;
            Some((number, whole.start(), whole.end()))
        })
        .collect();

    markers
        .iter()
        .enumerate()
        .map(|(idx, &(number, _, content_start))| {
            let end = markers
                .get(idx + 1)
                .map(|&(_, next_start, _)| next_start)
                .unwrap_or(body.len());
            (number, body[content_start..end].trim())
        })
        .collect()
}

/// Pattern-extracted result with the names of the recovered fields.
pub(crate) struct Extracted {
    pub result: TaskResult,
    pub fields: Vec<&'static str>,
}

pub(crate) fn extract(task_type: TaskType, payload: &TaskPayload, text: &str) -> Option<Extracted> {
    match task_type {
        TaskType::Sentiment => extract_sentiment(text),
        TaskType::ContentGen => extract_content(payload, text),
        TaskType::Hashtag => extract_hashtags(text),
        TaskType::Schedule => extract_schedule(text),
    }
}

fn extract_sentiment(text: &str) -> Option<Extracted> {
    let mut fields = Vec::new();
    let mut result = SentimentResult::default();

    let label = SENTIMENT_KEYED_RE
        .captures(text)
        .or_else(|| SENTIMENT_RE.captures(text))
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<SentimentLabel>().ok());
    if let Some(label) = label {
        result.sentiment = label;
        fields.push("sentiment");
    }

    if let Some(confidence) = CONFIDENCE_RE.captures(text).and_then(|caps| unit_value(&caps)) {
        result.confidence = confidence;
        fields.push("confidence");
    }

    let emotion = EMOTION_KEYED_RE
        .captures(text)
        .or_else(|| EMOTION_WORD_RE.captures(text))
        .and_then(|caps| caps.get(1));
    if let Some(emotion) = emotion {
        result.emotion = emotion.as_str().to_lowercase();
        fields.push("emotion");
    }

    let urgency = URGENCY_KEYED_RE
        .captures(text)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<Urgency>().ok())
        .or_else(|| URGENT_RE.is_match(text).then_some(Urgency::High));
    if let Some(urgency) = urgency {
        result.urgency = urgency;
        fields.push("urgency");
    }

    if let Some(tone) = TONE_RE.captures(text).and_then(|caps| caps.get(1)) {
        result.suggested_tone = tone.as_str().to_lowercase();
        fields.push("suggested_tone");
    }

    (!fields.is_empty()).then(|| Extracted {
        result: TaskResult::Sentiment(result),
        fields,
    })
}

/// Number in capture 1 as a fraction, honoring a `%` in capture 2.
fn unit_value(caps: &regex::Captures<'_>) -> Option<f64> {
    let value: f64 = caps.get(1)?.as_str().parse().ok()?;
    let value = if caps.get(2).is_some() || value > 1.0 {
        value / 100.0
    } else {
        value
    };
    (0.0..=1.0).contains(&value).then_some(value)
}

fn extract_content(payload: &TaskPayload, text: &str) -> Option<Extracted> {
    let body = strip_single_fence(text);
    let body = CONTENT_LABEL_RE.replace(body, "");
    let body = body
        .trim()
        .trim_matches(|c| matches!(c, '"' | '\'' | '\u{201c}' | '\u{201d}'))
        .trim();

    let looks_like_json = body.starts_with('{') || body.starts_with('[');
    if body.is_empty() || looks_like_json || !body.chars().any(char::is_alphabetic) {
        return None;
    }

    Some(Extracted {
        result: TaskResult::Content(ContentResult {
            text: body.to_string(),
            platform: payload.platform_or(DEFAULT_PLATFORM).to_string(),
            tone: payload.tone_or(DEFAULT_TONE).to_string(),
        }),
        fields: vec!["text"],
    })
}

fn extract_hashtags(text: &str) -> Option<Extracted> {
    let hashtags: Vec<RankedHashtag> = HASHTAG_RE
        .captures_iter(text)
        .filter_map(|caps| caps.get(1))
        .enumerate()
        .filter_map(|(position, tag)| RankedHashtag::new(tag.as_str(), positional_score(position)))
        .collect();
    if hashtags.is_empty() {
        return None;
    }
    Some(Extracted {
        result: TaskResult::Hashtags(HashtagResult::ranked(hashtags)),
        fields: vec!["hashtags"],
    })
}

fn extract_schedule(text: &str) -> Option<Extracted> {
    let mut slots = Vec::new();
    for line in text.lines() {
        let engagement = ENGAGEMENT_RE
            .captures(line)
            .and_then(|caps| unit_value(&caps));
        for caps in SLOT_RE.captures_iter(line) {
            if let Some(slot) = slot_from(&caps, engagement) {
                slots.push(slot);
            }
        }
    }
    if slots.is_empty() {
        return None;
    }
    Some(Extracted {
        result: TaskResult::Schedule(ScheduleResult::ranked(slots)),
        fields: vec!["slots"],
    })
}

fn slot_from(caps: &regex::Captures<'_>, engagement: Option<f64>) -> Option<ScheduleSlot> {
    let day_name = caps.get(1)?.as_str().to_lowercase();
    let day = parse_weekday(day_name.get(..3)?)?;
    let mut hours: u32 = caps.get(2)?.as_str().parse().ok()?;
    let minutes = caps.get(3).map(|m| m.as_str()).unwrap_or("00");
    if let Some(meridiem) = caps.get(4) {
        if hours == 0 || hours > 12 {
            return None;
        }
        let pm = meridiem.as_str().eq_ignore_ascii_case("p");
        hours = match (pm, hours) {
            (false, 12) => 0,
            (false, h) => h,
            (true, 12) => 12,
            (true, h) => h + 12,
        };
    }
    let time = normalize_time(&format!("{}:{}", hours, minutes))?;
    Some(ScheduleSlot {
        day,
        time,
        expected_engagement: engagement.unwrap_or(DEFAULT_ENGAGEMENT),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Weekday;

    #[test]
    fn test_strip_single_fence() {
        assert_eq!(strip_single_fence("```json\n{\"a\": 1}\n```"), "{\"a\": 1}");
        assert_eq!(strip_single_fence("  {\"a\": 1} "), "{\"a\": 1}");
        let two = "```json\n{}\n```\ntext\n```json\n{}\n```";
        assert_eq!(strip_single_fence(two), two);
    }

    #[test]
    fn test_embedded_json_skips_noise() {
        let body = r#"Sure! {not json} Here you go: {"sentiment": "negative", "note": "uses } in string"} thanks"#;
        let values = embedded_json(body, false);
        assert_eq!(values.len(), 1);
        assert_eq!(values[0]["sentiment"], "negative");
    }

    #[test]
    fn test_embedded_json_prefers_fenced_blocks() {
        let body = "Result:\n```json\n{\"hashtags\": [\"#a\"]}\n```";
        let values = embedded_json(body, false);
        assert_eq!(values[0]["hashtags"][0], "#a");
    }

    #[test]
    fn test_sentiment_extraction() {
        let extracted = extract_sentiment("Sentiment: positive, not really json").unwrap();
        let result = extracted.result.as_sentiment().unwrap();
        assert_eq!(result.sentiment, SentimentLabel::Positive);
        assert_eq!(result.confidence, 0.5);
        assert_eq!(extracted.fields, vec!["sentiment"]);

        let extracted =
            extract_sentiment("Mostly NEGATIVE (confidence 85%), emotion: anger. Urgent!").unwrap();
        let result = extracted.result.as_sentiment().unwrap();
        assert_eq!(result.sentiment, SentimentLabel::Negative);
        assert!((result.confidence - 0.85).abs() < 1e-9);
        assert_eq!(result.emotion, "anger");
        assert_eq!(result.urgency, Urgency::High);

        assert!(extract_sentiment("lorem ipsum dolor").is_none());
    }

    #[test]
    fn test_content_extraction_strips_label_and_quotes() {
        let payload = TaskPayload::new().with_platform("twitter");
        let extracted =
            extract_content(&payload, "Post: \"Fresh beans just landed. Come taste them!\"").unwrap();
        let content = extracted.result.as_content().unwrap();
        assert_eq!(content.text, "Fresh beans just landed. Come taste them!");
        assert_eq!(content.platform, "twitter");

        assert!(extract_content(&payload, "  ### 123 !!! ").is_none());
    }

    #[test]
    fn test_hashtag_extraction() {
        let extracted = extract_hashtags("Try #CoffeeLovers, #morning and #2024vibes but not # or #42").unwrap();
        let tags: Vec<&str> = extracted
            .result
            .as_hashtags()
            .unwrap()
            .hashtags
            .iter()
            .map(|h| h.tag.as_str())
            .collect();
        assert_eq!(tags, vec!["#CoffeeLovers", "#morning", "#2024vibes"]);
    }

    #[test]
    fn test_schedule_extraction() {
        let text = "Best times:\n- Monday at 9am (engagement 70%)\n- Thurs 18:30\n- Saturday, 12pm";
        let extracted = extract_schedule(text).unwrap();
        let slots = &extracted.result.as_schedule().unwrap().slots;
        assert_eq!(slots.len(), 3);
        assert_eq!(slots[0].day, Weekday::Mon);
        assert_eq!(slots[0].time, "09:00");
        assert!((slots[0].expected_engagement - 0.7).abs() < 1e-9);
        assert_eq!(slots[1].day, Weekday::Thu);
        assert_eq!(slots[1].time, "18:30");
        assert_eq!(slots[2].time, "12:00");
    }

    #[test]
    fn test_numbered_segments() {
        let body = "1. positive, joy\n2) negative\n[3] neutral";
        let segments = numbered_segments(body);
        assert_eq!(
            segments,
            vec![(1, "positive, joy"), (2, "negative"), (3, "neutral")]
        );
    }

    #[test]
    fn test_clock_times_are_not_segment_markers() {
        let body = "1: Tuesday\n10:00 works best\n2: Friday 18:30";
        let segments = numbered_segments(body);
        assert_eq!(
            segments,
            vec![(1, "Tuesday\n10:00 works best"), (2, "Friday 18:30")]
        );
    }
}
