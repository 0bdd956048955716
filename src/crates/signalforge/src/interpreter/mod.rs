//! Response interpretation
//!
//! Turns provider text into a schema-valid [`TaskResult`] for every task
//! type, degrading through tiers:
//!
//! 1. **Strict** - the whole body (optionally one fenced block) is JSON that
//!    matches the schema exactly → `Success`
//! 2. **Salvaged** - JSON embedded somewhere in the body yields some valid
//!    fields → `Fallback`
//! 3. **Extracted** - type-specific patterns recover fields from prose →
//!    `Fallback`
//! 4. **Default** - documented defaults, raw body kept for diagnostics →
//!    `Fallback`
//!
//! Malformed content never produces an error.

mod extract;
mod json;

use crate::outcome::{OutcomeStatus, TaskResult};
use crate::task::{TaskPayload, TaskType};
use json::Mode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tracing::{debug, warn};

/// Raw body excerpt kept in default-tier diagnostics, in characters.
pub const DIAGNOSTIC_EXCERPT_CHARS: usize = 512;

/// Which tier produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Strict,
    Salvaged,
    Extracted,
    Default,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Tier::Strict => "strict",
            Tier::Salvaged => "salvaged",
            Tier::Extracted => "extracted",
            Tier::Default => "default",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Interpretation {
    pub status: OutcomeStatus,
    pub result: TaskResult,
    pub tier: Tier,
    pub diagnostics: Option<String>,
}

impl Interpretation {
    fn strict(result: TaskResult) -> Self {
        Self {
            status: OutcomeStatus::Success,
            result,
            tier: Tier::Strict,
            diagnostics: Some("tier=strict".to_string()),
        }
    }

    fn salvaged(result: TaskResult) -> Self {
        Self {
            status: OutcomeStatus::Fallback,
            result,
            tier: Tier::Salvaged,
            diagnostics: Some("tier=salvaged source=embedded-json".to_string()),
        }
    }

    fn extracted(result: TaskResult, fields: &[&str]) -> Self {
        Self {
            status: OutcomeStatus::Fallback,
            result,
            tier: Tier::Extracted,
            diagnostics: Some(format!("tier=extracted fields={}", fields.join(","))),
        }
    }

    fn default_for(task_type: TaskType, payload: &TaskPayload, reason: &str, raw: &str) -> Self {
        let excerpt: String = raw.chars().take(DIAGNOSTIC_EXCERPT_CHARS).collect();
        Self {
            status: OutcomeStatus::Fallback,
            result: TaskResult::default_for(task_type, payload),
            tier: Tier::Default,
            diagnostics: Some(format!("tier=default reason={} raw={:?}", reason, excerpt)),
        }
    }
}

/// A batch member as seen by the interpreter.
#[derive(Debug, Clone, Copy)]
pub struct BatchSlot<'a> {
    pub task_type: TaskType,
    pub payload: &'a TaskPayload,
}

/// Stateless tiered parser.
#[derive(Debug, Clone, Default)]
pub struct ResponseInterpreter;

impl ResponseInterpreter {
    pub fn new() -> Self {
        Self
    }

    /// Interpret a single-task reply.
    pub fn interpret(&self, task_type: TaskType, payload: &TaskPayload, body: &str) -> Interpretation {
        let whole = serde_json::from_str::<Value>(extract::strip_single_fence(body)).ok();

        if let Some(result) = whole
            .as_ref()
            .and_then(|value| json::decode(task_type, payload, value, Mode::Strict))
        {
            debug!(task_type = %task_type, "Strict parse succeeded");
            return Interpretation::strict(result);
        }

        if let Some(result) = self.salvage(task_type, payload, body, whole.as_ref()) {
            debug!(task_type = %task_type, "Salvaged fields from embedded JSON");
            return Interpretation::salvaged(result);
        }

        if let Some(extracted) = extract::extract(task_type, payload, body) {
            debug!(task_type = %task_type, fields = ?extracted.fields, "Extracted fields from text");
            return Interpretation::extracted(extracted.result, &extracted.fields);
        }

        warn!(
            task_type = %task_type,
            body_len = body.len(),
            "No recoverable fields in provider reply, using defaults"
        );
        Interpretation::default_for(task_type, payload, "unrecoverable", body)
    }

    fn salvage(
        &self,
        task_type: TaskType,
        payload: &TaskPayload,
        body: &str,
        whole: Option<&Value>,
    ) -> Option<TaskResult> {
        let list_shaped = matches!(task_type, TaskType::Hashtag | TaskType::Schedule);
        whole
            .into_iter()
            .cloned()
            .chain(extract::embedded_json(body, list_shaped))
            .find_map(|value| json::decode(task_type, payload, &value, Mode::Lenient))
    }

    /// Interpret a combined reply for `slots`, returning one interpretation
    /// per slot in input order.
    pub fn interpret_batch(&self, slots: &[BatchSlot<'_>], body: &str) -> Vec<Interpretation> {
        if let Some(items) = batch_items(body) {
            debug!(members = slots.len(), items = items.len(), "Demultiplexing JSON batch reply");
            return slots
                .iter()
                .enumerate()
                .map(|(index, slot)| match items.get(index) {
                    Some(item) => self.interpret_item(*slot, item),
                    None => Interpretation::default_for(
                        slot.task_type,
                        slot.payload,
                        &format!("missing-batch-item-{}", index + 1),
                        body,
                    ),
                })
                .collect();
        }

        let segments = extract::numbered_segments(body);
        if !segments.is_empty() {
            debug!(members = slots.len(), segments = segments.len(), "Demultiplexing numbered batch reply");
            return slots
                .iter()
                .enumerate()
                .map(|(index, slot)| {
                    match segments.iter().find(|(number, _)| *number == index + 1) {
                        Some((_, text)) => self.degrade(self.interpret(slot.task_type, slot.payload, text)),
                        None => Interpretation::default_for(
                            slot.task_type,
                            slot.payload,
                            &format!("missing-batch-segment-{}", index + 1),
                            body,
                        ),
                    }
                })
                .collect();
        }

        if let [only] = slots {
            return vec![self.interpret(only.task_type, only.payload, body)];
        }

        warn!(members = slots.len(), "Batch reply could not be split, using defaults");
        slots
            .iter()
            .map(|slot| {
                Interpretation::default_for(slot.task_type, slot.payload, "unsplittable-batch", body)
            })
            .collect()
    }

    fn interpret_item(&self, slot: BatchSlot<'_>, item: &Value) -> Interpretation {
        if let Some(result) = json::decode(slot.task_type, slot.payload, item, Mode::Strict) {
            return Interpretation::strict(result);
        }
        if let Some(result) = json::decode(slot.task_type, slot.payload, item, Mode::Lenient) {
            return Interpretation::salvaged(result);
        }
        if let Value::String(text) = item {
            return self.degrade(self.interpret(slot.task_type, slot.payload, text));
        }
        let raw = item.to_string();
        Interpretation::default_for(slot.task_type, slot.payload, "invalid-batch-item", &raw)
    }

    /// A member parsed out of an unstructured combined reply is never a full success.
    fn degrade(&self, mut interpretation: Interpretation) -> Interpretation {
        if interpretation.tier == Tier::Strict {
            interpretation.status = OutcomeStatus::Fallback;
            interpretation.tier = Tier::Salvaged;
            interpretation.diagnostics = Some("tier=salvaged source=batch-segment".to_string());
        }
        interpretation
    }
}

/// Per-member items of a combined reply: a JSON array or `{"results": [...]}`.
fn batch_items(body: &str) -> Option<Vec<Value>> {
    let as_items = |value: Value| match value {
        Value::Array(items) => Some(items),
        Value::Object(mut obj) => match obj.remove("results").or_else(|| obj.remove("items")) {
            Some(Value::Array(items)) => Some(items),
            _ => None,
        },
        _ => None,
    };

    if let Ok(value) = serde_json::from_str::<Value>(extract::strip_single_fence(body)) {
        if let Some(items) = as_items(value) {
            return Some(items);
        }
    }
    extract::embedded_json(body, true).into_iter().find_map(as_items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::SentimentLabel;

    fn sentiment(body: &str) -> Interpretation {
        ResponseInterpreter::new().interpret(TaskType::Sentiment, &TaskPayload::new(), body)
    }

    #[test]
    fn test_strict_tier() {
        let result = sentiment(r#"{"sentiment": "positive", "confidence": 0.9, "emotion": "joy", "urgency": "low", "suggested_tone": "friendly"}"#);
        assert_eq!(result.status, OutcomeStatus::Success);
        assert_eq!(result.tier, Tier::Strict);
    }

    #[test]
    fn test_fenced_body_is_still_strict() {
        let result = sentiment("```json\n{\"sentiment\": \"negative\", \"confidence\": 0.7}\n```");
        assert_eq!(result.tier, Tier::Strict);
        assert_eq!(
            result.result.as_sentiment().unwrap().sentiment,
            SentimentLabel::Negative
        );
    }

    #[test]
    fn test_embedded_json_is_salvaged() {
        let result = sentiment(r#"Here is my analysis: {"sentiment": "mixed", "confidence": "80%"} hope it helps"#);
        assert_eq!(result.status, OutcomeStatus::Fallback);
        assert_eq!(result.tier, Tier::Salvaged);
        let parsed = result.result.as_sentiment().unwrap();
        assert_eq!(parsed.sentiment, SentimentLabel::Mixed);
        assert!((parsed.confidence - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_prose_is_extracted() {
        let result = sentiment("Sentiment: positive, not really json");
        assert_eq!(result.status, OutcomeStatus::Fallback);
        assert_eq!(result.tier, Tier::Extracted);
        let parsed = result.result.as_sentiment().unwrap();
        assert_eq!(parsed.sentiment, SentimentLabel::Positive);
        assert_eq!(parsed.confidence, 0.5);
    }

    #[test]
    fn test_noise_gets_defaults_and_diagnostics() {
        let noise = "%%%% 0x1f ~~~ ::: ????";
        let result = sentiment(noise);
        assert_eq!(result.status, OutcomeStatus::Fallback);
        assert_eq!(result.tier, Tier::Default);
        assert_eq!(result.result, TaskResult::default_for(TaskType::Sentiment, &TaskPayload::new()));
        let diagnostics = result.diagnostics.unwrap();
        assert!(diagnostics.contains("tier=default"));
        assert!(diagnostics.contains("0x1f"));
    }

    #[test]
    fn test_default_diagnostics_are_truncated() {
        let body = "~".repeat(2_000);
        let diagnostics = sentiment(&body).diagnostics.unwrap();
        assert!(diagnostics.len() < 600);
    }

    #[test]
    fn test_content_prose_becomes_text() {
        let payload = TaskPayload::new().with_topic("tea").with_platform("instagram");
        let result = ResponseInterpreter::new().interpret(
            TaskType::ContentGen,
            &payload,
            "Caption: Steep, sip, smile. Our autumn blend is here!",
        );
        assert_eq!(result.tier, Tier::Extracted);
        let content = result.result.as_content().unwrap();
        assert_eq!(content.text, "Steep, sip, smile. Our autumn blend is here!");
        assert_eq!(content.platform, "instagram");
    }

    #[test]
    fn test_batch_json_array() {
        let payloads = [
            TaskPayload::new().with_text("love it"),
            TaskPayload::new().with_text("hate it"),
            TaskPayload::new().with_text("meh"),
        ];
        let slots: Vec<BatchSlot<'_>> = payloads
            .iter()
            .map(|payload| BatchSlot {
                task_type: TaskType::Sentiment,
                payload,
            })
            .collect();
        let body = r#"[{"sentiment": "positive", "confidence": 0.9}, "negative, quite angry"]"#;

        let results = ResponseInterpreter::new().interpret_batch(&slots, body);
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].tier, Tier::Strict);
        assert_eq!(results[1].status, OutcomeStatus::Fallback);
        assert_eq!(
            results[1].result.as_sentiment().unwrap().sentiment,
            SentimentLabel::Negative
        );
        assert_eq!(results[2].tier, Tier::Default);
    }

    #[test]
    fn test_batch_results_object_and_numbered_segments() {
        let payload = TaskPayload::new();
        let slots = [
            BatchSlot {
                task_type: TaskType::Hashtag,
                payload: &payload,
            },
            BatchSlot {
                task_type: TaskType::Hashtag,
                payload: &payload,
            },
        ];

        let wrapped = r##"{"results": [{"hashtags": [{"tag": "#a", "score": 0.5}]}, {"hashtags": ["#b"]}]}"##;
        let results = ResponseInterpreter::new().interpret_batch(&slots, wrapped);
        assert_eq!(results[0].tier, Tier::Strict);
        assert_eq!(results[1].tier, Tier::Salvaged);

        let numbered = "1. #sunrise #coffee\n2. #deals";
        let results = ResponseInterpreter::new().interpret_batch(&slots, numbered);
        assert_eq!(results[0].result.as_hashtags().unwrap().hashtags.len(), 2);
        assert_eq!(results[1].result.as_hashtags().unwrap().hashtags[0].tag, "#deals");
        assert!(results.iter().all(|r| r.status == OutcomeStatus::Fallback));
    }

    #[test]
    fn test_unsplittable_batch_defaults_every_member() {
        let payload = TaskPayload::new();
        let slots = [
            BatchSlot {
                task_type: TaskType::Sentiment,
                payload: &payload,
            },
            BatchSlot {
                task_type: TaskType::Sentiment,
                payload: &payload,
            },
        ];
        let results = ResponseInterpreter::new().interpret_batch(&slots, "I cannot help with that.");
        assert!(results.iter().all(|r| r.tier == Tier::Default));
    }
}
