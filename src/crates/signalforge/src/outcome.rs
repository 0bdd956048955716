//! Outcome payloads returned to callers
//!
//! Each task type has a fixed result shape. Every shape has documented
//! defaults so the interpreter can always produce a schema-valid value.

use crate::task::{TaskPayload, TaskType};
use chrono::Weekday;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

pub const DEFAULT_CONFIDENCE: f64 = 0.5;
pub const DEFAULT_EMOTION: &str = "neutral";
pub const DEFAULT_SUGGESTED_TONE: &str = "professional";
pub const DEFAULT_PLATFORM: &str = "general";
pub const DEFAULT_TONE: &str = "neutral";
pub const DEFAULT_ENGAGEMENT: f64 = 0.5;

/// Sentiment label, a closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SentimentLabel {
    Positive,
    Negative,
    Neutral,
    Mixed,
}

impl SentimentLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            SentimentLabel::Positive => "positive",
            SentimentLabel::Negative => "negative",
            SentimentLabel::Neutral => "neutral",
            SentimentLabel::Mixed => "mixed",
        }
    }
}

impl FromStr for SentimentLabel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "positive" => Ok(SentimentLabel::Positive),
            "negative" => Ok(SentimentLabel::Negative),
            "neutral" => Ok(SentimentLabel::Neutral),
            "mixed" => Ok(SentimentLabel::Mixed),
            other => Err(format!("unknown sentiment label: {}", other)),
        }
    }
}

/// How quickly a post needs a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Low,
    Medium,
    High,
}

impl FromStr for Urgency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "low" => Ok(Urgency::Low),
            "medium" | "moderate" => Ok(Urgency::Medium),
            "high" | "urgent" => Ok(Urgency::High),
            other => Err(format!("unknown urgency: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentResult {
    pub text: String,
    pub platform: String,
    pub tone: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentimentResult {
    pub sentiment: SentimentLabel,
    pub confidence: f64,
    pub emotion: String,
    pub urgency: Urgency,
    pub suggested_tone: String,
}

impl Default for SentimentResult {
    fn default() -> Self {
        Self {
            sentiment: SentimentLabel::Neutral,
            confidence: DEFAULT_CONFIDENCE,
            emotion: DEFAULT_EMOTION.to_string(),
            urgency: Urgency::Low,
            suggested_tone: DEFAULT_SUGGESTED_TONE.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedHashtag {
    pub tag: String,
    pub score: f64,
}

impl RankedHashtag {
    /// Build a hashtag, normalizing the tag to a single `#word` token.
    pub fn new(tag: &str, score: f64) -> Option<Self> {
        let body: String = tag
            .trim()
            .trim_start_matches('#')
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_')
            .collect();
        if body.is_empty() {
            return None;
        }
        Some(Self {
            tag: format!("#{}", body),
            score,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HashtagResult {
    pub hashtags: Vec<RankedHashtag>,
}

impl HashtagResult {
    /// Sort by score descending, keeping provider order on ties, and drop
    /// duplicate tags (first occurrence wins).
    pub fn ranked(hashtags: Vec<RankedHashtag>) -> Self {
        let mut seen = std::collections::HashSet::new();
        let mut hashtags: Vec<RankedHashtag> = hashtags
            .into_iter()
            .filter(|h| seen.insert(h.tag.to_lowercase()))
            .collect();
        hashtags.sort_by(|a, b| b.score.total_cmp(&a.score));
        Self { hashtags }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleSlot {
    pub day: Weekday,
    /// 24-hour `HH:MM`
    pub time: String,
    pub expected_engagement: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleResult {
    pub slots: Vec<ScheduleSlot>,
}

impl ScheduleResult {
    /// Sort by expected engagement descending, keeping provider order on ties.
    pub fn ranked(mut slots: Vec<ScheduleSlot>) -> Self {
        slots.sort_by(|a, b| b.expected_engagement.total_cmp(&a.expected_engagement));
        Self { slots }
    }
}

impl Default for ScheduleResult {
    fn default() -> Self {
        let slot = |day, time: &str| ScheduleSlot {
            day,
            time: time.to_string(),
            expected_engagement: DEFAULT_ENGAGEMENT,
        };
        Self {
            slots: vec![
                slot(Weekday::Tue, "10:00"),
                slot(Weekday::Wed, "12:00"),
                slot(Weekday::Thu, "15:00"),
            ],
        }
    }
}

/// Schema-typed result, one variant per task type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskResult {
    Content(ContentResult),
    Sentiment(SentimentResult),
    Hashtags(HashtagResult),
    Schedule(ScheduleResult),
}

impl TaskResult {
    /// Fully default-populated result for a task.
    pub fn default_for(task_type: TaskType, payload: &TaskPayload) -> Self {
        match task_type {
            TaskType::ContentGen => TaskResult::Content(ContentResult {
                text: match payload.topic() {
                    Some(topic) => format!("More on {} soon.", topic),
                    None => "More updates soon.".to_string(),
                },
                platform: payload.platform_or(DEFAULT_PLATFORM).to_string(),
                tone: payload.tone_or(DEFAULT_TONE).to_string(),
            }),
            TaskType::Sentiment => TaskResult::Sentiment(SentimentResult::default()),
            TaskType::Hashtag => TaskResult::Hashtags(HashtagResult::default()),
            TaskType::Schedule => TaskResult::Schedule(ScheduleResult::default()),
        }
    }

    pub fn task_type(&self) -> TaskType {
        match self {
            TaskResult::Content(_) => TaskType::ContentGen,
            TaskResult::Sentiment(_) => TaskType::Sentiment,
            TaskResult::Hashtags(_) => TaskType::Hashtag,
            TaskResult::Schedule(_) => TaskType::Schedule,
        }
    }

    pub fn as_sentiment(&self) -> Option<&SentimentResult> {
        match self {
            TaskResult::Sentiment(result) => Some(result),
            _ => None,
        }
    }

    pub fn as_content(&self) -> Option<&ContentResult> {
        match self {
            TaskResult::Content(result) => Some(result),
            _ => None,
        }
    }

    pub fn as_hashtags(&self) -> Option<&HashtagResult> {
        match self {
            TaskResult::Hashtags(result) => Some(result),
            _ => None,
        }
    }

    pub fn as_schedule(&self) -> Option<&ScheduleResult> {
        match self {
            TaskResult::Schedule(result) => Some(result),
            _ => None,
        }
    }
}

/// Failure categories recorded for usage accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    BudgetExceeded,
    UpstreamTimeout,
    UpstreamAuth,
    Network,
    UpstreamRejected,
    Internal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "kind")]
pub enum OutcomeStatus {
    Success,
    Fallback,
    Error(ErrorKind),
}

impl fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutcomeStatus::Success => f.write_str("success"),
            OutcomeStatus::Fallback => f.write_str("fallback"),
            OutcomeStatus::Error(kind) => write!(f, "error:{:?}", kind),
        }
    }
}

/// Final result of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestOutcome {
    pub task_id: Uuid,
    pub task_type: TaskType,
    pub status: OutcomeStatus,
    pub result: TaskResult,
    pub raw_response: String,
    /// Which interpreter tier produced the result, plus a raw excerpt for the default tier
    pub diagnostics: Option<String>,
    pub retries_used: u32,
    pub latency: Duration,
    pub tokens_used: u64,
    pub from_cache: bool,
}

impl RequestOutcome {
    pub fn is_fallback(&self) -> bool {
        self.status == OutcomeStatus::Fallback
    }

    /// Copy of this outcome handed to another caller.
    pub fn reassigned(&self, task_id: Uuid, from_cache: bool) -> Self {
        Self {
            task_id,
            from_cache,
            ..self.clone()
        }
    }
}
