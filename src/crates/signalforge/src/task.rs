//! Task model
//!
//! A [`Task`] is immutable once built: builder methods consume `self`, and the
//! pipeline only ever reads it.

use crate::error::{Result, SignalError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// Kind of work a task asks the provider to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TaskType {
    #[serde(rename = "content")]
    ContentGen,
    #[serde(rename = "sentiment")]
    Sentiment,
    #[serde(rename = "hashtags")]
    Hashtag,
    #[serde(rename = "schedule")]
    Schedule,
}

impl TaskType {
    /// All task types, in declaration order.
    pub const ALL: [TaskType; 4] = [
        TaskType::ContentGen,
        TaskType::Sentiment,
        TaskType::Hashtag,
        TaskType::Schedule,
    ];

    /// Stable label used in fingerprints, config keys and logs.
    pub fn label(&self) -> &'static str {
        match self {
            TaskType::ContentGen => "content",
            TaskType::Sentiment => "sentiment",
            TaskType::Hashtag => "hashtags",
            TaskType::Schedule => "schedule",
        }
    }

    /// Whether the provider prompt for this type accepts several items per call.
    pub fn supports_batching(&self) -> bool {
        matches!(self, TaskType::Sentiment | TaskType::Hashtag)
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for TaskType {
    type Err = SignalError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "content" | "content_gen" | "contentgen" => Ok(TaskType::ContentGen),
            "sentiment" => Ok(TaskType::Sentiment),
            "hashtags" | "hashtag" => Ok(TaskType::Hashtag),
            "schedule" => Ok(TaskType::Schedule),
            other => Err(SignalError::Config(format!("Unknown task type: {}", other))),
        }
    }
}

/// Caller-supplied inputs for a task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPayload {
    pub topic: Option<String>,
    pub text: Option<String>,
    pub platform: Option<String>,
    pub tone: Option<String>,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

impl TaskPayload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = Some(platform.into());
        self
    }

    pub fn with_tone(mut self, tone: impl Into<String>) -> Self {
        self.tone = Some(tone.into());
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Output-affecting fields in fingerprint form: trimmed, whitespace
    /// collapsed, lowercased. Empty values are dropped.
    pub fn normalized_fields(&self) -> Vec<(String, String)> {
        let mut fields = Vec::new();
        let named = [
            ("topic", &self.topic),
            ("text", &self.text),
            ("platform", &self.platform),
            ("tone", &self.tone),
        ];
        for (name, value) in named {
            if let Some(value) = value.as_deref().and_then(normalize) {
                fields.push((name.to_string(), value));
            }
        }
        for (key, value) in &self.options {
            if let (Some(key), Some(value)) = (normalize(key), normalize(value)) {
                fields.push((format!("option.{}", key), value));
            }
        }
        fields
    }

    /// Platform with surrounding whitespace removed, if any.
    pub fn platform_or<'a>(&'a self, default: &'a str) -> &'a str {
        non_empty(&self.platform).unwrap_or(default)
    }

    /// Tone with surrounding whitespace removed, if any.
    pub fn tone_or<'a>(&'a self, default: &'a str) -> &'a str {
        non_empty(&self.tone).unwrap_or(default)
    }

    /// Topic with surrounding whitespace removed, if any.
    pub fn topic(&self) -> Option<&str> {
        non_empty(&self.topic)
    }

    /// Text with surrounding whitespace removed, if any.
    pub fn text(&self) -> Option<&str> {
        non_empty(&self.text)
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn normalize(value: &str) -> Option<String> {
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed.to_lowercase())
    }
}

/// A unit of work submitted to the pipeline.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: Uuid,
    pub task_type: TaskType,
    pub payload: TaskPayload,
    pub estimated_tokens: Option<u64>,
    pub deadline: Option<Instant>,
}

impl Task {
    pub fn new(task_type: TaskType, payload: TaskPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_type,
            payload,
            estimated_tokens: None,
            deadline: None,
        }
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    /// Override the pipeline's token estimate for this task.
    pub fn with_estimated_tokens(mut self, tokens: u64) -> Self {
        self.estimated_tokens = Some(tokens);
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Deadline relative to now.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        self.with_deadline(deadline)
    }

    /// Whether the deadline has already passed.
    pub fn is_expired(&self) -> bool {
        self.deadline.map(|d| Instant::now() >= d).unwrap_or(false)
    }
}

/// Lifecycle of a task inside the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Pending,
    Reserved,
    CacheHit,
    Dispatched,
    Interpreting,
    Done,
    FallbackDone,
    Failed,
}

impl TaskState {
    /// Move to `to`, rejecting edges the lifecycle does not allow.
    pub fn transition(self, to: TaskState) -> Result<TaskState> {
        use TaskState::*;
        let allowed = matches!(
            (self, to),
            (Pending, Reserved)
                | (Pending, Failed)
                | (Reserved, CacheHit)
                | (Reserved, Dispatched)
                | (Reserved, Failed)
                | (CacheHit, Done)
                | (Dispatched, Interpreting)
                | (Dispatched, Failed)
                | (Interpreting, Done)
                | (Interpreting, FallbackDone)
        );
        if allowed {
            Ok(to)
        } else {
            Err(SignalError::InvalidStateTransition { from: self, to })
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Done | TaskState::FallbackDone | TaskState::Failed)
    }
}
