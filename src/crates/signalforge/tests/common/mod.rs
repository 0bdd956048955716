//! Shared helpers for signalforge integration tests

#![allow(dead_code)]

use llm::testing::ScriptedProvider;
use signalforge::config::SignalforgeConfig;
use signalforge::{InMemoryUsageLog, Task, TaskPayload, TaskPipeline, TaskType};
use std::sync::Arc;

pub struct Harness {
    pub pipeline: TaskPipeline,
    pub provider: Arc<ScriptedProvider>,
    pub usage: Arc<InMemoryUsageLog>,
}

pub fn harness(provider: ScriptedProvider, config: SignalforgeConfig) -> Harness {
    let provider = Arc::new(provider);
    let usage = Arc::new(InMemoryUsageLog::new());
    let pipeline = TaskPipeline::builder()
        .config(config)
        .provider(provider.clone())
        .recorder(usage.clone())
        .build()
        .expect("pipeline should build");
    Harness {
        pipeline,
        provider,
        usage,
    }
}

pub fn sentiment(text: &str) -> Task {
    Task::new(TaskType::Sentiment, TaskPayload::new().with_text(text))
}

pub fn content(topic: &str) -> Task {
    Task::new(
        TaskType::ContentGen,
        TaskPayload::new()
            .with_topic(topic)
            .with_platform("twitter")
            .with_tone("friendly"),
    )
}
