//! Prompt rendering for single and batched provider calls

use crate::task::{Task, TaskPayload, TaskType};

/// System prompt demanding the JSON schema for `task_type`.
pub fn system_prompt(task_type: TaskType) -> String {
    let schema = match task_type {
        TaskType::ContentGen => {
            r#"{"text": "the post text", "platform": "target platform", "tone": "tone used"}"#
        }
        TaskType::Sentiment => {
            r#"{"sentiment": "positive" | "negative" | "neutral" | "mixed", "confidence": 0.0-1.0, "emotion": "primary emotion", "urgency": "low" | "medium" | "high", "suggested_tone": "tone for a reply"}"#
        }
        TaskType::Hashtag => {
            r##"{"hashtags": [{"tag": "#example", "score": 0.0-1.0}]}"##
        }
        TaskType::Schedule => {
            r#"{"slots": [{"day": "Monday", "time": "HH:MM", "expected_engagement": 0.0-1.0}]}"#
        }
    };

    format!(
        "You are a social media assistant performing {} tasks.\n\n\
         Respond with a single JSON object and nothing else, using this structure:\n\n\
         ```json\n{}\n```",
        task_type.label(),
        schema
    )
}

/// System prompt for a combined call covering `count` items.
pub fn batch_system_prompt(task_type: TaskType, count: usize) -> String {
    format!(
        "{}\n\nYou will receive {} numbered items. Respond with a JSON array holding \
         exactly {} such objects, in the same order as the items.",
        system_prompt(task_type),
        count,
        count
    )
}

fn instruction(task_type: TaskType, payload: &TaskPayload) -> String {
    match task_type {
        TaskType::ContentGen => format!(
            "Write a {} post about {}.",
            payload.platform_or("social media"),
            payload.topic().or(payload.text()).unwrap_or("our latest update")
        ),
        TaskType::Sentiment => "Analyze the sentiment of this text.".to_string(),
        TaskType::Hashtag => "Suggest ranked hashtags for this content.".to_string(),
        TaskType::Schedule => format!(
            "Recommend the best posting times on {}.",
            payload.platform_or("social media")
        ),
    }
}

fn payload_lines(payload: &TaskPayload) -> String {
    let mut lines = String::new();
    let fields = [
        ("Topic", payload.topic()),
        ("Text", payload.text()),
        ("Platform", payload.platform.as_deref()),
        ("Tone", payload.tone.as_deref()),
    ];
    for (name, value) in fields {
        if let Some(value) = value.filter(|v| !v.trim().is_empty()) {
            lines.push_str(&format!("{}: {}\n", name, value.trim()));
        }
    }
    for (key, value) in &payload.options {
        lines.push_str(&format!("  - {}: {}\n", key, value));
    }
    lines
}

/// User prompt for a single task.
pub fn task_prompt(task: &Task) -> String {
    let mut prompt = instruction(task.task_type, &task.payload);
    prompt.push_str("\n\n");
    prompt.push_str(&payload_lines(&task.payload));
    prompt
}

/// User prompt listing every task as a numbered item.
pub fn batch_prompt(tasks: &[Task]) -> String {
    let mut prompt = String::new();
    for (index, task) in tasks.iter().enumerate() {
        prompt.push_str(&format!(
            "{}. {}\n{}\n",
            index + 1,
            instruction(task.task_type, &task.payload),
            payload_lines(&task.payload)
        ));
    }
    prompt
}
