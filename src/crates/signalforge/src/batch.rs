//! Opportunistic batching of same-type tasks
//!
//! Tasks of a batchable type that arrive within the collection window are
//! folded into one provider call. Each member waits on its own oneshot
//! channel, so a member whose deadline passes can leave without holding up
//! the others. The combined reply is demultiplexed back in submission order.

use crate::config::BatchConfig;
use crate::dispatcher::{RawResponse, RequestDispatcher};
use crate::error::{Result, SignalError};
use crate::interpreter::{BatchSlot, Interpretation, ResponseInterpreter};
use crate::task::{Task, TaskType};
use llm::TokenUsage;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// What a batch member receives once its batch has been sent.
#[derive(Debug, Clone)]
pub struct BatchReply {
    /// Combined reply, with `usage` narrowed to this member's share
    pub raw: RawResponse,
    pub interpretation: Interpretation,
    /// Number of tasks that shared the call
    pub batch_size: usize,
}

struct Member {
    seq: u64,
    task: Task,
    reply: oneshot::Sender<Result<BatchReply>>,
}

struct PendingBatch {
    id: u64,
    members: Vec<Member>,
}

struct BatchInner {
    dispatcher: Arc<RequestDispatcher>,
    interpreter: ResponseInterpreter,
    window: Duration,
    max_batch_size: usize,
    pending: Mutex<HashMap<TaskType, PendingBatch>>,
    next_id: AtomicU64,
}

/// Collects batchable tasks per type and flushes them on window close or
/// when the size cap is reached.
#[derive(Clone)]
pub struct BatchCoordinator {
    inner: Arc<BatchInner>,
}

impl BatchCoordinator {
    pub fn new(dispatcher: Arc<RequestDispatcher>, config: &BatchConfig) -> Self {
        Self {
            inner: Arc::new(BatchInner {
                dispatcher,
                interpreter: ResponseInterpreter::new(),
                window: config.window(),
                max_batch_size: config.max_batch_size.max(1),
                pending: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn window(&self) -> Duration {
        self.inner.window
    }

    /// Members currently waiting for `task_type`'s open batch.
    pub fn pending_len(&self, task_type: TaskType) -> usize {
        self.inner
            .pending
            .lock()
            .get(&task_type)
            .map_or(0, |batch| batch.members.len())
    }

    /// Join the open batch for the task's type and wait for its share of
    /// the combined reply.
    pub async fn submit(&self, task: Task) -> Result<BatchReply> {
        let task_type = task.task_type;
        let task_id = task.id;
        let deadline = task.deadline;
        let seq = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        let (batch_id, full_batch) = {
            let mut pending = self.inner.pending.lock();
            let batch = pending.entry(task_type).or_insert_with(|| {
                let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
                self.spawn_window(task_type, id);
                PendingBatch {
                    id,
                    members: Vec::new(),
                }
            });
            batch.members.push(Member {
                seq,
                task,
                reply: tx,
            });
            let batch_id = batch.id;
            debug!(
                task_id = %task_id,
                task_type = %task_type,
                batch_id = batch_id,
                members = batch.members.len(),
                "Task joined batch"
            );

            let full = if batch.members.len() >= self.inner.max_batch_size {
                pending.remove(&task_type)
            } else {
                None
            };
            (batch_id, full)
        };

        if let Some(batch) = full_batch {
            debug!(task_type = %task_type, batch_id = batch.id, "Batch full, flushing early");
            let inner = self.inner.clone();
            tokio::spawn(async move { inner.flush(task_type, batch).await });
        }

        let received = match deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, rx).await {
                Ok(received) => received,
                Err(_) => {
                    self.withdraw(task_type, batch_id, seq);
                    return Err(SignalError::UpstreamTimeout(format!(
                        "task {} deadline elapsed while batched",
                        task_id
                    )));
                }
            },
            None => rx.await,
        };

        received.map_err(|_| SignalError::InternalFault("batch closed without a reply".to_string()))?
    }

    fn spawn_window(&self, task_type: TaskType, batch_id: u64) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            tokio::time::sleep(inner.window).await;
            let batch = {
                let mut pending = inner.pending.lock();
                match pending.get(&task_type) {
                    Some(batch) if batch.id == batch_id => pending.remove(&task_type),
                    _ => None,
                }
            };
            if let Some(batch) = batch {
                inner.flush(task_type, batch).await;
            }
        });
    }

    fn withdraw(&self, task_type: TaskType, batch_id: u64, seq: u64) {
        let mut pending = self.inner.pending.lock();
        if let Some(batch) = pending.get_mut(&task_type) {
            if batch.id == batch_id {
                batch.members.retain(|member| member.seq != seq);
                debug!(task_type = %task_type, batch_id = batch_id, "Expired member left batch");
            }
        }
    }
}

impl BatchInner {
    async fn flush(&self, task_type: TaskType, batch: PendingBatch) {
        let now = Instant::now();
        let (live, expired): (Vec<Member>, Vec<Member>) = batch.members.into_iter().partition(|member| {
            !member.reply.is_closed() && member.task.deadline.map_or(true, |deadline| deadline > now)
        });

        for member in expired {
            let _ = member.reply.send(Err(SignalError::UpstreamTimeout(format!(
                "task {} deadline elapsed before batch dispatch",
                member.task.id
            ))));
        }
        if live.is_empty() {
            return;
        }

        let deadline = live
            .iter()
            .map(|member| member.task.deadline)
            .try_fold(None, |latest: Option<Instant>, deadline| {
                deadline.map(|d| Some(latest.map_or(d, |l| l.max(d))))
            })
            .flatten();

        info!(
            task_type = %task_type,
            batch_id = batch.id,
            members = live.len(),
            "Dispatching batch"
        );

        let tasks: Vec<Task> = live.iter().map(|member| member.task.clone()).collect();
        let sent = match tasks.as_slice() {
            [single] => self.dispatcher.send(single, deadline).await,
            _ => self.dispatcher.send_batch(&tasks, deadline).await,
        };

        let raw = match sent {
            Ok(raw) => raw,
            Err(e) => {
                warn!(task_type = %task_type, batch_id = batch.id, error = %e, "Batch dispatch failed");
                for member in live {
                    let _ = member.reply.send(Err(e.clone()));
                }
                return;
            }
        };

        let interpretations = match tasks.as_slice() {
            [single] => vec![self
                .interpreter
                .interpret(single.task_type, &single.payload, &raw.body)],
            _ => {
                let slots: Vec<BatchSlot<'_>> = tasks
                    .iter()
                    .map(|task| BatchSlot {
                        task_type: task.task_type,
                        payload: &task.payload,
                    })
                    .collect();
                self.interpreter.interpret_batch(&slots, &raw.body)
            }
        };

        let batch_size = live.len();
        let shares = split_usage(raw.usage, batch_size);
        for ((member, interpretation), usage) in live.into_iter().zip(interpretations).zip(shares) {
            let reply = BatchReply {
                raw: RawResponse {
                    usage,
                    ..raw.clone()
                },
                interpretation,
                batch_size,
            };
            if member.reply.send(Ok(reply)).is_err() {
                debug!(task_id = %member.task.id, "Batch member left before its reply arrived");
            }
        }
    }
}

impl std::fmt::Debug for BatchCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchCoordinator")
            .field("window", &self.inner.window)
            .field("max_batch_size", &self.inner.max_batch_size)
            .finish()
    }
}

/// Even split of provider usage, remainder to the first member.
fn split_usage(usage: Option<TokenUsage>, members: usize) -> Vec<Option<TokenUsage>> {
    let Some(usage) = usage else {
        return vec![None; members];
    };
    let count = members.max(1) as u64;
    let (input, input_rem) = (usage.input_tokens / count, usage.input_tokens % count);
    let (output, output_rem) = (usage.output_tokens / count, usage.output_tokens % count);

    (0..members)
        .map(|index| {
            let (extra_in, extra_out) = if index == 0 {
                (input_rem, output_rem)
            } else {
                (0, 0)
            };
            Some(TokenUsage::new(input + extra_in, output + extra_out))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::OutcomeStatus;
    use crate::task::TaskPayload;
    use futures::future::join_all;
    use llm::testing::{ScriptedFailure, ScriptedProvider, ScriptedReply};

    fn coordinator(provider: Arc<ScriptedProvider>, max_batch_size: usize) -> BatchCoordinator {
        let config = BatchConfig {
            enabled: true,
            window_ms: 25,
            max_batch_size,
        };
        BatchCoordinator::new(Arc::new(RequestDispatcher::new(provider)), &config)
    }

    fn sentiment(text: &str) -> Task {
        Task::new(TaskType::Sentiment, TaskPayload::new().with_text(text))
    }

    #[test]
    fn test_split_usage_remainder_to_first() {
        let shares = split_usage(Some(TokenUsage::new(10, 7)), 3);
        assert_eq!(shares[0], Some(TokenUsage::new(4, 3)));
        assert_eq!(shares[1], Some(TokenUsage::new(3, 2)));
        assert_eq!(shares[2], Some(TokenUsage::new(3, 2)));
        assert_eq!(split_usage(None, 2), vec![None, None]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_collects_one_call_in_order() {
        let body = r#"[
            {"sentiment": "positive", "confidence": 0.1},
            {"sentiment": "positive", "confidence": 0.2},
            {"sentiment": "negative", "confidence": 0.3},
            {"sentiment": "neutral", "confidence": 0.4},
            {"sentiment": "mixed", "confidence": 0.5}
        ]"#;
        let provider = Arc::new(ScriptedProvider::always(body));
        let coordinator = coordinator(provider.clone(), 8);

        let replies = join_all((0..5).map(|i| coordinator.submit(sentiment(&format!("post {i}"))))).await;

        assert_eq!(provider.call_count(), 1);
        for (index, reply) in replies.into_iter().enumerate() {
            let reply = reply.unwrap();
            assert_eq!(reply.batch_size, 5);
            assert_eq!(reply.interpretation.status, OutcomeStatus::Success);
            let confidence = reply.interpretation.result.as_sentiment().unwrap().confidence;
            assert!((confidence - 0.1 * (index as f64 + 1.0)).abs() < 1e-9);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_size_cap_flushes_early() {
        let provider = Arc::new(ScriptedProvider::always(r##"[{"hashtags": ["#a"]}, {"hashtags": ["#b"]}]"##));
        let coordinator = coordinator(provider.clone(), 2);
        let tasks = (0..3).map(|_| Task::new(TaskType::Hashtag, TaskPayload::new()));

        let replies = join_all(tasks.map(|task| coordinator.submit(task))).await;
        assert!(replies.iter().all(|reply| reply.is_ok()));
        assert_eq!(provider.call_count(), 2);
        assert_eq!(coordinator.pending_len(TaskType::Hashtag), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_member_leaves_batch() {
        let provider = Arc::new(ScriptedProvider::always(
            r#"{"sentiment": "positive", "confidence": 0.9}"#,
        ));
        let coordinator = coordinator(provider.clone(), 8);

        let hurried = sentiment("quick").with_timeout(Duration::from_millis(10));
        let patient = sentiment("slow");
        let (hurried, patient) = tokio::join!(coordinator.submit(hurried), coordinator.submit(patient));

        assert!(matches!(hurried, Err(SignalError::UpstreamTimeout(_))));
        let patient = patient.unwrap();
        assert_eq!(patient.batch_size, 1);
        assert_eq!(provider.call_count(), 1);
        assert!(!provider.requests()[0].prompt.contains("2. "));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_failure_reaches_every_member() {
        let provider = Arc::new(
            ScriptedProvider::always("unused").then_fail(ScriptedFailure::Unauthorized),
        );
        let coordinator = coordinator(provider.clone(), 8);

        let replies = join_all((0..3).map(|i| coordinator.submit(sentiment(&format!("{i}"))))).await;
        assert!(replies
            .iter()
            .all(|reply| matches!(reply, Err(SignalError::UpstreamAuthError(_)))));
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_usage_is_shared() {
        let provider = Arc::new(ScriptedProvider::with_fallback(ScriptedReply::with_usage(
            r#"[{"sentiment": "positive", "confidence": 0.9}, {"sentiment": "negative", "confidence": 0.9}]"#,
            31,
            10,
        )));
        let coordinator = coordinator(provider, 8);

        let replies = join_all([sentiment("a"), sentiment("b")].map(|task| coordinator.submit(task))).await;
        let first = replies[0].as_ref().unwrap().raw.usage.unwrap();
        let second = replies[1].as_ref().unwrap().raw.usage.unwrap();
        assert_eq!(first, TokenUsage::new(16, 5));
        assert_eq!(second, TokenUsage::new(15, 5));
    }
}
