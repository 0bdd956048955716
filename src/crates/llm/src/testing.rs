//! Deterministic provider for tests and offline runs.
//!
//! `ScriptedProvider` replays a queue of canned replies and failures, counts
//! calls and captures every request it receives.

use crate::error::{LlmError, Result};
use crate::provider::{CompletionProvider, CompletionRequest, CompletionResponse, TokenUsage};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Failure modes a scripted call can simulate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptedFailure {
    Timeout,
    RateLimited,
    ServerError(u16),
    ConnectionReset,
    Unauthorized,
    BadRequest,
}

impl ScriptedFailure {
    fn to_error(self) -> LlmError {
        match self {
            ScriptedFailure::Timeout => LlmError::Timeout("scripted timeout".to_string()),
            ScriptedFailure::RateLimited => LlmError::from_status(429, "scripted rate limit"),
            ScriptedFailure::ServerError(status) => {
                LlmError::from_status(status, "scripted server error")
            }
            ScriptedFailure::ConnectionReset => {
                LlmError::Other("connection reset by peer".to_string())
            }
            ScriptedFailure::Unauthorized => LlmError::from_status(401, "invalid api key"),
            ScriptedFailure::BadRequest => LlmError::from_status(400, "malformed request"),
        }
    }
}

/// One scripted step.
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    Text(String),
    TextWithUsage(String, TokenUsage),
    Fail(ScriptedFailure),
    /// Wait before producing the inner reply.
    Delayed(Duration, Box<ScriptedReply>),
}

impl ScriptedReply {
    pub fn text(text: impl Into<String>) -> Self {
        ScriptedReply::Text(text.into())
    }

    pub fn with_usage(text: impl Into<String>, input: u64, output: u64) -> Self {
        ScriptedReply::TextWithUsage(text.into(), TokenUsage::new(input, output))
    }

    pub fn delayed(delay: Duration, reply: ScriptedReply) -> Self {
        ScriptedReply::Delayed(delay, Box::new(reply))
    }
}

/// Provider that replays scripted replies in order.
pub struct ScriptedProvider {
    script: Mutex<VecDeque<ScriptedReply>>,
    fallback: ScriptedReply,
    delay: Duration,
    calls: AtomicUsize,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedProvider {
    /// Provider that always answers with `text`.
    pub fn always(text: impl Into<String>) -> Self {
        Self::with_fallback(ScriptedReply::text(text))
    }

    /// Provider that answers every call with `reply` once the script is drained.
    pub fn with_fallback(reply: ScriptedReply) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: reply,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Queue a reply ahead of the fallback.
    pub fn then(self, reply: ScriptedReply) -> Self {
        self.script.lock().push_back(reply);
        self
    }

    /// Queue a failure ahead of the fallback.
    pub fn then_fail(self, failure: ScriptedFailure) -> Self {
        self.then(ScriptedReply::Fail(failure))
    }

    /// Delay applied to every call before the scripted reply.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Number of calls received so far.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Copies of every request received so far.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().clone()
    }

    fn next_reply(&self) -> ScriptedReply {
        self.script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

#[async_trait]
impl CompletionProvider for ScriptedProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let mut reply = self.next_reply();
        loop {
            match reply {
                ScriptedReply::Text(text) => return Ok(CompletionResponse::new(text)),
                ScriptedReply::TextWithUsage(text, usage) => {
                    return Ok(CompletionResponse::new(text).with_usage(usage))
                }
                ScriptedReply::Fail(failure) => return Err(failure.to_error()),
                ScriptedReply::Delayed(delay, inner) => {
                    tokio::time::sleep(delay).await;
                    reply = *inner;
                }
            }
        }
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_script_then_fallback() {
        let provider = ScriptedProvider::always("fallback")
            .then_fail(ScriptedFailure::ServerError(503))
            .then(ScriptedReply::with_usage("first", 10, 5));

        let err = provider
            .complete(CompletionRequest::new("a"))
            .await
            .unwrap_err();
        assert!(err.is_retryable());

        let first = provider.complete(CompletionRequest::new("b")).await.unwrap();
        assert_eq!(first.text, "first");
        assert_eq!(first.usage.map(|u| u.total()), Some(15));

        let rest = provider.complete(CompletionRequest::new("c")).await.unwrap();
        assert_eq!(rest.text, "fallback");
        assert_eq!(provider.call_count(), 3);
        assert_eq!(provider.requests()[2].prompt, "c");
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_reply() {
        let provider = ScriptedProvider::always("late")
            .then(ScriptedReply::delayed(Duration::from_secs(5), ScriptedReply::text("slow")));

        let started = tokio::time::Instant::now();
        let reply = provider.complete(CompletionRequest::new("x")).await.unwrap();
        assert_eq!(reply.text, "slow");
        assert!(started.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_auth_failure_is_permanent() {
        let provider = ScriptedProvider::always("ok").then_fail(ScriptedFailure::Unauthorized);
        let err = provider.complete(CompletionRequest::new("x")).await.unwrap_err();
        assert!(err.is_auth_error());
        assert!(!err.is_retryable());
    }
}
