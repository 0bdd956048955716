//! Provider call execution
//!
//! [`RequestDispatcher`] renders prompts, bounds every attempt with a timeout
//! clamped to the caller's deadline and retries transient failures according
//! to a [`RetryPolicy`]. Failures come back as [`SignalError`] kinds:
//!
//! - deadline elapsed at any point → `UpstreamTimeout`
//! - authentication problems → `UpstreamAuthError`, never retried
//! - other permanent provider errors → `UpstreamRejected`
//! - transient errors after the last attempt → `NetworkError`

pub mod prompt;
mod retry;

pub use retry::RetryPolicy;

use crate::config::{DispatchConfig, ResponseAllowance};
use crate::error::{Result, SignalError};
use crate::task::{Task, TaskType};
use llm::{CompletionProvider, CompletionRequest, ErrorClass, LlmError, TokenUsage};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Provider reply plus call metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct RawResponse {
    pub body: String,
    pub usage: Option<TokenUsage>,
    pub model: Option<String>,
    /// Attempts beyond the first
    pub retries_used: u32,
    pub latency: Duration,
}

pub struct RequestDispatcher {
    provider: Arc<dyn CompletionProvider>,
    policy: RetryPolicy,
    attempt_timeout: Duration,
    temperature: Option<f32>,
    response_tokens: ResponseAllowance,
}

impl RequestDispatcher {
    pub fn new(provider: Arc<dyn CompletionProvider>) -> Self {
        Self::from_config(provider, &DispatchConfig::default())
    }

    pub fn from_config(provider: Arc<dyn CompletionProvider>, config: &DispatchConfig) -> Self {
        Self {
            provider,
            policy: RetryPolicy::from(config),
            attempt_timeout: config.attempt_timeout(),
            temperature: None,
            response_tokens: config.response_tokens.clone(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// Send one task.
    pub async fn send(&self, task: &Task, deadline: Option<Instant>) -> Result<RawResponse> {
        let request = self.request(
            prompt::system_prompt(task.task_type),
            prompt::task_prompt(task),
            task.task_type,
            1,
        );
        let operation = format!("{}:{}", task.task_type, task.id);
        self.call(request, &operation, deadline).await
    }

    /// Send same-type tasks as one combined call.
    pub async fn send_batch(&self, tasks: &[Task], deadline: Option<Instant>) -> Result<RawResponse> {
        let Some(first) = tasks.first() else {
            return Err(SignalError::InternalFault(
                "cannot dispatch an empty batch".to_string(),
            ));
        };
        if tasks.iter().any(|task| task.task_type != first.task_type) {
            return Err(SignalError::InternalFault(
                "batch members must share one task type".to_string(),
            ));
        }

        let request = self.request(
            prompt::batch_system_prompt(first.task_type, tasks.len()),
            prompt::batch_prompt(tasks),
            first.task_type,
            tasks.len(),
        );
        let operation = format!("{}:batch[{}]", first.task_type, tasks.len());
        self.call(request, &operation, deadline).await
    }

    fn request(&self, system: String, user: String, task_type: TaskType, items: usize) -> CompletionRequest {
        let allowance = self.response_tokens.for_type(task_type).saturating_mul(items as u64);
        let mut request = CompletionRequest::new(user)
            .with_system(system)
            .with_max_tokens(u32::try_from(allowance).unwrap_or(u32::MAX));
        if let Some(temperature) = self.temperature {
            request = request.with_temperature(temperature);
        }
        request
    }

    async fn call(
        &self,
        request: CompletionRequest,
        operation: &str,
        deadline: Option<Instant>,
    ) -> Result<RawResponse> {
        let started = Instant::now();
        let mut attempts: u32 = 0;

        loop {
            let attempt_timeout = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(deadline_elapsed(operation, attempts));
                    }
                    remaining.min(self.attempt_timeout)
                }
                None => self.attempt_timeout,
            };

            attempts += 1;
            if attempts > 1 {
                info!(
                    operation = operation,
                    attempt = attempts,
                    max_attempts = self.policy.max_attempts,
                    "Retrying provider call"
                );
            }

            let outcome =
                tokio::time::timeout(attempt_timeout, self.provider.complete(request.clone())).await;

            let failure = match outcome {
                Ok(Ok(response)) => {
                    if attempts > 1 {
                        info!(
                            operation = operation,
                            attempt = attempts,
                            "Provider call succeeded after retry"
                        );
                    }
                    return Ok(RawResponse {
                        body: response.text,
                        usage: response.usage,
                        model: response.model,
                        retries_used: attempts - 1,
                        latency: started.elapsed(),
                    });
                }
                Ok(Err(e)) => e,
                Err(_) => LlmError::Timeout(format!(
                    "attempt exceeded {} ms",
                    attempt_timeout.as_millis()
                )),
            };

            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return Err(deadline_elapsed(operation, attempts));
            }

            let classification = failure.classify();
            debug!(
                operation = operation,
                attempt = attempts,
                error = ?failure,
                classification = ?classification,
                "Provider call failed"
            );

            if failure.is_auth_error() {
                error!(operation = operation, error = %failure, "Provider rejected credentials");
                return Err(SignalError::UpstreamAuthError(failure.to_string()));
            }
            if classification == ErrorClass::Permanent {
                error!(
                    operation = operation,
                    error = %failure,
                    "Permanent provider error, aborting retries"
                );
                return Err(SignalError::UpstreamRejected(failure.to_string()));
            }

            if !self.policy.should_retry(attempts) {
                error!(
                    operation = operation,
                    attempts = attempts,
                    error = %failure,
                    "All retry attempts exhausted"
                );
                return Err(SignalError::NetworkError {
                    attempts,
                    last: failure.to_string(),
                });
            }

            let delay = self.policy.delay_for(attempts - 1);
            if deadline.is_some_and(|deadline| Instant::now() + delay >= deadline) {
                return Err(deadline_elapsed(operation, attempts));
            }

            warn!(
                operation = operation,
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                "Transient provider error, will retry after delay"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

impl std::fmt::Debug for RequestDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestDispatcher")
            .field("provider", &self.provider.name())
            .field("policy", &self.policy)
            .field("attempt_timeout", &self.attempt_timeout)
            .finish()
    }
}

fn deadline_elapsed(operation: &str, attempts: u32) -> SignalError {
    warn!(operation = operation, attempts = attempts, "Deadline elapsed during dispatch");
    SignalError::UpstreamTimeout(format!(
        "deadline elapsed after {} attempt(s) for {}",
        attempts, operation
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskPayload;
    use llm::testing::{ScriptedFailure, ScriptedProvider, ScriptedReply};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts)
            .with_base_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(1_000))
            .with_jitter(false)
    }

    fn sentiment_task() -> Task {
        Task::new(TaskType::Sentiment, TaskPayload::new().with_text("great launch"))
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_then_succeeds() {
        let provider = Arc::new(
            ScriptedProvider::always("{}")
                .then_fail(ScriptedFailure::ServerError(503))
                .then_fail(ScriptedFailure::ConnectionReset)
                .then(ScriptedReply::text("ok")),
        );
        let dispatcher = RequestDispatcher::new(provider.clone()).with_policy(fast_policy(3));

        let raw = dispatcher.send(&sentiment_task(), None).await.unwrap();
        assert_eq!(raw.body, "ok");
        assert_eq!(raw.retries_used, 2);
        assert_eq!(provider.call_count(), 3);
        // 100 ms + 200 ms of backoff on the paused clock
        assert_eq!(raw.latency, Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_become_network_error() {
        let provider = Arc::new(ScriptedProvider::with_fallback(ScriptedReply::Fail(
            ScriptedFailure::RateLimited,
        )));
        let dispatcher = RequestDispatcher::new(provider.clone()).with_policy(fast_policy(3));

        let err = dispatcher.send(&sentiment_task(), None).await.unwrap_err();
        assert!(matches!(err, SignalError::NetworkError { attempts: 3, .. }));
        assert_eq!(provider.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_error_is_not_retried() {
        let provider = Arc::new(
            ScriptedProvider::always("unused").then_fail(ScriptedFailure::Unauthorized),
        );
        let dispatcher = RequestDispatcher::new(provider.clone()).with_policy(fast_policy(5));

        let err = dispatcher.send(&sentiment_task(), None).await.unwrap_err();
        assert!(matches!(err, SignalError::UpstreamAuthError(_)));
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bad_request_is_rejected() {
        let provider = Arc::new(
            ScriptedProvider::always("unused").then_fail(ScriptedFailure::BadRequest),
        );
        let dispatcher = RequestDispatcher::new(provider.clone()).with_policy(fast_policy(5));

        let err = dispatcher.send(&sentiment_task(), None).await.unwrap_err();
        assert!(matches!(err, SignalError::UpstreamRejected(_)));
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_attempt_times_out_and_retries() {
        let provider = Arc::new(
            ScriptedProvider::always("fast")
                .then(ScriptedReply::delayed(Duration::from_secs(10), ScriptedReply::text("slow"))),
        );
        let dispatcher = RequestDispatcher::new(provider.clone())
            .with_policy(fast_policy(2))
            .with_attempt_timeout(Duration::from_secs(1));

        let raw = dispatcher.send(&sentiment_task(), None).await.unwrap();
        assert_eq!(raw.body, "fast");
        assert_eq!(raw.retries_used, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_aborts_in_flight_attempt() {
        let provider = Arc::new(ScriptedProvider::always("late").with_delay(Duration::from_secs(5)));
        let dispatcher = RequestDispatcher::new(provider.clone()).with_policy(fast_policy(3));

        let started = Instant::now();
        let deadline = started + Duration::from_millis(250);
        let err = dispatcher.send(&sentiment_task(), Some(deadline)).await.unwrap_err();

        assert!(matches!(err, SignalError::UpstreamTimeout(_)));
        assert_eq!(provider.call_count(), 1);
        assert_eq!(started.elapsed(), Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_past_deadline_stops_retrying() {
        let provider = Arc::new(ScriptedProvider::with_fallback(ScriptedReply::Fail(
            ScriptedFailure::ServerError(500),
        )));
        let dispatcher = RequestDispatcher::new(provider.clone()).with_policy(
            RetryPolicy::new(5)
                .with_base_delay(Duration::from_secs(2))
                .with_jitter(false),
        );

        let deadline = Instant::now() + Duration::from_secs(1);
        let err = dispatcher.send(&sentiment_task(), Some(deadline)).await.unwrap_err();
        assert!(matches!(err, SignalError::UpstreamTimeout(_)));
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn test_send_batch_renders_one_request() {
        let provider = Arc::new(ScriptedProvider::always("[]"));
        let dispatcher = RequestDispatcher::new(provider.clone()).with_temperature(0.2);
        let tasks = vec![sentiment_task(), sentiment_task()];

        dispatcher.send_batch(&tasks, None).await.unwrap();
        let requests = provider.requests();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].prompt.contains("2. Analyze"));
        assert_eq!(requests[0].temperature, Some(0.2));
        assert_eq!(requests[0].max_tokens, Some(240));
    }

    #[tokio::test]
    async fn test_send_batch_rejects_mixed_types() {
        let dispatcher = RequestDispatcher::new(Arc::new(ScriptedProvider::always("[]")));
        let tasks = vec![
            sentiment_task(),
            Task::new(TaskType::Hashtag, TaskPayload::new()),
        ];
        let err = dispatcher.send_batch(&tasks, None).await.unwrap_err();
        assert!(matches!(err, SignalError::InternalFault(_)));
        assert!(dispatcher.send_batch(&[], None).await.is_err());
    }
}
