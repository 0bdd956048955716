//! Task pipeline facade
//!
//! [`TaskPipeline::submit`] drives a task through its whole lifecycle:
//! budget reservation, cache lookup with single-flight coalescing, dispatch
//! (batched when the type allows it), interpretation, budget commit and usage
//! recording. Fatal errors roll the reservation back and surface as `Err`;
//! malformed provider output never does.

use crate::batch::BatchCoordinator;
use crate::budget::{BudgetLedger, BudgetStatus, Reservation};
use crate::cache::{CacheSource, CacheStats, Fingerprint, Lookup, ResultCache};
use crate::config::SignalforgeConfig;
use crate::dispatcher::{prompt, RawResponse, RequestDispatcher};
use crate::error::{Result, SignalError};
use crate::estimator::TokenEstimator;
use crate::interpreter::{Interpretation, ResponseInterpreter};
use crate::outcome::{OutcomeStatus, RequestOutcome};
use crate::task::{Task, TaskState};
use crate::usage::{InMemoryUsageLog, UsageRecord, UsageRecorder};
use chrono::Utc;
use futures::future::join_all;
use llm::{CompletionProvider, CompletionRequest, TokenUsage};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Builder for [`TaskPipeline`].
#[derive(Default)]
pub struct TaskPipelineBuilder {
    config: Option<SignalforgeConfig>,
    provider: Option<Arc<dyn CompletionProvider>>,
    recorder: Option<Arc<dyn UsageRecorder>>,
    ledger: Option<BudgetLedger>,
}

impl TaskPipelineBuilder {
    pub fn config(mut self, config: SignalforgeConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn provider(mut self, provider: Arc<dyn CompletionProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn recorder(mut self, recorder: Arc<dyn UsageRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// Use a prepared ledger, e.g. one seeded from persisted usage.
    pub fn ledger(mut self, ledger: BudgetLedger) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn build(self) -> Result<TaskPipeline> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let provider = self
            .provider
            .ok_or_else(|| SignalError::Config("a completion provider is required".to_string()))?;
        let dispatcher = Arc::new(
            RequestDispatcher::from_config(provider, &config.dispatch)
                .with_temperature(config.provider.temperature),
        );
        let batcher = config
            .batch
            .enabled
            .then(|| BatchCoordinator::new(dispatcher.clone(), &config.batch));
        let ledger = self
            .ledger
            .unwrap_or_else(|| BudgetLedger::new(config.budget.clone()));

        info!(
            provider = dispatcher.provider_name(),
            model = %config.provider.model,
            daily_limit = ledger.config().daily_limit,
            batching = batcher.is_some(),
            caching = config.cache.enabled,
            "Task pipeline ready"
        );

        Ok(TaskPipeline {
            ledger: Arc::new(ledger),
            cache: ResultCache::new(config.cache.max_entries),
            dispatcher,
            batcher,
            interpreter: ResponseInterpreter::new(),
            estimator: TokenEstimator::new(config.provider.model.clone()),
            recorder: self
                .recorder
                .unwrap_or_else(|| Arc::new(InMemoryUsageLog::new())),
            config,
        })
    }
}

/// Entry point for submitting tasks.
pub struct TaskPipeline {
    config: SignalforgeConfig,
    ledger: Arc<BudgetLedger>,
    cache: ResultCache,
    dispatcher: Arc<RequestDispatcher>,
    batcher: Option<BatchCoordinator>,
    interpreter: ResponseInterpreter,
    estimator: TokenEstimator,
    recorder: Arc<dyn UsageRecorder>,
}

impl TaskPipeline {
    pub fn builder() -> TaskPipelineBuilder {
        TaskPipelineBuilder::default()
    }

    pub fn config(&self) -> &SignalforgeConfig {
        &self.config
    }

    pub fn ledger(&self) -> &BudgetLedger {
        &self.ledger
    }

    /// Daily budget status.
    pub fn budget_status(&self) -> BudgetStatus {
        self.ledger.status()
    }

    pub fn lifetime_status(&self) -> BudgetStatus {
        self.ledger.lifetime_status()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Reservation estimate for `task`: explicit estimate, or rendered prompt
    /// plus the per-type reply allowance.
    pub fn estimate(&self, task: &Task) -> u64 {
        task.estimated_tokens.unwrap_or_else(|| {
            let request = CompletionRequest::new(prompt::task_prompt(task))
                .with_system(prompt::system_prompt(task.task_type));
            self.estimator.estimate(
                &request,
                self.config.dispatch.response_tokens.for_type(task.task_type),
            )
        })
    }

    /// Run one task to completion.
    pub async fn submit(&self, task: Task) -> Result<RequestOutcome> {
        let task = match (task.deadline, self.config.dispatch.default_deadline()) {
            (None, Some(timeout)) => task.with_timeout(timeout),
            _ => task,
        };
        let started = Instant::now();
        let mut lifecycle = Lifecycle::new(task.id);

        let estimate = self.estimate(&task);
        let reserved = if task.is_expired() {
            Err(SignalError::UpstreamTimeout(format!(
                "task {} deadline elapsed before submission",
                task.id
            )))
        } else {
            self.ledger.reserve(task.id, estimate)
        };
        let reservation = match reserved {
            Ok(reservation) => ReservationGuard::new(self.ledger.clone(), reservation),
            Err(e) => {
                lifecycle.advance(TaskState::Failed)?;
                warn!(task_id = %task.id, task_type = %task.task_type, error = %e, "Task refused");
                self.record(&task, 0, None, started, OutcomeStatus::Error(e.kind()))
                    .await;
                return Err(e);
            }
        };
        lifecycle.advance(TaskState::Reserved)?;

        let fingerprint = Fingerprint::of(task.task_type, &task.payload);
        let lookup = self
            .lookup(&task, &fingerprint, estimate, &mut lifecycle)
            .await;

        match lookup {
            Ok(Lookup { outcome, source }) => {
                let outcome = match source {
                    CacheSource::Produced => {
                        reservation.commit(outcome.tokens_used)?;
                        let terminal = if outcome.is_fallback() {
                            TaskState::FallbackDone
                        } else {
                            TaskState::Done
                        };
                        lifecycle.advance(terminal)?;
                        outcome
                    }
                    CacheSource::Hit | CacheSource::Coalesced => {
                        lifecycle.advance(TaskState::CacheHit)?;
                        reservation.commit(0)?;
                        lifecycle.advance(TaskState::Done)?;
                        RequestOutcome {
                            tokens_used: 0,
                            retries_used: 0,
                            latency: started.elapsed(),
                            ..outcome.reassigned(task.id, true)
                        }
                    }
                };

                info!(
                    task_id = %task.id,
                    task_type = %task.task_type,
                    fingerprint = %fingerprint.short(),
                    status = %outcome.status,
                    tokens = outcome.tokens_used,
                    from_cache = outcome.from_cache,
                    "Task completed"
                );
                self.record(
                    &task,
                    outcome.tokens_used,
                    lifecycle.usage,
                    started,
                    outcome.status,
                )
                .await;
                Ok(outcome)
            }
            Err(e) => {
                reservation.rollback()?;
                lifecycle.advance(TaskState::Failed)?;
                error!(
                    task_id = %task.id,
                    task_type = %task.task_type,
                    fingerprint = %fingerprint.short(),
                    error = %e,
                    "Task failed"
                );
                self.record(&task, 0, None, started, OutcomeStatus::Error(e.kind()))
                    .await;
                Err(e)
            }
        }
    }

    /// Run many tasks concurrently, results in input order.
    pub async fn submit_all(&self, tasks: Vec<Task>) -> Vec<Result<RequestOutcome>> {
        join_all(tasks.into_iter().map(|task| self.submit(task))).await
    }

    async fn lookup(
        &self,
        task: &Task,
        fingerprint: &Fingerprint,
        estimate: u64,
        lifecycle: &mut Lifecycle,
    ) -> Result<Lookup> {
        let producer = self.produce(task, estimate, lifecycle);
        let lookup = async {
            if self.config.cache.enabled {
                let ttl = self.config.cache.ttl_for(task.task_type);
                self.cache.get_or_create(fingerprint, ttl, producer).await
            } else {
                producer.await.map(|outcome| Lookup {
                    outcome,
                    source: CacheSource::Produced,
                })
            }
        };

        match task.deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, lookup)
                .await
                .unwrap_or_else(|_| {
                    Err(SignalError::UpstreamTimeout(format!(
                        "task {} deadline elapsed",
                        task.id
                    )))
                }),
            None => lookup.await,
        }
    }

    async fn produce(
        &self,
        task: &Task,
        estimate: u64,
        lifecycle: &mut Lifecycle,
    ) -> Result<RequestOutcome> {
        lifecycle.advance(TaskState::Dispatched)?;

        let (raw, interpretation) = match &self.batcher {
            Some(batcher) if task.task_type.supports_batching() => {
                let reply = batcher.submit(task.clone()).await?;
                (reply.raw, reply.interpretation)
            }
            _ => {
                let raw = self.dispatcher.send(task, task.deadline).await?;
                let interpretation =
                    self.interpreter
                        .interpret(task.task_type, &task.payload, &raw.body);
                (raw, interpretation)
            }
        };
        lifecycle.advance(TaskState::Interpreting)?;

        let usage = raw.usage.unwrap_or_else(|| {
            let allowance = self.config.dispatch.response_tokens.for_type(task.task_type);
            TokenUsage::new(estimate.saturating_sub(allowance), allowance.min(estimate))
        });
        lifecycle.usage = Some(usage);

        Ok(outcome_from(task, raw, interpretation, usage.total()))
    }

    async fn record(
        &self,
        task: &Task,
        tokens_used: u64,
        usage: Option<TokenUsage>,
        started: Instant,
        status: OutcomeStatus,
    ) {
        let cost = usage.map_or(0.0, |usage| {
            self.config
                .pricing
                .cost(usage.input_tokens, usage.output_tokens)
        });
        let record = UsageRecord {
            task_id: task.id,
            task_type: task.task_type,
            tokens_used,
            cost,
            latency_ms: started.elapsed().as_millis() as u64,
            status,
            recorded_at: Utc::now(),
        };
        if let Err(e) = self.recorder.record_usage(record).await {
            warn!(task_id = %task.id, error = %e, "Failed to record usage");
        }
    }
}

impl std::fmt::Debug for TaskPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskPipeline")
            .field("ledger", &self.ledger)
            .field("cache", &self.cache)
            .field("dispatcher", &self.dispatcher)
            .field("batcher", &self.batcher)
            .finish()
    }
}

fn outcome_from(
    task: &Task,
    raw: RawResponse,
    interpretation: Interpretation,
    tokens_used: u64,
) -> RequestOutcome {
    RequestOutcome {
        task_id: task.id,
        task_type: task.task_type,
        status: interpretation.status,
        result: interpretation.result,
        raw_response: raw.body,
        diagnostics: interpretation.diagnostics,
        retries_used: raw.retries_used,
        latency: raw.latency,
        tokens_used,
        from_cache: false,
    }
}

/// Per-task state machine with transition logging.
struct Lifecycle {
    task_id: Uuid,
    state: TaskState,
    /// Provider usage once this task produced its own outcome
    usage: Option<TokenUsage>,
}

impl Lifecycle {
    fn new(task_id: Uuid) -> Self {
        Self {
            task_id,
            state: TaskState::Pending,
            usage: None,
        }
    }

    fn advance(&mut self, to: TaskState) -> Result<()> {
        let from = self.state;
        self.state = from.transition(to)?;
        debug!(task_id = %self.task_id, from = ?from, to = ?to, "Task state transition");
        Ok(())
    }
}

/// Held reservation that rolls back when dropped unsettled, so a cancelled
/// submit never leaks budget.
struct ReservationGuard {
    ledger: Arc<BudgetLedger>,
    reservation: Option<Reservation>,
}

impl ReservationGuard {
    fn new(ledger: Arc<BudgetLedger>, reservation: Reservation) -> Self {
        Self {
            ledger,
            reservation: Some(reservation),
        }
    }

    fn commit(mut self, actual_tokens: u64) -> Result<Reservation> {
        match self.reservation.take() {
            Some(reservation) => self.ledger.commit(&reservation, actual_tokens),
            None => Err(SignalError::InternalFault("reservation already settled".to_string())),
        }
    }

    fn rollback(mut self) -> Result<Reservation> {
        match self.reservation.take() {
            Some(reservation) => self.ledger.rollback(&reservation),
            None => Err(SignalError::InternalFault("reservation already settled".to_string())),
        }
    }
}

impl Drop for ReservationGuard {
    fn drop(&mut self) {
        if let Some(reservation) = self.reservation.take() {
            debug!(task_id = %reservation.task_id, "Submit cancelled, releasing reservation");
            if let Err(e) = self.ledger.rollback(&reservation) {
                warn!(task_id = %reservation.task_id, error = %e, "Failed to release reservation");
            }
        }
    }
}
