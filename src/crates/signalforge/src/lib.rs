//! # Signalforge - AI Task Orchestration
//!
//! Turns content generation, sentiment analysis, hashtag and posting-schedule
//! tasks into structured results from a remote AI provider, while holding a
//! hard token budget and coping with providers that return malformed text.
//!
//! ## Features
//!
//! - **Budget Ledger** - Reserve/commit/rollback accounting over daily and lifetime scopes
//! - **Result Cache** - Fingerprinted outcomes with per-type TTLs and single-flight coalescing
//! - **Resilient Dispatch** - Per-attempt timeouts, exponential backoff with jitter, deadlines
//! - **Tiered Interpretation** - Strict JSON, salvaged JSON, pattern extraction, documented defaults
//! - **Batching** - Same-type tasks folded into one provider call within a short window
//! - **Usage Log** - In-memory or JSON lines records with cost estimates
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use signalforge::{Task, TaskPayload, TaskPipeline, TaskType};
//! use signalforge::config::SignalforgeConfig;
//! use llm::testing::ScriptedProvider;
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let pipeline = TaskPipeline::builder()
//!     .config(SignalforgeConfig::default())
//!     .provider(Arc::new(ScriptedProvider::always(
//!         r#"{"sentiment": "positive", "confidence": 0.92}"#,
//!     )))
//!     .build()?;
//!
//! let task = Task::new(
//!     TaskType::Sentiment,
//!     TaskPayload::new().with_text("Loving the new release!"),
//! );
//! let outcome = pipeline.submit(task).await?;
//! println!("{} {:?}", outcome.status, outcome.result);
//! # Ok(())
//! # }
//! ```

pub mod batch;
pub mod budget;
pub mod cache;
pub mod config;
pub mod dispatcher;
pub mod estimator;
pub mod interpreter;
pub mod outcome;
pub mod pipeline;
pub mod task;
pub mod usage;

mod error;

pub use batch::{BatchCoordinator, BatchReply};
pub use budget::{BudgetLedger, BudgetScope, BudgetState, BudgetStatus, Reservation, ReservationState};
pub use cache::{CacheSource, CacheStats, Fingerprint, ResultCache};
pub use dispatcher::{RawResponse, RequestDispatcher, RetryPolicy};
pub use estimator::TokenEstimator;
pub use interpreter::{Interpretation, ResponseInterpreter, Tier};
pub use outcome::{ErrorKind, OutcomeStatus, RequestOutcome, TaskResult};
pub use pipeline::{TaskPipeline, TaskPipelineBuilder};
pub use task::{Task, TaskPayload, TaskState, TaskType};
pub use usage::{InMemoryUsageLog, JsonlUsageLog, UsageRecord, UsageRecorder, UsageTotals};

pub use error::{Result, SignalError};
