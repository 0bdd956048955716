//! LLM provider layer for signalforge.
//!
//! This crate defines the [`CompletionProvider`] abstraction the orchestration
//! core dispatches through, plus concrete backends:
//!
//! - **OpenAI-compatible** ([`remote::OpenAiCompatClient`]) - any endpoint
//!   speaking `/chat/completions` (OpenAI, Deepseek, OpenRouter, gateways)
//! - **Scripted** ([`testing::ScriptedProvider`]) - deterministic replies for
//!   tests and offline runs
//!
//! Providers never retry on their own. Retry, backoff and deadlines belong to
//! the caller; errors carry an [`ErrorClass`] so the caller can decide.
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use llm::remote::OpenAiCompatClient;
//! use llm::{CompletionProvider, CompletionRequest, RemoteLlmConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = RemoteLlmConfig::from_env(
//!         "OPENAI_API_KEY",
//!         "https://api.openai.com/v1",
//!         "gpt-4o-mini",
//!     )?;
//!     let client = OpenAiCompatClient::new(config)?;
//!
//!     let request = CompletionRequest::new("Suggest three hashtags for a bakery")
//!         .with_temperature(0.7);
//!
//!     let response = client.complete(request).await?;
//!     println!("Response: {}", response.text);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod provider;
pub mod remote;
pub mod testing;

pub use config::RemoteLlmConfig;
pub use error::{ErrorClass, LlmError, Result};
pub use provider::{CompletionProvider, CompletionRequest, CompletionResponse, TokenUsage};
