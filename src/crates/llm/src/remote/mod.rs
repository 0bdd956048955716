//! Remote LLM provider implementations.
//!
//! These providers require API keys and talk HTTP to a hosted endpoint.

pub mod openai;

pub use openai::OpenAiCompatClient;
