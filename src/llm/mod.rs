//! LLM client abstraction.
//!
//! This module provides a provider-agnostic chat-completion interface plus an
//! OpenAI-compatible implementation. The client is constructed once at startup
//! from the environment and passed down as a dependency.
//!
//! ## Example
//!
//! ```rust,ignore
//! use arbor::llm::{ClientConfig, OpenAIClient, LLMClient, CompletionRequest, ChatMessage};
//!
//! let client = OpenAIClient::new(
//!     ClientConfig::new("your-api-key").with_default_model("gpt-4o"),
//! );
//!
//! let request = CompletionRequest::new()
//!     .with_message(ChatMessage::user("Hello"));
//!
//! let response = client.complete(request).await?;
//! ```

mod client;
mod types;

pub use client::{ClientConfig, LLMClient, OpenAIClient};
pub use types::{ChatMessage, ChatRole, CompletionRequest, CompletionResponse, TokenUsage};
