//! # arbor
//!
//! MCTS + RLM tree-search orchestration: a language model proposes sandboxed
//! code strategies, a persistent REPL executes them over injected context,
//! rewards back-propagate through a UCB1 tree, and the evolving tree streams
//! to clients in real time. The same backbone also reverse-engineers scoring
//! rubrics from labeled examples.
//!
//! ## Core Components
//!
//! - **Sandbox**: persistent, budgeted execution of policy-generated code
//! - **Tree / Engine**: the four-phase MCTS loop with snapshot streaming
//! - **Policy / Reward / Synthesizer**: pluggable LLM-facing seams
//! - **Session**: per-request orchestration, comparison mode, cancellation
//! - **Server**: REST + WebSocket boundary
//!
//! ## Example
//!
//! ```rust,ignore
//! use arbor::engine::{MctsConfig, MctsEngine};
//! use arbor::sandbox::{Sandbox, SandboxConfig};
//!
//! let sandbox = Sandbox::new(&transcript, Some(bridge), SandboxConfig::default())?;
//! let mut engine = MctsEngine::new(sandbox, policy, reward, synthesizer, MctsConfig::default());
//! let (answer, confidence) = engine.search("What is this video about?").await?;
//! ```

pub mod chunk;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod llm;
pub mod plain;
pub mod policy;
pub mod reward;
pub mod rubric;
pub mod sandbox;
pub mod server;
pub mod session;
pub mod text;
pub mod transcript;
pub mod tree;

// Re-exports for convenience
pub use config::Config;
pub use engine::{EngineEvent, MctsConfig, MctsEngine};
pub use error::{Error, Result};
pub use events::{ClientCommand, ServerEvent};
pub use llm::{ChatMessage, ChatRole, ClientConfig, CompletionRequest, LLMClient, OpenAIClient};
pub use plain::{PlainOutcome, PlainPipeline, PlainStep};
pub use policy::{CandidateSeed, LlmPolicy, LlmSynthesizer, Policy, Synthesizer};
pub use reward::{LlmJudge, RewardEvaluator};
pub use rubric::{Dataset, RubricConfig, RubricSandbox, RubricSearch};
pub use sandbox::{ExecuteOutcome, Sandbox, SandboxConfig, SubLlm, SubLlmBridge};
pub use session::SessionDeps;
pub use transcript::{TranscriptSegment, TranscriptStore, Transcriber, VideoInfo};
pub use tree::{NodeKind, NodeSnapshot, ReasoningNode, ReasoningTree, TreeSnapshot};
