//! Typed frames for the streaming endpoint.
//!
//! Client-to-server commands are tagged by `type`, server-to-client events
//! by `event`. Node/tree payloads are serialized to JSON values at this
//! boundary because the two engine variants carry different snapshot
//! shapes; inside the crate they stay fully typed.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::plain::{PlainOutcome, PlainStep};
use crate::text::round_to;

fn default_iterations() -> u32 {
    12
}

fn default_rubric_iterations() -> u32 {
    15
}

fn default_rubric_depth() -> u32 {
    4
}

/// Commands a client may send over the stream.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientCommand {
    Ask {
        #[serde(default)]
        question: String,
        #[serde(default)]
        video_ids: Vec<String>,
        #[serde(default = "default_iterations")]
        max_iterations: u32,
    },
    Compare {
        #[serde(default)]
        question: String,
        #[serde(default)]
        video_ids: Vec<String>,
        #[serde(default = "default_iterations")]
        max_iterations: u32,
    },
    Discover {
        #[serde(default = "default_rubric_iterations")]
        max_iterations: u32,
        #[serde(default = "default_rubric_depth")]
        max_depth: u32,
    },
    Ping,
}

/// MCTS-side payload of a `comparison_complete` event.
#[derive(Debug, Clone, Serialize)]
pub struct MctsComparison {
    pub answer: String,
    pub confidence: f64,
    pub metrics: MctsRunMetrics,
    pub tree: Value,
}

/// Rough run metrics for the comparison view. The LLM-call count is the
/// `2 * iterations + 1` estimate, not a measured figure.
#[derive(Debug, Clone, Serialize)]
pub struct MctsRunMetrics {
    pub total_time_ms: u64,
    pub llm_calls: u32,
    pub code_executions: usize,
    pub successful_code_blocks: usize,
    pub unique_strategies: usize,
    pub max_depth_reached: u32,
    pub avg_node_value: f64,
    pub answer_length: usize,
    pub confidence: f64,
}

/// Events the server pushes to clients.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerEvent {
    SearchStarted {
        question: String,
        context_chars: usize,
    },
    NodeUpdate {
        node: Value,
        tree_snapshot: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        iteration: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        total_iterations: Option<u32>,
    },
    AnswerReady {
        answer: String,
        confidence: f64,
    },
    SearchComplete {
        answer: String,
        confidence: f64,
        tree: Value,
    },
    PlainStep {
        step: PlainStep,
    },
    ComparisonComplete {
        plain: PlainOutcome,
        mcts: MctsComparison,
    },
    DiscoveryStarted {
        num_training: usize,
        num_eval: usize,
    },
    DiscoveryComplete {
        best_rubric_code: String,
        best_score: f64,
        eval_results: Value,
        tree_snapshot: Value,
    },
    Error {
        message: String,
    },
    Pong,
}

impl ServerEvent {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn answer_ready(answer: impl Into<String>, confidence: f64) -> Self {
        Self::AnswerReady {
            answer: answer.into(),
            confidence: round_to(confidence, 4),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_client_command_parsing_defaults() {
        let cmd: ClientCommand =
            serde_json::from_str(r#"{"type": "ask", "question": "q"}"#).unwrap();
        match cmd {
            ClientCommand::Ask {
                question,
                video_ids,
                max_iterations,
            } => {
                assert_eq!(question, "q");
                assert!(video_ids.is_empty());
                assert_eq!(max_iterations, 12);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_discover_defaults() {
        let cmd: ClientCommand = serde_json::from_str(r#"{"type": "discover"}"#).unwrap();
        match cmd {
            ClientCommand::Discover {
                max_iterations,
                max_depth,
            } => {
                assert_eq!(max_iterations, 15);
                assert_eq!(max_depth, 4);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_server_event_tagging() {
        let event = ServerEvent::SearchStarted {
            question: "q".to_string(),
            context_chars: 42,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "search_started");
        assert_eq!(json["context_chars"], 42);

        let pong = serde_json::to_value(ServerEvent::Pong).unwrap();
        assert_eq!(pong["event"], "pong");
    }

    #[test]
    fn test_node_update_omits_unset_iteration_fields() {
        let event = ServerEvent::NodeUpdate {
            node: serde_json::json!({}),
            tree_snapshot: serde_json::json!({}),
            iteration: None,
            total_iterations: None,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(!json.contains("iteration"));
    }
}
