//! Reward evaluation: scores a node in [0, 1].
//!
//! Two interchangeable implementations exist behind [`RewardEvaluator`]: the
//! LLM-as-judge below (transcript variant) and the algorithmic composite in
//! [`crate::rubric::signals`] (rubric variant).

use async_trait::async_trait;
use regex::Regex;
use std::sync::Arc;

use crate::error::Result;
use crate::llm::{ChatMessage, CompletionRequest, LLMClient};
use crate::text::truncate_chars;
use crate::tree::{NodeKind, ReasoningNode};

/// Scores how useful a node is for answering the question.
#[async_trait]
pub trait RewardEvaluator: Send + Sync {
    /// Returns a scalar in [0, 1].
    async fn evaluate(&self, node: &ReasoningNode, question: &str) -> Result<f64>;
}

/// LLM-as-judge evaluator.
pub struct LlmJudge {
    client: Arc<dyn LLMClient>,
    model: String,
}

impl LlmJudge {
    pub fn new(client: Arc<dyn LLMClient>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }

    fn describe(node: &ReasoningNode) -> String {
        match node.kind {
            NodeKind::Answer => format!("Final answer: {}", node.content),
            NodeKind::Code => {
                let mut desc = format!(
                    "Code:\n{}\n\nOutput:\n{}",
                    truncate_chars(&node.code, 500),
                    truncate_chars(&node.stdout, 500)
                );
                if !node.stderr.is_empty() {
                    desc.push_str(&format!(
                        "\nErrors:\n{}",
                        truncate_chars(&node.stderr, 200)
                    ));
                }
                desc
            }
            NodeKind::Strategy => format!("Strategy: {}", node.content),
            _ => node.content.clone(),
        }
    }
}

#[async_trait]
impl RewardEvaluator for LlmJudge {
    async fn evaluate(&self, node: &ReasoningNode, question: &str) -> Result<f64> {
        // The root always gets a neutral score.
        if node.kind == NodeKind::Root {
            return Ok(0.5);
        }

        let desc = Self::describe(node);

        let request = CompletionRequest::new()
            .with_model(&self.model)
            .with_system(
                "You evaluate reasoning steps in a video transcript Q&A system. \
                 Score how useful this step is for answering the question. \
                 Consider: Does the code run successfully? Does it extract relevant info? \
                 Does it move toward a complete answer? \
                 Respond with ONLY a number between 0.0 and 1.0.\n\
                 - 0.0-0.2: Error, irrelevant, or no useful output\n\
                 - 0.3-0.5: Partially useful, some relevant info\n\
                 - 0.6-0.8: Good result, relevant information extracted\n\
                 - 0.9-1.0: Excellent, directly answers the question with evidence",
            )
            .with_message(ChatMessage::user(format!(
                "Question: {question}\n\nReasoning step:\n{desc}\n\nScore (0.0-1.0):"
            )))
            .with_max_tokens(10)
            .with_temperature(0.0);

        let response = self.client.complete(request).await?;
        Ok(parse_score(&response.content))
    }
}

/// Parse the first numeric literal in a judge reply and clamp it to [0, 1].
/// A reply with no number at all scores a neutral 0.5.
pub fn parse_score(text: &str) -> f64 {
    let re = Regex::new(r"(\d+\.?\d*)").expect("static regex");
    match re
        .captures(text.trim())
        .and_then(|c| c[1].parse::<f64>().ok())
    {
        Some(score) => score.clamp(0.0, 1.0),
        None => 0.5,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::llm::CompletionResponse;
    use chrono::Utc;

    struct FixedReplyClient(String);

    #[async_trait]
    impl LLMClient for FixedReplyClient {
        async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse> {
            if self.0 == "__fail__" {
                return Err(Error::llm("upstream down"));
            }
            Ok(CompletionResponse {
                id: "test".to_string(),
                model: "judge".to_string(),
                content: self.0.clone(),
                usage: Default::default(),
                timestamp: Utc::now(),
            })
        }
    }

    #[test]
    fn test_parse_score_first_match() {
        assert_eq!(parse_score("0.8"), 0.8);
        assert_eq!(parse_score("Score: 0.75 because"), 0.75);
        assert_eq!(parse_score("5"), 1.0); // clamped
        assert_eq!(parse_score("no number here"), 0.5);
    }

    #[tokio::test]
    async fn test_root_scores_neutral_without_calling_judge() {
        let judge = LlmJudge::new(Arc::new(FixedReplyClient("__fail__".into())), "m");
        let root = ReasoningNode::new("r", NodeKind::Root, "question");
        assert_eq!(judge.evaluate(&root, "q").await.unwrap(), 0.5);
    }

    #[tokio::test]
    async fn test_judge_parses_and_clamps() {
        let judge = LlmJudge::new(Arc::new(FixedReplyClient("0.9".into())), "m");
        let node = ReasoningNode::new("n", NodeKind::Answer, "42");
        assert_eq!(judge.evaluate(&node, "q").await.unwrap(), 0.9);
    }

    #[tokio::test]
    async fn test_judge_propagates_transport_failure() {
        let judge = LlmJudge::new(Arc::new(FixedReplyClient("__fail__".into())), "m");
        let node = ReasoningNode::new("n", NodeKind::Answer, "42");
        assert!(judge.evaluate(&node, "q").await.is_err());
    }
}
