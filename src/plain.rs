//! Plain single-pass pipeline, the comparison baseline for the MCTS engine.
//!
//! One policy call produces one code fragment; one sandbox execution; if it
//! failed or produced no output, one follow-up call with the failure context
//! produces one more fragment; one synthesis call produces the answer and one
//! judge call produces a confidence. At most four LLM calls in total.

use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::llm::{ChatMessage, CompletionRequest, LLMClient};
use crate::policy::{extract_code_blocks, SYSTEM_PROMPT};
use crate::reward::RewardEvaluator;
use crate::sandbox::{ExecuteOutcome, Sandbox};
use crate::text::{round_to, truncate_chars};
use crate::tree::{NodeKind, ReasoningNode};

/// A single step in the plain pipeline, bounded for the wire.
#[derive(Debug, Clone, Serialize)]
pub struct PlainStep {
    pub step_number: u32,
    pub code: String,
    pub stdout: String,
    pub stderr: String,
    pub execution_ms: f64,
    pub success: bool,
}

impl PlainStep {
    fn new(step_number: u32, code: &str, outcome: &ExecuteOutcome) -> Self {
        Self {
            step_number,
            code: truncate_chars(code, 500),
            stdout: truncate_chars(&outcome.stdout, 1000),
            stderr: truncate_chars(&outcome.stderr, 500),
            execution_ms: outcome.elapsed_ms,
            success: outcome.success,
        }
    }
}

/// Run metrics for the comparison view.
#[derive(Debug, Clone, Serialize)]
pub struct PlainMetrics {
    pub total_time_ms: u64,
    pub llm_calls: u32,
    pub code_executions: u32,
    pub successful_code_blocks: u32,
    pub answer_length: usize,
    pub confidence: f64,
}

/// Result of a plain single-pass search.
#[derive(Debug, Clone, Serialize)]
pub struct PlainOutcome {
    pub answer: String,
    pub confidence: f64,
    pub metrics: PlainMetrics,
    pub steps: Vec<PlainStep>,
}

/// The single-pass pipeline itself.
pub struct PlainPipeline {
    client: Arc<dyn LLMClient>,
    model: String,
    judge: Arc<dyn RewardEvaluator>,
}

impl PlainPipeline {
    pub fn new(
        client: Arc<dyn LLMClient>,
        model: impl Into<String>,
        judge: Arc<dyn RewardEvaluator>,
    ) -> Self {
        Self {
            client,
            model: model.into(),
            judge,
        }
    }

    /// Run the pipeline. Each execution publishes one step event.
    pub async fn run(
        &self,
        question: &str,
        sandbox: &mut Sandbox,
        events: Option<&mpsc::Sender<PlainStep>>,
    ) -> Result<PlainOutcome> {
        let started = Instant::now();
        let context_chars = sandbox.context_length();
        let mut llm_calls = 0u32;
        let mut steps: Vec<PlainStep> = Vec::new();

        // Step 1: generate ONE code strategy.
        let request = CompletionRequest::new()
            .with_model(&self.model)
            .with_system(SYSTEM_PROMPT)
            .with_message(ChatMessage::user(format!(
                "Question: {question}\n\n\
                 The context is {context_chars} characters long and may contain MULTIPLE \
                 video transcripts separated by '=== Title ===' headers.\n\n\
                 Write a SINGLE ```repl code block to answer this question. \
                 Use fast script operations (regex, string slicing, etc.) to extract relevant \
                 information from the `context` variable, then print your findings. \
                 Use FINAL_VAR(\"variable_name\") when you have a definitive answer.\n\
                 Keep the code block fast (< 10 seconds). Use print() to show results."
            )))
            .with_max_tokens(2000)
            .with_temperature(0.5);

        let response = self.client.complete(request).await?;
        llm_calls += 1;
        let text = response.content.trim().to_string();
        let blocks = extract_code_blocks(&text);

        let Some(mut code) = blocks.into_iter().next() else {
            // No code generated: return the raw reply as the answer.
            let elapsed = started.elapsed().as_millis() as u64;
            return Ok(PlainOutcome {
                confidence: 0.3,
                metrics: PlainMetrics {
                    total_time_ms: elapsed,
                    llm_calls,
                    code_executions: 0,
                    successful_code_blocks: 0,
                    answer_length: text.len(),
                    confidence: 0.3,
                },
                answer: text,
                steps: Vec::new(),
            });
        };

        // Step 2: execute the first code block.
        let mut result = sandbox.execute(&code).await;
        let step = PlainStep::new(1, &code, &result);
        steps.push(step.clone());
        Self::emit(events, step).await?;

        // Step 3: one follow-up if the code failed or printed nothing.
        if !result.success || result.stdout.trim().is_empty() {
            let diagnosis = if !result.success {
                "had errors. "
            } else {
                "produced no output. "
            };
            let mut output_msg = format!(
                "Previous code output:\n{}\n",
                truncate_chars(&result.stdout, 2000)
            );
            if !result.stderr.is_empty() {
                output_msg.push_str(&format!(
                    "Errors:\n{}\n",
                    truncate_chars(&result.stderr, 500)
                ));
            }
            output_msg.push_str(&format!(
                "\nThe previous attempt {diagnosis}Write a FIXED ```repl code block. \
                 Use FINAL_VAR(\"variable_name\") when ready."
            ));

            let followup = CompletionRequest::new()
                .with_model(&self.model)
                .with_system(SYSTEM_PROMPT)
                .with_messages(vec![
                    ChatMessage::user(format!(
                        "Question: {question}\n\
                         Context length: {context_chars} characters.\n\
                         Use the `context` variable to answer."
                    )),
                    ChatMessage::assistant(format!("```repl\n{code}\n```")),
                    ChatMessage::user(output_msg),
                ])
                .with_max_tokens(2000)
                .with_temperature(0.3);

            let followup_response = self.client.complete(followup).await?;
            llm_calls += 1;

            if let Some(fixed) =
                extract_code_blocks(followup_response.content.trim()).into_iter().next()
            {
                let followup_result = sandbox.execute(&fixed).await;
                let step = PlainStep::new(2, &fixed, &followup_result);
                steps.push(step.clone());
                Self::emit(events, step).await?;
                result = followup_result;
                code = fixed;
            }
        }

        // Step 4: synthesize an answer from the output.
        let best_output = if result.stdout.trim().is_empty() {
            "(no output)".to_string()
        } else {
            truncate_chars(&result.stdout, 3000)
        };

        let synthesis = CompletionRequest::new()
            .with_model(&self.model)
            .with_system(
                "You synthesize answers from REPL analysis results of video transcripts. \
                 Be concise but thorough. Include evidence from the output.",
            )
            .with_message(ChatMessage::user(format!(
                "Question: {question}\n\n\
                 Code executed:\n```\n{}\n```\n\n\
                 Output:\n{best_output}\n\n\
                 Synthesize a clear answer based on this output:",
                truncate_chars(&code, 1000)
            )))
            .with_max_tokens(2000)
            .with_temperature(0.3);

        let answer = self
            .client
            .complete(synthesis)
            .await?
            .content
            .trim()
            .to_string();
        llm_calls += 1;

        // Step 5: score with the same judge the tree search uses, for a fair
        // comparison.
        let mut score_node = ReasoningNode::new("plain_result", NodeKind::Answer, answer.clone());
        score_node.parent_id = None;
        let confidence = self.judge.evaluate(&score_node, question).await?;
        llm_calls += 1;

        let successful = steps.iter().filter(|s| s.success).count() as u32;
        Ok(PlainOutcome {
            answer: answer.clone(),
            confidence,
            metrics: PlainMetrics {
                total_time_ms: started.elapsed().as_millis() as u64,
                llm_calls,
                code_executions: steps.len() as u32,
                successful_code_blocks: successful,
                answer_length: answer.len(),
                confidence: round_to(confidence, 4),
            },
            steps,
        })
    }

    async fn emit(events: Option<&mpsc::Sender<PlainStep>>, step: PlainStep) -> Result<()> {
        if let Some(tx) = events {
            tx.send(step).await.map_err(|_| Error::Cancelled)?;
        }
        Ok(())
    }
}
