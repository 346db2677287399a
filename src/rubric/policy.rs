//! Rubric policy: the LLM generates rubric hypotheses and refinements.

use async_trait::async_trait;
use std::sync::Arc;

use super::dataset::Example;
use super::signals::{RewardBreakdown, ScoredPrediction};
use crate::error::Result;
use crate::llm::{ChatMessage, CompletionRequest, LLMClient};
use crate::policy::extract_code_blocks;
use crate::text::truncate_chars;

/// Produces rubric-code candidates.
#[async_trait]
pub trait RubricPolicy: Send + Sync {
    /// Generate 2-3 initial rubric hypotheses from sample data.
    async fn expand_root(&self, sample: &[Example]) -> Result<Vec<String>>;

    /// Generate 1-2 refined hypotheses based on the parent's performance.
    async fn expand_refinement(
        &self,
        parent_code: &str,
        sample_results: &[ScoredPrediction],
        rewards: &RewardBreakdown,
        sample: &[Example],
    ) -> Result<Vec<String>>;
}

const SYSTEM_PROMPT: &str = r#"You are an expert at reverse-engineering scoring rubrics from labeled data.

Your task: Given (input, response, score) examples, discover the hidden scoring function that maps responses to scores in [0.0, 1.0].

Responses are scored on features like:
- Presence of structured plans (numbered/bulleted steps)
- Assumptions section
- Domain-specific module/transaction-code/app mentions
- Tool call JSON blocks
- Safety considerations
- Response quality and completeness

You must write a script function `rubric_fn(response)` that takes a response string and returns a score between 0.0 and 1.0.

IMPORTANT RULES:
1. Your function MUST be named `rubric_fn` and take a single string argument `response`
2. It MUST return a float in [0.0, 1.0] and NEVER exceed 1.0
3. You may `import "re" as re;` for pattern matching (also available: json, math, string, collections, functools, itertools)
4. After defining rubric_fn, call `test_rubric(Fn("rubric_fn"))` to see results
5. The constant `sample_examples` holds 20 labeled examples you can inspect
6. Each example is a map with keys: input, response, score, spec

SCORING PATTERN: use weighted normalized sums:
```
fn rubric_fn(response) {
    let score = 0.0;
    let total_weight = 0.0;

    // ALWAYS add to total_weight, only add to score when the feature is present
    total_weight += 1.0;
    if response.contains("Plan:") {
        score += 1.0;
    }

    total_weight += 0.8;
    if response.contains("Assumptions:") {
        score += 0.8;
    }

    // ... more features ...

    score / if total_weight > 0.0 { total_weight } else { 1.0 }
}
```
CRITICAL: `total_weight +=` must be OUTSIDE the if-block (unconditional).
`score +=` must be INSIDE the if-block (conditional).
This keeps the output in [0, 1]. Do NOT use additive bonuses or multiplicative modifiers that can push the score above 1.0.

Focus on patterns that distinguish high-scoring from low-scoring responses."#;

/// Parse hypothesis code blocks out of a policy reply.
///
/// Replies separate hypotheses with `---HYPOTHESIS---`; each section should
/// contain one fenced code block. A bare reply that still defines
/// `rubric_fn` is accepted whole.
pub fn parse_hypotheses(text: &str) -> Vec<String> {
    let mut hypotheses = Vec::new();
    for section in text.split("---HYPOTHESIS---") {
        for block in extract_code_blocks(section) {
            if block.contains("rubric_fn") {
                hypotheses.push(block);
            }
        }
    }

    if hypotheses.is_empty() && text.contains("fn rubric_fn") {
        hypotheses.push(text.trim().to_string());
    }

    hypotheses.truncate(3);
    hypotheses
}

/// LLM-backed rubric policy.
pub struct LlmRubricPolicy {
    client: Arc<dyn LLMClient>,
    model: String,
}

impl LlmRubricPolicy {
    pub fn new(client: Arc<dyn LLMClient>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }
}

fn format_examples(examples: &[&Example]) -> String {
    let mut out = String::new();
    for (i, example) in examples.iter().enumerate() {
        let preview = truncate_chars(&example.response, 500).replace('\n', "\\n");
        out.push_str(&format!(
            "\nExample {} (score={:.4}):\n  Response: {}\n",
            i + 1,
            example.score,
            preview
        ));
    }
    out
}

#[async_trait]
impl RubricPolicy for LlmRubricPolicy {
    async fn expand_root(&self, sample: &[Example]) -> Result<Vec<String>> {
        // Show a clear low/high contrast: 3 low + 2 mid + 3 high.
        let mut sorted: Vec<&Example> = sample.iter().collect();
        sorted.sort_by(|a, b| {
            a.score
                .partial_cmp(&b.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let low: Vec<&Example> = sorted.iter().filter(|e| e.score < 0.35).take(3).copied().collect();
        let high: Vec<&Example> = sorted.iter().filter(|e| e.score > 0.7).take(3).copied().collect();
        let mid: Vec<&Example> = sorted
            .iter()
            .filter(|e| e.score >= 0.35 && e.score <= 0.7)
            .take(2)
            .copied()
            .collect();
        let mut selected = low.clone();
        selected.extend(mid);
        selected.extend(high.clone());

        let prompt = format!(
            "Analyze these labeled examples carefully. Notice the CONTRAST between \
             LOW-scoring and HIGH-scoring responses.\n\n\
             LOW-SCORING EXAMPLES (first {}) vs HIGH-SCORING EXAMPLES (last {}):\n{}\n\
             KEY PATTERNS TO LOOK FOR:\n\
             - Do high-scoring responses have \"Assumptions:\" sections? Do low-scoring ones lack it?\n\
             - Do high-scoring responses contain JSON tool calls like {{\"tool\": \"...\", \"args\": {{...}}}}?\n\
             - Do high-scoring responses mention module names, transaction codes, app names?\n\
             - Do high-scoring responses have numbered/bulleted step plans?\n\
             - Are high-scoring responses longer?\n\
             - Any safety or quality markers?\n\n\
             Generate exactly 3 SEPARATE code blocks, each with a different scoring strategy:\n\
             - Hypothesis 1: Weighted checklist (plan, assumptions, tool call, length, step count)\n\
             - Hypothesis 2: Domain features (module mentions, transaction-code patterns, tool call JSON detection)\n\
             - Hypothesis 3: Combined weighted approach using all discovered features\n\n\
             Each hypothesis must:\n\
             1. Define `rubric_fn(response)` returning a score in [0, 1]\n\
             2. Call `test_rubric(Fn(\"rubric_fn\"))` to evaluate\n\
             3. Use `import \"re\" as re;` for pattern matching if needed\n\n\
             Format each as:\n\
             ```repl\n\
             // Hypothesis N: [description]\n\
             fn rubric_fn(response) {{\n    ...\n}}\n\n\
             test_rubric(Fn(\"rubric_fn\"));\n\
             ```\n\n\
             Separate each hypothesis with \"---HYPOTHESIS---\"",
            low.len(),
            high.len(),
            format_examples(&selected),
        );

        let request = CompletionRequest::new()
            .with_model(&self.model)
            .with_system(SYSTEM_PROMPT)
            .with_message(ChatMessage::user(prompt))
            .with_max_tokens(4000)
            .with_temperature(0.8);

        let response = self.client.complete(request).await?;
        Ok(parse_hypotheses(&response.content))
    }

    async fn expand_refinement(
        &self,
        parent_code: &str,
        sample_results: &[ScoredPrediction],
        rewards: &RewardBreakdown,
        sample: &[Example],
    ) -> Result<Vec<String>> {
        // Pair sample-aligned results with response previews and surface the
        // worst predictions first.
        let mut paired: Vec<(f64, &ScoredPrediction, Option<&Example>)> = sample_results
            .iter()
            .enumerate()
            .map(|(i, r)| ((r.predicted - r.actual).abs(), r, sample.get(i)))
            .collect();
        paired.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        let mut error_analysis = String::from("\nWORST PREDICTIONS (biggest errors):\n");
        for (i, (error, result, example)) in paired.iter().take(5).enumerate() {
            error_analysis.push_str(&format!(
                "\n  Error {}: predicted={:.3}, actual={:.3}, diff={:.3}\n",
                i + 1,
                result.predicted,
                result.actual,
                error
            ));
            if let Some(example) = example {
                let preview = truncate_chars(&example.response, 400).replace('\n', "\\n");
                error_analysis.push_str(&format!("    Response: {}\n", preview));
            }
        }

        let signals = [
            ("generalization", rewards.generalization),
            ("calibration", rewards.calibration),
            ("discrimination", rewards.discrimination),
            ("validity", rewards.validity),
            ("iteration", rewards.iteration),
        ];
        let (weakest, weakest_value) = signals
            .iter()
            .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
            .copied()
            .unwrap_or(("generalization", 0.0));
        let rewards_text: String = signals
            .iter()
            .map(|(name, value)| format!("  {}: {:.3}\n", name, value))
            .collect();

        let prompt = format!(
            "Improve this rubric function based on its errors.\n\n\
             CURRENT RUBRIC:\n```repl\n{parent_code}\n```\n\n\
             REWARD SIGNALS:\n{rewards_text}  composite: {:.3}\n\n\
             WEAKEST SIGNAL: {weakest} = {weakest_value:.3}\n\
             {error_analysis}\n\
             Generate 1-2 IMPROVED rubric functions that fix the worst errors while \
             keeping what already works. Focus especially on improving the weakest \
             signal. Each must define `rubric_fn(response)`, keep every score in \
             [0, 1] via the weighted normalized sum pattern, and call \
             `test_rubric(Fn(\"rubric_fn\"))`.\n\n\
             Separate hypotheses with \"---HYPOTHESIS---\"",
            rewards.composite,
        );

        let request = CompletionRequest::new()
            .with_model(&self.model)
            .with_system(SYSTEM_PROMPT)
            .with_message(ChatMessage::user(prompt))
            .with_max_tokens(4000)
            .with_temperature(0.5);

        let response = self.client.complete(request).await?;
        let mut hypotheses = parse_hypotheses(&response.content);
        hypotheses.truncate(2);
        Ok(hypotheses)
    }
}
