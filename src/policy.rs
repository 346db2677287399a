//! Policy: expands tree nodes into candidate code fragments or strategies,
//! and synthesizes the final answer from ranked results.
//!
//! The policy is stateless between calls; the engine supplies the branch
//! history it needs. Implementations are provider-agnostic behind the
//! [`Policy`] and [`Synthesizer`] traits.

use async_trait::async_trait;
use regex::Regex;
use std::collections::HashSet;
use std::sync::Arc;

use crate::error::Result;
use crate::llm::{ChatMessage, CompletionRequest, LLMClient};
use crate::text::truncate_chars;
use crate::tree::{NodeKind, ReasoningNode};

/// A seed for a new child node.
#[derive(Debug, Clone, PartialEq)]
pub enum CandidateSeed {
    /// An executable code fragment; becomes a `code` node.
    Code(String),
    /// A textual plan; becomes a `strategy` node.
    Strategy(String),
}

/// Produces candidate children for a node.
#[async_trait]
pub trait Policy: Send + Sync {
    async fn expand(
        &self,
        node: &ReasoningNode,
        history: &[ChatMessage],
        question: &str,
        context_chars: usize,
    ) -> Result<Vec<CandidateSeed>>;
}

/// A result candidate handed to the synthesizer, ranked by value.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RankedResult {
    pub content: String,
    pub score: f64,
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

/// Collapses the highest-scoring leaves into a final answer.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(
        &self,
        question: &str,
        results: &[RankedResult],
        context_chars: usize,
    ) -> Result<String>;
}

pub(crate) const SYSTEM_PROMPT: &str = r#"You are an expert at answering questions about video transcripts by writing small scripts against a persistent REPL.

## REPL environment
- `context`: string constant holding the FULL transcript (with [MM:SS] timestamps)
- `llm_query(prompt)`: call a sub-LLM (LIMITED to 3 calls per code block! Do NOT loop over chunks)
- `print(...)`: output results (ALWAYS print your findings)
- `FINAL_VAR("variable_name")`: mark a variable as the final answer
- imports: `import "re" as re;` style, allowed modules: re, json, math, string, collections, functools, itertools

Variables persist between code blocks.

## CRITICAL RULES
1. NEVER loop `llm_query()` over chunks: you only get 3 calls per block, and each takes seconds.
2. DO use fast script operations: re::find_all, split, contains, sub_string, collections::counter.
3. For summaries: extract key sentences with script code, then call `llm_query()` ONCE on the extracted text.
4. For specific questions: use `re::find_all()` or `context.index_of()` to locate relevant sections, print them.
5. ALWAYS `print()` your results so the output is captured.
6. Each code block must complete in under 20 seconds.

## Example
```repl
import "re" as re;
import "collections" as collections;
let lines = context.split("\n");
print(`Transcript: ${lines.len()} lines, ${context.len()} chars`);
let words = re::find_all(context.to_lower(), "[a-z]{4,}");
let top = collections::most_common(collections::counter(words), 20);
print(`Top words: ${top}`);
print("Opening:");
for line in lines.extract(0..if lines.len() < 5 { lines.len() } else { 5 }) { print(line); }
```
"#;

/// Extract fenced code blocks from an LLM reply.
///
/// Labelled fences are tried first, then unlabelled; duplicates within one
/// reply are suppressed and trivially short fragments ignored.
pub fn extract_code_blocks(text: &str) -> Vec<String> {
    let patterns = [
        r"(?s)```repl\s*\n(.*?)```",
        r"(?s)```rhai\s*\n(.*?)```",
        r"(?s)```\s*\n(.*?)```",
    ];

    let mut seen = HashSet::new();
    let mut blocks = Vec::new();
    for pattern in patterns {
        let re = Regex::new(pattern).expect("static regex");
        for captures in re.captures_iter(text) {
            let code = captures[1].trim().to_string();
            if code.len() > 5 && seen.insert(code.clone()) {
                blocks.push(code);
            }
        }
    }
    blocks
}

/// LLM-backed policy.
pub struct LlmPolicy {
    client: Arc<dyn LLMClient>,
    model: String,
}

impl LlmPolicy {
    pub fn new(client: Arc<dyn LLMClient>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }

    /// From the root question: generate 2-3 different code strategies.
    async fn expand_root(&self, question: &str, context_chars: usize) -> Result<Vec<CandidateSeed>> {
        let request = CompletionRequest::new()
            .with_model(&self.model)
            .with_system(SYSTEM_PROMPT)
            .with_message(ChatMessage::user(format!(
                "Question: {question}\n\n\
                 The transcript is {context_chars} characters long.\n\n\
                 Generate 2-3 DIFFERENT code strategies to answer this question. \
                 Each strategy should be a separate ```repl block with a different approach.\n\n\
                 IMPORTANT: For the FIRST round, do NOT use llm_query(). Use fast script code only:\n\
                 - Strategy 1: Direct regex/string search for key terms\n\
                 - Strategy 2: Structural analysis (split by timestamps, count sections, extract headings)\n\
                 - Strategy 3: Statistical analysis (word frequency, key phrase extraction)\n\n\
                 Keep each code block fast (< 5 seconds). Use print() to show results.\n\
                 Make sure each code block is self-contained and uses the `context` variable."
            )))
            .with_max_tokens(2000)
            .with_temperature(0.8);

        let response = self.client.complete(request).await?;
        let text = response.content.trim().to_string();
        let blocks = extract_code_blocks(&text);

        let mut seeds: Vec<CandidateSeed> = blocks
            .into_iter()
            .take(3)
            .map(CandidateSeed::Code)
            .collect();

        if seeds.is_empty() {
            seeds.push(CandidateSeed::Strategy(truncate_chars(&text, 300)));
        }
        Ok(seeds)
    }

    /// Continue the REPL conversation: next code based on previous results.
    async fn expand_with_history(
        &self,
        node: &ReasoningNode,
        history: &[ChatMessage],
        question: &str,
        context_chars: usize,
    ) -> Result<Vec<CandidateSeed>> {
        let mut messages = vec![ChatMessage::user(format!(
            "Question: {question}\n\
             Transcript length: {context_chars} characters.\n\
             Use the `context` variable to answer."
        ))];

        // Keep the last 10 turns to stay inside the context window.
        let tail_start = history.len().saturating_sub(10);
        messages.extend_from_slice(&history[tail_start..]);

        let followup = if node.kind == NodeKind::Code && !node.stdout.is_empty() {
            let mut msg = format!(
                "Previous code output:\n{}\n",
                truncate_chars(&node.stdout, 3000)
            );
            if !node.stderr.is_empty() {
                msg.push_str(&format!("Errors:\n{}\n", truncate_chars(&node.stderr, 500)));
            }
            msg.push_str(
                "\nNow write the next code block to continue analyzing or produce a \
                 final answer. Use FINAL_VAR(\"variable_name\") when ready.\n\
                 If the previous code had errors, fix them.",
            );
            msg
        } else if node.kind == NodeKind::Strategy {
            format!(
                "Implement this strategy: {}\n\n\
                 Write a ```repl code block that uses the `context` variable.",
                node.content
            )
        } else {
            "Write the next ```repl code block to continue the analysis.".to_string()
        };
        messages.push(ChatMessage::user(followup));

        let request = CompletionRequest::new()
            .with_model(&self.model)
            .with_system(SYSTEM_PROMPT)
            .with_messages(messages)
            .with_max_tokens(2000)
            .with_temperature(0.5);

        let response = self.client.complete(request).await?;
        let text = response.content.trim().to_string();
        let blocks = extract_code_blocks(&text);

        let mut seeds: Vec<CandidateSeed> = blocks
            .into_iter()
            .take(2)
            .map(CandidateSeed::Code)
            .collect();

        if seeds.is_empty() {
            seeds.push(CandidateSeed::Strategy(truncate_chars(&text, 300)));
        }
        Ok(seeds)
    }
}

#[async_trait]
impl Policy for LlmPolicy {
    async fn expand(
        &self,
        node: &ReasoningNode,
        history: &[ChatMessage],
        question: &str,
        context_chars: usize,
    ) -> Result<Vec<CandidateSeed>> {
        match node.kind {
            NodeKind::Root => self.expand_root(question, context_chars).await,
            NodeKind::Strategy | NodeKind::Code | NodeKind::Result => {
                self.expand_with_history(node, history, question, context_chars)
                    .await
            }
            _ => Ok(Vec::new()),
        }
    }
}

/// LLM-backed synthesizer.
pub struct LlmSynthesizer {
    client: Arc<dyn LLMClient>,
    model: String,
}

impl LlmSynthesizer {
    pub fn new(client: Arc<dyn LLMClient>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }
}

#[async_trait]
impl Synthesizer for LlmSynthesizer {
    async fn synthesize(
        &self,
        question: &str,
        results: &[RankedResult],
        context_chars: usize,
    ) -> Result<String> {
        let mut results_text = String::new();
        for (i, r) in results.iter().enumerate() {
            results_text.push_str(&format!(
                "\n--- Result {} (score={}, type={}) ---\n{}\n",
                i + 1,
                r.score,
                r.kind,
                r.content
            ));
            if let Some(code) = &r.code {
                results_text.push_str(&format!("Code used: {}\n", code));
            }
        }

        let request = CompletionRequest::new()
            .with_model(&self.model)
            .with_system(
                "You synthesize comprehensive answers from multiple REPL analysis results. \
                 The results come from different code strategies that analyzed a video transcript.\n\n\
                 Guidelines:\n\
                 - Combine insights from ALL results, prioritizing higher-scored ones\n\
                 - For summaries: be thorough, cover all major topics proportional to source length\n\
                 - For specific questions: give a precise, evidence-backed answer\n\
                 - Structure with sections/bullets for long answers\n\
                 - Include timestamps or quotes where available",
            )
            .with_message(ChatMessage::user(format!(
                "Question: {question}\n\
                 Source transcript was {context_chars} characters long.\n\n\
                 Analysis results from multiple code strategies:\n{results_text}\n\n\
                 Synthesize a comprehensive answer:"
            )))
            .with_max_tokens(3000)
            .with_temperature(0.3);

        let response = self.client.complete(request).await?;
        Ok(response.content.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_extract_labelled_fences_first() {
        let text = "Here:\n```repl\nlet x = 1;\nprint(x);\n```\nand\n```rhai\nprint(2);\n```";
        let blocks = extract_code_blocks(text);
        assert_eq!(blocks.len(), 2);
        assert!(blocks[0].starts_with("let x = 1;"));
    }

    #[test]
    fn test_extract_unlabelled_fence() {
        let text = "```\nprint(context.len());\n```";
        let blocks = extract_code_blocks(text);
        assert_eq!(blocks, vec!["print(context.len());".to_string()]);
    }

    #[test]
    fn test_extract_suppresses_duplicates_and_trivia() {
        let text = "```repl\nprint(\"hello\");\n```\n```repl\nprint(\"hello\");\n```\n```repl\nx\n```";
        let blocks = extract_code_blocks(text);
        assert_eq!(blocks.len(), 1);
    }

    #[test]
    fn test_extract_no_fences_is_empty() {
        assert!(extract_code_blocks("no code at all").is_empty());
    }
}
