//! The MCTS engine: select, expand, evaluate, back-propagate.
//!
//! Each iteration: UCB1 descent finds a promising leaf, the policy proposes
//! code (executed in the sandbox) or strategies, an evaluator scores the new
//! leaf, and the value propagates back to the root. A full tree snapshot is
//! published after every back-propagation so observers always see current
//! statistics. The loop runs the entire iteration budget; there is no early
//! stop.

use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::llm::ChatMessage;
use crate::policy::{CandidateSeed, Policy, RankedResult, Synthesizer};
use crate::reward::RewardEvaluator;
use crate::sandbox::Sandbox;
use crate::text::{round_to, truncate_chars};
use crate::tree::{make_id, NodeKind, NodeSnapshot, ReasoningNode, ReasoningTree, TreeSnapshot};

/// Typed events published by the engine to its orchestrator.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Emitted after each back-propagation (and once for the fresh root).
    NodeUpdate {
        node: NodeSnapshot,
        tree: TreeSnapshot,
    },
    /// Emitted once synthesis has produced the final answer.
    AnswerReady { answer: String, confidence: f64 },
}

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct MctsConfig {
    pub max_iterations: u32,
    pub max_depth: u32,
    pub exploration: f64,
    /// Wall-clock budget per sandbox execution.
    pub execution_timeout: Duration,
}

impl Default for MctsConfig {
    fn default() -> Self {
        Self {
            max_iterations: 12,
            max_depth: 5,
            exploration: std::f64::consts::SQRT_2,
            execution_timeout: Duration::from_secs(30),
        }
    }
}

/// MCTS + sandbox search engine for one request.
///
/// The engine owns its tree and sandbox exclusively; nothing is shared
/// across requests.
pub struct MctsEngine {
    tree: ReasoningTree,
    sandbox: Sandbox,
    policy: Arc<dyn Policy>,
    reward: Arc<dyn RewardEvaluator>,
    synthesizer: Arc<dyn Synthesizer>,
    config: MctsConfig,
    /// Chronological (code, output) turns per branch, used to prompt the policy.
    branch_messages: HashMap<String, Vec<ChatMessage>>,
    events: Option<mpsc::Sender<EngineEvent>>,
}

impl MctsEngine {
    pub fn new(
        sandbox: Sandbox,
        policy: Arc<dyn Policy>,
        reward: Arc<dyn RewardEvaluator>,
        synthesizer: Arc<dyn Synthesizer>,
        config: MctsConfig,
    ) -> Self {
        Self {
            tree: ReasoningTree::new(),
            sandbox,
            policy,
            reward,
            synthesizer,
            config,
            branch_messages: HashMap::new(),
            events: None,
        }
    }

    /// Attach a typed event channel. A failed send means the client is gone
    /// and cancels the search.
    pub fn with_events(mut self, events: mpsc::Sender<EngineEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn tree(&self) -> &ReasoningTree {
        &self.tree
    }

    pub fn tree_snapshot(&self) -> TreeSnapshot {
        self.tree.snapshot()
    }

    /// Run the full search and return `(answer, confidence)`.
    pub async fn search(&mut self, question: &str) -> Result<(String, f64)> {
        let root_id = self
            .tree
            .insert_root(ReasoningNode::new(make_id(), NodeKind::Root, question));
        self.branch_messages.insert(root_id.clone(), Vec::new());

        self.emit_node(&root_id).await?;

        for iteration in 0..self.config.max_iterations {
            // 1. SELECT
            let mut leaf_id = self
                .tree
                .select_leaf(self.config.exploration)
                .ok_or_else(|| Error::Internal("selection on empty tree".to_string()))?;

            // 2. EXPAND
            let (leaf_depth, leaf_has_children) = {
                let leaf = self
                    .tree
                    .get(&leaf_id)
                    .ok_or_else(|| Error::Internal("selected node missing".to_string()))?;
                (leaf.depth, !leaf.children.is_empty())
            };
            if leaf_depth < self.config.max_depth && !leaf_has_children {
                let children = self.expand(&leaf_id, question).await?;
                if let Some(first) = children.first() {
                    // The leaf pointer moves to the first new child; only that
                    // child is evaluated this iteration.
                    leaf_id = first.clone();
                }
            }

            // 3. EVALUATE
            let node = self
                .tree
                .get(&leaf_id)
                .ok_or_else(|| Error::Internal("expanded node missing".to_string()))?;
            let value = self.reward.evaluate(node, question).await?;
            tracing::debug!(iteration, node = %leaf_id, value, "evaluated leaf");

            // 4. BACKPROPAGATE
            self.tree.backpropagate(&leaf_id, value);

            // 5. EMIT, after the value update so observers see current stats.
            self.emit_node(&leaf_id).await?;
        }

        let (answer, confidence) = self.synthesize_answer(question).await?;
        self.emit(EngineEvent::AnswerReady {
            answer: answer.clone(),
            confidence,
        })
        .await?;

        Ok((answer, confidence))
    }

    /// Expand a leaf: the policy proposes seeds, code seeds execute in the
    /// sandbox, and any final-answer marker spawns an `answer` child.
    async fn expand(&mut self, node_id: &str, question: &str) -> Result<Vec<String>> {
        let messages = self.branch_history(node_id);
        let context_chars = self.sandbox.context_length();

        let parent = self
            .tree
            .get(node_id)
            .ok_or_else(|| Error::Internal("expanding missing node".to_string()))?
            .clone();

        let seeds = self
            .policy
            .expand(&parent, &messages, question, context_chars)
            .await?;

        let mut created = Vec::new();
        for (index, seed) in seeds.into_iter().enumerate() {
            let child_id = match seed {
                CandidateSeed::Code(code) => {
                    let label = if parent.kind == NodeKind::Root {
                        format!("Strategy {}", index + 1)
                    } else {
                        "Follow-up code".to_string()
                    };
                    let mut child = ReasoningNode::new(make_id(), NodeKind::Code, label);
                    child.code = code;
                    let child_id = self
                        .tree
                        .attach(node_id, child)
                        .ok_or_else(|| Error::Internal("attach failed".to_string()))?;
                    self.execute_code_node(&child_id).await?;
                    child_id
                }
                CandidateSeed::Strategy(content) => {
                    let child = ReasoningNode::new(make_id(), NodeKind::Strategy, content);
                    self.tree
                        .attach(node_id, child)
                        .ok_or_else(|| Error::Internal("attach failed".to_string()))?
                }
            };

            self.record_branch_messages(&child_id, &messages);
            created.push(child_id);
        }

        Ok(created)
    }

    /// Run a `code` child in the sandbox and fold the result into the node.
    async fn execute_code_node(&mut self, child_id: &str) -> Result<()> {
        let code = self
            .tree
            .get(child_id)
            .map(|n| n.code.clone())
            .unwrap_or_default();

        let outcome = self
            .sandbox
            .execute_with_timeout(&code, self.config.execution_timeout)
            .await;

        let content = if outcome.success && !outcome.stdout.trim().is_empty() {
            format!(
                "Code executed -> {}",
                truncate_chars(outcome.stdout.trim(), 200)
            )
        } else if !outcome.success {
            format!(
                "Code error -> {}",
                truncate_chars(outcome.stderr.trim(), 200)
            )
        } else {
            let names: Vec<&str> = outcome.variables.keys().map(String::as_str).collect();
            format!("Code executed (no output), vars: [{}]", names.join(", "))
        };

        let final_answer = self.check_final_var(&code, &outcome.stdout);

        {
            let node = self
                .tree
                .get_mut(child_id)
                .ok_or_else(|| Error::Internal("code node missing".to_string()))?;
            node.stdout = outcome.stdout;
            node.stderr = outcome.stderr;
            node.variables = outcome.variables;
            node.execution_ms = outcome.elapsed_ms;
            node.content = content;
        }

        if let Some(answer) = final_answer {
            let answer_node = ReasoningNode::new(make_id(), NodeKind::Answer, answer);
            self.tree
                .attach(child_id, answer_node)
                .ok_or_else(|| Error::Internal("attach failed".to_string()))?;
        }

        Ok(())
    }

    /// Scan code and stdout for `FINAL_VAR(name)` and resolve the variable
    /// from the post-execution namespace.
    fn check_final_var(&self, code: &str, stdout: &str) -> Option<String> {
        let re = Regex::new(r"FINAL_VAR\(([^)]+)\)").expect("static regex");
        let combined = format!("{}\n{}", code, stdout);
        let name = re.captures(&combined)?.get(1)?.as_str();
        self.sandbox.get_variable(name)
    }

    /// Branch history for a node: its own, or the nearest ancestor's.
    fn branch_history(&self, node_id: &str) -> Vec<ChatMessage> {
        let mut current = Some(node_id.to_string());
        while let Some(id) = current {
            if let Some(messages) = self.branch_messages.get(&id) {
                return messages.clone();
            }
            current = self
                .tree
                .get(&id)
                .and_then(|n| n.parent_id.clone());
        }
        Vec::new()
    }

    fn record_branch_messages(&mut self, child_id: &str, inherited: &[ChatMessage]) {
        let mut messages = inherited.to_vec();
        if let Some(child) = self.tree.get(child_id) {
            if !child.code.is_empty() {
                messages.push(ChatMessage::assistant(format!(
                    "```repl\n{}\n```",
                    child.code
                )));
                let mut output = format!(
                    "REPL output:\n{}\n",
                    truncate_chars(&child.stdout, 3000)
                );
                if !child.stderr.is_empty() {
                    output.push_str(&format!("Errors:\n{}", truncate_chars(&child.stderr, 500)));
                }
                messages.push(ChatMessage::user(output));
            }
        }
        self.branch_messages.insert(child_id.to_string(), messages);
    }

    /// Gather visited answers and code outputs, rank them, and synthesize.
    async fn synthesize_answer(&self, question: &str) -> Result<(String, f64)> {
        let mut results: Vec<RankedResult> = Vec::new();
        for node in self.tree.iter() {
            if node.visits == 0 {
                continue;
            }
            match node.kind {
                NodeKind::Answer => results.push(RankedResult {
                    content: node.content.clone(),
                    score: round_to(node.avg_value(), 3),
                    kind: "answer",
                    code: None,
                }),
                NodeKind::Code if !node.stdout.trim().is_empty() => results.push(RankedResult {
                    content: truncate_chars(&node.stdout, 500),
                    score: round_to(node.avg_value(), 3),
                    kind: "code_result",
                    code: Some(truncate_chars(&node.code, 300)),
                }),
                _ => {}
            }
        }

        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        if results.is_empty() {
            return Ok(("Could not determine an answer.".to_string(), 0.0));
        }

        results.truncate(10);
        let best_score = results[0].score;
        let answer = self
            .synthesizer
            .synthesize(question, &results, self.sandbox.context_length())
            .await?;

        Ok((answer, best_score.min(1.0)))
    }

    async fn emit_node(&self, node_id: &str) -> Result<()> {
        let Some(node) = self.tree.get(node_id) else {
            return Ok(());
        };
        self.emit(EngineEvent::NodeUpdate {
            node: node.snapshot(),
            tree: self.tree.snapshot(),
        })
        .await
    }

    async fn emit(&self, event: EngineEvent) -> Result<()> {
        if let Some(tx) = &self.events {
            tx.send(event).await.map_err(|_| Error::Cancelled)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::SandboxConfig;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    struct ScriptedPolicy {
        /// Seeds handed out per expansion call, in order.
        rounds: Mutex<Vec<Vec<CandidateSeed>>>,
    }

    impl ScriptedPolicy {
        fn new(rounds: Vec<Vec<CandidateSeed>>) -> Self {
            Self {
                rounds: Mutex::new(rounds),
            }
        }
    }

    #[async_trait]
    impl Policy for ScriptedPolicy {
        async fn expand(
            &self,
            _node: &ReasoningNode,
            _history: &[ChatMessage],
            _question: &str,
            _context_chars: usize,
        ) -> Result<Vec<CandidateSeed>> {
            let mut rounds = self.rounds.lock().unwrap();
            if rounds.is_empty() {
                Ok(Vec::new())
            } else {
                Ok(rounds.remove(0))
            }
        }
    }

    struct FixedReward(f64);

    #[async_trait]
    impl RewardEvaluator for FixedReward {
        async fn evaluate(&self, node: &ReasoningNode, _question: &str) -> Result<f64> {
            if node.kind == NodeKind::Root {
                return Ok(0.5);
            }
            Ok(self.0)
        }
    }

    struct EchoSynthesizer;

    #[async_trait]
    impl Synthesizer for EchoSynthesizer {
        async fn synthesize(
            &self,
            _question: &str,
            results: &[RankedResult],
            _context_chars: usize,
        ) -> Result<String> {
            Ok(results[0].content.clone())
        }
    }

    fn engine_with(
        context: &str,
        rounds: Vec<Vec<CandidateSeed>>,
        reward: f64,
        config: MctsConfig,
    ) -> MctsEngine {
        let sandbox = Sandbox::new(context, None, SandboxConfig::default()).unwrap();
        MctsEngine::new(
            sandbox,
            Arc::new(ScriptedPolicy::new(rounds)),
            Arc::new(FixedReward(reward)),
            Arc::new(EchoSynthesizer),
            config,
        )
    }

    #[tokio::test]
    async fn test_single_code_child_statistics() {
        // Root question "how many lines?", one fragment printing the count.
        let context = (0..42).map(|i| format!("line {i}")).collect::<Vec<_>>().join("\n");
        let rounds = vec![vec![CandidateSeed::Code(
            "print(context.split(\"\\n\").len());".to_string(),
        )]];
        let config = MctsConfig {
            max_iterations: 1,
            ..Default::default()
        };
        let mut engine = engine_with(&context, rounds, 0.8, config);

        let (answer, confidence) = engine.search("how many lines?").await.unwrap();
        assert_eq!(answer.trim(), "42");
        assert_eq!(confidence, 0.8);

        let root = engine.tree().get(engine.tree().root_id().unwrap()).unwrap();
        assert_eq!(root.visits, 1);
        assert_eq!(root.total_value, 0.8);
        assert_eq!(root.children.len(), 1);

        let leaf = engine.tree().get(&root.children[0]).unwrap();
        assert_eq!(leaf.visits, 1);
        assert_eq!(leaf.total_value, 0.8);
        assert_eq!(leaf.stdout.trim(), "42");
    }

    #[tokio::test]
    async fn test_timeout_fragment_scores_zero() {
        let rounds = vec![vec![CandidateSeed::Code("loop { }".to_string())]];
        let config = MctsConfig {
            max_iterations: 1,
            execution_timeout: Duration::from_secs(1),
            ..Default::default()
        };
        let mut engine = engine_with("ctx", rounds, 0.0, config);

        let (_answer, confidence) = engine.search("q").await.unwrap();
        assert_eq!(confidence, 0.0);

        let root = engine.tree().get(engine.tree().root_id().unwrap()).unwrap();
        let leaf = engine.tree().get(&root.children[0]).unwrap();
        assert!(leaf.stderr.contains("timed out"));
        assert_eq!(leaf.visits, 1);
        assert_eq!(leaf.total_value, 0.0);
        assert!(leaf.content.starts_with("Code error"));
    }

    #[tokio::test]
    async fn test_final_var_creates_exactly_one_answer_child() {
        let rounds = vec![vec![CandidateSeed::Code(
            "let v = \"hello\";\nprint(FINAL_VAR(\"v\"));".to_string(),
        )]];
        let config = MctsConfig {
            max_iterations: 1,
            ..Default::default()
        };
        let mut engine = engine_with("ctx", rounds, 0.9, config);
        engine.search("q").await.unwrap();

        let answers: Vec<&ReasoningNode> = engine
            .tree()
            .iter()
            .filter(|n| n.kind == NodeKind::Answer)
            .collect();
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0].content, "hello");

        let code_node = engine
            .tree()
            .iter()
            .find(|n| n.kind == NodeKind::Code)
            .unwrap();
        assert_eq!(code_node.children, vec![answers[0].id.clone()]);
    }

    #[tokio::test]
    async fn test_no_candidates_yields_failure_answer() {
        // Policy produces nothing; tree stays a bare root.
        let config = MctsConfig {
            max_iterations: 2,
            ..Default::default()
        };
        let mut engine = engine_with("ctx", vec![], 0.4, config);
        let (answer, confidence) = engine.search("q").await.unwrap();
        assert_eq!(answer, "Could not determine an answer.");
        assert_eq!(confidence, 0.0);
    }

    #[tokio::test]
    async fn test_snapshot_emitted_after_backprop() {
        let rounds = vec![vec![CandidateSeed::Code("print(1);".to_string())]];
        let config = MctsConfig {
            max_iterations: 1,
            ..Default::default()
        };
        let (tx, mut rx) = mpsc::channel(16);
        let mut engine = engine_with("ctx", rounds, 0.7, config).with_events(tx);
        engine.search("q").await.unwrap();

        let mut updates = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let EngineEvent::NodeUpdate { node, tree } = event {
                updates.push((node, tree));
            }
        }
        // Root emission plus one per iteration.
        assert_eq!(updates.len(), 2);
        let (focal, tree) = &updates[1];
        assert_eq!(focal.visits, 1);
        assert_eq!(tree[&focal.id].visits, 1);
    }

    #[tokio::test]
    async fn test_dropped_receiver_cancels_search() {
        let rounds = vec![vec![CandidateSeed::Code("print(1);".to_string())]];
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let mut engine = engine_with("ctx", rounds, 0.7, MctsConfig::default()).with_events(tx);
        let err = engine.search("q").await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[tokio::test]
    async fn test_branch_history_inherited_from_ancestor() {
        struct HistoryProbe {
            seen: Mutex<Vec<usize>>,
        }

        #[async_trait]
        impl Policy for HistoryProbe {
            async fn expand(
                &self,
                node: &ReasoningNode,
                history: &[ChatMessage],
                _question: &str,
                _context_chars: usize,
            ) -> Result<Vec<CandidateSeed>> {
                self.seen.lock().unwrap().push(history.len());
                if node.kind == NodeKind::Root {
                    Ok(vec![CandidateSeed::Code("print(\"first\");".to_string())])
                } else {
                    Ok(vec![CandidateSeed::Code("print(\"second\");".to_string())])
                }
            }
        }

        let probe = Arc::new(HistoryProbe {
            seen: Mutex::new(Vec::new()),
        });
        let sandbox = Sandbox::new("ctx", None, SandboxConfig::default()).unwrap();
        let mut engine = MctsEngine::new(
            sandbox,
            probe.clone(),
            Arc::new(FixedReward(0.6)),
            Arc::new(EchoSynthesizer),
            MctsConfig {
                max_iterations: 2,
                ..Default::default()
            },
        );
        engine.search("q").await.unwrap();

        let seen = probe.seen.lock().unwrap().clone();
        // Root expansion sees no history; the follow-up sees the stored
        // (code, output) pair from the executed branch.
        assert_eq!(seen, vec![0, 2]);
    }
}
