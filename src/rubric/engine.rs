//! MCTS for rubric discovery.
//!
//! Same four-phase skeleton as the transcript engine, with the refinement
//! differences: every expanded child is evaluated with the algorithmic
//! composite and back-propagated, and the engine tracks the best node across
//! all iterations, marking it `final` at the end.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::mpsc;

use super::policy::RubricPolicy;
use super::sandbox::{RubricExecution, RubricSandbox};
use super::signals::{compute_rewards, mae, RewardBreakdown, ScoredPrediction};
use crate::error::{Error, Result};
use crate::text::{round_to, truncate_chars};
use crate::tree::{make_id, NodeKind};

/// A node in the rubric discovery tree.
#[derive(Debug, Clone)]
pub struct RubricNode {
    pub id: String,
    pub rubric_code: String,
    pub kind: NodeKind,
    pub depth: u32,
    pub visits: u64,
    pub total_reward: f64,

    pub rewards: RewardBreakdown,
    pub train_results: Vec<ScoredPrediction>,
    pub eval_results: Vec<ScoredPrediction>,
    pub train_mae: f64,
    pub eval_mae: f64,
    pub stdout: String,
    pub stderr: String,
    pub execution_success: bool,

    pub parent_id: Option<String>,
    pub children: Vec<String>,
}

impl RubricNode {
    fn new(kind: NodeKind) -> Self {
        Self {
            id: make_id(),
            rubric_code: String::new(),
            kind,
            depth: 0,
            visits: 0,
            total_reward: 0.0,
            rewards: RewardBreakdown::default(),
            train_results: Vec::new(),
            eval_results: Vec::new(),
            train_mae: 1.0,
            eval_mae: 1.0,
            stdout: String::new(),
            stderr: String::new(),
            execution_success: false,
            parent_id: None,
            children: Vec::new(),
        }
    }

    pub fn ucb_score(&self, parent_visits: u64, exploration: f64) -> f64 {
        if self.visits == 0 {
            return f64::INFINITY;
        }
        let exploit = self.total_reward / self.visits as f64;
        let explore =
            exploration * ((parent_visits as f64).ln() / self.visits as f64).sqrt();
        exploit + explore
    }

    /// Bounded serialized view: output capped, result lists trimmed.
    pub fn snapshot(&self) -> RubricNodeSnapshot {
        RubricNodeSnapshot {
            id: self.id.clone(),
            rubric_code: self.rubric_code.clone(),
            node_type: self.kind,
            depth: self.depth,
            visits: self.visits,
            reward_generalization: self.rewards.generalization,
            reward_calibration: self.rewards.calibration,
            reward_discrimination: self.rewards.discrimination,
            reward_validity: self.rewards.validity,
            reward_iteration: self.rewards.iteration,
            reward_composite: self.rewards.composite,
            train_mae: round_to(self.train_mae, 4),
            eval_mae: round_to(self.eval_mae, 4),
            stdout: truncate_chars(&self.stdout, 500),
            stderr: truncate_chars(&self.stderr, 500),
            execution_success: self.execution_success,
            parent_id: self.parent_id.clone(),
            children: self.children.clone(),
            train_results: self.train_results.iter().take(20).copied().collect(),
            eval_results: self.eval_results.iter().take(20).copied().collect(),
        }
    }
}

/// Serialized rubric node as sent to clients.
#[derive(Debug, Clone, Serialize)]
pub struct RubricNodeSnapshot {
    pub id: String,
    pub rubric_code: String,
    pub node_type: NodeKind,
    pub depth: u32,
    pub visits: u64,
    pub reward_generalization: f64,
    pub reward_calibration: f64,
    pub reward_discrimination: f64,
    pub reward_validity: f64,
    pub reward_iteration: f64,
    pub reward_composite: f64,
    pub train_mae: f64,
    pub eval_mae: f64,
    pub stdout: String,
    pub stderr: String,
    pub execution_success: bool,
    pub parent_id: Option<String>,
    pub children: Vec<String>,
    pub train_results: Vec<ScoredPrediction>,
    pub eval_results: Vec<ScoredPrediction>,
}

/// Full rubric-tree snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct RubricSnapshot {
    pub root_id: String,
    pub nodes: BTreeMap<String, RubricNodeSnapshot>,
    pub best_node_id: Option<String>,
}

/// Final evaluation report for the best rubric.
#[derive(Debug, Clone, Serialize)]
pub struct EvalReport {
    pub best_rubric_code: String,
    pub eval_mae: f64,
    /// Share of eval predictions within 0.15 of the actual score.
    pub eval_accuracy: f64,
    pub eval_count: usize,
    pub eval_results: Vec<ScoredPrediction>,
    pub best_composite: f64,
}

/// Events published while a discovery run progresses.
#[derive(Debug, Clone)]
pub enum RubricEvent {
    NodeUpdate {
        node: RubricNodeSnapshot,
        tree: RubricSnapshot,
        iteration: u32,
        total_iterations: u32,
    },
}

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct RubricConfig {
    pub max_iterations: u32,
    pub max_depth: u32,
    pub exploration: f64,
}

impl Default for RubricConfig {
    fn default() -> Self {
        Self {
            max_iterations: 15,
            max_depth: 4,
            exploration: std::f64::consts::SQRT_2,
        }
    }
}

/// Monte Carlo tree search over rubric hypotheses.
pub struct RubricSearch {
    sandbox: RubricSandbox,
    policy: Arc<dyn RubricPolicy>,
    config: RubricConfig,
    nodes: HashMap<String, RubricNode>,
    root_id: String,
    best_id: Option<String>,
    events: Option<mpsc::Sender<RubricEvent>>,
}

impl RubricSearch {
    pub fn new(
        sandbox: RubricSandbox,
        policy: Arc<dyn RubricPolicy>,
        config: RubricConfig,
    ) -> Self {
        let root = RubricNode::new(NodeKind::Root);
        let root_id = root.id.clone();
        let mut nodes = HashMap::new();
        nodes.insert(root_id.clone(), root);
        Self {
            sandbox,
            policy,
            config,
            nodes,
            root_id,
            best_id: None,
            events: None,
        }
    }

    pub fn with_events(mut self, events: mpsc::Sender<RubricEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn sandbox(&self) -> &RubricSandbox {
        &self.sandbox
    }

    /// Run the full discovery loop and return the best node found.
    pub async fn run(&mut self) -> Result<RubricNode> {
        for iteration in 0..self.config.max_iterations {
            let leaf_id = self.select();
            let children = self.expand(&leaf_id).await?;

            for child_id in children {
                let composite = self
                    .nodes
                    .get(&child_id)
                    .map(|n| n.rewards.composite)
                    .unwrap_or(0.0);
                self.backpropagate(&child_id, composite);

                let is_best = match &self.best_id {
                    None => true,
                    Some(best_id) => {
                        let best = self
                            .nodes
                            .get(best_id)
                            .map(|n| n.rewards.composite)
                            .unwrap_or(0.0);
                        composite > best
                    }
                };
                if is_best {
                    self.best_id = Some(child_id.clone());
                }

                self.emit_node(&child_id, iteration).await?;
            }
        }

        if let Some(best_id) = self.best_id.clone() {
            if let Some(best) = self.nodes.get_mut(&best_id) {
                best.kind = NodeKind::Final;
            }
        }

        let result = self
            .best_id
            .as_ref()
            .or(Some(&self.root_id))
            .and_then(|id| self.nodes.get(id))
            .cloned()
            .ok_or_else(|| Error::Internal("rubric tree lost its nodes".to_string()))?;
        Ok(result)
    }

    /// UCB descent, but unvisited children are taken immediately and the
    /// walk stops at the depth cap.
    fn select(&self) -> String {
        let mut current_id = self.root_id.clone();
        loop {
            let Some(current) = self.nodes.get(&current_id) else {
                return current_id;
            };
            if current.children.is_empty() || current.depth >= self.config.max_depth {
                return current_id;
            }
            let parent_visits = current.visits.max(1);
            let best = current
                .children
                .iter()
                .filter_map(|cid| self.nodes.get(cid))
                .max_by(|a, b| {
                    a.ucb_score(parent_visits, self.config.exploration)
                        .partial_cmp(&b.ucb_score(parent_visits, self.config.exploration))
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
            match best {
                Some(child) if child.visits == 0 => return child.id.clone(),
                Some(child) => current_id = child.id.clone(),
                None => return current_id,
            }
        }
    }

    /// Generate child hypotheses for a node and evaluate each one.
    async fn expand(&mut self, node_id: &str) -> Result<Vec<String>> {
        let (kind, code, rewards, has_children) = {
            let Some(node) = self.nodes.get(node_id) else {
                return Ok(Vec::new());
            };
            (
                node.kind,
                node.rubric_code.clone(),
                node.rewards,
                !node.children.is_empty(),
            )
        };

        let candidates = if kind == NodeKind::Root && !has_children {
            self.policy.expand_root(self.sandbox.sample()).await?
        } else {
            // Run the parent rubric over the sample so the policy sees
            // index-aligned mispredictions.
            let sample_results = self.sandbox.run_on_sample(&code).await;
            self.policy
                .expand_refinement(&code, &sample_results, &rewards, self.sandbox.sample())
                .await?
        };

        let child_kind = if kind == NodeKind::Root {
            NodeKind::Hypothesis
        } else {
            NodeKind::Refinement
        };

        let mut created = Vec::new();
        for candidate in candidates {
            let child_id = self.create_and_evaluate(candidate, node_id, child_kind).await?;
            created.push(child_id);
        }
        Ok(created)
    }

    /// Create a node, execute its rubric, and compute its rewards.
    async fn create_and_evaluate(
        &mut self,
        code: String,
        parent_id: &str,
        kind: NodeKind,
    ) -> Result<String> {
        let (parent_depth, parent_mae) = {
            let parent = self
                .nodes
                .get(parent_id)
                .ok_or_else(|| Error::Internal("expanding missing parent".to_string()))?;
            let parent_mae = if parent.kind != NodeKind::Root {
                Some(parent.train_mae)
            } else {
                None
            };
            (parent.depth, parent_mae)
        };

        let execution: RubricExecution = self.sandbox.execute_rubric(&code).await;

        let mut child = RubricNode::new(kind);
        child.rubric_code = code;
        child.depth = parent_depth + 1;
        child.parent_id = Some(parent_id.to_string());
        child.execution_success = execution.success;
        child.stdout = execution.stdout;
        child.stderr = execution.stderr;
        child.train_results = execution.train_results;
        child.eval_results = execution.eval_results;
        if !child.train_results.is_empty() {
            child.train_mae = mae(&child.train_results);
        }
        if !child.eval_results.is_empty() {
            child.eval_mae = mae(&child.eval_results);
        }

        child.rewards = compute_rewards(
            &child.rubric_code,
            &child.train_results,
            &child.eval_results,
            child.execution_success,
            parent_mae,
        );
        tracing::debug!(
            node = %child.id,
            composite = child.rewards.composite,
            train_mae = child.train_mae,
            "evaluated rubric hypothesis"
        );

        let child_id = child.id.clone();
        self.nodes.insert(child_id.clone(), child);
        if let Some(parent) = self.nodes.get_mut(parent_id) {
            parent.children.push(child_id.clone());
        }
        Ok(child_id)
    }

    fn backpropagate(&mut self, node_id: &str, reward: f64) {
        let mut current = Some(node_id.to_string());
        while let Some(id) = current {
            match self.nodes.get_mut(&id) {
                Some(node) => {
                    node.visits += 1;
                    node.total_reward += reward;
                    current = node.parent_id.clone();
                }
                None => break,
            }
        }
    }

    /// Full tree snapshot including `root_id` and `best_node_id`.
    pub fn snapshot(&self) -> RubricSnapshot {
        RubricSnapshot {
            root_id: self.root_id.clone(),
            nodes: self
                .nodes
                .iter()
                .map(|(id, node)| (id.clone(), node.snapshot()))
                .collect(),
            best_node_id: self.best_id.clone(),
        }
    }

    /// Final evaluation of the best rubric, if any produced eval results.
    pub fn eval_report(&self) -> Option<EvalReport> {
        let best = self.best_id.as_ref().and_then(|id| self.nodes.get(id))?;
        if best.eval_results.is_empty() {
            return None;
        }

        let eval_mae = mae(&best.eval_results);
        let within_tolerance = best
            .eval_results
            .iter()
            .filter(|r| (r.predicted - r.actual).abs() < 0.15)
            .count();
        let accuracy = within_tolerance as f64 / best.eval_results.len().max(1) as f64;

        Some(EvalReport {
            best_rubric_code: best.rubric_code.clone(),
            eval_mae: round_to(eval_mae, 4),
            eval_accuracy: round_to(accuracy, 4),
            eval_count: best.eval_results.len(),
            eval_results: best.eval_results.clone(),
            best_composite: best.rewards.composite,
        })
    }

    async fn emit_node(&self, node_id: &str, iteration: u32) -> Result<()> {
        let Some(node) = self.nodes.get(node_id) else {
            return Ok(());
        };
        if let Some(tx) = &self.events {
            tx.send(RubricEvent::NodeUpdate {
                node: node.snapshot(),
                tree: self.snapshot(),
                iteration: iteration + 1,
                total_iterations: self.config.max_iterations,
            })
            .await
            .map_err(|_| Error::Cancelled)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rubric::dataset::Example;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    fn example(response: &str, score: f64) -> Example {
        Example {
            input: serde_json::Value::Null,
            response: response.to_string(),
            score,
            source: String::new(),
            spec: serde_json::Value::Null,
        }
    }

    fn sandbox() -> RubricSandbox {
        let train = vec![
            example("Plan: a detailed stepwise plan", 0.9),
            example("Plan: shorter plan", 0.8),
            example("vague response", 0.1),
            example("another weak one", 0.2),
            example("Plan: mid quality", 0.6),
        ];
        let eval = vec![
            example("Plan: held-out plan", 0.85),
            example("held-out weak", 0.15),
        ];
        RubricSandbox::new(train, eval)
    }

    /// Hands out a fixed root hypothesis, then refinements of it.
    struct CannedPolicy {
        root: Vec<String>,
        refinement: Vec<String>,
    }

    #[async_trait]
    impl RubricPolicy for CannedPolicy {
        async fn expand_root(&self, _sample: &[Example]) -> Result<Vec<String>> {
            Ok(self.root.clone())
        }

        async fn expand_refinement(
            &self,
            _parent_code: &str,
            sample_results: &[ScoredPrediction],
            _rewards: &RewardBreakdown,
            sample: &[Example],
        ) -> Result<Vec<String>> {
            // The engine must hand us sample-aligned results.
            assert_eq!(sample_results.len(), sample.len());
            Ok(self.refinement.clone())
        }
    }

    const GOOD_RUBRIC: &str =
        "fn rubric_fn(response) { if response.contains(\"Plan:\") { 0.8 } else { 0.15 } }";
    const BAD_RUBRIC: &str = "fn rubric_fn(response) { 0.5 }";

    fn search(root: Vec<&str>, refinement: Vec<&str>, config: RubricConfig) -> RubricSearch {
        RubricSearch::new(
            sandbox(),
            Arc::new(CannedPolicy {
                root: root.into_iter().map(String::from).collect(),
                refinement: refinement.into_iter().map(String::from).collect(),
            }),
            config,
        )
    }

    #[tokio::test]
    async fn test_run_marks_best_final_and_reports_eval() {
        let config = RubricConfig {
            max_iterations: 2,
            ..Default::default()
        };
        let mut engine = search(vec![GOOD_RUBRIC, BAD_RUBRIC], vec![GOOD_RUBRIC], config);

        let best = engine.run().await.unwrap();
        assert_eq!(best.kind, NodeKind::Final);
        assert!(best.rewards.composite > 0.0);

        let report = engine.eval_report().expect("eval report");
        assert_eq!(report.eval_count, 2);
        assert!(report.eval_mae < 0.2);
        assert_eq!(report.best_rubric_code, best.rubric_code);

        let snapshot = engine.snapshot();
        assert_eq!(snapshot.best_node_id.as_deref(), Some(best.id.as_str()));
        assert!(snapshot.nodes.contains_key(&snapshot.root_id));
    }

    #[tokio::test]
    async fn test_every_expanded_child_is_backpropagated() {
        let config = RubricConfig {
            max_iterations: 1,
            ..Default::default()
        };
        let mut engine = search(vec![GOOD_RUBRIC, BAD_RUBRIC], vec![], config);
        engine.run().await.unwrap();

        let root = engine.nodes.get(&engine.root_id).unwrap();
        // Both children were evaluated and back-propagated through the root.
        assert_eq!(root.children.len(), 2);
        assert_eq!(root.visits, 2);
        for child_id in &root.children {
            assert_eq!(engine.nodes[child_id].visits, 1);
        }
    }

    #[tokio::test]
    async fn test_refinement_iteration_signal_uses_parent_mae() {
        let config = RubricConfig {
            max_iterations: 2,
            ..Default::default()
        };
        // Root hypothesis is weak, the refinement is strong.
        let mut engine = search(vec![BAD_RUBRIC], vec![GOOD_RUBRIC], config);
        engine.run().await.unwrap();

        let refinement = engine
            .nodes
            .values()
            .find(|n| n.kind == NodeKind::Refinement || (n.kind == NodeKind::Final && n.depth == 2))
            .expect("refinement node");
        // Improving on the parent puts the iteration signal above the
        // no-change floor of 0.3.
        assert!(refinement.rewards.iteration > 0.3);
    }

    #[tokio::test]
    async fn test_failed_rubrics_still_enter_the_tree() {
        let config = RubricConfig {
            max_iterations: 1,
            ..Default::default()
        };
        let mut engine = search(vec!["fn rubric_fn(response) {"], vec![], config);
        engine.run().await.unwrap();

        let root = engine.nodes.get(&engine.root_id).unwrap();
        assert_eq!(root.children.len(), 1);
        let child = &engine.nodes[&root.children[0]];
        assert!(!child.execution_success);
        assert_eq!(child.rewards.validity, 0.0);
        assert_eq!(child.train_mae, 1.0);
    }

    #[tokio::test]
    async fn test_node_updates_carry_iteration_numbers() {
        let (tx, mut rx) = mpsc::channel(32);
        let config = RubricConfig {
            max_iterations: 1,
            ..Default::default()
        };
        let mut engine =
            search(vec![GOOD_RUBRIC, BAD_RUBRIC], vec![], config).with_events(tx);
        engine.run().await.unwrap();

        let mut updates = 0;
        while let Ok(RubricEvent::NodeUpdate {
            iteration,
            total_iterations,
            ..
        }) = rx.try_recv()
        {
            assert_eq!(iteration, 1);
            assert_eq!(total_iterations, 1);
            updates += 1;
        }
        assert_eq!(updates, 2);
    }
}
