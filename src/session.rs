//! Session orchestration: provisions sandboxes and engines for one request,
//! fans engine events out to the client channel, and tears everything down
//! on completion or disconnect.
//!
//! Engines publish typed events into an mpsc channel; the transport task at
//! the boundary is the sole writer to the client. A failed send anywhere in
//! the chain means the client is gone: the session is cancelled silently and
//! the sandboxes (and their temp dirs) are dropped.

use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

use crate::config::Config;
use crate::engine::{EngineEvent, MctsConfig, MctsEngine};
use crate::error::{Error, Result};
use crate::events::{MctsComparison, MctsRunMetrics, ServerEvent};
use crate::llm::LLMClient;
use crate::plain::PlainPipeline;
use crate::policy::{LlmPolicy, LlmSynthesizer};
use crate::reward::LlmJudge;
use crate::rubric::{
    Dataset, LlmRubricPolicy, RubricConfig, RubricEvent, RubricSandbox, RubricSearch,
};
use crate::sandbox::{Sandbox, SandboxConfig, SubLlmBridge};
use crate::text::round_to;
use crate::tree::NodeKind;

/// Dependencies shared by every session.
#[derive(Clone)]
pub struct SessionDeps {
    pub client: Arc<dyn LLMClient>,
    pub config: Arc<Config>,
}

impl SessionDeps {
    pub(crate) fn sandbox(&self, context: &str) -> Result<Sandbox> {
        let bridge = SubLlmBridge::new(
            tokio::runtime::Handle::current(),
            self.client.clone(),
            self.config.sub_model.clone(),
        );
        Sandbox::new(context, Some(Arc::new(bridge)), SandboxConfig::default())
    }

    pub(crate) fn engine(&self, context: &str, max_iterations: u32) -> Result<MctsEngine> {
        let sandbox = self.sandbox(context)?;
        Ok(MctsEngine::new(
            sandbox,
            Arc::new(LlmPolicy::new(self.client.clone(), &self.config.policy_model)),
            Arc::new(LlmJudge::new(self.client.clone(), &self.config.judge_model)),
            Arc::new(LlmSynthesizer::new(
                self.client.clone(),
                &self.config.policy_model,
            )),
            MctsConfig {
                max_iterations,
                ..Default::default()
            },
        ))
    }

    fn judge(&self) -> Arc<LlmJudge> {
        Arc::new(LlmJudge::new(self.client.clone(), &self.config.judge_model))
    }
}

async fn send(tx: &mpsc::Sender<ServerEvent>, event: ServerEvent) -> Result<()> {
    tx.send(event).await.map_err(|_| Error::Cancelled)
}

fn node_update(event: EngineEvent) -> Option<ServerEvent> {
    match event {
        EngineEvent::NodeUpdate { node, tree } => Some(ServerEvent::NodeUpdate {
            node: serde_json::to_value(node).ok()?,
            tree_snapshot: serde_json::to_value(tree).ok()?,
            iteration: None,
            total_iterations: None,
        }),
        EngineEvent::AnswerReady { answer, confidence } => {
            Some(ServerEvent::answer_ready(answer, confidence))
        }
    }
}

/// Run a streaming MCTS search for one question.
pub async fn run_ask(
    deps: &SessionDeps,
    context: String,
    question: String,
    max_iterations: u32,
    tx: mpsc::Sender<ServerEvent>,
) -> Result<()> {
    send(
        &tx,
        ServerEvent::SearchStarted {
            question: question.clone(),
            context_chars: context.len(),
        },
    )
    .await?;

    let (engine_tx, mut engine_rx) = mpsc::channel::<EngineEvent>(64);
    let mut engine = deps.engine(&context, max_iterations)?.with_events(engine_tx);

    let forward_tx = tx.clone();
    let forwarder = tokio::spawn(async move {
        while let Some(event) = engine_rx.recv().await {
            let Some(server_event) = node_update(event) else {
                continue;
            };
            if forward_tx.send(server_event).await.is_err() {
                break;
            }
        }
    });

    let search_result = engine.search(&question).await;
    let snapshot = engine.tree_snapshot();
    drop(engine);
    let _ = forwarder.await;

    let (answer, confidence) = search_result?;
    send(
        &tx,
        ServerEvent::SearchComplete {
            answer,
            confidence: round_to(confidence, 4),
            tree: serde_json::to_value(snapshot)?,
        },
    )
    .await
}

/// Run the plain pipeline and the full MCTS concurrently and report both.
pub async fn run_compare(
    deps: &SessionDeps,
    context: String,
    question: String,
    max_iterations: u32,
    tx: mpsc::Sender<ServerEvent>,
) -> Result<()> {
    send(
        &tx,
        ServerEvent::SearchStarted {
            question: question.clone(),
            context_chars: context.len(),
        },
    )
    .await?;

    // Independent sandboxes per engine; they share nothing but the event
    // channel.
    let mut plain_sandbox = deps.sandbox(&context)?;
    let (engine_tx, mut engine_rx) = mpsc::channel::<EngineEvent>(64);
    let mut engine = deps.engine(&context, max_iterations)?.with_events(engine_tx);

    let mcts_forward = tx.clone();
    let mcts_forwarder = tokio::spawn(async move {
        while let Some(event) = engine_rx.recv().await {
            let Some(server_event) = node_update(event) else {
                continue;
            };
            if mcts_forward.send(server_event).await.is_err() {
                break;
            }
        }
    });

    let (step_tx, mut step_rx) = mpsc::channel(16);
    let plain_forward = tx.clone();
    let plain_forwarder = tokio::spawn(async move {
        while let Some(step) = step_rx.recv().await {
            if plain_forward
                .send(ServerEvent::PlainStep { step })
                .await
                .is_err()
            {
                break;
            }
        }
    });

    let pipeline = PlainPipeline::new(
        deps.client.clone(),
        deps.config.policy_model.clone(),
        deps.judge(),
    );

    let started = Instant::now();
    let (plain_result, mcts_result) = tokio::join!(
        pipeline.run(&question, &mut plain_sandbox, Some(&step_tx)),
        engine.search(&question),
    );
    let mcts_elapsed = started.elapsed().as_millis() as u64;

    drop(step_tx);
    let _ = plain_forwarder.await;

    let plain = plain_result?;
    let (mcts_answer, mcts_confidence) = mcts_result?;

    // Collect run metrics from the finished tree.
    let tree = engine.tree();
    let code_nodes: Vec<_> = tree.iter().filter(|n| n.kind == NodeKind::Code).collect();
    let successful_code = code_nodes
        .iter()
        .filter(|n| !n.stdout.is_empty() && n.stderr.is_empty())
        .count();
    let unique_strategies = tree
        .root_id()
        .and_then(|root| tree.get(root))
        .map(|root| root.children.len())
        .unwrap_or(0);
    let max_depth_reached = tree.iter().map(|n| n.depth).max().unwrap_or(0);
    let visited: Vec<f64> = tree
        .iter()
        .filter(|n| n.visits > 0 && n.kind != NodeKind::Root)
        .map(|n| n.avg_value())
        .collect();
    let avg_node_value = if visited.is_empty() {
        0.0
    } else {
        visited.iter().sum::<f64>() / visited.len() as f64
    };

    let metrics = MctsRunMetrics {
        total_time_ms: mcts_elapsed,
        // Rough estimate: one policy and one judge call per iteration plus
        // the synthesis call.
        llm_calls: max_iterations * 2 + 1,
        code_executions: code_nodes.len(),
        successful_code_blocks: successful_code,
        unique_strategies,
        max_depth_reached,
        avg_node_value: round_to(avg_node_value, 4),
        answer_length: mcts_answer.len(),
        confidence: round_to(mcts_confidence, 4),
    };

    let snapshot = engine.tree_snapshot();
    drop(engine);
    let _ = mcts_forwarder.await;

    send(
        &tx,
        ServerEvent::ComparisonComplete {
            plain,
            mcts: MctsComparison {
                answer: mcts_answer,
                confidence: round_to(mcts_confidence, 4),
                metrics,
                tree: serde_json::to_value(snapshot)?,
            },
        },
    )
    .await
}

/// Run a rubric discovery session over the loaded dataset.
pub async fn run_discover(
    deps: &SessionDeps,
    dataset: &Dataset,
    max_iterations: u32,
    max_depth: u32,
    tx: mpsc::Sender<ServerEvent>,
) -> Result<()> {
    let sandbox = RubricSandbox::new(dataset.train.clone(), dataset.eval.clone());

    send(
        &tx,
        ServerEvent::DiscoveryStarted {
            num_training: sandbox.train_len(),
            num_eval: sandbox.eval_len(),
        },
    )
    .await?;

    let (event_tx, mut event_rx) = mpsc::channel::<RubricEvent>(64);
    let mut search = RubricSearch::new(
        sandbox,
        Arc::new(LlmRubricPolicy::new(
            deps.client.clone(),
            &deps.config.policy_model,
        )),
        RubricConfig {
            max_iterations,
            max_depth,
            ..Default::default()
        },
    )
    .with_events(event_tx);

    let forward_tx = tx.clone();
    let forwarder = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            let RubricEvent::NodeUpdate {
                node,
                tree,
                iteration,
                total_iterations,
            } = event;
            let (Ok(node), Ok(tree)) = (
                serde_json::to_value(node),
                serde_json::to_value(tree),
            ) else {
                continue;
            };
            let server_event = ServerEvent::NodeUpdate {
                node,
                tree_snapshot: tree,
                iteration: Some(iteration),
                total_iterations: Some(total_iterations),
            };
            if forward_tx.send(server_event).await.is_err() {
                break;
            }
        }
    });

    let run_result = search.run().await;
    let snapshot = search.snapshot();
    let report = search.eval_report();
    drop(search);
    let _ = forwarder.await;

    let best = run_result?;
    let eval_results = match report {
        Some(report) => serde_json::to_value(report)?,
        None => serde_json::json!({"error": "No valid rubric found"}),
    };

    send(
        &tx,
        ServerEvent::DiscoveryComplete {
            best_rubric_code: best.rubric_code,
            best_score: best.rewards.composite,
            eval_results,
            tree_snapshot: serde_json::to_value(snapshot)?,
        },
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{CompletionRequest, CompletionResponse};
    use async_trait::async_trait;
    use chrono::Utc;

    /// A policy-shaped client: replies with a code block for policy-style
    /// prompts, a score for judge prompts, and a summary otherwise.
    struct StubClient;

    #[async_trait]
    impl LLMClient for StubClient {
        async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
            let system = request.system.as_deref().unwrap_or("");
            let content = if system.contains("You evaluate reasoning steps") {
                "0.8".to_string()
            } else if system.contains("synthesize") {
                "the synthesized answer".to_string()
            } else {
                "```repl\nprint(context.len());\n```".to_string()
            };
            Ok(CompletionResponse {
                id: "stub".to_string(),
                model: "stub".to_string(),
                content,
                usage: Default::default(),
                timestamp: Utc::now(),
            })
        }
    }

    fn deps() -> SessionDeps {
        SessionDeps {
            client: Arc::new(StubClient),
            config: Arc::new(Config::for_tests()),
        }
    }

    #[tokio::test]
    async fn test_run_ask_streams_and_completes() {
        let (tx, mut rx) = mpsc::channel(256);
        run_ask(&deps(), "some context".to_string(), "q".to_string(), 2, tx)
            .await
            .unwrap();

        let mut saw_started = false;
        let mut node_updates = 0;
        let mut saw_complete = false;
        while let Some(event) = rx.recv().await {
            match event {
                ServerEvent::SearchStarted { context_chars, .. } => {
                    saw_started = true;
                    assert_eq!(context_chars, 12);
                }
                ServerEvent::NodeUpdate { .. } => node_updates += 1,
                ServerEvent::SearchComplete { answer, .. } => {
                    saw_complete = true;
                    assert_eq!(answer, "the synthesized answer");
                }
                _ => {}
            }
        }
        assert!(saw_started);
        assert!(saw_complete);
        // Root emission plus one per iteration.
        assert!(node_updates >= 3);
    }

    #[tokio::test]
    async fn test_run_compare_emits_both_modes() {
        let (tx, mut rx) = mpsc::channel(256);
        run_compare(&deps(), "some context".to_string(), "q".to_string(), 2, tx)
            .await
            .unwrap();

        let mut plain_steps = 0;
        let mut node_updates = 0;
        let mut completed = false;
        while let Some(event) = rx.recv().await {
            match event {
                ServerEvent::PlainStep { .. } => plain_steps += 1,
                ServerEvent::NodeUpdate { .. } => node_updates += 1,
                ServerEvent::ComparisonComplete { plain, mcts } => {
                    completed = true;
                    assert!(!plain.answer.is_empty());
                    assert!(!mcts.answer.is_empty());
                    assert_eq!(mcts.metrics.llm_calls, 2 * 2 + 1);
                }
                _ => {}
            }
        }
        assert!(completed);
        assert!(plain_steps >= 1);
        assert!(node_updates >= 1);
    }

    #[tokio::test]
    async fn test_disconnected_client_cancels_ask() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let err = run_ask(&deps(), "ctx".to_string(), "q".to_string(), 2, tx)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }
}
