//! Execution environment for rubric hypotheses.
//!
//! Rubric code is a script defining `rubric_fn(response)`. The namespace
//! exposes `training_examples` and `sample_examples` plus a
//! `test_rubric(Fn("rubric_fn"))` helper that scores the sample and prints
//! an MAE summary. The eval split is never exposed to the script; after
//! execution the host resolves `rubric_fn` from the compiled AST and scores
//! it over both splits itself, clamping every prediction to [0, 1].

use rhai::{Array, CallFnOptions, Dynamic, Engine, FnPtr, Map, NativeCallContext, Scope, AST};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use super::dataset::{stratified_sample, Example, SAMPLE_SEED, SAMPLE_SIZE};
use super::signals::ScoredPrediction;
use crate::sandbox::modules;
use crate::text::{round_to, truncate_chars};

/// Structured result of running one rubric hypothesis.
#[derive(Debug, Clone, Default)]
pub struct RubricExecution {
    pub success: bool,
    pub rubric_fn_found: bool,
    pub train_results: Vec<ScoredPrediction>,
    pub eval_results: Vec<ScoredPrediction>,
    pub stdout: String,
    pub stderr: String,
}

/// Sandboxed rubric runner for one discovery session.
pub struct RubricSandbox {
    train: Arc<Vec<Example>>,
    eval: Arc<Vec<Example>>,
    sample: Arc<Vec<Example>>,
    timeout: Duration,
}

impl RubricSandbox {
    pub fn new(train: Vec<Example>, eval: Vec<Example>) -> Self {
        let sample = stratified_sample(&train, SAMPLE_SIZE, SAMPLE_SEED);
        Self {
            train: Arc::new(train),
            eval: Arc::new(eval),
            sample: Arc::new(sample),
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The deterministic stratified sample shown to the policy.
    pub fn sample(&self) -> &[Example] {
        &self.sample
    }

    pub fn train_len(&self) -> usize {
        self.train.len()
    }

    pub fn eval_len(&self) -> usize {
        self.eval.len()
    }

    /// Execute rubric code and score `rubric_fn` over the train and eval
    /// splits. All failures are reported in-band.
    pub async fn execute_rubric(&self, code: &str) -> RubricExecution {
        let code = code.to_string();
        let train = self.train.clone();
        let eval = self.eval.clone();
        let sample = self.sample.clone();
        let timeout = self.timeout;

        let worker = tokio::task::spawn_blocking(move || {
            run_rubric_script(&code, &train, &eval, &sample, Instant::now() + timeout)
        });

        match tokio::time::timeout(timeout + Duration::from_millis(250), worker).await {
            Ok(Ok(execution)) => execution,
            Ok(Err(join_err)) => RubricExecution {
                stderr: format!("rubric worker failed: {}", join_err),
                ..Default::default()
            },
            Err(_) => RubricExecution {
                stderr: format!("Execution timed out after {}s", timeout.as_secs_f64()),
                ..Default::default()
            },
        }
    }

    /// Run a rubric over the sample only, returning index-aligned results.
    ///
    /// Used by refinement so the policy can see which specific sample
    /// examples were mispredicted. Any failure yields an empty list.
    pub async fn run_on_sample(&self, code: &str) -> Vec<ScoredPrediction> {
        let code = code.to_string();
        let sample = self.sample.clone();
        let timeout = self.timeout;

        let worker = tokio::task::spawn_blocking(move || {
            let deadline = Instant::now() + timeout;
            let (engine, _stdout) = build_engine(&sample, deadline);
            let mut scope = seed_scope(&sample, &sample);

            let ast = match engine.compile(&code) {
                Ok(ast) => ast,
                Err(_) => return Vec::new(),
            };
            if engine.run_ast_with_scope(&mut scope, &ast).is_err() {
                return Vec::new();
            }
            if !has_rubric_fn(&ast) {
                return Vec::new();
            }
            score_examples(&engine, &mut scope, &ast, &sample)
        });

        match tokio::time::timeout(timeout + Duration::from_millis(250), worker).await {
            Ok(Ok(results)) => results,
            _ => Vec::new(),
        }
    }
}

fn run_rubric_script(
    code: &str,
    train: &[Example],
    eval: &[Example],
    sample: &[Example],
    deadline: Instant,
) -> RubricExecution {
    let (engine, stdout) = build_engine(sample, deadline);
    let mut scope = seed_scope(train, sample);

    let ast = match engine.compile(code) {
        Ok(ast) => ast,
        Err(err) => {
            return RubricExecution {
                stderr: truncate_chars(&err.to_string(), 1000),
                ..Default::default()
            }
        }
    };

    let mut execution = RubricExecution::default();
    match engine.run_ast_with_scope(&mut scope, &ast) {
        Ok(()) => execution.success = true,
        Err(err) => {
            execution.stderr = truncate_chars(&err.to_string(), 1000);
        }
    }

    execution.rubric_fn_found = has_rubric_fn(&ast);

    if execution.success && execution.rubric_fn_found {
        execution.train_results = score_examples(&engine, &mut scope, &ast, train);
        execution.eval_results = score_examples(&engine, &mut scope, &ast, eval);
    } else if execution.success {
        execution.stderr = "Warning: No `rubric_fn` function found in code.".to_string();
    }

    execution.stdout = stdout
        .lock()
        .map(|buf| truncate_chars(&buf, 2000))
        .unwrap_or_default();
    execution
}

/// Build the restricted engine: allowlisted modules only, bounded output,
/// deadline-terminated, plus the `test_rubric` harness.
fn build_engine(sample: &[Example], deadline: Instant) -> (Engine, Arc<Mutex<String>>) {
    let mut engine = Engine::new();
    engine.set_max_expr_depths(64, 64);
    engine.set_max_call_levels(64);
    engine.set_max_string_size(4_000_000);
    engine.set_max_array_size(100_000);
    engine.set_max_map_size(100_000);
    engine.disable_symbol("eval");
    engine.set_module_resolver(modules::resolver());

    let stdout = Arc::new(Mutex::new(String::new()));
    {
        let stdout = stdout.clone();
        engine.on_print(move |s| {
            if let Ok(mut buf) = stdout.lock() {
                if buf.len() < 8192 {
                    buf.push_str(s);
                    buf.push('\n');
                }
            }
        });
    }

    engine.on_progress(move |_ops| {
        if Instant::now() >= deadline {
            Some(Dynamic::from("timeout"))
        } else {
            None
        }
    });

    let sample_for_harness: Vec<Example> = sample.to_vec();
    let harness_out = stdout.clone();
    engine.register_fn(
        "test_rubric",
        move |ctx: NativeCallContext, rubric: FnPtr| -> Map {
            let mut results = Array::new();
            let mut errors = 0usize;
            let mut abs_error_sum = 0.0;

            for example in &sample_for_harness {
                let predicted = match rubric
                    .call_within_context::<Dynamic>(&ctx, (example.response.clone(),))
                {
                    Ok(value) => coerce_score(&value).unwrap_or_else(|| {
                        errors += 1;
                        0.0
                    }),
                    Err(_) => {
                        errors += 1;
                        0.0
                    }
                };
                let predicted = predicted.clamp(0.0, 1.0);
                let error = (predicted - example.score).abs();
                abs_error_sum += error;

                let mut entry = Map::new();
                entry.insert("predicted".into(), Dynamic::from(round_to(predicted, 4)));
                entry.insert("actual".into(), Dynamic::from(example.score));
                entry.insert("error".into(), Dynamic::from(round_to(error, 4)));
                results.push(Dynamic::from(entry));
            }

            let mae = abs_error_sum / results.len().max(1) as f64;
            if let Ok(mut buf) = harness_out.lock() {
                buf.push_str(&format!(
                    "test_rubric: MAE={:.4} on {} samples\n",
                    mae,
                    results.len()
                ));
                if errors > 0 {
                    buf.push_str(&format!("  {} execution errors\n", errors));
                }
            }

            let mut summary = Map::new();
            summary.insert("mae".into(), Dynamic::from(round_to(mae, 4)));
            summary.insert("results".into(), Dynamic::from(results));
            summary.insert("errors".into(), Dynamic::from(errors as i64));
            summary
        },
    );

    (engine, stdout)
}

fn seed_scope(train: &[Example], sample: &[Example]) -> Scope<'static> {
    let mut scope = Scope::new();
    scope.push_constant("training_examples", examples_to_array(train));
    scope.push_constant("sample_examples", examples_to_array(sample));
    scope
}

fn examples_to_array(examples: &[Example]) -> Array {
    examples
        .iter()
        .map(|example| {
            let mut map = Map::new();
            map.insert(
                "input".into(),
                rhai::serde::to_dynamic(&example.input).unwrap_or(Dynamic::UNIT),
            );
            map.insert("response".into(), Dynamic::from(example.response.clone()));
            map.insert("score".into(), Dynamic::from(example.score));
            map.insert(
                "spec".into(),
                rhai::serde::to_dynamic(&example.spec).unwrap_or(Dynamic::UNIT),
            );
            Dynamic::from(map)
        })
        .collect()
}

fn has_rubric_fn(ast: &AST) -> bool {
    ast.iter_functions()
        .any(|f| f.name == "rubric_fn" && f.params.len() == 1)
}

/// Score `rubric_fn` over a set of examples; per-example failures predict 0.
fn score_examples(
    engine: &Engine,
    scope: &mut Scope<'static>,
    ast: &AST,
    examples: &[Example],
) -> Vec<ScoredPrediction> {
    examples
        .iter()
        .map(|example| {
            let predicted = engine
                .call_fn_with_options::<Dynamic>(
                    CallFnOptions::new().eval_ast(false),
                    scope,
                    ast,
                    "rubric_fn",
                    (example.response.clone(),),
                )
                .ok()
                .and_then(|value| coerce_score(&value))
                .unwrap_or(0.0);
            ScoredPrediction {
                predicted: round_to(predicted.clamp(0.0, 1.0), 4),
                actual: example.score,
            }
        })
        .collect()
}

fn coerce_score(value: &Dynamic) -> Option<f64> {
    value
        .as_float()
        .ok()
        .or_else(|| value.as_int().ok().map(|i| i as f64))
}

#[cfg(test)]
mod tests {
    use super::*;
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
            example("Plan: do the thing carefully", 0.9),
            example("Plan: quick plan", 0.8),
            example("no structure at all", 0.1),
            example("another weak reply", 0.2),
        ];
        let eval = vec![
            example("Plan: evaluate this", 0.85),
            example("nothing useful", 0.15),
        ];
        RubricSandbox::new(train, eval)
    }

    const PLAN_RUBRIC: &str = r#"
fn rubric_fn(response) {
    if response.contains("Plan:") { 0.85 } else { 0.15 }
}
test_rubric(Fn("rubric_fn"));
"#;

    #[tokio::test]
    async fn test_execute_rubric_scores_both_splits() {
        let sb = sandbox();
        let execution = sb.execute_rubric(PLAN_RUBRIC).await;

        assert!(execution.success, "stderr: {}", execution.stderr);
        assert!(execution.rubric_fn_found);
        assert_eq!(execution.train_results.len(), 4);
        assert_eq!(execution.eval_results.len(), 2);
        assert!(execution.stdout.contains("test_rubric: MAE="));

        let plan_result = &execution.train_results[0];
        assert_eq!(plan_result.predicted, 0.85);
        assert_eq!(plan_result.actual, 0.9);
    }

    #[tokio::test]
    async fn test_missing_rubric_fn_warns() {
        let sb = sandbox();
        let execution = sb.execute_rubric("let x = 1;").await;
        assert!(execution.success);
        assert!(!execution.rubric_fn_found);
        assert!(execution.stderr.contains("No `rubric_fn`"));
        assert!(execution.train_results.is_empty());
    }

    #[tokio::test]
    async fn test_compile_error_is_in_band() {
        let sb = sandbox();
        let execution = sb.execute_rubric("fn rubric_fn(response) {").await;
        assert!(!execution.success);
        assert!(!execution.stderr.is_empty());
    }

    #[tokio::test]
    async fn test_per_example_failures_predict_zero() {
        let sb = sandbox();
        let execution = sb
            .execute_rubric(
                r#"fn rubric_fn(response) { if response.contains("Plan:") { throw "boom"; } 0.5 }"#,
            )
            .await;
        assert!(execution.success);
        let failed: Vec<&ScoredPrediction> = execution
            .train_results
            .iter()
            .filter(|r| r.predicted == 0.0)
            .collect();
        assert_eq!(failed.len(), 2);
    }

    #[tokio::test]
    async fn test_predictions_are_clamped() {
        let sb = sandbox();
        let execution = sb
            .execute_rubric("fn rubric_fn(response) { 7.5 }")
            .await;
        assert!(execution.success);
        assert!(execution.train_results.iter().all(|r| r.predicted == 1.0));
    }

    #[tokio::test]
    async fn test_eval_split_not_visible_to_script() {
        let sb = sandbox();
        let execution = sb
            .execute_rubric(
                r#"
fn rubric_fn(response) { 0.5 }
print(training_examples.len());
print(sample_examples.len());
"#,
            )
            .await;
        assert!(execution.success, "stderr: {}", execution.stderr);

        let probe = sb.execute_rubric("print(eval_examples.len());").await;
        assert!(!probe.success);
    }

    #[tokio::test]
    async fn test_run_on_sample_aligns_with_sample() {
        let sb = sandbox();
        let results = sb
            .run_on_sample("fn rubric_fn(response) { if response.contains(\"Plan:\") { 0.9 } else { 0.1 } }")
            .await;
        assert_eq!(results.len(), sb.sample().len());
        for (result, example) in results.iter().zip(sb.sample()) {
            assert_eq!(result.actual, example.score);
        }
    }

    #[tokio::test]
    async fn test_broken_code_yields_empty_sample_results() {
        let sb = sandbox();
        assert!(sb.run_on_sample("not valid (").await.is_empty());
        assert!(sb.run_on_sample("let x = 1;").await.is_empty());
    }
}
