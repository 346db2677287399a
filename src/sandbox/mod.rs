//! Persistent sandboxed code execution.
//!
//! Policy-generated code fragments run inside an embedded rhai engine.
//! Variables defined at the top level of one fragment are visible to the
//! next; module imports persist the same way. Each call is budgeted: wall
//! clock, sub-LLM invocations, and output size are all bounded, and a stuck
//! worker is abandoned rather than blocking the orchestrator.
//!
//! The engine itself is rebuilt per call (rhai engines are cheap); the
//! persistent state is the variable map, the installed-import set, and the
//! immutable context injected at construction.

pub(crate) mod modules;

pub use modules::ALLOWED_MODULES;

use regex::Regex;
use rhai::{Dynamic, Engine, EvalAltResult, Scope};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;

use crate::error::{Error, Result};
use crate::llm::{ChatMessage, CompletionRequest, LLMClient};
use crate::text::truncate_chars;

/// Sentinel returned by `llm_query` once the per-execution budget is spent.
pub const LLM_LIMIT_SENTINEL: &str =
    "[llm_query limit reached: use local string operations instead]";

/// Maximum prompt length forwarded to the sub-LLM.
const SUB_LLM_PROMPT_CAP: usize = 100_000;

/// Bridge that lets sandboxed code make synchronous sub-LLM calls.
///
/// The sandbox runs on a blocking worker, so implementations may block.
pub trait SubLlm: Send + Sync {
    fn query(&self, prompt: &str) -> Result<String>;
}

/// Production [`SubLlm`] backed by the process-wide chat-completion client.
pub struct SubLlmBridge {
    handle: tokio::runtime::Handle,
    client: Arc<dyn LLMClient>,
    model: String,
}

impl SubLlmBridge {
    pub fn new(handle: tokio::runtime::Handle, client: Arc<dyn LLMClient>, model: String) -> Self {
        Self {
            handle,
            client,
            model,
        }
    }
}

impl SubLlm for SubLlmBridge {
    fn query(&self, prompt: &str) -> Result<String> {
        let request = CompletionRequest::new()
            .with_model(&self.model)
            .with_message(ChatMessage::user(prompt))
            .with_max_tokens(2000)
            .with_temperature(0.3);
        let client = self.client.clone();
        let response = self
            .handle
            .block_on(async move { client.complete(request).await })?;
        Ok(response.content.trim().to_string())
    }
}

/// Budgets and limits for a sandbox.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Default wall-clock budget per execution.
    pub timeout: Duration,
    /// Sub-LLM invocations allowed per execution.
    pub max_llm_calls: usize,
    /// Captured stdout cap in characters.
    pub stdout_limit: usize,
    /// Captured stderr cap in characters.
    pub stderr_limit: usize,
    /// Variable repr cap in characters.
    pub var_repr_limit: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_llm_calls: 3,
            stdout_limit: 2000,
            stderr_limit: 1000,
            var_repr_limit: 200,
        }
    }
}

/// Structured result of one sandbox execution.
#[derive(Debug, Clone)]
pub struct ExecuteOutcome {
    pub stdout: String,
    pub stderr: String,
    /// Bounded repr of every persisted variable after the call.
    pub variables: BTreeMap<String, String>,
    pub elapsed_ms: f64,
    pub success: bool,
}

impl ExecuteOutcome {
    fn failure(stderr: String, elapsed_ms: f64) -> Self {
        Self {
            stdout: String::new(),
            stderr,
            variables: BTreeMap::new(),
            elapsed_ms,
            success: false,
        }
    }
}

/// Persistent sandboxed execution environment.
pub struct Sandbox {
    context: Arc<str>,
    context_path: PathBuf,
    vars: BTreeMap<String, Dynamic>,
    /// module name -> alias, persisted across calls
    installed: BTreeMap<String, String>,
    sub_llm: Option<Arc<dyn SubLlm>>,
    config: SandboxConfig,
    _scratch: TempDir,
}

impl Sandbox {
    /// Build a sandbox around an immutable context string.
    ///
    /// The context is exposed to scripts as the constant `context`, and a
    /// scratch copy is written to the sandbox's temp dir as `context_path`.
    pub fn new(
        context: &str,
        sub_llm: Option<Arc<dyn SubLlm>>,
        config: SandboxConfig,
    ) -> Result<Self> {
        let scratch = TempDir::with_prefix("arbor_sandbox_")
            .map_err(|e| Error::sandbox(format!("failed to create scratch dir: {}", e)))?;
        let context_path = scratch.path().join("context.txt");
        std::fs::write(&context_path, context)
            .map_err(|e| Error::sandbox(format!("failed to write context: {}", e)))?;

        Ok(Self {
            context: Arc::from(context),
            context_path,
            vars: BTreeMap::new(),
            installed: BTreeMap::new(),
            sub_llm,
            config,
            _scratch: scratch,
        })
    }

    /// Context size in bytes, used when prompting the policy.
    pub fn context_length(&self) -> usize {
        self.context.len()
    }

    /// Execute a code fragment with the sandbox's default timeout.
    pub async fn execute(&mut self, code: &str) -> ExecuteOutcome {
        self.execute_with_timeout(code, self.config.timeout).await
    }

    /// Execute a code fragment against the persistent namespace.
    ///
    /// All failures are reported in-band: script errors and disallowed
    /// imports land in `stderr` with `success = false`, and the variable
    /// state from a failed call is discarded.
    pub async fn execute_with_timeout(&mut self, code: &str, timeout: Duration) -> ExecuteOutcome {
        let started = Instant::now();

        let (imports, body) = match split_imports(code) {
            Ok(parts) => parts,
            Err(message) => return ExecuteOutcome::failure(message, 0.0),
        };

        let mut merged = self.installed.clone();
        merged.extend(imports);
        let script = assemble_script(&merged, &body);

        let stdout = Arc::new(Mutex::new(String::new()));
        let llm_calls = Arc::new(AtomicUsize::new(0));
        let seed = self.vars.clone();
        let context = self.context.clone();
        let context_path = self.context_path.display().to_string();
        let sub_llm = self.sub_llm.clone();
        let config = self.config.clone();
        let deadline = started + timeout;
        let stdout_worker = stdout.clone();
        let calls_worker = llm_calls.clone();

        let worker = tokio::task::spawn_blocking(move || {
            run_script(
                &script,
                seed,
                context,
                context_path,
                stdout_worker,
                calls_worker,
                &config,
                sub_llm,
                deadline,
            )
        });

        // Small grace so the cooperative in-engine deadline usually reports
        // the timeout; the outer timeout only abandons workers stuck inside
        // blocking native calls.
        let run = match tokio::time::timeout(timeout + Duration::from_millis(250), worker).await {
            Err(_) => {
                tracing::warn!(timeout_secs = timeout.as_secs_f64(), "sandbox worker abandoned");
                return ExecuteOutcome::failure(
                    format!("Execution timed out after {}s", timeout.as_secs_f64()),
                    timeout.as_millis() as f64,
                );
            }
            Ok(Err(join_err)) => {
                return ExecuteOutcome::failure(
                    format!("sandbox worker failed: {}", join_err),
                    started.elapsed().as_secs_f64() * 1000.0,
                );
            }
            Ok(Ok(run)) => run,
        };

        let elapsed_ms = (started.elapsed().as_secs_f64() * 10_000.0).round() / 10.0;

        let stderr = match (&run.error, run.timed_out) {
            (_, true) => format!("Execution timed out after {}s", timeout.as_secs_f64()),
            (Some(err), false) => truncate_chars(err, self.config.stderr_limit),
            (None, false) => String::new(),
        };
        let success = run.error.is_none() && !run.timed_out;

        let stdout = stdout
            .lock()
            .map(|buf| truncate_chars(&buf, self.config.stdout_limit))
            .unwrap_or_default();

        if success {
            self.vars = run.vars;
            self.installed = merged;
        }

        ExecuteOutcome {
            stdout,
            stderr,
            variables: self.snapshot_variables(),
            elapsed_ms,
            success,
        }
    }

    /// Resolve a variable from the persistent namespace as its display form.
    ///
    /// Surrounding quotes and whitespace on the name are stripped, matching
    /// how the final-answer marker is written by policies.
    pub fn get_variable(&self, name: &str) -> Option<String> {
        let name = name.trim().trim_matches(|c| c == '"' || c == '\'').trim();
        self.vars.get(name).map(|v| v.to_string())
    }

    fn snapshot_variables(&self) -> BTreeMap<String, String> {
        self.vars
            .iter()
            .filter(|(name, _)| !name.starts_with('_'))
            .map(|(name, value)| {
                (
                    name.clone(),
                    repr_value(value, self.config.var_repr_limit),
                )
            })
            .collect()
    }
}

struct RunOutput {
    vars: BTreeMap<String, Dynamic>,
    error: Option<String>,
    timed_out: bool,
}

#[allow(clippy::too_many_arguments)]
fn run_script(
    script: &str,
    seed: BTreeMap<String, Dynamic>,
    context: Arc<str>,
    context_path: String,
    stdout: Arc<Mutex<String>>,
    llm_calls: Arc<AtomicUsize>,
    config: &SandboxConfig,
    sub_llm: Option<Arc<dyn SubLlm>>,
    deadline: Instant,
) -> RunOutput {
    let mut engine = Engine::new();
    engine.set_max_expr_depths(64, 64);
    engine.set_max_call_levels(64);
    engine.set_max_string_size(16_000_000);
    engine.set_max_array_size(100_000);
    engine.set_max_map_size(100_000);
    engine.disable_symbol("eval");
    engine.set_module_resolver(modules::resolver());

    let stdout_cap = config.stdout_limit.max(4096);
    {
        let stdout = stdout.clone();
        engine.on_print(move |s| append_bounded(&stdout, s, stdout_cap));
    }
    {
        let stdout = stdout.clone();
        engine.on_debug(move |s, _source, _pos| append_bounded(&stdout, s, stdout_cap));
    }

    engine.on_progress(move |_ops| {
        if Instant::now() >= deadline {
            Some(Dynamic::from("timeout"))
        } else {
            None
        }
    });

    let max_llm_calls = config.max_llm_calls;
    engine.register_fn("llm_query", move |prompt: &str| -> String {
        let call = llm_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call > max_llm_calls {
            return LLM_LIMIT_SENTINEL.to_string();
        }
        let prompt = if prompt.chars().count() > SUB_LLM_PROMPT_CAP {
            let mut truncated: String = prompt.chars().take(SUB_LLM_PROMPT_CAP).collect();
            truncated.push_str("\n...[truncated]");
            truncated
        } else {
            prompt.to_string()
        };
        match &sub_llm {
            Some(bridge) => bridge
                .query(&prompt)
                .unwrap_or_else(|e| format!("[llm_query error: {}]", e)),
            None => "[llm_query unavailable]".to_string(),
        }
    });

    // Marker only; the engine resolves the named variable after execution.
    engine.register_fn("FINAL_VAR", |name: &str| -> String { name.to_string() });

    let mut scope = Scope::new();
    scope.push_constant("context", context.to_string());
    scope.push_constant("context_path", context_path);
    for (name, value) in seed {
        scope.push_dynamic(name, value);
    }

    match engine.run_with_scope(&mut scope, script) {
        Ok(()) => {
            let mut vars = BTreeMap::new();
            for (name, is_constant, value) in scope.iter() {
                if is_constant {
                    continue;
                }
                vars.insert(name.to_string(), value);
            }
            RunOutput {
                vars,
                error: None,
                timed_out: false,
            }
        }
        Err(err) => {
            let timed_out = matches!(*err, EvalAltResult::ErrorTerminated(..));
            RunOutput {
                vars: BTreeMap::new(),
                error: Some(err.to_string()),
                timed_out,
            }
        }
    }
}

fn append_bounded(buffer: &Arc<Mutex<String>>, text: &str, cap: usize) {
    if let Ok(mut buf) = buffer.lock() {
        if buf.len() < cap {
            buf.push_str(text);
            buf.push('\n');
        }
    }
}

/// Separate import statements from the body and validate them.
///
/// Returns `(module -> alias, body)`, or an in-band error message for a
/// disallowed import.
fn split_imports(code: &str) -> std::result::Result<(BTreeMap<String, String>, String), String> {
    let import_re = Regex::new(
        r#"^import\s+"([A-Za-z_][A-Za-z0-9_]*)"(?:\s+as\s+([A-Za-z_][A-Za-z0-9_]*))?\s*;?\s*$"#,
    )
    .expect("static regex");

    let mut imports = BTreeMap::new();
    let mut body_lines = Vec::new();

    for line in code.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("import ") {
            let captures = import_re.captures(trimmed).ok_or_else(|| {
                format!("Malformed import statement: {}", trimmed)
            })?;
            let module = captures[1].to_string();
            if !ALLOWED_MODULES.contains(&module.as_str()) {
                return Err(format!(
                    "Import of '{}' is not allowed. Allowed: {}",
                    module,
                    ALLOWED_MODULES.join(", ")
                ));
            }
            let alias = captures
                .get(2)
                .map(|m| m.as_str().to_string())
                .unwrap_or_else(|| module.clone());
            imports.insert(module, alias);
        } else {
            body_lines.push(line);
        }
    }

    Ok((imports, body_lines.join("\n")))
}

fn assemble_script(imports: &BTreeMap<String, String>, body: &str) -> String {
    let mut script = String::new();
    for (module, alias) in imports {
        script.push_str(&format!("import \"{}\" as {};\n", module, alias));
    }
    script.push_str(body);
    script
}

fn repr_value(value: &Dynamic, limit: usize) -> String {
    let raw = if value.is_string() {
        format!("\"{}\"", value)
    } else if value.is_int()
        || value.is_float()
        || value.is_bool()
        || value.is_char()
        || value.is_unit()
        || value.is_array()
        || value.is_map()
    {
        value.to_string()
    } else {
        return "<unrepresentable>".to_string();
    };
    truncate_chars(&raw, limit)
}
