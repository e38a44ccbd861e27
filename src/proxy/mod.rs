//! Tool proxy: sandboxed subprocess execution with artifact capture.
//!
//! The proxy sits between the session loop and the outside world. It
//! executes each tool call under policy, persists the raw output as an
//! artifact, and hands back a compact digest for the conversation.
//! `run_shell` is built in; additional tools can be registered.
//!
//! `run_shell` runs in one of two modes. Direct mode execs the program
//! without a shell and applies the strict pattern set on top of the
//! unconditional one. Shell mode (entered when the command uses `<` or
//! `>` redirection) runs through `/bin/bash -c` and applies only the
//! unconditional set. The subprocess environment is pinned, never
//! inherited, and execution is bounded by a 30-second deadline.

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, LazyLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::policy::PolicyEngine;
use crate::provider::ToolCall;
use crate::store::{now_secs, Artifact, Store, StoreError};

/// Subprocess deadline.
const EXEC_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum digest preview length in characters.
const PREVIEW_LIMIT: usize = 200;

/// Patterns rejected in every mode.
static DANGEROUS_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)\beval\s",
        r"(?i)\bsource\s",
        "`",
        r"\$\(",
        r"(?i)\bcurl\b.*\|\s*sh",
        r"(?i)\bwget\b.*\|\s*sh",
        r"(?i)\b(bash|sh|zsh)\s+-c",
        r"(?i)\bsudo\s",
        r"(?i)\bchmod\s+[0-7]*7",
        r"(?i)/etc/passwd",
        r"(?i)/etc/shadow",
        r"(?i)~/\.ssh",
        r"(?i)\brm\s+-rf\s+/",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static pattern"))
    .collect()
});

/// Stricter superset applied only in direct mode, where shell features
/// have no legitimate use.
static DIRECT_MODE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r";\s*\w",
        r"\|[^|]",
        r"\|\|",
        "&&",
        r"\$\{",
        r"<\(",
        ">>",
        r"(?i)\bexec\s",
        r"(?i)\bnc\s",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static pattern"))
    .collect()
});

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("failed to save artifact: {0}")]
    Persistence(#[from] StoreError),

    #[error("tool already registered: {0}")]
    ToolAlreadyRegistered(String),
}

/// Processed outcome of one tool call, ready for the conversation.
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub name: String,
    /// Short digest substituted into the conversation; the raw output
    /// lives in the artifact store.
    pub digest: String,
    pub is_error: bool,
}

/// Extension point for tools beyond `run_shell`.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn execute(&self, session_id: &str, call: &ToolCall) -> anyhow::Result<String>;
}

/// Raw execution outcome before artifact capture.
struct ExecOutcome {
    output: String,
    error: Option<String>,
}

impl ExecOutcome {
    fn ok(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            error: None,
        }
    }

    fn fail(message: impl Into<String>) -> Self {
        Self {
            output: String::new(),
            error: Some(message.into()),
        }
    }

    fn fail_with_output(message: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            error: Some(message.into()),
        }
    }
}

pub struct ToolProxy {
    store: Arc<Store>,
    policy: Arc<PolicyEngine>,
    handlers: HashMap<String, Box<dyn ToolHandler>>,
    exec_timeout: Duration,
}

impl ToolProxy {
    pub fn new(store: Arc<Store>, policy: Arc<PolicyEngine>) -> Self {
        Self {
            store,
            policy,
            handlers: HashMap::new(),
            exec_timeout: EXEC_TIMEOUT,
        }
    }

    /// Override the subprocess deadline. Intended for tests.
    pub fn with_exec_timeout(mut self, exec_timeout: Duration) -> Self {
        self.exec_timeout = exec_timeout;
        self
    }

    /// Register an additional tool. `run_shell` cannot be replaced.
    pub fn register_tool(
        &mut self,
        name: impl Into<String>,
        handler: Box<dyn ToolHandler>,
    ) -> Result<(), ProxyError> {
        let name = name.into();
        if name == "run_shell" || self.handlers.contains_key(&name) {
            return Err(ProxyError::ToolAlreadyRegistered(name));
        }
        self.handlers.insert(name, handler);
        Ok(())
    }

    /// Execute a batch of tool calls in submission order.
    ///
    /// Per-call failures are folded into the digest with
    /// `is_error=true`; the raw outcome (including rejection messages)
    /// is always persisted as an artifact. Only artifact persistence
    /// failure aborts the batch.
    pub async fn handle_tool_calls(
        &self,
        session_id: &str,
        calls: &[ToolCall],
    ) -> Result<Vec<ToolResult>, ProxyError> {
        let mut results = Vec::with_capacity(calls.len());

        for call in calls {
            let outcome = self.execute(session_id, call).await;

            let (raw_output, is_error) = match outcome.error {
                Some(message) => (
                    format!("Error executing tool: {}\n{}", message, outcome.output),
                    true,
                ),
                None => (outcome.output, false),
            };

            let digest = format!("{:x}", Sha256::digest(raw_output.as_bytes()));
            let nanos = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos();
            let unique = format!("{}-{}", call.id, nanos);
            let artifact_path = format!("artifacts/{}/{}_{}.txt", session_id, call.name, unique);

            let artifact = Artifact {
                id: format!("art-{}-{}", session_id, unique),
                session_id: session_id.to_string(),
                path: artifact_path.clone(),
                kind: "tool_output".to_string(),
                created_at: now_secs(),
                digest,
            };

            self.store
                .save_artifact(&artifact, raw_output.as_bytes())
                .await?;

            results.push(ToolResult {
                tool_call_id: call.id.clone(),
                name: call.name.clone(),
                digest: format!(
                    "Tool {} executed. Output stored at {}. Summary: {}",
                    call.name,
                    artifact_path,
                    preview(&raw_output)
                ),
                is_error,
            });
        }

        Ok(results)
    }

    async fn execute(&self, session_id: &str, call: &ToolCall) -> ExecOutcome {
        match call.name.as_str() {
            "run_shell" => self.run_shell(call).await,
            name => match self.handlers.get(name) {
                Some(handler) => match handler.execute(session_id, call).await {
                    Ok(output) => ExecOutcome::ok(output),
                    Err(e) => ExecOutcome::fail(e.to_string()),
                },
                None => {
                    warn!("Unknown tool requested: {}", name);
                    ExecOutcome::fail_with_output(format!("unknown tool: {name}"), "Unknown tool")
                }
            },
        }
    }

    async fn run_shell(&self, call: &ToolCall) -> ExecOutcome {
        let args: Value = match serde_json::from_str(&call.args) {
            Ok(v) => v,
            Err(e) => return ExecOutcome::fail(format!("invalid args: {e}")),
        };

        let cmd_str = match args.get("cmd") {
            None => return ExecOutcome::fail("missing cmd argument"),
            Some(Value::String(s)) => s.clone(),
            Some(Value::Array(parts)) => parts
                .iter()
                .map(|p| match p {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect::<Vec<_>>()
                .join(" "),
            Some(_) => return ExecOutcome::fail("cmd must be a string or array of strings"),
        };

        // Redirection means the command needs a shell; everything else
        // runs direct-exec, the safer path.
        let needs_shell = cmd_str.contains(['<', '>']);

        for pattern in DANGEROUS_PATTERNS.iter() {
            if pattern.is_match(&cmd_str) {
                return ExecOutcome::fail(format!(
                    "dangerous command pattern blocked: {}",
                    pattern.as_str()
                ));
            }
        }
        if !needs_shell {
            for pattern in DIRECT_MODE_PATTERNS.iter() {
                if pattern.is_match(&cmd_str) {
                    return ExecOutcome::fail(format!(
                        "potentially dangerous command pattern detected: {}",
                        pattern.as_str()
                    ));
                }
            }
        }

        let tokens = match parse_command(&cmd_str) {
            Ok(tokens) => tokens,
            Err(e) => return ExecOutcome::fail(format!("failed to parse command: {e}")),
        };
        let head = &tokens[0];

        if let Some(violation) = self.policy.check_command(head) {
            return ExecOutcome::fail(format!("policy violation: {}", violation.message));
        }

        let work_dir = match args.get("dir").and_then(|v| v.as_str()) {
            Some(dir) => match sanitize_work_dir(dir) {
                Ok(dir) => dir,
                Err(e) => return ExecOutcome::fail(format!("invalid working directory: {e}")),
            },
            None => None,
        };

        debug!(
            command = %cmd_str,
            shell_mode = needs_shell,
            "executing run_shell"
        );

        let mut command = if needs_shell {
            let mut c = tokio::process::Command::new("/bin/bash");
            c.arg("-c").arg(&cmd_str);
            c
        } else {
            let mut c = tokio::process::Command::new(head);
            c.args(&tokens[1..]);
            c
        };

        // Minimum viable environment; nothing inherited.
        command
            .env_clear()
            .env("PATH", "/usr/local/bin:/usr/bin:/bin")
            .env("HOME", home_dir())
            .env("LANG", "en_US.UTF-8")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &work_dir {
            command.current_dir(dir);
        }

        match timeout(self.exec_timeout, command.output()).await {
            Err(_) => {
                ExecOutcome::fail_with_output("command timed out", "[ERROR] Command timed out")
            }
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                ExecOutcome::fail(format!("command not found: {head}"))
            }
            Ok(Err(e)) => ExecOutcome::fail(format!("failed to start command: {e}")),
            Ok(Ok(output)) => {
                let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
                combined.push_str(&String::from_utf8_lossy(&output.stderr));

                if output.status.success() {
                    ExecOutcome::ok(combined)
                } else {
                    // The loop decides what a non-zero exit means.
                    combined.push_str(&format!("\n[ERROR] {}", output.status));
                    ExecOutcome::ok(combined)
                }
            }
        }
    }
}

/// Shell-like tokenizer: single quotes preserve literally, `\` escapes
/// the next character outside single quotes, unquoted spaces separate
/// arguments, empty tokens are dropped.
fn parse_command(cmd: &str) -> Result<Vec<String>, String> {
    let cmd = cmd.trim();
    if cmd.is_empty() {
        return Err("empty command".to_string());
    }

    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_single = false;
    let mut in_double = false;
    let mut escaped = false;

    for c in cmd.chars() {
        if escaped {
            current.push(c);
            escaped = false;
            continue;
        }
        if c == '\\' && !in_single {
            escaped = true;
            continue;
        }
        if c == '\'' && !in_double {
            in_single = !in_single;
            continue;
        }
        if c == '"' && !in_single {
            in_double = !in_double;
            continue;
        }
        if c == ' ' && !in_single && !in_double {
            if !current.is_empty() {
                args.push(std::mem::take(&mut current));
            }
            continue;
        }
        current.push(c);
    }

    if !current.is_empty() {
        args.push(current);
    }

    if in_single || in_double {
        return Err("unclosed quote in command".to_string());
    }
    if args.is_empty() {
        return Err("no command specified".to_string());
    }

    Ok(args)
}

/// Validate and absolutize a caller-supplied working directory.
/// Any `..` component is rejected outright.
fn sanitize_work_dir(dir: &str) -> Result<Option<PathBuf>, String> {
    if dir.is_empty() {
        return Ok(None);
    }

    if Path::new(dir)
        .components()
        .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        return Err("path traversal not allowed in working directory".to_string());
    }

    let path = Path::new(dir);
    let abs = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map_err(|e| format!("invalid directory path: {e}"))?
            .join(path)
    };

    Ok(Some(abs))
}

/// Resolved absolute directory used as the subprocess HOME.
fn home_dir() -> PathBuf {
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/tmp"))
}

/// Truncated preview of raw output for the digest string.
fn preview(raw: &str) -> String {
    if raw.chars().count() <= PREVIEW_LIMIT {
        raw.to_string()
    } else {
        let cut: String = raw.chars().take(PREVIEW_LIMIT - 3).collect();
        format!("{cut}...")
    }
}
