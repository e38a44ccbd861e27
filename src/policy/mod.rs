//! Policy record and pure enforcement checks.
//!
//! A `Policy` is a declarative record of budgets and scopes attached to a
//! session for its whole lifetime. The engine is a set of pure,
//! synchronous functions over that record; violations are returned as
//! values, never raised. A fatal violation obliges the caller to halt
//! the session.

use glob::Pattern;
use serde::{Deserialize, Serialize};

/// Limits and scopes for one execution session. Immutable once attached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    pub max_iterations: usize,
    pub max_prompt_tokens: usize,
    pub max_output_tokens: usize,

    /// Allowed command heads. `*` permits any command; an entry also
    /// matches as a prefix of the head.
    pub allowed_commands: Vec<String>,

    /// Globstar patterns (`**` crosses path segments) for file access.
    pub allowed_file_globs: Vec<String>,

    pub block_dangerous_commands: bool,
}

impl Default for Policy {
    /// Safe defaults for local development tasks.
    fn default() -> Self {
        Self {
            max_iterations: 20,
            max_prompt_tokens: 8000,
            max_output_tokens: 4000,
            allowed_commands: ["ls", "cat", "grep", "git", "go", "mkdir", "echo"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            allowed_file_globs: vec!["*".to_string()],
            block_dangerous_commands: true,
        }
    }
}

/// A specific breach of policy. `fatal` violations halt the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub rule: &'static str,
    pub message: String,
    pub fatal: bool,
}

/// Pure enforcement engine over a `Policy`. No I/O, no session state.
#[derive(Debug, Clone)]
pub struct PolicyEngine {
    policy: Policy,
}

impl PolicyEngine {
    pub fn new(policy: Policy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Check cumulative usage against the budget.
    ///
    /// The caller increments the iteration counter first and checks
    /// after; a violation is returned when any value strictly exceeds
    /// its limit.
    pub fn check_budget(
        &self,
        iterations: usize,
        prompt_tokens: usize,
        output_tokens: usize,
    ) -> Option<Violation> {
        if iterations > self.policy.max_iterations {
            return Some(Violation {
                rule: "max_iterations",
                message: "Iteration limit exceeded".to_string(),
                fatal: true,
            });
        }
        if prompt_tokens > self.policy.max_prompt_tokens {
            return Some(Violation {
                rule: "max_prompt_tokens",
                message: "Prompt token budget exceeded".to_string(),
                fatal: true,
            });
        }
        if output_tokens > self.policy.max_output_tokens {
            return Some(Violation {
                rule: "max_output_tokens",
                message: "Output token budget exceeded".to_string(),
                fatal: true,
            });
        }
        None
    }

    /// Check a command head (the first shell token) against the
    /// allowlist.
    ///
    /// An entry allows the head when it is `*`, equals the head, or is a
    /// prefix of it. Prefix matching means `go` authorizes `go-anything`
    /// as well as `go`; list longer entries if that is too broad.
    pub fn check_command(&self, command: &str) -> Option<Violation> {
        let allowed = self
            .policy
            .allowed_commands
            .iter()
            .any(|allow| allow == "*" || allow == command || command.starts_with(allow.as_str()));

        if allowed {
            None
        } else {
            Some(Violation {
                rule: "allowed_commands",
                message: format!("Command not allowed: {command}"),
                fatal: true,
            })
        }
    }

    /// Check a file path against the allowed globs.
    ///
    /// Patterns use globstar semantics: `**` matches across path
    /// segments. Invalid patterns are skipped rather than matched.
    pub fn check_file(&self, path: &str) -> Option<Violation> {
        let allowed = self
            .policy
            .allowed_file_globs
            .iter()
            .filter_map(|p| Pattern::new(p).ok())
            .any(|pattern| pattern.matches(path));

        if allowed {
            None
        } else {
            Some(Violation {
                rule: "allowed_file_globs",
                message: format!("File access not allowed: {path}"),
                fatal: true,
            })
        }
    }
}
