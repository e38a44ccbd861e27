//! Session execution loop.
//!
//! Drives a single session from `initialized` to a terminal state. Each
//! iteration: pre-flight policy check, optional context rollup, one
//! model call, token accounting, tool batch, completion heuristic, and
//! evidence verification. The model only ever suggests completion; the
//! filesystem evidence check is the real gate. All stop, budget, and
//! scope decisions are made by rule, never by the model.

use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::policy::PolicyEngine;
use crate::provider::{Message, Provider, ProviderError};
use crate::proxy::ToolProxy;
use crate::spec::TaskSpec;
use crate::store::{SessionStatus, Store};

pub mod events;

pub use events::{EventBus, EventKind, RuntimeEvent};

/// Rollup triggers: conversation length or cumulative prompt tokens.
const ROLLUP_TURN_THRESHOLD: usize = 20;
const ROLLUP_PROMPT_TOKEN_THRESHOLD: usize = 3000;

/// How many prior summaries to pull into the initial context.
const MEMORY_RETRIEVAL_LIMIT: usize = 3;

/// Orchestrates the execution loop over store, policy, provider, and
/// tool proxy.
pub struct SessionRuntime {
    store: Arc<Store>,
    policy: Arc<PolicyEngine>,
    provider: Arc<dyn Provider>,
    proxy: ToolProxy,
    events: EventBus,
}

impl SessionRuntime {
    pub fn new(
        store: Arc<Store>,
        policy: Arc<PolicyEngine>,
        provider: Arc<dyn Provider>,
        proxy: ToolProxy,
    ) -> Self {
        Self {
            store,
            policy,
            provider,
            proxy,
            events: EventBus::new(),
        }
    }

    /// Event bus for loop observability.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Run the main loop for a persisted session until it reaches a
    /// terminal state.
    ///
    /// The session's metadata must carry a `spec` entry naming the task
    /// spec file. Spec validation failure is fatal before any model
    /// call.
    pub async fn execute_session(&self, session_id: &str) -> Result<()> {
        let mut session = self
            .store
            .get_session(session_id)
            .await
            .context("failed to load session")?;

        if session.status.is_terminal() {
            bail!(
                "session {} already finished with status {}",
                session_id,
                session.status.as_str()
            );
        }

        let spec_path = session
            .metadata
            .get("spec")
            .with_context(|| format!("session {session_id} has no spec in metadata"))?;
        let spec = TaskSpec::load(Path::new(spec_path))
            .with_context(|| format!("failed to load spec from {spec_path}"))?;

        let validation = spec.validate();
        for warning in &validation.warnings {
            warn!(session_id, warning = %warning, "spec warning");
        }
        if !validation.valid {
            bail!("invalid spec: {}", validation.errors.join(", "));
        }

        info!(session_id, goal = %spec.goal, provider = self.provider.name(), "starting session execution");

        let mut iteration: usize = 0;
        let mut total_prompt_tokens: usize = 0;
        let mut total_output_tokens: usize = 0;

        let memory_block = self.retrieve_memory_context(&spec).await;
        let mut history = vec![Message::user(seed_content(&spec, &memory_block))];

        loop {
            iteration += 1;
            self.events.publish(EventKind::IterationStart, session_id);

            // Pre-flight budget check with the incremented counter.
            if let Some(violation) =
                self.policy
                    .check_budget(iteration, total_prompt_tokens, total_output_tokens)
            {
                warn!(session_id, rule = violation.rule, "policy violation, stopping");
                self.events.publish_with_data(
                    EventKind::PolicyViolation,
                    session_id,
                    Some(serde_json::json!({"rule": violation.rule})),
                );
                session.status = SessionStatus::Halted;
                if let Err(e) = self.store.update_session(&session).await {
                    warn!(session_id, error = %e, "failed to persist halted session");
                }
                bail!("policy violation: {}", violation.message);
            }

            // Context rollup once the transcript grows too large.
            if history.len() > ROLLUP_TURN_THRESHOLD
                || total_prompt_tokens > ROLLUP_PROMPT_TOKEN_THRESHOLD
            {
                info!(session_id, turns = history.len(), "context limit approaching, summarizing history");
                match self.summarize_history(&history).await {
                    Err(e) => {
                        error!(session_id, error = %e, "failed to summarize, continuing without pruning");
                    }
                    Ok(summary) => {
                        history = vec![Message::user(rollup_content(&spec, &summary))];
                        self.events.publish(EventKind::ContextPruned, session_id);
                    }
                }
            }

            self.events.publish(EventKind::ProviderRequest, session_id);
            let resp = match self.provider.chat(&history).await {
                Ok(resp) => resp,
                Err(e) => {
                    error!(session_id, error = %e, "provider call failed");
                    self.events.publish(EventKind::SessionError, session_id);
                    session.status = SessionStatus::Failed;
                    if let Err(pe) = self.store.update_session(&session).await {
                        warn!(session_id, error = %pe, "failed to persist failed session");
                    }
                    return Err(e).context("provider call failed");
                }
            };
            self.events.publish_with_data(
                EventKind::ProviderResponse,
                session_id,
                Some(serde_json::json!({"total_tokens": resp.usage.total_tokens})),
            );

            total_prompt_tokens += resp.usage.prompt_tokens;
            total_output_tokens += resp.usage.completion_tokens;

            if !resp.content.is_empty() {
                debug!(session_id, iteration, agent = %preview(&resp.content, 70), "assistant turn");
            }

            let tool_calls = resp.tool_calls.clone();
            history.push(Message::assistant_with_tools(resp.content.clone(), tool_calls));

            if !resp.tool_calls.is_empty() {
                let names: Vec<&str> = resp.tool_calls.iter().map(|c| c.name.as_str()).collect();
                info!(session_id, tools = ?names, "executing tool batch");
                self.events.publish(EventKind::ToolCallStart, session_id);

                let results = match self
                    .proxy
                    .handle_tool_calls(session_id, &resp.tool_calls)
                    .await
                {
                    Ok(results) => results,
                    Err(e) => {
                        error!(session_id, error = %e, "tool proxy failed");
                        self.events.publish(EventKind::SessionError, session_id);
                        session.status = SessionStatus::Failed;
                        if let Err(pe) = self.store.update_session(&session).await {
                            warn!(session_id, error = %pe, "failed to persist failed session");
                        }
                        return Err(e).context("tool proxy failed");
                    }
                };

                // Every call must gain exactly one tool turn with a
                // matching id before the next provider request.
                if results.len() != resp.tool_calls.len() {
                    bail!(
                        "tool batch returned {} results for {} calls",
                        results.len(),
                        resp.tool_calls.len()
                    );
                }
                for (call, result) in resp.tool_calls.iter().zip(results.iter()) {
                    if call.id != result.tool_call_id {
                        bail!(
                            "tool result id {} does not match call id {}",
                            result.tool_call_id,
                            call.id
                        );
                    }
                    debug!(session_id, tool = %result.name, error = result.is_error, digest = %preview(&result.digest, 50), "tool result");
                    history.push(Message::tool_result(
                        result.digest.clone(),
                        result.tool_call_id.clone(),
                    ));
                }
                self.events.publish(EventKind::ToolCallEnd, session_id);
            }

            if completion_hinted(&resp.content) {
                info!(session_id, "completion suggested, verifying evidence");

                match verify_evidence(&spec) {
                    Err(detail) => {
                        warn!(session_id, detail = %detail, "verification failed");
                        self.events.publish_with_data(
                            EventKind::VerificationFail,
                            session_id,
                            Some(serde_json::json!({"detail": detail})),
                        );
                        history.push(Message::user(format!(
                            "Verification failed: {detail}. Please correct and ensure the Evidence is present."
                        )));
                        session.status = SessionStatus::Running;
                    }
                    Ok(()) => {
                        info!(session_id, "verification successful");
                        self.events.publish(EventKind::VerificationPass, session_id);

                        // Archive before the status flip so a reader of
                        // the store never sees a completed session whose
                        // memory has not been archived yet.
                        self.archive_memory(session_id, &spec, &history).await;

                        session.status = SessionStatus::Completed;
                        self.store
                            .update_session(&session)
                            .await
                            .context("failed to persist completed session")?;
                        self.events.publish(EventKind::SessionComplete, session_id);
                        break;
                    }
                }
            } else {
                session.status = SessionStatus::Running;
            }

            self.store
                .update_session(&session)
                .await
                .context("failed to persist session")?;
            self.events.publish(EventKind::IterationEnd, session_id);
        }

        Ok(())
    }

    /// Look up prior-session summaries near the goal embedding.
    ///
    /// Embedding or search failure is recoverable: the session proceeds
    /// with an empty memory block.
    async fn retrieve_memory_context(&self, spec: &TaskSpec) -> String {
        let vector = match self.provider.embed(&spec.goal).await {
            Ok(vector) => vector,
            Err(e) => {
                warn!(error = %e, "failed to embed goal for context retrieval");
                return String::new();
            }
        };

        match self.store.search_memory(&vector, MEMORY_RETRIEVAL_LIMIT).await {
            Ok(memories) if !memories.is_empty() => {
                info!(count = memories.len(), "retrieved relevant memories");
                let mut block = String::from("Relevant past experiences:\n");
                for memory in &memories {
                    block.push_str(&format!("- {}\n", memory.content));
                }
                block
            }
            Ok(_) => String::new(),
            Err(e) => {
                warn!(error = %e, "memory search failed");
                String::new()
            }
        }
    }

    async fn summarize_history(&self, history: &[Message]) -> Result<String, ProviderError> {
        let mut request = history.to_vec();
        request.push(Message::user(
            "Summarize the actions taken so far, the current state of the system, and what remains to be done. Be concise.",
        ));

        let resp = self.provider.chat(&request).await?;
        Ok(resp.content)
    }

    /// Ask for a one-sentence summary and persist it with the goal
    /// embedding. Failures here never fail the session.
    async fn archive_memory(&self, session_id: &str, spec: &TaskSpec, history: &[Message]) {
        let mut request = history.to_vec();
        request.push(Message::user(
            "The task is complete. Provide a 1-sentence summary of what was built and key lessons learned for future reference.",
        ));

        let summary = match self.provider.chat(&request).await {
            Ok(resp) => resp.content,
            Err(e) => {
                warn!(session_id, error = %e, "failed to summarize for memory archive");
                return;
            }
        };

        let vector = match self.provider.embed(&spec.goal).await {
            Ok(vector) => vector,
            Err(e) => {
                warn!(session_id, error = %e, "failed to embed goal for memory archive");
                return;
            }
        };

        let mut metadata = HashMap::new();
        metadata.insert("session_id".to_string(), session_id.to_string());
        metadata.insert("goal".to_string(), spec.goal.clone());

        match self.store.add_memory(&summary, &vector, metadata).await {
            Ok(()) => {
                info!(session_id, "archived session memory");
                self.events.publish(EventKind::MemoryArchived, session_id);
            }
            Err(e) => warn!(session_id, error = %e, "failed to archive memory"),
        }
    }
}

/// Initial user turn seeding the conversation.
fn seed_content(spec: &TaskSpec, memory_block: &str) -> String {
    format!(
        "Goal: {}\nDoD: {}\nConstraints: {:?}\n\n{}\nPlease execute.",
        spec.goal, spec.definition_of_done, spec.constraints, memory_block
    )
}

/// Synthetic user turn replacing the transcript after a rollup.
fn rollup_content(spec: &TaskSpec, summary: &str) -> String {
    format!(
        "Goal: {}\nDoD: {}\nConstraints: {:?}\n\nProgress Summary: {}\n\nPlease continue execution.",
        spec.goal, spec.definition_of_done, spec.constraints, summary
    )
}

/// Loose completion heuristic over assistant text. Intentionally loose:
/// evidence verification is the real gate.
fn completion_hinted(content: &str) -> bool {
    if content.is_empty() {
        return false;
    }
    let lower = content.to_lowercase();
    lower.contains("task complete") || lower.contains("i have finished") || lower.contains("done")
}

/// Check every evidence path exists, relative to the process working
/// directory. Returns the first missing path as the failure detail.
fn verify_evidence(spec: &TaskSpec) -> Result<(), String> {
    for evidence in &spec.evidence {
        if !Path::new(evidence).exists() {
            return Err(format!("missing evidence: {evidence}"));
        }
    }
    Ok(())
}

/// One-line preview for logs: newlines collapsed, truncated with "...".
fn preview(s: &str, max_len: usize) -> String {
    let flat = s.replace(['\n', '\r'], " ");
    if flat.chars().count() <= max_len {
        return flat;
    }
    let cut: String = flat.chars().take(max_len.saturating_sub(3)).collect();
    format!("{cut}...")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completion_hints() {
        assert!(completion_hinted("Task complete."));
        assert!(completion_hinted("I HAVE FINISHED everything"));
        assert!(completion_hinted("All done here"));
        assert!(!completion_hinted("Still working on it"));
        assert!(!completion_hinted(""));
    }

    #[test]
    fn test_verify_evidence_missing() {
        let spec = TaskSpec {
            evidence: vec!["definitely/not/a/real/path.txt".to_string()],
            ..Default::default()
        };
        let err = verify_evidence(&spec).unwrap_err();
        assert!(err.contains("missing evidence"));
        assert!(err.contains("definitely/not/a/real/path.txt"));
    }

    #[test]
    fn test_verify_evidence_present() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let spec = TaskSpec {
            evidence: vec![file.path().to_string_lossy().into_owned()],
            ..Default::default()
        };
        assert!(verify_evidence(&spec).is_ok());
    }

    #[test]
    fn test_seed_content_shape() {
        let spec = TaskSpec {
            goal: "Build it".to_string(),
            definition_of_done: "It works".to_string(),
            constraints: vec!["no network".to_string()],
            evidence: vec!["out.txt".to_string()],
        };

        let seeded = seed_content(&spec, "Relevant past experiences:\n- use make\n");
        assert!(seeded.starts_with("Goal: Build it"));
        assert!(seeded.contains("DoD: It works"));
        assert!(seeded.contains("no network"));
        assert!(seeded.contains("Relevant past experiences:"));
        assert!(seeded.ends_with("Please execute."));
    }

    #[test]
    fn test_rollup_content_shape() {
        let spec = TaskSpec {
            goal: "Build it".to_string(),
            definition_of_done: "It works".to_string(),
            ..Default::default()
        };

        let rolled = rollup_content(&spec, "half way there");
        assert!(rolled.contains("Progress Summary: half way there"));
        assert!(rolled.ends_with("Please continue execution."));
    }

    #[test]
    fn test_preview_collapses_and_truncates() {
        assert_eq!(preview("a\nb\rc", 70), "a b c");
        let long = "word ".repeat(40);
        let p = preview(&long, 20);
        assert_eq!(p.chars().count(), 20);
        assert!(p.ends_with("..."));
    }
}
