//! Scripted stub adapter.
//!
//! Plays back a fixed queue of responses and returns a constant
//! embedding. Used by the test suite to drive sessions deterministically
//! and by the CLI for offline smoke runs. Thread-safe; records every
//! conversation it receives so tests can assert on context assembly.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{ChatResponse, Message, Provider, ProviderError, Result, ToolCall, Usage};

pub struct StubProvider {
    responses: Mutex<VecDeque<ChatResponse>>,
    conversations: Mutex<Vec<Vec<Message>>>,
    chat_calls: AtomicUsize,
    embedding: Vec<f32>,
    fail_embed: bool,
}

impl StubProvider {
    /// Stub that plays back `responses` in order, then falls back to a
    /// bare "Task complete." response once the script is exhausted.
    pub fn new(responses: Vec<ChatResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            conversations: Mutex::new(Vec::new()),
            chat_calls: AtomicUsize::new(0),
            embedding: vec![0.1, 0.2, 0.3],
            fail_embed: false,
        }
    }

    /// Override the constant embedding vector.
    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = embedding;
        self
    }

    /// Make `embed` fail, for exercising the recoverable-embedding path.
    pub fn with_failing_embed(mut self) -> Self {
        self.fail_embed = true;
        self
    }

    /// Demo script: inspect the workspace, read the task file, declare
    /// completion. Used by the CLI when no real adapter is wired.
    pub fn scripted_demo() -> Self {
        Self::new(vec![
            ChatResponse {
                content: "I'll start by checking the current directory structure.".to_string(),
                tool_calls: vec![],
                usage: usage(100, 25),
            },
            ChatResponse {
                content: "Checking for existing project files...".to_string(),
                tool_calls: vec![ToolCall::new("call_1", "run_shell", r#"{"cmd": "ls -la"}"#)],
                usage: usage(150, 30),
            },
            ChatResponse {
                content: "The workspace looks ready. Verifying the evidence is in place."
                    .to_string(),
                tool_calls: vec![],
                usage: usage(200, 30),
            },
            ChatResponse {
                content: "Task complete.".to_string(),
                tool_calls: vec![],
                usage: usage(250, 10),
            },
        ])
    }

    /// Number of chat calls made so far.
    pub fn chat_call_count(&self) -> usize {
        self.chat_calls.load(Ordering::SeqCst)
    }

    /// Copies of every conversation passed to `chat`, in call order.
    pub fn conversations(&self) -> Vec<Vec<Message>> {
        self.conversations.lock().unwrap().clone()
    }
}

fn usage(prompt: usize, completion: usize) -> Usage {
    Usage {
        prompt_tokens: prompt,
        completion_tokens: completion,
        total_tokens: prompt + completion,
    }
}

#[async_trait]
impl Provider for StubProvider {
    fn name(&self) -> &str {
        "stub"
    }

    async fn chat(&self, messages: &[Message]) -> Result<ChatResponse> {
        self.chat_calls.fetch_add(1, Ordering::SeqCst);
        self.conversations.lock().unwrap().push(messages.to_vec());

        let mut responses = self.responses.lock().unwrap();
        Ok(responses.pop_front().unwrap_or(ChatResponse {
            content: "Task complete.".to_string(),
            tool_calls: vec![],
            usage: Usage::default(),
        }))
    }

    async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        if self.fail_embed {
            return Err(ProviderError::Unsupported(
                "embedding not available".to_string(),
            ));
        }
        Ok(self.embedding.clone())
    }
}
