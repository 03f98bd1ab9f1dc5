//! The text-generation collaborator and the call discipline around it.
//!
//! Agents never talk to the service directly. They go through a
//! [`ModelCaller`], which bounds concurrency with a shared pool of permits,
//! applies a timeout per attempt, retries transient failures with
//! exponential backoff, and gives up promptly on cancellation.

use crate::agents::AgentRole;
use crate::cancel::CancelToken;
use crate::config::RetryPolicy;
use crate::error::GenerationError;
use async_trait::async_trait;
use claude::{Claude, Message, Request};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// One prompt for the text-generation service.
#[derive(Debug, Clone)]
pub struct GenerationPrompt {
    /// Which agent is asking. Lets test doubles script replies per role.
    pub role: AgentRole,
    pub system: String,
    pub user: String,
    pub max_tokens: usize,
    pub temperature: Option<f32>,
}

/// An opaque text-generation or reasoning service.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Produce a completion for the prompt.
    async fn generate(&self, prompt: &GenerationPrompt) -> Result<String, GenerationError>;

    /// Name for logs.
    fn name(&self) -> &str;
}

/// [`TextGenerator`] backed by the Claude Messages API.
pub struct ClaudeGenerator {
    client: Claude,
    model: Option<String>,
}

impl ClaudeGenerator {
    pub fn new(client: Claude) -> Self {
        Self {
            client,
            model: None,
        }
    }

    /// Create from environment (ANTHROPIC_API_KEY).
    pub fn from_env() -> Result<Self, claude::Error> {
        Ok(Self::new(Claude::from_env()?))
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

#[async_trait]
impl TextGenerator for ClaudeGenerator {
    async fn generate(&self, prompt: &GenerationPrompt) -> Result<String, GenerationError> {
        let mut request = Request::new(vec![Message::user(&prompt.user)])
            .with_system(&prompt.system)
            .with_max_tokens(prompt.max_tokens);

        if let Some(ref model) = self.model {
            request = request.with_model(model);
        }
        if let Some(temperature) = prompt.temperature {
            request = request.with_temperature(temperature);
        }

        let response = self.client.complete(request).await?;
        Ok(response.text())
    }

    fn name(&self) -> &str {
        "claude"
    }
}

/// Runs prompts against a [`TextGenerator`] under the retry policy and the
/// shared worker pool.
#[derive(Clone)]
pub struct ModelCaller {
    generator: Arc<dyn TextGenerator>,
    policy: RetryPolicy,
    permits: Arc<Semaphore>,
}

impl ModelCaller {
    pub fn new(generator: Arc<dyn TextGenerator>, policy: RetryPolicy, permits: Arc<Semaphore>) -> Self {
        Self {
            generator,
            policy,
            permits,
        }
    }

    pub fn generator_name(&self) -> &str {
        self.generator.name()
    }

    /// Send a prompt, retrying transient failures.
    pub async fn call(
        &self,
        prompt: &GenerationPrompt,
        cancel: &CancelToken,
    ) -> Result<String, GenerationError> {
        let mut retry = 0;
        loop {
            match self.attempt(prompt, cancel).await {
                Ok(text) => return Ok(text),
                Err(e) if e.is_retryable() && retry < self.policy.max_retries => {
                    retry += 1;
                    let backoff = self.policy.backoff_for(retry);
                    warn!(
                        role = ?prompt.role,
                        attempt = retry,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Model call failed, retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(GenerationError::Cancelled),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Send a prompt and parse its answer as JSON, retrying malformed answers
    /// like any other transient failure.
    pub async fn call_json<T: DeserializeOwned>(
        &self,
        prompt: &GenerationPrompt,
        cancel: &CancelToken,
    ) -> Result<T, GenerationError> {
        let mut retry = 0;
        loop {
            let text = self.call(prompt, cancel).await?;
            match parse_json_answer(&text) {
                Ok(value) => return Ok(value),
                Err(e) if retry < self.policy.max_retries => {
                    retry += 1;
                    warn!(role = ?prompt.role, attempt = retry, error = %e, "Unparseable model answer, asking again");
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn attempt(
        &self,
        prompt: &GenerationPrompt,
        cancel: &CancelToken,
    ) -> Result<String, GenerationError> {
        let _permit = tokio::select! {
            _ = cancel.cancelled() => return Err(GenerationError::Cancelled),
            permit = self.permits.acquire() => permit.map_err(|_| GenerationError::Cancelled)?,
        };

        debug!(role = ?prompt.role, generator = self.generator.name(), "Calling model");
        let timeout = self.policy.call_timeout;
        tokio::select! {
            _ = cancel.cancelled() => Err(GenerationError::Cancelled),
            result = tokio::time::timeout(timeout, self.generator.generate(prompt)) => {
                result.unwrap_or(Err(GenerationError::Timeout { duration: timeout }))
            }
        }
    }
}

/// Parse a JSON answer that may be wrapped in markdown or prose.
pub fn parse_json_answer<T: DeserializeOwned>(text: &str) -> Result<T, GenerationError> {
    let json_str = extract_json(text);
    serde_json::from_str(json_str).map_err(|e| GenerationError::Malformed(format!("{e}: {json_str}")))
}

/// Extract JSON from a response that might have markdown code blocks or
/// surrounding explanation.
pub fn extract_json(text: &str) -> &str {
    let text = text.trim();

    // Handle ```json ... ``` blocks
    if let Some(start) = text.find("```json") {
        let content_start = start + 7;
        if let Some(end) = text[content_start..].find("```") {
            return text[content_start..content_start + end].trim();
        }
    }

    // Handle ``` ... ``` blocks (without json specifier)
    if let Some(start) = text.find("```") {
        let content_start = start + 3;
        if let Some(end) = text[content_start..].find("```") {
            return text[content_start..content_start + end].trim();
        }
    }

    // Prose around a bare value: keep the outermost array or object.
    let open = text.find(['[', '{']);
    if let Some(open) = open {
        let close_char = if text[open..].starts_with('[') { ']' } else { '}' };
        if let Some(close) = text.rfind(close_char) {
            if close > open {
                return &text[open..=close];
            }
        }
    }

    text
}
