//! A scripted [`TextGenerator`] for tests.
//!
//! Replies are queued per agent role. The last queued reply repeats, so one
//! scripted answer serves any number of identical calls.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::agents::AgentRole;
use crate::error::GenerationError;
use crate::generator::{GenerationPrompt, TextGenerator};

#[derive(Debug, Default)]
struct RoleScript {
    failures: usize,
    stall: Option<Duration>,
    replies: VecDeque<String>,
    calls: usize,
    prompts: Vec<String>,
}

/// Answers prompts from a per-role script and counts the calls.
#[derive(Debug, Default)]
pub struct ScriptedGenerator {
    scripts: Mutex<HashMap<AgentRole, RoleScript>>,
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    fn script(&mut self, role: AgentRole) -> &mut RoleScript {
        self.scripts
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(role)
            .or_default()
    }

    /// Queue a reply for `role`.
    pub fn reply(mut self, role: AgentRole, text: impl Into<String>) -> Self {
        self.script(role).replies.push_back(text.into());
        self
    }

    /// Fail the next `n` calls for `role` with a retryable error.
    pub fn fail_next(mut self, role: AgentRole, n: usize) -> Self {
        self.script(role).failures += n;
        self
    }

    /// Sleep before answering every call for `role`.
    pub fn stall(mut self, role: AgentRole, duration: Duration) -> Self {
        self.script(role).stall = Some(duration);
        self
    }

    /// Calls received for `role` so far.
    pub fn calls(&self, role: AgentRole) -> usize {
        self.lock().get(&role).map_or(0, |s| s.calls)
    }

    /// User prompts received for `role`, in order.
    pub fn prompts(&self, role: AgentRole) -> Vec<String> {
        self.lock()
            .get(&role)
            .map(|s| s.prompts.clone())
            .unwrap_or_default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<AgentRole, RoleScript>> {
        self.scripts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl TextGenerator for ScriptedGenerator {
    async fn generate(&self, prompt: &GenerationPrompt) -> Result<String, GenerationError> {
        let (stall, outcome) = {
            let mut scripts = self.lock();
            let script = scripts.entry(prompt.role).or_default();
            script.calls += 1;
            script.prompts.push(prompt.user.clone());

            let outcome = if script.failures > 0 {
                script.failures -= 1;
                Err(GenerationError::Client(claude::Error::Api {
                    status: 529,
                    message: "overloaded".to_string(),
                }))
            } else if script.replies.len() > 1 {
                Ok(script.replies.pop_front().unwrap_or_default())
            } else if let Some(last) = script.replies.front() {
                Ok(last.clone())
            } else {
                Err(GenerationError::Client(claude::Error::Api {
                    status: 400,
                    message: format!("no scripted reply for {:?}", prompt.role),
                }))
            };
            (script.stall, outcome)
        };

        if let Some(stall) = stall {
            tokio::time::sleep(stall).await;
        }
        outcome
    }

    fn name(&self) -> &str {
        "scripted"
    }
}
