//! The annotation agents.
//!
//! Each agent handles one concern with focused context:
//! - EventExtractor: cuts the narrative into candidate events
//! - DateResolver: pins each event to a calendar date
//! - CommitMessageGenerator: writes a commit subject and body
//! - BranchClassifier: flags major life changes
//!
//! The last three share one contract, [`Annotator`]: consume the whole event
//! list plus document context and produce one optional annotation per event.
//! Every annotator has a deterministic heuristic and may also be backed by a
//! text-generation model; when the model gives up, the heuristic answers.

pub mod branches;
pub mod dates;
pub mod extractor;
pub mod labels;

pub use branches::BranchClassifier;
pub use dates::DateResolver;
pub use extractor::EventExtractor;
pub use labels::CommitMessageGenerator;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::cancel::CancelToken;
use crate::config::SynthesisConfig;
use crate::error::{Diagnostic, DiagnosticKind, GenerationError, SynthesisError};
use crate::generator::{GenerationPrompt, ModelCaller};
use crate::model::{RawEvent, TemporalAnchor};

/// Which agent is speaking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Extractor,
    DateResolver,
    CommitMessageGenerator,
    BranchClassifier,
}

/// How an agent produces its answers.
#[derive(Clone)]
pub enum AgentBackend {
    /// Local rules only, no external calls.
    Heuristic,
    /// Ask a text-generation model, falling back to the heuristic.
    Model(ModelCaller),
}

impl AgentBackend {
    pub fn describe(&self) -> String {
        match self {
            AgentBackend::Heuristic => "heuristic".to_string(),
            AgentBackend::Model(caller) => format!("model:{}", caller.generator_name()),
        }
    }
}

/// Document-level context shared by every agent in one run.
pub struct StageContext<'a> {
    /// The full (normalised) narrative.
    pub text: &'a str,
    pub anchor: Option<&'a TemporalAnchor>,
    pub config: &'a SynthesisConfig,
    pub cancel: &'a CancelToken,
}

impl StageContext<'_> {
    pub(crate) fn prompt(&self, role: AgentRole, system: &str, user: String) -> GenerationPrompt {
        GenerationPrompt {
            role,
            system: system.to_string(),
            user,
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
        }
    }
}

/// Per-event output of one annotator, aligned with the event list by index.
#[derive(Debug, Clone, PartialEq)]
pub struct Annotations<T> {
    pub items: Vec<Option<T>>,
    pub diagnostics: Vec<Diagnostic>,
}

impl<T> Annotations<T> {
    pub fn new(items: Vec<Option<T>>) -> Self {
        Self {
            items,
            diagnostics: Vec::new(),
        }
    }

    /// An empty slot for each of `len` events.
    pub fn empty(len: usize) -> Self {
        Self::new((0..len).map(|_| None).collect())
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.items.get(index).and_then(Option::as_ref)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Store `value` at `index` if it is in range and not yet filled.
    pub(crate) fn fill(&mut self, index: usize, value: T) -> bool {
        match self.items.get_mut(index) {
            Some(slot @ None) => {
                *slot = Some(value);
                true
            }
            _ => false,
        }
    }
}

/// The uniform contract of the per-event annotators.
#[async_trait]
pub trait Annotator: Send + Sync {
    type Output: Send + 'static;

    fn role(&self) -> AgentRole;

    fn backend(&self) -> &AgentBackend;

    /// The declared local fallback. Deterministic, never calls out.
    fn heuristic(&self, events: &[RawEvent], ctx: &StageContext<'_>) -> Annotations<Self::Output>;

    /// Ask the model. Per-event gaps in its answer stay `None`.
    async fn ask_model(
        &self,
        caller: &ModelCaller,
        events: &[RawEvent],
        ctx: &StageContext<'_>,
    ) -> Result<Annotations<Self::Output>, GenerationError>;

    /// Annotate every event with the configured backend.
    ///
    /// Only cancellation is an error; a failing model degrades to the
    /// heuristic with a [`DiagnosticKind::StageFallback`] diagnostic.
    async fn annotate(
        &self,
        events: &[RawEvent],
        ctx: &StageContext<'_>,
    ) -> Result<Annotations<Self::Output>, SynthesisError> {
        if events.is_empty() {
            return Ok(Annotations::empty(0));
        }

        let caller = match self.backend() {
            AgentBackend::Heuristic => return Ok(self.heuristic(events, ctx)),
            AgentBackend::Model(caller) => caller,
        };

        match self.ask_model(caller, events, ctx).await {
            Ok(annotations) => Ok(annotations),
            Err(GenerationError::Cancelled) => Err(SynthesisError::Cancelled),
            Err(e) => {
                warn!(role = ?self.role(), error = %e, "Model gave up, using local heuristic");
                let mut annotations = self.heuristic(events, ctx);
                annotations.diagnostics.push(Diagnostic::new(
                    DiagnosticKind::StageFallback,
                    format!("{:?} fell back to heuristics: {e}", self.role()),
                ));
                Ok(annotations)
            }
        }
    }
}

/// Render the event list the way every annotator prompt presents it.
pub(crate) fn events_for_prompt(events: &[RawEvent]) -> String {
    let listed: Vec<serde_json::Value> = events
        .iter()
        .enumerate()
        .map(|(index, event)| {
            serde_json::json!({
                "index": index,
                "event": event.source_span,
                "time_reference": event.raw_temporal_reference,
            })
        })
        .collect();
    serde_json::to_string_pretty(&listed).unwrap_or_else(|_| "[]".to_string())
}
