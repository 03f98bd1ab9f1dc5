//! Error and diagnostic types.
//!
//! Only conditions that leave no timeline to return are errors. Everything
//! that degrades a single event is a [`Diagnostic`] attached to the run.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Failures that abort a whole run.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SynthesisError {
    #[error("No life events could be extracted: {reason}")]
    ExtractionFailure { reason: String },

    #[error("Timeline graph invariant violated: {reason}")]
    GraphConstructionInvariantViolation { reason: String },

    #[error("Invalid request: {reason}")]
    InvalidInput { reason: String },

    #[error("Run cancelled")]
    Cancelled,
}

impl SynthesisError {
    pub(crate) fn extraction(reason: impl Into<String>) -> Self {
        SynthesisError::ExtractionFailure {
            reason: reason.into(),
        }
    }

    pub(crate) fn invariant(reason: impl Into<String>) -> Self {
        SynthesisError::GraphConstructionInvariantViolation {
            reason: reason.into(),
        }
    }
}

/// Failure of a single call to the text-generation service.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("Claude API error: {0}")]
    Client(#[from] claude::Error),

    #[error("Call timed out after {duration:?}")]
    Timeout { duration: Duration },

    #[error("Malformed model answer: {0}")]
    Malformed(String),

    #[error("Call cancelled")]
    Cancelled,
}

impl GenerationError {
    /// Whether another attempt at the same call might succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            GenerationError::Client(e) => e.is_retryable(),
            GenerationError::Timeout { .. } | GenerationError::Malformed(_) => true,
            GenerationError::Cancelled => false,
        }
    }
}

/// Failures of the durable cache tier.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// The kind of a non-fatal degradation recorded during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    /// A temporal reference could not be pinned down; precision downgraded.
    DateResolutionAmbiguous,
    /// No label was produced; the truncated source span was used instead.
    LabelGenerationFailure,
    /// No branch signal was produced; the event stays on the main line.
    BranchClassificationFailure,
    /// A structurally malformed event was dropped.
    ValidationInconsistency,
    /// The cache could not be used; the run went ahead without it.
    CacheUnavailable,
    /// An external call gave up and the stage used its local heuristic.
    StageFallback,
}

/// A recorded, non-fatal degradation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    /// Mention order of the affected event, if the diagnostic is per event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_index: Option<usize>,
    pub message: String,
}

impl Diagnostic {
    pub fn new(kind: DiagnosticKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            event_index: None,
            message: message.into(),
        }
    }

    pub fn for_event(kind: DiagnosticKind, event_index: usize, message: impl Into<String>) -> Self {
        Self {
            kind,
            event_index: Some(event_index),
            message: message.into(),
        }
    }
}

/// Result type for whole-run operations.
pub type SynthesisResult<T> = std::result::Result<T, SynthesisError>;
