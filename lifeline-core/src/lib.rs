//! Life narratives to dated, branching timelines.
//!
//! This crate provides:
//! - Event extraction, date resolution, commit messages and branch
//!   classification, each with a local heuristic and an optional model backend
//! - Validation with graceful degradation and recorded diagnostics
//! - A git-like timeline graph with a main line and thematic branches
//! - A content-addressed cache with single-flight coalescing
//!
//! # Quick Start
//!
//! ```ignore
//! use lifeline_core::{SynthesisConfig, Synthesizer, TimelineRequest};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let synthesizer = Synthesizer::from_env(SynthesisConfig::from_env()).await;
//!
//!     let report = synthesizer
//!         .synthesize(TimelineRequest::new(
//!             "In 2021 I adopted a cat named Miso. I quit my job to start a company in 2022.",
//!         ))
//!         .await?;
//!
//!     for commit in report.commit_descriptors() {
//!         println!("{} [{}] {}", commit.date, commit.branch, commit.message);
//!     }
//!     Ok(())
//! }
//! ```

pub mod agents;
pub mod cache;
pub mod cancel;
pub mod config;
pub mod error;
pub mod generator;
pub mod graph;
pub mod model;
pub mod pipeline;
pub mod synthesizer;
pub mod testing;
pub mod timeline;
pub mod validator;

// Primary public API
pub use agents::AgentRole;
pub use cancel::CancelToken;
pub use config::{CacheConfig, ExtractionConfig, RetryPolicy, SynthesisConfig};
pub use error::{Diagnostic, DiagnosticKind, GenerationError, SynthesisError, SynthesisResult};
pub use generator::{ClaudeGenerator, GenerationPrompt, TextGenerator};
pub use model::{
    BranchName, BranchSignal, CandidateEvent, CommitLabel, DatePrecision, RawEvent, ResolvedDate,
    TemporalAnchor, TimelineRequest, ValidatedEvent,
};
pub use synthesizer::{RunReport, Synthesizer};
pub use testing::ScriptedGenerator;
pub use timeline::{Branch, Commit, CommitDescriptor, CommitId, CommitKind, ValidatedTimeline};
