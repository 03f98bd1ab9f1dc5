//! Synthesizer - the primary public API.
//!
//! Wraps the pipeline and the cache into a single entry point: hand it a
//! [`TimelineRequest`], get back a [`RunReport`].

use std::sync::Arc;

use tracing::{info, warn};

use crate::cache::{cache_key, normalize_text, CacheEntry, TimelineCache};
use crate::cancel::CancelToken;
use crate::config::SynthesisConfig;
use crate::error::{Diagnostic, DiagnosticKind, SynthesisError, SynthesisResult};
use crate::generator::{ClaudeGenerator, TextGenerator};
use crate::model::TimelineRequest;
use crate::pipeline::Pipeline;
use crate::timeline::{CommitDescriptor, ValidatedTimeline};

/// The result of one synthesis call.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Cache key of the normalised request.
    pub input_hash: String,
    pub timeline: Arc<ValidatedTimeline>,
    /// Non-fatal degradations, in stage order.
    pub diagnostics: Vec<Diagnostic>,
    /// True when this call did not run the pipeline itself.
    pub cache_hit: bool,
}

impl RunReport {
    pub fn commit_descriptors(&self) -> Vec<CommitDescriptor> {
        self.timeline.commit_descriptors()
    }

    pub fn has_diagnostic(&self, kind: DiagnosticKind) -> bool {
        self.diagnostics.iter().any(|d| d.kind == kind)
    }
}

/// Turns narratives into timelines.
///
/// Cheap to share behind an `Arc`; concurrent calls with the same input
/// share one pipeline run.
pub struct Synthesizer {
    pipeline: Arc<Pipeline>,
    cache: Option<TimelineCache>,
    /// Why the configured cache could not be opened.
    cache_problem: Option<String>,
    fingerprint: String,
}

impl Synthesizer {
    /// A synthesizer using only the local heuristics.
    pub async fn new(config: SynthesisConfig) -> Self {
        Self::build(config, None).await
    }

    /// A synthesizer whose agents consult `generator`.
    pub async fn with_generator(config: SynthesisConfig, generator: Arc<dyn TextGenerator>) -> Self {
        Self::build(config, Some(generator)).await
    }

    /// Model-backed when `ANTHROPIC_API_KEY` is set, heuristic otherwise.
    pub async fn from_env(config: SynthesisConfig) -> Self {
        match ClaudeGenerator::from_env() {
            Ok(generator) => {
                let generator = match &config.model {
                    Some(model) => generator.with_model(model),
                    None => generator,
                };
                Self::with_generator(config, Arc::new(generator)).await
            }
            Err(e) => {
                warn!(error = %e, "No model available, using local heuristics");
                Self::new(config).await
            }
        }
    }

    async fn build(config: SynthesisConfig, generator: Option<Arc<dyn TextGenerator>>) -> Self {
        let (cache, cache_problem) = if config.cache.enabled {
            match TimelineCache::open(&config.cache).await {
                Ok(cache) => (Some(cache), None),
                Err(e) => {
                    warn!(error = %e, "Cache unavailable, running uncached");
                    (None, Some(format!("cache could not be opened: {e}")))
                }
            }
        } else {
            (None, None)
        };

        let pipeline = Pipeline::new(config, generator);
        let fingerprint = fingerprint(&pipeline);
        Self {
            pipeline: Arc::new(pipeline),
            cache,
            cache_problem,
            fingerprint,
        }
    }

    pub fn config(&self) -> &SynthesisConfig {
        self.pipeline.config()
    }

    /// How many times the extractor has run. Cache hits and coalesced
    /// callers do not add to it.
    pub fn extractor_invocations(&self) -> usize {
        self.pipeline.extractor_invocations()
    }

    /// Build the timeline for `request`.
    pub async fn synthesize(&self, request: TimelineRequest) -> SynthesisResult<RunReport> {
        self.synthesize_with_cancel(request, &CancelToken::new()).await
    }

    /// Build the timeline for `request`, giving up when `cancel` fires.
    pub async fn synthesize_with_cancel(
        &self,
        request: TimelineRequest,
        cancel: &CancelToken,
    ) -> SynthesisResult<RunReport> {
        if request.has_blank_text() && request.candidates.is_empty() {
            return Err(SynthesisError::InvalidInput {
                reason: "narrative text is empty and no events were supplied".to_string(),
            });
        }
        if cancel.is_cancelled() {
            return Err(SynthesisError::Cancelled);
        }

        let request = TimelineRequest {
            text: normalize_text(&request.text),
            ..request
        };
        let key = cache_key(&request, &self.fingerprint);
        info!(key = short(&key), backend = %self.pipeline.backend_description(), "Synthesizing timeline");

        tokio::select! {
            _ = cancel.cancelled() => {
                info!(key = short(&key), "Synthesis cancelled");
                Err(SynthesisError::Cancelled)
            }
            report = self.run(request, key.clone(), cancel) => report,
        }
    }

    async fn run(&self, request: TimelineRequest, key: String, cancel: &CancelToken) -> SynthesisResult<RunReport> {
        let Some(cache) = &self.cache else {
            let (timeline, mut diagnostics) = self.pipeline.run(&request, cancel).await?;
            if let Some(problem) = &self.cache_problem {
                diagnostics.push(Diagnostic::new(DiagnosticKind::CacheUnavailable, problem.clone()));
            }
            return Ok(RunReport {
                input_hash: key,
                timeline: Arc::new(timeline),
                diagnostics,
                cache_hit: false,
            });
        };

        // The shared computation must not die with one caller's token: a
        // waiting caller takes over if this one is dropped.
        let pipeline = self.pipeline.clone();
        let input_hash = key.clone();
        let lookup = cache
            .get_or_compute(&key, async move {
                let (timeline, diagnostics) = pipeline.run(&request, &CancelToken::new()).await?;
                Ok(CacheEntry::new(input_hash, timeline, diagnostics))
            })
            .await?;

        let mut diagnostics = lookup.entry.diagnostics.clone();
        diagnostics.extend(lookup.diagnostics);
        if lookup.hit {
            info!(key = short(&key), "Served from cache");
        }
        Ok(RunReport {
            input_hash: key,
            timeline: lookup.entry.timeline.clone(),
            diagnostics,
            cache_hit: lookup.hit,
        })
    }
}

fn short(key: &str) -> &str {
    key.get(..12).unwrap_or(key)
}

/// Everything besides the request that changes the output.
fn fingerprint(pipeline: &Pipeline) -> String {
    let config = pipeline.config();
    format!(
        "{}|model={}|merge={}|len={}|default={}|words={}|max={}",
        pipeline.backend_description(),
        config.model.as_deref().unwrap_or("-"),
        config.merge_branches,
        config.max_message_len,
        config.default_date,
        config.extraction.min_words,
        config.extraction.max_events,
    )
}
