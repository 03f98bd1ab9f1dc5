//! The orchestrator.
//!
//! Stages declare their inputs and are grouped into levels by topological
//! layering. Stages within a level run concurrently; each level sees the
//! blackboard left by the previous ones.

use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use tokio::sync::Semaphore;
use tracing::{debug, info};

use crate::agents::extractor::Extraction;
use crate::agents::{
    AgentBackend, Annotations, Annotator, BranchClassifier, CommitMessageGenerator, DateResolver,
    EventExtractor, StageContext,
};
use crate::cancel::CancelToken;
use crate::config::SynthesisConfig;
use crate::error::{Diagnostic, DiagnosticKind, SynthesisError, SynthesisResult};
use crate::generator::{ModelCaller, TextGenerator};
use crate::graph::{build_timeline, GraphOptions};
use crate::model::{BranchSignal, CommitLabel, RawEvent, ResolvedDate, TimelineRequest};
use crate::timeline::ValidatedTimeline;
use crate::validator::{validate, Validation, ValidationInput};

/// One unit of work in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StageId {
    Extract,
    ResolveDates,
    GenerateLabels,
    ClassifyBranches,
    Validate,
    BuildGraph,
}

impl StageId {
    pub const ALL: [StageId; 6] = [
        StageId::Extract,
        StageId::ResolveDates,
        StageId::GenerateLabels,
        StageId::ClassifyBranches,
        StageId::Validate,
        StageId::BuildGraph,
    ];

    /// Stages whose output this stage reads.
    pub fn inputs(self) -> &'static [StageId] {
        match self {
            StageId::Extract => &[],
            StageId::ResolveDates | StageId::GenerateLabels | StageId::ClassifyBranches => {
                &[StageId::Extract]
            }
            StageId::Validate => &[
                StageId::Extract,
                StageId::ResolveDates,
                StageId::GenerateLabels,
                StageId::ClassifyBranches,
            ],
            StageId::BuildGraph => &[StageId::Validate],
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            StageId::Extract => "extract",
            StageId::ResolveDates => "resolve_dates",
            StageId::GenerateLabels => "generate_labels",
            StageId::ClassifyBranches => "classify_branches",
            StageId::Validate => "validate",
            StageId::BuildGraph => "build_graph",
        }
    }
}

/// The stage dependency graph.
pub struct StageGraph;

impl StageGraph {
    /// Execution levels: every stage lands one level after its deepest input.
    pub fn levels() -> Vec<Vec<StageId>> {
        let mut placed: Vec<(StageId, usize)> = Vec::new();
        let mut pending: Vec<StageId> = StageId::ALL.to_vec();

        while !pending.is_empty() {
            let before = pending.len();
            pending.retain(|stage| {
                let depths: Option<Vec<usize>> = stage
                    .inputs()
                    .iter()
                    .map(|input| placed.iter().find(|(s, _)| s == input).map(|(_, d)| *d))
                    .collect();
                match depths {
                    Some(depths) => {
                        let depth = depths.iter().map(|d| d + 1).max().unwrap_or(0);
                        placed.push((*stage, depth));
                        false
                    }
                    None => true,
                }
            });
            if pending.len() == before {
                // A cycle leaves stages unplaced; the run fails on the missing input.
                break;
            }
        }

        let depth = placed.iter().map(|(_, d)| *d + 1).max().unwrap_or(0);
        let mut levels = vec![Vec::new(); depth];
        for (stage, d) in placed {
            levels[d].push(stage);
        }
        for level in &mut levels {
            level.sort();
        }
        levels
    }
}

/// What one stage produced.
enum StageOutput {
    Extracted(Extraction),
    Dates(Annotations<ResolvedDate>),
    Labels(Annotations<CommitLabel>),
    Branches(Annotations<BranchSignal>),
    Validated(Validation),
    Built(ValidatedTimeline),
}

/// Blackboard of stage outputs for one run.
#[derive(Default)]
struct RunState {
    extraction: Option<Extraction>,
    dates: Option<Annotations<ResolvedDate>>,
    labels: Option<Annotations<CommitLabel>>,
    branches: Option<Annotations<BranchSignal>>,
    validation: Option<Validation>,
    timeline: Option<ValidatedTimeline>,
}

impl RunState {
    fn has(&self, stage: StageId) -> bool {
        match stage {
            StageId::Extract => self.extraction.is_some(),
            StageId::ResolveDates => self.dates.is_some(),
            StageId::GenerateLabels => self.labels.is_some(),
            StageId::ClassifyBranches => self.branches.is_some(),
            StageId::Validate => self.validation.is_some(),
            StageId::BuildGraph => self.timeline.is_some(),
        }
    }

    fn apply(&mut self, output: StageOutput) {
        match output {
            StageOutput::Extracted(e) => self.extraction = Some(e),
            StageOutput::Dates(a) => self.dates = Some(a),
            StageOutput::Labels(a) => self.labels = Some(a),
            StageOutput::Branches(a) => self.branches = Some(a),
            StageOutput::Validated(v) => self.validation = Some(v),
            StageOutput::Built(t) => self.timeline = Some(t),
        }
    }

    fn events(&self) -> SynthesisResult<&[RawEvent]> {
        self.extraction
            .as_ref()
            .map(|e| e.events.as_slice())
            .ok_or_else(|| SynthesisError::invariant("events read before extraction"))
    }

    fn missing(stage: StageId, input: StageId) -> SynthesisError {
        SynthesisError::invariant(format!("{} ran without {}", stage.name(), input.name()))
    }

    /// Diagnostics in stage order, then the timeline.
    fn finish(self) -> SynthesisResult<(ValidatedTimeline, Vec<Diagnostic>)> {
        let timeline = self
            .timeline
            .ok_or_else(|| SynthesisError::invariant("run finished without a timeline"))?;
        let mut diagnostics = Vec::new();
        if let Some(e) = self.extraction {
            diagnostics.extend(e.diagnostics);
        }
        for annotations in [
            self.dates.map(|a| a.diagnostics),
            self.labels.map(|a| a.diagnostics),
            self.branches.map(|a| a.diagnostics),
            self.validation.map(|v| v.diagnostics),
        ]
        .into_iter()
        .flatten()
        {
            diagnostics.extend(annotations);
        }
        Ok((timeline, diagnostics))
    }
}

/// The configured agents plus the stage graph that drives them.
pub struct Pipeline {
    config: SynthesisConfig,
    backend: AgentBackend,
    extractor: EventExtractor,
    dates: DateResolver,
    labels: CommitMessageGenerator,
    branches: BranchClassifier,
}

impl Pipeline {
    /// Model-backed agents when a generator is given, heuristics otherwise.
    pub fn new(config: SynthesisConfig, generator: Option<Arc<dyn TextGenerator>>) -> Self {
        let backend = match generator {
            Some(generator) => {
                let permits = Arc::new(Semaphore::new(config.max_concurrent_calls.max(1)));
                AgentBackend::Model(ModelCaller::new(generator, config.retry.clone(), permits))
            }
            None => AgentBackend::Heuristic,
        };
        Self {
            extractor: EventExtractor::new(backend.clone()),
            dates: DateResolver::new(backend.clone()),
            labels: CommitMessageGenerator::new(backend.clone()),
            branches: BranchClassifier::new(backend.clone()),
            backend,
            config,
        }
    }

    pub fn config(&self) -> &SynthesisConfig {
        &self.config
    }

    /// "heuristic" or "model:<name>".
    pub fn backend_description(&self) -> String {
        self.backend.describe()
    }

    pub fn extractor_invocations(&self) -> usize {
        self.extractor.invocations()
    }

    /// Run every stage for one (already normalised) request.
    pub async fn run(
        &self,
        request: &TimelineRequest,
        cancel: &CancelToken,
    ) -> SynthesisResult<(ValidatedTimeline, Vec<Diagnostic>)> {
        let started = Instant::now();
        let ctx = StageContext {
            text: &request.text,
            anchor: request.anchor.as_ref(),
            config: &self.config,
            cancel,
        };

        let mut state = RunState::default();
        for level in StageGraph::levels() {
            if cancel.is_cancelled() {
                return Err(SynthesisError::Cancelled);
            }
            let outputs = join_all(
                level
                    .iter()
                    .map(|stage| self.run_stage(*stage, &state, &ctx, request)),
            )
            .await;
            for output in outputs {
                state.apply(output?);
            }
        }

        let (timeline, diagnostics) = state.finish()?;
        info!(
            commits = timeline.commits().len(),
            branches = timeline.branches().len(),
            diagnostics = diagnostics.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Timeline built"
        );
        Ok((timeline, diagnostics))
    }

    async fn run_stage(
        &self,
        stage: StageId,
        state: &RunState,
        ctx: &StageContext<'_>,
        request: &TimelineRequest,
    ) -> SynthesisResult<StageOutput> {
        if let Some(input) = stage.inputs().iter().find(|input| !state.has(**input)) {
            return Err(RunState::missing(stage, *input));
        }
        let started = Instant::now();

        let output = match stage {
            StageId::Extract => StageOutput::Extracted(self.extract(ctx, request).await?),
            StageId::ResolveDates => StageOutput::Dates(self.dates.annotate(state.events()?, ctx).await?),
            StageId::GenerateLabels => {
                StageOutput::Labels(self.labels.annotate(state.events()?, ctx).await?)
            }
            StageId::ClassifyBranches => {
                StageOutput::Branches(self.branches.annotate(state.events()?, ctx).await?)
            }
            StageId::Validate => {
                let missing = |input| RunState::missing(stage, input);
                let validation = validate(ValidationInput {
                    events: state.events()?,
                    dates: state.dates.as_ref().ok_or_else(|| missing(StageId::ResolveDates))?,
                    labels: state.labels.as_ref().ok_or_else(|| missing(StageId::GenerateLabels))?,
                    branches: state
                        .branches
                        .as_ref()
                        .ok_or_else(|| missing(StageId::ClassifyBranches))?,
                    candidates: &request.candidates,
                    anchor: request.anchor.as_ref(),
                    max_message_len: self.config.max_message_len,
                    default_date: self.config.default_date,
                })?;
                StageOutput::Validated(validation)
            }
            StageId::BuildGraph => {
                let validation = state
                    .validation
                    .as_ref()
                    .ok_or_else(|| RunState::missing(stage, StageId::Validate))?;
                let options = GraphOptions {
                    merge_branches: self.config.merge_branches,
                };
                StageOutput::Built(build_timeline(validation.events.clone(), options)?)
            }
        };

        debug!(
            stage = stage.name(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Stage finished"
        );
        Ok(output)
    }

    async fn extract(&self, ctx: &StageContext<'_>, request: &TimelineRequest) -> SynthesisResult<Extraction> {
        if request.has_blank_text() {
            debug!("No narrative text, using pre-supplied events only");
            return Ok(Extraction::default());
        }
        match self.extractor.extract(ctx).await {
            Err(SynthesisError::ExtractionFailure { reason }) if !request.candidates.is_empty() => {
                Ok(Extraction {
                    events: Vec::new(),
                    diagnostics: vec![Diagnostic::new(
                        DiagnosticKind::StageFallback,
                        format!("{reason}; using pre-supplied events only"),
                    )],
                })
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levels() {
        assert_eq!(
            StageGraph::levels(),
            vec![
                vec![StageId::Extract],
                vec![
                    StageId::ResolveDates,
                    StageId::GenerateLabels,
                    StageId::ClassifyBranches
                ],
                vec![StageId::Validate],
                vec![StageId::BuildGraph],
            ]
        );
    }

    #[test]
    fn test_every_stage_is_scheduled_after_its_inputs() {
        let levels = StageGraph::levels();
        let level_of = |stage: StageId| levels.iter().position(|l| l.contains(&stage)).unwrap();
        for stage in StageId::ALL {
            for input in stage.inputs() {
                assert!(level_of(*input) < level_of(stage));
            }
        }
    }

    #[tokio::test]
    async fn test_heuristic_run() {
        let pipeline = Pipeline::new(SynthesisConfig::default(), None);
        let request = TimelineRequest::new("I started therapy in 2024. Before that, in 2020, I moved out.");
        let (timeline, diagnostics) = pipeline.run(&request, &CancelToken::new()).await.unwrap();

        let messages: Vec<&str> = timeline.main_line().iter().map(|c| c.message.as_str()).collect();
        assert_eq!(messages, vec!["Initialize life story", "Move out", "Start therapy"]);
        assert!(diagnostics.is_empty());
        assert_eq!(pipeline.extractor_invocations(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let pipeline = Pipeline::new(SynthesisConfig::default(), None);
        let cancel = CancelToken::new();
        cancel.cancel();
        let result = pipeline.run(&TimelineRequest::new("In 2020 I moved out."), &cancel).await;
        assert_eq!(result.unwrap_err(), SynthesisError::Cancelled);
        assert_eq!(pipeline.extractor_invocations(), 0);
    }
}
