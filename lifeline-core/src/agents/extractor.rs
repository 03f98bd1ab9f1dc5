//! Event extraction: narrative text in, ordered candidate events out.

use std::sync::atomic::{AtomicUsize, Ordering};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, warn};

use super::dates::find_temporal_reference;
use super::{AgentBackend, AgentRole, StageContext};
use crate::config::ExtractionConfig;
use crate::error::{Diagnostic, DiagnosticKind, GenerationError, SynthesisError, SynthesisResult};
use crate::generator::ModelCaller;
use crate::model::RawEvent;

const SYSTEM_PROMPT: &str = include_str!("prompts/extractor.txt");

static BULLET: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(?:[-*•]|\d{1,2}[.)])\s+").expect("valid bullet regex"));

const ABBREVIATIONS: &[&str] = &[
    "mr", "mrs", "ms", "dr", "st", "jr", "sr", "vs", "e.g", "i.e", "jan", "feb", "mar", "apr",
    "jun", "jul", "aug", "sep", "sept", "oct", "nov", "dec",
];

const FILLER: &[&str] = &[
    "anyway",
    "so yeah",
    "yeah",
    "ok",
    "okay",
    "well",
    "the end",
    "that's it",
    "that's all",
    "that is all",
];

/// Events cut out of one narrative.
#[derive(Debug, Clone, Default)]
pub struct Extraction {
    pub events: Vec<RawEvent>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Cuts a narrative into candidate life events.
pub struct EventExtractor {
    backend: AgentBackend,
    invocations: AtomicUsize,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ExtractedAnswer {
    Span {
        #[serde(alias = "source_span", alias = "event")]
        span: String,
        #[serde(default, alias = "raw_temporal_reference")]
        temporal_reference: Option<String>,
    },
    Text(String),
}

impl EventExtractor {
    pub fn new(backend: AgentBackend) -> Self {
        Self {
            backend,
            invocations: AtomicUsize::new(0),
        }
    }

    /// How many times extraction has run. Cached runs do not count.
    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    /// Extract events from `ctx.text`.
    ///
    /// Fails with [`SynthesisError::ExtractionFailure`] when nothing in the
    /// text qualifies as an event.
    pub async fn extract(&self, ctx: &StageContext<'_>) -> SynthesisResult<Extraction> {
        self.invocations.fetch_add(1, Ordering::SeqCst);

        let mut extraction = match &self.backend {
            AgentBackend::Heuristic => Extraction {
                events: extract_heuristically(ctx.text, &ctx.config.extraction),
                diagnostics: Vec::new(),
            },
            AgentBackend::Model(caller) => match self.ask_model(caller, ctx).await {
                Ok(events) if !events.is_empty() => Extraction {
                    events,
                    diagnostics: Vec::new(),
                },
                Err(GenerationError::Cancelled) => return Err(SynthesisError::Cancelled),
                outcome => {
                    let reason = match outcome {
                        Err(e) => e.to_string(),
                        Ok(_) => "model found no events".to_string(),
                    };
                    warn!(error = %reason, "Extraction fell back to local heuristic");
                    Extraction {
                        events: extract_heuristically(ctx.text, &ctx.config.extraction),
                        diagnostics: vec![Diagnostic::new(
                            DiagnosticKind::StageFallback,
                            format!("Extractor fell back to heuristics: {reason}"),
                        )],
                    }
                }
            },
        };

        if extraction.events.is_empty() {
            return Err(SynthesisError::extraction(
                "the narrative contains no recognisable life events",
            ));
        }

        let max = ctx.config.extraction.max_events;
        if extraction.events.len() > max {
            warn!(found = extraction.events.len(), max, "Too many events, keeping the first ones");
            extraction.events.truncate(max);
        }

        debug!(events = extraction.events.len(), "Extracted events");
        Ok(extraction)
    }

    async fn ask_model(
        &self,
        caller: &ModelCaller,
        ctx: &StageContext<'_>,
    ) -> Result<Vec<RawEvent>, GenerationError> {
        let prompt = ctx.prompt(
            AgentRole::Extractor,
            SYSTEM_PROMPT,
            format!("## Narrative\n{}", ctx.text),
        );
        let answers: Vec<ExtractedAnswer> = caller.call_json(&prompt, ctx.cancel).await?;

        let mut spans: Vec<(String, Option<String>)> = answers
            .into_iter()
            .filter_map(|answer| {
                let (span, reference) = match answer {
                    ExtractedAnswer::Span {
                        span,
                        temporal_reference,
                    } => (span, temporal_reference),
                    ExtractedAnswer::Text(span) => (span, None),
                };
                let span = span.trim().to_string();
                if span.is_empty() {
                    return None;
                }
                let reference = reference
                    .map(|r| r.trim().to_string())
                    .filter(|r| !r.is_empty())
                    .or_else(|| find_temporal_reference(&span));
                Some((span, reference))
            })
            .collect();

        // Mention order follows the narrative, not the answer. Spans the
        // model paraphrased go last, in answer order.
        spans.sort_by_key(|(span, _)| ctx.text.find(span.as_str()).unwrap_or(ctx.text.len()));

        let events = spans
            .into_iter()
            .enumerate()
            .map(|(order, (span, reference))| RawEvent::new(span, order, reference))
            .collect();
        Ok(events)
    }
}

/// Split the narrative into sentence-sized fragments and keep the ones that
/// read like events.
pub fn extract_heuristically(text: &str, config: &ExtractionConfig) -> Vec<RawEvent> {
    text.lines()
        .map(|line| BULLET.replace(line, ""))
        .flat_map(|line| sentences(&line).into_iter().map(str::to_string).collect::<Vec<_>>())
        .filter(|fragment| is_event_like(fragment, config.min_words))
        .enumerate()
        .map(|(order, fragment)| {
            let reference = find_temporal_reference(&fragment);
            RawEvent::new(fragment, order, reference)
        })
        .collect()
}

fn is_event_like(fragment: &str, min_words: usize) -> bool {
    if fragment.split_whitespace().count() < min_words {
        return false;
    }
    let bare = fragment
        .trim_matches(|c: char| !c.is_alphanumeric())
        .to_lowercase();
    !FILLER.contains(&bare.as_str())
}

/// Split one line at sentence terminators followed by whitespace.
fn sentences(line: &str) -> Vec<&str> {
    let chars: Vec<(usize, char)> = line.char_indices().collect();
    let mut out = Vec::new();
    let mut start = 0;

    for (i, &(pos, c)) in chars.iter().enumerate() {
        if !matches!(c, '.' | '!' | '?') {
            continue;
        }
        let at_break = chars
            .get(i + 1)
            .map_or(true, |&(_, next)| next.is_whitespace());
        let end = pos + c.len_utf8();
        if at_break && !ends_with_abbreviation(&line[start..pos]) {
            out.push(line[start..end].trim());
            start = end;
        }
    }
    out.push(line[start..].trim());
    out.retain(|s| !s.is_empty());
    out
}

fn ends_with_abbreviation(before_dot: &str) -> bool {
    let Some(word) = before_dot.split_whitespace().last() else {
        return false;
    };
    let word = word.to_lowercase();
    let initial = word.chars().count() == 1 && word.chars().all(char::is_alphabetic);
    initial || ABBREVIATIONS.contains(&word.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelToken;
    use crate::config::SynthesisConfig;
    use crate::config::RetryPolicy;
    use crate::testing::ScriptedGenerator;
    use std::sync::Arc;
    use tokio::sync::Semaphore;

    fn config() -> ExtractionConfig {
        ExtractionConfig::default()
    }

    #[test]
    fn test_splits_sentences_in_mention_order() {
        let events = extract_heuristically(
            "I started therapy in 2024. Before that, in 2020, I moved out.",
            &config(),
        );
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].source_span, "I started therapy in 2024.");
        assert_eq!(events[0].mention_order, 0);
        assert_eq!(events[0].raw_temporal_reference.as_deref(), Some("2024"));
        assert_eq!(events[1].source_span, "Before that, in 2020, I moved out.");
        assert_eq!(events[1].mention_order, 1);
        assert_eq!(events[1].raw_temporal_reference.as_deref(), Some("2020"));
    }

    #[test]
    fn test_drops_filler_and_short_fragments() {
        let events = extract_heuristically(
            "Anyway. So yeah. Wow! In 2019 I learned to sail.",
            &config(),
        );
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].source_span, "In 2019 I learned to sail.");
        assert_eq!(events[0].mention_order, 0);
    }

    #[test]
    fn test_abbreviations_do_not_split() {
        let events = extract_heuristically(
            "On Jan. 5, 2018 I met Dr. Silva in St. Louis. Then I moved to Denver in 2019.",
            &config(),
        );
        assert_eq!(events.len(), 2);
        assert!(events[0].source_span.contains("St. Louis"));
    }

    #[test]
    fn test_lines_and_bullets() {
        let text = "- In 2010 I finished school\n- In 2012 I got my first job\n\n3. In 2015 I moved to Oslo";
        let events = extract_heuristically(text, &config());
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].source_span, "In 2010 I finished school");
        assert_eq!(events[2].source_span, "In 2015 I moved to Oslo");
    }

    #[test]
    fn test_undated_event_has_no_reference() {
        let events = extract_heuristically("I learned to bake bread.", &config());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].raw_temporal_reference, None);
    }

    #[tokio::test]
    async fn test_extract_fails_on_no_events() {
        let extractor = EventExtractor::new(AgentBackend::Heuristic);
        let config = SynthesisConfig::default();
        let cancel = CancelToken::new();
        let ctx = StageContext {
            text: "Anyway. Ok.",
            anchor: None,
            config: &config,
            cancel: &cancel,
        };
        let result = extractor.extract(&ctx).await;
        assert!(matches!(result, Err(SynthesisError::ExtractionFailure { .. })));
        assert_eq!(extractor.invocations(), 1);
    }

    #[tokio::test]
    async fn test_model_extraction_keeps_mention_order() {
        let generator = Arc::new(ScriptedGenerator::new().reply(
            AgentRole::Extractor,
            r#"[{"span": "I moved to Berlin in 2019", "temporal_reference": "in 2019"},
                {"span": "  "},
                "I adopted a dog two years later"]"#,
        ));
        let caller = ModelCaller::new(generator, RetryPolicy::no_retries(), Arc::new(Semaphore::new(1)));
        let extractor = EventExtractor::new(AgentBackend::Model(caller));
        let config = SynthesisConfig::default();
        let cancel = CancelToken::new();
        let ctx = StageContext {
            text: "I moved to Berlin in 2019. I adopted a dog two years later.",
            anchor: None,
            config: &config,
            cancel: &cancel,
        };

        let extraction = extractor.extract(&ctx).await.unwrap();
        assert_eq!(extraction.events.len(), 2);
        assert_eq!(extraction.events[1].mention_order, 1);
        assert_eq!(
            extraction.events[1].raw_temporal_reference.as_deref(),
            Some("two years later")
        );
        assert!(extraction.diagnostics.is_empty());
    }

    #[tokio::test]
    async fn test_model_failure_falls_back() {
        let generator = Arc::new(ScriptedGenerator::new().fail_next(AgentRole::Extractor, 10));
        let caller = ModelCaller::new(generator, RetryPolicy::no_retries(), Arc::new(Semaphore::new(1)));
        let extractor = EventExtractor::new(AgentBackend::Model(caller));
        let config = SynthesisConfig::default();
        let cancel = CancelToken::new();
        let ctx = StageContext {
            text: "In 2019 I learned to sail.",
            anchor: None,
            config: &config,
            cancel: &cancel,
        };

        let extraction = extractor.extract(&ctx).await.unwrap();
        assert_eq!(extraction.events.len(), 1);
        assert_eq!(extraction.diagnostics[0].kind, DiagnosticKind::StageFallback);
    }
}
