//! Validation: merge the per-event annotations into [`ValidatedEvent`]s.
//!
//! This is the only stage that sees every annotation at once, so it owns the
//! degradation policy. Missing dates become unknown-precision placeholders,
//! missing labels fall back to the source span, missing branch signals keep
//! the event on main, and structurally broken events are dropped. Every
//! degradation leaves a [`Diagnostic`].

use std::collections::{HashMap, HashSet};

use chrono::NaiveDate;
use tracing::{debug, warn};

use crate::agents::dates::parse_loose_date;
use crate::agents::labels::{fallback_label, truncate_message};
use crate::agents::Annotations;
use crate::error::{Diagnostic, DiagnosticKind, SynthesisError, SynthesisResult};
use crate::model::{
    slugify, BranchName, BranchSignal, CandidateEvent, CommitLabel, RawEvent, ResolvedDate,
    TemporalAnchor, ValidatedEvent,
};

/// Everything the validator consumes.
pub struct ValidationInput<'a> {
    pub events: &'a [RawEvent],
    pub dates: &'a Annotations<ResolvedDate>,
    pub labels: &'a Annotations<CommitLabel>,
    pub branches: &'a Annotations<BranchSignal>,
    /// Pre-extracted events merged after the text events.
    pub candidates: &'a [CandidateEvent],
    pub anchor: Option<&'a TemporalAnchor>,
    pub max_message_len: usize,
    pub default_date: NaiveDate,
}

/// Validated events plus the degradations met on the way.
#[derive(Debug, Clone, Default)]
pub struct Validation {
    pub events: Vec<ValidatedEvent>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Assigns unique, ref-safe branch names in order of first occurrence.
#[derive(Debug, Default)]
pub struct BranchNamer {
    by_label: HashMap<String, BranchName>,
    taken: HashSet<String>,
}

impl BranchNamer {
    /// Name for a suggested label. The same label (ignoring case and outer
    /// whitespace) always maps to the same branch; different labels never
    /// share one.
    pub fn name_for(&mut self, label: &str) -> BranchName {
        let key = label.trim().to_lowercase();
        if let Some(name) = self.by_label.get(&key) {
            return name.clone();
        }

        let mut slug = slugify(&key);
        if slug.is_empty() {
            slug = "change".to_string();
        }
        let mut candidate = slug.clone();
        let mut suffix = 2;
        while candidate == BranchName::MAIN || self.taken.contains(&candidate) {
            candidate = format!("{slug}-{suffix}");
            suffix += 1;
        }

        let name = BranchName::from_slug(candidate.clone());
        self.taken.insert(candidate);
        self.by_label.insert(key, name.clone());
        name
    }
}

/// A branch label for a major change nobody named: the first words of its
/// commit message.
fn derived_label(label: &CommitLabel) -> String {
    label
        .short_message
        .split_whitespace()
        .take(3)
        .collect::<Vec<_>>()
        .join(" ")
}

struct Draft {
    raw: RawEvent,
    date: Option<ResolvedDate>,
    label: CommitLabel,
    signal: BranchSignal,
    source_files: Vec<String>,
}

/// Merge annotations and candidates into validated events.
pub fn validate(input: ValidationInput<'_>) -> SynthesisResult<Validation> {
    let mut diagnostics = Vec::new();
    let count = input.events.len();

    for (name, len) in [
        ("date", input.dates.len()),
        ("label", input.labels.len()),
        ("branch", input.branches.len()),
    ] {
        if len != count {
            warn!(annotator = name, expected = count, got = len, "Annotation count mismatch");
            diagnostics.push(Diagnostic::new(
                DiagnosticKind::ValidationInconsistency,
                format!("{name} annotations cover {len} of {count} events"),
            ));
        }
    }

    let mut drafts = Vec::with_capacity(count + input.candidates.len());

    for (index, raw) in input.events.iter().enumerate() {
        if raw.is_malformed() {
            diagnostics.push(Diagnostic::for_event(
                DiagnosticKind::ValidationInconsistency,
                raw.mention_order,
                "event has an empty source span and was dropped",
            ));
            continue;
        }

        let label = match input.labels.get(index) {
            Some(label) => label.clone(),
            None => {
                diagnostics.push(Diagnostic::for_event(
                    DiagnosticKind::LabelGenerationFailure,
                    raw.mention_order,
                    "no commit message generated, using the source text",
                ));
                fallback_label(raw, input.max_message_len)
            }
        };

        let signal = match input.branches.get(index) {
            Some(signal) => signal.clone(),
            None => {
                diagnostics.push(Diagnostic::for_event(
                    DiagnosticKind::BranchClassificationFailure,
                    raw.mention_order,
                    "no branch classification, keeping the event on main",
                ));
                BranchSignal::main_line()
            }
        };

        drafts.push(Draft {
            raw: raw.clone(),
            date: input.dates.get(index).copied(),
            label,
            signal,
            source_files: Vec::new(),
        });
    }

    for (offset, candidate) in input.candidates.iter().enumerate() {
        let mention_order = count + offset;
        match candidate_draft(candidate, mention_order, input.max_message_len) {
            Some(draft) => drafts.push(draft),
            None => diagnostics.push(Diagnostic::for_event(
                DiagnosticKind::ValidationInconsistency,
                mention_order,
                "pre-supplied event has neither message nor description and was dropped",
            )),
        }
    }

    if drafts.is_empty() {
        return Err(SynthesisError::extraction("every event was dropped during validation"));
    }

    // Undated events sit at the end of the known story.
    let fallback_date = drafts
        .iter()
        .filter_map(|d| d.date.map(|r| r.date))
        .max()
        .or_else(|| input.anchor.and_then(|a| a.reference_date))
        .unwrap_or(input.default_date);

    let mut namer = BranchNamer::default();
    let mut events = Vec::with_capacity(drafts.len());

    for draft in drafts {
        let order = draft.raw.mention_order;

        let date = match draft.date {
            Some(date) => date,
            None => {
                let message = match draft.raw.raw_temporal_reference.as_deref() {
                    Some(reference) => format!("could not resolve '{reference}', date unknown"),
                    None => "no temporal reference, date unknown".to_string(),
                };
                diagnostics.push(Diagnostic::for_event(
                    DiagnosticKind::DateResolutionAmbiguous,
                    order,
                    message,
                ));
                ResolvedDate::unknown(fallback_date)
            }
        };

        let branch = if draft.signal.is_major_change {
            let label = draft
                .signal
                .suggested_branch_name
                .clone()
                .filter(|name| !name.trim().is_empty())
                .unwrap_or_else(|| derived_label(&draft.label));
            Some(namer.name_for(&label))
        } else {
            None
        };

        events.push(ValidatedEvent {
            raw: draft.raw,
            date,
            label: draft.label,
            is_major_change: branch.is_some(),
            branch,
            source_files: draft.source_files,
        });
    }

    debug!(events = events.len(), diagnostics = diagnostics.len(), "Validated events");
    Ok(Validation { events, diagnostics })
}

fn candidate_draft(candidate: &CandidateEvent, mention_order: usize, max_len: usize) -> Option<Draft> {
    let message = candidate.message.trim();
    let description = candidate.description.trim();
    let span = if description.is_empty() { message } else { description };
    if span.is_empty() {
        return None;
    }
    let subject = if message.is_empty() { span } else { message };

    let raw = RawEvent::new(span, mention_order, candidate.date.clone());
    let date = candidate
        .date
        .as_deref()
        .and_then(parse_loose_date)
        .map(|(date, precision)| ResolvedDate::new(date, precision, 1.0));

    let signal = if candidate.is_major_change {
        BranchSignal {
            is_major_change: true,
            suggested_branch_name: candidate.branch.clone(),
        }
    } else {
        BranchSignal::main_line()
    };

    Some(Draft {
        label: CommitLabel {
            short_message: truncate_message(subject.trim_end_matches('.'), max_len),
            long_description: span.to_string(),
            provenance: vec![raw.source_span.clone()],
        },
        raw,
        date,
        signal,
        source_files: candidate.source_files.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{build_timeline, GraphOptions};
    use crate::model::DatePrecision;
    use proptest::prelude::*;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn label(text: &str) -> CommitLabel {
        CommitLabel {
            short_message: text.to_string(),
            long_description: text.to_string(),
            provenance: vec![text.to_string()],
        }
    }

    fn run(
        events: &[RawEvent],
        dates: Annotations<ResolvedDate>,
        labels: Annotations<CommitLabel>,
        branches: Annotations<BranchSignal>,
        candidates: &[CandidateEvent],
    ) -> SynthesisResult<Validation> {
        validate(ValidationInput {
            events,
            dates: &dates,
            labels: &labels,
            branches: &branches,
            candidates,
            anchor: None,
            max_message_len: 72,
            default_date: ymd(2023, 1, 1),
        })
    }

    #[test]
    fn test_missing_annotations_degrade_with_diagnostics() {
        let events = vec![
            RawEvent::new("In 2019 I moved to Lisbon", 0, Some("2019".into())),
            RawEvent::new("I learned to bake bread", 1, None),
        ];
        let dates = Annotations::new(vec![
            Some(ResolvedDate::new(ymd(2019, 1, 1), DatePrecision::Year, 0.85)),
            None,
        ]);
        let labels = Annotations::new(vec![Some(label("Move to Lisbon")), None]);
        let branches = Annotations::new(vec![Some(BranchSignal::major("relocation")), None]);

        let validation = run(&events, dates, labels, branches, &[]).unwrap();
        assert_eq!(validation.events.len(), 2);

        let undated = &validation.events[1];
        assert!(undated.date.is_unknown());
        assert_eq!(undated.date.date, ymd(2019, 1, 1));
        assert_eq!(undated.label.short_message, "I learned to bake bread");
        assert!(!undated.is_major_change);

        let kinds: Vec<DiagnosticKind> = validation.diagnostics.iter().map(|d| d.kind).collect();
        assert!(kinds.contains(&DiagnosticKind::DateResolutionAmbiguous));
        assert!(kinds.contains(&DiagnosticKind::LabelGenerationFailure));
        assert!(kinds.contains(&DiagnosticKind::BranchClassificationFailure));
        assert_eq!(
            validation.events[0].branch.as_ref().map(|b| b.as_str()),
            Some("relocation")
        );
    }

    #[test]
    fn test_malformed_events_are_dropped() {
        let events = vec![RawEvent::new("   ", 0, None), RawEvent::new("I moved out", 1, None)];
        let validation = run(
            &events,
            Annotations::empty(2),
            Annotations::empty(2),
            Annotations::empty(2),
            &[],
        )
        .unwrap();
        assert_eq!(validation.events.len(), 1);
        assert_eq!(validation.events[0].raw.mention_order, 1);
        assert!(validation
            .diagnostics
            .iter()
            .any(|d| d.kind == DiagnosticKind::ValidationInconsistency && d.event_index == Some(0)));
    }

    #[test]
    fn test_all_dropped_is_extraction_failure() {
        let events = vec![RawEvent::new("", 0, None)];
        let result = run(
            &events,
            Annotations::empty(1),
            Annotations::empty(1),
            Annotations::empty(1),
            &[],
        );
        assert!(matches!(result, Err(SynthesisError::ExtractionFailure { .. })));
    }

    #[test]
    fn test_unknown_dates_fall_back_to_reference_then_default() {
        let events = vec![RawEvent::new("I learned to bake bread", 0, None)];
        let anchor = TemporalAnchor::default().with_reference_date(ymd(2024, 5, 1));
        let dates = Annotations::empty(1);
        let labels = Annotations::empty(1);
        let branches = Annotations::empty(1);

        let validation = validate(ValidationInput {
            events: &events,
            dates: &dates,
            labels: &labels,
            branches: &branches,
            candidates: &[],
            anchor: Some(&anchor),
            max_message_len: 72,
            default_date: ymd(2023, 1, 1),
        })
        .unwrap();
        assert_eq!(validation.events[0].date.date, ymd(2024, 5, 1));

        let validation = run(&events, Annotations::empty(1), Annotations::empty(1), Annotations::empty(1), &[]).unwrap();
        assert_eq!(validation.events[0].date.date, ymd(2023, 1, 1));
    }

    #[test]
    fn test_branch_names_are_deduplicated() {
        let mut namer = BranchNamer::default();
        assert_eq!(namer.name_for("Career").as_str(), "career");
        assert_eq!(namer.name_for(" career ").as_str(), "career");
        assert_eq!(namer.name_for("Career!").as_str(), "career-2");
        assert_eq!(namer.name_for("main").as_str(), "main-2");
        assert_eq!(namer.name_for("Main").as_str(), "main-2");
        assert_eq!(namer.name_for("???").as_str(), "change");
    }

    #[test]
    fn test_unnamed_major_change_gets_derived_name() {
        let events = vec![RawEvent::new("I quit my job", 0, None)];
        let labels = Annotations::new(vec![Some(label("Quit my job at the bank"))]);
        let branches = Annotations::new(vec![Some(BranchSignal {
            is_major_change: true,
            suggested_branch_name: None,
        })]);
        let validation = run(&events, Annotations::empty(1), labels, branches, &[]).unwrap();
        assert_eq!(
            validation.events[0].branch.as_ref().map(|b| b.as_str()),
            Some("quit-my-job")
        );
    }

    #[test]
    fn test_candidates_merge_after_text_events() {
        let events = vec![RawEvent::new("In 2019 I moved to Lisbon", 0, Some("2019".into()))];
        let candidates = vec![
            CandidateEvent {
                message: "Start learning piano".into(),
                date: Some("2020-04".into()),
                description: "Bought a keyboard and took lessons.".into(),
                is_major_change: false,
                branch: None,
                source_files: vec!["journal/2020.md".into()],
            },
            CandidateEvent {
                message: String::new(),
                date: None,
                description: String::new(),
                is_major_change: false,
                branch: None,
                source_files: Vec::new(),
            },
        ];
        let validation = run(
            &events,
            Annotations::new(vec![Some(ResolvedDate::new(ymd(2019, 1, 1), DatePrecision::Year, 0.85))]),
            Annotations::new(vec![Some(label("Move to Lisbon"))]),
            Annotations::new(vec![Some(BranchSignal::main_line())]),
            &candidates,
        )
        .unwrap();

        assert_eq!(validation.events.len(), 2);
        let piano = &validation.events[1];
        assert_eq!(piano.raw.mention_order, 1);
        assert_eq!(piano.date.date, ymd(2020, 4, 1));
        assert_eq!(piano.date.precision, DatePrecision::Month);
        assert_eq!(piano.label.short_message, "Start learning piano");
        assert_eq!(piano.source_files, vec!["journal/2020.md".to_string()]);
        assert_eq!(
            validation.diagnostics.iter().filter(|d| d.kind == DiagnosticKind::ValidationInconsistency).count(),
            1
        );
    }

    fn major_events(labels: &[&str]) -> SynthesisResult<Validation> {
        let events: Vec<RawEvent> = labels
            .iter()
            .enumerate()
            .map(|(i, _)| RawEvent::new(format!("Big change number {i}"), i, None))
            .collect();
        let branches = Annotations::new(labels.iter().map(|l| Some(BranchSignal::major(*l))).collect());
        run(
            &events,
            Annotations::empty(labels.len()),
            Annotations::empty(labels.len()),
            branches,
            &[],
        )
    }

    #[test]
    fn test_colliding_labels_share_or_split_branches() {
        let validation = major_events(&["Career", "career ", "Main", "Relocation"]).unwrap();
        let timeline = build_timeline(validation.events, GraphOptions::default()).unwrap();

        let mut names: Vec<&str> = timeline.branches().iter().map(|b| b.name.as_str()).collect();
        names.sort_unstable();
        assert_eq!(names, vec!["career", "main-2", "relocation"]);
        assert_eq!(timeline.branch_commits("career").len(), 2);
        assert_eq!(timeline.branch_commits("main-2").len(), 1);
    }

    proptest! {
        #[test]
        fn prop_branch_count_matches_distinct_labels(
            picks in prop::collection::vec(0usize..6, 1..12),
            merge in any::<bool>(),
        ) {
            const POOL: [&str; 6] = ["Career", " career", "CAREER ", "Main", "main", "Relocation"];
            let labels: Vec<&str> = picks.iter().map(|&i| POOL[i]).collect();
            let distinct: HashSet<String> = labels.iter().map(|l| l.trim().to_lowercase()).collect();

            let validation = major_events(&labels).unwrap();
            let timeline = build_timeline(validation.events, GraphOptions { merge_branches: merge }).unwrap();
            prop_assert_eq!(timeline.branches().len(), distinct.len());
            prop_assert!(timeline.branches().iter().all(|b| !b.name.is_main()));
        }
    }
}
