//! Model-backed agents against a scripted generator.
//!
//! These cover how model answers flow into the timeline and how each agent
//! degrades when the model misbehaves.

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use lifeline_core::{
    AgentRole, DatePrecision, DiagnosticKind, RetryPolicy, ScriptedGenerator, SynthesisConfig,
    Synthesizer, TimelineRequest,
};

const NARRATIVE: &str = "In 2021 I adopted a cat named Miso. I quit my job to start a company in 2022.";

const EXTRACTED: &str = r#"Here are the events:
```json
[
  {"span": "In 2021 I adopted a cat named Miso.", "temporal_reference": "In 2021"},
  {"span": "I quit my job to start a company in 2022.", "temporal_reference": "in 2022"}
]
```"#;

const DATES: &str = r#"[
  {"index": 0, "date": "2021-03-14", "precision": "day", "confidence": 0.9},
  {"index": 1, "date": "2022", "precision": "year"}
]"#;

const LABELS: &str = r#"[
  {"index": 0, "message": "Adopt Miso the cat.", "description": "Brought home a grey cat called Miso."},
  {"index": 1, "message": "Start a company"}
]"#;

const BRANCHES: &str = r#"[
  {"index": 0, "is_major_change": false},
  {"index": 1, "is_major_change": true, "branch": "Career Change"}
]"#;

fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn fast_retries(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(2),
        call_timeout: Duration::from_secs(5),
    }
}

fn config() -> SynthesisConfig {
    SynthesisConfig::default()
        .without_cache()
        .with_retry(RetryPolicy::no_retries())
}

fn full_script() -> ScriptedGenerator {
    ScriptedGenerator::new()
        .reply(AgentRole::Extractor, EXTRACTED)
        .reply(AgentRole::DateResolver, DATES)
        .reply(AgentRole::CommitMessageGenerator, LABELS)
        .reply(AgentRole::BranchClassifier, BRANCHES)
}

#[tokio::test]
async fn test_model_answers_shape_the_timeline() {
    let generator = Arc::new(full_script());
    let synthesizer = Synthesizer::with_generator(config(), generator.clone()).await;
    let report = synthesizer.synthesize(TimelineRequest::new(NARRATIVE)).await.unwrap();

    assert!(report.diagnostics.is_empty(), "{:?}", report.diagnostics);
    let timeline = &report.timeline;

    let main = timeline.main_line();
    assert_eq!(main.len(), 2);
    assert_eq!(main[1].message, "Adopt Miso the cat");
    assert_eq!(main[1].description, "Brought home a grey cat called Miso.");
    assert_eq!(main[1].provenance, vec!["In 2021 I adopted a cat named Miso.".to_string()]);

    let branch = timeline.branch_commits("career-change");
    assert_eq!(branch.len(), 1);
    assert_eq!(branch[0].message, "Start a company");
    // A missing description falls back to the source text.
    assert_eq!(branch[0].description, "I quit my job to start a company in 2022.");

    for role in [
        AgentRole::Extractor,
        AgentRole::DateResolver,
        AgentRole::CommitMessageGenerator,
        AgentRole::BranchClassifier,
    ] {
        assert_eq!(generator.calls(role), 1, "{role:?}");
    }
    assert!(generator.prompts(AgentRole::Extractor)[0].contains("adopted a cat named Miso"));
}

#[tokio::test]
async fn test_model_dates_never_exceed_the_reference() {
    let generator = Arc::new(full_script());
    let synthesizer = Synthesizer::with_generator(config(), generator).await;
    let report = synthesizer.synthesize(TimelineRequest::new(NARRATIVE)).await.unwrap();

    // The text only says "In 2021"; the model's day is not trusted.
    let adopted = &report.timeline.main_line()[1];
    assert_eq!(adopted.precision, DatePrecision::Year);
    assert_eq!(adopted.date, ymd(2021, 1, 1));
}

#[tokio::test]
async fn test_failing_date_resolver_falls_back_to_heuristic() {
    let generator = Arc::new(full_script().fail_next(AgentRole::DateResolver, 10));
    let synthesizer = Synthesizer::with_generator(config(), generator.clone()).await;
    let report = synthesizer.synthesize(TimelineRequest::new(NARRATIVE)).await.unwrap();

    assert!(report.has_diagnostic(DiagnosticKind::StageFallback));
    assert_eq!(generator.calls(AgentRole::DateResolver), 1);

    let dates: Vec<_> = report.timeline.events().map(|c| c.date).collect();
    assert_eq!(dates, vec![ymd(2021, 1, 1), ymd(2022, 1, 1)]);
}

#[tokio::test]
async fn test_transient_failure_is_retried() {
    let generator = Arc::new(full_script().fail_next(AgentRole::DateResolver, 1));
    let synthesizer =
        Synthesizer::with_generator(config().with_retry(fast_retries(2)), generator.clone()).await;
    let report = synthesizer.synthesize(TimelineRequest::new(NARRATIVE)).await.unwrap();

    assert!(!report.has_diagnostic(DiagnosticKind::StageFallback));
    assert_eq!(generator.calls(AgentRole::DateResolver), 2);
}

#[tokio::test]
async fn test_slow_labeller_times_out_to_heuristic() {
    let generator = Arc::new(full_script().stall(AgentRole::CommitMessageGenerator, Duration::from_secs(5)));
    let retry = RetryPolicy {
        call_timeout: Duration::from_millis(50),
        ..RetryPolicy::no_retries()
    };
    let synthesizer = Synthesizer::with_generator(config().with_retry(retry), generator).await;
    let report = synthesizer.synthesize(TimelineRequest::new(NARRATIVE)).await.unwrap();

    assert!(report.has_diagnostic(DiagnosticKind::StageFallback));
    let messages: Vec<_> = report.timeline.events().map(|c| c.message.clone()).collect();
    assert!(messages.contains(&"Adopt a cat named Miso".to_string()));
}

#[tokio::test]
async fn test_label_gap_uses_source_text() {
    let generator = Arc::new(
        ScriptedGenerator::new()
            .reply(AgentRole::Extractor, EXTRACTED)
            .reply(AgentRole::DateResolver, DATES)
            .reply(AgentRole::CommitMessageGenerator, r#"[{"index": 0, "message": "Adopt Miso"}]"#)
            .reply(AgentRole::BranchClassifier, BRANCHES),
    );
    let synthesizer = Synthesizer::with_generator(config(), generator).await;
    let report = synthesizer.synthesize(TimelineRequest::new(NARRATIVE)).await.unwrap();

    let gap = report
        .diagnostics
        .iter()
        .find(|d| d.kind == DiagnosticKind::LabelGenerationFailure)
        .expect("label gap is reported");
    assert_eq!(gap.event_index, Some(1));
    assert_eq!(report.timeline.branch_commits("career-change").len(), 1);
}

#[tokio::test]
async fn test_unparseable_extraction_falls_back() {
    let generator = Arc::new(
        ScriptedGenerator::new()
            .reply(AgentRole::Extractor, "I could not find anything.")
            .reply(AgentRole::DateResolver, DATES)
            .reply(AgentRole::CommitMessageGenerator, LABELS)
            .reply(AgentRole::BranchClassifier, BRANCHES),
    );
    let synthesizer = Synthesizer::with_generator(config(), generator).await;
    let report = synthesizer.synthesize(TimelineRequest::new(NARRATIVE)).await.unwrap();

    assert!(report.has_diagnostic(DiagnosticKind::StageFallback));
    assert_eq!(report.timeline.events().count(), 2);
}

#[tokio::test]
async fn test_mention_order_follows_the_narrative() {
    let narrative = "In 2020 I moved to Lisbon for work. In 2020 I adopted a dog named Rex.";
    let generator = Arc::new(
        ScriptedGenerator::new()
            .reply(
                AgentRole::Extractor,
                r#"[
                  {"span": "In 2020 I adopted a dog named Rex.", "temporal_reference": "In 2020"},
                  {"span": "In 2020 I moved to Lisbon for work.", "temporal_reference": "In 2020"}
                ]"#,
            )
            .reply(
                AgentRole::DateResolver,
                r#"[{"index": 0, "date": "2020", "precision": "year"}, {"index": 1, "date": "2020", "precision": "year"}]"#,
            )
            .reply(
                AgentRole::CommitMessageGenerator,
                r#"[{"index": 0, "message": "Move to Lisbon for work"}, {"index": 1, "message": "Adopt a dog named Rex"}]"#,
            )
            .reply(
                AgentRole::BranchClassifier,
                r#"[{"index": 0, "is_major_change": true, "branch": "Relocation"}, {"index": 1, "is_major_change": false}]"#,
            ),
    );
    let synthesizer = Synthesizer::with_generator(config(), generator).await;
    let report = synthesizer.synthesize(TimelineRequest::new(narrative)).await.unwrap();
    let timeline = &report.timeline;

    let moved = &timeline.branch_commits("relocation")[0];
    assert_eq!(moved.message, "Move to Lisbon for work");
    assert_eq!(moved.mention_order, Some(0));

    let branch = timeline.branch("relocation").unwrap();
    assert_eq!(Some(branch.root), timeline.root().map(|c| c.id));

    let main = timeline.main_line();
    assert_eq!(main.len(), 2);
    assert_eq!(main[1].message, "Adopt a dog named Rex");
    assert_eq!(main[1].mention_order, Some(1));
}
