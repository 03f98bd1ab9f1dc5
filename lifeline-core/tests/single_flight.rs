//! Concurrency tests: request coalescing, cache reuse and cancellation.
//!
//! A scripted generator stands in for the model so that the extractor can be
//! made slow on purpose and its calls counted.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use lifeline_core::{
    AgentRole, CancelToken, RetryPolicy, ScriptedGenerator, SynthesisConfig, SynthesisError,
    Synthesizer, TimelineRequest,
};

const NARRATIVE: &str = "In 2021 I adopted a cat named Miso. I quit my job to start a company in 2022.";

fn scripted(extractor_delay: Duration) -> ScriptedGenerator {
    ScriptedGenerator::new()
        .stall(AgentRole::Extractor, extractor_delay)
        .reply(
            AgentRole::Extractor,
            r#"[
                {"span": "In 2021 I adopted a cat named Miso.", "temporal_reference": "In 2021"},
                {"span": "I quit my job to start a company in 2022.", "temporal_reference": "2022"}
            ]"#,
        )
        .reply(
            AgentRole::DateResolver,
            r#"[{"index": 0, "date": "2021", "precision": "year"},
                {"index": 1, "date": "2022", "precision": "year"}]"#,
        )
        .reply(
            AgentRole::CommitMessageGenerator,
            r#"[{"index": 0, "message": "Adopt Miso"},
                {"index": 1, "message": "Start a company"}]"#,
        )
        .reply(
            AgentRole::BranchClassifier,
            r#"[{"index": 0, "is_major_change": false},
                {"index": 1, "is_major_change": true, "branch": "career"}]"#,
        )
}

fn config() -> SynthesisConfig {
    SynthesisConfig::default().with_retry(RetryPolicy::no_retries())
}

#[tokio::test]
async fn test_concurrent_identical_requests_share_one_run() {
    let generator = Arc::new(scripted(Duration::from_millis(200)));
    let synthesizer = Synthesizer::with_generator(config(), generator.clone()).await;

    let reports = join_all((0..8).map(|i| {
        // Whitespace differences normalise to the same key.
        let text = if i % 2 == 0 {
            NARRATIVE.to_string()
        } else {
            format!("  {NARRATIVE}  ")
        };
        synthesizer.synthesize(TimelineRequest::new(text))
    }))
    .await;

    let reports: Vec<_> = reports.into_iter().map(Result::unwrap).collect();
    assert_eq!(synthesizer.extractor_invocations(), 1);
    assert_eq!(generator.calls(AgentRole::Extractor), 1);
    assert_eq!(generator.calls(AgentRole::BranchClassifier), 1);

    assert_eq!(reports.iter().filter(|r| !r.cache_hit).count(), 1);
    let first = &reports[0];
    for report in &reports {
        assert_eq!(report.input_hash, first.input_hash);
        assert_eq!(report.timeline, first.timeline);
    }
}

#[tokio::test]
async fn test_concurrent_distinct_requests_run_separately() {
    let generator = Arc::new(scripted(Duration::from_millis(50)));
    let synthesizer = Synthesizer::with_generator(config(), generator.clone()).await;

    let reports = join_all([
        synthesizer.synthesize(TimelineRequest::new(NARRATIVE)),
        synthesizer.synthesize(TimelineRequest::new(format!("{NARRATIVE} That year was busy."))),
    ])
    .await;

    assert!(reports.iter().all(Result::is_ok));
    assert_eq!(synthesizer.extractor_invocations(), 2);
    assert_eq!(generator.calls(AgentRole::Extractor), 2);
}

#[tokio::test]
async fn test_rerun_after_completion_is_served_from_cache() {
    let generator = Arc::new(scripted(Duration::ZERO));
    let synthesizer = Synthesizer::with_generator(config(), generator.clone()).await;

    let first = synthesizer.synthesize(TimelineRequest::new(NARRATIVE)).await.unwrap();
    let second = synthesizer.synthesize(TimelineRequest::new(NARRATIVE)).await.unwrap();

    assert!(!first.cache_hit);
    assert!(second.cache_hit);
    assert!(Arc::ptr_eq(&first.timeline, &second.timeline));
    assert_eq!(generator.calls(AgentRole::Extractor), 1);
    assert_eq!(generator.calls(AgentRole::DateResolver), 1);
}

#[tokio::test]
async fn test_disk_cache_survives_a_new_synthesizer() {
    let dir = tempfile::tempdir().unwrap();
    let config = config().with_cache_dir(dir.path());

    let generator = Arc::new(scripted(Duration::ZERO));
    let first = Synthesizer::with_generator(config.clone(), generator.clone())
        .await
        .synthesize(TimelineRequest::new(NARRATIVE))
        .await
        .unwrap();

    let fresh = Arc::new(scripted(Duration::ZERO));
    let restarted = Synthesizer::with_generator(config, fresh.clone()).await;
    let second = restarted.synthesize(TimelineRequest::new(NARRATIVE)).await.unwrap();

    assert!(second.cache_hit);
    assert_eq!(first.timeline, second.timeline);
    assert_eq!(restarted.extractor_invocations(), 0);
    assert_eq!(fresh.calls(AgentRole::Extractor), 0);
}

#[tokio::test]
async fn test_cancel_mid_run_returns_cancelled() {
    let generator = Arc::new(scripted(Duration::from_secs(10)));
    let synthesizer = Synthesizer::with_generator(config().without_cache(), generator).await;
    let cancel = CancelToken::new();

    let started = Instant::now();
    let (result, ()) = tokio::join!(
        synthesizer.synthesize_with_cancel(TimelineRequest::new(NARRATIVE), &cancel),
        async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        }
    );

    assert_eq!(result.unwrap_err(), SynthesisError::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_cancelled_caller_does_not_poison_shared_run() {
    let generator = Arc::new(scripted(Duration::from_millis(200)));
    let synthesizer = Synthesizer::with_generator(config(), generator.clone()).await;
    let cancel = CancelToken::new();

    let (cancelled, patient, ()) = tokio::join!(
        synthesizer.synthesize_with_cancel(TimelineRequest::new(NARRATIVE), &cancel),
        synthesizer.synthesize(TimelineRequest::new(NARRATIVE)),
        async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        }
    );

    assert_eq!(cancelled.unwrap_err(), SynthesisError::Cancelled);
    let report = patient.unwrap();
    assert_eq!(report.timeline.branch_commits("career").len(), 1);
}
