//! Engine configuration.

use chrono::NaiveDate;
use std::path::PathBuf;
use std::time::Duration;

/// Timeout and retry policy for every call to the text-generation service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Backoff before the first retry; doubles on every retry.
    pub initial_backoff: Duration,
    /// Upper bound on a single backoff.
    pub max_backoff: Duration,
    /// Timeout for one attempt.
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(4),
            call_timeout: Duration::from_secs(45),
        }
    }
}

impl RetryPolicy {
    /// A policy that gives up after one attempt.
    pub fn no_retries() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Backoff to wait before retry number `retry` (1-based).
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Granularity knobs for event extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionConfig {
    /// Fragments with fewer words than this are not events.
    pub min_words: usize,
    /// Hard cap on events per narrative.
    pub max_events: usize,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            min_words: 3,
            max_events: 64,
        }
    }
}

/// Cache configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Directory for the durable tier. Memory only when `None`.
    pub directory: Option<PathBuf>,
    pub max_entries: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            directory: None,
            max_entries: 1024,
        }
    }
}

/// Configuration for a [`Synthesizer`](crate::Synthesizer).
#[derive(Debug, Clone)]
pub struct SynthesisConfig {
    /// Model for the agents (defaults to the client's model).
    pub model: Option<String>,

    /// Maximum tokens per agent answer.
    pub max_tokens: usize,

    /// Temperature for agent calls.
    pub temperature: Option<f32>,

    pub retry: RetryPolicy,

    /// Size of the worker pool bounding concurrent external calls.
    pub max_concurrent_calls: usize,

    pub extraction: ExtractionConfig,

    /// Bound on the short commit message, in characters.
    pub max_message_len: usize,

    /// Last-resort anchor for undated events when nothing in the
    /// narrative or the request gives one.
    pub default_date: NaiveDate,

    /// Append a merge commit to main once a branch has no events left.
    pub merge_branches: bool,

    pub cache: CacheConfig,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            model: None,
            max_tokens: 2048,
            temperature: Some(0.0),
            retry: RetryPolicy::default(),
            max_concurrent_calls: 4,
            extraction: ExtractionConfig::default(),
            max_message_len: 72,
            default_date: NaiveDate::from_ymd_opt(2023, 1, 1).unwrap_or_default(),
            merge_branches: false,
            cache: CacheConfig::default(),
        }
    }
}

impl SynthesisConfig {
    /// Start from the defaults and apply `LIFELINE_*` environment overrides.
    ///
    /// Recognised: `LIFELINE_MODEL`, `LIFELINE_CACHE_DIR`,
    /// `LIFELINE_MAX_CONCURRENCY`, `LIFELINE_MERGE_BRANCHES`.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(model) = std::env::var("LIFELINE_MODEL") {
            if !model.trim().is_empty() {
                config.model = Some(model);
            }
        }
        if let Ok(dir) = std::env::var("LIFELINE_CACHE_DIR") {
            if !dir.trim().is_empty() {
                config.cache.directory = Some(PathBuf::from(dir));
            }
        }
        if let Some(n) = std::env::var("LIFELINE_MAX_CONCURRENCY")
            .ok()
            .and_then(|v| v.trim().parse::<usize>().ok())
        {
            config.max_concurrent_calls = n.max(1);
        }
        if let Ok(v) = std::env::var("LIFELINE_MERGE_BRANCHES") {
            config.merge_branches = matches!(v.trim(), "1" | "true" | "yes");
        }

        config
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_max_tokens(mut self, tokens: usize) -> Self {
        self.max_tokens = tokens;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_concurrent_calls(mut self, n: usize) -> Self {
        self.max_concurrent_calls = n.max(1);
        self
    }

    pub fn with_extraction(mut self, extraction: ExtractionConfig) -> Self {
        self.extraction = extraction;
        self
    }

    pub fn with_max_message_len(mut self, len: usize) -> Self {
        self.max_message_len = len.max(8);
        self
    }

    pub fn with_default_date(mut self, date: NaiveDate) -> Self {
        self.default_date = date;
        self
    }

    pub fn with_merge_branches(mut self, merge: bool) -> Self {
        self.merge_branches = merge;
        self
    }

    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache.directory = Some(dir.into());
        self
    }

    pub fn without_cache(mut self) -> Self {
        self.cache.enabled = false;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_retries: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(350),
            call_timeout: Duration::from_secs(1),
        };
        assert_eq!(policy.backoff_for(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(350));
        assert_eq!(policy.backoff_for(10), Duration::from_millis(350));
    }

    #[test]
    fn test_builder() {
        let config = SynthesisConfig::default()
            .with_model("claude-haiku")
            .with_max_concurrent_calls(0)
            .with_merge_branches(true)
            .without_cache();

        assert_eq!(config.model.as_deref(), Some("claude-haiku"));
        assert_eq!(config.max_concurrent_calls, 1);
        assert!(config.merge_branches);
        assert!(!config.cache.enabled);
    }

    #[test]
    fn test_defaults() {
        let config = SynthesisConfig::default();
        assert_eq!(config.max_message_len, 72);
        assert_eq!(config.retry.max_retries, 2);
        assert_eq!(config.default_date, NaiveDate::from_ymd_opt(2023, 1, 1).unwrap());
        assert!(config.cache.enabled);
    }
}
