//! Content-addressed timeline cache with single-flight coalescing.
//!
//! Two tiers: a bounded in-memory [`moka`] cache whose `try_get_with` runs
//! at most one computation per key at a time, and an optional directory of
//! JSON files that survives restarts. Only successful runs are stored.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::CacheConfig;
use crate::error::{CacheError, Diagnostic, SynthesisError, SynthesisResult};
use crate::model::{TemporalAnchor, TimelineRequest};
use crate::timeline::ValidatedTimeline;

const KEY_VERSION: &str = "lifeline-cache-v1";

/// One cached run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub input_hash: String,
    pub timeline: Arc<ValidatedTimeline>,
    pub diagnostics: Vec<Diagnostic>,
    pub created_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(input_hash: impl Into<String>, timeline: ValidatedTimeline, diagnostics: Vec<Diagnostic>) -> Self {
        Self {
            input_hash: input_hash.into(),
            timeline: Arc::new(timeline),
            diagnostics,
            created_at: Utc::now(),
        }
    }
}

/// Canonical form of narrative text: LF line endings, runs of spaces and
/// tabs collapsed, lines trimmed, blank-line runs collapsed, outer
/// whitespace removed.
pub fn normalize_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut blank_run = false;
    for line in text.replace("\r\n", "\n").replace('\r', "\n").lines() {
        let line = line.split_whitespace().collect::<Vec<_>>().join(" ");
        if line.is_empty() {
            blank_run = true;
            continue;
        }
        if !out.is_empty() {
            out.push('\n');
            if blank_run {
                out.push('\n');
            }
        }
        blank_run = false;
        out.push_str(&line);
    }
    out
}

/// Hex BLAKE3 over the normalised request and the output-affecting
/// configuration fingerprint.
pub fn cache_key(request: &TimelineRequest, fingerprint: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(KEY_VERSION.as_bytes());
    hasher.update(b"\0");
    hasher.update(fingerprint.as_bytes());
    hasher.update(b"\0");
    hasher.update(normalize_text(&request.text).as_bytes());
    hasher.update(b"\0");
    // An empty anchor resolves exactly like no anchor.
    let anchor = request.anchor.as_ref().filter(|a| **a != TemporalAnchor::default());
    let anchor = serde_json::to_string(&anchor).unwrap_or_default();
    hasher.update(anchor.as_bytes());
    hasher.update(b"\0");
    let candidates = serde_json::to_string(&request.candidates).unwrap_or_default();
    hasher.update(candidates.as_bytes());
    hasher.finalize().to_hex().to_string()
}

/// One JSON file per key.
#[derive(Debug, Clone)]
struct DiskStore {
    dir: PathBuf,
}

impl DiskStore {
    async fn open(dir: &Path) -> Result<Self, CacheError> {
        tokio::fs::create_dir_all(dir).await?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    async fn load(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let path = self.path_for(key);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let entry: CacheEntry = serde_json::from_str(&content)?;
        Ok(Some(entry))
    }

    async fn save(&self, entry: &CacheEntry) -> Result<(), CacheError> {
        let path = self.path_for(&entry.input_hash);
        let tmp = path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(entry)?;
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

/// Outcome of a cache lookup.
#[derive(Debug, Clone)]
pub struct CacheLookup {
    pub entry: Arc<CacheEntry>,
    /// False when this caller ran the computation.
    pub hit: bool,
    /// Durable-tier problems met by this caller.
    pub diagnostics: Vec<Diagnostic>,
}

/// The two-tier timeline cache.
#[derive(Clone)]
pub struct TimelineCache {
    memory: Cache<String, Arc<CacheEntry>>,
    disk: Option<DiskStore>,
}

impl TimelineCache {
    /// Open the cache, creating the durable directory if configured.
    pub async fn open(config: &CacheConfig) -> Result<Self, CacheError> {
        let disk = match &config.directory {
            Some(dir) => Some(DiskStore::open(dir).await?),
            None => None,
        };
        Ok(Self {
            memory: Cache::builder().max_capacity(config.max_entries).build(),
            disk,
        })
    }

    /// Return the entry for `key`, running `compute` if nobody has.
    ///
    /// Concurrent callers with the same key share one computation. A failed
    /// computation is handed to every waiting caller and is not stored.
    pub async fn get_or_compute<F>(&self, key: &str, compute: F) -> SynthesisResult<CacheLookup>
    where
        F: Future<Output = SynthesisResult<CacheEntry>> + Send,
    {
        let computed = Arc::new(AtomicBool::new(false));
        let problems = Arc::new(std::sync::Mutex::new(Vec::new()));

        let init = {
            let computed = computed.clone();
            let problems = problems.clone();
            let disk = self.disk.clone();
            let key = key.to_string();
            async move {
                if let Some(disk) = &disk {
                    match disk.load(&key).await {
                        Ok(Some(entry)) => {
                            debug!(key = %key, "Cache hit on disk");
                            return Ok(Arc::new(entry));
                        }
                        Ok(None) => {}
                        Err(e) => {
                            warn!(key = %key, error = %e, "Unreadable cache file, recomputing");
                            record(&problems, format!("cache file unreadable: {e}"));
                        }
                    }
                }

                computed.store(true, Ordering::SeqCst);
                let entry = compute.await?;

                if let Some(disk) = &disk {
                    if let Err(e) = disk.save(&entry).await {
                        warn!(key = %key, error = %e, "Failed to persist cache entry");
                        record(&problems, format!("cache write failed: {e}"));
                    }
                }
                Ok::<_, SynthesisError>(Arc::new(entry))
            }
        };

        let entry = self
            .memory
            .try_get_with(key.to_string(), init)
            .await
            .map_err(|e| (*e).clone())?;

        let diagnostics = problems
            .lock()
            .map(|mut p| std::mem::take(&mut *p))
            .unwrap_or_default();
        Ok(CacheLookup {
            entry,
            hit: !computed.load(Ordering::SeqCst),
            diagnostics,
        })
    }
}

fn record(problems: &std::sync::Mutex<Vec<Diagnostic>>, message: String) {
    if let Ok(mut problems) = problems.lock() {
        problems.push(Diagnostic::new(
            crate::error::DiagnosticKind::CacheUnavailable,
            message,
        ));
    }
}
