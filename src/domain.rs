//! Core data model shared by every component of the translation engine.
//!
//! These types mirror the shapes described by the orchestration spec:
//! a `Cue` is the unit of work, a `ContextWindow` disambiguates it, and
//! a `CacheKey`/`CacheEntry` pair is what gets persisted once a cue has
//! been translated.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single timed subtitle segment.
///
/// `text` is the only field ever rewritten once a `Cue` has been parsed
/// out of a file; `start`/`end` are immutable for the lifetime of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct Cue {
    pub index: usize,
    pub start: Duration,
    pub end: Duration,
    pub text: String,
}

/// The ordered sequence of neighboring cue texts used to disambiguate a
/// translation. `window(i, w)` is `[max(0, i-w) .. min(len, i+w+1))`.
pub fn context_window(cues: &[Cue], i: usize, w: usize) -> Vec<&str> {
    let start = i.saturating_sub(w);
    let end = (i + w + 1).min(cues.len());
    cues[start..end].iter().map(|c| c.text.as_str()).collect()
}

/// Content-addressed digest of a context window.
///
/// Two windows with identical trimmed, non-empty content yield identical
/// fingerprints; whitespace-only differences must not change the digest,
/// so we normalize before hashing rather than hashing raw bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContextFingerprint(pub [u8; 16]);

impl ContextFingerprint {
    pub fn of(texts: &[&str]) -> Self {
        let mut hasher = blake3::Hasher::new();
        for text in texts {
            let trimmed = text.trim();
            if trimmed.is_empty() {
                continue;
            }
            hasher.update(trimmed.as_bytes());
            hasher.update(b"\0");
        }
        let digest = hasher.finalize();
        let mut out = [0u8; 16];
        out.copy_from_slice(&digest.as_bytes()[..16]);
        Self(out)
    }

    pub fn to_hex(self) -> String {
        hex_encode(&self.0)
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{:02x}", b));
    }
    s
}

/// Composite primary key for a cached translation.
///
/// Equality is structural: two keys with equal `source_text`,
/// `context_fingerprint`, and `model_id` are the same cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub source_text: String,
    pub context_fingerprint: ContextFingerprint,
    pub model_id: String,
}

impl CacheKey {
    pub fn new(source_text: impl Into<String>, context_fingerprint: ContextFingerprint, model_id: impl Into<String>) -> Self {
        Self {
            source_text: source_text.into(),
            context_fingerprint,
            model_id: model_id.into(),
        }
    }
}

/// A persisted translation record.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub target_text: String,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    pub usage_count: u64,
}

impl CacheEntry {
    /// Entries with empty source or target text are never persisted;
    /// callers should check this before handing the entry to the store.
    pub fn is_storable(&self) -> bool {
        !self.key.source_text.trim().is_empty() && !self.target_text.trim().is_empty()
    }
}

/// Descriptor for a model, consumed only by the collaborator that
/// chooses a model. The engine itself treats model ids as opaque
/// strings and never inspects this type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub id: String,
    pub provider: String,
    pub context_length: u32,
    pub suggested_parallelism: usize,
    pub capabilities: HashMap<String, f32>,
    pub available: bool,
}

/// Ephemeral per-request bookkeeping used by the retry engine and
/// surfaced in logs; never persisted.
#[derive(Debug, Clone)]
pub struct RetryRecord {
    pub error_class: crate::error::ErrorClass,
    pub attempt_no: u32,
    pub model_id: String,
    pub elapsed_ms: u64,
}

/// Per-file snapshot sufficient to resume a translation without
/// redundant provider calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub input_file_path: String,
    pub target_lang: String,
    pub model_id: String,
    pub translated_indices: Vec<usize>,
    pub stats: TranslationStats,
    pub glossary: HashMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

impl Checkpoint {
    /// Two checkpoints "match the current job" iff these three fields
    /// are all equal.
    pub fn matches_job(&self, input_file_path: &str, target_lang: &str, model_id: &str) -> bool {
        self.input_file_path == input_file_path
            && self.target_lang == target_lang
            && self.model_id == model_id
    }
}

/// Monotonic counters plus two timestamps. Derived values (speed,
/// elapsed) are computed from these counters and never persisted
/// separately.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TranslationStats {
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub total_cues: u64,
    pub translated: u64,
    pub failed: u64,
    pub skipped: u64,
    pub cache_hits: u64,
    pub total_chars: u64,
    pub batch_count: u64,
    pub retry_count: u64,
    /// Total number of provider calls made (including retries and
    /// fallback attempts). Diagnostic only, not part of the spec's
    /// bookkeeping invariant.
    pub api_calls_made: u64,
    /// Sum of observed per-call latencies in milliseconds; divide by
    /// `api_calls_made` for the average. Kept as a raw sum rather than
    /// a running average so it stays a plain monotonic counter.
    pub total_response_time_ms: u64,
}

impl TranslationStats {
    pub fn elapsed(&self) -> Option<chrono::Duration> {
        let start = self.started_at?;
        let end = self.finished_at.unwrap_or_else(Utc::now);
        Some(end - start)
    }

    pub fn avg_response_time_ms(&self) -> f64 {
        if self.api_calls_made == 0 {
            0.0
        } else {
            self.total_response_time_ms as f64 / self.api_calls_made as f64
        }
    }

    /// `translated + failed + skipped == total_cues` at termination.
    pub fn is_balanced(&self) -> bool {
        self.translated + self.failed + self.skipped == self.total_cues
    }
}

/// Per-file map from source-language terms to their chosen
/// target-language canonical forms. First-occurrence-wins: the first
/// candidate seen for a given surface form becomes canonical for the
/// rest of the file.
pub type Glossary = HashMap<String, String>;

/// Display mode controlling how a translated cue is written back.
///
/// `Bilingual` and `OriginalAbove` are intentionally the same
/// rendering: this mirrors an equivalence present in the source system
/// and is preserved rather than collapsed, so both CLI spellings keep
/// working.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DisplayMode {
    #[default]
    TranslationOnly,
    TranslationAbove,
    OriginalAbove,
    Bilingual,
}

impl DisplayMode {
    pub fn render(self, original: &str, translated: &str) -> String {
        match self {
            DisplayMode::TranslationOnly => translated.to_string(),
            DisplayMode::TranslationAbove => format!("{}\n{}", translated, original),
            DisplayMode::OriginalAbove | DisplayMode::Bilingual => {
                format!("{}\n{}", original, translated)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cue(i: usize, text: &str) -> Cue {
        Cue {
            index: i,
            start: Duration::from_secs(i as u64),
            end: Duration::from_secs(i as u64 + 1),
            text: text.to_string(),
        }
    }

    #[test]
    fn context_window_respects_bounds() {
        let cues = vec![cue(0, "a"), cue(1, "b"), cue(2, "c"), cue(3, "d")];
        assert_eq!(context_window(&cues, 0, 1), vec!["a", "b"]);
        assert_eq!(context_window(&cues, 3, 1), vec!["c", "d"]);
        assert_eq!(context_window(&cues, 1, 5), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn fingerprint_ignores_whitespace_only_differences() {
        let a = ContextFingerprint::of(&["Hi.", "Hello.", "Bye."]);
        let b = ContextFingerprint::of(&["Hi. ", "Hello.", " Bye."]);
        assert_eq!(a, b);
    }

    #[test]
    fn fingerprint_differs_on_content() {
        let a = ContextFingerprint::of(&["Hi.", "Hello."]);
        let b = ContextFingerprint::of(&["Hi.", "Goodbye."]);
        assert_ne!(a, b);
    }

    #[test]
    fn cache_key_equality_is_structural() {
        let fp = ContextFingerprint::of(&["x"]);
        let a = CacheKey::new("Hello.", fp, "model-a");
        let b = CacheKey::new("Hello.", fp, "model-a");
        assert_eq!(a, b);
    }

    #[test]
    fn entry_with_empty_text_is_not_storable() {
        let fp = ContextFingerprint::of(&["x"]);
        let entry = CacheEntry {
            key: CacheKey::new("  ", fp, "m"),
            target_text: "ok".to_string(),
            created_at: Utc::now(),
            last_used: Utc::now(),
            usage_count: 1,
        };
        assert!(!entry.is_storable());
    }

    #[test]
    fn stats_balance_invariant() {
        let stats = TranslationStats {
            total_cues: 10,
            translated: 7,
            failed: 2,
            skipped: 1,
            ..Default::default()
        };
        assert!(stats.is_balanced());
    }

    #[test]
    fn bilingual_and_original_above_render_identically() {
        assert_eq!(
            DisplayMode::Bilingual.render("hi", "bonjour"),
            DisplayMode::OriginalAbove.render("hi", "bonjour")
        );
    }
}
