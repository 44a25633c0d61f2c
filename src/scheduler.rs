//! Batch Scheduler (C7).
//!
//! Drives adaptive batch sizing over the pending-index list, probing
//! the cache before dispatching misses as one `tokio::task` per cue —
//! generalizing the teacher's `tokio::spawn`/`JoinHandle` orchestration
//! in `main.rs` to a dynamic per-batch task count via `JoinSet`.

use std::collections::HashSet;
use std::sync::Arc;

use crate::collaborators::PromptSource;
use crate::provider::ProviderKind;

/// `B` grows by 1.5x after an all-success batch, halves after any
/// failure, and is clamped to `[1, max_batch_size]`.
pub struct AdaptiveBatchSize {
    current: usize,
    max_batch_size: usize,
}

impl AdaptiveBatchSize {
    pub fn initial(provider: ProviderKind, user_parallelism: usize) -> Self {
        let current = match provider {
            ProviderKind::LocalHttp => user_parallelism.min(20),
            ProviderKind::CloudOpenAi => user_parallelism.min(5),
        }
        .max(1);
        Self {
            current,
            max_batch_size: 50,
        }
    }

    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size.max(1);
        self
    }

    pub fn current(&self) -> usize {
        self.current
    }

    pub fn record_batch_outcome(&mut self, any_failure: bool) {
        if any_failure {
            self.current = (self.current / 2).max(1);
        } else {
            self.current = ((self.current as f64 * 1.5).floor() as usize).min(self.max_batch_size);
        }
    }
}

/// Splits the still-pending cue indices into batches of the scheduler's
/// current adaptive size, skipping anything already translated.
pub fn next_batch(pending: &[usize], translated_indices: &HashSet<usize>, batch_size: usize) -> Vec<usize> {
    pending
        .iter()
        .copied()
        .filter(|i| !translated_indices.contains(i))
        .take(batch_size.max(1))
        .collect()
}

/// One item of work handed to a translation task: the cue index plus
/// the data needed to either short-circuit via cache or invoke the
/// provider.
pub struct WorkItem {
    pub cue_index: usize,
    pub source_text: String,
    pub context_texts: Vec<String>,
}

/// Outcome of processing a single cue within a batch.
pub enum CueOutcome {
    /// `model_used` is the model id that actually produced `text` —
    /// the requested model unless a retry fallback substituted one,
    /// per spec.md §4.5's cache-attribution default.
    Translated { cue_index: usize, text: String, from_cache: bool, model_used: String },
    Failed { cue_index: usize },
}

/// Splits a batch's work items into cache hits (resolved
/// synchronously) and the remaining misses that still need a provider
/// call, consulting memory cache then disk cache per spec.md §4.1/4.2
/// layering.
pub fn probe_cache(
    items: Vec<WorkItem>,
    memory_cache: &crate::memory_cache::MemoryCache,
    cache_store: &crate::cache::CacheStore,
    model_id: &str,
) -> (Vec<CueOutcome>, Vec<WorkItem>) {
    let mut hits = Vec::new();
    let mut misses = Vec::new();

    for item in items {
        let context_refs: Vec<&str> = item.context_texts.iter().map(|s| s.as_str()).collect();
        let fingerprint = crate::domain::ContextFingerprint::of(&context_refs);

        if let Some(text) = memory_cache.get(&item.source_text, fingerprint, model_id) {
            hits.push(CueOutcome::Translated {
                cue_index: item.cue_index,
                text,
                from_cache: true,
                model_used: model_id.to_string(),
            });
            continue;
        }

        if let Some(text) = cache_store.get(&item.source_text, fingerprint, model_id) {
            memory_cache.put(&item.source_text, &text, fingerprint, model_id);
            hits.push(CueOutcome::Translated {
                cue_index: item.cue_index,
                text,
                from_cache: true,
                model_used: model_id.to_string(),
            });
            continue;
        }

        misses.push(item);
    }

    (hits, misses)
}

/// Arc-wrapped collaborators shared across the tasks spawned for one
/// batch's misses; kept as a small bundle so `spawn` closures don't
/// need a dozen individual clones.
#[derive(Clone)]
pub struct SchedulerDeps {
    pub provider: Arc<dyn crate::provider::Provider>,
    pub governor: Arc<crate::governor::Governor>,
    pub concurrency: Arc<crate::concurrency::ConcurrencyController>,
    pub prompt_source: Arc<dyn PromptSource>,
}

/// Dispatches one task per miss, each acquiring a concurrency permit
/// before calling the provider with retry/fallback handling. Returns
/// one `CueOutcome` per dispatched item, in completion order (the
/// caller re-sorts by `cue_index` before writing output, since
/// spec.md guarantees written order, not completion order).
pub async fn dispatch_misses(
    misses: Vec<WorkItem>,
    deps: SchedulerDeps,
    model_id: &str,
    fallback_models: &[String],
) -> Vec<CueOutcome> {
    let mut join_set = tokio::task::JoinSet::new();

    for item in misses {
        let deps = deps.clone();
        let model_id = model_id.to_string();
        let fallback_models = fallback_models.to_vec();

        join_set.spawn(async move {
            let _permit = deps.concurrency.acquire().await;
            let cue_index = item.cue_index;

            let context_refs: Vec<&str> = item.context_texts.iter().map(|s| s.as_str()).collect();
            let estimated_tokens = crate::governor::estimate_tokens(&item.source_text);
            deps.governor.admit(deps.provider.kind(), estimated_tokens).await;

            let messages = deps
                .prompt_source
                .build(&item.source_text, &context_refs, deps.provider.kind(), &model_id);

            let started = std::time::Instant::now();
            let outcome = crate::retry::run_with_retry(
                deps.provider.as_ref(),
                &messages,
                &model_id,
                fallback_models.as_slice(),
            )
            .await;
            deps.concurrency.record_latency(started.elapsed());

            match outcome {
                Ok((result, model_used)) => {
                    deps.governor
                        .record_tokens(deps.provider.kind(), result.usage.prompt_tokens + result.usage.completion_tokens)
                        .await;
                    CueOutcome::Translated {
                        cue_index,
                        text: result.text,
                        from_cache: false,
                        model_used,
                    }
                }
                Err(_) => CueOutcome::Failed { cue_index },
            }
        });
    }

    let mut outcomes = Vec::new();
    while let Some(result) = join_set.join_next().await {
        if let Ok(outcome) = result {
            outcomes.push(outcome);
        }
    }
    outcomes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_batch_size_differs_by_provider() {
        let local = AdaptiveBatchSize::initial(ProviderKind::LocalHttp, 30);
        let cloud = AdaptiveBatchSize::initial(ProviderKind::CloudOpenAi, 30);
        assert_eq!(local.current(), 20);
        assert_eq!(cloud.current(), 5);
    }

    #[test]
    fn success_grows_batch_size_by_1_5x_capped_at_max() {
        let mut batch = AdaptiveBatchSize::initial(ProviderKind::CloudOpenAi, 10).with_max_batch_size(8);
        batch.record_batch_outcome(false);
        assert_eq!(batch.current(), 7); // floor(5*1.5) = 7
        batch.record_batch_outcome(false);
        assert_eq!(batch.current(), 8); // floor(7*1.5)=10, capped at 8
    }

    #[test]
    fn failure_halves_batch_size_with_floor_of_one() {
        let mut batch = AdaptiveBatchSize::initial(ProviderKind::LocalHttp, 3);
        batch.record_batch_outcome(true);
        assert_eq!(batch.current(), 1);
        batch.record_batch_outcome(true);
        assert_eq!(batch.current(), 1);
    }

    #[test]
    fn next_batch_skips_already_translated_indices() {
        let pending = vec![0, 1, 2, 3, 4];
        let mut translated = HashSet::new();
        translated.insert(1);
        translated.insert(3);
        let batch = next_batch(&pending, &translated, 10);
        assert_eq!(batch, vec![0, 2, 4]);
    }

    #[test]
    fn next_batch_respects_size_limit() {
        let pending = vec![0, 1, 2, 3, 4];
        let translated = HashSet::new();
        let batch = next_batch(&pending, &translated, 2);
        assert_eq!(batch, vec![0, 1]);
    }
}
