//! Retry/Fallback Engine (C5).
//!
//! Classifies provider failures into a closed taxonomy (`ErrorClass`,
//! `src/error.rs`), looks up a per-class policy, and computes backoff
//! delays. Model-fallback bookkeeping (at-most-once substitution) is
//! tracked per logical request via `FallbackState`.

use std::time::{Duration, Instant};

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::collaborators::PromptMessages;
use crate::error::ErrorClass;
use crate::provider::{Provider, ProviderError, TranslateResult};

/// Base delay for the exponential backoff formula. Not named
/// explicitly in the governing policy table; chosen to keep the
/// first retry close to human "blink and retry" latency.
const BASE_DELAY: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub max_elapsed: Duration,
    pub backoff_factor: f64,
    pub jitter: bool,
}

/// Per-class policy table. `CONTENT_FILTER`'s backoff factor is
/// unspecified (one attempt only, no retry ever happens) so any value
/// works; 1.0 is used for uniformity.
pub fn policy_for(class: ErrorClass) -> RetryPolicy {
    match class {
        ErrorClass::RateLimit => RetryPolicy {
            max_attempts: 8,
            max_elapsed: Duration::from_secs(300),
            backoff_factor: 1.5,
            jitter: true,
        },
        ErrorClass::Timeout => RetryPolicy {
            max_attempts: 4,
            max_elapsed: Duration::from_secs(180),
            backoff_factor: 2.0,
            jitter: true,
        },
        ErrorClass::Connection => RetryPolicy {
            max_attempts: 6,
            max_elapsed: Duration::from_secs(120),
            backoff_factor: 1.5,
            jitter: false,
        },
        ErrorClass::Server => RetryPolicy {
            max_attempts: 4,
            max_elapsed: Duration::from_secs(120),
            backoff_factor: 2.0,
            jitter: true,
        },
        ErrorClass::Authentication => RetryPolicy {
            max_attempts: 2,
            max_elapsed: Duration::from_secs(30),
            backoff_factor: 1.0,
            jitter: false,
        },
        ErrorClass::ContentFilter => RetryPolicy {
            max_attempts: 1,
            max_elapsed: Duration::from_secs(1),
            backoff_factor: 1.0,
            jitter: false,
        },
        ErrorClass::Unknown => RetryPolicy {
            max_attempts: 5,
            max_elapsed: Duration::from_secs(120),
            backoff_factor: 2.0,
            jitter: true,
        },
    }
}

/// `delay(n) = base · factor^(n-1)`, truncated at `max_elapsed`, with
/// up to ±10% jitter applied when the policy calls for it.
/// `attempt_no` is 1-indexed (the delay *before* this attempt).
pub fn backoff_delay(class: ErrorClass, attempt_no: u32) -> Duration {
    let policy = policy_for(class);
    let exponent = attempt_no.saturating_sub(1) as i32;
    let scaled = BASE_DELAY.as_secs_f64() * policy.backoff_factor.powi(exponent);
    let capped = scaled.min(policy.max_elapsed.as_secs_f64());

    let final_secs = if policy.jitter {
        let mut rng = rand::thread_rng();
        let factor = rng.gen_range(0.9..=1.1);
        capped * factor
    } else {
        capped
    };

    Duration::from_secs_f64(final_secs.max(0.0))
}

/// A request is retryable for a given class if it hasn't yet
/// exhausted either the attempt budget or the elapsed-time budget.
pub fn should_retry(class: ErrorClass, attempt_no: u32, elapsed: Duration) -> bool {
    let policy = policy_for(class);
    attempt_no < policy.max_attempts && elapsed < policy.max_elapsed
}

/// Tracks whether a logical request has already substituted a
/// fallback model. Substitution is allowed exactly once, and never
/// for `AUTHENTICATION` or `CONTENT_FILTER` failures.
#[derive(Debug, Default)]
pub struct FallbackState {
    used: bool,
}

impl FallbackState {
    pub fn new() -> Self {
        Self { used: false }
    }

    /// Returns the fallback model id to switch to, if substitution is
    /// still available for this failure class and fallbacks exist.
    pub fn try_substitute<'a>(&mut self, class: ErrorClass, fallbacks: &'a [String]) -> Option<&'a str> {
        if self.used {
            return None;
        }
        if matches!(class, ErrorClass::Authentication | ErrorClass::ContentFilter) {
            return None;
        }
        let next = fallbacks.first()?;
        self.used = true;
        Some(next.as_str())
    }
}

/// Drives one logical request through retry and at-most-once
/// fallback. Sleeps between attempts are raced against `cancel` so a
/// `stop()` takes effect without waiting out a backoff, per the "never
/// sleep without checking cancellation first" design note.
/// Returns the successful `TranslateResult` alongside the model id that
/// actually produced it — the original `model_id` unless a fallback
/// substitution occurred, per spec.md §4.5's "cache under the
/// actually-used model" default.
pub async fn run_with_retry(
    provider: &dyn Provider,
    messages: &PromptMessages,
    model_id: &str,
    fallback_models: &[String],
) -> Result<(TranslateResult, String), ProviderError> {
    run_with_retry_cancellable(provider, messages, model_id, fallback_models, None).await
}

pub async fn run_with_retry_cancellable(
    provider: &dyn Provider,
    messages: &PromptMessages,
    model_id: &str,
    fallback_models: &[String],
    cancel: Option<&CancellationToken>,
) -> Result<(TranslateResult, String), ProviderError> {
    let mut current_model = model_id.to_string();
    let mut fallback_state = FallbackState::new();
    let started = Instant::now();
    let mut attempt_no: u32 = 0;
    let mut last_error: Option<ProviderError> = None;

    loop {
        if let Some(token) = cancel {
            if token.is_cancelled() {
                return Err(last_error.unwrap_or_else(|| ProviderError::new(None, "cancelled before first attempt")));
            }
        }

        attempt_no += 1;
        match provider.translate(messages, &current_model).await {
            Ok(result) => return Ok((result, current_model)),
            Err(err) => {
                let elapsed = started.elapsed();
                let class = err.class;

                if let Some(next_model) = fallback_state.try_substitute(class, fallback_models) {
                    current_model = next_model.to_string();
                    attempt_no = 0;
                    last_error = Some(err);
                    continue;
                }

                if !should_retry(class, attempt_no, elapsed) {
                    return Err(err);
                }

                let delay = backoff_delay(class, attempt_no);
                last_error = Some(err);

                match cancel {
                    Some(token) => {
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = token.cancelled() => {
                                return Err(last_error.expect("set above"));
                            }
                        }
                    }
                    None => tokio::time::sleep(delay).await,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_with_attempt_number() {
        let first = backoff_delay(ErrorClass::Server, 1);
        let second = backoff_delay(ErrorClass::Server, 2);
        // jitter means we can't assert strict inequality every time,
        // but the scaled midpoint should clearly differ.
        assert!(second.as_secs_f64() > first.as_secs_f64() * 1.3);
    }

    #[test]
    fn backoff_is_capped_at_max_elapsed() {
        let delay = backoff_delay(ErrorClass::Authentication, 10);
        assert!(delay.as_secs_f64() <= 30.0 * 1.1);
    }

    #[test]
    fn content_filter_never_retries_past_first_attempt() {
        assert!(should_retry(ErrorClass::ContentFilter, 0, Duration::ZERO));
        assert!(!should_retry(ErrorClass::ContentFilter, 1, Duration::ZERO));
    }

    #[test]
    fn fallback_substitution_happens_at_most_once() {
        let mut state = FallbackState::new();
        let fallbacks = vec!["model-b".to_string(), "model-c".to_string()];
        assert_eq!(state.try_substitute(ErrorClass::Server, &fallbacks), Some("model-b"));
        assert_eq!(state.try_substitute(ErrorClass::Server, &fallbacks), None);
    }

    #[test]
    fn fallback_never_substitutes_for_auth_or_content_filter() {
        let mut state = FallbackState::new();
        let fallbacks = vec!["model-b".to_string()];
        assert_eq!(state.try_substitute(ErrorClass::Authentication, &fallbacks), None);
        assert_eq!(state.try_substitute(ErrorClass::ContentFilter, &fallbacks), None);
        // Still available afterwards since neither call consumed it.
        assert_eq!(state.try_substitute(ErrorClass::Server, &fallbacks), Some("model-b"));
    }
}
