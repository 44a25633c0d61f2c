//! Rate & Token Governor (C4) — per-provider sliding-window admission
//! control.
//!
//! Maintains two 60-second windows (request timestamps, and
//! `(timestamp, tokens)` pairs) per provider. `admit()` is called
//! before every outbound request and may sleep to stay under the
//! configured limits.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::RwLock;

use crate::provider::ProviderKind;

const WINDOW: Duration = Duration::from_secs(60);

/// Per-provider request/token limits. The local provider uses
/// effectively unbounded limits (`u32::MAX`).
#[derive(Debug, Clone, Copy)]
pub struct GovernorLimits {
    pub max_req_per_min: u32,
    pub max_tok_per_min: u32,
}

impl GovernorLimits {
    pub fn unbounded() -> Self {
        Self {
            max_req_per_min: u32::MAX,
            max_tok_per_min: u32::MAX,
        }
    }
}

struct GovernorState {
    limits: GovernorLimits,
    requests: VecDeque<Instant>,
    tokens: VecDeque<(Instant, u32)>,
}

impl GovernorState {
    fn new(limits: GovernorLimits) -> Self {
        Self {
            limits,
            requests: VecDeque::new(),
            tokens: VecDeque::new(),
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&front) = self.requests.front() {
            if now.duration_since(front) > WINDOW {
                self.requests.pop_front();
            } else {
                break;
            }
        }
        while let Some(&(ts, _)) = self.tokens.front() {
            if now.duration_since(ts) > WINDOW {
                self.tokens.pop_front();
            } else {
                break;
            }
        }
    }

    fn usages(&self, now: Instant) -> (f64, f64) {
        let req_usage = self.requests.len() as f64 / self.limits.max_req_per_min as f64;
        let tok_total: u64 = self.tokens.iter().map(|(_, t)| *t as u64).sum();
        let tok_usage = tok_total as f64 / self.limits.max_tok_per_min as f64;
        let _ = now;
        (req_usage, tok_usage)
    }

    /// Time until the oldest entry in the more-saturated window falls
    /// out of the 60s window.
    fn time_until_relief(&self, now: Instant, req_usage: f64, tok_usage: f64) -> Duration {
        let from_requests = self
            .requests
            .front()
            .map(|ts| WINDOW.saturating_sub(now.duration_since(*ts)))
            .unwrap_or_default();
        let from_tokens = self
            .tokens
            .front()
            .map(|(ts, _)| WINDOW.saturating_sub(now.duration_since(*ts)))
            .unwrap_or_default();

        if req_usage >= tok_usage {
            from_requests
        } else {
            from_tokens
        }
    }
}

pub struct Governor {
    providers: RwLock<HashMap<ProviderKind, AsyncMutex<GovernorState>>>,
}

impl Governor {
    pub fn new() -> Self {
        Self {
            providers: RwLock::new(HashMap::new()),
        }
    }

    pub async fn configure(&self, kind: ProviderKind, limits: GovernorLimits) {
        let mut providers = self.providers.write().await;
        providers.insert(kind, AsyncMutex::new(GovernorState::new(limits)));
    }

    /// Admission rule per spec.md §4.4: prune stale entries, compute
    /// usage ratios, and sleep a scaled backoff if either window is
    /// ≥90% saturated. Records the request timestamp before
    /// returning; callers record actual token usage afterward via
    /// `record_tokens`.
    pub async fn admit(&self, kind: ProviderKind, estimated_tokens: u32) {
        self.ensure_registered(kind, GovernorLimits::unbounded()).await;

        let providers = self.providers.read().await;
        let state_lock = providers.get(&kind).expect("registered above");
        let mut state = state_lock.lock().await;

        let now = Instant::now();
        state.prune(now);
        let (req_usage, tok_usage) = state.usages(now);
        let max_usage = req_usage.max(tok_usage);

        if max_usage >= 0.90 {
            let backoff_factor = if max_usage <= 0.90 {
                1.0
            } else if max_usage <= 0.95 {
                1.5
            } else {
                3.0
            };
            let relief = state.time_until_relief(now, req_usage, tok_usage);
            let sleep_for = relief.mul_f64(backoff_factor);
            drop(state);
            drop(providers);
            if !sleep_for.is_zero() {
                tokio::time::sleep(sleep_for).await;
            }
            let providers = self.providers.read().await;
            let state_lock = providers.get(&kind).expect("registered above");
            let mut state = state_lock.lock().await;
            state.requests.push_back(Instant::now());
            let _ = estimated_tokens;
            return;
        }

        state.requests.push_back(now);
    }

    /// Records actual token usage after a call completes.
    pub async fn record_tokens(&self, kind: ProviderKind, actual_tokens: u32) {
        self.ensure_registered(kind, GovernorLimits::unbounded()).await;
        let providers = self.providers.read().await;
        if let Some(state_lock) = providers.get(&kind) {
            let mut state = state_lock.lock().await;
            state.tokens.push_back((Instant::now(), actual_tokens));
        }
    }

    async fn ensure_registered(&self, kind: ProviderKind, default_limits: GovernorLimits) {
        {
            let providers = self.providers.read().await;
            if providers.contains_key(&kind) {
                return;
            }
        }
        self.configure(kind, default_limits).await;
    }
}

impl Default for Governor {
    fn default() -> Self {
        Self::new()
    }
}

/// Estimate tokens for a single message: a tokenizer library is
/// preferred when available, but this heuristic (CJK vs. Latin
/// character counting plus fixed per-message/per-exchange overhead)
/// is the fallback used throughout this crate.
pub fn estimate_tokens(text: &str) -> u32 {
    let mut cjk = 0u32;
    let mut latin = 0u32;
    for ch in text.chars() {
        if is_cjk(ch) {
            cjk += 1;
        } else if !ch.is_whitespace() {
            latin += 1;
        }
    }
    let from_cjk = (cjk as f64 / 1.5).ceil();
    let from_latin = (latin as f64 / 4.0).ceil();
    // 4 tokens fixed overhead per message, 2 for the exchange.
    (from_cjk + from_latin + 4.0 + 2.0).round() as u32
}

fn is_cjk(ch: char) -> bool {
    matches!(ch as u32,
        0x4E00..=0x9FFF   // CJK Unified Ideographs
        | 0x3400..=0x4DBF // CJK Extension A
        | 0x3040..=0x30FF // Hiragana/Katakana
        | 0xAC00..=0xD7A3 // Hangul syllables
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn admits_immediately_under_limits() {
        let governor = Governor::new();
        governor
            .configure(ProviderKind::CloudOpenAi, GovernorLimits {
                max_req_per_min: 100,
                max_tok_per_min: 100_000,
            })
            .await;
        let start = Instant::now();
        governor.admit(ProviderKind::CloudOpenAi, 10).await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn sleeps_when_request_window_saturated() {
        let governor = Governor::new();
        governor
            .configure(ProviderKind::CloudOpenAi, GovernorLimits {
                max_req_per_min: 2,
                max_tok_per_min: 100_000,
            })
            .await;
        governor.admit(ProviderKind::CloudOpenAi, 1).await;
        governor.admit(ProviderKind::CloudOpenAi, 1).await;
        // Third admission should detect >=90% usage and sleep some
        // amount (bounded by the 60s window, but > 0).
        let start = Instant::now();
        governor.admit(ProviderKind::CloudOpenAi, 1).await;
        assert!(start.elapsed() > Duration::from_millis(0));
    }

    #[test]
    fn estimates_more_tokens_for_cjk_than_equivalent_ascii() {
        let cjk = estimate_tokens("你好世界你好世界你好世界");
        let latin = estimate_tokens("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"); // similar length
        assert!(cjk > 6);
        assert!(latin > 6);
    }
}
