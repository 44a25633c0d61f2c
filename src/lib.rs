//! Subcaster - subtitle translation orchestration engine.
//!
//! - cache/memory_cache: two-tier translation cache (disk + in-process LRU)
//! - provider/providers: pluggable translation backends (local HTTP, cloud OpenAI-compatible)
//! - governor: per-provider sliding-window rate/token admission control
//! - retry: closed error taxonomy, per-class backoff, at-most-once model fallback
//! - concurrency: EMA-latency-driven adaptive semaphore
//! - scheduler: adaptive batch sizing and per-cue task dispatch
//! - checkpoint: crash-safe resume state
//! - postprocess: fixed post-translation cleanup chain
//! - engine: top-level orchestration tying every component together
//! - collaborators: the narrow seams (subtitle I/O, prompt building, clock) owned by the caller
//! - cli/config: command-line surface and persisted configuration

pub mod cache;
pub mod checkpoint;
pub mod cli;
pub mod collaborators;
pub mod concurrency;
pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod governor;
pub mod memory_cache;
pub mod postprocess;
pub mod provider;
pub mod providers;
pub mod retry;
pub mod scheduler;
