//! Streaming cache configuration
//!
//! Plain data with serde defaults so a partial TOML table is enough to
//! override the few values a host application cares about.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{StreamError, StreamErrorContext, StreamResult};
use crate::streaming::{UpdateMode, DEFAULT_SLOT_SIZE};

/// Configuration for the slot pools, scheduler and loader workers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Size of each cache slot in bytes (upper bound on a tile's length)
    pub slot_size: usize,

    /// Number of cache slots; the working set never grows past this
    pub slot_count: usize,

    /// Number of raw staging buffers between loader and transform stage
    pub staging_slots: usize,

    /// Raw read workers
    pub loader_threads: usize,

    /// Second-stage workers (only spawned when a transform is installed)
    pub transform_threads: usize,

    /// Periodic wake interval for idle workers
    pub idle_wait_ms: u64,

    /// Longest a worker waits for a free or evictable slot before requeueing
    pub acquire_timeout_ms: u64,

    /// Retries of a transient read failure before the request is aborted
    pub max_retries: u32,

    /// Base backoff between retries, doubled per attempt
    pub retry_backoff_ms: u64,

    /// How re-requests with a new priority move a queued request
    pub update_mode: UpdateMode,

    /// Priority added to outstanding requests the consumer reported as used
    pub feedback_boost: i32,

    /// Priority removed from outstanding requests not reported as used
    pub feedback_decay: i32,

    /// Initial error threshold of a freshly created cut
    pub default_threshold: f32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        let cpu_count = num_cpus::get();
        let loader_threads = cpu_count.saturating_sub(2).clamp(1, 4); // Leave cores for render/update threads

        Self {
            slot_size: DEFAULT_SLOT_SIZE,
            slot_count: 1024,
            staging_slots: 32,
            loader_threads,
            transform_threads: loader_threads,
            idle_wait_ms: 10,
            acquire_timeout_ms: 50,
            max_retries: 3,
            retry_backoff_ms: 5,
            update_mode: UpdateMode::Always,
            feedback_boost: 8,
            feedback_decay: 1,
            default_threshold: 2.5,
        }
    }
}

impl StreamConfig {
    /// Parse a configuration from TOML; missing keys keep their defaults
    pub fn from_toml_str(source: &str) -> StreamResult<Self> {
        let config: StreamConfig = toml::from_str(source).stream_context("parsing stream config")?;
        config.validate()
    }

    /// Serialize to TOML
    pub fn to_toml_string(&self) -> StreamResult<String> {
        toml::to_string(self).stream_context("serializing stream config")
    }

    /// Reject unusable values and clamp the rest
    pub fn validate(mut self) -> StreamResult<Self> {
        if self.slot_size == 0 {
            return Err(StreamError::Config("slot_size must be non-zero".to_string()));
        }
        if self.slot_count == 0 {
            return Err(StreamError::Config("slot_count must be non-zero".to_string()));
        }
        if self.staging_slots == 0 {
            return Err(StreamError::Config("staging_slots must be non-zero".to_string()));
        }

        let max_threads = num_cpus::get().max(1) * 4;
        if self.loader_threads == 0 || self.loader_threads > max_threads {
            let clamped = self.loader_threads.clamp(1, max_threads);
            log::warn!("[StreamConfig::validate] loader_threads {} clamped to {}", self.loader_threads, clamped);
            self.loader_threads = clamped;
        }
        if self.transform_threads == 0 || self.transform_threads > max_threads {
            let clamped = self.transform_threads.clamp(1, max_threads);
            log::warn!("[StreamConfig::validate] transform_threads {} clamped to {}", self.transform_threads, clamped);
            self.transform_threads = clamped;
        }
        if self.idle_wait_ms == 0 {
            self.idle_wait_ms = 1;
        }

        Ok(self)
    }

    pub fn idle_wait(&self) -> Duration {
        Duration::from_millis(self.idle_wait_ms)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    /// Backoff before retry number `attempt` (1-based)
    pub fn retry_backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(10);
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(factor))
    }

    /// Total bytes held by the cache slots
    pub fn pool_bytes(&self) -> u64 {
        self.slot_size as u64 * self.slot_count as u64
    }
}
