use std::sync::atomic::{AtomicU64, Ordering};

use crate::memory::PoolStats;

/// Lock-free counters updated by the orchestrator and loader workers
#[derive(Debug, Default)]
pub struct CacheCounters {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub requests: AtomicU64,
    pub rejected: AtomicU64,
    pub loads: AtomicU64,
    pub bytes_loaded: AtomicU64,
    pub evictions: AtomicU64,
    pub retries: AtomicU64,
    pub requeues: AtomicU64,
    pub failures: AtomicU64,
    pub discarded: AtomicU64,
}

impl CacheCounters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, amount: u64) {
        counter.fetch_add(amount, Ordering::Relaxed);
    }

    pub fn snapshot(&self, pool: PoolStats, queued: usize, resident: usize) -> CacheStats {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        CacheStats {
            hits: load(&self.hits),
            misses: load(&self.misses),
            requests: load(&self.requests),
            rejected: load(&self.rejected),
            loads: load(&self.loads),
            bytes_loaded: load(&self.bytes_loaded),
            evictions: load(&self.evictions),
            retries: load(&self.retries),
            requeues: load(&self.requeues),
            failures: load(&self.failures),
            discarded: load(&self.discarded),
            queued,
            resident,
            pool,
        }
    }
}

/// Point-in-time cache statistics
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Requests issued to the scheduler (new or escalated)
    pub requests: u64,
    /// Ids rejected by the resolver or too large for a slot
    pub rejected: u64,
    pub loads: u64,
    pub bytes_loaded: u64,
    pub evictions: u64,
    pub retries: u64,
    /// Jobs returned to the scheduler because no slot was available
    pub requeues: u64,
    pub failures: u64,
    /// Completed loads thrown away (aborted or duplicate)
    pub discarded: u64,
    pub queued: usize,
    pub resident: usize,
    pub pool: PoolStats,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f32 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f32 / total as f32
        }
    }
}
