/// Stream Cache
///
/// The orchestrator. Consumers call `get` every frame; a miss queues (or
/// escalates) a load and returns immediately. Loader workers fill slots in
/// the background and publish them into the cache index.
///
/// Index entries are only added inside the publish step and only removed
/// inside the eviction or release step, both under the slot pool lock, so
/// request state, slot state and index always agree.

use crossbeam_channel::{unbounded, Receiver, Sender};
use std::collections::HashSet;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::config::StreamConfig;
use crate::error::{StreamError, StreamResult};
use crate::memory::{PoolStats, SlotId, SlotPool, SlotSnapshot, TileBytes};
use crate::streaming::cache_index::CacheIndex;
use crate::streaming::cut::Cut;
use crate::streaming::cut_database::{CutDatabase, CutKey};
use crate::streaming::loader::LoaderPipeline;
use crate::streaming::request::{LoadJob, Priority, RequestState};
use crate::streaming::request_queue::{AbortResult, QueryResult, RequestScheduler, SubmitOutcome};
use crate::streaming::source::{AddressResolver, BackingStore, TileExtent, TileTransform};
use crate::streaming::stats::{CacheCounters, CacheStats};
use crate::TileId;

/// A load that will not be retried
#[derive(Debug)]
pub struct LoadFailure {
    pub id: TileId,
    pub attempts: u32,
    pub error: StreamError,
}

/// What `StreamCache::request` did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// Already cached, nothing queued
    Resident,
    /// A new request was queued
    Queued,
    /// The queued request moved to the new priority
    Moved,
    /// The queued request kept its priority (update mode)
    Unchanged,
    /// A worker is already loading it
    Loading,
}

/// State shared between the orchestrator and the loader workers
pub(crate) struct CacheCore {
    pub(crate) config: StreamConfig,
    pub(crate) scheduler: RequestScheduler,
    pub(crate) pool: SlotPool,
    pub(crate) staging: Option<SlotPool<LoadJob>>,
    pub(crate) index: CacheIndex,
    pub(crate) store: Box<dyn BackingStore>,
    pub(crate) transform: Option<Box<dyn TileTransform>>,
    pub(crate) counters: CacheCounters,
    pub(crate) running: AtomicBool,
    failures: Sender<LoadFailure>,
}

impl CacheCore {
    /// Cache slot for `job`, evicting if needed. On timeout the job goes
    /// back to the scheduler.
    pub(crate) fn acquire_cache_slot(&self, job: &LoadJob) -> Option<SlotId> {
        let slot = self.pool.acquire_free(self.config.acquire_timeout(), |slot, owner| {
            if self.index.remove_if(owner, slot) {
                CacheCounters::bump(&self.counters.evictions);
            }
        });
        let Some(slot) = slot else {
            self.requeue_exhausted(*job, "cache");
            return None;
        };

        if let Err(e) = self.pool.set_owner(slot, job.id) {
            log::error!("[StreamCache::acquire_cache_slot] tile {}: {}", job.id, e);
            self.discard_slot(slot);
            self.requeue_exhausted(*job, "cache");
            return None;
        }
        self.scheduler.set_slot(job.handle, slot);
        Some(slot)
    }

    pub(crate) fn requeue_exhausted(&self, job: LoadJob, pool: &str) {
        let reason = StreamError::PoolExhausted { waited_ms: self.config.acquire_timeout_ms };
        log::debug!("[StreamCache::requeue] tile {} back to scheduler ({} pool): {}", job.id, pool, reason);
        CacheCounters::bump(&self.counters.requeues);
        if !self.scheduler.requeue(job) {
            CacheCounters::bump(&self.counters.discarded);
        }
    }

    /// Publish a filled slot; the tile is indexed only if its request is
    /// still live and no other slot already holds it
    pub(crate) fn publish(&self, slot: SlotId, len: usize, job: &LoadJob) {
        let admitted = self.pool.publish_with(slot, len, |slot| match self.scheduler.complete(job.handle) {
            Some(RequestState::Ready) => self.index.try_insert(job.id, slot),
            _ => false,
        });

        match admitted {
            Ok(true) => {
                CacheCounters::bump(&self.counters.loads);
                CacheCounters::add(&self.counters.bytes_loaded, len as u64);
                log::trace!("[StreamCache::publish] tile {} -> slot {} ({} bytes)", job.id, slot, len);
            }
            Ok(false) => {
                CacheCounters::bump(&self.counters.discarded);
                log::debug!("[StreamCache::publish] tile {} discarded (aborted or already resident)", job.id);
            }
            Err(e) => log::error!("[StreamCache::publish] tile {}: {}", job.id, e),
        }
    }

    pub(crate) fn discard_slot(&self, slot: SlotId) {
        if let Err(e) = self.pool.recycle(slot) {
            log::error!("[StreamCache::discard_slot] slot {}: {}", slot, e);
        }
    }

    /// Retry a transient failure after a backoff, otherwise drop the request
    /// and report it. The backoff is served in the scheduler, the worker
    /// moves on to other jobs.
    pub(crate) fn retry_or_fail(&self, mut job: LoadJob, error: StreamError) {
        let attempts = job.attempts + 1;

        if error.is_transient() && attempts <= self.config.max_retries && self.running.load(Ordering::Acquire) {
            CacheCounters::bump(&self.counters.retries);
            log::warn!(
                "[StreamCache::retry] tile {} attempt {}/{}: {}",
                job.id,
                attempts,
                self.config.max_retries,
                error
            );
            job.attempts = attempts;
            if !self.scheduler.requeue_after(job, self.config.retry_backoff(attempts)) {
                CacheCounters::bump(&self.counters.discarded);
            }
            return;
        }

        self.scheduler.fail(job.handle);
        CacheCounters::bump(&self.counters.failures);
        log::error!("[StreamCache::load] tile {} failed after {} attempts: {}", job.id, attempts, error);

        let failure = LoadFailure {
            id: job.id,
            attempts,
            error: StreamError::PermanentFailure { id: job.id, attempts, reason: error.to_string() },
        };
        if self.failures.send(failure).is_err() {
            log::warn!("[StreamCache::load] failure for tile {} dropped, cache is gone", job.id);
        }
    }
}

/// Pinned view of a resident tile. The slot cannot be evicted or reused
/// until the guard is dropped.
pub struct TileGuard<'a> {
    pool: &'a SlotPool,
    slot: SlotId,
    id: TileId,
    bytes: Option<TileBytes<'a>>,
}

impl<'a> TileGuard<'a> {
    pub fn id(&self) -> TileId {
        self.id
    }

    pub fn slot(&self) -> SlotId {
        self.slot
    }
}

impl Deref for TileGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.bytes.as_deref().unwrap_or(&[])
    }
}

impl Drop for TileGuard<'_> {
    fn drop(&mut self) {
        self.bytes.take();
        if let Err(e) = self.pool.end_read(self.slot) {
            log::error!("[TileGuard::drop] tile {}: {}", self.id, e);
        }
    }
}

pub struct StreamCache {
    core: Arc<CacheCore>,
    resolver: Box<dyn AddressResolver>,
    loader: LoaderPipeline,
    cuts: CutDatabase,
    failures: Receiver<LoadFailure>,
}

impl StreamCache {
    /// Cache publishing raw tile bytes
    pub fn new<R, S>(config: StreamConfig, resolver: R, store: S) -> StreamResult<Self>
    where
        R: AddressResolver + 'static,
        S: BackingStore + 'static,
    {
        Self::build(config, Box::new(resolver), Box::new(store), None)
    }

    /// Cache running `transform` over every tile before publishing it
    pub fn with_transform<R, S, T>(config: StreamConfig, resolver: R, store: S, transform: T) -> StreamResult<Self>
    where
        R: AddressResolver + 'static,
        S: BackingStore + 'static,
        T: TileTransform + 'static,
    {
        Self::build(config, Box::new(resolver), Box::new(store), Some(Box::new(transform)))
    }

    fn build(
        config: StreamConfig,
        resolver: Box<dyn AddressResolver>,
        store: Box<dyn BackingStore>,
        transform: Option<Box<dyn TileTransform>>,
    ) -> StreamResult<Self> {
        let config = config.validate()?;
        let staging = transform
            .as_ref()
            .map(|_| SlotPool::with_label("staging", config.slot_size, config.staging_slots));
        let (failure_tx, failure_rx) = unbounded();

        log::info!(
            "[StreamCache::new] {} slots x {} KiB ({} MiB), {} loader threads, transform: {}",
            config.slot_count,
            config.slot_size / 1024,
            config.pool_bytes() / (1024 * 1024),
            config.loader_threads,
            transform.is_some()
        );

        let core = Arc::new(CacheCore {
            scheduler: RequestScheduler::new(config.update_mode),
            pool: SlotPool::with_label("cache", config.slot_size, config.slot_count),
            staging,
            index: CacheIndex::with_capacity(config.slot_count),
            store,
            transform,
            counters: CacheCounters::default(),
            running: AtomicBool::new(true),
            failures: failure_tx,
            config,
        });
        let loader = LoaderPipeline::start(core.clone())?;
        let cuts = CutDatabase::new(core.config.default_threshold);

        Ok(Self { core, resolver, loader, cuts, failures: failure_rx })
    }

    pub fn config(&self) -> &StreamConfig {
        &self.core.config
    }

    /// Pinned tile bytes on a hit. On a miss (or while loading) the tile is
    /// requested at `priority` and None is returned without blocking.
    pub fn get(&self, id: TileId, priority: Priority) -> StreamResult<Option<TileGuard<'_>>> {
        if let Some(guard) = self.pin(id)? {
            CacheCounters::bump(&self.core.counters.hits);
            log::trace!("[StreamCache::get] hit {}", id);
            return Ok(Some(guard));
        }

        CacheCounters::bump(&self.core.counters.misses);
        self.request(id, priority)?;
        Ok(None)
    }

    /// Poll `get` until the tile is resident or `timeout` passes
    pub fn get_blocking(&self, id: TileId, priority: Priority, timeout: Duration) -> StreamResult<TileGuard<'_>> {
        let start = Instant::now();
        let poll = self.core.config.idle_wait().min(Duration::from_millis(1));

        loop {
            if let Some(guard) = self.pin(id)? {
                return Ok(guard);
            }
            self.request(id, priority)?;
            if start.elapsed() >= timeout {
                return Err(StreamError::Timeout { id, waited_ms: start.elapsed().as_millis() as u64 });
            }
            thread::sleep(poll);
        }
    }

    fn pin(&self, id: TileId) -> StreamResult<Option<TileGuard<'_>>> {
        let pool = &self.core.pool;
        let Some(slot) = self.core.index.lookup(id) else {
            return Ok(None);
        };
        if !pool.begin_read(slot) {
            return Ok(None);
        }
        // The slot may have been recycled between lookup and pin
        if pool.owner(slot) != Some(id) {
            pool.end_read(slot)?;
            return Ok(None);
        }

        match pool.read_bytes(slot) {
            Ok(bytes) => Ok(Some(TileGuard { pool, slot, id, bytes: Some(bytes) })),
            Err(e) => {
                pool.end_read(slot)?;
                Err(e)
            }
        }
    }

    /// Queue a load for `id`, or move its outstanding request to `priority`
    /// (subject to the update mode). Ids the resolver rejects, or that do not
    /// fit a slot, are never queued.
    pub fn request(&self, id: TileId, priority: Priority) -> StreamResult<RequestOutcome> {
        let scheduler = &self.core.scheduler;
        if self.core.index.contains(id) {
            return Ok(RequestOutcome::Resident);
        }

        match scheduler.query(id) {
            QueryResult::Loading => return Ok(RequestOutcome::Loading),
            QueryResult::Waiting(_) => {
                return Ok(if scheduler.update(id, priority) {
                    CacheCounters::bump(&self.core.counters.requests);
                    RequestOutcome::Moved
                } else {
                    RequestOutcome::Unchanged
                });
            }
            QueryResult::NotIndexed => {}
        }

        let extent = self.resolve(id)?;
        let outcome = match scheduler.push(id, priority, extent) {
            SubmitOutcome::Queued(_) => RequestOutcome::Queued,
            SubmitOutcome::Updated { moved: true, .. } => RequestOutcome::Moved,
            SubmitOutcome::Updated { moved: false, .. } => RequestOutcome::Unchanged,
            SubmitOutcome::AlreadyLoading(_) => RequestOutcome::Loading,
        };
        if matches!(outcome, RequestOutcome::Queued | RequestOutcome::Moved) {
            CacheCounters::bump(&self.core.counters.requests);
        }
        Ok(outcome)
    }

    fn resolve(&self, id: TileId) -> StreamResult<TileExtent> {
        let extent = self.resolver.resolve(id).map_err(|e| {
            CacheCounters::bump(&self.core.counters.rejected);
            log::debug!("[StreamCache::request] tile {} rejected: {}", id, e);
            e
        })?;

        let slot_size = self.core.pool.slot_size();
        if extent.length > slot_size as u64 {
            CacheCounters::bump(&self.core.counters.rejected);
            return Err(StreamError::TileTooLarge { id, length: extent.length, slot_size });
        }
        Ok(extent)
    }

    pub fn is_resident(&self, id: TileId) -> bool {
        self.core.index.contains(id)
    }

    pub fn query(&self, id: TileId) -> QueryResult {
        self.core.scheduler.query(id)
    }

    /// Report the tiles used this frame. Resident ones become the most
    /// recently used; outstanding requests for them gain priority, all other
    /// outstanding requests decay. Returns how many requests moved.
    pub fn feedback(&self, used: &[TileId]) -> usize {
        let used: HashSet<TileId> = used.iter().copied().collect();
        for &id in &used {
            if let Some(slot) = self.core.index.lookup(id) {
                if self.core.pool.owner(slot) == Some(id) {
                    self.core.pool.touch(slot);
                }
            }
        }

        let boost = self.core.config.feedback_boost;
        let decay = self.core.config.feedback_decay;
        self.core.scheduler.adjust_priorities(|id, priority| {
            Some(if used.contains(&id) {
                priority.saturating_add(boost)
            } else {
                priority.saturating_sub(decay)
            })
        })
    }

    /// Abort the outstanding request for `id`. A load already in flight
    /// completes but its result is discarded.
    pub fn abort(&self, id: TileId) -> AbortResult {
        let result = self.core.scheduler.abort(id);
        log::debug!("[StreamCache::abort] tile {}: {:?}", id, result);
        result
    }

    /// Drop a resident tile from the cache. Pinned tiles stay.
    pub fn evict(&self, id: TileId) -> bool {
        let Some(slot) = self.core.index.lookup(id) else {
            return false;
        };
        let index = &self.core.index;
        let released = self.core.pool.release_owned(slot, id, |slot| {
            index.remove_if(id, slot);
        });
        if released {
            CacheCounters::bump(&self.core.counters.evictions);
        }
        released
    }

    /// Resident tile ids, in no particular order
    pub fn resident(&self) -> Vec<TileId> {
        self.core.index.ids()
    }

    /// Indexed tiles with a snapshot of their slots. Only consistent while
    /// no loads are in flight.
    pub fn residency(&self) -> Vec<(TileId, SlotSnapshot)> {
        let mut entries: Vec<_> = self
            .core
            .index
            .entries()
            .into_iter()
            .map(|(id, slot)| (id, self.core.pool.snapshot(slot)))
            .collect();
        entries.sort_by_key(|(id, _)| *id);
        entries
    }

    pub fn cuts(&self) -> &CutDatabase {
        &self.cuts
    }

    pub fn cut(&self, key: CutKey) -> Arc<Cut> {
        self.cuts.cut(key)
    }

    /// Consumer side of a cut: bring its latest commit to the front
    pub fn swap(&self, key: CutKey) -> bool {
        self.cuts.swap(key)
    }

    /// Drain the permanent failures reported since the last call
    pub fn take_failures(&self) -> Vec<LoadFailure> {
        self.failures.try_iter().collect()
    }

    pub fn stats(&self) -> CacheStats {
        self.core
            .counters
            .snapshot(self.core.pool.stats(), self.core.scheduler.len(), self.core.index.len())
    }

    pub fn staging_stats(&self) -> Option<PoolStats> {
        self.core.staging.as_ref().map(|staging| staging.stats())
    }

    /// Stop the loader workers. Resident tiles stay readable.
    pub fn shutdown(&mut self) {
        self.loader.shutdown();
    }
}
