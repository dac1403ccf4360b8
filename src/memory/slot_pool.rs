/// Slot Pool Implementation
///
/// A fixed array of reusable byte buffers. Each slot carries one atomic word
/// holding its life-cycle state and the number of readers pinning it:
///
/// ```text
///   Free --acquire--> Writing --publish--> Ready <--end_read-- Reading
///    ^                   |                   |  --begin_read-->   ^ |
///    |                   | recycle           |                    +-+ extra readers
///    +-------------------+----release--------+
/// ```
///
/// Every transition is a compare-and-swap against the expected prior word,
/// so two actors can never both believe they own a slot. Structural
/// bookkeeping (free list, least-recently-used order) lives behind one mutex
/// that is only taken when a slot becomes available or is handed out.

use parking_lot::{Condvar, MappedRwLockReadGuard, Mutex, RwLock, RwLockReadGuard};
use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crate::error::{StreamError, StreamResult};
use crate::TileId;

/// Stable index of a slot inside its pool
pub type SlotId = usize;

const STATE_MASK: u64 = 0xFF;
const READER_SHIFT: u32 = 8;
const NO_OWNER: u64 = u64::MAX;

/// Life-cycle state of a slot
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotState {
    Free = 1,
    Writing = 2,
    Ready = 3,
    Reading = 4,
}

impl SlotState {
    /// The complete table of legal transitions
    pub fn can_transition_to(self, next: SlotState) -> bool {
        use SlotState::*;
        matches!(
            (self, next),
            (Free, Writing)
                | (Writing, Ready)
                | (Writing, Free)
                | (Ready, Reading)
                | (Reading, Reading)
                | (Reading, Ready)
                | (Ready, Free)
        )
    }

    fn from_bits(bits: u64) -> Self {
        match bits & STATE_MASK {
            2 => SlotState::Writing,
            3 => SlotState::Ready,
            4 => SlotState::Reading,
            _ => SlotState::Free,
        }
    }
}

fn pack(state: SlotState, readers: u64) -> u64 {
    (readers << READER_SHIFT) | state as u64
}

fn unpack(word: u64) -> (SlotState, u64) {
    (SlotState::from_bits(word), word >> READER_SHIFT)
}

/// Word that results from applying `next` to `current`, or None if the
/// transition is not legal from the current state
fn next_word(current: u64, next: SlotState) -> Option<u64> {
    use SlotState::*;
    let (state, readers) = unpack(current);
    if !state.can_transition_to(next) {
        return None;
    }
    match (state, next) {
        (Ready, Reading) => Some(pack(Reading, 1)),
        (Reading, Reading) => Some(pack(Reading, readers + 1)),
        (Reading, Ready) if readers > 1 => Some(pack(Reading, readers - 1)),
        (_, next) => Some(pack(next, 0)),
    }
}

struct Slot<A> {
    word: AtomicU64,
    owner: AtomicU64,
    last_used: AtomicU64,
    len: AtomicUsize,
    assoc: Mutex<Option<A>>,
    data: RwLock<Box<[u8]>>,
}

impl<A> Slot<A> {
    fn new(size: usize) -> Self {
        Self {
            word: AtomicU64::new(pack(SlotState::Free, 0)),
            owner: AtomicU64::new(NO_OWNER),
            last_used: AtomicU64::new(0),
            len: AtomicUsize::new(0),
            assoc: Mutex::new(None),
            data: RwLock::new(vec![0u8; size].into_boxed_slice()),
        }
    }

    fn cas(&self, current: u64, next: u64) -> bool {
        self.word
            .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Free list plus least-recently-used order of Ready slots
///
/// The ready set may hold stale entries for slots that have since been
/// pinned; eviction re-validates every candidate with a CAS.
struct PoolQueues {
    free: VecDeque<SlotId>,
    in_free: Vec<bool>,
    ready: BTreeSet<(u64, SlotId)>,
    ready_keys: Vec<Option<u64>>,
}

impl PoolQueues {
    fn new(slot_count: usize) -> Self {
        Self {
            free: (0..slot_count).collect(),
            in_free: vec![true; slot_count],
            ready: BTreeSet::new(),
            ready_keys: vec![None; slot_count],
        }
    }

    fn push_free(&mut self, slot: SlotId) {
        self.remove_ready(slot);
        if !self.in_free[slot] {
            self.in_free[slot] = true;
            self.free.push_back(slot);
        }
    }

    fn pop_free(&mut self) -> Option<SlotId> {
        let slot = self.free.pop_front()?;
        self.in_free[slot] = false;
        Some(slot)
    }

    fn insert_ready(&mut self, slot: SlotId, key: u64) {
        self.remove_ready(slot);
        self.ready.insert((key, slot));
        self.ready_keys[slot] = Some(key);
    }

    fn remove_ready(&mut self, slot: SlotId) {
        if let Some(key) = self.ready_keys[slot].take() {
            self.ready.remove(&(key, slot));
        }
    }

    fn pop_oldest_ready(&mut self) -> Option<SlotId> {
        let (key, slot) = self.ready.pop_first()?;
        debug_assert_eq!(self.ready_keys[slot], Some(key));
        self.ready_keys[slot] = None;
        Some(slot)
    }
}

/// Point-in-time view of one slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotSnapshot {
    pub id: SlotId,
    pub state: SlotState,
    pub readers: u32,
    pub owner: Option<TileId>,
    pub last_used: u64,
    pub len: usize,
}

/// Slot counts by state plus pool counters
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub free: usize,
    pub writing: usize,
    pub ready: usize,
    pub reading: usize,
    pub acquisitions: u64,
    pub evictions: u64,
    pub acquire_timeouts: u64,
}

/// Pinned, read-only view of a slot's valid bytes
pub type TileBytes<'a> = MappedRwLockReadGuard<'a, [u8]>;

/// Fixed pool of equally sized byte slots
///
/// `A` is opaque producer data attached to a slot while it is owned (the
/// loader stores its job there).
pub struct SlotPool<A = ()> {
    label: &'static str,
    slot_size: usize,
    slots: Box<[Slot<A>]>,
    queues: Mutex<PoolQueues>,
    available: Condvar,
    clock: AtomicU64,
    acquisitions: AtomicU64,
    evictions: AtomicU64,
    acquire_timeouts: AtomicU64,
}

impl<A: Clone> SlotPool<A> {
    pub fn new(slot_size: usize, slot_count: usize) -> Self {
        Self::with_label("slot-pool", slot_size, slot_count)
    }

    /// Create a pool whose log lines carry `label`
    pub fn with_label(label: &'static str, slot_size: usize, slot_count: usize) -> Self {
        let slots = (0..slot_count).map(|_| Slot::new(slot_size)).collect::<Vec<_>>();
        log::debug!("[SlotPool::new] {}: {} slots x {} bytes", label, slot_count, slot_size);

        Self {
            label,
            slot_size,
            slots: slots.into_boxed_slice(),
            queues: Mutex::new(PoolQueues::new(slot_count)),
            available: Condvar::new(),
            clock: AtomicU64::new(1),
            acquisitions: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            acquire_timeouts: AtomicU64::new(0),
        }
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn state(&self, slot: SlotId) -> SlotState {
        unpack(self.slots[slot].word.load(Ordering::Acquire)).0
    }

    /// Owning tile, authoritative only while the slot is Ready or Reading
    pub fn owner(&self, slot: SlotId) -> Option<TileId> {
        match self.slots[slot].owner.load(Ordering::Acquire) {
            NO_OWNER => None,
            raw => Some(TileId(raw)),
        }
    }

    pub fn snapshot(&self, slot: SlotId) -> SlotSnapshot {
        let (state, readers) = unpack(self.slots[slot].word.load(Ordering::Acquire));
        SlotSnapshot {
            id: slot,
            state,
            readers: readers as u32,
            owner: self.owner(slot),
            last_used: self.slots[slot].last_used.load(Ordering::Relaxed),
            len: self.slots[slot].len.load(Ordering::Acquire),
        }
    }

    /// Attempt one transition against the expected prior state.
    ///
    /// Returns `Ok(false)` when a concurrent actor moved the slot first and
    /// an error when the transition is not in the legal table.
    ///
    /// The pool's own queues follow the new state, but nothing keyed by the
    /// slot's owner outside the pool hears about it. A pool whose slots are
    /// indexed elsewhere frees them through `release_owned` or the eviction
    /// hook of `acquire_free`, never through this.
    pub fn try_transition(&self, slot: SlotId, expected: SlotState, next: SlotState) -> StreamResult<bool> {
        if !expected.can_transition_to(next) {
            return Err(StreamError::IllegalTransition { slot, from: expected, to: next });
        }

        let cell = &self.slots[slot];
        loop {
            let current = cell.word.load(Ordering::Acquire);
            if unpack(current).0 != expected {
                return Ok(false);
            }
            let Some(target) = next_word(current, next) else {
                return Ok(false);
            };
            if cell.cas(current, target) {
                // Only the reader count raced us if the CAS failed with the same state
                self.after_transition(slot, expected, unpack(target).0);
                return Ok(true);
            }
        }
    }

    /// Take ownership of a Free slot, evicting the least recently used Ready
    /// slot when none is free. Blocks up to `timeout`; `on_evict` runs under
    /// the pool lock with the evicted owner so index removal and the
    /// `Ready -> Free` step form one eviction.
    pub fn acquire_free<F>(&self, timeout: Duration, mut on_evict: F) -> Option<SlotId>
    where
        F: FnMut(SlotId, TileId),
    {
        let deadline = Instant::now() + timeout;
        let mut queues = self.queues.lock();

        loop {
            while let Some(slot) = queues.pop_free() {
                if self.slots[slot].cas(pack(SlotState::Free, 0), pack(SlotState::Writing, 0)) {
                    return Some(self.claimed(slot));
                }
            }

            while let Some(slot) = queues.pop_oldest_ready() {
                let cell = &self.slots[slot];
                // Fails for pinned (Reading) slots, which are never evicted
                if !cell.cas(pack(SlotState::Ready, 0), pack(SlotState::Free, 0)) {
                    continue;
                }

                let owner = cell.owner.swap(NO_OWNER, Ordering::AcqRel);
                if owner != NO_OWNER {
                    on_evict(slot, TileId(owner));
                }
                self.evictions.fetch_add(1, Ordering::Relaxed);
                log::trace!("[SlotPool::acquire_free] {}: evicted slot {} (tile {})", self.label, slot, owner);

                if cell.cas(pack(SlotState::Free, 0), pack(SlotState::Writing, 0)) {
                    return Some(self.claimed(slot));
                }
                queues.push_free(slot);
            }

            if Instant::now() >= deadline {
                self.acquire_timeouts.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            self.available.wait_until(&mut queues, deadline);
        }
    }

    fn claimed(&self, slot: SlotId) -> SlotId {
        let cell = &self.slots[slot];
        cell.len.store(0, Ordering::Release);
        cell.owner.store(NO_OWNER, Ordering::Release);
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        slot
    }

    /// `Writing -> Ready`
    pub fn publish(&self, slot: SlotId, len: usize) -> StreamResult<()> {
        self.publish_with(slot, len, |_| true).map(|_| ())
    }

    /// `Writing -> Ready`, running `admit` under the pool lock before the
    /// slot becomes an eviction candidate. If `admit` returns false the
    /// slot goes straight back to Free and the result is discarded.
    pub fn publish_with<F>(&self, slot: SlotId, len: usize, admit: F) -> StreamResult<bool>
    where
        F: FnOnce(SlotId) -> bool,
    {
        let cell = &self.slots[slot];
        let mut queues = self.queues.lock();

        if !cell.cas(pack(SlotState::Writing, 0), pack(SlotState::Ready, 0)) {
            return Err(StreamError::IllegalTransition {
                slot,
                from: self.state(slot),
                to: SlotState::Ready,
            });
        }
        cell.len.store(len.min(self.slot_size), Ordering::Release);
        let stamp = self.stamp(slot);

        let admitted = admit(slot);
        if admitted {
            queues.insert_ready(slot, stamp);
        } else if cell.cas(pack(SlotState::Ready, 0), pack(SlotState::Free, 0)) {
            self.clear(slot);
            queues.push_free(slot);
        }

        drop(queues);
        self.available.notify_one();
        Ok(admitted)
    }

    /// `Writing -> Free`: a failed load, or a staging buffer whose contents
    /// were consumed
    pub fn recycle(&self, slot: SlotId) -> StreamResult<()> {
        let cell = &self.slots[slot];
        let mut queues = self.queues.lock();

        if !cell.cas(pack(SlotState::Writing, 0), pack(SlotState::Free, 0)) {
            return Err(StreamError::IllegalTransition {
                slot,
                from: self.state(slot),
                to: SlotState::Free,
            });
        }
        self.clear(slot);
        queues.push_free(slot);

        drop(queues);
        self.available.notify_one();
        Ok(())
    }

    /// `Ready -> Free`. Returns false if the slot is pinned by a reader.
    ///
    /// Nothing outside the pool hears about it; when slots are indexed by
    /// owner use `release_owned` and drop the entry in its hook.
    pub fn release(&self, slot: SlotId) -> StreamResult<bool> {
        match self.state(slot) {
            SlotState::Ready | SlotState::Reading => {}
            other => return Err(StreamError::IllegalTransition { slot, from: other, to: SlotState::Free }),
        }
        Ok(self.release_inner(slot, None, |_| {}))
    }

    /// `Ready -> Free` only while the slot still holds `owner`, running
    /// `on_release` under the pool lock. Returns false if the slot is pinned
    /// or was recycled for another tile.
    pub fn release_owned<F>(&self, slot: SlotId, owner: TileId, on_release: F) -> bool
    where
        F: FnOnce(SlotId),
    {
        self.release_inner(slot, Some(owner), on_release)
    }

    fn release_inner<F>(&self, slot: SlotId, owner: Option<TileId>, on_release: F) -> bool
    where
        F: FnOnce(SlotId),
    {
        let cell = &self.slots[slot];
        let mut queues = self.queues.lock();

        // Owners only change while Writing, which requires this lock
        if owner.is_some() && self.owner(slot) != owner {
            return false;
        }
        if !cell.cas(pack(SlotState::Ready, 0), pack(SlotState::Free, 0)) {
            return false;
        }

        on_release(slot);
        self.clear(slot);
        queues.push_free(slot);

        drop(queues);
        self.available.notify_one();
        true
    }

    /// Pin a Ready or Reading slot for reading. Already-Reading is a success.
    pub fn begin_read(&self, slot: SlotId) -> bool {
        let cell = &self.slots[slot];
        loop {
            let current = cell.word.load(Ordering::Acquire);
            let target = match unpack(current).0 {
                SlotState::Ready | SlotState::Reading => next_word(current, SlotState::Reading),
                _ => None,
            };
            let Some(target) = target else {
                return false;
            };
            if cell.cas(current, target) {
                self.stamp(slot);
                return true;
            }
        }
    }

    /// Drop one read pin; the last reader moves the slot back to Ready
    pub fn end_read(&self, slot: SlotId) -> StreamResult<()> {
        let cell = &self.slots[slot];
        loop {
            let current = cell.word.load(Ordering::Acquire);
            let (state, _) = unpack(current);
            if state != SlotState::Reading {
                return Err(StreamError::NotPinned { slot, state });
            }
            let Some(target) = next_word(current, SlotState::Ready) else {
                return Err(StreamError::NotPinned { slot, state });
            };
            if cell.cas(current, target) {
                self.after_transition(slot, SlotState::Reading, unpack(target).0);
                return Ok(());
            }
        }
    }

    /// Mark a slot as recently used so eviction prefers other slots
    pub fn touch(&self, slot: SlotId) {
        let stamp = self.stamp(slot);
        if self.state(slot) == SlotState::Ready {
            let mut queues = self.queues.lock();
            if queues.ready_keys[slot].is_some() && self.state(slot) == SlotState::Ready {
                queues.insert_ready(slot, stamp);
            }
        }
    }

    /// Record which tile a Writing slot is being filled with
    pub fn set_owner(&self, slot: SlotId, owner: TileId) -> StreamResult<()> {
        self.require_writing(slot)?;
        self.slots[slot].owner.store(owner.0, Ordering::Release);
        Ok(())
    }

    pub fn set_assoc(&self, slot: SlotId, data: A) {
        *self.slots[slot].assoc.lock() = Some(data);
    }

    pub fn assoc(&self, slot: SlotId) -> Option<A> {
        self.slots[slot].assoc.lock().clone()
    }

    /// Exclusive access to a slot's bytes, only while it is Writing
    pub fn with_write<R>(&self, slot: SlotId, f: impl FnOnce(&mut [u8]) -> R) -> StreamResult<R> {
        self.require_writing(slot)?;
        let mut data = self.slots[slot].data.write();
        Ok(f(&mut data))
    }

    /// Shared access to a pinned slot's valid bytes
    pub fn with_read<R>(&self, slot: SlotId, f: impl FnOnce(&[u8]) -> R) -> StreamResult<R> {
        let bytes = self.read_bytes(slot)?;
        Ok(f(&bytes))
    }

    /// Guard over a pinned slot's valid bytes
    pub fn read_bytes(&self, slot: SlotId) -> StreamResult<TileBytes<'_>> {
        let state = self.state(slot);
        if state != SlotState::Reading {
            return Err(StreamError::NotPinned { slot, state });
        }
        let len = self.slots[slot].len.load(Ordering::Acquire);
        Ok(RwLockReadGuard::map(self.slots[slot].data.read(), |data| &data[..len]))
    }

    /// Wake every thread blocked in `acquire_free`
    pub fn wake_all(&self) {
        self.available.notify_all();
    }

    pub fn stats(&self) -> PoolStats {
        let mut stats = PoolStats {
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            acquire_timeouts: self.acquire_timeouts.load(Ordering::Relaxed),
            ..PoolStats::default()
        };
        for slot in 0..self.slots.len() {
            match self.state(slot) {
                SlotState::Free => stats.free += 1,
                SlotState::Writing => stats.writing += 1,
                SlotState::Ready => stats.ready += 1,
                SlotState::Reading => stats.reading += 1,
            }
        }
        stats
    }

    fn require_writing(&self, slot: SlotId) -> StreamResult<()> {
        match self.state(slot) {
            SlotState::Writing => Ok(()),
            state => Err(StreamError::NotWriting { slot, state }),
        }
    }

    fn stamp(&self, slot: SlotId) -> u64 {
        let now = self.clock.fetch_add(1, Ordering::Relaxed);
        self.slots[slot].last_used.store(now, Ordering::Relaxed);
        now
    }

    fn clear(&self, slot: SlotId) {
        let cell = &self.slots[slot];
        cell.owner.store(NO_OWNER, Ordering::Release);
        cell.len.store(0, Ordering::Release);
        cell.assoc.lock().take();
    }

    /// Keep the free list and LRU order in step with a completed transition.
    /// Moves into Writing or Reading need no bookkeeping: stale ready entries
    /// are dropped lazily by eviction.
    fn after_transition(&self, slot: SlotId, from: SlotState, to: SlotState) {
        if from == to || !matches!(to, SlotState::Free | SlotState::Ready) {
            return;
        }

        let mut queues = self.queues.lock();
        match self.state(slot) {
            SlotState::Free => {
                self.clear(slot);
                queues.push_free(slot);
            }
            SlotState::Ready => {
                let stamp = self.slots[slot].last_used.load(Ordering::Relaxed);
                queues.insert_ready(slot, stamp);
            }
            _ => return,
        }
        drop(queues);
        self.available.notify_one();
    }
}
