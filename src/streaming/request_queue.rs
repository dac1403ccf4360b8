/// Request Scheduler
///
/// Indexed binary max-heap of pending load requests ordered by priority,
/// ties broken by enqueue order. Each request remembers its heap position,
/// so a priority change is a single sift instead of a remove + insert scan.
/// Aborted requests stay in the heap and are skipped when they surface.
/// Requests returned for a retry wait outside the heap until their backoff
/// has passed, so no worker sleeps on them.

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::memory::SlotId;
use crate::streaming::request::{
    LoadJob, Priority, Request, RequestArena, RequestHandle, RequestState,
};
use crate::streaming::source::TileExtent;
use crate::TileId;

/// How a re-request with a different priority affects a queued request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateMode {
    /// Priorities are fixed at first request
    Never,
    /// Any change moves the request
    #[default]
    Always,
    /// Only escalations move the request
    IncrementOnly,
    /// Only de-escalations move the request
    DecrementOnly,
}

impl UpdateMode {
    fn permits(self, old: Priority, new: Priority) -> bool {
        match self {
            UpdateMode::Never => false,
            UpdateMode::Always => new != old,
            UpdateMode::IncrementOnly => new > old,
            UpdateMode::DecrementOnly => new < old,
        }
    }
}

/// Whether a tile currently has an outstanding request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryResult {
    NotIndexed,
    Waiting(Priority),
    Loading,
}

/// Result of submitting a request for a tile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// A new request was created
    Queued(RequestHandle),
    /// The tile was already queued; `moved` tells whether its priority changed
    Updated { handle: RequestHandle, moved: bool },
    /// The tile is being loaded; priority no longer matters
    AlreadyLoading(RequestHandle),
}

impl SubmitOutcome {
    pub fn handle(&self) -> RequestHandle {
        match *self {
            SubmitOutcome::Queued(handle)
            | SubmitOutcome::Updated { handle, .. }
            | SubmitOutcome::AlreadyLoading(handle) => handle,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortResult {
    /// Removed before any worker picked it up
    Aborted,
    /// A worker already has it; its result will be discarded on publish
    AlreadyLoading,
    NotFound,
}

#[derive(Default)]
struct SchedulerState {
    arena: RequestArena,
    heap: Vec<RequestHandle>,
    by_tile: HashMap<TileId, RequestHandle>,
    /// Requeued with a backoff: not poppable before the instant
    delayed: Vec<(Instant, RequestHandle)>,
    next_seq: u64,
    queued: usize,
}

impl SchedulerState {
    fn key(&self, handle: RequestHandle) -> (Priority, Reverse<u64>) {
        self.arena
            .get(handle)
            .map(|request| (request.priority, Reverse(request.seq)))
            .unwrap_or((Priority::MIN, Reverse(u64::MAX)))
    }

    fn set_pos(&mut self, index: usize) {
        let handle = self.heap[index];
        if let Some(request) = self.arena.get_mut(handle) {
            request.heap_pos = Some(index);
        }
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.heap.swap(a, b);
        self.set_pos(a);
        self.set_pos(b);
    }

    fn sift_up(&mut self, mut index: usize) {
        while index > 0 {
            let parent = (index - 1) / 2;
            if self.key(self.heap[index]) <= self.key(self.heap[parent]) {
                break;
            }
            self.swap(index, parent);
            index = parent;
        }
    }

    fn sift_down(&mut self, mut index: usize) {
        let len = self.heap.len();
        loop {
            let left = 2 * index + 1;
            let right = left + 1;
            let mut best = index;
            if left < len && self.key(self.heap[left]) > self.key(self.heap[best]) {
                best = left;
            }
            if right < len && self.key(self.heap[right]) > self.key(self.heap[best]) {
                best = right;
            }
            if best == index {
                break;
            }
            self.swap(index, best);
            index = best;
        }
    }

    fn heap_push(&mut self, handle: RequestHandle) {
        self.heap.push(handle);
        let index = self.heap.len() - 1;
        self.set_pos(index);
        self.sift_up(index);
    }

    fn heap_pop(&mut self) -> Option<RequestHandle> {
        if self.heap.is_empty() {
            return None;
        }
        let last = self.heap.len() - 1;
        self.swap(0, last);
        let handle = self.heap.pop()?;
        if let Some(request) = self.arena.get_mut(handle) {
            request.heap_pos = None;
        }
        if !self.heap.is_empty() {
            self.sift_down(0);
        }
        Some(handle)
    }

    /// Re-establish heap order after the key at `handle` changed
    fn reposition(&mut self, handle: RequestHandle) {
        let Some(index) = self.arena.get(handle).and_then(|r| r.heap_pos) else {
            return;
        };
        self.sift_up(index);
        if let Some(index) = self.arena.get(handle).and_then(|r| r.heap_pos) {
            self.sift_down(index);
        }
    }

    fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Move a queued request to a new priority, as if removed and pushed again
    fn move_to(&mut self, handle: RequestHandle, priority: Priority) {
        let seq = self.next_seq();
        if let Some(request) = self.arena.get_mut(handle) {
            request.priority = priority;
            request.seq = seq;
        }
        self.reposition(handle);
    }

    /// Move delayed requests that are due into the heap. Returns the
    /// earliest instant still waiting.
    fn promote_due(&mut self, now: Instant) -> Option<Instant> {
        let mut earliest: Option<Instant> = None;
        let mut index = 0;
        while index < self.delayed.len() {
            let (due, handle) = self.delayed[index];
            if due > now {
                earliest = Some(earliest.map_or(due, |e| e.min(due)));
                index += 1;
                continue;
            }
            // Aborted ones are dropped when they surface from the heap
            self.delayed.swap_remove(index);
            self.heap_push(handle);
        }
        earliest
    }

    fn forget_tile(&mut self, id: TileId, handle: RequestHandle) {
        if self.by_tile.get(&id) == Some(&handle) {
            self.by_tile.remove(&id);
        }
    }
}

/// Priority queue of pending loads shared by the orchestrator and workers
pub struct RequestScheduler {
    state: Mutex<SchedulerState>,
    ready: Condvar,
    mode: UpdateMode,
    shutdown: AtomicBool,
}

impl RequestScheduler {
    pub fn new(mode: UpdateMode) -> Self {
        Self {
            state: Mutex::new(SchedulerState::default()),
            ready: Condvar::new(),
            mode,
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn mode(&self) -> UpdateMode {
        self.mode
    }

    /// Queue a load for `id`, or update the priority of its queued request
    pub fn push(&self, id: TileId, priority: Priority, extent: TileExtent) -> SubmitOutcome {
        let mut state = self.state.lock();

        if let Some(&handle) = state.by_tile.get(&id) {
            let current = state.arena.get(handle).map(|r| (r.state, r.priority));
            match current {
                Some((RequestState::Queued, old)) => {
                    let moved = self.mode.permits(old, priority);
                    if moved {
                        state.move_to(handle, priority);
                    }
                    return SubmitOutcome::Updated { handle, moved };
                }
                Some((RequestState::Loading, _)) => return SubmitOutcome::AlreadyLoading(handle),
                _ => {
                    state.by_tile.remove(&id);
                }
            }
        }

        let seq = state.next_seq();
        let handle = state.arena.insert(Request {
            id,
            priority,
            state: RequestState::Queued,
            extent,
            slot: None,
            attempts: 0,
            seq,
            heap_pos: None,
        });
        state.heap_push(handle);
        state.by_tile.insert(id, handle);
        state.queued += 1;

        drop(state);
        self.ready.notify_one();
        SubmitOutcome::Queued(handle)
    }

    /// Change the priority of a queued request regardless of the update mode.
    /// Equivalent to remove + push: the request goes behind equal priorities.
    pub fn reinsert(&self, handle: RequestHandle, priority: Priority) -> bool {
        let mut state = self.state.lock();
        match state.arena.get(handle).map(|r| r.state) {
            Some(RequestState::Queued) => {
                state.move_to(handle, priority);
                true
            }
            _ => false,
        }
    }

    /// Mode-gated priority update of the queued request for `id`
    pub fn update(&self, id: TileId, priority: Priority) -> bool {
        let mut state = self.state.lock();
        let Some(&handle) = state.by_tile.get(&id) else {
            return false;
        };
        match state.arena.get(handle).map(|r| (r.state, r.priority)) {
            Some((RequestState::Queued, old)) if self.mode.permits(old, priority) => {
                state.move_to(handle, priority);
                true
            }
            _ => false,
        }
    }

    /// Rewrite the priority of every queued request in one pass.
    /// Returns how many changed; relative enqueue order is kept.
    pub fn adjust_priorities<F>(&self, mut adjust: F) -> usize
    where
        F: FnMut(TileId, Priority) -> Option<Priority>,
    {
        let mut state = self.state.lock();
        let mut changed = 0;
        for (_, request) in state.arena.iter_mut() {
            if request.state != RequestState::Queued {
                continue;
            }
            if let Some(priority) = adjust(request.id, request.priority) {
                if priority != request.priority {
                    request.priority = priority;
                    changed += 1;
                }
            }
        }
        if changed > 0 {
            for index in (0..state.heap.len() / 2).rev() {
                state.sift_down(index);
            }
        }
        changed
    }

    /// Block up to `timeout` for the most urgent queued request and mark it
    /// Loading. Returns None on timeout or shutdown.
    pub fn pop_highest(&self, timeout: Duration) -> Option<LoadJob> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();

        loop {
            if self.shutdown.load(Ordering::Acquire) {
                return None;
            }
            let now = Instant::now();
            let next_due = state.promote_due(now);

            while let Some(handle) = state.heap_pop() {
                let job = match state.arena.get_mut(handle) {
                    Some(request) if request.state == RequestState::Queued => {
                        request.state = RequestState::Loading;
                        LoadJob {
                            handle,
                            id: request.id,
                            priority: request.priority,
                            extent: request.extent,
                            attempts: request.attempts,
                        }
                    }
                    _ => {
                        // Aborted while queued
                        state.arena.remove(handle);
                        continue;
                    }
                };
                state.queued -= 1;
                return Some(job);
            }

            if now >= deadline {
                return None;
            }
            let wake = next_due.map_or(deadline, |due| due.min(deadline));
            self.ready.wait_until(&mut state, wake);
        }
    }

    /// Put a popped job back in the queue (slot pool exhausted).
    /// Returns false if the request was aborted meanwhile; it is destroyed.
    pub fn requeue(&self, job: LoadJob) -> bool {
        self.requeue_after(job, Duration::ZERO)
    }

    /// Put a popped job back, poppable once `delay` has passed. The request
    /// counts as queued meanwhile and its priority can still change.
    pub fn requeue_after(&self, job: LoadJob, delay: Duration) -> bool {
        let mut state = self.state.lock();
        match state.arena.get(job.handle).map(|r| r.state) {
            Some(RequestState::Loading) => {}
            Some(RequestState::Aborted) => {
                state.arena.remove(job.handle);
                return false;
            }
            _ => return false,
        }

        let seq = state.next_seq();
        if let Some(request) = state.arena.get_mut(job.handle) {
            request.state = RequestState::Queued;
            request.attempts = job.attempts;
            request.slot = None;
            request.seq = seq;
        }
        if delay.is_zero() {
            state.heap_push(job.handle);
        } else {
            state.delayed.push((Instant::now() + delay, job.handle));
        }
        state.queued += 1;

        drop(state);
        self.ready.notify_one();
        true
    }

    /// Record the slot a loading request is being written into
    pub fn set_slot(&self, handle: RequestHandle, slot: SlotId) {
        if let Some(request) = self.state.lock().arena.get_mut(handle) {
            request.slot = Some(slot);
        }
    }

    /// Destroy a request whose data was published. Returns its final state:
    /// a live load ends Ready and may be indexed, Aborted means discard.
    pub fn complete(&self, handle: RequestHandle) -> Option<RequestState> {
        let mut state = self.state.lock();
        let mut request = state.arena.remove(handle)?;
        state.forget_tile(request.id, handle);
        if request.state == RequestState::Loading {
            request.state = RequestState::Ready;
        }
        Some(request.state)
    }

    /// Destroy a request that failed permanently
    pub fn fail(&self, handle: RequestHandle) -> Option<Request> {
        let mut state = self.state.lock();
        let mut request = state.arena.remove(handle)?;
        state.forget_tile(request.id, handle);
        request.state = RequestState::Aborted;
        Some(request)
    }

    /// Abort the outstanding request for `id`
    pub fn abort(&self, id: TileId) -> AbortResult {
        let mut state = self.state.lock();
        let Some(handle) = state.by_tile.remove(&id) else {
            return AbortResult::NotFound;
        };
        let Some(request) = state.arena.get_mut(handle) else {
            return AbortResult::NotFound;
        };

        match request.state {
            RequestState::Queued => {
                request.state = RequestState::Aborted;
                state.queued -= 1;
                AbortResult::Aborted
            }
            RequestState::Loading => {
                request.state = RequestState::Aborted;
                AbortResult::AlreadyLoading
            }
            _ => AbortResult::NotFound,
        }
    }

    pub fn query(&self, id: TileId) -> QueryResult {
        let state = self.state.lock();
        let request = state.by_tile.get(&id).and_then(|&handle| state.arena.get(handle));
        match request.map(|r| (r.state, r.priority)) {
            Some((RequestState::Queued, priority)) => QueryResult::Waiting(priority),
            Some((RequestState::Loading, _)) => QueryResult::Loading,
            _ => QueryResult::NotIndexed,
        }
    }

    pub fn state(&self, handle: RequestHandle) -> Option<RequestState> {
        self.state.lock().arena.get(handle).map(|r| r.state)
    }

    pub fn request(&self, handle: RequestHandle) -> Option<Request> {
        self.state.lock().arena.get(handle).cloned()
    }

    /// Requests waiting for a worker
    pub fn len(&self) -> usize {
        self.state.lock().queued
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queued plus in-flight requests
    pub fn outstanding(&self) -> usize {
        self.state.lock().by_tile.len()
    }

    /// Wake every blocked worker and stop handing out jobs
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        let _state = self.state.lock();
        self.ready.notify_all();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    const EXTENT: TileExtent = TileExtent { offset: 0, length: 16 };

    fn drain(scheduler: &RequestScheduler) -> Vec<u64> {
        let mut order = Vec::new();
        while let Some(job) = scheduler.pop_highest(Duration::ZERO) {
            order.push(job.id.0);
        }
        order
    }

    #[test]
    fn test_descending_priority_then_fifo() {
        let scheduler = RequestScheduler::new(UpdateMode::Always);
        scheduler.push(TileId(1), 2, EXTENT);
        scheduler.push(TileId(2), 9, EXTENT);
        scheduler.push(TileId(3), 2, EXTENT);
        scheduler.push(TileId(4), 5, EXTENT);
        scheduler.push(TileId(5), 9, EXTENT);

        assert_eq!(drain(&scheduler), vec![2, 5, 4, 1, 3]);
    }

    #[test]
    fn test_escalated_request_overtakes() {
        let scheduler = RequestScheduler::new(UpdateMode::Always);
        scheduler.push(TileId(10), 1, EXTENT);
        scheduler.push(TileId(20), 5, EXTENT);
        let outcome = scheduler.push(TileId(10), 10, EXTENT);

        assert!(matches!(outcome, SubmitOutcome::Updated { moved: true, .. }));
        assert_eq!(drain(&scheduler), vec![10, 20]);
    }

    #[test]
    fn test_reinsert_goes_behind_equal_priority() {
        let scheduler = RequestScheduler::new(UpdateMode::Never);
        let first = scheduler.push(TileId(1), 3, EXTENT).handle();
        scheduler.push(TileId(2), 3, EXTENT);

        assert!(scheduler.reinsert(first, 3));
        assert_eq!(drain(&scheduler), vec![2, 1]);
    }

    #[test]
    fn test_update_modes() {
        let increment = RequestScheduler::new(UpdateMode::IncrementOnly);
        increment.push(TileId(1), 5, EXTENT);
        assert!(!increment.update(TileId(1), 3));
        assert!(increment.update(TileId(1), 8));
        assert_eq!(increment.query(TileId(1)), QueryResult::Waiting(8));

        let decrement = RequestScheduler::new(UpdateMode::DecrementOnly);
        decrement.push(TileId(1), 5, EXTENT);
        assert!(!decrement.update(TileId(1), 8));
        assert!(decrement.update(TileId(1), 3));

        let never = RequestScheduler::new(UpdateMode::Never);
        never.push(TileId(1), 5, EXTENT);
        assert!(!never.update(TileId(1), 50));
        assert_eq!(never.query(TileId(1)), QueryResult::Waiting(5));
    }

    #[test]
    fn test_aborted_requests_are_skipped() {
        let scheduler = RequestScheduler::new(UpdateMode::Always);
        scheduler.push(TileId(1), 9, EXTENT);
        scheduler.push(TileId(2), 1, EXTENT);

        assert_eq!(scheduler.abort(TileId(1)), AbortResult::Aborted);
        assert_eq!(scheduler.len(), 1);
        assert_eq!(scheduler.query(TileId(1)), QueryResult::NotIndexed);
        assert_eq!(drain(&scheduler), vec![2]);
        assert_eq!(scheduler.abort(TileId(1)), AbortResult::NotFound);
    }

    #[test]
    fn test_abort_in_flight_discards_completion() {
        let scheduler = RequestScheduler::new(UpdateMode::Always);
        scheduler.push(TileId(7), 1, EXTENT);
        let job = scheduler.pop_highest(Duration::ZERO).expect("job");
        assert_eq!(scheduler.query(TileId(7)), QueryResult::Loading);

        assert_eq!(scheduler.abort(TileId(7)), AbortResult::AlreadyLoading);
        assert_eq!(scheduler.complete(job.handle), Some(RequestState::Aborted));
        assert_eq!(scheduler.outstanding(), 0);
    }

    #[test]
    fn test_requeue_keeps_request_alive() {
        let scheduler = RequestScheduler::new(UpdateMode::Always);
        scheduler.push(TileId(3), 4, EXTENT);
        let mut job = scheduler.pop_highest(Duration::ZERO).expect("job");
        job.attempts += 1;

        assert!(scheduler.requeue(job));
        let again = scheduler.pop_highest(Duration::ZERO).expect("requeued job");
        assert_eq!(again.handle, job.handle);
        assert_eq!(again.attempts, 1);
        assert_eq!(scheduler.complete(again.handle), Some(RequestState::Ready));
        assert_eq!(scheduler.state(again.handle), None);
    }

    #[test]
    fn test_delayed_requeue_lets_others_through() {
        let scheduler = RequestScheduler::new(UpdateMode::Always);
        scheduler.push(TileId(1), 9, EXTENT);
        let job = scheduler.pop_highest(Duration::ZERO).expect("job");
        let requeued_at = Instant::now();
        assert!(scheduler.requeue_after(job, Duration::from_millis(50)));
        scheduler.push(TileId(2), 1, EXTENT);

        // Backoff pending: only the lower priority tile is available
        assert_eq!(drain(&scheduler), vec![2]);
        assert_eq!(scheduler.query(TileId(1)), QueryResult::Waiting(9));
        assert_eq!(scheduler.len(), 1);

        let again = scheduler.pop_highest(Duration::from_secs(5)).expect("due job");
        assert_eq!(again.id, TileId(1));
        assert!(requeued_at.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_aborted_during_backoff_is_dropped() {
        let scheduler = RequestScheduler::new(UpdateMode::Always);
        scheduler.push(TileId(1), 9, EXTENT);
        let job = scheduler.pop_highest(Duration::ZERO).expect("job");
        assert!(scheduler.requeue_after(job, Duration::from_millis(5)));

        assert_eq!(scheduler.abort(TileId(1)), AbortResult::Aborted);
        assert!(scheduler.pop_highest(Duration::from_millis(30)).is_none());
        assert!(scheduler.is_empty());
        assert_eq!(scheduler.state(job.handle), None);
    }

    #[test]
    fn test_loading_request_ignores_resubmission() {
        let scheduler = RequestScheduler::new(UpdateMode::Always);
        scheduler.push(TileId(3), 4, EXTENT);
        let job = scheduler.pop_highest(Duration::ZERO).expect("job");

        let outcome = scheduler.push(TileId(3), 40, EXTENT);
        assert_eq!(outcome, SubmitOutcome::AlreadyLoading(job.handle));
        assert!(scheduler.is_empty());
    }

    #[test]
    fn test_adjust_priorities_reorders() {
        let scheduler = RequestScheduler::new(UpdateMode::Always);
        for id in 0..6u64 {
            scheduler.push(TileId(id), id as Priority, EXTENT);
        }
        let changed = scheduler.adjust_priorities(|id, p| if id.0 % 2 == 0 { Some(p + 10) } else { None });
        assert_eq!(changed, 3);
        assert_eq!(drain(&scheduler), vec![4, 2, 0, 5, 3, 1]);
    }

    #[test]
    fn test_pop_times_out_and_shutdown_wakes() {
        let scheduler = Arc::new(RequestScheduler::new(UpdateMode::Always));
        assert!(scheduler.pop_highest(Duration::from_millis(5)).is_none());

        let worker = {
            let scheduler = scheduler.clone();
            thread::spawn(move || scheduler.pop_highest(Duration::from_secs(10)))
        };
        thread::sleep(Duration::from_millis(20));
        scheduler.shutdown();
        assert!(worker.join().expect("thread joins").is_none());
    }

    #[test]
    fn test_blocked_pop_receives_push() {
        let scheduler = Arc::new(RequestScheduler::new(UpdateMode::Always));
        let worker = {
            let scheduler = scheduler.clone();
            thread::spawn(move || scheduler.pop_highest(Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(10));
        scheduler.push(TileId(42), 0, EXTENT);

        let job = worker.join().expect("thread joins").expect("job");
        assert_eq!(job.id, TileId(42));
    }
}
