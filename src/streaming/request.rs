use crate::memory::SlotId;
use crate::streaming::source::TileExtent;
use crate::TileId;

/// Request priority; larger is more urgent
pub type Priority = i32;

/// Generational handle into the request arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestHandle {
    index: u32,
    generation: u32,
}

/// Life-cycle of a load request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestState {
    Queued,
    Loading,
    Ready,
    Aborted,
}

/// Outstanding load request for one tile
#[derive(Debug, Clone)]
pub struct Request {
    pub id: TileId,
    pub priority: Priority,
    pub state: RequestState,
    pub extent: TileExtent,
    /// Target slot once a loader has acquired one
    pub slot: Option<SlotId>,
    pub attempts: u32,
    /// Enqueue order, breaks priority ties
    pub(crate) seq: u64,
    /// Position in the scheduler heap while queued
    pub(crate) heap_pos: Option<usize>,
}

/// Everything a loader worker needs to service a request
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadJob {
    pub handle: RequestHandle,
    pub id: TileId,
    pub priority: Priority,
    pub extent: TileExtent,
    pub attempts: u32,
}

struct ArenaEntry {
    generation: u32,
    request: Option<Request>,
}

/// Arena owning every live request; the scheduler heap and loader jobs only
/// ever hold handles into it
#[derive(Default)]
pub(crate) struct RequestArena {
    entries: Vec<ArenaEntry>,
    vacant: Vec<u32>,
    live: usize,
}

impl RequestArena {
    pub fn insert(&mut self, request: Request) -> RequestHandle {
        self.live += 1;
        if let Some(index) = self.vacant.pop() {
            let entry = &mut self.entries[index as usize];
            entry.request = Some(request);
            return RequestHandle { index, generation: entry.generation };
        }

        let index = self.entries.len() as u32;
        self.entries.push(ArenaEntry { generation: 0, request: Some(request) });
        RequestHandle { index, generation: 0 }
    }

    pub fn get(&self, handle: RequestHandle) -> Option<&Request> {
        self.entries
            .get(handle.index as usize)
            .filter(|entry| entry.generation == handle.generation)
            .and_then(|entry| entry.request.as_ref())
    }

    pub fn get_mut(&mut self, handle: RequestHandle) -> Option<&mut Request> {
        self.entries
            .get_mut(handle.index as usize)
            .filter(|entry| entry.generation == handle.generation)
            .and_then(|entry| entry.request.as_mut())
    }

    /// Destroy a request; its handle (and any copy of it) goes stale
    pub fn remove(&mut self, handle: RequestHandle) -> Option<Request> {
        let entry = self.entries.get_mut(handle.index as usize)?;
        if entry.generation != handle.generation {
            return None;
        }
        let request = entry.request.take()?;
        entry.generation = entry.generation.wrapping_add(1);
        self.vacant.push(handle.index);
        self.live -= 1;
        Some(request)
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (RequestHandle, &mut Request)> {
        self.entries.iter_mut().enumerate().filter_map(|(index, entry)| {
            let generation = entry.generation;
            entry.request.as_mut().map(|request| {
                (RequestHandle { index: index as u32, generation }, request)
            })
        })
    }
}
