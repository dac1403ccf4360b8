/// Cache Index
///
/// Maps a tile id to the slot holding its data. Entries are only inserted
/// while the slot is being published and only removed while it is being
/// freed, both under the slot pool lock, so an entry never points at a
/// Writing slot and an id never has two entries.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::memory::SlotId;
use crate::TileId;

#[derive(Default)]
pub struct CacheIndex {
    entries: DashMap<TileId, SlotId>,
}

impl CacheIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self { entries: DashMap::with_capacity(capacity) }
    }

    /// Slot currently indexed for `id`. The caller still has to pin the slot
    /// and confirm its owner before trusting the bytes.
    pub fn lookup(&self, id: TileId) -> Option<SlotId> {
        self.entries.get(&id).map(|entry| *entry.value())
    }

    /// Insert unless `id` already has an entry
    pub fn try_insert(&self, id: TileId, slot: SlotId) -> bool {
        match self.entries.entry(id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(vacant) => {
                vacant.insert(slot);
                true
            }
        }
    }

    /// Remove `id` only if it still maps to `slot`
    pub fn remove_if(&self, id: TileId, slot: SlotId) -> bool {
        self.entries.remove_if(&id, |_, current| *current == slot).is_some()
    }

    pub fn contains(&self, id: TileId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Every indexed id, in no particular order
    pub fn ids(&self) -> Vec<TileId> {
        self.entries.iter().map(|entry| *entry.key()).collect()
    }

    pub fn entries(&self) -> Vec<(TileId, SlotId)> {
        self.entries.iter().map(|entry| (*entry.key(), *entry.value())).collect()
    }
}
