/// Cut Database
///
/// Owns one `Cut` per (context, view, model) tuple. Records are created the
/// first time a key is addressed and live until their context is removed.
/// The database is an ordinary value: whoever builds the cache owns it.

use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::error::{StreamError, StreamResult};
use crate::streaming::cut::Cut;

/// Rendering context (one per consumer thread / GPU context)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(pub u16);

/// Camera / viewport within a context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ViewId(pub u16);

/// Dataset drawn by a view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModelId(pub u32);

/// Address of one cut, packed as `context:16 | view:16 | model:32`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CutKey {
    pub context: ContextId,
    pub view: ViewId,
    pub model: ModelId,
}

impl CutKey {
    pub fn new(context: ContextId, view: ViewId, model: ModelId) -> Self {
        Self { context, view, model }
    }

    pub fn to_raw(self) -> u64 {
        (self.context.0 as u64) << 48 | (self.view.0 as u64) << 32 | self.model.0 as u64
    }

    pub fn from_raw(raw: u64) -> Self {
        Self {
            context: ContextId((raw >> 48) as u16),
            view: ViewId((raw >> 32) as u16),
            model: ModelId(raw as u32),
        }
    }
}

impl fmt::Display for CutKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.context.0, self.view.0, self.model.0)
    }
}

pub struct CutDatabase {
    cuts: DashMap<u64, Arc<Cut>>,
    next_context: AtomicU32,
    next_view: AtomicU32,
    next_model: AtomicU32,
    default_threshold: f32,
}

fn allocate(counter: &AtomicU32, limit: u32, what: &str) -> StreamResult<u32> {
    counter
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |id| (id <= limit).then_some(id + 1))
        .map_err(|_| StreamError::Config(format!("{} ids exhausted", what)))
}

impl CutDatabase {
    pub fn new(default_threshold: f32) -> Self {
        Self {
            cuts: DashMap::new(),
            next_context: AtomicU32::new(0),
            next_view: AtomicU32::new(0),
            next_model: AtomicU32::new(0),
            default_threshold,
        }
    }

    pub fn register_context(&self) -> StreamResult<ContextId> {
        allocate(&self.next_context, u16::MAX as u32, "context").map(|id| ContextId(id as u16))
    }

    pub fn register_view(&self) -> StreamResult<ViewId> {
        allocate(&self.next_view, u16::MAX as u32, "view").map(|id| ViewId(id as u16))
    }

    pub fn register_model(&self) -> StreamResult<ModelId> {
        allocate(&self.next_model, u32::MAX - 1, "model").map(ModelId)
    }

    /// The cut for `key`, created on first use
    pub fn cut(&self, key: CutKey) -> Arc<Cut> {
        self.cuts
            .entry(key.to_raw())
            .or_insert_with(|| {
                log::debug!("[CutDatabase::cut] created cut {}", key);
                Arc::new(Cut::new(self.default_threshold))
            })
            .value()
            .clone()
    }

    /// The cut for `key` if it was ever addressed
    pub fn get(&self, key: CutKey) -> Option<Arc<Cut>> {
        self.cuts.get(&key.to_raw()).map(|cut| cut.value().clone())
    }

    pub fn swap(&self, key: CutKey) -> bool {
        self.get(key).map(|cut| cut.swap()).unwrap_or(false)
    }

    /// Swap every cut of a context; returns how many had a pending commit
    pub fn swap_context(&self, context: ContextId) -> usize {
        self.cuts_of(context).iter().filter(|cut| cut.swap()).count()
    }

    /// Drop every cut of a context
    pub fn remove_context(&self, context: ContextId) -> usize {
        let before = self.cuts.len();
        self.cuts.retain(|raw, _| CutKey::from_raw(*raw).context != context);
        let removed = before.saturating_sub(self.cuts.len());
        log::debug!("[CutDatabase::remove_context] context {}: {} cuts removed", context.0, removed);
        removed
    }

    pub fn keys(&self) -> Vec<CutKey> {
        let mut keys: Vec<CutKey> = self.cuts.iter().map(|entry| CutKey::from_raw(*entry.key())).collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.cuts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cuts.is_empty()
    }

    fn cuts_of(&self, context: ContextId) -> Vec<Arc<Cut>> {
        self.cuts
            .iter()
            .filter(|entry| CutKey::from_raw(*entry.key()).context == context)
            .map(|entry| entry.value().clone())
            .collect()
    }
}

impl Default for CutDatabase {
    fn default() -> Self {
        Self::new(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_packing() {
        let key = CutKey::new(ContextId(0xBEEF), ViewId(7), ModelId(0xDEAD_0001));
        assert_eq!(key.to_raw(), 0xBEEF_0007_DEAD_0001);
        assert_eq!(CutKey::from_raw(key.to_raw()), key);
    }

    #[test]
    fn test_cuts_are_created_lazily_and_shared() {
        let database = CutDatabase::new(2.0);
        let key = CutKey::new(ContextId(0), ViewId(0), ModelId(0));
        assert!(database.get(key).is_none());

        let a = database.cut(key);
        let b = database.cut(key);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.front().threshold, 2.0);
    }

    #[test]
    fn test_swap_and_remove_context() {
        let database = CutDatabase::default();
        let ctx = database.register_context().expect("context id");
        let other = database.register_context().expect("context id");
        let view = database.register_view().expect("view id");

        for model in 0..3 {
            database.cut(CutKey::new(ctx, view, ModelId(model))).commit();
        }
        database.cut(CutKey::new(other, view, ModelId(0))).commit();

        assert_eq!(database.swap_context(ctx), 3);
        assert_eq!(database.swap_context(ctx), 0);
        assert_eq!(database.remove_context(ctx), 3);
        assert_eq!(database.keys(), vec![CutKey::new(other, view, ModelId(0))]);
    }

    #[test]
    fn test_registration_is_monotonic() {
        let database = CutDatabase::default();
        assert_eq!(database.register_model().expect("model id"), ModelId(0));
        assert_eq!(database.register_model().expect("model id"), ModelId(1));
        assert_ne!(database.register_view().expect("view id"), database.register_view().expect("view id"));
    }
}
