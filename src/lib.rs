pub mod config;
pub mod error;
pub mod memory;
pub mod streaming;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use config::StreamConfig;
pub use error::{StreamError, StreamErrorContext, StreamResult};
pub use memory::{PoolStats, SlotId, SlotPool, SlotState};
pub use streaming::{
    AbortResult, AddressResolver, BackingStore, CacheStats, Cut, CutCamera, CutDatabase, CutKey, CutState,
    FileStore, LoadFailure, MemoryStore, MmapStore, Priority, QueryResult, RequestOutcome, StreamCache, TileExtent,
    TileGuard, TileTransform, UniformResolver, UpdateMode,
};

/// Identifier of one tile in the backing store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileId(pub u64);

impl fmt::Display for TileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<u64> for TileId {
    fn from(raw: u64) -> Self {
        TileId(raw)
    }
}
