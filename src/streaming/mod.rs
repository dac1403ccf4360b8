// Out-of-core tile streaming
// Fixed slot pool, priority scheduler, background loaders and per-view cuts

pub mod cache_index;
pub mod cut;
pub mod cut_database;
pub mod loader;
pub mod request;
pub mod request_queue;
pub mod source;
pub mod stats;
pub mod stream_cache;

pub use cache_index::CacheIndex;
pub use cut::{Cut, CutCamera, CutState, NodeId};
pub use cut_database::{ContextId, CutDatabase, CutKey, ModelId, ViewId};
pub use loader::LoaderPipeline;
pub use request::{LoadJob, Priority, Request, RequestHandle, RequestState};
pub use request_queue::{AbortResult, QueryResult, RequestScheduler, SubmitOutcome, UpdateMode};
pub use source::{
    AddressResolver, BackingStore, ExtentTable, FileStore, MemoryStore, MmapStore, TileExtent, TileTransform,
    UniformResolver,
};
pub use stats::{CacheCounters, CacheStats};
pub use stream_cache::{LoadFailure, RequestOutcome, StreamCache, TileGuard};

/// Default slot size: one 256x256 RGBA8 tile
pub const DEFAULT_SLOT_SIZE: usize = 256 * 256 * 4;
