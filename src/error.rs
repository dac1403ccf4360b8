//! Error handling for the streaming cache
//!
//! One error enum for every subsystem, plus a context helper trait used to
//! turn `Option`s and foreign results into `StreamError` without `unwrap()`.

use crate::memory::{SlotId, SlotState};
use crate::TileId;

/// Result type for streaming cache operations
pub type StreamResult<T> = Result<T, StreamError>;

/// Errors raised by the slot pool, scheduler, loader and orchestrator
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("transient I/O failure for tile {id} at offset {offset} (+{length} bytes): {source}")]
    TransientIo {
        id: TileId,
        offset: u64,
        length: u64,
        #[source]
        source: std::io::Error,
    },

    #[error("tile {id} failed permanently after {attempts} attempts: {reason}")]
    PermanentFailure {
        id: TileId,
        attempts: u32,
        reason: String,
    },

    #[error("invalid tile id {id}: {reason}")]
    InvalidId { id: TileId, reason: String },

    #[error("tile {id} is {length} bytes but slots hold {slot_size} bytes")]
    TileTooLarge {
        id: TileId,
        length: u64,
        slot_size: usize,
    },

    #[error("no free or evictable slot after waiting {waited_ms} ms")]
    PoolExhausted { waited_ms: u64 },

    #[error("tile {id} not resident after {waited_ms} ms")]
    Timeout { id: TileId, waited_ms: u64 },

    #[error("transform failed for tile {id}: {reason}")]
    TransformFailed { id: TileId, reason: String },

    #[error("illegal slot transition {from:?} -> {to:?} on slot {slot}")]
    IllegalTransition {
        slot: SlotId,
        from: SlotState,
        to: SlotState,
    },

    #[error("slot {slot} is {state:?}, expected Writing")]
    NotWriting { slot: SlotId, state: SlotState },

    #[error("slot {slot} is {state:?}, expected a pinned read")]
    NotPinned { slot: SlotId, state: SlotState },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{component} is shut down")]
    ShutDown { component: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl StreamError {
    /// Whether a retry of the same request may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, StreamError::TransientIo { .. } | StreamError::PoolExhausted { .. })
    }
}

/// Error context for streaming operations
pub trait StreamErrorContext<T> {
    fn stream_context(self, context: &str) -> StreamResult<T>;
}

impl<T> StreamErrorContext<T> for Option<T> {
    fn stream_context(self, context: &str) -> StreamResult<T> {
        self.ok_or_else(|| StreamError::Config(format!("missing {}", context)))
    }
}

impl<T, E> StreamErrorContext<T> for Result<T, E>
where
    E: std::fmt::Display,
{
    fn stream_context(self, context: &str) -> StreamResult<T> {
        self.map_err(|e| StreamError::Config(format!("{}: {}", context, e)))
    }
}
