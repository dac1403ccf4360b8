/// Fixed-capacity memory for the streaming cache
///
/// The only memory shared between loader workers and the consumer is a set
/// of equally sized byte slots whose ownership is decided by an atomic
/// life-cycle word per slot.

pub mod slot_pool;

pub use slot_pool::{PoolStats, SlotId, SlotPool, SlotSnapshot, SlotState, TileBytes};
