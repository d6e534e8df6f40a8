//! Segment memory management: the fixed-class buffer pool and the global
//! memory accounting it shares with every flow.
//!
//! The one shared, per-class-locked, cross-flow resource in this crate. No
//! packet-capture hardware or DMA-backed allocator sits underneath it here,
//! so the pool is a plain safe-Rust slab of recycled byte buffers.

pub(crate) mod pool;

pub use pool::{BufferPool, PooledBuf};
