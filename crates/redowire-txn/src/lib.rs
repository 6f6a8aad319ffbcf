//! Bounded-memory transaction state.
//!
//! Transactions can grow to hundreds of megabytes; allocating their row
//! changes individually would fragment and thrash. All change storage
//! comes from the [`arena`]: a pool of fixed-size chunks bounded by
//! `memory.min-mb`/`memory.max-mb`, reused through a free list and never
//! returned to the OS mid-run. Transactions address their encoded changes
//! by `(chunk, offset, length)`.

pub mod arena;
pub mod buffer;
pub mod codec;
pub mod transaction;

pub use arena::{Arena, ChunkId, MemoryLimits, CHUNK_SIZE};
pub use buffer::{CommittedTransaction, TransactionBuffer};
pub use transaction::Transaction;
