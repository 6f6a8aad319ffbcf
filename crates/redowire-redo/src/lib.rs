//! Redo log readers and the physical-to-logical parser.
//!
//! This crate owns the first two stages of the pipeline: the [`reader`]
//! streams validated blocks of one redo file into a bounded ring buffer
//! from a background thread, and the [`parser`] consumes those blocks as
//! LWN groups, decoding redo records into transactions.

pub mod block;
pub mod device;
pub mod fixture;
pub mod lwn;
pub mod parser;
pub mod reader;
pub mod record;
pub mod row;

pub use block::{BlockHeader, RedoFileHeader};
pub use parser::{ParseOutcome, Parser};
pub use reader::{Reader, ReaderConfig};
