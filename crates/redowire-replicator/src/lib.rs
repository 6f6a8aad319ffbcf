//! Orchestration: file discovery, reader/parser scheduling, online and
//! archive modes, the SCN watermark and ordered release of committed
//! transactions.

pub mod archive;
pub mod pathmap;
pub mod replicator;

pub use archive::{sequence_from_file_name, ArchiveCandidate, ArchiveQueues, SeqThread};
pub use pathmap::PathMapping;
pub use replicator::{Replicator, ReplicatorConfig};
