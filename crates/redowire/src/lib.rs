//! Redowire: a Change-Data-Capture engine that extracts committed
//! row-level changes from an Oracle database by parsing its redo logs
//! directly, without LogMiner.
//!
//! This facade re-exports the public surface of the workspace crates:
//!
//! - [`types`] — SCNs, sequences, XIDs and the other core value types;
//! - [`redo`] — redo file readers and the physical-to-logical parser;
//! - [`txn`] — the arena-backed transaction buffer;
//! - [`metadata`] — schema snapshot and checkpoint persistence;
//! - [`builder`] — the logical-operation output stream;
//! - [`replicator`] — orchestration and SCN-ordered release.

pub use redowire_builder as builder;
pub use redowire_error as error;
pub use redowire_metadata as metadata;
pub use redowire_redo as redo;
pub use redowire_replicator as replicator;
pub use redowire_txn as txn;
pub use redowire_types as types;

pub use redowire_builder::{Builder, BuilderEvent, Metrics};
pub use redowire_error::{RedowireError, Result};
pub use redowire_metadata::Metadata;
pub use redowire_replicator::{Replicator, ReplicatorConfig};
pub use redowire_txn::TransactionBuffer;
pub use redowire_types::{Cx, FileOffset, RedoThread, Scn, Seq, Xid};
