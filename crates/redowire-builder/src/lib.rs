//! The builder stream: logical operations handed to writer sinks.
//!
//! The parser thread produces [`BuilderEvent`]s; writers consume them
//! from a bounded queue on their own threads. The queue bound is part of
//! the engine's end-to-end backpressure: when writers fall behind, the
//! parser thread blocks on `emit` instead of growing memory.

pub mod flush;
pub mod json;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender};
use redowire_error::{RedowireError, Result};
use redowire_types::{FieldValue, RedoThread, RowOpKind, Scn, Xid};

/// One output column: resolved name plus decoded value.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnOut {
    pub name: String,
    pub value: FieldValue,
}

/// A logical row operation in the output stream.
#[derive(Debug, Clone, PartialEq)]
pub struct RowEvent {
    pub op: RowOpKind,
    pub scn: Scn,
    pub commit_scn: Scn,
    pub xid: Xid,
    pub thread: RedoThread,
    pub owner: String,
    pub table: String,
    pub before: Vec<ColumnOut>,
    pub after: Vec<ColumnOut>,
    /// Monotone output index, used by the new-data predicate.
    pub lwn_idx: u64,
}

/// Events crossing the builder boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum BuilderEvent {
    Begin {
        xid: Xid,
        commit_scn: Scn,
        thread: RedoThread,
    },
    Row(Box<RowEvent>),
    Commit {
        xid: Xid,
        commit_scn: Scn,
    },
}

impl BuilderEvent {
    /// The commit SCN this event belongs to.
    #[must_use]
    pub fn commit_scn(&self) -> Scn {
        match self {
            Self::Begin { commit_scn, .. }
            | Self::Commit { commit_scn, .. } => *commit_scn,
            Self::Row(row) => row.commit_scn,
        }
    }
}

/// The sink interface the core emits into.
pub trait Builder: Send {
    /// Hand one event to the sink. May block for backpressure.
    fn emit(&mut self, event: BuilderEvent) -> Result<()>;

    /// Allocate the next monotone output index.
    fn bump_idx(&mut self) -> u64;

    /// The last allocated output index.
    fn lwn_idx(&self) -> u64;
}

/// In-memory capture, used by tests and the shutdown drain.
#[derive(Debug, Default)]
pub struct MemoryBuilder {
    pub events: Vec<BuilderEvent>,
    idx: u64,
}

impl MemoryBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The captured row events only.
    #[must_use]
    pub fn rows(&self) -> Vec<&RowEvent> {
        self.events
            .iter()
            .filter_map(|e| match e {
                BuilderEvent::Row(row) => Some(row.as_ref()),
                _ => None,
            })
            .collect()
    }
}

impl Builder for MemoryBuilder {
    fn emit(&mut self, event: BuilderEvent) -> Result<()> {
        self.events.push(event);
        Ok(())
    }

    fn bump_idx(&mut self) -> u64 {
        self.idx += 1;
        self.idx
    }

    fn lwn_idx(&self) -> u64 {
        self.idx
    }
}

/// Bounded queue handed to writer threads.
pub struct QueueBuilder {
    sender: Sender<BuilderEvent>,
    idx: u64,
}

impl QueueBuilder {
    /// Create the queue; the receiver side goes to a writer thread.
    #[must_use]
    pub fn new(capacity: usize) -> (Self, Receiver<BuilderEvent>) {
        let (sender, receiver) = bounded(capacity);
        (Self { sender, idx: 0 }, receiver)
    }
}

impl Builder for QueueBuilder {
    fn emit(&mut self, event: BuilderEvent) -> Result<()> {
        self.sender
            .send(event)
            .map_err(|_| RedowireError::internal("builder queue closed"))
    }

    fn bump_idx(&mut self) -> u64 {
        self.idx += 1;
        self.idx
    }

    fn lwn_idx(&self) -> u64 {
        self.idx
    }
}

/// Output-side counters, shared across the parser thread and the
/// orchestrator.
#[derive(Debug, Default)]
pub struct Metrics {
    transactions_commit_out: AtomicU64,
    transactions_rollback_out: AtomicU64,
}

/// Point-in-time view of [`Metrics`] plus the observability gauges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct MetricsSnapshot {
    pub transactions_commit_out: u64,
    pub transactions_rollback_out: u64,
    pub committed_pending: usize,
    pub arena_high_water_chunks: usize,
}

impl Metrics {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn commit_out(&self) {
        self.transactions_commit_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rollback_out(&self) {
        self.transactions_rollback_out.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self, committed_pending: usize, arena_high_water_chunks: usize) -> MetricsSnapshot {
        MetricsSnapshot {
            transactions_commit_out: self.transactions_commit_out.load(Ordering::Relaxed),
            transactions_rollback_out: self.transactions_rollback_out.load(Ordering::Relaxed),
            committed_pending,
            arena_high_water_chunks,
        }
    }
}

/// Shared writer feedback: the highest commit SCN durably written.
///
/// The replicator compares this against its own progress to warn when a
/// writer lags far behind.
#[derive(Debug, Default)]
pub struct ConfirmedScn(AtomicU64);

impl ConfirmedScn {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn confirm(&self, scn: Scn) {
        if !scn.is_none() {
            self.0.fetch_max(scn.get(), Ordering::SeqCst);
        }
    }

    #[must_use]
    pub fn get(&self) -> Scn {
        match self.0.load(Ordering::SeqCst) {
            0 => Scn::NONE,
            v => Scn::new(v),
        }
    }
}
