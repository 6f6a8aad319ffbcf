//! One in-flight transaction and its arena-backed change log.

use redowire_error::{RedowireError, Result};
use redowire_types::{RedoThread, RowChange, Scn, Xid};
use tracing::warn;

use crate::arena::{Arena, ChunkId, CHUNK_SIZE};
use crate::codec;

/// Location of one encoded change inside the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeSlot {
    pub chunk: ChunkId,
    pub offset: u32,
    pub len: u32,
}

/// A transaction being reassembled from redo.
///
/// Lifecycle: opened on the first change vector carrying its XID, grows
/// while redo arrives, then either commits (flushed to the builder and
/// purged) or rolls back (purged). Savepoints allow truncating the tail
/// of the change log.
#[derive(Debug)]
pub struct Transaction {
    pub xid: Xid,
    pub thread: RedoThread,
    pub first_scn: Scn,
    pub commit_scn: Scn,
    pub begin_seen: bool,
    pub rollback: bool,
    pub shutdown_marker: bool,
    chunks: Vec<ChunkId>,
    /// Write position within the last chunk.
    write_pos: usize,
    changes: Vec<ChangeSlot>,
    /// `(savepoint id, change count at the mark)`, in mark order.
    savepoints: Vec<(u32, usize)>,
}

impl Transaction {
    pub(crate) fn new(xid: Xid, thread: RedoThread, first_scn: Scn) -> Self {
        Self {
            xid,
            thread,
            first_scn,
            commit_scn: Scn::NONE,
            begin_seen: false,
            rollback: false,
            shutdown_marker: false,
            chunks: Vec::new(),
            write_pos: 0,
            changes: Vec::new(),
            savepoints: Vec::new(),
        }
    }

    /// Append one row change, bump-allocating within the transaction's
    /// current chunk and taking a new chunk from the arena when full.
    pub fn append_change(&mut self, arena: &mut Arena, change: &RowChange) -> Result<()> {
        let len = codec::encoded_len(change);
        if len > CHUNK_SIZE {
            return Err(RedowireError::internal(format!(
                "row change of {len} bytes exceeds the arena chunk size"
            )));
        }
        let needs_chunk = self.chunks.is_empty() || self.write_pos + len > CHUNK_SIZE;
        if needs_chunk {
            let id = arena.alloc()?;
            self.chunks.push(id);
            self.write_pos = 0;
        }
        let chunk = *self.chunks.last().expect("chunk allocated above");

        let mut encoded = Vec::with_capacity(len);
        codec::encode_change(change, &mut encoded)?;
        debug_assert_eq!(encoded.len(), len);
        arena.bytes_mut(chunk)[self.write_pos..self.write_pos + len].copy_from_slice(&encoded);

        self.changes.push(ChangeSlot {
            chunk,
            offset: self.write_pos as u32,
            len: len as u32,
        });
        self.write_pos += len;
        Ok(())
    }

    /// Record a savepoint at the current change position.
    pub fn mark_savepoint(&mut self, id: u32) {
        self.savepoints.push((id, self.changes.len()));
    }

    /// Truncate the change log back to savepoint `id`. Returns false (and
    /// changes nothing) when the id was never marked — the caller warns
    /// and discards per the unmatched-tail rule.
    pub fn rollback_to_savepoint(&mut self, arena: &mut Arena, id: u32) -> bool {
        let Some(pos) = self.savepoints.iter().rposition(|&(sid, _)| sid == id) else {
            return false;
        };
        let (_, keep) = self.savepoints[pos];
        // The savepoint itself survives a rollback to it.
        self.savepoints.truncate(pos + 1);
        self.truncate_changes(arena, keep);
        true
    }

    fn truncate_changes(&mut self, arena: &mut Arena, keep: usize) {
        if keep >= self.changes.len() {
            return;
        }
        self.changes.truncate(keep);
        let keep_chunks = match self.changes.last() {
            None => 0,
            Some(slot) => {
                let idx = self
                    .chunks
                    .iter()
                    .position(|&c| c == slot.chunk)
                    .expect("slot chunk is owned by this transaction");
                self.write_pos = (slot.offset + slot.len) as usize;
                idx + 1
            }
        };
        for &id in &self.chunks[keep_chunks..] {
            arena.release(id);
        }
        self.chunks.truncate(keep_chunks);
        if keep_chunks == 0 {
            self.write_pos = 0;
        }
    }

    /// Number of appended changes.
    #[must_use]
    pub fn change_count(&self) -> usize {
        self.changes.len()
    }

    /// Arena chunks held by this transaction.
    #[must_use]
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Decode the change log in append order.
    pub fn changes<'a>(
        &'a self,
        arena: &'a Arena,
    ) -> impl Iterator<Item = Result<RowChange>> + 'a {
        self.changes.iter().map(move |slot| {
            let bytes = &arena.bytes(slot.chunk)
                [slot.offset as usize..(slot.offset + slot.len) as usize];
            codec::decode_change(bytes)
        })
    }

    /// Return all chunks to the arena. The transaction is unusable after.
    pub fn purge(&mut self, arena: &mut Arena) {
        if !self.begin_seen && !self.changes.is_empty() && !self.rollback {
            warn!(xid = %self.xid, changes = self.changes.len(),
                  "purging partial transaction without a begin record");
        }
        for &id in &self.chunks {
            arena.release(id);
        }
        self.chunks.clear();
        self.changes.clear();
        self.savepoints.clear();
        self.write_pos = 0;
    }
}
