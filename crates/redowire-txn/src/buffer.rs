//! The XID → transaction table and the deferred-commit queue.

use std::collections::HashMap;

use redowire_error::Result;
use redowire_types::{RedoThread, RowChange, Scn, Xid};
use tracing::warn;

use crate::arena::{Arena, MemoryLimits};
use crate::transaction::Transaction;

/// A committed transaction parked until the SCN watermark permits its
/// emission (RAC deferred mode).
#[derive(Debug)]
pub struct CommittedTransaction {
    pub xid: Xid,
    pub commit_scn: Scn,
    pub lwn_scn: Scn,
    pub thread: RedoThread,
    pub rollback: bool,
    pub shutdown_marker: bool,
    pub txn: Transaction,
}

/// Arena-backed transaction table.
///
/// A transaction is present in the map iff it is neither committed nor
/// rolled back. Commit moves it out: either straight to the builder
/// (single-thread mode) or onto the pending queue (RAC deferred mode).
#[derive(Debug)]
pub struct TransactionBuffer {
    arena: Arena,
    map: HashMap<Xid, Transaction>,
    /// RAC mode: committed transactions wait for the watermark.
    pub defer_committed: bool,
    pending: Vec<CommittedTransaction>,
}

impl TransactionBuffer {
    #[must_use]
    pub fn new(limits: MemoryLimits) -> Self {
        Self {
            arena: Arena::new(limits),
            map: HashMap::new(),
            defer_committed: false,
            pending: Vec::new(),
        }
    }

    /// Look up or open the transaction for `xid`.
    pub fn get_or_create(&mut self, xid: Xid, thread: RedoThread, scn: Scn) -> &mut Transaction {
        self.map
            .entry(xid)
            .or_insert_with(|| Transaction::new(xid, thread, scn))
    }

    /// Whether `xid` is live.
    #[must_use]
    pub fn contains(&self, xid: Xid) -> bool {
        self.map.contains_key(&xid)
    }

    /// Append a row change to its transaction, opening it on first sight.
    pub fn append_change(
        &mut self,
        thread: RedoThread,
        change: &RowChange,
    ) -> Result<()> {
        let Self { arena, map, .. } = self;
        let txn = map
            .entry(change.xid)
            .or_insert_with(|| Transaction::new(change.xid, thread, change.scn));
        txn.append_change(arena, change)
    }

    /// Record a begin for `xid`.
    pub fn begin(&mut self, xid: Xid, thread: RedoThread, scn: Scn) {
        let txn = self.get_or_create(xid, thread, scn);
        txn.begin_seen = true;
        if txn.first_scn.is_none() {
            txn.first_scn = scn;
        }
    }

    /// Mark a savepoint on `xid` (opens the transaction if needed).
    pub fn mark_savepoint(&mut self, xid: Xid, thread: RedoThread, scn: Scn, id: u32) {
        self.get_or_create(xid, thread, scn).mark_savepoint(id);
    }

    /// Roll `xid` back to savepoint `id`. Unmatched marks warn and leave
    /// the transaction untouched.
    pub fn rollback_to_savepoint(&mut self, xid: Xid, id: u32) {
        let Self { arena, map, .. } = self;
        match map.get_mut(&xid) {
            Some(txn) => {
                if !txn.rollback_to_savepoint(arena, id) {
                    warn!(%xid, savepoint = id, "rollback to unknown savepoint, discarding");
                }
            }
            None => warn!(%xid, savepoint = id, "savepoint rollback for unknown transaction"),
        }
    }

    /// Close `xid` with a commit or rollback record. The transaction
    /// leaves the live map; the caller decides between immediate flush
    /// and deferral (consulting [`TransactionBuffer::defer_committed`]).
    pub fn end(
        &mut self,
        xid: Xid,
        commit_scn: Scn,
        lwn_scn: Scn,
        rollback: bool,
        shutdown_marker: bool,
    ) -> Option<CommittedTransaction> {
        let mut txn = self.map.remove(&xid)?;
        txn.commit_scn = commit_scn;
        txn.rollback = rollback;
        txn.shutdown_marker = shutdown_marker;
        Some(CommittedTransaction {
            xid,
            commit_scn,
            lwn_scn,
            thread: txn.thread,
            rollback,
            shutdown_marker,
            txn,
        })
    }

    /// Park a committed transaction on the pending queue (deferred mode).
    pub fn add_committed_pending(&mut self, ct: CommittedTransaction) {
        self.pending.push(ct);
    }

    /// Observable pending depth, used by the RAC throttle.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Remove and return all pending transactions with
    /// `commit_scn <= watermark`, sorted by `(commit_scn, thread, xid)`.
    pub fn drain_pending_below(&mut self, watermark: Scn) -> Vec<CommittedTransaction> {
        if watermark.is_none() {
            return Vec::new();
        }
        let mut drained = Vec::new();
        let mut kept = Vec::with_capacity(self.pending.len());
        for ct in self.pending.drain(..) {
            if ct.commit_scn <= watermark {
                drained.push(ct);
            } else {
                kept.push(ct);
            }
        }
        self.pending = kept;
        drained.sort_by_key(|ct| (ct.commit_scn, ct.thread, ct.xid));
        drained
    }

    /// Release a finished transaction's chunks back to the arena.
    pub fn purge(&mut self, mut ct: CommittedTransaction) {
        ct.txn.purge(&mut self.arena);
    }

    /// Drop everything: live transactions and pending queue. Used on
    /// shutdown after the final drain.
    pub fn purge_all(&mut self) {
        let Self {
            arena,
            map,
            pending,
            ..
        } = self;
        for (_, txn) in map.iter_mut() {
            txn.purge(arena);
        }
        map.clear();
        for ct in pending.iter_mut() {
            ct.txn.purge(arena);
        }
        pending.clear();
    }

    /// Number of live (uncommitted) transactions.
    #[must_use]
    pub fn live_len(&self) -> usize {
        self.map.len()
    }

    /// Iterate the live transactions (diagnostics and shutdown reporting).
    pub fn iter_live(&self) -> impl Iterator<Item = &Transaction> {
        self.map.values()
    }

    #[must_use]
    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    /// Decode a parked transaction's changes (flush path).
    pub fn decode_changes(&self, ct: &CommittedTransaction) -> Vec<Result<RowChange>> {
        ct.txn.changes(&self.arena).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redowire_types::{ColumnImage, RowLocator, RowOpKind};

    fn limits() -> MemoryLimits {
        MemoryLimits {
            min_mb: 1,
            max_mb: 4,
        }
    }

    fn xid(n: u32) -> Xid {
        Xid::new(1, 0, n)
    }

    fn change(x: Xid, scn: u64) -> RowChange {
        RowChange {
            kind: RowOpKind::Insert,
            locator: RowLocator {
                obj: 9,
                block: 2,
                slot: 0,
            },
            scn: Scn::new(scn),
            xid: x,
            indexed_change: false,
            before: Vec::new(),
            after: vec![ColumnImage::new(0, Some(b"v".to_vec()))],
        }
    }

    #[test]
    fn transactions_open_on_first_change() {
        let mut buf = TransactionBuffer::new(limits());
        buf.append_change(RedoThread::ONE, &change(xid(1), 100)).unwrap();
        assert!(buf.contains(xid(1)));
        assert_eq!(buf.live_len(), 1);
    }

    #[test]
    fn end_removes_from_live_map() {
        let mut buf = TransactionBuffer::new(limits());
        buf.begin(xid(1), RedoThread::ONE, Scn::new(100));
        buf.append_change(RedoThread::ONE, &change(xid(1), 101)).unwrap();
        let ct = buf.end(xid(1), Scn::new(110), Scn::new(110), false, false).unwrap();
        assert!(!buf.contains(xid(1)));
        assert_eq!(ct.commit_scn, Scn::new(110));
        assert_eq!(ct.txn.change_count(), 1);
        buf.purge(ct);
        assert_eq!(buf.arena().in_use(), 0);
    }

    #[test]
    fn end_of_unknown_xid_is_none() {
        let mut buf = TransactionBuffer::new(limits());
        assert!(buf.end(xid(7), Scn::new(1), Scn::new(1), false, false).is_none());
    }

    #[test]
    fn drain_respects_watermark_and_orders() {
        let mut buf = TransactionBuffer::new(limits());
        let two = RedoThread::new(2).unwrap();
        for (x, thread, commit) in [
            (xid(1), RedoThread::ONE, 110),
            (xid(2), two, 115),
            (xid(3), RedoThread::ONE, 115),
            (xid(4), two, 200),
        ] {
            buf.begin(x, thread, Scn::new(commit - 10));
            let ct = buf.end(x, Scn::new(commit), Scn::new(commit), false, false).unwrap();
            buf.add_committed_pending(ct);
        }
        assert_eq!(buf.pending_len(), 4);

        let drained = buf.drain_pending_below(Scn::new(115));
        let order: Vec<_> = drained.iter().map(|ct| (ct.commit_scn.get(), ct.thread.get())).collect();
        // 110 first; equal commit SCNs tie-break by thread number.
        assert_eq!(order, vec![(110, 1), (115, 1), (115, 2)]);
        assert_eq!(buf.pending_len(), 1);
        for ct in drained {
            buf.purge(ct);
        }
    }

    #[test]
    fn drain_with_unknown_watermark_is_empty() {
        let mut buf = TransactionBuffer::new(limits());
        buf.begin(xid(1), RedoThread::ONE, Scn::new(1));
        let ct = buf.end(xid(1), Scn::new(5), Scn::new(5), false, false).unwrap();
        buf.add_committed_pending(ct);
        assert!(buf.drain_pending_below(Scn::NONE).is_empty());
        assert_eq!(buf.pending_len(), 1);
    }

    #[test]
    fn savepoint_rollback_through_buffer() {
        let mut buf = TransactionBuffer::new(limits());
        buf.append_change(RedoThread::ONE, &change(xid(1), 100)).unwrap();
        buf.mark_savepoint(xid(1), RedoThread::ONE, Scn::new(100), 1);
        buf.append_change(RedoThread::ONE, &change(xid(1), 101)).unwrap();
        buf.rollback_to_savepoint(xid(1), 1);
        let ct = buf.end(xid(1), Scn::new(110), Scn::new(110), false, false).unwrap();
        assert_eq!(ct.txn.change_count(), 1);
        buf.purge(ct);
    }

    #[test]
    fn purge_all_releases_everything() {
        let mut buf = TransactionBuffer::new(limits());
        buf.begin(xid(1), RedoThread::ONE, Scn::new(1));
        buf.append_change(RedoThread::ONE, &change(xid(1), 2)).unwrap();
        buf.begin(xid(2), RedoThread::ONE, Scn::new(3));
        buf.append_change(RedoThread::ONE, &change(xid(2), 4)).unwrap();
        let ct = buf.end(xid(2), Scn::new(5), Scn::new(5), false, false).unwrap();
        buf.add_committed_pending(ct);

        buf.purge_all();
        assert_eq!(buf.live_len(), 0);
        assert_eq!(buf.pending_len(), 0);
        assert_eq!(buf.arena().in_use(), 0);
    }
}
