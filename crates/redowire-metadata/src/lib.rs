//! Replication metadata: per-thread positions, resetlogs/incarnation
//! lineage, the schema snapshot and checkpoint persistence.
//!
//! All mutation goes through one mutex (the checkpoint mutex of the
//! design): the parser thread is the only steady-state writer, the
//! checkpoint path and writer threads read under the same lock.

pub mod checkpoint;
pub mod schema;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use redowire_error::{RedowireError, Result};
use redowire_types::value::DbTimezone;
use redowire_types::{DbIncarnation, DisableChecks, FileOffset, RedoThread, Scn, Seq};
use tracing::{info, warn};

use checkpoint::{CheckpointDoc, ThreadCheckpoint};
use schema::SchemaSnapshot;

/// Database-level parameters the engine is bootstrapped with.
#[derive(Debug, Clone)]
pub struct DbParams {
    pub database: String,
    /// `log_archive_format` template (`%t`/`%s`/`%r`/... wildcards).
    pub log_archive_format: String,
    /// Root of the archived-redo destination (`db_recovery_file_dest`).
    pub db_recovery_file_dest: String,
    /// Context directory name under the recovery destination.
    pub context: String,
    /// `DB_BLOCK_CHECKSUM` setting as reported by the database.
    pub db_block_checksum: String,
    pub db_timezone: DbTimezone,
    pub disable_checks: DisableChecks,
}

impl Default for DbParams {
    fn default() -> Self {
        Self {
            database: "DB".to_owned(),
            log_archive_format: "o1_mf_%t_%s_%h_.arc".to_owned(),
            db_recovery_file_dest: String::new(),
            context: String::new(),
            db_block_checksum: "TYPICAL".to_owned(),
            db_timezone: DbTimezone::UTC,
            disable_checks: DisableChecks::default(),
        }
    }
}

impl DbParams {
    /// Whether readers should recompute block checksums.
    #[must_use]
    pub fn verify_block_checksums(&self) -> bool {
        let enabled = !matches!(self.db_block_checksum.as_str(), "OFF" | "FALSE");
        enabled && !self.disable_checks.is_set(DisableChecks::BLOCK_CHECKSUM)
    }

    /// Whether uninterpreted opcodes raise instead of being skipped.
    #[must_use]
    pub fn strict_opcodes(&self) -> bool {
        !self.disable_checks.is_set(DisableChecks::STRICT_OPCODES)
    }
}

/// Requested starting position from the config.
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub scn: Option<u64>,
    pub seq: Option<u32>,
    pub time: Option<String>,
}

/// Per-thread replication position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadState {
    pub sequence: Seq,
    pub file_offset: FileOffset,
    pub first_scn: Scn,
    pub next_scn: Scn,
    pub last_lwn_scn: Scn,
}

impl Default for ThreadState {
    fn default() -> Self {
        Self {
            sequence: Seq::NONE,
            file_offset: FileOffset::ZERO,
            first_scn: Scn::NONE,
            next_scn: Scn::NONE,
            last_lwn_scn: Scn::NONE,
        }
    }
}

#[derive(Debug)]
struct Inner {
    resetlogs: u32,
    activation: u32,
    /// Shared slots for the currently parsing thread (the RAC context swap
    /// copies a thread's state in and out of these).
    sequence: Seq,
    file_offset: FileOffset,
    thread_states: BTreeMap<RedoThread, ThreadState>,
    incarnations: Vec<DbIncarnation>,
    schema: Arc<SchemaSnapshot>,
    first_data_scn: Scn,
    first_schema_scn: Scn,
    checkpoints_allowed: bool,
    /// High-water of emitted `(lwn_scn, builder index)` for `is_new_data`.
    emitted_mark: (Scn, u64),
}

/// Shared replication metadata.
#[derive(Debug)]
pub struct Metadata {
    pub params: DbParams,
    pub start: StartOptions,
    pub state_path: PathBuf,
    pub checkpoints_keep: usize,
    inner: Mutex<Inner>,
}

impl Metadata {
    #[must_use]
    pub fn new(
        params: DbParams,
        start: StartOptions,
        state_path: PathBuf,
        checkpoints_keep: usize,
    ) -> Self {
        Self {
            params,
            start,
            state_path,
            checkpoints_keep,
            inner: Mutex::new(Inner {
                resetlogs: 0,
                activation: 0,
                sequence: Seq::NONE,
                file_offset: FileOffset::ZERO,
                thread_states: BTreeMap::new(),
                incarnations: Vec::new(),
                schema: Arc::new(SchemaSnapshot::default()),
                first_data_scn: Scn::NONE,
                first_schema_scn: Scn::NONE,
                checkpoints_allowed: false,
                emitted_mark: (Scn::ZERO, 0),
            }),
        }
    }

    // --- identity / lineage -------------------------------------------------

    #[must_use]
    pub fn resetlogs(&self) -> u32 {
        self.inner.lock().resetlogs
    }

    /// Switch to a new resetlogs: every thread restarts from sequence 0.
    pub fn set_resetlogs(&self, resetlogs: u32) {
        let mut inner = self.inner.lock();
        info!(resetlogs, "new resetlogs accepted");
        inner.resetlogs = resetlogs;
        inner.sequence = Seq::ZERO;
        inner.file_offset = FileOffset::ZERO;
        for state in inner.thread_states.values_mut() {
            state.sequence = Seq::ZERO;
            state.file_offset = FileOffset::ZERO;
        }
    }

    pub fn set_activation(&self, activation: u32) {
        self.inner.lock().activation = activation;
    }

    #[must_use]
    pub fn activation(&self) -> u32 {
        self.inner.lock().activation
    }

    pub fn set_incarnations(&self, incarnations: Vec<DbIncarnation>) {
        self.inner.lock().incarnations = incarnations;
    }

    #[must_use]
    pub fn incarnations(&self) -> Vec<DbIncarnation> {
        self.inner.lock().incarnations.clone()
    }

    /// Walk the incarnation list: select the current one by resetlogs id
    /// and detect a resetlogs switch (`resetlogs_scn == next_scn` of some
    /// thread with the prior incarnation being the current one).
    pub fn update_resetlogs(&self) -> Result<()> {
        let (resetlogs, incarnations, next_scns) = {
            let inner = self.inner.lock();
            (
                inner.resetlogs,
                inner.incarnations.clone(),
                inner
                    .thread_states
                    .values()
                    .map(|s| s.next_scn)
                    .collect::<Vec<_>>(),
            )
        };
        if incarnations.is_empty() {
            return Ok(());
        }
        let current = incarnations
            .iter()
            .find(|i| i.resetlogs == resetlogs)
            .ok_or(RedowireError::UnknownResetlogs { resetlogs })?;

        for candidate in &incarnations {
            if candidate.prior_incarnation == current.incarnation
                && !candidate.resetlogs_scn.is_none()
                && next_scns.iter().any(|&n| n == candidate.resetlogs_scn)
            {
                self.set_resetlogs(candidate.resetlogs);
                return Ok(());
            }
        }
        Ok(())
    }

    // --- per-thread positions ----------------------------------------------

    #[must_use]
    pub fn sequence(&self, thread: RedoThread) -> Seq {
        self.inner
            .lock()
            .thread_states
            .get(&thread)
            .map_or(Seq::NONE, |s| s.sequence)
    }

    #[must_use]
    pub fn file_offset(&self, thread: RedoThread) -> FileOffset {
        self.inner
            .lock()
            .thread_states
            .get(&thread)
            .map_or(FileOffset::ZERO, |s| s.file_offset)
    }

    pub fn set_seq_file_offset(&self, thread: RedoThread, seq: Seq, offset: FileOffset) {
        let mut inner = self.inner.lock();
        let state = inner.thread_states.entry(thread).or_default();
        state.sequence = seq;
        state.file_offset = offset;
    }

    /// Advance a thread past a finished log: next sequence, offset zero.
    pub fn set_next_sequence(&self, thread: RedoThread) {
        let mut inner = self.inner.lock();
        let state = inner.thread_states.entry(thread).or_default();
        if !state.sequence.is_none() {
            state.sequence = state.sequence.next();
        }
        state.file_offset = FileOffset::ZERO;
    }

    pub fn set_first_next_scn(&self, thread: RedoThread, first: Scn, next: Scn) {
        let mut inner = self.inner.lock();
        let state = inner.thread_states.entry(thread).or_default();
        state.first_scn = first;
        state.next_scn = next;
    }

    #[must_use]
    pub fn last_lwn_scn(&self, thread: RedoThread) -> Scn {
        self.inner
            .lock()
            .thread_states
            .get(&thread)
            .map_or(Scn::NONE, |s| s.last_lwn_scn)
    }

    /// Monotone per invariant: a lower value than the current one is a
    /// programming error upstream and is ignored with a warning.
    pub fn set_last_lwn_scn(&self, thread: RedoThread, scn: Scn) {
        let mut inner = self.inner.lock();
        let state = inner.thread_states.entry(thread).or_default();
        if !state.last_lwn_scn.is_none() && !scn.is_none() && scn < state.last_lwn_scn {
            warn!(%thread, current = %state.last_lwn_scn, proposed = %scn,
                  "ignoring non-monotone lastLwnScn");
            return;
        }
        state.last_lwn_scn = scn;
    }

    #[must_use]
    pub fn thread_state(&self, thread: RedoThread) -> ThreadState {
        self.inner
            .lock()
            .thread_states
            .get(&thread)
            .copied()
            .unwrap_or_default()
    }

    #[must_use]
    pub fn threads(&self) -> Vec<RedoThread> {
        self.inner.lock().thread_states.keys().copied().collect()
    }

    // --- shared parser slots (RAC context swap) ----------------------------

    #[must_use]
    pub fn current_position(&self) -> (Seq, FileOffset) {
        let inner = self.inner.lock();
        (inner.sequence, inner.file_offset)
    }

    pub fn set_current_position(&self, seq: Seq, offset: FileOffset) {
        let mut inner = self.inner.lock();
        inner.sequence = seq;
        inner.file_offset = offset;
    }

    /// Copy a thread's saved position into the shared slots (context in).
    pub fn swap_in_thread(&self, thread: RedoThread) {
        let mut inner = self.inner.lock();
        let state = inner.thread_states.entry(thread).or_default();
        let (seq, offset) = (state.sequence, state.file_offset);
        inner.sequence = seq;
        inner.file_offset = offset;
    }

    /// Copy the shared slots back into the thread's saved position
    /// (context out).
    pub fn swap_out_thread(&self, thread: RedoThread) {
        let mut inner = self.inner.lock();
        let (seq, offset) = (inner.sequence, inner.file_offset);
        let state = inner.thread_states.entry(thread).or_default();
        state.sequence = seq;
        state.file_offset = offset;
    }

    // --- schema ------------------------------------------------------------

    #[must_use]
    pub fn schema(&self) -> Arc<SchemaSnapshot> {
        Arc::clone(&self.inner.lock().schema)
    }

    pub fn set_schema(&self, schema: Arc<SchemaSnapshot>) {
        self.inner.lock().schema = schema;
    }

    /// DDL invalidation: atomically republish the snapshot without the
    /// named object, if it was tracked.
    pub fn invalidate_object(&self, owner: &str, name: &str) {
        let mut inner = self.inner.lock();
        if let Some(updated) = inner.schema.without_object(owner, name) {
            inner.schema = updated;
        }
    }

    // --- boot / checkpoint gating ------------------------------------------

    #[must_use]
    pub fn first_data_scn(&self) -> Scn {
        self.inner.lock().first_data_scn
    }

    pub fn set_first_data_scn(&self, scn: Scn) {
        self.inner.lock().first_data_scn = scn;
    }

    #[must_use]
    pub fn first_schema_scn(&self) -> Scn {
        self.inner.lock().first_schema_scn
    }

    pub fn set_first_schema_scn(&self, scn: Scn) {
        self.inner.lock().first_schema_scn = scn;
    }

    /// Allow checkpoint emission (blocked until boot resolves the first
    /// data SCN).
    pub fn allow_checkpoints(&self) {
        info!("checkpoints enabled");
        self.inner.lock().checkpoints_allowed = true;
    }

    #[must_use]
    pub fn checkpoints_allowed(&self) -> bool {
        self.inner.lock().checkpoints_allowed
    }

    /// Monotone new-data predicate: true once per `(scn, idx)` advance,
    /// and never for data at or below the resume point.
    pub fn is_new_data(&self, scn: Scn, idx: u64) -> bool {
        let mut inner = self.inner.lock();
        if scn.is_none() {
            return false;
        }
        if !inner.first_data_scn.is_none() && scn < inner.first_data_scn {
            return false;
        }
        if (scn, idx) <= inner.emitted_mark {
            return false;
        }
        inner.emitted_mark = (scn, idx);
        true
    }

    // --- checkpoint persistence --------------------------------------------

    /// Write a checkpoint for the given watermark SCN, then prune old
    /// documents. No-op until [`Metadata::allow_checkpoints`].
    pub fn write_checkpoint(&self, scn: Scn) -> Result<Option<PathBuf>> {
        let doc = {
            let inner = self.inner.lock();
            if !inner.checkpoints_allowed || scn.is_none() {
                return Ok(None);
            }
            CheckpointDoc {
                database: self.params.database.clone(),
                scn,
                resetlogs: inner.resetlogs,
                activation: inner.activation,
                threads: inner
                    .thread_states
                    .iter()
                    .map(|(&thread, state)| ThreadCheckpoint {
                        thread,
                        seq: state.sequence,
                        offset: state.file_offset.as_bytes(),
                        lwn_scn: state.last_lwn_scn,
                        first_scn: state.first_scn,
                        next_scn: state.next_scn,
                    })
                    .collect(),
                seq: None,
                offset: None,
            }
        };
        let path = doc.write(&self.state_path)?;
        checkpoint::retain_newest(&self.state_path, &self.params.database, self.checkpoints_keep)?;
        Ok(Some(path))
    }

    /// Apply a loaded checkpoint document to the in-memory state.
    pub fn apply_checkpoint(&self, doc: &CheckpointDoc) {
        let mut inner = self.inner.lock();
        inner.resetlogs = doc.resetlogs;
        inner.activation = doc.activation;
        inner.first_data_scn = doc.scn;
        for position in doc.thread_positions() {
            inner.thread_states.insert(
                position.thread,
                ThreadState {
                    sequence: position.seq,
                    file_offset: FileOffset::from_bytes(position.offset),
                    first_scn: position.first_scn,
                    next_scn: position.next_scn,
                    last_lwn_scn: position.lwn_scn,
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata() -> Metadata {
        Metadata::new(
            DbParams {
                database: "TEST".to_owned(),
                ..DbParams::default()
            },
            StartOptions::default(),
            PathBuf::from("/tmp"),
            3,
        )
    }

    fn t(n: u16) -> RedoThread {
        RedoThread::new(n).unwrap()
    }

    #[test]
    fn thread_positions_default_to_none() {
        let md = metadata();
        assert!(md.sequence(t(1)).is_none());
        assert_eq!(md.file_offset(t(1)), FileOffset::ZERO);
    }

    #[test]
    fn next_sequence_resets_offset() {
        let md = metadata();
        md.set_seq_file_offset(t(1), Seq::new(5), FileOffset::from_bytes(2048));
        md.set_next_sequence(t(1));
        assert_eq!(md.sequence(t(1)), Seq::new(6));
        assert_eq!(md.file_offset(t(1)), FileOffset::ZERO);
    }

    #[test]
    fn lwn_scn_is_monotone() {
        let md = metadata();
        md.set_last_lwn_scn(t(1), Scn::new(100));
        md.set_last_lwn_scn(t(1), Scn::new(90));
        assert_eq!(md.last_lwn_scn(t(1)), Scn::new(100));
        md.set_last_lwn_scn(t(1), Scn::new(150));
        assert_eq!(md.last_lwn_scn(t(1)), Scn::new(150));
    }

    #[test]
    fn context_swap_round_trips() {
        let md = metadata();
        md.set_seq_file_offset(t(2), Seq::new(9), FileOffset::from_bytes(512));
        md.swap_in_thread(t(2));
        assert_eq!(md.current_position(), (Seq::new(9), FileOffset::from_bytes(512)));
        md.set_current_position(Seq::new(9), FileOffset::from_bytes(1024));
        md.swap_out_thread(t(2));
        assert_eq!(md.file_offset(t(2)), FileOffset::from_bytes(1024));
    }

    #[test]
    fn resetlogs_switch_resets_threads() {
        let md = metadata();
        md.set_seq_file_offset(t(1), Seq::new(5), FileOffset::from_bytes(512));
        md.set_seq_file_offset(t(2), Seq::new(7), FileOffset::from_bytes(1024));
        md.set_resetlogs(1234);
        assert_eq!(md.resetlogs(), 1234);
        assert_eq!(md.sequence(t(1)), Seq::ZERO);
        assert_eq!(md.sequence(t(2)), Seq::ZERO);
        assert_eq!(md.file_offset(t(2)), FileOffset::ZERO);
    }

    #[test]
    fn update_resetlogs_detects_switch() {
        let md = metadata();
        md.set_resetlogs(100);
        md.set_seq_file_offset(t(1), Seq::new(4), FileOffset::ZERO);
        md.set_first_next_scn(t(1), Scn::new(500), Scn::new(900));
        md.set_incarnations(vec![
            DbIncarnation {
                incarnation: 1,
                resetlogs: 100,
                resetlogs_scn: Scn::new(1),
                prior_incarnation: 0,
                current: false,
            },
            DbIncarnation {
                incarnation: 2,
                resetlogs: 200,
                resetlogs_scn: Scn::new(900),
                prior_incarnation: 1,
                current: true,
            },
        ]);
        md.update_resetlogs().unwrap();
        assert_eq!(md.resetlogs(), 200);
        assert_eq!(md.sequence(t(1)), Seq::ZERO);
    }

    #[test]
    fn update_resetlogs_unknown_is_error() {
        let md = metadata();
        md.set_resetlogs(42);
        md.set_incarnations(vec![DbIncarnation {
            incarnation: 1,
            resetlogs: 100,
            resetlogs_scn: Scn::new(1),
            prior_incarnation: 0,
            current: true,
        }]);
        assert!(matches!(
            md.update_resetlogs(),
            Err(RedowireError::UnknownResetlogs { resetlogs: 42 })
        ));
    }

    #[test]
    fn is_new_data_is_monotone() {
        let md = metadata();
        md.set_first_data_scn(Scn::new(100));
        assert!(!md.is_new_data(Scn::new(50), 1)); // below resume point
        assert!(md.is_new_data(Scn::new(100), 1));
        assert!(!md.is_new_data(Scn::new(100), 1)); // replay
        assert!(md.is_new_data(Scn::new(100), 2));
        assert!(md.is_new_data(Scn::new(200), 0));
        assert!(!md.is_new_data(Scn::new(150), 5)); // behind the mark
    }

    #[test]
    fn checkpoint_round_trip_through_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let md = Metadata::new(
            DbParams {
                database: "TEST".to_owned(),
                ..DbParams::default()
            },
            StartOptions::default(),
            dir.path().to_path_buf(),
            2,
        );
        md.set_resetlogs(77);
        md.set_seq_file_offset(t(1), Seq::new(5), FileOffset::from_bytes(1536));
        md.set_last_lwn_scn(t(1), Scn::new(400));

        // Gated until allowed.
        assert!(md.write_checkpoint(Scn::new(400)).unwrap().is_none());
        md.allow_checkpoints();
        let path = md.write_checkpoint(Scn::new(400)).unwrap().unwrap();

        let md2 = Metadata::new(
            DbParams::default(),
            StartOptions::default(),
            dir.path().to_path_buf(),
            2,
        );
        let doc = checkpoint::CheckpointDoc::load(&path).unwrap();
        md2.apply_checkpoint(&doc);
        assert_eq!(md2.resetlogs(), 77);
        assert_eq!(md2.sequence(t(1)), Seq::new(5));
        assert_eq!(md2.file_offset(t(1)), FileOffset::from_bytes(1536));
        assert_eq!(md2.last_lwn_scn(t(1)), Scn::new(400));
        assert_eq!(md2.first_data_scn(), Scn::new(400));
    }

    #[test]
    fn block_checksum_policy() {
        let mut params = DbParams::default();
        assert!(params.verify_block_checksums());
        params.db_block_checksum = "OFF".to_owned();
        assert!(!params.verify_block_checksums());
        params.db_block_checksum = "FULL".to_owned();
        params.disable_checks = DisableChecks(DisableChecks::BLOCK_CHECKSUM);
        assert!(!params.verify_block_checksums());
    }
}
