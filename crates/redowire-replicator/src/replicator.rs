//! The replicator: owns readers and parsers, schedules what to parse
//! next, maintains the SCN watermark and releases committed transactions
//! in order.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use redowire_builder::flush::{flush_transaction, FlushOptions};
use redowire_builder::{Builder, Metrics};
use redowire_error::{RedowireError, Result};
use redowire_metadata::{checkpoint, Metadata};
use redowire_redo::parser::{ParseCx, ParseOutcome, Parser};
use redowire_redo::reader::ReaderConfig;
use redowire_redo::Reader;
use redowire_txn::TransactionBuffer;
use redowire_types::{Cx, DisableChecks, FileOffset, RedoLog, RedoThread, Scn, Seq};
use tracing::{debug, error, info, warn};

use crate::archive::{sweep_batch, sweep_recovery_dest, ArchiveCandidate, ArchiveQueues};
use crate::pathmap::PathMapping;

/// Orchestration settings derived from one source's configuration.
#[derive(Debug)]
pub struct ReplicatorConfig {
    pub reader: ReaderConfig,
    /// Never touch online logs.
    pub arch_only: bool,
    /// Batch mode: process the supplied files and stop.
    pub batch_mode: bool,
    pub batch_paths: Vec<PathBuf>,
    pub online_logs: Vec<RedoLog>,
    pub path_mapping: PathMapping,
    /// RAC throttle: deferred transactions above this pin memory.
    pub max_pending_transactions: usize,
    pub flush_options: FlushOptions,
    /// Retry boot-class failures instead of terminating.
    pub boot_failsafe: bool,
    /// Admit the empty schema when no seed is present.
    pub schemaless: bool,
    /// Writer feedback: highest commit SCN durably written downstream.
    pub confirmed_scn: Option<Arc<redowire_builder::ConfirmedScn>>,
}

impl Default for ReplicatorConfig {
    fn default() -> Self {
        Self {
            reader: ReaderConfig::default(),
            arch_only: false,
            batch_mode: false,
            batch_paths: Vec::new(),
            online_logs: Vec::new(),
            path_mapping: PathMapping::default(),
            max_pending_transactions: 500,
            flush_options: FlushOptions::default(),
            boot_failsafe: false,
            schemaless: false,
            confirmed_scn: None,
        }
    }
}

/// One online redo group: its persistent reader plus the parser bound to
/// the group's current file.
struct OnlineSlot {
    reader: Reader,
    parser: Parser,
}

/// Scheduling state for one redo thread on the RAC path.
#[derive(Debug, Default, Clone, Copy)]
struct ThreadRunState {
    slot: Option<usize>,
    last_lwn_scn: Scn,
    next_scn: Scn,
    yielded: bool,
    finished: bool,
}

/// Min over active threads of `last_lwn_scn`; finished threads bound by
/// their file's `next_scn`. A thread that has not completed any LWN yet
/// makes the watermark unknown — no ordering guarantee exists.
fn compute_watermark(states: &BTreeMap<RedoThread, ThreadRunState>) -> Scn {
    let mut min = Scn::NONE;
    for state in states.values() {
        if state.slot.is_none() {
            continue;
        }
        if state.finished {
            let bound = if state.next_scn.is_none() {
                state.last_lwn_scn
            } else {
                state.next_scn
            };
            min = min.min_known(bound);
        } else {
            if state.last_lwn_scn.is_none() {
                return Scn::NONE;
            }
            min = min.min_known(state.last_lwn_scn);
        }
    }
    min
}

/// The orchestrator. Runs on the parser thread; owns every reader.
pub struct Replicator<'a> {
    cx: Arc<Cx>,
    cfg: ReplicatorConfig,
    metadata: Arc<Metadata>,
    txn: TransactionBuffer,
    builder: &'a mut dyn Builder,
    metrics: Arc<Metrics>,
    online: Vec<OnlineSlot>,
    queues: ArchiveQueues,
    watermark: Scn,
    thread_states: BTreeMap<RedoThread, ThreadRunState>,
    last_checked_day: Option<String>,
    batch_swept: bool,
}

impl<'a> Replicator<'a> {
    pub fn new(
        cx: Arc<Cx>,
        cfg: ReplicatorConfig,
        metadata: Arc<Metadata>,
        txn: TransactionBuffer,
        builder: &'a mut dyn Builder,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            cx,
            cfg,
            metadata,
            txn,
            builder,
            metrics,
            online: Vec::new(),
            queues: ArchiveQueues::default(),
            watermark: Scn::NONE,
            thread_states: BTreeMap::new(),
            last_checked_day: None,
            batch_swept: false,
        }
    }

    /// Boot, replicate, drain, release. The single entry point.
    pub fn run(&mut self) -> Result<()> {
        loop {
            match self.boot() {
                Ok(()) => break,
                Err(e) if e.is_boot() && self.cfg.boot_failsafe => {
                    error!(error = %e, "replication startup failed, retrying");
                    self.cx
                        .sleep_us(self.cx.timings.refresh_interval_us);
                    if self.cx.is_soft_shutdown() {
                        return Ok(());
                    }
                }
                Err(e) => return Err(e),
            }
        }

        let mut result = self.main_loop();
        if result.is_ok() {
            self.watermark = Scn::new(u64::MAX);
            result = self.emit_watermarked().and_then(|()| {
                if self.txn.live_len() == 0 {
                    self.metadata.write_checkpoint(self.checkpoint_scn())?;
                }
                Ok(())
            });
        }
        if let Err(e) = &result {
            let positions: Vec<String> = self
                .metadata
                .threads()
                .iter()
                .map(|&t| {
                    let s = self.metadata.thread_state(t);
                    format!(
                        "thread {t}: seq {}, offset {}, lwn-scn {}",
                        s.sequence, s.file_offset, s.last_lwn_scn
                    )
                })
                .collect();
            error!(error = %e, ?positions, "replication stopped on fatal error");
            self.cx.stop_hard();
        }

        self.txn.purge_all();
        self.stop_readers();
        info!("replicator is shutting down");
        result
    }

    fn boot(&mut self) -> Result<()> {
        std::fs::create_dir_all(&self.metadata.state_path)?;
        if let Some(doc) = checkpoint::load_latest(&self.metadata.state_path, &self.metadata.params.database)? {
            self.metadata.apply_checkpoint(&doc);
        } else {
            if let Some(scn) = self.metadata.start.scn {
                self.metadata.set_first_data_scn(Scn::new(scn));
            }
            if let Some(seq) = self.metadata.start.seq {
                self.metadata
                    .set_seq_file_offset(RedoThread::ONE, Seq::new(seq), FileOffset::ZERO);
            }
            if self.metadata.start.time.is_some() {
                warn!("start-time requires a live database to resolve, ignoring in offline mode");
            }
            info!(
                start_scn = ?self.metadata.start.scn,
                start_seq = ?self.metadata.start.seq,
                "no checkpoint found, starting fresh"
            );
        }
        self.metadata.update_resetlogs()?;

        if self.metadata.schema().scn.is_none() {
            if self.cfg.schemaless {
                self.metadata
                    .set_schema(Arc::new(redowire_metadata::schema::SchemaSnapshot::schemaless()));
            } else {
                return Err(RedowireError::SchemaMissing {
                    database: self.metadata.params.database.clone(),
                });
            }
        }
        self.metadata.allow_checkpoints();

        if self.cfg.arch_only
            && self.metadata.params.db_recovery_file_dest.is_empty()
            && self.cfg.batch_paths.is_empty()
        {
            return Err(RedowireError::ArchiveDestMissing);
        }

        if !self.cfg.arch_only && !self.cfg.online_logs.is_empty() {
            self.create_online_slots()?;
        }

        info!(
            database = %self.metadata.params.database,
            resetlogs = self.metadata.resetlogs(),
            first_data_scn = %self.metadata.first_data_scn(),
            mode = if self.cfg.batch_mode { "batch" } else { "continuous" },
            "replication starting"
        );
        Ok(())
    }

    fn main_loop(&mut self) -> Result<()> {
        while !self.cx.is_soft_shutdown() {
            self.metadata.update_resetlogs()?;

            let mut progressed = self.process_archives()?;
            if self.cx.is_soft_shutdown() {
                break;
            }

            if !self.cfg.arch_only && !self.online.is_empty() {
                progressed |= self.process_online()?;
            }
            if self.cx.is_soft_shutdown() {
                break;
            }

            if self.cfg.batch_mode && self.queues.is_empty() {
                info!("batch processing complete");
                break;
            }
            if !progressed {
                info!("no redo logs to process, waiting for new redo logs");
                self.cx.sleep_us(self.cx.timings.refresh_interval_us);
            }
        }
        Ok(())
    }

    // --- archives ----------------------------------------------------------

    fn discover_archives(&mut self) -> Result<()> {
        let metadata = Arc::clone(&self.metadata);
        let expected = |thread: RedoThread| metadata.sequence(thread);

        if !self.batch_swept && !self.cfg.batch_paths.is_empty() {
            let paths: Vec<PathBuf> = self
                .cfg
                .batch_paths
                .iter()
                .map(|p| self.cfg.path_mapping.apply_path(p))
                .collect();
            sweep_batch(
                &paths,
                &self.metadata.params.log_archive_format,
                &expected,
                &mut self.queues,
            )?;
            self.batch_swept = true;
        }

        if !self.metadata.params.db_recovery_file_dest.is_empty() {
            if self.metadata.params.log_archive_format.is_empty() {
                return Err(RedowireError::ArchiveDestMissing);
            }
            let root = self.cfg.path_mapping.apply(&format!(
                "{}/{}/archivelog",
                self.metadata.params.db_recovery_file_dest, self.metadata.params.context
            ));
            self.last_checked_day = sweep_recovery_dest(
                std::path::Path::new(&root),
                &self.metadata.params.log_archive_format,
                self.last_checked_day.as_deref(),
                &expected,
                &mut self.queues,
            )?;
        }
        Ok(())
    }

    fn process_archives(&mut self) -> Result<bool> {
        let mut progressed = false;
        let metadata = Arc::clone(&self.metadata);

        while !self.cx.is_soft_shutdown() {
            self.discover_archives()?;
            self.queues.drop_stale(|t| metadata.sequence(t));

            let Some(thread) = self.queues.pick_next(|t| metadata.sequence(t)) else {
                self.handle_unpickable_heads()?;
                break;
            };
            let candidate = self
                .queues
                .pop(thread)
                .ok_or_else(|| RedowireError::internal("picked thread has an empty queue"))?;

            let expected = metadata.sequence(thread);
            if expected.is_none() || expected == Seq::ZERO {
                // First file seen for this thread: adopt its position.
                metadata.set_seq_file_offset(thread, candidate.sequence, FileOffset::ZERO);
            }

            progressed = true;
            self.parse_archive(&candidate)?;
            if self.cx.is_soft_shutdown() {
                break;
            }
            metadata.set_next_sequence(thread);
            if self.txn.live_len() == 0 {
                metadata.write_checkpoint(self.checkpoint_scn())?;
            }
            if self.cx.tick_log_switch() {
                info!("shutdown started - exhausted number of log switches");
                self.cx.stop_soft();
            }
        }
        Ok(progressed)
    }

    /// Non-empty queues where nothing qualifies mean a sequence gap.
    /// In batch mode (no more files will appear) that is fatal unless
    /// the check is disabled, in which case the gap is skipped.
    fn handle_unpickable_heads(&mut self) -> Result<()> {
        if self.queues.is_empty() {
            return Ok(());
        }
        let gap_tolerated = self
            .metadata
            .params
            .disable_checks
            .is_set(DisableChecks::SEQUENCE_GAP);
        let stuck: Vec<(RedoThread, Seq, Seq)> = self
            .queues
            .heads()
            .iter()
            .filter_map(|head| {
                let expected = self.metadata.sequence(head.thread);
                (!expected.is_none() && expected != Seq::ZERO && head.sequence > expected)
                    .then_some((head.thread, expected, head.sequence))
            })
            .collect();
        for (thread, expected, found) in stuck {
            if gap_tolerated {
                warn!(%thread, %expected, %found, "sequence gap tolerated, skipping ahead");
                self.metadata
                    .set_seq_file_offset(thread, found, FileOffset::ZERO);
            } else if self.cfg.batch_mode {
                return Err(RedowireError::SequenceGap {
                    thread,
                    expected,
                    found,
                });
            } else {
                warn!(%thread, %expected, %found,
                      "couldn't find archive log for expected sequence, waiting");
            }
        }
        Ok(())
    }

    fn parse_archive(&mut self, candidate: &ArchiveCandidate) -> Result<()> {
        let path = self.cfg.path_mapping.apply_path(&candidate.path);
        let thread = candidate.thread;

        let tries = self.cx.timings.arch_read_tries;
        let mut attempt = 0;
        loop {
            match Reader::probe(&path) {
                Ok(_) => break,
                Err(e) if attempt < tries => {
                    attempt += 1;
                    info!(path = %path.display(), error = %e,
                          "archived redo log is not ready for read, sleeping");
                    self.cx.sleep_us(self.cx.timings.arch_read_sleep_us);
                    if self.cx.is_soft_shutdown() {
                        return Ok(());
                    }
                }
                Err(_) => {
                    return Err(RedowireError::ArchiveOpenExhausted {
                        path: path.clone(),
                        tries,
                    })
                }
            }
        }

        let reader = Reader::spawn(Arc::clone(&self.cx), 0, self.cfg.reader.clone());
        let mut parser = Parser::new(0, path, thread, candidate.sequence);
        self.metadata.swap_in_thread(thread);

        let outcome = {
            let mut pcx = ParseCx {
                cx: &self.cx,
                metadata: &self.metadata,
                txn: &mut self.txn,
                builder: &mut *self.builder,
                metrics: &self.metrics,
                flush_options: self.cfg.flush_options,
            };
            parser.parse(&mut pcx, &reader)
        };
        self.metadata.swap_out_thread(thread);

        match outcome? {
            ParseOutcome::Finished => {
                self.metadata
                    .set_first_next_scn(thread, parser.first_scn, parser.next_scn);
                self.metadata.set_last_lwn_scn(thread, parser.lwn_scn());
                Ok(())
            }
            ParseOutcome::Stopped => Ok(()),
            other => Err(RedowireError::ReaderFailed {
                status: format!("archive parse ended with {other:?}"),
            }),
        }
    }

    // --- online ------------------------------------------------------------

    fn create_online_slots(&mut self) -> Result<()> {
        let mut groups: BTreeMap<i32, (RedoThread, Vec<PathBuf>)> = BTreeMap::new();
        for log in &self.cfg.online_logs {
            let mapped = self.cfg.path_mapping.apply(&log.path);
            groups
                .entry(log.group)
                .or_insert_with(|| (log.thread, Vec::new()))
                .1
                .push(PathBuf::from(mapped));
        }

        for (group, (thread, paths)) in groups {
            let mut chosen = None;
            for path in &paths {
                match Reader::probe(path) {
                    Ok(header) => {
                        chosen = Some((path.clone(), header));
                        break;
                    }
                    Err(e) => {
                        debug!(path = %path.display(), error = %e, "online member unreadable");
                    }
                }
            }
            let Some((path, header)) = chosen else {
                return Err(RedowireError::GroupUnreadable { group });
            };
            info!(group, path = %path.display(), seq = %header.sequence, "online redo log");
            let mut reader = Reader::spawn(Arc::clone(&self.cx), group, self.cfg.reader.clone());
            reader.paths = paths;
            let mut parser = Parser::new(group, path, header.thread, header.sequence);
            parser.first_scn = header.first_scn;
            if thread != header.thread {
                warn!(group, configured = %thread, actual = %header.thread,
                      "online group thread differs from configuration");
            }
            self.online.push(OnlineSlot { reader, parser });
        }
        Ok(())
    }

    /// Re-probe a slot's members and rebind its parser when the group's
    /// file moved to a new sequence.
    fn refresh_slot(cfg_group: i32, slot: &mut OnlineSlot) {
        for path in slot.reader.paths.clone() {
            match Reader::probe(&path) {
                Ok(header) => {
                    if header.sequence != slot.parser.sequence || path != slot.parser.path {
                        slot.parser =
                            Parser::new(cfg_group, path, header.thread, header.sequence);
                    }
                    slot.parser.first_scn = header.first_scn;
                    return;
                }
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "online member probe failed");
                }
            }
        }
    }

    fn refresh_online(&mut self) {
        for slot in &mut self.online {
            Self::refresh_slot(slot.reader.group, slot);
        }
    }

    /// Threads with no position yet adopt the lowest online sequence.
    fn adopt_start_sequences(&mut self) {
        let mut lowest: BTreeMap<RedoThread, Seq> = BTreeMap::new();
        for slot in &self.online {
            let entry = lowest
                .entry(slot.parser.thread)
                .or_insert(slot.parser.sequence);
            if slot.parser.sequence < *entry {
                *entry = slot.parser.sequence;
            }
        }
        for (thread, seq) in lowest {
            let current = self.metadata.sequence(thread);
            if current.is_none() || current == Seq::ZERO {
                info!(%thread, %seq, "adopting start sequence from online redo");
                self.metadata
                    .set_seq_file_offset(thread, seq, FileOffset::ZERO);
            }
        }
    }

    fn process_online(&mut self) -> Result<bool> {
        self.refresh_online();
        self.adopt_start_sequences();

        let threads: BTreeSet<RedoThread> =
            self.online.iter().map(|s| s.parser.thread).collect();
        if threads.len() <= 1 {
            self.process_online_single()
        } else {
            info!(
                threads = threads.len(),
                "RAC mode: multiple redo threads, watermark-gated parsing"
            );
            self.process_online_rac()
        }
    }

    fn run_slot(&mut self, idx: usize) -> Result<ParseOutcome> {
        let Self {
            cx,
            metadata,
            txn,
            builder,
            metrics,
            cfg,
            online,
            ..
        } = self;
        let slot = &mut online[idx];
        let mut pcx = ParseCx {
            cx: cx.as_ref(),
            metadata: metadata.as_ref(),
            txn,
            builder: &mut **builder,
            metrics: metrics.as_ref(),
            flush_options: cfg.flush_options,
        };
        slot.parser.parse(&mut pcx, &slot.reader)
    }

    fn process_online_single(&mut self) -> Result<bool> {
        let mut progressed = false;
        let metadata = Arc::clone(&self.metadata);

        while !self.cx.is_soft_shutdown() {
            self.refresh_online();
            self.adopt_start_sequences();

            let mut pick: Option<usize> = None;
            let mut higher = false;
            for (idx, slot) in self.online.iter().enumerate() {
                let expected = metadata.sequence(slot.parser.thread);
                if slot.parser.sequence > expected && !expected.is_none() {
                    higher = true;
                }
                if slot.parser.sequence == expected {
                    let better = match pick {
                        None => true,
                        Some(current) => {
                            let current_scn = self.online[current].parser.first_scn;
                            !slot.parser.first_scn.is_none()
                                && (current_scn.is_none()
                                    || slot.parser.first_scn < current_scn)
                        }
                    };
                    if better {
                        pick = Some(idx);
                    }
                }
            }

            let Some(idx) = pick else {
                if higher {
                    // Our expected sequence is gone from the online set:
                    // the archives will catch us up.
                    debug!("expected sequence not online, deferring to archives");
                }
                return Ok(progressed);
            };

            let thread = self.online[idx].parser.thread;
            metadata.swap_in_thread(thread);
            let outcome = self.run_slot(idx);
            metadata.swap_out_thread(thread);
            let outcome = outcome?;

            let (first_scn, next_scn, lwn_scn) = {
                let parser = &self.online[idx].parser;
                (parser.first_scn, parser.next_scn, parser.lwn_scn())
            };
            metadata.set_first_next_scn(thread, first_scn, next_scn);
            metadata.set_last_lwn_scn(thread, lwn_scn);
            progressed = true;

            match outcome {
                ParseOutcome::Finished => {
                    metadata.set_next_sequence(thread);
                    if self.txn.live_len() == 0 {
                        metadata.write_checkpoint(self.checkpoint_scn())?;
                    }
                    if self.cx.tick_log_switch() {
                        info!("shutdown started - exhausted number of log switches");
                        self.cx.stop_soft();
                    }
                }
                ParseOutcome::Stopped => break,
                ParseOutcome::Overwritten => {
                    info!("online redo log has been overwritten, continuing from archives");
                    return Ok(progressed);
                }
                ParseOutcome::Yield => {
                    return Err(RedowireError::internal(
                        "yield outcome outside yield-on-wait mode",
                    ))
                }
            }
        }
        Ok(progressed)
    }

    fn process_online_rac(&mut self) -> Result<bool> {
        self.txn.defer_committed = true;
        self.thread_states.clear();

        // Choose, per thread, the slot matching that thread's current
        // sequence; ties by lowest known first SCN.
        let mut chosen: BTreeMap<RedoThread, usize> = BTreeMap::new();
        for (idx, slot) in self.online.iter().enumerate() {
            let thread = slot.parser.thread;
            if slot.parser.sequence != self.metadata.sequence(thread) {
                continue;
            }
            let replace = match chosen.get(&thread) {
                None => true,
                Some(&current) => {
                    let current_scn = self.online[current].parser.first_scn;
                    !slot.parser.first_scn.is_none()
                        && (current_scn.is_none() || slot.parser.first_scn < current_scn)
                }
            };
            if replace {
                chosen.insert(thread, idx);
            }
        }
        for (&thread, &idx) in &chosen {
            self.online[idx].parser.yield_on_wait = true;
            self.thread_states.entry(thread).or_default().slot = Some(idx);
        }
        if self.thread_states.is_empty() {
            self.txn.defer_committed = false;
            return Ok(false);
        }

        let result = self.rac_loop();
        // Leaving RAC mode always drains: deferral must not outlive it.
        self.txn.defer_committed = false;
        self.watermark = Scn::new(u64::MAX);
        self.emit_watermarked()?;
        result.map(|()| true)
    }

    fn rac_loop(&mut self) -> Result<()> {
        let metadata = Arc::clone(&self.metadata);

        while !self.cx.is_soft_shutdown() {
            // Lagging threads first (unknown LWN before everything), so
            // the leader cannot run away and pin deferred memory.
            let mut order: Vec<RedoThread> = self
                .thread_states
                .iter()
                .filter(|(_, s)| s.slot.is_some())
                .map(|(&t, _)| t)
                .collect();
            order.sort_by_key(|t| {
                let scn = self.thread_states[t].last_lwn_scn;
                (!scn.is_none(), scn, *t)
            });

            let mut all_yielded = true;
            for thread in order {
                if self.cx.is_soft_shutdown() {
                    break;
                }
                let state = self.thread_states[&thread];

                // Throttle the thread ahead of the watermark when the
                // pending queue pins too much arena memory.
                if !self.watermark.is_none()
                    && !state.last_lwn_scn.is_none()
                    && state.last_lwn_scn > self.watermark
                    && self.txn.pending_len() > self.cfg.max_pending_transactions
                {
                    self.thread_states.get_mut(&thread).expect("state exists").yielded = true;
                    continue;
                }

                if state.finished {
                    self.rac_log_switch(thread)?;
                }
                let Some(idx) = self.thread_states[&thread].slot else {
                    self.thread_states.get_mut(&thread).expect("state exists").yielded = true;
                    continue;
                };

                metadata.swap_in_thread(thread);
                let outcome = self.run_slot(idx);
                metadata.swap_out_thread(thread);
                let outcome = match outcome {
                    Ok(outcome) => outcome,
                    Err(e) => return Err(e),
                };

                let (first_scn, next_scn, lwn_scn) = {
                    let parser = &self.online[idx].parser;
                    (parser.first_scn, parser.next_scn, parser.lwn_scn())
                };
                metadata.set_first_next_scn(thread, first_scn, next_scn);
                let state = self.thread_states.get_mut(&thread).expect("state exists");
                state.next_scn = next_scn;
                state.yielded = false;
                if !lwn_scn.is_none() {
                    state.last_lwn_scn = lwn_scn;
                    metadata.set_last_lwn_scn(thread, lwn_scn);
                }

                match outcome {
                    ParseOutcome::Yield => state.yielded = true,
                    ParseOutcome::Finished => {
                        state.finished = true;
                        if self.cx.tick_log_switch() {
                            info!("shutdown started - exhausted number of log switches");
                            self.cx.stop_soft();
                        }
                    }
                    ParseOutcome::Overwritten => {
                        info!(%thread, "online redo log overwritten, falling back to archives");
                        return Ok(());
                    }
                    ParseOutcome::Stopped => {}
                }

                if !self.thread_states[&thread].yielded {
                    all_yielded = false;
                }
                // Keep the throttle current within the pass.
                self.watermark = compute_watermark(&self.thread_states);
            }

            // Emit after the full pass: emitting mid-pass could release
            // commits out of order against a thread not yet stepped.
            self.watermark = compute_watermark(&self.thread_states);
            self.emit_watermarked()?;
            if self.txn.live_len() == 0 && self.txn.pending_len() == 0 {
                metadata.write_checkpoint(self.checkpoint_scn())?;
            }

            if self.cx.is_soft_shutdown() {
                break;
            }
            if all_yielded {
                self.cx.sleep_us(self.cx.timings.redo_read_sleep_us);
            }
        }
        Ok(())
    }

    /// Log switch for one RAC thread: advance the sequence and rebind
    /// only this thread's readers (other threads' ring buffers must not
    /// be touched).
    fn rac_log_switch(&mut self, thread: RedoThread) -> Result<()> {
        self.metadata.set_next_sequence(thread);
        let expected = self.metadata.sequence(thread);

        for slot in &mut self.online {
            if slot.parser.thread == thread {
                Self::refresh_slot(slot.reader.group, slot);
            }
        }

        let state = self.thread_states.get_mut(&thread).expect("state exists");
        state.finished = false;
        state.slot = None;
        for (idx, slot) in self.online.iter_mut().enumerate() {
            if slot.parser.thread == thread && slot.parser.sequence == expected {
                slot.parser.yield_on_wait = true;
                slot.parser.reset_binding();
                state.slot = Some(idx);
                break;
            }
        }
        match state.slot {
            Some(_) => {
                self.metadata
                    .set_seq_file_offset(thread, expected, FileOffset::ZERO);
                info!(%thread, seq = %expected, "thread switched to next online redo log");
            }
            None => {
                debug!(%thread, seq = %expected, "no online redo log for thread after switch yet");
            }
        }
        Ok(())
    }

    // --- emission ----------------------------------------------------------

    fn emit_watermarked(&mut self) -> Result<()> {
        if self.watermark.is_none() {
            return Ok(());
        }
        let pending = self.txn.drain_pending_below(self.watermark);
        for ct in pending {
            let schema = self.metadata.schema();
            flush_transaction(
                &self.txn,
                &ct,
                &schema,
                self.cfg.flush_options,
                &mut *self.builder,
            )?;
            if ct.rollback {
                self.metrics.rollback_out();
            } else {
                self.metrics.commit_out();
            }
            let is_new = self
                .metadata
                .is_new_data(ct.lwn_scn, self.builder.lwn_idx());
            if is_new && self.cx.tick_transaction() {
                info!("shutdown started - exhausted number of transactions");
                self.cx.stop_soft();
            }
            if ct.shutdown_marker && is_new {
                info!(commit_scn = %ct.commit_scn,
                      "shutdown started - initiated by marker transaction");
                self.cx.stop_soft();
            }
            self.warn_writer_lag(ct.commit_scn);
            self.txn.purge(ct);
        }
        Ok(())
    }

    /// Warn when the downstream writer's confirmed SCN trails emission by
    /// a wide margin; the writer is the bottleneck then, not the redo.
    fn warn_writer_lag(&self, emitted: Scn) {
        const LAG_WARN_SCNS: u64 = 1_000_000;
        let Some(confirmed) = &self.cfg.confirmed_scn else {
            return;
        };
        let confirmed = confirmed.get();
        if !confirmed.is_none() && emitted.get() > confirmed.get() + LAG_WARN_SCNS {
            warn!(%emitted, %confirmed, "writer is lagging far behind emission");
        }
    }

    /// A safe checkpoint SCN: the minimum consumed LWN over all threads.
    fn checkpoint_scn(&self) -> Scn {
        let mut min = Scn::NONE;
        for thread in self.metadata.threads() {
            min = min.min_known(self.metadata.last_lwn_scn(thread));
        }
        min
    }

    // --- shutdown ----------------------------------------------------------

    fn stop_readers(&mut self) {
        for slot in &mut self.online {
            slot.reader.request_stop();
        }
        loop {
            let busy = self.online.iter().any(|s| !s.reader.thread_finished());
            if !busy {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        for slot in &mut self.online {
            slot.reader.join();
        }
        self.online.clear();
        self.queues.clear();
    }

    /// Observability snapshot (pending depth and arena high-water).
    #[must_use]
    pub fn metrics_snapshot(&self) -> redowire_builder::MetricsSnapshot {
        self.metrics
            .snapshot(self.txn.pending_len(), self.txn.arena().high_water())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redowire_txn::{CommittedTransaction, MemoryLimits};
    use redowire_types::Xid;

    fn t(n: u16) -> RedoThread {
        RedoThread::new(n).unwrap()
    }

    fn state(slot: Option<usize>, last_lwn: Scn, finished: bool, next_scn: Scn) -> ThreadRunState {
        ThreadRunState {
            slot,
            last_lwn_scn: last_lwn,
            next_scn,
            yielded: false,
            finished,
        }
    }

    #[test]
    fn watermark_is_min_over_active_threads() {
        let mut states = BTreeMap::new();
        states.insert(t(1), state(Some(0), Scn::new(250), false, Scn::NONE));
        states.insert(t(2), state(Some(1), Scn::new(180), false, Scn::NONE));
        assert_eq!(compute_watermark(&states), Scn::new(180));
    }

    #[test]
    fn watermark_unknown_until_every_thread_has_an_lwn() {
        let mut states = BTreeMap::new();
        states.insert(t(1), state(Some(0), Scn::new(250), false, Scn::NONE));
        states.insert(t(2), state(Some(1), Scn::NONE, false, Scn::NONE));
        assert!(compute_watermark(&states).is_none());
    }

    #[test]
    fn finished_thread_bounds_by_next_scn() {
        let mut states = BTreeMap::new();
        states.insert(t(1), state(Some(0), Scn::new(300), true, Scn::new(500)));
        states.insert(t(2), state(Some(1), Scn::new(400), false, Scn::NONE));
        assert_eq!(compute_watermark(&states), Scn::new(400));

        states.insert(t(1), state(Some(0), Scn::new(300), true, Scn::NONE));
        assert_eq!(compute_watermark(&states), Scn::new(300));
    }

    #[test]
    fn threads_without_a_slot_are_ignored() {
        let mut states = BTreeMap::new();
        states.insert(t(1), state(Some(0), Scn::new(300), false, Scn::NONE));
        states.insert(t(2), state(None, Scn::NONE, false, Scn::NONE));
        assert_eq!(compute_watermark(&states), Scn::new(300));
    }

    // S5 shape: one thread only advances via checkpoint records; its
    // lastLwnScn gates the other thread's commits.
    #[test]
    fn idle_thread_releases_commits_in_stages() {
        let mut txn = TransactionBuffer::new(MemoryLimits {
            min_mb: 1,
            max_mb: 4,
        });
        for (wrap, commit) in [(1u32, 200u64), (2, 300)] {
            let xid = Xid::new(1, 0, wrap);
            txn.begin(xid, t(1), Scn::new(commit - 50));
            let ct = txn
                .end(xid, Scn::new(commit), Scn::new(commit), false, false)
                .unwrap();
            txn.add_committed_pending(ct);
        }

        let mut states = BTreeMap::new();
        states.insert(t(1), state(Some(0), Scn::new(310), false, Scn::NONE));
        states.insert(t(2), state(Some(1), Scn::new(250), false, Scn::NONE));
        let watermark = compute_watermark(&states);
        assert_eq!(watermark, Scn::new(250));
        let released: Vec<u64> = txn
            .drain_pending_below(watermark)
            .into_iter()
            .map(|ct: CommittedTransaction| {
                let scn = ct.commit_scn.get();
                txn.purge(ct);
                scn
            })
            .collect();
        assert_eq!(released, vec![200]);

        states.insert(t(2), state(Some(1), Scn::new(350), false, Scn::NONE));
        let watermark = compute_watermark(&states);
        assert_eq!(watermark, Scn::new(310));
        let released: Vec<u64> = txn
            .drain_pending_below(watermark)
            .into_iter()
            .map(|ct| {
                let scn = ct.commit_scn.get();
                txn.purge(ct);
                scn
            })
            .collect();
        assert_eq!(released, vec![300]);
    }
}
