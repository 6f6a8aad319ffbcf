//! The parser: turns a reader's block stream into transactions.
//!
//! [`Parser::parse`] is a reentrant step function, not a thread. It
//! consumes complete LWN groups until the file is sealed, shutdown is
//! requested, or — in yield-on-wait mode (RAC) — no complete group is
//! buffered, in which case it saves its resume position into the shared
//! metadata slots and returns [`ParseOutcome::Yield`]. Re-entry is
//! idempotent: the resume block is recomputed from the saved offset and
//! nothing below it is ever re-confirmed.

use std::path::PathBuf;

use redowire_builder::flush::{flush_transaction, FlushOptions};
use redowire_builder::{Builder, Metrics};
use redowire_error::{RedowireError, Result};
use redowire_metadata::Metadata;
use redowire_txn::TransactionBuffer;
use redowire_types::{BlockSize, Cx, FileOffset, RedoThread, Scn, Seq};
use tracing::{debug, info, warn};

use crate::block::BlockHeader;
use crate::lwn::{append_payload, LwnHeader};
use crate::reader::{BlockWait, Reader};
use crate::record::parse_record;
use crate::row::{assemble_record, Effect};

/// Result of one `parse()` step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseOutcome {
    /// The file is sealed and fully parsed.
    Finished,
    /// Shutdown was requested mid-file.
    Stopped,
    /// The online log was recycled; fall back to archives.
    Overwritten,
    /// Yield-on-wait mode and no complete LWN group is buffered.
    Yield,
}

/// Everything a parse step needs besides the reader.
pub struct ParseCx<'a> {
    pub cx: &'a Cx,
    pub metadata: &'a Metadata,
    pub txn: &'a mut TransactionBuffer,
    pub builder: &'a mut dyn Builder,
    pub metrics: &'a Metrics,
    pub flush_options: FlushOptions,
}

/// Parser for one redo file (an online group member or an archive).
#[derive(Debug)]
pub struct Parser {
    pub group: i32,
    pub path: PathBuf,
    pub thread: RedoThread,
    pub sequence: Seq,
    pub first_scn: Scn,
    pub next_scn: Scn,
    /// RAC mode: return `Yield` instead of blocking on the reader.
    pub yield_on_wait: bool,
    /// Max SCN of any fully consumed LWN group of this file.
    lwn_scn: Scn,
    bound: bool,
    block_size: Option<BlockSize>,
}

impl Parser {
    #[must_use]
    pub fn new(group: i32, path: PathBuf, thread: RedoThread, sequence: Seq) -> Self {
        Self {
            group,
            path,
            thread,
            sequence,
            first_scn: Scn::NONE,
            next_scn: Scn::NONE,
            yield_on_wait: false,
            lwn_scn: Scn::NONE,
            bound: false,
            block_size: None,
        }
    }

    /// Max SCN of any fully consumed LWN group, for the watermark.
    #[must_use]
    pub fn lwn_scn(&self) -> Scn {
        self.lwn_scn
    }

    /// Force a re-bind on the next parse step (after a log switch
    /// rebinds the reader to a new sequence).
    pub fn reset_binding(&mut self) {
        self.bound = false;
        self.lwn_scn = Scn::NONE;
    }

    /// Run the parse step. See the module docs for the protocol.
    pub fn parse(&mut self, pcx: &mut ParseCx<'_>, reader: &Reader) -> Result<ParseOutcome> {
        if !self.bound {
            self.bind(pcx, reader)?;
        }
        let block_size = self.block_size.expect("bound parser has a block size");
        let bs = u64::from(block_size.get());
        let mut offset = pcx
            .metadata
            .current_position()
            .1
            .as_bytes()
            .max(bs);
        let mut block = vec![0u8; block_size.as_usize()];

        loop {
            if pcx.cx.is_soft_shutdown() {
                return Ok(ParseOutcome::Stopped);
            }

            match reader.copy_block(offset, &mut block, self.yield_on_wait) {
                BlockWait::Ready => {}
                BlockWait::Finished => {
                    self.next_scn = reader.next_scn();
                    debug!(path = %self.path.display(), seq = %self.sequence,
                           next_scn = %self.next_scn, "redo log fully parsed");
                    return Ok(ParseOutcome::Finished);
                }
                BlockWait::Overwritten => return Ok(ParseOutcome::Overwritten),
                BlockWait::Stopped => return Ok(ParseOutcome::Stopped),
                BlockWait::Yield => return Ok(ParseOutcome::Yield),
                BlockWait::Failed(kind) => return Err(reader.take_error(kind)),
            }

            let file_offset = FileOffset::from_bytes(offset);
            let header = BlockHeader::from_block(&block, &self.path)?;
            if !header.is_lwn_start() {
                return Err(RedowireError::RedoCorrupt {
                    sequence: self.sequence,
                    offset: file_offset,
                    detail: format!(
                        "expected an LWN start at block {}",
                        file_offset.block_index(block_size)
                    ),
                });
            }
            let lwn = LwnHeader::from_block(&block, &header, &self.path)?;

            // The whole group must be buffered before any of it is
            // interpreted; a yield here re-reads the same group later.
            let mut payload = Vec::with_capacity(lwn.payload_capacity(block_size));
            append_payload(&block, true, &mut payload);
            for i in 1..u64::from(lwn.blocks) {
                match reader.copy_block(offset + i * bs, &mut block, self.yield_on_wait) {
                    BlockWait::Ready => append_payload(&block, false, &mut payload),
                    BlockWait::Finished => {
                        return Err(RedowireError::RedoCorrupt {
                            sequence: self.sequence,
                            offset: file_offset,
                            detail: format!(
                                "sealed log truncates an LWN group of {} blocks",
                                lwn.blocks
                            ),
                        })
                    }
                    BlockWait::Overwritten => return Ok(ParseOutcome::Overwritten),
                    BlockWait::Stopped => return Ok(ParseOutcome::Stopped),
                    BlockWait::Yield => return Ok(ParseOutcome::Yield),
                    BlockWait::Failed(kind) => return Err(reader.take_error(kind)),
                }
            }

            let group_scn = self.parse_group(pcx, &payload, lwn, file_offset)?;

            // The group is the unit of progress: advance and release.
            offset += u64::from(lwn.blocks) * bs;
            pcx.metadata
                .set_current_position(self.sequence, FileOffset::from_bytes(offset));
            reader.confirm(offset);
            self.lwn_scn = self.lwn_scn.max_known(group_scn);
        }
    }

    fn bind(&mut self, pcx: &mut ParseCx<'_>, reader: &Reader) -> Result<()> {
        let resume = pcx.metadata.current_position().1;
        let header = reader.bind(&self.path, resume)?;
        if header.sequence != self.sequence {
            return Err(RedowireError::WrongSequence {
                path: self.path.clone(),
                found: header.sequence,
                expected: self.sequence,
            });
        }
        if header.thread != self.thread {
            return Err(RedowireError::BadHeader {
                path: self.path.clone(),
                detail: format!(
                    "thread mismatch: file says {}, expected {}",
                    header.thread, self.thread
                ),
            });
        }
        let resetlogs = pcx.metadata.resetlogs();
        if resetlogs != 0 && header.resetlogs != resetlogs {
            return Err(RedowireError::BadHeader {
                path: self.path.clone(),
                detail: format!(
                    "resetlogs mismatch: file says {}, expected {resetlogs}",
                    header.resetlogs
                ),
            });
        }
        let activation = pcx.metadata.activation();
        if activation != 0 && header.activation != activation {
            return Err(RedowireError::BadHeader {
                path: self.path.clone(),
                detail: format!(
                    "activation mismatch: file says {}, expected {activation}",
                    header.activation
                ),
            });
        }
        self.first_scn = header.first_scn;
        self.next_scn = header.next_scn;
        self.block_size = Some(header.block_size);
        self.bound = true;
        info!(path = %self.path.display(), thread = %self.thread, seq = %self.sequence,
              first_scn = %self.first_scn, "parsing redo log");
        Ok(())
    }

    /// Parse all records of one complete group and apply their effects.
    /// Returns the max SCN observed in the group.
    fn parse_group(
        &mut self,
        pcx: &mut ParseCx<'_>,
        payload: &[u8],
        lwn: LwnHeader,
        file_offset: FileOffset,
    ) -> Result<Scn> {
        let strict = pcx.metadata.params.strict_opcodes();
        let mut group_scn = lwn.scn;
        let mut at = 0usize;
        while let Some((record, next)) =
            parse_record(payload, at, lwn.scn, self.sequence, file_offset)?
        {
            group_scn = group_scn.max_known(record.header.scn);
            let effects = assemble_record(&record, self.sequence, file_offset, strict)?;
            for effect in effects {
                self.apply_effect(pcx, effect, group_scn)?;
            }
            at = next;
        }
        Ok(group_scn)
    }

    fn apply_effect(
        &mut self,
        pcx: &mut ParseCx<'_>,
        effect: Effect,
        group_scn: Scn,
    ) -> Result<()> {
        match effect {
            Effect::Begin { xid, scn } => pcx.txn.begin(xid, self.thread, scn),
            Effect::Row(change) => pcx.txn.append_change(self.thread, &change)?,
            Effect::SavepointMark { xid, id } => {
                pcx.txn.mark_savepoint(xid, self.thread, group_scn, id);
            }
            Effect::SavepointRollback { xid, id } => pcx.txn.rollback_to_savepoint(xid, id),
            Effect::End {
                xid,
                scn,
                rollback,
                shutdown,
            } => {
                let Some(ct) = pcx.txn.end(xid, scn, group_scn, rollback, shutdown) else {
                    debug!(%xid, commit_scn = %scn, "end record for unknown transaction");
                    return Ok(());
                };
                if pcx.txn.defer_committed {
                    pcx.txn.add_committed_pending(ct);
                } else {
                    let schema = pcx.metadata.schema();
                    flush_transaction(pcx.txn, &ct, &schema, pcx.flush_options, pcx.builder)?;
                    if ct.rollback {
                        pcx.metrics.rollback_out();
                    } else {
                        pcx.metrics.commit_out();
                    }
                    let is_new = pcx.metadata.is_new_data(ct.lwn_scn, pcx.builder.lwn_idx());
                    if is_new && pcx.cx.tick_transaction() {
                        info!("shutdown started - exhausted number of transactions");
                        pcx.cx.stop_soft();
                    }
                    if ct.shutdown_marker && is_new {
                        info!(commit_scn = %ct.commit_scn,
                              "shutdown started - initiated by marker transaction");
                        pcx.cx.stop_soft();
                    }
                    pcx.txn.purge(ct);
                }
            }
            Effect::Ddl(event) => {
                warn!(owner = %event.owner, object = %event.object_name,
                      op = event.op_type, scn = %event.scn, "DDL observed in redo");
                pcx.metadata.invalidate_object(&event.owner, &event.object_name);
            }
            Effect::Advance => {}
        }
        Ok(())
    }
}
