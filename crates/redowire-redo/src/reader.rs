//! Redo file reader: one background thread per online redo group (plus a
//! shared one for archives) streaming validated blocks into a bounded
//! ring buffer.
//!
//! The buffer is a single contiguous circular byte buffer addressed by
//! absolute file offsets: the reader advances `end` as blocks arrive, the
//! parser advances `start` through [`Reader::confirm`] once an LWN group
//! is fully consumed. The reader blocks when `end - start` reaches the
//! capacity; `confirm` is the only signal that frees space.
//!
//! For online logs the tail block is re-read on an interval until the
//! end-of-log marker appears in the file header. A block carrying an
//! older sequence than expected is an unwritten tail (wait); a newer
//! sequence means Oracle recycled the file under us (overwritten).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use redowire_error::{RedowireError, Result};
use redowire_types::{Cx, FileOffset, Scn, Seq};
use tracing::{debug, info, warn};

use crate::block::{verify_block_checksum, BlockHeader, RedoFileHeader};
use crate::device::{FileDevice, RedoDevice};

/// Largest single read issued against the device.
const READ_CHUNK: usize = 256 * 1024;
/// How long a blocking `copy_block` waits per poll of the shutdown flag.
const CONSUMER_WAIT: Duration = Duration::from_millis(100);

/// Reader tuning, derived from the source configuration.
#[derive(Debug, Clone)]
pub struct ReaderConfig {
    /// Ring capacity in bytes (`memory.read-buffer-mb`). Must hold at
    /// least one LWN group.
    pub capacity_bytes: usize,
    /// Recompute block checksums (`db-block-checksum` on and not disabled).
    pub verify_checksums: bool,
    /// Tail re-read interval for online logs, microseconds.
    pub tail_poll_us: u64,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: 4 * 1024 * 1024,
            verify_checksums: true,
            tail_poll_us: 10_000,
        }
    }
}

/// Fatal reader failure kinds, surfaced to the parser as status — never
/// thrown across the thread boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailKind {
    Read,
    Crc,
    BadData,
}

/// Outcome of a `copy_block` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockWait {
    /// The requested block was copied out.
    Ready,
    /// The log is sealed and fully consumed.
    Finished,
    /// The online log was recycled before we finished it.
    Overwritten,
    /// Shutdown was requested.
    Stopped,
    /// No data and yield-on-wait mode is active.
    Yield,
    /// The reader failed hard; map via [`Reader::take_error`].
    Failed(FailKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Reading,
    Sealed,
    Overwritten,
    Failed(FailKind),
}

struct State {
    phase: Phase,
    device: Option<FileDevice>,
    header: Option<RedoFileHeader>,
    path: PathBuf,
    ring: Vec<u8>,
    /// Confirmed file offset: bytes below this may be reclaimed.
    start: u64,
    /// Filled file offset: bytes in `[start, end)` are valid.
    end: u64,
    generation: u64,
    shutdown: bool,
}

struct Shared {
    cfg: ReaderConfig,
    cx: Arc<Cx>,
    state: Mutex<State>,
    /// Signaled when data arrives or the phase changes; consumers wait here.
    cond_data: Condvar,
    /// Signaled on confirm/bind/shutdown; the producer waits here.
    cond_space: Condvar,
}

/// A redo file reader bound to one online group (or the shared archive
/// reader, `group == 0`).
pub struct Reader {
    pub group: i32,
    /// Candidate member paths for this group, already path-mapped.
    pub paths: Vec<PathBuf>,
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl Reader {
    /// Spawn the reader thread. It idles until the first [`Reader::bind`].
    pub fn spawn(cx: Arc<Cx>, group: i32, cfg: ReaderConfig) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                phase: Phase::Idle,
                device: None,
                header: None,
                path: PathBuf::new(),
                ring: vec![0u8; cfg.capacity_bytes],
                start: 0,
                end: 0,
                generation: 0,
                shutdown: false,
            }),
            cond_data: Condvar::new(),
            cond_space: Condvar::new(),
            cfg,
            cx,
        });
        let thread_shared = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name(format!("reader-{group}"))
            .spawn(move || producer_loop(&thread_shared))
            .expect("spawning reader thread");
        Self {
            group,
            paths: Vec::new(),
            shared,
            thread: Some(thread),
        }
    }

    /// Read and validate the file header of `path` without binding.
    pub fn probe(path: &Path) -> Result<RedoFileHeader> {
        let device = FileDevice::open(path)?;
        read_file_header(&device, path)
    }

    /// Bind this reader to a redo file and start streaming from
    /// `resume`. Resets the ring; any previous binding is discarded.
    pub fn bind(&self, path: &Path, resume: FileOffset) -> Result<RedoFileHeader> {
        let device = FileDevice::open(path)?;
        let header = read_file_header(&device, path)?;
        let bs = u64::from(header.block_size.get());
        // Never position before the first data block.
        let from = resume.as_bytes().max(bs);
        if from % bs != 0 {
            return Err(RedowireError::BadHeader {
                path: path.to_path_buf(),
                detail: format!("resume offset {from} is not block-aligned"),
            });
        }

        let mut state = self.shared.state.lock();
        state.device = Some(device);
        state.header = Some(header.clone());
        state.path = path.to_path_buf();
        state.start = from;
        state.end = from;
        state.generation += 1;
        state.phase = Phase::Reading;
        self.shared.cond_space.notify_all();
        debug!(group = self.group, path = %path.display(), seq = %header.sequence, from, "reader bound");
        Ok(header)
    }

    /// Copy the block at `offset` into `out` (sized to the block size).
    ///
    /// Blocks until data arrives unless `yield_mode` is set, in which
    /// case [`BlockWait::Yield`] is returned instead of waiting.
    pub fn copy_block(&self, offset: u64, out: &mut [u8], yield_mode: bool) -> BlockWait {
        let mut state = self.shared.state.lock();
        loop {
            let Some(header) = &state.header else {
                return BlockWait::Stopped;
            };
            let bs = u64::from(header.block_size.get());
            debug_assert_eq!(out.len() as u64, bs);

            if offset + bs <= state.end {
                let cap = state.ring.len() as u64;
                let at = (offset % cap) as usize;
                let n = out.len();
                let first = n.min(state.ring.len() - at);
                out[..first].copy_from_slice(&state.ring[at..at + first]);
                out[first..].copy_from_slice(&state.ring[..n - first]);
                return BlockWait::Ready;
            }

            match state.phase {
                Phase::Failed(kind) => return BlockWait::Failed(kind),
                Phase::Overwritten => return BlockWait::Overwritten,
                Phase::Sealed => return BlockWait::Finished,
                Phase::Idle | Phase::Reading => {
                    if state.shutdown || self.shared.cx.is_soft_shutdown() {
                        return BlockWait::Stopped;
                    }
                    if yield_mode {
                        return BlockWait::Yield;
                    }
                    self.shared.cond_data.wait_for(&mut state, CONSUMER_WAIT);
                }
            }
        }
    }

    /// Advance the confirmed offset, releasing ring space below it.
    pub fn confirm(&self, offset: u64) {
        let mut state = self.shared.state.lock();
        if offset > state.start {
            state.start = offset;
            self.shared.cond_space.notify_all();
        }
    }

    /// Snapshot of the current (possibly tail-refreshed) file header.
    #[must_use]
    pub fn header(&self) -> Option<RedoFileHeader> {
        self.shared.state.lock().header.clone()
    }

    #[must_use]
    pub fn sequence(&self) -> Seq {
        self.header().map_or(Seq::NONE, |h| h.sequence)
    }

    #[must_use]
    pub fn first_scn(&self) -> Scn {
        self.header().map_or(Scn::NONE, |h| h.first_scn)
    }

    #[must_use]
    pub fn next_scn(&self) -> Scn {
        self.header().map_or(Scn::NONE, |h| h.next_scn)
    }

    /// The bound path, for diagnostics.
    #[must_use]
    pub fn current_path(&self) -> PathBuf {
        self.shared.state.lock().path.clone()
    }

    /// Convert a failed phase into the engine error it stands for.
    pub fn take_error(&self, kind: FailKind) -> RedowireError {
        let state = self.shared.state.lock();
        match kind {
            FailKind::Read => RedowireError::ReaderFailed {
                status: format!("read error on '{}'", state.path.display()),
            },
            FailKind::Crc => RedowireError::ReaderFailed {
                status: format!("checksum error on '{}'", state.path.display()),
            },
            FailKind::BadData => RedowireError::ReaderFailed {
                status: format!("malformed block data on '{}'", state.path.display()),
            },
        }
    }

    /// Ask the reader thread to stop after its current operation.
    pub fn request_stop(&self) {
        let mut state = self.shared.state.lock();
        state.shutdown = true;
        self.shared.cond_space.notify_all();
        self.shared.cond_data.notify_all();
    }

    /// Whether the background thread has exited.
    #[must_use]
    pub fn thread_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Join the reader thread; call after [`Reader::request_stop`].
    pub fn join(&mut self) {
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Reader {
    fn drop(&mut self) {
        self.request_stop();
        self.join();
    }
}

fn read_file_header(device: &FileDevice, path: &Path) -> Result<RedoFileHeader> {
    // The block size is inside the header; read the largest block size
    // and let the codec sort it out. Short files fail with BadHeader.
    let mut buf = vec![0u8; 4096];
    let size = device.size()?;
    if size < 512 {
        return Err(RedowireError::BadHeader {
            path: path.to_path_buf(),
            detail: format!("file too small for a redo header: {size} bytes"),
        });
    }
    let take = buf.len().min(size as usize);
    device.read_exact_at(0, &mut buf[..take])?;
    let header = RedoFileHeader::from_block(&buf[..take], path)?;
    let bs = header.block_size.as_usize();
    verify_block_checksum(&buf[..bs], 0, path)?;
    Ok(header)
}

fn producer_loop(shared: &Shared) {
    let mut state = shared.state.lock();
    loop {
        if state.shutdown || shared.cx.is_hard_shutdown() {
            shared.cond_data.notify_all();
            return;
        }
        if state.phase != Phase::Reading {
            shared
                .cond_space
                .wait_for(&mut state, Duration::from_millis(100));
            continue;
        }

        let header = state
            .header
            .clone()
            .expect("reading phase always has a header");
        let bs = header.block_size.as_usize();
        let file_end = header.file_end();

        if state.end >= file_end {
            if header.end_of_log {
                state.phase = Phase::Sealed;
                shared.cond_data.notify_all();
                continue;
            }
            // Online tail: re-read the file header in place and look for
            // growth, the end-of-log marker, or a recycled file.
            match refresh_header(&mut state, &header) {
                HeaderRefresh::Unchanged => {
                    shared
                        .cond_space
                        .wait_for(&mut state, Duration::from_micros(shared.cfg.tail_poll_us));
                }
                HeaderRefresh::Changed => {}
                HeaderRefresh::Done => {}
            }
            continue;
        }

        let free = state.ring.len() - (state.end - state.start) as usize;
        if free < bs {
            // Ring full: the parser's confirm() is the only way forward.
            shared
                .cond_space
                .wait_for(&mut state, Duration::from_millis(100));
            continue;
        }

        let want = free
            .min((file_end - state.end) as usize)
            .min(READ_CHUNK)
            / bs
            * bs;
        if want == 0 {
            shared
                .cond_space
                .wait_for(&mut state, Duration::from_millis(100));
            continue;
        }

        // Drop the lock for the disk read; a concurrent rebind is
        // detected by the generation counter and the read discarded.
        let generation = state.generation;
        let read_at = state.end;
        let Some(device) = state.device.take() else {
            continue;
        };
        drop(state);

        let mut chunk = vec![0u8; want];
        let read_result = device.read_exact_at(read_at, &mut chunk);

        state = shared.state.lock();
        if state.generation != generation {
            continue; // rebound while reading; device already replaced
        }
        state.device = Some(device);

        if let Err(e) = read_result {
            warn!(path = %state.path.display(), error = %e, "redo read failed");
            state.phase = Phase::Failed(FailKind::Read);
            shared.cond_data.notify_all();
            continue;
        }

        match validate_chunk(&chunk, &header, read_at, shared.cfg.verify_checksums, &state.path) {
            ChunkValidation::Valid(accept) => {
                if accept > 0 {
                    push_ring(&mut state, &chunk[..accept], read_at);
                    shared.cond_data.notify_all();
                } else {
                    // Tail not written yet; poll again later.
                    shared
                        .cond_space
                        .wait_for(&mut state, Duration::from_micros(shared.cfg.tail_poll_us));
                }
            }
            ChunkValidation::Overwritten => {
                info!(path = %state.path.display(), "online redo log recycled under us");
                state.phase = Phase::Overwritten;
                shared.cond_data.notify_all();
            }
            ChunkValidation::Failed(kind, accept) => {
                if header.end_of_log {
                    if accept > 0 {
                        push_ring(&mut state, &chunk[..accept], read_at);
                    }
                    state.phase = Phase::Failed(kind);
                    shared.cond_data.notify_all();
                } else if accept > 0 {
                    // Valid prefix before a torn tail block.
                    push_ring(&mut state, &chunk[..accept], read_at);
                    shared.cond_data.notify_all();
                } else {
                    shared
                        .cond_space
                        .wait_for(&mut state, Duration::from_micros(shared.cfg.tail_poll_us));
                }
            }
        }
    }
}

enum HeaderRefresh {
    Unchanged,
    Changed,
    Done,
}

fn refresh_header(state: &mut State, bound: &RedoFileHeader) -> HeaderRefresh {
    let bs = bound.block_size.as_usize();
    let mut buf = vec![0u8; bs];
    let read_ok = match &state.device {
        None => return HeaderRefresh::Unchanged,
        Some(device) => device.read_exact_at(0, &mut buf).is_ok(),
    };
    if !read_ok {
        state.phase = Phase::Failed(FailKind::Read);
        return HeaderRefresh::Done;
    }
    let path = state.path.clone();
    let header = match RedoFileHeader::from_block(&buf, &path) {
        Ok(h) => h,
        Err(_) => {
            state.phase = Phase::Failed(FailKind::BadData);
            return HeaderRefresh::Done;
        }
    };
    if header.sequence != bound.sequence {
        info!(path = %path.display(), was = %bound.sequence, now = %header.sequence,
              "online redo log header switched sequence");
        state.phase = Phase::Overwritten;
        return HeaderRefresh::Done;
    }
    let changed = header.end_of_log != bound.end_of_log || header.num_blocks != bound.num_blocks;
    state.header = Some(header);
    if changed {
        HeaderRefresh::Changed
    } else {
        HeaderRefresh::Unchanged
    }
}

enum ChunkValidation {
    /// Accept this many bytes (a prefix of whole blocks).
    Valid(usize),
    Overwritten,
    /// A block failed validation after `usize` acceptable bytes.
    Failed(FailKind, usize),
}

fn validate_chunk(
    chunk: &[u8],
    header: &RedoFileHeader,
    read_at: u64,
    verify_checksums: bool,
    path: &Path,
) -> ChunkValidation {
    let bs = header.block_size.as_usize();
    let base_block = (read_at / bs as u64) as u32;
    let mut accepted = 0usize;
    for (i, block) in chunk.chunks_exact(bs).enumerate() {
        let block_number = base_block + i as u32;
        let parsed = match BlockHeader::from_block(block, path) {
            Ok(p) => p,
            Err(_) => return ChunkValidation::Failed(FailKind::BadData, accepted),
        };
        if parsed.sequence < header.sequence.get() {
            // Stale block from the file's previous life: unwritten tail.
            return ChunkValidation::Valid(accepted);
        }
        if parsed.sequence > header.sequence.get() {
            return ChunkValidation::Overwritten;
        }
        if parsed.block_number != block_number {
            return ChunkValidation::Failed(FailKind::BadData, accepted);
        }
        if verify_checksums && verify_block_checksum(block, block_number, path).is_err() {
            return ChunkValidation::Failed(FailKind::Crc, accepted);
        }
        accepted += bs;
    }
    ChunkValidation::Valid(accepted)
}

fn push_ring(state: &mut State, bytes: &[u8], at: u64) {
    debug_assert_eq!(at, state.end);
    let cap = state.ring.len();
    let pos = (at % cap as u64) as usize;
    let first = bytes.len().min(cap - pos);
    state.ring[pos..pos + first].copy_from_slice(&bytes[..first]);
    state.ring[..bytes.len() - first].copy_from_slice(&bytes[first..]);
    state.end += bytes.len() as u64;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{seal_block, BlockHeader, FLAG_LWN_START};
    use redowire_types::{BlockSize, RedoThread};
    use std::io::Write;

    fn write_file(path: &Path, blocks: &[Vec<u8>]) {
        let mut f = std::fs::File::create(path).unwrap();
        for b in blocks {
            f.write_all(b).unwrap();
        }
        f.sync_all().unwrap();
    }

    fn header_block(num_blocks: u32, sequence: u32, end_of_log: bool) -> Vec<u8> {
        let mut block = vec![0u8; 512];
        RedoFileHeader {
            block_size: BlockSize::B512,
            num_blocks,
            thread: RedoThread::ONE,
            sequence: Seq::new(sequence),
            first_scn: Scn::new(100),
            next_scn: if end_of_log { Scn::new(200) } else { Scn::NONE },
            resetlogs: 1,
            resetlogs_scn: Scn::new(1),
            activation: 7,
            description: String::new(),
            end_of_log,
            compat: crate::block::COMPAT_VERSION,
        }
        .write_block(&mut block);
        block
    }

    fn data_block(block_number: u32, sequence: u32, lwn_start: bool) -> Vec<u8> {
        let mut block = vec![0u8; 512];
        BlockHeader {
            block_number,
            sequence,
            checksum: 0,
            flags: if lwn_start { FLAG_LWN_START } else { 0 },
        }
        .write_to(&mut block);
        seal_block(&mut block);
        block
    }

    fn test_cx() -> Arc<Cx> {
        Arc::new(Cx::default())
    }

    #[test]
    fn probe_reads_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("arch.log");
        write_file(
            &path,
            &[header_block(2, 5, true), data_block(1, 5, true), data_block(2, 5, false)],
        );
        let header = Reader::probe(&path).unwrap();
        assert_eq!(header.sequence, Seq::new(5));
        assert!(header.end_of_log);
        assert_eq!(header.num_blocks, 2);
    }

    #[test]
    fn streams_sealed_file_to_finished() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("arch.log");
        write_file(
            &path,
            &[header_block(2, 5, true), data_block(1, 5, true), data_block(2, 5, false)],
        );

        let reader = Reader::spawn(test_cx(), 0, ReaderConfig::default());
        let header = reader.bind(&path, FileOffset::ZERO).unwrap();
        let bs = header.block_size.as_usize();

        let mut buf = vec![0u8; bs];
        assert_eq!(reader.copy_block(512, &mut buf, false), BlockWait::Ready);
        let parsed = BlockHeader::from_block(&buf, &path).unwrap();
        assert_eq!(parsed.block_number, 1);
        assert!(parsed.is_lwn_start());

        assert_eq!(reader.copy_block(1024, &mut buf, false), BlockWait::Ready);
        reader.confirm(1536);
        assert_eq!(reader.copy_block(1536, &mut buf, false), BlockWait::Finished);
    }

    #[test]
    fn bad_checksum_on_sealed_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("arch.log");
        let mut bad = data_block(1, 5, true);
        bad[100] ^= 0xff; // corrupt after sealing
        write_file(&path, &[header_block(1, 5, true), bad]);

        let reader = Reader::spawn(test_cx(), 0, ReaderConfig::default());
        reader.bind(&path, FileOffset::ZERO).unwrap();
        let mut buf = vec![0u8; 512];
        assert_eq!(
            reader.copy_block(512, &mut buf, false),
            BlockWait::Failed(FailKind::Crc)
        );
    }

    #[test]
    fn checksum_check_can_be_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("arch.log");
        let mut bad = data_block(1, 5, true);
        bad[100] ^= 0xff;
        write_file(&path, &[header_block(1, 5, true), bad]);

        let cfg = ReaderConfig {
            verify_checksums: false,
            ..ReaderConfig::default()
        };
        let reader = Reader::spawn(test_cx(), 0, cfg);
        reader.bind(&path, FileOffset::ZERO).unwrap();
        let mut buf = vec![0u8; 512];
        assert_eq!(reader.copy_block(512, &mut buf, false), BlockWait::Ready);
    }

    #[test]
    fn stale_tail_yields_in_yield_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("online.log");
        // Block 2 still carries the previous sequence: unwritten tail.
        write_file(
            &path,
            &[header_block(2, 5, false), data_block(1, 5, true), data_block(2, 4, false)],
        );

        let reader = Reader::spawn(test_cx(), 1, ReaderConfig::default());
        reader.bind(&path, FileOffset::ZERO).unwrap();
        let mut buf = vec![0u8; 512];
        assert_eq!(reader.copy_block(512, &mut buf, false), BlockWait::Ready);
        // The stale block is not served.
        assert_eq!(reader.copy_block(1024, &mut buf, true), BlockWait::Yield);
    }

    #[test]
    fn recycled_file_reports_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("online.log");
        write_file(
            &path,
            &[header_block(2, 5, false), data_block(1, 6, true), data_block(2, 6, false)],
        );

        let reader = Reader::spawn(test_cx(), 1, ReaderConfig::default());
        reader.bind(&path, FileOffset::ZERO).unwrap();
        let mut buf = vec![0u8; 512];
        let mut outcome = reader.copy_block(512, &mut buf, false);
        // Allow the producer a moment to classify the chunk.
        for _ in 0..50 {
            if outcome == BlockWait::Overwritten {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
            outcome = reader.copy_block(512, &mut buf, false);
        }
        assert_eq!(outcome, BlockWait::Overwritten);
    }

    #[test]
    fn backpressure_requires_confirm() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("arch.log");
        let blocks: Vec<Vec<u8>> = std::iter::once(header_block(8, 5, true))
            .chain((1..=8).map(|i| data_block(i, 5, i == 1)))
            .collect();
        write_file(&path, &blocks);

        // Ring of 2 blocks only.
        let cfg = ReaderConfig {
            capacity_bytes: 1024,
            ..ReaderConfig::default()
        };
        let reader = Reader::spawn(test_cx(), 0, cfg);
        reader.bind(&path, FileOffset::ZERO).unwrap();

        let mut buf = vec![0u8; 512];
        // Only two blocks fit without a confirm.
        assert_eq!(reader.copy_block(512, &mut buf, false), BlockWait::Ready);
        assert_eq!(reader.copy_block(1024, &mut buf, false), BlockWait::Ready);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(reader.copy_block(1536, &mut buf, true), BlockWait::Yield);

        // Confirming frees space and the stream continues to the end.
        let mut offset = 1536u64;
        reader.confirm(offset);
        loop {
            match reader.copy_block(offset, &mut buf, false) {
                BlockWait::Ready => {
                    offset += 512;
                    reader.confirm(offset);
                }
                BlockWait::Finished => break,
                other => panic!("unexpected wait state: {other:?}"),
            }
        }
        assert_eq!(offset, 9 * 512);
    }

    #[test]
    fn online_log_seals_after_header_update() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("online.log");
        write_file(&path, &[header_block(1, 5, false), data_block(1, 5, true)]);

        let cfg = ReaderConfig {
            tail_poll_us: 1_000,
            ..ReaderConfig::default()
        };
        let reader = Reader::spawn(test_cx(), 1, cfg);
        reader.bind(&path, FileOffset::ZERO).unwrap();
        let mut buf = vec![0u8; 512];
        assert_eq!(reader.copy_block(512, &mut buf, false), BlockWait::Ready);
        assert_eq!(reader.copy_block(1024, &mut buf, true), BlockWait::Yield);

        // Seal the file in place, as LGWR would at a log switch.
        let sealed = header_block(1, 5, true);
        let mut f = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        use std::os::unix::fs::FileExt;
        f.write_all_at(&sealed, 0).unwrap();
        f.sync_all().unwrap();

        let mut outcome = reader.copy_block(1024, &mut buf, false);
        for _ in 0..100 {
            if outcome == BlockWait::Finished {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
            outcome = reader.copy_block(1024, &mut buf, false);
        }
        assert_eq!(outcome, BlockWait::Finished);
        assert_eq!(reader.next_scn(), Scn::new(200));
    }

    #[test]
    fn stop_unblocks_consumer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("online.log");
        write_file(&path, &[header_block(1, 5, false), data_block(1, 4, false)]);

        let mut reader = Reader::spawn(test_cx(), 1, ReaderConfig::default());
        reader.bind(&path, FileOffset::ZERO).unwrap();
        reader.request_stop();
        let mut buf = vec![0u8; 512];
        assert_eq!(reader.copy_block(512, &mut buf, false), BlockWait::Stopped);
        reader.join();
        assert!(reader.thread_finished());
    }
}
