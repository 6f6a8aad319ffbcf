//! Archived redo discovery.
//!
//! Candidates come from two sources: a filesystem sweep of the recovery
//! destination's day directories, and user-supplied batch paths (files
//! or directories). File names are parsed against the database's
//! `log_archive_format` template; unparseable names are skipped with a
//! warning. Candidates are queued per thread in a min-heap by sequence.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap};
use std::path::{Path, PathBuf};

use redowire_error::{RedowireError, Result};
use redowire_redo::Reader;
use redowire_types::{RedoThread, Scn, Seq};
use tracing::{debug, trace, warn};

/// Sequence and thread recovered from an archive file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeqThread {
    pub sequence: Seq,
    pub thread: RedoThread,
}

/// Parse an archive file name against a `log_archive_format` template.
///
/// Wildcards: `%s`/`%S` sequence, `%t`/`%T` thread, `%r` resetlogs,
/// `%a` activation, `%d` database id (all `[0-9]+`), `%h` hash
/// (`[0-9a-z]+`). Literal characters must match exactly. Returns `None`
/// (after a warning) when the name does not fit the template or carries
/// no sequence.
#[must_use]
pub fn sequence_from_file_name(format: &str, file: &str) -> Option<SeqThread> {
    let fmt = format.as_bytes();
    let name = file.as_bytes();
    let mut sequence: Option<u32> = None;
    let mut thread: u16 = 1;
    let mut i = 0;
    let mut j = 0;

    while i < fmt.len() && j < name.len() {
        if fmt[i] == b'%' {
            let Some(&kind) = fmt.get(i + 1) else {
                warn!(file, format, "log_archive_format ends after %");
                return None;
            };
            let mut digits = 0usize;
            match kind {
                b's' | b'S' | b't' | b'T' | b'r' | b'a' | b'd' => {
                    let mut number: u32 = 0;
                    while j < name.len() && name[j].is_ascii_digit() {
                        number = number.wrapping_mul(10) + u32::from(name[j] - b'0');
                        j += 1;
                        digits += 1;
                    }
                    match kind {
                        b's' | b'S' => sequence = Some(number),
                        b't' | b'T' => thread = number as u16,
                        _ => {}
                    }
                }
                b'h' => {
                    while j < name.len()
                        && (name[j].is_ascii_digit() || name[j].is_ascii_lowercase())
                    {
                        j += 1;
                        digits += 1;
                    }
                }
                other => {
                    warn!(file, format, wildcard = %(other as char), "unknown format wildcard");
                    return None;
                }
            }
            if digits == 0 {
                warn!(file, format, at = j, "no digits where the format expects a field");
                return None;
            }
            i += 2;
        } else if fmt[i] == name[j] {
            i += 1;
            j += 1;
        } else {
            warn!(file, format, at = j, "file name diverges from log_archive_format");
            return None;
        }
    }

    if i != fmt.len() || j != name.len() {
        warn!(file, format, "file name length does not match log_archive_format");
        return None;
    }
    let sequence = sequence?;
    if sequence == 0 {
        return None;
    }
    Some(SeqThread {
        sequence: Seq::new(sequence),
        thread: RedoThread::new(thread)?,
    })
}

/// One discovered archive.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ArchiveCandidate {
    pub sequence: Seq,
    pub thread: RedoThread,
    pub path: PathBuf,
    /// Lazily probed from the file header by the scheduler.
    pub first_scn: Scn,
}

/// Per-thread min-heaps of archive candidates, keyed by sequence.
#[derive(Debug, Default)]
pub struct ArchiveQueues {
    queues: BTreeMap<RedoThread, BinaryHeap<Reverse<ArchiveCandidate>>>,
}

impl ArchiveQueues {
    /// Queue a candidate unless it is already behind the thread's
    /// position.
    pub fn push(&mut self, candidate: ArchiveCandidate, expected: Seq) {
        if !expected.is_none() && expected != Seq::ZERO && candidate.sequence < expected {
            trace!(path = %candidate.path.display(), seq = %candidate.sequence,
                   %expected, "skipping already-processed archive");
            return;
        }
        // Duplicate discovery across sweeps is normal; the heap dedups on pop.
        self.queues
            .entry(candidate.thread)
            .or_default()
            .push(Reverse(candidate));
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queues.values().all(BinaryHeap::is_empty)
    }

    /// Discard heap heads that fell behind their thread's position.
    pub fn drop_stale(&mut self, expected: impl Fn(RedoThread) -> Seq) {
        for (&thread, queue) in &mut self.queues {
            let threshold = expected(thread);
            if threshold.is_none() || threshold == Seq::ZERO {
                continue;
            }
            while queue
                .peek()
                .is_some_and(|Reverse(c)| c.sequence < threshold)
            {
                queue.pop();
            }
        }
    }

    /// Pick the thread whose head archive should be parsed next:
    ///
    /// - only heads matching the thread's expected sequence qualify
    ///   (threads with no position yet qualify with their lowest file);
    /// - among qualifying heads, the lowest known `first_scn` wins, ties
    ///   by thread number;
    /// - a head with a known `first_scn` beats one without;
    /// - all unknown: lowest `(sequence, thread)`.
    ///
    /// Heads with an unknown `first_scn` are probed once here.
    pub fn pick_next(&mut self, expected: impl Fn(RedoThread) -> Seq) -> Option<RedoThread> {
        self.probe_heads(&expected);

        let mut best: Option<(RedoThread, Scn, Seq)> = None;
        for (&thread, queue) in &self.queues {
            let Some(Reverse(head)) = queue.peek() else {
                continue;
            };
            let threshold = expected(thread);
            let positioned = !threshold.is_none() && threshold != Seq::ZERO;
            if positioned && head.sequence != threshold {
                continue; // gap or behind; handled by the caller
            }

            best = match best {
                None => Some((thread, head.first_scn, head.sequence)),
                Some((best_thread, best_scn, best_seq)) => {
                    let candidate_known = !head.first_scn.is_none();
                    let best_known = !best_scn.is_none();
                    let wins = match (candidate_known, best_known) {
                        (true, true) => {
                            head.first_scn < best_scn
                                || (head.first_scn == best_scn && thread < best_thread)
                        }
                        (true, false) => true,
                        (false, true) => false,
                        (false, false) => {
                            head.sequence < best_seq
                                || (head.sequence == best_seq && thread < best_thread)
                        }
                    };
                    if wins {
                        Some((thread, head.first_scn, head.sequence))
                    } else {
                        Some((best_thread, best_scn, best_seq))
                    }
                }
            };
        }
        best.map(|(thread, _, _)| thread)
    }

    fn probe_heads(&mut self, expected: &impl Fn(RedoThread) -> Seq) {
        for (&thread, queue) in &mut self.queues {
            let needs_probe = queue.peek().is_some_and(|Reverse(c)| {
                c.first_scn.is_none() && {
                    let threshold = expected(thread);
                    threshold.is_none() || threshold == Seq::ZERO || c.sequence == threshold
                }
            });
            if !needs_probe {
                continue;
            }
            let Some(Reverse(mut head)) = queue.pop() else {
                continue;
            };
            match Reader::probe(&head.path) {
                Ok(header) => head.first_scn = header.first_scn,
                Err(e) => {
                    debug!(path = %head.path.display(), error = %e,
                           "archive head not probeable yet");
                }
            }
            queue.push(Reverse(head));
        }
    }

    #[must_use]
    pub fn peek(&self, thread: RedoThread) -> Option<&ArchiveCandidate> {
        self.queues
            .get(&thread)
            .and_then(|q| q.peek())
            .map(|Reverse(c)| c)
    }

    pub fn pop(&mut self, thread: RedoThread) -> Option<ArchiveCandidate> {
        self.queues
            .get_mut(&thread)
            .and_then(BinaryHeap::pop)
            .map(|Reverse(c)| c)
    }

    /// Remaining heads, for gap diagnostics.
    #[must_use]
    pub fn heads(&self) -> Vec<&ArchiveCandidate> {
        self.queues
            .values()
            .filter_map(|q| q.peek())
            .map(|Reverse(c)| c)
            .collect()
    }

    pub fn clear(&mut self) {
        self.queues.clear();
    }
}

/// Sweep the recovery destination's day directories for archives.
///
/// Day directories lexicographically older than `last_checked_day` were
/// fully processed in an earlier sweep and are skipped; the newest day
/// is always re-scanned because files may still be arriving. Returns the
/// new `last_checked_day`.
pub fn sweep_recovery_dest(
    archive_root: &Path,
    format: &str,
    last_checked_day: Option<&str>,
    expected: impl Fn(RedoThread) -> Seq,
    queues: &mut ArchiveQueues,
) -> Result<Option<String>> {
    let entries = std::fs::read_dir(archive_root).map_err(|_| RedowireError::DirUnreadable {
        path: archive_root.to_path_buf(),
    })?;

    let mut newest_day: Option<String> = last_checked_day.map(str::to_owned);
    let mut days: Vec<(String, PathBuf)> = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let day = entry.file_name().to_string_lossy().into_owned();
        if last_checked_day.is_some_and(|last| day.as_str() < last) {
            continue;
        }
        days.push((day, entry.path()));
    }
    days.sort();

    for (day, day_path) in days {
        trace!(day, "scanning archive day directory");
        let entries = std::fs::read_dir(&day_path).map_err(|_| RedowireError::DirUnreadable {
            path: day_path.clone(),
        })?;
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(parsed) = sequence_from_file_name(format, &name) else {
                continue;
            };
            queues.push(
                ArchiveCandidate {
                    sequence: parsed.sequence,
                    thread: parsed.thread,
                    path: entry.path(),
                    first_scn: Scn::NONE,
                },
                expected(parsed.thread),
            );
        }
        if newest_day.as_deref().map_or(true, |n| day.as_str() > n) {
            newest_day = Some(day);
        }
    }
    Ok(newest_day)
}

/// Queue user-supplied batch paths: each is a file or a directory to
/// sweep. File names must still fit the archive format so the thread and
/// sequence are known.
pub fn sweep_batch(
    paths: &[PathBuf],
    format: &str,
    expected: impl Fn(RedoThread) -> Seq,
    queues: &mut ArchiveQueues,
) -> Result<()> {
    for path in paths {
        let meta = match std::fs::metadata(path) {
            Ok(meta) => meta,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "batch path inaccessible");
                continue;
            }
        };
        if meta.is_dir() {
            let entries = std::fs::read_dir(path).map_err(|_| RedowireError::DirUnreadable {
                path: path.clone(),
            })?;
            for entry in entries {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().into_owned();
                let Some(parsed) = sequence_from_file_name(format, &name) else {
                    continue;
                };
                queues.push(
                    ArchiveCandidate {
                        sequence: parsed.sequence,
                        thread: parsed.thread,
                        path: entry.path(),
                        first_scn: Scn::NONE,
                    },
                    expected(parsed.thread),
                );
            }
        } else {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let Some(parsed) = sequence_from_file_name(format, &name) else {
                continue;
            };
            queues.push(
                ArchiveCandidate {
                    sequence: parsed.sequence,
                    thread: parsed.thread,
                    path: path.clone(),
                    first_scn: Scn::NONE,
                },
                expected(parsed.thread),
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const FORMAT: &str = "o1_mf_%t_%s_%h_.arc";

    fn t(n: u16) -> RedoThread {
        RedoThread::new(n).unwrap()
    }

    #[test]
    fn parses_standard_names() {
        let parsed = sequence_from_file_name(FORMAT, "o1_mf_1_17_ka9x2m_.arc").unwrap();
        assert_eq!(parsed.sequence, Seq::new(17));
        assert_eq!(parsed.thread, t(1));

        let parsed = sequence_from_file_name("%t_%s_%r.dbf", "2_431_90210.dbf").unwrap();
        assert_eq!(parsed.sequence, Seq::new(431));
        assert_eq!(parsed.thread, t(2));
    }

    #[test]
    fn rejects_divergent_names() {
        assert!(sequence_from_file_name(FORMAT, "o1_mf_1_17_ka9x2m_.tmp").is_none());
        assert!(sequence_from_file_name(FORMAT, "garbage").is_none());
        assert!(sequence_from_file_name(FORMAT, "o1_mf_x_17_h_.arc").is_none());
        // Sequence zero is never a valid archive.
        assert!(sequence_from_file_name("%t_%s.arc", "1_0.arc").is_none());
    }

    proptest! {
        #[test]
        fn round_trips_rendered_names(thread in 1u16..=8, seq in 1u32..1_000_000, hash in "[0-9a-z]{6}") {
            let name = format!("o1_mf_{thread}_{seq}_{hash}_.arc");
            let parsed = sequence_from_file_name(FORMAT, &name).unwrap();
            prop_assert_eq!(parsed.sequence, Seq::new(seq));
            prop_assert_eq!(parsed.thread, RedoThread::new(thread).unwrap());
        }
    }

    fn candidate(thread: u16, seq: u32, first_scn: Scn) -> ArchiveCandidate {
        ArchiveCandidate {
            sequence: Seq::new(seq),
            thread: t(thread),
            path: PathBuf::from(format!("/arch/{thread}_{seq}.arc")),
            first_scn,
        }
    }

    #[test]
    fn push_discards_behind_position() {
        let mut queues = ArchiveQueues::default();
        queues.push(candidate(1, 3, Scn::NONE), Seq::new(5));
        assert!(queues.is_empty());
        queues.push(candidate(1, 5, Scn::NONE), Seq::new(5));
        assert!(!queues.is_empty());
    }

    #[test]
    fn pick_prefers_lowest_known_scn() {
        let mut queues = ArchiveQueues::default();
        queues.push(candidate(1, 5, Scn::new(900)), Seq::new(5));
        queues.push(candidate(2, 3, Scn::new(450)), Seq::new(3));
        let picked = queues.pick_next(|_| Seq::NONE);
        assert_eq!(picked, Some(t(2)));
    }

    #[test]
    fn pick_known_beats_unknown() {
        let mut queues = ArchiveQueues::default();
        // Nonexistent paths keep first_scn unknown through probing.
        queues.push(candidate(1, 5, Scn::NONE), Seq::new(5));
        queues.push(candidate(2, 9, Scn::new(700)), Seq::new(9));
        let picked = queues.pick_next(|thread| {
            if thread == t(1) {
                Seq::new(5)
            } else {
                Seq::new(9)
            }
        });
        assert_eq!(picked, Some(t(2)));
    }

    #[test]
    fn pick_all_unknown_falls_back_to_seq_then_thread() {
        let mut queues = ArchiveQueues::default();
        queues.push(candidate(3, 4, Scn::NONE), Seq::NONE);
        queues.push(candidate(2, 4, Scn::NONE), Seq::NONE);
        queues.push(candidate(1, 7, Scn::NONE), Seq::NONE);
        let picked = queues.pick_next(|_| Seq::NONE);
        assert_eq!(picked, Some(t(2)));
    }

    #[test]
    fn pick_skips_gapped_thread() {
        let mut queues = ArchiveQueues::default();
        // Thread 1 expects seq 5 but only has 7: a gap; thread 2 matches.
        queues.push(candidate(1, 7, Scn::NONE), Seq::new(5));
        queues.push(candidate(2, 3, Scn::NONE), Seq::new(3));
        let picked = queues.pick_next(|thread| {
            if thread == t(1) {
                Seq::new(5)
            } else {
                Seq::new(3)
            }
        });
        assert_eq!(picked, Some(t(2)));
    }

    #[test]
    fn drop_stale_trims_heads() {
        let mut queues = ArchiveQueues::default();
        queues.push(candidate(1, 4, Scn::NONE), Seq::NONE);
        queues.push(candidate(1, 5, Scn::NONE), Seq::NONE);
        queues.push(candidate(1, 6, Scn::NONE), Seq::NONE);
        queues.drop_stale(|_| Seq::new(6));
        assert_eq!(queues.peek(t(1)).unwrap().sequence, Seq::new(6));
    }

    #[test]
    fn day_sweep_skips_processed_days() {
        let dir = tempfile::tempdir().unwrap();
        for day in ["2024_03_01", "2024_03_02", "2024_03_03"] {
            let day_dir = dir.path().join(day);
            std::fs::create_dir(&day_dir).unwrap();
            std::fs::write(day_dir.join("o1_mf_1_10_abcdef_.arc"), b"").unwrap();
        }
        // A non-directory entry is ignored.
        std::fs::write(dir.path().join("stray.txt"), b"").unwrap();

        let mut queues = ArchiveQueues::default();
        let newest = sweep_recovery_dest(
            dir.path(),
            FORMAT,
            Some("2024_03_02"),
            |_| Seq::NONE,
            &mut queues,
        )
        .unwrap();
        assert_eq!(newest.as_deref(), Some("2024_03_03"));
        // Day 01 skipped; days 02 and 03 contribute one file each.
        assert_eq!(queues.heads().len(), 1);
        let mut count = 0;
        while queues.pop(t(1)).is_some() {
            count += 1;
        }
        assert_eq!(count, 2);
    }

    #[test]
    fn batch_sweep_accepts_files_and_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("more");
        std::fs::create_dir(&sub).unwrap();
        std::fs::write(dir.path().join("o1_mf_1_4_aaaaaa_.arc"), b"").unwrap();
        std::fs::write(sub.join("o1_mf_2_9_bbbbbb_.arc"), b"").unwrap();
        std::fs::write(sub.join("notredo.txt"), b"").unwrap();

        let mut queues = ArchiveQueues::default();
        sweep_batch(
            &[dir.path().join("o1_mf_1_4_aaaaaa_.arc"), sub],
            FORMAT,
            |_| Seq::NONE,
            &mut queues,
        )
        .unwrap();
        assert_eq!(queues.peek(t(1)).unwrap().sequence, Seq::new(4));
        assert_eq!(queues.peek(t(2)).unwrap().sequence, Seq::new(9));
    }
}
