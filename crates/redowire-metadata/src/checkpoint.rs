//! Checkpoint persistence.
//!
//! One JSON document per checkpoint SCN, named
//! `<database>-chkpt-<scn>.json` under `state.path`, written atomically
//! (temp file + rename). Current documents carry a `threads` array; older
//! single-thread documents with top-level `seq`/`offset` are read
//! compatibly and promoted into a one-entry `threads` array.

use std::path::{Path, PathBuf};

use redowire_error::{RedowireError, Result};
use redowire_types::{RedoThread, Scn, Seq};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Per-thread resume position inside a checkpoint document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadCheckpoint {
    pub thread: RedoThread,
    pub seq: Seq,
    /// Byte offset of the next unparsed block.
    pub offset: u64,
    #[serde(rename = "lwn-scn")]
    pub lwn_scn: Scn,
    #[serde(rename = "first-scn")]
    pub first_scn: Scn,
    #[serde(rename = "next-scn")]
    pub next_scn: Scn,
}

/// A checkpoint document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointDoc {
    pub database: String,
    pub scn: Scn,
    pub resetlogs: u32,
    pub activation: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub threads: Vec<ThreadCheckpoint>,
    // Legacy single-thread fields; promoted into `threads` on read.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<Seq>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
}

impl CheckpointDoc {
    /// Resume positions, with legacy documents promoted to a single
    /// thread-1 entry.
    #[must_use]
    pub fn thread_positions(&self) -> Vec<ThreadCheckpoint> {
        if !self.threads.is_empty() {
            return self.threads.clone();
        }
        match (self.seq, self.offset) {
            (Some(seq), Some(offset)) => vec![ThreadCheckpoint {
                thread: RedoThread::ONE,
                seq,
                offset,
                lwn_scn: self.scn,
                first_scn: Scn::NONE,
                next_scn: Scn::NONE,
            }],
            _ => Vec::new(),
        }
    }

    /// File name of this document under the state directory.
    #[must_use]
    pub fn file_name(&self) -> String {
        checkpoint_file_name(&self.database, self.scn)
    }

    /// Write atomically into `dir` (temp file + rename).
    pub fn write(&self, dir: &Path) -> Result<PathBuf> {
        let target = dir.join(self.file_name());
        let tmp = dir.join(format!(".{}.tmp", self.file_name()));
        let text = serde_json::to_string_pretty(self).map_err(|e| {
            RedowireError::internal(format!("checkpoint serialization failed: {e}"))
        })?;
        std::fs::write(&tmp, text)?;
        std::fs::rename(&tmp, &target)?;
        debug!(path = %target.display(), scn = %self.scn, "checkpoint written");
        Ok(target)
    }

    /// Load one checkpoint document.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(|e| RedowireError::BadCheckpoint {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })
    }
}

fn checkpoint_file_name(database: &str, scn: Scn) -> String {
    format!("{database}-chkpt-{}.json", scn.get())
}

/// List the checkpoints for `database` under `dir`, sorted by SCN.
pub fn find_checkpoints(dir: &Path, database: &str) -> Result<Vec<(Scn, PathBuf)>> {
    let prefix = format!("{database}-chkpt-");
    let mut found = Vec::new();
    let entries = std::fs::read_dir(dir).map_err(|_| RedowireError::DirUnreadable {
        path: dir.to_path_buf(),
    })?;
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(rest) = name.strip_prefix(&prefix) else {
            continue;
        };
        let Some(scn_text) = rest.strip_suffix(".json") else {
            continue;
        };
        let Ok(scn) = scn_text.parse::<u64>() else {
            continue;
        };
        found.push((Scn::new(scn), entry.path()));
    }
    found.sort_by_key(|(scn, _)| *scn);
    Ok(found)
}

/// Load the newest checkpoint for `database`, if any.
pub fn load_latest(dir: &Path, database: &str) -> Result<Option<CheckpointDoc>> {
    let found = find_checkpoints(dir, database)?;
    match found.last() {
        None => Ok(None),
        Some((scn, path)) => {
            let doc = CheckpointDoc::load(path)?;
            info!(path = %path.display(), scn = %scn, "resuming from checkpoint");
            Ok(Some(doc))
        }
    }
}

/// Delete all but the newest `keep` checkpoints for `database`.
pub fn retain_newest(dir: &Path, database: &str, keep: usize) -> Result<()> {
    let found = find_checkpoints(dir, database)?;
    if found.len() <= keep {
        return Ok(());
    }
    for (scn, path) in &found[..found.len() - keep] {
        debug!(path = %path.display(), scn = %scn, "pruning old checkpoint");
        std::fs::remove_file(path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use redowire_types::FileOffset;

    fn doc(scn: u64) -> CheckpointDoc {
        CheckpointDoc {
            database: "TEST".to_owned(),
            scn: Scn::new(scn),
            resetlogs: 90211,
            activation: 7,
            threads: vec![
                ThreadCheckpoint {
                    thread: RedoThread::ONE,
                    seq: Seq::new(5),
                    offset: FileOffset::from_bytes(1536).as_bytes(),
                    lwn_scn: Scn::new(scn),
                    first_scn: Scn::new(scn - 100),
                    next_scn: Scn::NONE,
                },
                ThreadCheckpoint {
                    thread: RedoThread::new(2).unwrap(),
                    seq: Seq::new(3),
                    offset: 512,
                    lwn_scn: Scn::new(scn - 5),
                    first_scn: Scn::new(scn - 200),
                    next_scn: Scn::NONE,
                },
            ],
            seq: None,
            offset: None,
        }
    }

    #[test]
    fn write_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let doc = doc(5000);
        let path = doc.write(dir.path()).unwrap();
        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            "TEST-chkpt-5000.json"
        );
        let loaded = CheckpointDoc::load(&path).unwrap();
        assert_eq!(loaded, doc);
        assert_eq!(loaded.thread_positions().len(), 2);
    }

    #[test]
    fn legacy_single_thread_is_promoted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("TEST-chkpt-900.json");
        std::fs::write(
            &path,
            r#"{"database":"TEST","scn":900,"resetlogs":1,"activation":2,"seq":4,"offset":1024}"#,
        )
        .unwrap();
        let doc = CheckpointDoc::load(&path).unwrap();
        let threads = doc.thread_positions();
        assert_eq!(threads.len(), 1);
        assert_eq!(threads[0].thread, RedoThread::ONE);
        assert_eq!(threads[0].seq, Seq::new(4));
        assert_eq!(threads[0].offset, 1024);
        assert_eq!(threads[0].lwn_scn, Scn::new(900));
    }

    #[test]
    fn latest_wins() {
        let dir = tempfile::tempdir().unwrap();
        doc(100).write(dir.path()).unwrap();
        doc(300).write(dir.path()).unwrap();
        doc(200).write(dir.path()).unwrap();
        let latest = load_latest(dir.path(), "TEST").unwrap().unwrap();
        assert_eq!(latest.scn, Scn::new(300));
        // Other databases' checkpoints are invisible.
        assert!(load_latest(dir.path(), "OTHER").unwrap().is_none());
    }

    #[test]
    fn retention_keeps_newest() {
        let dir = tempfile::tempdir().unwrap();
        for scn in [100, 200, 300, 400] {
            doc(scn).write(dir.path()).unwrap();
        }
        retain_newest(dir.path(), "TEST", 2).unwrap();
        let left = find_checkpoints(dir.path(), "TEST").unwrap();
        let scns: Vec<_> = left.iter().map(|(s, _)| s.get()).collect();
        assert_eq!(scns, vec![300, 400]);
    }

    #[test]
    fn malformed_document_is_bad_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("TEST-chkpt-1.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            CheckpointDoc::load(&path),
            Err(RedowireError::BadCheckpoint { .. })
        ));
    }

    #[test]
    fn no_temp_file_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        doc(100).write(dir.path()).unwrap();
        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["TEST-chkpt-100.json"]);
    }
}
