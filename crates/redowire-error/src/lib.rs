use std::path::PathBuf;

use redowire_types::value::ValueError;
use redowire_types::{FileOffset, RedoThread, Scn, Seq};
use thiserror::Error;

/// Primary error type for Redowire operations.
///
/// Variants fall into five classes that drive the engine's behaviour:
/// *boot* errors retry under failsafe, *transient* errors retry with a
/// bounded backoff, everything else is fatal for the run. The class is
/// queried through [`RedowireError::is_boot`], [`RedowireError::is_transient`]
/// and [`RedowireError::is_fatal`].
#[derive(Error, Debug)]
pub enum RedowireError {
    // === Boot errors: the environment is not ready ===
    /// The schema seed is missing and schemaless mode is off.
    #[error("schema file missing for database '{database}'")]
    SchemaMissing { database: String },

    /// The starting sequence could not be determined.
    #[error("starting sequence is unknown")]
    StartSequenceUnknown,

    /// The configured resetlogs id matches no known incarnation.
    #[error("resetlogs {resetlogs} not found in incarnation list")]
    UnknownResetlogs { resetlogs: u32 },

    /// No member of an online redo log group could be read.
    #[error("can't read any member of group {group}")]
    GroupUnreadable { group: i32 },

    /// The archive log location is not configured for offline mode.
    #[error("missing location of archived redo logs for offline mode")]
    ArchiveDestMissing,

    // === I/O ===
    /// File I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A directory could not be listed.
    #[error("directory '{path}' can't be read")]
    DirUnreadable { path: PathBuf },

    /// An archive did not become readable within the configured retries.
    #[error("file '{path}' failed to open after {tries} tries")]
    ArchiveOpenExhausted { path: PathBuf, tries: u32 },

    // === Redo log content errors ===
    /// The file header failed validation.
    #[error("bad redo header in '{path}': {detail}")]
    BadHeader { path: PathBuf, detail: String },

    /// A block checksum did not match.
    #[error("checksum mismatch in '{path}' block {block}: stored {stored:#06x}, computed {computed:#06x}")]
    BadChecksum {
        path: PathBuf,
        block: u32,
        stored: u16,
        computed: u16,
    },

    /// The file carries an unexpected sequence number.
    #[error("wrong sequence in '{path}': found {found}, expected {expected}")]
    WrongSequence {
        path: PathBuf,
        found: Seq,
        expected: Seq,
    },

    /// A per-thread sequence gap was detected.
    #[error("redo log gap for thread {thread}: expected seq {expected}, found {found}")]
    SequenceGap {
        thread: RedoThread,
        expected: Seq,
        found: Seq,
    },

    /// Malformed redo content (truncated LWN, bad vector, impossible state).
    #[error("malformed redo at seq {sequence} offset {offset}: {detail}")]
    RedoCorrupt {
        sequence: Seq,
        offset: FileOffset,
        detail: String,
    },

    /// An opcode the engine does not interpret, in strict mode.
    #[error("unknown redo opcode {opcode} at scn {scn}")]
    UnknownOpcode { opcode: String, scn: Scn },

    /// A reader surfaced a fatal status code.
    #[error("redo log processing returned: {status}")]
    ReaderFailed { status: String },

    // === Data errors: corrupt user data ===
    /// A column value failed to decode under the strict data policy.
    #[error("bad column value for {owner}.{table}: {source}")]
    BadValue {
        owner: String,
        table: String,
        source: ValueError,
    },

    // === Runtime errors ===
    /// The transaction arena is exhausted beyond `memory.max-mb`.
    #[error("memory exhausted: {used_mb} MB in use, limit {max_mb} MB — increase memory.max-mb")]
    MemoryExhausted { used_mb: u64, max_mb: u64 },

    /// Checkpoint document could not be parsed.
    #[error("bad checkpoint document '{path}': {detail}")]
    BadCheckpoint { path: PathBuf, detail: String },

    /// Config document invalid.
    #[error("bad config: {detail}")]
    BadConfig { detail: String },

    /// Internal invariant violation (should never happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl RedowireError {
    /// Boot-class errors: the environment is not ready yet. Under
    /// `boot-failsafe` the replicator retries instead of terminating.
    #[must_use]
    pub const fn is_boot(&self) -> bool {
        matches!(
            self,
            Self::SchemaMissing { .. }
                | Self::StartSequenceUnknown
                | Self::UnknownResetlogs { .. }
                | Self::GroupUnreadable { .. }
                | Self::ArchiveDestMissing
        )
    }

    /// Transient errors that may succeed on retry within the run.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ArchiveOpenExhausted { .. } | Self::DirUnreadable { .. }
        )
    }

    /// Whether this error terminates the run.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        !self.is_boot() && !self.is_transient()
    }

    /// Process exit code for the CLI.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::SchemaMissing { .. }
            | Self::StartSequenceUnknown
            | Self::UnknownResetlogs { .. }
            | Self::GroupUnreadable { .. }
            | Self::ArchiveDestMissing => 2,
            Self::Io(_) | Self::DirUnreadable { .. } | Self::ArchiveOpenExhausted { .. } => 3,
            Self::BadHeader { .. }
            | Self::BadChecksum { .. }
            | Self::WrongSequence { .. }
            | Self::SequenceGap { .. }
            | Self::RedoCorrupt { .. }
            | Self::UnknownOpcode { .. }
            | Self::ReaderFailed { .. } => 4,
            Self::BadValue { .. } => 5,
            Self::MemoryExhausted { .. }
            | Self::BadCheckpoint { .. }
            | Self::BadConfig { .. }
            | Self::Internal(_) => 1,
        }
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

/// Result type alias using `RedowireError`.
pub type Result<T> = std::result::Result<T, RedowireError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_formats() {
        let err = RedowireError::SchemaMissing {
            database: "ORCL".to_owned(),
        };
        assert_eq!(err.to_string(), "schema file missing for database 'ORCL'");

        let err = RedowireError::BadChecksum {
            path: PathBuf::from("/redo/o1.log"),
            block: 12,
            stored: 0xbeef,
            computed: 0xdead,
        };
        assert_eq!(
            err.to_string(),
            "checksum mismatch in '/redo/o1.log' block 12: stored 0xbeef, computed 0xdead"
        );

        let err = RedowireError::SequenceGap {
            thread: RedoThread::ONE,
            expected: Seq::new(5),
            found: Seq::new(7),
        };
        assert_eq!(
            err.to_string(),
            "redo log gap for thread 1: expected seq 5, found 7"
        );
    }

    #[test]
    fn classification() {
        assert!(RedowireError::SchemaMissing {
            database: String::new()
        }
        .is_boot());
        assert!(RedowireError::StartSequenceUnknown.is_boot());
        assert!(!RedowireError::StartSequenceUnknown.is_fatal());

        assert!(RedowireError::ArchiveOpenExhausted {
            path: PathBuf::new(),
            tries: 3
        }
        .is_transient());

        assert!(RedowireError::MemoryExhausted {
            used_mb: 1024,
            max_mb: 1024
        }
        .is_fatal());
        assert!(RedowireError::internal("bug").is_fatal());
    }

    #[test]
    fn exit_codes() {
        assert_eq!(RedowireError::StartSequenceUnknown.exit_code(), 2);
        assert_eq!(
            RedowireError::RedoCorrupt {
                sequence: Seq::new(1),
                offset: FileOffset::ZERO,
                detail: String::new()
            }
            .exit_code(),
            4
        );
        assert_eq!(RedowireError::internal("x").exit_code(), 1);
    }

    #[test]
    fn io_error_from() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: RedowireError = io.into();
        assert!(matches!(err, RedowireError::Io(_)));
        assert_eq!(err.exit_code(), 3);
    }
}
