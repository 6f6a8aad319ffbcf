pub mod change;
pub mod cx;
pub mod opcode;
pub mod value;

pub use change::{ColumnImage, DdlEvent, RowChange, RowLocator, RowOpKind};
pub use cx::Cx;
pub use opcode::RedoOp;
pub use value::{ColumnType, DataPolicy, FieldValue};

use std::fmt;
use std::num::NonZeroU16;

/// A System Change Number: Oracle's global logical clock.
///
/// All ordering in the engine is by SCN. Two values are distinguished:
/// [`Scn::NONE`] (unknown, the all-ones sentinel) and [`Scn::ZERO`]
/// (before recorded history). The sentinel keeps hot-path structs `Copy`
/// and the checkpoint JSON stable; callers must check [`Scn::is_none`]
/// before comparing.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct Scn(u64);

impl Scn {
    /// Unknown SCN.
    pub const NONE: Self = Self(u64::MAX);

    /// The SCN before all history.
    pub const ZERO: Self = Self(0);

    #[inline]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == u64::MAX
    }

    /// Minimum of two SCNs where [`Scn::NONE`] acts as the identity.
    #[must_use]
    pub fn min_known(self, other: Self) -> Self {
        match (self.is_none(), other.is_none()) {
            (true, _) => other,
            (_, true) => self,
            (false, false) => {
                if self.0 <= other.0 {
                    self
                } else {
                    other
                }
            }
        }
    }

    /// Maximum of two SCNs where [`Scn::NONE`] acts as the identity.
    #[must_use]
    pub fn max_known(self, other: Self) -> Self {
        match (self.is_none(), other.is_none()) {
            (true, _) => other,
            (_, true) => self,
            (false, false) => {
                if self.0 >= other.0 {
                    self
                } else {
                    other
                }
            }
        }
    }
}

impl Default for Scn {
    /// The default SCN is unknown.
    fn default() -> Self {
        Self::NONE
    }
}

impl fmt::Display for Scn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            f.write_str("<none>")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// A per-thread redo log sequence number.
///
/// Monotone within one resetlogs generation; increases by exactly 1 across
/// log switches. [`Seq::NONE`] means "not yet known".
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct Seq(u32);

impl Seq {
    /// Unknown sequence.
    pub const NONE: Self = Self(u32::MAX);

    /// Sequence zero (before the first redo log).
    pub const ZERO: Self = Self(0);

    #[inline]
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    #[inline]
    pub const fn get(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == u32::MAX
    }

    /// The next sequence after a log switch.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl Default for Seq {
    /// The default sequence is unknown.
    fn default() -> Self {
        Self::NONE
    }
}

impl fmt::Display for Seq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            f.write_str("<none>")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// An Oracle redo thread number.
///
/// Thread numbers start at 1; in single-instance databases there is
/// exactly one thread, under RAC one per instance.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
#[repr(transparent)]
pub struct RedoThread(NonZeroU16);

impl RedoThread {
    /// Thread 1, the only thread of a single-instance database.
    pub const ONE: Self = Self(NonZeroU16::MIN);

    /// Create a thread number; returns `None` for 0.
    #[inline]
    pub const fn new(n: u16) -> Option<Self> {
        match NonZeroU16::new(n) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    #[inline]
    pub const fn get(self) -> u16 {
        self.0.get()
    }
}

impl fmt::Display for RedoThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<u16> for RedoThread {
    type Error = InvalidThread;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Self::new(value).ok_or(InvalidThread)
    }
}

/// Error returned when attempting to create a `RedoThread` from 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidThread;

impl fmt::Display for InvalidThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("redo thread number cannot be zero")
    }
}

impl std::error::Error for InvalidThread {}

/// An Oracle transaction identifier: `(undo segment, slot, wrap)`.
///
/// Unique within a database. Under RAC the undo segment number encodes the
/// owning instance, so XIDs are globally unique across redo threads.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct Xid {
    pub undo_segment: u16,
    pub slot: u16,
    pub wrap: u32,
}

impl Xid {
    #[inline]
    pub const fn new(undo_segment: u16, slot: u16, wrap: u32) -> Self {
        Self {
            undo_segment,
            slot,
            wrap,
        }
    }
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "0x{:04x}.{:03x}.{:08x}",
            self.undo_segment, self.slot, self.wrap
        )
    }
}

/// A validated redo block size: 512, 1024 or 4096 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum BlockSize {
    B512,
    B1024,
    B4096,
}

impl BlockSize {
    pub const fn new(size: u32) -> Option<Self> {
        match size {
            512 => Some(Self::B512),
            1024 => Some(Self::B1024),
            4096 => Some(Self::B4096),
            _ => None,
        }
    }

    #[inline]
    pub const fn get(self) -> u32 {
        match self {
            Self::B512 => 512,
            Self::B1024 => 1024,
            Self::B4096 => 4096,
        }
    }

    #[inline]
    pub const fn as_usize(self) -> usize {
        self.get() as usize
    }
}

impl fmt::Display for BlockSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.get())
    }
}

impl TryFrom<u32> for BlockSize {
    type Error = InvalidBlockSize;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::new(value).ok_or(InvalidBlockSize(value))
    }
}

impl From<BlockSize> for u32 {
    fn from(value: BlockSize) -> Self {
        value.get()
    }
}

/// Error returned for a block size outside {512, 1024, 4096}.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidBlockSize(pub u32);

impl fmt::Display for InvalidBlockSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid redo block size: {}", self.0)
    }
}

impl std::error::Error for InvalidBlockSize {}

/// A byte position inside a redo file.
///
/// Constructed from `(block index, block size)` and always block-aligned.
/// Strictly increases while the owning sequence is constant.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
#[repr(transparent)]
pub struct FileOffset(u64);

impl FileOffset {
    /// The start of the file.
    pub const ZERO: Self = Self(0);

    /// Offset of block `block` for the given block size.
    #[inline]
    pub const fn from_block(block: u32, block_size: BlockSize) -> Self {
        Self(block as u64 * block_size.get() as u64)
    }

    #[inline]
    pub const fn from_bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    #[inline]
    pub const fn as_bytes(self) -> u64 {
        self.0
    }

    /// The block index this offset falls in for the given block size.
    #[inline]
    pub const fn block_index(self, block_size: BlockSize) -> u32 {
        (self.0 / block_size.get() as u64) as u32
    }

    /// Whether the offset lies on a block boundary of the given size.
    #[inline]
    pub const fn is_block_aligned(self, block_size: BlockSize) -> bool {
        self.0 % block_size.get() as u64 == 0
    }
}

impl fmt::Display for FileOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The `disable-checks` bitmask: each bit turns one consistency check off.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
#[repr(transparent)]
pub struct DisableChecks(pub u32);

impl DisableChecks {
    /// Skip block checksum verification.
    pub const BLOCK_CHECKSUM: u32 = 0x01;
    /// Tolerate per-thread sequence gaps.
    pub const SEQUENCE_GAP: u32 = 0x02;
    /// Skip uninterpreted opcodes instead of raising.
    pub const STRICT_OPCODES: u32 = 0x04;

    #[inline]
    #[must_use]
    pub const fn is_set(self, bit: u32) -> bool {
        self.0 & bit != 0
    }
}

/// One member of an online redo log group: `{thread, group, path}`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct RedoLog {
    pub thread: RedoThread,
    pub group: i32,
    pub path: String,
}

impl RedoLog {
    pub fn new(thread: RedoThread, group: i32, path: impl Into<String>) -> Self {
        Self {
            thread,
            group,
            path: path.into(),
        }
    }
}

/// A database incarnation: one node in the tree of resetlogs lineages.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DbIncarnation {
    pub incarnation: u32,
    pub resetlogs: u32,
    pub resetlogs_scn: Scn,
    pub prior_incarnation: u32,
    pub current: bool,
}
