//! Logical row-change model.
//!
//! The parser joins physical change vectors (undo + redo halves) into the
//! logical [`RowChange`] values stored in the transaction buffer and
//! eventually handed to the builder.

use crate::{Scn, Xid};

/// Identifies one physical row: `(data object id, block, slot)`.
///
/// The undo and redo halves of a DML operation are joined on this key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RowLocator {
    pub obj: u32,
    pub block: u32,
    pub slot: u16,
}

/// One column image inside a change vector: position plus raw on-disk
/// bytes (`None` encodes SQL NULL).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnImage {
    pub index: u16,
    pub data: Option<Vec<u8>>,
}

impl ColumnImage {
    #[must_use]
    pub fn new(index: u16, data: Option<Vec<u8>>) -> Self {
        Self { index, data }
    }
}

/// The kind of a logical row operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RowOpKind {
    Insert,
    Update,
    Delete,
}

impl RowOpKind {
    /// The single-letter op tag used in the output stream.
    #[must_use]
    pub const fn tag(self) -> char {
        match self {
            Self::Insert => 'c',
            Self::Update => 'u',
            Self::Delete => 'd',
        }
    }
}

/// A complete logical row change, ready to be appended to its transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowChange {
    pub kind: RowOpKind,
    pub locator: RowLocator,
    pub scn: Scn,
    pub xid: Xid,
    /// Set when an accompanying index vector shows the change touched an
    /// indexed column.
    pub indexed_change: bool,
    pub before: Vec<ColumnImage>,
    pub after: Vec<ColumnImage>,
}

/// A DDL record observed in redo. Only used to invalidate or annotate the
/// tracked schema; DDL is not part of the output stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DdlEvent {
    pub scn: Scn,
    pub xid: Xid,
    pub owner: String,
    pub object_name: String,
    pub op_type: u16,
}
