//! Redo record opcodes.
//!
//! Every change vector in a redo record is tagged with a 16-bit opcode:
//! the high byte is the *layer*, the low byte the operation within that
//! layer. The engine interprets the families below; everything else is
//! carried as [`RedoOp::Unknown`] and skipped (or rejected in strict
//! mode).

use std::fmt;

/// Undo layer: before-images and transaction control.
pub const LAYER_UNDO: u8 = 5;
/// Heap-table row operations.
pub const LAYER_ROW: u8 = 10;
/// Index operations.
pub const LAYER_INDEX: u8 = 11;
/// Control layer: checkpoints and thread markers.
pub const LAYER_CONTROL: u8 = 23;
/// DDL layer.
pub const LAYER_DDL: u8 = 24;

/// A raw 16-bit redo opcode: `layer << 8 | code`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct OpCode(pub u16);

impl OpCode {
    #[inline]
    pub const fn new(layer: u8, code: u8) -> Self {
        Self(((layer as u16) << 8) | code as u16)
    }

    #[inline]
    pub const fn layer(self) -> u8 {
        (self.0 >> 8) as u8
    }

    #[inline]
    pub const fn code(self) -> u8 {
        (self.0 & 0xff) as u8
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.layer(), self.code())
    }
}

/// Interpreted redo operation families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RedoOp {
    /// 5.1 — undo data: the before-image half of a DML pair.
    UndoData,
    /// 5.2 — transaction begin.
    TxnBegin,
    /// 5.4 — transaction commit (or rollback, per record flags).
    TxnEnd,
    /// 5.6 — rollback to a previously marked savepoint.
    SavepointRollback,
    /// 5.11 — mark a savepoint.
    SavepointMark,
    /// 10.2 — insert a row piece.
    RowInsert,
    /// 10.3 — delete a row piece.
    RowDelete,
    /// 10.4 — lock a row (no data change).
    RowLock,
    /// 10.5 — update row columns.
    RowUpdate,
    /// 10.18 — continuation piece of a chained row.
    RowPiece,
    /// 10.19 — multi-row insert (direct-path style).
    MultiInsert,
    /// 11.x — index change; only used to flag indexed-column updates.
    IndexChange,
    /// 24.1 — DDL record.
    Ddl,
    /// 23.1 — checkpoint record; advances the LWN SCN without DML.
    Checkpoint,
    /// 23.2 — thread-open marker.
    ThreadOpen,
    /// Anything the engine does not interpret.
    Unknown(OpCode),
}

impl RedoOp {
    /// Classify a raw opcode.
    #[must_use]
    pub const fn classify(op: OpCode) -> Self {
        match (op.layer(), op.code()) {
            (LAYER_UNDO, 1) => Self::UndoData,
            (LAYER_UNDO, 2) => Self::TxnBegin,
            (LAYER_UNDO, 4) => Self::TxnEnd,
            (LAYER_UNDO, 6) => Self::SavepointRollback,
            (LAYER_UNDO, 11) => Self::SavepointMark,
            (LAYER_ROW, 2) => Self::RowInsert,
            (LAYER_ROW, 3) => Self::RowDelete,
            (LAYER_ROW, 4) => Self::RowLock,
            (LAYER_ROW, 5) => Self::RowUpdate,
            (LAYER_ROW, 18) => Self::RowPiece,
            (LAYER_ROW, 19) => Self::MultiInsert,
            (LAYER_INDEX, _) => Self::IndexChange,
            (LAYER_DDL, 1) => Self::Ddl,
            (LAYER_CONTROL, 1) => Self::Checkpoint,
            (LAYER_CONTROL, 2) => Self::ThreadOpen,
            _ => Self::Unknown(op),
        }
    }

    /// The raw opcode for an interpreted family (inverse of `classify`
    /// for everything except `IndexChange`, which spans a whole layer).
    #[must_use]
    pub const fn opcode(self) -> OpCode {
        match self {
            Self::UndoData => OpCode::new(LAYER_UNDO, 1),
            Self::TxnBegin => OpCode::new(LAYER_UNDO, 2),
            Self::TxnEnd => OpCode::new(LAYER_UNDO, 4),
            Self::SavepointRollback => OpCode::new(LAYER_UNDO, 6),
            Self::SavepointMark => OpCode::new(LAYER_UNDO, 11),
            Self::RowInsert => OpCode::new(LAYER_ROW, 2),
            Self::RowDelete => OpCode::new(LAYER_ROW, 3),
            Self::RowLock => OpCode::new(LAYER_ROW, 4),
            Self::RowUpdate => OpCode::new(LAYER_ROW, 5),
            Self::RowPiece => OpCode::new(LAYER_ROW, 18),
            Self::MultiInsert => OpCode::new(LAYER_ROW, 19),
            Self::IndexChange => OpCode::new(LAYER_INDEX, 1),
            Self::Ddl => OpCode::new(LAYER_DDL, 1),
            Self::Checkpoint => OpCode::new(LAYER_CONTROL, 1),
            Self::ThreadOpen => OpCode::new(LAYER_CONTROL, 2),
            Self::Unknown(op) => op,
        }
    }

    /// Whether this vector carries row data the parser joins into a
    /// logical row change.
    #[must_use]
    pub const fn is_row_data(self) -> bool {
        matches!(
            self,
            Self::UndoData
                | Self::RowInsert
                | Self::RowDelete
                | Self::RowUpdate
                | Self::RowPiece
                | Self::MultiInsert
        )
    }
}

impl fmt::Display for RedoOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown(op) => write!(f, "unknown({op})"),
            other => write!(f, "{}", other.opcode()),
        }
    }
}
