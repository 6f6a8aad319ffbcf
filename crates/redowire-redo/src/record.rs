//! Redo record and change-vector codec.
//!
//! Records live inside the payload of an LWN group (see [`crate::lwn`]).
//! Each record is length-prefixed:
//!
//! ```text
//! Offset  Size  Field
//!   0       4   total record length, header included (0 terminates the
//!               group payload)
//!   4       1   layer of the primary operation
//!   5       1   opcode within the layer
//!   6       2   record flags (bit 0: rollback on 5.4, bit 1: shutdown
//!               marker transaction)
//!   8       4   low 32 bits of the record SCN; the full SCN is
//!               reconstructed against the group SCN base
//! ```
//!
//! A record carries zero or more change vectors:
//!
//! ```text
//! Offset  Size  Field
//!   0       2   vector opcode (layer << 8 | code)
//!   2       2   vector flags
//!   4       4   data object id
//!   8       4   row block address
//!  12       2   row slot
//!  14       2   column count
//!  16       2   XID undo segment
//!  18       2   XID slot
//!  20       4   XID wrap
//! ```
//!
//! followed by `column count` images, each `index u16, length u16, bytes`
//! (length 0xFFFF encodes NULL and carries no bytes).

use redowire_error::{RedowireError, Result};
use redowire_types::opcode::OpCode;
use redowire_types::{ColumnImage, FileOffset, RedoOp, RowLocator, Scn, Seq, Xid};

use crate::block::{read_le_u16, read_le_u32, write_le_u16, write_le_u32};

/// Size of the record header.
pub const RECORD_HEADER_SIZE: usize = 12;
/// Size of a change-vector header.
pub const VECTOR_HEADER_SIZE: usize = 24;
/// Column length encoding NULL.
pub const COLUMN_NULL: u16 = 0xFFFF;
/// Pseudo column index delimiting rows inside a multi-row insert vector;
/// its 2-byte payload is the slot of the row that follows.
pub const COLUMN_ROW_DELIMITER: u16 = 0xFFFE;
/// Record flag: the 5.4 vector ends the transaction with a rollback.
pub const RECORD_FLAG_ROLLBACK: u16 = 0x0001;
/// Record flag: committing this transaction requests an engine shutdown.
pub const RECORD_FLAG_SHUTDOWN: u16 = 0x0002;

/// Parsed record header with the SCN already reconstructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub length: u32,
    pub opcode: OpCode,
    pub flags: u16,
    pub scn: Scn,
}

impl RecordHeader {
    #[inline]
    #[must_use]
    pub const fn is_rollback(&self) -> bool {
        self.flags & RECORD_FLAG_ROLLBACK != 0
    }

    #[inline]
    #[must_use]
    pub const fn is_shutdown_marker(&self) -> bool {
        self.flags & RECORD_FLAG_SHUTDOWN != 0
    }
}

/// One decoded change vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeVector {
    pub op: RedoOp,
    pub raw: OpCode,
    pub flags: u16,
    pub locator: RowLocator,
    pub xid: Xid,
    pub columns: Vec<ColumnImage>,
}

/// A decoded redo record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub header: RecordHeader,
    pub vectors: Vec<ChangeVector>,
}

/// Reconstruct a full record SCN from its low 32 bits and the SCN of the
/// enclosing LWN group. Records never precede their group, so a smaller
/// low word means the high word carried.
#[must_use]
pub fn reconstruct_scn(group_scn: Scn, low: u32) -> Scn {
    let base = group_scn.get() & 0xFFFF_FFFF_0000_0000;
    let mut full = base | u64::from(low);
    if full < group_scn.get() {
        full += 1 << 32;
    }
    Scn::new(full)
}

/// Parse one record from the group payload at `at`.
///
/// Returns the record and the offset just past it, or `None` at the
/// zero-length terminator / end of payload. `sequence` and `offset`
/// locate errors in the file.
pub fn parse_record(
    payload: &[u8],
    at: usize,
    group_scn: Scn,
    sequence: Seq,
    offset: FileOffset,
) -> Result<Option<(Record, usize)>> {
    let corrupt = |detail: String| RedowireError::RedoCorrupt {
        sequence,
        offset,
        detail,
    };

    if at + RECORD_HEADER_SIZE > payload.len() {
        return Ok(None);
    }
    let length = read_le_u32(payload, at) as usize;
    if length == 0 {
        return Ok(None);
    }
    if length < RECORD_HEADER_SIZE {
        return Err(corrupt(format!("record length {length} below header size")));
    }
    if at + length > payload.len() {
        return Err(corrupt(format!(
            "record of {length} bytes overruns group payload ({} left)",
            payload.len() - at
        )));
    }

    let opcode = OpCode::new(payload[at + 4], payload[at + 5]);
    let flags = read_le_u16(payload, at + 6);
    let scn = reconstruct_scn(group_scn, read_le_u32(payload, at + 8));
    let header = RecordHeader {
        length: length as u32,
        opcode,
        flags,
        scn,
    };

    let mut vectors = Vec::new();
    let mut cursor = at + RECORD_HEADER_SIZE;
    let end = at + length;
    while cursor < end {
        let (vector, next) = parse_vector(payload, cursor, end, &corrupt)?;
        vectors.push(vector);
        cursor = next;
    }

    Ok(Some((Record { header, vectors }, end)))
}

fn parse_vector(
    payload: &[u8],
    at: usize,
    end: usize,
    corrupt: &impl Fn(String) -> RedowireError,
) -> Result<(ChangeVector, usize)> {
    if at + VECTOR_HEADER_SIZE > end {
        return Err(corrupt(format!(
            "change vector header overruns record ({} bytes left)",
            end - at
        )));
    }
    let raw = OpCode(read_le_u16(payload, at));
    let flags = read_le_u16(payload, at + 2);
    let locator = RowLocator {
        obj: read_le_u32(payload, at + 4),
        block: read_le_u32(payload, at + 8),
        slot: read_le_u16(payload, at + 12),
    };
    let column_count = read_le_u16(payload, at + 14);
    let xid = Xid::new(
        read_le_u16(payload, at + 16),
        read_le_u16(payload, at + 18),
        read_le_u32(payload, at + 20),
    );

    let mut columns = Vec::with_capacity(column_count as usize);
    let mut cursor = at + VECTOR_HEADER_SIZE;
    for _ in 0..column_count {
        if cursor + 4 > end {
            return Err(corrupt("column image overruns record".to_owned()));
        }
        let index = read_le_u16(payload, cursor);
        let len = read_le_u16(payload, cursor + 2);
        cursor += 4;
        let data = if len == COLUMN_NULL {
            None
        } else {
            let len = len as usize;
            if cursor + len > end {
                return Err(corrupt(format!("column of {len} bytes overruns record")));
            }
            let bytes = payload[cursor..cursor + len].to_vec();
            cursor += len;
            Some(bytes)
        };
        columns.push(ColumnImage { index, data });
    }

    Ok((
        ChangeVector {
            op: RedoOp::classify(raw),
            raw,
            flags,
            locator,
            xid,
            columns,
        },
        cursor,
    ))
}

/// Builder-side encoding of a change vector (fixtures and round-trip
/// tests; the engine itself never writes redo).
#[derive(Debug, Clone)]
pub struct VectorSpec {
    pub op: OpCode,
    pub flags: u16,
    pub locator: RowLocator,
    pub xid: Xid,
    pub columns: Vec<ColumnImage>,
}

impl VectorSpec {
    #[must_use]
    pub fn new(op: RedoOp, locator: RowLocator, xid: Xid) -> Self {
        Self {
            op: op.opcode(),
            flags: 0,
            locator,
            xid,
            columns: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_columns(mut self, columns: Vec<ColumnImage>) -> Self {
        self.columns = columns;
        self
    }

    fn encoded_len(&self) -> usize {
        VECTOR_HEADER_SIZE
            + self
                .columns
                .iter()
                .map(|c| 4 + c.data.as_ref().map_or(0, Vec::len))
                .sum::<usize>()
    }
}

/// Encode one record. `scn` must lie within 2^32 of the group SCN it will
/// be written under.
#[must_use]
pub fn encode_record(opcode: OpCode, flags: u16, scn: Scn, vectors: &[VectorSpec]) -> Vec<u8> {
    let length = RECORD_HEADER_SIZE + vectors.iter().map(VectorSpec::encoded_len).sum::<usize>();
    let mut out = vec![0u8; length];
    write_le_u32(&mut out, 0, length as u32);
    out[4] = opcode.layer();
    out[5] = opcode.code();
    write_le_u16(&mut out, 6, flags);
    write_le_u32(&mut out, 8, (scn.get() & 0xFFFF_FFFF) as u32);

    let mut cursor = RECORD_HEADER_SIZE;
    for vector in vectors {
        write_le_u16(&mut out, cursor, vector.op.0);
        write_le_u16(&mut out, cursor + 2, vector.flags);
        write_le_u32(&mut out, cursor + 4, vector.locator.obj);
        write_le_u32(&mut out, cursor + 8, vector.locator.block);
        write_le_u16(&mut out, cursor + 12, vector.locator.slot);
        write_le_u16(&mut out, cursor + 14, vector.columns.len() as u16);
        write_le_u16(&mut out, cursor + 16, vector.xid.undo_segment);
        write_le_u16(&mut out, cursor + 18, vector.xid.slot);
        write_le_u32(&mut out, cursor + 20, vector.xid.wrap);
        cursor += VECTOR_HEADER_SIZE;
        for column in &vector.columns {
            write_le_u16(&mut out, cursor, column.index);
            match &column.data {
                None => write_le_u16(&mut out, cursor + 2, COLUMN_NULL),
                Some(bytes) => {
                    write_le_u16(&mut out, cursor + 2, bytes.len() as u16);
                    out[cursor + 4..cursor + 4 + bytes.len()].copy_from_slice(bytes);
                    cursor += bytes.len();
                }
            }
            cursor += 4;
        }
    }
    out
}
