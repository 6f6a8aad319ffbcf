//! Encoding of row changes into arena chunk storage.
//!
//! Layout of one encoded change:
//!
//! ```text
//! Offset  Size  Field
//!   0       1   op kind (0 insert, 1 update, 2 delete)
//!   1       1   flags (bit 0: indexed-column change)
//!   2       2   before-image column count
//!   4       2   after-image column count
//!   6       2   row slot
//!   8       4   data object id
//!  12       4   row block address
//!  16       8   record SCN
//!  24       2   XID undo segment
//!  26       2   XID slot
//!  28       4   XID wrap
//! ```
//!
//! followed by the before images then the after images, each
//! `index u16, length u16, bytes` with length 0xFFFF encoding NULL.

use redowire_error::{RedowireError, Result};
use redowire_types::{ColumnImage, RowChange, RowLocator, RowOpKind, Scn, Xid};

const HEADER_SIZE: usize = 32;
const LEN_NULL: u16 = 0xFFFF;
const FLAG_INDEXED: u8 = 0x01;

/// Encode a change, appending to `out`.
pub fn encode_change(change: &RowChange, out: &mut Vec<u8>) -> Result<()> {
    let kind = match change.kind {
        RowOpKind::Insert => 0u8,
        RowOpKind::Update => 1,
        RowOpKind::Delete => 2,
    };
    out.push(kind);
    out.push(if change.indexed_change { FLAG_INDEXED } else { 0 });
    out.extend_from_slice(&(columns_len(&change.before)?).to_le_bytes());
    out.extend_from_slice(&(columns_len(&change.after)?).to_le_bytes());
    out.extend_from_slice(&change.locator.slot.to_le_bytes());
    out.extend_from_slice(&change.locator.obj.to_le_bytes());
    out.extend_from_slice(&change.locator.block.to_le_bytes());
    out.extend_from_slice(&change.scn.get().to_le_bytes());
    out.extend_from_slice(&change.xid.undo_segment.to_le_bytes());
    out.extend_from_slice(&change.xid.slot.to_le_bytes());
    out.extend_from_slice(&change.xid.wrap.to_le_bytes());
    for image in change.before.iter().chain(&change.after) {
        out.extend_from_slice(&image.index.to_le_bytes());
        match &image.data {
            None => out.extend_from_slice(&LEN_NULL.to_le_bytes()),
            Some(bytes) => {
                out.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
                out.extend_from_slice(bytes);
            }
        }
    }
    Ok(())
}

fn columns_len(columns: &[ColumnImage]) -> Result<u16> {
    u16::try_from(columns.len())
        .map_err(|_| RedowireError::internal("row change with more than 65535 columns"))
}

/// Decode a change previously written by [`encode_change`].
pub fn decode_change(buf: &[u8]) -> Result<RowChange> {
    let corrupt = || RedowireError::internal("corrupt encoded row change");
    if buf.len() < HEADER_SIZE {
        return Err(corrupt());
    }
    let kind = match buf[0] {
        0 => RowOpKind::Insert,
        1 => RowOpKind::Update,
        2 => RowOpKind::Delete,
        _ => return Err(corrupt()),
    };
    let indexed_change = buf[1] & FLAG_INDEXED != 0;
    let n_before = u16::from_le_bytes([buf[2], buf[3]]) as usize;
    let n_after = u16::from_le_bytes([buf[4], buf[5]]) as usize;
    let slot = u16::from_le_bytes([buf[6], buf[7]]);
    let obj = u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]);
    let block = u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]);
    let mut scn_bytes = [0u8; 8];
    scn_bytes.copy_from_slice(&buf[16..24]);
    let scn = Scn::new(u64::from_le_bytes(scn_bytes));
    let xid = Xid::new(
        u16::from_le_bytes([buf[24], buf[25]]),
        u16::from_le_bytes([buf[26], buf[27]]),
        u32::from_le_bytes([buf[28], buf[29], buf[30], buf[31]]),
    );

    let mut cursor = HEADER_SIZE;
    let mut read_images = |count: usize| -> Result<Vec<ColumnImage>> {
        let mut images = Vec::with_capacity(count);
        for _ in 0..count {
            if cursor + 4 > buf.len() {
                return Err(corrupt());
            }
            let index = u16::from_le_bytes([buf[cursor], buf[cursor + 1]]);
            let len = u16::from_le_bytes([buf[cursor + 2], buf[cursor + 3]]);
            cursor += 4;
            let data = if len == LEN_NULL {
                None
            } else {
                let len = len as usize;
                if cursor + len > buf.len() {
                    return Err(corrupt());
                }
                let bytes = buf[cursor..cursor + len].to_vec();
                cursor += len;
                Some(bytes)
            };
            images.push(ColumnImage { index, data });
        }
        Ok(images)
    };
    let before = read_images(n_before)?;
    let after = read_images(n_after)?;

    Ok(RowChange {
        kind,
        locator: RowLocator { obj, block, slot },
        scn,
        xid,
        indexed_change,
        before,
        after,
    })
}

/// Encoded size of a change, for chunk-fit checks before writing.
#[must_use]
pub fn encoded_len(change: &RowChange) -> usize {
    HEADER_SIZE
        + change
            .before
            .iter()
            .chain(&change.after)
            .map(|c| 4 + c.data.as_ref().map_or(0, Vec::len))
            .sum::<usize>()
}
