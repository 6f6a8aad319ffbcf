//! LWN (Log Write Number) group framing.
//!
//! Redo is organized in LWN groups: contiguous runs of blocks written
//! atomically by LGWR. The first block of a group carries the LWN flag in
//! its block header plus a 12-byte group header after it:
//!
//! ```text
//! Offset  Size  Field
//!  16       4   group length in blocks (the flagged block included)
//!  20       8   group SCN
//! ```
//!
//! Record bytes start at offset 28 of the first block and resume at
//! offset 16 (after the block header) in every subsequent block of the
//! group. A group must be fully present in the ring buffer before its
//! payload is parsed; it is the smallest unit of parser progress.

use std::path::Path;

use redowire_error::{RedowireError, Result};
use redowire_types::{BlockSize, Scn};

use crate::block::{read_le_u32, read_le_u64, write_le_u32, write_le_u64, BlockHeader, BLOCK_HEADER_SIZE};

/// Offset of the first record byte in the first block of a group.
pub const LWN_PAYLOAD_FIRST: usize = 28;
/// Offset of the first record byte in continuation blocks.
pub const LWN_PAYLOAD_CONT: usize = BLOCK_HEADER_SIZE;

/// The group header carried by an LWN-start block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LwnHeader {
    /// Number of blocks in the group, including the flagged one.
    pub blocks: u32,
    /// SCN assigned to the group by LGWR.
    pub scn: Scn,
}

impl LwnHeader {
    /// Parse the group header from an LWN-start block.
    pub fn from_block(block: &[u8], header: &BlockHeader, path: &Path) -> Result<Self> {
        if !header.is_lwn_start() {
            return Err(RedowireError::BadHeader {
                path: path.to_path_buf(),
                detail: format!("block {} is not an LWN start", header.block_number),
            });
        }
        let blocks = read_le_u32(block, 16);
        if blocks == 0 {
            return Err(RedowireError::BadHeader {
                path: path.to_path_buf(),
                detail: format!("LWN group at block {} has zero length", header.block_number),
            });
        }
        Ok(Self {
            blocks,
            scn: Scn::new(read_le_u64(block, 20)),
        })
    }

    /// Write the group header fields into an LWN-start block buffer.
    pub fn write_to(&self, block: &mut [u8]) {
        write_le_u32(block, 16, self.blocks);
        write_le_u64(block, 20, self.scn.get());
    }

    /// Record bytes a group of this many blocks can carry.
    #[must_use]
    pub fn payload_capacity(&self, block_size: BlockSize) -> usize {
        let bs = block_size.as_usize();
        (bs - LWN_PAYLOAD_FIRST) + (self.blocks as usize - 1) * (bs - LWN_PAYLOAD_CONT)
    }
}

/// Append the record-payload region of one group block to `out`.
pub fn append_payload(block: &[u8], first_of_group: bool, out: &mut Vec<u8>) {
    let start = if first_of_group {
        LWN_PAYLOAD_FIRST
    } else {
        LWN_PAYLOAD_CONT
    };
    out.extend_from_slice(&block[start..]);
}
