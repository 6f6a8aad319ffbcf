//! Redo block and file-header codecs.
//!
//! A redo file is a sequence of fixed-size blocks (512, 1024 or 4096
//! bytes). Every block starts with a 16-byte header:
//!
//! ```text
//! Offset  Size  Field
//!   0       1   signature (0x01)
//!   1       1   block class (0x22 for redo data)
//!   2       2   (reserved)
//!   4       4   block number within the file
//!   8       4   sequence number of the owning redo log
//!  12       2   checksum: XOR of all 16-bit LE words of the block,
//!               computed with the checksum field itself zeroed
//!  14       2   flags — bit 0 set on the first block of an LWN group
//! ```
//!
//! Block 0 additionally carries the file header:
//!
//! ```text
//! Offset  Size  Field
//!  16       4   magic 0x7A7B7C7D
//!  20       1   compatibility version byte
//!  21       1   (reserved)
//!  22       2   block size (512/1024/4096)
//!  24       4   number of blocks (excluding block 0)
//!  28       2   redo thread number
//!  30       2   (reserved)
//!  32       4   sequence
//!  36       8   firstScn
//!  44       8   nextScn (all-ones while the log is open)
//!  52       4   resetlogs id
//!  56       8   resetlogs scn
//!  64       4   activation id
//!  68      64   description (NUL-padded ASCII)
//! 132       2   end-of-log marker (non-zero once LGWR sealed the file)
//! ```

use std::path::Path;

use redowire_error::{RedowireError, Result};
use redowire_types::{BlockSize, RedoThread, Scn, Seq};

/// Size of the per-block header.
pub const BLOCK_HEADER_SIZE: usize = 16;
/// Every block starts with this signature byte.
pub const BLOCK_SIGNATURE: u8 = 0x01;
/// Block class of redo data blocks.
pub const BLOCK_CLASS_REDO: u8 = 0x22;
/// File magic in block 0.
pub const FILE_MAGIC: u32 = 0x7A7B_7C7D;
/// Compatibility version this engine reads.
pub const COMPAT_VERSION: u8 = 0x13;
/// Block flag: first block of an LWN group.
pub const FLAG_LWN_START: u16 = 0x0001;
/// Smallest block 0 prefix carrying the complete file header.
pub const FILE_HEADER_SIZE: usize = 134;

const CHECKSUM_OFFSET: usize = 12;

/// The 16-byte header present on every redo block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub block_number: u32,
    pub sequence: u32,
    pub checksum: u16,
    pub flags: u16,
}

impl BlockHeader {
    /// Whether this block opens an LWN group.
    #[inline]
    #[must_use]
    pub const fn is_lwn_start(&self) -> bool {
        self.flags & FLAG_LWN_START != 0
    }

    /// Parse the header of one block. Only the fixed fields are checked
    /// here; checksum verification is separate (it needs the whole block).
    pub fn from_block(buf: &[u8], path: &Path) -> Result<Self> {
        if buf.len() < BLOCK_HEADER_SIZE {
            return Err(bad_header(path, format!("block too small: {}", buf.len())));
        }
        if buf[0] != BLOCK_SIGNATURE {
            return Err(bad_header(
                path,
                format!("bad block signature: {:#04x}", buf[0]),
            ));
        }
        if buf[1] != BLOCK_CLASS_REDO {
            return Err(bad_header(path, format!("bad block class: {:#04x}", buf[1])));
        }
        Ok(Self {
            block_number: read_le_u32(buf, 4),
            sequence: read_le_u32(buf, 8),
            checksum: read_le_u16(buf, CHECKSUM_OFFSET),
            flags: read_le_u16(buf, 14),
        })
    }

    /// Write this header into the first 16 bytes of `buf`. The checksum
    /// field is left zeroed; call [`seal_block`] once the payload is in
    /// place.
    pub fn write_to(&self, buf: &mut [u8]) {
        buf[0] = BLOCK_SIGNATURE;
        buf[1] = BLOCK_CLASS_REDO;
        buf[2] = 0;
        buf[3] = 0;
        write_le_u32(buf, 4, self.block_number);
        write_le_u32(buf, 8, self.sequence);
        write_le_u16(buf, CHECKSUM_OFFSET, 0);
        write_le_u16(buf, 14, self.flags);
    }
}

/// XOR of all 16-bit LE words of the block, with the checksum field
/// itself treated as zero.
#[must_use]
pub fn block_checksum(block: &[u8]) -> u16 {
    let mut acc: u16 = 0;
    for pair in block.chunks_exact(2) {
        acc ^= u16::from_le_bytes([pair[0], pair[1]]);
    }
    // XOR out whatever is stored in the checksum field.
    acc ^ read_le_u16(block, CHECKSUM_OFFSET)
}

/// Compute and store the checksum of a fully assembled block.
pub fn seal_block(block: &mut [u8]) {
    write_le_u16(block, CHECKSUM_OFFSET, 0);
    let sum = block_checksum(block);
    write_le_u16(block, CHECKSUM_OFFSET, sum);
}

/// Verify a block's stored checksum.
pub fn verify_block_checksum(block: &[u8], block_number: u32, path: &Path) -> Result<()> {
    let stored = read_le_u16(block, CHECKSUM_OFFSET);
    let computed = block_checksum(block);
    if stored != computed {
        return Err(RedowireError::BadChecksum {
            path: path.to_path_buf(),
            block: block_number,
            stored,
            computed,
        });
    }
    Ok(())
}

/// Parsed file header from block 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedoFileHeader {
    pub block_size: BlockSize,
    /// Number of data blocks, excluding block 0.
    pub num_blocks: u32,
    pub thread: RedoThread,
    pub sequence: Seq,
    pub first_scn: Scn,
    pub next_scn: Scn,
    pub resetlogs: u32,
    pub resetlogs_scn: Scn,
    pub activation: u32,
    pub description: String,
    pub end_of_log: bool,
    pub compat: u8,
}

impl RedoFileHeader {
    /// Byte length of the file described by this header.
    #[inline]
    #[must_use]
    pub fn file_end(&self) -> u64 {
        (1 + u64::from(self.num_blocks)) * u64::from(self.block_size.get())
    }

    /// Parse block 0. `buf` must hold at least [`FILE_HEADER_SIZE`] bytes;
    /// checksum verification is the caller's concern (it needs the whole
    /// block).
    pub fn from_block(buf: &[u8], path: &Path) -> Result<Self> {
        if buf.len() < FILE_HEADER_SIZE {
            return Err(bad_header(
                path,
                format!("short file header: {} bytes", buf.len()),
            ));
        }
        let header = BlockHeader::from_block(buf, path)?;
        if header.block_number != 0 {
            return Err(bad_header(
                path,
                format!("file header not in block 0 (got {})", header.block_number),
            ));
        }
        let magic = read_le_u32(buf, 16);
        if magic != FILE_MAGIC {
            return Err(bad_header(path, format!("bad magic: {magic:#010x}")));
        }
        let compat = buf[20];
        if compat != COMPAT_VERSION {
            return Err(bad_header(
                path,
                format!("unsupported compatibility version: {compat:#04x}"),
            ));
        }
        let raw_block_size = u32::from(read_le_u16(buf, 22));
        let block_size = BlockSize::new(raw_block_size)
            .ok_or_else(|| bad_header(path, format!("bad block size: {raw_block_size}")))?;
        let thread = RedoThread::new(read_le_u16(buf, 28))
            .ok_or_else(|| bad_header(path, "thread number is zero".to_owned()))?;
        let sequence = Seq::new(read_le_u32(buf, 32));
        if sequence != Seq::new(header.sequence) {
            return Err(bad_header(
                path,
                format!(
                    "file header sequence {} disagrees with block header {}",
                    sequence, header.sequence
                ),
            ));
        }
        let description = buf[68..132]
            .split(|&b| b == 0)
            .next()
            .map(|s| String::from_utf8_lossy(s).into_owned())
            .unwrap_or_default();
        Ok(Self {
            block_size,
            num_blocks: read_le_u32(buf, 24),
            thread,
            sequence,
            first_scn: Scn::new(read_le_u64(buf, 36)),
            next_scn: Scn::new(read_le_u64(buf, 44)),
            resetlogs: read_le_u32(buf, 52),
            resetlogs_scn: Scn::new(read_le_u64(buf, 56)),
            activation: read_le_u32(buf, 64),
            description,
            end_of_log: read_le_u16(buf, 132) != 0,
            compat,
        })
    }

    /// Serialize into a zeroed block-0 buffer (header included, block
    /// sealed with its checksum).
    pub fn write_block(&self, buf: &mut [u8]) {
        BlockHeader {
            block_number: 0,
            sequence: self.sequence.get(),
            checksum: 0,
            flags: 0,
        }
        .write_to(buf);
        write_le_u32(buf, 16, FILE_MAGIC);
        buf[20] = self.compat;
        buf[21] = 0;
        write_le_u16(buf, 22, self.block_size.get() as u16);
        write_le_u32(buf, 24, self.num_blocks);
        write_le_u16(buf, 28, self.thread.get());
        write_le_u16(buf, 30, 0);
        write_le_u32(buf, 32, self.sequence.get());
        write_le_u64(buf, 36, self.first_scn.get());
        write_le_u64(buf, 44, self.next_scn.get());
        write_le_u32(buf, 52, self.resetlogs);
        write_le_u64(buf, 56, self.resetlogs_scn.get());
        write_le_u32(buf, 64, self.activation);
        let desc = self.description.as_bytes();
        let n = desc.len().min(64);
        buf[68..68 + n].copy_from_slice(&desc[..n]);
        write_le_u16(buf, 132, u16::from(self.end_of_log));
        seal_block(buf);
    }
}

fn bad_header(path: &Path, detail: String) -> RedowireError {
    RedowireError::BadHeader {
        path: path.to_path_buf(),
        detail,
    }
}

#[inline]
pub(crate) fn read_le_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

#[inline]
pub(crate) fn read_le_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

#[inline]
pub(crate) fn read_le_u64(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(bytes)
}

#[inline]
pub(crate) fn write_le_u16(buf: &mut [u8], at: usize, value: u16) {
    buf[at..at + 2].copy_from_slice(&value.to_le_bytes());
}

#[inline]
pub(crate) fn write_le_u32(buf: &mut [u8], at: usize, value: u32) {
    buf[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

#[inline]
pub(crate) fn write_le_u64(buf: &mut [u8], at: usize, value: u64) {
    buf[at..at + 8].copy_from_slice(&value.to_le_bytes());
}
