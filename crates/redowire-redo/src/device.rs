//! Block device abstraction for redo files.
//!
//! Readers access redo through the small [`RedoDevice`] capability
//! instead of a concrete file type, so alternative backends (raw devices,
//! remote storage) can slot in behind the same reader.

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

/// Positioned read access to one redo file.
pub trait RedoDevice: Send {
    /// Read exactly `buf.len()` bytes at `offset`, or fail. Reading past
    /// the current end of file is an error (`UnexpectedEof`).
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()>;

    /// Current size of the file in bytes.
    fn size(&self) -> io::Result<u64>;

    /// The path this device was opened from, for diagnostics.
    fn path(&self) -> &Path;
}

/// Filesystem-backed redo device.
#[derive(Debug)]
pub struct FileDevice {
    file: File,
    path: PathBuf,
}

impl FileDevice {
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let file = File::open(&path)?;
        Ok(Self { file, path })
    }
}

impl RedoDevice for FileDevice {
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.file.read_exact_at(buf, offset)
    }

    fn size(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn path(&self) -> &Path {
        &self.path
    }
}
