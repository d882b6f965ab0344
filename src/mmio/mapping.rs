//! Shared mapping of a file's image.

use crate::core::error::Result;
use memmap2::{MmapOptions, MmapRaw};
use std::fs::File;
use std::ops::Range;
use std::sync::atomic::{fence, Ordering};

/// How a region was opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Reads only; the image is mapped read-only.
    ReadOnly,
    /// Reads and writes.
    ReadWrite,
}

impl Access {
    /// Whether writes are allowed.
    pub fn writable(self) -> bool {
        self == Access::ReadWrite
    }
}

/// The mapped image. Byte ranges are synchronised by the record locks; the
/// mapping itself only changes under the region's exclusive lock.
pub(crate) struct Mapping {
    file: File,
    map: MmapRaw,
    len: u64,
    access: Access,
}

impl Mapping {
    /// Map `len` bytes of `file`, extending the file first when it is shorter.
    pub(crate) fn new(file: File, len: u64, access: Access) -> Result<Self> {
        if access.writable() && file.metadata()?.len() < len {
            file.set_len(len)?;
        }
        let map = Self::map(&file, len, access)?;
        Ok(Self { file, map, len, access })
    }

    fn map(file: &File, len: u64, access: Access) -> Result<MmapRaw> {
        let mut opts = MmapOptions::new();
        opts.len(len as usize);
        let map = match access {
            Access::ReadWrite => opts.map_raw(file)?,
            Access::ReadOnly => opts.map_raw_read_only(file)?,
        };
        Ok(map)
    }

    #[inline]
    pub(crate) fn len(&self) -> u64 {
        self.len
    }

    #[inline]
    pub(crate) fn access(&self) -> Access {
        self.access
    }

    /// Extend the file and map it again at `new_len`.
    pub(crate) fn grow(&mut self, new_len: u64) -> Result<()> {
        self.file.set_len(new_len)?;
        self.map = Self::map(&self.file, new_len, self.access)?;
        self.len = new_len;
        Ok(())
    }

    /// Copy image bytes at `offset` into `dst`.
    pub(crate) fn read_into(&self, offset: u64, dst: &mut [u8]) {
        debug_assert!(offset + dst.len() as u64 <= self.len);
        // SAFETY: in bounds; the caller holds the record locks covering the range
        unsafe {
            std::ptr::copy_nonoverlapping(self.map.as_ptr().add(offset as usize), dst.as_mut_ptr(), dst.len());
        }
    }

    /// Copy `src` into the image at `offset`.
    pub(crate) fn write_from(&self, offset: u64, src: &[u8]) {
        debug_assert!(self.access.writable());
        debug_assert!(offset + src.len() as u64 <= self.len);
        // SAFETY: in bounds of a writable mapping; the caller holds the record
        // write locks covering the range
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.map.as_mut_ptr().add(offset as usize), src.len());
        }
    }

    /// Persistence barrier over an image range.
    pub(crate) fn persist(&self, range: Range<u64>, sync: bool) -> Result<()> {
        fence(Ordering::SeqCst);
        if sync && !range.is_empty() {
            self.map.flush_range(range.start as usize, (range.end - range.start) as usize)?;
        }
        Ok(())
    }

    /// msync the whole image.
    pub(crate) fn flush(&self) -> Result<()> {
        if self.access.writable() {
            self.map.flush()?;
        }
        Ok(())
    }

    /// Unmap and cut the file back to `size` bytes.
    pub(crate) fn finish(self, size: u64) -> Result<()> {
        let Mapping { file, map, access, .. } = self;
        drop(map);
        if access.writable() {
            file.set_len(size)?;
        }
        Ok(())
    }
}
