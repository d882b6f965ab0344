//! File handles over mapped regions
//!
//! An [`Engine`] owns the allocator and a table of open regions keyed by
//! inode. Every [`PmemFile`] opened on the same inode shares one region; the
//! region is torn down when the last handle closes.


use crate::allocator::{Allocator, PoolStats};
use crate::core::error::{Error, Result};
use crate::core::Config;
use crate::mmio::{Access, MappedRegion};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::fs::File;
use std::io::{self, SeekFrom};
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// Open regions, one per inode, reference counted.
#[derive(Default)]
pub struct RegionTable {
    regions: DashMap<u64, Arc<MappedRegion>>,
}

impl RegionTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Region of `ino`, taking a reference on an existing one or installing
    /// the one `create` opens.
    pub fn acquire<F>(&self, ino: u64, create: F) -> Result<Arc<MappedRegion>>
    where
        F: FnOnce() -> Result<Arc<MappedRegion>>,
    {
        match self.regions.entry(ino) {
            Entry::Occupied(entry) => {
                let region = entry.get().clone();
                region.retain();
                Ok(region)
            }
            Entry::Vacant(entry) => {
                let region = create()?;
                entry.insert(region.clone());
                Ok(region)
            }
        }
    }

    /// Drop one reference to `ino`'s region, closing it on the last.
    ///
    /// The entry stays locked until the region is closed, so a concurrent
    /// [`RegionTable::acquire`] of the same inode only maps the file once it
    /// has been checkpointed and truncated.
    pub fn release(&self, ino: u64) -> Result<()> {
        match self.regions.entry(ino) {
            Entry::Occupied(entry) if entry.get().release() => {
                debug!(ino, "last reference released");
                let closed = entry.get().close();
                entry.remove();
                closed
            }
            _ => Ok(()),
        }
    }

    /// Open region of `ino`, without taking a reference.
    pub fn get(&self, ino: u64) -> Option<Arc<MappedRegion>> {
        self.regions.get(&ino).map(|r| r.value().clone())
    }

    /// Number of open regions.
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    /// Whether no region is open.
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Close every region regardless of outstanding references.
    pub fn close_all(&self) -> Result<()> {
        let inos: Vec<u64> = self.regions.iter().map(|r| *r.key()).collect();
        let mut first_err = None;
        for ino in inos {
            if let Entry::Occupied(entry) = self.regions.entry(ino) {
                if let Err(e) = entry.get().close() {
                    warn!(ino, error = %e, "failed to close region");
                    first_err.get_or_insert(e);
                }
                entry.remove();
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

/// How [`Engine::open`] opens a file.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenOptions {
    write: bool,
    create: bool,
}

impl OpenOptions {
    /// Read-only, no creation.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow writes through the handle.
    pub fn write(mut self, write: bool) -> Self {
        self.write = write;
        self
    }

    /// Create the file when missing; implies write.
    pub fn create(mut self, create: bool) -> Self {
        self.create = create;
        self
    }

    fn access(&self) -> Access {
        if self.write || self.create {
            Access::ReadWrite
        } else {
            Access::ReadOnly
        }
    }
}

/// Entry point: allocator plus the open-region table.
pub struct Engine {
    config: Config,
    allocator: Arc<Allocator>,
    table: Arc<RegionTable>,
}

impl Engine {
    /// Validate `config` and build the allocator.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let allocator = Allocator::new(&config)?;
        Ok(Self {
            config,
            allocator,
            table: Arc::new(RegionTable::new()),
        })
    }

    /// Active configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The shared allocator.
    pub fn allocator(&self) -> &Arc<Allocator> {
        &self.allocator
    }

    /// The open-region table.
    pub fn table(&self) -> &RegionTable {
        &self.table
    }

    /// Occupancy of every pool.
    pub fn stats(&self) -> Vec<PoolStats> {
        self.allocator.stats()
    }

    /// Region for `ino`, mapping `file` if it is not open yet.
    pub fn open_region(&self, file: File, access: Access, ino: u64, size: u64) -> Result<Arc<MappedRegion>> {
        self.table.acquire(ino, || {
            MappedRegion::open(self.allocator.clone(), &self.config.engine, file, access, ino, size)
        })
    }

    /// Give back a reference taken by [`Engine::open_region`].
    pub fn close_region(&self, region: &MappedRegion) -> Result<()> {
        self.table.release(region.ino())
    }

    /// Open `path` and return a handle positioned at offset 0.
    pub fn open(&self, path: impl AsRef<Path>, options: OpenOptions) -> Result<PmemFile> {
        let path = path.as_ref();
        let access = options.access();
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(access.writable())
            .create(options.create)
            .open(path)?;
        let ino = file.metadata()?.ino();
        // size is read under the table entry, after any teardown has truncated
        let region = self.table.acquire(ino, || {
            let size = file.metadata()?.len();
            MappedRegion::open(self.allocator.clone(), &self.config.engine, file, access, ino, size)
        })?;
        debug!(path = %path.display(), ino = region.ino(), ?access, "file opened");
        Ok(PmemFile {
            table: self.table.clone(),
            region: Some(region),
            pos: 0,
            access,
        })
    }

    /// Close every open region.
    pub fn shutdown(&self) -> Result<()> {
        self.table.close_all()
    }
}

/// An open file: a region reference plus a cursor.
pub struct PmemFile {
    table: Arc<RegionTable>,
    region: Option<Arc<MappedRegion>>,
    pos: u64,
    access: Access,
}

impl PmemFile {
    fn region(&self) -> Result<&Arc<MappedRegion>> {
        self.region.as_ref().ok_or(Error::Closed)
    }

    /// Region behind this handle.
    pub fn mapped_region(&self) -> Result<&MappedRegion> {
        self.region().map(|r| r.as_ref())
    }

    /// Current cursor.
    pub fn position(&self) -> u64 {
        self.pos
    }

    /// Logical file size.
    pub fn len(&self) -> Result<u64> {
        Ok(self.region()?.file_size())
    }

    /// Whether the file holds no bytes.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Read at the cursor and advance it.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = self.read_at(self.pos, buf)?;
        self.pos += n as u64;
        Ok(n)
    }

    /// Write at the cursor and advance it.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let n = self.write_at(self.pos, buf)?;
        self.pos += n as u64;
        Ok(n)
    }

    /// Read at `offset` without moving the cursor.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.region()?.read(offset, buf)
    }

    /// Write at `offset` without moving the cursor.
    pub fn write_at(&self, offset: u64, buf: &[u8]) -> Result<usize> {
        if !self.access.writable() {
            return Err(Error::ReadOnly);
        }
        self.region()?.write(offset, buf)
    }

    /// Move the cursor. Targets before 0 or past the logical size are rejected.
    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let size = self.len()?;
        let target = match pos {
            SeekFrom::Start(n) => Some(n),
            SeekFrom::Current(d) => self.pos.checked_add_signed(d),
            SeekFrom::End(d) => size.checked_add_signed(d),
        };
        match target {
            Some(t) if t <= size => {
                self.pos = t;
                Ok(t)
            }
            _ => Err(Error::invalid_seek(format!("{:?} from {} in a file of {} bytes", pos, self.pos, size))),
        }
    }

    /// Commit the region's current epoch.
    pub fn sync(&self) -> Result<()> {
        self.region()?.commit()
    }

    /// Give back the region reference. Later calls are no-ops.
    pub fn close(&mut self) -> Result<()> {
        match self.region.take() {
            Some(region) => self.table.release(region.ino()),
            None => Ok(()),
        }
    }
}

impl Drop for PmemFile {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "failed to close file handle");
        }
    }
}

impl io::Read for PmemFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(PmemFile::read(self, buf)?)
    }
}

impl io::Write for PmemFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(PmemFile::write(self, buf)?)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(self.sync()?)
    }
}

impl io::Seek for PmemFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        Ok(PmemFile::seek(self, pos)?)
    }
}
