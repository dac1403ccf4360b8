/// Tile sources
///
/// The cache never interprets tile bytes. It asks an `AddressResolver` where a
/// tile lives, reads that range from a `BackingStore`, and optionally runs a
/// `TileTransform` (decompression, format conversion) before publishing.

use memmap2::Mmap;
use std::fs::File;
use std::io;
use std::path::Path;

use crate::error::{StreamError, StreamResult};
use crate::TileId;

/// Byte range of one tile inside the backing store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileExtent {
    pub offset: u64,
    pub length: u64,
}

impl TileExtent {
    pub fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }

    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.length)
    }
}

/// Maps a tile id to its byte range. Treated as a pure function and called
/// once per request, at scheduling time.
pub trait AddressResolver: Send + Sync {
    fn resolve(&self, id: TileId) -> StreamResult<TileExtent>;
}

impl<F> AddressResolver for F
where
    F: Fn(TileId) -> StreamResult<TileExtent> + Send + Sync,
{
    fn resolve(&self, id: TileId) -> StreamResult<TileExtent> {
        self(id)
    }
}

/// Equally sized tiles stored back to back after a header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UniformResolver {
    pub base_offset: u64,
    pub tile_bytes: u64,
    pub tile_count: u64,
}

impl UniformResolver {
    pub fn new(base_offset: u64, tile_bytes: u64, tile_count: u64) -> Self {
        Self { base_offset, tile_bytes, tile_count }
    }

    /// Total size of a store holding every tile
    pub fn store_len(&self) -> u64 {
        self.base_offset + self.tile_bytes * self.tile_count
    }
}

impl AddressResolver for UniformResolver {
    fn resolve(&self, id: TileId) -> StreamResult<TileExtent> {
        if id.0 >= self.tile_count {
            return Err(StreamError::InvalidId {
                id,
                reason: format!("atlas holds {} tiles", self.tile_count),
            });
        }
        Ok(TileExtent::new(self.base_offset + id.0 * self.tile_bytes, self.tile_bytes))
    }
}

/// Explicit per-tile extents, for atlases with variable tile sizes
#[derive(Debug, Clone, Default)]
pub struct ExtentTable {
    extents: Vec<TileExtent>,
}

impl ExtentTable {
    pub fn new(extents: Vec<TileExtent>) -> Self {
        Self { extents }
    }

    pub fn len(&self) -> usize {
        self.extents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extents.is_empty()
    }
}

impl AddressResolver for ExtentTable {
    fn resolve(&self, id: TileId) -> StreamResult<TileExtent> {
        usize::try_from(id.0)
            .ok()
            .and_then(|index| self.extents.get(index))
            .copied()
            .ok_or_else(|| StreamError::InvalidId {
                id,
                reason: format!("extent table holds {} entries", self.extents.len()),
            })
    }
}

/// Random-access byte source
pub trait BackingStore: Send + Sync {
    /// Fill `buf` with the bytes starting at `offset`
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()>;

    /// Total length in bytes, if known
    fn len(&self) -> Option<u64> {
        None
    }
}

fn out_of_range(offset: u64, len: usize, store_len: u64) -> io::Error {
    io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!("read of {} bytes at {} past end of store ({} bytes)", len, offset, store_len),
    )
}

/// Positional reads on an open file
pub struct FileStore {
    #[cfg(unix)]
    file: File,
    #[cfg(not(unix))]
    file: parking_lot::Mutex<File>,
    len: u64,
}

impl FileStore {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        log::debug!("[FileStore::open] {} ({} bytes)", path.display(), len);

        Ok(Self {
            #[cfg(unix)]
            file,
            #[cfg(not(unix))]
            file: parking_lot::Mutex::new(file),
            len,
        })
    }
}

impl BackingStore for FileStore {
    #[cfg(unix)]
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        use std::os::unix::fs::FileExt;
        self.file.read_exact_at(buf, offset)
    }

    #[cfg(not(unix))]
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        use std::io::{Read, Seek, SeekFrom};
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)
    }

    fn len(&self) -> Option<u64> {
        Some(self.len)
    }
}

/// Read-only memory map of a whole atlas file
pub struct MmapStore {
    mmap: Mmap,
}

impl MmapStore {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;

        // SAFETY: the map is read-only and owned by this store; the atlas
        // file is not truncated or rewritten while a cache streams from it.
        let mmap = unsafe { Mmap::map(&file)? };
        log::debug!("[MmapStore::open] {} ({} bytes mapped)", path.display(), mmap.len());

        Ok(Self { mmap })
    }
}

impl BackingStore for MmapStore {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let start = usize::try_from(offset).map_err(|_| out_of_range(offset, buf.len(), self.mmap.len() as u64))?;
        let end = start
            .checked_add(buf.len())
            .filter(|&end| end <= self.mmap.len())
            .ok_or_else(|| out_of_range(offset, buf.len(), self.mmap.len() as u64))?;
        buf.copy_from_slice(&self.mmap[start..end]);
        Ok(())
    }

    fn len(&self) -> Option<u64> {
        Some(self.mmap.len() as u64)
    }
}

/// In-memory store for tests and generated data
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    bytes: Vec<u8>,
}

impl MemoryStore {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }
}

impl BackingStore for MemoryStore {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let store_len = self.bytes.len() as u64;
        let start = usize::try_from(offset).map_err(|_| out_of_range(offset, buf.len(), store_len))?;
        let source = start
            .checked_add(buf.len())
            .and_then(|end| self.bytes.get(start..end))
            .ok_or_else(|| out_of_range(offset, buf.len(), store_len))?;
        buf.copy_from_slice(source);
        Ok(())
    }

    fn len(&self) -> Option<u64> {
        Some(self.bytes.len() as u64)
    }
}

/// Second pipeline stage: turn raw tile bytes into their cached form.
/// Returns the number of bytes written to `out`.
pub trait TileTransform: Send + Sync {
    fn transform(&self, id: TileId, raw: &[u8], out: &mut [u8]) -> StreamResult<usize>;
}

impl<F> TileTransform for F
where
    F: Fn(TileId, &[u8], &mut [u8]) -> StreamResult<usize> + Send + Sync,
{
    fn transform(&self, id: TileId, raw: &[u8], out: &mut [u8]) -> StreamResult<usize> {
        self(id, raw, out)
    }
}
