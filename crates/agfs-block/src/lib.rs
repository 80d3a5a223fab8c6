#![forbid(unsafe_code)]
//! Block I/O layer and the staged-write transaction.
//!
//! Provides the `ByteDevice`/`BlockDevice` traits, a file-backed device, an
//! in-memory device for tests and tooling, and [`Txn`] — the capability the
//! B+tree engine consumes: "read block B under transaction T, stage its new
//! image, mark dirty ranges, commit or abort."

use agfs_error::{AgfsError, Result};
use agfs_types::{BlockNumber, BlockSize};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, trace};

/// Owned block buffer.
///
/// Invariant: length == device block size for the originating device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBuf {
    bytes: Vec<u8>,
}

impl BlockBuf {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.bytes
    }
}

/// Byte-addressed device for fixed-offset I/O (pread/pwrite semantics).
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` to `offset`.
    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

/// File-backed byte device using `pread`/`pwrite` style I/O.
///
/// Uses `std::os::unix::fs::FileExt`, which is thread-safe and does not
/// require a shared seek position.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
    writable: bool,
}

impl FileByteDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
            writable,
        })
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let end = offset
            .checked_add(
                u64::try_from(buf.len())
                    .map_err(|_| AgfsError::Format("read length overflows u64".to_owned()))?,
            )
            .ok_or_else(|| AgfsError::Format("read range overflows u64".to_owned()))?;
        if end > self.len {
            return Err(AgfsError::Format(format!(
                "read out of bounds: offset={offset} len={} file_len={}",
                buf.len(),
                self.len
            )));
        }

        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(AgfsError::Format("device opened read-only".to_owned()));
        }
        let end = offset
            .checked_add(
                u64::try_from(buf.len())
                    .map_err(|_| AgfsError::Format("write length overflows u64".to_owned()))?,
            )
            .ok_or_else(|| AgfsError::Format("write range overflows u64".to_owned()))?;
        if end > self.len {
            return Err(AgfsError::Format(format!(
                "write out of bounds: offset={offset} len={} file_len={}",
                buf.len(),
                self.len
            )));
        }

        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// Block-addressed I/O interface.
pub trait BlockDevice: Send + Sync {
    /// Read a block by number.
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf>;

    /// Write a block by number. `data.len()` MUST equal `block_size()`.
    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()>;

    /// Device block size in bytes.
    fn block_size(&self) -> u32;

    /// Total number of blocks.
    fn block_count(&self) -> u64;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;

    /// Non-blocking prefetch hint. Best-effort; the default does nothing.
    fn readahead(&self, block: BlockNumber) {
        let _ = block;
    }
}

/// Adapter presenting a [`ByteDevice`] as a [`BlockDevice`].
#[derive(Debug)]
pub struct ByteBlockDevice<D: ByteDevice> {
    inner: D,
    block_size: u32,
    block_count: u64,
}

impl<D: ByteDevice> ByteBlockDevice<D> {
    /// Block size validity (power of two, sane bounds) is the
    /// [`BlockSize`] constructor's job; this only checks image alignment.
    pub fn new(inner: D, block_size: BlockSize) -> Result<Self> {
        let block_size = block_size.get();
        let len = inner.len_bytes();
        let block_size_u64 = u64::from(block_size);
        let remainder = len % block_size_u64;
        if remainder != 0 {
            return Err(AgfsError::Format(format!(
                "image length is not block-aligned: len_bytes={len} block_size={block_size} remainder={remainder}"
            )));
        }
        let block_count = len / block_size_u64;
        Ok(Self {
            inner,
            block_size,
            block_count,
        })
    }

    #[must_use]
    pub fn inner(&self) -> &D {
        &self.inner
    }
}

impl<D: ByteDevice> BlockDevice for ByteBlockDevice<D> {
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        if block.0 >= self.block_count {
            return Err(AgfsError::Format(format!(
                "block out of range: block={} block_count={}",
                block.0, self.block_count
            )));
        }

        let offset = block
            .0
            .checked_mul(u64::from(self.block_size))
            .ok_or_else(|| AgfsError::Format("block offset overflow".to_owned()))?;
        let mut buf = vec![
            0_u8;
            usize::try_from(self.block_size).map_err(|_| {
                AgfsError::Format("block_size does not fit usize".to_owned())
            })?
        ];
        self.inner.read_exact_at(offset, &mut buf)?;
        Ok(BlockBuf::new(buf))
    }

    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        let expected = usize::try_from(self.block_size)
            .map_err(|_| AgfsError::Format("block_size does not fit usize".to_owned()))?;
        if data.len() != expected {
            return Err(AgfsError::Format(format!(
                "write_block data size mismatch: got={} expected={expected}",
                data.len()
            )));
        }
        if block.0 >= self.block_count {
            return Err(AgfsError::Format(format!(
                "block out of range: block={} block_count={}",
                block.0, self.block_count
            )));
        }

        let offset = block
            .0
            .checked_mul(u64::from(self.block_size))
            .ok_or_else(|| AgfsError::Format("block offset overflow".to_owned()))?;
        self.inner.write_all_at(offset, data)?;
        Ok(())
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn sync(&self) -> Result<()> {
        self.inner.sync()
    }
}

/// In-memory block device for tests, tooling, and scratch images.
///
/// Unwritten blocks read back as zeroes.
#[derive(Debug)]
pub struct MemBlockDevice {
    block_size: u32,
    block_count: u64,
    blocks: Mutex<HashMap<u64, Vec<u8>>>,
}

impl MemBlockDevice {
    #[must_use]
    pub fn new(block_size: u32, block_count: u64) -> Self {
        Self {
            block_size,
            block_count,
            blocks: Mutex::new(HashMap::new()),
        }
    }
}

impl BlockDevice for MemBlockDevice {
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        if block.0 >= self.block_count {
            return Err(AgfsError::Format(format!(
                "block out of range: block={} block_count={}",
                block.0, self.block_count
            )));
        }
        let blocks = self.blocks.lock();
        if let Some(data) = blocks.get(&block.0) {
            Ok(BlockBuf::new(data.clone()))
        } else {
            Ok(BlockBuf::new(vec![0_u8; self.block_size as usize]))
        }
    }

    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        if data.len() != self.block_size as usize {
            return Err(AgfsError::Format(format!(
                "write_block data size mismatch: got={} expected={}",
                data.len(),
                self.block_size
            )));
        }
        if block.0 >= self.block_count {
            return Err(AgfsError::Format(format!(
                "block out of range: block={} block_count={}",
                block.0, self.block_count
            )));
        }
        self.blocks.lock().insert(block.0, data.to_vec());
        Ok(())
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

// ── Transaction ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct StagedBlock {
    bytes: Vec<u8>,
    /// Logged dirty byte ranges within the block (inclusive start, exclusive end).
    ranges: Vec<(u32, u32)>,
}

/// A staged-write transaction over a [`BlockDevice`].
///
/// All metadata mutations performed by the engine go through a `Txn`:
/// reads see staged writes (read-your-writes), [`Txn::commit`] flushes the
/// staged block images to the device in ascending block order and syncs,
/// and [`Txn::abort`] (or dropping the `Txn`) discards every staged write.
/// Structural mutations for one logical operation therefore become visible
/// all-or-nothing with respect to the device.
pub struct Txn<'a> {
    dev: &'a dyn BlockDevice,
    staged: HashMap<u64, StagedBlock>,
}

impl<'a> Txn<'a> {
    #[must_use]
    pub fn new(dev: &'a dyn BlockDevice) -> Self {
        Self {
            dev,
            staged: HashMap::new(),
        }
    }

    #[must_use]
    pub fn device(&self) -> &dyn BlockDevice {
        self.dev
    }

    #[must_use]
    pub fn block_size(&self) -> u32 {
        self.dev.block_size()
    }

    /// Number of blocks with staged writes.
    #[must_use]
    pub fn dirty_count(&self) -> usize {
        self.staged.len()
    }

    /// Read a block, observing staged writes from this transaction first.
    pub fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        if let Some(staged) = self.staged.get(&block.0) {
            return Ok(BlockBuf::new(staged.bytes.clone()));
        }
        self.dev.read_block(block)
    }

    /// Get a freshly zeroed block without reading the device (for blocks the
    /// caller just allocated and will fully initialize).
    pub fn get_block(&mut self, block: BlockNumber) -> Result<BlockBuf> {
        if block.0 >= self.dev.block_count() {
            return Err(AgfsError::Format(format!(
                "block out of range: block={} block_count={}",
                block.0,
                self.dev.block_count()
            )));
        }
        let zeroed = vec![0_u8; self.dev.block_size() as usize];
        self.staged.insert(
            block.0,
            StagedBlock {
                bytes: zeroed.clone(),
                ranges: vec![(0, self.dev.block_size())],
            },
        );
        Ok(BlockBuf::new(zeroed))
    }

    /// Stage a full block image, logging the whole block dirty.
    pub fn log_block(&mut self, block: BlockNumber, data: &[u8]) -> Result<()> {
        let bs = self.dev.block_size();
        if data.len() != bs as usize {
            return Err(AgfsError::Format(format!(
                "log_block data size mismatch: got={} expected={bs}",
                data.len()
            )));
        }
        trace!(block = block.0, "txn_log_block");
        self.staged.insert(
            block.0,
            StagedBlock {
                bytes: data.to_vec(),
                ranges: vec![(0, bs)],
            },
        );
        Ok(())
    }

    /// Stage a full block image while recording only `[start, end)` as dirty.
    ///
    /// The dirty range is bookkeeping for journaling layers above this one;
    /// commit always writes whole blocks.
    pub fn log_range(&mut self, block: BlockNumber, data: &[u8], start: u32, end: u32) -> Result<()> {
        let bs = self.dev.block_size();
        if data.len() != bs as usize {
            return Err(AgfsError::Format(format!(
                "log_range data size mismatch: got={} expected={bs}",
                data.len()
            )));
        }
        if start > end || end > bs {
            return Err(AgfsError::Format(format!(
                "log_range invalid range: start={start} end={end} block_size={bs}"
            )));
        }
        trace!(block = block.0, start, end, "txn_log_range");
        let entry = self.staged.entry(block.0).or_insert_with(|| StagedBlock {
            bytes: vec![0_u8; bs as usize],
            ranges: Vec::new(),
        });
        entry.bytes.copy_from_slice(data);
        entry.ranges.push((start, end));
        Ok(())
    }

    /// Logged dirty ranges for a staged block, if any.
    #[must_use]
    pub fn logged_ranges(&self, block: BlockNumber) -> Option<&[(u32, u32)]> {
        self.staged.get(&block.0).map(|s| s.ranges.as_slice())
    }

    /// Forward a prefetch hint to the device.
    pub fn readahead(&self, block: BlockNumber) {
        self.dev.readahead(block);
    }

    /// Write all staged blocks to the device (ascending block order) and sync.
    pub fn commit(self) -> Result<()> {
        let mut blocks: Vec<u64> = self.staged.keys().copied().collect();
        blocks.sort_unstable();
        debug!(dirty_blocks = blocks.len(), "txn_commit");
        for block in blocks {
            let staged = &self.staged[&block];
            self.dev.write_block(BlockNumber(block), &staged.bytes)?;
        }
        self.dev.sync()
    }

    /// Discard every staged write.
    pub fn abort(self) {
        debug!(dirty_blocks = self.staged.len(), "txn_abort");
        drop(self);
    }
}
