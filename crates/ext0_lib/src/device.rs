use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::Result;
use crate::lock;

/// Fixed-size block storage the filesystem sits on. Blocks are numbered from 0.
///
/// Implementations must tolerate concurrent calls; the core does its own serialisation of
/// writers that touch the same metadata.
pub trait BlockDevice: Send + Sync {
    fn block_size(&self) -> usize;

    fn block_count(&self) -> u64;

    /// Fills `buf` (exactly one block) with the contents of `block`.
    fn read_block(&self, block: u64, buf: &mut [u8]) -> Result<()>;

    fn write_block(&self, block: u64, data: &[u8]) -> Result<()>;

    /// Makes previous writes durable.
    fn flush(&self) -> Result<()>;

    fn read_block_vec(&self, block: u64) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.block_size()];
        self.read_block(block, &mut buf)?;
        Ok(buf)
    }

    fn size_bytes(&self) -> u64 {
        self.block_count() * self.block_size() as u64
    }
}

fn check_request(block: u64, len: usize, block_size: usize, block_count: u64) -> io::Result<()> {
    if len != block_size {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("buffer of {len} bytes for a {block_size} byte block"),
        ));
    }
    if block >= block_count {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("block {block} is past the end of the device ({block_count} blocks)"),
        ));
    }
    Ok(())
}

/// A regular file or a block device node.
pub struct FileDevice {
    file: File,
    block_size: usize,
    block_count: u64,
}

impl FileDevice {
    pub fn open<P: AsRef<Path>>(path: P, block_size: usize) -> Result<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        // metadata().len() is 0 for device nodes, seeking to the end works for both
        let size = file.seek(SeekFrom::End(0))?;
        Ok(Self {
            file,
            block_size,
            block_count: size / block_size as u64,
        })
    }
}

impl BlockDevice for FileDevice {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn read_block(&self, block: u64, buf: &mut [u8]) -> Result<()> {
        check_request(block, buf.len(), self.block_size, self.block_count)?;
        self.file
            .read_exact_at(buf, block * self.block_size as u64)?;
        Ok(())
    }

    fn write_block(&self, block: u64, data: &[u8]) -> Result<()> {
        check_request(block, data.len(), self.block_size, self.block_count)?;
        self.file
            .write_all_at(data, block * self.block_size as u64)?;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// RAM-backed device, used by the tests. Can be told to start failing writes.
pub struct MemDevice {
    data: Mutex<Vec<u8>>,
    block_size: usize,
    block_count: u64,
    writes_left: AtomicUsize,
}

impl MemDevice {
    pub fn new(block_size: usize, block_count: u64) -> Self {
        Self {
            data: Mutex::new(vec![0u8; block_size * block_count as usize]),
            block_size,
            block_count,
            writes_left: AtomicUsize::new(usize::MAX),
        }
    }

    /// Device big enough for `bytes`, rounded down to whole blocks.
    pub fn with_size(block_size: usize, bytes: u64) -> Self {
        Self::new(block_size, bytes / block_size as u64)
    }

    /// After `n` more successful writes every write fails with an I/O error.
    pub fn fail_after_writes(&self, n: usize) {
        self.writes_left.store(n, Ordering::SeqCst);
    }

    /// Copy of the raw bytes.
    pub fn snapshot(&self) -> Vec<u8> {
        lock(&self.data).clone()
    }
}

impl BlockDevice for MemDevice {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn read_block(&self, block: u64, buf: &mut [u8]) -> Result<()> {
        check_request(block, buf.len(), self.block_size, self.block_count)?;
        let start = block as usize * self.block_size;
        buf.copy_from_slice(&lock(&self.data)[start..start + self.block_size]);
        Ok(())
    }

    fn write_block(&self, block: u64, data: &[u8]) -> Result<()> {
        check_request(block, data.len(), self.block_size, self.block_count)?;
        let allowed = self
            .writes_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if !allowed {
            return Err(io::Error::other("injected write failure").into());
        }
        let start = block as usize * self.block_size;
        lock(&self.data)[start..start + self.block_size].copy_from_slice(data);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}
