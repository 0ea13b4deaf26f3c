//! Block store trait and implementations for HFS images

use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use super::error::Result;

/// Device sector size; every HFS structure is addressed in these units
pub const SECTOR_SIZE: u64 = 512;

/// Trait for sized, block-addressable storage backing an HFS volume
pub trait BlockStore: Send {
    /// Read `count` contiguous blocks starting at `start`
    fn read_blocks(&mut self, start: u64, count: u64) -> Result<Vec<u8>, io::Error>;

    /// Write whole blocks starting at `start`; `data` must be block aligned
    fn write_blocks(&mut self, start: u64, data: &[u8]) -> Result<(), io::Error>;

    /// Number of blocks in the store
    fn total_blocks(&self) -> u64;

    /// Block size in bytes (always 512 for HFS images)
    fn block_size(&self) -> u64 {
        SECTOR_SIZE
    }

    /// Push buffered writes to durable storage
    fn sync(&mut self) -> Result<(), io::Error> {
        Ok(())
    }
}

fn check_range(start: u64, count: u64, total: u64) -> Result<(), io::Error> {
    match start.checked_add(count) {
        Some(end) if end <= total => Ok(()),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("blocks {}..{} outside store of {} blocks", start, start.saturating_add(count), total),
        )),
    }
}

fn check_aligned(data: &[u8]) -> Result<u64, io::Error> {
    if data.len() as u64 % SECTOR_SIZE != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("write of {} bytes is not block aligned", data.len()),
        ));
    }
    Ok(data.len() as u64 / SECTOR_SIZE)
}

/// Block store over an image file or device node
pub struct FileBlockStore {
    file: File,
    total_blocks: u64,
}

impl FileBlockStore {
    /// Open an existing image read/write
    pub fn open(path: &Path) -> Result<Self, io::Error> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let total_blocks = file.metadata()?.len() / SECTOR_SIZE;
        Ok(Self { file, total_blocks })
    }

    /// Create (or truncate) an image of `size` bytes, rounded down to whole blocks
    pub fn create(path: &Path, size: u64) -> Result<Self, io::Error> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        let total_blocks = size / SECTOR_SIZE;
        file.set_len(total_blocks * SECTOR_SIZE)?;
        Ok(Self { file, total_blocks })
    }
}

impl BlockStore for FileBlockStore {
    fn read_blocks(&mut self, start: u64, count: u64) -> Result<Vec<u8>, io::Error> {
        check_range(start, count, self.total_blocks)?;
        self.file.seek(SeekFrom::Start(start * SECTOR_SIZE))?;
        let mut buffer = vec![0u8; (count * SECTOR_SIZE) as usize];
        self.file.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    fn write_blocks(&mut self, start: u64, data: &[u8]) -> Result<(), io::Error> {
        let count = check_aligned(data)?;
        check_range(start, count, self.total_blocks)?;
        self.file.seek(SeekFrom::Start(start * SECTOR_SIZE))?;
        self.file.write_all(data)
    }

    fn total_blocks(&self) -> u64 {
        self.total_blocks
    }

    fn sync(&mut self) -> Result<(), io::Error> {
        self.file.sync_data()
    }
}

/// In-memory block store. Clones share the same buffer.
#[derive(Clone)]
pub struct MemoryBlockStore {
    data: Arc<Mutex<Vec<u8>>>,
}

impl MemoryBlockStore {
    /// Zero-filled store of `size` bytes, rounded down to whole blocks
    pub fn new(size: u64) -> Self {
        let size = (size / SECTOR_SIZE * SECTOR_SIZE) as usize;
        Self {
            data: Arc::new(Mutex::new(vec![0u8; size])),
        }
    }

    pub fn from_bytes(mut bytes: Vec<u8>) -> Self {
        bytes.truncate(bytes.len() / SECTOR_SIZE as usize * SECTOR_SIZE as usize);
        Self {
            data: Arc::new(Mutex::new(bytes)),
        }
    }

    /// Copy of the current contents
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.lock().clone()
    }
}

impl BlockStore for MemoryBlockStore {
    fn read_blocks(&mut self, start: u64, count: u64) -> Result<Vec<u8>, io::Error> {
        let data = self.data.lock();
        check_range(start, count, data.len() as u64 / SECTOR_SIZE)?;
        let begin = (start * SECTOR_SIZE) as usize;
        let end = begin + (count * SECTOR_SIZE) as usize;
        Ok(data[begin..end].to_vec())
    }

    fn write_blocks(&mut self, start: u64, bytes: &[u8]) -> Result<(), io::Error> {
        let count = check_aligned(bytes)?;
        let mut data = self.data.lock();
        check_range(start, count, data.len() as u64 / SECTOR_SIZE)?;
        let begin = (start * SECTOR_SIZE) as usize;
        data[begin..begin + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn total_blocks(&self) -> u64 {
        self.data.lock().len() as u64 / SECTOR_SIZE
    }
}

/// Shared handle to the block store of a mounted volume.
///
/// Reads happen under the volume's shared lock, so the store itself sits
/// behind a mutex; each call is one contiguous transfer.
pub struct BlockDevice {
    store: Mutex<Box<dyn BlockStore>>,
    total_sectors: u64,
}

impl BlockDevice {
    pub fn new(store: Box<dyn BlockStore>) -> Self {
        let total_sectors = store.total_blocks();
        Self {
            store: Mutex::new(store),
            total_sectors,
        }
    }

    pub fn total_sectors(&self) -> u64 {
        self.total_sectors
    }

    pub fn read_sectors(&self, start: u64, count: u64) -> Result<Vec<u8>> {
        Ok(self.store.lock().read_blocks(start, count)?)
    }

    pub fn write_sectors(&self, start: u64, data: &[u8]) -> Result<()> {
        Ok(self.store.lock().write_blocks(start, data)?)
    }

    pub fn sync(&self) -> Result<()> {
        Ok(self.store.lock().sync()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_round_trip() {
        let mut store = MemoryBlockStore::new(4096);
        assert_eq!(store.total_blocks(), 8);

        let block = vec![0xA5u8; 512];
        store.write_blocks(3, &block).unwrap();
        assert_eq!(store.read_blocks(3, 1).unwrap(), block);
        assert_eq!(store.read_blocks(2, 1).unwrap(), vec![0u8; 512]);
    }

    #[test]
    fn test_memory_store_rejects_out_of_range() {
        let mut store = MemoryBlockStore::new(1024);
        assert!(store.read_blocks(1, 2).is_err());
        assert!(store.write_blocks(2, &[0u8; 512]).is_err());
        assert!(store.write_blocks(0, &[0u8; 100]).is_err());
    }

    #[test]
    fn test_memory_store_clones_share_buffer() {
        let store = MemoryBlockStore::new(1024);
        let mut writer = store.clone();
        writer.write_blocks(0, &[7u8; 512]).unwrap();
        assert_eq!(store.snapshot()[..512], [7u8; 512]);
    }

    #[test]
    fn test_file_store() {
        let file = tempfile::Builder::new().suffix(".img").tempfile().unwrap();
        let mut store = FileBlockStore::create(file.path(), 8192).unwrap();
        assert_eq!(store.total_blocks(), 16);

        store.write_blocks(15, &[0x42u8; 512]).unwrap();
        store.sync().unwrap();

        let mut reopened = FileBlockStore::open(file.path()).unwrap();
        assert_eq!(reopened.read_blocks(15, 1).unwrap(), vec![0x42u8; 512]);
        assert!(reopened.read_blocks(16, 1).is_err());
    }

    #[test]
    fn test_device_wraps_store() {
        let device = BlockDevice::new(Box::new(MemoryBlockStore::new(2048)));
        assert_eq!(device.total_sectors(), 4);
        device.write_sectors(1, &[1u8; 1024]).unwrap();
        assert_eq!(device.read_sectors(2, 1).unwrap(), vec![1u8; 512]);
    }
}
