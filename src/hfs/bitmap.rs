//! Volume bitmap: one bit per allocation block, most significant bit first

use super::block::{BlockDevice, SECTOR_SIZE};
use super::error::{HfsError, Result};
use super::extents::ExtentDescriptor;
use super::mdb::{MasterDirectoryBlock, BITS_PER_BITMAP_SECTOR};

/// Resident copy of the volume bitmap
///
/// Freed blocks are cleared in the bitmap at once but stay held until the
/// next flush. File data is written straight to storage, so handing a freed
/// block to another fork before the metadata that released it is on disk
/// would overwrite data the on-disk catalog still points at.
#[derive(Debug, Clone)]
pub struct AllocationBitmap {
    bits: Vec<u8>,
    /// Blocks freed since the last flush, same layout as `bits`
    held: Vec<u8>,
    total_blocks: u32,
    free_blocks: u32,
    held_blocks: u32,
    dirty: bool,
}

impl AllocationBitmap {
    /// Bitmap with every block free, sized to whole sectors
    pub fn new(total_blocks: u32) -> Self {
        let sectors = total_blocks.div_ceil(BITS_PER_BITMAP_SECTOR) as usize;
        Self {
            bits: vec![0u8; sectors * SECTOR_SIZE as usize],
            held: vec![0u8; sectors * SECTOR_SIZE as usize],
            total_blocks,
            free_blocks: total_blocks,
            held_blocks: 0,
            dirty: true,
        }
    }

    pub fn from_bytes(bits: Vec<u8>, total_blocks: u32) -> Result<Self> {
        if (bits.len() as u64) * 8 < total_blocks as u64 {
            return Err(HfsError::InvalidFormat(format!(
                "bitmap of {} bytes cannot cover {} blocks",
                bits.len(),
                total_blocks
            )));
        }
        let mut bitmap = Self {
            held: vec![0u8; bits.len()],
            bits,
            total_blocks,
            free_blocks: 0,
            held_blocks: 0,
            dirty: false,
        };
        bitmap.free_blocks = (0..total_blocks).filter(|&b| !bitmap.is_used(b)).count() as u32;
        Ok(bitmap)
    }

    /// Read the whole bitmap described by the MDB
    pub fn load(device: &BlockDevice, mdb: &MasterDirectoryBlock) -> Result<Self> {
        let bits = device.read_sectors(mdb.bitmap_start as u64, mdb.bitmap_sectors())?;
        Self::from_bytes(bits, mdb.total_blocks as u32)
    }

    /// Sector-aligned bytes as stored on disk
    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    pub fn total_blocks(&self) -> u32 {
        self.total_blocks
    }

    /// Blocks clear in the bitmap, including those still held
    pub fn free_blocks(&self) -> u32 {
        self.free_blocks
    }

    /// Blocks freed since the last flush and not yet reusable
    pub fn held_blocks(&self) -> u32 {
        self.held_blocks
    }

    /// Blocks an allocation may hand out right now
    pub fn available_blocks(&self) -> u32 {
        self.free_blocks - self.held_blocks
    }

    /// Make blocks freed before a completed flush reusable
    pub fn release_held(&mut self) {
        if self.held_blocks > 0 {
            log::debug!("Releasing {} blocks freed before the flush", self.held_blocks);
            self.held.fill(0);
            self.held_blocks = 0;
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    pub fn is_used(&self, block: u32) -> bool {
        self.bits[(block / 8) as usize] & (0x80 >> (block % 8)) != 0
    }

    fn is_held(&self, block: u32) -> bool {
        self.held[(block / 8) as usize] & (0x80 >> (block % 8)) != 0
    }

    fn is_available(&self, block: u32) -> bool {
        !self.is_used(block) && !self.is_held(block)
    }

    fn set(&mut self, block: u32, used: bool) {
        let mask = 0x80 >> (block % 8);
        let byte = &mut self.bits[(block / 8) as usize];
        if used {
            *byte |= mask;
        } else {
            *byte &= !mask;
        }
    }

    fn check_range(&self, start: u32, count: u32) -> Result<()> {
        match start.checked_add(count) {
            Some(end) if end <= self.total_blocks => Ok(()),
            _ => Err(HfsError::InvalidArgument(format!(
                "blocks {}+{} outside a volume of {} blocks",
                start, count, self.total_blocks
            ))),
        }
    }

    pub fn is_range_free(&self, start: u32, count: u32) -> bool {
        self.check_range(start, count).is_ok() && (start..start + count).all(|b| self.is_available(b))
    }

    /// First-fit search for one contiguous run of `count` free blocks
    pub fn allocate(&mut self, count: u32) -> Result<ExtentDescriptor> {
        if count == 0 {
            return Err(HfsError::InvalidArgument("cannot allocate zero blocks".to_string()));
        }
        if count > u16::MAX as u32 || count > self.available_blocks() {
            return Err(HfsError::OutOfSpace { requested: count });
        }

        let mut run_start = 0u32;
        let mut run_len = 0u32;
        let mut block = 0u32;
        while block < self.total_blocks {
            // Skip fully used bytes
            if block % 8 == 0 && block + 8 <= self.total_blocks && self.bits[(block / 8) as usize] == 0xFF {
                run_len = 0;
                block += 8;
                continue;
            }
            if !self.is_available(block) {
                run_len = 0;
            } else {
                if run_len == 0 {
                    run_start = block;
                }
                run_len += 1;
                if run_len == count {
                    self.mark_used(run_start, count);
                    return Ok(ExtentDescriptor::new(run_start as u16, count as u16));
                }
            }
            block += 1;
        }
        Err(HfsError::OutOfSpace { requested: count })
    }

    /// Claim a specific run, failing if any block in it is in use
    pub fn allocate_at(&mut self, start: u32, count: u32) -> Result<()> {
        self.check_range(start, count)?;
        if !self.is_range_free(start, count) {
            return Err(HfsError::OutOfSpace { requested: count });
        }
        self.mark_used(start, count);
        Ok(())
    }

    fn mark_used(&mut self, start: u32, count: u32) {
        for block in start..start + count {
            self.set(block, true);
        }
        self.free_blocks -= count;
        self.dirty = true;
    }

    /// Return a run to the free pool; the blocks are held until
    /// `release_held`
    pub fn free(&mut self, start: u32, count: u32) -> Result<()> {
        self.check_range(start, count)?;
        for block in start..start + count {
            if !self.is_used(block) {
                if cfg!(debug_assertions) {
                    panic!("double free of allocation block {}", block);
                }
                log::warn!("Allocation block {} freed twice", block);
                continue;
            }
            self.set(block, false);
            self.held[(block / 8) as usize] |= 0x80 >> (block % 8);
            self.free_blocks += 1;
            self.held_blocks += 1;
        }
        self.dirty = true;
        Ok(())
    }

    /// Blocks whose state differs from `expected`
    pub fn mismatches(&self, expected: &AllocationBitmap) -> Vec<u32> {
        (0..self.total_blocks.min(expected.total_blocks))
            .filter(|&b| self.is_used(b) != expected.is_used(b))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitmap_sized_to_sectors() {
        let bitmap = AllocationBitmap::new(5000);
        assert_eq!(bitmap.as_bytes().len(), 1024);
        assert_eq!(bitmap.free_blocks(), 5000);
    }

    #[test]
    fn test_first_fit() {
        let mut bitmap = AllocationBitmap::new(64);
        assert_eq!(bitmap.allocate(3).unwrap(), ExtentDescriptor::new(0, 3));
        assert_eq!(bitmap.allocate(2).unwrap(), ExtentDescriptor::new(3, 2));
        bitmap.free(0, 3).unwrap();
        bitmap.release_held();

        // Hole of 3 at the front is too small for 4
        assert_eq!(bitmap.allocate(4).unwrap(), ExtentDescriptor::new(5, 4));
        assert_eq!(bitmap.allocate(3).unwrap(), ExtentDescriptor::new(0, 3));
        assert_eq!(bitmap.free_blocks(), 64 - 9);
    }

    #[test]
    fn test_msb_first_bit_order() {
        let mut bitmap = AllocationBitmap::new(16);
        bitmap.allocate_at(0, 1).unwrap();
        bitmap.allocate_at(9, 1).unwrap();
        assert_eq!(bitmap.as_bytes()[0], 0x80);
        assert_eq!(bitmap.as_bytes()[1], 0x40);
    }

    #[test]
    fn test_out_of_space() {
        let mut bitmap = AllocationBitmap::new(16);
        bitmap.allocate_at(4, 1).unwrap();
        bitmap.allocate_at(12, 1).unwrap();
        // 15 free blocks, but no contiguous run of 8
        assert!(matches!(bitmap.allocate(8), Err(HfsError::OutOfSpace { requested: 8 })));
        assert_eq!(bitmap.allocate(7).unwrap(), ExtentDescriptor::new(5, 7));
    }

    #[test]
    fn test_skips_full_bytes() {
        let mut bitmap = AllocationBitmap::new(40);
        bitmap.allocate(24).unwrap();
        assert_eq!(bitmap.allocate(2).unwrap(), ExtentDescriptor::new(24, 2));
    }

    #[test]
    fn test_allocate_at_conflict() {
        let mut bitmap = AllocationBitmap::new(32);
        bitmap.allocate_at(10, 5).unwrap();
        assert!(bitmap.allocate_at(14, 2).is_err());
        assert!(bitmap.allocate_at(30, 4).is_err());
        assert!(bitmap.is_range_free(15, 10));
        assert!(!bitmap.is_range_free(9, 2));
    }

    #[test]
    fn test_round_trip_bytes() {
        let mut bitmap = AllocationBitmap::new(100);
        bitmap.allocate(37).unwrap();
        let reloaded = AllocationBitmap::from_bytes(bitmap.as_bytes().to_vec(), 100).unwrap();
        assert_eq!(reloaded.free_blocks(), 63);
        assert!(reloaded.mismatches(&bitmap).is_empty());
        assert!(!reloaded.is_dirty());
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "double free")]
    fn test_double_free_panics_in_debug() {
        let mut bitmap = AllocationBitmap::new(8);
        bitmap.allocate(2).unwrap();
        bitmap.free(0, 2).unwrap();
        let _ = bitmap.free(0, 2);
    }

    #[test]
    fn test_freed_blocks_held_until_released() {
        let mut bitmap = AllocationBitmap::new(16);
        bitmap.allocate(4).unwrap();
        bitmap.free(0, 4).unwrap();

        // Clear on disk, but not handed out again yet
        assert!(!bitmap.is_used(0));
        assert_eq!(bitmap.free_blocks(), 16);
        assert_eq!(bitmap.held_blocks(), 4);
        assert_eq!(bitmap.allocate(2).unwrap(), ExtentDescriptor::new(4, 2));
        assert!(!bitmap.is_range_free(0, 1));
        assert!(bitmap.allocate_at(2, 1).is_err());
        assert!(matches!(bitmap.allocate(11), Err(HfsError::OutOfSpace { .. })));

        bitmap.release_held();
        assert_eq!(bitmap.held_blocks(), 0);
        assert_eq!(bitmap.allocate(4).unwrap(), ExtentDescriptor::new(0, 4));
    }
}
