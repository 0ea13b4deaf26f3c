//! HFS Master Directory Block (volume header) parsing, validation and layout
//!
//! Reference: https://developer.apple.com/library/archive/documentation/mac/Files/Files-102.html

use byteorder::{BigEndian, ByteOrder};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use super::block::SECTOR_SIZE;
use super::error::{HfsError, Result};
use super::extents::{ExtentDescriptor, ExtentRecord, ForkData};
use super::macroman;

/// Sector holding the primary MDB
pub const MDB_SECTOR: u64 = 2;

/// Volume signature (0x4244 for HFS, "BD")
pub const HFS_SIGNATURE: u16 = 0x4244;

/// Embedded volume signature of an HFS wrapper around HFS+ ("H+")
pub const HFS_PLUS_EMBEDDED_SIGNATURE: u16 = 0x482B;

/// Volume was cleanly unmounted; cleared while it holds unflushed changes
pub const ATTR_UNMOUNTED: u16 = 1 << 8;

/// Volume is locked by software
pub const ATTR_SOFTWARE_LOCK: u16 = 1 << 15;

/// First catalog node ID handed out to user files and folders
pub const FIRST_USER_CATALOG_ID: u32 = 16;

/// Bits of volume bitmap held by one sector
pub const BITS_PER_BITMAP_SECTOR: u32 = 4096;

/// Seconds between 1904-01-01 and 1970-01-01
const MAC_EPOCH_OFFSET: u64 = 2_082_844_800;

const MDB_LEN: usize = 162;

/// Smallest image `format` accepts
pub const MIN_VOLUME_SIZE: u64 = 64 * 1024;

/// Convert a host timestamp to an HFS date (seconds since 1904, saturating)
pub fn to_mac_date(time: SystemTime) -> u32 {
    let unix = time
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    (unix + MAC_EPOCH_OFFSET).min(u32::MAX as u64) as u32
}

/// Convert an HFS date to a host timestamp; dates before 1970 clamp to the Unix epoch
pub fn from_mac_date(date: u32) -> SystemTime {
    let secs = (date as u64).saturating_sub(MAC_EPOCH_OFFSET);
    UNIX_EPOCH + Duration::from_secs(secs)
}

pub fn mac_now() -> u32 {
    to_mac_date(SystemTime::now())
}

/// Where allocation blocks live on the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// Sector of allocation block 0
    pub first_alloc_sector: u64,
    /// Allocation block size in bytes
    pub block_size: u32,
    /// Number of allocation blocks
    pub total_blocks: u32,
}

impl Geometry {
    pub fn sectors_per_block(&self) -> u64 {
        self.block_size as u64 / SECTOR_SIZE
    }

    /// First sector of an allocation block
    pub fn block_sector(&self, block: u32) -> u64 {
        self.first_alloc_sector + block as u64 * self.sectors_per_block()
    }
}

/// Parameters for laying out a new volume
#[derive(Debug, Clone)]
pub struct FormatOptions {
    pub volume_name: String,
    /// Allocation block size; picked from the image size when `None`
    pub block_size: Option<u32>,
}

/// HFS Master Directory Block (MDB)
/// Located at byte 1024 from the start of the volume
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterDirectoryBlock {
    /// Volume signature (0x4244 for HFS, "BD")
    pub signature: u16,
    /// Date and time of volume creation
    pub create_date: u32,
    /// Date and time of last modification
    pub modify_date: u32,
    /// Volume attributes
    pub attributes: u16,
    /// Number of files in root directory
    pub root_file_count: u16,
    /// First sector of the volume bitmap
    pub bitmap_start: u16,
    /// Where the next allocation search starts
    pub alloc_ptr: u16,
    /// Number of allocation blocks
    pub total_blocks: u16,
    /// Size of allocation blocks in bytes
    pub block_size: u32,
    /// Default clump size
    pub clump_size: u32,
    /// First allocation block, in sectors from the volume start
    pub first_alloc_sector: u16,
    /// Next unused catalog node ID
    pub next_catalog_id: u32,
    /// Number of unused allocation blocks
    pub free_blocks: u16,
    /// Volume name, raw Mac Roman bytes (at most 27)
    pub volume_name: Vec<u8>,
    pub backup_date: u32,
    pub sequence_number: u16,
    /// Number of times the volume has been flushed
    pub write_count: u32,
    pub extents_clump_size: u32,
    pub catalog_clump_size: u32,
    /// Number of directories in root directory
    pub root_dir_count: u16,
    pub file_count: u32,
    pub folder_count: u32,
    pub finder_info: [u8; 32],
    pub embedded_signature: u16,
    pub embedded_extent: ExtentDescriptor,
    /// Extents overflow B-tree file
    pub extents_file: ForkData,
    /// Catalog B-tree file
    pub catalog_file: ForkData,
}

fn parse_extent_record(data: &[u8]) -> ExtentRecord {
    let mut record = ExtentRecord::default();
    for (i, extent) in record.iter_mut().enumerate() {
        *extent = ExtentDescriptor::parse(&data[i * 4..i * 4 + 4]);
    }
    record
}

fn write_extent_record(record: &ExtentRecord, out: &mut [u8]) {
    for (i, extent) in record.iter().enumerate() {
        extent.write(&mut out[i * 4..i * 4 + 4]);
    }
}

impl MasterDirectoryBlock {
    /// Parse an MDB from the 512-byte sector at byte 1024
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < MDB_LEN {
            return Err(HfsError::InvalidFormat("MDB too short".to_string()));
        }

        let name_len = (data[36] as usize).min(macroman::MAX_VOLUME_NAME_LEN);
        let extents_size = BigEndian::read_u32(&data[130..134]);
        let catalog_size = BigEndian::read_u32(&data[146..150]);

        let mut finder_info = [0u8; 32];
        finder_info.copy_from_slice(&data[92..124]);

        Ok(Self {
            signature: BigEndian::read_u16(&data[0..2]),
            create_date: BigEndian::read_u32(&data[2..6]),
            modify_date: BigEndian::read_u32(&data[6..10]),
            attributes: BigEndian::read_u16(&data[10..12]),
            root_file_count: BigEndian::read_u16(&data[12..14]),
            bitmap_start: BigEndian::read_u16(&data[14..16]),
            alloc_ptr: BigEndian::read_u16(&data[16..18]),
            total_blocks: BigEndian::read_u16(&data[18..20]),
            block_size: BigEndian::read_u32(&data[20..24]),
            clump_size: BigEndian::read_u32(&data[24..28]),
            first_alloc_sector: BigEndian::read_u16(&data[28..30]),
            next_catalog_id: BigEndian::read_u32(&data[30..34]),
            free_blocks: BigEndian::read_u16(&data[34..36]),
            volume_name: data[37..37 + name_len].to_vec(),
            backup_date: BigEndian::read_u32(&data[64..68]),
            sequence_number: BigEndian::read_u16(&data[68..70]),
            write_count: BigEndian::read_u32(&data[70..74]),
            extents_clump_size: BigEndian::read_u32(&data[74..78]),
            catalog_clump_size: BigEndian::read_u32(&data[78..82]),
            root_dir_count: BigEndian::read_u16(&data[82..84]),
            file_count: BigEndian::read_u32(&data[84..88]),
            folder_count: BigEndian::read_u32(&data[88..92]),
            finder_info,
            embedded_signature: BigEndian::read_u16(&data[124..126]),
            embedded_extent: ExtentDescriptor::parse(&data[126..130]),
            extents_file: ForkData {
                logical_size: extents_size,
                physical_size: extents_size,
                extents: parse_extent_record(&data[134..146]),
            },
            catalog_file: ForkData {
                logical_size: catalog_size,
                physical_size: catalog_size,
                extents: parse_extent_record(&data[150..162]),
            },
        })
    }

    /// Encode into a full sector, zero padded past the 162 MDB bytes
    pub fn encode(&self) -> Vec<u8> {
        let mut data = vec![0u8; SECTOR_SIZE as usize];
        BigEndian::write_u16(&mut data[0..2], self.signature);
        BigEndian::write_u32(&mut data[2..6], self.create_date);
        BigEndian::write_u32(&mut data[6..10], self.modify_date);
        BigEndian::write_u16(&mut data[10..12], self.attributes);
        BigEndian::write_u16(&mut data[12..14], self.root_file_count);
        BigEndian::write_u16(&mut data[14..16], self.bitmap_start);
        BigEndian::write_u16(&mut data[16..18], self.alloc_ptr);
        BigEndian::write_u16(&mut data[18..20], self.total_blocks);
        BigEndian::write_u32(&mut data[20..24], self.block_size);
        BigEndian::write_u32(&mut data[24..28], self.clump_size);
        BigEndian::write_u16(&mut data[28..30], self.first_alloc_sector);
        BigEndian::write_u32(&mut data[30..34], self.next_catalog_id);
        BigEndian::write_u16(&mut data[34..36], self.free_blocks);
        let name_len = self.volume_name.len().min(macroman::MAX_VOLUME_NAME_LEN);
        data[36] = name_len as u8;
        data[37..37 + name_len].copy_from_slice(&self.volume_name[..name_len]);
        BigEndian::write_u32(&mut data[64..68], self.backup_date);
        BigEndian::write_u16(&mut data[68..70], self.sequence_number);
        BigEndian::write_u32(&mut data[70..74], self.write_count);
        BigEndian::write_u32(&mut data[74..78], self.extents_clump_size);
        BigEndian::write_u32(&mut data[78..82], self.catalog_clump_size);
        BigEndian::write_u16(&mut data[82..84], self.root_dir_count);
        BigEndian::write_u32(&mut data[84..88], self.file_count);
        BigEndian::write_u32(&mut data[88..92], self.folder_count);
        data[92..124].copy_from_slice(&self.finder_info);
        BigEndian::write_u16(&mut data[124..126], self.embedded_signature);
        self.embedded_extent.write(&mut data[126..130]);
        BigEndian::write_u32(&mut data[130..134], self.extents_file.logical_size);
        write_extent_record(&self.extents_file.extents, &mut data[134..146]);
        BigEndian::write_u32(&mut data[146..150], self.catalog_file.logical_size);
        write_extent_record(&self.catalog_file.extents, &mut data[150..162]);
        data
    }

    pub fn geometry(&self) -> Geometry {
        Geometry {
            first_alloc_sector: self.first_alloc_sector as u64,
            block_size: self.block_size,
            total_blocks: self.total_blocks as u32,
        }
    }

    /// Sectors occupied by the volume bitmap
    pub fn bitmap_sectors(&self) -> u64 {
        (self.total_blocks as u32).div_ceil(BITS_PER_BITMAP_SECTOR) as u64
    }

    /// Sector of the alternate MDB for a device of `total_sectors`
    pub fn alternate_sector(total_sectors: u64) -> u64 {
        total_sectors.saturating_sub(2)
    }

    pub fn volume_name(&self) -> String {
        macroman::decode(&self.volume_name)
    }

    /// True when the on-disk state was committed by a complete flush
    pub fn is_consistent(&self) -> bool {
        self.attributes & ATTR_UNMOUNTED != 0
    }

    pub fn is_locked(&self) -> bool {
        self.attributes & ATTR_SOFTWARE_LOCK != 0
    }

    /// Flag the in-memory header as holding unflushed changes
    pub fn mark_dirty(&mut self, now: u32) {
        self.attributes &= !ATTR_UNMOUNTED;
        self.modify_date = now;
    }

    /// Flag the in-memory header as matching what a flush committed
    pub fn clear_dirty(&mut self) {
        self.attributes |= ATTR_UNMOUNTED;
    }

    /// Check signature and geometry against a device of `total_sectors`
    pub fn validate(&self, total_sectors: u64) -> Result<()> {
        if self.signature != HFS_SIGNATURE {
            return Err(HfsError::InvalidFormat(format!(
                "Invalid HFS signature: 0x{:04X}",
                self.signature
            )));
        }
        if self.embedded_signature == HFS_PLUS_EMBEDDED_SIGNATURE {
            return Err(HfsError::InvalidFormat(
                "volume wraps an embedded HFS+ volume".to_string(),
            ));
        }
        if self.block_size == 0 || self.block_size as u64 % SECTOR_SIZE != 0 {
            return Err(HfsError::InvalidFormat(format!(
                "allocation block size {} is not a multiple of {}",
                self.block_size, SECTOR_SIZE
            )));
        }
        if self.total_blocks == 0 {
            return Err(HfsError::InvalidFormat("volume has no allocation blocks".to_string()));
        }
        if (self.bitmap_start as u64) <= MDB_SECTOR
            || self.bitmap_start as u64 + self.bitmap_sectors() > self.first_alloc_sector as u64
        {
            return Err(HfsError::InvalidFormat(format!(
                "bitmap at sector {} overlaps the header or allocation area",
                self.bitmap_start
            )));
        }
        let geometry = self.geometry();
        let end = geometry.block_sector(geometry.total_blocks);
        if end > total_sectors {
            return Err(HfsError::InvalidFormat(format!(
                "allocation area ends at sector {} but the image has {}",
                end, total_sectors
            )));
        }
        if self.next_catalog_id < FIRST_USER_CATALOG_ID {
            return Err(HfsError::InvalidFormat(format!(
                "next catalog ID {} is reserved",
                self.next_catalog_id
            )));
        }
        if self.free_blocks > self.total_blocks {
            return Err(HfsError::InvalidFormat(format!(
                "{} free blocks on a volume of {}",
                self.free_blocks, self.total_blocks
            )));
        }
        for (name, fork) in [("extents", &self.extents_file), ("catalog", &self.catalog_file)] {
            self.validate_tree_file(name, fork)?;
        }
        Ok(())
    }

    fn validate_tree_file(&self, name: &str, fork: &ForkData) -> Result<()> {
        if fork.extents[0].is_empty() {
            return Err(HfsError::InvalidFormat(format!("{} file has no extents", name)));
        }
        let mut blocks = 0u64;
        for extent in fork.extents.iter().filter(|e| !e.is_empty()) {
            if extent.end() > self.total_blocks as u32 {
                return Err(HfsError::InvalidFormat(format!(
                    "{} file extent {:?} lies outside the volume",
                    name, extent
                )));
            }
            blocks += extent.block_count as u64;
        }
        let size = fork.logical_size as u64;
        if size == 0 || size % SECTOR_SIZE != 0 || size > blocks * self.block_size as u64 {
            return Err(HfsError::InvalidFormat(format!(
                "{} file size {} does not match its extents",
                name, size
            )));
        }
        Ok(())
    }

    /// Lay out a fresh volume on a device of `total_sectors`.
    ///
    /// The extents file starts at allocation block 0 and the catalog file
    /// follows it. The returned header is marked dirty.
    pub fn format(total_sectors: u64, options: &FormatOptions, now: u32) -> Result<Self> {
        if total_sectors * SECTOR_SIZE < MIN_VOLUME_SIZE {
            return Err(HfsError::InvalidArgument(format!(
                "{} bytes is below the {} byte minimum volume size",
                total_sectors * SECTOR_SIZE,
                MIN_VOLUME_SIZE
            )));
        }
        let volume_name = macroman::encode_volume_name(&options.volume_name)?;

        // Boot blocks and MDB in front, alternate MDB and a spare sector behind
        let available = total_sectors - (MDB_SECTOR + 1) - 2;
        let sectors_per_block = match options.block_size {
            Some(size) if size == 0 || size as u64 % SECTOR_SIZE != 0 => {
                return Err(HfsError::InvalidArgument(format!(
                    "allocation block size {} is not a multiple of {}",
                    size, SECTOR_SIZE
                )));
            }
            Some(size) => size as u64 / SECTOR_SIZE,
            None => available.div_ceil(u16::MAX as u64).max(1),
        };
        let block_size = (sectors_per_block * SECTOR_SIZE) as u32;

        let upper_bound = (available / sectors_per_block).min(u16::MAX as u64);
        let bitmap_sectors = upper_bound.div_ceil(BITS_PER_BITMAP_SECTOR as u64);
        let total_blocks = ((available - bitmap_sectors) / sectors_per_block).min(u16::MAX as u64);
        let first_alloc_sector = MDB_SECTOR + 1 + bitmap_sectors;

        let extents_blocks = tree_file_blocks((total_sectors / 512).clamp(4, 2048), block_size);
        let catalog_blocks = tree_file_blocks((total_sectors / 128).clamp(8, 2048), block_size);
        if (extents_blocks + catalog_blocks) as u64 >= total_blocks {
            return Err(HfsError::InvalidArgument(format!(
                "{} allocation blocks cannot hold the catalog and extents files",
                total_blocks
            )));
        }

        let tree_fork = |start: u32, blocks: u32| {
            let size = (blocks as u64 * block_size as u64).min(2048 * SECTOR_SIZE) as u32;
            let mut extents = ExtentRecord::default();
            extents[0] = ExtentDescriptor::new(start as u16, blocks as u16);
            ForkData {
                logical_size: size,
                physical_size: size,
                extents,
            }
        };

        let used = extents_blocks + catalog_blocks;
        Ok(Self {
            signature: HFS_SIGNATURE,
            create_date: now,
            modify_date: now,
            attributes: 0,
            root_file_count: 0,
            bitmap_start: (MDB_SECTOR + 1) as u16,
            alloc_ptr: used as u16,
            total_blocks: total_blocks as u16,
            block_size,
            clump_size: block_size * 4,
            first_alloc_sector: first_alloc_sector as u16,
            next_catalog_id: FIRST_USER_CATALOG_ID,
            free_blocks: (total_blocks as u32 - used) as u16,
            volume_name,
            backup_date: 0,
            sequence_number: 0,
            write_count: 0,
            extents_clump_size: extents_blocks * block_size,
            catalog_clump_size: catalog_blocks * block_size,
            root_dir_count: 0,
            file_count: 0,
            folder_count: 0,
            finder_info: [0u8; 32],
            embedded_signature: 0,
            embedded_extent: ExtentDescriptor::default(),
            extents_file: tree_fork(0, extents_blocks),
            catalog_file: tree_fork(extents_blocks, catalog_blocks),
        })
    }
}

/// Allocation blocks needed to hold `nodes` B-tree nodes
fn tree_file_blocks(nodes: u64, block_size: u32) -> u32 {
    (nodes * SECTOR_SIZE).div_ceil(block_size as u64) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> FormatOptions {
        FormatOptions {
            volume_name: "TestVol".to_string(),
            block_size: None,
        }
    }

    #[test]
    fn test_parse_mdb() {
        // Create a minimal HFS MDB structure
        let mut data = vec![0u8; 512];

        data[0] = 0x42; // 'B'
        data[1] = 0x44; // 'D'

        // Allocation block size 1024 at bytes 20-23
        data[22] = 0x04;

        // Volume name (Pascal string) at byte 36
        data[36] = 7;
        data[37..44].copy_from_slice(b"TestVol");

        let mdb = MasterDirectoryBlock::parse(&data).unwrap();

        assert_eq!(mdb.signature, 0x4244);
        assert_eq!(mdb.block_size, 1024);
        assert_eq!(mdb.volume_name(), "TestVol");
    }

    #[test]
    fn test_encode_matches_parse() {
        let mdb = MasterDirectoryBlock::format(20480, &options(), 3_000_000_000).unwrap();
        let encoded = mdb.encode();
        assert_eq!(encoded.len(), 512);
        assert_eq!(&encoded[0..2], b"BD");
        assert_eq!(MasterDirectoryBlock::parse(&encoded).unwrap(), mdb);
    }

    #[test]
    fn test_format_geometry() {
        // 10 MiB image
        let mdb = MasterDirectoryBlock::format(20480, &options(), 0).unwrap();
        mdb.validate(20480).unwrap();

        assert_eq!(mdb.block_size, 512);
        assert_eq!(mdb.bitmap_start, 3);
        assert_eq!(mdb.bitmap_sectors(), 5);
        assert_eq!(mdb.first_alloc_sector, 8);
        assert_eq!(mdb.total_blocks as u64, 20480 - 8 - 2);
        assert_eq!(mdb.extents_file.extents[0], ExtentDescriptor::new(0, 40));
        assert_eq!(mdb.catalog_file.extents[0], ExtentDescriptor::new(40, 160));
        assert_eq!(mdb.free_blocks, mdb.total_blocks - 200);
        assert!(!mdb.is_consistent());
    }

    #[test]
    fn test_format_large_volume_uses_bigger_blocks() {
        // 64 MiB image needs more than 512 bytes per block to stay under 65535 blocks
        let sectors = 64 * 2048;
        let mdb = MasterDirectoryBlock::format(sectors, &options(), 0).unwrap();
        mdb.validate(sectors).unwrap();
        assert_eq!(mdb.block_size, 1024);
        assert!(mdb.geometry().block_sector(mdb.total_blocks as u32) <= sectors);
    }

    #[test]
    fn test_format_rejects_tiny_image() {
        let result = MasterDirectoryBlock::format(64, &options(), 0);
        assert!(matches!(result, Err(HfsError::InvalidArgument(_))));
    }

    #[test]
    fn test_validate_signature() {
        let mut mdb = MasterDirectoryBlock::format(20480, &options(), 0).unwrap();
        mdb.signature = 0x482B;
        assert!(matches!(mdb.validate(20480), Err(HfsError::InvalidFormat(_))));
    }

    #[test]
    fn test_validate_geometry() {
        let mdb = MasterDirectoryBlock::format(20480, &options(), 0).unwrap();
        // Image shorter than the allocation area claims
        assert!(matches!(mdb.validate(10000), Err(HfsError::InvalidFormat(_))));

        let mut bad_tree = mdb.clone();
        bad_tree.catalog_file.extents[0] = ExtentDescriptor::new(20470, 100);
        assert!(matches!(bad_tree.validate(20480), Err(HfsError::InvalidFormat(_))));

        let mut embedded = mdb.clone();
        embedded.embedded_signature = HFS_PLUS_EMBEDDED_SIGNATURE;
        assert!(matches!(embedded.validate(20480), Err(HfsError::InvalidFormat(_))));
    }

    #[test]
    fn test_dirty_bit() {
        let mut mdb = MasterDirectoryBlock::format(20480, &options(), 0).unwrap();
        mdb.clear_dirty();
        assert!(mdb.is_consistent());
        mdb.mark_dirty(1234);
        assert!(!mdb.is_consistent());
        assert_eq!(mdb.modify_date, 1234);
    }

    #[test]
    fn test_mac_dates() {
        let time = UNIX_EPOCH + Duration::from_secs(1_000_000);
        assert_eq!(to_mac_date(time), 1_000_000 + 2_082_844_800);
        assert_eq!(from_mac_date(to_mac_date(time)), time);
        assert_eq!(from_mac_date(0), UNIX_EPOCH);
    }
}
