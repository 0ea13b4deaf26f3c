//! Fork extents: three inline descriptors per fork, continued in the
//! extents overflow B-tree once those are used up

use byteorder::{BigEndian, ByteOrder};
use std::cmp::Ordering;

use super::bitmap::AllocationBitmap;
use super::block::BlockDevice;
use super::btree::{BTree, TreeLayout, MAX_TREE_NODES, NODE_SIZE};
use super::error::{HfsError, Result};

/// Catalog node ID of the extents overflow file
pub const EXTENTS_FILE_ID: u32 = 3;

/// Descriptors per inline record and per overflow record
pub const EXTENTS_PER_RECORD: usize = 3;

/// HFS extent descriptor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtentDescriptor {
    /// First allocation block
    pub start_block: u16,
    /// Number of allocation blocks
    pub block_count: u16,
}

impl ExtentDescriptor {
    pub fn new(start_block: u16, block_count: u16) -> Self {
        Self {
            start_block,
            block_count,
        }
    }

    pub fn parse(data: &[u8]) -> Self {
        Self {
            start_block: BigEndian::read_u16(&data[0..2]),
            block_count: BigEndian::read_u16(&data[2..4]),
        }
    }

    pub fn write(&self, out: &mut [u8]) {
        BigEndian::write_u16(&mut out[0..2], self.start_block);
        BigEndian::write_u16(&mut out[2..4], self.block_count);
    }

    pub fn is_empty(&self) -> bool {
        self.block_count == 0
    }

    /// Allocation block just past the extent
    pub fn end(&self) -> u32 {
        self.start_block as u32 + self.block_count as u32
    }
}

/// Three extent descriptors, inline in a fork or stored as one overflow record
pub type ExtentRecord = [ExtentDescriptor; EXTENTS_PER_RECORD];

/// Size and first extents of a fork
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForkData {
    pub logical_size: u32,
    pub physical_size: u32,
    pub extents: ExtentRecord,
}

impl ForkData {
    /// Allocation blocks owned by the fork
    pub fn allocated_blocks(&self, block_size: u32) -> u32 {
        self.physical_size / block_size
    }
}

/// Which fork of a file an extent belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ForkType {
    Data,
    Resource,
}

impl ForkType {
    pub fn raw(self) -> u8 {
        match self {
            ForkType::Data => 0x00,
            ForkType::Resource => 0xFF,
        }
    }

    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0x00 => Some(ForkType::Data),
            0xFF => Some(ForkType::Resource),
            _ => None,
        }
    }
}

/// Identifies the fork whose extents are being resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForkRef {
    pub file_id: u32,
    pub fork_type: ForkType,
}

/// Extents overflow key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtentKey {
    pub fork_type: ForkType,
    pub file_id: u32,
    /// First file allocation block covered by the record
    pub start_block: u16,
}

impl ExtentKey {
    fn new(fork: ForkRef, start_block: u16) -> Self {
        Self {
            fork_type: fork.fork_type,
            file_id: fork.file_id,
            start_block,
        }
    }

    fn belongs_to(&self, fork: ForkRef) -> bool {
        self.file_id == fork.file_id && self.fork_type == fork.fork_type
    }
}

/// Key and record codec of the extents overflow tree
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtentsLayout;

impl TreeLayout for ExtentsLayout {
    type Key = ExtentKey;
    type Record = ExtentRecord;
    const MAX_KEY_LEN: usize = 7;

    fn compare(&self, a: &ExtentKey, b: &ExtentKey) -> Ordering {
        a.file_id
            .cmp(&b.file_id)
            .then(a.fork_type.raw().cmp(&b.fork_type.raw()))
            .then(a.start_block.cmp(&b.start_block))
    }

    fn encode_key(&self, key: &ExtentKey) -> Vec<u8> {
        let mut out = vec![0u8; Self::MAX_KEY_LEN];
        out[0] = key.fork_type.raw();
        BigEndian::write_u32(&mut out[1..5], key.file_id);
        BigEndian::write_u16(&mut out[5..7], key.start_block);
        out
    }

    fn decode_key(&self, body: &[u8]) -> Result<ExtentKey, String> {
        if body.len() < Self::MAX_KEY_LEN {
            return Err(format!("extents key of {} bytes", body.len()));
        }
        let fork_type =
            ForkType::from_raw(body[0]).ok_or_else(|| format!("fork type 0x{:02X}", body[0]))?;
        Ok(ExtentKey {
            fork_type,
            file_id: BigEndian::read_u32(&body[1..5]),
            start_block: BigEndian::read_u16(&body[5..7]),
        })
    }

    fn encode_record(&self, record: &ExtentRecord) -> Vec<u8> {
        let mut out = vec![0u8; 4 * EXTENTS_PER_RECORD];
        for (i, extent) in record.iter().enumerate() {
            extent.write(&mut out[i * 4..i * 4 + 4]);
        }
        out
    }

    fn decode_record(&self, data: &[u8]) -> Result<ExtentRecord, String> {
        if data.len() < 4 * EXTENTS_PER_RECORD {
            return Err(format!("extent record of {} bytes", data.len()));
        }
        let mut record = ExtentRecord::default();
        for (i, extent) in record.iter_mut().enumerate() {
            *extent = ExtentDescriptor::parse(&data[i * 4..i * 4 + 4]);
        }
        Ok(record)
    }
}

/// Contiguous physical blocks backing part of a fork
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysicalRun {
    pub start_block: u32,
    pub block_count: u32,
}

/// Find `block` inside a record whose first descriptor starts at file block `first`
fn locate(record: &ExtentRecord, first: u32, block: u32) -> Option<PhysicalRun> {
    let mut logical = first;
    for extent in record.iter().filter(|e| !e.is_empty()) {
        let count = extent.block_count as u32;
        if block < logical + count {
            let skip = block - logical;
            return Some(PhysicalRun {
                start_block: extent.start_block as u32 + skip,
                block_count: count - skip,
            });
        }
        logical += count;
    }
    None
}

/// Free the part of `extent` that lies at or past file block `keep`
fn trim(
    bitmap: &mut AllocationBitmap,
    extent: &mut ExtentDescriptor,
    first: u32,
    keep: u32,
) -> Result<bool> {
    let count = extent.block_count as u32;
    if extent.is_empty() || first + count <= keep {
        return Ok(false);
    }
    let retained = keep.saturating_sub(first);
    bitmap.free(extent.start_block as u32 + retained, count - retained)?;
    *extent = if retained == 0 {
        ExtentDescriptor::default()
    } else {
        ExtentDescriptor::new(extent.start_block, retained as u16)
    };
    Ok(true)
}

/// Extents overflow file and the fork operations built on it
pub struct ExtentsOverflow {
    tree: BTree<ExtentsLayout>,
}

impl ExtentsOverflow {
    pub fn new(tree: BTree<ExtentsLayout>) -> Self {
        Self { tree }
    }

    pub fn tree(&self) -> &BTree<ExtentsLayout> {
        &self.tree
    }

    pub fn tree_mut(&mut self) -> &mut BTree<ExtentsLayout> {
        &mut self.tree
    }

    fn overflow_records(
        &self,
        device: &BlockDevice,
        fork: ForkRef,
    ) -> Result<Vec<(ExtentKey, ExtentRecord)>> {
        let mut records = Vec::new();
        for entry in self.tree.range_from(device, &ExtentKey::new(fork, 0))? {
            let (key, record) = entry?;
            if !key.belongs_to(fork) {
                break;
            }
            records.push((key, record));
        }
        Ok(records)
    }

    /// Map file allocation block `block` to the physical run holding it
    pub fn resolve(
        &self,
        device: &BlockDevice,
        fork: ForkRef,
        data: &ForkData,
        block: u32,
    ) -> Result<PhysicalRun> {
        if let Some(run) = locate(&data.extents, 0, block) {
            return Ok(run);
        }
        let not_found = HfsError::ExtentNotFound {
            file_id: fork.file_id,
            block,
        };
        if block > u16::MAX as u32 {
            return Err(not_found);
        }
        match self.tree.find_floor(device, &ExtentKey::new(fork, block as u16))? {
            Some((key, record)) if key.belongs_to(fork) => {
                locate(&record, key.start_block as u32, block).ok_or(not_found)
            }
            _ => Err(not_found),
        }
    }

    /// Every descriptor of a fork in file order
    pub fn extents_of(
        &self,
        device: &BlockDevice,
        fork: ForkRef,
        data: &ForkData,
    ) -> Result<Vec<ExtentDescriptor>> {
        let mut extents: Vec<ExtentDescriptor> =
            data.extents.iter().copied().filter(|e| !e.is_empty()).collect();
        if extents.len() == EXTENTS_PER_RECORD {
            for (_, record) in self.overflow_records(device, fork)? {
                extents.extend(record.iter().copied().filter(|e| !e.is_empty()));
            }
        }
        Ok(extents)
    }

    /// Add `additional` allocation blocks to the end of a fork
    pub fn grow(
        &mut self,
        device: &BlockDevice,
        bitmap: &mut AllocationBitmap,
        fork: ForkRef,
        data: &mut ForkData,
        block_size: u32,
        additional: u32,
    ) -> Result<()> {
        let current = data.allocated_blocks(block_size);
        if current as u64 + additional as u64 > u16::MAX as u64 {
            return Err(HfsError::OutOfSpace {
                requested: additional,
            });
        }
        if !self.extend_in_place(device, bitmap, fork, data, additional)? {
            let mut remaining = additional;
            while remaining > 0 {
                let extent = Self::allocate_run(bitmap, remaining)?;
                let file_blocks = current + additional - remaining;
                self.append_extent(device, bitmap, fork, data, block_size, extent, file_blocks)?;
                remaining -= extent.block_count as u32;
            }
        }

        data.physical_size = (current + additional) * block_size;
        log::debug!(
            "Grew fork {:?} of file {} by {} blocks to {}",
            fork.fork_type,
            fork.file_id,
            additional,
            current + additional
        );
        Ok(())
    }

    /// First-fit run of the whole request. Only when no single run is
    /// large enough is the request halved, so a fragmented volume with
    /// enough free blocks overall can still satisfy it.
    fn allocate_run(bitmap: &mut AllocationBitmap, wanted: u32) -> Result<ExtentDescriptor> {
        if bitmap.available_blocks() < wanted {
            return Err(HfsError::OutOfSpace { requested: wanted });
        }
        let mut count = wanted;
        loop {
            match bitmap.allocate(count) {
                Err(HfsError::OutOfSpace { .. }) if count > 1 => count /= 2,
                other => return other,
            }
        }
    }

    /// Claim all `wanted` blocks directly after the fork's last extent, or
    /// nothing when they are not all free
    fn extend_in_place(
        &mut self,
        device: &BlockDevice,
        bitmap: &mut AllocationBitmap,
        fork: ForkRef,
        data: &mut ForkData,
        wanted: u32,
    ) -> Result<bool> {
        let last_inline = data.extents.iter().rposition(|e| !e.is_empty());
        let overflow = if last_inline == Some(EXTENTS_PER_RECORD - 1) {
            self.overflow_records(device, fork)?.pop()
        } else {
            None
        };

        let last = match (&overflow, last_inline) {
            (Some((_, record)), _) => record.iter().rev().find(|e| !e.is_empty()).copied(),
            (None, Some(i)) => Some(data.extents[i]),
            (None, None) => None,
        };
        let Some(last) = last else {
            return Ok(false);
        };
        if last.block_count as u32 + wanted > u16::MAX as u32
            || !bitmap.is_range_free(last.end(), wanted)
        {
            return Ok(false);
        }
        bitmap.allocate_at(last.end(), wanted)?;
        let grown = ExtentDescriptor::new(last.start_block, last.block_count + wanted as u16);

        match overflow {
            Some((key, mut record)) => {
                if let Some(slot) = record.iter_mut().rev().find(|e| !e.is_empty()) {
                    *slot = grown;
                }
                self.tree.update(device, &key, record)?;
            }
            None => {
                if let Some(i) = last_inline {
                    data.extents[i] = grown;
                }
            }
        }
        Ok(true)
    }

    /// Store a new descriptor covering file blocks starting at `file_blocks`
    #[allow(clippy::too_many_arguments)]
    fn append_extent(
        &mut self,
        device: &BlockDevice,
        bitmap: &mut AllocationBitmap,
        fork: ForkRef,
        data: &mut ForkData,
        block_size: u32,
        extent: ExtentDescriptor,
        file_blocks: u32,
    ) -> Result<()> {
        if let Some(slot) = data.extents.iter_mut().find(|e| e.is_empty()) {
            *slot = extent;
            return Ok(());
        }

        if let Some((key, mut record)) = self.overflow_records(device, fork)?.pop() {
            if let Some(slot) = record.iter_mut().find(|e| e.is_empty()) {
                *slot = extent;
                return self.tree.update(device, &key, record);
            }
        }

        let needed = self.tree.header().depth as u32 + 1;
        reserve_tree_nodes(&mut self.tree, bitmap, block_size, needed)?;
        let mut record = ExtentRecord::default();
        record[0] = extent;
        self.tree
            .insert(device, ExtentKey::new(fork, file_blocks as u16), record)
    }

    /// Keep the first `keep` allocation blocks of a fork and free the rest
    pub fn shrink(
        &mut self,
        device: &BlockDevice,
        bitmap: &mut AllocationBitmap,
        fork: ForkRef,
        data: &mut ForkData,
        block_size: u32,
        keep: u32,
    ) -> Result<()> {
        let overflow = if data.extents.iter().all(|e| !e.is_empty()) {
            self.overflow_records(device, fork)?
        } else {
            Vec::new()
        };

        let mut first = 0;
        for extent in data.extents.iter_mut() {
            let count = extent.block_count as u32;
            trim(bitmap, extent, first, keep)?;
            first += count;
        }

        for (key, mut record) in overflow {
            let mut first = key.start_block as u32;
            let mut changed = false;
            for extent in record.iter_mut() {
                let count = extent.block_count as u32;
                changed |= trim(bitmap, extent, first, keep)?;
                first += count;
            }
            if record[0].is_empty() {
                self.tree.remove(device, &key)?;
            } else if changed {
                self.tree.update(device, &key, record)?;
            }
        }

        let allocated = data.allocated_blocks(block_size).min(keep);
        data.physical_size = allocated * block_size;
        data.logical_size = data.logical_size.min(data.physical_size);
        Ok(())
    }

    /// Free every block of a fork
    pub fn release(
        &mut self,
        device: &BlockDevice,
        bitmap: &mut AllocationBitmap,
        fork: ForkRef,
        data: &mut ForkData,
        block_size: u32,
    ) -> Result<()> {
        self.shrink(device, bitmap, fork, data, block_size, 0)
    }
}

/// Make sure a B-tree file has at least `needed` free nodes, growing it
/// adjacent to its last extent or into a free inline extent slot
pub fn reserve_tree_nodes<L: TreeLayout>(
    tree: &mut BTree<L>,
    bitmap: &mut AllocationBitmap,
    block_size: u32,
    needed: u32,
) -> Result<()> {
    let header = tree.header();
    if header.free_nodes >= needed {
        return Ok(());
    }
    let room = MAX_TREE_NODES - header.total_nodes;
    let shortfall = needed - header.free_nodes;
    if room < shortfall {
        return Err(HfsError::OutOfSpace { requested: shortfall });
    }

    // Grow by at least a clump of nodes to avoid doing this on every insert
    let nodes = shortfall.max(16).min(room);
    let blocks = (nodes * NODE_SIZE as u32).div_ceil(block_size);
    let mut fork = *tree.fork();

    let last = fork.extents.iter().rposition(|e| !e.is_empty());
    match last {
        Some(i)
            if fork.extents[i].block_count as u32 + blocks <= u16::MAX as u32
                && bitmap.is_range_free(fork.extents[i].end(), blocks) =>
        {
            bitmap.allocate_at(fork.extents[i].end(), blocks)?;
            fork.extents[i].block_count += blocks as u16;
        }
        _ => {
            let slot = fork
                .extents
                .iter()
                .position(|e| e.is_empty())
                .ok_or(HfsError::OutOfSpace { requested: blocks })?;
            fork.extents[slot] = bitmap.allocate(blocks)?;
        }
    }

    let physical: u32 = fork.extents.iter().map(|e| e.block_count as u32).sum::<u32>() * block_size;
    fork.physical_size = physical;
    fork.logical_size = physical.min(MAX_TREE_NODES * NODE_SIZE as u32) / NODE_SIZE as u32
        * NODE_SIZE as u32;
    log::debug!(
        "Growing B-tree file {} by {} blocks to {} bytes",
        tree.file_id(),
        blocks,
        fork.logical_size
    );
    tree.extend(fork);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hfs::block::MemoryBlockStore;
    use crate::hfs::mdb::Geometry;

    const TREE_BLOCKS: u16 = 16;

    fn setup() -> (BlockDevice, ExtentsOverflow, AllocationBitmap) {
        let device = BlockDevice::new(Box::new(MemoryBlockStore::new(1024 * 1024)));
        let geometry = Geometry {
            first_alloc_sector: 0,
            block_size: 512,
            total_blocks: 2048,
        };
        let mut bitmap = AllocationBitmap::new(2048);
        bitmap.allocate_at(0, TREE_BLOCKS as u32).unwrap();

        let mut extents = ExtentRecord::default();
        extents[0] = ExtentDescriptor::new(0, TREE_BLOCKS);
        let fork = ForkData {
            logical_size: TREE_BLOCKS as u32 * 512,
            physical_size: TREE_BLOCKS as u32 * 512,
            extents,
        };
        let tree = BTree::create(ExtentsLayout, EXTENTS_FILE_ID, fork, geometry, 16);
        (device, ExtentsOverflow::new(tree), bitmap)
    }

    fn data_fork(file_id: u32) -> ForkRef {
        ForkRef {
            file_id,
            fork_type: ForkType::Data,
        }
    }

    #[test]
    fn test_key_order() {
        let layout = ExtentsLayout;
        let key = |file_id, fork_type, start_block| ExtentKey {
            fork_type,
            file_id,
            start_block,
        };
        assert_eq!(
            layout.compare(&key(16, ForkType::Resource, 0), &key(17, ForkType::Data, 0)),
            Ordering::Less
        );
        assert_eq!(
            layout.compare(&key(16, ForkType::Resource, 0), &key(16, ForkType::Data, 9)),
            Ordering::Greater
        );
        let encoded = layout.encode_key(&key(0x01020304, ForkType::Resource, 7));
        assert_eq!(encoded, vec![0xFF, 1, 2, 3, 4, 0, 7]);
        assert_eq!(
            layout.decode_key(&encoded).unwrap(),
            key(0x01020304, ForkType::Resource, 7)
        );
    }

    #[test]
    fn test_grow_extends_in_place() {
        let (device, mut overflow, mut bitmap) = setup();
        let mut fork = ForkData::default();
        overflow.grow(&device, &mut bitmap, data_fork(16), &mut fork, 512, 4).unwrap();
        overflow.grow(&device, &mut bitmap, data_fork(16), &mut fork, 512, 2).unwrap();

        assert_eq!(fork.extents[0], ExtentDescriptor::new(16, 6));
        assert!(fork.extents[1].is_empty());
        assert_eq!(fork.physical_size, 6 * 512);
        assert_eq!(
            overflow.resolve(&device, data_fork(16), &fork, 5).unwrap(),
            PhysicalRun {
                start_block: 21,
                block_count: 1
            }
        );
    }

    #[test]
    fn test_grow_moves_when_tail_is_partly_taken() {
        let (device, mut overflow, mut bitmap) = setup();
        let mut fork = ForkData::default();
        overflow.grow(&device, &mut bitmap, data_fork(16), &mut fork, 512, 4).unwrap();
        bitmap.allocate_at(22, 1).unwrap();

        // Two free blocks follow the fork; six are wanted in one run
        overflow.grow(&device, &mut bitmap, data_fork(16), &mut fork, 512, 6).unwrap();
        assert_eq!(fork.extents[0], ExtentDescriptor::new(16, 4));
        assert_eq!(fork.extents[1], ExtentDescriptor::new(23, 6));
        assert!(!bitmap.is_used(20));
        assert!(!bitmap.is_used(21));
        assert_eq!(fork.physical_size, 10 * 512);
    }

    #[test]
    fn test_grow_skips_held_blocks() {
        let (device, mut overflow, mut bitmap) = setup();
        let (a, b) = (data_fork(16), data_fork(17));
        let mut fork_a = ForkData::default();
        let mut fork_b = ForkData::default();
        overflow.grow(&device, &mut bitmap, a, &mut fork_a, 512, 4).unwrap();
        overflow.release(&device, &mut bitmap, a, &mut fork_a, 512).unwrap();

        overflow.grow(&device, &mut bitmap, b, &mut fork_b, 512, 2).unwrap();
        assert_eq!(fork_b.extents[0], ExtentDescriptor::new(20, 2));

        bitmap.release_held();
        overflow.grow(&device, &mut bitmap, a, &mut fork_a, 512, 2).unwrap();
        assert_eq!(fork_a.extents[0], ExtentDescriptor::new(16, 2));
    }

    #[test]
    fn test_growth_spills_into_overflow_records() {
        let (device, mut overflow, mut bitmap) = setup();
        let free_before = bitmap.free_blocks();
        let (a, b) = (data_fork(16), data_fork(17));
        let mut fork_a = ForkData::default();
        let mut fork_b = ForkData::default();

        // Interleaved growth keeps each fork from extending in place
        for _ in 0..5 {
            overflow.grow(&device, &mut bitmap, a, &mut fork_a, 512, 2).unwrap();
            overflow.grow(&device, &mut bitmap, b, &mut fork_b, 512, 2).unwrap();
        }

        let extents = overflow.extents_of(&device, a, &fork_a).unwrap();
        assert_eq!(extents.len(), 5);
        assert_eq!(extents[3], ExtentDescriptor::new(28, 2));
        assert_eq!(overflow.tree().header().leaf_records, 2);

        // Last inline block, first overflow block, and past the end
        assert_eq!(overflow.resolve(&device, a, &fork_a, 5).unwrap().start_block, 25);
        assert_eq!(overflow.resolve(&device, a, &fork_a, 6).unwrap().start_block, 28);
        assert_eq!(overflow.resolve(&device, a, &fork_a, 9).unwrap().start_block, 33);
        assert!(matches!(
            overflow.resolve(&device, a, &fork_a, 10),
            Err(HfsError::ExtentNotFound { file_id: 16, block: 10 })
        ));

        overflow.shrink(&device, &mut bitmap, a, &mut fork_a, 512, 7).unwrap();
        assert_eq!(overflow.extents_of(&device, a, &fork_a).unwrap().len(), 4);
        assert_eq!(fork_a.physical_size, 7 * 512);
        assert!(!bitmap.is_used(29));

        overflow.release(&device, &mut bitmap, a, &mut fork_a, 512).unwrap();
        overflow.release(&device, &mut bitmap, b, &mut fork_b, 512).unwrap();
        assert_eq!(fork_a, ForkData::default());
        assert_eq!(bitmap.free_blocks(), free_before);
        assert_eq!(overflow.tree().header().leaf_records, 0);
        overflow.tree().verify(&device).unwrap();
    }

    #[test]
    fn test_grow_fails_without_space() {
        let (device, mut overflow, mut bitmap) = setup();
        let mut fork = ForkData::default();
        let result = overflow.grow(&device, &mut bitmap, data_fork(16), &mut fork, 512, 5000);
        assert!(matches!(result, Err(HfsError::OutOfSpace { .. })));
    }

    #[test]
    fn test_reserve_tree_nodes_grows_adjacent() {
        let (_device, mut overflow, mut bitmap) = setup();
        reserve_tree_nodes(overflow.tree_mut(), &mut bitmap, 512, 40).unwrap();

        let tree = overflow.tree();
        assert_eq!(tree.fork().extents[0], ExtentDescriptor::new(0, 16 + 25));
        assert_eq!(tree.header().total_nodes, 41);
        assert_eq!(tree.header().free_nodes, 40);
        assert!(bitmap.is_used(40));
        assert!(!bitmap.is_used(41));
    }

    #[test]
    fn test_reserve_tree_nodes_uses_free_slot() {
        let (_device, mut overflow, mut bitmap) = setup();
        bitmap.allocate_at(16, 1).unwrap();
        reserve_tree_nodes(overflow.tree_mut(), &mut bitmap, 512, 20).unwrap();
        assert_eq!(overflow.tree().fork().extents[1], ExtentDescriptor::new(17, 16));
        assert_eq!(overflow.tree().header().total_nodes, 32);
    }
}
