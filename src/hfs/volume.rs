//! Mounted HFS volume
//!
//! `HfsVolume` ties the block device, MDB, bitmap, extents overflow file and
//! catalog together behind path-based operations. Readers share the state
//! lock; every mutation takes it exclusively and either completes or leaves
//! the in-memory structures exactly as they were.

use parking_lot::RwLock;
use serde::Serialize;
use std::path::Path;
use std::time::SystemTime;

use crate::config::EngineConfig;

use super::bitmap::AllocationBitmap;
use super::block::{BlockDevice, BlockStore, FileBlockStore, SECTOR_SIZE};
use super::btree::{BTree, TreeStats};
use super::catalog::{
    path_components, Catalog, CatalogEntry, CatalogLayout, CatalogRecord, NewEntry,
    CATALOG_FILE_ID, FILE_LOCKED, ROOT_FOLDER_ID,
};
use super::entry::{FileSystemAttributes, ItemAttributes};
use super::error::{HfsError, Result};
use super::extents::{
    reserve_tree_nodes, ExtentDescriptor, ExtentsLayout, ExtentsOverflow, ForkData, ForkRef,
    ForkType, EXTENTS_FILE_ID,
};
use super::flush::{self, FlushTargets, FlushTracker};
use super::macroman;
use super::mdb::{mac_now, to_mac_date, Geometry, MasterDirectoryBlock, MDB_SECTOR};

/// Everything a mounted volume keeps in memory
struct VolumeState {
    device: BlockDevice,
    mdb: MasterDirectoryBlock,
    bitmap: AllocationBitmap,
    catalog: Catalog,
    extents: ExtentsOverflow,
    tracker: FlushTracker,
}

impl VolumeState {
    fn geometry(&self) -> Geometry {
        self.mdb.geometry()
    }

    fn resolve(&self, path: &str) -> Result<CatalogEntry> {
        self.catalog.resolve_path(&self.device, path)
    }

    fn resolve_folder(&self, path: &str) -> Result<CatalogEntry> {
        let entry = self.resolve(path)?;
        if !entry.is_folder() {
            return Err(HfsError::NotADirectory(path.to_string()));
        }
        Ok(entry)
    }

    /// Make room in the catalog file for `inserts` leaf insertions
    fn reserve_catalog(&mut self, inserts: u32) -> Result<()> {
        let per_insert = self.catalog.tree().header().depth as u32 + 1;
        reserve_tree_nodes(
            self.catalog.tree_mut(),
            &mut self.bitmap,
            self.mdb.block_size,
            inserts * per_insert,
        )
    }

    /// Grow a fork until it owns enough blocks for `bytes`
    fn ensure_allocated(&mut self, fork_ref: ForkRef, fork: &mut ForkData, bytes: u64) -> Result<()> {
        let block_size = self.mdb.block_size;
        let needed = bytes.div_ceil(block_size as u64) as u32;
        let current = fork.allocated_blocks(block_size);
        if needed > current {
            self.extents.grow(
                &self.device,
                &mut self.bitmap,
                fork_ref,
                fork,
                block_size,
                needed - current,
            )?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        flush::commit(
            &mut self.tracker,
            FlushTargets {
                device: &self.device,
                mdb: &mut self.mdb,
                bitmap: &mut self.bitmap,
                catalog: &mut self.catalog,
                extents: &mut self.extents,
            },
            mac_now(),
        )
    }

    fn fork_io<'a>(&'a self, fork_ref: ForkRef, fork: &'a ForkData) -> ForkIo<'a> {
        ForkIo {
            device: &self.device,
            extents: &self.extents,
            geometry: self.geometry(),
            fork_ref,
            fork,
        }
    }
}

/// Byte-addressed access to one fork through its extents
struct ForkIo<'a> {
    device: &'a BlockDevice,
    extents: &'a ExtentsOverflow,
    geometry: Geometry,
    fork_ref: ForkRef,
    fork: &'a ForkData,
}

impl ForkIo<'_> {
    /// Walk the physical spans behind bytes `offset..offset + len`.
    /// `visit` gets the first sector, the byte offset inside it, the span
    /// length and the span's position relative to `offset`.
    fn for_each_span(
        &self,
        offset: u64,
        len: u64,
        mut visit: impl FnMut(u64, usize, usize, usize) -> Result<()>,
    ) -> Result<()> {
        let block_size = self.geometry.block_size as u64;
        let end = offset + len;
        let mut pos = offset;
        while pos < end {
            let run = self
                .extents
                .resolve(self.device, self.fork_ref, self.fork, (pos / block_size) as u32)?;
            let within = pos % block_size;
            let chunk = (end - pos).min(run.block_count as u64 * block_size - within);
            let sector = self.geometry.block_sector(run.start_block) + within / SECTOR_SIZE;
            visit(
                sector,
                (within % SECTOR_SIZE) as usize,
                chunk as usize,
                (pos - offset) as usize,
            )?;
            pos += chunk;
        }
        Ok(())
    }

    fn read(&self, offset: u64, len: u64) -> Result<Vec<u8>> {
        let mut out = vec![0u8; len as usize];
        self.for_each_span(offset, len, |sector, skip, count, at| {
            let sectors = (skip + count).div_ceil(SECTOR_SIZE as usize) as u64;
            let data = self.device.read_sectors(sector, sectors)?;
            out[at..at + count].copy_from_slice(&data[skip..skip + count]);
            Ok(())
        })?;
        Ok(out)
    }

    fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.for_each_span(offset, data.len() as u64, |sector, skip, count, at| {
            let sectors = (skip + count).div_ceil(SECTOR_SIZE as usize) as u64;
            let aligned = skip == 0 && count % SECTOR_SIZE as usize == 0;
            if aligned {
                return self.device.write_sectors(sector, &data[at..at + count]);
            }
            // Partial sector: read, patch, write back
            let mut buf = self.device.read_sectors(sector, sectors)?;
            buf[skip..skip + count].copy_from_slice(&data[at..at + count]);
            self.device.write_sectors(sector, &buf)
        })
    }

    fn zero(&self, offset: u64, len: u64) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        self.write(offset, &vec![0u8; len as usize])
    }
}

/// Outcome of [`HfsVolume::check_consistency`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsistencyReport {
    pub catalog: TreeStats,
    pub extents: TreeStats,
    pub files: u32,
    pub folders: u32,
    /// Blocks whose bitmap bit disagrees with the extents referencing them
    pub bitmap_mismatches: Vec<u32>,
    pub problems: Vec<String>,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.bitmap_mismatches.is_empty() && self.problems.is_empty()
    }
}

/// Mark an extent in the expected bitmap, noting blocks claimed twice
fn claim(
    expected: &mut AllocationBitmap,
    problems: &mut Vec<String>,
    owner: &str,
    extent: &ExtentDescriptor,
) {
    if expected
        .allocate_at(extent.start_block as u32, extent.block_count as u32)
        .is_err()
    {
        problems.push(format!(
            "{} claims blocks {}..{} which are outside the volume or already claimed",
            owner,
            extent.start_block,
            extent.end()
        ));
    }
}

/// Split a path into its parent folder path and final name
fn split_parent(path: &str) -> Result<(String, String)> {
    let components: Vec<&str> = path_components(path).collect();
    let Some((name, parent)) = components.split_last() else {
        return Err(HfsError::InvalidArgument(format!(
            "\"{}\" names the root folder",
            path
        )));
    };
    Ok((parent.join("/"), name.to_string()))
}

fn display_path(path: &str) -> String {
    format!("/{}", path_components(path).collect::<Vec<_>>().join("/"))
}

fn child_path(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent, name)
    }
}

fn locked_error(path: &str) -> HfsError {
    HfsError::InvalidArgument(format!("{} is locked", path))
}

/// A mounted HFS volume
pub struct HfsVolume {
    state: RwLock<VolumeState>,
    config: EngineConfig,
    closed: bool,
}

impl HfsVolume {
    /// Check whether a file or device holds a mountable HFS volume
    pub fn is_valid_volume(path: impl AsRef<Path>) -> bool {
        let Ok(store) = FileBlockStore::open(path.as_ref()) else {
            return false;
        };
        Self::read_mdb(&BlockDevice::new(Box::new(store))).is_ok()
    }

    fn read_mdb(device: &BlockDevice) -> Result<MasterDirectoryBlock> {
        if device.total_sectors() <= MDB_SECTOR {
            return Err(HfsError::InvalidFormat(format!(
                "image of {} sectors is too small",
                device.total_sectors()
            )));
        }
        let mdb = MasterDirectoryBlock::parse(&device.read_sectors(MDB_SECTOR, 1)?)?;
        mdb.validate(device.total_sectors())?;
        Ok(mdb)
    }

    pub fn mount(path: impl AsRef<Path>) -> Result<Self> {
        Self::mount_with_config(path, EngineConfig::default())
    }

    pub fn mount_with_config(path: impl AsRef<Path>, config: EngineConfig) -> Result<Self> {
        let path = path.as_ref();
        log::info!("Mounting HFS volume from {}", path.display());
        let store = FileBlockStore::open(path)?;
        Self::mount_store(Box::new(store), config)
    }

    /// Mount the volume held by any block store
    pub fn mount_store(store: Box<dyn BlockStore>, config: EngineConfig) -> Result<Self> {
        let device = BlockDevice::new(store);
        let mut mdb = Self::read_mdb(&device)?;
        let geometry = mdb.geometry();

        let bitmap = AllocationBitmap::load(&device, &mdb)?;
        if bitmap.free_blocks() != mdb.free_blocks as u32 {
            log::warn!(
                "MDB reports {} free blocks but the bitmap has {}; using the bitmap",
                mdb.free_blocks,
                bitmap.free_blocks()
            );
            mdb.free_blocks = bitmap.free_blocks() as u16;
        }

        let extents = ExtentsOverflow::new(BTree::open(
            &device,
            ExtentsLayout,
            EXTENTS_FILE_ID,
            mdb.extents_file,
            geometry,
            config.node_cache_capacity,
        )?);
        let catalog = Catalog::new(BTree::open(
            &device,
            CatalogLayout {
                case_sensitive: config.case_sensitive,
            },
            CATALOG_FILE_ID,
            mdb.catalog_file,
            geometry,
            config.node_cache_capacity,
        )?);
        catalog
            .entry_for_id(&device, ROOT_FOLDER_ID)
            .map_err(|err| HfsError::InvalidFormat(format!("root folder is missing: {}", err)))?;

        if !mdb.is_consistent() {
            log::warn!(
                "Volume \"{}\" was not cleanly unmounted",
                mdb.volume_name()
            );
        }
        log::info!(
            "Mounted \"{}\": {} blocks of {} bytes, {} free, {} files, {} folders",
            mdb.volume_name(),
            mdb.total_blocks,
            mdb.block_size,
            bitmap.free_blocks(),
            mdb.file_count,
            mdb.folder_count
        );

        let tracker = FlushTracker::new(mdb.is_consistent());
        Ok(Self {
            state: RwLock::new(VolumeState {
                device,
                mdb,
                bitmap,
                catalog,
                extents,
                tracker,
            }),
            config,
            closed: false,
        })
    }

    pub fn format_and_mount(path: impl AsRef<Path>) -> Result<Self> {
        Self::format_and_mount_with_config(path, EngineConfig::default())
    }

    /// Format an image file, creating it at the configured size if missing
    pub fn format_and_mount_with_config(path: impl AsRef<Path>, config: EngineConfig) -> Result<Self> {
        let path = path.as_ref();
        let store = if path.exists() {
            FileBlockStore::open(path)?
        } else {
            log::info!(
                "Creating {} byte image at {}",
                config.format.default_size,
                path.display()
            );
            FileBlockStore::create(path, config.format.default_size)?
        };
        Self::format_store(Box::new(store), config)
    }

    /// Lay out an empty volume on a block store. Nothing but the boot
    /// blocks is written until the first flush.
    pub fn format_store(store: Box<dyn BlockStore>, config: EngineConfig) -> Result<Self> {
        let device = BlockDevice::new(store);
        let now = mac_now();
        let mut mdb =
            MasterDirectoryBlock::format(device.total_sectors(), &config.format.options(), now)?;
        let geometry = mdb.geometry();

        let mut bitmap = AllocationBitmap::new(geometry.total_blocks);
        for fork in [&mdb.extents_file, &mdb.catalog_file] {
            for extent in fork.extents.iter().filter(|e| !e.is_empty()) {
                bitmap.allocate_at(extent.start_block as u32, extent.block_count as u32)?;
            }
        }

        let extents = ExtentsOverflow::new(BTree::create(
            ExtentsLayout,
            EXTENTS_FILE_ID,
            mdb.extents_file,
            geometry,
            config.node_cache_capacity,
        ));
        let mut catalog = Catalog::new(BTree::create(
            CatalogLayout {
                case_sensitive: config.case_sensitive,
            },
            CATALOG_FILE_ID,
            mdb.catalog_file,
            geometry,
            config.node_cache_capacity,
        ));
        catalog.create_root(&device, &mdb.volume_name, now)?;
        mdb.free_blocks = bitmap.free_blocks() as u16;

        device.write_sectors(0, &[0u8; 2 * SECTOR_SIZE as usize])?;

        log::info!(
            "Formatted \"{}\": {} blocks of {} bytes",
            mdb.volume_name(),
            mdb.total_blocks,
            mdb.block_size
        );

        let mut tracker = FlushTracker::new(false);
        tracker.record_write();
        Ok(Self {
            state: RwLock::new(VolumeState {
                device,
                mdb,
                bitmap,
                catalog,
                extents,
                tracker,
            }),
            config,
            closed: false,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run `op` under the exclusive lock. On error the MDB, bitmap and both
    /// trees are put back the way they were before `op` started.
    ///
    /// Blocks freed since the last flush cannot be reused, so an operation
    /// that runs out of space while some are held is retried once after a
    /// flush releases them.
    fn mutate<T>(&self, mut op: impl FnMut(&mut VolumeState, u32) -> Result<T>) -> Result<T> {
        let mut guard = self.state.write();
        let state = &mut *guard;
        if state.mdb.is_locked() {
            return Err(HfsError::InvalidArgument("volume is software locked".to_string()));
        }

        match Self::apply(state, &mut op) {
            Err(HfsError::OutOfSpace { .. }) if state.bitmap.held_blocks() > 0 => {
                log::info!(
                    "Out of space with {} freed blocks awaiting a flush, flushing and retrying",
                    state.bitmap.held_blocks()
                );
                state.flush()?;
                Self::apply(state, &mut op)
            }
            other => other,
        }
    }

    fn apply<T>(
        state: &mut VolumeState,
        op: &mut impl FnMut(&mut VolumeState, u32) -> Result<T>,
    ) -> Result<T> {
        let mdb = state.mdb.clone();
        let bitmap = state.bitmap.clone();
        let owns_catalog = state.catalog.tree_mut().begin();
        let owns_extents = state.extents.tree_mut().begin();

        let now = mac_now();
        let result = op(state, now);
        match &result {
            Ok(_) => {
                if owns_catalog {
                    state.catalog.tree_mut().commit();
                }
                if owns_extents {
                    state.extents.tree_mut().commit();
                }
                state.mdb.mark_dirty(now);
                state.tracker.record_write();
            }
            Err(err) => {
                log::debug!("Rolling back failed operation: {}", err);
                if owns_catalog {
                    state.catalog.tree_mut().rollback();
                }
                if owns_extents {
                    state.extents.tree_mut().rollback();
                }
                state.mdb = mdb;
                state.bitmap = bitmap;
            }
        }
        result
    }

    pub fn attributes_of_file_system(&self) -> FileSystemAttributes {
        let state = self.state.read();
        FileSystemAttributes::from_mdb(&state.mdb, state.bitmap.free_blocks())
    }

    pub fn attributes_of_item(&self, path: &str) -> Result<ItemAttributes> {
        let state = self.state.read();
        let entry = state.resolve(path)?;
        Ok(ItemAttributes::from_entry(
            &entry,
            &display_path(path),
            state.mdb.block_size,
        ))
    }

    /// Folders and files directly inside a folder, in catalog order
    pub fn contents_of_directory(&self, path: &str) -> Result<Vec<ItemAttributes>> {
        let state = self.state.read();
        let folder = state.resolve_folder(path)?;
        let parent = display_path(path);
        let items: Result<Vec<ItemAttributes>> = state
            .catalog
            .children(&state.device, folder.id())?
            .map(|child| {
                let child = child?;
                let path = child_path(&parent, &child.name());
                Ok(ItemAttributes::from_entry(&child, &path, state.mdb.block_size))
            })
            .collect();
        items
    }

    pub fn create_directory(&self, path: &str) -> Result<ItemAttributes> {
        self.create(path, NewEntry::Folder)
    }

    pub fn create_file(&self, path: &str) -> Result<ItemAttributes> {
        self.create(path, NewEntry::File)
    }

    fn create(&self, path: &str, kind: NewEntry) -> Result<ItemAttributes> {
        let (parent, name) = split_parent(path)?;
        let entry = self.mutate(|state, now| {
            let folder = state.resolve_folder(&parent)?;
            state.reserve_catalog(2)?;
            state.catalog.create_entry(
                &state.device,
                &mut state.mdb,
                folder.id(),
                &name,
                kind,
                now,
            )
        })?;
        log::info!("Created {:?} {}", kind, display_path(path));
        Ok(ItemAttributes::from_entry(
            &entry,
            &display_path(path),
            self.state.read().mdb.block_size,
        ))
    }

    /// Remove a file or an empty folder, releasing the blocks of both forks
    pub fn remove_item(&self, path: &str) -> Result<()> {
        self.mutate(|state, now| {
            let entry = state.resolve(path)?;
            if entry.id() == ROOT_FOLDER_ID {
                return Err(HfsError::InvalidArgument("cannot remove the root folder".to_string()));
            }
            let record = state.catalog.remove_entry(
                &state.device,
                &mut state.mdb,
                entry.key.parent_id,
                &entry.key.name,
                now,
            )?;
            if let CatalogRecord::File(mut file) = record {
                let block_size = state.mdb.block_size;
                for fork_type in [ForkType::Data, ForkType::Resource] {
                    let fork_ref = ForkRef {
                        file_id: file.file_id,
                        fork_type,
                    };
                    state.extents.release(
                        &state.device,
                        &mut state.bitmap,
                        fork_ref,
                        file.fork_mut(fork_type),
                        block_size,
                    )?;
                }
            }
            Ok(())
        })?;
        log::info!("Removed {}", display_path(path));
        Ok(())
    }

    /// Move and/or rename a file or folder
    pub fn move_item(&self, from: &str, to: &str) -> Result<ItemAttributes> {
        let (parent, name) = split_parent(to)?;
        let entry = self.mutate(|state, now| {
            let entry = state.resolve(from)?;
            let folder = state.resolve_folder(&parent)?;
            state.reserve_catalog(1)?;
            state.catalog.rename_entry(
                &state.device,
                &mut state.mdb,
                &entry,
                folder.id(),
                &name,
                now,
            )
        })?;
        log::info!("Moved {} to {}", display_path(from), display_path(to));
        Ok(ItemAttributes::from_entry(
            &entry,
            &display_path(to),
            self.state.read().mdb.block_size,
        ))
    }

    pub fn read_file(&self, path: &str, offset: u64, len: u64) -> Result<Vec<u8>> {
        self.read_fork(path, ForkType::Data, offset, len)
    }

    /// Read up to `len` bytes; reads past the end of the fork come back short
    pub fn read_fork(&self, path: &str, fork_type: ForkType, offset: u64, len: u64) -> Result<Vec<u8>> {
        let state = self.state.read();
        let entry = state.resolve(path)?;
        let CatalogRecord::File(file) = &entry.record else {
            return Err(HfsError::IsADirectory(path.to_string()));
        };
        let fork = file.fork(fork_type);
        let size = fork.logical_size as u64;
        if offset >= size {
            return Ok(Vec::new());
        }
        let len = len.min(size - offset);
        let fork_ref = ForkRef {
            file_id: file.file_id,
            fork_type,
        };
        state.fork_io(fork_ref, fork).read(offset, len)
    }

    pub fn write_file(&self, path: &str, offset: u64, data: &[u8]) -> Result<usize> {
        self.write_fork(path, ForkType::Data, offset, data)
    }

    /// Write `data` at `offset`, growing the fork as needed. Any gap between
    /// the old end of the fork and `offset` reads back as zeros.
    pub fn write_fork(&self, path: &str, fork_type: ForkType, offset: u64, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let end = offset
            .checked_add(data.len() as u64)
            .filter(|&end| end <= u32::MAX as u64)
            .ok_or_else(|| {
                HfsError::InvalidArgument(format!("write past the 4 GiB fork limit in {}", path))
            })?;

        self.mutate(|state, now| {
            let entry = state.resolve(path)?;
            let CatalogRecord::File(mut file) = entry.record else {
                return Err(HfsError::IsADirectory(path.to_string()));
            };
            if file.is_locked() {
                return Err(locked_error(path));
            }
            let fork_ref = ForkRef {
                file_id: file.file_id,
                fork_type,
            };
            let fork = file.fork_mut(fork_type);
            state.ensure_allocated(fork_ref, fork, end)?;

            let old_size = fork.logical_size as u64;
            let io = state.fork_io(fork_ref, fork);
            if offset > old_size {
                io.zero(old_size, offset - old_size)?;
            }
            io.write(offset, data)?;

            fork.logical_size = old_size.max(end) as u32;
            file.modify_date = now;
            state
                .catalog
                .update_record(&state.device, &entry.key, CatalogRecord::File(file))
        })?;
        log::debug!("Wrote {} bytes at {} to {}", data.len(), offset, path);
        Ok(data.len())
    }

    /// Set the data fork length, freeing or zero-filling as needed
    pub fn truncate(&self, path: &str, len: u64) -> Result<()> {
        if len > u32::MAX as u64 {
            return Err(HfsError::InvalidArgument(format!(
                "{} bytes exceeds the fork size limit",
                len
            )));
        }
        self.mutate(|state, now| {
            let entry = state.resolve(path)?;
            let CatalogRecord::File(mut file) = entry.record else {
                return Err(HfsError::IsADirectory(path.to_string()));
            };
            if file.is_locked() {
                return Err(locked_error(path));
            }
            let fork_ref = ForkRef {
                file_id: file.file_id,
                fork_type: ForkType::Data,
            };
            let block_size = state.mdb.block_size;
            let fork = &mut file.data_fork;
            let old_size = fork.logical_size as u64;
            if len < old_size {
                let keep = len.div_ceil(block_size as u64) as u32;
                state
                    .extents
                    .shrink(&state.device, &mut state.bitmap, fork_ref, fork, block_size, keep)?;
            } else if len > old_size {
                state.ensure_allocated(fork_ref, fork, len)?;
                state.fork_io(fork_ref, fork).zero(old_size, len - old_size)?;
            }
            fork.logical_size = len as u32;
            file.modify_date = now;
            state
                .catalog
                .update_record(&state.device, &entry.key, CatalogRecord::File(file))
        })
    }

    pub fn set_locked(&self, path: &str, locked: bool) -> Result<()> {
        self.mutate(|state, _| {
            let entry = state.resolve(path)?;
            let CatalogRecord::File(mut file) = entry.record else {
                return Err(HfsError::IsADirectory(path.to_string()));
            };
            if locked {
                file.flags |= FILE_LOCKED;
            } else {
                file.flags &= !FILE_LOCKED;
            }
            state
                .catalog
                .update_record(&state.device, &entry.key, CatalogRecord::File(file))
        })
    }

    /// Change creation and/or modification dates of a file or folder
    pub fn set_times(
        &self,
        path: &str,
        created: Option<SystemTime>,
        modified: Option<SystemTime>,
    ) -> Result<()> {
        self.mutate(|state, _| {
            let mut entry = state.resolve(path)?;
            let (create_date, modify_date) = match &mut entry.record {
                CatalogRecord::File(file) => (&mut file.create_date, &mut file.modify_date),
                CatalogRecord::Folder(folder) => (&mut folder.create_date, &mut folder.modify_date),
                CatalogRecord::FolderThread(_) | CatalogRecord::FileThread(_) => {
                    return Err(HfsError::PathNotFound(path.to_string()));
                }
            };
            if let Some(time) = created {
                *create_date = to_mac_date(time);
            }
            if let Some(time) = modified {
                *modify_date = to_mac_date(time);
            }
            state
                .catalog
                .update_record(&state.device, &entry.key, entry.record)
        })
    }

    pub fn volume_name(&self) -> String {
        self.state.read().mdb.volume_name()
    }

    /// Rename the volume; the root folder follows
    pub fn set_volume_name(&self, name: &str) -> Result<()> {
        let encoded = macroman::encode_volume_name(name)?;
        self.mutate(|state, _| {
            state.reserve_catalog(1)?;
            state.catalog.rename_root(&state.device, &encoded)?;
            state.mdb.volume_name = encoded.clone();
            Ok(())
        })?;
        log::info!("Renamed volume to \"{}\"", name);
        Ok(())
    }

    /// Mutations since the last successful flush
    pub fn write_count_since_last_flush(&self) -> u64 {
        self.state.read().tracker.write_count()
    }

    /// When the volume first became dirty, if it is
    pub fn dirty_timestamp(&self) -> Option<SystemTime> {
        self.state.read().tracker.dirty_since()
    }

    /// Verify both B-trees and rebuild the bitmap from every extent
    pub fn check_consistency(&self) -> Result<ConsistencyReport> {
        let state = self.state.read();
        let device = &state.device;
        let catalog = state.catalog.tree().verify(device)?;
        let extents = state.extents.tree().verify(device)?;

        let block_size = state.mdb.block_size;
        let mut expected = AllocationBitmap::new(state.bitmap.total_blocks());
        let mut problems = Vec::new();
        for (owner, fork) in [
            ("extents file", state.extents.tree().fork()),
            ("catalog file", state.catalog.tree().fork()),
        ] {
            for extent in fork.extents.iter().filter(|e| !e.is_empty()) {
                claim(&mut expected, &mut problems, owner, extent);
            }
        }

        let (mut files, mut folders) = (0u32, 0u32);
        for entry in state.catalog.entries(device) {
            let entry = entry?;
            match &entry.record {
                CatalogRecord::File(file) => {
                    files += 1;
                    for fork_type in [ForkType::Data, ForkType::Resource] {
                        let fork = file.fork(fork_type);
                        let fork_ref = ForkRef {
                            file_id: file.file_id,
                            fork_type,
                        };
                        let owner = format!("file {} {:?} fork", file.file_id, fork_type);
                        let list = state.extents.extents_of(device, fork_ref, fork)?;
                        let blocks: u32 = list.iter().map(|e| e.block_count as u32).sum();
                        if blocks * block_size != fork.physical_size {
                            problems.push(format!(
                                "{} has {} bytes of extents but records {}",
                                owner,
                                blocks * block_size,
                                fork.physical_size
                            ));
                        }
                        if fork.logical_size > fork.physical_size {
                            problems.push(format!(
                                "{} is {} bytes long but owns {}",
                                owner, fork.logical_size, fork.physical_size
                            ));
                        }
                        for extent in &list {
                            claim(&mut expected, &mut problems, &owner, extent);
                        }
                    }
                }
                CatalogRecord::Folder(folder) => {
                    if folder.folder_id != ROOT_FOLDER_ID {
                        folders += 1;
                    }
                    let children = state
                        .catalog
                        .children(device, folder.folder_id)?
                        .collect::<Result<Vec<_>>>()?
                        .len();
                    if children != folder.valence as usize {
                        problems.push(format!(
                            "folder {} has valence {} but {} children",
                            folder.folder_id, folder.valence, children
                        ));
                    }
                }
                CatalogRecord::FolderThread(_) | CatalogRecord::FileThread(_) => {}
            }
        }

        if files != state.mdb.file_count {
            problems.push(format!(
                "MDB counts {} files, catalog holds {}",
                state.mdb.file_count, files
            ));
        }
        if folders != state.mdb.folder_count {
            problems.push(format!(
                "MDB counts {} folders, catalog holds {}",
                state.mdb.folder_count, folders
            ));
        }

        let report = ConsistencyReport {
            catalog,
            extents,
            files,
            folders,
            bitmap_mismatches: state.bitmap.mismatches(&expected),
            problems,
        };
        if !report.is_consistent() {
            log::warn!(
                "Consistency check found {} bitmap mismatches and {} problems",
                report.bitmap_mismatches.len(),
                report.problems.len()
            );
        }
        Ok(report)
    }

    /// Commit all pending metadata; a no-op when nothing changed
    pub fn flush(&self) -> Result<()> {
        self.state.write().flush()
    }

    /// Flush and release the volume
    pub fn unmount(mut self) -> Result<()> {
        self.flush()?;
        self.closed = true;
        log::info!("Unmounted \"{}\"", self.volume_name());
        Ok(())
    }
}

impl Drop for HfsVolume {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if !self.closed && state.tracker.is_dirty() {
            log::warn!(
                "Volume \"{}\" dropped with {} unflushed changes",
                state.mdb.volume_name(),
                state.tracker.write_count()
            );
        }
    }
}
