//! Dirty-state bookkeeping and the ordered commit of metadata to storage
//!
//! A flush writes tree nodes first, then the volume bitmap, then the
//! primary MDB with its consistent bit set, then the alternate MDB. Before
//! the first of those writes the on-disk MDB is marked inconsistent, so a
//! header that claims consistency never sits in front of half-written trees.

use std::time::SystemTime;

use super::bitmap::AllocationBitmap;
use super::block::BlockDevice;
use super::catalog::Catalog;
use super::error::Result;
use super::extents::{ExtentsOverflow, ForkData};
use super::mdb::{MasterDirectoryBlock, MDB_SECTOR};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushPhase {
    /// Storage matches memory
    Clean,
    /// Memory holds changes not yet written
    Dirty,
    /// Nodes and bitmap are going out; the header is still pending
    Flushing,
}

/// Tracks writes since the last successful flush
#[derive(Debug, Clone)]
pub struct FlushTracker {
    write_count: u64,
    dirty_since: Option<SystemTime>,
    phase: FlushPhase,
    /// The MDB on storage has its consistent bit cleared
    marked_on_disk: bool,
}

impl FlushTracker {
    /// Tracker for a volume whose on-disk header is `consistent` or not
    pub fn new(consistent: bool) -> Self {
        Self {
            write_count: 0,
            dirty_since: None,
            phase: FlushPhase::Clean,
            marked_on_disk: !consistent,
        }
    }

    pub fn record_write(&mut self) {
        self.write_count += 1;
        self.dirty_since.get_or_insert_with(SystemTime::now);
        self.phase = FlushPhase::Dirty;
    }

    pub fn write_count(&self) -> u64 {
        self.write_count
    }

    pub fn dirty_since(&self) -> Option<SystemTime> {
        self.dirty_since
    }

    pub fn phase(&self) -> FlushPhase {
        self.phase
    }

    pub fn is_dirty(&self) -> bool {
        self.phase != FlushPhase::Clean
    }

    fn reset(&mut self) {
        self.write_count = 0;
        self.dirty_since = None;
        self.phase = FlushPhase::Clean;
        self.marked_on_disk = false;
    }
}

/// The resident metadata a flush writes out
pub struct FlushTargets<'a> {
    pub device: &'a BlockDevice,
    pub mdb: &'a mut MasterDirectoryBlock,
    pub bitmap: &'a mut AllocationBitmap,
    pub catalog: &'a mut Catalog,
    pub extents: &'a mut ExtentsOverflow,
}

/// Commit all dirty metadata; a no-op when nothing changed since the last
/// flush. On failure every dirty flag is kept so the flush can be retried.
pub fn commit(tracker: &mut FlushTracker, targets: FlushTargets<'_>, now: u32) -> Result<()> {
    if !tracker.is_dirty() {
        return Ok(());
    }
    tracker.phase = FlushPhase::Flushing;
    match write_all(tracker, targets, now) {
        Ok(()) => {
            tracker.reset();
            Ok(())
        }
        Err(err) => {
            log::warn!("Flush failed, volume stays dirty: {}", err);
            tracker.phase = FlushPhase::Dirty;
            Err(err)
        }
    }
}

fn write_all(tracker: &mut FlushTracker, targets: FlushTargets<'_>, now: u32) -> Result<()> {
    let FlushTargets {
        device,
        mdb,
        bitmap,
        catalog,
        extents,
    } = targets;

    let mut header = mdb.clone();
    header.free_blocks = bitmap.free_blocks() as u16;
    header.catalog_file = *catalog.tree().fork();
    header.extents_file = *extents.tree().fork();

    // The marker must describe tree files at least as large as the nodes
    // about to be written, so it is rewritten whenever a tree file grew
    let forks_moved = !same_extents(&header.catalog_file, &mdb.catalog_file)
        || !same_extents(&header.extents_file, &mdb.extents_file);
    if !tracker.marked_on_disk || forks_moved {
        let mut marker = header.clone();
        marker.mark_dirty(mdb.modify_date);
        device.write_sectors(MDB_SECTOR, &marker.encode())?;
        device.sync()?;
        tracker.marked_on_disk = true;
    }

    let nodes = catalog.tree().write_dirty(device)? + extents.tree().write_dirty(device)?;
    log::debug!("Flushed {} B-tree nodes", nodes);

    if bitmap.is_dirty() {
        device.write_sectors(mdb.bitmap_start as u64, bitmap.as_bytes())?;
        log::debug!("Flushed volume bitmap ({} free blocks)", bitmap.free_blocks());
    }

    header.write_count = header.write_count.wrapping_add(1);
    header.modify_date = now;
    header.clear_dirty();
    let encoded = header.encode();
    device.write_sectors(MDB_SECTOR, &encoded)?;
    device.write_sectors(
        MasterDirectoryBlock::alternate_sector(device.total_sectors()),
        &encoded,
    )?;
    device.sync()?;
    log::debug!("Flushed MDB, write count {}", header.write_count);

    *mdb = header;
    catalog.tree_mut().mark_clean();
    extents.tree_mut().mark_clean();
    bitmap.mark_clean();
    // Storage no longer references blocks freed before this flush
    bitmap.release_held();
    Ok(())
}

/// The MDB records only the logical size and first extents of a tree file
fn same_extents(a: &ForkData, b: &ForkData) -> bool {
    a.logical_size == b.logical_size && a.extents == b.extents
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracker_phases() {
        let mut tracker = FlushTracker::new(true);
        assert_eq!(tracker.phase(), FlushPhase::Clean);
        assert!(tracker.dirty_since().is_none());

        tracker.record_write();
        let first = tracker.dirty_since();
        tracker.record_write();
        assert_eq!(tracker.write_count(), 2);
        assert_eq!(tracker.dirty_since(), first);
        assert!(tracker.is_dirty());

        tracker.reset();
        assert_eq!(tracker.write_count(), 0);
        assert!(tracker.dirty_since().is_none());
        assert!(!tracker.is_dirty());
    }

    #[test]
    fn test_inconsistent_header_needs_no_marker() {
        assert!(FlushTracker::new(false).marked_on_disk);
        assert!(!FlushTracker::new(true).marked_on_disk);
    }
}
