//! Attribute structures handed out by the volume facade

use serde::{Deserialize, Serialize};
use std::time::SystemTime;

use super::catalog::{CatalogEntry, CatalogRecord};
use super::macroman;
use super::mdb::{from_mac_date, MasterDirectoryBlock};

/// Permission bits reported for folders
pub const FOLDER_PERMISSIONS: u32 = 0o755;
/// Permission bits reported for writable files
pub const FILE_PERMISSIONS: u32 = 0o644;
/// Permission bits reported for locked files
pub const LOCKED_FILE_PERMISSIONS: u32 = 0o444;

/// Type of catalog item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    File,
    Folder,
}

/// Metadata of a single file or folder
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemAttributes {
    /// Item name (the volume name for the root folder)
    pub name: String,
    /// Full path from the root, e.g. "/System Folder/Finder"
    pub path: String,
    pub kind: ItemKind,
    /// Catalog node ID
    pub id: u32,
    pub parent_id: u32,
    /// Data fork length in bytes (0 for folders)
    pub size: u64,
    /// Resource fork length in bytes
    pub resource_size: u64,
    /// Allocation blocks held by both forks
    pub allocated_blocks: u32,
    /// Direct children of a folder
    pub child_count: u32,
    pub created: SystemTime,
    pub modified: SystemTime,
    pub backed_up: Option<SystemTime>,
    pub permissions: u32,
    pub locked: bool,
    /// Finder type code, e.g. "TEXT"
    pub file_type: Option<String>,
    /// Finder creator code
    pub creator: Option<String>,
}

fn four_char_code(code: [u8; 4]) -> Option<String> {
    (code != [0u8; 4]).then(|| macroman::decode(&code))
}

fn backup_date(date: u32) -> Option<SystemTime> {
    (date != 0).then(|| from_mac_date(date))
}

impl ItemAttributes {
    pub fn from_entry(entry: &CatalogEntry, path: &str, block_size: u32) -> Self {
        let name = entry.name();
        let parent_id = entry.key.parent_id;
        match &entry.record {
            CatalogRecord::File(file) => Self {
                name,
                path: path.to_string(),
                kind: ItemKind::File,
                id: file.file_id,
                parent_id,
                size: file.data_fork.logical_size as u64,
                resource_size: file.resource_fork.logical_size as u64,
                allocated_blocks: (file.data_fork.physical_size + file.resource_fork.physical_size)
                    / block_size,
                child_count: 0,
                created: from_mac_date(file.create_date),
                modified: from_mac_date(file.modify_date),
                backed_up: backup_date(file.backup_date),
                permissions: if file.is_locked() {
                    LOCKED_FILE_PERMISSIONS
                } else {
                    FILE_PERMISSIONS
                },
                locked: file.is_locked(),
                file_type: four_char_code(file.file_type()),
                creator: four_char_code(file.creator()),
            },
            CatalogRecord::Folder(folder) => Self {
                name,
                path: path.to_string(),
                kind: ItemKind::Folder,
                id: folder.folder_id,
                parent_id,
                size: 0,
                resource_size: 0,
                allocated_blocks: 0,
                child_count: folder.valence as u32,
                created: from_mac_date(folder.create_date),
                modified: from_mac_date(folder.modify_date),
                backed_up: backup_date(folder.backup_date),
                permissions: FOLDER_PERMISSIONS,
                locked: false,
                file_type: None,
                creator: None,
            },
            // Thread records never reach the facade; report them as empty folders
            CatalogRecord::FolderThread(_) | CatalogRecord::FileThread(_) => Self {
                name,
                path: path.to_string(),
                kind: ItemKind::Folder,
                id: entry.id(),
                parent_id,
                size: 0,
                resource_size: 0,
                allocated_blocks: 0,
                child_count: 0,
                created: SystemTime::UNIX_EPOCH,
                modified: SystemTime::UNIX_EPOCH,
                backed_up: None,
                permissions: FOLDER_PERMISSIONS,
                locked: false,
                file_type: None,
                creator: None,
            },
        }
    }

    pub fn is_directory(&self) -> bool {
        self.kind == ItemKind::Folder
    }

    pub fn is_file(&self) -> bool {
        self.kind == ItemKind::File
    }

    /// Get a display-friendly size string
    pub fn size_string(&self) -> String {
        if self.is_directory() {
            return String::new();
        }

        if self.size < 1024 {
            format!("{} B", self.size)
        } else if self.size < 1024 * 1024 {
            format!("{:.1} KB", self.size as f64 / 1024.0)
        } else if self.size < 1024 * 1024 * 1024 {
            format!("{:.1} MB", self.size as f64 / (1024.0 * 1024.0))
        } else {
            format!("{:.2} GB", self.size as f64 / (1024.0 * 1024.0 * 1024.0))
        }
    }
}

/// Volume-wide figures
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileSystemAttributes {
    pub volume_name: String,
    pub block_size: u32,
    pub total_blocks: u32,
    pub free_blocks: u32,
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub file_count: u32,
    pub folder_count: u32,
    pub created: SystemTime,
    pub modified: SystemTime,
    /// Number of completed flushes recorded in the header
    pub write_count: u32,
    pub locked: bool,
    /// False while changes are pending or after an interrupted flush
    pub consistent: bool,
}

impl FileSystemAttributes {
    pub fn from_mdb(mdb: &MasterDirectoryBlock, free_blocks: u32) -> Self {
        let total_blocks = mdb.total_blocks as u32;
        Self {
            volume_name: mdb.volume_name(),
            block_size: mdb.block_size,
            total_blocks,
            free_blocks,
            total_bytes: total_blocks as u64 * mdb.block_size as u64,
            free_bytes: free_blocks as u64 * mdb.block_size as u64,
            file_count: mdb.file_count,
            folder_count: mdb.folder_count,
            created: from_mac_date(mdb.create_date),
            modified: from_mac_date(mdb.modify_date),
            write_count: mdb.write_count,
            locked: mdb.is_locked(),
            consistent: mdb.is_consistent(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hfs::catalog::{CatalogKey, FileRecord, FolderRecord, FILE_LOCKED};

    #[test]
    fn test_file_attributes() {
        let mut file = FileRecord::new(20, 3_000_000_000);
        file.finder_info[..8].copy_from_slice(b"APPLMACS");
        file.data_fork.logical_size = 1500;
        file.data_fork.physical_size = 2048;
        file.resource_fork.physical_size = 512;
        let entry = CatalogEntry {
            key: CatalogKey::new(2, b"Finder".to_vec()),
            record: CatalogRecord::File(file),
        };

        let attrs = ItemAttributes::from_entry(&entry, "/Finder", 512);
        assert!(attrs.is_file());
        assert_eq!(attrs.id, 20);
        assert_eq!(attrs.allocated_blocks, 5);
        assert_eq!(attrs.permissions, 0o644);
        assert_eq!(attrs.file_type.as_deref(), Some("APPL"));
        assert_eq!(attrs.creator.as_deref(), Some("MACS"));
        assert_eq!(attrs.size_string(), "1.5 KB");
        assert!(attrs.backed_up.is_none());
    }

    #[test]
    fn test_locked_file_permissions() {
        let mut file = FileRecord::new(21, 0);
        file.flags |= FILE_LOCKED;
        let entry = CatalogEntry {
            key: CatalogKey::new(2, b"x".to_vec()),
            record: CatalogRecord::File(file),
        };
        let attrs = ItemAttributes::from_entry(&entry, "/x", 512);
        assert!(attrs.locked);
        assert_eq!(attrs.permissions, 0o444);
        assert!(attrs.file_type.is_none());
    }

    #[test]
    fn test_folder_attributes_serialize() {
        let mut folder = FolderRecord::new(16, 0);
        folder.valence = 3;
        let entry = CatalogEntry {
            key: CatalogKey::new(2, b"Docs".to_vec()),
            record: CatalogRecord::Folder(folder),
        };
        let attrs = ItemAttributes::from_entry(&entry, "/Docs", 512);
        assert_eq!(attrs.child_count, 3);
        assert_eq!(attrs.permissions, 0o755);
        assert_eq!(attrs.size_string(), "");

        let json = serde_json::to_value(&attrs).unwrap();
        assert_eq!(json["kind"], "folder");
        assert_eq!(json["name"], "Docs");
    }
}
