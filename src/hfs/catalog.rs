//! Catalog B-tree: folder, file and thread records keyed by (parent ID, name)
//!
//! Every folder and file has a thread record keyed by (own ID, "") that
//! points back at its parent and name, so an ID can be turned into a key.

use byteorder::{BigEndian, ByteOrder};
use std::cmp::Ordering;

use super::block::BlockDevice;
use super::btree::{BTree, TreeLayout};
use super::error::{HfsError, Result};
use super::extents::{ExtentDescriptor, ExtentRecord, ForkData, ForkType};
use super::macroman;
use super::mdb::MasterDirectoryBlock;

/// Parent ID of the root folder
pub const ROOT_PARENT_ID: u32 = 1;
/// Catalog ID of the root folder
pub const ROOT_FOLDER_ID: u32 = 2;
/// Catalog ID of the catalog file
pub const CATALOG_FILE_ID: u32 = 4;

const FOLDER_RECORD: i8 = 1;
const FILE_RECORD: i8 = 2;
const FOLDER_THREAD_RECORD: i8 = 3;
const FILE_THREAD_RECORD: i8 = 4;

const FOLDER_RECORD_LEN: usize = 70;
const FILE_RECORD_LEN: usize = 102;
const THREAD_RECORD_LEN: usize = 46;

/// File is locked against writes
pub const FILE_LOCKED: u8 = 0x01;
/// File has a thread record
const FILE_THREAD_EXISTS: u8 = 0x02;

/// Longest chain of parents followed before giving up
const MAX_FOLDER_DEPTH: usize = 4096;

/// Catalog key: parent folder ID and Mac Roman name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogKey {
    pub parent_id: u32,
    pub name: Vec<u8>,
}

impl CatalogKey {
    pub fn new(parent_id: u32, name: Vec<u8>) -> Self {
        Self { parent_id, name }
    }

    /// Key of the thread record for catalog ID `id`
    pub fn thread(id: u32) -> Self {
        Self::new(id, Vec::new())
    }

    pub fn name(&self) -> String {
        macroman::decode(&self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderRecord {
    pub flags: u16,
    /// Number of files and folders directly inside
    pub valence: u16,
    pub folder_id: u32,
    pub create_date: u32,
    pub modify_date: u32,
    pub backup_date: u32,
    pub finder_info: [u8; 16],
    pub extended_finder_info: [u8; 16],
}

impl FolderRecord {
    pub fn new(folder_id: u32, now: u32) -> Self {
        Self {
            flags: 0,
            valence: 0,
            folder_id,
            create_date: now,
            modify_date: now,
            backup_date: 0,
            finder_info: [0u8; 16],
            extended_finder_info: [0u8; 16],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub flags: u8,
    pub file_type_byte: u8,
    /// Finder info: type, creator, flags, location, folder
    pub finder_info: [u8; 16],
    pub file_id: u32,
    pub data_fork: ForkData,
    pub resource_fork: ForkData,
    pub create_date: u32,
    pub modify_date: u32,
    pub backup_date: u32,
    pub extended_finder_info: [u8; 16],
    pub clump_size: u16,
}

impl FileRecord {
    pub fn new(file_id: u32, now: u32) -> Self {
        Self {
            flags: FILE_THREAD_EXISTS,
            file_type_byte: 0,
            finder_info: [0u8; 16],
            file_id,
            data_fork: ForkData::default(),
            resource_fork: ForkData::default(),
            create_date: now,
            modify_date: now,
            backup_date: 0,
            extended_finder_info: [0u8; 16],
            clump_size: 0,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.flags & FILE_LOCKED != 0
    }

    /// Four-character Finder type code
    pub fn file_type(&self) -> [u8; 4] {
        [self.finder_info[0], self.finder_info[1], self.finder_info[2], self.finder_info[3]]
    }

    /// Four-character Finder creator code
    pub fn creator(&self) -> [u8; 4] {
        [self.finder_info[4], self.finder_info[5], self.finder_info[6], self.finder_info[7]]
    }

    pub fn fork(&self, fork: ForkType) -> &ForkData {
        match fork {
            ForkType::Data => &self.data_fork,
            ForkType::Resource => &self.resource_fork,
        }
    }

    pub fn fork_mut(&mut self, fork: ForkType) -> &mut ForkData {
        match fork {
            ForkType::Data => &mut self.data_fork,
            ForkType::Resource => &mut self.resource_fork,
        }
    }
}

/// Parent and name of a folder or file, stored under its own ID
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadRecord {
    pub parent_id: u32,
    pub name: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogRecord {
    Folder(FolderRecord),
    File(FileRecord),
    FolderThread(ThreadRecord),
    FileThread(ThreadRecord),
}

impl CatalogRecord {
    /// Catalog ID of a folder or file record
    pub fn id(&self) -> Option<u32> {
        match self {
            CatalogRecord::Folder(folder) => Some(folder.folder_id),
            CatalogRecord::File(file) => Some(file.file_id),
            CatalogRecord::FolderThread(_) | CatalogRecord::FileThread(_) => None,
        }
    }

    pub fn is_thread(&self) -> bool {
        matches!(self, CatalogRecord::FolderThread(_) | CatalogRecord::FileThread(_))
    }

    fn parse(data: &[u8]) -> Result<Self, String> {
        let kind = *data.first().ok_or("empty catalog record")? as i8;
        let need = match kind {
            FOLDER_RECORD => FOLDER_RECORD_LEN,
            FILE_RECORD => FILE_RECORD_LEN,
            FOLDER_THREAD_RECORD | FILE_THREAD_RECORD => THREAD_RECORD_LEN,
            other => return Err(format!("unknown catalog record type {}", other)),
        };
        if data.len() < need {
            return Err(format!("catalog record type {} has {} bytes", kind, data.len()));
        }

        let record = match kind {
            FOLDER_RECORD => CatalogRecord::Folder(FolderRecord {
                flags: BigEndian::read_u16(&data[2..4]),
                valence: BigEndian::read_u16(&data[4..6]),
                folder_id: BigEndian::read_u32(&data[6..10]),
                create_date: BigEndian::read_u32(&data[10..14]),
                modify_date: BigEndian::read_u32(&data[14..18]),
                backup_date: BigEndian::read_u32(&data[18..22]),
                finder_info: copy16(&data[22..38]),
                extended_finder_info: copy16(&data[38..54]),
            }),
            FILE_RECORD => CatalogRecord::File(FileRecord {
                flags: data[2],
                file_type_byte: data[3],
                finder_info: copy16(&data[4..20]),
                file_id: BigEndian::read_u32(&data[20..24]),
                data_fork: ForkData {
                    logical_size: BigEndian::read_u32(&data[26..30]),
                    physical_size: BigEndian::read_u32(&data[30..34]),
                    extents: parse_extents(&data[74..86]),
                },
                resource_fork: ForkData {
                    logical_size: BigEndian::read_u32(&data[36..40]),
                    physical_size: BigEndian::read_u32(&data[40..44]),
                    extents: parse_extents(&data[86..98]),
                },
                create_date: BigEndian::read_u32(&data[44..48]),
                modify_date: BigEndian::read_u32(&data[48..52]),
                backup_date: BigEndian::read_u32(&data[52..56]),
                extended_finder_info: copy16(&data[56..72]),
                clump_size: BigEndian::read_u16(&data[72..74]),
            }),
            _ => {
                let name_len = (data[14] as usize).min(macroman::MAX_NAME_LEN);
                let thread = ThreadRecord {
                    parent_id: BigEndian::read_u32(&data[10..14]),
                    name: data[15..15 + name_len].to_vec(),
                };
                if kind == FOLDER_THREAD_RECORD {
                    CatalogRecord::FolderThread(thread)
                } else {
                    CatalogRecord::FileThread(thread)
                }
            }
        };
        Ok(record)
    }

    fn encode(&self) -> Vec<u8> {
        match self {
            CatalogRecord::Folder(folder) => {
                let mut data = vec![0u8; FOLDER_RECORD_LEN];
                data[0] = FOLDER_RECORD as u8;
                BigEndian::write_u16(&mut data[2..4], folder.flags);
                BigEndian::write_u16(&mut data[4..6], folder.valence);
                BigEndian::write_u32(&mut data[6..10], folder.folder_id);
                BigEndian::write_u32(&mut data[10..14], folder.create_date);
                BigEndian::write_u32(&mut data[14..18], folder.modify_date);
                BigEndian::write_u32(&mut data[18..22], folder.backup_date);
                data[22..38].copy_from_slice(&folder.finder_info);
                data[38..54].copy_from_slice(&folder.extended_finder_info);
                data
            }
            CatalogRecord::File(file) => {
                let mut data = vec![0u8; FILE_RECORD_LEN];
                data[0] = FILE_RECORD as u8;
                data[2] = file.flags;
                data[3] = file.file_type_byte;
                data[4..20].copy_from_slice(&file.finder_info);
                BigEndian::write_u32(&mut data[20..24], file.file_id);
                BigEndian::write_u16(&mut data[24..26], file.data_fork.extents[0].start_block);
                BigEndian::write_u32(&mut data[26..30], file.data_fork.logical_size);
                BigEndian::write_u32(&mut data[30..34], file.data_fork.physical_size);
                BigEndian::write_u16(&mut data[34..36], file.resource_fork.extents[0].start_block);
                BigEndian::write_u32(&mut data[36..40], file.resource_fork.logical_size);
                BigEndian::write_u32(&mut data[40..44], file.resource_fork.physical_size);
                BigEndian::write_u32(&mut data[44..48], file.create_date);
                BigEndian::write_u32(&mut data[48..52], file.modify_date);
                BigEndian::write_u32(&mut data[52..56], file.backup_date);
                data[56..72].copy_from_slice(&file.extended_finder_info);
                BigEndian::write_u16(&mut data[72..74], file.clump_size);
                write_extents(&file.data_fork.extents, &mut data[74..86]);
                write_extents(&file.resource_fork.extents, &mut data[86..98]);
                data
            }
            CatalogRecord::FolderThread(thread) | CatalogRecord::FileThread(thread) => {
                let mut data = vec![0u8; THREAD_RECORD_LEN];
                data[0] = if matches!(self, CatalogRecord::FolderThread(_)) {
                    FOLDER_THREAD_RECORD as u8
                } else {
                    FILE_THREAD_RECORD as u8
                };
                BigEndian::write_u32(&mut data[10..14], thread.parent_id);
                let name_len = thread.name.len().min(macroman::MAX_NAME_LEN);
                data[14] = name_len as u8;
                data[15..15 + name_len].copy_from_slice(&thread.name[..name_len]);
                data
            }
        }
    }
}

fn copy16(data: &[u8]) -> [u8; 16] {
    let mut out = [0u8; 16];
    out.copy_from_slice(&data[..16]);
    out
}

fn parse_extents(data: &[u8]) -> ExtentRecord {
    let mut record = ExtentRecord::default();
    for (i, extent) in record.iter_mut().enumerate() {
        *extent = ExtentDescriptor::parse(&data[i * 4..i * 4 + 4]);
    }
    record
}

fn write_extents(record: &ExtentRecord, out: &mut [u8]) {
    for (i, extent) in record.iter().enumerate() {
        extent.write(&mut out[i * 4..i * 4 + 4]);
    }
}

/// Key and record codec of the catalog tree
#[derive(Debug, Clone, Copy, Default)]
pub struct CatalogLayout {
    /// Compare names byte for byte instead of folding case
    pub case_sensitive: bool,
}

impl TreeLayout for CatalogLayout {
    type Key = CatalogKey;
    type Record = CatalogRecord;
    const MAX_KEY_LEN: usize = 6 + macroman::MAX_NAME_LEN;

    fn compare(&self, a: &CatalogKey, b: &CatalogKey) -> Ordering {
        a.parent_id
            .cmp(&b.parent_id)
            .then_with(|| macroman::compare_names(&a.name, &b.name, self.case_sensitive))
    }

    fn encode_key(&self, key: &CatalogKey) -> Vec<u8> {
        let name_len = key.name.len().min(macroman::MAX_NAME_LEN);
        let mut out = Vec::with_capacity(6 + name_len);
        out.push(0);
        out.extend_from_slice(&key.parent_id.to_be_bytes());
        out.push(name_len as u8);
        out.extend_from_slice(&key.name[..name_len]);
        out
    }

    fn decode_key(&self, body: &[u8]) -> Result<CatalogKey, String> {
        if body.len() < 6 {
            return Err(format!("catalog key of {} bytes", body.len()));
        }
        let name_len = body[5] as usize;
        if name_len > macroman::MAX_NAME_LEN || 6 + name_len > body.len() {
            return Err(format!("catalog name length {}", name_len));
        }
        Ok(CatalogKey::new(
            BigEndian::read_u32(&body[1..5]),
            body[6..6 + name_len].to_vec(),
        ))
    }

    fn encode_record(&self, record: &CatalogRecord) -> Vec<u8> {
        record.encode()
    }

    fn decode_record(&self, data: &[u8]) -> Result<CatalogRecord, String> {
        CatalogRecord::parse(data)
    }
}

/// A folder or file together with the key it is stored under
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub key: CatalogKey,
    pub record: CatalogRecord,
}

impl CatalogEntry {
    pub fn id(&self) -> u32 {
        self.record.id().unwrap_or(self.key.parent_id)
    }

    pub fn name(&self) -> String {
        self.key.name()
    }

    pub fn is_folder(&self) -> bool {
        matches!(self.record, CatalogRecord::Folder(_))
    }
}

/// What `create_entry` should make
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NewEntry {
    Folder,
    File,
}

/// Split a path into non-empty components; "", "/" and "." name the root
pub fn path_components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|c| !c.is_empty() && *c != ".")
}

pub struct Catalog {
    tree: BTree<CatalogLayout>,
}

impl Catalog {
    pub fn new(tree: BTree<CatalogLayout>) -> Self {
        Self { tree }
    }

    pub fn tree(&self) -> &BTree<CatalogLayout> {
        &self.tree
    }

    pub fn tree_mut(&mut self) -> &mut BTree<CatalogLayout> {
        &mut self.tree
    }

    /// Insert the root folder and its thread into an empty catalog
    pub fn create_root(&mut self, device: &BlockDevice, volume_name: &[u8], now: u32) -> Result<()> {
        let key = CatalogKey::new(ROOT_PARENT_ID, volume_name.to_vec());
        self.tree.insert(
            device,
            key.clone(),
            CatalogRecord::Folder(FolderRecord::new(ROOT_FOLDER_ID, now)),
        )?;
        self.tree.insert(
            device,
            CatalogKey::thread(ROOT_FOLDER_ID),
            CatalogRecord::FolderThread(ThreadRecord {
                parent_id: ROOT_PARENT_ID,
                name: key.name,
            }),
        )
    }

    fn thread_of(&self, device: &BlockDevice, id: u32) -> Result<Option<ThreadRecord>> {
        match self.tree.find(device, &CatalogKey::thread(id))? {
            Some(CatalogRecord::FolderThread(thread)) | Some(CatalogRecord::FileThread(thread)) => {
                Ok(Some(thread))
            }
            Some(other) => Err(HfsError::KeyNotFound(format!(
                "thread of {} holds {:?}",
                id, other
            ))),
            None => Ok(None),
        }
    }

    /// Find a folder or file by catalog ID through its thread record
    pub fn entry_for_id(&self, device: &BlockDevice, id: u32) -> Result<CatalogEntry> {
        let thread = self
            .thread_of(device, id)?
            .ok_or_else(|| HfsError::KeyNotFound(format!("thread of catalog ID {}", id)))?;
        let key = CatalogKey::new(thread.parent_id, thread.name);
        let (key, record) = self
            .tree
            .find_entry(device, &key)?
            .ok_or_else(|| HfsError::KeyNotFound(format!("{:?}", key)))?;
        Ok(CatalogEntry { key, record })
    }

    pub fn lookup(
        &self,
        device: &BlockDevice,
        parent_id: u32,
        name: &[u8],
    ) -> Result<Option<CatalogEntry>> {
        let key = CatalogKey::new(parent_id, name.to_vec());
        Ok(self
            .tree
            .find_entry(device, &key)?
            .map(|(key, record)| CatalogEntry { key, record }))
    }

    /// Resolve a slash-separated path from the root folder
    pub fn resolve_path(&self, device: &BlockDevice, path: &str) -> Result<CatalogEntry> {
        let mut entry = self.entry_for_id(device, ROOT_FOLDER_ID)?;
        let mut walked = String::new();
        for component in path_components(path) {
            let CatalogRecord::Folder(folder) = &entry.record else {
                return Err(HfsError::NotADirectory(walked));
            };
            walked.push('/');
            walked.push_str(component);

            // A name that cannot be stored cannot exist either
            let name = match macroman::encode(component) {
                Ok(name) if name.len() <= macroman::MAX_NAME_LEN => name,
                _ => return Err(HfsError::PathNotFound(path.to_string())),
            };
            entry = self
                .lookup(device, folder.folder_id, &name)?
                .ok_or_else(|| HfsError::PathNotFound(path.to_string()))?;
        }
        Ok(entry)
    }

    /// Folders and files directly inside `parent_id`, in name order
    pub fn children<'a>(
        &'a self,
        device: &'a BlockDevice,
        parent_id: u32,
    ) -> Result<impl Iterator<Item = Result<CatalogEntry>> + 'a> {
        let scan = self.tree.range_from(device, &CatalogKey::thread(parent_id))?;
        Ok(scan
            .take_while(move |entry| match entry {
                Ok((key, _)) => key.parent_id == parent_id,
                Err(_) => true,
            })
            .filter_map(|entry| match entry {
                Ok((_, record)) if record.is_thread() => None,
                Ok((key, record)) => Some(Ok(CatalogEntry { key, record })),
                Err(err) => Some(Err(err)),
            }))
    }

    /// Next free catalog ID, skipping any that still have a thread record
    fn allocate_id(&self, device: &BlockDevice, mdb: &mut MasterDirectoryBlock) -> Result<u32> {
        loop {
            let id = mdb.next_catalog_id;
            mdb.next_catalog_id = id
                .checked_add(1)
                .ok_or(HfsError::OutOfSpace { requested: 1 })?;
            if self.thread_of(device, id)?.is_none() {
                return Ok(id);
            }
            log::warn!("Catalog ID {} is still in use, skipping it", id);
        }
    }

    fn folder(&self, device: &BlockDevice, id: u32) -> Result<(CatalogKey, FolderRecord)> {
        let entry = self.entry_for_id(device, id).map_err(|err| match err {
            HfsError::KeyNotFound(_) => HfsError::PathNotFound(format!("catalog ID {}", id)),
            other => other,
        })?;
        match entry.record {
            CatalogRecord::Folder(folder) => Ok((entry.key, folder)),
            _ => Err(HfsError::NotADirectory(entry.key.name())),
        }
    }

    /// Add `delta` to a folder's valence and touch its modify date
    fn adjust_valence(&mut self, device: &BlockDevice, id: u32, delta: i32, now: u32) -> Result<()> {
        let (key, mut folder) = self.folder(device, id)?;
        folder.valence = (folder.valence as i32 + delta).clamp(0, u16::MAX as i32) as u16;
        folder.modify_date = now;
        self.tree.update(device, &key, CatalogRecord::Folder(folder))
    }

    fn adjust_counts(mdb: &mut MasterDirectoryBlock, parent_id: u32, kind: NewEntry, delta: i32) {
        let bump32 = |value: u32| (value as i64 + delta as i64).max(0) as u32;
        let bump16 = |value: u16| (value as i32 + delta).clamp(0, u16::MAX as i32) as u16;
        match kind {
            NewEntry::Folder => {
                mdb.folder_count = bump32(mdb.folder_count);
                if parent_id == ROOT_FOLDER_ID {
                    mdb.root_dir_count = bump16(mdb.root_dir_count);
                }
            }
            NewEntry::File => {
                mdb.file_count = bump32(mdb.file_count);
                if parent_id == ROOT_FOLDER_ID {
                    mdb.root_file_count = bump16(mdb.root_file_count);
                }
            }
        }
    }

    /// Create a folder or an empty file with its thread record
    pub fn create_entry(
        &mut self,
        device: &BlockDevice,
        mdb: &mut MasterDirectoryBlock,
        parent_id: u32,
        name: &str,
        kind: NewEntry,
        now: u32,
    ) -> Result<CatalogEntry> {
        let name = macroman::encode_name(name)?;
        self.folder(device, parent_id)?;
        let key = CatalogKey::new(parent_id, name);
        if self.tree.find(device, &key)?.is_some() {
            return Err(HfsError::AlreadyExists(key.name()));
        }

        let id = self.allocate_id(device, mdb)?;
        let thread = ThreadRecord {
            parent_id,
            name: key.name.clone(),
        };
        let (record, thread) = match kind {
            NewEntry::Folder => (
                CatalogRecord::Folder(FolderRecord::new(id, now)),
                CatalogRecord::FolderThread(thread),
            ),
            NewEntry::File => (
                CatalogRecord::File(FileRecord::new(id, now)),
                CatalogRecord::FileThread(thread),
            ),
        };
        self.tree.insert(device, key.clone(), record.clone())?;
        self.tree.insert(device, CatalogKey::thread(id), thread)?;
        self.adjust_valence(device, parent_id, 1, now)?;
        Self::adjust_counts(mdb, parent_id, kind, 1);

        log::debug!("Created {:?} {} ({}) in folder {}", kind, key.name(), id, parent_id);
        Ok(CatalogEntry { key, record })
    }

    /// Remove an empty folder or a file along with its thread record.
    /// The removed record is returned so its forks can be released.
    pub fn remove_entry(
        &mut self,
        device: &BlockDevice,
        mdb: &mut MasterDirectoryBlock,
        parent_id: u32,
        name: &[u8],
        now: u32,
    ) -> Result<CatalogRecord> {
        let key = CatalogKey::new(parent_id, name.to_vec());
        let record = self
            .tree
            .find(device, &key)?
            .ok_or_else(|| HfsError::PathNotFound(key.name()))?;
        let kind = match &record {
            CatalogRecord::Folder(folder) if folder.folder_id == ROOT_FOLDER_ID => {
                return Err(HfsError::InvalidArgument("cannot remove the root folder".to_string()));
            }
            CatalogRecord::Folder(folder) if folder.valence > 0 => {
                return Err(HfsError::DirectoryNotEmpty(key.name()));
            }
            CatalogRecord::Folder(_) => NewEntry::Folder,
            CatalogRecord::File(_) => NewEntry::File,
            CatalogRecord::FolderThread(_) | CatalogRecord::FileThread(_) => {
                return Err(HfsError::PathNotFound(key.name()));
            }
        };

        let id = record.id().unwrap_or_default();
        self.tree.remove(device, &key)?;
        self.tree.remove(device, &CatalogKey::thread(id))?;
        self.adjust_valence(device, parent_id, -1, now)?;
        Self::adjust_counts(mdb, parent_id, kind, -1);

        log::debug!("Removed {} ({}) from folder {}", key.name(), id, parent_id);
        Ok(record)
    }

    /// Move and/or rename an entry. Moving a folder below itself is refused.
    pub fn rename_entry(
        &mut self,
        device: &BlockDevice,
        mdb: &mut MasterDirectoryBlock,
        entry: &CatalogEntry,
        new_parent: u32,
        new_name: &str,
        now: u32,
    ) -> Result<CatalogEntry> {
        let name = macroman::encode_name(new_name)?;
        let new_key = CatalogKey::new(new_parent, name);
        if new_key == entry.key {
            return Ok(entry.clone());
        }
        let id = entry.id();
        let kind = match &entry.record {
            CatalogRecord::Folder(_) if id == ROOT_FOLDER_ID => {
                return Err(HfsError::InvalidArgument("cannot move the root folder".to_string()));
            }
            CatalogRecord::Folder(_) => NewEntry::Folder,
            CatalogRecord::File(_) => NewEntry::File,
            CatalogRecord::FolderThread(_) | CatalogRecord::FileThread(_) => {
                return Err(HfsError::InvalidArgument("cannot rename a thread record".to_string()));
            }
        };

        self.folder(device, new_parent)?;
        let same_slot = self.tree.layout().compare(&new_key, &entry.key) == Ordering::Equal;
        if !same_slot && self.tree.find(device, &new_key)?.is_some() {
            return Err(HfsError::AlreadyExists(new_key.name()));
        }
        if kind == NewEntry::Folder {
            self.ensure_not_below(device, new_parent, id)?;
        }

        self.tree.remove(device, &entry.key)?;
        self.tree.insert(device, new_key.clone(), entry.record.clone())?;
        let thread = ThreadRecord {
            parent_id: new_parent,
            name: new_key.name.clone(),
        };
        let thread = match kind {
            NewEntry::Folder => CatalogRecord::FolderThread(thread),
            NewEntry::File => CatalogRecord::FileThread(thread),
        };
        self.tree.update(device, &CatalogKey::thread(id), thread)?;

        let old_parent = entry.key.parent_id;
        if old_parent != new_parent {
            self.adjust_valence(device, old_parent, -1, now)?;
            self.adjust_valence(device, new_parent, 1, now)?;
            Self::adjust_counts(mdb, old_parent, kind, -1);
            Self::adjust_counts(mdb, new_parent, kind, 1);
        } else {
            self.adjust_valence(device, new_parent, 0, now)?;
        }

        Ok(CatalogEntry {
            key: new_key,
            record: entry.record.clone(),
        })
    }

    /// Fail if `folder_id` is `start` or one of its ancestors
    fn ensure_not_below(&self, device: &BlockDevice, start: u32, folder_id: u32) -> Result<()> {
        let mut id = start;
        for _ in 0..MAX_FOLDER_DEPTH {
            if id == folder_id {
                return Err(HfsError::InvalidArgument(format!(
                    "cannot move folder {} inside itself",
                    folder_id
                )));
            }
            if id == ROOT_FOLDER_ID || id == ROOT_PARENT_ID {
                return Ok(());
            }
            id = self
                .thread_of(device, id)?
                .ok_or_else(|| HfsError::KeyNotFound(format!("thread of catalog ID {}", id)))?
                .parent_id;
        }
        Err(HfsError::InvalidFormat(format!(
            "folder chain above {} does not reach the root",
            start
        )))
    }

    /// Rename the root folder to follow the volume name
    pub fn rename_root(&mut self, device: &BlockDevice, volume_name: &[u8]) -> Result<()> {
        let root = self.entry_for_id(device, ROOT_FOLDER_ID)?;
        let key = CatalogKey::new(ROOT_PARENT_ID, volume_name.to_vec());
        if key == root.key {
            return Ok(());
        }
        self.tree.remove(device, &root.key)?;
        self.tree.insert(device, key.clone(), root.record)?;
        self.tree.update(
            device,
            &CatalogKey::thread(ROOT_FOLDER_ID),
            CatalogRecord::FolderThread(ThreadRecord {
                parent_id: ROOT_PARENT_ID,
                name: key.name,
            }),
        )
    }

    /// Replace a folder or file record in place
    pub fn update_record(
        &mut self,
        device: &BlockDevice,
        key: &CatalogKey,
        record: CatalogRecord,
    ) -> Result<()> {
        self.tree.update(device, key, record)
    }

    /// Every folder and file record in key order
    pub fn entries<'a>(
        &'a self,
        device: &'a BlockDevice,
    ) -> impl Iterator<Item = Result<CatalogEntry>> + 'a {
        self.tree.scan(device).filter_map(|entry| match entry {
            Ok((_, record)) if record.is_thread() => None,
            Ok((key, record)) => Some(Ok(CatalogEntry { key, record })),
            Err(err) => Some(Err(err)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hfs::block::MemoryBlockStore;
    use crate::hfs::mdb::FormatOptions;

    const SECTORS: u64 = 20480;

    fn setup(case_sensitive: bool) -> (BlockDevice, Catalog, MasterDirectoryBlock) {
        let device = BlockDevice::new(Box::new(MemoryBlockStore::new(SECTORS * 512)));
        let options = FormatOptions {
            volume_name: "Test".to_string(),
            block_size: None,
        };
        let mdb = MasterDirectoryBlock::format(SECTORS, &options, 100).unwrap();
        let tree = BTree::create(
            CatalogLayout { case_sensitive },
            CATALOG_FILE_ID,
            mdb.catalog_file,
            mdb.geometry(),
            32,
        );
        let mut catalog = Catalog::new(tree);
        catalog.create_root(&device, &mdb.volume_name, 100).unwrap();
        (device, catalog, mdb)
    }

    fn create(
        catalog: &mut Catalog,
        device: &BlockDevice,
        mdb: &mut MasterDirectoryBlock,
        parent: u32,
        name: &str,
        kind: NewEntry,
    ) -> CatalogEntry {
        catalog.create_entry(device, mdb, parent, name, kind, 200).unwrap()
    }

    fn valence(catalog: &Catalog, device: &BlockDevice, id: u32) -> u16 {
        match catalog.entry_for_id(device, id).unwrap().record {
            CatalogRecord::Folder(folder) => folder.valence,
            other => panic!("not a folder: {:?}", other),
        }
    }

    #[test]
    fn test_record_round_trip() {
        let mut file = FileRecord::new(77, 1000);
        file.flags |= FILE_LOCKED;
        file.finder_info[..8].copy_from_slice(b"TEXTttxt");
        file.data_fork.logical_size = 1234;
        file.data_fork.physical_size = 1536;
        file.data_fork.extents[0] = ExtentDescriptor::new(40, 3);
        let record = CatalogRecord::File(file);
        let encoded = record.encode();
        assert_eq!(encoded.len(), FILE_RECORD_LEN);
        assert_eq!(encoded[0], 2);
        assert_eq!(&encoded[24..26], &[0, 40]);

        let CatalogRecord::File(parsed) = CatalogRecord::parse(&encoded).unwrap() else {
            panic!("expected a file record");
        };
        assert!(parsed.is_locked());
        assert_eq!(&parsed.file_type(), b"TEXT");
        assert_eq!(&parsed.creator(), b"ttxt");
        assert_eq!(CatalogRecord::File(parsed), record);

        let thread = CatalogRecord::FileThread(ThreadRecord {
            parent_id: 2,
            name: b"ReadMe".to_vec(),
        });
        assert_eq!(thread.encode().len(), THREAD_RECORD_LEN);
        assert_eq!(CatalogRecord::parse(&thread.encode()).unwrap(), thread);
        assert!(CatalogRecord::parse(&[9u8; 20]).is_err());
    }

    #[test]
    fn test_key_layout() {
        let layout = CatalogLayout::default();
        let key = CatalogKey::new(2, b"abc".to_vec());
        assert_eq!(layout.encode_key(&key), vec![0, 0, 0, 0, 2, 3, b'a', b'b', b'c']);
        // Index keys arrive padded to the maximum length
        let mut padded = layout.encode_key(&key);
        padded.resize(CatalogLayout::MAX_KEY_LEN, 0);
        assert_eq!(layout.decode_key(&padded).unwrap(), key);

        let thread = CatalogKey::thread(2);
        assert_eq!(layout.compare(&thread, &key), Ordering::Less);
        assert_eq!(
            layout.compare(&CatalogKey::new(1, b"zzz".to_vec()), &thread),
            Ordering::Less
        );
    }

    #[test]
    fn test_resolve_paths() {
        let (device, mut catalog, mut mdb) = setup(false);
        let folder = create(&mut catalog, &device, &mut mdb, ROOT_FOLDER_ID, "a", NewEntry::Folder);
        create(&mut catalog, &device, &mut mdb, folder.id(), "b.txt", NewEntry::File);

        let root = catalog.resolve_path(&device, "/").unwrap();
        assert_eq!(root.id(), ROOT_FOLDER_ID);
        assert_eq!(root.name(), "Test");

        let file = catalog.resolve_path(&device, "a/b.txt").unwrap();
        assert!(matches!(file.record, CatalogRecord::File(_)));
        assert_eq!(file.key.parent_id, folder.id());

        // Case-insensitive by default, reporting the name as stored
        let folded = catalog.resolve_path(&device, "/A/B.TXT").unwrap();
        assert_eq!(folded, file);
        assert_eq!(folded.name(), "b.txt");
        assert_eq!(catalog.lookup(&device, ROOT_FOLDER_ID, b"A").unwrap().unwrap().name(), "a");

        assert!(matches!(
            catalog.resolve_path(&device, "a/missing"),
            Err(HfsError::PathNotFound(_))
        ));
        assert!(matches!(
            catalog.resolve_path(&device, "a/b.txt/c"),
            Err(HfsError::NotADirectory(_))
        ));
        // Names outside Mac Roman or over the length limit are simply absent
        assert!(matches!(
            catalog.resolve_path(&device, "/日本"),
            Err(HfsError::PathNotFound(_))
        ));
        assert!(matches!(
            catalog.resolve_path(&device, &"x".repeat(40)),
            Err(HfsError::PathNotFound(_))
        ));
    }

    #[test]
    fn test_accented_names_sort_with_their_letter() {
        let (device, mut catalog, mut mdb) = setup(false);
        for name in ["Fig", "éclair", "Eagle", "Zebra", "Ärger", "apple"] {
            create(&mut catalog, &device, &mut mdb, ROOT_FOLDER_ID, name, NewEntry::File);
        }
        let names: Vec<String> = catalog
            .children(&device, ROOT_FOLDER_ID)
            .unwrap()
            .map(|entry| entry.unwrap().name())
            .collect();
        assert_eq!(names, vec!["apple", "Ärger", "Eagle", "éclair", "Fig", "Zebra"]);

        let upper = catalog.resolve_path(&device, "ÉCLAIR").unwrap();
        assert_eq!(upper.name(), "éclair");
        catalog.tree().verify(&device).unwrap();
    }

    #[test]
    fn test_case_sensitive_catalog() {
        let (device, mut catalog, mut mdb) = setup(true);
        create(&mut catalog, &device, &mut mdb, ROOT_FOLDER_ID, "Name", NewEntry::File);
        create(&mut catalog, &device, &mut mdb, ROOT_FOLDER_ID, "name", NewEntry::File);
        assert!(catalog.resolve_path(&device, "NAME").is_err());
        assert_eq!(valence(&catalog, &device, ROOT_FOLDER_ID), 2);
    }

    #[test]
    fn test_create_duplicates_and_counts() {
        let (device, mut catalog, mut mdb) = setup(false);
        create(&mut catalog, &device, &mut mdb, ROOT_FOLDER_ID, "docs", NewEntry::Folder);
        create(&mut catalog, &device, &mut mdb, ROOT_FOLDER_ID, "notes", NewEntry::File);

        let duplicate = catalog.create_entry(&device, &mut mdb, ROOT_FOLDER_ID, "DOCS", NewEntry::File, 1);
        assert!(matches!(duplicate, Err(HfsError::AlreadyExists(_))));

        let file_id = catalog.resolve_path(&device, "notes").unwrap().id();
        let under_file = catalog.create_entry(&device, &mut mdb, file_id, "x", NewEntry::File, 1);
        assert!(matches!(under_file, Err(HfsError::NotADirectory(_))));

        assert_eq!(mdb.folder_count, 1);
        assert_eq!(mdb.file_count, 1);
        assert_eq!(mdb.root_dir_count, 1);
        assert_eq!(mdb.root_file_count, 1);
        assert_eq!(valence(&catalog, &device, ROOT_FOLDER_ID), 2);
    }

    #[test]
    fn test_children_in_name_order() {
        let (device, mut catalog, mut mdb) = setup(false);
        let folder = create(&mut catalog, &device, &mut mdb, ROOT_FOLDER_ID, "dir", NewEntry::Folder);
        for name in ["zeta", "Alpha", "beta", "Gamma"] {
            create(&mut catalog, &device, &mut mdb, folder.id(), name, NewEntry::File);
        }
        create(&mut catalog, &device, &mut mdb, ROOT_FOLDER_ID, "other", NewEntry::File);

        let names: Vec<String> = catalog
            .children(&device, folder.id())
            .unwrap()
            .map(|entry| entry.unwrap().name())
            .collect();
        assert_eq!(names, vec!["Alpha", "beta", "Gamma", "zeta"]);
        assert_eq!(catalog.children(&device, ROOT_FOLDER_ID).unwrap().count(), 2);
    }

    #[test]
    fn test_remove_entry() {
        let (device, mut catalog, mut mdb) = setup(false);
        let folder = create(&mut catalog, &device, &mut mdb, ROOT_FOLDER_ID, "a", NewEntry::Folder);
        let file = create(&mut catalog, &device, &mut mdb, folder.id(), "b.txt", NewEntry::File);

        let refused = catalog.remove_entry(&device, &mut mdb, ROOT_FOLDER_ID, b"a", 300);
        assert!(matches!(refused, Err(HfsError::DirectoryNotEmpty(_))));

        let removed = catalog.remove_entry(&device, &mut mdb, folder.id(), b"b.txt", 300).unwrap();
        assert_eq!(removed.id(), Some(file.id()));
        assert!(catalog.entry_for_id(&device, file.id()).is_err());
        catalog.remove_entry(&device, &mut mdb, ROOT_FOLDER_ID, b"a", 300).unwrap();

        assert_eq!(valence(&catalog, &device, ROOT_FOLDER_ID), 0);
        assert_eq!(mdb.folder_count, 0);
        assert_eq!(mdb.file_count, 0);
        // Only the root folder and its thread remain
        assert_eq!(catalog.tree().header().leaf_records, 2);
    }

    #[test]
    fn test_rename_across_folders() {
        let (device, mut catalog, mut mdb) = setup(false);
        let a = create(&mut catalog, &device, &mut mdb, ROOT_FOLDER_ID, "a", NewEntry::Folder);
        let b = create(&mut catalog, &device, &mut mdb, ROOT_FOLDER_ID, "b", NewEntry::Folder);
        let file = create(&mut catalog, &device, &mut mdb, a.id(), "f", NewEntry::File);

        let moved = catalog
            .rename_entry(&device, &mut mdb, &file, b.id(), "g", 400)
            .unwrap();
        assert_eq!(moved.id(), file.id());
        assert_eq!(catalog.resolve_path(&device, "b/g").unwrap().id(), file.id());
        assert!(catalog.resolve_path(&device, "a/f").is_err());
        assert_eq!(catalog.entry_for_id(&device, file.id()).unwrap().key, moved.key);
        assert_eq!(valence(&catalog, &device, a.id()), 0);
        assert_eq!(valence(&catalog, &device, b.id()), 1);
    }

    #[test]
    fn test_rename_rejects_own_subtree() {
        let (device, mut catalog, mut mdb) = setup(false);
        let a = create(&mut catalog, &device, &mut mdb, ROOT_FOLDER_ID, "a", NewEntry::Folder);
        let inner = create(&mut catalog, &device, &mut mdb, a.id(), "inner", NewEntry::Folder);

        let into_child = catalog.rename_entry(&device, &mut mdb, &a, inner.id(), "a", 1);
        assert!(matches!(into_child, Err(HfsError::InvalidArgument(_))));
        let into_self = catalog.rename_entry(&device, &mut mdb, &a, a.id(), "a", 1);
        assert!(matches!(into_self, Err(HfsError::InvalidArgument(_))));

        // Changing only the case of a name is allowed
        let renamed = catalog
            .rename_entry(&device, &mut mdb, &a, ROOT_FOLDER_ID, "A", 1)
            .unwrap();
        assert_eq!(renamed.name(), "A");
    }

    #[test]
    fn test_id_allocation_skips_live_threads() {
        let (device, mut catalog, mut mdb) = setup(false);
        let first = create(&mut catalog, &device, &mut mdb, ROOT_FOLDER_ID, "one", NewEntry::File);
        assert_eq!(first.id(), 16);

        // A stale header handing out an ID that is still referenced
        mdb.next_catalog_id = 16;
        let second = create(&mut catalog, &device, &mut mdb, ROOT_FOLDER_ID, "two", NewEntry::File);
        assert_eq!(second.id(), 17);
        assert_eq!(mdb.next_catalog_id, 18);
    }

    #[test]
    fn test_many_entries_keep_tree_valid() {
        let (device, mut catalog, mut mdb) = setup(false);
        for i in 0..150 {
            let name = format!("file {:03}", (i * 37) % 150);
            create(&mut catalog, &device, &mut mdb, ROOT_FOLDER_ID, &name, NewEntry::File);
        }
        let stats = catalog.tree().verify(&device).unwrap();
        assert_eq!(stats.leaf_records, 2 + 300);
        assert!(stats.depth >= 2);
        assert_eq!(catalog.children(&device, ROOT_FOLDER_ID).unwrap().count(), 150);

        for i in (0..150).step_by(2) {
            let name = format!("file {:03}", i);
            catalog
                .remove_entry(&device, &mut mdb, ROOT_FOLDER_ID, name.as_bytes(), 1)
                .unwrap();
        }
        catalog.tree().verify(&device).unwrap();
        assert_eq!(valence(&catalog, &device, ROOT_FOLDER_ID), 75);
        assert_eq!(catalog.entries(&device).count(), 76);
    }

    #[test]
    fn test_rename_root() {
        let (device, mut catalog, _mdb) = setup(false);
        catalog.rename_root(&device, b"Renamed").unwrap();
        let root = catalog.resolve_path(&device, "").unwrap();
        assert_eq!(root.name(), "Renamed");
        assert_eq!(root.key.parent_id, ROOT_PARENT_ID);
    }
}
