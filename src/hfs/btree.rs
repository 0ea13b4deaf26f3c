//! On-disk HFS B-tree shared by the catalog and extents overflow files
//!
//! Nodes are 512 bytes: a 14-byte node descriptor, records packed upward
//! from offset 14, and a table of u16 record offsets growing down from the
//! end of the node. Node 0 is the header node holding the tree header
//! record and the node allocation map. Nodes are referenced by number only;
//! any node can be rebuilt by reading its sector again.

use byteorder::{BigEndian, ByteOrder};
use parking_lot::Mutex;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use super::block::{BlockDevice, SECTOR_SIZE};
use super::error::{HfsError, Result};
use super::extents::ForkData;
use super::mdb::Geometry;

/// B-tree node size used by HFS
pub const NODE_SIZE: usize = 512;

const DESCRIPTOR_LEN: usize = 14;
const HEADER_REC_LEN: usize = 106;
const USER_REC_LEN: usize = 128;
const MAP_REC_OFFSET: usize = DESCRIPTOR_LEN + HEADER_REC_LEN + USER_REC_LEN;
const MAP_REC_LEN: usize = NODE_SIZE - MAP_REC_OFFSET - 8;

/// Nodes addressable by the header node's map record
pub const MAX_TREE_NODES: u32 = (MAP_REC_LEN * 8) as u32;

/// Usable bytes for records and their offsets in a node
const NODE_CAPACITY: usize = NODE_SIZE - DESCRIPTOR_LEN - 2;

const MAX_DEPTH: usize = 16;

/// Node descriptor kind (`ndType`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Index,
    Header,
    Map,
    Leaf,
}

impl NodeKind {
    fn from_raw(raw: i8) -> Option<Self> {
        match raw {
            0 => Some(Self::Index),
            1 => Some(Self::Header),
            2 => Some(Self::Map),
            -1 => Some(Self::Leaf),
            _ => None,
        }
    }

    fn raw(self) -> i8 {
        match self {
            Self::Index => 0,
            Self::Header => 1,
            Self::Map => 2,
            Self::Leaf => -1,
        }
    }
}

/// Describes the keys and records stored in a particular tree
pub trait TreeLayout {
    type Key: Clone + fmt::Debug;
    type Record: Clone + fmt::Debug;

    /// Maximum key length excluding the length byte; index keys are padded to it
    const MAX_KEY_LEN: usize;

    fn compare(&self, a: &Self::Key, b: &Self::Key) -> Ordering;

    /// Key bytes without the leading length byte
    fn encode_key(&self, key: &Self::Key) -> Vec<u8>;

    /// Parse key bytes; index keys may carry trailing padding
    fn decode_key(&self, body: &[u8]) -> Result<Self::Key, String>;

    fn encode_record(&self, record: &Self::Record) -> Vec<u8>;

    fn decode_record(&self, data: &[u8]) -> Result<Self::Record, String>;
}

#[derive(Debug, Clone)]
enum Entries<K, R> {
    Index(Vec<(K, u32)>),
    Leaf(Vec<(K, R)>),
}

#[derive(Debug, Clone)]
struct Node<K, R> {
    flink: u32,
    blink: u32,
    height: u8,
    entries: Entries<K, R>,
}

type NodeOf<L> = Node<<L as TreeLayout>::Key, <L as TreeLayout>::Record>;

impl<K, R> Node<K, R> {
    fn leaf(entries: Vec<(K, R)>) -> Self {
        Self {
            flink: 0,
            blink: 0,
            height: 1,
            entries: Entries::Leaf(entries),
        }
    }

    fn len(&self) -> usize {
        match &self.entries {
            Entries::Index(e) => e.len(),
            Entries::Leaf(e) => e.len(),
        }
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_leaf(&self) -> bool {
        matches!(self.entries, Entries::Leaf(_))
    }

    fn kind(&self) -> NodeKind {
        if self.is_leaf() {
            NodeKind::Leaf
        } else {
            NodeKind::Index
        }
    }

    fn first_key(&self) -> Option<&K> {
        match &self.entries {
            Entries::Index(e) => e.first().map(|(k, _)| k),
            Entries::Leaf(e) => e.first().map(|(k, _)| k),
        }
    }

    fn index_entries(&self, id: u32) -> Result<&Vec<(K, u32)>> {
        match &self.entries {
            Entries::Index(e) => Ok(e),
            Entries::Leaf(_) => Err(HfsError::corrupt(id, "expected an index node")),
        }
    }

    fn index_entries_mut(&mut self, id: u32) -> Result<&mut Vec<(K, u32)>> {
        match &mut self.entries {
            Entries::Index(e) => Ok(e),
            Entries::Leaf(_) => Err(HfsError::corrupt(id, "expected an index node")),
        }
    }

    fn leaf_entries_mut(&mut self, id: u32) -> Result<&mut Vec<(K, R)>> {
        match &mut self.entries {
            Entries::Leaf(e) => Ok(e),
            Entries::Index(_) => Err(HfsError::corrupt(id, "expected a leaf node")),
        }
    }

    /// Move every entry of `other` onto the end of this node
    fn append(&mut self, id: u32, other: Entries<K, R>) -> Result<()> {
        match (&mut self.entries, other) {
            (Entries::Index(a), Entries::Index(mut b)) => a.append(&mut b),
            (Entries::Leaf(a), Entries::Leaf(mut b)) => a.append(&mut b),
            _ => return Err(HfsError::corrupt(id, "sibling of a different kind")),
        }
        Ok(())
    }
}

/// Header record and allocation map of node 0
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BTreeHeader {
    pub depth: u16,
    pub root: u32,
    pub leaf_records: u32,
    pub first_leaf: u32,
    pub last_leaf: u32,
    pub node_size: u16,
    pub max_key_len: u16,
    pub total_nodes: u32,
    pub free_nodes: u32,
    map: Vec<u8>,
}

impl BTreeHeader {
    fn new(total_nodes: u32, max_key_len: u16) -> Self {
        let mut header = Self {
            depth: 0,
            root: 0,
            leaf_records: 0,
            first_leaf: 0,
            last_leaf: 0,
            node_size: NODE_SIZE as u16,
            max_key_len,
            total_nodes,
            free_nodes: total_nodes - 1,
            map: vec![0u8; MAP_REC_LEN],
        };
        header.set_allocated(0, true);
        header
    }

    fn parse(data: &[u8]) -> Result<Self> {
        if NodeKind::from_raw(data[8] as i8) != Some(NodeKind::Header) {
            return Err(HfsError::InvalidFormat(format!(
                "Expected B-tree header node, got kind {}",
                data[8] as i8
            )));
        }
        Ok(Self {
            depth: BigEndian::read_u16(&data[14..16]),
            root: BigEndian::read_u32(&data[16..20]),
            leaf_records: BigEndian::read_u32(&data[20..24]),
            first_leaf: BigEndian::read_u32(&data[24..28]),
            last_leaf: BigEndian::read_u32(&data[28..32]),
            node_size: BigEndian::read_u16(&data[32..34]),
            max_key_len: BigEndian::read_u16(&data[34..36]),
            total_nodes: BigEndian::read_u32(&data[36..40]),
            free_nodes: BigEndian::read_u32(&data[40..44]),
            map: data[MAP_REC_OFFSET..MAP_REC_OFFSET + MAP_REC_LEN].to_vec(),
        })
    }

    fn encode(&self) -> Vec<u8> {
        let mut data = vec![0u8; NODE_SIZE];
        data[8] = NodeKind::Header.raw() as u8;
        BigEndian::write_u16(&mut data[10..12], 3);
        BigEndian::write_u16(&mut data[14..16], self.depth);
        BigEndian::write_u32(&mut data[16..20], self.root);
        BigEndian::write_u32(&mut data[20..24], self.leaf_records);
        BigEndian::write_u32(&mut data[24..28], self.first_leaf);
        BigEndian::write_u32(&mut data[28..32], self.last_leaf);
        BigEndian::write_u16(&mut data[32..34], self.node_size);
        BigEndian::write_u16(&mut data[34..36], self.max_key_len);
        BigEndian::write_u32(&mut data[36..40], self.total_nodes);
        BigEndian::write_u32(&mut data[40..44], self.free_nodes);
        data[MAP_REC_OFFSET..MAP_REC_OFFSET + MAP_REC_LEN].copy_from_slice(&self.map);

        let offsets = [
            DESCRIPTOR_LEN,
            DESCRIPTOR_LEN + HEADER_REC_LEN,
            MAP_REC_OFFSET,
            MAP_REC_OFFSET + MAP_REC_LEN,
        ];
        for (i, offset) in offsets.iter().enumerate() {
            let pos = NODE_SIZE - 2 * (i + 1);
            BigEndian::write_u16(&mut data[pos..pos + 2], *offset as u16);
        }
        data
    }

    /// Nodes past the end of the map are never allocated
    pub fn is_allocated(&self, node: u32) -> bool {
        self.map
            .get((node / 8) as usize)
            .map_or(false, |byte| byte & (0x80 >> (node % 8)) != 0)
    }

    fn set_allocated(&mut self, node: u32, used: bool) {
        let mask = 0x80 >> (node % 8);
        if used {
            self.map[(node / 8) as usize] |= mask;
        } else {
            self.map[(node / 8) as usize] &= !mask;
        }
    }
}

/// Shape of a tree as found by [`BTree::verify`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TreeStats {
    pub depth: u16,
    pub leaf_records: u32,
    pub nodes_in_use: u32,
}

#[derive(Debug, Clone, Copy)]
struct PathStep {
    node: u32,
    index: usize,
}

struct NodeCache<K, R> {
    nodes: HashMap<u32, Node<K, R>>,
    capacity: usize,
}

impl<K, R> NodeCache<K, R> {
    fn insert(&mut self, id: u32, node: Node<K, R>) {
        if self.capacity == 0 {
            return;
        }
        if self.nodes.len() >= self.capacity && !self.nodes.contains_key(&id) {
            if let Some(&evict) = self.nodes.keys().next() {
                self.nodes.remove(&evict);
            }
        }
        self.nodes.insert(id, node);
    }
}

/// State needed to undo a failed mutation
struct UndoLog<K, R> {
    header: BTreeHeader,
    header_dirty: bool,
    fork: ForkData,
    nodes: HashMap<u32, Option<Node<K, R>>>,
}

/// One B-tree file on a mounted volume
pub struct BTree<L: TreeLayout> {
    layout: L,
    file_id: u32,
    fork: ForkData,
    geometry: Geometry,
    header: BTreeHeader,
    header_dirty: bool,
    dirty: BTreeMap<u32, NodeOf<L>>,
    cache: Mutex<NodeCache<L::Key, L::Record>>,
    undo: Option<UndoLog<L::Key, L::Record>>,
}

fn pad_even(len: usize) -> usize {
    len + (len & 1)
}

/// Index at which the entries divide into two halves of similar byte size
fn split_point(sizes: &[usize]) -> usize {
    let total: usize = sizes.iter().sum();
    let mut acc = 0;
    for (i, size) in sizes.iter().enumerate() {
        acc += size;
        if acc * 2 >= total {
            return (i + 1).clamp(1, sizes.len().saturating_sub(1).max(1));
        }
    }
    sizes.len() / 2
}

impl<L: TreeLayout> BTree<L> {
    /// Open an existing tree file by reading its header node
    pub fn open(
        device: &BlockDevice,
        layout: L,
        file_id: u32,
        fork: ForkData,
        geometry: Geometry,
        cache_capacity: usize,
    ) -> Result<Self> {
        let mut tree = Self::with_header(
            layout,
            file_id,
            fork,
            geometry,
            cache_capacity,
            BTreeHeader::new(1, L::MAX_KEY_LEN as u16),
        );
        let data = device.read_sectors(tree.node_sector(0)?, 1)?;
        let header = BTreeHeader::parse(&data)?;

        let file_nodes = fork.logical_size / NODE_SIZE as u32;
        if header.node_size as usize != NODE_SIZE {
            return Err(HfsError::InvalidFormat(format!(
                "B-tree file {} has node size {}",
                file_id, header.node_size
            )));
        }
        if header.total_nodes == 0
            || header.total_nodes > file_nodes
            || header.total_nodes > MAX_TREE_NODES
            || header.free_nodes >= header.total_nodes
            || header.root >= header.total_nodes
            || header.depth as usize > MAX_DEPTH
        {
            return Err(HfsError::InvalidFormat(format!(
                "B-tree file {} header is inconsistent: {:?}",
                file_id, header
            )));
        }
        tree.header = header;
        tree.header_dirty = false;
        Ok(tree)
    }

    /// Empty tree spanning the whole fork; everything is dirty
    pub fn create(
        layout: L,
        file_id: u32,
        fork: ForkData,
        geometry: Geometry,
        cache_capacity: usize,
    ) -> Self {
        let nodes = (fork.logical_size / NODE_SIZE as u32).clamp(1, MAX_TREE_NODES);
        let header = BTreeHeader::new(nodes, L::MAX_KEY_LEN as u16);
        Self::with_header(layout, file_id, fork, geometry, cache_capacity, header)
    }

    fn with_header(
        layout: L,
        file_id: u32,
        fork: ForkData,
        geometry: Geometry,
        cache_capacity: usize,
        header: BTreeHeader,
    ) -> Self {
        Self {
            layout,
            file_id,
            fork,
            geometry,
            header,
            header_dirty: true,
            dirty: BTreeMap::new(),
            cache: Mutex::new(NodeCache {
                nodes: HashMap::new(),
                capacity: cache_capacity,
            }),
            undo: None,
        }
    }

    pub fn layout(&self) -> &L {
        &self.layout
    }

    pub fn header(&self) -> &BTreeHeader {
        &self.header
    }

    pub fn fork(&self) -> &ForkData {
        &self.fork
    }

    pub fn file_id(&self) -> u32 {
        self.file_id
    }

    pub fn is_dirty(&self) -> bool {
        self.header_dirty || !self.dirty.is_empty()
    }

    pub fn dirty_nodes(&self) -> usize {
        self.dirty.len() + usize::from(self.header_dirty)
    }

    // ---- undo log ----

    /// Start recording undo state. Returns false when a log is already open,
    /// in which case the outer owner decides commit or rollback.
    pub fn begin(&mut self) -> bool {
        if self.undo.is_some() {
            return false;
        }
        self.undo = Some(UndoLog {
            header: self.header.clone(),
            header_dirty: self.header_dirty,
            fork: self.fork,
            nodes: HashMap::new(),
        });
        true
    }

    pub fn commit(&mut self) {
        self.undo = None;
    }

    pub fn rollback(&mut self) {
        let Some(undo) = self.undo.take() else {
            return;
        };
        self.header = undo.header;
        self.header_dirty = undo.header_dirty;
        self.fork = undo.fork;
        for (id, previous) in undo.nodes {
            match previous {
                Some(node) => {
                    self.dirty.insert(id, node);
                }
                None => {
                    self.dirty.remove(&id);
                }
            }
        }
        log::debug!("Rolled back B-tree file {}", self.file_id);
    }

    fn atomically<T>(&mut self, op: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let owner = self.begin();
        let result = op(self);
        if owner {
            match result {
                Ok(_) => self.commit(),
                Err(_) => self.rollback(),
            }
        }
        result
    }

    // ---- node paging ----

    fn node_sector(&self, id: u32) -> Result<u64> {
        let byte = id as u64 * NODE_SIZE as u64;
        let block_size = self.geometry.block_size as u64;
        let file_block = byte / block_size;
        let sector_in_block = (byte % block_size) / SECTOR_SIZE;

        let mut covered = 0u64;
        for extent in self.fork.extents.iter().filter(|e| !e.is_empty()) {
            let count = extent.block_count as u64;
            if file_block < covered + count {
                let block = extent.start_block as u32 + (file_block - covered) as u32;
                return Ok(self.geometry.block_sector(block) + sector_in_block);
            }
            covered += count;
        }
        Err(HfsError::corrupt(id, format!("node lies beyond B-tree file {}", self.file_id)))
    }

    fn read_node(&self, device: &BlockDevice, id: u32) -> Result<NodeOf<L>> {
        if id == 0 || id >= self.header.total_nodes {
            return Err(HfsError::corrupt(id, "node number out of range"));
        }
        if let Some(node) = self.dirty.get(&id) {
            return Ok(node.clone());
        }
        if let Some(node) = self.cache.lock().nodes.get(&id) {
            return Ok(node.clone());
        }
        let data = device.read_sectors(self.node_sector(id)?, 1)?;
        let node = self.decode_node(id, &data)?;
        self.cache.lock().insert(id, node.clone());
        Ok(node)
    }

    fn put_node(&mut self, id: u32, node: NodeOf<L>) {
        if let Some(undo) = self.undo.as_mut() {
            let previous = self.dirty.get(&id).cloned();
            undo.nodes.entry(id).or_insert(previous);
        }
        self.cache.get_mut().nodes.remove(&id);
        self.dirty.insert(id, node);
    }

    fn alloc_node(&mut self) -> Result<u32> {
        let id = (1..self.header.total_nodes)
            .find(|&n| !self.header.is_allocated(n))
            .ok_or(HfsError::OutOfSpace { requested: 1 })?;
        self.header.set_allocated(id, true);
        self.header.free_nodes -= 1;
        self.header_dirty = true;
        Ok(id)
    }

    fn free_node(&mut self, id: u32) {
        if self.header.is_allocated(id) {
            self.header.set_allocated(id, false);
            self.header.free_nodes += 1;
            self.header_dirty = true;
        }
    }

    /// Grow the tree over a longer fork; new nodes start out free
    pub fn extend(&mut self, fork: ForkData) {
        let nodes = (fork.logical_size / NODE_SIZE as u32).min(MAX_TREE_NODES);
        if nodes > self.header.total_nodes {
            self.header.free_nodes += nodes - self.header.total_nodes;
            self.header.total_nodes = nodes;
        }
        self.fork = fork;
        self.header_dirty = true;
    }

    // ---- record codec ----

    fn leaf_entry(&self, key: &L::Key, record: &L::Record) -> Vec<u8> {
        let body = self.layout.encode_key(key);
        let mut out = Vec::with_capacity(NODE_SIZE / 4);
        out.push(body.len() as u8);
        out.extend_from_slice(&body);
        out.resize(pad_even(out.len()), 0);
        out.extend_from_slice(&self.layout.encode_record(record));
        out.resize(pad_even(out.len()), 0);
        out
    }

    fn index_entry(&self, key: &L::Key, child: u32) -> Vec<u8> {
        let body = self.layout.encode_key(key);
        let mut out = Vec::with_capacity(L::MAX_KEY_LEN + 6);
        out.push(L::MAX_KEY_LEN as u8);
        out.extend_from_slice(&body);
        out.resize(pad_even(1 + L::MAX_KEY_LEN), 0);
        out.extend_from_slice(&child.to_be_bytes());
        out
    }

    fn entry_sizes(&self, entries: &Entries<L::Key, L::Record>) -> Vec<usize> {
        match entries {
            Entries::Index(e) => vec![pad_even(1 + L::MAX_KEY_LEN) + 4; e.len()],
            Entries::Leaf(e) => e.iter().map(|(k, r)| self.leaf_entry(k, r).len()).collect(),
        }
    }

    fn used_bytes(&self, node: &NodeOf<L>) -> usize {
        self.entry_sizes(&node.entries).iter().map(|size| size + 2).sum()
    }

    fn fits(&self, node: &NodeOf<L>) -> bool {
        self.used_bytes(node) <= NODE_CAPACITY
    }

    fn underfilled(&self, node: &NodeOf<L>) -> bool {
        self.used_bytes(node) * 2 < NODE_CAPACITY
    }

    fn encode_node(&self, id: u32, node: &NodeOf<L>) -> Result<Vec<u8>> {
        let records: Vec<Vec<u8>> = match &node.entries {
            Entries::Index(e) => e.iter().map(|(k, c)| self.index_entry(k, *c)).collect(),
            Entries::Leaf(e) => e.iter().map(|(k, r)| self.leaf_entry(k, r)).collect(),
        };

        let mut data = vec![0u8; NODE_SIZE];
        BigEndian::write_u32(&mut data[0..4], node.flink);
        BigEndian::write_u32(&mut data[4..8], node.blink);
        data[8] = node.kind().raw() as u8;
        data[9] = node.height;
        BigEndian::write_u16(&mut data[10..12], records.len() as u16);

        let table_len = 2 * (records.len() + 1);
        let mut offset = DESCRIPTOR_LEN;
        let mut offsets = Vec::with_capacity(records.len() + 1);
        for record in &records {
            if offset + record.len() + table_len > NODE_SIZE {
                return Err(HfsError::corrupt(id, "records overflow the node"));
            }
            offsets.push(offset);
            data[offset..offset + record.len()].copy_from_slice(record);
            offset += record.len();
        }
        offsets.push(offset);

        for (i, offset) in offsets.iter().enumerate() {
            let pos = NODE_SIZE - 2 * (i + 1);
            BigEndian::write_u16(&mut data[pos..pos + 2], *offset as u16);
        }
        Ok(data)
    }

    fn decode_node(&self, id: u32, data: &[u8]) -> Result<NodeOf<L>> {
        let flink = BigEndian::read_u32(&data[0..4]);
        let blink = BigEndian::read_u32(&data[4..8]);
        let kind = NodeKind::from_raw(data[8] as i8)
            .ok_or_else(|| HfsError::corrupt(id, format!("unknown node kind {}", data[8] as i8)))?;
        let height = data[9];
        let num_records = BigEndian::read_u16(&data[10..12]) as usize;

        let table_len = 2 * (num_records + 1);
        if DESCRIPTOR_LEN + table_len > NODE_SIZE {
            return Err(HfsError::corrupt(id, format!("{} records cannot fit", num_records)));
        }
        let offsets: Vec<usize> = (0..=num_records)
            .map(|i| {
                let pos = NODE_SIZE - 2 * (i + 1);
                BigEndian::read_u16(&data[pos..pos + 2]) as usize
            })
            .collect();
        if offsets[0] < DESCRIPTOR_LEN
            || offsets.windows(2).any(|w| w[0] >= w[1])
            || offsets[num_records] > NODE_SIZE - table_len
        {
            return Err(HfsError::corrupt(id, "record offsets out of order"));
        }

        let corrupt = |detail: String| HfsError::corrupt(id, detail);
        let mut index = Vec::new();
        let mut leaf = Vec::new();
        for window in offsets.windows(2) {
            let record = &data[window[0]..window[1]];
            let key_len = record[0] as usize;
            if key_len == 0 || 1 + key_len > record.len() {
                return Err(corrupt(format!("bad key length {}", key_len)));
            }
            let key = self.layout.decode_key(&record[1..1 + key_len]).map_err(corrupt)?;
            let payload = &record[pad_even(1 + key_len).min(record.len())..];
            match kind {
                NodeKind::Index => {
                    if payload.len() < 4 {
                        return Err(corrupt("index record without child pointer".to_string()));
                    }
                    index.push((key, BigEndian::read_u32(&payload[0..4])));
                }
                NodeKind::Leaf => {
                    leaf.push((key, self.layout.decode_record(payload).map_err(corrupt)?));
                }
                NodeKind::Header | NodeKind::Map => {
                    return Err(corrupt(format!("unexpected {:?} node in tree", kind)));
                }
            }
        }

        let entries = if kind == NodeKind::Leaf {
            Entries::Leaf(leaf)
        } else {
            Entries::Index(index)
        };
        Ok(Node {
            flink,
            blink,
            height,
            entries,
        })
    }

    // ---- lookups ----

    fn descend(
        &self,
        device: &BlockDevice,
        key: &L::Key,
    ) -> Result<(Vec<PathStep>, u32, NodeOf<L>)> {
        let mut path = Vec::new();
        let mut id = self.header.root;
        loop {
            if path.len() > MAX_DEPTH {
                return Err(HfsError::corrupt(id, "tree deeper than allowed"));
            }
            let node = self.read_node(device, id)?;
            let child = match &node.entries {
                Entries::Leaf(_) => return Ok((path, id, node)),
                Entries::Index(entries) => {
                    if entries.is_empty() {
                        return Err(HfsError::corrupt(id, "empty index node"));
                    }
                    let pos = entries
                        .partition_point(|(k, _)| self.layout.compare(k, key) != Ordering::Greater);
                    let index = pos.saturating_sub(1);
                    path.push(PathStep { node: id, index });
                    entries[index].1
                }
            };
            id = child;
        }
    }

    /// Exact-match lookup
    pub fn find(&self, device: &BlockDevice, key: &L::Key) -> Result<Option<L::Record>> {
        Ok(self.find_entry(device, key)?.map(|(_, record)| record))
    }

    /// Exact-match lookup returning the key as stored, which may differ
    /// from `key` when the layout's comparison folds case
    pub fn find_entry(
        &self,
        device: &BlockDevice,
        key: &L::Key,
    ) -> Result<Option<(L::Key, L::Record)>> {
        if self.header.root == 0 {
            return Ok(None);
        }
        let (_, id, mut leaf) = self.descend(device, key)?;
        let entries = leaf.leaf_entries_mut(id)?;
        Ok(entries
            .binary_search_by(|(k, _)| self.layout.compare(k, key))
            .ok()
            .map(|pos| entries.swap_remove(pos)))
    }

    /// Exact-match lookup that fails when the key is absent
    pub fn get(&self, device: &BlockDevice, key: &L::Key) -> Result<L::Record> {
        self.find(device, key)?
            .ok_or_else(|| HfsError::KeyNotFound(format!("{:?}", key)))
    }

    /// Greatest entry whose key is less than or equal to `key`
    pub fn find_floor(
        &self,
        device: &BlockDevice,
        key: &L::Key,
    ) -> Result<Option<(L::Key, L::Record)>> {
        if self.header.root == 0 {
            return Ok(None);
        }
        let (_, id, mut leaf) = self.descend(device, key)?;
        let blink = leaf.blink;
        let entries = leaf.leaf_entries_mut(id)?;
        let pos = entries.partition_point(|(k, _)| self.layout.compare(k, key) != Ordering::Greater);
        if pos > 0 {
            return Ok(Some(entries.swap_remove(pos - 1)));
        }
        if blink == 0 {
            return Ok(None);
        }
        let mut previous = self.read_node(device, blink)?;
        Ok(previous.leaf_entries_mut(blink)?.pop())
    }

    /// Ascending scan starting at the first key not less than `start`
    pub fn range_from<'a>(
        &'a self,
        device: &'a BlockDevice,
        start: &L::Key,
    ) -> Result<RangeScan<'a, L>> {
        if self.header.root == 0 {
            return Ok(RangeScan::empty(self, device));
        }
        let (_, id, leaf) = self.descend(device, start)?;
        let flink = leaf.flink;
        let Entries::Leaf(mut entries) = leaf.entries else {
            return Err(HfsError::corrupt(id, "expected a leaf node"));
        };
        let skip = entries.partition_point(|(k, _)| self.layout.compare(k, start) == Ordering::Less);
        entries.drain(..skip);
        Ok(RangeScan {
            tree: self,
            device,
            entries: entries.into_iter(),
            next_leaf: flink,
            failed: false,
        })
    }

    /// Scan of every record in key order
    pub fn scan<'a>(&'a self, device: &'a BlockDevice) -> RangeScan<'a, L> {
        let mut scan = RangeScan::empty(self, device);
        scan.next_leaf = self.header.first_leaf;
        scan
    }

    // ---- mutations ----

    /// Insert a new record; fails with `DuplicateKey` if the key exists
    pub fn insert(&mut self, device: &BlockDevice, key: L::Key, record: L::Record) -> Result<()> {
        self.atomically(|tree| tree.insert_inner(device, key, record))
    }

    fn insert_inner(&mut self, device: &BlockDevice, key: L::Key, record: L::Record) -> Result<()> {
        if self.header.root == 0 {
            let id = self.alloc_node()?;
            self.put_node(id, Node::leaf(vec![(key, record)]));
            self.header.root = id;
            self.header.depth = 1;
            self.header.first_leaf = id;
            self.header.last_leaf = id;
            self.header.leaf_records = 1;
            self.header_dirty = true;
            return Ok(());
        }

        let (path, id, mut leaf) = self.descend(device, &key)?;
        let entries = leaf.leaf_entries_mut(id)?;
        match entries.binary_search_by(|(k, _)| self.layout.compare(k, &key)) {
            Ok(_) => return Err(HfsError::DuplicateKey(format!("{:?}", key))),
            Err(pos) => entries.insert(pos, (key, record)),
        }
        self.header.leaf_records += 1;
        self.header_dirty = true;
        self.store_and_propagate(device, path, id, leaf)
    }

    /// Replace the record stored under an existing key
    pub fn update(&mut self, device: &BlockDevice, key: &L::Key, record: L::Record) -> Result<()> {
        self.atomically(|tree| {
            if tree.header.root == 0 {
                return Err(HfsError::KeyNotFound(format!("{:?}", key)));
            }
            let (path, id, mut leaf) = tree.descend(device, key)?;
            let entries = leaf.leaf_entries_mut(id)?;
            let pos = entries
                .binary_search_by(|(k, _)| tree.layout.compare(k, key))
                .map_err(|_| HfsError::KeyNotFound(format!("{:?}", key)))?;
            entries[pos].1 = record;
            tree.store_and_propagate(device, path, id, leaf)
        })
    }

    /// Write a modified node back, splitting upward while nodes overflow and
    /// refreshing parent separators that changed
    fn store_and_propagate(
        &mut self,
        device: &BlockDevice,
        mut path: Vec<PathStep>,
        mut id: u32,
        mut node: NodeOf<L>,
    ) -> Result<()> {
        loop {
            let height = node.height;
            let sibling = if self.fits(&node) {
                None
            } else {
                Some(self.split(device, id, &mut node)?)
            };
            let first_key = node.first_key().cloned();
            self.put_node(id, node);

            let Some(step) = path.pop() else {
                if let Some((right_key, right_id)) = sibling {
                    let left_key =
                        first_key.ok_or_else(|| HfsError::corrupt(id, "split left an empty node"))?;
                    self.grow_root(id, left_key, right_id, right_key, height)?;
                }
                return Ok(());
            };

            let mut parent = self.read_node(device, step.node)?;
            let entries = parent.index_entries_mut(step.node)?;
            let mut changed = false;
            if let Some(key) = first_key {
                if self.layout.compare(&entries[step.index].0, &key) != Ordering::Equal {
                    entries[step.index].0 = key;
                    changed = true;
                }
            }
            if let Some(new_entry) = sibling {
                entries.insert(step.index + 1, new_entry);
                changed = true;
            }
            if !changed {
                return Ok(());
            }
            id = step.node;
            node = parent;
        }
    }

    /// Move the upper half of `node` into a new right sibling
    fn split(&mut self, device: &BlockDevice, id: u32, node: &mut NodeOf<L>) -> Result<(L::Key, u32)> {
        let right_id = self.alloc_node()?;
        let at = split_point(&self.entry_sizes(&node.entries));
        let tail = match &mut node.entries {
            Entries::Index(e) => Entries::Index(e.split_off(at)),
            Entries::Leaf(e) => Entries::Leaf(e.split_off(at)),
        };
        let right = Node {
            flink: node.flink,
            blink: id,
            height: node.height,
            entries: tail,
        };
        node.flink = right_id;

        if right.flink != 0 {
            let mut next = self.read_node(device, right.flink)?;
            next.blink = right_id;
            self.put_node(right.flink, next);
        } else if right.is_leaf() {
            self.header.last_leaf = right_id;
            self.header_dirty = true;
        }
        if !self.fits(node) || !self.fits(&right) {
            return Err(HfsError::corrupt(id, "records too large to split"));
        }

        let right_key = right
            .first_key()
            .cloned()
            .ok_or_else(|| HfsError::corrupt(id, "split produced an empty node"))?;
        log::debug!(
            "Split node {} of B-tree file {} into {} at height {}",
            id,
            self.file_id,
            right_id,
            right.height
        );
        self.put_node(right_id, right);
        Ok((right_key, right_id))
    }

    fn grow_root(
        &mut self,
        left_id: u32,
        left_key: L::Key,
        right_id: u32,
        right_key: L::Key,
        child_height: u8,
    ) -> Result<()> {
        let root_id = self.alloc_node()?;
        let root = Node {
            flink: 0,
            blink: 0,
            height: child_height + 1,
            entries: Entries::Index(vec![(left_key, left_id), (right_key, right_id)]),
        };
        self.put_node(root_id, root);
        self.header.root = root_id;
        self.header.depth += 1;
        self.header_dirty = true;
        log::debug!("B-tree file {} grew to depth {}", self.file_id, self.header.depth);
        Ok(())
    }

    /// Remove a record and return it; fails with `KeyNotFound` if absent
    pub fn remove(&mut self, device: &BlockDevice, key: &L::Key) -> Result<L::Record> {
        self.atomically(|tree| tree.remove_inner(device, key))
    }

    fn remove_inner(&mut self, device: &BlockDevice, key: &L::Key) -> Result<L::Record> {
        if self.header.root == 0 {
            return Err(HfsError::KeyNotFound(format!("{:?}", key)));
        }
        let (path, id, mut leaf) = self.descend(device, key)?;
        let entries = leaf.leaf_entries_mut(id)?;
        let pos = entries
            .binary_search_by(|(k, _)| self.layout.compare(k, key))
            .map_err(|_| HfsError::KeyNotFound(format!("{:?}", key)))?;
        let (_, record) = entries.remove(pos);
        self.header.leaf_records -= 1;
        self.header_dirty = true;
        self.rebalance(device, path, id, leaf)?;
        Ok(record)
    }

    /// Walk back to the root fixing empty and under-filled nodes
    fn rebalance(
        &mut self,
        device: &BlockDevice,
        mut path: Vec<PathStep>,
        mut id: u32,
        mut node: NodeOf<L>,
    ) -> Result<()> {
        loop {
            let Some(step) = path.pop() else {
                return self.settle_root(device, id, node);
            };
            let mut parent = self.read_node(device, step.node)?;
            if node.is_empty() {
                self.unlink(device, id, &node)?;
                self.free_node(id);
                parent.index_entries_mut(step.node)?.remove(step.index);
            } else if self.underfilled(&node) {
                self.merge_or_redistribute(device, &mut parent, step, id, node)?;
            } else {
                let first = node.first_key().cloned();
                self.put_node(id, node);
                if let Some(key) = first {
                    parent.index_entries_mut(step.node)?[step.index].0 = key;
                }
            }
            id = step.node;
            node = parent;
        }
    }

    fn settle_root(&mut self, device: &BlockDevice, mut id: u32, mut node: NodeOf<L>) -> Result<()> {
        loop {
            match &node.entries {
                Entries::Index(e) if e.len() == 1 => {
                    let child = e[0].1;
                    self.free_node(id);
                    self.header.root = child;
                    self.header.depth -= 1;
                    self.header_dirty = true;
                    id = child;
                    node = self.read_node(device, child)?;
                }
                _ if node.is_empty() => {
                    self.free_node(id);
                    self.header.root = 0;
                    self.header.depth = 0;
                    self.header.first_leaf = 0;
                    self.header.last_leaf = 0;
                    self.header_dirty = true;
                    return Ok(());
                }
                _ => {
                    if id == self.header.root && (node.flink != 0 || node.blink != 0) {
                        node.flink = 0;
                        node.blink = 0;
                    }
                    self.put_node(id, node);
                    return Ok(());
                }
            }
        }
    }

    /// Detach a node from its level's sibling chain
    fn unlink(&mut self, device: &BlockDevice, id: u32, node: &NodeOf<L>) -> Result<()> {
        if node.blink != 0 {
            let mut prev = self.read_node(device, node.blink)?;
            prev.flink = node.flink;
            self.put_node(node.blink, prev);
        } else if node.is_leaf() {
            self.header.first_leaf = node.flink;
            self.header_dirty = true;
        }
        if node.flink != 0 {
            let mut next = self.read_node(device, node.flink)?;
            next.blink = node.blink;
            self.put_node(node.flink, next);
        } else if node.is_leaf() {
            self.header.last_leaf = node.blink;
            self.header_dirty = true;
        }
        log::debug!("Released empty node {} of B-tree file {}", id, self.file_id);
        Ok(())
    }

    fn merge_or_redistribute(
        &mut self,
        device: &BlockDevice,
        parent: &mut NodeOf<L>,
        step: PathStep,
        id: u32,
        node: NodeOf<L>,
    ) -> Result<()> {
        let siblings = parent.index_entries(step.node)?.len();
        let left_index = if step.index > 0 {
            step.index - 1
        } else if step.index + 1 < siblings {
            step.index
        } else {
            // Only child: nothing to merge with
            let first = node.first_key().cloned();
            self.put_node(id, node);
            if let Some(key) = first {
                parent.index_entries_mut(step.node)?[step.index].0 = key;
            }
            return Ok(());
        };

        let entries = parent.index_entries(step.node)?;
        let (left_id, right_id) = (entries[left_index].1, entries[left_index + 1].1);
        let (mut left, mut right) = if left_index == step.index {
            (node, self.read_node(device, right_id)?)
        } else {
            (self.read_node(device, left_id)?, node)
        };

        if self.used_bytes(&left) + self.used_bytes(&right) <= NODE_CAPACITY {
            left.append(left_id, right.entries)?;
            left.flink = right.flink;
            if right.flink != 0 {
                let mut next = self.read_node(device, right.flink)?;
                next.blink = left_id;
                self.put_node(right.flink, next);
            } else if left.is_leaf() {
                self.header.last_leaf = left_id;
                self.header_dirty = true;
            }
            self.free_node(right_id);

            let left_key = left.first_key().cloned();
            self.put_node(left_id, left);
            let entries = parent.index_entries_mut(step.node)?;
            entries.remove(left_index + 1);
            if let Some(key) = left_key {
                entries[left_index].0 = key;
            }
        } else {
            let combined = std::mem::replace(&mut right.entries, Entries::Leaf(Vec::new()));
            left.append(left_id, combined)?;
            let at = split_point(&self.entry_sizes(&left.entries));
            right.entries = match &mut left.entries {
                Entries::Index(e) => Entries::Index(e.split_off(at)),
                Entries::Leaf(e) => Entries::Leaf(e.split_off(at)),
            };

            let left_key = left.first_key().cloned();
            let right_key = right.first_key().cloned();
            self.put_node(left_id, left);
            self.put_node(right_id, right);
            let entries = parent.index_entries_mut(step.node)?;
            if let Some(key) = left_key {
                entries[left_index].0 = key;
            }
            if let Some(key) = right_key {
                entries[left_index + 1].0 = key;
            }
        }
        Ok(())
    }

    // ---- flush ----

    /// Write every dirty node and the header node. Dirty state is kept
    /// until [`BTree::mark_clean`] so a failed flush can be retried.
    pub fn write_dirty(&self, device: &BlockDevice) -> Result<usize> {
        let mut written = 0;
        for (&id, node) in &self.dirty {
            let data = self.encode_node(id, node)?;
            device.write_sectors(self.node_sector(id)?, &data)?;
            written += 1;
        }
        if self.header_dirty {
            device.write_sectors(self.node_sector(0)?, &self.header.encode())?;
            written += 1;
        }
        Ok(written)
    }

    pub fn mark_clean(&mut self) {
        let dirty = std::mem::take(&mut self.dirty);
        let cache = self.cache.get_mut();
        for (id, node) in dirty {
            if self.header.is_allocated(id) {
                cache.insert(id, node);
            }
        }
        self.header_dirty = false;
    }

    // ---- consistency ----

    /// Check ordering, balance, separators, sibling links and counts
    pub fn verify(&self, device: &BlockDevice) -> Result<TreeStats> {
        let header = &self.header;
        let in_use = header.total_nodes - header.free_nodes;
        if header.root == 0 {
            if header.depth != 0 || header.leaf_records != 0 || header.first_leaf != 0 {
                return Err(HfsError::corrupt(0, "empty tree with non-zero header fields"));
            }
            return Ok(TreeStats {
                depth: 0,
                leaf_records: 0,
                nodes_in_use: in_use,
            });
        }

        let mut levels: Vec<Vec<u32>> = vec![Vec::new(); header.depth as usize];
        let mut last_key: Option<L::Key> = None;
        let mut records = 0u32;
        self.verify_node(
            device,
            header.root,
            header.depth,
            None,
            &mut levels,
            &mut last_key,
            &mut records,
        )?;

        if records != header.leaf_records {
            return Err(HfsError::corrupt(
                0,
                format!("header counts {} records, leaves hold {}", header.leaf_records, records),
            ));
        }
        for level in &levels {
            for (i, &id) in level.iter().enumerate() {
                let node = self.read_node(device, id)?;
                let expected_blink = if i == 0 { 0 } else { level[i - 1] };
                let expected_flink = level.get(i + 1).copied().unwrap_or(0);
                if node.blink != expected_blink || node.flink != expected_flink {
                    return Err(HfsError::corrupt(id, "sibling links out of order"));
                }
            }
        }
        let leaves = &levels[0];
        if leaves.first() != Some(&header.first_leaf) || leaves.last() != Some(&header.last_leaf) {
            return Err(HfsError::corrupt(0, "first/last leaf pointers are stale"));
        }
        let reachable: u32 = levels.iter().map(|l| l.len() as u32).sum::<u32>() + 1;
        if reachable != in_use {
            return Err(HfsError::corrupt(
                0,
                format!("{} nodes reachable but {} allocated", reachable, in_use),
            ));
        }
        Ok(TreeStats {
            depth: header.depth,
            leaf_records: records,
            nodes_in_use: in_use,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn verify_node(
        &self,
        device: &BlockDevice,
        id: u32,
        height: u16,
        separator: Option<&L::Key>,
        levels: &mut Vec<Vec<u32>>,
        last_key: &mut Option<L::Key>,
        records: &mut u32,
    ) -> Result<()> {
        if !self.header.is_allocated(id) {
            return Err(HfsError::corrupt(id, "reachable node is marked free"));
        }
        let node = self.read_node(device, id)?;
        if node.height as u16 != height {
            return Err(HfsError::corrupt(
                id,
                format!("height {} where {} was expected", node.height, height),
            ));
        }
        if node.is_empty() {
            return Err(HfsError::corrupt(id, "empty node"));
        }
        if let (Some(separator), Some(first)) = (separator, node.first_key()) {
            if self.layout.compare(separator, first) != Ordering::Equal {
                return Err(HfsError::corrupt(id, "parent separator differs from first key"));
            }
        }
        levels[height as usize - 1].push(id);

        match &node.entries {
            Entries::Leaf(entries) => {
                if height != 1 {
                    return Err(HfsError::corrupt(id, "leaf above the bottom level"));
                }
                for (key, _) in entries {
                    if let Some(previous) = last_key.as_ref() {
                        if self.layout.compare(previous, key) != Ordering::Less {
                            return Err(HfsError::corrupt(id, format!("key {:?} out of order", key)));
                        }
                    }
                    *last_key = Some(key.clone());
                    *records += 1;
                }
            }
            Entries::Index(entries) => {
                if height == 1 {
                    return Err(HfsError::corrupt(id, "index node at the leaf level"));
                }
                for (key, child) in entries {
                    self.verify_node(device, *child, height - 1, Some(key), levels, last_key, records)?;
                }
            }
        }
        Ok(())
    }
}

/// Lazy ascending iterator over leaf records, following forward links
pub struct RangeScan<'a, L: TreeLayout> {
    tree: &'a BTree<L>,
    device: &'a BlockDevice,
    entries: std::vec::IntoIter<(L::Key, L::Record)>,
    next_leaf: u32,
    failed: bool,
}

impl<'a, L: TreeLayout> RangeScan<'a, L> {
    fn empty(tree: &'a BTree<L>, device: &'a BlockDevice) -> Self {
        Self {
            tree,
            device,
            entries: Vec::new().into_iter(),
            next_leaf: 0,
            failed: false,
        }
    }
}

impl<L: TreeLayout> Iterator for RangeScan<'_, L> {
    type Item = Result<(L::Key, L::Record)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(entry) = self.entries.next() {
                return Some(Ok(entry));
            }
            if self.next_leaf == 0 || self.failed {
                return None;
            }
            let id = self.next_leaf;
            match self.tree.read_node(self.device, id) {
                Ok(Node {
                    flink,
                    entries: Entries::Leaf(entries),
                    ..
                }) => {
                    self.next_leaf = flink;
                    self.entries = entries.into_iter();
                }
                Ok(_) => {
                    self.failed = true;
                    return Some(Err(HfsError::corrupt(id, "leaf chain reaches an index node")));
                }
                Err(err) => {
                    self.failed = true;
                    return Some(Err(err));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hfs::block::MemoryBlockStore;
    use crate::hfs::extents::{ExtentDescriptor, ExtentRecord};

    /// Keys are u32, records are opaque byte strings
    struct TestLayout;

    impl TreeLayout for TestLayout {
        type Key = u32;
        type Record = Vec<u8>;
        const MAX_KEY_LEN: usize = 4;

        fn compare(&self, a: &u32, b: &u32) -> Ordering {
            a.cmp(b)
        }

        fn encode_key(&self, key: &u32) -> Vec<u8> {
            key.to_be_bytes().to_vec()
        }

        fn decode_key(&self, body: &[u8]) -> Result<u32, String> {
            if body.len() < 4 {
                return Err("short key".to_string());
            }
            Ok(BigEndian::read_u32(&body[0..4]))
        }

        fn encode_record(&self, record: &Vec<u8>) -> Vec<u8> {
            let mut out = vec![record.len() as u8];
            out.extend_from_slice(record);
            out
        }

        fn decode_record(&self, data: &[u8]) -> Result<Vec<u8>, String> {
            let len = *data.first().ok_or("empty record")? as usize;
            data.get(1..1 + len).map(|d| d.to_vec()).ok_or_else(|| "short record".to_string())
        }
    }

    fn setup(nodes: u16) -> (BlockDevice, BTree<TestLayout>) {
        let device = BlockDevice::new(Box::new(MemoryBlockStore::new(nodes as u64 * 512)));
        let mut extents = ExtentRecord::default();
        extents[0] = ExtentDescriptor::new(0, nodes);
        let fork = ForkData {
            logical_size: nodes as u32 * 512,
            physical_size: nodes as u32 * 512,
            extents,
        };
        let geometry = Geometry {
            first_alloc_sector: 0,
            block_size: 512,
            total_blocks: nodes as u32,
        };
        let tree = BTree::create(TestLayout, 4, fork, geometry, 8);
        (device, tree)
    }

    fn value(key: u32) -> Vec<u8> {
        vec![(key % 251) as u8; 20 + (key % 17) as usize]
    }

    /// Deterministic shuffle of 0..n
    fn shuffled(n: u32) -> Vec<u32> {
        (0..n).map(|i| (i * 7919) % n).collect()
    }

    #[test]
    fn test_insert_and_find() {
        let (device, mut tree) = setup(64);
        for key in shuffled(200) {
            tree.insert(&device, key, value(key)).unwrap();
        }
        for key in 0..200 {
            assert_eq!(tree.find(&device, &key).unwrap(), Some(value(key)));
        }
        assert_eq!(tree.find(&device, &500).unwrap(), None);

        let stats = tree.verify(&device).unwrap();
        assert_eq!(stats.leaf_records, 200);
        assert!(stats.depth >= 2);
    }

    #[test]
    fn test_duplicate_key() {
        let (device, mut tree) = setup(16);
        tree.insert(&device, 1, value(1)).unwrap();
        let result = tree.insert(&device, 1, value(2));
        assert!(matches!(result, Err(HfsError::DuplicateKey(_))));
        assert_eq!(tree.find(&device, &1).unwrap(), Some(value(1)));
    }

    #[test]
    fn test_remove_missing_key() {
        let (device, mut tree) = setup(16);
        assert!(matches!(tree.remove(&device, &3), Err(HfsError::KeyNotFound(_))));
        tree.insert(&device, 1, value(1)).unwrap();
        assert!(matches!(tree.remove(&device, &3), Err(HfsError::KeyNotFound(_))));
        assert!(matches!(tree.get(&device, &3), Err(HfsError::KeyNotFound(_))));
    }

    #[test]
    fn test_range_scan_is_ordered() {
        let (device, mut tree) = setup(64);
        for key in shuffled(150) {
            tree.insert(&device, key * 2, value(key)).unwrap();
        }
        let keys: Vec<u32> = tree
            .range_from(&device, &101)
            .unwrap()
            .map(|entry| entry.unwrap().0)
            .collect();
        let expected: Vec<u32> = (51..150).map(|k| k * 2).collect();
        assert_eq!(keys, expected);

        let all: Vec<u32> = tree.scan(&device).map(|e| e.unwrap().0).collect();
        assert_eq!(all.len(), 150);
        assert!(all.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_find_floor() {
        let (device, mut tree) = setup(64);
        for key in shuffled(100) {
            tree.insert(&device, key * 10, value(key)).unwrap();
        }
        assert_eq!(tree.find_floor(&device, &555).unwrap().map(|e| e.0), Some(550));
        assert_eq!(tree.find_floor(&device, &560).unwrap().map(|e| e.0), Some(560));
        assert_eq!(tree.find_floor(&device, &5000).unwrap().map(|e| e.0), Some(990));
        // 0 is the smallest key, nothing below it
        tree.remove(&device, &0).unwrap();
        assert_eq!(tree.find_floor(&device, &5).unwrap(), None);
    }

    #[test]
    fn test_remove_keeps_tree_balanced() {
        let (device, mut tree) = setup(64);
        for key in shuffled(300) {
            tree.insert(&device, key, value(key)).unwrap();
        }
        for key in shuffled(300).into_iter().filter(|k| k % 3 != 0) {
            assert_eq!(tree.remove(&device, &key).unwrap(), value(key));
            if key % 25 == 0 {
                tree.verify(&device).unwrap();
            }
        }
        let stats = tree.verify(&device).unwrap();
        assert_eq!(stats.leaf_records, 100);
        for key in 0..300 {
            let found = tree.find(&device, &key).unwrap();
            assert_eq!(found.is_some(), key % 3 == 0);
        }
    }

    #[test]
    fn test_remove_all_empties_tree() {
        let (device, mut tree) = setup(64);
        let free_before = tree.header().free_nodes;
        for key in shuffled(120) {
            tree.insert(&device, key, value(key)).unwrap();
        }
        for key in 0..120 {
            tree.remove(&device, &key).unwrap();
        }
        let header = tree.header();
        assert_eq!(header.root, 0);
        assert_eq!(header.depth, 0);
        assert_eq!(header.leaf_records, 0);
        assert_eq!(header.free_nodes, free_before);
        assert_eq!(tree.scan(&device).count(), 0);
    }

    #[test]
    fn test_update_in_place() {
        let (device, mut tree) = setup(32);
        for key in 0..40 {
            tree.insert(&device, key, value(key)).unwrap();
        }
        tree.update(&device, &17, vec![9u8; 90]).unwrap();
        assert_eq!(tree.find(&device, &17).unwrap(), Some(vec![9u8; 90]));
        tree.verify(&device).unwrap();
        assert!(matches!(
            tree.update(&device, &99, vec![]),
            Err(HfsError::KeyNotFound(_))
        ));
    }

    #[test]
    fn test_failed_split_rolls_back() {
        // Header plus three nodes: one split and a new root fit, the next split cannot
        let (device, mut tree) = setup(4);
        let mut inserted = Vec::new();
        let mut failure = None;
        for key in 0..64u32 {
            match tree.insert(&device, key, vec![key as u8; 100]) {
                Ok(()) => inserted.push(key),
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }
        assert!(matches!(failure, Some(HfsError::OutOfSpace { .. })));

        let stats = tree.verify(&device).unwrap();
        assert_eq!(stats.leaf_records as usize, inserted.len());
        for key in inserted {
            assert_eq!(tree.find(&device, &key).unwrap(), Some(vec![key as u8; 100]));
        }
    }

    #[test]
    fn test_flush_and_reopen() {
        let (device, mut tree) = setup(64);
        for key in shuffled(80) {
            tree.insert(&device, key, value(key)).unwrap();
        }
        assert!(tree.is_dirty());
        let written = tree.write_dirty(&device).unwrap();
        assert_eq!(written, tree.dirty_nodes());
        tree.mark_clean();
        assert!(!tree.is_dirty());

        let reopened = BTree::open(&device, TestLayout, 4, *tree.fork(), tree.geometry, 0).unwrap();
        assert_eq!(reopened.header(), tree.header());
        for key in 0..80 {
            assert_eq!(reopened.find(&device, &key).unwrap(), Some(value(key)));
        }
        reopened.verify(&device).unwrap();
    }

    #[test]
    fn test_open_rejects_non_header_node() {
        let (device, tree) = setup(8);
        let result = BTree::open(&device, TestLayout, 4, *tree.fork(), tree.geometry, 0);
        assert!(matches!(result, Err(HfsError::InvalidFormat(_))));
    }

    #[test]
    fn test_extend_adds_free_nodes() {
        let (_device, mut tree) = setup(8);
        let mut fork = *tree.fork();
        fork.extents[0] = ExtentDescriptor::new(0, 16);
        fork.logical_size = 16 * 512;
        tree.extend(fork);
        assert_eq!(tree.header().total_nodes, 16);
        assert_eq!(tree.header().free_nodes, 15);
    }

    #[test]
    fn test_nodes_past_the_map_are_free() {
        let (_device, tree) = setup(8);
        assert!(tree.header().is_allocated(0));
        assert!(!tree.header().is_allocated(7));
        assert!(!tree.header().is_allocated(5000));
        assert!(!tree.header().is_allocated(u32::MAX));
    }

    #[test]
    fn test_split_point_balances_bytes() {
        assert_eq!(split_point(&[10, 10, 10, 10]), 2);
        assert_eq!(split_point(&[100, 10, 10, 10]), 1);
        assert_eq!(split_point(&[10, 10, 10, 100]), 3);
    }
}
