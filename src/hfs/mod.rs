//! Classic HFS (Mac OS Standard) volume engine
//!
//! Layers, bottom up: block store, MDB and allocation bitmap, the generic
//! B-tree with its extents overflow and catalog layouts, the flush
//! coordinator, and the [`HfsVolume`] facade that ties them together.

pub mod bitmap;
pub mod block;
pub mod btree;
pub mod catalog;
pub mod entry;
pub mod error;
pub mod extents;
pub mod flush;
pub mod macroman;
pub mod mdb;
pub mod volume;

pub use block::{BlockStore, FileBlockStore, MemoryBlockStore};
pub use entry::{FileSystemAttributes, ItemAttributes, ItemKind};
pub use error::{HfsError, Result};
pub use extents::ForkType;
pub use mdb::FormatOptions;
pub use volume::{ConsistencyReport, HfsVolume};
