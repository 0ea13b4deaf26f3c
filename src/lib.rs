//! HFS Volume Library
//!
//! Read/write access to classic HFS volume images: mounting, formatting,
//! catalog and fork operations, and crash-safe metadata flushing.

pub mod config;
pub mod hfs;
