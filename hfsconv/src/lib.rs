//! hfsconv — reads HFS and HFS+ volume images and converts HFS ("Macintosh
//! Standard") volumes to HFS+ ("Macintosh Extended").
//!
//! The crate is organized bottom-up, the same way the on-disk format layers:
//! byte-order/size arithmetic and text encoding at the bottom, the B*-tree
//! engine and catalog model above that, then the source/destination volume
//! readers and writers, and finally the conversion pipeline and its
//! supporting tools (probe, consistency checker, archive) at the top.

pub mod archive;
pub mod btree;
pub mod catalog;
pub mod catalog_builder;
pub mod consistency;
pub mod encoding;
pub mod error;
pub mod extents;
pub mod pipeline;
pub mod probe;
pub mod size;
pub mod unicode;
pub mod volume;

pub use error::{Error, Result, Warning};
pub use volume::{DestinationVolume, SourceVolume, VolumeHeader, VolumeSignature};

/// Entry kind in the filesystem, independent of HFS vs. HFS+.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
}

/// A directory entry returned by `list_directory`.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub cnid: u32,
    pub kind: EntryKind,
    /// Data fork logical size (0 for directories).
    pub size: u64,
    /// HFS+/HFS creation date (seconds since 1904-01-01).
    pub create_date: u32,
    pub modify_date: u32,
}

/// HFS/HFS+ permissions (BSD-style, present but rarely populated on
/// classic Mac volumes).
#[derive(Debug, Clone)]
pub struct HfsPermissions {
    pub owner_id: u32,
    pub group_id: u32,
    pub mode: u16,
}

/// Detailed file/directory metadata, as surfaced by `analyze` and `list
/// --long`.
#[derive(Debug, Clone)]
pub struct FileStat {
    pub cnid: u32,
    pub kind: EntryKind,
    pub size: u64,
    pub create_date: u32,
    pub modify_date: u32,
    pub permissions: HfsPermissions,
    pub data_fork_extents: u32,
    pub resource_fork_size: u64,
    pub type_code: Option<[u8; 4]>,
    pub creator_code: Option<[u8; 4]>,
}

/// Entry from `walk()` -- includes the full path from the volume root.
#[derive(Debug, Clone)]
pub struct WalkEntry {
    pub path: String,
    pub entry: DirEntry,
}
