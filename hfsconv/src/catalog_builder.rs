//! Assembles the destination volume's catalog B*-tree from the items
//! discovered while walking a source volume (or a host directory, for
//! `archive`).
//!
//! Each item tracks both its destination catalog key/record and its
//! thread key/record, mirroring the item bookkeeping a bulk catalog
//! rebuild needs: every folder and file gets one keyed record plus one
//! thread record pointing back to it, and the whole set is sorted once by
//! destination key before being handed to [`crate::btree::builder`].

use byteorder::{BigEndian, WriteBytesExt};

use crate::catalog::{HfsPlusBsdInfo, CNID_ROOT_FOLDER, CNID_ROOT_PARENT, RECORD_TYPE_FILE, RECORD_TYPE_FILE_THREAD, RECORD_TYPE_FOLDER, RECORD_TYPE_FOLDER_THREAD};
use crate::catalog::CatalogKey;
use crate::extents::ForkData;
use crate::unicode;

/// One catalog entry destined for the new volume: either a folder or a
/// file, plus enough metadata to serialize both its keyed record and its
/// thread record.
#[derive(Debug, Clone)]
pub struct CatalogItem {
    pub cnid: u32,
    pub parent_cnid: u32,
    pub name: Vec<u16>,
    pub create_date: u32,
    pub content_mod_date: u32,
    pub permissions: HfsPlusBsdInfo,
    pub user_info: [u8; 16],
    pub finder_info: [u8; 16],
    pub text_encoding: u32,
    pub kind: CatalogItemKind,
}

#[derive(Debug, Clone)]
pub enum CatalogItemKind {
    Folder { valence: u32 },
    File { data_fork: ForkData, resource_fork: ForkData },
}

/// Tracks CNID assignment for the destination volume. HFS+ reserves CNIDs
/// 1-15; ordinary files and folders start at 16. A source HFS volume's
/// own CNIDs are reused verbatim when they already fall at or above this
/// floor and are not already spoken for, which keeps hard-linked Finder
/// aliases and other by-CNID references intact across the conversion;
/// otherwise a fresh CNID is minted.
pub struct CatalogIdAllocator {
    next_fresh: u32,
}

impl CatalogIdAllocator {
    pub fn new() -> Self {
        CatalogIdAllocator { next_fresh: crate::catalog::CNID_FIRST_USER_FILE }
    }

    pub fn reuse_or_allocate(&mut self, source_cnid: u32) -> u32 {
        if source_cnid >= crate::catalog::CNID_FIRST_USER_FILE {
            self.next_fresh = self.next_fresh.max(source_cnid + 1);
            source_cnid
        } else {
            let id = self.next_fresh;
            self.next_fresh += 1;
            id
        }
    }

    /// The CNID that would be minted next, suitable for a volume header's
    /// `nextCatalogID` field once every item has been assigned.
    pub fn next_id(&self) -> u32 {
        self.next_fresh
    }
}

impl Default for CatalogIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

fn encode_bsd_info(out: &mut Vec<u8>, permissions: &HfsPlusBsdInfo) {
    out.write_u32::<BigEndian>(permissions.owner_id).unwrap();
    out.write_u32::<BigEndian>(permissions.group_id).unwrap();
    out.write_u8(permissions.admin_flags).unwrap();
    out.write_u8(permissions.owner_flags).unwrap();
    out.write_u16::<BigEndian>(permissions.file_mode).unwrap();
    out.write_u32::<BigEndian>(permissions.special).unwrap();
}

fn encode_fork_data(out: &mut Vec<u8>, fork: &ForkData) {
    out.write_u64::<BigEndian>(fork.logical_size).unwrap();
    out.write_u32::<BigEndian>(fork.clump_size).unwrap();
    out.write_u32::<BigEndian>(fork.total_blocks).unwrap();
    for extent in &fork.extents {
        out.write_u32::<BigEndian>(extent.start_block).unwrap();
        out.write_u32::<BigEndian>(extent.block_count).unwrap();
    }
}

impl CatalogItem {
    pub fn key(&self) -> CatalogKey {
        CatalogKey { parent_id: self.parent_cnid, node_name: self.name.clone() }
    }

    pub fn thread_key(&self) -> CatalogKey {
        CatalogKey { parent_id: self.cnid, node_name: Vec::new() }
    }

    /// Encode the keyed (folder/file) catalog record payload.
    pub fn encode_record(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match &self.kind {
            CatalogItemKind::Folder { valence } => {
                out.write_u16::<BigEndian>(RECORD_TYPE_FOLDER).unwrap();
                out.write_u16::<BigEndian>(0).unwrap(); // flags
                out.write_u32::<BigEndian>(*valence).unwrap();
                out.write_u32::<BigEndian>(self.cnid).unwrap();
                out.write_u32::<BigEndian>(self.create_date).unwrap();
                out.write_u32::<BigEndian>(self.content_mod_date).unwrap();
                out.write_u32::<BigEndian>(self.content_mod_date).unwrap(); // attribute_mod
                out.write_u32::<BigEndian>(self.content_mod_date).unwrap(); // access
                out.write_u32::<BigEndian>(self.content_mod_date).unwrap(); // backup
                encode_bsd_info(&mut out, &self.permissions);
                out.extend_from_slice(&self.user_info);
                out.extend_from_slice(&self.finder_info);
                out.write_u32::<BigEndian>(self.text_encoding).unwrap();
                out.extend_from_slice(&[0u8; 4]); // reserved
            }
            CatalogItemKind::File { data_fork, resource_fork } => {
                out.write_u16::<BigEndian>(RECORD_TYPE_FILE).unwrap();
                out.write_u16::<BigEndian>(0).unwrap(); // flags
                out.write_u32::<BigEndian>(0).unwrap(); // reserved1
                out.write_u32::<BigEndian>(self.cnid).unwrap();
                out.write_u32::<BigEndian>(self.create_date).unwrap();
                out.write_u32::<BigEndian>(self.content_mod_date).unwrap();
                out.write_u32::<BigEndian>(self.content_mod_date).unwrap();
                out.write_u32::<BigEndian>(self.content_mod_date).unwrap();
                out.write_u32::<BigEndian>(self.content_mod_date).unwrap();
                encode_bsd_info(&mut out, &self.permissions);
                out.extend_from_slice(&self.user_info);
                out.extend_from_slice(&self.finder_info);
                out.write_u32::<BigEndian>(self.text_encoding).unwrap();
                out.write_u32::<BigEndian>(0).unwrap(); // reserved2
                encode_fork_data(&mut out, data_fork);
                encode_fork_data(&mut out, resource_fork);
            }
        }
        out
    }

    /// Encode this item's thread record, keyed by `(cnid, "")`.
    pub fn encode_thread_record(&self) -> Vec<u8> {
        let mut out = Vec::new();
        let record_type = match self.kind {
            CatalogItemKind::Folder { .. } => RECORD_TYPE_FOLDER_THREAD,
            CatalogItemKind::File { .. } => RECORD_TYPE_FILE_THREAD,
        };
        out.write_u16::<BigEndian>(record_type).unwrap();
        out.write_u16::<BigEndian>(0).unwrap(); // reserved
        out.write_u32::<BigEndian>(self.parent_cnid).unwrap();
        out.write_u16::<BigEndian>(self.name.len() as u16).unwrap();
        for &unit in &self.name {
            out.extend_from_slice(&unit.to_be_bytes());
        }
        out
    }
}

/// Accumulates catalog items and produces the final sorted `(key, payload)`
/// list ready for [`crate::btree::builder::build_btree`].
#[derive(Default)]
pub struct CatalogBuilder {
    items: Vec<CatalogItem>,
}

impl CatalogBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, item: CatalogItem) {
        self.items.push(item);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Produce the destination tree's `(key_bytes, payload_bytes)` pairs,
    /// keyed- and thread-records interleaved and sorted together by
    /// `(parent_id, name)` under HFS+'s case-folded Unicode ordering (TN1150),
    /// the catalog tree's actual sort order. A thread record's key name is
    /// always empty, which sorts before any named sibling under the same
    /// parent -- matching real HFS+ trees, where a CNID's thread record
    /// always precedes its keyed record.
    pub fn into_sorted_records(self) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut entries: Vec<(u32, Vec<u16>, Vec<u8>, Vec<u8>)> = Vec::with_capacity(self.items.len() * 2);
        for item in &self.items {
            entries.push((item.parent_cnid, item.name.clone(), item.key().encode(), item.encode_record()));
            entries.push((item.cnid, Vec::new(), item.thread_key().encode(), item.encode_thread_record()));
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| unicode::compare_case_insensitive(&a.1, &b.1)));
        entries.into_iter().map(|(_, _, key, payload)| (key, payload)).collect()
    }
}

/// Build the two records for the volume root folder itself: its keyed
/// record under parent CNID 1, and its thread record.
pub fn root_folder_item(name: Vec<u16>, create_date: u32, valence: u32, permissions: HfsPlusBsdInfo) -> CatalogItem {
    CatalogItem {
        cnid: CNID_ROOT_FOLDER,
        parent_cnid: CNID_ROOT_PARENT,
        name,
        create_date,
        content_mod_date: create_date,
        permissions,
        user_info: [0u8; 16],
        finder_info: [0u8; 16],
        text_encoding: 0,
        kind: CatalogItemKind::Folder { valence },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn folder_item(cnid: u32, parent: u32, name: &str) -> CatalogItem {
        CatalogItem {
            cnid,
            parent_cnid: parent,
            name: crate::unicode::string_to_utf16(name),
            create_date: 0,
            content_mod_date: 0,
            permissions: HfsPlusBsdInfo::default(),
            user_info: [0u8; 16],
            finder_info: [0u8; 16],
            text_encoding: 0,
            kind: CatalogItemKind::Folder { valence: 0 },
        }
    }

    #[test]
    fn allocator_starts_at_first_user_cnid() {
        let mut allocator = CatalogIdAllocator::new();
        assert_eq!(allocator.reuse_or_allocate(0), crate::catalog::CNID_FIRST_USER_FILE);
        assert_eq!(allocator.reuse_or_allocate(0), crate::catalog::CNID_FIRST_USER_FILE + 1);
    }

    #[test]
    fn allocator_reuses_source_cnids_at_or_above_the_floor() {
        let mut allocator = CatalogIdAllocator::new();
        assert_eq!(allocator.reuse_or_allocate(500), 500);
        // Next fresh allocation must not collide with the reused CNID.
        assert_eq!(allocator.reuse_or_allocate(0), 501);
    }

    #[test]
    fn allocator_next_id_tracks_the_highest_cnid_seen() {
        let mut allocator = CatalogIdAllocator::new();
        allocator.reuse_or_allocate(100);
        allocator.reuse_or_allocate(16);
        assert_eq!(allocator.next_id(), 101);
    }

    #[test]
    fn builder_emits_two_records_per_item_sorted_by_parent_then_name() {
        let mut builder = CatalogBuilder::new();
        builder.push(folder_item(20, 16, "Zebra"));
        builder.push(folder_item(17, 16, "Apple"));
        let records = builder.into_sorted_records();
        // 2 items * (keyed record + thread record) = 4.
        assert_eq!(records.len(), 4);

        // Thread records (empty name) sort before their sibling's keyed
        // record under the same parent; "Apple" sorts before "Zebra".
        let (first_key, _) = &records[0];
        let (first_parent, _) = crate::catalog::parse_catalog_key(first_key).unwrap();
        assert_eq!(first_parent.parent_id, 17);
        assert!(first_parent.node_name.is_empty());
    }

    #[test]
    fn root_folder_item_has_reserved_cnid_and_parent() {
        let item = root_folder_item(crate::unicode::string_to_utf16("Macintosh HD"), 0, 3, HfsPlusBsdInfo::default());
        assert_eq!(item.cnid, CNID_ROOT_FOLDER);
        assert_eq!(item.parent_cnid, CNID_ROOT_PARENT);
    }
}
