//! Catalog B*-tree record model and read-side lookups, shared by both HFS
//! and HFS+ source volumes (HFS source records are upconverted to this
//! HFS+-shaped model as they're read -- see [`crate::volume::source`]).

use byteorder::{BigEndian, ReadBytesExt};
use std::io::{Cursor, Read, Seek};

use crate::btree::file::{self, BTreeHeaderRecord};
use crate::btree::node::NodeKind;
use crate::error::{Error, Result};
use crate::extents::{read_extent_descriptor_be32, read_fork_data_be32, ExtentDescriptor, ForkData};
use crate::unicode;
use crate::{DirEntry, EntryKind};

/// Well-known Catalog Node IDs (identical numbering in HFS and HFS+).
pub const CNID_ROOT_PARENT: u32 = 1;
pub const CNID_ROOT_FOLDER: u32 = 2;
pub const CNID_EXTENTS_FILE: u32 = 3;
pub const CNID_CATALOG_FILE: u32 = 4;
pub const CNID_BAD_BLOCKS_FILE: u32 = 5;
pub const CNID_ALLOCATION_FILE: u32 = 6;
pub const CNID_STARTUP_FILE: u32 = 7;
pub const CNID_ATTRIBUTES_FILE: u32 = 8;
pub const CNID_FIRST_USER_FILE: u32 = 16;

pub const RECORD_TYPE_FOLDER: u16 = 0x0001;
pub const RECORD_TYPE_FILE: u16 = 0x0002;
pub const RECORD_TYPE_FOLDER_THREAD: u16 = 0x0003;
pub const RECORD_TYPE_FILE_THREAD: u16 = 0x0004;

#[derive(Debug, Clone)]
pub struct HfsPlusBsdInfo {
    pub owner_id: u32,
    pub group_id: u32,
    pub admin_flags: u8,
    pub owner_flags: u8,
    pub file_mode: u16,
    pub special: u32,
}

impl Default for HfsPlusBsdInfo {
    fn default() -> Self {
        HfsPlusBsdInfo { owner_id: 0, group_id: 0, admin_flags: 0, owner_flags: 0, file_mode: 0o100644, special: 0 }
    }
}

#[derive(Debug, Clone)]
pub struct CatalogFile {
    pub file_id: u32,
    pub create_date: u32,
    pub content_mod_date: u32,
    pub attribute_mod_date: u32,
    pub access_date: u32,
    pub backup_date: u32,
    pub permissions: HfsPlusBsdInfo,
    pub data_fork: ForkData,
    pub resource_fork: ForkData,
    pub text_encoding: u32,
    /// Finder `FInfo`: type/creator codes, flags, icon location (16 bytes).
    pub user_info: [u8; 16],
    /// Finder `FXInfo`: extended flags, script code, icon id (16 bytes).
    pub finder_info: [u8; 16],
}

#[derive(Debug, Clone)]
pub struct CatalogFolder {
    pub folder_id: u32,
    pub create_date: u32,
    pub content_mod_date: u32,
    pub attribute_mod_date: u32,
    pub access_date: u32,
    pub backup_date: u32,
    pub permissions: HfsPlusBsdInfo,
    pub valence: u32,
    pub text_encoding: u32,
    /// Finder `DInfo`: window bounds, flags, location (16 bytes).
    pub user_info: [u8; 16],
    /// Finder `DXInfo`: extended flags, script code, scroll position (16 bytes).
    pub finder_info: [u8; 16],
}

/// Extract the classic Mac script code carried by a Finder extended-info
/// block, per the rule in [`crate::encoding::script_code_from_extended_flags`]:
/// `fdScript`/`frScript` sits at byte 8, `fdXFlags`/`frXFlags` at byte 9.
pub fn script_code_from_finder_info(finder_info: &[u8; 16], volume_default: crate::encoding::ScriptCode) -> crate::encoding::ScriptCode {
    let script_byte = finder_info[8];
    let xflags_byte = finder_info[9];
    let combined = ((xflags_byte as u16) << 8) | script_byte as u16;
    crate::encoding::script_code_from_extended_flags(combined, volume_default)
}

#[derive(Debug, Clone)]
pub struct CatalogThread {
    pub parent_id: u32,
    pub node_name: String,
}

#[derive(Debug, Clone)]
pub enum CatalogRecord {
    Folder(CatalogFolder),
    File(CatalogFile),
    FolderThread(CatalogThread),
    FileThread(CatalogThread),
}

/// A catalog key: `(parentID, nodeName)`, the sort key for the whole tree.
#[derive(Debug, Clone)]
pub struct CatalogKey {
    pub parent_id: u32,
    pub node_name: Vec<u16>,
}

impl CatalogKey {
    /// Encode the key *body* -- `[parent_id:u32][name_len:u16][name:
    /// UTF-16BE]`, matching what [`parse_catalog_key`] expects to find right
    /// after the record's own `key_len:u16` field. The node builder
    /// ([`crate::btree::builder`]) adds that `key_len` framing itself, so
    /// this must not duplicate it.
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(6 + self.node_name.len() * 2);
        body.extend_from_slice(&self.parent_id.to_be_bytes());
        body.extend_from_slice(&(self.node_name.len() as u16).to_be_bytes());
        for &unit in &self.node_name {
            body.extend_from_slice(&unit.to_be_bytes());
        }
        body
    }
}

pub fn parse_catalog_key(data: &[u8]) -> Result<(CatalogKey, usize)> {
    if data.len() < 6 {
        return Err(Error::MalformedSource("catalog key too short".into()));
    }

    let key_length = u16::from_be_bytes([data[0], data[1]]) as usize;
    let parent_id = u32::from_be_bytes([data[2], data[3], data[4], data[5]]);
    let name_length = u16::from_be_bytes([data[6], data[7]]) as usize;

    let name_start = 8;
    let name_end = name_start + name_length * 2;
    if name_end > data.len() {
        return Err(Error::MalformedSource(format!("catalog key name extends beyond data: name_end={name_end}, data_len={}", data.len())));
    }

    let node_name = unicode::utf16be_to_u16(&data[name_start..name_end]);

    let record_offset = 2 + key_length;
    let record_offset = if !record_offset.is_multiple_of(2) { record_offset + 1 } else { record_offset };

    Ok((CatalogKey { parent_id, node_name }, record_offset))
}

fn parse_bsd_info(cursor: &mut Cursor<&[u8]>) -> Result<HfsPlusBsdInfo> {
    Ok(HfsPlusBsdInfo {
        owner_id: cursor.read_u32::<BigEndian>()?,
        group_id: cursor.read_u32::<BigEndian>()?,
        admin_flags: cursor.read_u8()?,
        owner_flags: cursor.read_u8()?,
        file_mode: cursor.read_u16::<BigEndian>()?,
        special: cursor.read_u32::<BigEndian>()?,
    })
}

fn parse_fork_data(cursor: &mut Cursor<&[u8]>) -> Result<ForkData> {
    read_fork_data_be32(cursor)
}

pub fn parse_catalog_record(data: &[u8]) -> Result<CatalogRecord> {
    if data.len() < 2 {
        return Err(Error::MalformedSource("catalog record too short".into()));
    }

    let record_type = u16::from_be_bytes([data[0], data[1]]);
    let mut cursor = Cursor::new(data);
    cursor.set_position(2);

    match record_type {
        RECORD_TYPE_FOLDER => {
            let _flags = cursor.read_u16::<BigEndian>()?;
            let valence = cursor.read_u32::<BigEndian>()?;
            let folder_id = cursor.read_u32::<BigEndian>()?;
            let create_date = cursor.read_u32::<BigEndian>()?;
            let content_mod_date = cursor.read_u32::<BigEndian>()?;
            let attribute_mod_date = cursor.read_u32::<BigEndian>()?;
            let access_date = cursor.read_u32::<BigEndian>()?;
            let backup_date = cursor.read_u32::<BigEndian>()?;
            let permissions = parse_bsd_info(&mut cursor)?;
            let mut user_info = [0u8; 16];
            cursor.read_exact(&mut user_info)?;
            let mut finder_info = [0u8; 16];
            cursor.read_exact(&mut finder_info)?;
            let text_encoding = cursor.read_u32::<BigEndian>()?;

            Ok(CatalogRecord::Folder(CatalogFolder {
                folder_id,
                create_date,
                content_mod_date,
                attribute_mod_date,
                access_date,
                backup_date,
                permissions,
                valence,
                text_encoding,
                user_info,
                finder_info,
            }))
        }
        RECORD_TYPE_FILE => {
            let _flags = cursor.read_u16::<BigEndian>()?;
            let _reserved = cursor.read_u32::<BigEndian>()?;
            let file_id = cursor.read_u32::<BigEndian>()?;
            let create_date = cursor.read_u32::<BigEndian>()?;
            let content_mod_date = cursor.read_u32::<BigEndian>()?;
            let attribute_mod_date = cursor.read_u32::<BigEndian>()?;
            let access_date = cursor.read_u32::<BigEndian>()?;
            let backup_date = cursor.read_u32::<BigEndian>()?;
            let permissions = parse_bsd_info(&mut cursor)?;
            let mut user_info = [0u8; 16];
            cursor.read_exact(&mut user_info)?;
            let mut finder_info = [0u8; 16];
            cursor.read_exact(&mut finder_info)?;
            let text_encoding = cursor.read_u32::<BigEndian>()?;
            let _reserved2 = cursor.read_u32::<BigEndian>()?;
            let data_fork = parse_fork_data(&mut cursor)?;
            let resource_fork = parse_fork_data(&mut cursor)?;

            Ok(CatalogRecord::File(CatalogFile {
                file_id,
                create_date,
                content_mod_date,
                attribute_mod_date,
                access_date,
                backup_date,
                permissions,
                data_fork,
                resource_fork,
                text_encoding,
                user_info,
                finder_info,
            }))
        }
        RECORD_TYPE_FOLDER_THREAD | RECORD_TYPE_FILE_THREAD => {
            let _reserved = cursor.read_u16::<BigEndian>()?;
            let parent_id = cursor.read_u32::<BigEndian>()?;
            let name_length = cursor.read_u16::<BigEndian>()? as usize;
            let mut name_buf = vec![0u8; name_length * 2];
            cursor.read_exact(&mut name_buf)?;
            let name_u16 = unicode::utf16be_to_u16(&name_buf);
            let node_name = unicode::utf16_to_string(&name_u16);

            let record = CatalogThread { parent_id, node_name };
            if record_type == RECORD_TYPE_FOLDER_THREAD {
                Ok(CatalogRecord::FolderThread(record))
            } else {
                Ok(CatalogRecord::FileThread(record))
            }
        }
        other => Err(Error::MalformedSource(format!("unknown catalog record type: 0x{other:04X}"))),
    }
}

fn make_catalog_comparator(target_parent_id: u32, target_name: &[u16], binary: bool) -> impl Fn(&[u8]) -> std::cmp::Ordering + '_ {
    move |record_data: &[u8]| {
        let (key, _) = match parse_catalog_key(record_data) {
            Ok(k) => k,
            Err(_) => return std::cmp::Ordering::Less,
        };

        match key.parent_id.cmp(&target_parent_id) {
            std::cmp::Ordering::Equal => {}
            ord => return ord,
        }

        if binary {
            unicode::compare_binary(&key.node_name, target_name)
        } else {
            unicode::compare_case_insensitive(&key.node_name, target_name)
        }
    }
}

pub fn lookup_catalog<R: Read + Seek>(reader: &mut R, binary_compare: bool, btree_header: &BTreeHeaderRecord, parent_id: u32, name: &str) -> Result<Option<CatalogRecord>> {
    let name_u16 = unicode::string_to_utf16(name);
    let comparator = make_catalog_comparator(parent_id, &name_u16, binary_compare);

    match file::search_btree(reader, btree_header, &comparator)? {
        Some((node, record_idx)) => {
            let record_data = node.record_data(record_idx)?;
            let (_, record_offset) = parse_catalog_key(record_data)?;
            if record_offset >= record_data.len() {
                return Err(Error::MalformedSource("record data missing after key".into()));
            }
            Ok(Some(parse_catalog_record(&record_data[record_offset..])?))
        }
        None => Ok(None),
    }
}

pub fn list_directory<R: Read + Seek>(reader: &mut R, binary_compare: bool, btree_header: &BTreeHeaderRecord, parent_cnid: u32) -> Result<Vec<DirEntry>> {
    let empty_name: Vec<u16> = vec![];
    let comparator = make_catalog_comparator(parent_cnid, &empty_name, binary_compare);

    let start_node = find_leaf_for_parent(reader, btree_header, &comparator)?;
    if start_node == 0 {
        return Ok(Vec::new());
    }

    let mut entries = Vec::new();
    let mut current_node_num = start_node;

    while current_node_num != 0 {
        let node = file::read_node(reader, btree_header, current_node_num)?;
        if node.descriptor.kind()? != NodeKind::Leaf {
            break;
        }

        for i in 0..node.descriptor.num_records as usize {
            let record_data = node.record_data(i)?;
            let (key, record_offset) = parse_catalog_key(record_data)?;
            if key.parent_id < parent_cnid {
                continue;
            }
            if key.parent_id > parent_cnid {
                return Ok(entries);
            }
            if record_offset >= record_data.len() {
                continue;
            }
            let record = parse_catalog_record(&record_data[record_offset..])?;
            let name = unicode::utf16_to_string(&key.node_name);

            match record {
                CatalogRecord::Folder(f) => entries.push(DirEntry {
                    name,
                    cnid: f.folder_id,
                    kind: EntryKind::Directory,
                    size: 0,
                    create_date: f.create_date,
                    modify_date: f.content_mod_date,
                }),
                CatalogRecord::File(f) => {
                    let kind = if f.permissions.file_mode & 0o170000 == 0o120000 { EntryKind::Symlink } else { EntryKind::File };
                    entries.push(DirEntry {
                        name,
                        cnid: f.file_id,
                        kind,
                        size: f.data_fork.logical_size,
                        create_date: f.create_date,
                        modify_date: f.content_mod_date,
                    });
                }
                CatalogRecord::FolderThread(_) | CatalogRecord::FileThread(_) => {}
            }
        }

        current_node_num = node.descriptor.forward_link;
    }

    Ok(entries)
}

fn find_leaf_for_parent<R: Read + Seek>(reader: &mut R, btree_header: &BTreeHeaderRecord, comparator: &dyn Fn(&[u8]) -> std::cmp::Ordering) -> Result<u32> {
    if btree_header.root_node == 0 {
        return Ok(0);
    }

    let mut current_node_num = btree_header.root_node;
    loop {
        let node = file::read_node(reader, btree_header, current_node_num)?;

        match node.descriptor.kind()? {
            NodeKind::Leaf => return Ok(current_node_num),
            NodeKind::Index => {
                let mut child_node = 0u32;
                let mut found = false;

                for i in 0..node.descriptor.num_records as usize {
                    let record_data = node.record_data(i)?;
                    match comparator(record_data) {
                        std::cmp::Ordering::Less | std::cmp::Ordering::Equal => {
                            child_node = crate::btree::node::extract_index_child(record_data)?;
                            found = true;
                        }
                        std::cmp::Ordering::Greater => break,
                    }
                }

                if !found {
                    if node.descriptor.num_records > 0 {
                        let record_data = node.record_data(0)?;
                        child_node = crate::btree::node::extract_index_child(record_data)?;
                    } else {
                        return Ok(0);
                    }
                }

                current_node_num = child_node;
            }
            other => return Err(Error::MalformedSource(format!("unexpected node kind {other} during leaf search"))),
        }
    }
}

/// Resolve a slash-separated path to its catalog record and the final
/// component's name.
pub fn resolve_path<R: Read + Seek>(reader: &mut R, binary_compare: bool, btree_header: &BTreeHeaderRecord, path: &str) -> Result<(CatalogRecord, String)> {
    let path = path.trim_matches('/');

    if path.is_empty() {
        return lookup_root_folder(reader, binary_compare, btree_header);
    }

    let components: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let mut current_parent = CNID_ROOT_FOLDER;

    for (i, component) in components.iter().enumerate() {
        match lookup_catalog(reader, binary_compare, btree_header, current_parent, component)? {
            Some(record) => {
                if i == components.len() - 1 {
                    return Ok((record, component.to_string()));
                }
                match &record {
                    CatalogRecord::Folder(f) => current_parent = f.folder_id,
                    CatalogRecord::File(_) => return Err(Error::NotADirectory(components[..=i].join("/"))),
                    _ => return Err(Error::MalformedSource("unexpected thread record in path resolution".into())),
                }
            }
            None => return Err(Error::FileNotFound(components[..=i].join("/"))),
        }
    }

    unreachable!()
}

fn lookup_root_folder<R: Read + Seek>(reader: &mut R, binary_compare: bool, btree_header: &BTreeHeaderRecord) -> Result<(CatalogRecord, String)> {
    let entries = list_directory(reader, binary_compare, btree_header, CNID_ROOT_PARENT)?;
    if let Some(entry) = entries.first() {
        match lookup_catalog(reader, binary_compare, btree_header, CNID_ROOT_PARENT, &entry.name)? {
            Some(record) => Ok((record, entry.name.clone())),
            None => Err(Error::FileNotFound("root folder".into())),
        }
    } else {
        Err(Error::FileNotFound("root folder".into()))
    }
}

pub(crate) fn read_extent_descriptor(cursor: &mut Cursor<&[u8]>) -> Result<ExtentDescriptor> {
    read_extent_descriptor_be32(cursor)
}

// --- Classic HFS (16-bit) catalog key/record parsing -----------------------
//
// HFS catalog keys and records share the same record-type numbering as
// HFS+ but a narrower, Pascal-string-and-16-bit-field layout. Names stay as
// raw script-coded bytes here; [`upconvert_hfs_folder`], [`upconvert_hfs_file`]
// and [`upconvert_hfs_thread`] translate them to this module's HFS+-shaped
// model once the record's own Finder script code (if any) is known.

/// A raw classic-HFS catalog key: parent CNID plus a Pascal-string name
/// still in its source script encoding.
#[derive(Debug, Clone)]
pub struct HfsCatalogKeyRaw {
    pub parent_id: u32,
    pub raw_name: Vec<u8>,
}

/// `ckrKeyLen:u8, ckrResrv1:u8, ckrParID:u32, ckrCName: Str31`.
pub fn parse_hfs_catalog_key(data: &[u8]) -> Result<(HfsCatalogKeyRaw, usize)> {
    if data.len() < 7 {
        return Err(Error::MalformedSource("HFS catalog key too short".into()));
    }
    let key_length = data[0] as usize;
    let parent_id = u32::from_be_bytes([data[2], data[3], data[4], data[5]]);
    let name_length = data[6] as usize;
    let name_start = 7;
    let name_end = name_start + name_length;
    if name_end > data.len() {
        return Err(Error::MalformedSource("HFS catalog key name extends beyond data".into()));
    }
    let raw_name = data[name_start..name_end].to_vec();

    let mut record_offset = 1 + key_length;
    if !record_offset.is_multiple_of(2) {
        record_offset += 1;
    }
    Ok((HfsCatalogKeyRaw { parent_id, raw_name }, record_offset))
}

#[derive(Debug, Clone)]
pub struct HfsCatalogFolder {
    pub folder_id: u32,
    pub create_date: u32,
    pub modify_date: u32,
    pub backup_date: u32,
    pub valence: u32,
    pub user_info: [u8; 16],
    pub finder_info: [u8; 16],
}

#[derive(Debug, Clone)]
pub struct HfsCatalogFile {
    pub file_id: u32,
    pub create_date: u32,
    pub modify_date: u32,
    pub backup_date: u32,
    pub user_info: [u8; 16],
    pub finder_info: [u8; 16],
    pub data_fork: ForkData,
    pub resource_fork: ForkData,
}

#[derive(Debug, Clone)]
pub struct HfsCatalogThread {
    pub parent_id: u32,
    pub raw_name: Vec<u8>,
}

#[derive(Debug, Clone)]
pub enum HfsCatalogRecord {
    Folder(HfsCatalogFolder),
    File(HfsCatalogFile),
    FolderThread(HfsCatalogThread),
    FileThread(HfsCatalogThread),
}

/// Parse a classic-HFS catalog record: a `DirRec` (70 bytes), `FilRec` (102
/// bytes) or thread record, following the 16-bit-field/Pascal-string layout
/// Inside Macintosh: Files documents (field widths narrower than HFS+'s
/// equivalents, notably a 16-bit folder valence and single-byte file flags).
pub fn parse_hfs_catalog_record(data: &[u8]) -> Result<HfsCatalogRecord> {
    if data.len() < 2 {
        return Err(Error::MalformedSource("HFS catalog record too short".into()));
    }
    let record_type = u16::from_be_bytes([data[0], data[1]]);
    let mut cursor = Cursor::new(data);
    cursor.set_position(2);

    match record_type {
        RECORD_TYPE_FOLDER => {
            let _flags = cursor.read_u16::<BigEndian>()?;
            let valence = cursor.read_u16::<BigEndian>()? as u32;
            let folder_id = cursor.read_u32::<BigEndian>()?;
            let create_date = cursor.read_u32::<BigEndian>()?;
            let modify_date = cursor.read_u32::<BigEndian>()?;
            let backup_date = cursor.read_u32::<BigEndian>()?;
            let mut user_info = [0u8; 16];
            cursor.read_exact(&mut user_info)?;
            let mut finder_info = [0u8; 16];
            cursor.read_exact(&mut finder_info)?;

            Ok(HfsCatalogRecord::Folder(HfsCatalogFolder { folder_id, create_date, modify_date, backup_date, valence, user_info, finder_info }))
        }
        RECORD_TYPE_FILE => {
            let _flags = cursor.read_u8()?;
            let _type2 = cursor.read_u8()?;
            let mut user_info = [0u8; 16];
            cursor.read_exact(&mut user_info)?;
            let file_id = cursor.read_u32::<BigEndian>()?;
            let _data_start_block = cursor.read_u16::<BigEndian>()?;
            let data_logical_size = cursor.read_u32::<BigEndian>()? as u64;
            let _data_physical_size = cursor.read_u32::<BigEndian>()?;
            let _rsrc_start_block = cursor.read_u16::<BigEndian>()?;
            let rsrc_logical_size = cursor.read_u32::<BigEndian>()? as u64;
            let _rsrc_physical_size = cursor.read_u32::<BigEndian>()?;
            let create_date = cursor.read_u32::<BigEndian>()?;
            let modify_date = cursor.read_u32::<BigEndian>()?;
            let backup_date = cursor.read_u32::<BigEndian>()?;
            let mut finder_info = [0u8; 16];
            cursor.read_exact(&mut finder_info)?;
            let clump_size = cursor.read_u16::<BigEndian>()? as u32;

            let mut data_extents = [ExtentDescriptor::default(); 8];
            for slot in data_extents.iter_mut().take(3) {
                *slot = crate::extents::read_extent_descriptor_be16(&mut cursor)?;
            }
            let mut rsrc_extents = [ExtentDescriptor::default(); 8];
            for slot in rsrc_extents.iter_mut().take(3) {
                *slot = crate::extents::read_extent_descriptor_be16(&mut cursor)?;
            }

            let data_fork = ForkData {
                logical_size: data_logical_size,
                clump_size,
                total_blocks: data_extents.iter().map(|e| e.block_count).sum(),
                extents: data_extents,
            };
            let resource_fork = ForkData {
                logical_size: rsrc_logical_size,
                clump_size,
                total_blocks: rsrc_extents.iter().map(|e| e.block_count).sum(),
                extents: rsrc_extents,
            };

            Ok(HfsCatalogRecord::File(HfsCatalogFile { file_id, create_date, modify_date, backup_date, user_info, finder_info, data_fork, resource_fork }))
        }
        RECORD_TYPE_FOLDER_THREAD | RECORD_TYPE_FILE_THREAD => {
            let _reserved1 = cursor.read_u32::<BigEndian>()?;
            let _reserved2 = cursor.read_u32::<BigEndian>()?;
            let parent_id = cursor.read_u32::<BigEndian>()?;
            let name_length = cursor.read_u8()? as usize;
            let mut raw_name = vec![0u8; name_length];
            cursor.read_exact(&mut raw_name)?;

            let thread = HfsCatalogThread { parent_id, raw_name };
            if record_type == RECORD_TYPE_FOLDER_THREAD {
                Ok(HfsCatalogRecord::FolderThread(thread))
            } else {
                Ok(HfsCatalogRecord::FileThread(thread))
            }
        }
        other => Err(Error::MalformedSource(format!("unknown HFS catalog record type: 0x{other:04X}"))),
    }
}

/// Translate a classic-HFS folder key/record pair to this module's HFS+
/// model. Returns the translated key, record, and whether name decoding
/// fell back to MacRoman (worth surfacing as a [`crate::error::Warning`]).
pub fn upconvert_hfs_folder(key: &HfsCatalogKeyRaw, record: &HfsCatalogFolder, volume_default_script: crate::encoding::ScriptCode) -> (CatalogKey, CatalogRecord, bool) {
    let script = script_code_from_finder_info(&record.finder_info, volume_default_script);
    let (name, fallback) = crate::encoding::hfs_name_to_utf16(&key.raw_name, script);
    let catalog_key = CatalogKey { parent_id: key.parent_id, node_name: name };
    let folder = CatalogFolder {
        folder_id: record.folder_id,
        create_date: record.create_date,
        content_mod_date: record.modify_date,
        attribute_mod_date: record.modify_date,
        access_date: record.modify_date,
        backup_date: record.backup_date,
        permissions: HfsPlusBsdInfo::default(),
        valence: record.valence,
        text_encoding: 0,
        user_info: record.user_info,
        finder_info: record.finder_info,
    };
    (catalog_key, CatalogRecord::Folder(folder), fallback)
}

pub fn upconvert_hfs_file(key: &HfsCatalogKeyRaw, record: &HfsCatalogFile, volume_default_script: crate::encoding::ScriptCode) -> (CatalogKey, CatalogRecord, bool) {
    let script = script_code_from_finder_info(&record.finder_info, volume_default_script);
    let (name, fallback) = crate::encoding::hfs_name_to_utf16(&key.raw_name, script);
    let catalog_key = CatalogKey { parent_id: key.parent_id, node_name: name };
    let file = CatalogFile {
        file_id: record.file_id,
        create_date: record.create_date,
        content_mod_date: record.modify_date,
        attribute_mod_date: record.modify_date,
        access_date: record.modify_date,
        backup_date: record.backup_date,
        permissions: HfsPlusBsdInfo::default(),
        data_fork: record.data_fork.clone(),
        resource_fork: record.resource_fork.clone(),
        text_encoding: 0,
        user_info: record.user_info,
        finder_info: record.finder_info,
    };
    (catalog_key, CatalogRecord::File(file), fallback)
}

/// Translate a classic-HFS thread record. Thread records carry no Finder
/// info of their own, so the volume's default script is used for name
/// decoding.
pub fn upconvert_hfs_thread(record: &HfsCatalogThread, volume_default_script: crate::encoding::ScriptCode, is_folder: bool) -> (CatalogRecord, bool) {
    let (name_u16, fallback) = crate::encoding::hfs_name_to_utf16(&record.raw_name, volume_default_script);
    let node_name = unicode::utf16_to_string(&name_u16);
    let thread = CatalogThread { parent_id: record.parent_id, node_name };
    let record = if is_folder { CatalogRecord::FolderThread(thread) } else { CatalogRecord::FileThread(thread) };
    (record, fallback)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_key_round_trips_through_encode_and_parse() {
        let key = CatalogKey { parent_id: 42, node_name: "Hello".encode_utf16().collect() };
        let body = key.encode();

        // Wrap the body the way a real leaf record does: key_len:u16 prefix,
        // then the body, then padding to even length, then record bytes.
        let mut data = Vec::new();
        data.extend_from_slice(&(body.len() as u16).to_be_bytes());
        data.extend_from_slice(&body);
        if !data.len().is_multiple_of(2) {
            data.push(0);
        }
        data.extend_from_slice(b"RECORD");

        let (parsed, record_offset) = parse_catalog_key(&data).unwrap();
        assert_eq!(parsed.parent_id, 42);
        assert_eq!(unicode::utf16_to_string(&parsed.node_name), "Hello");
        assert_eq!(&data[record_offset..], b"RECORD");
    }

    #[test]
    fn parse_catalog_key_rejects_truncated_data() {
        assert!(parse_catalog_key(&[0, 1, 2]).is_err());
    }

    #[test]
    fn parse_catalog_record_rejects_unknown_record_type() {
        let data = [0xFFu8, 0xFF];
        assert!(parse_catalog_record(&data).is_err());
    }

    #[test]
    fn parse_hfs_catalog_key_reads_pascal_string_name() {
        // ckrKeyLen, reserved, parID(4), nameLen, name bytes
        let mut data = vec![0u8, 0, 0, 0, 0, 7, 5];
        data.extend_from_slice(b"Hello");
        let key_len = (data.len() - 1) as u8;
        data[0] = key_len;

        let (key, offset) = parse_hfs_catalog_key(&data).unwrap();
        assert_eq!(key.parent_id, 7);
        assert_eq!(key.raw_name, b"Hello");
        assert_eq!(offset, if (1 + key_len as usize).is_multiple_of(2) { 1 + key_len as usize } else { 1 + key_len as usize + 1 });
    }

    #[test]
    fn script_code_from_finder_info_reads_script_and_xflags_bytes() {
        let mut finder_info = [0u8; 16];
        finder_info[8] = 1; // Japanese, in the low nibble
        finder_info[9] = 0x01; // xflags bit 0 -> combined 0x0100, kExtendedFlagHasCustomBadge
        let script = script_code_from_finder_info(&finder_info, crate::encoding::ScriptCode::Roman);
        assert_eq!(script, crate::encoding::ScriptCode::Japanese);
    }

    #[test]
    fn script_code_from_finder_info_ignores_script_byte_without_custom_badge_bit() {
        let mut finder_info = [0u8; 16];
        finder_info[8] = 1; // Japanese, but no custom-badge bit set in xflags
        let script = script_code_from_finder_info(&finder_info, crate::encoding::ScriptCode::Roman);
        assert_eq!(script, crate::encoding::ScriptCode::Roman);
    }

    #[test]
    fn upconvert_hfs_folder_carries_valence_and_ids_across() {
        let key = HfsCatalogKeyRaw { parent_id: 2, raw_name: b"Documents".to_vec() };
        let record = HfsCatalogFolder {
            folder_id: 100,
            create_date: 1,
            modify_date: 2,
            backup_date: 0,
            valence: 3,
            user_info: [0; 16],
            finder_info: [0; 16],
        };
        let (catalog_key, catalog_record, fallback) = upconvert_hfs_folder(&key, &record, crate::encoding::ScriptCode::Roman);
        assert!(!fallback);
        assert_eq!(unicode::utf16_to_string(&catalog_key.node_name), "Documents");
        match catalog_record {
            CatalogRecord::Folder(f) => {
                assert_eq!(f.folder_id, 100);
                assert_eq!(f.valence, 3);
            }
            _ => panic!("expected a folder record"),
        }
    }

    #[test]
    fn upconvert_hfs_thread_decodes_name_with_default_script() {
        let thread = HfsCatalogThread { parent_id: 2, raw_name: b"leaf.bin".to_vec() };
        let (record, fallback) = upconvert_hfs_thread(&thread, crate::encoding::ScriptCode::Roman, false);
        assert!(!fallback);
        match record {
            CatalogRecord::FileThread(t) => {
                assert_eq!(t.parent_id, 2);
                assert_eq!(t.node_name, "leaf.bin");
            }
            _ => panic!("expected a file thread record"),
        }
    }
}
