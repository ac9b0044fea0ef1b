//! Reads an HFS or HFS+ volume image, upconverting HFS's narrower record
//! layout to the HFS+-shaped [`crate::catalog`] model as it goes so the rest
//! of the crate (the pipeline, `analyze`, `list`, `extract`) only ever deals
//! with one shape.
//!
//! Boot blocks, the volume header/MDB, the allocation bitmap, and both
//! system B*-trees are all read once at [`SourceVolume::open`] time; fork
//! content and catalog records are read lazily as callers ask for them.

use byteorder::{BigEndian, ReadBytesExt};
use std::io::{Read, Seek, SeekFrom};

use crate::btree::file::{self, BTreeHeaderRecord};
use crate::catalog::{self, CatalogRecord, CNID_ALLOCATION_FILE, CNID_ROOT_FOLDER, CNID_ROOT_PARENT};
use crate::encoding::ScriptCode;
use crate::error::{Error, Result};
use crate::extents::{self, ExtentDescriptor, ForkData, FORK_TYPE_DATA, FORK_TYPE_RESOURCE};
use crate::size;
use crate::unicode;
use crate::volume::header::{HfsMasterDirectoryBlock, VolumeHeader, VolumeSignature, HFS_PLUS_SIGNATURE, HFS_SIGNATURE, HFSX_SIGNATURE, VOLUME_HEADER_OFFSET};
use crate::{DirEntry, EntryKind, FileStat, HfsPermissions};

/// Wraps a reader so every seek is relative to `base`, the partition's start
/// offset within the underlying image. Everything downstream (the MDB/header
/// parsers, the B*-tree engine, fork readers) seeks with `SeekFrom::Start`
/// against what it believes is offset 0 of the volume.
struct OffsetReader<R> {
    inner: R,
    base: u64,
}

impl<R: Read> Read for OffsetReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(buf)
    }
}

impl<R: Seek> Seek for OffsetReader<R> {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let absolute = match pos {
            SeekFrom::Start(n) => self.inner.seek(SeekFrom::Start(self.base + n))?,
            SeekFrom::Current(n) => self.inner.seek(SeekFrom::Current(n))?,
            SeekFrom::End(n) => self.inner.seek(SeekFrom::End(n))?,
        };
        Ok(absolute.saturating_sub(self.base))
    }
}

fn bit_is_set(bitmap: &[u8], index: u32) -> bool {
    let byte = (index / 8) as usize;
    byte < bitmap.len() && bitmap[byte] & (0x80 >> (index % 8)) != 0
}

fn clear_bit(bitmap: &mut [u8], index: u32) {
    let byte = (index / 8) as usize;
    if byte < bitmap.len() {
        bitmap[byte] &= !(0x80 >> (index % 8));
    }
}

/// One folder or file record surfaced by [`SourceVolume::walk_catalog_entries`].
pub struct CatalogWalkEntry {
    pub parent_cnid: u32,
    pub name: Vec<u16>,
    pub record: CatalogRecord,
    /// Set when the record's name could not be represented in its claimed
    /// script and was decoded with MacRoman as a fallback instead.
    pub encoding_fell_back: bool,
}

/// A source volume opened for reading, HFS or HFS+/HFSX alike.
pub struct SourceVolume<R: Read + Seek> {
    reader: OffsetReader<R>,
    pub is_hfs_plus: bool,
    pub is_hfsx: bool,
    pub volume_name: String,
    pub block_size: u32,
    pub total_blocks: u32,
    pub free_blocks: u32,
    pub file_count: u32,
    pub folder_count: u32,
    pub next_cnid: u32,
    pub create_date: u32,
    pub modify_date: u32,
    pub backup_date: u32,
    pub finder_info: [u32; 8],
    pub catalog_btree_header: BTreeHeaderRecord,
    pub extents_btree_header: BTreeHeaderRecord,
    allocation_fork: Option<ForkData>,
    bitmap: Vec<u8>,
    allocated_unread: Vec<u8>,
}

impl<R: Read + Seek> SourceVolume<R> {
    /// Open a volume whose partition begins `start_offset` bytes into
    /// `reader` (0 for a bare, unpartitioned image -- see [`crate::probe`]).
    pub fn open(reader: R, start_offset: u64) -> Result<Self> {
        let mut reader = OffsetReader { inner: reader, base: start_offset };

        reader.seek(SeekFrom::Start(VOLUME_HEADER_OFFSET))?;
        let signature = reader.read_u16::<BigEndian>()?;

        match signature {
            HFS_SIGNATURE => Self::open_hfs(reader),
            HFS_PLUS_SIGNATURE | HFSX_SIGNATURE => Self::open_hfs_plus(reader),
            other => Err(Error::InvalidSignature(other)),
        }
    }

    fn open_hfs(mut reader: OffsetReader<R>) -> Result<Self> {
        let mdb = HfsMasterDirectoryBlock::parse(&mut reader)?;

        let bitmap_len = (mdb.total_allocation_blocks as usize).div_ceil(8);
        reader.seek(SeekFrom::Start(mdb.volume_bitmap_start as u64 * size::ISO_STANDARD_BLOCK_SIZE))?;
        let mut bitmap = vec![0u8; bitmap_len];
        reader.read_exact(&mut bitmap)?;

        let extents_btree_header = file::read_btree_header(&mut reader, &mdb.extents_file, mdb.allocation_block_size)?;
        let catalog_btree_header = file::read_btree_header(&mut reader, &mdb.catalog_file, mdb.allocation_block_size)?;

        let allocated_unread = bitmap.clone();

        Ok(SourceVolume {
            reader,
            is_hfs_plus: false,
            is_hfsx: false,
            volume_name: mdb.volume_name,
            block_size: mdb.allocation_block_size,
            total_blocks: mdb.total_allocation_blocks as u32,
            free_blocks: mdb.free_blocks as u32,
            file_count: mdb.file_count,
            folder_count: mdb.folder_count,
            next_cnid: mdb.next_catalog_id,
            create_date: mdb.create_date,
            modify_date: mdb.modify_date,
            backup_date: mdb.backup_date,
            finder_info: mdb.finder_info,
            catalog_btree_header,
            extents_btree_header,
            allocation_fork: None,
            bitmap,
            allocated_unread,
        })
    }

    fn open_hfs_plus(mut reader: OffsetReader<R>) -> Result<Self> {
        let header = VolumeHeader::parse(&mut reader)?;

        let extents_btree_header = file::read_btree_header(&mut reader, &header.extents_file, header.block_size)?;
        let catalog_btree_header = file::read_btree_header(&mut reader, &header.catalog_file, header.block_size)?;

        let bitmap_len = (header.total_blocks as usize).div_ceil(8);
        let mut bitmap_buf = Vec::with_capacity(bitmap_len);
        extents::read_fork_data(
            &mut reader,
            header.block_size,
            &extents_btree_header,
            &header.allocation_file,
            CNID_ALLOCATION_FILE,
            FORK_TYPE_DATA,
            &mut bitmap_buf,
        )?;
        bitmap_buf.resize(bitmap_len, 0);

        let binary_compare = header.is_binary_compare();
        let (_, volume_name) = catalog::resolve_path(&mut reader, binary_compare, &catalog_btree_header, "")?;

        let allocated_unread = bitmap_buf.clone();

        Ok(SourceVolume {
            reader,
            is_hfs_plus: true,
            is_hfsx: header.signature == VolumeSignature::Hfsx,
            volume_name,
            block_size: header.block_size,
            total_blocks: header.total_blocks,
            free_blocks: header.free_blocks,
            file_count: header.file_count,
            folder_count: header.folder_count,
            next_cnid: header.next_catalog_id,
            create_date: header.create_date,
            modify_date: header.modify_date,
            backup_date: header.backup_date,
            finder_info: header.finder_info,
            catalog_btree_header,
            extents_btree_header,
            allocation_fork: Some(header.allocation_file),
            bitmap: bitmap_buf,
            allocated_unread,
        })
    }

    pub fn is_block_allocated(&self, block: u32) -> bool {
        bit_is_set(&self.bitmap, block)
    }

    fn mark_read(&mut self, start_block: u32, block_count: u32) {
        for block in start_block..start_block.saturating_add(block_count) {
            clear_bit(&mut self.allocated_unread, block);
        }
    }

    /// Count of allocation blocks the bitmap marks used but this run has not
    /// yet read any bytes from -- recoverable simply by reading more of the
    /// volume.
    pub fn unread_allocated_block_count(&self) -> u32 {
        (0..self.total_blocks).filter(|&b| bit_is_set(&self.allocated_unread, b)).count() as u32
    }

    /// Count of allocation blocks the bitmap marks used that no catalog
    /// record or extents-overflow record references at all -- not a
    /// recoverable read-order artifact, but lost space (or lost data) the
    /// consistency checker should flag.
    /// (`ImpSourceVolume.numberOfBlocksThatAreAllocatedButAreNotReferencedInTheBTrees`)
    pub fn orphaned_block_count(&mut self) -> Result<u32> {
        let mut referenced = vec![false; self.total_blocks as usize];
        let mark = |referenced: &mut [bool], start: u32, count: u32| {
            for b in start..start.saturating_add(count) {
                if let Some(slot) = referenced.get_mut(b as usize) {
                    *slot = true;
                }
            }
        };

        for ext in self.catalog_btree_header.fork.extents.iter().filter(|e| e.block_count > 0) {
            mark(&mut referenced, ext.start_block, ext.block_count);
        }
        for ext in self.extents_btree_header.fork.extents.iter().filter(|e| e.block_count > 0) {
            mark(&mut referenced, ext.start_block, ext.block_count);
        }
        if let Some(alloc) = &self.allocation_fork {
            for ext in alloc.extents.iter().filter(|e| e.block_count > 0) {
                mark(&mut referenced, ext.start_block, ext.block_count);
            }
        }

        let catalog_header = self.catalog_btree_header.clone();
        let extents_header = self.extents_btree_header.clone();
        let is_hfs_plus = self.is_hfs_plus;

        let mut files: Vec<(ForkData, ForkData, u32)> = Vec::new();
        file::walk_leaf_nodes(&mut self.reader, &catalog_header, |record_data| {
            if is_hfs_plus {
                if let Ok((_, offset)) = catalog::parse_catalog_key(record_data) {
                    if offset < record_data.len() {
                        if let Ok(CatalogRecord::File(f)) = catalog::parse_catalog_record(&record_data[offset..]) {
                            files.push((f.data_fork, f.resource_fork, f.file_id));
                        }
                    }
                }
            } else if let Ok((_, offset)) = catalog::parse_hfs_catalog_key(record_data) {
                if offset < record_data.len() {
                    if let Ok(catalog::HfsCatalogRecord::File(f)) = catalog::parse_hfs_catalog_record(&record_data[offset..]) {
                        files.push((f.data_fork, f.resource_fork, f.file_id));
                    }
                }
            }
            Ok(())
        })?;

        for (data_fork, resource_fork, cnid) in &files {
            for (fork, fork_type) in [(data_fork, FORK_TYPE_DATA), (resource_fork, FORK_TYPE_RESOURCE)] {
                for ext in fork.extents.iter().filter(|e| e.block_count > 0) {
                    mark(&mut referenced, ext.start_block, ext.block_count);
                }
                let mut start_block: u32 = fork.extents.iter().map(|e| e.block_count).sum();
                loop {
                    let overflow = extents::lookup_overflow_extents(&mut self.reader, &extents_header, *cnid, fork_type, start_block)?;
                    if overflow.is_empty() {
                        break;
                    }
                    for ext in overflow.iter().filter(|e| e.block_count > 0) {
                        mark(&mut referenced, ext.start_block, ext.block_count);
                        start_block += ext.block_count;
                    }
                }
            }
        }

        Ok((0..self.total_blocks).filter(|&b| bit_is_set(&self.bitmap, b) && !referenced[b as usize]).count() as u32)
    }

    /// List the immediate children of `parent_cnid`.
    pub fn list_directory(&mut self, parent_cnid: u32) -> Result<Vec<DirEntry>> {
        if self.is_hfs_plus {
            catalog::list_directory(&mut self.reader, self.is_hfsx, &self.catalog_btree_header, parent_cnid)
        } else {
            self.list_directory_hfs(parent_cnid)
        }
    }

    fn list_directory_hfs(&mut self, parent_cnid: u32) -> Result<Vec<DirEntry>> {
        let catalog_header = self.catalog_btree_header.clone();
        let mut entries = Vec::new();
        file::walk_leaf_nodes(&mut self.reader, &catalog_header, |record_data| {
            let (key, offset) = catalog::parse_hfs_catalog_key(record_data)?;
            if key.parent_id != parent_cnid || offset >= record_data.len() {
                return Ok(());
            }
            let raw = catalog::parse_hfs_catalog_record(&record_data[offset..])?;
            match raw {
                catalog::HfsCatalogRecord::Folder(f) => {
                    let (catalog_key, _, _) = catalog::upconvert_hfs_folder(&key, &f, ScriptCode::Roman);
                    entries.push(DirEntry {
                        name: unicode::utf16_to_string(&catalog_key.node_name),
                        cnid: f.folder_id,
                        kind: EntryKind::Directory,
                        size: 0,
                        create_date: f.create_date,
                        modify_date: f.modify_date,
                    });
                }
                catalog::HfsCatalogRecord::File(f) => {
                    let (catalog_key, _, _) = catalog::upconvert_hfs_file(&key, &f, ScriptCode::Roman);
                    entries.push(DirEntry {
                        name: unicode::utf16_to_string(&catalog_key.node_name),
                        cnid: f.file_id,
                        kind: EntryKind::File,
                        size: f.data_fork.logical_size,
                        create_date: f.create_date,
                        modify_date: f.modify_date,
                    });
                }
                catalog::HfsCatalogRecord::FolderThread(_) | catalog::HfsCatalogRecord::FileThread(_) => {}
            }
            Ok(())
        })?;
        Ok(entries)
    }

    /// Resolve a slash-separated path to its catalog record.
    pub fn resolve(&mut self, path: &str) -> Result<CatalogRecord> {
        if self.is_hfs_plus {
            let (record, _) = catalog::resolve_path(&mut self.reader, self.is_hfsx, &self.catalog_btree_header, path)?;
            Ok(record)
        } else {
            self.resolve_hfs(path)
        }
    }

    fn resolve_hfs(&mut self, path: &str) -> Result<CatalogRecord> {
        let path = path.trim_matches('/');
        let mut current_parent = CNID_ROOT_FOLDER;
        if path.is_empty() {
            let entries = self.list_directory_hfs(CNID_ROOT_PARENT)?;
            let root = entries.first().ok_or_else(|| Error::FileNotFound("root folder".into()))?;
            return self.find_in_parent(CNID_ROOT_PARENT, &root.name);
        }

        let components: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let mut record = None;
        for (i, component) in components.iter().enumerate() {
            let found = self.find_in_parent(current_parent, component)?;
            if i == components.len() - 1 {
                record = Some(found);
                break;
            }
            match &found {
                CatalogRecord::Folder(f) => current_parent = f.folder_id,
                CatalogRecord::File(_) => return Err(Error::NotADirectory(components[..=i].join("/"))),
                _ => return Err(Error::MalformedSource("unexpected thread record in path resolution".into())),
            }
        }
        record.ok_or_else(|| Error::FileNotFound(path.to_string()))
    }

    fn find_in_parent(&mut self, parent_cnid: u32, name: &str) -> Result<CatalogRecord> {
        let entries = self.list_directory_hfs(parent_cnid)?;
        let target = unicode::string_to_utf16(name);
        for entry in entries {
            if unicode::compare_case_insensitive(&unicode::string_to_utf16(&entry.name), &target) == std::cmp::Ordering::Equal {
                return self.record_for_entry(parent_cnid, &entry);
            }
        }
        Err(Error::FileNotFound(name.to_string()))
    }

    fn record_for_entry(&mut self, parent_cnid: u32, entry: &DirEntry) -> Result<CatalogRecord> {
        let catalog_header = self.catalog_btree_header.clone();
        let name_u16 = unicode::string_to_utf16(&entry.name);
        let mut found = None;
        file::walk_leaf_nodes(&mut self.reader, &catalog_header, |record_data| {
            if found.is_some() {
                return Ok(());
            }
            let (key, offset) = catalog::parse_hfs_catalog_key(record_data)?;
            if key.parent_id != parent_cnid || offset >= record_data.len() {
                return Ok(());
            }
            let (decoded, _) = crate::encoding::hfs_name_to_utf16(&key.raw_name, ScriptCode::Roman);
            if unicode::compare_case_insensitive(&decoded, &name_u16) != std::cmp::Ordering::Equal {
                return Ok(());
            }
            let raw = catalog::parse_hfs_catalog_record(&record_data[offset..])?;
            found = Some(match raw {
                catalog::HfsCatalogRecord::Folder(f) => catalog::upconvert_hfs_folder(&key, &f, ScriptCode::Roman).1,
                catalog::HfsCatalogRecord::File(f) => catalog::upconvert_hfs_file(&key, &f, ScriptCode::Roman).1,
                catalog::HfsCatalogRecord::FolderThread(t) => catalog::upconvert_hfs_thread(&t, ScriptCode::Roman, true).0,
                catalog::HfsCatalogRecord::FileThread(t) => catalog::upconvert_hfs_thread(&t, ScriptCode::Roman, false).0,
            });
            Ok(())
        })?;
        found.ok_or_else(|| Error::FileNotFound(entry.name.clone()))
    }

    pub fn stat(&mut self, path: &str) -> Result<FileStat> {
        let record = self.resolve(path)?;
        Ok(self.record_to_stat(&record))
    }

    fn record_to_stat(&self, record: &CatalogRecord) -> FileStat {
        match record {
            CatalogRecord::Folder(f) => FileStat {
                cnid: f.folder_id,
                kind: EntryKind::Directory,
                size: 0,
                create_date: f.create_date,
                modify_date: f.content_mod_date,
                permissions: HfsPermissions { owner_id: f.permissions.owner_id, group_id: f.permissions.group_id, mode: f.permissions.file_mode },
                data_fork_extents: 0,
                resource_fork_size: 0,
                type_code: None,
                creator_code: None,
            },
            CatalogRecord::File(f) => FileStat {
                cnid: f.file_id,
                kind: if f.permissions.file_mode & 0o170000 == 0o120000 { EntryKind::Symlink } else { EntryKind::File },
                size: f.data_fork.logical_size,
                create_date: f.create_date,
                modify_date: f.content_mod_date,
                permissions: HfsPermissions { owner_id: f.permissions.owner_id, group_id: f.permissions.group_id, mode: f.permissions.file_mode },
                data_fork_extents: f.data_fork.extents.iter().filter(|e| e.block_count > 0).count() as u32,
                resource_fork_size: f.resource_fork.logical_size,
                type_code: Some([f.user_info[0], f.user_info[1], f.user_info[2], f.user_info[3]]),
                creator_code: Some([f.user_info[4], f.user_info[5], f.user_info[6], f.user_info[7]]),
            },
            _ => unreachable!("thread records never escape resolve()"),
        }
    }

    /// Read a file's data fork (or resource fork, when `resource` is true)
    /// in full.
    pub fn read_file(&mut self, path: &str, resource: bool) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.read_file_to(path, resource, &mut out)?;
        Ok(out)
    }

    pub fn read_file_to<W: std::io::Write>(&mut self, path: &str, resource: bool, writer: &mut W) -> Result<u64> {
        let record = self.resolve(path)?;
        let file = match record {
            CatalogRecord::File(f) => f,
            _ => return Err(Error::NotADirectory(path.to_string())),
        };
        let fork = if resource { file.resource_fork.clone() } else { file.data_fork.clone() };
        self.copy_fork_to(file.file_id, &fork, resource, writer)
    }

    /// Stream one fork's bytes to `writer` by CNID and fork record directly,
    /// bypassing path resolution -- what the conversion pipeline uses once
    /// it already has a file's catalog record in hand from a full tree walk.
    pub fn copy_fork_to<W: std::io::Write>(&mut self, file_id: u32, fork: &ForkData, resource: bool, writer: &mut W) -> Result<u64> {
        let fork_type = if resource { FORK_TYPE_RESOURCE } else { FORK_TYPE_DATA };
        let extents_header = self.extents_btree_header.clone();
        let block_size = self.block_size;
        let written = extents::read_fork_data(&mut self.reader, block_size, &extents_header, fork, file_id, fork_type, writer)?;
        for ext in fork.extents.iter().filter(|e| e.block_count > 0) {
            self.mark_read(ext.start_block, ext.block_count);
        }
        Ok(written)
    }

    /// Read the volume's first 1024 bytes (the two boot blocks), verbatim,
    /// for carrying across to the destination volume unexamined.
    pub fn read_boot_blocks(&mut self) -> Result<[u8; 1024]> {
        let mut buf = [0u8; 1024];
        self.reader.seek(SeekFrom::Start(0))?;
        self.reader.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Walk the whole catalog tree, yielding every folder and file record
    /// (thread records are skipped; the destination catalog builder derives
    /// its own) already upconverted to the HFS+-shaped model regardless of
    /// source format, alongside the parent CNID from its keyed record.
    pub fn walk_catalog_entries(&mut self, default_script: ScriptCode) -> Result<Vec<CatalogWalkEntry>> {
        let catalog_header = self.catalog_btree_header.clone();
        let is_hfs_plus = self.is_hfs_plus;
        let mut out = Vec::new();

        file::walk_leaf_nodes(&mut self.reader, &catalog_header, |record_data| {
            if is_hfs_plus {
                if let Ok((key, offset)) = catalog::parse_catalog_key(record_data) {
                    if offset < record_data.len() {
                        match catalog::parse_catalog_record(&record_data[offset..]) {
                            Ok(record @ CatalogRecord::Folder(_)) | Ok(record @ CatalogRecord::File(_)) => {
                                out.push(CatalogWalkEntry { parent_cnid: key.parent_id, name: key.node_name, record, encoding_fell_back: false });
                            }
                            _ => {}
                        }
                    }
                }
            } else if let Ok((key, offset)) = catalog::parse_hfs_catalog_key(record_data) {
                if offset < record_data.len() {
                    match catalog::parse_hfs_catalog_record(&record_data[offset..]) {
                        Ok(catalog::HfsCatalogRecord::Folder(f)) => {
                            let (catalog_key, record, fell_back) = catalog::upconvert_hfs_folder(&key, &f, default_script);
                            out.push(CatalogWalkEntry { parent_cnid: catalog_key.parent_id, name: catalog_key.node_name, record, encoding_fell_back: fell_back });
                        }
                        Ok(catalog::HfsCatalogRecord::File(f)) => {
                            let (catalog_key, record, fell_back) = catalog::upconvert_hfs_file(&key, &f, default_script);
                            out.push(CatalogWalkEntry { parent_cnid: catalog_key.parent_id, name: catalog_key.node_name, record, encoding_fell_back: fell_back });
                        }
                        _ => {}
                    }
                }
            }
            Ok(())
        })?;

        Ok(out)
    }

    /// Recursively walk every entry reachable from the root, yielding each
    /// with its full path.
    pub fn walk(&mut self) -> Result<Vec<crate::WalkEntry>> {
        let mut out = Vec::new();
        self.walk_into(CNID_ROOT_FOLDER, "", &mut out)?;
        Ok(out)
    }

    fn walk_into(&mut self, parent_cnid: u32, prefix: &str, out: &mut Vec<crate::WalkEntry>) -> Result<()> {
        for entry in self.list_directory(parent_cnid)? {
            let path = if prefix.is_empty() { entry.name.clone() } else { format!("{prefix}/{}", entry.name) };
            let is_dir = entry.kind == EntryKind::Directory;
            let cnid = entry.cnid;
            out.push(crate::WalkEntry { path: path.clone(), entry });
            if is_dir {
                self.walk_into(cnid, &path, out)?;
            }
        }
        Ok(())
    }

    /// Visit every file record in the catalog (HFS or HFS+ alike), passing
    /// its CNID and both forks. Used by the consistency checker to
    /// cross-reference referenced blocks against the allocation bitmap.
    pub fn walk_file_forks<F>(&mut self, mut visit: F) -> Result<()>
    where
        F: FnMut(u32, &ForkData, &ForkData),
    {
        let catalog_header = self.catalog_btree_header.clone();
        let is_hfs_plus = self.is_hfs_plus;
        file::walk_leaf_nodes(&mut self.reader, &catalog_header, |record_data| {
            if is_hfs_plus {
                if let Ok((_, offset)) = catalog::parse_catalog_key(record_data) {
                    if offset < record_data.len() {
                        if let Ok(CatalogRecord::File(f)) = catalog::parse_catalog_record(&record_data[offset..]) {
                            visit(f.file_id, &f.data_fork, &f.resource_fork);
                        }
                    }
                }
            } else if let Ok((_, offset)) = catalog::parse_hfs_catalog_key(record_data) {
                if offset < record_data.len() {
                    if let Ok(catalog::HfsCatalogRecord::File(f)) = catalog::parse_hfs_catalog_record(&record_data[offset..]) {
                        visit(f.file_id, &f.data_fork, &f.resource_fork);
                    }
                }
            }
            Ok(())
        })
    }

    /// The set of CNIDs with a keyed folder/file record, and the set of
    /// CNIDs with a thread record -- every keyed CNID should appear in both.
    pub fn catalog_cnid_sets(&mut self) -> Result<(std::collections::HashSet<u32>, std::collections::HashSet<u32>)> {
        let catalog_header = self.catalog_btree_header.clone();
        let is_hfs_plus = self.is_hfs_plus;
        let mut keyed = std::collections::HashSet::new();
        let mut threaded = std::collections::HashSet::new();

        file::walk_leaf_nodes(&mut self.reader, &catalog_header, |record_data| {
            if is_hfs_plus {
                if let Ok((key, offset)) = catalog::parse_catalog_key(record_data) {
                    if offset < record_data.len() {
                        match catalog::parse_catalog_record(&record_data[offset..]) {
                            Ok(CatalogRecord::Folder(f)) => {
                                keyed.insert(f.folder_id);
                            }
                            Ok(CatalogRecord::File(f)) => {
                                keyed.insert(f.file_id);
                            }
                            Ok(CatalogRecord::FolderThread(_)) | Ok(CatalogRecord::FileThread(_)) => {
                                threaded.insert(key.parent_id);
                            }
                            Err(_) => {}
                        }
                    }
                }
            } else if let Ok((key, offset)) = catalog::parse_hfs_catalog_key(record_data) {
                if offset < record_data.len() {
                    match catalog::parse_hfs_catalog_record(&record_data[offset..]) {
                        Ok(catalog::HfsCatalogRecord::Folder(f)) => {
                            keyed.insert(f.folder_id);
                        }
                        Ok(catalog::HfsCatalogRecord::File(f)) => {
                            keyed.insert(f.file_id);
                        }
                        Ok(catalog::HfsCatalogRecord::FolderThread(_)) | Ok(catalog::HfsCatalogRecord::FileThread(_)) => {
                            threaded.insert(key.parent_id);
                        }
                        Err(_) => {}
                    }
                }
            }
            Ok(())
        })?;

        Ok((keyed, threaded))
    }

    /// Look up the next overflow extent record for a given file/fork past
    /// `start_block`, for callers (the consistency checker) that need to
    /// walk a fork's full extent chain without going through
    /// [`crate::extents::read_fork_data`].
    pub fn lookup_overflow_extents_for(&mut self, file_id: u32, fork_type: u8, start_block: u32) -> Result<Vec<ExtentDescriptor>> {
        extents::lookup_overflow_extents(&mut self.reader, &self.extents_btree_header, file_id, fork_type, start_block)
    }
}
