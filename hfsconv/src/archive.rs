//! Builds a fresh HFS+ volume image from a host directory tree, with no
//! HFS source volume in the loop. This is the "dehydrated" path stripped
//! of its Finder-specific machinery: every file gets an empty resource
//! fork, since there is nothing on a non-Mac host to synthesize one from.

use std::fs;
use std::io::{Seek, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::catalog::{HfsPlusBsdInfo, CNID_ROOT_FOLDER};
use crate::catalog_builder::{root_folder_item, CatalogBuilder, CatalogIdAllocator, CatalogItem, CatalogItemKind};
use crate::encoding;
use crate::error::Result;
use crate::extents::{ExtentSeries, ForkData};
use crate::pipeline::{btree_node_size, ATTRIBUTES_MAX_KEY_LENGTH, CATALOG_MAX_KEY_LENGTH, EXTENTS_MAX_KEY_LENGTH};
use crate::unicode;
use crate::volume::destination::{fork_from_series, flush_volume_structures, write_extents_content, AllocationBias, DestinationVolume, VirtualFileHandle};
use crate::Warning;

/// Seconds between the HFS+ epoch (1904-01-01) and the Unix epoch
/// (1970-01-01), both GMT.
const HFS_EPOCH_OFFSET_SECONDS: u64 = 2_082_844_800;

/// Caller-tunable parameters for a from-scratch volume build.
#[derive(Debug, Clone)]
pub struct ArchiveOptions {
    pub volume_name: String,
}

impl Default for ArchiveOptions {
    fn default() -> Self {
        ArchiveOptions { volume_name: "Untitled".to_string() }
    }
}

/// Summary of a completed archive build.
#[derive(Debug, Clone, Default)]
pub struct ArchiveReport {
    pub warnings: Vec<Warning>,
    pub files_written: u32,
    pub folders_created: u32,
}

fn hfs_date_from_system_time(time: SystemTime) -> u32 {
    let unix_seconds = time.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
    (unix_seconds + HFS_EPOCH_OFFSET_SECONDS).min(u32::MAX as u64) as u32
}

/// Recursively sum a directory's file bytes, to size the destination
/// volume before any blocks are allocated.
fn total_bytes(path: &Path) -> Result<u64> {
    let mut total = 0u64;
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            total += total_bytes(&entry.path())?;
        } else if file_type.is_file() {
            total += entry.metadata()?.len();
        }
    }
    Ok(total)
}

/// Build a complete HFS+ volume image from the contents of `root`,
/// writing it to `writer`. Symlinks are skipped -- HFS+ has no host-path
/// symlink equivalent worth inventing one for here.
pub fn build_volume_from_directory<W: Write + Seek>(root: &Path, writer: &mut W, options: &ArchiveOptions) -> Result<ArchiveReport> {
    let source_bytes = total_bytes(root)?;
    // Leave generous headroom for catalog/extents-overflow tree nodes,
    // which this estimate does not otherwise account for.
    let estimated_total_bytes = source_bytes + source_bytes / 4 + 1_048_576;
    let block_size = crate::size::optimal_allocation_block_size_for_volume_length(estimated_total_bytes);
    let user_blocks = crate::size::blocks_for_bytes(estimated_total_bytes, block_size).max(1) as u32;

    let create_date = hfs_date_from_system_time(SystemTime::now());
    let volume_name = unicode::string_to_utf16(&options.volume_name);
    let mut destination = DestinationVolume::set_allocation_block_size_with_user_blocks(block_size, user_blocks, volume_name, create_date);

    let mut allocator = CatalogIdAllocator::new();
    let mut builder = CatalogBuilder::new();
    let mut warnings = Vec::new();
    let mut files_written = 0u32;
    let mut folders_created = 0u32;

    let root_valence = walk_directory(root, CNID_ROOT_FOLDER, &mut allocator, &mut builder, &mut destination, writer, &mut files_written, &mut folders_created, &mut warnings)?;

    builder.push(root_folder_item(unicode::string_to_utf16(&options.volume_name), create_date, root_valence, HfsPlusBsdInfo::default()));

    let next_catalog_id = allocator.next_id();

    const KEY_COMPARE_CASE_FOLDING: u32 = 0xCF;
    let node_size = btree_node_size(destination.block_size);
    let catalog_tree = crate::btree::builder::build_btree_with_leaf_fill(&builder.into_sorted_records(), node_size, CATALOG_MAX_KEY_LENGTH, KEY_COMPARE_CASE_FOLDING, 0, 0.75)?;
    let extents_tree = crate::btree::builder::build_btree(&[], node_size, EXTENTS_MAX_KEY_LENGTH, 0, 0)?;
    let attributes_tree = crate::btree::builder::build_btree(&[], node_size, ATTRIBUTES_MAX_KEY_LENGTH, 0, 0)?;

    let (catalog_fork, catalog_extents) = allocate_and_place(&mut destination, &catalog_tree.node_bytes)?;
    let (extents_fork, extents_extents) = allocate_and_place(&mut destination, &extents_tree.node_bytes)?;
    let (attributes_fork, attributes_extents) = allocate_and_place(&mut destination, &attributes_tree.node_bytes)?;

    write_extents_content(writer, destination.block_size, &catalog_extents, &catalog_tree.node_bytes)?;
    write_extents_content(writer, destination.block_size, &extents_extents, &extents_tree.node_bytes)?;
    write_extents_content(writer, destination.block_size, &attributes_extents, &attributes_tree.node_bytes)?;

    let bitmap_blocks = crate::size::blocks_for_bytes(destination.bitmap_bytes().len() as u64, destination.block_size) as u32;
    let bitmap_extents = destination.allocate_blocks(bitmap_blocks, AllocationBias::ResourceForkLow)?;
    let bitmap_bytes = destination.bitmap_bytes().to_vec();
    write_extents_content(writer, destination.block_size, &bitmap_extents, &bitmap_bytes)?;
    let mut bitmap_series = ExtentSeries::new();
    for extent in &bitmap_extents {
        bitmap_series.append(*extent);
    }
    let allocation_fork = fork_from_series(&bitmap_series, bitmap_bytes.len() as u64, 0);

    flush_volume_structures(writer, &destination, &allocation_fork, &catalog_fork, &extents_fork, &attributes_fork, next_catalog_id, files_written, folders_created, &[0u8; 1024])?;

    Ok(ArchiveReport { warnings, files_written, folders_created })
}

#[allow(clippy::too_many_arguments)]
fn walk_directory<W: Write + Seek>(
    path: &Path,
    parent_cnid: u32,
    allocator: &mut CatalogIdAllocator,
    builder: &mut CatalogBuilder,
    destination: &mut DestinationVolume,
    writer: &mut W,
    files_written: &mut u32,
    folders_created: &mut u32,
    warnings: &mut Vec<Warning>,
) -> Result<u32> {
    let mut entries: Vec<fs::DirEntry> = fs::read_dir(path)?.collect::<std::io::Result<_>>()?;
    entries.sort_by_key(|e| e.file_name());

    let mut valence = 0u32;
    for entry in entries {
        let file_type = entry.file_type()?;
        let host_name = entry.file_name().to_string_lossy().into_owned();
        let metadata = entry.metadata()?;
        let create_date = metadata.created().map(hfs_date_from_system_time).unwrap_or_else(|_| hfs_date_from_system_time(SystemTime::now()));
        let modify_date = metadata.modified().map(hfs_date_from_system_time).unwrap_or(create_date);

        if file_type.is_dir() {
            let cnid = allocator.reuse_or_allocate(0);
            let name = sanitize_archive_name(&host_name, cnid, warnings);
            *folders_created += 1;
            let child_valence = walk_directory(&entry.path(), cnid, allocator, builder, destination, writer, files_written, folders_created, warnings)?;
            builder.push(CatalogItem {
                cnid,
                parent_cnid,
                name,
                create_date,
                content_mod_date: modify_date,
                permissions: HfsPlusBsdInfo::default(),
                user_info: [0u8; 16],
                finder_info: [0u8; 16],
                text_encoding: 0,
                kind: CatalogItemKind::Folder { valence: child_valence },
            });
            valence += 1;
        } else if file_type.is_file() {
            let cnid = allocator.reuse_or_allocate(0);
            let name = sanitize_archive_name(&host_name, cnid, warnings);
            let mut handle = VirtualFileHandle::new(destination, writer, AllocationBias::DataForkHigh);
            let mut source = fs::File::open(entry.path())?;
            std::io::copy(&mut source, &mut handle)?;
            let (data_fork, _series) = handle.finish();

            *files_written += 1;
            builder.push(CatalogItem {
                cnid,
                parent_cnid,
                name,
                create_date,
                content_mod_date: modify_date,
                permissions: HfsPlusBsdInfo::default(),
                user_info: [0u8; 16],
                finder_info: [0u8; 16],
                text_encoding: 0,
                kind: CatalogItemKind::File { data_fork, resource_fork: ForkData::default() },
            });
            valence += 1;
        }
        // Symlinks and other special files are silently skipped.
    }

    Ok(valence)
}

fn allocate_and_place(destination: &mut DestinationVolume, node_bytes: &[u8]) -> Result<(ForkData, Vec<crate::extents::ExtentDescriptor>)> {
    let blocks_needed = crate::size::blocks_for_bytes(node_bytes.len() as u64, destination.block_size) as u32;
    let allocated = destination.allocate_blocks(blocks_needed, AllocationBias::ResourceForkLow)?;
    let mut series = ExtentSeries::new();
    for extent in &allocated {
        series.append(*extent);
    }
    Ok((fork_from_series(&series, node_bytes.len() as u64, 0), allocated))
}

/// Fall back to an escaped, truncated name when a host filename is empty
/// or would otherwise be rejected by HFS+'s naming constraints.
fn sanitize_archive_name(host_name: &str, cnid: u32, warnings: &mut Vec<Warning>) -> Vec<u16> {
    let candidate = unicode::string_to_utf16(host_name);
    if encoding::validate_hfs_plus_name(&candidate).is_ok() {
        return candidate;
    }
    let escaped = encoding::string_by_escaping_string(host_name);
    let mut units = unicode::string_to_utf16(&escaped);
    if units.is_empty() {
        units = unicode::string_to_utf16("Untitled");
    }
    units.truncate(255);
    warnings.push(Warning::EncodingFallback { cnid, reason: format!("host name {host_name:?} required escaping to satisfy HFS+ naming constraints") });
    units
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// A host directory under the system temp dir, removed on drop. Avoids
    /// pulling in a `tempfile` dependency for what `std::fs` already does
    /// in a handful of lines.
    struct ScratchDir {
        path: std::path::PathBuf,
    }

    impl ScratchDir {
        fn new(tag: &str) -> Self {
            let path = std::env::temp_dir().join(format!("hfsconv-archive-test-{tag}-{}", std::process::id()));
            let _ = fs::remove_dir_all(&path);
            fs::create_dir_all(&path).unwrap();
            ScratchDir { path }
        }
    }

    impl Drop for ScratchDir {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.path);
        }
    }

    #[test]
    fn builds_a_volume_with_a_file_and_a_subfolder() {
        let scratch = ScratchDir::new("basic");
        fs::write(scratch.path.join("Greeting.txt"), b"Hello\r").unwrap();
        fs::create_dir(scratch.path.join("Sub")).unwrap();
        fs::write(scratch.path.join("Sub").join("Nested.txt"), b"nested contents").unwrap();

        let mut out = Cursor::new(Vec::new());
        let options = ArchiveOptions { volume_name: "Test Volume".to_string() };
        let report = build_volume_from_directory(&scratch.path, &mut out, &options).unwrap();

        assert_eq!(report.files_written, 2);
        assert_eq!(report.folders_created, 1);
        assert!(report.warnings.is_empty());

        let mut source = crate::volume::SourceVolume::open(out, 0).unwrap();
        assert!(source.is_hfs_plus);
        assert_eq!(source.volume_name, "Test Volume");

        let contents = source.read_file("/Greeting.txt", false).unwrap();
        assert_eq!(contents, b"Hello\r");

        let nested = source.read_file("/Sub/Nested.txt", false).unwrap();
        assert_eq!(nested, b"nested contents");

        let root_entries = source.list_directory(crate::catalog::CNID_ROOT_FOLDER).unwrap();
        assert_eq!(root_entries.len(), 2);
    }

    #[test]
    fn empty_directory_produces_an_empty_but_mountable_volume() {
        let scratch = ScratchDir::new("empty");
        let mut out = Cursor::new(Vec::new());
        let report = build_volume_from_directory(&scratch.path, &mut out, &ArchiveOptions::default()).unwrap();

        assert_eq!(report.files_written, 0);
        assert_eq!(report.folders_created, 0);

        let mut source = crate::volume::SourceVolume::open(out, 0).unwrap();
        let root_entries = source.list_directory(crate::catalog::CNID_ROOT_FOLDER).unwrap();
        assert!(root_entries.is_empty());
    }
}
