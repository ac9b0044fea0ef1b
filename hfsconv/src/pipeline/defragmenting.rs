//! The only bulk-copy strategy this converter implements: rather than
//! preserving the source's fragmentation, every fork is reallocated fresh
//! on the destination (resource forks clustered low, data forks clustered
//! high) and copied byte-for-byte. A volume converted this way comes out
//! at least as contiguous as a freshly-initialized one, at the cost of
//! being unable to skip any bytes.

use std::io::{Read, Seek, Write};

use crate::btree::builder::{build_btree, build_btree_with_leaf_fill};
use crate::catalog::CatalogRecord;
use crate::catalog_builder::{CatalogBuilder, CatalogIdAllocator, CatalogItem, CatalogItemKind};
use crate::encoding;
use crate::error::{Error, Result, Warning};
use crate::extents::{self, ExtentSeries, ForkData, FORK_TYPE_DATA, FORK_TYPE_RESOURCE};
use crate::unicode;
use crate::volume::destination::{fork_from_series, flush_volume_structures, write_extents_content, AllocationBias, DestinationVolume, VirtualFileHandle};
use crate::volume::SourceVolume;

use super::{btree_node_size, check_cancelled, preflight, Cancellation, ConversionReport, ConvertOptions, ProgressEvent, ProgressSink, ATTRIBUTES_MAX_KEY_LENGTH, CATALOG_MAX_KEY_LENGTH, EXTENTS_MAX_KEY_LENGTH};

/// Convert a classic-HFS source volume to HFS+, writing the result to
/// `writer`. Fails fast with [`Error::Unsupported`] if `source` is already
/// HFS+/HFSX -- there is nothing to convert.
pub fn convert<R, W>(source: &mut SourceVolume<R>, writer: &mut W, options: &ConvertOptions, progress: &mut dyn ProgressSink, cancel: &dyn Cancellation) -> Result<ConversionReport>
where
    R: Read + Seek,
    W: Write + Seek,
{
    if source.is_hfs_plus {
        return Err(Error::Unsupported("source volume is already HFS+; there is nothing to convert".into()));
    }

    let mut warnings = Vec::new();
    if options.strict_consistency {
        let issues = crate::consistency::check_volume(source)?;
        if !issues.is_empty() {
            return Err(Error::InconsistentSource { warnings: issues });
        }
    }

    // Step 0: preflight.
    let mut destination = preflight(source);
    check_cancelled(cancel)?;

    // Step 1: preamble. Boot blocks travel verbatim; the rest of the header
    // translation (signature, dates, Finder info, file/folder counts) is
    // assembled incrementally below as the catalog is walked, then written
    // once by flush_volume_structures.
    let boot_blocks = source.read_boot_blocks()?;

    // Step 2: bulk copy.
    let entries = source.walk_catalog_entries(options.default_script)?;

    let mut allocator = CatalogIdAllocator::new();
    let mut builder = CatalogBuilder::new();
    let mut overflow_records: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
    let mut file_count = 0u32;
    let mut folder_count = 0u32;
    let mut blocks_copied = 0u64;

    for entry in &entries {
        check_cancelled(cancel)?;

        if entry.encoding_fell_back {
            let cnid = match &entry.record {
                CatalogRecord::Folder(f) => f.folder_id,
                CatalogRecord::File(f) => f.file_id,
                _ => 0,
            };
            warnings.push(Warning::EncodingFallback { cnid, reason: "name's script code was not recognized; decoded as MacRoman".into() });
        }

        match &entry.record {
            CatalogRecord::Folder(f) => {
                allocator.reuse_or_allocate(f.folder_id);
                let name = sanitize_name(&entry.name, &mut warnings, f.folder_id);
                folder_count += 1;
                builder.push(CatalogItem {
                    cnid: f.folder_id,
                    parent_cnid: entry.parent_cnid,
                    name,
                    create_date: f.create_date,
                    content_mod_date: f.content_mod_date,
                    permissions: f.permissions.clone(),
                    user_info: f.user_info,
                    finder_info: f.finder_info,
                    text_encoding: f.text_encoding,
                    kind: CatalogItemKind::Folder { valence: f.valence },
                });
            }
            CatalogRecord::File(f) => {
                allocator.reuse_or_allocate(f.file_id);
                let name = sanitize_name(&entry.name, &mut warnings, f.file_id);

                let source_blocks = crate::size::blocks_for_bytes(f.data_fork.logical_size + f.resource_fork.logical_size, source.block_size);
                progress.event(ProgressEvent::WillCopyBlocks(source_blocks));

                let (data_fork, data_series) = copy_fork(source, &mut destination, writer, f.file_id, &f.data_fork, false)?;
                let (resource_fork, resource_series) = copy_fork(source, &mut destination, writer, f.file_id, &f.resource_fork, true)?;

                push_overflow_records(&mut overflow_records, FORK_TYPE_DATA, f.file_id, &data_series);
                push_overflow_records(&mut overflow_records, FORK_TYPE_RESOURCE, f.file_id, &resource_series);

                let copied = data_fork.total_blocks as u64 + resource_fork.total_blocks as u64;
                blocks_copied += copied;
                file_count += 1;
                progress.event(ProgressEvent::DidCopyBlocks(copied));

                builder.push(CatalogItem {
                    cnid: f.file_id,
                    parent_cnid: entry.parent_cnid,
                    name,
                    create_date: f.create_date,
                    content_mod_date: f.content_mod_date,
                    permissions: f.permissions.clone(),
                    user_info: f.user_info,
                    finder_info: f.finder_info,
                    text_encoding: f.text_encoding,
                    kind: CatalogItemKind::File { data_fork, resource_fork },
                });
            }
            _ => {}
        }
    }

    check_cancelled(cancel)?;

    let next_catalog_id = allocator.next_id();
    // Folder count excludes the root folder itself, matching the original
    // master directory block's convention.
    folder_count = folder_count.saturating_sub(1);

    overflow_records.sort_by(|a, b| a.0.cmp(&b.0));

    // 0xCF is HFS+'s on-disk tag for case-folding key comparison, the mode
    // the catalog tree's sort order above already assumes.
    const KEY_COMPARE_CASE_FOLDING: u32 = 0xCF;

    let node_size = btree_node_size(destination.block_size);
    let catalog_tree = build_btree_with_leaf_fill(&builder.into_sorted_records(), node_size, CATALOG_MAX_KEY_LENGTH, KEY_COMPARE_CASE_FOLDING, 0, 0.75)?;
    let extents_tree = build_btree(&overflow_records, node_size, EXTENTS_MAX_KEY_LENGTH, 0, 0)?;
    let attributes_tree = build_btree(&[], node_size, ATTRIBUTES_MAX_KEY_LENGTH, 0, 0)?;

    let (catalog_fork, catalog_extents) = allocate_and_place(&mut destination, &catalog_tree.node_bytes)?;
    let (extents_fork, extents_extents) = allocate_and_place(&mut destination, &extents_tree.node_bytes)?;
    let (attributes_fork, attributes_extents) = allocate_and_place(&mut destination, &attributes_tree.node_bytes)?;

    write_extents_content(writer, destination.block_size, &catalog_extents, &catalog_tree.node_bytes)?;
    write_extents_content(writer, destination.block_size, &extents_extents, &extents_tree.node_bytes)?;
    write_extents_content(writer, destination.block_size, &attributes_extents, &attributes_tree.node_bytes)?;

    // The allocation bitmap's own extent must be claimed last: claiming it
    // flips bits in the very bitmap being serialized, so no allocation can
    // happen after this without invalidating the snapshot below.
    let bitmap_blocks = crate::size::blocks_for_bytes(destination.bitmap_bytes().len() as u64, destination.block_size) as u32;
    let bitmap_extents = destination.allocate_blocks(bitmap_blocks, AllocationBias::ResourceForkLow)?;
    let bitmap_bytes = destination.bitmap_bytes().to_vec();
    write_extents_content(writer, destination.block_size, &bitmap_extents, &bitmap_bytes)?;
    let mut bitmap_series = ExtentSeries::new();
    for extent in &bitmap_extents {
        bitmap_series.append(*extent);
    }
    let allocation_fork = fork_from_series(&bitmap_series, bitmap_bytes.len() as u64, 0);

    // Step 3: flush.
    flush_volume_structures(writer, &destination, &allocation_fork, &catalog_fork, &extents_fork, &attributes_fork, next_catalog_id, file_count, folder_count, &boot_blocks)?;

    Ok(ConversionReport { warnings, files_copied: file_count, folders_created: folder_count, blocks_copied })
}

fn copy_fork<R, W>(source: &mut SourceVolume<R>, destination: &mut DestinationVolume, writer: &mut W, file_id: u32, fork: &ForkData, resource: bool) -> Result<(ForkData, ExtentSeries)>
where
    R: Read + Seek,
    W: Write + Seek,
{
    let bias = if resource { AllocationBias::ResourceForkLow } else { AllocationBias::DataForkHigh };
    let mut handle = VirtualFileHandle::new(destination, writer, bias);
    source.copy_fork_to(file_id, fork, resource, &mut handle)?;
    Ok(handle.finish())
}

/// Accumulate the `(key, payload)` pairs for every extent past the first
/// 8 in a fork's series into the extents overflow tree, keyed by the
/// cumulative block count the earlier records already cover -- matching
/// what [`crate::extents::lookup_overflow_extents`] expects to find.
fn push_overflow_records(out: &mut Vec<(Vec<u8>, Vec<u8>)>, fork_type: u8, file_id: u32, series: &ExtentSeries) {
    let records = series.to_extent_records();
    if records.len() <= 1 {
        return;
    }
    let mut block_offset: u32 = records[0].iter().map(|e| e.block_count).sum();
    for record in &records[1..] {
        out.push((extents::encode_extent_key(fork_type, file_id, block_offset), extents::encode_extent_record(record)));
        block_offset += record.iter().map(|e| e.block_count).sum::<u32>();
    }
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

/// Validate a decoded name against HFS+'s constraints, escaping and
/// truncating it (and recording a warning) when it would otherwise be
/// rejected -- matches `EncodingFailure`'s "rename with an escape
/// sequence and continue" handling.
fn sanitize_name(name: &[u16], warnings: &mut Vec<Warning>, cnid: u32) -> Vec<u16> {
    if encoding::validate_hfs_plus_name(name).is_ok() {
        return name.to_vec();
    }
    let escaped = encoding::string_by_escaping_string(&unicode::utf16_to_string(name));
    let mut units = unicode::string_to_utf16(&escaped);
    if units.is_empty() {
        units = unicode::string_to_utf16("Untitled");
    }
    units.truncate(255);
    warnings.push(Warning::EncodingFallback { cnid, reason: "name required escaping to satisfy HFS+ naming constraints".into() });
    units
}
