//! Consistency checks run against a source volume before and after
//! conversion: every catalog/extents-overflow extent accounted for in the
//! allocation bitmap, no two files claiming the same block, and every
//! catalog entry reachable by both CNID lookup and path lookup.
//!
//! These are free functions rather than a trait -- there is exactly one
//! source of truth (the volume being read) and no second implementation
//! ever needed, so a trait would only add indirection.

use std::collections::{HashMap, HashSet};
use std::io::{Read, Seek};

use crate::catalog::{CNID_CATALOG_FILE, CNID_EXTENTS_FILE};
use crate::error::{Result, Warning};
use crate::extents::{FORK_TYPE_DATA, FORK_TYPE_RESOURCE};
use crate::volume::SourceVolume;

/// Cross-reference every block the catalog and extents-overflow trees
/// claim (inline extents plus anything chained through extents overflow)
/// against the allocation bitmap: flags blocks claimed by more than one
/// CNID ([`Warning::OverlappingExtent`]) and blocks the bitmap marks used
/// but nothing claims ([`Warning::OrphanedBlock`]).
pub fn check_block_references<R: Read + Seek>(source: &mut SourceVolume<R>) -> Result<Vec<Warning>> {
    let mut warnings = Vec::new();
    let mut owner: HashMap<u32, u32> = HashMap::new();

    let mut mark = |warnings: &mut Vec<Warning>, owner: &mut HashMap<u32, u32>, cnid: u32, start: u32, count: u32| {
        for block in start..start.saturating_add(count) {
            match owner.get(&block) {
                Some(&existing) if existing != cnid => {
                    warnings.push(Warning::OverlappingExtent { cnid, index: block as usize, other: existing });
                }
                Some(_) => {}
                None => {
                    owner.insert(block, cnid);
                }
            }
        }
    };

    for extent in source.catalog_btree_header.fork.extents.iter().filter(|e| e.block_count > 0) {
        mark(&mut warnings, &mut owner, CNID_CATALOG_FILE, extent.start_block, extent.block_count);
    }
    for extent in source.extents_btree_header.fork.extents.iter().filter(|e| e.block_count > 0) {
        mark(&mut warnings, &mut owner, CNID_EXTENTS_FILE, extent.start_block, extent.block_count);
    }

    let mut files = Vec::new();
    source.walk_file_forks(|cnid, data, resource| files.push((cnid, data.clone(), resource.clone())))?;

    for (cnid, data_fork, resource_fork) in &files {
        for (fork, fork_type) in [(data_fork, FORK_TYPE_DATA), (resource_fork, FORK_TYPE_RESOURCE)] {
            for extent in fork.extents.iter().filter(|e| e.block_count > 0) {
                mark(&mut warnings, &mut owner, *cnid, extent.start_block, extent.block_count);
            }
            let mut start_block: u32 = fork.extents.iter().map(|e| e.block_count).sum();
            loop {
                let overflow = source.lookup_overflow_extents_for(*cnid, fork_type, start_block)?;
                if overflow.is_empty() {
                    break;
                }
                for extent in overflow.iter().filter(|e| e.block_count > 0) {
                    mark(&mut warnings, &mut owner, *cnid, extent.start_block, extent.block_count);
                    start_block += extent.block_count;
                }
            }
        }
    }

    for block in 0..source.total_blocks {
        if source.is_block_allocated(block) && !owner.contains_key(&block) {
            warnings.push(Warning::OrphanedBlock { block });
        }
    }

    Ok(warnings)
}

/// Every CNID with a keyed catalog record should also have a thread record
/// (its reverse lookup, parent-ID-and-name); a keyed record without one is
/// unreachable by path even though it is still reachable by a direct CNID
/// scan.
pub fn check_catalog_threads<R: Read + Seek>(source: &mut SourceVolume<R>) -> Result<Vec<Warning>> {
    let (keyed, threaded) = source.catalog_cnid_sets()?;
    let missing: HashSet<u32> = keyed.difference(&threaded).copied().collect();
    Ok(missing.into_iter().map(|cnid| Warning::MissingThread { cnid }).collect())
}

/// Run every check and return the combined warning list. A conversion
/// should not proceed past the preflight step (see
/// [`crate::pipeline`]) if this is non-empty and the caller has not
/// explicitly asked to continue past inconsistencies.
pub fn check_volume<R: Read + Seek>(source: &mut SourceVolume<R>) -> Result<Vec<Warning>> {
    let mut warnings = check_block_references(source)?;
    warnings.extend(check_catalog_threads(source)?);
    Ok(warnings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{build_volume_from_directory, ArchiveOptions};
    use std::io::Cursor;

    fn scratch_dir(tag: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("hfsconv-consistency-test-{tag}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&path);
        std::fs::create_dir_all(&path).unwrap();
        path
    }

    #[test]
    fn freshly_built_volume_has_no_inconsistencies() {
        let dir = scratch_dir("clean");
        std::fs::write(dir.join("a.bin"), vec![0xABu8; 4096]).unwrap();
        std::fs::write(dir.join("b.bin"), vec![0xCDu8; 1024]).unwrap();

        let mut out = Cursor::new(Vec::new());
        build_volume_from_directory(&dir, &mut out, &ArchiveOptions::default()).unwrap();
        let mut source = SourceVolume::open(out, 0).unwrap();

        let warnings = check_volume(&mut source).unwrap();
        assert!(warnings.is_empty(), "unexpected warnings: {warnings:?}");

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn catalog_threads_are_all_present_after_a_build() {
        let dir = scratch_dir("threads");
        std::fs::create_dir(dir.join("Folder")).unwrap();
        std::fs::write(dir.join("Folder").join("leaf.bin"), b"x").unwrap();

        let mut out = Cursor::new(Vec::new());
        build_volume_from_directory(&dir, &mut out, &ArchiveOptions::default()).unwrap();
        let mut source = SourceVolume::open(out, 0).unwrap();

        assert!(check_catalog_threads(&mut source).unwrap().is_empty());

        std::fs::remove_dir_all(&dir).ok();
    }
}
