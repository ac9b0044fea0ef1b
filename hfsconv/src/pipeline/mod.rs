//! Orchestrates a whole volume conversion: the types shared by every
//! conversion strategy (options, progress/cancellation hooks, the final
//! report) plus the preflight and preamble steps common to all of them.
//! The bulk-copy step itself is strategy-specific -- see
//! [`defragmenting`], the only strategy implemented here.

pub mod defragmenting;

use std::io::{Read, Seek};

use crate::encoding::ScriptCode;
use crate::error::{Error, Result, Warning};
use crate::volume::destination::DestinationVolume;
use crate::volume::SourceVolume;

pub use defragmenting::convert;

/// A milestone the pipeline reports on as it copies fork bytes, matching
/// the "source blocks copied / source blocks to copy" denominator of truth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressEvent {
    /// About to copy a file whose forks span this many source blocks.
    WillCopyBlocks(u64),
    /// Finished copying a file; this many blocks were actually written.
    DidCopyBlocks(u64),
}

/// Receives progress milestones during a conversion. Called synchronously
/// on the same thread the conversion runs on, between file copies -- it
/// must not call back into the converter.
pub trait ProgressSink {
    fn event(&mut self, _event: ProgressEvent) {}
}

impl ProgressSink for () {}

/// A cooperative cancellation flag, checked between file copies and
/// between pipeline steps. Cancellation mid-step is not supported: the
/// destination simply stops short of the final flush and stays
/// non-mountable by virtue of its temporary, inconsistent-flagged header.
pub trait Cancellation {
    fn is_cancelled(&self) -> bool {
        false
    }
}

impl Cancellation for () {}

impl Cancellation for std::sync::atomic::AtomicBool {
    fn is_cancelled(&self) -> bool {
        self.load(std::sync::atomic::Ordering::Relaxed)
    }
}

/// Caller-tunable conversion parameters.
#[derive(Debug, Clone)]
pub struct ConvertOptions {
    /// Script used to decode classic-HFS names whose Finder extended flags
    /// carry no script code of their own.
    pub default_script: ScriptCode,
    /// When set, step 0 runs the full consistency checker and fails fast
    /// (`Error::InconsistentSource`) rather than continuing best-effort.
    pub strict_consistency: bool,
}

impl Default for ConvertOptions {
    fn default() -> Self {
        ConvertOptions { default_script: ScriptCode::Roman, strict_consistency: false }
    }
}

/// Summary of a completed conversion.
#[derive(Debug, Clone, Default)]
pub struct ConversionReport {
    pub warnings: Vec<Warning>,
    pub files_copied: u32,
    pub folders_created: u32,
    pub blocks_copied: u64,
}

/// Step 0 (preflight): pick the destination block size via
/// `optimal_allocation_block_size_for_volume_length`, reserve enough user
/// blocks to hold a volume at least as large as the source, and carry the
/// source's volume name, creation date, and Finder info across to the new
/// header.
pub(crate) fn preflight<R: Read + Seek>(source: &SourceVolume<R>) -> DestinationVolume {
    let source_total_bytes = source.total_blocks as u64 * source.block_size as u64;
    let dest_block_size = crate::size::optimal_allocation_block_size_for_volume_length(source_total_bytes);
    let user_blocks = crate::size::blocks_for_bytes(source_total_bytes, dest_block_size).max(1) as u32;
    let volume_name = crate::unicode::string_to_utf16(&source.volume_name);

    let mut destination = DestinationVolume::set_allocation_block_size_with_user_blocks(dest_block_size, user_blocks, volume_name, source.create_date);
    destination.finder_info = source.finder_info;
    destination
}

pub(crate) fn check_cancelled(cancel: &dyn Cancellation) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(Error::Unsupported("conversion cancelled before completion".into()));
    }
    Ok(())
}

/// Node size for the destination's system B*-trees: the same power-of-two
/// as the volume's allocation block size, clamped to HFS+'s conventional
/// 512..=4096 range (real volumes rarely run larger catalog nodes than
/// this regardless of allocation block size).
pub(crate) fn btree_node_size(block_size: u32) -> u16 {
    block_size.clamp(512, 4096) as u16
}

pub(crate) const CATALOG_MAX_KEY_LENGTH: u16 = 516;
pub(crate) const EXTENTS_MAX_KEY_LENGTH: u16 = 10;
pub(crate) const ATTRIBUTES_MAX_KEY_LENGTH: u16 = 40;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{build_volume_from_directory, ArchiveOptions};
    use std::io::Cursor;

    #[test]
    fn btree_node_size_clamps_to_the_conventional_range() {
        assert_eq!(btree_node_size(128), 512);
        assert_eq!(btree_node_size(512), 512);
        assert_eq!(btree_node_size(4096), 4096);
        assert_eq!(btree_node_size(65536), 4096);
    }

    #[test]
    fn preflight_sizes_a_destination_at_least_as_large_as_the_source() {
        let dir = std::env::temp_dir().join(format!("hfsconv-pipeline-test-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("payload.bin"), vec![0u8; 8192]).unwrap();

        let mut out = Cursor::new(Vec::new());
        build_volume_from_directory(&dir, &mut out, &ArchiveOptions::default()).unwrap();
        let source = crate::volume::SourceVolume::open(out, 0).unwrap();

        let destination = preflight(&source);
        let source_bytes = source.total_blocks as u64 * source.block_size as u64;
        let dest_bytes = destination.total_blocks as u64 * destination.block_size as u64;
        assert!(dest_bytes >= source_bytes);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn cancellation_flag_is_observed_between_steps() {
        let flag = std::sync::atomic::AtomicBool::new(true);
        assert!(check_cancelled(&flag).is_err());
        flag.store(false, std::sync::atomic::Ordering::Relaxed);
        assert!(check_cancelled(&flag).is_ok());
    }
}
