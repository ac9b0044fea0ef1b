//! The HFS+ volume being built: a growable allocation bitmap, the virtual
//! file handles that claim blocks from it as fork content is written, and
//! the final flush that lays out boot blocks, volume header, system
//! B*-trees, and bitmap in their on-disk positions.

use std::io::{Seek, SeekFrom, Write};

use crate::catalog::{CNID_ATTRIBUTES_FILE, CNID_CATALOG_FILE, CNID_EXTENTS_FILE};
use crate::error::{Error, Result};
use crate::extents::{ExtentDescriptor, ExtentSeries, ForkData};
use crate::size;
use crate::volume::header::{VOLUME_HEADER_OFFSET, HFS_PLUS_SIGNATURE};

/// Set on a volume header's `attributes` field for the duration of the
/// bulk-copy step: a crash or forced unmount partway through a conversion
/// leaves a volume the OS refuses to mount rather than one it mounts with
/// missing data. Cleared by the final [`flush_volume_structures`] write.
pub const ATTR_VOLUME_INCONSISTENT: u32 = 0x0800;

/// Set on the final header write: the volume was not left mounted by
/// whatever wrote it last, so the next mounter can skip a consistency check.
pub const ATTR_VOLUME_UNMOUNTED: u32 = 0x0100;

fn bit_is_set(bitmap: &[u8], index: u32) -> bool {
    let byte = (index / 8) as usize;
    byte < bitmap.len() && bitmap[byte] & (0x80 >> (index % 8)) != 0
}

fn set_bit(bitmap: &mut [u8], index: u32) {
    let byte = (index / 8) as usize;
    if byte < bitmap.len() {
        bitmap[byte] |= 0x80 >> (index % 8);
    }
}

/// Which end of the volume a fork's extents are preferentially allocated
/// from, matching the placement a real from-scratch HFS+ volume ends up
/// with: resource forks (small, numerous, historically read first at mount)
/// cluster near the start; data forks cluster near the end, leaving the
/// middle free for growth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationBias {
    ResourceForkLow,
    DataForkHigh,
}

/// The destination volume's allocation state and identity, independent of
/// any particular open file writer (which borrows it via
/// [`VirtualFileHandle`]).
pub struct DestinationVolume {
    pub block_size: u32,
    pub total_blocks: u32,
    pub volume_name: Vec<u16>,
    pub create_date: u32,
    pub finder_info: [u32; 8],
    /// Bitmap of text encodings used by names on the volume, written into
    /// the header's `encodingsBitmap` field. Bit 0 (MacRoman) is always
    /// set; callers OR in further bits via [`Self::mark_encoding_used`] as
    /// non-Roman script codes are encountered.
    pub encoding_bitmap: u64,
    bitmap: Vec<u8>,
    low_hint: u32,
    high_hint: u32,
}

impl DestinationVolume {
    pub fn new(block_size: u32, total_blocks: u32, volume_name: Vec<u16>, create_date: u32) -> Self {
        DestinationVolume {
            block_size,
            total_blocks,
            volume_name,
            create_date,
            finder_info: [0u32; 8],
            encoding_bitmap: 1,
            bitmap: vec![0u8; (total_blocks as usize).div_ceil(8)],
            low_hint: 0,
            high_hint: total_blocks,
        }
    }

    pub fn mark_encoding_used(&mut self, script_code: u8) {
        self.encoding_bitmap |= 1u64 << (script_code.min(63) as u32);
    }

    /// Convenience constructor matching the original tool's
    /// `setAllocationBlockSize:countOfUserBlocks:`: given a target block
    /// size and the number of blocks the caller actually wants available
    /// for catalog/extents/file data, pads in the blocks the fixed
    /// structures (boot blocks, volume header, alternate header, footer)
    /// need and reserves them so the allocator never hands them out.
    pub fn set_allocation_block_size_with_user_blocks(block_size: u32, user_blocks: u32, volume_name: Vec<u16>, create_date: u32) -> Self {
        const FIXED_STRUCTURE_BYTES: u64 = 1024 + 512 + 512 + 512; // boot blocks + header + alternate header + footer
        let reserved_blocks = size::blocks_for_bytes(FIXED_STRUCTURE_BYTES, block_size) as u32;
        let total_blocks = user_blocks + reserved_blocks;
        let mut volume = DestinationVolume::new(block_size, total_blocks, volume_name, create_date);
        volume.mark_allocated(0, reserved_blocks);
        volume.low_hint = reserved_blocks;
        volume
    }

    fn is_free(&self, block: u32) -> bool {
        !bit_is_set(&self.bitmap, block)
    }

    fn mark_allocated(&mut self, start: u32, count: u32) {
        for b in start..start.saturating_add(count) {
            set_bit(&mut self.bitmap, b);
        }
    }

    pub fn free_block_count(&self) -> u32 {
        (0..self.total_blocks).filter(|&b| self.is_free(b)).count() as u32
    }

    fn find_exact_run_forward(&self, start: u32, count: u32) -> Option<u32> {
        let mut run_start = None;
        let mut run_len = 0u32;
        for b in start..self.total_blocks {
            if self.is_free(b) {
                if run_start.is_none() {
                    run_start = Some(b);
                }
                run_len += 1;
                if run_len == count {
                    return run_start;
                }
            } else {
                run_start = None;
                run_len = 0;
            }
        }
        None
    }

    fn find_exact_run_backward(&self, end_exclusive: u32, count: u32) -> Option<u32> {
        let mut run_end: Option<u32> = None;
        let mut run_len = 0u32;
        let mut b = end_exclusive;
        while b > 0 {
            b -= 1;
            if self.is_free(b) {
                if run_end.is_none() {
                    run_end = Some(b + 1);
                }
                run_len += 1;
                if run_len == count {
                    return Some(b);
                }
            } else {
                run_end = None;
                run_len = 0;
            }
        }
        None
    }

    fn find_largest_run(&self) -> Option<(u32, u32)> {
        let mut best_start = None;
        let mut best_len = 0u32;
        let mut cur_start = None;
        let mut cur_len = 0u32;
        for b in 0..self.total_blocks {
            if self.is_free(b) {
                if cur_start.is_none() {
                    cur_start = Some(b);
                }
                cur_len += 1;
                if cur_len > best_len {
                    best_len = cur_len;
                    best_start = cur_start;
                }
            } else {
                cur_start = None;
                cur_len = 0;
            }
        }
        best_start.map(|s| (s, best_len))
    }

    /// Claim `count` blocks, per the policy spec.md describes: try a single
    /// run at the bias-preferred end first, then a single run at the
    /// opposite end, then fall back to as many fragments as it takes from
    /// wherever space remains, and only fail once the volume is genuinely
    /// full.
    pub fn allocate_blocks(&mut self, count: u32, bias: AllocationBias) -> Result<Vec<ExtentDescriptor>> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let preferred = match bias {
            AllocationBias::ResourceForkLow => self.find_exact_run_forward(self.low_hint, count),
            AllocationBias::DataForkHigh => self.find_exact_run_backward(self.high_hint, count),
        };
        if let Some(start) = preferred {
            self.mark_allocated(start, count);
            match bias {
                AllocationBias::ResourceForkLow => self.low_hint = start + count,
                AllocationBias::DataForkHigh => self.high_hint = start,
            }
            return Ok(vec![ExtentDescriptor { start_block: start, block_count: count }]);
        }

        let opposite = match bias {
            AllocationBias::ResourceForkLow => self.find_exact_run_backward(self.total_blocks, count),
            AllocationBias::DataForkHigh => self.find_exact_run_forward(0, count),
        };
        if let Some(start) = opposite {
            self.mark_allocated(start, count);
            return Ok(vec![ExtentDescriptor { start_block: start, block_count: count }]);
        }

        let mut remaining = count;
        let mut result = Vec::new();
        while remaining > 0 {
            match self.find_largest_run() {
                Some((start, len)) => {
                    let take = len.min(remaining);
                    self.mark_allocated(start, take);
                    result.push(ExtentDescriptor { start_block: start, block_count: take });
                    remaining -= take;
                }
                None => return Err(Error::InsufficientSpace { needed: count as u64, available: self.free_block_count() as u64 }),
            }
        }
        Ok(result)
    }

    pub fn bitmap_bytes(&self) -> &[u8] {
        &self.bitmap
    }
}

/// Build a `ForkData` from an already-allocated extent series: the first 8
/// extents go inline, the logical size is the caller-supplied byte count.
/// Any extents past the first 8 are the caller's responsibility to place in
/// the extents overflow tree (see [`crate::pipeline::defragmenting`]).
pub fn fork_from_series(series: &ExtentSeries, logical_size: u64, clump_size: u32) -> ForkData {
    let records = series.to_extent_records();
    let mut extents = [ExtentDescriptor::default(); 8];
    if let Some(first) = records.first() {
        extents = *first;
    }
    ForkData { logical_size, clump_size, total_blocks: series.total_blocks() as u32, extents }
}

/// Write `data` across an already-allocated extent list, in order. Used for
/// the catalog tree, the extents overflow tree, and the allocation bitmap
/// itself -- none of which go through [`VirtualFileHandle`] since their size
/// is known up front and allocated in one shot.
pub fn write_extents_content<W: Write + Seek>(writer: &mut W, block_size: u32, extents: &[ExtentDescriptor], data: &[u8]) -> Result<()> {
    let block_size_u64 = block_size as u64;
    let mut written = 0usize;
    for extent in extents.iter().filter(|e| e.block_count > 0) {
        if written >= data.len() {
            break;
        }
        let capacity = (extent.block_count as u64 * block_size_u64) as usize;
        let chunk = capacity.min(data.len() - written);
        writer.seek(SeekFrom::Start(extent.start_block as u64 * block_size_u64))?;
        writer.write_all(&data[written..written + chunk])?;
        written += chunk;
    }
    if written < data.len() {
        let available_blocks: u64 = extents.iter().map(|e| e.block_count as u64).sum();
        return Err(Error::InsufficientSpace { needed: size::blocks_for_bytes(data.len() as u64, block_size) as u64, available: available_blocks });
    }
    Ok(())
}

/// A growable, allocation-backed cursor over one fork's bytes on the
/// destination volume: each write that would exceed the currently claimed
/// extents grows into a fresh allocation before the write proceeds,
/// mirroring the original tool's `growIntoExtents:` step.
pub struct VirtualFileHandle<'a, W: Write + Seek> {
    volume: &'a mut DestinationVolume,
    writer: &'a mut W,
    extents: ExtentSeries,
    bias: AllocationBias,
    position: u64,
    logical_size: u64,
}

impl<'a, W: Write + Seek> VirtualFileHandle<'a, W> {
    pub fn new(volume: &'a mut DestinationVolume, writer: &'a mut W, bias: AllocationBias) -> Self {
        VirtualFileHandle { volume, writer, extents: ExtentSeries::new(), bias, position: 0, logical_size: 0 }
    }

    fn capacity_bytes(&self) -> u64 {
        self.extents.total_blocks() * self.volume.block_size as u64
    }

    fn grow_into_extents(&mut self, additional_bytes: u64) -> Result<()> {
        let needed_blocks = size::blocks_for_bytes(additional_bytes, self.volume.block_size);
        if needed_blocks == 0 {
            return Ok(());
        }
        let new_extents = self.volume.allocate_blocks(needed_blocks as u32, self.bias)?;
        for extent in new_extents {
            self.extents.append(extent);
        }
        Ok(())
    }

    fn locate(&self, logical_offset: u64) -> Result<(u64, u64)> {
        let block_size = self.volume.block_size as u64;
        let mut remaining = logical_offset;
        for extent in self.extents.as_slice() {
            let extent_bytes = extent.block_count as u64 * block_size;
            if remaining < extent_bytes {
                let physical = extent.start_block as u64 * block_size + remaining;
                return Ok((physical, extent_bytes - remaining));
            }
            remaining -= extent_bytes;
        }
        Err(Error::MalformedSource("virtual file handle position exceeds allocated extents".into()))
    }

    pub fn write_all(&mut self, data: &[u8]) -> Result<()> {
        let needed_end = self.position + data.len() as u64;
        if needed_end > self.capacity_bytes() {
            self.grow_into_extents(needed_end - self.capacity_bytes())?;
        }

        let mut written = 0usize;
        let mut logical = self.position;
        while written < data.len() {
            let (physical, extent_remaining) = self.locate(logical)?;
            let chunk = ((data.len() - written) as u64).min(extent_remaining) as usize;
            self.writer.seek(SeekFrom::Start(physical))?;
            self.writer.write_all(&data[written..written + chunk])?;
            written += chunk;
            logical += chunk as u64;
        }

        self.position += data.len() as u64;
        self.logical_size = self.logical_size.max(self.position);
        Ok(())
    }

    /// Consume the handle, returning its fork data (first 8 extents inline)
    /// and the full extent series (for the extents overflow tree, if the
    /// fork grew past 8 extents).
    pub fn finish(self) -> (ForkData, ExtentSeries) {
        (fork_from_series(&self.extents, self.logical_size, 0), self.extents)
    }
}

impl<'a, W: Write + Seek> Write for VirtualFileHandle<'a, W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.write_all(buf).map_err(|e| match e {
            Error::Io(io_err) => io_err,
            other => std::io::Error::other(other),
        })?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Write the volume's fixed structures in the order mount-safety requires:
/// boot blocks, then a temporary header flagged inconsistent, then the
/// system files' node data (already built and placed by the caller), then
/// the allocation bitmap, and finally the real header (plus its tail-end
/// alternate copy and footer sector) with the inconsistent flag cleared --
/// the last write that makes the volume mountable at all.
#[allow(clippy::too_many_arguments)]
pub fn flush_volume_structures<W: Write + Seek>(
    writer: &mut W,
    volume: &DestinationVolume,
    allocation_fork: &ForkData,
    catalog_fork: &ForkData,
    extents_fork: &ForkData,
    attributes_fork: &ForkData,
    next_catalog_id: u32,
    file_count: u32,
    folder_count: u32,
    boot_blocks: &[u8; 1024],
) -> Result<()> {
    // Step 1: boot blocks, copied verbatim from the source volume (or zeroed
    // when there was none, as for a freshly archived volume).
    writer.seek(SeekFrom::Start(0))?;
    writer.write_all(boot_blocks)?;

    // Step 2: temporary header, flagged inconsistent.
    write_header(writer, VOLUME_HEADER_OFFSET, volume, allocation_fork, catalog_fork, extents_fork, attributes_fork, next_catalog_id, file_count, folder_count, ATTR_VOLUME_INCONSISTENT)?;

    // Step 3/4/5: bitmap bytes and catalog/extents overflow node data are
    // written by the caller directly into their allocated extents before
    // this function runs (the pipeline holds the serialized bytes; this
    // module only owns bitmap bookkeeping and the header itself).

    // Step 6: primary header (inconsistency flag cleared, unmounted flag
    // set), its alternate copy at the penultimate sector, and the trailing
    // footer sector.
    let total_bytes = volume.total_blocks as u64 * volume.block_size as u64;
    let alternate_offset = total_bytes.saturating_sub(1024);
    let footer_offset = total_bytes.saturating_sub(512);

    write_header(writer, VOLUME_HEADER_OFFSET, volume, allocation_fork, catalog_fork, extents_fork, attributes_fork, next_catalog_id, file_count, folder_count, ATTR_VOLUME_UNMOUNTED)?;
    write_header(writer, alternate_offset, volume, allocation_fork, catalog_fork, extents_fork, attributes_fork, next_catalog_id, file_count, folder_count, ATTR_VOLUME_UNMOUNTED)?;
    writer.seek(SeekFrom::Start(footer_offset))?;
    writer.write_all(&[0u8; 512])?;

    writer.flush()?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn write_header<W: Write + Seek>(
    writer: &mut W,
    offset: u64,
    volume: &DestinationVolume,
    allocation_fork: &ForkData,
    catalog_fork: &ForkData,
    extents_fork: &ForkData,
    attributes_fork: &ForkData,
    next_catalog_id: u32,
    file_count: u32,
    folder_count: u32,
    attributes: u32,
) -> Result<()> {
    use byteorder::{BigEndian, WriteBytesExt};

    writer.seek(SeekFrom::Start(offset))?;
    writer.write_u16::<BigEndian>(HFS_PLUS_SIGNATURE)?;
    writer.write_u16::<BigEndian>(4)?; // kHFSPlusVersion
    writer.write_u32::<BigEndian>(attributes)?;
    writer.write_u32::<BigEndian>(0)?; // last mounted version
    writer.write_u32::<BigEndian>(0)?; // journal info block
    writer.write_u32::<BigEndian>(volume.create_date)?;
    writer.write_u32::<BigEndian>(volume.create_date)?; // modify date
    writer.write_u32::<BigEndian>(0)?; // backup date
    writer.write_u32::<BigEndian>(0)?; // checked date
    writer.write_u32::<BigEndian>(file_count)?;
    writer.write_u32::<BigEndian>(folder_count)?;
    writer.write_u32::<BigEndian>(volume.block_size)?;
    writer.write_u32::<BigEndian>(volume.total_blocks)?;
    writer.write_u32::<BigEndian>(volume.free_block_count())?;
    writer.write_u32::<BigEndian>(0)?; // next allocation
    writer.write_u32::<BigEndian>(0)?; // rsrc clump size
    writer.write_u32::<BigEndian>(0)?; // data clump size
    writer.write_u32::<BigEndian>(next_catalog_id)?;
    writer.write_u32::<BigEndian>(1)?; // write count
    writer.write_u64::<BigEndian>(volume.encoding_bitmap)?;

    for value in volume.finder_info {
        writer.write_u32::<BigEndian>(value)?;
    }

    write_fork(writer, allocation_fork)?;
    write_fork(writer, extents_fork)?;
    write_fork(writer, catalog_fork)?;
    write_fork(writer, attributes_fork)?;
    write_fork(writer, &ForkData::default())?; // startup file: unused

    Ok(())
}

fn write_fork<W: Write>(writer: &mut W, fork: &ForkData) -> Result<()> {
    use byteorder::{BigEndian, WriteBytesExt};
    writer.write_u64::<BigEndian>(fork.logical_size)?;
    writer.write_u32::<BigEndian>(fork.clump_size)?;
    writer.write_u32::<BigEndian>(fork.total_blocks)?;
    for extent in &fork.extents {
        writer.write_u32::<BigEndian>(extent.start_block)?;
        writer.write_u32::<BigEndian>(extent.block_count)?;
    }
    Ok(())
}

/// CNIDs assigned to the destination's own system files, for use when
/// keying their extents overflow records (an extents-overflow-spanning
/// catalog or attributes file is rare but not impossible on a large
/// conversion).
pub const SYSTEM_FILE_CNIDS: [u32; 3] = [CNID_EXTENTS_FILE, CNID_CATALOG_FILE, CNID_ATTRIBUTES_FILE];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_contiguous_run_from_low_end() {
        let mut vol = DestinationVolume::new(512, 1000, vec![], 0);
        let extents = vol.allocate_blocks(10, AllocationBias::ResourceForkLow).unwrap();
        assert_eq!(extents.len(), 1);
        assert_eq!(extents[0].start_block, 0);
        assert_eq!(extents[0].block_count, 10);
    }

    #[test]
    fn allocates_contiguous_run_from_high_end() {
        let mut vol = DestinationVolume::new(512, 1000, vec![], 0);
        let extents = vol.allocate_blocks(10, AllocationBias::DataForkHigh).unwrap();
        assert_eq!(extents.len(), 1);
        assert_eq!(extents[0].start_block, 990);
        assert_eq!(extents[0].block_count, 10);
    }

    #[test]
    fn fails_when_volume_is_full() {
        let mut vol = DestinationVolume::new(512, 10, vec![], 0);
        vol.allocate_blocks(10, AllocationBias::ResourceForkLow).unwrap();
        let err = vol.allocate_blocks(1, AllocationBias::ResourceForkLow).unwrap_err();
        assert!(matches!(err, Error::InsufficientSpace { .. }));
    }

    #[test]
    fn reserves_fixed_structure_blocks() {
        let vol = DestinationVolume::set_allocation_block_size_with_user_blocks(512, 100, vec![], 0);
        assert!(vol.total_blocks > 100);
        assert!(!vol.is_free(0));
    }
}
