//! Extent descriptors, extent records, and the extent series abstraction
//! used to track a fork's allocation as it grows during conversion.

use byteorder::{BigEndian, ReadBytesExt};
use std::io::{Read, Seek, SeekFrom, Write};

use crate::btree::file::BTreeHeaderRecord;
use crate::btree::{self};
use crate::error::{Error, Result};

/// A contiguous run of allocation blocks. Stored as `u32` regardless of
/// source width -- HFS's 16-bit extent fields are simply upcast on read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtentDescriptor {
    pub start_block: u32,
    pub block_count: u32,
}

impl std::fmt::Display for ExtentDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}..{})", self.start_block, self.start_block + self.block_count)
    }
}

/// Fork data: describes a data or resource fork's size and its first
/// (inline) extent record. HFS forks carry 3 inline descriptors; HFS+
/// forks carry 8. Both are normalized to the 8-slot HFS+ shape, with
/// unused trailing slots left zeroed.
#[derive(Debug, Clone, Default)]
pub struct ForkData {
    pub logical_size: u64,
    pub clump_size: u32,
    pub total_blocks: u32,
    pub extents: [ExtentDescriptor; 8],
}

pub const FORK_TYPE_DATA: u8 = 0x00;
pub const FORK_TYPE_RESOURCE: u8 = 0xFF;

pub fn read_extent_descriptor_be32<R: Read>(reader: &mut R) -> Result<ExtentDescriptor> {
    Ok(ExtentDescriptor {
        start_block: reader.read_u32::<BigEndian>()?,
        block_count: reader.read_u32::<BigEndian>()?,
    })
}

pub fn read_extent_descriptor_be16<R: Read>(reader: &mut R) -> Result<ExtentDescriptor> {
    Ok(ExtentDescriptor {
        start_block: reader.read_u16::<BigEndian>()? as u32,
        block_count: reader.read_u16::<BigEndian>()? as u32,
    })
}

pub fn read_fork_data_be32<R: Read>(reader: &mut R) -> Result<ForkData> {
    let logical_size = reader.read_u64::<BigEndian>()?;
    let clump_size = reader.read_u32::<BigEndian>()?;
    let total_blocks = reader.read_u32::<BigEndian>()?;
    let mut extents = [ExtentDescriptor::default(); 8];
    for extent in &mut extents {
        *extent = read_extent_descriptor_be32(reader)?;
    }
    Ok(ForkData { logical_size, clump_size, total_blocks, extents })
}

/// Read an HFS (16-bit) fork data record: logical size (u32), clump size
/// (u32), and 3 inline extent descriptors, each using 16-bit fields.
pub fn read_fork_data_hfs<R: Read>(reader: &mut R) -> Result<ForkData> {
    let logical_size = reader.read_u32::<BigEndian>()? as u64;
    let clump_size = reader.read_u32::<BigEndian>()?;
    let mut extents = [ExtentDescriptor::default(); 8];
    for slot in extents.iter_mut().take(3) {
        *slot = read_extent_descriptor_be16(reader)?;
    }
    let total_blocks = extents.iter().map(|e| e.block_count).sum();
    Ok(ForkData { logical_size, clump_size, total_blocks, extents })
}

/// A reader that presents a file's data fork as a contiguous `Read + Seek`
/// stream by translating logical offsets through a flattened extent map.
pub struct ForkReader<'a, R: Read + Seek> {
    reader: &'a mut R,
    logical_size: u64,
    extent_map: Vec<(u64, u64, u64)>,
    position: u64,
}

impl<'a, R: Read + Seek> ForkReader<'a, R> {
    pub fn new(reader: &'a mut R, logical_size: u64, extents: &[ExtentDescriptor], block_size: u32) -> Self {
        let block_size = block_size as u64;
        let mut extent_map = Vec::new();
        let mut logical_offset = 0u64;
        for extent in extents {
            if extent.block_count == 0 {
                continue;
            }
            let physical_start = extent.start_block as u64 * block_size;
            let length = extent.block_count as u64 * block_size;
            extent_map.push((logical_offset, physical_start, length));
            logical_offset += length;
        }
        ForkReader { reader, logical_size, extent_map, position: 0 }
    }

    fn logical_to_physical(&self, logical_offset: u64) -> Option<(u64, u64)> {
        for &(log_start, phys_start, length) in &self.extent_map {
            if logical_offset >= log_start && logical_offset < log_start + length {
                return Some((phys_start + (logical_offset - log_start), (log_start + length) - logical_offset));
            }
        }
        None
    }
}

impl<R: Read + Seek> Read for ForkReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.position >= self.logical_size {
            return Ok(0);
        }
        let remaining = (self.logical_size - self.position) as usize;
        let to_read = buf.len().min(remaining);
        if to_read == 0 {
            return Ok(0);
        }

        let mut total_read = 0;
        while total_read < to_read {
            let logical_pos = self.position + total_read as u64;
            let (physical_pos, extent_remaining) = self
                .logical_to_physical(logical_pos)
                .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "logical offset beyond extent map"))?;

            let chunk_size = ((to_read - total_read) as u64).min(extent_remaining) as usize;
            self.reader.seek(SeekFrom::Start(physical_pos))?;
            self.reader.read_exact(&mut buf[total_read..total_read + chunk_size])?;
            total_read += chunk_size;
        }

        self.position += total_read as u64;
        Ok(total_read)
    }
}

impl<R: Read + Seek> Seek for ForkReader<'_, R> {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let new_pos = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::Current(offset) => self.position as i64 + offset,
            SeekFrom::End(offset) => self.logical_size as i64 + offset,
        };
        if new_pos < 0 {
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidInput, "seek before start of file"));
        }
        self.position = new_pos as u64;
        Ok(self.position)
    }
}

/// Stream a fork's data to a writer, following inline extents first and
/// then the extents overflow tree for anything beyond the 8 inline slots.
#[allow(clippy::too_many_arguments)]
pub fn read_fork_data<R: Read + Seek, W: Write>(
    reader: &mut R,
    block_size: u32,
    extents_btree: &BTreeHeaderRecord,
    fork: &ForkData,
    file_id: u32,
    fork_type: u8,
    writer: &mut W,
) -> Result<u64> {
    let block_size_u64 = block_size as u64;
    let total_bytes = fork.logical_size;
    if total_bytes == 0 {
        return Ok(0);
    }

    let mut bytes_written: u64 = 0;
    let mut buf = vec![0u8; block_size as usize];

    for extent in fork.extents.iter().filter(|e| e.block_count > 0) {
        if bytes_written >= total_bytes {
            break;
        }
        bytes_written += read_extent(reader, extent, block_size_u64, total_bytes - bytes_written, &mut buf, writer)?;
    }

    if bytes_written >= total_bytes {
        return Ok(bytes_written);
    }

    let mut start_block = fork.extents.iter().map(|e| e.block_count).sum::<u32>();
    loop {
        if bytes_written >= total_bytes {
            break;
        }
        let overflow_extents = lookup_overflow_extents(reader, extents_btree, file_id, fork_type, start_block)?;
        if overflow_extents.is_empty() {
            break;
        }
        for extent in overflow_extents.iter().filter(|e| e.block_count > 0) {
            if bytes_written >= total_bytes {
                break;
            }
            bytes_written += read_extent(reader, extent, block_size_u64, total_bytes - bytes_written, &mut buf, writer)?;
            start_block += extent.block_count;
        }
    }

    Ok(bytes_written)
}

fn read_extent<R: Read + Seek, W: Write>(
    reader: &mut R,
    extent: &ExtentDescriptor,
    block_size: u64,
    remaining: u64,
    buf: &mut [u8],
    writer: &mut W,
) -> Result<u64> {
    let mut written = 0u64;
    let start_offset = extent.start_block as u64 * block_size;
    for block_idx in 0..extent.block_count as u64 {
        if written >= remaining {
            break;
        }
        let offset = start_offset + block_idx * block_size;
        reader.seek(SeekFrom::Start(offset))?;
        let to_read = std::cmp::min(block_size, remaining - written) as usize;
        reader.read_exact(&mut buf[..to_read])?;
        writer.write_all(&buf[..to_read])?;
        written += to_read as u64;
    }
    Ok(written)
}

/// Look up the next overflow extent record for `(file_id, fork_type,
/// start_block)` in the extents overflow B*-tree. Returns up to 8
/// descriptors, or an empty vec if no further record exists.
pub fn lookup_overflow_extents<R: Read + Seek>(
    reader: &mut R,
    extents_btree: &BTreeHeaderRecord,
    file_id: u32,
    fork_type: u8,
    start_block: u32,
) -> Result<Vec<ExtentDescriptor>> {
    let comparator = move |record_data: &[u8]| -> std::cmp::Ordering {
        if record_data.len() < 12 {
            return std::cmp::Ordering::Less;
        }
        let rec_fork_type = record_data[2];
        let rec_file_id = u32::from_be_bytes([record_data[4], record_data[5], record_data[6], record_data[7]]);
        let rec_start_block = u32::from_be_bytes([record_data[8], record_data[9], record_data[10], record_data[11]]);
        match rec_file_id.cmp(&file_id) {
            std::cmp::Ordering::Equal => {}
            ord => return ord,
        }
        match rec_fork_type.cmp(&fork_type) {
            std::cmp::Ordering::Equal => {}
            ord => return ord,
        }
        rec_start_block.cmp(&start_block)
    };

    match btree::file::search_btree(reader, extents_btree, &comparator)? {
        Some((node, record_idx)) => {
            let record_data = node.record_data(record_idx)?;
            let key_length = u16::from_be_bytes([record_data[0], record_data[1]]) as usize;
            let data_start = 2 + key_length;
            if data_start + 64 > record_data.len() {
                return Err(Error::MalformedSource("extent overflow record too short".into()));
            }
            let mut cursor = std::io::Cursor::new(&record_data[data_start..]);
            let mut extents = Vec::with_capacity(8);
            for _ in 0..8 {
                extents.push(read_extent_descriptor_be32(&mut cursor)?);
            }
            Ok(extents)
        }
        None => Ok(Vec::new()),
    }
}

/// Encode an extents overflow B*-tree key body (everything after the
/// 2-byte key length HFS+'s B*-tree format prepends): fork type, a reserved
/// pad byte, the owning file's CNID, and the fork-relative starting block
/// the record's 8 descriptors continue from. Comparing two encoded keys as
/// raw bytes reproduces the tree's `(forkType, fileID, startBlock)` sort
/// order, since each field occupies a fixed, consistently-ordered position.
pub fn encode_extent_key(fork_type: u8, file_id: u32, start_block: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(10);
    out.push(fork_type);
    out.push(0); // reserved
    out.extend_from_slice(&file_id.to_be_bytes());
    out.extend_from_slice(&start_block.to_be_bytes());
    out
}

/// Encode one 8-descriptor extent record as an extents overflow leaf payload.
pub fn encode_extent_record(record: &[ExtentDescriptor; 8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(64);
    for extent in record {
        out.extend_from_slice(&extent.start_block.to_be_bytes());
        out.extend_from_slice(&extent.block_count.to_be_bytes());
    }
    out
}

/// An ordered, coalescing run of extent descriptors. Used by the
/// destination volume writer to accumulate a fork's allocation as space is
/// claimed, merging a newly appended descriptor into the last one whenever
/// they are physically adjacent so the resulting extent record stays as
/// compact as possible.
#[derive(Debug, Clone, Default)]
pub struct ExtentSeries {
    extents: Vec<ExtentDescriptor>,
}

impl ExtentSeries {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.extents.is_empty()
    }

    pub fn len(&self) -> usize {
        self.extents.len()
    }

    pub fn total_blocks(&self) -> u64 {
        self.extents.iter().map(|e| e.block_count as u64).sum()
    }

    pub fn as_slice(&self) -> &[ExtentDescriptor] {
        &self.extents
    }

    /// Append a descriptor, coalescing it into the last one if they abut.
    pub fn append(&mut self, extent: ExtentDescriptor) {
        if extent.block_count == 0 {
            return;
        }
        if let Some(last) = self.extents.last_mut() {
            if last.start_block + last.block_count == extent.start_block {
                last.block_count += extent.block_count;
                return;
            }
        }
        self.extents.push(extent);
    }

    /// Append a whole HFS-style 3-descriptor (or HFS+ 8-descriptor) extent
    /// record in order, coalescing each in turn, and stop at the first
    /// empty (`block_count == 0`) descriptor.
    pub fn append_extent_record(&mut self, record: &[ExtentDescriptor]) {
        for extent in record {
            if extent.block_count == 0 {
                break;
            }
            self.append(*extent);
        }
    }

    /// Split the series into HFS+-shaped extent records of up to 8
    /// descriptors each: the first record goes inline in a fork's ForkData,
    /// subsequent records become extents overflow B*-tree entries.
    pub fn to_extent_records(&self) -> Vec<[ExtentDescriptor; 8]> {
        let mut records = Vec::new();
        for chunk in self.extents.chunks(8) {
            let mut record = [ExtentDescriptor::default(); 8];
            record[..chunk.len()].copy_from_slice(chunk);
            records.push(record);
        }
        if records.is_empty() {
            records.push([ExtentDescriptor::default(); 8]);
        }
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coalesces_adjacent_extents() {
        let mut series = ExtentSeries::new();
        series.append(ExtentDescriptor { start_block: 10, block_count: 5 });
        series.append(ExtentDescriptor { start_block: 15, block_count: 3 });
        assert_eq!(series.len(), 1);
        assert_eq!(series.total_blocks(), 8);
    }

    #[test]
    fn keeps_nonadjacent_extents_separate() {
        let mut series = ExtentSeries::new();
        series.append(ExtentDescriptor { start_block: 10, block_count: 5 });
        series.append(ExtentDescriptor { start_block: 100, block_count: 3 });
        assert_eq!(series.len(), 2);
    }

    #[test]
    fn stops_appending_record_at_first_empty_descriptor() {
        let mut series = ExtentSeries::new();
        let record = [
            ExtentDescriptor { start_block: 0, block_count: 4 },
            ExtentDescriptor { start_block: 0, block_count: 0 },
            ExtentDescriptor { start_block: 50, block_count: 2 },
        ];
        series.append_extent_record(&record);
        assert_eq!(series.len(), 1);
        assert_eq!(series.total_blocks(), 4);
    }

    #[test]
    fn splits_into_eight_slot_records() {
        let mut series = ExtentSeries::new();
        for i in 0..10u32 {
            series.append(ExtentDescriptor { start_block: i * 100, block_count: 1 });
        }
        let records = series.to_extent_records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0][7].start_block, 700);
        assert_eq!(records[1][0].start_block, 800);
    }
}
