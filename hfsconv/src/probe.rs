//! Locates an HFS or HFS+ volume inside a raw disk image: either the image
//! *is* a bare volume (no partition map, volume header at byte 1024), or it
//! carries an Apple Partition Map (APM) and the volume lives inside one of
//! its entries.

use byteorder::{BigEndian, ReadBytesExt};
use std::io::{Read, Seek, SeekFrom};

use crate::error::Result;
use crate::size::ISO_STANDARD_BLOCK_SIZE;
use crate::volume::header::{HFS_PLUS_SIGNATURE, HFS_SIGNATURE, HFSX_SIGNATURE, VOLUME_HEADER_OFFSET};

const DRIVER_DESCRIPTOR_SIGNATURE: u16 = 0x4552; // 'ER'
const PARTITION_MAP_SIGNATURE: u16 = 0x504D; // 'PM'

/// One entry of an Apple Partition Map, or the synthetic single entry
/// describing a bare (unpartitioned) volume image.
#[derive(Debug, Clone)]
pub struct PartitionInfo {
    /// Byte offset from the start of the image where this partition's own
    /// sector 0 begins; pass straight to [`crate::volume::SourceVolume::open`].
    pub start_offset: u64,
    pub length_bytes: u64,
    pub partition_type: String,
    pub name: String,
    pub is_hfs_candidate: bool,
}

fn pascal_ish_cstr(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    crate::encoding::mac_roman_to_string(&bytes[..end])
}

/// Detect whether `reader` is a bare volume image or carries an Apple
/// Partition Map, and return every partition found (for a bare image, a
/// single synthetic entry at offset 0). Callers typically filter on
/// `is_hfs_candidate` and try [`crate::volume::SourceVolume::open`] against
/// each candidate in turn.
pub fn probe<R: Read + Seek>(reader: &mut R) -> Result<Vec<PartitionInfo>> {
    reader.seek(SeekFrom::Start(VOLUME_HEADER_OFFSET))?;
    if let Ok(signature) = reader.read_u16::<BigEndian>() {
        if matches!(signature, HFS_SIGNATURE | HFS_PLUS_SIGNATURE | HFSX_SIGNATURE) {
            let length_bytes = stream_len(reader)?;
            return Ok(vec![PartitionInfo {
                start_offset: 0,
                length_bytes,
                partition_type: "bare volume".into(),
                name: String::new(),
                is_hfs_candidate: true,
            }]);
        }
    }

    reader.seek(SeekFrom::Start(0))?;
    let ddm_signature = reader.read_u16::<BigEndian>()?;
    if ddm_signature != DRIVER_DESCRIPTOR_SIGNATURE {
        return Ok(Vec::new());
    }

    let mut partitions = Vec::new();
    let mut map_entry_count: Option<u32> = None;
    let mut entry_number = 1u64;

    loop {
        let entry_offset = entry_number * ISO_STANDARD_BLOCK_SIZE;
        reader.seek(SeekFrom::Start(entry_offset))?;
        let mut header = [0u8; 4];
        if reader.read_exact(&mut header).is_err() {
            break;
        }
        let signature = u16::from_be_bytes([header[0], header[1]]);
        if signature != PARTITION_MAP_SIGNATURE {
            break;
        }
        let _reserved = u16::from_be_bytes([header[2], header[3]]);
        let map_block_count = reader.read_u32::<BigEndian>()?;
        let physical_start = reader.read_u32::<BigEndian>()? as u64;
        let block_count = reader.read_u32::<BigEndian>()? as u64;

        let mut name_buf = [0u8; 32];
        reader.read_exact(&mut name_buf)?;
        let mut type_buf = [0u8; 32];
        reader.read_exact(&mut type_buf)?;

        let name = pascal_ish_cstr(&name_buf);
        let partition_type = pascal_ish_cstr(&type_buf);
        let is_hfs_candidate = partition_type.eq_ignore_ascii_case("Apple_HFS");

        partitions.push(PartitionInfo {
            start_offset: physical_start * ISO_STANDARD_BLOCK_SIZE,
            length_bytes: block_count * ISO_STANDARD_BLOCK_SIZE,
            partition_type,
            name,
            is_hfs_candidate,
        });

        map_entry_count.get_or_insert(map_block_count);
        entry_number += 1;
        if entry_number > map_entry_count.unwrap_or(1) as u64 {
            break;
        }
    }

    Ok(partitions)
}

fn stream_len<R: Read + Seek>(reader: &mut R) -> Result<u64> {
    let current = reader.stream_position()?;
    let len = reader.seek(SeekFrom::End(0))?;
    reader.seek(SeekFrom::Start(current))?;
    Ok(len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn bare_volume_yields_single_zero_offset_partition() {
        let mut data = vec![0u8; 2048];
        data[VOLUME_HEADER_OFFSET as usize] = 0x48; // 'H'
        data[VOLUME_HEADER_OFFSET as usize + 1] = 0x2B; // '+'
        let mut cursor = Cursor::new(data);
        let partitions = probe(&mut cursor).unwrap();
        assert_eq!(partitions.len(), 1);
        assert_eq!(partitions[0].start_offset, 0);
        assert!(partitions[0].is_hfs_candidate);
    }

    #[test]
    fn image_with_neither_signature_yields_no_partitions() {
        let data = vec![0u8; 2048];
        let mut cursor = Cursor::new(data);
        let partitions = probe(&mut cursor).unwrap();
        assert!(partitions.is_empty());
    }
}
