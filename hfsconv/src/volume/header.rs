//! Volume header parsing for both the classic HFS Master Directory Block
//! and the HFS+/HFSX Volume Header, both 512 bytes starting at the same
//! offset from the start of the partition.

use byteorder::{BigEndian, ReadBytesExt};
use std::io::{Read, Seek, SeekFrom};

use crate::error::{Error, Result};
use crate::extents::{read_extent_descriptor_be16, read_fork_data_be32, ExtentDescriptor, ForkData};

pub const VOLUME_HEADER_OFFSET: u64 = 1024;

pub const HFS_SIGNATURE: u16 = 0x4244; // 'BD'
pub const HFS_PLUS_SIGNATURE: u16 = 0x482B; // 'H+'
pub const HFSX_SIGNATURE: u16 = 0x4858; // 'HX'

pub const HFS_PLUS_VERSION: u16 = 4;
pub const HFSX_VERSION: u16 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeSignature {
    Hfs,
    HfsPlus,
    Hfsx,
}

impl VolumeSignature {
    pub fn is_binary_compare(self) -> bool {
        matches!(self, VolumeSignature::Hfsx)
    }
}

/// The classic HFS Master Directory Block, 162 bytes at offset 1024.
/// Field names follow the format's traditional `dr`-prefixed naming.
#[derive(Debug, Clone)]
pub struct HfsMasterDirectoryBlock {
    pub create_date: u32,
    pub modify_date: u32,
    pub attributes: u16,
    pub root_file_count: u16,
    pub volume_bitmap_start: u16,
    pub allocation_ptr: u16,
    pub total_allocation_blocks: u16,
    pub allocation_block_size: u32,
    pub clump_size: u32,
    pub first_allocation_block: u16,
    pub next_catalog_id: u32,
    pub free_blocks: u16,
    pub volume_name: String,
    pub backup_date: u32,
    pub write_count: u32,
    pub extents_clump_size: u32,
    pub catalog_clump_size: u32,
    pub root_dir_count: u16,
    pub file_count: u32,
    pub folder_count: u32,
    pub finder_info: [u32; 8],
    pub extents_file: ForkData,
    pub catalog_file: ForkData,
}

fn read_pascal_string<R: Read>(reader: &mut R, field_width: usize) -> Result<String> {
    let mut buf = vec![0u8; field_width];
    reader.read_exact(&mut buf)?;
    let length = buf[0] as usize;
    let length = length.min(field_width - 1);
    Ok(crate::encoding::mac_roman_to_string(&buf[1..1 + length]))
}

impl HfsMasterDirectoryBlock {
    pub fn parse<R: Read + Seek>(reader: &mut R) -> Result<Self> {
        reader.seek(SeekFrom::Start(VOLUME_HEADER_OFFSET))?;

        let signature = reader.read_u16::<BigEndian>()?;
        if signature != HFS_SIGNATURE {
            return Err(Error::InvalidSignature(signature));
        }

        let create_date = reader.read_u32::<BigEndian>()?;
        let modify_date = reader.read_u32::<BigEndian>()?;
        let attributes = reader.read_u16::<BigEndian>()?;
        let root_file_count = reader.read_u16::<BigEndian>()?;
        let volume_bitmap_start = reader.read_u16::<BigEndian>()?;
        let allocation_ptr = reader.read_u16::<BigEndian>()?;
        let total_allocation_blocks = reader.read_u16::<BigEndian>()?;
        let allocation_block_size = reader.read_u32::<BigEndian>()?;
        let clump_size = reader.read_u32::<BigEndian>()?;
        let first_allocation_block = reader.read_u16::<BigEndian>()?;
        let next_catalog_id = reader.read_u32::<BigEndian>()?;
        let free_blocks = reader.read_u16::<BigEndian>()?;
        let volume_name = read_pascal_string(reader, 28)?;
        let backup_date = reader.read_u32::<BigEndian>()?;
        let _backup_seq_num = reader.read_u16::<BigEndian>()?;
        let write_count = reader.read_u32::<BigEndian>()?;
        let extents_clump_size = reader.read_u32::<BigEndian>()?;
        let catalog_clump_size = reader.read_u32::<BigEndian>()?;
        let root_dir_count = reader.read_u16::<BigEndian>()?;
        let file_count = reader.read_u32::<BigEndian>()?;
        let folder_count = reader.read_u32::<BigEndian>()?;

        let mut finder_info = [0u32; 8];
        for fi in &mut finder_info {
            *fi = reader.read_u32::<BigEndian>()?;
        }

        let _volume_bitmap_cache_size = reader.read_u16::<BigEndian>()?;
        let _volume_common_cache_size = reader.read_u16::<BigEndian>()?;
        let _catalog_cache_size = reader.read_u16::<BigEndian>()?;

        // drXTFlSize followed directly by drXTExtRec (3 16-bit descriptors,
        // no clump size in between -- that was already consumed above as
        // drXTClpSiz/drCTClpSiz).
        let extents_file_size = reader.read_u32::<BigEndian>()? as u64;
        let mut extents_file_extents = [ExtentDescriptor::default(); 8];
        for slot in extents_file_extents.iter_mut().take(3) {
            *slot = read_extent_descriptor_be16(reader)?;
        }
        let extents_file = ForkData {
            logical_size: extents_file_size,
            clump_size: extents_clump_size,
            total_blocks: extents_file_extents.iter().map(|e| e.block_count).sum(),
            extents: extents_file_extents,
        };

        let catalog_file_size = reader.read_u32::<BigEndian>()? as u64;
        let mut catalog_file_extents = [ExtentDescriptor::default(); 8];
        for slot in catalog_file_extents.iter_mut().take(3) {
            *slot = read_extent_descriptor_be16(reader)?;
        }
        let catalog_file = ForkData {
            logical_size: catalog_file_size,
            clump_size: catalog_clump_size,
            total_blocks: catalog_file_extents.iter().map(|e| e.block_count).sum(),
            extents: catalog_file_extents,
        };

        Ok(HfsMasterDirectoryBlock {
            create_date,
            modify_date,
            attributes,
            root_file_count,
            volume_bitmap_start,
            allocation_ptr,
            total_allocation_blocks,
            allocation_block_size,
            clump_size,
            first_allocation_block,
            next_catalog_id,
            free_blocks,
            volume_name,
            backup_date,
            write_count,
            extents_clump_size,
            catalog_clump_size,
            root_dir_count,
            file_count,
            folder_count,
            finder_info,
            extents_file,
            catalog_file,
        })
    }
}

/// The HFS+/HFSX Volume Header, 512 bytes at offset 1024.
#[derive(Debug, Clone)]
pub struct VolumeHeader {
    pub signature: VolumeSignature,
    pub version: u16,
    pub attributes: u32,
    pub last_mounted_version: u32,
    pub journal_info_block: u32,
    pub create_date: u32,
    pub modify_date: u32,
    pub backup_date: u32,
    pub checked_date: u32,
    pub file_count: u32,
    pub folder_count: u32,
    pub block_size: u32,
    pub total_blocks: u32,
    pub free_blocks: u32,
    pub next_allocation: u32,
    pub rsrc_clump_size: u32,
    pub data_clump_size: u32,
    pub next_catalog_id: u32,
    pub write_count: u32,
    pub encoding_bitmap: u64,
    pub finder_info: [u32; 8],
    pub allocation_file: ForkData,
    pub extents_file: ForkData,
    pub catalog_file: ForkData,
    pub attributes_file: ForkData,
    pub startup_file: ForkData,
}

impl VolumeHeader {
    pub fn parse<R: Read + Seek>(reader: &mut R) -> Result<Self> {
        reader.seek(SeekFrom::Start(VOLUME_HEADER_OFFSET))?;

        let raw_signature = reader.read_u16::<BigEndian>()?;
        let signature = match raw_signature {
            HFS_PLUS_SIGNATURE => VolumeSignature::HfsPlus,
            HFSX_SIGNATURE => VolumeSignature::Hfsx,
            _ => return Err(Error::InvalidSignature(raw_signature)),
        };

        let version = reader.read_u16::<BigEndian>()?;
        match version {
            HFS_PLUS_VERSION | HFSX_VERSION => {}
            _ => return Err(Error::Unsupported(format!("volume header version {version}"))),
        }

        let attributes = reader.read_u32::<BigEndian>()?;
        let last_mounted_version = reader.read_u32::<BigEndian>()?;
        let journal_info_block = reader.read_u32::<BigEndian>()?;
        let create_date = reader.read_u32::<BigEndian>()?;
        let modify_date = reader.read_u32::<BigEndian>()?;
        let backup_date = reader.read_u32::<BigEndian>()?;
        let checked_date = reader.read_u32::<BigEndian>()?;
        let file_count = reader.read_u32::<BigEndian>()?;
        let folder_count = reader.read_u32::<BigEndian>()?;
        let block_size = reader.read_u32::<BigEndian>()?;
        let total_blocks = reader.read_u32::<BigEndian>()?;
        let free_blocks = reader.read_u32::<BigEndian>()?;
        let next_allocation = reader.read_u32::<BigEndian>()?;
        let rsrc_clump_size = reader.read_u32::<BigEndian>()?;
        let data_clump_size = reader.read_u32::<BigEndian>()?;
        let next_catalog_id = reader.read_u32::<BigEndian>()?;
        let write_count = reader.read_u32::<BigEndian>()?;
        let encoding_bitmap = reader.read_u64::<BigEndian>()?;

        let mut finder_info = [0u32; 8];
        for fi in &mut finder_info {
            *fi = reader.read_u32::<BigEndian>()?;
        }

        let allocation_file = read_fork_data_be32(reader)?;
        let extents_file = read_fork_data_be32(reader)?;
        let catalog_file = read_fork_data_be32(reader)?;
        let attributes_file = read_fork_data_be32(reader)?;
        let startup_file = read_fork_data_be32(reader)?;

        Ok(VolumeHeader {
            signature,
            version,
            attributes,
            last_mounted_version,
            journal_info_block,
            create_date,
            modify_date,
            backup_date,
            checked_date,
            file_count,
            folder_count,
            block_size,
            total_blocks,
            free_blocks,
            next_allocation,
            rsrc_clump_size,
            data_clump_size,
            next_catalog_id,
            write_count,
            encoding_bitmap,
            finder_info,
            allocation_file,
            extents_file,
            catalog_file,
            attributes_file,
            startup_file,
        })
    }

    pub fn is_binary_compare(&self) -> bool {
        self.signature.is_binary_compare()
    }
}
