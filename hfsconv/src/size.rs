//! Byte-order and size arithmetic shared by the B*-tree engine, the volume
//! readers, and the destination volume writer.

/// The fixed 512-byte sector size every HFS/HFS+ structure is laid out against,
/// independent of the volume's allocation block size.
pub const ISO_STANDARD_BLOCK_SIZE: u64 = 512;

/// Round `size` up to the next multiple of `unit`. `unit` must be nonzero.
pub fn next_multiple_of_size(size: u64, unit: u64) -> u64 {
    debug_assert!(unit > 0);
    size.div_ceil(unit) * unit
}

/// Integer ceiling division.
pub fn ceiling_divide(numerator: u64, denominator: u64) -> u64 {
    numerator.div_ceil(denominator)
}

/// Number of allocation blocks needed to hold `byte_count` bytes.
pub fn blocks_for_bytes(byte_count: u64, block_size: u32) -> u64 {
    ceiling_divide(byte_count, block_size as u64)
}

/// Total allocation blocks spanned by an extent record, stopping at the
/// first empty descriptor (blockCount == 0) as the on-disk format requires.
pub fn blocks_in_extent_record(block_counts: &[u32]) -> u64 {
    block_counts
        .iter()
        .take_while(|&&c| c != 0)
        .map(|&c| c as u64)
        .sum()
}

/// The smallest power-of-two allocation block size (minimum 512) large
/// enough that a volume of `volume_length_bytes` fits within HFS+'s 32-bit
/// allocation block count (`size * 2^32 >= volumeBytes`).
pub fn optimal_allocation_block_size_for_volume_length(volume_length_bytes: u64) -> u32 {
    let mut candidate: u64 = 512;
    while candidate * (1u64 << 32) < volume_length_bytes {
        candidate *= 2;
    }
    candidate as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn optimal_block_size_stays_at_minimum_for_small_volumes() {
        assert_eq!(optimal_allocation_block_size_for_volume_length(800 * 1024), 512);
    }

    #[test]
    fn optimal_block_size_grows_for_volumes_past_2_32_sectors() {
        let huge = (512u64 * (1u64 << 32)) + 1;
        assert_eq!(optimal_allocation_block_size_for_volume_length(huge), 1024);
    }
}
