//! Read-only access to a B*-tree stored in a volume fork: header parsing,
//! key search, and the two well-specified traversal orders (leaf-chain scan
//! and breadth-first walk).
//!
//! A linear "fast enumeration" of every node-sized slot in the fork --
//! walking the file byte-for-byte regardless of whether each slot holds a
//! live node -- is deliberately not implemented here. It is only useful for
//! best-effort recovery of an index no other structure still points to,
//! which this converter never needs: every tree it reads is walked from a
//! header it already trusts.

use byteorder::{BigEndian, ReadBytesExt};
use std::io::{Cursor, Read, Seek, SeekFrom};

use crate::btree::node::{self, BTreeNode, NodeKind};
use crate::error::{Error, Result};
use crate::extents::ForkData;

/// The header record stored in record 0 of a B*-tree's header node.
#[derive(Debug, Clone)]
pub struct BTreeHeaderRecord {
    pub tree_depth: u16,
    pub root_node: u32,
    pub leaf_records: u32,
    pub first_leaf_node: u32,
    pub last_leaf_node: u32,
    pub node_size: u16,
    pub max_key_length: u16,
    pub total_nodes: u32,
    pub free_nodes: u32,
    pub key_compare_type: u32,
    pub attributes: u32,
    /// Fork data used to translate node numbers to byte offsets.
    pub fork: ForkData,
    pub block_size: u32,
}

impl BTreeHeaderRecord {
    /// Nodes the fork has room for, irrespective of how many are actually
    /// reachable from the root (`fork length / node size`).
    pub fn potential_node_count(&self) -> u64 {
        if self.node_size == 0 {
            return 0;
        }
        self.fork.logical_size / self.node_size as u64
    }

    /// Nodes actually in use: total minus free, per the header's own count.
    pub fn live_node_count(&self) -> u64 {
        (self.total_nodes.saturating_sub(self.free_nodes)) as u64
    }
}

pub fn read_btree_header<R: Read + Seek>(reader: &mut R, fork: &ForkData, block_size: u32) -> Result<BTreeHeaderRecord> {
    let node_data = read_raw_node(reader, fork, block_size, 0, 512)?;
    let mut cursor = Cursor::new(&node_data);

    let desc = node::parse_node_descriptor(&mut cursor)?;
    if desc.kind()? != NodeKind::Header {
        return Err(Error::MalformedSource(format!("expected header node, got kind {}", desc.kind)));
    }

    let tree_depth = cursor.read_u16::<BigEndian>()?;
    let root_node = cursor.read_u32::<BigEndian>()?;
    let leaf_records = cursor.read_u32::<BigEndian>()?;
    let first_leaf_node = cursor.read_u32::<BigEndian>()?;
    let last_leaf_node = cursor.read_u32::<BigEndian>()?;
    let node_size = cursor.read_u16::<BigEndian>()?;
    let max_key_length = cursor.read_u16::<BigEndian>()?;
    let total_nodes = cursor.read_u32::<BigEndian>()?;
    let free_nodes = cursor.read_u32::<BigEndian>()?;
    let _reserved = cursor.read_u16::<BigEndian>()?;
    let _clump_size = cursor.read_u32::<BigEndian>()?;
    let _btree_type = cursor.read_u8()?;
    let key_compare_type = cursor.read_u8()? as u32;
    let attributes = cursor.read_u32::<BigEndian>()?;

    Ok(BTreeHeaderRecord {
        tree_depth,
        root_node,
        leaf_records,
        first_leaf_node,
        last_leaf_node,
        node_size,
        max_key_length,
        total_nodes,
        free_nodes,
        key_compare_type,
        attributes,
        fork: fork.clone(),
        block_size,
    })
}

fn read_raw_node<R: Read + Seek>(reader: &mut R, fork: &ForkData, block_size: u32, node_number: u32, read_size: u16) -> Result<Vec<u8>> {
    let byte_offset = compute_fork_offset(fork, block_size, node_number as u64 * read_size as u64)?;
    reader.seek(SeekFrom::Start(byte_offset))?;
    let mut buf = vec![0u8; read_size as usize];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

pub fn read_node<R: Read + Seek>(reader: &mut R, btree_header: &BTreeHeaderRecord, node_number: u32) -> Result<BTreeNode> {
    let node_size = btree_header.node_size;
    let byte_offset_in_fork = node_number as u64 * node_size as u64;
    let byte_offset = compute_fork_offset(&btree_header.fork, btree_header.block_size, byte_offset_in_fork)?;

    reader.seek(SeekFrom::Start(byte_offset))?;
    let mut data = vec![0u8; node_size as usize];
    reader.read_exact(&mut data)?;
    BTreeNode::parse(data)
}

/// Walk a fork's extent descriptors to find the absolute byte offset for
/// a given byte offset inside the fork.
pub fn compute_fork_offset(fork: &ForkData, block_size: u32, offset_in_fork: u64) -> Result<u64> {
    let block_size = block_size as u64;
    let mut remaining = offset_in_fork;

    for extent in &fork.extents {
        if extent.block_count == 0 {
            break;
        }
        let extent_bytes = extent.block_count as u64 * block_size;
        if remaining < extent_bytes {
            let block_within_extent = remaining / block_size;
            let offset_within_block = remaining % block_size;
            let absolute_block = extent.start_block as u64 + block_within_extent;
            return Ok(absolute_block * block_size + offset_within_block);
        }
        remaining -= extent_bytes;
    }

    Err(Error::MalformedSource(format!("fork offset {offset_in_fork} exceeds extent capacity")))
}

/// Search a B*-tree for a key via index descent; `compare_key` orders raw
/// record bytes relative to the search key.
pub fn search_btree<R, F>(reader: &mut R, btree_header: &BTreeHeaderRecord, compare_key: &F) -> Result<Option<(BTreeNode, usize)>>
where
    R: Read + Seek,
    F: Fn(&[u8]) -> std::cmp::Ordering,
{
    if btree_header.root_node == 0 {
        return Ok(None);
    }

    let mut current_node_num = btree_header.root_node;

    loop {
        let node = read_node(reader, btree_header, current_node_num)?;

        match node.descriptor.kind()? {
            NodeKind::Leaf => {
                for i in 0..node.descriptor.num_records as usize {
                    let record_data = node.record_data(i)?;
                    match compare_key(record_data) {
                        std::cmp::Ordering::Equal => return Ok(Some((node, i))),
                        std::cmp::Ordering::Greater => return Ok(None),
                        std::cmp::Ordering::Less => continue,
                    }
                }
                return Ok(None);
            }
            NodeKind::Index => {
                let mut child_node = 0u32;
                let mut found = false;

                for i in 0..node.descriptor.num_records as usize {
                    let record_data = node.record_data(i)?;
                    match compare_key(record_data) {
                        std::cmp::Ordering::Less | std::cmp::Ordering::Equal => {
                            child_node = node::extract_index_child(record_data)?;
                            found = true;
                        }
                        std::cmp::Ordering::Greater => break,
                    }
                }

                if !found {
                    return Ok(None);
                }
                current_node_num = child_node;
            }
            other => return Err(Error::MalformedSource(format!("unexpected node kind {other} during search"))),
        }
    }
}

/// Scan leaf nodes from `start_node` forward along the sibling chain.
/// `match_fn` returns `Some(true)` to include a record, `Some(false)` to
/// skip it and keep scanning, or `None` to stop (the remainder of the
/// chain cannot match either, given key-sorted order).
pub fn scan_leaves<R, F, T, P>(reader: &mut R, btree_header: &BTreeHeaderRecord, start_node: u32, match_fn: &F, parse_fn: &P) -> Result<Vec<T>>
where
    R: Read + Seek,
    F: Fn(&[u8]) -> Option<bool>,
    P: Fn(&[u8]) -> Result<T>,
{
    let mut results = Vec::new();
    let mut current_node_num = start_node;

    while current_node_num != 0 {
        let node = read_node(reader, btree_header, current_node_num)?;
        if node.descriptor.kind()? != NodeKind::Leaf {
            return Err(Error::MalformedSource(format!("expected leaf node, got kind {}", node.descriptor.kind)));
        }

        for i in 0..node.descriptor.num_records as usize {
            let record_data = node.record_data(i)?;
            match match_fn(record_data) {
                Some(true) => results.push(parse_fn(record_data)?),
                Some(false) => continue,
                None => return Ok(results),
            }
        }

        current_node_num = node.descriptor.forward_link;
    }

    Ok(results)
}

/// Walk every leaf node from the header's `first_leaf_node` to the end of
/// the sibling chain, calling `visit` with each record's raw bytes.
pub fn walk_leaf_nodes<R, V>(reader: &mut R, btree_header: &BTreeHeaderRecord, mut visit: V) -> Result<()>
where
    R: Read + Seek,
    V: FnMut(&[u8]) -> Result<()>,
{
    let mut current_node_num = btree_header.first_leaf_node;
    while current_node_num != 0 {
        let node = read_node(reader, btree_header, current_node_num)?;
        for i in 0..node.descriptor.num_records as usize {
            visit(node.record_data(i)?)?;
        }
        current_node_num = node.descriptor.forward_link;
    }
    Ok(())
}

fn bitmap_bit_is_set(bitmap: &[u8], index: usize) -> bool {
    let byte = index / 8;
    byte < bitmap.len() && bitmap[byte] & (0x80 >> (index % 8)) != 0
}

/// Consult the tree's composite node-allocation bitmap -- the header
/// node's record 2 plus any map nodes chained off the header's own
/// `fLink` -- and answer whether `node_index` is marked allocated.
///
/// Mirrors `isNodeAllocatedAtIndex`: the header's map record covers the
/// low end of the node range; once a tree outgrows it, further bits live
/// in map nodes linked forward from the header, one bitmap record each.
pub fn is_node_allocated<R: Read + Seek>(reader: &mut R, btree_header: &BTreeHeaderRecord, node_index: u32) -> Result<bool> {
    let header_node = read_node(reader, btree_header, 0)?;
    if header_node.descriptor.kind()? != NodeKind::Header {
        return Err(Error::MalformedSource("node 0 is not a header node".into()));
    }

    let map_record = header_node.record_data(2)?;
    let mut bit_offset = node_index as usize;
    let header_bits = map_record.len() * 8;
    if bit_offset < header_bits {
        return Ok(bitmap_bit_is_set(map_record, bit_offset));
    }
    bit_offset -= header_bits;

    let mut next_map_node = header_node.descriptor.forward_link;
    while next_map_node != 0 {
        let map_node = read_node(reader, btree_header, next_map_node)?;
        if map_node.descriptor.kind()? != NodeKind::Map {
            return Err(Error::MalformedSource(format!("expected map node in fLink chain, got kind {}", map_node.descriptor.kind)));
        }
        let record = map_node.record_data(0)?;
        let record_bits = record.len() * 8;
        if bit_offset < record_bits {
            return Ok(bitmap_bit_is_set(record, bit_offset));
        }
        bit_offset -= record_bits;
        next_map_node = map_node.descriptor.forward_link;
    }

    Ok(false)
}

/// Walk the whole tree breadth-first starting at the root, calling `visit`
/// with each node's number and parsed descriptor kind. Useful for
/// structural analysis (`analyze`) and the consistency checker, which need
/// to see index nodes too, not just leaves.
pub fn walk_breadth_first<R, V>(reader: &mut R, btree_header: &BTreeHeaderRecord, mut visit: V) -> Result<()>
where
    R: Read + Seek,
    V: FnMut(u32, &BTreeNode) -> Result<()>,
{
    if btree_header.root_node == 0 {
        return Ok(());
    }

    let mut queue = std::collections::VecDeque::new();
    queue.push_back(btree_header.root_node);

    while let Some(node_num) = queue.pop_front() {
        let node = read_node(reader, btree_header, node_num)?;
        if node.descriptor.kind()? == NodeKind::Index {
            for i in 0..node.descriptor.num_records as usize {
                let record_data = node.record_data(i)?;
                queue.push_back(node::extract_index_child(record_data)?);
            }
        }
        visit(node_num, &node)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extents::ExtentDescriptor;

    fn single_extent_fork(start_block: u32, block_count: u32, logical_size: u64) -> ForkData {
        let mut extents = [ExtentDescriptor::default(); 8];
        extents[0] = ExtentDescriptor { start_block, block_count };
        ForkData { logical_size, clump_size: 0, total_blocks: block_count, extents }
    }

    #[test]
    fn compute_fork_offset_finds_byte_inside_first_extent() {
        let fork = single_extent_fork(10, 4, 4096);
        let offset = compute_fork_offset(&fork, 512, 600).unwrap();
        assert_eq!(offset, 10 * 512 + 600);
    }

    #[test]
    fn compute_fork_offset_crosses_into_a_later_extent() {
        let mut extents = [ExtentDescriptor::default(); 8];
        extents[0] = ExtentDescriptor { start_block: 0, block_count: 2 };
        extents[1] = ExtentDescriptor { start_block: 100, block_count: 2 };
        let fork = ForkData { logical_size: 2048, clump_size: 0, total_blocks: 4, extents };

        // Byte 1024 is the first byte of the third block (index 2), which
        // falls in the second extent, 0-relative within it.
        let offset = compute_fork_offset(&fork, 512, 1024).unwrap();
        assert_eq!(offset, 100 * 512);
    }

    #[test]
    fn compute_fork_offset_beyond_every_extent_errors() {
        let fork = single_extent_fork(0, 1, 512);
        assert!(compute_fork_offset(&fork, 512, 4096).is_err());
    }

    /// Builds an in-memory volume fork consisting of a header node (node 0)
    /// and a single leaf node (node 1), both `node_size` bytes, addressed
    /// through one inline extent starting at block 0 with a 1:1 block-to-node
    /// mapping (`block_size == node_size`) -- the simplest layout the reader
    /// accepts. `node_size` is pinned to 512, the minimum
    /// `read_btree_header` ever reads for the header node regardless of the
    /// tree's real node size.
    struct TestTree {
        cursor: std::io::Cursor<Vec<u8>>,
        header: BTreeHeaderRecord,
    }

    fn build_test_tree(leaf_records: &[&[u8]]) -> TestTree {
        let node_size: u16 = 512;
        let mut leaf = vec![0u8; node_size as usize];

        let mut cursor_pos = 0usize;
        let mut offsets = vec![0u16];
        for rec in leaf_records {
            leaf[cursor_pos..cursor_pos + rec.len()].copy_from_slice(rec);
            cursor_pos += rec.len();
            offsets.push(cursor_pos as u16);
        }
        let free_boundary = cursor_pos as u16;
        let desc = node::NodeDescriptor { forward_link: 0, backward_link: 0, kind: node::NODE_KIND_LEAF, height: 1, num_records: leaf_records.len() as u16, reserved: 0 };
        {
            let mut header_slice = &mut leaf[0..14];
            desc.write(&mut header_slice).unwrap();
        }
        // Offset stack, descending from the tail: each record start, then
        // the free-space boundary last.
        let mut all_offsets = offsets.clone();
        *all_offsets.last_mut().unwrap() = free_boundary;
        for (i, off) in all_offsets.iter().enumerate() {
            let pos = node_size as usize - (i + 1) * 2;
            leaf[pos..pos + 2].copy_from_slice(&off.to_be_bytes());
        }

        let mut header_node = vec![0u8; node_size as usize];
        let header_desc = node::NodeDescriptor { forward_link: 0, backward_link: 0, kind: node::NODE_KIND_HEADER, height: 0, num_records: 1, reserved: 0 };
        {
            let mut header_slice = &mut header_node[0..14];
            header_desc.write(&mut header_slice).unwrap();
        }
        {
            use byteorder::{BigEndian, WriteBytesExt};
            let mut w = &mut header_node[14..];
            w.write_u16::<BigEndian>(1).unwrap(); // tree_depth
            w.write_u32::<BigEndian>(1).unwrap(); // root_node
            w.write_u32::<BigEndian>(leaf_records.len() as u32).unwrap(); // leaf_records
            w.write_u32::<BigEndian>(1).unwrap(); // first_leaf_node
            w.write_u32::<BigEndian>(1).unwrap(); // last_leaf_node
            w.write_u16::<BigEndian>(node_size).unwrap();
            w.write_u16::<BigEndian>(64).unwrap(); // max_key_length
            w.write_u32::<BigEndian>(2).unwrap(); // total_nodes
            w.write_u32::<BigEndian>(0).unwrap(); // free_nodes
            w.write_u16::<BigEndian>(0).unwrap(); // reserved
            w.write_u32::<BigEndian>(0).unwrap(); // clump_size
            w.write_u8(0).unwrap(); // btree_type
            w.write_u8(0).unwrap(); // key_compare_type
            w.write_u32::<BigEndian>(0).unwrap(); // attributes
        }

        let mut bytes = header_node;
        bytes.extend_from_slice(&leaf);
        let block_size = node_size as u32;
        let fork = single_extent_fork(0, 2, bytes.len() as u64);

        let mut cursor = std::io::Cursor::new(bytes);
        let header = read_btree_header(&mut cursor, &fork, block_size).unwrap();
        TestTree { cursor, header }
    }

    #[test]
    fn read_btree_header_recovers_root_and_leaf_chain() {
        let tree = build_test_tree(&[b"first", b"second"]);
        assert_eq!(tree.header.root_node, 1);
        assert_eq!(tree.header.first_leaf_node, 1);
        assert_eq!(tree.header.leaf_records, 2);
        assert_eq!(tree.header.node_size, 512);
    }

    #[test]
    fn walk_leaf_nodes_visits_every_record_in_order() {
        let mut tree = build_test_tree(&[b"first", b"second"]);
        let mut seen = Vec::new();
        walk_leaf_nodes(&mut tree.cursor, &tree.header, |data| {
            seen.push(data.to_vec());
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, vec![b"first".to_vec(), b"second".to_vec()]);
    }

    #[test]
    fn search_btree_finds_the_matching_record() {
        let mut tree = build_test_tree(&[b"first", b"second"]);
        let found = search_btree(&mut tree.cursor, &tree.header, &|data: &[u8]| data.cmp(b"second".as_slice())).unwrap();
        assert!(found.is_some());
        let (node, idx) = found.unwrap();
        assert_eq!(node.record_data(idx).unwrap(), b"second");
    }

    #[test]
    fn search_btree_reports_no_match() {
        let mut tree = build_test_tree(&[b"first", b"second"]);
        let found = search_btree(&mut tree.cursor, &tree.header, &|data: &[u8]| data.cmp(b"zzz".as_slice())).unwrap();
        assert!(found.is_none());
    }

    /// Builds a single header node (node 0) with a real 3-record layout:
    /// record 0 (header fields, content unused by `is_node_allocated`),
    /// an empty record 1 (user data, unused), and `map_bitmap` as record 2.
    /// `header_forward_link` lets a test chain a further map node off it.
    fn build_header_node(map_bitmap: &[u8], header_forward_link: u32, node_size: u16) -> Vec<u8> {
        let mut data = vec![0u8; node_size as usize];
        let desc = node::NodeDescriptor { forward_link: header_forward_link, backward_link: 0, kind: node::NODE_KIND_HEADER, height: 0, num_records: 3, reserved: 0 };
        {
            let mut header_slice = &mut data[0..14];
            desc.write(&mut header_slice).unwrap();
        }
        let record0_start = 14usize;
        let record0_len = 106usize; // matches the real header record's body
        let record1_start = record0_start + record0_len;
        let record2_start = record1_start; // record 1 (user data) is empty
        let record2_end = record2_start + map_bitmap.len();
        data[record2_start..record2_end].copy_from_slice(map_bitmap);

        let offsets = [record0_start as u16, record1_start as u16, record2_start as u16, record2_end as u16];
        for (i, off) in offsets.iter().rev().enumerate() {
            let pos = node_size as usize - (i + 1) * 2;
            data[pos..pos + 2].copy_from_slice(&off.to_be_bytes());
        }
        data
    }

    fn build_map_node(map_bitmap: &[u8], forward_link: u32, node_size: u16) -> Vec<u8> {
        let mut data = vec![0u8; node_size as usize];
        let desc = node::NodeDescriptor { forward_link, backward_link: 0, kind: node::NODE_KIND_MAP, height: 0, num_records: 1, reserved: 0 };
        {
            let mut header_slice = &mut data[0..14];
            desc.write(&mut header_slice).unwrap();
        }
        let record_start = 14usize;
        let record_end = record_start + map_bitmap.len();
        data[record_start..record_end].copy_from_slice(map_bitmap);

        let offsets = [record_start as u16, record_end as u16];
        for (i, off) in offsets.iter().rev().enumerate() {
            let pos = node_size as usize - (i + 1) * 2;
            data[pos..pos + 2].copy_from_slice(&off.to_be_bytes());
        }
        data
    }

    fn header_for_bytes(bytes: Vec<u8>, node_size: u16) -> (std::io::Cursor<Vec<u8>>, BTreeHeaderRecord) {
        let fork = single_extent_fork(0, (bytes.len() / node_size as usize) as u32, bytes.len() as u64);
        let mut cursor = std::io::Cursor::new(bytes);
        let header = read_btree_header(&mut cursor, &fork, node_size as u32).unwrap();
        (cursor, header)
    }

    #[test]
    fn is_node_allocated_reads_a_bit_from_the_header_map_record() {
        // Bit 0 and bit 2 set, bit 1 clear: 0b1010_0000.
        let map_bitmap = [0b1010_0000u8];
        let node_size = 512u16;
        let bytes = build_header_node(&map_bitmap, 0, node_size);
        let (mut cursor, header) = header_for_bytes(bytes, node_size);

        assert!(is_node_allocated(&mut cursor, &header, 0).unwrap());
        assert!(!is_node_allocated(&mut cursor, &header, 1).unwrap());
        assert!(is_node_allocated(&mut cursor, &header, 2).unwrap());
    }

    #[test]
    fn is_node_allocated_falls_through_to_a_chained_map_node() {
        let node_size = 512u16;
        // Header's own map record covers bits 0..8, all clear.
        let header_bitmap = [0u8];
        // A second map node, chained via the header's fLink, covers bits
        // 8..16; bit 8 (the first bit past the header's record) is set.
        let chained_bitmap = [0b1000_0000u8];

        let mut bytes = build_header_node(&header_bitmap, 1, node_size);
        bytes.extend_from_slice(&build_map_node(&chained_bitmap, 0, node_size));
        let (mut cursor, header) = header_for_bytes(bytes, node_size);

        assert!(!is_node_allocated(&mut cursor, &header, 0).unwrap());
        assert!(is_node_allocated(&mut cursor, &header, 8).unwrap());
        assert!(!is_node_allocated(&mut cursor, &header, 9).unwrap());
    }

    #[test]
    fn is_node_allocated_returns_false_past_the_end_of_every_map_node() {
        let node_size = 512u16;
        let map_bitmap = [0xFFu8];
        let bytes = build_header_node(&map_bitmap, 0, node_size);
        let (mut cursor, header) = header_for_bytes(bytes, node_size);

        assert!(!is_node_allocated(&mut cursor, &header, 64).unwrap());
    }
}
