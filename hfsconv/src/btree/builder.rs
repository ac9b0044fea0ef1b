//! Bottom-up B*-tree construction for the destination volume.
//!
//! The converter never inserts into a tree one record at a time -- every
//! destination catalog and extents-overflow tree is built once, from a
//! source already walked and materialized in memory. That lets the builder
//! skip incremental insertion and node-splitting entirely: sort the
//! records by key, pack them into leaf nodes back to front, then build
//! successive index levels over the leaves until one root remains. This
//! mirrors the append-only cursor the original conversion tool drives
//! during a bulk rebuild, just without the cursor object itself.

use byteorder::{BigEndian, WriteBytesExt};

use crate::btree::node::{NodeDescriptor, NODE_KIND_HEADER, NODE_KIND_INDEX, NODE_KIND_LEAF, NODE_KIND_MAP};
use crate::error::{Error, Result};

/// A built tree's header fields, ready to be copied into a catalog or
/// extents-overflow file's `BTreeHeaderRecord` on the destination volume.
#[derive(Debug, Clone)]
pub struct BuiltBTreeHeader {
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
}

/// A fully serialized B*-tree, node 0 through `total_nodes - 1`, ready to
/// be written into a fork's allocated blocks.
pub struct BuiltBTree {
    pub header: BuiltBTreeHeader,
    pub node_bytes: Vec<u8>,
}

fn pad_to_even(buf: &mut Vec<u8>) {
    if !buf.len().is_multiple_of(2) {
        buf.push(0);
    }
}

/// Build a leaf record: `[key_len:u16][key bytes, even-padded][payload]`,
/// the whole thing even-padded again so every record starts at an even
/// offset, per HFS+ convention.
fn encode_leaf_record(key: &[u8], payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + key.len() + payload.len() + 2);
    out.write_u16::<BigEndian>(key.len() as u16).unwrap();
    out.extend_from_slice(key);
    pad_to_even(&mut out);
    out.extend_from_slice(payload);
    pad_to_even(&mut out);
    out
}

fn encode_index_record(key: &[u8], child_node: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + key.len() + 4);
    out.write_u16::<BigEndian>(key.len() as u16).unwrap();
    out.extend_from_slice(key);
    pad_to_even(&mut out);
    out.write_u32::<BigEndian>(child_node).unwrap();
    out
}

/// Pack a sequence of already-encoded records into as few nodes as
/// possible, respecting `node_size`. Each node reserves 14 bytes for its
/// descriptor and `(n+1) * 2` bytes for the offset table.
///
/// `fill_ratio` caps how full each node is allowed to get before a new one
/// is started: 1.0 packs nodes as tightly as possible (used for index
/// nodes and the extents overflow tree), while catalog leaves use a softer
/// ratio to leave slack for subsequent inserts, mirroring the density a
/// real volume's catalog tree is written at.
fn pack_records(records: &[Vec<u8>], node_size: u16, kind: u8, fill_ratio: f32) -> Vec<(Vec<u8>, usize)> {
    const DESCRIPTOR_SIZE: usize = 14;
    let node_size = node_size as usize;
    let usable = ((node_size as f32) * fill_ratio).floor() as usize;
    let mut nodes = Vec::new();
    let mut current: Vec<&Vec<u8>> = Vec::new();
    let mut current_bytes = DESCRIPTOR_SIZE + 2; // +1 offset slot for free space

    for record in records {
        let additional = record.len() + 2;
        if !current.is_empty() && current_bytes + additional > usable {
            nodes.push(finalize_node(&current, node_size, kind));
            current.clear();
            current_bytes = DESCRIPTOR_SIZE + 2;
        }
        current.push(record);
        current_bytes += additional;
    }
    if !current.is_empty() || nodes.is_empty() {
        nodes.push(finalize_node(&current, node_size, kind));
    }
    nodes
}

fn finalize_node(records: &[&Vec<u8>], node_size: usize, kind: u8) -> (Vec<u8>, usize) {
    let mut data = vec![0u8; node_size];
    let descriptor = NodeDescriptor {
        forward_link: 0,
        backward_link: 0,
        kind,
        height: 0,
        num_records: records.len() as u16,
        reserved: 0,
    };
    {
        let mut head = &mut data[0..14];
        descriptor.write(&mut head).expect("writing into a fixed-size slice cannot fail");
    }

    let mut offset = 14usize;
    let mut record_offsets = Vec::with_capacity(records.len() + 1);
    for record in records {
        record_offsets.push(offset as u16);
        data[offset..offset + record.len()].copy_from_slice(record);
        offset += record.len();
    }
    record_offsets.push(offset as u16);

    for (i, off) in record_offsets.iter().rev().enumerate() {
        let pos = node_size - (i + 1) * 2;
        data[pos..pos + 2].copy_from_slice(&off.to_be_bytes());
    }

    (data, records.len())
}

fn link_siblings(nodes: &mut [Vec<u8>], base_node_number: u32) {
    let count = nodes.len();
    for (i, node) in nodes.iter_mut().enumerate() {
        let forward = if i + 1 < count { base_node_number + i as u32 + 1 } else { 0 };
        let backward = if i > 0 { base_node_number + i as u32 - 1 } else { 0 };
        node[0..4].copy_from_slice(&forward.to_be_bytes());
        node[4..8].copy_from_slice(&backward.to_be_bytes());
    }
}

/// Build a complete B*-tree from `(key, payload)` pairs already sorted in
/// ascending key order by the caller (the catalog builder and extents
/// builder both produce their records pre-sorted, since they derive order
/// from data already organized that way).
pub fn build_btree(
    sorted_records: &[(Vec<u8>, Vec<u8>)],
    node_size: u16,
    max_key_length: u16,
    key_compare_type: u32,
    attributes: u32,
) -> Result<BuiltBTree> {
    build_btree_with_leaf_fill(sorted_records, node_size, max_key_length, key_compare_type, attributes, 1.0)
}

/// Result of laying out every leaf and index node at a given base node
/// number (everything after the header and its map-node chain).
struct Levels {
    leaf_nodes: Vec<Vec<u8>>,
    index_levels: Vec<Vec<Vec<u8>>>,
    tree_depth: u16,
    root_node: u32,
    first_leaf_node: u32,
    last_leaf_node: u32,
}

/// Pack leaf records and build successive index levels over them, with
/// every sibling link and index child pointer numbered starting at
/// `base_node_number`. Run twice by the caller: once with a provisional
/// base just to count nodes, once more with the real base once the number
/// of map nodes needed is known (see [`build_btree_with_leaf_fill`]).
fn build_levels(leaf_records: &[Vec<u8>], node_size: u16, leaf_fill_ratio: f32, base_node_number: u32) -> Levels {
    let leaf_nodes_with_counts = if leaf_records.is_empty() {
        Vec::new()
    } else {
        pack_records(leaf_records, node_size, NODE_KIND_LEAF, leaf_fill_ratio)
    };
    let leaf_count = leaf_nodes_with_counts.len() as u32;
    let mut leaf_nodes: Vec<Vec<u8>> = leaf_nodes_with_counts.iter().map(|(d, _)| d.clone()).collect();
    if !leaf_nodes.is_empty() {
        link_siblings(&mut leaf_nodes, base_node_number);
    }

    let mut level_first_keys: Vec<Vec<u8>> = Vec::new();
    let mut level_node_numbers: Vec<u32> = Vec::new();
    for (i, node) in leaf_nodes.iter().enumerate() {
        level_first_keys.push(first_key_of_node(node));
        level_node_numbers.push(base_node_number + i as u32);
    }

    let mut index_levels: Vec<Vec<Vec<u8>>> = Vec::new();
    let mut tree_depth: u16 = if leaf_nodes.is_empty() { 0 } else { 1 };
    let mut next_node_number = base_node_number + leaf_count;
    let mut root_node = if leaf_nodes.len() == 1 { base_node_number } else { 0 };

    while level_node_numbers.len() > 1 {
        let index_records: Vec<Vec<u8>> = level_first_keys
            .iter()
            .zip(level_node_numbers.iter())
            .map(|(key, child)| encode_index_record(key, *child))
            .collect();
        let packed = pack_records(&index_records, node_size, NODE_KIND_INDEX, 1.0);
        let mut nodes: Vec<Vec<u8>> = packed.iter().map(|(d, _)| d.clone()).collect();
        link_siblings(&mut nodes, next_node_number);

        let mut new_first_keys = Vec::new();
        let mut new_node_numbers = Vec::new();
        for (i, node) in nodes.iter().enumerate() {
            new_first_keys.push(first_key_of_node(node));
            new_node_numbers.push(next_node_number + i as u32);
        }

        let is_root_level = nodes.len() == 1;
        next_node_number += nodes.len() as u32;
        tree_depth += 1;
        if is_root_level {
            root_node = new_node_numbers[0];
        }

        index_levels.push(nodes);
        level_first_keys = new_first_keys;
        level_node_numbers = new_node_numbers;

        if is_root_level {
            break;
        }
    }

    Levels {
        leaf_nodes,
        index_levels,
        tree_depth,
        root_node,
        first_leaf_node: if leaf_count > 0 { base_node_number } else { 0 },
        last_leaf_node: if leaf_count > 0 { base_node_number + leaf_count - 1 } else { 0 },
    }
}

fn tree_node_count(levels: &Levels) -> u32 {
    let index_count: usize = levels.index_levels.iter().map(|l| l.len()).sum();
    (levels.leaf_nodes.len() + index_count) as u32
}

/// Like [`build_btree`], but packs leaf nodes to at most `leaf_fill_ratio`
/// of capacity before starting a new one. The catalog builder uses 0.75 to
/// leave room for later inserts; everything else uses 1.0 (full packing).
pub fn build_btree_with_leaf_fill(
    sorted_records: &[(Vec<u8>, Vec<u8>)],
    node_size: u16,
    max_key_length: u16,
    key_compare_type: u32,
    attributes: u32,
    leaf_fill_ratio: f32,
) -> Result<BuiltBTree> {
    if node_size < 512 {
        return Err(Error::Unsupported(format!("B*-tree node size {node_size} is smaller than the minimum 512 bytes")));
    }

    let leaf_records: Vec<Vec<u8>> = sorted_records.iter().map(|(k, v)| encode_leaf_record(k, v)).collect();
    let total_leaf_records: u32 = leaf_records.len() as u32;

    // Node 0 is always the header. It is followed by a chain of one or
    // more map nodes -- at least one, mirroring a real volume's layout,
    // plus however many more are needed once the tree has grown past what
    // the header's own 1024-bit map record and a single map node can
    // represent (see `map_node_pages_needed`). The tree proper (leaves,
    // then index levels) starts right after that chain.
    //
    // The map-node count depends on `total_nodes`, which depends on the
    // tree's node count, which does not depend on numbering -- so lay the
    // tree out once with a provisional base to count nodes, settle on the
    // final map-node count, then lay it out again with the real base.
    let provisional = build_levels(&leaf_records, node_size, leaf_fill_ratio, 1);
    let total_tree_nodes = tree_node_count(&provisional);

    let mut num_map_nodes = 1u32;
    loop {
        let total_nodes = 1 + num_map_nodes + total_tree_nodes;
        let needed = map_node_pages_needed(total_nodes, node_size);
        if needed == num_map_nodes {
            break;
        }
        num_map_nodes = needed;
    }

    let header_and_map_count = 1 + num_map_nodes;
    let levels = build_levels(&leaf_records, node_size, leaf_fill_ratio, header_and_map_count);
    debug_assert_eq!(tree_node_count(&levels), total_tree_nodes, "renumbering must not change node counts");

    let mut all_nodes: Vec<Vec<u8>> = Vec::new();
    all_nodes.extend(levels.leaf_nodes);
    for level in &levels.index_levels {
        all_nodes.extend(level.clone());
    }

    let total_nodes = header_and_map_count + total_tree_nodes;

    let header_node = build_header_node(
        node_size,
        levels.tree_depth,
        levels.root_node,
        total_leaf_records,
        levels.first_leaf_node,
        levels.last_leaf_node,
        max_key_length,
        total_nodes,
        key_compare_type,
        attributes,
        num_map_nodes > 0,
    );
    let map_nodes = build_map_nodes(node_size, total_nodes, num_map_nodes, 1);

    let mut node_bytes = Vec::with_capacity(total_nodes as usize * node_size as usize);
    node_bytes.extend_from_slice(&header_node);
    for map_node in &map_nodes {
        node_bytes.extend_from_slice(map_node);
    }
    for node in &all_nodes {
        node_bytes.extend_from_slice(node);
    }

    Ok(BuiltBTree {
        header: BuiltBTreeHeader {
            tree_depth: levels.tree_depth,
            root_node: levels.root_node,
            leaf_records: total_leaf_records,
            first_leaf_node: levels.first_leaf_node,
            last_leaf_node: levels.last_leaf_node,
            node_size,
            max_key_length,
            total_nodes,
            free_nodes: 0,
            key_compare_type,
            attributes,
        },
        node_bytes,
    })
}

fn first_key_of_node(node: &[u8]) -> Vec<u8> {
    let num_records = u16::from_be_bytes([node[10], node[11]]) as usize;
    debug_assert!(num_records > 0, "an empty node cannot contribute an index key");
    let node_size = node.len();
    // Offset table: record_offsets[0..=num_records], stored descending from the tail.
    let first_offset_pos = node_size - (num_records + 1) * 2;
    let start = u16::from_be_bytes([node[first_offset_pos], node[first_offset_pos + 1]]) as usize;
    let key_len = u16::from_be_bytes([node[start], node[start + 1]]) as usize;
    node[start + 2..start + 2 + key_len].to_vec()
}

#[allow(clippy::too_many_arguments)]
fn build_header_node(
    node_size: u16,
    tree_depth: u16,
    root_node: u32,
    leaf_records: u32,
    first_leaf_node: u32,
    last_leaf_node: u32,
    max_key_length: u16,
    total_nodes: u32,
    key_compare_type: u32,
    attributes: u32,
    has_map_chain: bool,
) -> Vec<u8> {
    let mut data = vec![0u8; node_size as usize];
    // `forward_link` doubles as the map-node chain head: node 1, right
    // after the header, is always the first chained map node when one
    // exists.
    let forward_link = if has_map_chain { 1 } else { 0 };
    let descriptor = NodeDescriptor { forward_link, backward_link: 0, kind: NODE_KIND_HEADER, height: 0, num_records: 3, reserved: 0 };
    {
        let mut head = &mut data[0..14];
        descriptor.write(&mut head).unwrap();
    }

    let mut body = Vec::with_capacity(106);
    body.write_u16::<BigEndian>(tree_depth).unwrap();
    body.write_u32::<BigEndian>(root_node).unwrap();
    body.write_u32::<BigEndian>(leaf_records).unwrap();
    body.write_u32::<BigEndian>(first_leaf_node).unwrap();
    body.write_u32::<BigEndian>(last_leaf_node).unwrap();
    body.write_u16::<BigEndian>(node_size).unwrap();
    body.write_u16::<BigEndian>(max_key_length).unwrap();
    body.write_u32::<BigEndian>(total_nodes).unwrap();
    body.write_u32::<BigEndian>(0u32).unwrap(); // free_nodes: built exactly full
    body.write_u16::<BigEndian>(0).unwrap(); // reserved1
    body.write_u32::<BigEndian>(0).unwrap(); // clump_size
    body.write_u8(0).unwrap(); // btree_type
    body.write_u8(key_compare_type as u8).unwrap();
    body.write_u32::<BigEndian>(attributes).unwrap();
    body.extend_from_slice(&[0u8; 64]); // reserved3[16]

    data[14..14 + body.len()].copy_from_slice(&body);

    // Record offsets: record0 (header record) at 14, record1 (user data,
    // unused) right after, record2 (map record) at the very end before the
    // free-space slot. This mirrors the fixed 3-record layout of a real
    // header node.
    let record0_start = 14u16;
    let record1_start = 14 + 128; // header record padded out to 128 bytes on-disk
    let record2_start = node_size - 128; // map record occupies the tail
    let free_space = node_size;

    let offsets = [record0_start, record1_start, record2_start, free_space];
    for (i, off) in offsets.iter().rev().enumerate() {
        let pos = node_size as usize - (i + 1) * 2;
        data[pos..pos + 2].copy_from_slice(&off.to_be_bytes());
    }

    data
}

/// Bits the header node's own record 2 can hold: a fixed 128 bytes (see
/// `build_header_node`), giving 1024 bits regardless of node size.
const HEADER_MAP_RECORD_BITS: u32 = 128 * 8;

/// Bits a single chained map node's record can hold: the node minus its
/// 14-byte descriptor and the 2-entry offset table (4 bytes) at the tail.
fn bits_per_map_node(node_size: u16) -> u32 {
    (node_size as u32 - 14 - 4) * 8
}

/// Number of map-node pages chained after the header's own map record.
/// The builder always keeps a standalone map node even when the header's
/// 1024-bit record alone would cover every node, mirroring a real
/// volume's layout; beyond that it follows the chaining formula exactly:
/// `max(0, ceil((totalNodeCount - bitsInHeaderMapRecord) / bitsPerMapNode))`,
/// with that floor of one node folded in as the minimum.
fn map_node_pages_needed(total_nodes: u32, node_size: u16) -> u32 {
    let overflow_bits = total_nodes.saturating_sub(HEADER_MAP_RECORD_BITS);
    let extra = overflow_bits.div_ceil(bits_per_map_node(node_size));
    extra.max(1)
}

/// Build the chain of map nodes that extends the header's own 1024-bit map
/// record. `first_node_number` is this chain's head (the header's
/// `forward_link`, always node 1); each node covers `bits_per_map_node`
/// further bits of the tree-wide allocation bitmap, continuing right where
/// the header's own record left off, and links to the next node via `fLink`
/// until the chain has a bit for every node in the tree.
fn build_map_nodes(node_size: u16, total_nodes: u32, num_map_nodes: u32, first_node_number: u32) -> Vec<Vec<u8>> {
    let per_node_bits = bits_per_map_node(node_size);
    let mut nodes = Vec::with_capacity(num_map_nodes as usize);

    for i in 0..num_map_nodes {
        let node_number = first_node_number + i;
        let forward_link = if i + 1 < num_map_nodes { node_number + 1 } else { 0 };
        let backward_link = if i > 0 { node_number - 1 } else { 0 };

        let mut data = vec![0u8; node_size as usize];
        let descriptor =
            NodeDescriptor { forward_link, backward_link, kind: NODE_KIND_MAP, height: 0, num_records: 1, reserved: 0 };
        {
            let mut head = &mut data[0..14];
            descriptor.write(&mut head).unwrap();
        }

        // This node covers bits [base_bit, base_bit + per_node_bits) of the
        // tree-wide bitmap, all set (the builder never leaves slack nodes
        // behind).
        let base_bit = HEADER_MAP_RECORD_BITS + i * per_node_bits;
        let record_start = 14usize;
        for bit in 0..per_node_bits {
            let global_bit = base_bit + bit;
            if global_bit >= total_nodes {
                break;
            }
            let byte = record_start + (bit / 8) as usize;
            data[byte] |= 0x80 >> (bit % 8);
        }

        let record_end = (record_start + (per_node_bits / 8) as usize) as u16;
        let offsets = [14u16, record_end];
        for (j, off) in offsets.iter().rev().enumerate() {
            let pos = node_size as usize - (j + 1) * 2;
            data[pos..pos + 2].copy_from_slice(&off.to_be_bytes());
        }

        nodes.push(data);
    }

    nodes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(n: u32) -> Vec<u8> {
        n.to_be_bytes().to_vec()
    }

    #[test]
    fn builds_single_leaf_tree() {
        let records = vec![(key(1), b"a".to_vec()), (key(2), b"bb".to_vec())];
        let tree = build_btree(&records, 512, 16, 0, 0).unwrap();
        assert_eq!(tree.header.leaf_records, 2);
        assert_eq!(tree.header.tree_depth, 1);
        assert_eq!(tree.header.root_node, tree.header.first_leaf_node);
    }

    #[test]
    fn builds_empty_tree_with_header_only() {
        let records: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
        let tree = build_btree(&records, 512, 16, 0, 0).unwrap();
        assert_eq!(tree.header.leaf_records, 0);
        assert_eq!(tree.header.root_node, 0);
        assert_eq!(tree.header.tree_depth, 0);
    }

    #[test]
    fn builds_multi_leaf_tree_with_index_level() {
        // Force many small nodes by using a tiny node size.
        let mut records = Vec::new();
        for i in 0..200u32 {
            records.push((key(i), vec![0u8; 40]));
        }
        let tree = build_btree(&records, 512, 16, 0, 0).unwrap();
        assert!(tree.header.tree_depth >= 2, "200 records at 512-byte nodes should need an index level");
        assert_eq!(tree.header.leaf_records, 200);
    }

    #[test]
    fn map_node_pages_needed_chains_past_one_map_node_capacity() {
        // Header's 1024-bit record plus one full map node (3952 bits at a
        // 512-byte node size) covers exactly 4976 nodes; past that a
        // second map node must chain on.
        assert_eq!(map_node_pages_needed(2000, 512), 1);
        assert_eq!(map_node_pages_needed(4976, 512), 1);
        assert_eq!(map_node_pages_needed(4977, 512), 2);
    }

    #[test]
    fn build_map_nodes_chains_additional_pages_via_forward_link() {
        let node_size = 512u16;
        let total_nodes = 5000u32;
        let num_map_nodes = map_node_pages_needed(total_nodes, node_size);
        assert_eq!(num_map_nodes, 2);

        let nodes = build_map_nodes(node_size, total_nodes, num_map_nodes, 1);
        assert_eq!(nodes.len(), 2);

        let first = crate::btree::node::parse_node_descriptor(&mut &nodes[0][0..14]).unwrap();
        assert_eq!(first.forward_link, 2);
        assert_eq!(first.backward_link, 0);
        assert_eq!(first.kind, NODE_KIND_MAP);

        let second = crate::btree::node::parse_node_descriptor(&mut &nodes[1][0..14]).unwrap();
        assert_eq!(second.forward_link, 0);
        assert_eq!(second.backward_link, 1);

        // The first map node is responsible for bits 1024..4976 of the
        // tree-wide bitmap -- every one of those node indices is below
        // `total_nodes`, so its record is all set.
        assert_eq!(nodes[0][14], 0xFF);

        // The second map node covers bits 4976.., but only 4976..5000
        // (24 bits = 3 bytes) fall within `total_nodes`; the rest stays
        // clear.
        assert_eq!(&nodes[1][14..17], &[0xFFu8, 0xFF, 0xFF]);
        assert_eq!(nodes[1][17], 0x00);
    }

    #[test]
    fn builds_tree_requiring_a_chained_map_node() {
        // Enough leaf records, each forced into its own node via a large
        // payload, to push total_nodes past one map node's capacity
        // (4976 nodes at a 512-byte node size) and exercise the chain
        // end to end through the public builder entry point.
        let mut records = Vec::new();
        for i in 0..5200u32 {
            records.push((key(i), vec![0u8; 480]));
        }
        let tree = build_btree(&records, 512, 16, 0, 0).unwrap();
        assert_eq!(tree.header.leaf_records, 5200);
        assert!(tree.header.total_nodes > 4976 + 2, "expected enough nodes to require a second map node");
        assert_eq!(tree.node_bytes.len(), tree.header.total_nodes as usize * 512);
    }
}
