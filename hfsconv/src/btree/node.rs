//! B*-tree node descriptor and raw node record access, shared by the
//! reading side ([`crate::btree::file`]) and the building side
//! ([`crate::btree::builder`]).

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read};

use crate::error::{Error, Result};

pub const NODE_KIND_LEAF: u8 = 0xFF; // -1 as i8
pub const NODE_KIND_INDEX: u8 = 0x00;
pub const NODE_KIND_HEADER: u8 = 0x01;
pub const NODE_KIND_MAP: u8 = 0x02;

/// A node's role in the tree, as distinguished by `NodeDescriptor.kind`.
/// Kept as a sum type rather than subclasses of a shared "node" base --
/// there is no behavior shared across kinds beyond the descriptor layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Leaf,
    Index,
    Header,
    Map,
}

impl NodeKind {
    pub fn from_u8(kind: u8) -> Result<Self> {
        match kind {
            NODE_KIND_LEAF => Ok(NodeKind::Leaf),
            NODE_KIND_INDEX => Ok(NodeKind::Index),
            NODE_KIND_HEADER => Ok(NodeKind::Header),
            NODE_KIND_MAP => Ok(NodeKind::Map),
            other => Err(Error::MalformedSource(format!("unknown B*-tree node kind {other}"))),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            NodeKind::Leaf => NODE_KIND_LEAF,
            NodeKind::Index => NODE_KIND_INDEX,
            NodeKind::Header => NODE_KIND_HEADER,
            NodeKind::Map => NODE_KIND_MAP,
        }
    }
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NodeKind::Leaf => "leaf",
            NodeKind::Index => "index",
            NodeKind::Header => "header",
            NodeKind::Map => "map",
        };
        f.write_str(s)
    }
}

/// A B*-tree node descriptor (14 bytes at the start of every node).
#[derive(Debug, Clone)]
pub struct NodeDescriptor {
    pub forward_link: u32,
    pub backward_link: u32,
    pub kind: u8,
    pub height: u8,
    pub num_records: u16,
    pub reserved: u16,
}

impl NodeDescriptor {
    pub fn kind(&self) -> Result<NodeKind> {
        NodeKind::from_u8(self.kind)
    }

    pub fn write<W: std::io::Write>(&self, w: &mut W) -> Result<()> {
        w.write_u32::<BigEndian>(self.forward_link)?;
        w.write_u32::<BigEndian>(self.backward_link)?;
        w.write_u8(self.kind)?;
        w.write_u8(self.height)?;
        w.write_u16::<BigEndian>(self.num_records)?;
        w.write_u16::<BigEndian>(self.reserved)?;
        Ok(())
    }
}

pub fn parse_node_descriptor<R: Read>(reader: &mut R) -> Result<NodeDescriptor> {
    Ok(NodeDescriptor {
        forward_link: reader.read_u32::<BigEndian>()?,
        backward_link: reader.read_u32::<BigEndian>()?,
        kind: reader.read_u8()?,
        height: reader.read_u8()?,
        num_records: reader.read_u16::<BigEndian>()?,
        reserved: reader.read_u16::<BigEndian>()?,
    })
}

/// A parsed B*-tree node with its raw bytes and record offset table.
#[derive(Debug)]
pub struct BTreeNode {
    pub descriptor: NodeDescriptor,
    /// Raw node data (always `node_size` bytes).
    pub data: Vec<u8>,
    /// Record offsets, descending from the tail of the node; the last
    /// entry is the free-space offset rather than a real record.
    pub record_offsets: Vec<u16>,
}

impl BTreeNode {
    pub fn parse(data: Vec<u8>) -> Result<Self> {
        let mut cursor = Cursor::new(&data);
        let descriptor = parse_node_descriptor(&mut cursor)?;

        let num_offsets = descriptor.num_records as usize + 1;
        let node_size = data.len();
        let mut record_offsets = Vec::with_capacity(num_offsets);
        for i in 0..num_offsets {
            let offset_pos = node_size.checked_sub((i + 1) * 2).ok_or_else(|| {
                Error::MalformedSource("node too small for its own offset table".into())
            })?;
            if offset_pos + 1 >= data.len() {
                return Err(Error::MalformedSource("offset table out of bounds".into()));
            }
            record_offsets.push(u16::from_be_bytes([data[offset_pos], data[offset_pos + 1]]));
        }

        Ok(BTreeNode { descriptor, data, record_offsets })
    }

    pub fn record_data(&self, index: usize) -> Result<&[u8]> {
        if index >= self.descriptor.num_records as usize {
            return Err(Error::MalformedSource(format!(
                "record index {index} >= num_records {}",
                self.descriptor.num_records
            )));
        }
        let start = self.record_offsets[index] as usize;
        let end = self.record_offsets[index + 1] as usize;
        if start > end || end > self.data.len() {
            return Err(Error::MalformedSource(format!(
                "invalid record offsets: start={start}, end={end}, len={}",
                self.data.len()
            )));
        }
        Ok(&self.data[start..end])
    }
}

/// Extract the child node number trailing an index node's key.
/// Record format: `[key_length: u16][key_data][child_node: u32]`.
pub fn extract_index_child(record_data: &[u8]) -> Result<u32> {
    if record_data.len() < 2 {
        return Err(Error::MalformedSource("index record too short".into()));
    }
    let key_length = u16::from_be_bytes([record_data[0], record_data[1]]) as usize;
    let child_offset = 2 + key_length;
    if child_offset + 4 > record_data.len() {
        return Err(Error::MalformedSource(format!(
            "index record too short for child pointer: key_len={key_length}, record_len={}",
            record_data.len()
        )));
    }
    Ok(u32::from_be_bytes([
        record_data[child_offset],
        record_data[child_offset + 1],
        record_data[child_offset + 2],
        record_data[child_offset + 3],
    ]))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a minimal leaf node with two fixed-size records and a valid
    /// descending offset stack, per spec.md §3 "B*-tree node".
    fn sample_leaf_node() -> Vec<u8> {
        let node_size = 128usize;
        let mut data = vec![0u8; node_size];
        let rec0 = b"aaaa";
        let rec1 = b"bb";
        data[..4].copy_from_slice(rec0);
        data[4..6].copy_from_slice(rec1);

        let desc = NodeDescriptor { forward_link: 0, backward_link: 0, kind: NODE_KIND_LEAF, height: 1, num_records: 2, reserved: 0 };
        let mut header_slice = &mut data[0..14];
        desc.write(&mut header_slice).unwrap();

        // Offset stack: offset[0]=0 (rec0 start), offset[1]=4 (rec1 start),
        // offset[2]=6 (free-space boundary), written descending from the tail.
        let free_boundary = 6u16;
        data[node_size - 2..].copy_from_slice(&free_boundary.to_be_bytes());
        data[node_size - 4..node_size - 2].copy_from_slice(&4u16.to_be_bytes());
        data[node_size - 6..node_size - 4].copy_from_slice(&0u16.to_be_bytes());
        data
    }

    #[test]
    fn parses_descriptor_and_offset_stack() {
        let node = BTreeNode::parse(sample_leaf_node()).unwrap();
        assert_eq!(node.descriptor.kind().unwrap(), NodeKind::Leaf);
        assert_eq!(node.descriptor.num_records, 2);
        assert_eq!(node.record_offsets, vec![0, 4, 6]);
    }

    #[test]
    fn record_data_spans_offset_to_next_offset() {
        let node = BTreeNode::parse(sample_leaf_node()).unwrap();
        assert_eq!(node.record_data(0).unwrap(), b"aaaa");
        assert_eq!(node.record_data(1).unwrap(), b"bb");
    }

    #[test]
    fn record_data_out_of_range_index_errors() {
        let node = BTreeNode::parse(sample_leaf_node()).unwrap();
        assert!(node.record_data(2).is_err());
    }

    #[test]
    fn node_kind_round_trips_through_u8() {
        for kind in [NodeKind::Leaf, NodeKind::Index, NodeKind::Header, NodeKind::Map] {
            assert_eq!(NodeKind::from_u8(kind.as_u8()).unwrap(), kind);
        }
        assert!(NodeKind::from_u8(0x7F).is_err());
    }

    #[test]
    fn extract_index_child_reads_trailing_pointer() {
        let mut record = Vec::new();
        record.extend_from_slice(&4u16.to_be_bytes());
        record.extend_from_slice(b"key!");
        record.extend_from_slice(&42u32.to_be_bytes());
        assert_eq!(extract_index_child(&record).unwrap(), 42);
    }

    #[test]
    fn extract_index_child_rejects_truncated_record() {
        let record = vec![0u8, 4, b'k', b'e'];
        assert!(extract_index_child(&record).is_err());
    }
}
