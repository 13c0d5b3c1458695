//! ## Sub-Node Trees
//!
//! The per-descriptor B-tree holding sub-objects (attachments, recipients,
//! nested messages). It lives inside internal data blocks: a tag byte, a
//! level byte and an entry array. Leaves map a sub-node identifier to its
//! main stream and an optional nested tree of its own.

use byteorder::{LittleEndian, ReadBytesExt};
use std::collections::BTreeMap;
use std::io::{Cursor, Read, Seek, SeekFrom};

use super::block::{read_block, BlockReadOptions};
use super::index::lookup_offset;
use super::*;

/// The first byte of an internal block holding a sub-node tree.
pub const SUB_NODE_TREE_BLOCK_TYPE: u8 = 0x02;

/// Sub-node trees deeper than this are rejected.
pub const MAX_SUB_NODE_DEPTH: u8 = 4;

/// What a sub-node resolves to: its main stream and, when non-zero, the
/// identifier of its own nested sub-node tree.
#[derive(Copy, Clone, Default, PartialEq, Eq, Debug)]
pub struct SubNodeEntry {
    pub data_id: u64,
    pub nested_subnodes_id: u64,
}

#[derive(Copy, Clone, Debug)]
pub struct SubNodeBranchEntry {
    pub subnode_id: u64,
    pub child_data_id: u64,
}

#[derive(Copy, Clone, Debug)]
pub struct SubNodeLeafEntry {
    pub subnode_id: u64,
    pub entry: SubNodeEntry,
}

/// One parsed sub-node tree block.
pub enum SubNodeBlock {
    Branch(Vec<SubNodeBranchEntry>),
    Leaf(Vec<SubNodeLeafEntry>),
}

fn header_size(file_type: FileType) -> usize {
    match file_type {
        FileType::Ansi => 4,
        FileType::Unicode | FileType::Unicode4k => 8,
    }
}

fn read_id(cursor: &mut Cursor<&[u8]>, file_type: FileType) -> NdbResult<u64> {
    Ok(match file_type {
        FileType::Ansi => u64::from(cursor.read_u32::<LittleEndian>()?),
        FileType::Unicode | FileType::Unicode4k => cursor.read_u64::<LittleEndian>()?,
    })
}

/// Parse a sub-node tree block payload.
pub fn parse_sub_node_block(data: &[u8], file_type: FileType) -> NdbResult<SubNodeBlock> {
    if data.is_empty() || data[0] != SUB_NODE_TREE_BLOCK_TYPE {
        return Err(NdbError::InvalidSubNodeTreeType(
            data.first().copied().unwrap_or(0),
        ));
    }

    let mut cursor = Cursor::new(data);
    cursor.seek(SeekFrom::Current(1))?;

    let level = cursor.read_u8()?;
    if level > MAX_SUB_NODE_DEPTH {
        return Err(NdbError::InvalidSubNodeTreeLevel(level));
    }

    let entry_count = cursor.read_u16::<LittleEndian>()?;
    if file_type.is_64bit() {
        // Alignment padding in the 64-bit layouts.
        cursor.seek(SeekFrom::Current(4))?;
    }

    let id_size = if file_type.is_64bit() { 8 } else { 4 };
    let ids_per_entry = if level > 0 { 2 } else { 3 };
    let capacity = (data.len() - header_size(file_type)) / (id_size * ids_per_entry);
    if usize::from(entry_count) > capacity {
        return Err(NdbError::InvalidSubNodeTreeEntryCount(entry_count));
    }

    if level > 0 {
        let mut entries = Vec::with_capacity(usize::from(entry_count));
        for _ in 0..entry_count {
            let subnode_id = read_id(&mut cursor, file_type)?;
            let child_data_id = read_id(&mut cursor, file_type)?;
            entries.push(SubNodeBranchEntry {
                subnode_id,
                child_data_id,
            });
        }
        Ok(SubNodeBlock::Branch(entries))
    } else {
        let mut entries = Vec::with_capacity(usize::from(entry_count));
        for _ in 0..entry_count {
            let subnode_id = read_id(&mut cursor, file_type)?;
            let data_id = read_id(&mut cursor, file_type)?;
            let nested_subnodes_id = read_id(&mut cursor, file_type)?;
            entries.push(SubNodeLeafEntry {
                subnode_id,
                entry: SubNodeEntry {
                    data_id,
                    nested_subnodes_id,
                },
            });
        }
        Ok(SubNodeBlock::Leaf(entries))
    }
}

/// Build the sub-node map rooted at `root_data_id`: every sub-node
/// identifier in the tree mapped to its stream and nested tree identifiers.
pub fn sub_node_map<R: Read + Seek>(
    f: &mut R,
    file_type: FileType,
    offset_index_root: PageRef,
    root_data_id: u64,
    options: BlockReadOptions,
) -> NdbResult<BTreeMap<u64, SubNodeEntry>> {
    let mut map = BTreeMap::new();
    walk(
        f,
        file_type,
        offset_index_root,
        root_data_id,
        options,
        0,
        &mut map,
    )?;
    Ok(map)
}

fn walk<R: Read + Seek>(
    f: &mut R,
    file_type: FileType,
    offset_index_root: PageRef,
    data_id: u64,
    options: BlockReadOptions,
    depth: u8,
    map: &mut BTreeMap<u64, SubNodeEntry>,
) -> NdbResult<()> {
    if depth >= MAX_SUB_NODE_DEPTH {
        return Err(NdbError::SubNodeTreeDepthExceeded(MAX_SUB_NODE_DEPTH));
    }

    let entry = lookup_offset(
        f,
        file_type,
        offset_index_root,
        data_id,
        options.tolerate_checksum_errors,
    )?
    .ok_or(NdbError::UnresolvedDataId(data_id))?;

    let block = read_block(
        f,
        data_id,
        entry.file_offset,
        u32::from(entry.data_size),
        file_type,
        options,
    )?;

    match parse_sub_node_block(block.data(), file_type)? {
        SubNodeBlock::Branch(entries) => {
            for entry in entries {
                walk(
                    f,
                    file_type,
                    offset_index_root,
                    entry.child_data_id,
                    options,
                    depth + 1,
                    map,
                )?;
            }
        }
        SubNodeBlock::Leaf(entries) => {
            for leaf in entries {
                if map.insert(leaf.subnode_id, leaf.entry).is_some() {
                    return Err(NdbError::DuplicateSubNodeId(leaf.subnode_id));
                }
            }
        }
    }

    Ok(())
}
