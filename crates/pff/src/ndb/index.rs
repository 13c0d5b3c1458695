//! ## Index B-Trees
//!
//! The two persistent B+-trees reached from the file header: the descriptor
//! index (descriptor identifier → data identifier, sub-node tree identifier,
//! parent) and the offset index (data identifier → file offset, size,
//! reference count). Both share one page structure; only the leaf entry
//! shape differs.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read, Seek};

use super::page::{read_page, PageTrailer, PageType};
use super::*;

/// Walks deeper than this many levels are rejected; a well-formed index
/// never comes close, and a crafted cycle would otherwise never terminate.
pub const MAX_INDEX_DEPTH: u8 = 8;

/// Which of the two indices a page belongs to.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum IndexKind {
    Descriptor,
    Offset,
}

impl IndexKind {
    pub fn page_type(self) -> PageType {
        match self {
            IndexKind::Descriptor => PageType::DescriptorIndex,
            IndexKind::Offset => PageType::OffsetIndex,
        }
    }

    fn leaf_entry_size(self, file_type: FileType) -> u8 {
        match (self, file_type) {
            (IndexKind::Descriptor, FileType::Ansi) => 16,
            (IndexKind::Descriptor, _) => 32,
            (IndexKind::Offset, FileType::Ansi) => 12,
            (IndexKind::Offset, _) => 24,
        }
    }

    fn branch_entry_size(file_type: FileType) -> u8 {
        match file_type {
            FileType::Ansi => 12,
            FileType::Unicode | FileType::Unicode4k => 24,
        }
    }

    /// Offset index keys carry flag bits in the two low bits; comparisons
    /// ignore them.
    pub(crate) fn key(self, value: u64) -> u64 {
        match self {
            IndexKind::Descriptor => value,
            IndexKind::Offset => value & !DATA_ID_FLAG_MASK,
        }
    }
}

/// A branch entry: the smallest key in the child subtree and the reference
/// to the child page.
#[derive(Copy, Clone, Debug)]
pub struct BranchEntry {
    pub key: u64,
    pub child: PageRef,
}

/// A descriptor index leaf entry.
#[derive(Copy, Clone, Default, PartialEq, Eq, Debug)]
pub struct DescriptorIndexEntry {
    pub descriptor_id: u64,
    pub data_id: u64,
    pub local_descriptors_id: u64,
    pub parent_descriptor_id: u32,
}

/// An offset index leaf entry.
#[derive(Copy, Clone, Default, PartialEq, Eq, Debug)]
pub struct OffsetIndexEntry {
    pub data_id: u64,
    pub file_offset: u64,
    pub data_size: u16,
    pub reference_count: u16,
}

/// A parsed index page: the entry array plus the level byte.
pub struct BTreePage {
    level: u8,
    entry_size: u8,
    entry_count: usize,
    entries_data: Vec<u8>,
    trailer: PageTrailer,
    crc_mismatch: Option<(u32, u32)>,
}

/// Size of the metadata that trails the entry array inside the payload.
fn metadata_size(file_type: FileType) -> usize {
    match file_type {
        FileType::Ansi => 4,
        FileType::Unicode | FileType::Unicode4k => 8,
    }
}

impl BTreePage {
    pub fn read<R: Read + Seek>(
        f: &mut R,
        page: PageRef,
        kind: IndexKind,
        file_type: FileType,
        tolerate_checksum_errors: bool,
    ) -> NdbResult<Self> {
        let page = read_page(
            f,
            page,
            file_type,
            &[kind.page_type()],
            tolerate_checksum_errors,
        )?;

        let payload = page.payload();
        let entries_size = payload.len() - metadata_size(file_type);
        let mut cursor = Cursor::new(&payload[entries_size..]);

        let (entry_count, max_entries) = match file_type {
            FileType::Ansi | FileType::Unicode => {
                let entry_count = usize::from(cursor.read_u8()?);
                let max_entries = usize::from(cursor.read_u8()?);
                (entry_count, max_entries)
            }
            FileType::Unicode4k => {
                let entry_count = usize::from(cursor.read_u16::<LittleEndian>()?);
                let max_entries = usize::from(cursor.read_u16::<LittleEndian>()?);
                (entry_count, max_entries)
            }
        };

        let entry_size = cursor.read_u8()?;
        let level = cursor.read_u8()?;

        if level > MAX_INDEX_DEPTH {
            return Err(NdbError::InvalidIndexLevel(level));
        }

        let min_entry_size = if level > 0 {
            IndexKind::branch_entry_size(file_type)
        } else {
            kind.leaf_entry_size(file_type)
        };
        if entry_size < min_entry_size {
            return Err(NdbError::InvalidIndexEntrySize(entry_size));
        }
        if max_entries > entries_size / usize::from(entry_size) {
            return Err(NdbError::InvalidIndexEntryCount(max_entries));
        }
        if entry_count > max_entries {
            return Err(NdbError::InvalidIndexEntryCount(entry_count));
        }

        let entries_data = payload[..entry_count * usize::from(entry_size)].to_vec();

        Ok(Self {
            level,
            entry_size,
            entry_count,
            entries_data,
            trailer: *page.trailer(),
            crc_mismatch: page.crc_mismatch(),
        })
    }

    pub fn level(&self) -> u8 {
        self.level
    }

    pub fn is_leaf(&self) -> bool {
        self.level == 0
    }

    pub fn entry_count(&self) -> usize {
        self.entry_count
    }

    pub fn trailer(&self) -> &PageTrailer {
        &self.trailer
    }

    pub fn crc_mismatch(&self) -> Option<(u32, u32)> {
        self.crc_mismatch
    }

    fn entry_data(&self, index: usize) -> &[u8] {
        let offset = index * usize::from(self.entry_size);
        &self.entries_data[offset..offset + usize::from(self.entry_size)]
    }

    /// Parse entry `index` as a branch entry. Only meaningful on branch
    /// pages.
    pub fn branch_entry(&self, index: usize, file_type: FileType) -> NdbResult<BranchEntry> {
        let mut cursor = Cursor::new(self.entry_data(index));
        let (key, back_pointer, offset) = match file_type {
            FileType::Ansi => (
                u64::from(cursor.read_u32::<LittleEndian>()?),
                u64::from(cursor.read_u32::<LittleEndian>()?),
                u64::from(cursor.read_u32::<LittleEndian>()?),
            ),
            FileType::Unicode | FileType::Unicode4k => (
                cursor.read_u64::<LittleEndian>()?,
                cursor.read_u64::<LittleEndian>()?,
                cursor.read_u64::<LittleEndian>()?,
            ),
        };
        Ok(BranchEntry {
            key,
            child: PageRef {
                back_pointer,
                offset,
            },
        })
    }

    /// Parse entry `index` as a descriptor index leaf entry.
    pub fn descriptor_entry(
        &self,
        index: usize,
        file_type: FileType,
    ) -> NdbResult<DescriptorIndexEntry> {
        let mut cursor = Cursor::new(self.entry_data(index));
        match file_type {
            FileType::Ansi => Ok(DescriptorIndexEntry {
                descriptor_id: u64::from(cursor.read_u32::<LittleEndian>()?),
                data_id: u64::from(cursor.read_u32::<LittleEndian>()?),
                local_descriptors_id: u64::from(cursor.read_u32::<LittleEndian>()?),
                parent_descriptor_id: cursor.read_u32::<LittleEndian>()?,
            }),
            FileType::Unicode | FileType::Unicode4k => Ok(DescriptorIndexEntry {
                descriptor_id: cursor.read_u64::<LittleEndian>()?,
                data_id: cursor.read_u64::<LittleEndian>()?,
                local_descriptors_id: cursor.read_u64::<LittleEndian>()?,
                parent_descriptor_id: cursor.read_u32::<LittleEndian>()?,
            }),
        }
    }

    /// Parse entry `index` as an offset index leaf entry.
    pub fn offset_entry(&self, index: usize, file_type: FileType) -> NdbResult<OffsetIndexEntry> {
        let mut cursor = Cursor::new(self.entry_data(index));
        match file_type {
            FileType::Ansi => Ok(OffsetIndexEntry {
                data_id: u64::from(cursor.read_u32::<LittleEndian>()?),
                file_offset: u64::from(cursor.read_u32::<LittleEndian>()?),
                data_size: cursor.read_u16::<LittleEndian>()?,
                reference_count: cursor.read_u16::<LittleEndian>()?,
            }),
            FileType::Unicode | FileType::Unicode4k => Ok(OffsetIndexEntry {
                data_id: cursor.read_u64::<LittleEndian>()?,
                file_offset: cursor.read_u64::<LittleEndian>()?,
                data_size: cursor.read_u16::<LittleEndian>()?,
                reference_count: cursor.read_u16::<LittleEndian>()?,
            }),
        }
    }

    /// The normalized key of entry `index`, regardless of page level. Every
    /// key comparison during descent and leaf scanning goes through here.
    pub fn entry_key(&self, index: usize, kind: IndexKind, file_type: FileType) -> NdbResult<u64> {
        let mut cursor = Cursor::new(self.entry_data(index));
        let key = match file_type {
            FileType::Ansi => u64::from(cursor.read_u32::<LittleEndian>()?),
            FileType::Unicode | FileType::Unicode4k => cursor.read_u64::<LittleEndian>()?,
        };
        Ok(kind.key(key))
    }
}

/// Descend from `root` to the leaf page whose key range covers `key`.
///
/// Returns `None` when the key is below every key in the tree. The search
/// key must already be normalized through [`IndexKind::key`].
fn descend_to_leaf<R: Read + Seek>(
    f: &mut R,
    file_type: FileType,
    kind: IndexKind,
    root: PageRef,
    key: u64,
    tolerate_checksum_errors: bool,
) -> NdbResult<Option<BTreePage>> {
    let mut page_ref = root;
    for _ in 0..=MAX_INDEX_DEPTH {
        let page = BTreePage::read(f, page_ref, kind, file_type, tolerate_checksum_errors)?;
        if page.is_leaf() {
            return Ok(Some(page));
        }

        // Rightmost child whose smallest key is not greater than the search
        // key.
        let mut child = None;
        for index in 0..page.entry_count() {
            if page.entry_key(index, kind, file_type)? <= key {
                child = Some(index);
            } else {
                break;
            }
        }
        match child {
            Some(index) => page_ref = page.branch_entry(index, file_type)?.child,
            None => return Ok(None),
        }
    }
    Err(NdbError::IndexDepthExceeded(MAX_INDEX_DEPTH))
}

/// Look up a descriptor identifier in the descriptor index.
pub fn lookup_descriptor<R: Read + Seek>(
    f: &mut R,
    file_type: FileType,
    root: PageRef,
    descriptor_id: u64,
    tolerate_checksum_errors: bool,
) -> NdbResult<Option<DescriptorIndexEntry>> {
    let kind = IndexKind::Descriptor;
    let key = kind.key(descriptor_id);
    let Some(leaf) = descend_to_leaf(f, file_type, kind, root, key, tolerate_checksum_errors)?
    else {
        return Ok(None);
    };

    for index in 0..leaf.entry_count() {
        if leaf.entry_key(index, kind, file_type)? == key {
            return Ok(Some(leaf.descriptor_entry(index, file_type)?));
        }
    }
    Ok(None)
}

/// Look up a data identifier in the offset index. The two low flag bits of
/// the identifier are ignored for the comparison.
pub fn lookup_offset<R: Read + Seek>(
    f: &mut R,
    file_type: FileType,
    root: PageRef,
    data_id: u64,
    tolerate_checksum_errors: bool,
) -> NdbResult<Option<OffsetIndexEntry>> {
    let kind = IndexKind::Offset;
    let key = kind.key(data_id);
    let Some(leaf) = descend_to_leaf(f, file_type, kind, root, key, tolerate_checksum_errors)? else {
        return Ok(None);
    };

    for index in 0..leaf.entry_count() {
        if leaf.entry_key(index, kind, file_type)? == key {
            return Ok(Some(leaf.offset_entry(index, file_type)?));
        }
    }
    Ok(None)
}
