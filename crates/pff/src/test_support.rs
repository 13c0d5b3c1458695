//! Test-only builders that synthesize byte-exact store images: headers,
//! index pages, data blocks and allocation tables. The read side of the
//! crate is exercised against these images; there is no production write
//! path.

use std::io::{Cursor, Read};

use crate::block_sig::compute_sig;
use crate::crc::compute_crc;
use crate::encode;
use crate::ndb::allocation::RangeList;
use crate::ndb::block::aligned_block_size;
use crate::ndb::header::HEADER_SIZE;
use crate::ndb::index::{DescriptorIndexEntry, IndexKind, OffsetIndexEntry};
use crate::ndb::page::PageType;
use crate::ndb::{ContentType, EncryptionType, FileType, PageRef, DATA_ID_FLAG_MASK};

const FILE_SIGNATURE: [u8; 4] = [0x21, 0x42, 0x44, 0x4E];
const HEADER_SENTINEL: u8 = 0x80;

fn put_u16(data: &mut [u8], offset: usize, value: u16) {
    data[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(data: &mut [u8], offset: usize, value: u32) {
    data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_u64(data: &mut [u8], offset: usize, value: u64) {
    data[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

fn push_id(data: &mut Vec<u8>, file_type: FileType, value: u64) {
    if file_type.is_64bit() {
        data.extend_from_slice(&value.to_le_bytes());
    } else {
        data.extend_from_slice(&(value as u32).to_le_bytes());
    }
}

const fn align_up(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}

// ---------------------------------------------------------------------------
// File header

pub struct HeaderBuilder {
    file_type: FileType,
    content_type: ContentType,
    data_version: u16,
    encryption_type: EncryptionType,
    descriptor_index_root: PageRef,
    offset_index_root: PageRef,
    file_size: u64,
    overrides: Vec<(usize, u8)>,
}

impl HeaderBuilder {
    pub fn new(file_type: FileType) -> Self {
        let data_version = match file_type {
            FileType::Ansi => 0x000E,
            FileType::Unicode => 0x0017,
            FileType::Unicode4k => 0x0024,
        };
        Self {
            file_type,
            content_type: ContentType::Pst,
            data_version,
            encryption_type: EncryptionType::None,
            descriptor_index_root: PageRef::default(),
            offset_index_root: PageRef::default(),
            file_size: 0x10000,
            overrides: Vec::new(),
        }
    }

    pub fn data_version(mut self, data_version: u16) -> Self {
        self.data_version = data_version;
        self
    }

    pub fn descriptor_index_root(mut self, root: PageRef) -> Self {
        self.descriptor_index_root = root;
        self
    }

    pub fn offset_index_root(mut self, root: PageRef) -> Self {
        self.offset_index_root = root;
        self
    }

    pub fn encryption_type(mut self, encryption_type: EncryptionType) -> Self {
        self.encryption_type = encryption_type;
        self
    }

    pub fn file_size(mut self, file_size: u64) -> Self {
        self.file_size = file_size;
        self
    }

    /// Raw override applied before the checksums are computed.
    pub fn set_byte(&mut self, offset: usize, value: u8) {
        self.overrides.push((offset, value));
    }

    pub fn build(&self) -> [u8; HEADER_SIZE] {
        let mut data = [0_u8; HEADER_SIZE];
        data[0..4].copy_from_slice(&FILE_SIGNATURE);
        put_u16(&mut data, 8, self.content_type as u16);
        put_u16(&mut data, 10, self.data_version);
        data[14] = 0x01;
        data[15] = 0x01;

        match self.file_type {
            FileType::Ansi => {
                put_u32(&mut data, 168, self.file_size as u32);
                put_u32(&mut data, 184, self.descriptor_index_root.back_pointer as u32);
                put_u32(&mut data, 188, self.descriptor_index_root.offset as u32);
                put_u32(&mut data, 192, self.offset_index_root.back_pointer as u32);
                put_u32(&mut data, 196, self.offset_index_root.offset as u32);
                data[200] = 0x02;
                data[460] = HEADER_SENTINEL;
                data[461] = self.encryption_type as u8;
            }
            FileType::Unicode | FileType::Unicode4k => {
                put_u64(&mut data, 184, self.file_size);
                put_u64(&mut data, 216, self.descriptor_index_root.back_pointer);
                put_u64(&mut data, 224, self.descriptor_index_root.offset);
                put_u64(&mut data, 232, self.offset_index_root.back_pointer);
                put_u64(&mut data, 240, self.offset_index_root.offset);
                data[248] = 0x02;
                data[512] = HEADER_SENTINEL;
                data[513] = self.encryption_type as u8;
            }
        }

        for (offset, value) in &self.overrides {
            data[*offset] = *value;
        }

        if self.file_type.is_64bit() {
            let full_crc = compute_crc(0, &data[8..8 + 516]);
            put_u32(&mut data, 524, full_crc);
        }
        let partial_crc = compute_crc(0, &data[8..8 + 471]);
        put_u32(&mut data, 4, partial_crc);

        data
    }
}

// ---------------------------------------------------------------------------
// Pages

/// Serialize a page trailer in the dialect's layout.
fn encode_page_trailer(
    file_type: FileType,
    page_type: PageType,
    signature: u16,
    back_pointer: u64,
    crc: u32,
) -> Vec<u8> {
    let mut data = vec![0_u8; file_type.page_trailer_size()];
    data[0] = page_type as u8;
    data[1] = page_type as u8;
    put_u16(&mut data, 2, signature);
    match file_type {
        FileType::Ansi => {
            put_u32(&mut data, 4, back_pointer as u32);
            put_u32(&mut data, 8, crc);
        }
        FileType::Unicode | FileType::Unicode4k => {
            put_u32(&mut data, 4, crc);
            put_u64(&mut data, 8, back_pointer);
        }
    }
    data
}

pub struct PageBuilder {
    file_type: FileType,
    page_type: PageType,
    back_pointer: u64,
    payload: Vec<u8>,
}

impl PageBuilder {
    pub fn new(file_type: FileType, page_type: PageType, back_pointer: u64) -> Self {
        let payload_size = file_type.page_size() - file_type.page_trailer_size();
        Self {
            file_type,
            page_type,
            back_pointer,
            payload: vec![0_u8; payload_size],
        }
    }

    pub fn payload_byte(mut self, offset: usize, value: u8) -> Self {
        self.payload[offset] = value;
        self
    }

    pub fn payload_slice(mut self, offset: usize, bytes: &[u8]) -> Self {
        self.payload[offset..offset + bytes.len()].copy_from_slice(bytes);
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let crc = compute_crc(0, &self.payload);
        let mut page = self.payload.clone();
        page.extend_from_slice(&encode_page_trailer(
            self.file_type,
            self.page_type,
            0,
            self.back_pointer,
            crc,
        ));
        page
    }
}

/// Copy `page` into `image` at `offset`, growing the image as needed.
pub fn write_page(image: &mut Vec<u8>, offset: usize, page: &[u8]) {
    if image.len() < offset + page.len() {
        image.resize(offset + page.len(), 0);
    }
    image[offset..offset + page.len()].copy_from_slice(page);
}

// ---------------------------------------------------------------------------
// Index pages

pub fn encode_branch_entry(file_type: FileType, key: u64, child: PageRef) -> Vec<u8> {
    let mut data = Vec::new();
    push_id(&mut data, file_type, key);
    push_id(&mut data, file_type, child.back_pointer);
    push_id(&mut data, file_type, child.offset);
    data
}

pub fn encode_descriptor_entry(file_type: FileType, entry: &DescriptorIndexEntry) -> Vec<u8> {
    let mut data = Vec::new();
    push_id(&mut data, file_type, entry.descriptor_id);
    push_id(&mut data, file_type, entry.data_id);
    push_id(&mut data, file_type, entry.local_descriptors_id);
    data.extend_from_slice(&entry.parent_descriptor_id.to_le_bytes());
    if file_type.is_64bit() {
        data.extend_from_slice(&[0_u8; 4]);
    }
    data
}

pub fn encode_offset_entry(file_type: FileType, entry: &OffsetIndexEntry) -> Vec<u8> {
    let mut data = Vec::new();
    push_id(&mut data, file_type, entry.data_id);
    push_id(&mut data, file_type, entry.file_offset);
    data.extend_from_slice(&entry.data_size.to_le_bytes());
    data.extend_from_slice(&entry.reference_count.to_le_bytes());
    if file_type.is_64bit() {
        data.extend_from_slice(&[0_u8; 4]);
    }
    data
}

fn default_entry_size(file_type: FileType, kind: IndexKind, level: u8) -> u8 {
    match (level, kind, file_type) {
        (1.., _, FileType::Ansi) => 12,
        (1.., _, _) => 24,
        (0, IndexKind::Descriptor, FileType::Ansi) => 16,
        (0, IndexKind::Descriptor, _) => 32,
        (0, IndexKind::Offset, FileType::Ansi) => 12,
        (0, IndexKind::Offset, _) => 24,
    }
}

pub struct IndexPageBuilder {
    file_type: FileType,
    kind: IndexKind,
    level: u8,
    back_pointer: u64,
    entries: Vec<Vec<u8>>,
    entry_size: Option<u8>,
}

impl IndexPageBuilder {
    pub fn new(file_type: FileType, kind: IndexKind, level: u8, back_pointer: u64) -> Self {
        Self {
            file_type,
            kind,
            level,
            back_pointer,
            entries: Vec::new(),
            entry_size: None,
        }
    }

    pub fn entries(mut self, entries: Vec<Vec<u8>>) -> Self {
        self.entries = entries;
        self
    }

    pub fn entry_size(mut self, entry_size: u8) -> Self {
        self.entry_size = Some(entry_size);
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let file_type = self.file_type;
        let payload_size = file_type.page_size() - file_type.page_trailer_size();
        let metadata_size = if file_type.is_64bit() { 8 } else { 4 };
        let entries_size = payload_size - metadata_size;

        let entry_size = self
            .entry_size
            .unwrap_or_else(|| default_entry_size(file_type, self.kind, self.level));
        let max_entries = entries_size / usize::from(entry_size);
        assert!(self.entries.len() <= max_entries, "too many index entries");

        let mut payload = vec![0_u8; payload_size];
        for (index, entry) in self.entries.iter().enumerate() {
            let offset = index * usize::from(entry_size);
            payload[offset..offset + entry.len()].copy_from_slice(entry);
        }

        let metadata = &mut payload[entries_size..];
        match file_type {
            FileType::Ansi | FileType::Unicode => {
                metadata[0] = self.entries.len() as u8;
                metadata[1] = max_entries.min(255) as u8;
                metadata[2] = entry_size;
                metadata[3] = self.level;
            }
            FileType::Unicode4k => {
                metadata[0..2].copy_from_slice(&(self.entries.len() as u16).to_le_bytes());
                metadata[2..4].copy_from_slice(&(max_entries.min(65535) as u16).to_le_bytes());
                metadata[4] = entry_size;
                metadata[5] = self.level;
            }
        }

        let crc = compute_crc(0, &payload);
        let mut page = payload;
        page.extend_from_slice(&encode_page_trailer(
            file_type,
            self.kind.page_type(),
            0,
            self.back_pointer,
            crc,
        ));
        page
    }
}

// ---------------------------------------------------------------------------
// Blocks

fn encode_block_trailer(
    file_type: FileType,
    data_size: u16,
    signature: u16,
    crc: u32,
    back_pointer: u64,
    uncompressed_size: u16,
) -> Vec<u8> {
    let mut data = vec![0_u8; file_type.block_trailer_size() as usize];
    put_u16(&mut data, 0, data_size);
    put_u16(&mut data, 2, signature);
    match file_type {
        FileType::Ansi => {
            put_u32(&mut data, 4, back_pointer as u32);
            put_u32(&mut data, 8, crc);
        }
        FileType::Unicode => {
            put_u32(&mut data, 4, crc);
            put_u64(&mut data, 8, back_pointer);
        }
        FileType::Unicode4k => {
            put_u32(&mut data, 4, crc);
            put_u64(&mut data, 8, back_pointer);
            put_u16(&mut data, 18, uncompressed_size);
        }
    }
    data
}

/// Assemble one block image: stored payload, padding and trailer.
fn assemble_block(
    file_type: FileType,
    data_id: u64,
    file_offset: u64,
    stored: &[u8],
    uncompressed_size: u16,
) -> Vec<u8> {
    let aligned = aligned_block_size(stored.len() as u32, file_type) as usize;
    let trailer_size = file_type.block_trailer_size() as usize;

    let mut data = vec![0_u8; aligned];
    data[..stored.len()].copy_from_slice(stored);

    let crc = compute_crc(0, stored);
    let signature = compute_sig(file_offset as u32, data_id as u32);
    let trailer = encode_block_trailer(
        file_type,
        stored.len() as u16,
        signature,
        crc,
        data_id,
        uncompressed_size,
    );
    data[aligned - trailer_size..].copy_from_slice(&trailer);
    data
}

fn deflate(data: &[u8]) -> Vec<u8> {
    let mut encoder =
        flate2::bufread::DeflateEncoder::new(data, flate2::Compression::default());
    let mut compressed = Vec::new();
    encoder
        .read_to_end(&mut compressed)
        .expect("deflate never fails on in-memory data");
    compressed
}

fn apply_encryption(data: &mut [u8], encryption: EncryptionType, data_id: u64) {
    match encryption {
        EncryptionType::None => {}
        EncryptionType::Compressible => encode::compressible::encode_block(data),
        EncryptionType::High => encode::high::encode_decode_block(data, data_id as u32),
    }
}

pub struct BlockBuilder {
    file_type: FileType,
    data_id: u64,
    payload: Vec<u8>,
    file_offset: u64,
    encryption: EncryptionType,
    compress: bool,
}

impl BlockBuilder {
    pub fn new(file_type: FileType, data_id: u64, payload: Vec<u8>) -> Self {
        Self {
            file_type,
            data_id,
            payload,
            file_offset: 0,
            encryption: EncryptionType::None,
            compress: false,
        }
    }

    pub fn at_offset(mut self, file_offset: u64) -> Self {
        self.file_offset = file_offset;
        self
    }

    pub fn encrypt(mut self, encryption: EncryptionType) -> Self {
        self.encryption = encryption;
        self
    }

    pub fn compress(mut self) -> Self {
        self.compress = true;
        self
    }

    /// Returns the block image and the stored (on-disk logical) size.
    pub fn build(&self) -> (Vec<u8>, u32) {
        let (mut stored, uncompressed_size) = if self.compress {
            let compressed = deflate(&self.payload);
            let uncompressed_size = self.payload.len() as u16;
            (compressed, uncompressed_size)
        } else {
            (self.payload.clone(), self.payload.len() as u16)
        };
        if !self.compress {
            apply_encryption(&mut stored, self.encryption, self.data_id);
        }

        let stored_size = stored.len() as u32;
        let data = assemble_block(
            self.file_type,
            self.data_id,
            self.file_offset,
            &stored,
            uncompressed_size,
        );
        (data, stored_size)
    }
}

// ---------------------------------------------------------------------------
// Data tree / sub-node tree payloads

pub fn encode_data_tree(
    file_type: FileType,
    level: u8,
    total_size: u32,
    entries: &[u64],
) -> Vec<u8> {
    let mut data = vec![0x01, level];
    data.extend_from_slice(&(entries.len() as u16).to_le_bytes());
    data.extend_from_slice(&total_size.to_le_bytes());
    for entry in entries {
        push_id(&mut data, file_type, *entry);
    }
    data
}

pub fn encode_sub_node_leaf(file_type: FileType, entries: &[(u64, u64, u64)]) -> Vec<u8> {
    let mut data = vec![0x02, 0x00];
    data.extend_from_slice(&(entries.len() as u16).to_le_bytes());
    if file_type.is_64bit() {
        data.extend_from_slice(&[0_u8; 4]);
    }
    for (subnode_id, data_id, nested_subnodes_id) in entries {
        push_id(&mut data, file_type, *subnode_id);
        push_id(&mut data, file_type, *data_id);
        push_id(&mut data, file_type, *nested_subnodes_id);
    }
    data
}

pub fn encode_sub_node_branch(file_type: FileType, entries: &[(u64, u64)]) -> Vec<u8> {
    let mut data = vec![0x02, 0x01];
    data.extend_from_slice(&(entries.len() as u16).to_le_bytes());
    if file_type.is_64bit() {
        data.extend_from_slice(&[0_u8; 4]);
    }
    for (subnode_id, child_data_id) in entries {
        push_id(&mut data, file_type, *subnode_id);
        push_id(&mut data, file_type, *child_data_id);
    }
    data
}

// ---------------------------------------------------------------------------
// Whole-store images

const FIRST_ALLOCATION_TABLE_OFFSET: u64 = 0x4400;

struct BlockRecord {
    data_id: u64,
    offset: u64,
    aligned_size: u64,
}

/// Builds a complete store image: blocks first, then index pages, then the
/// allocation tables and the header.
pub struct StoreImageBuilder {
    file_type: FileType,
    encryption: EncryptionType,
    image: Vec<u8>,
    cursor: u64,
    next_id_index: u64,
    descriptors: Vec<DescriptorIndexEntry>,
    offsets: Vec<OffsetIndexEntry>,
    blocks: Vec<BlockRecord>,
    unallocated: RangeList,
    descriptor_root: Option<PageRef>,
    offset_root: Option<PageRef>,
}

impl StoreImageBuilder {
    pub fn new(file_type: FileType) -> Self {
        let blocks_base = FIRST_ALLOCATION_TABLE_OFFSET + 2 * file_type.page_size() as u64;
        Self {
            file_type,
            encryption: EncryptionType::None,
            image: vec![0_u8; blocks_base as usize],
            cursor: blocks_base,
            next_id_index: 0x40,
            descriptors: Vec::new(),
            offsets: Vec::new(),
            blocks: Vec::new(),
            unallocated: RangeList::new(),
            descriptor_root: None,
            offset_root: None,
        }
    }

    /// The header's encryption type; individual blocks encrypt themselves
    /// via the `encryption` argument of the `add_*` methods.
    pub fn set_encryption(&mut self, encryption: EncryptionType) {
        self.encryption = encryption;
    }

    pub fn unallocated_data(&self) -> RangeList {
        self.unallocated.clone()
    }

    pub fn into_cursor(self) -> Cursor<Vec<u8>> {
        Cursor::new(self.image)
    }

    fn alloc_id(&mut self, internal: bool) -> u64 {
        let id = self.next_id_index << 2;
        self.next_id_index += 1;
        if internal {
            id | 0x2
        } else {
            id
        }
    }

    /// Data allocation table slots and (outside the 4k dialect) page
    /// allocation table slots are fixed; nothing else may sit there.
    fn reserved_slot_overlapping(&self, offset: u64, size: u64) -> Option<u64> {
        let page_size = self.file_type.page_size() as u64;
        let data_coverage = self.file_type.map_bits_size() as u64 * 8 * 64;
        let end = offset + size;

        let mut strides = vec![(FIRST_ALLOCATION_TABLE_OFFSET, data_coverage)];
        if self.file_type != FileType::Unicode4k {
            strides.push((FIRST_ALLOCATION_TABLE_OFFSET + page_size, data_coverage * 8));
        }

        for (first, stride) in strides {
            if end <= first {
                continue;
            }
            let index = offset.saturating_sub(first) / stride;
            for slot in [first + index * stride, first + (index + 1) * stride] {
                if slot < end && offset < slot + page_size {
                    return Some(slot + page_size);
                }
            }
        }
        None
    }

    fn place(&mut self, size: u64, alignment: u64) -> u64 {
        let mut offset = align_up(self.cursor, alignment);
        while let Some(past) = self.reserved_slot_overlapping(offset, size) {
            offset = align_up(past, alignment);
        }
        self.cursor = offset + size;
        offset
    }

    fn write_block(
        &mut self,
        data_id: u64,
        stored: &[u8],
        uncompressed_size: u16,
        indexed: bool,
    ) -> u64 {
        let aligned = u64::from(aligned_block_size(stored.len() as u32, self.file_type));
        let offset = self.place(aligned, u64::from(self.file_type.block_increment()));
        let block = assemble_block(self.file_type, data_id, offset, stored, uncompressed_size);
        write_page(&mut self.image, offset as usize, &block);
        self.blocks.push(BlockRecord {
            data_id,
            offset,
            aligned_size: aligned,
        });
        if indexed {
            self.offsets.push(OffsetIndexEntry {
                data_id,
                file_offset: offset,
                data_size: stored.len() as u16,
                reference_count: 1,
            });
        }
        offset
    }

    /// Add an indexed data block, encrypted with `encryption`.
    pub fn add_block(&mut self, payload: Vec<u8>, encryption: EncryptionType) -> u64 {
        let data_id = self.alloc_id(false);
        let mut stored = payload;
        apply_encryption(&mut stored, encryption, data_id);
        let uncompressed = stored.len() as u16;
        self.write_block(data_id, &stored, uncompressed, true);
        data_id
    }

    /// Add an indexed compressed block (4k dialect only).
    pub fn add_compressed_block(&mut self, payload: Vec<u8>) -> u64 {
        assert!(self.file_type.supports_compression());
        let data_id = self.alloc_id(false);
        let stored = deflate(&payload);
        self.write_block(data_id, &stored, payload.len() as u16, true);
        data_id
    }

    /// Add an indexed internal block; internal blocks are never encrypted.
    pub fn add_internal_block(&mut self, payload: Vec<u8>) -> u64 {
        let data_id = self.alloc_id(true);
        let uncompressed = payload.len() as u16;
        self.write_block(data_id, &payload, uncompressed, true);
        data_id
    }

    pub fn add_data_tree(&mut self, level: u8, total_size: u32, children: &[u64]) -> u64 {
        let payload = encode_data_tree(self.file_type, level, total_size, children);
        self.add_internal_block(payload)
    }

    pub fn add_sub_node_leaf(&mut self, entries: &[(u64, u64, u64)]) -> u64 {
        let payload = encode_sub_node_leaf(self.file_type, entries);
        self.add_internal_block(payload)
    }

    pub fn add_sub_node_branch(&mut self, entries: &[(u64, u64)]) -> u64 {
        let payload = encode_sub_node_branch(self.file_type, entries);
        self.add_internal_block(payload)
    }

    /// A branch whose only child is itself; the walker must notice.
    pub fn add_sub_node_branch_self_referencing(&mut self, subnode_id: u64) -> u64 {
        let data_id = self.alloc_id(true);
        let payload = encode_sub_node_branch(self.file_type, &[(subnode_id, data_id)]);
        self.write_block(data_id, &payload, payload.len() as u16, true);
        data_id
    }

    pub fn add_descriptor(
        &mut self,
        descriptor_id: u64,
        data_id: u64,
        local_descriptors_id: u64,
        parent_descriptor_id: u32,
    ) {
        self.descriptors.push(DescriptorIndexEntry {
            descriptor_id,
            data_id,
            local_descriptors_id,
            parent_descriptor_id,
        });
    }

    /// Write a valid block that is not indexed anywhere and whose extent is
    /// marked unallocated: exactly what a deleted descriptor leaves behind.
    pub fn add_orphan_block(
        &mut self,
        payload: Vec<u8>,
        encryption: EncryptionType,
    ) -> (u64, u64, u32) {
        let data_id = self.alloc_id(false);
        let mut stored = payload;
        apply_encryption(&mut stored, encryption, data_id);
        let stored_size = stored.len() as u32;
        let uncompressed = stored.len() as u16;
        let offset = self.write_block(data_id, &stored, uncompressed, false);
        let aligned = u64::from(aligned_block_size(stored_size, self.file_type));
        self.unallocated.insert(offset, aligned);
        (offset, data_id, stored_size)
    }

    /// Unallocated space holding bytes that are not a valid block.
    pub fn add_unallocated_noise(&mut self, size: u64) {
        let offset = self.place(size, u64::from(self.file_type.block_increment()));
        if self.image.len() < (offset + size) as usize {
            self.image.resize((offset + size) as usize, 0);
        }
        for index in 0..size {
            self.image[(offset + index) as usize] = (index.wrapping_mul(37) as u8) | 0x01;
        }
        self.unallocated.insert(offset, size);
    }

    /// Mark an existing indexed block's extent unallocated without removing
    /// it from the offset index.
    pub fn mark_block_unallocated(&mut self, data_id: u64) {
        let record = self
            .blocks
            .iter()
            .find(|record| record.data_id == data_id)
            .expect("unknown block");
        self.unallocated.insert(record.offset, record.aligned_size);
    }

    /// Flip a payload byte of a written block so its checksum no longer
    /// matches.
    pub fn corrupt_block_payload(&mut self, data_id: u64) {
        let record = self
            .blocks
            .iter()
            .find(|record| record.data_id == data_id)
            .expect("unknown block");
        self.image[record.offset as usize] ^= 0xFF;
    }

    fn leaf_capacity(&self, kind: IndexKind) -> usize {
        let metadata = if self.file_type.is_64bit() { 8 } else { 4 };
        let entries_size =
            self.file_type.page_size() - self.file_type.page_trailer_size() - metadata;
        let entry_size = usize::from(default_entry_size(self.file_type, kind, 0));
        entries_size / entry_size
    }

    fn write_index_page(&mut self, page: Vec<u8>) -> PageRef {
        let page_size = self.file_type.page_size() as u64;
        let offset = self.place(page_size, page_size);
        // The builder stamps each index page's identifier with its own
        // offset, which keeps back pointers unique without bookkeeping.
        write_page(&mut self.image, offset as usize, &page);
        offset_to_page_ref(offset)
    }

    fn build_index(&mut self, kind: IndexKind, entries: Vec<Vec<u8>>, keys: Vec<u64>) -> PageRef {
        let capacity = self.leaf_capacity(kind);
        let chunks: Vec<(u64, Vec<Vec<u8>>)> = entries
            .chunks(capacity.max(1))
            .zip(keys.chunks(capacity.max(1)))
            .map(|(chunk, keys)| (keys[0], chunk.to_vec()))
            .collect();

        if chunks.len() <= 1 {
            let leaf_entries = chunks.into_iter().next().map(|(_, e)| e).unwrap_or_default();
            let offset = self.peek_index_page_offset();
            let page = IndexPageBuilder::new(self.file_type, kind, 0, offset)
                .entries(leaf_entries)
                .build();
            return self.write_index_page(page);
        }

        let mut branch_entries = Vec::new();
        for (smallest_key, leaf_entries) in chunks {
            let offset = self.peek_index_page_offset();
            let page = IndexPageBuilder::new(self.file_type, kind, 0, offset)
                .entries(leaf_entries)
                .build();
            let leaf_ref = self.write_index_page(page);
            branch_entries.push(encode_branch_entry(self.file_type, smallest_key, leaf_ref));
        }

        let offset = self.peek_index_page_offset();
        let root = IndexPageBuilder::new(self.file_type, kind, 1, offset)
            .entries(branch_entries)
            .build();
        self.write_index_page(root)
    }

    fn peek_index_page_offset(&self) -> u64 {
        let page_size = self.file_type.page_size() as u64;
        let mut offset = align_up(self.cursor, page_size);
        while let Some(past) = self.reserved_slot_overlapping(offset, page_size) {
            offset = align_up(past, page_size);
        }
        offset
    }

    /// Write the offset index pages and return the root reference.
    pub fn build_offset_index(&mut self) -> PageRef {
        if let Some(root) = self.offset_root {
            return root;
        }
        let mut entries = self.offsets.clone();
        entries.sort_by_key(|entry| entry.data_id & !DATA_ID_FLAG_MASK);
        let encoded = entries
            .iter()
            .map(|entry| encode_offset_entry(self.file_type, entry))
            .collect();
        let keys = entries.iter().map(|entry| entry.data_id).collect();
        let root = self.build_index(IndexKind::Offset, encoded, keys);
        self.offset_root = Some(root);
        root
    }

    fn build_descriptor_index(&mut self) -> PageRef {
        if let Some(root) = self.descriptor_root {
            return root;
        }
        let mut entries = self.descriptors.clone();
        entries.sort_by_key(|entry| entry.descriptor_id);
        let encoded = entries
            .iter()
            .map(|entry| encode_descriptor_entry(self.file_type, entry))
            .collect();
        let keys = entries.iter().map(|entry| entry.descriptor_id).collect();
        let root = self.build_index(IndexKind::Descriptor, encoded, keys);
        self.descriptor_root = Some(root);
        root
    }

    fn write_allocation_tables(&mut self) {
        let file_type = self.file_type;
        let page_size = file_type.page_size() as u64;
        let bitmap_size = file_type.map_bits_size();
        let data_coverage = bitmap_size as u64 * 8 * 64;
        let file_size = self.image.len() as u64;

        // Data allocation tables: everything allocated except the ranges
        // explicitly marked unallocated.
        let mut offset = FIRST_ALLOCATION_TABLE_OFFSET;
        while offset < file_size {
            let mut bitmap = vec![0xFF_u8; bitmap_size];
            for (range_offset, range_size) in self.unallocated.ranges().iter().copied() {
                let start = range_offset.max(offset);
                let end = (range_offset + range_size).min(offset + data_coverage);
                let mut unit = start;
                while unit < end {
                    let bit = ((unit - offset) / 64) as usize;
                    bitmap[bit / 8] &= !(0x80 >> (bit % 8));
                    unit += 64;
                }
            }

            let bitmap_offset = if file_type == FileType::Ansi { 4 } else { 0 };
            let mut builder =
                PageBuilder::new(file_type, PageType::DataAllocationTable, offset);
            builder = builder.payload_slice(bitmap_offset, &bitmap);
            let page = builder.build();
            write_page(&mut self.image, offset as usize, &page);
            offset += data_coverage;
        }

        // Page allocation tables: fully allocated; not present in the 4k
        // dialect.
        if file_type != FileType::Unicode4k {
            let page_coverage = data_coverage * 8;
            let mut offset = FIRST_ALLOCATION_TABLE_OFFSET + page_size;
            while offset < file_size {
                let bitmap = vec![0xFF_u8; bitmap_size];
                let bitmap_offset = if file_type == FileType::Ansi { 4 } else { 0 };
                let page = PageBuilder::new(file_type, PageType::PageAllocationTable, offset)
                    .payload_slice(bitmap_offset, &bitmap)
                    .build();
                write_page(&mut self.image, offset as usize, &page);
                offset += page_coverage;
            }
        }
    }

    /// Finish the image: index pages, allocation tables and the header.
    pub fn build_store(&mut self) -> Vec<u8> {
        let descriptor_root = self.build_descriptor_index();
        let offset_root = self.build_offset_index();
        self.write_allocation_tables();

        let header = HeaderBuilder::new(self.file_type)
            .descriptor_index_root(descriptor_root)
            .offset_index_root(offset_root)
            .encryption_type(self.encryption)
            .file_size(self.image.len() as u64)
            .build();
        self.image[..HEADER_SIZE].copy_from_slice(&header);

        self.image.clone()
    }
}

fn offset_to_page_ref(offset: u64) -> PageRef {
    PageRef {
        back_pointer: offset,
        offset,
    }
}
