//! ## Data Blocks
//!
//! Variable-size blocks holding descriptor payloads. A block is padded to
//! the dialect's increment and ends in a trailer carrying the logical size,
//! a signature, a weak CRC over the logical bytes and the data identifier
//! the block was stored under. Internal blocks hold block trees (one or two
//! levels of child data identifiers) instead of payload bytes.

use bitflags::bitflags;
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read, Seek, SeekFrom};

use super::*;
use crate::crc::compute_crc;
use crate::encode;

bitflags! {
    /// Validation outcomes attached to a loaded block.
    #[derive(Copy, Clone, Default, PartialEq, Eq, Debug)]
    pub struct BlockFlags: u8 {
        const COMPRESSED = 0x01;
        const CRC_MISMATCH = 0x02;
        const SIZE_MISMATCH = 0x04;
        const ID_MISMATCH = 0x08;
        const VALIDATED = 0x10;
        const DECRYPTION_FORCED = 0x20;
    }
}

/// The trailer behind every data block.
#[derive(Copy, Clone, Debug)]
pub struct BlockTrailer {
    pub data_size: u16,
    pub signature: u16,
    pub checksum: u32,
    pub back_pointer: u64,
    /// Equal to `data_size` outside the 4k dialect.
    pub uncompressed_size: u16,
}

impl BlockTrailer {
    pub fn parse(data: &[u8], file_type: FileType) -> NdbResult<Self> {
        let mut cursor = Cursor::new(data);

        let data_size = cursor.read_u16::<LittleEndian>()?;
        let signature = cursor.read_u16::<LittleEndian>()?;

        match file_type {
            FileType::Ansi => {
                let back_pointer = u64::from(cursor.read_u32::<LittleEndian>()?);
                let checksum = cursor.read_u32::<LittleEndian>()?;
                Ok(Self {
                    data_size,
                    signature,
                    checksum,
                    back_pointer,
                    uncompressed_size: data_size,
                })
            }
            FileType::Unicode => {
                let checksum = cursor.read_u32::<LittleEndian>()?;
                let back_pointer = cursor.read_u64::<LittleEndian>()?;
                Ok(Self {
                    data_size,
                    signature,
                    checksum,
                    back_pointer,
                    uncompressed_size: data_size,
                })
            }
            FileType::Unicode4k => {
                let checksum = cursor.read_u32::<LittleEndian>()?;
                let back_pointer = cursor.read_u64::<LittleEndian>()?;
                cursor.seek(SeekFrom::Current(2))?;
                let uncompressed_size = cursor.read_u16::<LittleEndian>()?;
                Ok(Self {
                    data_size,
                    signature,
                    checksum,
                    back_pointer,
                    uncompressed_size,
                })
            }
        }
    }
}

/// On-disk footprint of a block with logical size `size`: padded up to the
/// increment, plus one more increment when the padding cannot hold the
/// trailer.
pub const fn aligned_block_size(size: u32, file_type: FileType) -> u32 {
    let increment = file_type.block_increment();
    let mut aligned = size.div_ceil(increment) * increment;
    if aligned - size < file_type.block_trailer_size() {
        aligned += increment;
    }
    aligned
}

/// A loaded, validated and possibly decompressed data block.
#[derive(Clone, Debug)]
pub struct DataBlock {
    data: Vec<u8>,
    logical_size: u32,
    uncompressed_size: u32,
    stored_checksum: u32,
    back_pointer: u64,
    signature: u16,
    flags: BlockFlags,
}

impl DataBlock {
    /// The caller-visible payload bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    pub fn logical_size(&self) -> u32 {
        self.logical_size
    }

    pub fn uncompressed_size(&self) -> u32 {
        self.uncompressed_size
    }

    pub fn stored_checksum(&self) -> u32 {
        self.stored_checksum
    }

    pub fn back_pointer(&self) -> u64 {
        self.back_pointer
    }

    pub fn signature(&self) -> u16 {
        self.signature
    }

    pub fn flags(&self) -> BlockFlags {
        self.flags
    }
}

/// Tolerance toggles threaded down from the store options.
#[derive(Copy, Clone, Default, Debug)]
pub struct BlockReadOptions {
    pub tolerate_checksum_errors: bool,
    pub tolerate_id_mismatch: bool,
}

/// Read the block stored under `data_id` at `offset` with logical size
/// `size`, validate its trailer, and decompress it when the 4k trailer says
/// the payload is compressed.
///
/// Decryption is a separate step ([`decrypt_block`]); compressed blocks are
/// never encrypted.
pub fn read_block<R: Read + Seek>(
    f: &mut R,
    data_id: u64,
    offset: u64,
    size: u32,
    file_type: FileType,
    options: BlockReadOptions,
) -> NdbResult<DataBlock> {
    if size == 0 {
        return Err(NdbError::InvalidBlockSize(size));
    }

    let aligned_size = aligned_block_size(size, file_type);
    if aligned_size > file_type.max_block_size() {
        return Err(NdbError::InvalidBlockSize(aligned_size));
    }

    let mut data = vec![0_u8; aligned_size as usize];
    f.seek(SeekFrom::Start(offset))?;
    f.read_exact(&mut data)?;

    let trailer_size = file_type.block_trailer_size() as usize;
    let trailer_offset = data.len() - trailer_size;
    let trailer = BlockTrailer::parse(&data[trailer_offset..], file_type)?;

    let mut flags = BlockFlags::empty();

    if u32::from(trailer.data_size) != size {
        flags |= BlockFlags::SIZE_MISMATCH;
        if !options.tolerate_checksum_errors {
            return Err(NdbError::MismatchBlockSize {
                stored: u32::from(trailer.data_size),
                expected: size,
            });
        }
    }

    if trailer.checksum != 0 {
        let computed = compute_crc(0, &data[..size as usize]);
        if computed != trailer.checksum {
            flags |= BlockFlags::CRC_MISMATCH;
            if !options.tolerate_checksum_errors {
                return Err(NdbError::InvalidBlockCrc {
                    stored: trailer.checksum,
                    computed,
                });
            }
        }
    }

    if trailer.back_pointer != 0 && trailer.back_pointer != data_id {
        flags |= BlockFlags::ID_MISMATCH;
        if !options.tolerate_id_mismatch {
            return Err(NdbError::MismatchBlockId {
                expected: data_id,
                found: trailer.back_pointer,
            });
        }
    }

    flags |= BlockFlags::VALIDATED;

    let logical_size = u32::from(trailer.data_size).min(size).min(trailer_offset as u32);
    let mut uncompressed_size = u32::from(trailer.uncompressed_size);

    let compressed = file_type.supports_compression()
        && logical_size != 0
        && uncompressed_size != 0
        && logical_size != uncompressed_size;

    let data = if compressed {
        flags |= BlockFlags::COMPRESSED;
        decompress(&data[..logical_size as usize], uncompressed_size as usize)?
    } else {
        uncompressed_size = logical_size;
        data.truncate(logical_size as usize);
        data
    };

    Ok(DataBlock {
        data,
        logical_size,
        uncompressed_size,
        stored_checksum: trailer.checksum,
        back_pointer: trailer.back_pointer,
        signature: trailer.signature,
        flags,
    })
}

fn decompress(data: &[u8], uncompressed_size: usize) -> NdbResult<Vec<u8>> {
    let mut decoder = flate2::bufread::DeflateDecoder::new(data);
    let mut decompressed = Vec::with_capacity(uncompressed_size);
    decoder
        .read_to_end(&mut decompressed)
        .map_err(|err| NdbError::DecompressionFailed(err.to_string()))?;
    if decompressed.len() != uncompressed_size {
        return Err(NdbError::DecompressionFailed(format!(
            "expected {} bytes, produced {}",
            uncompressed_size,
            decompressed.len()
        )));
    }
    Ok(decompressed)
}

/// The signature bytes a property table carries at payload offsets 2 and 3.
/// Used to detect stores that claim no encryption but hold encrypted data.
const TABLE_SIGNATURE_BYTE: u8 = 0xEC;
const TABLE_SIGNATURE_TYPES: [u8; 8] = [0x6C, 0x7C, 0x8C, 0x9C, 0xA5, 0xAC, 0xBC, 0xCC];

pub(crate) fn has_table_signature(data: &[u8]) -> bool {
    data.len() > 4
        && data[2] == TABLE_SIGNATURE_BYTE
        && TABLE_SIGNATURE_TYPES.contains(&data[3])
}

/// Descriptor identifier types whose main stream is a property table.
fn descriptor_contains_table(descriptor_id: u64) -> bool {
    match descriptor_id_type(descriptor_id) {
        0x01 => matches!(
            descriptor_id,
            DESCRIPTOR_ID_MESSAGE_STORE
                | DESCRIPTOR_ID_NAME_TO_ID_MAP
                | 0x801
                | 0x821
                | 0x841
                | 0xC01
        ),
        0x02 | 0x03 | 0x04 | 0x08 | 0x0D | 0x0E | 0x0F | 0x10 | 0x11 | 0x12 | 0x16 | 0x17
        | 0x18 => true,
        _ => false,
    }
}

/// Outcome of [`decrypt_block`].
#[derive(Copy, Clone, Default, Debug)]
pub struct DecryptOutcome {
    /// Number of payload bytes processed.
    pub processed: usize,
    /// The store should latch forced decryption for all later reads.
    pub latch_forced: bool,
}

/// Apply the store's encryption type to a loaded block, in place.
///
/// Blocks whose data identifier carries the internal flag are stored as
/// plaintext. When the store claims no encryption, table-bearing
/// descriptors are probed for the table signature; a miss decrypts with the
/// compressible encoding and, if the signature then appears, reports that
/// the mislabeling should stick for the rest of the open file.
pub fn decrypt_block(
    block: &mut DataBlock,
    data_id: u64,
    descriptor_id: u64,
    store_encryption: EncryptionType,
    force_decryption: bool,
    probe_mislabeled_store: bool,
) -> DecryptOutcome {
    let mut encryption = store_encryption;
    let mut decrypt = !data_id_is_internal(data_id);
    let mut probe_forced = false;

    if store_encryption == EncryptionType::None {
        decrypt = false;
        if probe_mislabeled_store && block.data.len() > 4 {
            if descriptor_contains_table(descriptor_id) {
                if !has_table_signature(&block.data) {
                    probe_forced = true;
                    encryption = EncryptionType::Compressible;
                    decrypt = !data_id_is_internal(data_id);
                    block.flags |= BlockFlags::DECRYPTION_FORCED;
                }
            } else if force_decryption && !data_id_is_internal(data_id) {
                encryption = EncryptionType::Compressible;
                decrypt = true;
                block.flags |= BlockFlags::DECRYPTION_FORCED;
            }
        }
    }

    if !decrypt || encryption == EncryptionType::None {
        return DecryptOutcome::default();
    }

    match encryption {
        EncryptionType::Compressible => encode::compressible::decode_block(&mut block.data),
        EncryptionType::High => {
            encode::high::encode_decode_block(&mut block.data, data_id as u32)
        }
        EncryptionType::None => {}
    }

    DecryptOutcome {
        processed: block.data.len(),
        latch_forced: probe_forced && has_table_signature(&block.data),
    }
}

/// The first byte of an internal block holding a block tree.
pub const DATA_TREE_BLOCK_TYPE: u8 = 0x01;

const DATA_TREE_HEADER_SIZE: usize = 8;

/// A one- or two-level block tree: the payload is an ordered array of child
/// data identifiers rather than message bytes.
#[derive(Clone, Debug)]
pub struct DataTreeBlock {
    pub level: u8,
    pub total_size: u32,
    pub entries: Vec<u64>,
}

/// Interpret a block payload as a block tree if it carries the tree tag.
///
/// Returns `Ok(None)` for plain data blocks.
pub fn parse_data_tree(data: &[u8], file_type: FileType) -> NdbResult<Option<DataTreeBlock>> {
    if data.len() < DATA_TREE_HEADER_SIZE || data[0] != DATA_TREE_BLOCK_TYPE {
        return Ok(None);
    }

    let mut cursor = Cursor::new(data);
    cursor.seek(SeekFrom::Current(1))?;

    let level = cursor.read_u8()?;
    if !(1..=2).contains(&level) {
        return Err(NdbError::InvalidDataTreeLevel(level));
    }

    let entry_count = cursor.read_u16::<LittleEndian>()?;
    let total_size = cursor.read_u32::<LittleEndian>()?;

    let entry_size = if file_type.is_64bit() { 8 } else { 4 };
    let capacity = (data.len() - DATA_TREE_HEADER_SIZE) / entry_size;
    if usize::from(entry_count) > capacity {
        return Err(NdbError::InvalidDataTreeEntryCount(entry_count));
    }

    let mut entries = Vec::with_capacity(usize::from(entry_count));
    for _ in 0..entry_count {
        let entry = if file_type.is_64bit() {
            cursor.read_u64::<LittleEndian>()?
        } else {
            u64::from(cursor.read_u32::<LittleEndian>()?)
        };
        entries.push(entry);
    }

    Ok(Some(DataTreeBlock {
        level,
        total_size,
        entries,
    }))
}
