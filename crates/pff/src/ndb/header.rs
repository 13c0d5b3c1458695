//! ## File Header
//!
//! The first 564 bytes of a PFF file: the signature, the dialect and content
//! type, the encryption type, and the root page references of the two index
//! B-trees.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read, Seek, SeekFrom};

use super::*;
use crate::crc::compute_crc;

pub const HEADER_SIZE: usize = 564;

/// `!BDN`
const FILE_SIGNATURE: [u8; 4] = [0x21, 0x42, 0x44, 0x4E];

const HEADER_SENTINEL: u8 = 0x80;

/// The weak CRC at offset 4 covers this many bytes starting at offset 8.
const HEADER_CRC_SIZE: usize = 471;

/// The 64-bit dialects carry a second CRC over this many bytes starting at
/// offset 8; it is stored right behind the covered window.
const HEADER_FULL_CRC_SIZE: usize = 516;
const HEADER_FULL_CRC_OFFSET: usize = 8 + HEADER_FULL_CRC_SIZE;

/// Absolute offsets of the sentinel byte in the 32-bit and 64-bit layouts.
/// Exactly one of them holds 0x80; that is the probe for ambiguous
/// `data_version` values.
const SENTINEL_OFFSET_32: usize = 460;
const SENTINEL_OFFSET_64: usize = 512;

#[derive(Clone, Debug)]
pub struct FileHeader {
    file_type: FileType,
    content_type: ContentType,
    data_version: u16,
    content_version: u16,
    creation_platform: u8,
    access_platform: u8,
    file_size: u64,
    descriptor_index_root: PageRef,
    offset_index_root: PageRef,
    encryption_type: EncryptionType,
    allocation_table_valid: bool,
}

impl FileHeader {
    pub fn read(f: &mut dyn Read) -> NdbResult<Self> {
        let mut data = [0_u8; HEADER_SIZE];
        f.read_exact(&mut data)?;
        Self::parse(&data)
    }

    pub fn parse(data: &[u8; HEADER_SIZE]) -> NdbResult<Self> {
        // signature
        let mut signature = [0_u8; 4];
        signature.copy_from_slice(&data[0..4]);
        if signature != FILE_SIGNATURE {
            return Err(NdbError::InvalidFileSignature(signature));
        }

        let mut cursor = Cursor::new(data.as_slice());
        cursor.seek(SeekFrom::Start(4))?;

        // checksum
        let stored_crc = cursor.read_u32::<LittleEndian>()?;
        let computed_crc = compute_crc(0, &data[8..8 + HEADER_CRC_SIZE]);
        if stored_crc != computed_crc {
            return Err(NdbError::InvalidHeaderCrc {
                stored: stored_crc,
                computed: computed_crc,
            });
        }

        // content_type
        let content_type = ContentType::try_from(cursor.read_u16::<LittleEndian>()?)?;

        // data_version
        let data_version = cursor.read_u16::<LittleEndian>()?;
        let file_type = detect_file_type(data_version, data)?;

        // content_version
        let content_version = cursor.read_u16::<LittleEndian>()?;

        // creation_platform, access_platform
        let creation_platform = cursor.read_u8()?;
        let access_platform = cursor.read_u8()?;

        if file_type.is_64bit() {
            let stored_crc = u32::from_le_bytes([
                data[HEADER_FULL_CRC_OFFSET],
                data[HEADER_FULL_CRC_OFFSET + 1],
                data[HEADER_FULL_CRC_OFFSET + 2],
                data[HEADER_FULL_CRC_OFFSET + 3],
            ]);
            let computed_crc = compute_crc(0, &data[8..8 + HEADER_FULL_CRC_SIZE]);
            if stored_crc != computed_crc {
                return Err(NdbError::InvalidHeaderFullCrc {
                    stored: stored_crc,
                    computed: computed_crc,
                });
            }
        }

        // The dialect-specific body starts behind the two unknown dwords at
        // offset 16.
        cursor.seek(SeekFrom::Start(24))?;
        let body = match file_type {
            FileType::Ansi => read_body_32(&mut cursor)?,
            FileType::Unicode | FileType::Unicode4k => read_body_64(&mut cursor)?,
        };

        if body.sentinel != HEADER_SENTINEL {
            return Err(NdbError::InvalidHeaderSentinel(body.sentinel));
        }

        let encryption_type = EncryptionType::try_from(body.encryption_type)?;

        for root in [&body.descriptor_index_root, &body.offset_index_root] {
            if root.offset > i64::MAX as u64 {
                return Err(NdbError::InvalidRootOffset(root.offset));
            }
        }

        Ok(Self {
            file_type,
            content_type,
            data_version,
            content_version,
            creation_platform,
            access_platform,
            file_size: body.file_size,
            descriptor_index_root: body.descriptor_index_root,
            offset_index_root: body.offset_index_root,
            encryption_type,
            allocation_table_valid: body.allocation_table_validation_type != 0,
        })
    }

    pub fn file_type(&self) -> FileType {
        self.file_type
    }

    pub fn content_type(&self) -> ContentType {
        self.content_type
    }

    pub fn data_version(&self) -> u16 {
        self.data_version
    }

    pub fn content_version(&self) -> u16 {
        self.content_version
    }

    pub fn creation_platform(&self) -> u8 {
        self.creation_platform
    }

    pub fn access_platform(&self) -> u8 {
        self.access_platform
    }

    /// The file size recorded in the header, which may lag the real size.
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn descriptor_index_root(&self) -> PageRef {
        self.descriptor_index_root
    }

    pub fn offset_index_root(&self) -> PageRef {
        self.offset_index_root
    }

    pub fn encryption_type(&self) -> EncryptionType {
        self.encryption_type
    }

    pub fn allocation_table_valid(&self) -> bool {
        self.allocation_table_valid
    }
}

fn detect_file_type(data_version: u16, data: &[u8; HEADER_SIZE]) -> NdbResult<FileType> {
    if data_version <= 0x000F {
        return Ok(FileType::Ansi);
    }
    if data_version >= 0x0024 {
        return Ok(FileType::Unicode4k);
    }
    if data_version >= 0x0015 {
        return Ok(FileType::Unicode);
    }

    // 0x0010..=0x0014 has been observed in the wild; the sentinel byte sits
    // at a different offset in each layout and decides the dialect.
    let sentinel_32 = data[SENTINEL_OFFSET_32] == HEADER_SENTINEL;
    let sentinel_64 = data[SENTINEL_OFFSET_64] == HEADER_SENTINEL;
    match (sentinel_32, sentinel_64) {
        (true, false) => Ok(FileType::Ansi),
        (false, true) => Ok(FileType::Unicode),
        _ => Err(NdbError::UnsupportedDataVersion(data_version)),
    }
}

struct HeaderBody {
    file_size: u64,
    descriptor_index_root: PageRef,
    offset_index_root: PageRef,
    allocation_table_validation_type: u8,
    sentinel: u8,
    encryption_type: u8,
}

fn read_body_32(cursor: &mut Cursor<&[u8]>) -> NdbResult<HeaderBody> {
    // next_index_pointer, next_index_back_pointer, seed_value
    cursor.seek(SeekFrom::Current(12))?;

    // descriptors_index_high_water_marks
    cursor.seek(SeekFrom::Current(128))?;

    // unknown
    cursor.seek(SeekFrom::Current(4))?;

    // file_size
    let file_size = u64::from(cursor.read_u32::<LittleEndian>()?);

    // last_data_allocation_table_offset, total_available_data_size,
    // total_available_page_size
    cursor.seek(SeekFrom::Current(12))?;

    // descriptors index root
    let back_pointer = u64::from(cursor.read_u32::<LittleEndian>()?);
    let offset = u64::from(cursor.read_u32::<LittleEndian>()?);
    let descriptor_index_root = PageRef {
        back_pointer,
        offset,
    };

    // offsets index root
    let back_pointer = u64::from(cursor.read_u32::<LittleEndian>()?);
    let offset = u64::from(cursor.read_u32::<LittleEndian>()?);
    let offset_index_root = PageRef {
        back_pointer,
        offset,
    };

    // allocation_table_validation_type
    let allocation_table_validation_type = cursor.read_u8()?;

    // unknown
    cursor.seek(SeekFrom::Current(3))?;

    // initial_data_free_map, initial_page_free_map
    cursor.seek(SeekFrom::Current(256))?;

    // sentinel
    let sentinel = cursor.read_u8()?;

    // encryption_type
    let encryption_type = cursor.read_u8()?;

    Ok(HeaderBody {
        file_size,
        descriptor_index_root,
        offset_index_root,
        allocation_table_validation_type,
        sentinel,
        encryption_type,
    })
}

fn read_body_64(cursor: &mut Cursor<&[u8]>) -> NdbResult<HeaderBody> {
    // unknown, next_index_back_pointer, seed_value
    cursor.seek(SeekFrom::Current(20))?;

    // descriptors_index_high_water_marks
    cursor.seek(SeekFrom::Current(128))?;

    // unknown, unknown
    cursor.seek(SeekFrom::Current(12))?;

    // file_size
    let file_size = cursor.read_u64::<LittleEndian>()?;

    // last_data_allocation_table_offset, total_available_data_size,
    // total_available_page_size
    cursor.seek(SeekFrom::Current(24))?;

    // descriptors index root
    let back_pointer = cursor.read_u64::<LittleEndian>()?;
    let offset = cursor.read_u64::<LittleEndian>()?;
    let descriptor_index_root = PageRef {
        back_pointer,
        offset,
    };

    // offsets index root
    let back_pointer = cursor.read_u64::<LittleEndian>()?;
    let offset = cursor.read_u64::<LittleEndian>()?;
    let offset_index_root = PageRef {
        back_pointer,
        offset,
    };

    // allocation_table_validation_type
    let allocation_table_validation_type = cursor.read_u8()?;

    // unknown, unknown
    cursor.seek(SeekFrom::Current(7))?;

    // initial_data_free_map, initial_page_free_map
    cursor.seek(SeekFrom::Current(256))?;

    // sentinel
    let sentinel = cursor.read_u8()?;

    // encryption_type
    let encryption_type = cursor.read_u8()?;

    Ok(HeaderBody {
        file_size,
        descriptor_index_root,
        offset_index_root,
        allocation_table_validation_type,
        sentinel,
        encryption_type,
    })
}
