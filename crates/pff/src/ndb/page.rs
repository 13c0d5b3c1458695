//! ## Pages
//!
//! Fixed-size page I/O: 512 bytes in the 32-bit and 64-bit dialects, 4096
//! bytes in the 4k dialect. Every index and allocation page ends in a
//! trailer that names its own type twice, carries a weak CRC over the
//! payload, and repeats the identifier the pointing structure used to reach
//! it.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read, Seek, SeekFrom};

use super::*;
use crate::crc::compute_crc;

/// `type` / `type_copy`
///
/// ### See also
/// [PageTrailer]
#[repr(u8)]
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum PageType {
    /// Offset index (block B-tree) page
    OffsetIndex = 0x80,
    /// Descriptor index (node B-tree) page
    DescriptorIndex = 0x81,
    /// Free map page
    FreeMap = 0x82,
    /// Page allocation table page
    PageAllocationTable = 0x83,
    /// Data allocation table page
    DataAllocationTable = 0x84,
    /// Free page map page
    FreePageMap = 0x85,
    /// Density list page
    DensityList = 0x86,
}

impl TryFrom<u8> for PageType {
    type Error = NdbError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x80 => Ok(PageType::OffsetIndex),
            0x81 => Ok(PageType::DescriptorIndex),
            0x82 => Ok(PageType::FreeMap),
            0x83 => Ok(PageType::PageAllocationTable),
            0x84 => Ok(PageType::DataAllocationTable),
            0x85 => Ok(PageType::FreePageMap),
            0x86 => Ok(PageType::DensityList),
            _ => Err(NdbError::InvalidPageType(value)),
        }
    }
}

/// The trailer at the end of every index and allocation page.
#[derive(Copy, Clone, Debug)]
pub struct PageTrailer {
    page_type: PageType,
    signature: u16,
    back_pointer: u64,
    crc: u32,
}

impl PageTrailer {
    pub fn parse(data: &[u8], file_type: FileType) -> NdbResult<Self> {
        let mut cursor = Cursor::new(data);

        let mut page_type = [0_u8; 2];
        cursor.read_exact(&mut page_type)?;
        if page_type[0] != page_type[1] {
            return Err(NdbError::MismatchPageTypeRepeat(page_type[0], page_type[1]));
        }
        let page_type = PageType::try_from(page_type[0])?;

        let signature = cursor.read_u16::<LittleEndian>()?;

        let (back_pointer, crc) = match file_type {
            FileType::Ansi => {
                let back_pointer = u64::from(cursor.read_u32::<LittleEndian>()?);
                let crc = cursor.read_u32::<LittleEndian>()?;
                (back_pointer, crc)
            }
            FileType::Unicode | FileType::Unicode4k => {
                let crc = cursor.read_u32::<LittleEndian>()?;
                let back_pointer = cursor.read_u64::<LittleEndian>()?;
                (back_pointer, crc)
            }
        };

        Ok(Self {
            page_type,
            signature,
            back_pointer,
            crc,
        })
    }

    pub fn page_type(&self) -> PageType {
        self.page_type
    }

    pub fn signature(&self) -> u16 {
        self.signature
    }

    pub fn back_pointer(&self) -> u64 {
        self.back_pointer
    }

    pub fn crc(&self) -> u32 {
        self.crc
    }
}

/// A validated page: the payload in front of the trailer, plus the trailer.
pub struct Page {
    payload: Vec<u8>,
    trailer: PageTrailer,
    crc_mismatch: Option<(u32, u32)>,
}

impl Page {
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn trailer(&self) -> &PageTrailer {
        &self.trailer
    }

    /// `Some((stored, computed))` when the payload checksum did not match
    /// and checksum tolerance is enabled.
    pub fn crc_mismatch(&self) -> Option<(u32, u32)> {
        self.crc_mismatch
    }
}

/// Read a page, validate its trailer and classify its kind.
///
/// Validation order: the doubled type byte must agree with itself, the
/// payload checksum must match, the trailer's identifier must be the
/// identifier we arrived under, and the type must be one of `expected`.
/// Only the checksum failure can be downgraded: with
/// `tolerate_checksum_errors` set it is recorded on the returned page and
/// the remaining checks still run.
pub fn read_page<R: Read + Seek>(
    f: &mut R,
    page: PageRef,
    file_type: FileType,
    expected: &[PageType],
    tolerate_checksum_errors: bool,
) -> NdbResult<Page> {
    let page_size = file_type.page_size();
    let trailer_size = file_type.page_trailer_size();

    let mut data = vec![0_u8; page_size];
    f.seek(SeekFrom::Start(page.offset))?;
    f.read_exact(&mut data)?;

    let payload_size = page_size - trailer_size;
    let trailer = PageTrailer::parse(&data[payload_size..], file_type)?;

    let computed = compute_crc(0, &data[..payload_size]);
    let crc_mismatch = if computed != trailer.crc() {
        if !tolerate_checksum_errors {
            return Err(NdbError::InvalidPageCrc {
                stored: trailer.crc(),
                computed,
            });
        }
        Some((trailer.crc(), computed))
    } else {
        None
    };

    if trailer.back_pointer() != page.back_pointer {
        return Err(NdbError::MismatchPageBackPointer {
            expected: page.back_pointer,
            found: trailer.back_pointer(),
        });
    }

    if !expected.contains(&trailer.page_type()) {
        return Err(NdbError::UnexpectedPageType(trailer.page_type()));
    }

    data.truncate(payload_size);

    Ok(Page {
        payload: data,
        trailer,
        crc_mismatch,
    })
}
