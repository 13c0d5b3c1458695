//! ## Allocation Tables
//!
//! Bit-packed space accounting. Each allocation or free map page carries a
//! bitmap whose bits cover a fixed-size unit of the file, MSB first; a zero
//! bit marks the unit unallocated. Scanning produces merged lists of
//! unallocated ranges, the raw material for the recovery scanner.

use std::io::{Read, Seek};

use super::page::{read_page, Page, PageType};
use super::*;

/// An ordered, coalescing list of `[offset, offset + size)` intervals.
#[derive(Clone, Default, Debug)]
pub struct RangeList {
    ranges: Vec<(u64, u64)>,
}

impl RangeList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a range, merging it with any overlapping or adjacent ranges.
    pub fn insert(&mut self, offset: u64, size: u64) {
        if size == 0 {
            return;
        }

        let end = offset + size;
        let index = self
            .ranges
            .partition_point(|(start, length)| start + length < offset);

        let mut merged_start = offset;
        let mut merged_end = end;
        let mut remove = 0;
        for (start, length) in &self.ranges[index..] {
            if *start > end {
                break;
            }
            merged_start = merged_start.min(*start);
            merged_end = merged_end.max(start + length);
            remove += 1;
        }

        self.ranges
            .splice(index..index + remove, [(merged_start, merged_end - merged_start)]);
    }

    /// `(offset, size)` pairs in ascending order.
    pub fn ranges(&self) -> &[(u64, u64)] {
        &self.ranges
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn total_size(&self) -> u64 {
        self.ranges.iter().map(|(_, size)| size).sum()
    }

    pub fn contains(&self, offset: u64) -> bool {
        self.ranges
            .iter()
            .any(|(start, length)| (*start..start + length).contains(&offset))
    }
}

fn allocation_unit(page_type: PageType, file_type: FileType) -> NdbResult<(u64, i64)> {
    match page_type {
        PageType::DataAllocationTable | PageType::FreeMap => Ok((64, 0)),
        PageType::PageAllocationTable | PageType::FreePageMap => {
            // The page flavor has never been observed in a 4k-page file.
            if file_type == FileType::Unicode4k {
                return Err(NdbError::PageAllocationTableIn4kFile);
            }
            Ok((512, -0x200))
        }
        _ => Err(NdbError::InvalidAllocationTableType(page_type as u8)),
    }
}

/// Decode the bitmap of an allocation or free map page into `list`.
///
/// The covered file region starts at the page's back pointer (biased by
/// -0x200 for the page flavor); each bit covers one unit, MSB first.
pub fn scan_allocation_page(
    page: &Page,
    file_type: FileType,
    list: &mut RangeList,
) -> NdbResult<()> {
    let page_type = page.trailer().page_type();
    let (unit, bias) = allocation_unit(page_type, file_type)?;

    let payload = page.payload();
    // The 32-bit layout pads the bitmap to the trailer alignment with four
    // leading bytes.
    let bitmap_offset = match file_type {
        FileType::Ansi => 4,
        FileType::Unicode | FileType::Unicode4k => 0,
    };
    let bitmap = &payload[bitmap_offset..bitmap_offset + file_type.map_bits_size()];

    let mut cursor = page.trailer().back_pointer().wrapping_add_signed(bias);
    let mut run_offset = 0_u64;
    let mut run_size = 0_u64;

    for entry in bitmap {
        let mut entry = *entry;
        for _ in 0..8 {
            if entry & 0x80 == 0 {
                if run_size == 0 {
                    run_offset = cursor;
                }
                run_size += unit;
            } else if run_size > 0 {
                list.insert(run_offset, run_size);
                run_size = 0;
            }
            entry <<= 1;
            cursor += unit;
        }
    }
    if run_size > 0 {
        list.insert(run_offset, run_size);
    }

    Ok(())
}

/// Read the allocation or free map page at `page` and merge its unallocated
/// units into `list`.
pub fn read_allocation_page<R: Read + Seek>(
    f: &mut R,
    page: PageRef,
    file_type: FileType,
    expected: &[PageType],
    tolerate_checksum_errors: bool,
    list: &mut RangeList,
) -> NdbResult<Option<(u32, u32)>> {
    let page = read_page(f, page, file_type, expected, tolerate_checksum_errors)?;
    let crc_mismatch = page.crc_mismatch();
    scan_allocation_page(&page, file_type, list)?;
    Ok(crc_mismatch)
}
