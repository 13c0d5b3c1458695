//! ## Recovery Scanner
//!
//! Salvage of deleted items. Deleting a descriptor removes its index
//! entries and returns its blocks to the allocation table, but the block
//! bytes, trailers included, stay on disk until reused. The scanner sweeps
//! the unallocated data ranges in increment-sized strides, re-parses
//! plausible block trailers, and emits an orphan entry for every block that
//! still validates and looks like a property table.
//!
//! Everything found here is advisory: orphan data is untrusted and reads of
//! it are always error-tolerant.

use std::io::{Read, Seek, SeekFrom};

use super::allocation::RangeList;
use super::block::{aligned_block_size, has_table_signature, BlockTrailer};
use super::index::lookup_offset;
use super::*;
use crate::block_sig::compute_sig;
use crate::crc::compute_crc;
use crate::encode;

/// Synthetic descriptor identifiers for recovered items are allocated
/// upward from here, outside the 32-bit space real descriptors live in.
pub const RECOVERED_DESCRIPTOR_ID_BASE: u64 = 0x1_0000_0000;

/// A block reconstructed from unallocated space.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct OrphanEntry {
    /// Deterministic stand-in for the lost descriptor identifier.
    pub synthetic_descriptor_id: u64,
    /// The data identifier the block's trailer still carries.
    pub data_id: u64,
    pub file_offset: u64,
    pub data_size: u16,
}

/// Sweep the unallocated data ranges for orphaned blocks.
///
/// A candidate is accepted when its trailer names a non-zero size and
/// checksum, the checksum matches the bytes above it, the signature agrees
/// with the (offset, identifier) pair, the identifier is absent from the
/// live offset index, and the payload probes as a property table. The
/// result is sorted by (data identifier, file offset); synthetic descriptor
/// identifiers are assigned in that order.
pub fn scan_orphans<R: Read + Seek>(
    f: &mut R,
    file_type: FileType,
    offset_index_root: PageRef,
    unallocated_data: &RangeList,
    encryption_type: EncryptionType,
) -> NdbResult<Vec<OrphanEntry>> {
    let increment = u64::from(file_type.block_increment());
    let trailer_size = file_type.block_trailer_size() as usize;

    let mut orphans = Vec::new();

    for (range_offset, range_size) in unallocated_data.ranges().iter().copied() {
        let mut candidate_end = range_offset + increment;
        let range_end = range_offset + range_size;

        while candidate_end <= range_end {
            if let Some(orphan) = probe_candidate(
                f,
                file_type,
                offset_index_root,
                range_offset,
                candidate_end,
                trailer_size,
                encryption_type,
            )? {
                orphans.push(orphan);
            }
            candidate_end += increment;
        }
    }

    orphans.sort_by_key(|orphan| (orphan.data_id, orphan.file_offset));
    for (index, orphan) in orphans.iter_mut().enumerate() {
        orphan.synthetic_descriptor_id = RECOVERED_DESCRIPTOR_ID_BASE + index as u64;
    }

    Ok(orphans)
}

fn probe_candidate<R: Read + Seek>(
    f: &mut R,
    file_type: FileType,
    offset_index_root: PageRef,
    range_offset: u64,
    candidate_end: u64,
    trailer_size: usize,
    encryption_type: EncryptionType,
) -> NdbResult<Option<OrphanEntry>> {
    let mut trailer_data = vec![0_u8; trailer_size];
    f.seek(SeekFrom::Start(candidate_end - trailer_size as u64))?;
    f.read_exact(&mut trailer_data)?;

    let Ok(trailer) = BlockTrailer::parse(&trailer_data, file_type) else {
        return Ok(None);
    };

    if trailer.data_size == 0 || trailer.checksum == 0 || trailer.back_pointer == 0 {
        return Ok(None);
    }

    let aligned = u64::from(aligned_block_size(u32::from(trailer.data_size), file_type));
    let Some(block_offset) = candidate_end.checked_sub(aligned) else {
        return Ok(None);
    };
    if block_offset < range_offset {
        return Ok(None);
    }

    if trailer.signature != compute_sig(block_offset as u32, trailer.back_pointer as u32) {
        return Ok(None);
    }

    let mut data = vec![0_u8; usize::from(trailer.data_size)];
    f.seek(SeekFrom::Start(block_offset))?;
    f.read_exact(&mut data)?;
    if compute_crc(0, &data) != trailer.checksum {
        return Ok(None);
    }

    // A trailer whose identifier still resolves is live sharing, not an
    // orphan.
    if lookup_offset(f, file_type, offset_index_root, trailer.back_pointer, true)?.is_some() {
        return Ok(None);
    }

    // Probe for a property table in the decrypted payload; anything else is
    // a leaf of some larger stream we cannot re-root.
    if !data_id_is_internal(trailer.back_pointer) {
        match encryption_type {
            EncryptionType::Compressible => encode::compressible::decode_block(&mut data),
            EncryptionType::High => {
                encode::high::encode_decode_block(&mut data, trailer.back_pointer as u32)
            }
            EncryptionType::None => {}
        }
    }
    if !has_table_signature(&data) {
        return Ok(None);
    }

    Ok(Some(OrphanEntry {
        synthetic_descriptor_id: 0,
        data_id: trailer.back_pointer,
        file_offset: block_offset,
        data_size: trailer.data_size,
    }))
}
