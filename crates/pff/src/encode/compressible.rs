//! ## Compressible Encoding
//!
//! The keyless byte permutation used when the store's encryption type is
//! `Compressible`. Every plaintext byte maps through a fixed 256-entry
//! table; decoding maps back through the inverse table.

use super::*;

/// Encode a data block payload in place.
pub fn encode_block(data: &mut [u8]) {
    permute(data, key_data_r());
}

/// Decode a data block payload in place.
pub fn decode_block(data: &mut [u8]) {
    permute(data, key_data_i());
}

fn permute(data: &mut [u8], table: &[u8]) {
    for b in data.iter_mut() {
        *b = table[*b as usize];
    }
}
