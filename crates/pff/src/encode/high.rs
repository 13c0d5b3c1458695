//! ## High Encoding
//!
//! The keyed byte mix used when the store's encryption type is `High`. The
//! key is the low 32 bits of the data identifier, folded to 16 bits and
//! incremented per byte. The same routine both encodes and decodes.

use super::*;

/// Encode or decode a data block payload in place.
pub fn encode_decode_block(data: &mut [u8], key: u32) {
    let r_table = key_data_r();
    let s_table = key_data_s();
    let i_table = key_data_i();

    let mut key = (key ^ (key >> 16)) as u16;

    for b in data.iter_mut() {
        let low_key = key as u8;
        let high_key = (key >> 8) as u8;

        *b = (*b).wrapping_add(low_key);
        *b = r_table[*b as usize];
        *b = (*b).wrapping_add(high_key);
        *b = s_table[*b as usize];
        *b = (*b).wrapping_sub(high_key);
        *b = i_table[*b as usize];
        *b = (*b).wrapping_sub(low_key);

        key = key.wrapping_add(1);
    }
}
