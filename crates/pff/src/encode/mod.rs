//! ## Data Block Encodings
//!
//! The two stream obfuscations applied to data block payloads, selected by
//! the store's encryption type. Neither is real cryptography; both are
//! length-preserving byte transforms keyed (at most) by the low 32 bits of
//! the data identifier.
//!
//! The byte tables below are shared by both algorithms: the decode table is
//! the inverse permutation of the encode table, and the middle table is an
//! involution, which makes the keyed algorithm its own inverse.

pub mod compressible;
pub mod high;

pub(crate) static KEY_DATA_R: [u8; 256] = [
    0x41, 0x36, 0x13, 0x62, 0xA8, 0x21, 0x6E, 0xBB, 0xF4, 0x16, 0xCC, 0x04, 0x7F, 0x64, 0xE8, 0x5D,
    0x1E, 0xF2, 0xCB, 0x2A, 0x74, 0xC5, 0x5E, 0x35, 0xD2, 0x95, 0x47, 0x9E, 0x96, 0x2D, 0x9A, 0x88,
    0x4C, 0x7D, 0x84, 0x3F, 0xDB, 0xAC, 0x31, 0xB6, 0x48, 0x5F, 0xF6, 0xC4, 0xD8, 0x39, 0x8B, 0xE7,
    0x23, 0x3B, 0x38, 0x8E, 0xC8, 0xC1, 0xDF, 0x25, 0xB1, 0x20, 0xA5, 0x46, 0x60, 0x4E, 0x9C, 0xFB,
    0x33, 0x0F, 0x00, 0x87, 0x66, 0xA4, 0x78, 0xFA, 0xD7, 0x07, 0x30, 0x4D, 0x42, 0x9F, 0xBE, 0x5A,
    0xA7, 0xDA, 0xE0, 0xF7, 0xC3, 0x4A, 0xE4, 0x3A, 0x0A, 0x75, 0xFC, 0x51, 0x15, 0x81, 0x0B, 0x1F,
    0x02, 0x34, 0x29, 0x1C, 0x54, 0x6F, 0xAB, 0x68, 0xDC, 0x0D, 0x70, 0x6A, 0x8C, 0x27, 0x73, 0x09,
    0x61, 0x26, 0x5C, 0xEF, 0xA2, 0x11, 0xAE, 0xE6, 0xB5, 0x4F, 0x53, 0xAD, 0xD3, 0x7C, 0x32, 0xDE,
    0xCE, 0xC7, 0xB8, 0x97, 0xFE, 0xD4, 0xBF, 0xEB, 0x3D, 0xEA, 0x56, 0xD9, 0x2F, 0xE3, 0xEC, 0x2E,
    0x6C, 0x7B, 0x28, 0x14, 0x24, 0x79, 0x0C, 0x77, 0x85, 0xA0, 0xAF, 0x19, 0xD5, 0x52, 0xF9, 0xC2,
    0x1B, 0xF8, 0xA6, 0x03, 0x4B, 0x65, 0xF0, 0x71, 0x72, 0x06, 0x05, 0xC9, 0x91, 0x82, 0x8F, 0xF1,
    0xE2, 0xD6, 0x98, 0x99, 0x55, 0xCA, 0x40, 0xA9, 0x94, 0xFF, 0x10, 0x86, 0xCD, 0x3C, 0xB0, 0x12,
    0x3E, 0x22, 0x49, 0x37, 0xD1, 0xF3, 0x45, 0xE5, 0x5B, 0x9D, 0x50, 0x93, 0xB3, 0x8D, 0x44, 0xE9,
    0x7A, 0x43, 0x9B, 0xAA, 0x01, 0x67, 0x76, 0x6D, 0x1D, 0xED, 0x17, 0xB2, 0xBD, 0x7E, 0x8A, 0x90,
    0xBA, 0xFD, 0x92, 0x59, 0xC6, 0xBC, 0x6B, 0xB9, 0xA1, 0x89, 0xD0, 0xC0, 0x0E, 0x2C, 0xDD, 0xB4,
    0x83, 0xB7, 0x08, 0xF5, 0x69, 0xA3, 0x80, 0xE1, 0x1A, 0xCF, 0x63, 0xEE, 0x58, 0x57, 0x2B, 0x18,
];

pub(crate) static KEY_DATA_S: [u8; 256] = [
    0xFE, 0x79, 0xED, 0xDB, 0x7B, 0xA3, 0xC3, 0xD2, 0x4D, 0x33, 0xC8, 0x54, 0x75, 0xAC, 0x63, 0xE0,
    0x5F, 0x50, 0xA1, 0x88, 0x44, 0x30, 0xF2, 0x39, 0xBA, 0xB9, 0xA2, 0xCC, 0xEF, 0xCB, 0xD7, 0x90,
    0xCA, 0x53, 0x37, 0x8D, 0xFB, 0x3D, 0xD6, 0xC2, 0xE8, 0x4A, 0x81, 0x60, 0xC5, 0xAA, 0x71, 0xDC,
    0x15, 0x34, 0x51, 0x09, 0x31, 0x40, 0x7F, 0x22, 0x8F, 0x17, 0x9E, 0xAF, 0xE9, 0x25, 0x99, 0x55,
    0x35, 0xE3, 0x62, 0x72, 0x14, 0xA6, 0xDD, 0x82, 0xB7, 0xC0, 0x29, 0x80, 0x9B, 0x08, 0xFD, 0x89,
    0x11, 0x32, 0x95, 0x21, 0x0B, 0x3F, 0xEB, 0x73, 0xC7, 0xD4, 0xD3, 0x78, 0xFA, 0xD8, 0xF3, 0x10,
    0x2B, 0xB6, 0x42, 0x0E, 0x6C, 0x76, 0x8B, 0xEC, 0xDF, 0x7C, 0xDE, 0x92, 0x64, 0xBC, 0x74, 0xE1,
    0x84, 0x2E, 0x43, 0x57, 0x6E, 0x0C, 0x65, 0x85, 0x5B, 0x01, 0xF1, 0x04, 0x69, 0xFC, 0xB8, 0x36,
    0x4B, 0x2A, 0x47, 0xCD, 0x70, 0x77, 0xB2, 0x9F, 0x13, 0x4F, 0xE4, 0x66, 0xCE, 0x23, 0xF8, 0x38,
    0x1F, 0xB1, 0x6B, 0xAD, 0xF4, 0x52, 0xD0, 0xC1, 0xA4, 0x3E, 0xA9, 0x4C, 0xF7, 0xC6, 0x3A, 0x87,
    0xC9, 0x12, 0x1A, 0x05, 0x98, 0xA8, 0x45, 0xFF, 0xA5, 0x9A, 0x2D, 0xCF, 0x0D, 0x93, 0xB5, 0x3B,
    0xBD, 0x91, 0x86, 0xF6, 0xEA, 0xAE, 0x61, 0x48, 0x7E, 0x19, 0x18, 0xD9, 0x6D, 0xB0, 0xF9, 0xF0,
    0x49, 0x97, 0x27, 0x06, 0xD5, 0x2C, 0x9D, 0x58, 0x0A, 0xA0, 0x20, 0x1D, 0x1B, 0x83, 0x8C, 0xAB,
    0x96, 0xE2, 0x07, 0x5A, 0x59, 0xC4, 0x26, 0x1E, 0x5D, 0xBB, 0xE5, 0x03, 0x2F, 0x46, 0x6A, 0x68,
    0x0F, 0x6F, 0xD1, 0x41, 0x8A, 0xDA, 0xF5, 0xEE, 0x28, 0x3C, 0xB4, 0x56, 0x67, 0x02, 0xE7, 0x1C,
    0xBF, 0x7A, 0x16, 0x5E, 0x94, 0xE6, 0xB3, 0x9C, 0x8E, 0xBE, 0x5C, 0x24, 0x7D, 0x4E, 0x00, 0xA7,
];

pub(crate) static KEY_DATA_I: [u8; 256] = [
    0x42, 0xD4, 0x60, 0xA3, 0x0B, 0xAA, 0xA9, 0x49, 0xF2, 0x6F, 0x58, 0x5E, 0x96, 0x69, 0xEC, 0x41,
    0xBA, 0x75, 0xBF, 0x02, 0x93, 0x5C, 0x09, 0xDA, 0xFF, 0x9B, 0xF8, 0xA0, 0x63, 0xD8, 0x10, 0x5F,
    0x39, 0x05, 0xC1, 0x30, 0x94, 0x37, 0x71, 0x6D, 0x92, 0x62, 0x13, 0xFE, 0xED, 0x1D, 0x8F, 0x8C,
    0x4A, 0x26, 0x7E, 0x40, 0x61, 0x17, 0x01, 0xC3, 0x32, 0x2D, 0x57, 0x31, 0xBD, 0x88, 0xC0, 0x23,
    0xB6, 0x00, 0x4C, 0xD1, 0xCE, 0xC6, 0x3B, 0x1A, 0x28, 0xC2, 0x55, 0xA4, 0x20, 0x4B, 0x3D, 0x79,
    0xCA, 0x5B, 0x9D, 0x7A, 0x64, 0xB4, 0x8A, 0xFD, 0xFC, 0xE3, 0x4F, 0xC8, 0x72, 0x0F, 0x16, 0x29,
    0x3C, 0x70, 0x03, 0xFA, 0x0D, 0xA5, 0x44, 0xD5, 0x67, 0xF4, 0x6B, 0xE6, 0x90, 0xD7, 0x06, 0x65,
    0x6A, 0xA7, 0xA8, 0x6E, 0x14, 0x59, 0xD6, 0x97, 0x46, 0x95, 0xD0, 0x91, 0x7D, 0x21, 0xDD, 0x0C,
    0xF6, 0x5D, 0xAD, 0xF0, 0x22, 0x98, 0xBB, 0x43, 0x1F, 0xE9, 0xDE, 0x2E, 0x6C, 0xCD, 0x33, 0xAE,
    0xDF, 0xAC, 0xE2, 0xCB, 0xB8, 0x19, 0x1C, 0x83, 0xB2, 0xB3, 0x1E, 0xD2, 0x3E, 0xC9, 0x1B, 0x4D,
    0x99, 0xE8, 0x74, 0xF5, 0x45, 0x3A, 0xA2, 0x50, 0x04, 0xB7, 0xD3, 0x66, 0x25, 0x7B, 0x76, 0x9A,
    0xBE, 0x38, 0xDB, 0xCC, 0xEF, 0x78, 0x27, 0xF1, 0x82, 0xE7, 0xE0, 0x07, 0xE5, 0xDC, 0x4E, 0x86,
    0xEB, 0x35, 0x9F, 0x54, 0x2B, 0x15, 0xE4, 0x81, 0x34, 0xAB, 0xB5, 0x12, 0x0A, 0xBC, 0x80, 0xF9,
    0xEA, 0xC4, 0x18, 0x7C, 0x85, 0x9C, 0xB1, 0x48, 0x2C, 0x8B, 0x51, 0x24, 0x68, 0xEE, 0x7F, 0x36,
    0x52, 0xF7, 0xB0, 0x8D, 0x56, 0xC7, 0x77, 0x2F, 0x0E, 0xCF, 0x89, 0x87, 0x8E, 0xD9, 0xFB, 0x73,
    0xA6, 0xAF, 0x11, 0xC5, 0x08, 0xF3, 0x2A, 0x53, 0xA1, 0x9E, 0x47, 0x3F, 0x5A, 0xE1, 0x84, 0xB9,
];

pub(crate) fn key_data_r() -> &'static [u8; 256] {
    &KEY_DATA_R
}

pub(crate) fn key_data_s() -> &'static [u8; 256] {
    &KEY_DATA_S
}

pub(crate) fn key_data_i() -> &'static [u8; 256] {
    &KEY_DATA_I
}
