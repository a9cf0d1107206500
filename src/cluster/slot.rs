//! Hash slot calculation
//!
//! Keys map to one of 16384 slots via CRC16 (XMODEM) of the key, or of
//! its hash tag when the key contains a non-empty `{...}` section.

/// Number of hash slots in a cluster
pub const SLOT_COUNT: usize = 16384;

/// Calculate slot for key using CRC16
pub fn slot_for_key(key: &[u8]) -> u16 {
    crc16(hash_tag(key)) % SLOT_COUNT as u16
}

/// Portion of the key that is hashed
///
/// The substring between the first `{` and the next `}` after it, if
/// that substring is non-empty; otherwise the whole key.
pub fn hash_tag(key: &[u8]) -> &[u8] {
    if let Some(start) = key.iter().position(|&b| b == b'{') {
        if let Some(end) = key[start + 1..].iter().position(|&b| b == b'}') {
            if end > 0 {
                return &key[start + 1..start + 1 + end];
            }
        }
    }
    key
}

/// CRC16 implementation for cluster slot calculation (XMODEM, poly 0x1021)
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}
