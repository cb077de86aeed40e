//! Hash slot calculation.
//!
//! Keys map to one of 16384 slots by CRC16 (XMODEM) modulo the slot count.

use crc::{Crc, CRC_16_XMODEM};

/// Number of hash slots in the cluster.
pub const SLOT_COUNT: u16 = 16384;

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// Calculates the slot for a key.
///
/// If the key contains a non-empty `{...}` section, only that section is
/// hashed, so keys sharing a tag land in the same slot.
///
/// ```
/// use shardis::key_slot;
///
/// assert_eq!(key_slot(b"foo"), 12182);
/// assert_eq!(key_slot(b"{user1000}.following"), key_slot(b"{user1000}.followers"));
/// ```
pub fn key_slot(key: &[u8]) -> u16 {
    CRC16.checksum(hash_tag(key)) % SLOT_COUNT
}

/// Returns the part of the key that is hashed.
///
/// - `{user1000}.following` → `user1000`
/// - `foo{bar}{baz}` → `bar` (first pair only)
/// - `foo{}bar`, `foo{bar` → whole key
fn hash_tag(key: &[u8]) -> &[u8] {
    if let Some(open) = key.iter().position(|&b| b == b'{') {
        if let Some(len) = key[open + 1..].iter().position(|&b| b == b'}') {
            if len > 0 {
                return &key[open + 1..open + 1 + len];
            }
        }
    }
    key
}
