//! # Checksums
//!
//! CRC32 helpers used by block and log integrity checks and by key routing.

use crc32fast::Hasher as Crc32Hasher;

/// Compute CRC32 checksum
pub fn crc32_checksum(data: &[u8]) -> u32 {
    let mut hasher = Crc32Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Verify CRC32 checksum
pub fn verify_crc32(data: &[u8], expected: u32) -> bool {
    crc32_checksum(data) == expected
}

/// Incremental CRC32 over several slices.
pub fn crc32_parts(parts: &[&[u8]]) -> u32 {
    let mut hasher = Crc32Hasher::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize()
}
