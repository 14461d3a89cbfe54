//! Key Check Value computation.
//!
//! The KCV is a short checksum of raw key material, persisted alongside the
//! encrypted data so corruption of the base cipher is detectable later. The
//! reduction from digest to 32 bits must match the encryption subsystem that
//! consumes these keys, so the connector treats it as an injected function
//! and only supplies the SHA-256 default.

use sha2::{Digest, Sha256};

/// Reduction from raw key bytes to a 32-bit Key Check Value.
pub type KcvFn = fn(&[u8]) -> u32;

/// Default KCV: first four bytes of SHA-256 over the key material, read as a
/// big-endian `u32`.
pub fn sha256_kcv(base_cipher: &[u8]) -> u32 {
    let digest = Sha256::digest(base_cipher);
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}
