//! SHA-256 and HMAC-SHA-256 helpers.
//!
//! The two-buffer variants hash a logical concatenation without allocating;
//! several wire formats are defined as hashes of `a || b`.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// SHA-256 of a buffer.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// SHA-256 of the concatenation of two buffers.
pub fn sha256_2(data0: &[u8], data1: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data0);
    hasher.update(data1);
    hasher.finalize().into()
}

/// HMAC-SHA-256 of a buffer under the provided key.
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// HMAC-SHA-256 of the concatenation of two buffers under the provided key.
pub fn hmac_sha256_2(key: &[u8], data0: &[u8], data1: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data0);
    mac.update(data1);
    mac.finalize().into_bytes().into()
}

/// Constant-time equality of two byte strings.
///
/// Returns false on length mismatch; no information about the position of a
/// difference leaks via timing.
pub fn verify_bytes(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}
