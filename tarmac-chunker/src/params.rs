//! Derivation of the chunking parameters from a 32-byte key.
//!
//! The modulus p, the evaluation point, and the 256 byte-coefficients are
//! all pseudorandom functions of the key, so two machines holding the same
//! key split identical data identically while machines with different keys
//! produce unrelated boundaries.  All seed values are decoded little-endian
//! so the derived parameters do not depend on the platform.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::ChunkerError;

type HmacSha256 = Hmac<Sha256>;

/// Largest permitted mean chunk length; keeps p below ⌊2^32 / 3⌋.
pub const MEANLEN_MAX: u32 = 1_262_226;

/// Chunking parameters shared by every chunkifier built from one key.
#[derive(Clone)]
pub struct ChunkerParams {
    /// Desired mean chunk length.
    pub(crate) mu: u32,
    /// Modulus.
    pub(crate) p: u32,
    /// −p⁻¹ mod 2^32.
    pub(crate) pp: u32,
    /// Evaluation point, in the form consumed by the Montgomery multiply.
    pub(crate) ar: u32,
    /// Coefficient map.
    pub(crate) cm: [u32; 256],
}

fn keyed_u32(key: &[u8; 32], data: &[u8; 2]) -> u32 {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    let tag = mac.finalize().into_bytes();
    u32::from_le_bytes([tag[0], tag[1], tag[2], tag[3]])
}

/// Returns true iff n is prime.  n is always below 2^32, so trial division
/// by values up to 2^16 suffices.
fn is_prime(n: u32) -> bool {
    let mut x: u32 = 2;
    while x.saturating_mul(x) <= n && x < 65536 {
        if n % x == 0 {
            return false;
        }
        x += 1;
    }
    n > 1
}

/// The smallest prime p with n <= p < 2^32.
fn next_prime(n: u32) -> u32 {
    let mut p = n;
    while !is_prime(p) {
        p += 1;
    }
    p
}

/// The greatest y with y^2 <= x.
fn isqrt(x: u32) -> u32 {
    let mut y: u32 = 1;
    while y < 65536 && y * y <= x {
        y += 1;
    }
    y - 1
}

/// Compute (a * b + ((a * b * pp) mod 2^32) * p) / 2^32.
///
/// For b <= p the result is at most p * (1 + a / 2^32); larger b values
/// rely on the wrapping behaviour, which is part of the defined boundary
/// function.
#[inline]
pub(crate) fn mmul(a: u32, b: u32, p: u32, pp: u32) -> u32 {
    let ab = u64::from(a).wrapping_mul(u64::from(b));
    let abpp = (ab as u32).wrapping_mul(pp);
    let t = ab.wrapping_add(u64::from(abpp).wrapping_mul(u64::from(p)));
    (t >> 32) as u32
}

/// Returns true iff ar has multiplicative order at least `ord` mod p.
fn min_order(ar: u32, ord: u32, p: u32, pp: u32) -> bool {
    let akr0 = p.wrapping_neg() % p;
    let mut akr = akr0;
    for _ in 0..ord {
        akr = mmul(akr, ar, p, pp) % p;
        if akr == akr0 {
            return false;
        }
    }
    true
}

impl ChunkerParams {
    /// Derive the parameters for mean chunk length `meanlen` from the
    /// 32-byte chunking key.
    pub fn derive(key: &[u8; 32], meanlen: u32) -> Result<ChunkerParams, ChunkerError> {
        if meanlen == 0 || meanlen > MEANLEN_MAX {
            return Err(ChunkerError::BadParameters);
        }
        let mu = meanlen;

        // Pseudorandom seed values: p from HMAC('p\0'), the evaluation
        // point from HMAC('a\0'), cm[i] from HMAC('x' . i).
        let p_seed = keyed_u32(key, b"p\0");
        let a_seed = keyed_u32(key, b"a\0");
        let mut cm = [0_u32; 256];
        for (i, slot) in cm.iter_mut().enumerate() {
            *slot = keyed_u32(key, &[b'x', i as u8]);
        }

        // p is approximately mu^(3/2) * 1.01: at least
        // floor(mu * floor(sqrt(mu)) * 1.01), at most floor(sqrt(mu)) - 1
        // more than that, rounded up to a prime.
        let mut pmin = mu.wrapping_mul(isqrt(mu));
        pmin += pmin / 100;
        let p = next_prime(pmin + (p_seed % isqrt(mu)));

        // pp = -p^(-1) mod 2^32 by Newton iteration.
        let mut pp = ((2_u32.wrapping_mul(p).wrapping_add(4)) & 8).wrapping_sub(p);
        pp = pp.wrapping_mul(2_u32.wrapping_add(p.wrapping_mul(pp)));
        pp = pp.wrapping_mul(2_u32.wrapping_add(p.wrapping_mul(pp)));
        pp = pp.wrapping_mul(2_u32.wrapping_add(p.wrapping_mul(pp)));

        // 1 < ar < p - 1 with multiplicative order greater than mu.
        let mut ar = 2 + (a_seed % (p - 3));
        while !min_order(ar, mu, p, pp) {
            ar += 1;
            if ar == p {
                ar = 2;
            }
        }

        Ok(ChunkerParams { mu, p, pp, ar, cm })
    }

    /// The mean chunk length these parameters target.
    pub fn mean_len(&self) -> u32 {
        self.mu
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_is_deterministic() {
        let key = [0x5c_u8; 32];
        let a = ChunkerParams::derive(&key, 65536).unwrap();
        let b = ChunkerParams::derive(&key, 65536).unwrap();
        assert_eq!(a.p, b.p);
        assert_eq!(a.ar, b.ar);
        assert_eq!(a.cm[..], b.cm[..]);
    }

    #[test]
    fn different_keys_differ() {
        let a = ChunkerParams::derive(&[1_u8; 32], 65536).unwrap();
        let b = ChunkerParams::derive(&[2_u8; 32], 65536).unwrap();
        assert_ne!(a.cm[..], b.cm[..]);
    }

    #[test]
    fn modulus_is_prime_and_in_range() {
        for mu in [4096_u32, 65536, MEANLEN_MAX] {
            let params = ChunkerParams::derive(&[7_u8; 32], mu).unwrap();
            assert!(is_prime(params.p));
            // p stays under floor(2^32 / 3) even for the largest mean.
            assert!(params.p <= 1_431_655_765);
            let pmin = mu * isqrt(mu) + (mu * isqrt(mu)) / 100;
            assert!(params.p >= pmin);
            assert!(params.ar >= 2 && params.ar < params.p);
        }
    }

    #[test]
    fn pp_is_negative_inverse() {
        let params = ChunkerParams::derive(&[9_u8; 32], 65536).unwrap();
        // p * pp == -1 mod 2^32
        assert_eq!(params.p.wrapping_mul(params.pp), u32::MAX);
    }

    #[test]
    fn zero_and_oversized_means_rejected() {
        assert!(ChunkerParams::derive(&[0_u8; 32], 0).is_err());
        assert!(ChunkerParams::derive(&[0_u8; 32], MEANLEN_MAX + 1).is_err());
    }
}
