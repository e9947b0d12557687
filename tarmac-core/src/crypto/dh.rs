//! Diffie-Hellman over RFC 3526 group #14 (2048-bit MODP).
//!
//! Private keys are 32 bytes; the effective exponent is 2^258 + priv, which
//! keeps the exponent's bit length fixed.  Exponentiations are blinded by
//! splitting the exponent into a random part and a remainder and multiplying
//! the two powers; the split defeats cache-based side channels on the
//! exponent words, not just timing on the modexp itself.

use openssl::bn::{BigNum, BigNumContext};
use thiserror::Error;
use zeroize::Zeroize;

use crate::crypto::entropy;
use crate::crypto::hash::hmac_sha256;

/// Private key length in bytes.
pub const DH_PRIVLEN: usize = 32;
/// Public value length in bytes.
pub const DH_PUBLEN: usize = 256;
/// Shared key length in bytes.
pub const DH_KEYLEN: usize = 256;

/// The group #14 modulus, big-endian.
const GROUP14: [u8; 256] = [
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xc9, 0x0f, 0xda, 0xa2, 0x21, 0x68, 0xc2, 0x34,
    0xc4, 0xc6, 0x62, 0x8b, 0x80, 0xdc, 0x1c, 0xd1, 0x29, 0x02, 0x4e, 0x08, 0x8a, 0x67, 0xcc, 0x74,
    0x02, 0x0b, 0xbe, 0xa6, 0x3b, 0x13, 0x9b, 0x22, 0x51, 0x4a, 0x08, 0x79, 0x8e, 0x34, 0x04, 0xdd,
    0xef, 0x95, 0x19, 0xb3, 0xcd, 0x3a, 0x43, 0x1b, 0x30, 0x2b, 0x0a, 0x6d, 0xf2, 0x5f, 0x14, 0x37,
    0x4f, 0xe1, 0x35, 0x6d, 0x6d, 0x51, 0xc2, 0x45, 0xe4, 0x85, 0xb5, 0x76, 0x62, 0x5e, 0x7e, 0xc6,
    0xf4, 0x4c, 0x42, 0xe9, 0xa6, 0x37, 0xed, 0x6b, 0x0b, 0xff, 0x5c, 0xb6, 0xf4, 0x06, 0xb7, 0xed,
    0xee, 0x38, 0x6b, 0xfb, 0x5a, 0x89, 0x9f, 0xa5, 0xae, 0x9f, 0x24, 0x11, 0x7c, 0x4b, 0x1f, 0xe6,
    0x49, 0x28, 0x66, 0x51, 0xec, 0xe4, 0x5b, 0x3d, 0xc2, 0x00, 0x7c, 0xb8, 0xa1, 0x63, 0xbf, 0x05,
    0x98, 0xda, 0x48, 0x36, 0x1c, 0x55, 0xd3, 0x9a, 0x69, 0x16, 0x3f, 0xa8, 0xfd, 0x24, 0xcf, 0x5f,
    0x83, 0x65, 0x5d, 0x23, 0xdc, 0xa3, 0xad, 0x96, 0x1c, 0x62, 0xf3, 0x56, 0x20, 0x85, 0x52, 0xbb,
    0x9e, 0xd5, 0x29, 0x07, 0x70, 0x96, 0x96, 0x6d, 0x67, 0x0c, 0x35, 0x4e, 0x4a, 0xbc, 0x98, 0x04,
    0xf1, 0x74, 0x6c, 0x08, 0xca, 0x18, 0x21, 0x7c, 0x32, 0x90, 0x5e, 0x46, 0x2e, 0x36, 0xce, 0x3b,
    0xe3, 0x9e, 0x77, 0x2c, 0x18, 0x0e, 0x86, 0x03, 0x9b, 0x27, 0x83, 0xa2, 0xec, 0x07, 0xa2, 0x8f,
    0xb5, 0xc5, 0x5d, 0xf0, 0x6f, 0x4c, 0x52, 0xc9, 0xde, 0x2b, 0xcb, 0xf6, 0x95, 0x58, 0x17, 0x18,
    0x39, 0x95, 0x49, 0x7c, 0xea, 0x95, 0x6a, 0xe5, 0x15, 0xd2, 0x26, 0x18, 0x98, 0xfa, 0x05, 0x10,
    0x15, 0x72, 0x8e, 0x5a, 0x8a, 0xac, 0xaa, 0x68, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
];

#[derive(Error, Debug)]
pub enum DhError {
    #[error("public Diffie-Hellman value is out of range")]
    Insane,
    #[error("could not obtain entropy")]
    Entropy(#[from] entropy::EntropyError),
    #[error("openssl error")]
    Backend(#[from] openssl::error::ErrorStack),
}

type Result<T> = std::result::Result<T, DhError>;

/// Compute a^(2^258 + priv) mod p without leaking the exponent.
fn blinded_modexp(a: &BigNum, priv_key: &[u8; DH_PRIVLEN]) -> Result<[u8; DH_PUBLEN]> {
    let mut ctx = BigNumContext::new()?;
    let p = BigNum::from_slice(&GROUP14)?;

    // two_exp_256 = 2^256; the full exponent is priv + 4 * 2^256.
    let mut two_exp_256 = BigNum::new()?;
    two_exp_256.set_bit(256)?;

    let mut exponent = BigNum::from_slice(priv_key)?;
    for _ in 0..4 {
        let sum = &exponent + &two_exp_256;
        exponent = sum;
    }

    // Blinding exponent r = random + 2^256, and the remainder e - r.
    let mut blinding_bytes: [u8; DH_PRIVLEN] = entropy::random()?;
    let blinding = &BigNum::from_slice(&blinding_bytes)? + &two_exp_256;
    blinding_bytes.zeroize();
    let remainder = &exponent - &blinding;

    let mut r1 = BigNum::new()?;
    r1.mod_exp(a, &blinding, &p, &mut ctx)?;
    let mut r2 = BigNum::new()?;
    r2.mod_exp(a, &remainder, &p, &mut ctx)?;

    let mut result = BigNum::new()?;
    result.mod_mul(&r1, &r2, &p, &mut ctx)?;

    // Export left-padded to the full public length.
    let bytes = result.to_vec();
    let mut out = [0_u8; DH_PUBLEN];
    out[DH_PUBLEN - bytes.len()..].copy_from_slice(&bytes);
    Ok(out)
}

/// Compute the public value 2^(2^258 + priv) mod p.
pub fn generate_pub(priv_key: &[u8; DH_PRIVLEN]) -> Result<[u8; DH_PUBLEN]> {
    let two = BigNum::from_u32(2)?;
    blinded_modexp(&two, priv_key)
}

/// Generate a fresh (pub, priv) pair.
pub fn generate() -> Result<([u8; DH_PUBLEN], [u8; DH_PRIVLEN])> {
    let priv_key: [u8; DH_PRIVLEN] = entropy::random()?;
    let pub_key = generate_pub(&priv_key)?;
    Ok((pub_key, priv_key))
}

/// Compute the shared key pub^(2^258 + priv) mod p, where `pub` is the
/// other participant's public value.
pub fn compute(
    pub_key: &[u8; DH_PUBLEN],
    priv_key: &[u8; DH_PRIVLEN],
) -> Result<[u8; DH_KEYLEN]> {
    let a = BigNum::from_slice(pub_key)?;
    blinded_modexp(&a, priv_key)
}

/// Sanity-check a public value: it must be less than the group modulus.
pub fn sanity_check(pub_key: &[u8; DH_PUBLEN]) -> Result<()> {
    if pub_key[..] < GROUP14[..] {
        Ok(())
    } else {
        Err(DhError::Insane)
    }
}

/// Derive a (pub, priv) pair from a password: priv = HMAC(salt, passwd).
///
/// Used during machine registration, where the shared secret with the
/// server is proven by knowledge of the account password.
pub fn passwd_to_dh(
    passwd: &[u8],
    salt: &[u8; 32],
) -> Result<([u8; DH_PUBLEN], [u8; DH_PRIVLEN])> {
    let priv_key = hmac_sha256(salt, passwd);
    let pub_key = generate_pub(&priv_key)?;
    Ok((pub_key, priv_key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exchange_agrees() {
        let (pub_a, priv_a) = generate().unwrap();
        let (pub_b, priv_b) = generate().unwrap();
        let k_ab = compute(&pub_b, &priv_a).unwrap();
        let k_ba = compute(&pub_a, &priv_b).unwrap();
        assert_eq!(k_ab[..], k_ba[..]);
    }

    #[test]
    fn public_values_are_sane() {
        let (pub_key, _) = generate().unwrap();
        sanity_check(&pub_key).unwrap();
        let mut bad = [0xff_u8; DH_PUBLEN];
        assert!(sanity_check(&bad).is_err());
        bad.copy_from_slice(&GROUP14);
        assert!(sanity_check(&bad).is_err());
    }

    #[test]
    fn blinding_does_not_change_result() {
        // The blinding split is random per call; the result must not be.
        let priv_key = [0x21_u8; DH_PRIVLEN];
        let a = generate_pub(&priv_key).unwrap();
        let b = generate_pub(&priv_key).unwrap();
        assert_eq!(a[..], b[..]);
    }

    #[test]
    fn passwd_derivation_is_deterministic() {
        let salt = [9_u8; 32];
        let (pub_a, priv_a) = passwd_to_dh(b"hunter2", &salt).unwrap();
        let (pub_b, priv_b) = passwd_to_dh(b"hunter2", &salt).unwrap();
        assert_eq!(priv_a, priv_b);
        assert_eq!(pub_a[..], pub_b[..]);
        let (pub_c, _) = passwd_to_dh(b"hunter3", &salt).unwrap();
        assert_ne!(pub_a[..], pub_c[..]);
    }
}
