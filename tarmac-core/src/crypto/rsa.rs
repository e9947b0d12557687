//! RSA-2048 signatures and key wrapping.
//!
//! The raw modular exponentiations are delegated to openssl in no-padding
//! mode; the PSS and OAEP paddings are implemented here byte-for-byte (a
//! 223-byte DB, a 190-byte OAEP plaintext cap, the 0xBC PSS trailer, and a
//! 32-bit big-endian MGF1 counter) so that the exact on-wire layout stays
//! under this crate's control, along with the constant-time properties of
//! the decrypt path.

use openssl::bn::BigNum;
use openssl::pkey::{HasPublic, Private, Public};
use openssl::rsa::{Padding, Rsa};
use subtle::ConstantTimeEq;
use thiserror::Error;
use zeroize::Zeroize;

use crate::crypto::entropy;
use crate::crypto::hash::{sha256, verify_bytes};
use crate::crypto::mgf1::mgf1;

/// Modulus size in bytes; only 2048-bit keys are accepted.
pub const RSA_LEN: usize = 256;

/// Maximum OAEP plaintext length.
pub const OAEP_MAXLEN: usize = 190;

#[derive(Error, Debug)]
pub enum RsaError {
    #[error("RSA key is incorrect size")]
    KeyWrongSize,
    #[error("signature buffer is incorrect length")]
    BadLength,
    #[error("input to RSA encryption is too long")]
    InputTooLong,
    #[error("signature is invalid")]
    BadSignature,
    #[error("ciphertext is corrupt")]
    CiphertextCorrupt,
    #[error("could not obtain entropy")]
    Entropy(#[from] entropy::EntropyError),
    #[error("openssl error")]
    Backend(#[from] openssl::error::ErrorStack),
}

type Result<T> = std::result::Result<T, RsaError>;

/// Generate a fresh RSA-2048 private key.
pub fn generate() -> Result<Rsa<Private>> {
    Ok(Rsa::generate(2048)?)
}

fn check_key<T: HasPublic>(key: &Rsa<T>) -> Result<()> {
    if key.size() as usize != RSA_LEN || key.n().num_bits() != 2048 {
        return Err(RsaError::KeyWrongSize);
    }
    Ok(())
}

/// Reject values numerically ≥ the modulus before a raw operation; such a
/// signature or ciphertext can never be valid.
fn check_in_range<T: HasPublic>(key: &Rsa<T>, value: &[u8]) -> Result<()> {
    let v = BigNum::from_slice(value)?;
    if v.ucmp(key.n()) != std::cmp::Ordering::Less {
        return Err(RsaError::BadSignature);
    }
    Ok(())
}

/// Sign `data` with a custom RSASSA-PSS encoding (SHA-256, 32-byte salt,
/// 0xBC trailer), returning the 256-byte signature.
pub fn sign(key: &Rsa<Private>, data: &[u8]) -> Result<[u8; RSA_LEN]> {
    check_key(key)?;

    // EMSA-PSS-ENCODE from RFC 3447.
    let m_hash = sha256(data);
    let salt: [u8; 32] = entropy::random()?;

    let mut m_prime = [0_u8; 72];
    m_prime[8..40].copy_from_slice(&m_hash);
    m_prime[40..72].copy_from_slice(&salt);
    let h = sha256(&m_prime);

    let mut db = [0_u8; 223];
    db[190] = 1;
    db[191..223].copy_from_slice(&salt);

    let mut db_mask = [0_u8; 223];
    mgf1(&h, &mut db_mask);
    for i in 0..223 {
        db[i] ^= db_mask[i];
    }
    db[0] &= 0x7f;

    let mut em = [0_u8; RSA_LEN];
    em[..223].copy_from_slice(&db);
    em[223..255].copy_from_slice(&h);
    em[255] = 0xbc;

    let mut sig = [0_u8; RSA_LEN];
    let written = key.private_encrypt(&em, &mut sig, Padding::NONE)?;
    if written != RSA_LEN {
        return Err(RsaError::BadLength);
    }
    Ok(sig)
}

/// Verify a PSS signature over `data`.  Returns `BadSignature` for any
/// mismatch and reserves other errors for operational failures.
pub fn verify<T: HasPublic>(key: &Rsa<T>, data: &[u8], sig: &[u8]) -> Result<()> {
    check_key(key)?;
    if sig.len() != RSA_LEN {
        return Err(RsaError::BadLength);
    }
    check_in_range(key, sig)?;

    let mut em = [0_u8; RSA_LEN];
    let written = key.public_decrypt(sig, &mut em, Padding::NONE)?;
    if written != RSA_LEN {
        return Err(RsaError::BadSignature);
    }

    // EMSA-PSS-VERIFY from RFC 3447.
    let m_hash = sha256(data);

    if em[255] != 0xbc {
        return Err(RsaError::BadSignature);
    }
    let masked_db = &em[..223];
    let h = &em[223..255];
    if masked_db[0] & 0x80 != 0 {
        return Err(RsaError::BadSignature);
    }

    let mut db_mask = [0_u8; 223];
    mgf1(h, &mut db_mask);
    let mut db = [0_u8; 223];
    for i in 0..223 {
        db[i] = masked_db[i] ^ db_mask[i];
    }
    db[0] &= 0x7f;

    if db[..190].iter().any(|&b| b != 0) || db[190] != 1 {
        return Err(RsaError::BadSignature);
    }
    let salt = &db[191..223];

    let mut m_prime = [0_u8; 72];
    m_prime[8..40].copy_from_slice(&m_hash);
    m_prime[40..72].copy_from_slice(salt);
    let h_prime = sha256(&m_prime);

    if verify_bytes(h, &h_prime) {
        Ok(())
    } else {
        Err(RsaError::BadSignature)
    }
}

/// RSAES-OAEP encrypt (SHA-256, MGF1, empty label); `data` must be at most
/// 190 bytes.  Returns the 256-byte ciphertext.
pub fn encrypt<T: HasPublic>(key: &Rsa<T>, data: &[u8]) -> Result<[u8; RSA_LEN]> {
    check_key(key)?;
    if data.len() > OAEP_MAXLEN {
        return Err(RsaError::InputTooLong);
    }

    // RSAES-OAEP-ENCRYPT from RFC 3447.
    let l_hash = sha256(&[]);

    let mut db = [0_u8; 223];
    db[..32].copy_from_slice(&l_hash);
    db[222 - data.len()] = 1;
    db[223 - data.len()..].copy_from_slice(data);

    let seed: [u8; 32] = entropy::random()?;

    let mut db_mask = [0_u8; 223];
    mgf1(&seed, &mut db_mask);
    let mut masked_db = [0_u8; 223];
    for i in 0..223 {
        masked_db[i] = db[i] ^ db_mask[i];
    }

    let mut seed_mask = [0_u8; 32];
    mgf1(&masked_db, &mut seed_mask);
    let mut masked_seed = [0_u8; 32];
    for i in 0..32 {
        masked_seed[i] = seed[i] ^ seed_mask[i];
    }

    let mut em = [0_u8; RSA_LEN];
    em[1..33].copy_from_slice(&masked_seed);
    em[33..].copy_from_slice(&masked_db);

    let mut out = [0_u8; RSA_LEN];
    let written = key.public_encrypt(&em, &mut out, Padding::NONE)?;
    if written != RSA_LEN {
        return Err(RsaError::BadLength);
    }
    db.zeroize();
    Ok(out)
}

/// RSAES-OAEP decrypt.  Returns the plaintext, `CiphertextCorrupt` for any
/// padding failure, and reserves other errors for operational failures.
///
/// All validity conditions over the 256-byte block are accumulated into a
/// single flag; the only data-dependent branch is the final accept/reject.
pub fn decrypt(key: &Rsa<Private>, data: &[u8]) -> Result<Vec<u8>> {
    check_key(key)?;
    if data.len() != RSA_LEN {
        return Err(RsaError::BadLength);
    }
    check_in_range(key, data).map_err(|_| RsaError::CiphertextCorrupt)?;

    let mut em = [0_u8; RSA_LEN];
    let written = key.private_decrypt(data, &mut em, Padding::NONE)?;
    if written != RSA_LEN {
        return Err(RsaError::CiphertextCorrupt);
    }

    // RSAES-OAEP-DECRYPT from RFC 3447.
    let l_hash = sha256(&[]);

    // The high byte of EM must be zero; tested at the end with everything
    // else to keep the rejection path free of early exits.
    let mut baddata = em[0];

    let masked_seed = &em[1..33];
    let masked_db = &em[33..256];

    let mut seed_mask = [0_u8; 32];
    mgf1(masked_db, &mut seed_mask);
    let mut seed = [0_u8; 32];
    for i in 0..32 {
        seed[i] = masked_seed[i] ^ seed_mask[i];
    }

    let mut db_mask = [0_u8; 223];
    mgf1(&seed, &mut db_mask);
    let mut db = [0_u8; 223];
    for i in 0..223 {
        db[i] = masked_db[i] ^ db_mask[i];
    }

    // The leading 32 bytes of DB must equal lHash.
    baddata |= (!db[..32].ct_eq(&l_hash)).unwrap_u8();

    // Bytes 32..223 must be zero bytes, a one byte, then the message.
    // paddingmask stays 0xff while scanning padding and drops to 0x00 at
    // the 0x01 separator; adding it as a signed byte counts the message
    // length without branching.
    let mut paddingmask = 0xff_u8;
    let mut msglen: i32 = 191;
    for &b in &db[32..223] {
        baddata |= paddingmask & b & 0xfe;
        msglen += i32::from(paddingmask as i8);
        paddingmask &= b.wrapping_sub(1);
    }
    // Once we hit the end, the padding must be over.
    baddata |= paddingmask;

    if baddata != 0 {
        db.zeroize();
        return Err(RsaError::CiphertextCorrupt);
    }

    let msglen = msglen as usize;
    let out = db[223 - msglen..].to_vec();
    db.zeroize();
    Ok(out)
}

/// Borrow the public half of a private key as a standalone key.
pub fn public_from_private(key: &Rsa<Private>) -> Result<Rsa<Public>> {
    Ok(Rsa::from_public_components(
        key.n().to_owned()?,
        key.e().to_owned()?,
    )?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keypair() -> (Rsa<Private>, Rsa<Public>) {
        let priv_key = generate().unwrap();
        let pub_key = public_from_private(&priv_key).unwrap();
        (priv_key, pub_key)
    }

    #[test]
    fn sign_verify_round_trip() {
        let (priv_key, pub_key) = keypair();
        let data = b"the metadata being signed";
        let sig = sign(&priv_key, data).unwrap();
        verify(&pub_key, data, &sig).unwrap();
    }

    #[test]
    fn tampered_signature_rejected() {
        let (priv_key, pub_key) = keypair();
        let data = b"the metadata being signed";
        let mut sig = sign(&priv_key, data).unwrap();
        sig[100] ^= 0x01;
        assert!(matches!(
            verify(&pub_key, data, &sig),
            Err(RsaError::BadSignature)
        ));
        let sig = sign(&priv_key, data).unwrap();
        assert!(matches!(
            verify(&pub_key, b"different data", &sig),
            Err(RsaError::BadSignature)
        ));
    }

    #[test]
    fn oaep_round_trip() {
        let (priv_key, pub_key) = keypair();
        let msg = [0x5a_u8; 32];
        let ct = encrypt(&pub_key, &msg).unwrap();
        let pt = decrypt(&priv_key, &ct).unwrap();
        assert_eq!(pt, msg);
    }

    #[test]
    fn oaep_empty_and_max_lengths() {
        let (priv_key, pub_key) = keypair();
        for len in [0_usize, 1, 189, 190] {
            let msg = vec![0x17_u8; len];
            let ct = encrypt(&pub_key, &msg).unwrap();
            assert_eq!(decrypt(&priv_key, &ct).unwrap(), msg);
        }
        assert!(matches!(
            encrypt(&pub_key, &[0_u8; 191]),
            Err(RsaError::InputTooLong)
        ));
    }

    #[test]
    fn oaep_tamper_is_corrupt() {
        let (priv_key, pub_key) = keypair();
        let mut ct = encrypt(&pub_key, &[1, 2, 3, 4]).unwrap();
        ct[37] ^= 0x80;
        assert!(matches!(
            decrypt(&priv_key, &ct),
            Err(RsaError::CiphertextCorrupt)
        ));
    }

    #[test]
    fn wrong_key_is_corrupt_not_error() {
        let (_, pub_key) = keypair();
        let (other_priv, _) = keypair();
        let ct = encrypt(&pub_key, &[9_u8; 32]).unwrap();
        assert!(matches!(
            decrypt(&other_priv, &ct),
            Err(RsaError::CiphertextCorrupt)
        ));
    }
}
