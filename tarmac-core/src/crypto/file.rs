//! The per-session file encryption envelope.
//!
//! Every file stored by the storage layer is wrapped as
//!
//! ```text
//! [256  session AES key, RSA-OAEP encrypted under EncrPub]
//! [8    nonce, big-endian]
//! [len  AES-256-CTR(session key, nonce) of the payload]
//! [32   HMAC-SHA-256 of everything above]
//! ```
//!
//! The session key is generated once per process session and its encrypted
//! form reused as the header prefix of every file written; the nonce
//! increases monotonically within the session (reuse would be a correctness
//! bug).  The trailer is computed under the file-write key and verified
//! under the file key.

use byteorder::{BigEndian, ByteOrder};
use thiserror::Error;
use zeroize::Zeroize;

use std::collections::HashMap;

use crate::crypto::aesctr::AesCtr;
use crate::crypto::entropy;
use crate::crypto::hash::verify_bytes;
use crate::crypto::rsa;
use crate::keys::{KeyError, KeyId, KeySet};

/// Envelope header length: encrypted session key plus nonce.
pub const FILE_HLEN: usize = 256 + 8;
/// Envelope trailer length: the HMAC.
pub const FILE_TLEN: usize = 32;
/// Total envelope overhead.
pub const FILE_OVERHEAD: usize = FILE_HLEN + FILE_TLEN;

#[derive(Error, Debug)]
pub enum FileError {
    /// The blob fails authentication or carries a malformed key; the
    /// stored file is corrupt.  Never retried.
    #[error("encrypted file is corrupt")]
    Corrupt,
    #[error("key not available")]
    Key(#[from] KeyError),
    #[error("RSA operation failed")]
    Rsa(rsa::RsaError),
    #[error("could not obtain entropy")]
    Entropy(#[from] entropy::EntropyError),
}

impl From<rsa::RsaError> for FileError {
    fn from(err: rsa::RsaError) -> FileError {
        match err {
            rsa::RsaError::CiphertextCorrupt => FileError::Corrupt,
            other => FileError::Rsa(other),
        }
    }
}

type Result<T> = std::result::Result<T, FileError>;

struct EncrKey {
    aes_key: [u8; 32],
    key_encrypted: [u8; 256],
    nonce: u64,
}

impl Drop for EncrKey {
    fn drop(&mut self) {
        self.aes_key.zeroize();
    }
}

/// Encrypt/decrypt state shared by all files of a session.
#[derive(Default)]
pub struct FileCrypto {
    encr: Option<EncrKey>,
    /// Decrypted session keys, looked up by their encrypted form.
    decr_cache: HashMap<[u8; 256], [u8; 32]>,
}

impl FileCrypto {
    pub fn new() -> FileCrypto {
        FileCrypto::default()
    }

    fn encr_key(&mut self, keys: &KeySet) -> Result<&mut EncrKey> {
        if self.encr.is_none() {
            let aes_key: [u8; 32] = entropy::random()?;
            let key_encrypted = rsa::encrypt(keys.encr_pub()?, &aes_key)?;
            self.encr = Some(EncrKey {
                aes_key,
                key_encrypted,
                nonce: 0,
            });
        }
        Ok(self.encr.as_mut().expect("just initialized"))
    }

    /// Wrap `buf` in the encryption header and authentication trailer.
    pub fn encrypt(&mut self, keys: &KeySet, buf: &[u8]) -> Result<Vec<u8>> {
        let encr = self.encr_key(keys)?;

        let mut out = Vec::with_capacity(FILE_OVERHEAD + buf.len());
        out.extend_from_slice(&encr.key_encrypted);

        let mut nonce_bytes = [0_u8; 8];
        BigEndian::write_u64(&mut nonce_bytes, encr.nonce);
        out.extend_from_slice(&nonce_bytes);

        let mut stream = AesCtr::new(&encr.aes_key, encr.nonce);
        encr.nonce += 1;
        let body_start = out.len();
        out.extend_from_slice(buf);
        stream.apply(&mut out[body_start..]);

        let mac = keys.hash_data(KeyId::HmacFileWrite, &out)?;
        out.extend_from_slice(&mac);
        Ok(out)
    }

    /// Remove the envelope from `filebuf`, verifying the trailer and
    /// unwrapping the session key (via the cache when possible).
    pub fn decrypt(&mut self, keys: &KeySet, filebuf: &[u8]) -> Result<Vec<u8>> {
        if filebuf.len() < FILE_OVERHEAD {
            return Err(FileError::Corrupt);
        }
        let len = filebuf.len() - FILE_OVERHEAD;

        let mac = keys.hash_data(KeyId::HmacFile, &filebuf[..FILE_HLEN + len])?;
        if !verify_bytes(&mac, &filebuf[FILE_HLEN + len..]) {
            return Err(FileError::Corrupt);
        }

        let mut key_encrypted = [0_u8; 256];
        key_encrypted.copy_from_slice(&filebuf[..256]);

        let aes_key = match self.decr_cache.get(&key_encrypted) {
            Some(key) => *key,
            None => {
                let mut plain = rsa::decrypt(keys.encr_priv()?, &key_encrypted)?;
                // A decrypted key of any length other than 32 means the
                // ciphertext was valid OAEP wrapping the wrong thing.
                if plain.len() != 32 {
                    plain.zeroize();
                    return Err(FileError::Corrupt);
                }
                let mut key = [0_u8; 32];
                key.copy_from_slice(&plain);
                plain.zeroize();
                self.decr_cache.insert(key_encrypted, key);
                key
            }
        };

        let nonce = BigEndian::read_u64(&filebuf[256..264]);
        let mut out = filebuf[FILE_HLEN..FILE_HLEN + len].to_vec();
        AesCtr::new(&aes_key, nonce).apply(&mut out);
        Ok(out)
    }
}

impl Drop for FileCrypto {
    fn drop(&mut self) {
        for (_, key) in self.decr_cache.iter_mut() {
            key.zeroize();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{MASK_ENCR_PRIV, MASK_ENCR_PUB, MASK_HMAC_FILE};

    fn file_keys() -> KeySet {
        let mut keys = KeySet::new();
        keys.generate(MASK_ENCR_PRIV | MASK_ENCR_PUB | MASK_HMAC_FILE)
            .unwrap();
        keys
    }

    #[test]
    fn round_trip_one_million_bytes() {
        let keys = file_keys();
        let mut fc = FileCrypto::new();

        let mut payload = vec![0_u8; 1_000_000];
        entropy::read(&mut payload).unwrap();

        let filebuf = fc.encrypt(&keys, &payload).unwrap();
        assert_eq!(filebuf.len(), payload.len() + FILE_OVERHEAD);
        let plain = fc.decrypt(&keys, &filebuf).unwrap();
        assert_eq!(plain, payload);
    }

    #[test]
    fn bit_flip_is_corrupt() {
        let keys = file_keys();
        let mut fc = FileCrypto::new();
        let mut filebuf = fc.encrypt(&keys, b"some file contents").unwrap();
        filebuf[37] ^= 0x01;
        assert!(matches!(
            fc.decrypt(&keys, &filebuf),
            Err(FileError::Corrupt)
        ));
    }

    #[test]
    fn every_region_is_authenticated() {
        let keys = file_keys();
        let mut fc = FileCrypto::new();
        let clean = fc.encrypt(&keys, b"twenty bytes of data").unwrap();
        // Header, nonce, body, trailer.
        for index in [0, 100, 258, 270, clean.len() - 1] {
            let mut tampered = clean.clone();
            tampered[index] ^= 0x80;
            assert!(
                matches!(fc.decrypt(&keys, &tampered), Err(FileError::Corrupt)),
                "byte {} not covered",
                index
            );
        }
    }

    #[test]
    fn nonces_increase_within_session() {
        let keys = file_keys();
        let mut fc = FileCrypto::new();
        let a = fc.encrypt(&keys, b"first").unwrap();
        let b = fc.encrypt(&keys, b"second").unwrap();
        assert_eq!(BigEndian::read_u64(&a[256..264]), 0);
        assert_eq!(BigEndian::read_u64(&b[256..264]), 1);
        // Same session key blob prefixes both files.
        assert_eq!(a[..256], b[..256]);
    }

    #[test]
    fn short_blob_is_corrupt() {
        let keys = file_keys();
        let mut fc = FileCrypto::new();
        assert!(matches!(
            fc.decrypt(&keys, &[0_u8; 100]),
            Err(FileError::Corrupt)
        ));
    }
}
