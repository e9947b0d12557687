//! AES-256 in CTR mode with the 128-bit counter block formed from a 64-bit
//! nonce followed by a 64-bit byte counter, both big-endian.
//!
//! A stream object keeps its position across calls; the session layer
//! depends on a single keystream continuing across packet framings.

use aes::Aes256;
use byteorder::{BigEndian, ByteOrder};
use ctr::cipher::{KeyIvInit, StreamCipher};

type Ctr = ctr::Ctr128BE<Aes256>;

/// A resumable AES-256-CTR keystream.
pub struct AesCtr {
    cipher: Ctr,
}

impl AesCtr {
    /// Start a stream with the given 32-byte key and 64-bit nonce.
    ///
    /// The initial counter block is `nonce || 0`, and incrementing the block
    /// big-endian is equivalent to incrementing the low 64-bit counter for
    /// any stream shorter than 2^68 bytes.
    pub fn new(key: &[u8; 32], nonce: u64) -> AesCtr {
        let mut iv = [0_u8; 16];
        BigEndian::write_u64(&mut iv[..8], nonce);
        AesCtr {
            cipher: Ctr::new(key.into(), (&iv).into()),
        }
    }

    /// Encrypt or decrypt `buf` in place, advancing the stream position.
    pub fn apply(&mut self, buf: &mut [u8]) {
        self.cipher.apply_keystream(buf);
    }

    /// Copying variant: process `input` into `output`.
    ///
    /// # Panics
    ///
    /// Panics if the buffer lengths differ; that is a programmer error.
    pub fn stream(&mut self, input: &[u8], output: &mut [u8]) {
        assert_eq!(input.len(), output.len());
        output.copy_from_slice(input);
        self.cipher.apply_keystream(output);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let key = [0x2b_u8; 32];
        let mut data = b"attack at dawn, or possibly slightly after breakfast".to_vec();
        let original = data.clone();

        let mut enc = AesCtr::new(&key, 17);
        enc.apply(&mut data);
        assert_ne!(data, original);

        let mut dec = AesCtr::new(&key, 17);
        dec.apply(&mut data);
        assert_eq!(data, original);
    }

    #[test]
    fn split_stream_matches_whole() {
        let key = [0x55_u8; 32];
        let mut whole = vec![0xaa_u8; 100];
        let mut parts = whole.clone();

        AesCtr::new(&key, 3).apply(&mut whole);

        let mut stream = AesCtr::new(&key, 3);
        stream.apply(&mut parts[..37]);
        stream.apply(&mut parts[37..]);
        assert_eq!(whole, parts);
    }

    #[test]
    fn nonce_changes_keystream() {
        let key = [0_u8; 32];
        let mut a = vec![0_u8; 32];
        let mut b = vec![0_u8; 32];
        AesCtr::new(&key, 0).apply(&mut a);
        AesCtr::new(&key, 1).apply(&mut b);
        assert_ne!(a, b);
    }
}
