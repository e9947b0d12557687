//! The MGF1 mask generation function from RFC 3447, with SHA-256 and a
//! 32-bit big-endian block counter.

use byteorder::{BigEndian, ByteOrder};

use crate::crypto::hash::sha256_2;

/// Fill `buf` with MGF1(seed).
pub fn mgf1(seed: &[u8], buf: &mut [u8]) {
    let mut counter = [0_u8; 4];
    for (i, out) in buf.chunks_mut(32).enumerate() {
        BigEndian::write_u32(&mut counter, i as u32);
        let block = sha256_2(seed, &counter);
        out.copy_from_slice(&block[..out.len()]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::hash::sha256_2;

    #[test]
    fn prefix_stability() {
        // A longer mask starts with the shorter mask of the same seed.
        let mut short = [0_u8; 20];
        let mut long = [0_u8; 100];
        mgf1(b"seed", &mut short);
        mgf1(b"seed", &mut long);
        assert_eq!(short, long[..20]);
    }

    #[test]
    fn first_block_is_hash_of_seed_and_counter() {
        let mut mask = [0_u8; 32];
        mgf1(b"another seed", &mut mask);
        assert_eq!(mask, sha256_2(b"another seed", &[0, 0, 0, 0]));
    }
}
