//! HMAC_DRBG pseudo-random generator, as specified in section 10.1.2 of
//! NIST SP 800-90A (HMAC-SHA-256 variant), without the optional
//! personalization string and additional input.
//!
//! A single process-wide instance seeded from the operating system backs
//! [`read`]; the generator is not re-entrant, which the wrapping mutex
//! enforces.

use lazy_static::lazy_static;
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;
use zeroize::Zeroize;

use std::sync::Mutex;

use crate::crypto::hash::{hmac_sha256, hmac_sha256_2};

/// Reseed after this many generate operations.
const RESEED_INTERVAL: u32 = 256;

/// Maximum bytes per generate operation; limited to 2^16 by specification.
const GENERATE_MAXLEN: usize = 65536;

#[derive(Error, Debug)]
pub enum EntropyError {
    #[error("could not obtain entropy from the operating system")]
    SourceFailed(#[from] rand::Error),
}

type Result<T> = std::result::Result<T, EntropyError>;

/// HMAC_DRBG state.
pub struct Drbg {
    key: [u8; 32],
    v: [u8; 32],
    reseed_counter: u32,
}

impl Drbg {
    /// Instantiate from the OS entropy source (48 bytes of seed material).
    pub fn new() -> Result<Drbg> {
        let mut seed = [0_u8; 48];
        OsRng.try_fill_bytes(&mut seed)?;
        let drbg = Drbg::from_seed(&seed);
        seed.zeroize();
        Ok(drbg)
    }

    /// Instantiate from caller-provided seed material.  (Section 10.1.2.3)
    ///
    /// Deterministic; used by known-answer tests.
    pub fn from_seed(seed: &[u8]) -> Drbg {
        let mut drbg = Drbg {
            key: [0x00; 32],
            v: [0x01; 32],
            reseed_counter: 1,
        };
        drbg.update(seed);
        drbg
    }

    /// Mix the provided data into the state.  (Section 10.1.2.2)
    fn update(&mut self, data: &[u8]) {
        let mut block = [0_u8; 33];
        block[..32].copy_from_slice(&self.v);

        // K <- HMAC(K, V || 0x00 || data); V <- HMAC(K, V).
        block[32] = 0x00;
        self.key = hmac_sha256_2(&self.key, &block, data);
        self.v = hmac_sha256(&self.key, &self.v);

        if !data.is_empty() {
            // K <- HMAC(K, V || 0x01 || data); V <- HMAC(K, V).
            block[..32].copy_from_slice(&self.v);
            block[32] = 0x01;
            self.key = hmac_sha256_2(&self.key, &block, data);
            self.v = hmac_sha256(&self.key, &self.v);
        }

        block.zeroize();
    }

    /// Mix in 32 bytes of fresh OS entropy.  (Section 10.1.2.4)
    fn reseed(&mut self) -> Result<()> {
        let mut seed = [0_u8; 32];
        OsRng.try_fill_bytes(&mut seed)?;
        self.update(&seed);
        self.reseed_counter = 1;
        seed.zeroize();
        Ok(())
    }

    /// Fill up to `GENERATE_MAXLEN` bytes.  (Section 10.1.2.5)
    ///
    /// The caller is responsible for reseeding and for splitting larger
    /// requests.
    fn generate(&mut self, buf: &mut [u8]) {
        debug_assert!(buf.len() <= GENERATE_MAXLEN);
        for out in buf.chunks_mut(32) {
            self.v = hmac_sha256(&self.key, &self.v);
            out.copy_from_slice(&self.v[..out.len()]);
        }
        self.update(&[]);
        self.reseed_counter += 1;
    }

    /// Fill the buffer with unpredictable bits.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<()> {
        for part in buf.chunks_mut(GENERATE_MAXLEN) {
            if self.reseed_counter > RESEED_INTERVAL {
                self.reseed()?;
            }
            self.generate(part);
        }
        Ok(())
    }
}

impl Drop for Drbg {
    fn drop(&mut self) {
        self.key.zeroize();
        self.v.zeroize();
    }
}

lazy_static! {
    static ref DRBG: Mutex<Option<Drbg>> = Mutex::new(None);
}

/// Fill the buffer from the process-wide generator, instantiating it on
/// first use.
pub fn read(buf: &mut [u8]) -> Result<()> {
    let mut guard = DRBG.lock().expect("entropy mutex poisoned");
    if guard.is_none() {
        *guard = Some(Drbg::new()?);
    }
    guard.as_mut().expect("just instantiated").read(buf)
}

/// Convenience wrapper returning a fixed-size array of random bytes.
pub fn random<const N: usize>() -> Result<[u8; N]> {
    let mut buf = [0_u8; N];
    read(&mut buf)?;
    Ok(buf)
}
