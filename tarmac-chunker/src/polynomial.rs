//! The rolling-polynomial chunkifier.
//!
//! The stream position k carries the value y_k(α) = Σ_{i<k} cm[byte_i]·α^i
//! mod p, maintained incrementally in Montgomery form.  A chunk ends when
//! the buffer reaches the maximum length, or when the current value matches
//! a value seen within the last r = ⌊√(4k − μ)⌋ positions — detected
//! through an open-addressed hash table of (position, value) pairs whose
//! entries expire by age.  The tolerated match distance grows with the
//! chunk, which concentrates chunk lengths around the mean: the probability
//! of a chunk reaching x bytes is roughly 0.267^((x/μ)^(3/2)), with the
//! most common length near 0.65·μ.

use crate::params::{mmul, ChunkerParams};
use crate::{Chunker, ChunkerError};

use std::collections::VecDeque;
use std::io::Read;

/// Width of the queue of values waiting to enter the hash table; also the
/// minimum substring length considered for a match.
const W: usize = 32;

/// Incremental chunkifier state.
///
/// Bytes are pushed in with [`write`](Chunkifier::write); completed chunks
/// are appended to the caller's vector.  [`flush`](Chunkifier::flush) ends
/// the current chunk (if any) at the present position, as at end of stream
/// or an entry boundary.
pub struct Chunkifier {
    params: ChunkerParams,
    /// Maximum chunk length; also the size of `buf`.
    blen: u32,
    /// Hash table size in 2-word entries; a power of two.
    htlen: u32,

    /// Bytes in the current chunk.
    k: u32,
    /// ⌊√(4k − μ)⌋, maintained incrementally.
    r: u32,
    /// (r + 1)² − (4k − μ).
    rs: u32,
    /// α^k · 2^32 mod p.
    akr: u32,
    /// The power series truncated before the x^k term, evaluated at α.
    yka: u32,
    /// Circular queue of values waiting to be added to the hash table.
    b: [u32; W],
    /// Hash table of (position, value) pairs, interleaved.
    ht: Vec<u32>,
    /// Bytes of the chunk in progress.
    buf: Vec<u8>,
}

impl Chunkifier {
    /// Create a chunkifier producing chunks of at most `maxlen` bytes.
    ///
    /// `maxlen` should be at least 2× the parameters' mean length; values
    /// beyond 4× have little effect beyond wasting memory.
    pub fn new(params: &ChunkerParams, maxlen: u32) -> Result<Chunkifier, ChunkerError> {
        if maxlen <= params.mu {
            return Err(ChunkerError::BadParameters);
        }

        // At any time the table holds up to √(4k − μ) entries and as many
        // tombstones; keeping both under 50% occupancy needs the least
        // power of 2 in excess of 8·√(maxlen − μ/4).
        let mut htlen: u32 = 8;
        let mut i = maxlen - params.mu / 4;
        while i > 0 {
            htlen <<= 1;
            i >>= 2;
        }

        let mut c = Chunkifier {
            params: params.clone(),
            blen: maxlen,
            htlen,
            k: 0,
            r: 0,
            rs: 0,
            akr: 0,
            yka: 0,
            b: [0; W],
            ht: vec![0; (htlen as usize) * 2],
            buf: Vec::with_capacity(maxlen as usize),
        };
        c.start();
        Ok(c)
    }

    /// Prepare for the start of a chunk.
    fn start(&mut self) {
        let p = self.params.p;

        // Empty the table: ages in excess of any permitted match distance.
        let htlen = self.htlen;
        for i in 0..htlen as usize {
            self.ht[i * 2] = 0_u32.wrapping_sub(htlen);
        }
        // Nothing queued either; p never equals a reduced value.
        for slot in self.b.iter_mut() {
            *slot = p;
        }

        self.akr = p.wrapping_neg() % p;
        self.yka = 0;
        self.k = 0;
        self.r = 0;
        self.rs = 1 + self.params.mu;
        self.buf.clear();
    }

    /// Feed bytes in; completed chunks are appended to `out`.
    pub fn write(&mut self, data: &[u8], out: &mut Vec<Vec<u8>>) {
        let p = self.params.p;
        let pp = self.params.pp;

        for &byte in data {
            self.buf.push(byte);
            self.k += 1;
            while self.rs <= 4 {
                self.rs += 2 * self.r + 1;
                self.r += 1;
            }
            self.rs -= 4;

            // A full buffer is automatically the end of the chunk.
            if self.k == self.blen {
                out.push(self.take_chunk());
                continue;
            }

            // No permitted match distance yet; skip the arithmetic.
            if self.r == 0 {
                continue;
            }

            // y_k(α) := y_k(α) + α^k · x_k mod p; the two masked
            // subtractions reduce the sum below p.
            self.yka = self
                .yka
                .wrapping_add(mmul(self.akr, self.params.cm[byte as usize], p, pp));
            self.yka = self
                .yka
                .wrapping_sub(p & ((self.yka.wrapping_sub(p) >> 31).wrapping_sub(1)));
            self.yka = self
                .yka
                .wrapping_sub(p & ((self.yka.wrapping_sub(p) >> 31).wrapping_sub(1)));

            // α^k := α^k · α mod p.
            self.akr = mmul(self.akr, self.params.ar, p, pp);

            // Probe for the current value among recent positions.
            let mask = self.htlen - 1;
            let mut htpos = self.yka & mask;
            let mut matched = false;
            loop {
                let age = self.k.wrapping_sub(self.ht[(2 * htpos) as usize]).wrapping_sub(1);
                if self.ht[(2 * htpos + 1) as usize] == self.yka && age < self.r {
                    matched = true;
                    break;
                }
                // Entries older than 2r count as empty.
                if age >= 2 * self.r {
                    break;
                }
                htpos = (htpos + 1) & mask;
            }
            if matched {
                out.push(self.take_chunk());
                continue;
            }

            // Insert the value leaving the w-length queue; entries older
            // than r are tombstones and may be overwritten.
            let yka_tmp = self.b[(self.k as usize) & (W - 1)];
            let mut htpos = yka_tmp & mask;
            loop {
                let age = self.k.wrapping_sub(self.ht[(2 * htpos) as usize]).wrapping_sub(1);
                if age >= self.r {
                    self.ht[(2 * htpos) as usize] = self.k;
                    self.ht[(2 * htpos + 1) as usize] = yka_tmp;
                    break;
                }
                htpos = (htpos + 1) & mask;
            }

            // Queue the current value.
            self.b[(self.k as usize) & (W - 1)] = self.yka;
        }
    }

    /// End the chunk in progress, if non-empty, and reset for more input.
    pub fn flush(&mut self, out: &mut Vec<Vec<u8>>) {
        if self.k != 0 {
            out.push(self.take_chunk());
        }
    }

    /// Bytes buffered in the chunk in progress.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    fn take_chunk(&mut self) -> Vec<u8> {
        let chunk = std::mem::take(&mut self.buf);
        self.start();
        chunk
    }
}

/// Settings for chunking a whole stream; implements the [`Chunker`] trait.
#[derive(Clone)]
pub struct Polynomial {
    params: ChunkerParams,
    maxlen: u32,
}

impl Polynomial {
    pub fn new(params: ChunkerParams, maxlen: u32) -> Polynomial {
        Polynomial { params, maxlen }
    }
}

impl Chunker for Polynomial {
    type Chunks = PolynomialChunker;
    fn chunk_boxed(&self, read: Box<dyn Read + 'static>) -> Self::Chunks {
        PolynomialChunker {
            chunkifier: Chunkifier::new(&self.params, self.maxlen)
                .expect("settings validated at construction"),
            read,
            queue: VecDeque::new(),
            eof: false,
        }
    }
}

/// Iterator over the chunks of a reader.
pub struct PolynomialChunker {
    chunkifier: Chunkifier,
    read: Box<dyn Read + 'static>,
    queue: VecDeque<Vec<u8>>,
    eof: bool,
}

impl Iterator for PolynomialChunker {
    type Item = Result<Vec<u8>, ChunkerError>;
    fn next(&mut self) -> Option<Self::Item> {
        let mut readbuf = [0_u8; 16384];
        let mut out = Vec::new();
        loop {
            if let Some(chunk) = self.queue.pop_front() {
                return Some(Ok(chunk));
            }
            if self.eof {
                return None;
            }
            match self.read.read(&mut readbuf) {
                Ok(0) => {
                    self.eof = true;
                    self.chunkifier.flush(&mut out);
                }
                Ok(n) => self.chunkifier.write(&readbuf[..n], &mut out),
                Err(e) => {
                    self.eof = true;
                    return Some(Err(ChunkerError::IoError(e)));
                }
            }
            self.queue.extend(out.drain(..));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;
    use rand::prelude::*;
    use std::io::Cursor;

    fn test_params() -> ChunkerParams {
        ChunkerParams::derive(&[0_u8; 32], 4096).unwrap()
    }

    fn get_test_data() -> Vec<u8> {
        let mut vec = vec![0_u8; 16384 * 10];
        rand::thread_rng().fill_bytes(&mut vec);
        vec
    }

    #[test]
    fn one_or_more_chunks() {
        let chunker = Polynomial::new(test_params(), 16384);
        let chunks = chunker
            .chunk(Cursor::new(get_test_data()))
            .map(|x| x.unwrap())
            .collect::<Vec<_>>();
        assert!(chunks.len() > 1);
    }

    #[test]
    fn reassemble_data() {
        let data = get_test_data();
        let chunks = Polynomial::new(test_params(), 16384)
            .chunk(Cursor::new(data.clone()))
            .map(|x| x.unwrap())
            .collect::<Vec<_>>();
        let rebuilt: Vec<u8> = chunks.concat();
        assert_eq!(data, rebuilt);
    }

    #[test]
    fn identical_chunks() {
        let data = get_test_data();
        let chunks1 = Polynomial::new(test_params(), 16384)
            .chunk(Cursor::new(data.clone()))
            .map(|x| x.unwrap())
            .collect::<Vec<_>>();
        let chunks2 = Polynomial::new(test_params(), 16384)
            .chunk(Cursor::new(data))
            .map(|x| x.unwrap())
            .collect::<Vec<_>>();
        assert_eq!(chunks1, chunks2);
    }

    // Boundaries must not depend on how the input is fed in: pushing one
    // byte at a time must match pushing the whole buffer.
    #[test]
    fn feed_granularity_is_irrelevant() {
        let data: Vec<u8> = (0..1_000_000_u32).map(|i| (i % 256) as u8).collect();
        let params = ChunkerParams::derive(&[0_u8; 32], 65536).unwrap();

        let mut whole = Vec::new();
        let mut c = Chunkifier::new(&params, 262144).unwrap();
        c.write(&data, &mut whole);
        c.flush(&mut whole);

        let mut bytewise = Vec::new();
        let mut c = Chunkifier::new(&params, 262144).unwrap();
        for b in &data {
            c.write(std::slice::from_ref(b), &mut bytewise);
        }
        c.flush(&mut bytewise);

        assert_eq!(whole, bytewise);
        let total: usize = whole.iter().map(Vec::len).sum();
        assert_eq!(total, data.len());
    }

    #[test]
    fn max_size_respected() {
        let data = get_test_data();
        let chunks = Polynomial::new(test_params(), 16384)
            .chunk(Cursor::new(data))
            .map(|x| x.unwrap())
            .collect::<Vec<_>>();
        for chunk in &chunks {
            assert!(!chunk.is_empty());
            assert!(chunk.len() <= 16384);
        }
    }

    #[test]
    fn mean_is_roughly_mu() {
        // 160 expected chunks; the observed mean should land within a
        // factor of two of the target.
        let data = {
            let mut v = vec![0_u8; 4096 * 160];
            SmallRng::seed_from_u64(7).fill_bytes(&mut v);
            v
        };
        let chunks = Polynomial::new(test_params(), 16384)
            .chunk(Cursor::new(data.clone()))
            .map(|x| x.unwrap())
            .collect::<Vec<_>>();
        let mean = data.len() / chunks.len();
        assert!(mean > 2048 && mean < 8192, "observed mean {}", mean);
    }

    #[test]
    fn empty_input_produces_nothing() {
        let chunks: Vec<_> = Polynomial::new(test_params(), 16384)
            .chunk(Cursor::new(Vec::new()))
            .collect();
        assert!(chunks.is_empty());

        let mut out = Vec::new();
        let mut c = Chunkifier::new(&test_params(), 16384).unwrap();
        c.flush(&mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn different_keys_split_differently() {
        let data: Vec<u8> = (0..200_000_u32).map(|i| (i % 251) as u8).collect();
        let split = |key: [u8; 32]| -> Vec<usize> {
            let params = ChunkerParams::derive(&key, 4096).unwrap();
            Polynomial::new(params, 16384)
                .chunk(Cursor::new(data.clone()))
                .map(|x| x.unwrap().len())
                .collect()
        };
        assert_ne!(split([1_u8; 32]), split([2_u8; 32]));
    }

    #[quickcheck]
    fn concatenation_reconstructs(data: Vec<u8>) -> bool {
        let chunks = Polynomial::new(test_params(), 16384)
            .chunk(Cursor::new(data.clone()))
            .map(|x| x.unwrap())
            .collect::<Vec<_>>();
        chunks.concat() == data
    }
}
