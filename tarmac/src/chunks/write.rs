//! Storing chunks: deduplicate against the directory, compress, and hand
//! the result to the storage layer.

use flate2::write::ZlibEncoder;
use flate2::Compression;
use tracing::trace;

use std::io::Write;
use std::path::Path;

use tarmac_core::keys::KeySet;

use crate::storage::{StorageWriter, CLASS_CHUNK};

use super::directory::ChunkDirectory;
use super::{ChunkStats, ChunksError, Result};

/// Worst-case zlib growth for a buffer of length `len`.
pub fn compress_bound(len: usize) -> usize {
    len + len / 1000 + 13
}

/// Write cookie for the chunk layer; owns the storage write cookie so the
/// metadata paths above can reuse its transaction.
pub struct ChunksWriter<'k> {
    dir: ChunkDirectory,
    storage: StorageWriter<'k>,
    maxlen: usize,
    stats: ChunkStats,
}

impl<'k> ChunksWriter<'k> {
    /// Open the chunk directory (taking the cache lock) on top of a
    /// started write transaction.
    pub fn start(
        cachedir: &Path,
        storage: StorageWriter<'k>,
        maxlen: usize,
    ) -> Result<ChunksWriter<'k>> {
        let dir = ChunkDirectory::open(cachedir)?;
        Ok(ChunksWriter {
            dir,
            storage,
            maxlen,
            stats: ChunkStats::default(),
        })
    }

    /// Store the chunk `buf` under its HMAC `hash`, deduplicating against
    /// existing references.  Returns the compressed length, the bytes the
    /// chunk actually occupies.
    pub fn write_chunk(&mut self, hash: &[u8; 32], buf: &[u8]) -> Result<u32> {
        if buf.is_empty() || buf.len() > self.maxlen {
            return Err(ChunksError::Corrupt);
        }

        if let Some(record) = self.dir.get(hash) {
            if record.effective_refs() > 0 {
                let (len, zlen) = (record.len, record.zlen);
                self.dir.reference(hash);
                self.stats.add_total(len, zlen);
                trace!("chunk already stored");
                return Ok(zlen);
            }
        }

        let bound = compress_bound(self.maxlen);
        let mut encoder =
            ZlibEncoder::new(Vec::with_capacity(buf.len() / 2), Compression::new(9));
        encoder.write_all(buf)?;
        let zbuf = encoder.finish()?;
        if zbuf.len() > bound {
            return Err(ChunksError::Corrupt);
        }

        self.storage.write_file(CLASS_CHUNK, hash, &zbuf)?;

        let (len, zlen) = (buf.len() as u32, zbuf.len() as u32);
        self.dir.insert_new(*hash, len, zlen);
        self.stats.add_total(len, zlen);
        self.stats.add_unique(len, zlen);
        Ok(zlen)
    }

    /// Add a reference to a chunk that must already be present; returns
    /// false (and takes no reference) when it is not.
    pub fn chunk_ref(&mut self, hash: &[u8; 32]) -> Result<bool> {
        match self.dir.get(hash) {
            Some(record) if record.effective_refs() > 0 => {
                let (len, zlen) = (record.len, record.zlen);
                self.dir.reference(hash);
                self.stats.add_total(len, zlen);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Is the chunk present (without taking a reference)?
    pub fn is_present(&self, hash: &[u8; 32]) -> bool {
        self.dir
            .get(hash)
            .map_or(false, |record| record.effective_refs() > 0)
    }

    /// Account for metadata bytes stored outside the chunk path.
    pub fn extra_stats(&mut self, len: usize) {
        self.stats.add_extra(len);
    }

    /// The statistics accumulated so far.
    pub fn stats(&self) -> ChunkStats {
        self.stats
    }

    /// The underlying storage cookie, for metadata and metaindex writes
    /// sharing this transaction.
    pub fn storage_mut(&mut self) -> &mut StorageWriter<'k> {
        &mut self.storage
    }

    /// Flush storage, stage the updated directory, and release both
    /// cookies.  The staged directory is promoted when the transaction
    /// commit succeeds.
    pub fn end(mut self) -> Result<ChunkStats> {
        self.storage.flush()?;
        self.dir.save_staged()?;
        self.storage.end()?;
        Ok(self.stats)
    }
}

/// The content address of a chunk: the keyed HMAC of its plaintext.
pub fn chunk_hash(keys: &KeySet, buf: &[u8]) -> Result<[u8; 32]> {
    Ok(keys.hash_data(tarmac_core::keys::KeyId::HmacChunk, buf)?)
}
