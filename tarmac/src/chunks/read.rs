//! Fetching chunks: read, inflate, and verify length and content address.

use flate2::read::ZlibDecoder;
use tracing::warn;

use std::io::Read;

use tarmac_core::crypto::hash::verify_bytes;
use tarmac_core::keys::{KeyId, KeySet};

use crate::storage::{StorageReader, CLASS_CHUNK};

use super::write::compress_bound;
use super::{ChunksError, Result};

/// Read cookie for the chunk layer; owns the storage read cookie so the
/// metadata paths above can share its connection and cache.
pub struct ChunksReader<'k> {
    keys: &'k KeySet,
    storage: StorageReader<'k>,
    maxlen: usize,
    zbuflen: usize,
}

impl<'k> ChunksReader<'k> {
    pub fn new(keys: &'k KeySet, storage: StorageReader<'k>, maxlen: usize) -> ChunksReader<'k> {
        ChunksReader {
            keys,
            storage,
            maxlen,
            zbuflen: compress_bound(maxlen),
        }
    }

    /// Ask the storage layer to cache this chunk when it is next read.
    pub fn cache(&mut self, hash: &[u8; 32]) {
        self.storage.add_name_cache(CLASS_CHUNK, hash);
    }

    /// Fetch the chunk named `hash`; it must inflate to exactly `len`
    /// bytes whose HMAC is `hash`, and its stored form must be `zlen`
    /// bytes.
    pub fn read_chunk(&mut self, hash: &[u8; 32], len: u32, zlen: u32) -> Result<Vec<u8>> {
        if len as usize > self.maxlen || zlen as usize > self.zbuflen {
            warn!(len, zlen, "chunk exceeds maximum size");
            return Err(ChunksError::Corrupt);
        }

        let zbuf = self
            .storage
            .read_file(CLASS_CHUNK, hash, Some(zlen as usize))?;

        let mut buf = Vec::with_capacity(len as usize);
        let mut decoder = ZlibDecoder::new(&zbuf[..]);
        // Bound the read so a malicious stream cannot balloon memory.
        let n = decoder
            .by_ref()
            .take(u64::from(len) + 1)
            .read_to_end(&mut buf)
            .map_err(|_| ChunksError::Corrupt)?;
        if n != len as usize {
            warn!(
                expected = len,
                actual = n,
                hash = %hex::encode(hash),
                "chunk has incorrect length"
            );
            return Err(ChunksError::Corrupt);
        }

        let actual = self.keys.hash_data(KeyId::HmacChunk, &buf)?;
        if !verify_bytes(&actual, hash) {
            warn!(hash = %hex::encode(hash), "chunk has incorrect hash");
            return Err(ChunksError::Corrupt);
        }
        Ok(buf)
    }

    /// The underlying storage cookie, for metadata and metaindex reads.
    pub fn storage_mut(&mut self) -> &mut StorageReader<'k> {
        &mut self.storage
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunks::write::{chunk_hash, ChunksWriter};
    use crate::netpacket::loopback::LoopbackServer;
    use crate::netpacket::PacketConn;
    use crate::storage::{transaction, StorageWriter, WriteLimits};
    use tarmac_core::keys::{MASK_AUTH_DELETE, MASK_AUTH_GET, MASK_READ, MASK_WRITE};

    fn test_keys() -> KeySet {
        let mut keys = KeySet::new();
        keys.generate(MASK_WRITE | MASK_READ | MASK_AUTH_GET | MASK_AUTH_DELETE)
            .unwrap();
        keys
    }

    fn store_chunk(keys: &KeySet, server: &LoopbackServer, data: &[u8]) -> ([u8; 32], u32) {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageWriter::start(
            Box::new(server.clone()),
            keys,
            1,
            &[0; 32],
            false,
            WriteLimits::default(),
        )
        .unwrap();
        let mut chunks = ChunksWriter::start(dir.path(), storage, 262_144).unwrap();
        let hash = chunk_hash(keys, data).unwrap();
        let zlen = chunks.write_chunk(&hash, data).unwrap();
        let seqnum = chunks.storage_mut().seqnum();
        chunks.end().unwrap();
        let mut conn = PacketConn::open(Box::new(server.clone()));
        transaction::commit(&mut conn, keys, 1, &seqnum, 0).unwrap();
        (hash, zlen)
    }

    #[test]
    fn chunk_round_trip() {
        let keys = test_keys();
        let server = LoopbackServer::new(1, &keys);
        let data: Vec<u8> = (0..50_000_u32).map(|i| (i % 251) as u8).collect();
        let (hash, zlen) = store_chunk(&keys, &server, &data);

        let reader = StorageReader::new(Box::new(server), &keys, 1);
        let mut chunks = ChunksReader::new(&keys, reader, 262_144);
        let out = chunks
            .read_chunk(&hash, data.len() as u32, zlen)
            .unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn wrong_length_is_corrupt() {
        let keys = test_keys();
        let server = LoopbackServer::new(1, &keys);
        let data = vec![7_u8; 5000];
        let (hash, zlen) = store_chunk(&keys, &server, &data);

        let reader = StorageReader::new(Box::new(server), &keys, 1);
        let mut chunks = ChunksReader::new(&keys, reader, 262_144);
        assert!(matches!(
            chunks.read_chunk(&hash, 4999, zlen),
            Err(ChunksError::Corrupt)
        ));
    }

    #[test]
    fn missing_chunk_is_not_present() {
        let keys = test_keys();
        let server = LoopbackServer::new(1, &keys);
        let reader = StorageReader::new(Box::new(server), &keys, 1);
        let mut chunks = ChunksReader::new(&keys, reader, 262_144);
        assert!(matches!(
            chunks.read_chunk(&[3; 32], 100, 50),
            Err(ChunksError::NotPresent)
        ));
    }
}
