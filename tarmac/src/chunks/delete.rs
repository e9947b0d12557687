//! Dropping chunk references and deleting unreferenced chunks.

use tracing::trace;

use std::path::Path;

use crate::storage::{StorageDeleter, CLASS_CHUNK};

use super::directory::ChunkDirectory;
use super::{ChunkStats, Result};

/// Delete cookie for the chunk layer; owns the storage delete cookie so
/// the metadata paths above can reuse its transaction.
pub struct ChunksDeleter<'k> {
    dir: ChunkDirectory,
    storage: StorageDeleter<'k>,
    stats: ChunkStats,
}

impl<'k> ChunksDeleter<'k> {
    /// Open the chunk directory (taking the cache lock) on top of a
    /// started delete transaction.
    pub fn start(cachedir: &Path, storage: StorageDeleter<'k>) -> Result<ChunksDeleter<'k>> {
        let dir = ChunkDirectory::open(cachedir)?;
        Ok(ChunksDeleter {
            dir,
            storage,
            stats: ChunkStats::default(),
        })
    }

    /// Drop one reference to the chunk; when the count reaches zero, the
    /// stored file is deleted.
    pub fn delete_chunk(&mut self, hash: &[u8; 32]) -> Result<()> {
        let record = self.dir.get(hash).copied();
        if self.dir.release(hash)? {
            trace!("last reference dropped; deleting stored chunk");
            self.storage.delete_file(CLASS_CHUNK, hash)?;
            if let Some(record) = record {
                self.stats.add_unique(record.len, record.zlen);
            }
        }
        if let Some(record) = record {
            self.stats.add_total(record.len, record.zlen);
        }
        Ok(())
    }

    /// Account for metadata bytes removed outside the chunk path.
    pub fn extra_stats(&mut self, len: usize) {
        self.stats.add_extra(len);
    }

    /// The statistics accumulated so far.
    pub fn stats(&self) -> ChunkStats {
        self.stats
    }

    /// The underlying storage cookie, for metadata and metaindex deletes
    /// sharing this transaction.
    pub fn storage_mut(&mut self) -> &mut StorageDeleter<'k> {
        &mut self.storage
    }

    /// Direct access to the directory, for fsck rebuilds.
    pub fn directory_mut(&mut self) -> &mut ChunkDirectory {
        &mut self.dir
    }

    /// Flush storage, stage the updated directory, and release both
    /// cookies.
    pub fn end(mut self) -> Result<ChunkStats> {
        self.storage.flush()?;
        self.dir.save_staged()?;
        self.storage.end()?;
        Ok(self.stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunks::write::{chunk_hash, ChunksWriter};
    use crate::chunks::ChunksError;
    use crate::netpacket::loopback::LoopbackServer;
    use crate::netpacket::PacketConn;
    use crate::storage::{transaction, StorageWriter, TxnType, WriteLimits};
    use tarmac_core::keys::{KeySet, MASK_AUTH_DELETE, MASK_AUTH_GET, MASK_WRITE};

    fn test_keys() -> KeySet {
        let mut keys = KeySet::new();
        keys.generate(MASK_WRITE | MASK_AUTH_GET | MASK_AUTH_DELETE)
            .unwrap();
        keys
    }

    #[test]
    fn refcount_reaches_zero_then_server_delete() {
        let keys = test_keys();
        let server = LoopbackServer::new(8, &keys);
        let cachedir = tempfile::tempdir().unwrap();
        let data = b"shared chunk".to_vec();
        let hash = chunk_hash(&keys, &data).unwrap();

        // Two archives' worth of references.
        let mut lastseq = [0_u8; 32];
        for _ in 0..2 {
            let storage = StorageWriter::start(
                Box::new(server.clone()),
                &keys,
                8,
                &lastseq,
                false,
                WriteLimits::default(),
            )
            .unwrap();
            let mut chunks = ChunksWriter::start(cachedir.path(), storage, 262_144).unwrap();
            chunks.write_chunk(&hash, &data).unwrap();
            let seqnum = chunks.storage_mut().seqnum();
            chunks.end().unwrap();
            let mut conn = PacketConn::open(Box::new(server.clone()));
            transaction::commit(&mut conn, &keys, 8, &seqnum, 0).unwrap();
            crate::chunks::directory::commit_staged(cachedir.path()).unwrap();
            lastseq = seqnum;
        }
        assert_eq!(server.count_files(CLASS_CHUNK), 1);

        // Drop the first reference: chunk stays.
        let storage = StorageDeleter::start(
            Box::new(server.clone()),
            &keys,
            8,
            &lastseq,
            TxnType::Delete,
        )
        .unwrap();
        let mut deleter = ChunksDeleter::start(cachedir.path(), storage).unwrap();
        deleter.delete_chunk(&hash).unwrap();
        let seqnum = deleter.storage_mut().seqnum();
        deleter.end().unwrap();
        let mut conn = PacketConn::open(Box::new(server.clone()));
        transaction::commit(&mut conn, &keys, 8, &seqnum, 1).unwrap();
        crate::chunks::directory::commit_staged(cachedir.path()).unwrap();
        assert_eq!(server.count_files(CLASS_CHUNK), 1);
        lastseq = seqnum;

        // Drop the second: the stored file goes away.
        let storage = StorageDeleter::start(
            Box::new(server.clone()),
            &keys,
            8,
            &lastseq,
            TxnType::Delete,
        )
        .unwrap();
        let mut deleter = ChunksDeleter::start(cachedir.path(), storage).unwrap();
        deleter.delete_chunk(&hash).unwrap();
        assert!(matches!(
            deleter.delete_chunk(&hash),
            Err(ChunksError::NotPresent)
        ));
        let seqnum = deleter.storage_mut().seqnum();
        deleter.end().unwrap();
        let mut conn = PacketConn::open(Box::new(server.clone()));
        transaction::commit(&mut conn, &keys, 8, &seqnum, 1).unwrap();
        assert_eq!(server.count_files(CLASS_CHUNK), 0);
    }
}
