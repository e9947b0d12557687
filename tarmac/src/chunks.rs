/*!
The local chunk layer: a content-addressed directory of every chunk held
by the server, with reference counts, and the compress/store and
fetch/verify paths built on it.

A chunk is present on the server exactly when its committed reference
count is at least one.  References taken by an in-progress transaction
are tracked separately and only folded into the durable counts when the
transaction commits; a crash before commit therefore leaves the directory
agreeing with the server.
*/

pub mod delete;
pub mod directory;
pub mod read;
pub mod write;

pub use self::delete::ChunksDeleter;
pub use self::directory::{ChunkDirectory, ChunkRecord};
pub use self::read::ChunksReader;
pub use self::write::ChunksWriter;

use thiserror::Error;

use crate::storage::StorageError;

#[derive(Error, Debug)]
pub enum ChunksError {
    /// The chunk is not present (locally or on the server).
    #[error("chunk not present")]
    NotPresent,
    /// The stored chunk fails decompression, length, or hash checks.
    #[error("chunk is corrupt")]
    Corrupt,
    #[error("another process holds the cache directory")]
    CacheLocked,
    #[error("chunk directory is malformed")]
    BadDirectory,
    #[error("cache directory I/O failed")]
    Io(#[from] std::io::Error),
    #[error("storage operation failed")]
    Storage(StorageError),
    #[error("key not available")]
    Key(#[from] tarmac_core::keys::KeyError),
}

impl From<StorageError> for ChunksError {
    fn from(err: StorageError) -> ChunksError {
        match err {
            StorageError::NotFound => ChunksError::NotPresent,
            StorageError::Corrupt => ChunksError::Corrupt,
            other => ChunksError::Storage(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, ChunksError>;

/// Running totals shown by `--print-stats`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ChunkStats {
    /// Chunks and bytes referenced, counting every reference.
    pub total_chunks: u64,
    pub total_bytes: u64,
    pub total_compressed: u64,
    /// Chunks and bytes stored once.
    pub unique_chunks: u64,
    pub unique_bytes: u64,
    pub unique_compressed: u64,
    /// Metadata and metaindex bytes not stored as chunks.
    pub extra_bytes: u64,
}

impl ChunkStats {
    pub(crate) fn add_total(&mut self, len: u32, zlen: u32) {
        self.total_chunks += 1;
        self.total_bytes += u64::from(len);
        self.total_compressed += u64::from(zlen);
    }

    pub(crate) fn add_unique(&mut self, len: u32, zlen: u32) {
        self.unique_chunks += 1;
        self.unique_bytes += u64::from(len);
        self.unique_compressed += u64::from(zlen);
    }

    pub(crate) fn add_extra(&mut self, len: usize) {
        self.extra_bytes += len as u64;
    }
}
