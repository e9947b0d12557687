/*!
Transactional file storage on the remote service.

Files live in three classes — `m` (archive metadata), `i` (metaindex),
`c` (chunks) — and are named by 32 bytes.  Reading is stateless; writing
and deleting happen inside transactions identified by a 32-byte nonce
derived from server- and client-supplied randomness.  Every file body is
wrapped in the per-session encryption envelope before it leaves the
machine.
*/

pub mod delete;
pub mod directory;
pub mod read;
pub mod transaction;
pub mod write;

pub use self::delete::StorageDeleter;
pub use self::read::StorageReader;
pub use self::transaction::TxnType;
pub use self::write::{StopRequest, StorageWriter, WriteLimits};

use thiserror::Error;

use tarmac_core::crypto::file::FileError;
use tarmac_core::keys::KeyError;

use crate::netpacket::NetpacketError;

/// Archive metadata files.
pub const CLASS_METADATA: u8 = b'm';
/// Metaindex files.
pub const CLASS_METAINDEX: u8 = b'i';
/// Chunk files.
pub const CLASS_CHUNK: u8 = b'c';

/// Largest file stored under any class; a maximum-size compressed chunk
/// plus its envelope fits with room to spare.
pub const MAXFILESIZE: usize = crate::netpacket::packets::MAXFILESIZE;

#[derive(Error, Debug)]
pub enum StorageError {
    /// The named file does not exist on the server.
    #[error("file not present on server")]
    NotFound,
    /// The file exists but fails authentication or has the wrong length.
    /// Never retried.
    #[error("file is corrupt")]
    Corrupt,
    /// The transaction nonce is stale: another transaction was started
    /// for this machine.  Fatal to the current transaction.
    #[error("transaction nonce is no longer valid")]
    StaleNonce,
    /// The local sequence number does not match the server's; the cache
    /// directory needs an fsck.
    #[error("sequence number mismatch: local state is out of date")]
    SequenceMismatch,
    #[error("file exceeds the maximum storage size")]
    TooLarge,
    #[error("network operation failed")]
    Net(#[from] NetpacketError),
    #[error("key not available")]
    Key(#[from] KeyError),
    #[error("could not obtain entropy")]
    Entropy(#[from] tarmac_core::crypto::entropy::EntropyError),
    /// The server answered with something structurally valid but
    /// impossible for the request.
    #[error("unexpected server response")]
    Protocol,
}

impl From<FileError> for StorageError {
    fn from(err: FileError) -> StorageError {
        match err {
            FileError::Corrupt => StorageError::Corrupt,
            FileError::Key(e) => StorageError::Key(e),
            FileError::Entropy(e) => StorageError::Entropy(e),
            FileError::Rsa(_) => StorageError::Protocol,
        }
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;
