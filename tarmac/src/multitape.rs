/*!
The multistream archive ("tape") format.

An archive is three byte streams:

- the header stream H: per entry, a 16-byte entry header
  `<hlen: u32 LE><clen: u64 LE><tlen: u32 LE>` followed by the opaque
  entry header bytes;
- the chunk index stream C: 40-byte chunk headers naming, in order, the
  chunks holding each entry's body;
- the trailer stream T: the sub-chunk-size tails of entries, concatenated.

Each stream is itself chunkified and stored as chunks; the lists of those
chunks' headers form the metaindex, which a signed metadata file points
at.  Writing happens inside a storage write transaction and becomes
visible atomically at commit.
*/

pub mod chunkiter;
pub mod delete;
pub mod fsck;
pub mod metadata;
pub mod metaindex;
pub mod read;
pub mod state;
pub mod write;

pub use self::metadata::TapeMetadata;
pub use self::read::extract_tape;
pub use self::write::TapeWriter;

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

use tarmac_core::keys::{KeyError, KeyId, KeySet};
use tarmac_chunker::ChunkerError;

use crate::chunks::ChunksError;
use crate::netpacket::Dialer;
use crate::storage::{directory::directory_read, StorageError, StorageReader, CLASS_METADATA};

/// Mean chunk size for all streams.
pub const MEANCHUNK: u32 = 65536;
/// Maximum chunk size.
pub const MAXCHUNK: u32 = 262_144;
/// Entry tails shorter than this go to the trailer stream instead of
/// being stored as chunks.
pub const MINCHUNK: usize = 4096;

/// Serialized chunk header length.
pub const CHUNKHEADER_LEN: usize = 40;
/// Serialized entry header length.
pub const ENTRYHEADER_LEN: usize = 16;

#[derive(Error, Debug)]
pub enum MultitapeError {
    /// A stored structure fails verification.
    #[error("archive data is corrupt")]
    Corrupt,
    #[error("archive does not exist")]
    NotFound,
    #[error("an archive already exists with this name")]
    NameInUse,
    /// An entry produced a second trailer, or a mode change was illegal.
    #[error("archive writer used incorrectly")]
    BadSequence,
    #[error("chunk layer error")]
    Chunks(#[from] ChunksError),
    #[error("storage layer error")]
    Storage(#[from] StorageError),
    #[error("chunker error")]
    Chunker(#[from] ChunkerError),
    #[error("key not available")]
    Key(#[from] KeyError),
    #[error("cache directory I/O failed")]
    Io(#[from] std::io::Error),
    #[error("could not obtain entropy")]
    Entropy(#[from] tarmac_core::crypto::entropy::EntropyError),
    #[error("archive byte stream I/O failed")]
    Sink(std::io::Error),
}

pub type Result<T> = std::result::Result<T, MultitapeError>;

/// A 40-byte record identifying one stored chunk: its content address
/// and its plaintext and compressed lengths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub hash: [u8; 32],
    pub len: u32,
    pub zlen: u32,
}

impl ChunkHeader {
    pub fn encode(&self) -> [u8; CHUNKHEADER_LEN] {
        let mut buf = [0_u8; CHUNKHEADER_LEN];
        buf[..32].copy_from_slice(&self.hash);
        LittleEndian::write_u32(&mut buf[32..36], self.len);
        LittleEndian::write_u32(&mut buf[36..40], self.zlen);
        buf
    }

    pub fn decode(buf: &[u8]) -> ChunkHeader {
        let mut hash = [0_u8; 32];
        hash.copy_from_slice(&buf[..32]);
        ChunkHeader {
            hash,
            len: LittleEndian::read_u32(&buf[32..36]),
            zlen: LittleEndian::read_u32(&buf[36..40]),
        }
    }
}

/// The fixed-size prefix of each entry in the header stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryHeader {
    /// Opaque entry header length.
    pub hlen: u32,
    /// Bytes of entry body stored as chunks.
    pub clen: u64,
    /// Bytes of entry body stored in the trailer stream.
    pub tlen: u32,
}

impl EntryHeader {
    pub fn encode(&self) -> [u8; ENTRYHEADER_LEN] {
        let mut buf = [0_u8; ENTRYHEADER_LEN];
        LittleEndian::write_u32(&mut buf[..4], self.hlen);
        LittleEndian::write_u64(&mut buf[4..12], self.clen);
        LittleEndian::write_u32(&mut buf[12..16], self.tlen);
        buf
    }

    pub fn decode(buf: &[u8]) -> EntryHeader {
        EntryHeader {
            hlen: LittleEndian::read_u32(&buf[..4]),
            clen: LittleEndian::read_u64(&buf[4..12]),
            tlen: LittleEndian::read_u32(&buf[12..16]),
        }
    }
}

/// One archive as shown by `--list-archives`.
#[derive(Debug, Clone)]
pub struct TapeListEntry {
    pub name: String,
    pub ctime: u64,
}

/// List every archive: walk the metadata class and read each record.
pub fn list_tapes(
    dialer: Box<dyn Dialer>,
    keys: &KeySet,
    machinenum: u64,
) -> Result<Vec<TapeListEntry>> {
    let mut reader = StorageReader::new(dialer, keys, machinenum);
    let hashes = directory_read(
        reader.conn_mut(),
        keys,
        machinenum,
        CLASS_METADATA,
        false,
        [0; 32],
    )?;
    let mut tapes = Vec::with_capacity(hashes.len());
    for hash in &hashes {
        let md = metadata::get_by_hash(&mut reader, keys, hash)?;
        tapes.push(TapeListEntry {
            name: md.name,
            ctime: md.ctime,
        });
    }
    Ok(tapes)
}

/// The storage name of an archive: the keyed hash of its name.
pub fn tape_name_hash(keys: &KeySet, name: &str) -> Result<[u8; 32]> {
    Ok(keys.hash_data(KeyId::HmacName, name.as_bytes())?)
}
