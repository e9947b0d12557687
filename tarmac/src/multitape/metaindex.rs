//! The per-archive metaindex: the chunk lists of the three streams.
//!
//! Serialized as three sections, each a 64-bit little-endian length
//! followed by that stream's concatenated chunk headers.  The SHA-256 of
//! the whole serialization is the `indexhash` recorded (and signed) in
//! the metadata; it is also the storage name of the first fragment.
//! Serializations longer than one storage file are split into fragments,
//! fragment i >= 1 being named SHA-256(indexhash || le32(i)).

use byteorder::{ByteOrder, LittleEndian};

use tarmac_core::crypto::hash::{sha256, sha256_2, verify_bytes};
use tarmac_core::keys::KeySet;

use crate::chunks::{ChunksDeleter, ChunksWriter};
use crate::storage::{StorageError, StorageReader, CLASS_METAINDEX};

use super::metadata::TapeMetadata;
use super::{MultitapeError, Result};

/// Largest metaindex fragment stored as one file.
pub const MAXIFRAG: usize = 262_144;

/// The three stream indexes of one archive.
#[derive(Debug, Default, Clone)]
pub struct TapeMetaindex {
    pub hindex: Vec<u8>,
    pub cindex: Vec<u8>,
    pub tindex: Vec<u8>,
}

impl TapeMetaindex {
    fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(
            24 + self.hindex.len() + self.cindex.len() + self.tindex.len(),
        );
        for section in [&self.hindex, &self.cindex, &self.tindex] {
            let mut len = [0_u8; 8];
            LittleEndian::write_u64(&mut len, section.len() as u64);
            buf.extend_from_slice(&len);
            buf.extend_from_slice(section);
        }
        buf
    }

    fn deserialize(buf: &[u8]) -> Result<TapeMetaindex> {
        let mut pos = 0;
        let mut sections: [Vec<u8>; 3] = Default::default();
        for section in &mut sections {
            if buf.len() - pos < 8 {
                return Err(MultitapeError::Corrupt);
            }
            let len = LittleEndian::read_u64(&buf[pos..pos + 8]) as usize;
            pos += 8;
            if buf.len() - pos < len {
                return Err(MultitapeError::Corrupt);
            }
            *section = buf[pos..pos + len].to_vec();
            pos += len;
        }
        if pos != buf.len() {
            return Err(MultitapeError::Corrupt);
        }
        let [hindex, cindex, tindex] = sections;
        Ok(TapeMetaindex {
            hindex,
            cindex,
            tindex,
        })
    }
}

/// The storage name of fragment `i` of a metaindex.
pub fn frag_name(indexhash: &[u8; 32], i: usize) -> [u8; 32] {
    if i == 0 {
        *indexhash
    } else {
        let mut num = [0_u8; 4];
        LittleEndian::write_u32(&mut num, i as u32);
        sha256_2(indexhash, &num)
    }
}

/// Store the metaindex inside the write transaction, filling in the
/// metadata's `indexhash` and `indexlen`.
///
/// Must run before the metadata is stored, since the metadata signs the
/// values computed here.
pub fn put(
    chunks: &mut ChunksWriter<'_>,
    _keys: &KeySet,
    tmi: &TapeMetaindex,
    md: &mut TapeMetadata,
) -> Result<()> {
    let buf = tmi.serialize();
    md.indexhash = sha256(&buf);
    md.indexlen = buf.len() as u64;

    for (i, frag) in buf.chunks(MAXIFRAG).enumerate() {
        let name = frag_name(&md.indexhash, i);
        chunks.storage_mut().write_file(CLASS_METAINDEX, &name, frag)?;
    }
    chunks.extra_stats(buf.len());
    Ok(())
}

/// Read, reassemble, and verify the metaindex named by the metadata.
pub fn get(
    reader: &mut StorageReader<'_>,
    _keys: &KeySet,
    md: &TapeMetadata,
) -> Result<TapeMetaindex> {
    // Even an empty archive's metaindex carries its three section
    // lengths.
    let total = md.indexlen as usize;
    if total < 24 {
        return Err(MultitapeError::Corrupt);
    }
    let mut buf = Vec::with_capacity(total);
    let mut i = 0;
    while buf.len() < total {
        let expected = (total - buf.len()).min(MAXIFRAG);
        let name = frag_name(&md.indexhash, i);
        let frag = match reader.read_file(CLASS_METAINDEX, &name, Some(expected)) {
            Ok(frag) => frag,
            Err(StorageError::NotFound) => return Err(MultitapeError::NotFound),
            Err(StorageError::Corrupt) => return Err(MultitapeError::Corrupt),
            Err(e) => return Err(e.into()),
        };
        buf.extend_from_slice(&frag);
        i += 1;
    }

    let actual = sha256(&buf);
    if !verify_bytes(&actual, &md.indexhash) {
        return Err(MultitapeError::Corrupt);
    }
    TapeMetaindex::deserialize(&buf)
}

/// Delete every fragment inside the delete transaction.
pub fn delete(
    chunks: &mut ChunksDeleter<'_>,
    _keys: &KeySet,
    md: &TapeMetadata,
) -> Result<()> {
    let total = md.indexlen as usize;
    let nfrags = if total == 0 {
        1
    } else {
        (total + MAXIFRAG - 1) / MAXIFRAG
    };
    for i in 0..nfrags {
        let name = frag_name(&md.indexhash, i);
        chunks.storage_mut().delete_file(CLASS_METAINDEX, &name)?;
    }
    chunks.extra_stats(total);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialize_round_trip() {
        let tmi = TapeMetaindex {
            hindex: vec![1; 80],
            cindex: vec![2; 120],
            tindex: vec![3; 40],
        };
        let buf = tmi.serialize();
        assert_eq!(buf.len(), 24 + 240);
        let parsed = TapeMetaindex::deserialize(&buf).unwrap();
        assert_eq!(parsed.hindex, tmi.hindex);
        assert_eq!(parsed.cindex, tmi.cindex);
        assert_eq!(parsed.tindex, tmi.tindex);
    }

    #[test]
    fn truncation_detected() {
        let tmi = TapeMetaindex {
            hindex: vec![1; 80],
            cindex: Vec::new(),
            tindex: Vec::new(),
        };
        let buf = tmi.serialize();
        assert!(TapeMetaindex::deserialize(&buf[..buf.len() - 1]).is_err());
        let mut extended = buf;
        extended.push(0);
        assert!(TapeMetaindex::deserialize(&extended).is_err());
    }

    #[test]
    fn fragment_names_are_distinct() {
        let indexhash = [7_u8; 32];
        assert_eq!(frag_name(&indexhash, 0), indexhash);
        assert_ne!(frag_name(&indexhash, 1), frag_name(&indexhash, 2));
        assert_ne!(frag_name(&indexhash, 1), indexhash);
    }
}
