//! The signed per-archive metadata record.
//!
//! Layout:
//!
//! ```text
//! <NUL-terminated name>
//! <64-bit little-endian creation time>
//! <32-bit little-endian argument count>
//! argc * <NUL-terminated argument>
//! SHA256(metaindex)        (32 bytes)
//! <64-bit little-endian metaindex length>
//! RSA-PSS signature over everything above (256 bytes)
//! ```
//!
//! The record is stored under class `m`, named by the keyed hash of the
//! archive name; on read, both the signature and the name-to-storage-name
//! binding are verified.

use byteorder::{ByteOrder, LittleEndian};
use tracing::warn;

use tarmac_core::crypto::hash::verify_bytes;
use tarmac_core::crypto::rsa;
use tarmac_core::keys::KeySet;

use crate::chunks::{ChunksDeleter, ChunksWriter};
use crate::storage::{StorageError, StorageReader, CLASS_METADATA};

use super::{tape_name_hash, MultitapeError, Result};

/// Parsed archive metadata.
#[derive(Debug, Clone)]
pub struct TapeMetadata {
    pub name: String,
    pub ctime: u64,
    pub args: Vec<String>,
    pub indexhash: [u8; 32],
    pub indexlen: u64,
    /// Length of the encoded record, for storage accounting.
    pub metadatalen: usize,
}

impl TapeMetadata {
    pub fn new(name: &str, ctime: u64, args: Vec<String>) -> TapeMetadata {
        TapeMetadata {
            name: name.to_owned(),
            ctime,
            args,
            indexhash: [0; 32],
            indexlen: 0,
            metadatalen: 0,
        }
    }

    /// Encode and sign.
    pub fn encode(&self, keys: &KeySet) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        buf.extend_from_slice(self.name.as_bytes());
        buf.push(0);

        let mut num = [0_u8; 8];
        LittleEndian::write_u64(&mut num, self.ctime);
        buf.extend_from_slice(&num);
        let mut argc = [0_u8; 4];
        LittleEndian::write_u32(&mut argc, self.args.len() as u32);
        buf.extend_from_slice(&argc);
        for arg in &self.args {
            buf.extend_from_slice(arg.as_bytes());
            buf.push(0);
        }

        buf.extend_from_slice(&self.indexhash);
        let mut len = [0_u8; 8];
        LittleEndian::write_u64(&mut len, self.indexlen);
        buf.extend_from_slice(&len);

        let sig = rsa::sign(keys.sign_priv()?, &buf).map_err(|_| MultitapeError::Corrupt)?;
        buf.extend_from_slice(&sig);
        Ok(buf)
    }

    /// Parse and verify an encoded record.
    pub fn decode(keys: &KeySet, buf: &[u8]) -> Result<TapeMetadata> {
        let mut pos = 0;

        let take_cstr = |pos: &mut usize| -> Result<String> {
            let rest = &buf[*pos..];
            let nul = rest
                .iter()
                .position(|&b| b == 0)
                .ok_or(MultitapeError::Corrupt)?;
            let s = String::from_utf8(rest[..nul].to_vec())
                .map_err(|_| MultitapeError::Corrupt)?;
            *pos += nul + 1;
            Ok(s)
        };
        let need = |pos: usize, n: usize| -> Result<()> {
            if buf.len() - pos < n {
                Err(MultitapeError::Corrupt)
            } else {
                Ok(())
            }
        };

        let name = take_cstr(&mut pos)?;
        need(pos, 12)?;
        let ctime = LittleEndian::read_u64(&buf[pos..pos + 8]);
        pos += 8;
        let argc = LittleEndian::read_u32(&buf[pos..pos + 4]) as usize;
        pos += 4;
        let mut args = Vec::with_capacity(argc.min(64));
        for _ in 0..argc {
            args.push(take_cstr(&mut pos)?);
        }

        need(pos, 32 + 8 + 256)?;
        let mut indexhash = [0_u8; 32];
        indexhash.copy_from_slice(&buf[pos..pos + 32]);
        pos += 32;
        let indexlen = LittleEndian::read_u64(&buf[pos..pos + 8]);
        pos += 8;

        match rsa::verify(keys.sign_pub()?, &buf[..pos], &buf[pos..pos + 256]) {
            Ok(()) => {}
            Err(rsa::RsaError::BadSignature) => return Err(MultitapeError::Corrupt),
            Err(_) => return Err(MultitapeError::Corrupt),
        }
        pos += 256;
        if pos != buf.len() {
            return Err(MultitapeError::Corrupt);
        }

        Ok(TapeMetadata {
            name,
            ctime,
            args,
            indexhash,
            indexlen,
            metadatalen: buf.len(),
        })
    }
}

/// Does a metadata file exist for this archive name?
pub fn is_present(chunks: &mut ChunksWriter<'_>, keys: &KeySet, name: &str) -> Result<bool> {
    let hash = tape_name_hash(keys, name)?;
    Ok(chunks.storage_mut().fexist(CLASS_METADATA, &hash)?)
}

/// Store archive metadata inside the write transaction.
pub fn put(chunks: &mut ChunksWriter<'_>, keys: &KeySet, md: &TapeMetadata) -> Result<()> {
    let buf = md.encode(keys)?;
    let hash = tape_name_hash(keys, &md.name)?;
    chunks.storage_mut().write_file(CLASS_METADATA, &hash, &buf)?;
    chunks.extra_stats(buf.len());
    Ok(())
}

/// Read and verify metadata by its storage name.
pub fn get_by_hash(
    reader: &mut StorageReader<'_>,
    keys: &KeySet,
    tapehash: &[u8; 32],
) -> Result<TapeMetadata> {
    let buf = match reader.read_file(CLASS_METADATA, tapehash, None) {
        Ok(buf) => buf,
        Err(StorageError::NotFound) => return Err(MultitapeError::NotFound),
        Err(StorageError::Corrupt) => return Err(MultitapeError::Corrupt),
        Err(e) => return Err(e.into()),
    };
    let md = TapeMetadata::decode(keys, &buf)?;

    // The name inside the record must map back to the file's own name.
    let expected = tape_name_hash(keys, &md.name)?;
    if !verify_bytes(&expected, tapehash) {
        warn!(name = %md.name, "archive metadata does not match its storage name");
        return Err(MultitapeError::Corrupt);
    }
    Ok(md)
}

/// Read and verify metadata by archive name.
pub fn get_by_name(
    reader: &mut StorageReader<'_>,
    keys: &KeySet,
    name: &str,
) -> Result<TapeMetadata> {
    let hash = tape_name_hash(keys, name)?;
    get_by_hash(reader, keys, &hash)
}

/// Delete the metadata file inside the delete transaction.
pub fn delete(chunks: &mut ChunksDeleter<'_>, keys: &KeySet, md: &TapeMetadata) -> Result<()> {
    let hash = tape_name_hash(keys, &md.name)?;
    chunks.storage_mut().delete_file(CLASS_METADATA, &hash)?;
    chunks.extra_stats(md.metadatalen);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tarmac_core::keys::{MASK_HMAC_NAME, MASK_SIGN_PRIV, MASK_SIGN_PUB};

    fn sign_keys() -> KeySet {
        let mut keys = KeySet::new();
        keys.generate(MASK_SIGN_PRIV | MASK_SIGN_PUB | MASK_HMAC_NAME)
            .unwrap();
        keys
    }

    #[test]
    fn encode_decode_round_trip() {
        let keys = sign_keys();
        let mut md = TapeMetadata::new(
            "backup-2024-01-01",
            1_704_067_200,
            vec!["-c".to_owned(), "-f".to_owned(), "backup".to_owned()],
        );
        md.indexhash = [0x5f; 32];
        md.indexlen = 123_456;

        let buf = md.encode(&keys).unwrap();
        let parsed = TapeMetadata::decode(&keys, &buf).unwrap();
        assert_eq!(parsed.name, md.name);
        assert_eq!(parsed.ctime, md.ctime);
        assert_eq!(parsed.args, md.args);
        assert_eq!(parsed.indexhash, md.indexhash);
        assert_eq!(parsed.indexlen, md.indexlen);
        assert_eq!(parsed.metadatalen, buf.len());
    }

    #[test]
    fn any_bit_flip_breaks_the_signature() {
        let keys = sign_keys();
        let mut md = TapeMetadata::new("archive", 1000, vec![]);
        md.indexhash = [9; 32];
        md.indexlen = 40;
        let clean = md.encode(&keys).unwrap();

        for index in [0, 9, clean.len() - 257, clean.len() - 1] {
            let mut buf = clean.clone();
            buf[index] ^= 0x01;
            assert!(
                matches!(
                    TapeMetadata::decode(&keys, &buf),
                    Err(MultitapeError::Corrupt)
                ),
                "byte {} not covered",
                index
            );
        }
    }

    #[test]
    fn truncated_record_is_corrupt() {
        let keys = sign_keys();
        let md = TapeMetadata::new("archive", 1000, vec![]);
        let buf = md.encode(&keys).unwrap();
        assert!(matches!(
            TapeMetadata::decode(&keys, &buf[..buf.len() - 1]),
            Err(MultitapeError::Corrupt)
        ));
        assert!(matches!(
            TapeMetadata::decode(&keys, &[]),
            Err(MultitapeError::Corrupt)
        ));
    }
}
