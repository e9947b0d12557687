//! Enumerating every chunk an archive references.
//!
//! Delete and fsck walk the three metaindex sections; the outer chunk
//! headers (the chunks holding the streams themselves) are visited so
//! their reference counts can be maintained, and each chunk of the C
//! stream is additionally fetched and unpacked, since its contents are
//! the chunk headers of the actual entry data.

use tarmac_core::keys::KeySet;

use crate::chunks::ChunksReader;

use super::metadata::TapeMetadata;
use super::{metaindex, ChunkHeader, MultitapeError, Result, CHUNKHEADER_LEN, MAXCHUNK};

fn headers(index: &[u8]) -> impl Iterator<Item = ChunkHeader> + '_ {
    index
        .chunks_exact(CHUNKHEADER_LEN)
        .map(ChunkHeader::decode)
}

/// Call `func` on every chunk header involved in the archive described by
/// `md`.
pub fn iterate_tape(
    chunks: &mut ChunksReader<'_>,
    keys: &KeySet,
    md: &TapeMetadata,
    func: &mut dyn FnMut(&ChunkHeader) -> Result<()>,
) -> Result<()> {
    let tmi = metaindex::get(chunks.storage_mut(), keys, md)?;

    for ch in headers(&tmi.hindex) {
        func(&ch)?;
    }

    // Chunk headers of entry data may straddle C-stream chunk
    // boundaries; carry the partial record across.
    let mut carry: Vec<u8> = Vec::new();
    for ch in headers(&tmi.cindex) {
        func(&ch)?;
        if ch.len > MAXCHUNK {
            return Err(MultitapeError::Corrupt);
        }
        chunks.cache(&ch.hash);
        let data = chunks.read_chunk(&ch.hash, ch.len, ch.zlen)?;
        carry.extend_from_slice(&data);

        let consumed = (carry.len() / CHUNKHEADER_LEN) * CHUNKHEADER_LEN;
        for inner in carry[..consumed].chunks_exact(CHUNKHEADER_LEN) {
            func(&ChunkHeader::decode(inner))?;
        }
        carry.drain(..consumed);
    }
    if !carry.is_empty() {
        return Err(MultitapeError::Corrupt);
    }

    for ch in headers(&tmi.tindex) {
        func(&ch)?;
    }
    Ok(())
}
