//! Reading archives back into the original byte stream.

use tracing::info;

use std::io::Write;

use tarmac_core::keys::KeySet;

use crate::chunks::ChunksReader;
use crate::netpacket::Dialer;
use crate::storage::StorageReader;

use super::{
    metadata, metaindex, ChunkHeader, EntryHeader, MultitapeError, Result, CHUNKHEADER_LEN,
    ENTRYHEADER_LEN, MAXCHUNK,
};

/// Pulls the bytes of one archive stream, fetching the stream's chunks as
/// listed in its metaindex section.
struct StreamReader<'a> {
    index: &'a [u8],
    pos: usize,
    buf: Vec<u8>,
    bufpos: usize,
}

impl<'a> StreamReader<'a> {
    fn new(index: &'a [u8]) -> StreamReader<'a> {
        StreamReader {
            index,
            pos: 0,
            buf: Vec::new(),
            bufpos: 0,
        }
    }

    /// Load the next stream chunk; false at end of stream.
    fn fill(&mut self, chunks: &mut ChunksReader<'_>) -> Result<bool> {
        if self.pos + CHUNKHEADER_LEN > self.index.len() {
            return Ok(false);
        }
        let ch = ChunkHeader::decode(&self.index[self.pos..self.pos + CHUNKHEADER_LEN]);
        self.pos += CHUNKHEADER_LEN;
        if ch.len > MAXCHUNK {
            return Err(MultitapeError::Corrupt);
        }
        self.buf = chunks.read_chunk(&ch.hash, ch.len, ch.zlen)?;
        self.bufpos = 0;
        Ok(true)
    }

    /// True when the stream has no more bytes.
    fn at_eof(&self) -> bool {
        self.bufpos == self.buf.len() && self.pos + CHUNKHEADER_LEN > self.index.len()
    }

    /// Read exactly `out.len()` bytes; a short stream is corrupt.
    fn read_exact(&mut self, chunks: &mut ChunksReader<'_>, out: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < out.len() {
            if self.bufpos == self.buf.len() && !self.fill(chunks)? {
                return Err(MultitapeError::Corrupt);
            }
            let n = (out.len() - filled).min(self.buf.len() - self.bufpos);
            out[filled..filled + n].copy_from_slice(&self.buf[self.bufpos..self.bufpos + n]);
            self.bufpos += n;
            filled += n;
        }
        Ok(())
    }
}

/// Reconstruct the archive byte stream into `sink`.
///
/// Entries are replayed in order: the opaque entry header from the H
/// stream, the chunked body via the C stream, and the trailer tail from
/// the T stream.  Any integrity failure aborts with a corrupt status.
pub fn extract_tape(
    dialer: Box<dyn Dialer>,
    keys: &KeySet,
    machinenum: u64,
    name: &str,
    sink: &mut dyn Write,
) -> Result<()> {
    let storage = StorageReader::new(dialer, keys, machinenum);
    let mut chunks = ChunksReader::new(keys, storage, MAXCHUNK as usize);

    let md = metadata::get_by_name(chunks.storage_mut(), keys, name)?;
    let tmi = metaindex::get(chunks.storage_mut(), keys, &md)?;
    info!(name, "extracting archive");

    let mut hs = StreamReader::new(&tmi.hindex);
    let mut cs = StreamReader::new(&tmi.cindex);
    let mut ts = StreamReader::new(&tmi.tindex);

    loop {
        // A cleanly ending H stream means no more entries.
        if hs.at_eof() {
            break;
        }
        let mut ehbuf = [0_u8; ENTRYHEADER_LEN];
        hs.read_exact(&mut chunks, &mut ehbuf)?;
        let eh = EntryHeader::decode(&ehbuf);

        let mut header = vec![0_u8; eh.hlen as usize];
        hs.read_exact(&mut chunks, &mut header)?;
        sink.write_all(&header).map_err(MultitapeError::Sink)?;

        let mut remaining = eh.clen;
        while remaining > 0 {
            let mut chbuf = [0_u8; CHUNKHEADER_LEN];
            cs.read_exact(&mut chunks, &mut chbuf)?;
            let ch = ChunkHeader::decode(&chbuf);
            if u64::from(ch.len) > remaining || ch.len == 0 {
                return Err(MultitapeError::Corrupt);
            }
            let data = chunks.read_chunk(&ch.hash, ch.len, ch.zlen)?;
            sink.write_all(&data).map_err(MultitapeError::Sink)?;
            remaining -= u64::from(ch.len);
        }

        let mut trailer = vec![0_u8; eh.tlen as usize];
        ts.read_exact(&mut chunks, &mut trailer)?;
        sink.write_all(&trailer).map_err(MultitapeError::Sink)?;
    }

    Ok(())
}
