//! Writing archives.
//!
//! Four chunkifiers run at once: one over the current entry's body, and
//! one over each of the H, C, and T streams.  Entry bodies are split into
//! chunks; chunks below the trailer threshold go to the T stream, the
//! rest are stored and their headers fed through the C stream.  Entry
//! headers are buffered until the entry ends and then written, prefixed
//! by the fixed entry header, into the H stream.

use tracing::{debug, info};

use std::path::{Path, PathBuf};
use std::rc::Rc;

use tarmac_chunker::{ChunkerParams, Chunkifier};
use tarmac_core::keys::{KeyId, KeySet};

use crate::chunks::{ChunkStats, ChunksWriter};
use crate::netpacket::Dialer;
use crate::storage::{StopRequest, StorageWriter, WriteLimits};

use super::metadata::{self, TapeMetadata};
use super::metaindex::{self, TapeMetaindex};
use super::state;
use super::{ChunkHeader, EntryHeader, MultitapeError, Result, MAXCHUNK, MEANCHUNK, MINCHUNK};

/// Where bytes written to the tape currently land.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Bytes accumulate in the pending entry header.
    Header,
    /// Bytes feed the entry body chunkifier.
    Data,
    /// Between entries.
    EndOfEntry,
    /// The closing record is being written; no entry may follow.
    EndOfArchive,
}

/// One archive stream and the chunkifier slicing it.
struct Stream {
    index: Vec<u8>,
    chunker: Chunkifier,
}

enum StreamId {
    H,
    C,
    T,
}

/// Write cookie for one archive.
pub struct TapeWriter<'k> {
    keys: &'k KeySet,
    machinenum: u64,
    cachedir: PathBuf,
    dialer: Rc<dyn Dialer>,
    name: String,
    ctime: u64,
    args: Vec<String>,
    dryrun: bool,

    chunks: ChunksWriter<'k>,
    seqnum: [u8; 32],

    h: Stream,
    c: Stream,
    t: Stream,
    c_file: Chunkifier,
    mode: Mode,
    truncated: bool,

    hbuf: Vec<u8>,
    clen: u64,
    tlen: u32,
}

impl<'k> TapeWriter<'k> {
    /// Create an archive with the given name.
    ///
    /// Completes any interrupted commit, starts a write transaction,
    /// takes the cache lock, and refuses names (or their `.part`
    /// variants) already present.
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        dialer: Rc<dyn Dialer>,
        keys: &'k KeySet,
        machinenum: u64,
        cachedir: &Path,
        name: &str,
        args: Vec<String>,
        dryrun: bool,
        limits: WriteLimits,
    ) -> Result<TapeWriter<'k>> {
        if !dryrun {
            let factory = {
                let dialer = Rc::clone(&dialer);
                move || Box::new(Rc::clone(&dialer)) as Box<dyn Dialer>
            };
            state::cleanstate(&factory, keys, cachedir, machinenum, 0)?;
        }
        let lastseq = state::sequence(cachedir)?;

        let storage = StorageWriter::start(
            Box::new(Rc::clone(&dialer)),
            keys,
            machinenum,
            &lastseq,
            dryrun,
            limits,
        )?;
        let seqnum = storage.seqnum();
        let mut chunks = ChunksWriter::start(cachedir, storage, MAXCHUNK as usize)?;

        if !dryrun {
            if metadata::is_present(&mut chunks, keys, name)? {
                return Err(MultitapeError::NameInUse);
            }
            if metadata::is_present(&mut chunks, keys, &format!("{}.part", name))? {
                return Err(MultitapeError::NameInUse);
            }
        }

        let params = ChunkerParams::derive(&keys.hmac(KeyId::HmacCparams)?.0, MEANCHUNK)?;
        let stream = |params: &ChunkerParams| -> Result<Stream> {
            Ok(Stream {
                index: Vec::new(),
                chunker: Chunkifier::new(params, MAXCHUNK)?,
            })
        };

        info!(name, "creating archive");
        Ok(TapeWriter {
            keys,
            machinenum,
            cachedir: cachedir.to_path_buf(),
            dialer,
            name: name.to_owned(),
            ctime: chrono::Utc::now().timestamp().max(0) as u64,
            args,
            dryrun,
            chunks,
            seqnum,
            h: stream(&params)?,
            c: stream(&params)?,
            t: stream(&params)?,
            c_file: Chunkifier::new(&params, MAXCHUNK)?,
            mode: Mode::EndOfEntry,
            truncated: false,
            hbuf: Vec::new(),
            clen: 0,
            tlen: 0,
        })
    }

    /// Store a chunk and return its header.
    fn store_chunk(&mut self, buf: &[u8]) -> Result<ChunkHeader> {
        let hash = self.keys.hash_data(KeyId::HmacChunk, buf)?;
        let zlen = self.chunks.write_chunk(&hash, buf)?;
        Ok(ChunkHeader {
            hash,
            len: buf.len() as u32,
            zlen,
        })
    }

    /// Store a chunk of one of the H/C/T streams and record it in that
    /// stream's index.
    fn handle_stream_chunk(&mut self, which: StreamId, buf: &[u8]) -> Result<()> {
        let ch = self.store_chunk(buf)?;
        let stream = match which {
            StreamId::H => &mut self.h,
            StreamId::C => &mut self.c,
            StreamId::T => &mut self.t,
        };
        stream.index.extend_from_slice(&ch.encode());
        Ok(())
    }

    /// Route one completed entry-body chunk: short tails go to the
    /// trailer stream, the rest are stored and indexed through C.
    fn handle_file_chunk(&mut self, buf: &[u8]) -> Result<()> {
        if buf.len() < MINCHUNK {
            // There can't be a trailer yet; an entry has exactly one.
            if self.tlen != 0 {
                return Err(MultitapeError::BadSequence);
            }
            let mut out = Vec::new();
            self.t.chunker.write(buf, &mut out);
            for chunk in &out {
                self.handle_stream_chunk(StreamId::T, chunk)?;
            }
            self.tlen = buf.len() as u32;
        } else {
            let ch = self.store_chunk(buf)?;
            let mut out = Vec::new();
            self.c.chunker.write(&ch.encode(), &mut out);
            for chunk in &out {
                self.handle_stream_chunk(StreamId::C, chunk)?;
            }
            self.clen += u64::from(ch.len);
        }
        Ok(())
    }

    /// An entry is ending: write its fixed header and buffered header
    /// bytes into the H stream and reset the per-entry counters.
    fn end_entry(&mut self) -> Result<()> {
        let eh = EntryHeader {
            hlen: self.hbuf.len() as u32,
            clen: self.clen,
            tlen: self.tlen,
        };
        let hbuf = std::mem::take(&mut self.hbuf);

        let mut out = Vec::new();
        self.h.chunker.write(&eh.encode(), &mut out);
        self.h.chunker.write(&hbuf, &mut out);
        for chunk in &out {
            self.handle_stream_chunk(StreamId::H, chunk)?;
        }

        self.clen = 0;
        self.tlen = 0;
        Ok(())
    }

    /// Write bytes to the tape.  Returns how many were accepted: all of
    /// them, or zero once the archive has been truncated.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if self.truncated {
            return Ok(0);
        }
        match self.mode {
            Mode::Data => {
                let mut out = Vec::new();
                self.c_file.write(buf, &mut out);
                for chunk in &out {
                    self.handle_file_chunk(chunk)?;
                }
            }
            Mode::EndOfEntry | Mode::EndOfArchive => {
                // Closing-record bytes; no entries may follow them.
                self.mode = Mode::EndOfArchive;
                self.hbuf.extend_from_slice(buf);
            }
            Mode::Header => {
                self.hbuf.extend_from_slice(buf);
            }
        }
        Ok(buf.len())
    }

    /// Switch between header and data (or end the entry).
    pub fn set_mode(&mut self, mode: Mode) -> Result<()> {
        if mode == self.mode {
            return Ok(());
        }
        if self.mode == Mode::Data {
            let mut out = Vec::new();
            self.c_file.flush(&mut out);
            for chunk in &out {
                self.handle_file_chunk(chunk)?;
            }
        }
        if self.mode == Mode::EndOfArchive {
            return Err(MultitapeError::BadSequence);
        }
        if mode == Mode::EndOfEntry {
            self.end_entry()?;
        }
        self.mode = mode;
        Ok(())
    }

    /// If the chunk is already stored, how long is it?
    pub fn is_chunk_present(&self, ch: &ChunkHeader) -> u32 {
        if self.chunks.is_present(&ch.hash) {
            ch.len
        } else {
            0
        }
    }

    /// Add a copy of a previously stored chunk to the current entry
    /// without replaying its plaintext.  Returns the chunk length, or 0
    /// when the chunk is not stored and the caller must fall back to
    /// [`write`](TapeWriter::write).
    pub fn write_chunk(&mut self, ch: &ChunkHeader) -> Result<u32> {
        if self.mode != Mode::Data || self.c_file.pending() != 0 {
            return Err(MultitapeError::BadSequence);
        }
        if !self.chunks.chunk_ref(&ch.hash)? {
            return Ok(0);
        }
        let mut out = Vec::new();
        self.c.chunker.write(&ch.encode(), &mut out);
        for chunk in &out {
            self.handle_stream_chunk(StreamId::C, chunk)?;
        }
        self.clen += u64::from(ch.len);
        Ok(ch.len)
    }

    /// Record that the archive is truncated at the current position; its
    /// name will carry a `.part` suffix and further writes are refused.
    pub fn truncate(&mut self) {
        self.truncated = true;
    }

    /// Ask the storage layer whether a byte budget wants attention.
    pub fn poll_stop(&mut self) -> Option<StopRequest> {
        self.chunks.storage_mut().poll_stop()
    }

    /// Create a mid-archive checkpoint, letting a crashed run commit what
    /// has been stored so far.
    pub fn checkpoint(&mut self) -> Result<()> {
        self.chunks.storage_mut().checkpoint()?;
        Ok(())
    }

    /// Finish the archive: flush every stream, store the metaindex and
    /// signed metadata, flush storage, and commit the transaction.
    pub fn close(mut self) -> Result<ChunkStats> {
        if self.truncated && (self.mode == Mode::Header || self.mode == Mode::Data) {
            // End the interrupted entry so the streams are consistent.
            self.set_mode(Mode::EndOfEntry)?;
        }
        match self.mode {
            Mode::EndOfArchive => self.end_entry()?,
            Mode::EndOfEntry => {}
            _ => return Err(MultitapeError::BadSequence),
        }

        // Flush the body chunkifier first (it can feed C and T), then the
        // streams themselves.
        let mut out = Vec::new();
        self.c_file.flush(&mut out);
        for chunk in &std::mem::take(&mut out) {
            self.handle_file_chunk(chunk)?;
        }
        self.t.chunker.flush(&mut out);
        for chunk in &std::mem::take(&mut out) {
            self.handle_stream_chunk(StreamId::T, chunk)?;
        }
        self.c.chunker.flush(&mut out);
        for chunk in &std::mem::take(&mut out) {
            self.handle_stream_chunk(StreamId::C, chunk)?;
        }
        self.h.chunker.flush(&mut out);
        for chunk in &std::mem::take(&mut out) {
            self.handle_stream_chunk(StreamId::H, chunk)?;
        }

        let name = if self.truncated {
            format!("{}.part", self.name)
        } else {
            self.name.clone()
        };
        let mut md = TapeMetadata::new(&name, self.ctime, std::mem::take(&mut self.args));
        let tmi = TapeMetaindex {
            hindex: std::mem::take(&mut self.h.index),
            cindex: std::mem::take(&mut self.c.index),
            tindex: std::mem::take(&mut self.t.index),
        };

        // The metaindex must be stored first: the metadata signs its hash
        // and length.
        metaindex::put(&mut self.chunks, self.keys, &tmi, &mut md)?;
        metadata::put(&mut self.chunks, self.keys, &md)?;

        self.chunks.storage_mut().flush()?;
        let stats = self.chunks.end()?;

        if self.dryrun {
            // A dry run must leave the durable directory untouched.
            let staged = crate::chunks::directory::ChunkDirectory::staged_path(&self.cachedir);
            if staged.exists() {
                std::fs::remove_file(staged)?;
            }
        } else {
            state::write_marker(&self.cachedir, &self.seqnum, 0)?;
            state::commit(
                Box::new(Rc::clone(&self.dialer)),
                self.keys,
                &self.cachedir,
                self.machinenum,
                &self.seqnum,
                0,
            )?;
        }
        debug!(name = %name, "archive closed");
        Ok(stats)
    }

    /// Abandon the archive; nothing is committed.
    pub fn cancel(self) {
        info!(name = %self.name, "archive cancelled");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netpacket::loopback::LoopbackServer;
    use tarmac_core::keys::{MASK_AUTH_DELETE, MASK_AUTH_GET, MASK_READ, MASK_WRITE};

    fn test_keys() -> KeySet {
        let mut keys = KeySet::new();
        keys.generate(MASK_WRITE | MASK_READ | MASK_AUTH_GET | MASK_AUTH_DELETE)
            .unwrap();
        keys
    }

    fn open_tape<'k>(
        server: &LoopbackServer,
        keys: &'k KeySet,
        cachedir: &Path,
        name: &str,
    ) -> TapeWriter<'k> {
        TapeWriter::open(
            Rc::new(server.clone()),
            keys,
            10,
            cachedir,
            name,
            vec!["-c".to_owned()],
            false,
            WriteLimits::default(),
        )
        .unwrap()
    }

    #[test]
    fn name_conflicts_rejected() {
        let keys = test_keys();
        let server = LoopbackServer::new(10, &keys);
        let cachedir = tempfile::tempdir().unwrap();

        let mut tape = open_tape(&server, &keys, cachedir.path(), "backup");
        tape.set_mode(Mode::Header).unwrap();
        tape.write(b"header").unwrap();
        tape.set_mode(Mode::Data).unwrap();
        tape.write(&[0_u8; 100_000]).unwrap();
        tape.set_mode(Mode::EndOfEntry).unwrap();
        tape.close().unwrap();

        assert!(matches!(
            TapeWriter::open(
                Rc::new(server.clone()),
                &keys,
                10,
                cachedir.path(),
                "backup",
                vec![],
                false,
                WriteLimits::default(),
            ),
            Err(MultitapeError::NameInUse)
        ));
    }

    #[test]
    fn two_trailers_in_one_entry_is_an_error() {
        let keys = test_keys();
        let server = LoopbackServer::new(10, &keys);
        let cachedir = tempfile::tempdir().unwrap();

        let mut tape = open_tape(&server, &keys, cachedir.path(), "tiny");
        tape.set_mode(Mode::Header).unwrap();
        tape.set_mode(Mode::Data).unwrap();
        // Two sub-threshold bodies without an entry boundary.
        tape.write(&[1_u8; 100]).unwrap();
        let mut out = Vec::new();
        tape.c_file.flush(&mut out);
        for chunk in &out {
            tape.handle_file_chunk(chunk).unwrap();
        }
        tape.write(&[2_u8; 100]).unwrap();
        let mut out = Vec::new();
        tape.c_file.flush(&mut out);
        let err = out
            .iter()
            .map(|chunk| tape.handle_file_chunk(chunk))
            .find(std::result::Result::is_err);
        assert!(err.is_some());
    }

    #[test]
    fn entries_after_archive_trailer_are_rejected() {
        let keys = test_keys();
        let server = LoopbackServer::new(10, &keys);
        let cachedir = tempfile::tempdir().unwrap();

        let mut tape = open_tape(&server, &keys, cachedir.path(), "closing");
        // Writing in EndOfEntry mode starts the closing record.
        tape.write(&[0_u8; 512]).unwrap();
        assert!(matches!(
            tape.set_mode(Mode::Data),
            Err(MultitapeError::BadSequence)
        ));
    }

    #[test]
    fn truncate_blocks_writes_and_renames() {
        let keys = test_keys();
        let server = LoopbackServer::new(10, &keys);
        let cachedir = tempfile::tempdir().unwrap();

        let mut tape = open_tape(&server, &keys, cachedir.path(), "partial");
        tape.set_mode(Mode::Header).unwrap();
        tape.write(b"hdr").unwrap();
        tape.set_mode(Mode::Data).unwrap();
        tape.write(&[0_u8; 50_000]).unwrap();
        tape.truncate();
        assert_eq!(tape.write(&[0_u8; 100]).unwrap(), 0);
        tape.close().unwrap();

        let names = crate::multitape::list_tapes(Box::new(server), &keys, 10).unwrap();
        assert_eq!(names.len(), 1);
        assert_eq!(names[0].name, "partial.part");
    }
}
