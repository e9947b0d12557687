//! The on-disk chunk directory and the cache-directory lock.
//!
//! The directory file is a sequence of fixed 44-byte records:
//! 32-byte chunk HMAC, then little-endian 32-bit plaintext length,
//! compressed length, and reference count.  The whole cache directory is
//! guarded by an advisory lock on `lockfile`, held for the lifetime of
//! whichever cookie opened it; refcounts are only safe to mutate under
//! that lock.

use byteorder::{ByteOrder, LittleEndian};
use tracing::{debug, warn};

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use super::{ChunksError, Result};

const RECORD_LEN: usize = 44;

/// One chunk's bookkeeping.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChunkRecord {
    /// Plaintext length.
    pub len: u32,
    /// Compressed length; what storage is actually charged for.
    pub zlen: u32,
    /// Committed references from durable archives.
    pub nrefs: u32,
    /// References taken (or dropped, negative) by the open transaction.
    pub delta: i64,
}

impl ChunkRecord {
    /// References including the open transaction.
    pub fn effective_refs(&self) -> i64 {
        i64::from(self.nrefs) + self.delta
    }
}

/// The advisory lock on a cache directory.
pub struct CacheLock {
    _file: File,
    path: PathBuf,
}

impl CacheLock {
    /// Take the exclusive flock on `<cachedir>/lockfile`; fails without
    /// blocking when another process holds it.
    pub fn lock(cachedir: &Path) -> Result<CacheLock> {
        fs::create_dir_all(cachedir)?;
        let path = cachedir.join("lockfile");
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)?;
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            warn!(path = %path.display(), "cache directory is locked");
            return Err(ChunksError::CacheLocked);
        }
        Ok(CacheLock { _file: file, path })
    }
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        debug!(path = %self.path.display(), "releasing cache lock");
        // The flock is released when the descriptor closes.
    }
}

/// The chunk directory, loaded into memory under the cache lock.
pub struct ChunkDirectory {
    cachedir: PathBuf,
    _lock: CacheLock,
    map: HashMap<[u8; 32], ChunkRecord>,
}

impl ChunkDirectory {
    /// Lock the cache directory and load `directory` (an absent file is
    /// an empty directory).
    pub fn open(cachedir: &Path) -> Result<ChunkDirectory> {
        let lock = CacheLock::lock(cachedir)?;
        let mut dir = ChunkDirectory {
            cachedir: cachedir.to_path_buf(),
            _lock: lock,
            map: HashMap::new(),
        };
        let path = dir.directory_path();
        if path.exists() {
            let mut buf = Vec::new();
            File::open(&path)?.read_to_end(&mut buf)?;
            if buf.len() % RECORD_LEN != 0 {
                return Err(ChunksError::BadDirectory);
            }
            for record in buf.chunks(RECORD_LEN) {
                let mut hash = [0_u8; 32];
                hash.copy_from_slice(&record[..32]);
                dir.map.insert(
                    hash,
                    ChunkRecord {
                        len: LittleEndian::read_u32(&record[32..36]),
                        zlen: LittleEndian::read_u32(&record[36..40]),
                        nrefs: LittleEndian::read_u32(&record[40..44]),
                        delta: 0,
                    },
                );
            }
            debug!(chunks = dir.map.len(), "loaded chunk directory");
        }
        Ok(dir)
    }

    /// Discard all records, as when rebuilding from the server.
    pub fn clear(&mut self) {
        self.map.clear();
    }

    fn directory_path(&self) -> PathBuf {
        self.cachedir.join("directory")
    }

    /// Path of the staged directory written at transaction end and
    /// renamed into place once the server commit succeeds.
    pub fn staged_path(cachedir: &Path) -> PathBuf {
        cachedir.join("directory.tmp")
    }

    pub fn cachedir(&self) -> &Path {
        &self.cachedir
    }

    pub fn get(&self, hash: &[u8; 32]) -> Option<&ChunkRecord> {
        self.map.get(hash)
    }

    /// Insert a fresh record with one in-progress reference.
    pub fn insert_new(&mut self, hash: [u8; 32], len: u32, zlen: u32) {
        self.map.insert(
            hash,
            ChunkRecord {
                len,
                zlen,
                nrefs: 0,
                delta: 1,
            },
        );
    }

    /// Insert a committed record, as when rebuilding during fsck.
    pub fn insert_committed(&mut self, hash: [u8; 32], len: u32, zlen: u32, nrefs: u32) {
        let record = self.map.entry(hash).or_insert(ChunkRecord {
            len,
            zlen,
            nrefs: 0,
            delta: 0,
        });
        record.nrefs += nrefs;
    }

    /// Take one in-progress reference; false if the chunk is unknown or
    /// has no effective references left.
    pub fn reference(&mut self, hash: &[u8; 32]) -> bool {
        match self.map.get_mut(hash) {
            Some(record) if record.effective_refs() > 0 => {
                record.delta += 1;
                true
            }
            _ => false,
        }
    }

    /// Drop one reference; true when the chunk just reached zero and its
    /// stored file should be deleted.
    pub fn release(&mut self, hash: &[u8; 32]) -> Result<bool> {
        let record = self.map.get_mut(hash).ok_or(ChunksError::NotPresent)?;
        if record.effective_refs() <= 0 {
            return Err(ChunksError::NotPresent);
        }
        record.delta -= 1;
        Ok(record.effective_refs() == 0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&[u8; 32], &ChunkRecord)> {
        self.map.iter()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Fold in-progress references into the durable counts and write the
    /// result to the staged file.  The caller renames it into place after
    /// the server commit succeeds.
    pub fn save_staged(&mut self) -> Result<()> {
        let mut buf = Vec::with_capacity(self.map.len() * RECORD_LEN);
        let mut record_buf = [0_u8; RECORD_LEN];
        for (hash, record) in &mut self.map {
            let effective = record.effective_refs();
            if effective < 0 || effective > i64::from(u32::MAX) {
                return Err(ChunksError::BadDirectory);
            }
            record.nrefs = effective as u32;
            record.delta = 0;
            if record.nrefs == 0 {
                continue;
            }
            record_buf[..32].copy_from_slice(hash);
            LittleEndian::write_u32(&mut record_buf[32..36], record.len);
            LittleEndian::write_u32(&mut record_buf[36..40], record.zlen);
            LittleEndian::write_u32(&mut record_buf[40..44], record.nrefs);
            buf.extend_from_slice(&record_buf);
        }
        self.map.retain(|_, record| record.nrefs > 0);

        let staged = ChunkDirectory::staged_path(&self.cachedir);
        let mut file = File::create(&staged)?;
        file.write_all(&buf)?;
        file.sync_all()?;
        debug!(chunks = self.map.len(), "staged chunk directory");
        Ok(())
    }

    /// Write the directory in place immediately (fsck rebuilds bypass the
    /// staging step since they reflect authoritative server state).
    pub fn save_direct(&mut self) -> Result<()> {
        self.save_staged()?;
        fs::rename(
            ChunkDirectory::staged_path(&self.cachedir),
            self.directory_path(),
        )?;
        Ok(())
    }
}

/// Promote the staged directory, if any; called once the server has
/// durably committed the transaction that staged it.
pub fn commit_staged(cachedir: &Path) -> std::io::Result<()> {
    let staged = ChunkDirectory::staged_path(cachedir);
    if staged.exists() {
        fs::rename(staged, cachedir.join("directory"))?;
    }
    Ok(())
}
