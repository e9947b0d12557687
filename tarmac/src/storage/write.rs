//! The transactional write cookie.

use tracing::{debug, trace};

use tarmac_core::crypto::entropy;
use tarmac_core::crypto::file::FileCrypto;
use tarmac_core::keys::KeySet;

use crate::netpacket::packets::{Request, Response};
use crate::netpacket::{Dialer, PacketConn};

use super::transaction::{self, TxnType};
use super::{Result, StorageError, MAXFILESIZE};

/// Pending write bytes per connection before new writes block.
const PENDING_QUOTA: usize = 5 * 1024 * 1024;

/// Connections used when aggressive networking is on.
const AGGRESSIVE_CONNS: usize = 8;

/// Byte budgets; when exceeded, the archive driver is asked to stop or
/// checkpoint at the next safe point.
#[derive(Default, Clone)]
pub struct WriteLimits {
    /// Spread writes over several connections.
    pub aggressive: bool,
    /// Stop cleanly once this many bytes have been sent.
    pub max_bytes_out: Option<u64>,
    /// Checkpoint every time another multiple of this many bytes has been
    /// sent.
    pub checkpoint_bytes: Option<u64>,
}

/// What the byte-budget watchdog is asking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopRequest {
    /// The output budget is exhausted; truncate and commit.
    Budget,
    /// A checkpoint is due.
    Checkpoint,
}

/// Write cookie for one transaction.
pub struct StorageWriter<'k> {
    keys: &'k KeySet,
    machinenum: u64,
    conns: Vec<PacketConn>,
    next_conn: usize,
    crypto: FileCrypto,
    seqnum: [u8; 32],
    dryrun: bool,
    limits: WriteLimits,
    next_checkpoint: u64,
    /// Bytes handed to the storage layer, dry-run bytes included.
    total_queued: u64,
}

impl<'k> StorageWriter<'k> {
    /// Start a write transaction rooted at `lastseq` and return the
    /// cookie.  A dry run skips the network entirely.
    pub fn start(
        dialer: Box<dyn Dialer>,
        keys: &'k KeySet,
        machinenum: u64,
        lastseq: &[u8; 32],
        dryrun: bool,
        limits: WriteLimits,
    ) -> Result<StorageWriter<'k>> {
        let nconns = if limits.aggressive {
            AGGRESSIVE_CONNS
        } else {
            1
        };
        let mut conns: Vec<PacketConn> = Vec::with_capacity(nconns);
        // All connections share the dialer through a trivial fan-out.
        let dialer = std::rc::Rc::new(dialer);
        for _ in 0..nconns {
            conns.push(PacketConn::open(Box::new(SharedDialer {
                inner: std::rc::Rc::clone(&dialer),
            })));
        }

        let seqnum = if dryrun {
            entropy::random()?
        } else {
            transaction::start(&mut conns[0], keys, machinenum, TxnType::Write, lastseq)?
        };

        let next_checkpoint = limits.checkpoint_bytes.unwrap_or(u64::MAX);
        Ok(StorageWriter {
            keys,
            machinenum,
            conns,
            next_conn: 0,
            crypto: FileCrypto::new(),
            seqnum,
            dryrun,
            limits,
            next_checkpoint,
            total_queued: 0,
        })
    }

    /// The transaction nonce.
    pub fn seqnum(&self) -> [u8; 32] {
        self.seqnum
    }

    /// Consume one response on connection `i`, folding its status into the
    /// transaction state.
    fn drain_one(&mut self, i: usize) -> Result<()> {
        match self.conns[i].recv(self.keys)? {
            // Already-present files are success: the put is idempotent.
            Response::File { status: 0 } | Response::File { status: 1 } => Ok(()),
            Response::File { status: 2 } => Err(StorageError::StaleNonce),
            _ => Err(StorageError::Protocol),
        }
    }

    /// Wrap `buf` in the file envelope and queue it for storage under
    /// (class, name).
    pub fn write_file(&mut self, class: u8, name: &[u8; 32], buf: &[u8]) -> Result<()> {
        let filebuf = self.crypto.encrypt(self.keys, buf)?;
        if filebuf.len() > MAXFILESIZE {
            return Err(StorageError::TooLarge);
        }
        self.total_queued += filebuf.len() as u64;
        if self.dryrun {
            return Ok(());
        }

        let i = self.next_conn;
        self.next_conn = (self.next_conn + 1) % self.conns.len();

        // Block (by consuming responses) while over the pending quota.
        while self.conns[i].pending_bytes() > PENDING_QUOTA {
            self.drain_one(i)?;
        }

        trace!(class, len = filebuf.len(), "queueing file write");
        self.conns[i].send(
            self.keys,
            Request::WriteFile {
                machinenum: self.machinenum,
                class,
                name: *name,
                nonce: self.seqnum,
                data: filebuf,
            },
        )?;
        Ok(())
    }

    /// Does the named file exist?  Runs on a drained connection so the
    /// response can be awaited synchronously.
    pub fn fexist(&mut self, class: u8, name: &[u8; 32]) -> Result<bool> {
        if self.dryrun {
            return Ok(false);
        }
        while self.conns[0].npending() > 0 {
            self.drain_one(0)?;
        }
        let resp = self.conns[0].call(
            self.keys,
            Request::WriteFexist {
                machinenum: self.machinenum,
                class,
                name: *name,
                nonce: self.seqnum,
            },
        )?;
        match resp {
            Response::File { status: 0 } => Ok(false),
            Response::File { status: 1 } => Ok(true),
            Response::File { status: 2 } => Err(StorageError::StaleNonce),
            _ => Err(StorageError::Protocol),
        }
    }

    /// Wait until every queued write has been acknowledged.
    pub fn flush(&mut self) -> Result<()> {
        for i in 0..self.conns.len() {
            while self.conns[i].npending() > 0 {
                self.drain_one(i)?;
            }
        }
        Ok(())
    }

    /// Create a checkpoint covering everything written so far.  Returns
    /// the checkpoint nonce.
    pub fn checkpoint(&mut self) -> Result<[u8; 32]> {
        let ckptnonce: [u8; 32] = entropy::random()?;
        if self.dryrun {
            return Ok(ckptnonce);
        }
        self.flush()?;
        transaction::checkpoint(
            &mut self.conns[0],
            self.keys,
            self.machinenum,
            &self.seqnum,
            TxnType::Write.whichkey(),
            &ckptnonce,
        )?;
        debug!("checkpoint created");
        Ok(ckptnonce)
    }

    /// Check the byte budgets; called by the archive driver between
    /// chunks.
    pub fn poll_stop(&mut self) -> Option<StopRequest> {
        let total = self.bytes_out();
        if let Some(max) = self.limits.max_bytes_out {
            if total >= max {
                return Some(StopRequest::Budget);
            }
        }
        if total >= self.next_checkpoint {
            self.next_checkpoint = self.next_checkpoint.saturating_add(
                self.limits
                    .checkpoint_bytes
                    .expect("next_checkpoint finite only with an interval"),
            );
            return Some(StopRequest::Checkpoint);
        }
        None
    }

    /// Bytes queued or sent so far, dead connections included.
    pub fn bytes_out(&self) -> u64 {
        if self.dryrun {
            return self.total_queued;
        }
        self.conns
            .iter()
            .map(|conn| conn.stats().1 + conn.pending_bytes() as u64)
            .sum()
    }

    /// Flush and release the cookie.  Committing is a separate step.
    pub fn end(mut self) -> Result<()> {
        self.flush()
    }
}

/// Fans one dialer out to several connections.
struct SharedDialer {
    inner: std::rc::Rc<Box<dyn Dialer>>,
}

impl Dialer for SharedDialer {
    fn dial(&self) -> crate::netpacket::Result<Box<dyn crate::netpacket::PacketChannel>> {
        self.inner.dial()
    }
}
