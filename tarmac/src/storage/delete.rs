//! The transactional delete cookie.

use tracing::trace;

use tarmac_core::keys::KeySet;

use crate::netpacket::packets::{Request, Response};
use crate::netpacket::{Dialer, PacketConn};

use super::transaction::{self, TxnType};
use super::{Result, StorageError};

/// Cap on in-flight delete operations...
const MAX_PENDING: usize = 1024;
/// ...drained down to this level before queueing more.
const PENDING_LOW_WATER: usize = 512;

/// Delete cookie for one transaction.
pub struct StorageDeleter<'k> {
    keys: &'k KeySet,
    machinenum: u64,
    conn: PacketConn,
    seqnum: [u8; 32],
    ttype: TxnType,
}

impl<'k> StorageDeleter<'k> {
    /// Start a delete (or fsck) transaction rooted at `lastseq`.
    pub fn start(
        dialer: Box<dyn Dialer>,
        keys: &'k KeySet,
        machinenum: u64,
        lastseq: &[u8; 32],
        ttype: TxnType,
    ) -> Result<StorageDeleter<'k>> {
        let mut conn = PacketConn::open(dialer);
        let seqnum = transaction::start(&mut conn, keys, machinenum, ttype, lastseq)?;
        Ok(StorageDeleter {
            keys,
            machinenum,
            conn,
            seqnum,
            ttype,
        })
    }

    /// The transaction nonce.
    pub fn seqnum(&self) -> [u8; 32] {
        self.seqnum
    }

    /// The key index commits of this transaction must be signed with.
    pub fn whichkey(&self) -> u8 {
        self.ttype.whichkey()
    }

    fn drain_one(&mut self) -> Result<()> {
        match self.conn.recv(self.keys)? {
            // Deleting a file that is already gone is success.
            Response::File { status: 0 } | Response::File { status: 1 } => Ok(()),
            Response::File { status: 2 } => Err(StorageError::StaleNonce),
            _ => Err(StorageError::Protocol),
        }
    }

    /// Queue a delete of the named file.
    pub fn delete_file(&mut self, class: u8, name: &[u8; 32]) -> Result<()> {
        if self.conn.npending() >= MAX_PENDING {
            while self.conn.npending() > PENDING_LOW_WATER {
                self.drain_one()?;
            }
        }
        trace!(class, "queueing file delete");
        self.conn.send(
            self.keys,
            Request::DeleteFile {
                machinenum: self.machinenum,
                class,
                name: *name,
                nonce: self.seqnum,
            },
        )?;
        Ok(())
    }

    /// Wait until every queued delete has been acknowledged.
    pub fn flush(&mut self) -> Result<()> {
        while self.conn.npending() > 0 {
            self.drain_one()?;
        }
        Ok(())
    }

    /// The connection, for directory listings inside this transaction.
    pub fn conn_mut(&mut self) -> &mut PacketConn {
        &mut self.conn
    }

    /// Flush and release the cookie.  Committing is a separate step.
    pub fn end(mut self) -> Result<()> {
        self.flush()
    }
}
