//! Transaction lifecycle: start (with cancellation of any predecessor),
//! commit, checkpoint, and checkpoint recovery.

use tracing::{debug, warn};

use std::thread;
use std::time::Duration;

use tarmac_core::crypto::entropy;
use tarmac_core::crypto::hash::sha256_2;
use tarmac_core::keys::KeySet;

use super::{Result, StorageError};
use crate::netpacket::packets::{Request, Response};
use crate::netpacket::PacketConn;

/// How long to wait when the server answers "try again later".
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Transaction flavours; the numeric value travels in the START packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TxnType {
    Write = 0,
    Delete = 1,
    Fsck = 2,
}

impl TxnType {
    /// The key index used when signing commits of this transaction.
    pub fn whichkey(self) -> u8 {
        match self {
            TxnType::Write => 0,
            TxnType::Delete | TxnType::Fsck => 1,
        }
    }
}

fn getnonce(conn: &mut PacketConn, keys: &KeySet, machinenum: u64) -> Result<[u8; 32]> {
    match conn.call(keys, Request::TransactionGetnonce { machinenum })? {
        Response::Nonce(snonce) => Ok(snonce),
        _ => Err(StorageError::Protocol),
    }
}

/// Cancel any pending transaction.  The server may ask us to come back
/// later while it unwinds; retry at one-second intervals.
fn cancel_pending(
    conn: &mut PacketConn,
    keys: &KeySet,
    machinenum: u64,
    ttype: TxnType,
    lastseq: &[u8; 32],
) -> Result<()> {
    // Fsck transactions cancel regardless of the recorded sequence.
    let state = if ttype == TxnType::Fsck {
        [0_u8; 32]
    } else {
        *lastseq
    };
    loop {
        let snonce = getnonce(conn, keys, machinenum)?;
        let cnonce: [u8; 32] = entropy::random()?;
        let resp = conn.call(
            keys,
            Request::TransactionCancel {
                machinenum,
                whichkey: ttype as u8,
                snonce,
                cnonce,
                state,
            },
        )?;
        match resp {
            Response::Status(0) => return Ok(()),
            Response::Status(1) => {
                debug!("server busy cancelling; retrying");
                thread::sleep(RETRY_DELAY);
            }
            _ => return Err(StorageError::Protocol),
        }
    }
}

/// Begin a transaction: cancel any predecessor, combine a fresh server
/// nonce with local randomness, and send the signed START.  Returns the
/// transaction nonce.
pub fn start(
    conn: &mut PacketConn,
    keys: &KeySet,
    machinenum: u64,
    ttype: TxnType,
    lastseq: &[u8; 32],
) -> Result<[u8; 32]> {
    cancel_pending(conn, keys, machinenum, ttype, lastseq)?;

    let snonce = getnonce(conn, keys, machinenum)?;
    let cnonce: [u8; 32] = entropy::random()?;
    let seqnum = sha256_2(&snonce, &cnonce);

    let resp = conn.call(
        keys,
        Request::TransactionStart {
            machinenum,
            ttype: ttype as u8,
            snonce,
            cnonce,
            state: *lastseq,
        },
    )?;
    match resp {
        Response::Status(0) => {
            debug!(ttype = ?ttype, "transaction started");
            Ok(seqnum)
        }
        Response::Status(1) => Err(StorageError::SequenceMismatch),
        _ => Err(StorageError::Protocol),
    }
}

/// Commit the transaction identified by `seqnum`, retrying while the
/// server reports the commit is still in progress.
pub fn commit(
    conn: &mut PacketConn,
    keys: &KeySet,
    machinenum: u64,
    seqnum: &[u8; 32],
    whichkey: u8,
) -> Result<()> {
    loop {
        let resp = conn.call(
            keys,
            Request::TransactionTryCommit {
                machinenum,
                whichkey,
                nonce: *seqnum,
            },
        )?;
        match resp {
            Response::Status(0) => {
                debug!("transaction committed");
                return Ok(());
            }
            Response::Status(1) => {
                debug!("commit in progress; retrying");
                thread::sleep(RETRY_DELAY);
            }
            _ => return Err(StorageError::Protocol),
        }
    }
}

/// Create a checkpoint inside a write transaction, so a crashed client
/// can later commit up to this point.
pub fn checkpoint(
    conn: &mut PacketConn,
    keys: &KeySet,
    machinenum: u64,
    seqnum: &[u8; 32],
    whichkey: u8,
    ckptnonce: &[u8; 32],
) -> Result<()> {
    let resp = conn.call(
        keys,
        Request::TransactionCheckpoint {
            machinenum,
            whichkey,
            ckptnonce: *ckptnonce,
            nonce: *seqnum,
        },
    )?;
    match resp {
        Response::Checkpoint { status: 0, nonce } if nonce == *ckptnonce => Ok(()),
        Response::Checkpoint { status: 1, .. } => Err(StorageError::StaleNonce),
        _ => Err(StorageError::Protocol),
    }
}

/// If a checkpointed transaction is pending on the server, commit it.
/// Returns the committed nonce, or `None` when there was nothing to do.
pub fn commit_from_checkpoint(
    conn: &mut PacketConn,
    keys: &KeySet,
    machinenum: u64,
    whichkey: u8,
) -> Result<Option<[u8; 32]>> {
    let probe: [u8; 32] = entropy::random()?;
    let resp = conn.call(
        keys,
        Request::TransactionIsCheckpointed {
            machinenum,
            whichkey,
            nonce: probe,
        },
    )?;
    match resp {
        Response::Checkpoint { status: 0, .. } => Ok(None),
        Response::Checkpoint { status: 1, nonce } => {
            warn!("completing interrupted checkpointed transaction");
            commit(conn, keys, machinenum, &nonce, whichkey)?;
            Ok(Some(nonce))
        }
        _ => Err(StorageError::Protocol),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netpacket::loopback::LoopbackServer;
    use tarmac_core::keys::{MASK_AUTH_DELETE, MASK_AUTH_GET, MASK_AUTH_PUT};

    fn auth_keys() -> KeySet {
        let mut keys = KeySet::new();
        keys.generate(MASK_AUTH_PUT | MASK_AUTH_GET | MASK_AUTH_DELETE)
            .unwrap();
        keys
    }

    #[test]
    fn start_then_commit() {
        let keys = auth_keys();
        let server = LoopbackServer::new(3, &keys);
        let mut conn = PacketConn::open(Box::new(server));

        let seqnum = start(&mut conn, &keys, 3, TxnType::Write, &[0; 32]).unwrap();
        commit(&mut conn, &keys, 3, &seqnum, 0).unwrap();
    }

    #[test]
    fn commit_retries_on_later() {
        let keys = auth_keys();
        let server = LoopbackServer::new(3, &keys);
        server.inject_commit_later(1);
        let mut conn = PacketConn::open(Box::new(server));

        let seqnum = start(&mut conn, &keys, 3, TxnType::Write, &[0; 32]).unwrap();
        commit(&mut conn, &keys, 3, &seqnum, 0).unwrap();
    }

    #[test]
    fn stale_sequence_rejected() {
        let keys = auth_keys();
        let server = LoopbackServer::new(3, &keys);
        let mut conn = PacketConn::open(Box::new(server));

        assert!(matches!(
            start(&mut conn, &keys, 3, TxnType::Write, &[0x55; 32]),
            Err(StorageError::SequenceMismatch)
        ));
    }

    #[test]
    fn checkpoint_and_recover() {
        let keys = auth_keys();
        let server = LoopbackServer::new(3, &keys);
        let mut conn = PacketConn::open(Box::new(server));

        let seqnum = start(&mut conn, &keys, 3, TxnType::Write, &[0; 32]).unwrap();
        let ckptnonce: [u8; 32] = entropy::random().unwrap();
        checkpoint(&mut conn, &keys, 3, &seqnum, 0, &ckptnonce).unwrap();

        // A later process finds and completes the checkpointed commit.
        let committed = commit_from_checkpoint(&mut conn, &keys, 3, 0).unwrap();
        assert_eq!(committed, Some(seqnum));
        assert_eq!(commit_from_checkpoint(&mut conn, &keys, 3, 0).unwrap(), None);
    }
}
