//! Cache-directory transaction state: the sequence file recording the
//! last committed nonce, marker files for transactions in progress, and
//! the commit/cleanstate steps tying local state to the server's.

use tracing::{debug, warn};

use std::fs;
use std::path::{Path, PathBuf};

use tarmac_core::keys::KeySet;

use crate::chunks::directory::commit_staged;
use crate::netpacket::{Dialer, PacketConn};
use crate::storage::transaction;

use super::Result;

/// The last committed transaction nonce, or zeros for a fresh cache
/// directory.
pub fn sequence(cachedir: &Path) -> Result<[u8; 32]> {
    let path = cachedir.join("sequence");
    if !path.exists() {
        return Ok([0; 32]);
    }
    let buf = fs::read(&path)?;
    if buf.len() != 32 {
        warn!(path = %path.display(), "sequence file has wrong length");
        return Ok([0; 32]);
    }
    let mut seq = [0_u8; 32];
    seq.copy_from_slice(&buf);
    Ok(seq)
}

fn marker_path(cachedir: &Path, seqnum: &[u8; 32]) -> PathBuf {
    cachedir.join(hex::encode(seqnum))
}

/// Record that a transaction is in progress, so a crashed run can be
/// resolved by the next one.
pub fn write_marker(cachedir: &Path, seqnum: &[u8; 32], whichkey: u8) -> Result<()> {
    fs::create_dir_all(cachedir)?;
    fs::write(marker_path(cachedir, seqnum), [whichkey])?;
    Ok(())
}

/// Transactions recorded as in progress: (nonce, whichkey).
fn pending_markers(cachedir: &Path) -> Result<Vec<([u8; 32], u8)>> {
    let mut markers = Vec::new();
    if !cachedir.exists() {
        return Ok(markers);
    }
    for entry in fs::read_dir(cachedir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = match name.to_str() {
            Some(name) if name.len() == 64 => name,
            _ => continue,
        };
        let nonce = match hex::decode(name) {
            Ok(bytes) if bytes.len() == 32 => {
                let mut nonce = [0_u8; 32];
                nonce.copy_from_slice(&bytes);
                nonce
            }
            _ => continue,
        };
        let contents = fs::read(entry.path())?;
        let whichkey = contents.first().copied().unwrap_or(0);
        markers.push((nonce, whichkey));
    }
    Ok(markers)
}

/// Commit the transaction `seqnum` on the server, then make the local
/// state durable: promote the staged chunk directory, record the new
/// sequence number, and remove the transaction marker.
pub fn commit(
    dialer: Box<dyn Dialer>,
    keys: &KeySet,
    cachedir: &Path,
    machinenum: u64,
    seqnum: &[u8; 32],
    whichkey: u8,
) -> Result<()> {
    let mut conn = PacketConn::open(dialer);
    transaction::commit(&mut conn, keys, machinenum, seqnum, whichkey)?;

    commit_staged(cachedir)?;
    fs::write(cachedir.join("sequence"), seqnum)?;
    let marker = marker_path(cachedir, seqnum);
    if marker.exists() {
        fs::remove_file(marker)?;
    }
    debug!("transaction durably committed");
    Ok(())
}

/// Bring the cache directory to a clean state before a new transaction:
/// complete any commit a previous run recorded but did not finish, and
/// pick up any checkpointed write transaction the server is holding.
pub fn cleanstate(
    dialer: &dyn Fn() -> Box<dyn Dialer>,
    keys: &KeySet,
    cachedir: &Path,
    machinenum: u64,
    whichkey: u8,
) -> Result<()> {
    for (nonce, marker_key) in pending_markers(cachedir)? {
        warn!("completing interrupted transaction");
        // Committing an unknown or already-committed nonce is a no-op on
        // the server, so this is safe whether or not the crash happened
        // after the server saw the commit.
        commit(dialer(), keys, cachedir, machinenum, &nonce, marker_key)?;
    }

    // A checkpointed write transaction with no local marker (the cache
    // directory may have been rebuilt) still needs completing.
    let mut conn = PacketConn::open(dialer());
    if let Some(nonce) =
        transaction::commit_from_checkpoint(&mut conn, keys, machinenum, whichkey)?
    {
        commit_staged(cachedir)?;
        fs::write(cachedir.join("sequence"), nonce)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netpacket::loopback::LoopbackServer;
    use crate::storage::{StorageWriter, TxnType, WriteLimits, CLASS_CHUNK};
    use tarmac_core::keys::{MASK_AUTH_DELETE, MASK_AUTH_GET, MASK_WRITE};

    fn test_keys() -> KeySet {
        let mut keys = KeySet::new();
        keys.generate(MASK_WRITE | MASK_AUTH_GET | MASK_AUTH_DELETE)
            .unwrap();
        keys
    }

    #[test]
    fn sequence_defaults_to_zero() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(sequence(dir.path()).unwrap(), [0; 32]);
    }

    #[test]
    fn commit_updates_sequence_and_removes_marker() {
        let keys = test_keys();
        let server = LoopbackServer::new(12, &keys);
        let cachedir = tempfile::tempdir().unwrap();

        let mut writer = StorageWriter::start(
            Box::new(server.clone()),
            &keys,
            12,
            &[0; 32],
            false,
            WriteLimits::default(),
        )
        .unwrap();
        writer.write_file(CLASS_CHUNK, &[1; 32], b"x").unwrap();
        writer.flush().unwrap();
        let seqnum = writer.seqnum();
        writer.end().unwrap();

        write_marker(cachedir.path(), &seqnum, TxnType::Write.whichkey()).unwrap();
        commit(
            Box::new(server.clone()),
            &keys,
            cachedir.path(),
            12,
            &seqnum,
            0,
        )
        .unwrap();

        assert_eq!(sequence(cachedir.path()).unwrap(), seqnum);
        assert!(!marker_path(cachedir.path(), &seqnum).exists());
        assert_eq!(server.count_files(CLASS_CHUNK), 1);
    }

    #[test]
    fn cleanstate_finishes_interrupted_commit() {
        let keys = test_keys();
        let server = LoopbackServer::new(12, &keys);
        let cachedir = tempfile::tempdir().unwrap();

        let mut writer = StorageWriter::start(
            Box::new(server.clone()),
            &keys,
            12,
            &[0; 32],
            false,
            WriteLimits::default(),
        )
        .unwrap();
        writer.write_file(CLASS_CHUNK, &[1; 32], b"x").unwrap();
        writer.flush().unwrap();
        let seqnum = writer.seqnum();
        writer.end().unwrap();
        // Crash: the marker exists but commit never ran.
        write_marker(cachedir.path(), &seqnum, 0).unwrap();

        let server2 = server.clone();
        cleanstate(
            &move || Box::new(server2.clone()) as Box<dyn Dialer>,
            &keys,
            cachedir.path(),
            12,
            0,
        )
        .unwrap();
        assert_eq!(sequence(cachedir.path()).unwrap(), seqnum);
        assert_eq!(server.count_files(CLASS_CHUNK), 1);
    }
}
