//! Paginated directory listings.

use tracing::trace;

use tarmac_core::crypto::entropy;
use tarmac_core::keys::KeySet;

use crate::netpacket::packets::{Request, Response};
use crate::netpacket::PacketConn;

use super::{Result, StorageError};

/// Read the full, sorted list of file names of a class.
///
/// The server answers with a train of packets of at most 8000 names each;
/// names must arrive in strictly increasing order.  `deleted_context`
/// selects the DIRECTORY_D variant used inside delete and fsck
/// transactions.  `start` allows resuming after the last name seen.
pub fn directory_read(
    conn: &mut PacketConn,
    keys: &KeySet,
    machinenum: u64,
    class: u8,
    deleted_context: bool,
    start: [u8; 32],
) -> Result<Vec<[u8; 32]>> {
    let cnonce: [u8; 32] = entropy::random()?;
    let req = Request::Directory {
        machinenum,
        class,
        start,
        snonce: [0; 32],
        cnonce,
        d: deleted_context,
    };

    let mut names: Vec<[u8; 32]> = Vec::new();
    let mut resp = conn.call(keys, req.clone())?;
    loop {
        let (status, more, page) = match resp {
            Response::Directory {
                status,
                more,
                names,
            } => (status, more, names),
            _ => return Err(StorageError::Protocol),
        };
        if status != 0 {
            return Err(StorageError::Protocol);
        }
        for name in page {
            if let Some(last) = names.last() {
                if name <= *last {
                    return Err(StorageError::Corrupt);
                }
            }
            names.push(name);
        }
        if !more {
            break;
        }
        resp = conn.recv_pushed(keys, &req)?;
    }
    trace!(class, count = names.len(), "directory listed");
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netpacket::loopback::LoopbackServer;
    use crate::storage::{transaction, StorageWriter, TxnType, WriteLimits, CLASS_CHUNK};
    use tarmac_core::keys::{
        MASK_AUTH_DELETE, MASK_AUTH_GET, MASK_AUTH_PUT, MASK_ENCR_PRIV, MASK_ENCR_PUB,
        MASK_HMAC_FILE,
    };

    fn test_keys() -> KeySet {
        let mut keys = KeySet::new();
        keys.generate(
            MASK_AUTH_PUT
                | MASK_AUTH_GET
                | MASK_AUTH_DELETE
                | MASK_ENCR_PRIV
                | MASK_ENCR_PUB
                | MASK_HMAC_FILE,
        )
        .unwrap();
        keys
    }

    fn populate(keys: &KeySet, server: &LoopbackServer, count: u8) {
        let mut writer = StorageWriter::start(
            Box::new(server.clone()),
            keys,
            2,
            &[0; 32],
            false,
            WriteLimits::default(),
        )
        .unwrap();
        for i in 0..count {
            writer
                .write_file(CLASS_CHUNK, &[i; 32], &[i])
                .unwrap();
        }
        writer.flush().unwrap();
        let seqnum = writer.seqnum();
        writer.end().unwrap();
        let mut conn = PacketConn::open(Box::new(server.clone()));
        transaction::commit(&mut conn, keys, 2, &seqnum, 0).unwrap();
    }

    #[test]
    fn names_are_strictly_increasing_across_pages() {
        let keys = test_keys();
        let server = LoopbackServer::new(2, &keys);
        populate(&keys, &server, 25);
        server.set_page_size(10);

        let mut conn = PacketConn::open(Box::new(server));
        let names =
            directory_read(&mut conn, &keys, 2, CLASS_CHUNK, false, [0; 32]).unwrap();
        assert_eq!(names.len(), 25);
        for pair in names.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn resume_from_last_name() {
        let keys = test_keys();
        let server = LoopbackServer::new(2, &keys);
        populate(&keys, &server, 10);

        let mut conn = PacketConn::open(Box::new(server));
        let mut start = [5_u8; 32];
        // Resume just past name 5.
        start[31] = 6;
        let names = directory_read(&mut conn, &keys, 2, CLASS_CHUNK, false, start).unwrap();
        assert_eq!(names.len(), 4);
        assert_eq!(names[0], [6; 32]);
    }

    #[test]
    fn empty_class_lists_nothing() {
        let keys = test_keys();
        let server = LoopbackServer::new(2, &keys);
        let mut conn = PacketConn::open(Box::new(server));
        let names =
            directory_read(&mut conn, &keys, 2, CLASS_CHUNK, false, [0; 32]).unwrap();
        assert!(names.is_empty());
    }
}
