//! Stateless reads, with a bounded insertion-order cache.

use tracing::trace;

use std::collections::{HashMap, HashSet, VecDeque};

use tarmac_core::crypto::file::FileCrypto;
use tarmac_core::keys::KeySet;

use crate::netpacket::packets::{Request, Response};
use crate::netpacket::{Dialer, PacketConn};

use super::{Result, StorageError};

/// Default bound on cached bytes.
const DEFAULT_CACHE_LIMIT: usize = 512 * 1024 * 1024;

/// Decrypted file contents keyed by (class, name), evicted in insertion
/// order once the byte bound is exceeded.
struct NameCache {
    limit: usize,
    used: usize,
    map: HashMap<(u8, [u8; 32]), Vec<u8>>,
    order: VecDeque<(u8, [u8; 32])>,
    /// Names the caller has asked us to retain when next read.
    wanted: HashSet<(u8, [u8; 32])>,
}

impl NameCache {
    fn new() -> NameCache {
        NameCache {
            limit: DEFAULT_CACHE_LIMIT,
            used: 0,
            map: HashMap::new(),
            order: VecDeque::new(),
            wanted: HashSet::new(),
        }
    }

    fn insert(&mut self, key: (u8, [u8; 32]), data: Vec<u8>) {
        if data.len() > self.limit || self.map.contains_key(&key) {
            return;
        }
        self.used += data.len();
        self.map.insert(key, data);
        self.order.push_back(key);
        while self.used > self.limit {
            let oldest = self.order.pop_front().expect("cache accounting broken");
            if let Some(old) = self.map.remove(&oldest) {
                self.used -= old.len();
            }
        }
    }
}

/// Read cookie: a connection plus the session decryption state.
pub struct StorageReader<'k> {
    keys: &'k KeySet,
    machinenum: u64,
    conn: PacketConn,
    crypto: FileCrypto,
    cache: NameCache,
}

impl<'k> StorageReader<'k> {
    pub fn new(dialer: Box<dyn Dialer>, keys: &'k KeySet, machinenum: u64) -> StorageReader<'k> {
        StorageReader {
            keys,
            machinenum,
            conn: PacketConn::open(dialer),
            crypto: FileCrypto::new(),
            cache: NameCache::new(),
        }
    }

    /// Bound the total bytes of cached decrypted files.
    pub fn set_cache_limit(&mut self, limit: usize) {
        self.cache.limit = limit;
    }

    /// Keep the named file in the cache when it is next read.
    pub fn add_name_cache(&mut self, class: u8, name: &[u8; 32]) {
        self.cache.wanted.insert((class, *name));
    }

    /// Read and unwrap the named file.
    ///
    /// When `expected_len` is given, a file whose decrypted length differs
    /// is corrupt, not merely wrong; cache hits make the same distinction.
    pub fn read_file(
        &mut self,
        class: u8,
        name: &[u8; 32],
        expected_len: Option<usize>,
    ) -> Result<Vec<u8>> {
        if let Some(data) = self.cache.map.get(&(class, *name)) {
            trace!(class, "file cache hit");
            if let Some(len) = expected_len {
                if data.len() != len {
                    return Err(StorageError::Corrupt);
                }
            }
            return Ok(data.clone());
        }

        let resp = self.conn.call(
            self.keys,
            Request::ReadFile {
                machinenum: self.machinenum,
                class,
                name: *name,
                size: u32::MAX,
            },
        )?;
        let data = match resp {
            Response::Read { status: 0, data } => data,
            Response::Read { status: 1, .. } => return Err(StorageError::NotFound),
            Response::Read { status: 2, .. } => return Err(StorageError::Corrupt),
            _ => return Err(StorageError::Protocol),
        };

        let plain = self.crypto.decrypt(self.keys, &data)?;
        if let Some(len) = expected_len {
            if plain.len() != len {
                return Err(StorageError::Corrupt);
            }
        }
        if self.cache.wanted.remove(&(class, *name)) {
            self.cache.insert((class, *name), plain.clone());
        }
        Ok(plain)
    }

    /// The connection, for directory listings sharing this cookie.
    pub fn conn_mut(&mut self) -> &mut PacketConn {
        &mut self.conn
    }

    /// Bytes received and sent.
    pub fn stats(&self) -> (u64, u64) {
        self.conn.stats()
    }
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

    fn put_file(keys: &KeySet, server: &LoopbackServer, name: [u8; 32], data: &[u8]) {
        let mut writer = StorageWriter::start(
            Box::new(server.clone()),
            keys,
            44,
            &[0; 32],
            false,
            WriteLimits::default(),
        )
        .unwrap();
        writer.write_file(CLASS_CHUNK, &name, data).unwrap();
        writer.flush().unwrap();
        let seqnum = writer.seqnum();
        writer.end().unwrap();
        let mut conn = PacketConn::open(Box::new(server.clone()));
        transaction::commit(&mut conn, keys, 44, &seqnum, TxnType::Write.whichkey()).unwrap();
    }

    #[test]
    fn read_round_trip_and_not_found() {
        let keys = test_keys();
        let server = LoopbackServer::new(44, &keys);
        put_file(&keys, &server, [7; 32], b"file body");

        let mut reader = StorageReader::new(Box::new(server), &keys, 44);
        let data = reader.read_file(CLASS_CHUNK, &[7; 32], None).unwrap();
        assert_eq!(data, b"file body");
        assert!(matches!(
            reader.read_file(CLASS_CHUNK, &[8; 32], None),
            Err(StorageError::NotFound)
        ));
    }

    #[test]
    fn tampered_file_is_corrupt() {
        let keys = test_keys();
        let server = LoopbackServer::new(44, &keys);
        put_file(&keys, &server, [7; 32], b"file body");
        assert!(server.corrupt_file(CLASS_CHUNK, &[7; 32], 100));

        let mut reader = StorageReader::new(Box::new(server), &keys, 44);
        assert!(matches!(
            reader.read_file(CLASS_CHUNK, &[7; 32], None),
            Err(StorageError::Corrupt)
        ));
    }

    #[test]
    fn cache_preserves_length_check() {
        let keys = test_keys();
        let server = LoopbackServer::new(44, &keys);
        put_file(&keys, &server, [7; 32], b"0123456789");

        let mut reader = StorageReader::new(Box::new(server), &keys, 44);
        reader.add_name_cache(CLASS_CHUNK, &[7; 32]);
        reader.read_file(CLASS_CHUNK, &[7; 32], Some(10)).unwrap();
        // Cached now; a wrong expected length must still read as corrupt.
        let (before_in, _) = reader.stats();
        assert!(matches!(
            reader.read_file(CLASS_CHUNK, &[7; 32], Some(11)),
            Err(StorageError::Corrupt)
        ));
        reader.read_file(CLASS_CHUNK, &[7; 32], Some(10)).unwrap();
        let (after_in, _) = reader.stats();
        assert_eq!(before_in, after_in, "cache hits must bypass the network");
    }
}
