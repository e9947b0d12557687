//! An in-memory server speaking the typed packet protocol.
//!
//! The server keeps committed files, one pending transaction, and the last
//! committed sequence nonce behind a shared handle; every test (and the
//! whole storage/chunks/multitape stack above) exercises the same packet
//! layouts, MAC checks, and transaction semantics the production service
//! enforces.  Writes and deletes are buffered in the pending transaction
//! and applied atomically at commit.

use byteorder::{BigEndian, ByteOrder};
use tracing::trace;

use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex};

use tarmac_core::crypto::dh;
use tarmac_core::crypto::entropy;
use tarmac_core::crypto::hash::{sha256, sha256_2, verify_bytes};
use tarmac_core::keys::KeySet;

use super::packets::{mac_data, MAXFILESIZE};
use super::{Dialer, NetpacketError, PacketChannel, Result};
use crate::netpacket as types;

struct Transaction {
    nonce: [u8; 32],
    ttype: u8,
    writes: Vec<((u8, [u8; 32]), Vec<u8>)>,
    deletes: Vec<(u8, [u8; 32])>,
    checkpoint: Option<[u8; 32]>,
}

struct Challenge {
    user: String,
    salt: [u8; 32],
    server_priv: [u8; 32],
}

struct ServerState {
    machinenum: u64,
    auth_put: [u8; 32],
    auth_get: [u8; 32],
    auth_delete: [u8; 32],
    files: BTreeMap<(u8, [u8; 32]), Vec<u8>>,
    txn: Option<Transaction>,
    last_committed: [u8; 32],
    last_snonce: [u8; 32],
    page_size: usize,
    /// Remaining "try again later" answers to inject on commit attempts.
    commit_later: u32,
    users: BTreeMap<String, String>,
    challenge: Option<Challenge>,
    next_machinenum: u64,
}

/// Shared handle to the in-memory server; cloning shares the state, and
/// every dialed channel talks to the same files and transaction.
#[derive(Clone)]
pub struct LoopbackServer {
    state: Arc<Mutex<ServerState>>,
}

impl LoopbackServer {
    /// A server for an already-registered machine holding the given
    /// authorization keys.
    pub fn new(machinenum: u64, keys: &KeySet) -> LoopbackServer {
        let auth = keys.raw_export_auth().expect("auth keys must be present");
        let mut auth_put = [0_u8; 32];
        let mut auth_get = [0_u8; 32];
        let mut auth_delete = [0_u8; 32];
        auth_put.copy_from_slice(&auth[..32]);
        auth_get.copy_from_slice(&auth[32..64]);
        auth_delete.copy_from_slice(&auth[64..]);
        LoopbackServer {
            state: Arc::new(Mutex::new(ServerState {
                machinenum,
                auth_put,
                auth_get,
                auth_delete,
                files: BTreeMap::new(),
                txn: None,
                last_committed: [0; 32],
                last_snonce: [0; 32],
                page_size: types::DIRECTORY_RESPONSE_MAXFILES,
                commit_later: 0,
                users: BTreeMap::new(),
                challenge: None,
                next_machinenum: machinenum,
            })),
        }
    }

    /// A server knowing one account, for exercising registration.
    pub fn with_user(user: &str, passwd: &str) -> LoopbackServer {
        let server = LoopbackServer::new(0, &{
            let mut keys = KeySet::new();
            keys.generate(
                tarmac_core::keys::MASK_AUTH_PUT
                    | tarmac_core::keys::MASK_AUTH_GET
                    | tarmac_core::keys::MASK_AUTH_DELETE,
            )
            .unwrap();
            keys
        });
        {
            let mut state = server.state.lock().unwrap();
            state.users.insert(user.to_owned(), passwd.to_owned());
            state.next_machinenum = 77;
        }
        server
    }

    /// Shrink directory pages, for pagination tests.
    pub fn set_page_size(&self, n: usize) {
        self.state.lock().unwrap().page_size = n;
    }

    /// Answer the next `n` commit attempts with "try again later".
    pub fn inject_commit_later(&self, n: u32) {
        self.state.lock().unwrap().commit_later = n;
    }

    /// Number of committed files of the given class.
    pub fn count_files(&self, class: u8) -> usize {
        self.state
            .lock()
            .unwrap()
            .files
            .keys()
            .filter(|(c, _)| *c == class)
            .count()
    }

    /// Corrupt one byte of a committed file, for integrity tests.
    pub fn corrupt_file(&self, class: u8, name: &[u8; 32], offset: usize) -> bool {
        let mut state = self.state.lock().unwrap();
        match state.files.get_mut(&(class, *name)) {
            Some(data) if offset < data.len() => {
                data[offset] ^= 0x01;
                true
            }
            _ => false,
        }
    }

    /// The names of committed files of a class, sorted.
    pub fn file_names(&self, class: u8) -> Vec<[u8; 32]> {
        self.state
            .lock()
            .unwrap()
            .files
            .keys()
            .filter(|(c, _)| *c == class)
            .map(|(_, name)| *name)
            .collect()
    }
}

impl Dialer for LoopbackServer {
    fn dial(&self) -> Result<Box<dyn PacketChannel>> {
        Ok(Box::new(LoopbackChannel {
            state: Arc::clone(&self.state),
            queue: VecDeque::new(),
            bytes_in: 0,
            bytes_out: 0,
        }))
    }
}

/// One dialed channel; requests are handled synchronously and their
/// responses queued for reading.
pub struct LoopbackChannel {
    state: Arc<Mutex<ServerState>>,
    queue: VecDeque<(u8, Vec<u8>)>,
    bytes_in: u64,
    bytes_out: u64,
}

impl PacketChannel for LoopbackChannel {
    fn write_packet(&mut self, ptype: u8, payload: &[u8]) -> Result<()> {
        self.bytes_out += 69 + payload.len() as u64;
        let responses = {
            let mut state = self.state.lock().unwrap();
            handle(&mut state, ptype, payload)?
        };
        for (rtype, rbody) in responses {
            self.bytes_in += 69 + rbody.len() as u64;
            self.queue.push_back((rtype, rbody));
        }
        Ok(())
    }

    fn read_packet(&mut self) -> Result<(u8, Vec<u8>)> {
        self.queue.pop_front().ok_or_else(|| {
            NetpacketError::Transport(io::Error::new(
                io::ErrorKind::WouldBlock,
                "no response pending",
            ))
        })
    }

    fn stats(&self) -> (u64, u64) {
        (self.bytes_in, self.bytes_out)
    }
}

/// Split a MAC-trailed body and check the MAC.
fn checked_body<'a>(
    key: &[u8; 32],
    ptype: u8,
    payload: &'a [u8],
) -> std::result::Result<&'a [u8], NetpacketError> {
    if payload.len() < 32 {
        return Err(NetpacketError::Protocol);
    }
    let (body, mac) = payload.split_at(payload.len() - 32);
    let expected = mac_data(key, ptype, None, body);
    if !verify_bytes(&expected, mac) {
        return Err(NetpacketError::Protocol);
    }
    Ok(body)
}

fn require(cond: bool) -> Result<()> {
    if cond {
        Ok(())
    } else {
        Err(NetpacketError::Protocol)
    }
}

fn arr32(slice: &[u8]) -> [u8; 32] {
    let mut out = [0_u8; 32];
    out.copy_from_slice(slice);
    out
}

/// The key a transaction-start/cancel of type `ttype` must be signed with.
fn ttype_key(state: &ServerState, ttype: u8) -> Result<[u8; 32]> {
    match ttype {
        0 | 3 => Ok(state.auth_put),
        1 | 2 => Ok(state.auth_delete),
        _ => Err(NetpacketError::Protocol),
    }
}

fn whichkey_key(state: &ServerState, whichkey: u8) -> Result<[u8; 32]> {
    match whichkey {
        0 => Ok(state.auth_put),
        1 => Ok(state.auth_delete),
        _ => Err(NetpacketError::Protocol),
    }
}

fn file_exists(state: &ServerState, class: u8, name: &[u8; 32]) -> bool {
    if state.files.contains_key(&(class, *name)) {
        return true;
    }
    state
        .txn
        .as_ref()
        .map_or(false, |txn| {
            txn.writes.iter().any(|((c, n), _)| *c == class && n == name)
        })
}

#[allow(clippy::too_many_lines)]
fn handle(state: &mut ServerState, ptype: u8, payload: &[u8]) -> Result<Vec<(u8, Vec<u8>)>> {
    trace!(ptype, len = payload.len(), "loopback request");
    match ptype {
        types::REGISTER_REQUEST => {
            let user = String::from_utf8(payload.to_vec()).map_err(|_| NetpacketError::Protocol)?;
            let salt: [u8; 32] = entropy::random()?;
            let (server_pub, server_priv) = dh::generate().map_err(|_| NetpacketError::Protocol)?;
            state.challenge = Some(Challenge {
                user,
                salt,
                server_priv,
            });
            let mut body = Vec::with_capacity(288);
            body.extend_from_slice(&salt);
            body.extend_from_slice(&server_pub);
            Ok(vec![(types::REGISTER_CHALLENGE, body)])
        }
        types::REGISTER_CHA_RESPONSE => {
            let challenge = state.challenge.take().ok_or(NetpacketError::Protocol)?;
            let passwd = state.users.get(&challenge.user).cloned();

            // Derive the register key the way the client did: the client's
            // DH pair is a function of the account password and the salt.
            let passwd = passwd.unwrap_or_default();
            let (client_pub, _) = dh::passwd_to_dh(passwd.as_bytes(), &challenge.salt)
                .map_err(|_| NetpacketError::Protocol)?;
            let k = dh::compute(&client_pub, &challenge.server_priv)
                .map_err(|_| NetpacketError::Protocol)?;
            let register_key = sha256(&k);

            let (status, machinenum) = match checked_body(&register_key, ptype, payload) {
                Ok(body) => {
                    require(body.len() >= 97)?;
                    let namelen = body[96] as usize;
                    require(body.len() == 97 + namelen)?;
                    let mut auth = [0_u8; 96];
                    auth.copy_from_slice(&body[..96]);
                    state.auth_put = arr32(&auth[..32]);
                    state.auth_get = arr32(&auth[32..64]);
                    state.auth_delete = arr32(&auth[64..]);
                    state.machinenum = state.next_machinenum;
                    (0_u8, state.machinenum)
                }
                // Bad password: the MAC does not verify.
                Err(_) => (2_u8, 0),
            };

            let mut body = Vec::with_capacity(9);
            body.push(status);
            let mut num = [0_u8; 8];
            BigEndian::write_u64(&mut num, machinenum);
            body.extend_from_slice(&num);
            let mac = mac_data(&register_key, types::REGISTER_RESPONSE, None, &body);
            body.extend_from_slice(&mac);
            Ok(vec![(types::REGISTER_RESPONSE, body)])
        }
        types::TRANSACTION_GETNONCE => {
            require(payload.len() == 8)?;
            require(BigEndian::read_u64(&payload[..8]) == state.machinenum)?;
            let snonce: [u8; 32] = entropy::random()?;
            state.last_snonce = snonce;
            Ok(vec![(types::TRANSACTION_GETNONCE_RESPONSE, snonce.to_vec())])
        }
        types::TRANSACTION_START => {
            // machinenum + type + snonce + cnonce + state + mac
            require(payload.len() == 8 + 1 + 32 + 32 + 32 + 32)?;
            let ttype = payload[8];
            let key = ttype_key(state, ttype)?;
            let body = checked_body(&key, ptype, payload)?;
            require(BigEndian::read_u64(&body[..8]) == state.machinenum)?;
            let snonce = arr32(&body[9..41]);
            let cnonce = arr32(&body[41..73]);
            let lastseq = arr32(&body[73..105]);
            require(snonce == state.last_snonce)?;

            let nonce = sha256_2(&snonce, &cnonce);
            let status: u8 = if state.txn.is_some() {
                // A transaction is already pending; the client should have
                // cancelled it.
                1
            } else if ttype < 2 && lastseq != state.last_committed {
                // Write and delete transactions must be rooted in the last
                // committed state.
                1
            } else {
                state.txn = Some(Transaction {
                    nonce,
                    ttype,
                    writes: Vec::new(),
                    deletes: Vec::new(),
                    checkpoint: None,
                });
                0
            };
            let mut body = vec![status];
            let mac = mac_data(&key, types::TRANSACTION_START_RESPONSE, Some(&nonce), &body);
            body.extend_from_slice(&mac);
            Ok(vec![(types::TRANSACTION_START_RESPONSE, body)])
        }
        types::TRANSACTION_CANCEL => {
            require(payload.len() == 8 + 1 + 32 + 32 + 32 + 32)?;
            let whichkey = payload[8];
            let key = ttype_key(state, whichkey)?;
            let body = checked_body(&key, ptype, payload)?;
            require(BigEndian::read_u64(&body[..8]) == state.machinenum)?;
            let snonce = arr32(&body[9..41]);
            let cnonce = arr32(&body[41..73]);
            require(snonce == state.last_snonce)?;
            state.txn = None;
            let nonce = sha256_2(&snonce, &cnonce);
            let mut body = vec![0_u8];
            let mac = mac_data(&key, types::TRANSACTION_CANCEL_RESPONSE, Some(&nonce), &body);
            body.extend_from_slice(&mac);
            Ok(vec![(types::TRANSACTION_CANCEL_RESPONSE, body)])
        }
        types::TRANSACTION_COMMIT | types::TRANSACTION_TRYCOMMIT => {
            require(payload.len() == 8 + 1 + 32 + 32)?;
            let whichkey = payload[8];
            let key = whichkey_key(state, whichkey)?;
            let body = checked_body(&key, ptype, payload)?;
            require(BigEndian::read_u64(&body[..8]) == state.machinenum)?;
            let nonce = arr32(&body[9..41]);

            let status: u8 = if state.commit_later > 0 && ptype == types::TRANSACTION_TRYCOMMIT {
                state.commit_later -= 1;
                1
            } else {
                if state.txn.as_ref().map(|txn| txn.nonce) == Some(nonce) {
                    let txn = state.txn.take().expect("nonce matched");
                    for (key, data) in txn.writes {
                        state.files.entry(key).or_insert(data);
                    }
                    for key in txn.deletes {
                        state.files.remove(&key);
                    }
                    state.last_committed = nonce;
                }
                // Unknown or already-committed nonces are a no-op success.
                0
            };

            if ptype == types::TRANSACTION_COMMIT {
                let mac = mac_data(&key, types::TRANSACTION_COMMIT_RESPONSE, Some(&nonce), &[]);
                Ok(vec![(types::TRANSACTION_COMMIT_RESPONSE, mac.to_vec())])
            } else {
                let mut body = vec![status];
                let mac = mac_data(
                    &key,
                    types::TRANSACTION_TRYCOMMIT_RESPONSE,
                    Some(&nonce),
                    &body,
                );
                body.extend_from_slice(&mac);
                Ok(vec![(types::TRANSACTION_TRYCOMMIT_RESPONSE, body)])
            }
        }
        types::TRANSACTION_CHECKPOINT => {
            require(payload.len() == 8 + 1 + 32 + 32 + 32)?;
            let whichkey = payload[8];
            let key = whichkey_key(state, whichkey)?;
            let body = checked_body(&key, ptype, payload)?;
            require(BigEndian::read_u64(&body[..8]) == state.machinenum)?;
            let ckptnonce = arr32(&body[9..41]);
            let nonce = arr32(&body[41..73]);

            let status: u8 = match state.txn.as_mut() {
                Some(txn) if txn.nonce == nonce => {
                    txn.checkpoint = Some(ckptnonce);
                    0
                }
                _ => 1,
            };
            let mut body = vec![status];
            body.extend_from_slice(&ckptnonce);
            let mac = mac_data(
                &key,
                types::TRANSACTION_CHECKPOINT_RESPONSE,
                Some(&nonce),
                &body,
            );
            body.extend_from_slice(&mac);
            Ok(vec![(types::TRANSACTION_CHECKPOINT_RESPONSE, body)])
        }
        types::TRANSACTION_ISCHECKPOINTED => {
            require(payload.len() == 8 + 1 + 32 + 32)?;
            let whichkey = payload[8];
            let key = whichkey_key(state, whichkey)?;
            let body = checked_body(&key, ptype, payload)?;
            require(BigEndian::read_u64(&body[..8]) == state.machinenum)?;
            let nonce = arr32(&body[9..41]);

            let (status, tnonce): (u8, [u8; 32]) = match state.txn.as_ref() {
                Some(txn) if txn.checkpoint.is_some() => (1, txn.nonce),
                _ => (0, [0; 32]),
            };
            let mut body = vec![status];
            body.extend_from_slice(&tnonce);
            let mac = mac_data(
                &key,
                types::TRANSACTION_ISCHECKPOINTED_RESPONSE,
                Some(&nonce),
                &body,
            );
            body.extend_from_slice(&mac);
            Ok(vec![(types::TRANSACTION_ISCHECKPOINTED_RESPONSE, body)])
        }
        types::WRITE_FEXIST => {
            require(payload.len() == 8 + 1 + 32 + 32 + 32)?;
            let key = state.auth_put;
            let body = checked_body(&key, ptype, payload)?;
            require(BigEndian::read_u64(&body[..8]) == state.machinenum)?;
            let class = body[8];
            let name = arr32(&body[9..41]);
            let nonce = arr32(&body[41..73]);

            let in_txn = matches!(&state.txn, Some(txn) if txn.nonce == nonce);
            let status: u8 = if !in_txn {
                2
            } else if file_exists(state, class, &name) {
                1
            } else {
                0
            };
            let mut rbody = vec![status, class];
            rbody.extend_from_slice(&name);
            let mac = mac_data(&key, types::WRITE_FEXIST_RESPONSE, Some(&nonce), &rbody);
            rbody.extend_from_slice(&mac);
            Ok(vec![(types::WRITE_FEXIST_RESPONSE, rbody)])
        }
        types::WRITE_FILE => {
            require(payload.len() >= 8 + 1 + 32 + 32 + 4 + 32)?;
            let key = state.auth_put;
            let body = checked_body(&key, ptype, payload)?;
            require(BigEndian::read_u64(&body[..8]) == state.machinenum)?;
            let class = body[8];
            let name = arr32(&body[9..41]);
            let nonce = arr32(&body[41..73]);
            let len = BigEndian::read_u32(&body[73..77]) as usize;
            require(body.len() == 77 + len)?;
            require(len <= MAXFILESIZE)?;
            let data = body[77..].to_vec();

            let in_txn = matches!(&state.txn,
                Some(txn) if txn.nonce == nonce && (txn.ttype == 0 || txn.ttype == 3));
            let status: u8 = if !in_txn {
                2
            } else if file_exists(state, class, &name) {
                1
            } else {
                let txn = state.txn.as_mut().expect("checked above");
                txn.writes.push(((class, name), data));
                0
            };
            let mut rbody = vec![status, class];
            rbody.extend_from_slice(&name);
            let mac = mac_data(&key, types::WRITE_FILE_RESPONSE, Some(&nonce), &rbody);
            rbody.extend_from_slice(&mac);
            Ok(vec![(types::WRITE_FILE_RESPONSE, rbody)])
        }
        types::DELETE_FILE => {
            require(payload.len() == 8 + 1 + 32 + 32 + 32)?;
            let key = state.auth_delete;
            let body = checked_body(&key, ptype, payload)?;
            require(BigEndian::read_u64(&body[..8]) == state.machinenum)?;
            let class = body[8];
            let name = arr32(&body[9..41]);
            let nonce = arr32(&body[41..73]);

            let in_txn = matches!(&state.txn, Some(txn) if txn.nonce == nonce && txn.ttype >= 1);
            let status: u8 = if !in_txn {
                2
            } else if state.files.contains_key(&(class, name)) {
                let txn = state.txn.as_mut().expect("checked above");
                txn.deletes.push((class, name));
                0
            } else {
                1
            };
            let mut rbody = vec![status, class];
            rbody.extend_from_slice(&name);
            let mac = mac_data(&key, types::DELETE_FILE_RESPONSE, Some(&nonce), &rbody);
            rbody.extend_from_slice(&mac);
            Ok(vec![(types::DELETE_FILE_RESPONSE, rbody)])
        }
        types::READ_FILE => {
            require(payload.len() == 8 + 1 + 32 + 4 + 32)?;
            let key = state.auth_get;
            let body = checked_body(&key, ptype, payload)?;
            require(BigEndian::read_u64(&body[..8]) == state.machinenum)?;
            let class = body[8];
            let name = arr32(&body[9..41]);

            // Reads see committed state only.
            let (status, data): (u8, Vec<u8>) = match state.files.get(&(class, name)) {
                Some(data) => (0, data.clone()),
                None => (1, Vec::new()),
            };
            let mut rbody = vec![status, class];
            rbody.extend_from_slice(&name);
            let mut len = [0_u8; 4];
            BigEndian::write_u32(&mut len, data.len() as u32);
            rbody.extend_from_slice(&len);
            rbody.extend_from_slice(&data);
            let mac = mac_data(&key, types::READ_FILE_RESPONSE, None, &rbody);
            rbody.extend_from_slice(&mac);
            Ok(vec![(types::READ_FILE_RESPONSE, rbody)])
        }
        types::DIRECTORY | types::DIRECTORY_D => {
            require(payload.len() == 8 + 1 + 32 + 32 + 32 + 32)?;
            let key = if ptype == types::DIRECTORY {
                state.auth_get
            } else {
                state.auth_delete
            };
            let body = checked_body(&key, ptype, payload)?;
            require(BigEndian::read_u64(&body[..8]) == state.machinenum)?;
            let class = body[8];
            let start = arr32(&body[9..41]);
            let cnonce = arr32(&body[73..105]);

            let names: Vec<[u8; 32]> = state
                .files
                .keys()
                .filter(|(c, n)| *c == class && *n >= start)
                .map(|(_, n)| *n)
                .collect();

            let rtype = types::DIRECTORY_RESPONSE;
            let mut responses = Vec::new();
            let pages: Vec<&[[u8; 32]]> = if names.is_empty() {
                vec![&[][..]]
            } else {
                names.chunks(state.page_size).collect()
            };
            let npages = pages.len();
            for (i, page) in pages.into_iter().enumerate() {
                let mut rbody = vec![0_u8, u8::from(i + 1 < npages)];
                let mut nfiles = [0_u8; 4];
                BigEndian::write_u32(&mut nfiles, page.len() as u32);
                rbody.extend_from_slice(&nfiles);
                rbody.extend_from_slice(&cnonce);
                for name in page {
                    rbody.extend_from_slice(name);
                }
                let mac = mac_data(&key, rtype, None, &rbody);
                rbody.extend_from_slice(&mac);
                responses.push((rtype, rbody));
            }
            Ok(responses)
        }
        _ => Err(NetpacketError::Protocol),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netpacket::packets::{Request, Response};
    use crate::netpacket::PacketConn;
    use tarmac_core::keys::{MASK_AUTH_DELETE, MASK_AUTH_GET, MASK_AUTH_PUT};

    fn auth_keys() -> KeySet {
        let mut keys = KeySet::new();
        keys.generate(MASK_AUTH_PUT | MASK_AUTH_GET | MASK_AUTH_DELETE)
            .unwrap();
        keys
    }

    fn start_txn(conn: &mut PacketConn, keys: &KeySet, ttype: u8) -> [u8; 32] {
        let snonce = match conn
            .call(keys, Request::TransactionGetnonce { machinenum: 5 })
            .unwrap()
        {
            Response::Nonce(n) => n,
            other => panic!("unexpected response {:?}", other),
        };
        let cnonce: [u8; 32] = entropy::random().unwrap();
        let resp = conn
            .call(
                keys,
                Request::TransactionStart {
                    machinenum: 5,
                    ttype,
                    snonce,
                    cnonce,
                    state: [0; 32],
                },
            )
            .unwrap();
        assert!(matches!(resp, Response::Status(0)));
        sha256_2(&snonce, &cnonce)
    }

    #[test]
    fn write_commit_read() {
        let keys = auth_keys();
        let server = LoopbackServer::new(5, &keys);
        let mut conn = PacketConn::open(Box::new(server.clone()));

        let nonce = start_txn(&mut conn, &keys, 0);
        let name = [0x42_u8; 32];
        let resp = conn
            .call(
                &keys,
                Request::WriteFile {
                    machinenum: 5,
                    class: b'c',
                    name,
                    nonce,
                    data: b"chunky".to_vec(),
                },
            )
            .unwrap();
        assert!(matches!(resp, Response::File { status: 0 }));

        // Not yet visible to reads.
        let resp = conn
            .call(
                &keys,
                Request::ReadFile {
                    machinenum: 5,
                    class: b'c',
                    name,
                    size: u32::MAX,
                },
            )
            .unwrap();
        assert!(matches!(resp, Response::Read { status: 1, .. }));

        let resp = conn
            .call(
                &keys,
                Request::TransactionTryCommit {
                    machinenum: 5,
                    whichkey: 0,
                    nonce,
                },
            )
            .unwrap();
        assert!(matches!(resp, Response::Status(0)));

        let resp = conn
            .call(
                &keys,
                Request::ReadFile {
                    machinenum: 5,
                    class: b'c',
                    name,
                    size: u32::MAX,
                },
            )
            .unwrap();
        match resp {
            Response::Read { status: 0, data } => assert_eq!(data, b"chunky"),
            other => panic!("unexpected response {:?}", other),
        }
    }

    #[test]
    fn duplicate_write_reports_exists() {
        let keys = auth_keys();
        let server = LoopbackServer::new(5, &keys);
        let mut conn = PacketConn::open(Box::new(server));

        let nonce = start_txn(&mut conn, &keys, 0);
        let name = [9_u8; 32];
        for expected in [0_u8, 1] {
            let resp = conn
                .call(
                    &keys,
                    Request::WriteFile {
                        machinenum: 5,
                        class: b'c',
                        name,
                        nonce,
                        data: vec![1],
                    },
                )
                .unwrap();
            match resp {
                Response::File { status } => assert_eq!(status, expected),
                other => panic!("unexpected response {:?}", other),
            }
        }
    }

    #[test]
    fn registration_round_trip() {
        let server = LoopbackServer::with_user("alice", "hunter2");
        let keys = auth_keys();
        let mut conn = PacketConn::open(Box::new(server.clone()));

        let challenge = conn
            .call(
                &keys,
                Request::RegisterRequest {
                    user: "alice".to_owned(),
                },
            )
            .unwrap();
        let (salt, server_pub) = match challenge {
            Response::RegisterChallenge { salt, server_pub } => (salt, server_pub),
            other => panic!("unexpected response {:?}", other),
        };

        let (_, priv_key) = dh::passwd_to_dh(b"hunter2", &salt).unwrap();
        let k = dh::compute(&server_pub, &priv_key).unwrap();
        let register_key = sha256(&k);

        let resp = conn
            .call(
                &keys,
                Request::RegisterChaResponse {
                    auth_keys: keys.raw_export_auth().unwrap(),
                    name: "test-machine".to_owned(),
                    register_key,
                },
            )
            .unwrap();
        match resp {
            Response::Register {
                status: 0,
                machinenum,
            } => assert_eq!(machinenum, 77),
            other => panic!("registration failed: {:?}", other),
        }

        // The installed keys now authenticate ordinary requests.
        let resp = conn
            .call(&keys, Request::TransactionGetnonce { machinenum: 77 })
            .unwrap();
        assert!(matches!(resp, Response::Nonce(_)));
    }

    #[test]
    fn stale_nonce_is_status_2() {
        let keys = auth_keys();
        let server = LoopbackServer::new(5, &keys);
        let mut conn = PacketConn::open(Box::new(server));

        let _nonce = start_txn(&mut conn, &keys, 0);
        let resp = conn
            .call(
                &keys,
                Request::WriteFile {
                    machinenum: 5,
                    class: b'c',
                    name: [1; 32],
                    nonce: [0xee; 32],
                    data: vec![1],
                },
            )
            .unwrap();
        assert!(matches!(resp, Response::File { status: 2 }));
    }
}
