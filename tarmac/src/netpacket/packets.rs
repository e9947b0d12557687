//! Wire shapes of the typed packets.
//!
//! A request serializes to `(type, body)` where the body ends in
//! HMAC(auth key, type || body-without-mac).  A response MAC covers the
//! response type, the transaction nonce where the body does not already
//! carry one, and the body; every echoed field (class, name, nonce) is
//! checked against the originating request before a response is accepted.

use byteorder::{BigEndian, ByteOrder};
use tarmac_core::crypto::hash::verify_bytes;
use tarmac_core::keys::{KeyId, KeySet};

use super::{NetpacketError, Result};
use crate::netpacket as types;

/// Largest file body carried in a WRITE_FILE / READ_FILE_RESPONSE packet:
/// a maximum-size compressed chunk plus the file envelope.
pub const MAXFILESIZE: usize = 263_168;

/// A typed request packet.
#[derive(Clone, Debug)]
pub enum Request {
    RegisterRequest {
        user: String,
    },
    RegisterChaResponse {
        auth_keys: [u8; 96],
        name: String,
        register_key: [u8; 32],
    },
    TransactionGetnonce {
        machinenum: u64,
    },
    TransactionStart {
        machinenum: u64,
        ttype: u8,
        snonce: [u8; 32],
        cnonce: [u8; 32],
        state: [u8; 32],
    },
    TransactionCommit {
        machinenum: u64,
        whichkey: u8,
        nonce: [u8; 32],
    },
    TransactionCheckpoint {
        machinenum: u64,
        whichkey: u8,
        ckptnonce: [u8; 32],
        nonce: [u8; 32],
    },
    TransactionCancel {
        machinenum: u64,
        whichkey: u8,
        snonce: [u8; 32],
        cnonce: [u8; 32],
        state: [u8; 32],
    },
    TransactionTryCommit {
        machinenum: u64,
        whichkey: u8,
        nonce: [u8; 32],
    },
    TransactionIsCheckpointed {
        machinenum: u64,
        whichkey: u8,
        nonce: [u8; 32],
    },
    WriteFexist {
        machinenum: u64,
        class: u8,
        name: [u8; 32],
        nonce: [u8; 32],
    },
    WriteFile {
        machinenum: u64,
        class: u8,
        name: [u8; 32],
        nonce: [u8; 32],
        data: Vec<u8>,
    },
    DeleteFile {
        machinenum: u64,
        class: u8,
        name: [u8; 32],
        nonce: [u8; 32],
    },
    ReadFile {
        machinenum: u64,
        class: u8,
        name: [u8; 32],
        size: u32,
    },
    Directory {
        machinenum: u64,
        class: u8,
        start: [u8; 32],
        snonce: [u8; 32],
        cnonce: [u8; 32],
        d: bool,
    },
}

/// A parsed, verified response.
#[derive(Clone, Debug)]
pub enum Response {
    RegisterChallenge {
        salt: [u8; 32],
        server_pub: [u8; 256],
    },
    Register {
        status: u8,
        machinenum: u64,
    },
    Nonce([u8; 32]),
    Status(u8),
    Committed,
    Checkpoint {
        status: u8,
        nonce: [u8; 32],
    },
    File {
        status: u8,
    },
    Read {
        status: u8,
        data: Vec<u8>,
    },
    Directory {
        status: u8,
        more: bool,
        names: Vec<[u8; 32]>,
    },
}

/// HMAC over (type || nonce? || body) under a raw 32-byte key.
pub(crate) fn mac_data(key: &[u8; 32], ptype: u8, nonce: Option<&[u8; 32]>, body: &[u8]) -> [u8; 32] {
    use tarmac_core::crypto::hash::hmac_sha256;
    let mut data = Vec::with_capacity(1 + 32 + body.len());
    data.push(ptype);
    if let Some(n) = nonce {
        data.extend_from_slice(n);
    }
    data.extend_from_slice(body);
    hmac_sha256(key, &data)
}

/// The authorization key signing a transaction of the given type: write
/// and fsck-write transactions use the put key, delete and fsck use the
/// delete key.
fn key_for_ttype(ttype: u8) -> Option<KeyId> {
    match ttype {
        0 | 3 => Some(KeyId::AuthPut),
        1 | 2 => Some(KeyId::AuthDelete),
        _ => None,
    }
}

fn key_for_whichkey(whichkey: u8) -> Option<KeyId> {
    match whichkey {
        0 => Some(KeyId::AuthPut),
        1 => Some(KeyId::AuthDelete),
        _ => None,
    }
}

fn push_u64(body: &mut Vec<u8>, value: u64) {
    let mut buf = [0_u8; 8];
    BigEndian::write_u64(&mut buf, value);
    body.extend_from_slice(&buf);
}

fn push_u32(body: &mut Vec<u8>, value: u32) {
    let mut buf = [0_u8; 4];
    BigEndian::write_u32(&mut buf, value);
    body.extend_from_slice(&buf);
}

impl Request {
    /// The key signing this request, or `None` for the unauthenticated
    /// packets.  The challenge response is keyed separately.
    fn auth_key(&self, keys: &KeySet) -> Result<Option<[u8; 32]>> {
        let id = match self {
            Request::RegisterRequest { .. } | Request::TransactionGetnonce { .. } => return Ok(None),
            Request::RegisterChaResponse { register_key, .. } => {
                return Ok(Some(*register_key));
            }
            Request::TransactionStart { ttype, .. } | Request::TransactionCancel { whichkey: ttype, .. } => {
                key_for_ttype(*ttype).ok_or(NetpacketError::Protocol)?
            }
            Request::TransactionCommit { whichkey, .. }
            | Request::TransactionCheckpoint { whichkey, .. }
            | Request::TransactionTryCommit { whichkey, .. }
            | Request::TransactionIsCheckpointed { whichkey, .. } => {
                key_for_whichkey(*whichkey).ok_or(NetpacketError::Protocol)?
            }
            Request::WriteFexist { .. } | Request::WriteFile { .. } => KeyId::AuthPut,
            Request::DeleteFile { .. } => KeyId::AuthDelete,
            Request::ReadFile { .. } => KeyId::AuthGet,
            Request::Directory { d, .. } => {
                if *d {
                    KeyId::AuthDelete
                } else {
                    KeyId::AuthGet
                }
            }
        };
        Ok(Some(keys.hmac(id)?.0))
    }

    /// The packet type of this request.
    pub fn ptype(&self) -> u8 {
        match self {
            Request::RegisterRequest { .. } => types::REGISTER_REQUEST,
            Request::RegisterChaResponse { .. } => types::REGISTER_CHA_RESPONSE,
            Request::TransactionGetnonce { .. } => types::TRANSACTION_GETNONCE,
            Request::TransactionStart { .. } => types::TRANSACTION_START,
            Request::TransactionCommit { .. } => types::TRANSACTION_COMMIT,
            Request::TransactionCheckpoint { .. } => types::TRANSACTION_CHECKPOINT,
            Request::TransactionCancel { .. } => types::TRANSACTION_CANCEL,
            Request::TransactionTryCommit { .. } => types::TRANSACTION_TRYCOMMIT,
            Request::TransactionIsCheckpointed { .. } => types::TRANSACTION_ISCHECKPOINTED,
            Request::WriteFexist { .. } => types::WRITE_FEXIST,
            Request::WriteFile { .. } => types::WRITE_FILE,
            Request::DeleteFile { .. } => types::DELETE_FILE,
            Request::ReadFile { .. } => types::READ_FILE,
            Request::Directory { d: false, .. } => types::DIRECTORY,
            Request::Directory { d: true, .. } => types::DIRECTORY_D,
        }
    }

    /// Serialize to `(type, body)`, appending the MAC where one applies.
    pub fn serialize(&self, keys: &KeySet) -> Result<(u8, Vec<u8>)> {
        let mut body = Vec::new();
        match self {
            Request::RegisterRequest { user } => {
                body.extend_from_slice(user.as_bytes());
            }
            Request::RegisterChaResponse {
                auth_keys, name, ..
            } => {
                body.extend_from_slice(auth_keys);
                body.push(name.len() as u8);
                body.extend_from_slice(name.as_bytes());
            }
            Request::TransactionGetnonce { machinenum } => {
                push_u64(&mut body, *machinenum);
            }
            Request::TransactionStart {
                machinenum,
                ttype,
                snonce,
                cnonce,
                state,
            } => {
                push_u64(&mut body, *machinenum);
                body.push(*ttype);
                body.extend_from_slice(snonce);
                body.extend_from_slice(cnonce);
                body.extend_from_slice(state);
            }
            Request::TransactionCancel {
                machinenum,
                whichkey,
                snonce,
                cnonce,
                state,
            } => {
                push_u64(&mut body, *machinenum);
                body.push(*whichkey);
                body.extend_from_slice(snonce);
                body.extend_from_slice(cnonce);
                body.extend_from_slice(state);
            }
            Request::TransactionCommit {
                machinenum,
                whichkey,
                nonce,
            }
            | Request::TransactionTryCommit {
                machinenum,
                whichkey,
                nonce,
            }
            | Request::TransactionIsCheckpointed {
                machinenum,
                whichkey,
                nonce,
            } => {
                push_u64(&mut body, *machinenum);
                body.push(*whichkey);
                body.extend_from_slice(nonce);
            }
            Request::TransactionCheckpoint {
                machinenum,
                whichkey,
                ckptnonce,
                nonce,
            } => {
                push_u64(&mut body, *machinenum);
                body.push(*whichkey);
                body.extend_from_slice(ckptnonce);
                body.extend_from_slice(nonce);
            }
            Request::WriteFexist {
                machinenum,
                class,
                name,
                nonce,
            }
            | Request::DeleteFile {
                machinenum,
                class,
                name,
                nonce,
            } => {
                push_u64(&mut body, *machinenum);
                body.push(*class);
                body.extend_from_slice(name);
                body.extend_from_slice(nonce);
            }
            Request::WriteFile {
                machinenum,
                class,
                name,
                nonce,
                data,
            } => {
                if data.len() > MAXFILESIZE {
                    return Err(NetpacketError::Protocol);
                }
                push_u64(&mut body, *machinenum);
                body.push(*class);
                body.extend_from_slice(name);
                body.extend_from_slice(nonce);
                push_u32(&mut body, data.len() as u32);
                body.extend_from_slice(data);
            }
            Request::ReadFile {
                machinenum,
                class,
                name,
                size,
            } => {
                push_u64(&mut body, *machinenum);
                body.push(*class);
                body.extend_from_slice(name);
                push_u32(&mut body, *size);
            }
            Request::Directory {
                machinenum,
                class,
                start,
                snonce,
                cnonce,
                ..
            } => {
                push_u64(&mut body, *machinenum);
                body.push(*class);
                body.extend_from_slice(start);
                body.extend_from_slice(snonce);
                body.extend_from_slice(cnonce);
            }
        }
        if let Some(key) = self.auth_key(keys)? {
            let mac = mac_data(&key, self.ptype(), None, &body);
            body.extend_from_slice(&mac);
        }
        Ok((self.ptype(), body))
    }

    /// The response packet type this request expects.
    pub fn response_type(&self) -> u8 {
        match self {
            Request::RegisterRequest { .. } => types::REGISTER_CHALLENGE,
            Request::RegisterChaResponse { .. } => types::REGISTER_RESPONSE,
            Request::TransactionGetnonce { .. } => types::TRANSACTION_GETNONCE_RESPONSE,
            Request::TransactionStart { .. } => types::TRANSACTION_START_RESPONSE,
            Request::TransactionCommit { .. } => types::TRANSACTION_COMMIT_RESPONSE,
            Request::TransactionCheckpoint { .. } => types::TRANSACTION_CHECKPOINT_RESPONSE,
            Request::TransactionCancel { .. } => types::TRANSACTION_CANCEL_RESPONSE,
            Request::TransactionTryCommit { .. } => types::TRANSACTION_TRYCOMMIT_RESPONSE,
            Request::TransactionIsCheckpointed { .. } => {
                types::TRANSACTION_ISCHECKPOINTED_RESPONSE
            }
            Request::WriteFexist { .. } => types::WRITE_FEXIST_RESPONSE,
            Request::WriteFile { .. } => types::WRITE_FILE_RESPONSE,
            Request::DeleteFile { .. } => types::DELETE_FILE_RESPONSE,
            Request::ReadFile { .. } => types::READ_FILE_RESPONSE,
            Request::Directory { .. } => types::DIRECTORY_RESPONSE,
        }
    }

    /// The nonce a response MAC must be bound to, when the response body
    /// does not itself carry one.
    fn response_nonce(&self) -> Option<[u8; 32]> {
        match self {
            Request::TransactionStart {
                snonce, cnonce, ..
            }
            | Request::TransactionCancel {
                snonce, cnonce, ..
            } => Some(tarmac_core::crypto::hash::sha256_2(snonce, cnonce)),
            Request::TransactionCommit { nonce, .. }
            | Request::TransactionCheckpoint { nonce, .. }
            | Request::TransactionTryCommit { nonce, .. }
            | Request::TransactionIsCheckpointed { nonce, .. } => Some(*nonce),
            Request::WriteFexist { nonce, .. }
            | Request::WriteFile { nonce, .. }
            | Request::DeleteFile { nonce, .. } => Some(*nonce),
            // The directory response body carries the client nonce echo,
            // which the MAC covers directly.
            Request::Directory { .. } => None,
            _ => None,
        }
    }

    /// Verify and parse a response packet for this request.
    pub fn parse_response(&self, keys: &KeySet, ptype: u8, buf: &[u8]) -> Result<Response> {
        if ptype != self.response_type() {
            return Err(NetpacketError::Protocol);
        }

        // Split off and check the trailing MAC for authenticated replies.
        // (The challenge reply arrives before any shared key exists and
        // carries none.)
        let body = match self.auth_key(keys)? {
            None => buf,
            Some(key) => {
                if buf.len() < 32 {
                    return Err(NetpacketError::Protocol);
                }
                let (body, mac) = buf.split_at(buf.len() - 32);
                let expected = mac_data(&key, ptype, self.response_nonce().as_ref(), body);
                if !verify_bytes(&expected, mac) {
                    return Err(NetpacketError::Protocol);
                }
                body
            }
        };

        match self {
            Request::RegisterRequest { .. } => {
                if body.len() != 288 {
                    return Err(NetpacketError::Protocol);
                }
                let mut salt = [0_u8; 32];
                salt.copy_from_slice(&body[..32]);
                let mut server_pub = [0_u8; 256];
                server_pub.copy_from_slice(&body[32..]);
                Ok(Response::RegisterChallenge { salt, server_pub })
            }
            Request::RegisterChaResponse { .. } => {
                if body.len() != 9 {
                    return Err(NetpacketError::Protocol);
                }
                Ok(Response::Register {
                    status: body[0],
                    machinenum: BigEndian::read_u64(&body[1..9]),
                })
            }
            Request::TransactionGetnonce { .. } => {
                if body.len() != 32 {
                    return Err(NetpacketError::Protocol);
                }
                let mut nonce = [0_u8; 32];
                nonce.copy_from_slice(body);
                Ok(Response::Nonce(nonce))
            }
            Request::TransactionStart { .. }
            | Request::TransactionCancel { .. }
            | Request::TransactionTryCommit { .. } => {
                if body.len() != 1 {
                    return Err(NetpacketError::Protocol);
                }
                Ok(Response::Status(body[0]))
            }
            Request::TransactionCommit { .. } => {
                if !body.is_empty() {
                    return Err(NetpacketError::Protocol);
                }
                Ok(Response::Committed)
            }
            Request::TransactionCheckpoint { .. } | Request::TransactionIsCheckpointed { .. } => {
                if body.len() != 33 {
                    return Err(NetpacketError::Protocol);
                }
                let mut nonce = [0_u8; 32];
                nonce.copy_from_slice(&body[1..]);
                Ok(Response::Checkpoint {
                    status: body[0],
                    nonce,
                })
            }
            Request::WriteFexist { class, name, .. }
            | Request::WriteFile { class, name, .. }
            | Request::DeleteFile { class, name, .. } => {
                if body.len() != 34 || body[1] != *class || body[2..34] != name[..] {
                    return Err(NetpacketError::Protocol);
                }
                Ok(Response::File { status: body[0] })
            }
            Request::ReadFile {
                class, name, size, ..
            } => {
                if body.len() < 38 || body[1] != *class || body[2..34] != name[..] {
                    return Err(NetpacketError::Protocol);
                }
                let status = body[0];
                let len = BigEndian::read_u32(&body[34..38]) as usize;
                if len > MAXFILESIZE || body.len() != 38 + len {
                    return Err(NetpacketError::Protocol);
                }
                if status != 0 && len != 0 {
                    return Err(NetpacketError::Protocol);
                }
                if status == 0 && *size != u32::MAX && len != *size as usize {
                    return Err(NetpacketError::Protocol);
                }
                Ok(Response::Read {
                    status,
                    data: body[38..].to_vec(),
                })
            }
            Request::Directory { cnonce, .. } => {
                if body.len() < 38 {
                    return Err(NetpacketError::Protocol);
                }
                let status = body[0];
                let more = body[1] != 0;
                let nfiles = BigEndian::read_u32(&body[2..6]) as usize;
                if body[6..38] != cnonce[..] {
                    return Err(NetpacketError::Protocol);
                }
                if nfiles > types::DIRECTORY_RESPONSE_MAXFILES || body.len() != 38 + 32 * nfiles {
                    return Err(NetpacketError::Protocol);
                }
                let mut names = Vec::with_capacity(nfiles);
                for i in 0..nfiles {
                    let mut name = [0_u8; 32];
                    name.copy_from_slice(&body[38 + 32 * i..38 + 32 * (i + 1)]);
                    names.push(name);
                }
                Ok(Response::Directory {
                    status,
                    more,
                    names,
                })
            }
        }
    }

    /// Bytes of file payload this request will put on the wire; used for
    /// the pending-write quota.
    pub fn payload_len(&self) -> usize {
        match self {
            Request::WriteFile { data, .. } => data.len(),
            _ => 0,
        }
    }
}
