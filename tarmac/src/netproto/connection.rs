//! A live authenticated connection and its framing.

use byteorder::{BigEndian, ByteOrder};
use lazy_static::lazy_static;
use tracing::{debug, warn};

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tarmac_core::crypto::dh;
use tarmac_core::crypto::hash::sha256;
use tarmac_core::crypto::session::{Session, CLIENT_LABELS};
use tarmac_core::crypto::rsa;
use tarmac_core::keys::KeySet;

use super::{NetprotoError, Result, HEADER_LEN, MAX_PACKET_LEN, PROTOCOL_VERSION};
use crate::netpacket::{self, NetpacketError, PacketChannel};

/// Idle timeout between bytes.
const TIMEOUT_IDLE: Duration = Duration::from_secs(60);
/// Deadline for a complete packet header.
const TIMEOUT_HEADER: Duration = Duration::from_secs(120);
/// Deadline for a complete payload; bounds roughly 7 kbps at the maximum
/// packet size.
const TIMEOUT_PAYLOAD: Duration = Duration::from_secs(300);
/// Deadline for each handshake step.
const TIMEOUT_HANDSHAKE: Duration = Duration::from_secs(5);

/// How long a DNS answer stays fresh.
const DNS_TTL: Duration = Duration::from_secs(60);

lazy_static! {
    /// Resolution cache, plus the last answer that actually worked; on a
    /// transient DNS failure the stale answer is reused.
    static ref DNS_CACHE: Mutex<HashMap<String, (Vec<SocketAddr>, Instant)>> =
        Mutex::new(HashMap::new());
}

fn resolve(host: &str, port: u16) -> Result<Vec<SocketAddr>> {
    let key = format!("{}:{}", host, port);
    let mut cache = DNS_CACHE.lock().expect("DNS cache mutex poisoned");
    if let Some((addrs, when)) = cache.get(&key) {
        if when.elapsed() < DNS_TTL {
            return Ok(addrs.clone());
        }
    }
    match key.to_socket_addrs() {
        Ok(addrs) => {
            let addrs: Vec<SocketAddr> = addrs.collect();
            cache.insert(key, (addrs.clone(), Instant::now()));
            Ok(addrs)
        }
        Err(e) => {
            // Transient resolver failure: fall back to the last answer.
            if let Some((addrs, _)) = cache.get(&key) {
                warn!(error = %e, "DNS lookup failed; using cached address");
                return Ok(addrs.clone());
            }
            Err(NetprotoError::Resolve)
        }
    }
}

/// Read exactly `buf.len()` bytes with both an idle timeout and a total
/// deadline.
fn read_exact_deadline(
    stream: &mut TcpStream,
    buf: &mut [u8],
    idle: Duration,
    total: Duration,
) -> Result<()> {
    let start = Instant::now();
    let mut pos = 0;
    while pos < buf.len() {
        let remaining = total
            .checked_sub(start.elapsed())
            .ok_or_else(|| NetprotoError::Io(timeout_error()))?;
        stream.set_read_timeout(Some(remaining.min(idle)))?;
        match stream.read(&mut buf[pos..]) {
            Ok(0) => return Err(NetprotoError::Io(eof_error())),
            Ok(n) => pos += n,
            Err(ref e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                return Err(NetprotoError::Io(timeout_error()));
            }
            Err(e) => return Err(NetprotoError::Io(e)),
        }
    }
    Ok(())
}

fn timeout_error() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::TimedOut, "network timeout")
}

fn eof_error() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "connection closed")
}

/// An authenticated, encrypted connection to the storage server.
pub struct Connection {
    stream: TcpStream,
    session: Session,
    bytes_in: u64,
    bytes_out: u64,
    broken: bool,
    limit_read: Option<super::bwlimit::TokenBucket>,
    limit_write: Option<super::bwlimit::TokenBucket>,
}

impl Connection {
    /// Connect and perform protocol negotiation and key exchange.
    pub fn open(host: &str, port: u16, useragent: &str, keys: &KeySet) -> Result<Connection> {
        if useragent.is_empty() || useragent.len() > 255 {
            return Err(NetprotoError::Protocol);
        }

        let addrs = resolve(host, port)?;
        let mut stream = None;
        for addr in &addrs {
            match TcpStream::connect_timeout(addr, TIMEOUT_HANDSHAKE) {
                Ok(s) => {
                    stream = Some(s);
                    break;
                }
                Err(e) => debug!(addr = %addr, error = %e, "connect failed"),
            }
        }
        let mut stream = stream.ok_or_else(|| NetprotoError::Io(timeout_error()))?;
        stream.set_nodelay(true)?;
        stream.set_write_timeout(Some(TIMEOUT_PAYLOAD))?;

        let mut bytes_in = 0_u64;
        let mut bytes_out = 0_u64;

        // Exchange protocol versions.
        stream.write_all(&[PROTOCOL_VERSION])?;
        bytes_out += 1;
        let mut version = [0_u8; 1];
        read_exact_deadline(&mut stream, &mut version, TIMEOUT_HANDSHAKE, TIMEOUT_HANDSHAKE)?;
        bytes_in += 1;
        if version[0] != PROTOCOL_VERSION {
            return Err(NetprotoError::Protocol);
        }

        // Send our identity.
        stream.write_all(&[useragent.len() as u8])?;
        stream.write_all(useragent.as_bytes())?;
        bytes_out += 1 + useragent.len() as u64;

        // Server crypto parameters: DH value, signature, nonce.
        let mut params = [0_u8; 256 + 256 + 32];
        read_exact_deadline(&mut stream, &mut params, TIMEOUT_HANDSHAKE, TIMEOUT_HANDSHAKE)?;
        bytes_in += params.len() as u64;

        let mut server_pub = [0_u8; 256];
        server_pub.copy_from_slice(&params[..256]);
        match rsa::verify(keys.root_pub()?, &server_pub, &params[256..512]) {
            Ok(()) => {}
            Err(rsa::RsaError::BadSignature) => return Err(NetprotoError::Protocol),
            Err(_) => return Err(NetprotoError::Handshake),
        }
        dh::sanity_check(&server_pub).map_err(|_| NetprotoError::Protocol)?;
        let mut nonce = [0_u8; 32];
        nonce.copy_from_slice(&params[512..544]);

        // Send our DH value and construct the session keys.
        let (pub_key, priv_key) = dh::generate().map_err(|_| NetprotoError::Handshake)?;
        stream.write_all(&pub_key)?;
        bytes_out += pub_key.len() as u64;

        let mut session = Session::new(&server_pub, &priv_key, &nonce, CLIENT_LABELS)
            .map_err(|_| NetprotoError::Handshake)?;

        // Exchange proofs of key possession.
        let mkey = session.mkey();
        let proof = session.sign(&mkey);
        stream.write_all(&proof)?;
        bytes_out += proof.len() as u64;

        let mut server_proof = [0_u8; 32];
        read_exact_deadline(
            &mut stream,
            &mut server_proof,
            TIMEOUT_HANDSHAKE,
            TIMEOUT_HANDSHAKE,
        )?;
        bytes_in += server_proof.len() as u64;
        if !session.verify(&mkey, &server_proof) {
            return Err(NetprotoError::Protocol);
        }

        debug!(host, port, "session established");
        Ok(Connection {
            stream,
            session,
            bytes_in,
            bytes_out,
            broken: false,
            limit_read: None,
            limit_write: None,
        })
    }

    /// Cap sustained read/write rates, in bytes per second.
    pub fn set_bw_limit(&mut self, read: Option<u64>, write: Option<u64>) {
        self.limit_read = read.map(super::bwlimit::TokenBucket::new);
        self.limit_write = write.map(super::bwlimit::TokenBucket::new);
    }

    /// Frame and send one packet.
    pub fn write_packet(&mut self, ptype: u8, payload: &[u8]) -> Result<()> {
        if self.broken {
            // Not fatal: the remote will detect the protocol error, but
            // this indicates a local bug.
            warn!("attempt to write to connection marked as broken");
        }
        if payload.len() > u32::MAX as usize {
            return Err(NetprotoError::Protocol);
        }

        let mut packet = Vec::with_capacity(HEADER_LEN + payload.len());
        let mut header = [0_u8; 37];
        header[0] = ptype;
        BigEndian::write_u32(&mut header[1..5], payload.len() as u32);
        header[5..37].copy_from_slice(&sha256(payload));

        self.session.encrypt(&mut header);
        let mac = self.session.sign(&header);
        packet.extend_from_slice(&header);
        packet.extend_from_slice(&mac);

        let body_start = packet.len();
        packet.extend_from_slice(payload);
        self.session.encrypt(&mut packet[body_start..]);

        if let Some(bucket) = self.limit_write.as_mut() {
            bucket.consume(packet.len() as u64);
        }
        match self.stream.write_all(&packet) {
            Ok(()) => {
                self.bytes_out += packet.len() as u64;
                Ok(())
            }
            Err(e) => {
                self.broken = true;
                Err(NetprotoError::Io(e))
            }
        }
    }

    /// Receive and verify one packet.
    pub fn read_packet(&mut self) -> Result<(u8, Vec<u8>)> {
        let mut header = [0_u8; HEADER_LEN];
        read_exact_deadline(&mut self.stream, &mut header, TIMEOUT_IDLE, TIMEOUT_HEADER)?;
        if let Some(bucket) = self.limit_read.as_mut() {
            bucket.consume(HEADER_LEN as u64);
        }
        self.bytes_in += HEADER_LEN as u64;

        let mut mac = [0_u8; 32];
        mac.copy_from_slice(&header[37..]);
        if !self.session.verify(&header[..37], &mac) {
            self.broken = true;
            return Err(NetprotoError::Protocol);
        }
        self.session.decrypt(&mut header[..37]);

        let ptype = header[0];
        let len = BigEndian::read_u32(&header[1..5]) as usize;
        if len > MAX_PACKET_LEN {
            self.broken = true;
            return Err(NetprotoError::Protocol);
        }

        let mut payload = vec![0_u8; len];
        read_exact_deadline(&mut self.stream, &mut payload, TIMEOUT_IDLE, TIMEOUT_PAYLOAD)?;
        if let Some(bucket) = self.limit_read.as_mut() {
            bucket.consume(len as u64);
        }
        self.bytes_in += len as u64;
        self.session.decrypt(&mut payload);

        // A zero-length payload has only one possible hash, already
        // authenticated via the header MAC.
        if len > 0 && sha256(&payload) != header[5..37] {
            self.broken = true;
            return Err(NetprotoError::Protocol);
        }

        Ok((ptype, payload))
    }

    /// Bytes received and sent on this connection.
    pub fn stats(&self) -> (u64, u64) {
        (self.bytes_in, self.bytes_out)
    }
}

impl PacketChannel for Connection {
    fn write_packet(&mut self, ptype: u8, payload: &[u8]) -> netpacket::Result<()> {
        Connection::write_packet(self, ptype, payload).map_err(to_netpacket)
    }

    fn read_packet(&mut self) -> netpacket::Result<(u8, Vec<u8>)> {
        Connection::read_packet(self).map_err(to_netpacket)
    }

    fn stats(&self) -> (u64, u64) {
        Connection::stats(self)
    }
}

fn to_netpacket(err: NetprotoError) -> NetpacketError {
    match err {
        NetprotoError::Io(e) => NetpacketError::Transport(e),
        NetprotoError::Resolve => NetpacketError::Transport(timeout_error()),
        NetprotoError::Key(e) => NetpacketError::Key(e),
        NetprotoError::Protocol | NetprotoError::Handshake => NetpacketError::Protocol,
    }
}

/// Dials authenticated sessions to a fixed endpoint.
pub struct TcpDialer {
    pub host: String,
    pub port: u16,
    pub useragent: String,
    pub keys_snapshot: KeysSnapshot,
    /// Sustained read/write rate caps, bytes per second.
    pub bw_read: Option<u64>,
    pub bw_write: Option<u64>,
}

/// The handshake needs the server root key; connections may be dialed
/// long after the key set was loaded, so the dialer keeps its own copy of
/// the exported root key blob.
pub struct KeysSnapshot {
    root_blob: Vec<u8>,
}

impl KeysSnapshot {
    pub fn of(keys: &KeySet) -> Result<KeysSnapshot> {
        Ok(KeysSnapshot {
            root_blob: keys
                .export(tarmac_core::keys::MASK_ROOT_PUB)
                .map_err(NetprotoError::Key)?,
        })
    }

    fn keys(&self) -> Result<KeySet> {
        let mut keys = KeySet::new();
        keys.import(&self.root_blob, tarmac_core::keys::MASK_ROOT_PUB)
            .map_err(NetprotoError::Key)?;
        Ok(keys)
    }
}

impl TcpDialer {
    pub fn new(host: &str, port: u16, useragent: &str, keys: &KeySet) -> Result<TcpDialer> {
        Ok(TcpDialer {
            host: host.to_owned(),
            port,
            useragent: useragent.to_owned(),
            keys_snapshot: KeysSnapshot::of(keys)?,
            bw_read: None,
            bw_write: None,
        })
    }
}

impl crate::netpacket::Dialer for TcpDialer {
    fn dial(&self) -> netpacket::Result<Box<dyn PacketChannel>> {
        let keys = self.keys_snapshot.keys().map_err(to_netpacket)?;
        let mut conn = Connection::open(&self.host, self.port, &self.useragent, &keys)
            .map_err(to_netpacket)?;
        conn.set_bw_limit(self.bw_read, self.bw_write);
        Ok(Box::new(conn))
    }
}
