//! The per-connection operation queue.
//!
//! Requests are written immediately and their responses consumed strictly
//! in FIFO order.  When the transport dies, the connection is redialed
//! with backoff and every unanswered request is replayed in order on the
//! fresh channel; the remote treats a replayed write of an existing file
//! as success, so replay is idempotent.

use tracing::{debug, warn};

use std::collections::VecDeque;
use std::thread;
use std::time::Duration;

use tarmac_core::keys::KeySet;

use super::packets::{Request, Response};
use super::{Dialer, NetpacketError, PacketChannel, Result};

/// Reconnection delays, in seconds, indexed by the number of drops so far.
const BACKOFF: [u64; 11] = [0, 0, 1, 2, 4, 8, 15, 30, 60, 90, 90];

/// Give up after this many connection failures...
const MAXDROPS: u32 = 10;
/// ...or this many, if no connection has ever succeeded.
const MAXDROPS_UNCONNECTED: u32 = 3;

struct PendingOp {
    req: Request,
    ptype: u8,
    wire: Vec<u8>,
}

/// A logical connection: one live channel plus the queue of operations
/// awaiting responses on it.
pub struct PacketConn {
    dialer: Box<dyn Dialer>,
    chan: Option<Box<dyn PacketChannel>>,
    pending: VecDeque<PendingOp>,
    pending_bytes: usize,
    ndrops: u32,
    ever_connected: bool,
    /// Traffic on channels that have since died.
    dead_bytes_in: u64,
    dead_bytes_out: u64,
}

impl PacketConn {
    /// Create a connection; the first channel is dialed on first use.
    pub fn open(dialer: Box<dyn Dialer>) -> PacketConn {
        PacketConn {
            dialer,
            chan: None,
            pending: VecDeque::new(),
            pending_bytes: 0,
            ndrops: 0,
            ever_connected: false,
            dead_bytes_in: 0,
            dead_bytes_out: 0,
        }
    }

    /// Record the current channel as dead.
    fn drop_channel(&mut self) {
        if let Some(chan) = self.chan.take() {
            let (bytes_in, bytes_out) = chan.stats();
            self.dead_bytes_in += bytes_in;
            self.dead_bytes_out += bytes_out;
        }
        self.ndrops += 1;
    }

    /// Ensure a live channel exists, redialing with backoff and replaying
    /// unanswered requests.
    fn connect(&mut self) -> Result<()> {
        while self.chan.is_none() {
            let limit = if self.ever_connected {
                MAXDROPS
            } else {
                MAXDROPS_UNCONNECTED
            };
            if self.ndrops >= limit {
                return Err(NetpacketError::TooManyDrops);
            }
            let delay = BACKOFF[(self.ndrops as usize).min(BACKOFF.len() - 1)];
            if delay > 0 {
                debug!(delay, "waiting before reconnecting");
                thread::sleep(Duration::from_secs(delay));
            }
            match self.dialer.dial() {
                Ok(mut chan) => {
                    self.ever_connected = true;
                    // Replay every unanswered request, in order.
                    let mut ok = true;
                    for op in &self.pending {
                        if chan.write_packet(op.ptype, &op.wire).is_err() {
                            ok = false;
                            break;
                        }
                    }
                    if ok {
                        self.chan = Some(chan);
                    } else {
                        self.ndrops += 1;
                        warn!("connection lost during replay");
                    }
                }
                Err(NetpacketError::Transport(e)) => {
                    self.ndrops += 1;
                    warn!(error = %e, "could not connect");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Send a request; its response must later be consumed via
    /// [`recv`](PacketConn::recv) in FIFO order.
    pub fn send(&mut self, keys: &KeySet, req: Request) -> Result<()> {
        let (ptype, wire) = req.serialize(keys)?;
        self.pending_bytes += req.payload_len();
        self.pending.push_back(PendingOp { req, ptype, wire });

        // A live channel gets just the new request; dialing replays the
        // whole queue, new request included.
        match self.chan.as_mut() {
            Some(chan) => {
                let op = self.pending.back().expect("just pushed");
                if chan.write_packet(op.ptype, &op.wire).is_err() {
                    self.drop_channel();
                    self.connect()?;
                }
            }
            None => self.connect()?,
        }
        Ok(())
    }

    /// Receive the response to the oldest unanswered request.
    pub fn recv(&mut self, keys: &KeySet) -> Result<Response> {
        if self.pending.is_empty() {
            return Err(NetpacketError::Protocol);
        }
        loop {
            self.connect()?;
            let chan = self.chan.as_mut().expect("connected");
            match chan.read_packet() {
                Ok((ptype, buf)) => {
                    let op = self.pending.front().expect("checked non-empty");
                    let resp = op.req.parse_response(keys, ptype, &buf)?;
                    let op = self.pending.pop_front().expect("checked non-empty");
                    self.pending_bytes -= op.req.payload_len();
                    self.ndrops = 0;
                    return Ok(resp);
                }
                Err(NetpacketError::Transport(e)) => {
                    debug!(error = %e, "connection lost; reconnecting");
                    self.drop_channel();
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Send a request and wait for its response.  Requires an empty queue
    /// so no earlier response is discarded.
    pub fn call(&mut self, keys: &KeySet, req: Request) -> Result<Response> {
        if !self.pending.is_empty() {
            return Err(NetpacketError::Protocol);
        }
        self.send(keys, req)?;
        self.recv(keys)
    }

    /// Receive one more server-pushed response for `req` (directory
    /// listings arrive as a train of packets for a single request).
    pub fn recv_pushed(&mut self, keys: &KeySet, req: &Request) -> Result<Response> {
        if !self.pending.is_empty() {
            return Err(NetpacketError::Protocol);
        }
        self.connect()?;
        let chan = self.chan.as_mut().expect("connected");
        let (ptype, buf) = chan.read_packet()?;
        req.parse_response(keys, ptype, &buf)
    }

    /// Unanswered requests.
    pub fn npending(&self) -> usize {
        self.pending.len()
    }

    /// Bytes of file payload in unanswered write requests.
    pub fn pending_bytes(&self) -> usize {
        self.pending_bytes
    }

    /// Total bytes received and sent, dead connections included.
    pub fn stats(&self) -> (u64, u64) {
        let (live_in, live_out) = self
            .chan
            .as_ref()
            .map_or((0, 0), |chan| chan.stats());
        (
            self.dead_bytes_in + live_in,
            self.dead_bytes_out + live_out,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netpacket::loopback::LoopbackServer;
    use std::cell::Cell;
    use std::rc::Rc;
    use tarmac_core::keys::{KeySet, MASK_AUTH_DELETE, MASK_AUTH_GET, MASK_AUTH_PUT};

    fn auth_keys() -> KeySet {
        let mut keys = KeySet::new();
        keys.generate(MASK_AUTH_PUT | MASK_AUTH_GET | MASK_AUTH_DELETE)
            .unwrap();
        keys
    }

    /// A dialer that fails a fixed number of times, then delegates.
    struct FlakyDialer {
        inner: LoopbackServer,
        failures: Rc<Cell<u32>>,
    }

    impl Dialer for FlakyDialer {
        fn dial(&self) -> Result<Box<dyn PacketChannel>> {
            if self.failures.get() > 0 {
                self.failures.set(self.failures.get() - 1);
                Err(NetpacketError::Transport(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "injected failure",
                )))
            } else {
                self.inner.dial()
            }
        }
    }

    #[test]
    fn call_round_trip() {
        let keys = auth_keys();
        let server = LoopbackServer::new(1234, &keys);
        let mut conn = PacketConn::open(Box::new(server));
        let resp = conn
            .call(&keys, Request::TransactionGetnonce { machinenum: 1234 })
            .unwrap();
        assert!(matches!(resp, Response::Nonce(_)));
    }

    #[test]
    fn reconnects_through_transient_failures() {
        let keys = auth_keys();
        let server = LoopbackServer::new(1, &keys);
        // Two failures: covered by the zero-delay backoff slots.
        let dialer = FlakyDialer {
            inner: server,
            failures: Rc::new(Cell::new(2)),
        };
        let mut conn = PacketConn::open(Box::new(dialer));
        let resp = conn
            .call(&keys, Request::TransactionGetnonce { machinenum: 1 })
            .unwrap();
        assert!(matches!(resp, Response::Nonce(_)));
    }

    #[test]
    fn gives_up_when_never_connected() {
        let keys = auth_keys();
        let server = LoopbackServer::new(1, &keys);
        let dialer = FlakyDialer {
            inner: server,
            failures: Rc::new(Cell::new(u32::MAX)),
        };
        let mut conn = PacketConn::open(Box::new(dialer));
        assert!(matches!(
            conn.call(&keys, Request::TransactionGetnonce { machinenum: 1 }),
            Err(NetpacketError::TooManyDrops)
        ));
    }

    #[test]
    fn recv_without_send_is_a_bug() {
        let keys = auth_keys();
        let server = LoopbackServer::new(1, &keys);
        let mut conn = PacketConn::open(Box::new(server));
        assert!(matches!(
            conn.recv(&keys),
            Err(NetpacketError::Protocol)
        ));
    }
}
