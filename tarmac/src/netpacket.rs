/*!
Typed request/response packets and the in-flight operation queue.

Every request has a fixed wire shape ending in an HMAC under the
authorization key appropriate to the operation; responses are verified
covering the packet type, the transaction nonce where one applies, and the
body.  Requests travel over a [`PacketChannel`], the seam between this
layer and the transport: production code dials authenticated TCP sessions
through [`crate::netproto`], and tests dial the in-memory
[`loopback::LoopbackServer`].
*/

pub mod conn;
pub mod loopback;
pub mod packets;

pub use self::conn::PacketConn;
pub use self::packets::{Request, Response};

use tarmac_core::keys::KeyError;
use thiserror::Error;

use std::io;

/* Packet types. */
pub const REGISTER_REQUEST: u8 = 0x00;
pub const REGISTER_CHALLENGE: u8 = 0x80;
pub const REGISTER_CHA_RESPONSE: u8 = 0x01;
pub const REGISTER_RESPONSE: u8 = 0x81;
pub const TRANSACTION_GETNONCE: u8 = 0x10;
pub const TRANSACTION_GETNONCE_RESPONSE: u8 = 0x90;
pub const TRANSACTION_START: u8 = 0x11;
pub const TRANSACTION_START_RESPONSE: u8 = 0x91;
pub const TRANSACTION_COMMIT: u8 = 0x12;
pub const TRANSACTION_COMMIT_RESPONSE: u8 = 0x92;
pub const TRANSACTION_CHECKPOINT: u8 = 0x13;
pub const TRANSACTION_CHECKPOINT_RESPONSE: u8 = 0x93;
pub const TRANSACTION_CANCEL: u8 = 0x14;
pub const TRANSACTION_CANCEL_RESPONSE: u8 = 0x94;
pub const TRANSACTION_TRYCOMMIT: u8 = 0x15;
pub const TRANSACTION_TRYCOMMIT_RESPONSE: u8 = 0x95;
pub const TRANSACTION_ISCHECKPOINTED: u8 = 0x16;
pub const TRANSACTION_ISCHECKPOINTED_RESPONSE: u8 = 0x96;
pub const WRITE_FEXIST: u8 = 0x20;
pub const WRITE_FEXIST_RESPONSE: u8 = 0xa0;
pub const WRITE_FILE: u8 = 0x21;
pub const WRITE_FILE_RESPONSE: u8 = 0xa1;
pub const DELETE_FILE: u8 = 0x30;
pub const DELETE_FILE_RESPONSE: u8 = 0xb0;
pub const READ_FILE: u8 = 0x40;
pub const READ_FILE_RESPONSE: u8 = 0xc0;
pub const DIRECTORY: u8 = 0x50;
pub const DIRECTORY_D: u8 = 0x51;
pub const DIRECTORY_RESPONSE: u8 = 0xd0;

/// Maximum number of names in one DIRECTORY_RESPONSE packet.
pub const DIRECTORY_RESPONSE_MAXFILES: usize = 8000;

#[derive(Error, Debug)]
pub enum NetpacketError {
    /// Transport failure; the operation queue reconnects and replays.
    #[error("network transport error")]
    Transport(#[from] io::Error),
    /// Wrong packet type, bad MAC, or impossible length.  Indicates a
    /// broken server or a local bug; never retried.
    #[error("network protocol violation")]
    Protocol,
    /// Reconnection attempts exhausted.
    #[error("too many network failures")]
    TooManyDrops,
    #[error("key not available")]
    Key(#[from] KeyError),
    #[error("could not obtain entropy")]
    Entropy(#[from] tarmac_core::crypto::entropy::EntropyError),
}

pub type Result<T> = std::result::Result<T, NetpacketError>;

/// One authenticated packet transport.
///
/// Implementations deliver whole packets in order; a transport error means
/// the connection is dead and a fresh one must be dialed.
pub trait PacketChannel {
    /// Send one packet.
    fn write_packet(&mut self, ptype: u8, payload: &[u8]) -> Result<()>;
    /// Receive the next packet.
    fn read_packet(&mut self) -> Result<(u8, Vec<u8>)>;
    /// Bytes received and sent on this channel.
    fn stats(&self) -> (u64, u64);
}

/// Produces fresh channels; owns the endpoint coordinates.
pub trait Dialer {
    fn dial(&self) -> Result<Box<dyn PacketChannel>>;
}

/// Shared dialers let several cookies (and their reconnections) draw on
/// one endpoint.
impl Dialer for std::rc::Rc<dyn Dialer> {
    fn dial(&self) -> Result<Box<dyn PacketChannel>> {
        (**self).dial()
    }
}
