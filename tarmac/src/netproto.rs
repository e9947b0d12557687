/*!
The wire session: protocol negotiation, key exchange, and packet framing
over TCP.

Connection negotiation and key exchange protocol:

```text
Client                                Server
Protocol version (== 0; 1 byte)    ->
                                   <- Protocol version (== 0; 1 byte)
namelen (1 -- 255; 1 byte)         ->
User-agent name (namelen bytes)    ->
                                   <- 2^x mod p (256 bytes)
                                   <- RSA-PSS(2^x mod p) (256 bytes)
                                   <- nonce (random; 32 bytes)
2^y mod p (256 bytes)              ->
C_auth(mkey) (32 bytes)            ->
                                   <- S_auth(mkey) (32 bytes)
```

Both sides compute K = 2^(xy) mod p; the master key is
mkey = MGF1(nonce || K, 48) and the directional keys are HMAC(mkey, label).

After the handshake, every packet is framed as an encrypted 37-byte header
(type, length, payload hash), a 32-byte MAC of the encrypted header, and
the encrypted payload; header and payload continue the session-wide CTR
streams across framings.
*/

pub mod bwlimit;
pub mod connection;

pub use self::connection::{Connection, TcpDialer};

use thiserror::Error;

use std::io;

/// The only protocol version spoken.
pub const PROTOCOL_VERSION: u8 = 0;

/// Framed packet header length: 37 encrypted bytes plus the 32-byte MAC.
pub const HEADER_LEN: usize = 69;

/// Largest framed payload accepted.
pub const MAX_PACKET_LEN: usize = 1 << 20;

#[derive(Error, Debug)]
pub enum NetprotoError {
    /// The remote broke the protocol: bad version, bad signature, bad MAC,
    /// or an impossible length.
    #[error("network protocol violation")]
    Protocol,
    #[error("network I/O failed")]
    Io(#[from] io::Error),
    #[error("could not resolve server address")]
    Resolve,
    #[error("cryptographic failure during handshake")]
    Handshake,
    #[error("key not available")]
    Key(#[from] tarmac_core::keys::KeyError),
}

pub type Result<T> = std::result::Result<T, NetprotoError>;
