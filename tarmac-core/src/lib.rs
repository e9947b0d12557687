/*!
This crate contains the cryptographic core of tarmac: the typed key set, the
primitive operations built on top of it (HMAC-SHA-256 addressing, AES-CTR
streams, RSA-2048 PSS signatures and OAEP key wrapping, Diffie-Hellman group
14), the per-session file encryption envelope, and the authenticated session
used by the wire protocol.

Everything in this crate is deliberately deterministic about byte layouts:
the padding schemes, the keyfile format, and the file envelope are fixed
formats shared with the storage service, and are implemented here rather
than delegated to library defaults.
*/

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::similar_names)]
#![allow(clippy::missing_errors_doc)]

pub mod crypto;
pub mod keys;
