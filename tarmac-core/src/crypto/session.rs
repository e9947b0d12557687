//! Authenticated encrypted session keys for the wire protocol.
//!
//! Given the Diffie-Hellman shared point and the server nonce, the master
//! key is mkey = MGF1(nonce || K, 48); the four directional subkeys are
//! HMAC(mkey, label).  Each direction runs an independent AES-256-CTR
//! stream starting at nonce 0, and an independent 64-bit monotonic
//! authentication nonce mixed into every MAC.

use byteorder::{BigEndian, ByteOrder};
use thiserror::Error;
use zeroize::Zeroize;

use crate::crypto::aesctr::AesCtr;
use crate::crypto::dh::{self, DH_PRIVLEN, DH_PUBLEN};
use crate::crypto::hash::{hmac_sha256, hmac_sha256_2, verify_bytes};
use crate::crypto::mgf1::mgf1;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Diffie-Hellman computation failed")]
    Dh(#[from] dh::DhError),
}

type Result<T> = std::result::Result<T, SessionError>;

/// The four key-derivation labels, in (encr_write, auth_write, encr_read,
/// auth_read) order as used by the client.
pub const CLIENT_LABELS: [&str; 4] = ["C_encr", "C_auth", "S_encr", "S_auth"];

/// Label order used by the serving side of a connection.
pub const SERVER_LABELS: [&str; 4] = ["S_encr", "S_auth", "C_encr", "C_auth"];

/// One end of an authenticated encrypted session.
pub struct Session {
    encr_write: AesCtr,
    auth_write: [u8; 32],
    auth_write_nonce: u64,
    encr_read: AesCtr,
    auth_read: [u8; 32],
    auth_read_nonce: u64,
    mkey: [u8; 48],
}

impl Session {
    /// Compute K = pub^(2^258 + priv) and derive the directional keys.
    ///
    /// `labels` selects which derived keys are used for which direction;
    /// the client passes [`CLIENT_LABELS`] and the serving side
    /// [`SERVER_LABELS`], so the two ends derive identical material bound
    /// to opposite directions.
    pub fn new(
        pub_key: &[u8; DH_PUBLEN],
        priv_key: &[u8; DH_PRIVLEN],
        nonce: &[u8; 32],
        labels: [&str; 4],
    ) -> Result<Session> {
        let mut k = dh::compute(pub_key, priv_key)?;

        let mut mgf_input = [0_u8; 32 + DH_PUBLEN];
        mgf_input[..32].copy_from_slice(nonce);
        mgf_input[32..].copy_from_slice(&k);
        let mut mkey = [0_u8; 48];
        mgf1(&mgf_input, &mut mkey);
        k.zeroize();
        mgf_input.zeroize();

        let mut aes_write = hmac_sha256(&mkey, labels[0].as_bytes());
        let auth_write = hmac_sha256(&mkey, labels[1].as_bytes());
        let mut aes_read = hmac_sha256(&mkey, labels[2].as_bytes());
        let auth_read = hmac_sha256(&mkey, labels[3].as_bytes());

        let session = Session {
            encr_write: AesCtr::new(&aes_write, 0),
            auth_write,
            auth_write_nonce: 0,
            encr_read: AesCtr::new(&aes_read, 0),
            auth_read,
            auth_read_nonce: 0,
            mkey,
        };
        aes_write.zeroize();
        aes_read.zeroize();
        Ok(session)
    }

    /// The 48-byte master key; both ends prove possession of it during the
    /// handshake.
    pub fn mkey(&self) -> [u8; 48] {
        self.mkey
    }

    /// Encrypt in place with the write stream.
    pub fn encrypt(&mut self, buf: &mut [u8]) {
        self.encr_write.apply(buf);
    }

    /// Decrypt in place with the read stream.
    pub fn decrypt(&mut self, buf: &mut [u8]) {
        self.encr_read.apply(buf);
    }

    /// Produce HMAC(auth_write, be64(nonce++) || buf).
    pub fn sign(&mut self, buf: &[u8]) -> [u8; 32] {
        let mut nonce = [0_u8; 8];
        BigEndian::write_u64(&mut nonce, self.auth_write_nonce);
        self.auth_write_nonce += 1;
        hmac_sha256_2(&self.auth_write, &nonce, buf)
    }

    /// Check `sig` against HMAC(auth_read, be64(nonce++) || buf) in
    /// constant time.  The nonce advances whether or not the check passes.
    pub fn verify(&mut self, buf: &[u8], sig: &[u8; 32]) -> bool {
        let mut nonce = [0_u8; 8];
        BigEndian::write_u64(&mut nonce, self.auth_read_nonce);
        self.auth_read_nonce += 1;
        let expected = hmac_sha256_2(&self.auth_read, &nonce, buf);
        verify_bytes(sig, &expected)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.auth_write.zeroize();
        self.auth_read.zeroize();
        self.mkey.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_pair() -> (Session, Session) {
        let (pub_a, priv_a) = dh::generate().unwrap();
        let (pub_b, priv_b) = dh::generate().unwrap();
        let nonce = [0x3c_u8; 32];
        let client = Session::new(&pub_b, &priv_a, &nonce, CLIENT_LABELS).unwrap();
        let server = Session::new(&pub_a, &priv_b, &nonce, SERVER_LABELS).unwrap();
        (client, server)
    }

    #[test]
    fn both_ends_derive_the_same_keys() {
        let (client, server) = session_pair();
        assert_eq!(client.mkey(), server.mkey());
        assert_eq!(client.auth_write, server.auth_read);
        assert_eq!(client.auth_read, server.auth_write);
    }

    #[test]
    fn encrypt_decrypt_across_framings() {
        let (mut client, mut server) = session_pair();
        let mut first = b"first framed message".to_vec();
        let mut second = b"and a second one, same stream".to_vec();
        client.encrypt(&mut first);
        client.encrypt(&mut second);
        server.decrypt(&mut first);
        server.decrypt(&mut second);
        assert_eq!(first, b"first framed message");
        assert_eq!(second, b"and a second one, same stream");
    }

    #[test]
    fn sign_verify_nonces_advance() {
        let (mut client, mut server) = session_pair();
        let sig0 = client.sign(b"message zero");
        let sig1 = client.sign(b"message one");
        assert!(server.verify(b"message zero", &sig0));
        assert!(server.verify(b"message one", &sig1));
        // Same bytes, later nonce: must not verify.
        let sig2 = client.sign(b"message zero");
        assert_ne!(sig0, sig2);
    }

    #[test]
    fn replayed_signature_rejected() {
        let (mut client, mut server) = session_pair();
        let sig = client.sign(b"once");
        assert!(server.verify(b"once", &sig));
        assert!(!server.verify(b"once", &sig));
    }
}
