/*!
The typed key set held by a machine.

A key set maps a fixed enumeration of key identifiers to either an RSA-2048
key or a 32-byte HMAC-SHA-256 key.  At most one key is held per identifier;
importing a duplicate overwrites.  RSA private/public pairs are generated
together, and HMAC key bytes are wiped when the set is dropped.

The set is an explicit context passed by reference to every operation that
needs key material, rather than process-global state.
*/

pub mod keyfile;

use byteorder::{ByteOrder, LittleEndian};
use openssl::bn::BigNum;
use openssl::pkey::{HasPublic, Private, Public};
use openssl::rsa::Rsa;
use thiserror::Error;
use tracing::trace;
use zeroize::Zeroize;

use crate::crypto::entropy;
use crate::crypto::hash::{hmac_sha256, hmac_sha256_2};
use crate::crypto::rsa;

/// Key identifiers, with their wire numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum KeyId {
    /// Signs archive metadata.
    SignPriv = 0,
    /// Verifies archive metadata signatures.
    SignPub = 1,
    /// Unwraps per-file AES keys.
    EncrPriv = 2,
    /// Wraps per-file AES keys.
    EncrPub = 3,
    /// Authenticates encrypted file blobs on read.
    HmacFile = 4,
    /// Chunk HMAC; the content address of a chunk.
    HmacChunk = 5,
    /// Maps archive names to storage names.
    HmacName = 6,
    /// Derives chunkifier parameters.
    HmacCparams = 7,
    /// Verifies the server identity during the handshake.
    /// (8 is reserved for the private half of the server root key.)
    RootPub = 9,
    /// Signs write requests.
    AuthPut = 10,
    /// Signs read requests.
    AuthGet = 11,
    /// Signs delete requests.
    AuthDelete = 12,
    /// Authenticates encrypted file blobs on write.
    HmacFileWrite = 13,
}

/// Bitmask over key identifiers.
pub type KeyMask = u32;

pub const MASK_SIGN_PRIV: KeyMask = 1 << KeyId::SignPriv as u32;
pub const MASK_SIGN_PUB: KeyMask = 1 << KeyId::SignPub as u32;
pub const MASK_ENCR_PRIV: KeyMask = 1 << KeyId::EncrPriv as u32;
pub const MASK_ENCR_PUB: KeyMask = 1 << KeyId::EncrPub as u32;
pub const MASK_HMAC_FILE: KeyMask = 1 << KeyId::HmacFile as u32;
pub const MASK_HMAC_CHUNK: KeyMask = 1 << KeyId::HmacChunk as u32;
pub const MASK_HMAC_NAME: KeyMask = 1 << KeyId::HmacName as u32;
pub const MASK_HMAC_CPARAMS: KeyMask = 1 << KeyId::HmacCparams as u32;
pub const MASK_ROOT_PUB: KeyMask = 1 << KeyId::RootPub as u32;
pub const MASK_AUTH_PUT: KeyMask = 1 << KeyId::AuthPut as u32;
pub const MASK_AUTH_GET: KeyMask = 1 << KeyId::AuthGet as u32;
pub const MASK_AUTH_DELETE: KeyMask = 1 << KeyId::AuthDelete as u32;
pub const MASK_HMAC_FILE_WRITE: KeyMask = 1 << KeyId::HmacFileWrite as u32;

/// Keys needed to read archives.
pub const MASK_READ: KeyMask = MASK_ENCR_PRIV
    | MASK_SIGN_PUB
    | MASK_HMAC_FILE
    | MASK_HMAC_CHUNK
    | MASK_HMAC_NAME
    | MASK_AUTH_GET;

/// Keys needed to write archives.
pub const MASK_WRITE: KeyMask = MASK_SIGN_PRIV
    | MASK_ENCR_PUB
    | MASK_HMAC_FILE
    | MASK_HMAC_CHUNK
    | MASK_HMAC_NAME
    | MASK_HMAC_CPARAMS
    | MASK_AUTH_PUT;

/// Keys needed to delete archives.
pub const MASK_DELETE: KeyMask = MASK_SIGN_PUB
    | MASK_ENCR_PRIV
    | MASK_HMAC_FILE
    | MASK_HMAC_CHUNK
    | MASK_HMAC_NAME
    | MASK_AUTH_GET
    | MASK_AUTH_DELETE;

/// All keys held by a user's keyfile.
pub const MASK_USER: KeyMask = MASK_SIGN_PRIV
    | MASK_SIGN_PUB
    | MASK_ENCR_PRIV
    | MASK_ENCR_PUB
    | MASK_HMAC_FILE
    | MASK_HMAC_CHUNK
    | MASK_HMAC_NAME
    | MASK_HMAC_CPARAMS
    | MASK_ROOT_PUB
    | MASK_AUTH_PUT
    | MASK_AUTH_GET
    | MASK_AUTH_DELETE;

#[derive(Error, Debug)]
pub enum KeyError {
    #[error("unrecognized key type: {0}")]
    UnknownKeyType(u8),
    #[error("unexpected end of key data")]
    Truncated,
    #[error("key not available: {0}")]
    Missing(&'static str),
    #[error("cannot generate half of an RSA key pair without the other")]
    PairRequired,
    #[error("incorrect HMAC key size: {0}")]
    WrongSize(usize),
    #[error("could not obtain entropy")]
    Entropy(#[from] entropy::EntropyError),
    #[error("RSA operation failed")]
    Rsa(#[from] rsa::RsaError),
    #[error("openssl error")]
    Backend(#[from] openssl::error::ErrorStack),
}

type Result<T> = std::result::Result<T, KeyError>;

/// A 32-byte HMAC key, wiped on drop.
#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct HmacKey(pub [u8; 32]);

impl HmacKey {
    fn generate() -> Result<HmacKey> {
        Ok(HmacKey(entropy::random()?))
    }
}

impl AsRef<[u8]> for HmacKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// The key cache: at most one instance per identifier.
#[derive(Default)]
pub struct KeySet {
    sign_priv: Option<Rsa<Private>>,
    sign_pub: Option<Rsa<Public>>,
    encr_priv: Option<Rsa<Private>>,
    encr_pub: Option<Rsa<Public>>,
    root_pub: Option<Rsa<Public>>,
    hmac_file: Option<HmacKey>,
    hmac_file_write: Option<HmacKey>,
    hmac_chunk: Option<HmacKey>,
    hmac_name: Option<HmacKey>,
    hmac_cparams: Option<HmacKey>,
    auth_put: Option<HmacKey>,
    auth_get: Option<HmacKey>,
    auth_delete: Option<HmacKey>,
}

impl KeySet {
    /// An empty key set.
    pub fn new() -> KeySet {
        KeySet::default()
    }

    /// Import keys from a blob stream, installing only keys whose type is
    /// set in `mask`.  Duplicates overwrite.
    ///
    /// Importing a file HMAC key also fills the file-write slot when that
    /// bit is masked in, so keyfiles predating the separate write key keep
    /// working.
    pub fn import(&mut self, mut buf: &[u8], mask: KeyMask) -> Result<()> {
        while !buf.is_empty() {
            if buf.len() < 5 {
                return Err(KeyError::Truncated);
            }
            let len = LittleEndian::read_u32(&buf[..4]) as usize;
            let ktype = buf[4];
            buf = &buf[5..];
            if len > buf.len() {
                return Err(KeyError::Truncated);
            }
            let data = &buf[..len];
            buf = &buf[len..];

            let masked = |id: KeyId| mask & (1 << id as u32) != 0;
            match ktype {
                t if t == KeyId::SignPriv as u8 => {
                    if masked(KeyId::SignPriv) {
                        self.sign_priv = Some(import_rsa_priv(data)?);
                    }
                }
                t if t == KeyId::SignPub as u8 => {
                    if masked(KeyId::SignPub) {
                        self.sign_pub = Some(import_rsa_pub(data)?);
                    }
                }
                t if t == KeyId::EncrPriv as u8 => {
                    if masked(KeyId::EncrPriv) {
                        self.encr_priv = Some(import_rsa_priv(data)?);
                    }
                }
                t if t == KeyId::EncrPub as u8 => {
                    if masked(KeyId::EncrPub) {
                        self.encr_pub = Some(import_rsa_pub(data)?);
                    }
                }
                t if t == KeyId::RootPub as u8 => {
                    if masked(KeyId::RootPub) {
                        self.root_pub = Some(import_rsa_pub(data)?);
                    }
                }
                t if t == KeyId::HmacFile as u8 => {
                    if masked(KeyId::HmacFile) {
                        self.hmac_file = Some(import_hmac(data)?);
                    }
                    if masked(KeyId::HmacFileWrite) || masked(KeyId::HmacFile) {
                        self.hmac_file_write = Some(import_hmac(data)?);
                    }
                }
                t if t == KeyId::HmacFileWrite as u8 => {
                    if masked(KeyId::HmacFileWrite) || masked(KeyId::HmacFile) {
                        self.hmac_file_write = Some(import_hmac(data)?);
                    }
                }
                t if t == KeyId::HmacChunk as u8 => {
                    if masked(KeyId::HmacChunk) {
                        self.hmac_chunk = Some(import_hmac(data)?);
                    }
                }
                t if t == KeyId::HmacName as u8 => {
                    if masked(KeyId::HmacName) {
                        self.hmac_name = Some(import_hmac(data)?);
                    }
                }
                t if t == KeyId::HmacCparams as u8 => {
                    if masked(KeyId::HmacCparams) {
                        self.hmac_cparams = Some(import_hmac(data)?);
                    }
                }
                t if t == KeyId::AuthPut as u8 => {
                    if masked(KeyId::AuthPut) {
                        self.auth_put = Some(import_hmac(data)?);
                    }
                }
                t if t == KeyId::AuthGet as u8 => {
                    if masked(KeyId::AuthGet) {
                        self.auth_get = Some(import_hmac(data)?);
                    }
                }
                t if t == KeyId::AuthDelete as u8 => {
                    if masked(KeyId::AuthDelete) {
                        self.auth_delete = Some(import_hmac(data)?);
                    }
                }
                other => return Err(KeyError::UnknownKeyType(other)),
            }
        }
        Ok(())
    }

    /// Export the masked keys as a blob stream, in ascending id order.
    pub fn export(&self, mask: KeyMask) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        for id in 0..32_u32 {
            if mask & (1 << id) == 0 {
                continue;
            }
            let data = match id {
                x if x == KeyId::SignPriv as u32 => {
                    export_rsa_priv(self.sign_priv.as_ref().ok_or(missing_name(KeyId::SignPriv))?)
                }
                x if x == KeyId::SignPub as u32 => {
                    export_rsa_pub(self.sign_pub.as_ref().ok_or(missing_name(KeyId::SignPub))?)
                }
                x if x == KeyId::EncrPriv as u32 => {
                    export_rsa_priv(self.encr_priv.as_ref().ok_or(missing_name(KeyId::EncrPriv))?)
                }
                x if x == KeyId::EncrPub as u32 => {
                    export_rsa_pub(self.encr_pub.as_ref().ok_or(missing_name(KeyId::EncrPub))?)
                }
                x if x == KeyId::RootPub as u32 => {
                    export_rsa_pub(self.root_pub.as_ref().ok_or(missing_name(KeyId::RootPub))?)
                }
                x if x == KeyId::HmacFile as u32 => Ok(self
                    .hmac_file
                    .as_ref()
                    .ok_or(missing_name(KeyId::HmacFile))?
                    .0
                    .to_vec()),
                x if x == KeyId::HmacFileWrite as u32 => Ok(self
                    .hmac_file_write
                    .as_ref()
                    .ok_or(missing_name(KeyId::HmacFileWrite))?
                    .0
                    .to_vec()),
                x if x == KeyId::HmacChunk as u32 => Ok(self
                    .hmac_chunk
                    .as_ref()
                    .ok_or(missing_name(KeyId::HmacChunk))?
                    .0
                    .to_vec()),
                x if x == KeyId::HmacName as u32 => Ok(self
                    .hmac_name
                    .as_ref()
                    .ok_or(missing_name(KeyId::HmacName))?
                    .0
                    .to_vec()),
                x if x == KeyId::HmacCparams as u32 => Ok(self
                    .hmac_cparams
                    .as_ref()
                    .ok_or(missing_name(KeyId::HmacCparams))?
                    .0
                    .to_vec()),
                x if x == KeyId::AuthPut as u32 => Ok(self
                    .auth_put
                    .as_ref()
                    .ok_or(missing_name(KeyId::AuthPut))?
                    .0
                    .to_vec()),
                x if x == KeyId::AuthGet as u32 => Ok(self
                    .auth_get
                    .as_ref()
                    .ok_or(missing_name(KeyId::AuthGet))?
                    .0
                    .to_vec()),
                x if x == KeyId::AuthDelete as u32 => Ok(self
                    .auth_delete
                    .as_ref()
                    .ok_or(missing_name(KeyId::AuthDelete))?
                    .0
                    .to_vec()),
                _ => continue,
            }?;
            let mut header = [0_u8; 5];
            LittleEndian::write_u32(&mut header[..4], data.len() as u32);
            header[4] = id as u8;
            out.extend_from_slice(&header);
            out.extend_from_slice(&data);
        }
        Ok(out)
    }

    /// Return the human-readable name of the first masked key that is not
    /// present, or `None` if all are available.
    pub fn missing(&self, mask: KeyMask) -> Option<&'static str> {
        for id in 0..32_u32 {
            if mask & (1 << id) == 0 {
                continue;
            }
            let absent = match id {
                x if x == KeyId::SignPriv as u32 => self.sign_priv.is_none(),
                x if x == KeyId::SignPub as u32 => self.sign_pub.is_none(),
                x if x == KeyId::EncrPriv as u32 => self.encr_priv.is_none(),
                x if x == KeyId::EncrPub as u32 => self.encr_pub.is_none(),
                x if x == KeyId::RootPub as u32 => self.root_pub.is_none(),
                x if x == KeyId::HmacFile as u32 => self.hmac_file.is_none(),
                x if x == KeyId::HmacFileWrite as u32 => self.hmac_file_write.is_none(),
                x if x == KeyId::HmacChunk as u32 => self.hmac_chunk.is_none(),
                x if x == KeyId::HmacName as u32 => self.hmac_name.is_none(),
                x if x == KeyId::HmacCparams as u32 => self.hmac_cparams.is_none(),
                x if x == KeyId::AuthPut as u32 => self.auth_put.is_none(),
                x if x == KeyId::AuthGet as u32 => self.auth_get.is_none(),
                x if x == KeyId::AuthDelete as u32 => self.auth_delete.is_none(),
                _ => false,
            };
            if absent {
                return Some(key_name(id as u8));
            }
        }
        None
    }

    /// Create fresh keys for the masked identifiers.  Requesting one half
    /// of an RSA pair without the other fails.
    pub fn generate(&mut self, mask: KeyMask) -> Result<()> {
        let mut mask = mask;

        if mask & MASK_SIGN_PRIV != 0 || mask & MASK_SIGN_PUB != 0 {
            if mask & MASK_SIGN_PRIV == 0 || mask & MASK_SIGN_PUB == 0 {
                return Err(KeyError::PairRequired);
            }
            let priv_key = rsa::generate()?;
            self.sign_pub = Some(rsa::public_from_private(&priv_key)?);
            self.sign_priv = Some(priv_key);
            mask &= !(MASK_SIGN_PRIV | MASK_SIGN_PUB);
        }

        if mask & MASK_ENCR_PRIV != 0 || mask & MASK_ENCR_PUB != 0 {
            if mask & MASK_ENCR_PRIV == 0 || mask & MASK_ENCR_PUB == 0 {
                return Err(KeyError::PairRequired);
            }
            let priv_key = rsa::generate()?;
            self.encr_pub = Some(rsa::public_from_private(&priv_key)?);
            self.encr_priv = Some(priv_key);
            mask &= !(MASK_ENCR_PRIV | MASK_ENCR_PUB);
        }

        if mask & MASK_HMAC_FILE != 0 {
            let key = HmacKey::generate()?;
            self.hmac_file_write = Some(key.clone());
            self.hmac_file = Some(key);
            mask &= !MASK_HMAC_FILE;
        }
        if mask & MASK_HMAC_FILE_WRITE != 0 {
            self.hmac_file_write = Some(HmacKey::generate()?);
            mask &= !MASK_HMAC_FILE_WRITE;
        }
        if mask & MASK_HMAC_CHUNK != 0 {
            self.hmac_chunk = Some(HmacKey::generate()?);
            mask &= !MASK_HMAC_CHUNK;
        }
        if mask & MASK_HMAC_NAME != 0 {
            self.hmac_name = Some(HmacKey::generate()?);
            mask &= !MASK_HMAC_NAME;
        }
        if mask & MASK_HMAC_CPARAMS != 0 {
            self.hmac_cparams = Some(HmacKey::generate()?);
            mask &= !MASK_HMAC_CPARAMS;
        }
        if mask & MASK_AUTH_PUT != 0 {
            self.auth_put = Some(HmacKey::generate()?);
            mask &= !MASK_AUTH_PUT;
        }
        if mask & MASK_AUTH_GET != 0 {
            self.auth_get = Some(HmacKey::generate()?);
            mask &= !MASK_AUTH_GET;
        }
        if mask & MASK_AUTH_DELETE != 0 {
            self.auth_delete = Some(HmacKey::generate()?);
            mask &= !MASK_AUTH_DELETE;
        }

        if mask & !MASK_ROOT_PUB != 0 {
            return Err(KeyError::UnknownKeyType((mask.trailing_zeros()) as u8));
        }
        trace!("generated fresh key material");
        Ok(())
    }

    /// Write the PUT, GET, and DELETE authorization keys into a fixed
    /// 96-byte buffer, in that order.
    pub fn raw_export_auth(&self) -> Result<[u8; 96]> {
        let mut out = [0_u8; 96];
        out[..32].copy_from_slice(&self.hmac(KeyId::AuthPut)?.0);
        out[32..64].copy_from_slice(&self.hmac(KeyId::AuthGet)?.0);
        out[64..].copy_from_slice(&self.hmac(KeyId::AuthDelete)?.0);
        Ok(out)
    }

    /// Look up an HMAC key by id.
    pub fn hmac(&self, id: KeyId) -> Result<&HmacKey> {
        let slot = match id {
            KeyId::HmacFile => &self.hmac_file,
            KeyId::HmacFileWrite => &self.hmac_file_write,
            KeyId::HmacChunk => &self.hmac_chunk,
            KeyId::HmacName => &self.hmac_name,
            KeyId::HmacCparams => &self.hmac_cparams,
            KeyId::AuthPut => &self.auth_put,
            KeyId::AuthGet => &self.auth_get,
            KeyId::AuthDelete => &self.auth_delete,
            _ => return Err(KeyError::Missing(key_name(id as u8))),
        };
        slot.as_ref().ok_or(KeyError::Missing(key_name(id as u8)))
    }

    /// HMAC `data` under the key identified by `id`.
    pub fn hash_data(&self, id: KeyId, data: &[u8]) -> Result<[u8; 32]> {
        Ok(hmac_sha256(&self.hmac(id)?.0, data))
    }

    /// HMAC the concatenation of two buffers under the key identified by
    /// `id`.
    pub fn hash_data_2(&self, id: KeyId, data0: &[u8], data1: &[u8]) -> Result<[u8; 32]> {
        Ok(hmac_sha256_2(&self.hmac(id)?.0, data0, data1))
    }

    pub fn sign_priv(&self) -> Result<&Rsa<Private>> {
        self.sign_priv
            .as_ref()
            .ok_or(KeyError::Missing(key_name(KeyId::SignPriv as u8)))
    }

    pub fn sign_pub(&self) -> Result<&Rsa<Public>> {
        self.sign_pub
            .as_ref()
            .ok_or(KeyError::Missing(key_name(KeyId::SignPub as u8)))
    }

    pub fn encr_priv(&self) -> Result<&Rsa<Private>> {
        self.encr_priv
            .as_ref()
            .ok_or(KeyError::Missing(key_name(KeyId::EncrPriv as u8)))
    }

    pub fn encr_pub(&self) -> Result<&Rsa<Public>> {
        self.encr_pub
            .as_ref()
            .ok_or(KeyError::Missing(key_name(KeyId::EncrPub as u8)))
    }

    pub fn root_pub(&self) -> Result<&Rsa<Public>> {
        self.root_pub
            .as_ref()
            .ok_or(KeyError::Missing(key_name(KeyId::RootPub as u8)))
    }

    /// Install a server root public key directly (the production build
    /// embeds the operator's key; tests install their own).
    pub fn set_root_pub(&mut self, key: Rsa<Public>) {
        self.root_pub = Some(key);
    }
}

fn missing_name(id: KeyId) -> KeyError {
    KeyError::Missing(key_name(id as u8))
}

fn key_name(id: u8) -> &'static str {
    match id {
        0 => "archive signing",
        1 => "archive signature verification",
        2 => "archive decryption",
        3 => "archive encryption",
        4 => "file HMAC",
        5 => "chunk HMAC",
        6 => "archive name HMAC",
        7 => "chunk randomization",
        9 => "server root",
        10 => "write authorization",
        11 => "read authorization",
        12 => "delete authorization",
        13 => "file write HMAC",
        _ => "unknown",
    }
}

fn import_hmac(data: &[u8]) -> Result<HmacKey> {
    if data.len() != 32 {
        return Err(KeyError::WrongSize(data.len()));
    }
    let mut key = [0_u8; 32];
    key.copy_from_slice(data);
    Ok(HmacKey(key))
}

/// RSA component streams: each component is a 32-bit little-endian length
/// followed by a big-endian magnitude.  Private keys carry
/// (n, e, d, p, q, dmp1, dmq1, iqmp); public keys carry (n, e).
fn read_bignum(buf: &mut &[u8]) -> Result<BigNum> {
    if buf.len() < 4 {
        return Err(KeyError::Truncated);
    }
    let len = LittleEndian::read_u32(&buf[..4]) as usize;
    *buf = &buf[4..];
    if len > buf.len() {
        return Err(KeyError::Truncated);
    }
    let bn = BigNum::from_slice(&buf[..len])?;
    *buf = &buf[len..];
    Ok(bn)
}

fn write_bignum(out: &mut Vec<u8>, bn: &openssl::bn::BigNumRef) {
    let bytes = bn.to_vec();
    let mut len = [0_u8; 4];
    LittleEndian::write_u32(&mut len, bytes.len() as u32);
    out.extend_from_slice(&len);
    out.extend_from_slice(&bytes);
}

fn import_rsa_priv(mut data: &[u8]) -> Result<Rsa<Private>> {
    let n = read_bignum(&mut data)?;
    let e = read_bignum(&mut data)?;
    let d = read_bignum(&mut data)?;
    let p = read_bignum(&mut data)?;
    let q = read_bignum(&mut data)?;
    let dmp1 = read_bignum(&mut data)?;
    let dmq1 = read_bignum(&mut data)?;
    let iqmp = read_bignum(&mut data)?;
    if !data.is_empty() {
        return Err(KeyError::Truncated);
    }
    Ok(Rsa::from_private_components(n, e, d, p, q, dmp1, dmq1, iqmp)?)
}

fn import_rsa_pub(mut data: &[u8]) -> Result<Rsa<Public>> {
    let n = read_bignum(&mut data)?;
    let e = read_bignum(&mut data)?;
    if !data.is_empty() {
        return Err(KeyError::Truncated);
    }
    Ok(Rsa::from_public_components(n, e)?)
}

fn export_rsa_priv(key: &Rsa<Private>) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    write_bignum(&mut out, key.n());
    write_bignum(&mut out, key.e());
    write_bignum(&mut out, key.d());
    write_bignum(&mut out, key.p().ok_or(KeyError::Missing("RSA private components"))?);
    write_bignum(&mut out, key.q().ok_or(KeyError::Missing("RSA private components"))?);
    write_bignum(&mut out, key.dmp1().ok_or(KeyError::Missing("RSA private components"))?);
    write_bignum(&mut out, key.dmq1().ok_or(KeyError::Missing("RSA private components"))?);
    write_bignum(&mut out, key.iqmp().ok_or(KeyError::Missing("RSA private components"))?);
    Ok(out)
}

fn export_rsa_pub<T: HasPublic>(key: &Rsa<T>) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    write_bignum(&mut out, key.n());
    write_bignum(&mut out, key.e());
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_export_import_round_trip() {
        let mut keys = KeySet::new();
        keys.generate(MASK_USER & !MASK_ROOT_PUB).unwrap();
        assert_eq!(keys.missing(MASK_USER & !MASK_ROOT_PUB), None);

        let blob = keys.export(MASK_USER & !MASK_ROOT_PUB).unwrap();
        let mut imported = KeySet::new();
        imported.import(&blob, MASK_USER).unwrap();

        assert_eq!(
            keys.hmac(KeyId::HmacChunk).unwrap().0,
            imported.hmac(KeyId::HmacChunk).unwrap().0
        );
        // The file-write slot is aliased from the file key on import.
        assert_eq!(
            imported.hmac(KeyId::HmacFile).unwrap().0,
            imported.hmac(KeyId::HmacFileWrite).unwrap().0
        );
        // The RSA pairs survive the component serialization.
        let msg = b"serialization check";
        let sig = rsa::sign(keys.sign_priv().unwrap(), msg).unwrap();
        rsa::verify(imported.sign_pub().unwrap(), msg, &sig).unwrap();
    }

    #[test]
    fn import_respects_mask() {
        let mut keys = KeySet::new();
        keys.generate(MASK_USER & !MASK_ROOT_PUB).unwrap();
        let blob = keys.export(MASK_USER & !MASK_ROOT_PUB).unwrap();

        let mut readonly = KeySet::new();
        readonly.import(&blob, MASK_READ).unwrap();
        assert_eq!(readonly.missing(MASK_READ), None);
        assert!(readonly.missing(MASK_WRITE).is_some());
        assert!(readonly.hmac(KeyId::AuthPut).is_err());
    }

    #[test]
    fn missing_names_are_human_readable() {
        let keys = KeySet::new();
        assert_eq!(keys.missing(MASK_HMAC_CHUNK), Some("chunk HMAC"));
        assert_eq!(keys.missing(MASK_AUTH_DELETE), Some("delete authorization"));
    }

    #[test]
    fn half_pair_generation_fails() {
        let mut keys = KeySet::new();
        assert!(matches!(
            keys.generate(MASK_SIGN_PRIV),
            Err(KeyError::PairRequired)
        ));
        assert!(matches!(
            keys.generate(MASK_ENCR_PUB),
            Err(KeyError::PairRequired)
        ));
    }

    #[test]
    fn raw_auth_export_layout() {
        let mut keys = KeySet::new();
        keys.generate(MASK_AUTH_PUT | MASK_AUTH_GET | MASK_AUTH_DELETE)
            .unwrap();
        let buf = keys.raw_export_auth().unwrap();
        assert_eq!(&buf[..32], &keys.hmac(KeyId::AuthPut).unwrap().0);
        assert_eq!(&buf[32..64], &keys.hmac(KeyId::AuthGet).unwrap().0);
        assert_eq!(&buf[64..], &keys.hmac(KeyId::AuthDelete).unwrap().0);
    }

    #[test]
    fn truncated_blob_rejected() {
        let mut keys = KeySet::new();
        let mut blob = vec![0_u8; 5];
        LittleEndian::write_u32(&mut blob[..4], 64);
        blob[4] = KeyId::HmacChunk as u8;
        assert!(matches!(
            keys.import(&blob, MASK_USER),
            Err(KeyError::Truncated)
        ));
    }

    #[test]
    fn unknown_key_type_rejected() {
        let mut keys = KeySet::new();
        let mut blob = vec![0_u8; 37];
        LittleEndian::write_u32(&mut blob[..4], 32);
        blob[4] = 0x77;
        assert!(matches!(
            keys.import(&blob, MASK_USER),
            Err(KeyError::UnknownKeyType(0x77))
        ));
    }
}
