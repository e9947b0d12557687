//! Reading and writing the on-disk key file.
//!
//! Format: an 8-byte big-endian machine number followed by the key blob
//! stream understood by [`KeySet::import`].  (An optional passphrase
//! wrapper around the whole payload is applied by an outer tool and is not
//! handled here.)

use byteorder::{BigEndian, ByteOrder};
use thiserror::Error;
use tracing::debug;

use std::fs;
use std::io;
use std::path::Path;

use crate::keys::{KeyError, KeyMask, KeySet};

#[derive(Error, Debug)]
pub enum KeyfileError {
    #[error("key file is too short")]
    Truncated,
    #[error("key file I/O failed")]
    Io(#[from] io::Error),
    #[error("key data is invalid")]
    Key(#[from] KeyError),
}

type Result<T> = std::result::Result<T, KeyfileError>;

/// Read a key file, importing the masked keys into `keys`; returns the
/// machine number.
pub fn read<P: AsRef<Path>>(path: P, keys: &mut KeySet, mask: KeyMask) -> Result<u64> {
    let buf = fs::read(path.as_ref())?;
    if buf.len() < 8 {
        return Err(KeyfileError::Truncated);
    }
    let machinenum = BigEndian::read_u64(&buf[..8]);
    keys.import(&buf[8..], mask)?;
    debug!(machinenum, "read key file");
    Ok(machinenum)
}

/// Write a key file containing the masked keys for the given machine.
pub fn write<P: AsRef<Path>>(
    path: P,
    keys: &KeySet,
    mask: KeyMask,
    machinenum: u64,
) -> Result<()> {
    let blob = keys.export(mask)?;
    let mut buf = Vec::with_capacity(8 + blob.len());
    let mut header = [0_u8; 8];
    BigEndian::write_u64(&mut header, machinenum);
    buf.extend_from_slice(&header);
    buf.extend_from_slice(&blob);
    fs::write(path.as_ref(), &buf)?;
    debug!(machinenum, "wrote key file");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{KeyId, MASK_ROOT_PUB, MASK_USER};

    #[test]
    fn round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.key");

        let mut keys = KeySet::new();
        keys.generate(MASK_USER & !MASK_ROOT_PUB).unwrap();
        write(&path, &keys, MASK_USER & !MASK_ROOT_PUB, 0x1122_3344_5566_7788).unwrap();

        let mut loaded = KeySet::new();
        let machinenum = read(&path, &mut loaded, MASK_USER).unwrap();
        assert_eq!(machinenum, 0x1122_3344_5566_7788);
        assert_eq!(
            keys.hmac(KeyId::HmacName).unwrap().0,
            loaded.hmac(KeyId::HmacName).unwrap().0
        );
    }

    #[test]
    fn short_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.key");
        fs::write(&path, [0_u8; 4]).unwrap();
        let mut keys = KeySet::new();
        assert!(matches!(
            read(&path, &mut keys, MASK_USER),
            Err(KeyfileError::Truncated)
        ));
    }
}
