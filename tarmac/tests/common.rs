//! Shared helpers for the integration suites.

use std::path::Path;
use std::rc::Rc;

use tarmac::multitape::write::Mode;
use tarmac::multitape::TapeWriter;
use tarmac::netpacket::loopback::LoopbackServer;
use tarmac::storage::WriteLimits;
use tarmac_core::keys::{KeySet, MASK_ROOT_PUB, MASK_USER};

pub const MACHINENUM: u64 = 0xfeed;

/// A complete user key set (the root key only matters for real TCP
/// handshakes, which these suites do not perform).
pub fn full_keys() -> KeySet {
    let mut keys = KeySet::new();
    keys.generate(MASK_USER & !MASK_ROOT_PUB).unwrap();
    keys
}

pub fn server(keys: &KeySet) -> LoopbackServer {
    LoopbackServer::new(MACHINENUM, keys)
}

/// Write one archive whose entries are (header, body) pairs, and commit
/// it.
pub fn write_archive(
    server: &LoopbackServer,
    keys: &KeySet,
    cachedir: &Path,
    name: &str,
    entries: &[(&[u8], &[u8])],
) {
    let mut tape = TapeWriter::open(
        Rc::new(server.clone()),
        keys,
        MACHINENUM,
        cachedir,
        name,
        vec!["create".to_owned()],
        false,
        WriteLimits::default(),
    )
    .unwrap();
    for (header, body) in entries {
        tape.set_mode(Mode::Header).unwrap();
        tape.write(header).unwrap();
        tape.set_mode(Mode::Data).unwrap();
        tape.write(body).unwrap();
        tape.set_mode(Mode::EndOfEntry).unwrap();
    }
    tape.close().unwrap();
}

/// Extract an archive into a byte buffer.
pub fn extract_archive(
    server: &LoopbackServer,
    keys: &KeySet,
    name: &str,
) -> Result<Vec<u8>, tarmac::multitape::MultitapeError> {
    let mut out = Vec::new();
    tarmac::multitape::extract_tape(
        Box::new(server.clone()),
        keys,
        MACHINENUM,
        name,
        &mut out,
    )?;
    Ok(out)
}

/// The byte stream an archive of `entries` should reproduce.
pub fn expected_stream(entries: &[(&[u8], &[u8])]) -> Vec<u8> {
    let mut out = Vec::new();
    for (header, body) in entries {
        out.extend_from_slice(header);
        out.extend_from_slice(body);
    }
    out
}
