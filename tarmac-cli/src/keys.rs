//! Key file loading and the `keymgmt` command.

use anyhow::{anyhow, bail, Context, Result};

use std::path::Path;
use std::rc::Rc;

use tarmac::netpacket::Dialer;
use tarmac::netproto::TcpDialer;
use tarmac_core::keys::{
    keyfile, KeyMask, KeySet, MASK_DELETE, MASK_READ, MASK_USER, MASK_WRITE,
};

use crate::cli::Opt;

/// Load the key file named by the options, checking that the keys in
/// `need` are present.
pub fn load(options: &Opt, need: KeyMask) -> Result<(KeySet, u64)> {
    let mut keys = KeySet::new();
    let machinenum = keyfile::read(&options.keyfile, &mut keys, MASK_USER)
        .with_context(|| format!("cannot read key file {}", options.keyfile.display()))?;
    if let Some(name) = keys.missing(need) {
        bail!(
            "the {} key is required for this operation but not present in {}",
            name,
            options.keyfile.display()
        );
    }
    Ok((keys, machinenum))
}

/// A dialer for the configured server endpoint.
pub fn dialer(options: &Opt, keys: &KeySet) -> Result<Rc<dyn Dialer>> {
    let (host, port) = options.server_endpoint()?;
    let useragent = format!("tarmac/{}", env!("CARGO_PKG_VERSION"));
    let dialer = TcpDialer::new(&host, port, &useragent, keys)
        .map_err(|e| anyhow!("cannot prepare server connection: {}", e))?;
    Ok(Rc::new(dialer))
}

/// Write a key file holding a subset of another's keys.
pub fn keymgmt(
    outkeyfile: &Path,
    read_only: bool,
    write_only: bool,
    delete_only: bool,
    source: &Path,
) -> Result<()> {
    let mask = match (read_only, write_only, delete_only) {
        (false, false, false) => MASK_USER,
        (true, false, false) => MASK_READ,
        (false, true, false) => MASK_WRITE,
        (false, false, true) => MASK_DELETE,
        _ => bail!("at most one of --read-only, --write-only, --delete-only may be given"),
    };

    let mut keys = KeySet::new();
    let machinenum = keyfile::read(source, &mut keys, mask)
        .with_context(|| format!("cannot read key file {}", source.display()))?;
    // Older key files carry no server root key; a full copy passes it
    // through only when present.
    let mask = if mask == MASK_USER && keys.missing(tarmac_core::keys::MASK_ROOT_PUB).is_some() {
        mask & !tarmac_core::keys::MASK_ROOT_PUB
    } else {
        mask
    };
    if let Some(name) = keys.missing(mask) {
        bail!("source key file lacks the {} key", name);
    }
    keyfile::write(outkeyfile, &keys, mask, machinenum)
        .with_context(|| format!("cannot write key file {}", outkeyfile.display()))?;
    println!("wrote {}", outkeyfile.display());
    Ok(())
}
