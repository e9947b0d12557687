//! Machine registration: `keygen` and `keyregen`.

use anyhow::{anyhow, bail, Context, Result};

use std::fs;
use std::path::Path;

use tarmac::netpacket::packets::{Request, Response};
use tarmac::netpacket::PacketConn;
use tarmac_core::crypto::{dh, hash::sha256};
use tarmac_core::keys::{
    keyfile, KeySet, MASK_ROOT_PUB, MASK_USER,
};

use crate::cli::Opt;
use crate::keys::dialer;

/// Run the registration handshake: ask for a challenge, derive the
/// shared key from the account password, and submit this machine's
/// authorization keys.  Returns the machine number the server assigned.
fn register_machine(
    options: &Opt,
    keys: &KeySet,
    user: &str,
    machine: &str,
) -> Result<u64> {
    let passwd = rpassword::prompt_password(format!("Password for {}: ", user))
        .context("cannot read password")?;

    let dialer = dialer(options, keys)?;
    let mut conn = PacketConn::open(Box::new(dialer));

    let challenge = conn
        .call(
            keys,
            Request::RegisterRequest {
                user: user.to_owned(),
            },
        )
        .map_err(|e| anyhow!("registration failed: {}", e))?;
    let (salt, server_pub) = match challenge {
        Response::RegisterChallenge { salt, server_pub } => (salt, server_pub),
        _ => bail!("registration failed: unexpected server response"),
    };
    dh::sanity_check(&server_pub).map_err(|_| anyhow!("server key exchange value is invalid"))?;

    // The shared secret is rooted in the account password: the private
    // exponent is HMAC(salt, password).
    let (_, priv_key) = dh::passwd_to_dh(passwd.as_bytes(), &salt)?;
    let k = dh::compute(&server_pub, &priv_key)?;
    let register_key = sha256(&k);

    let auth_keys = keys.raw_export_auth()?;
    let resp = conn
        .call(
            keys,
            Request::RegisterChaResponse {
                auth_keys,
                name: machine.to_owned(),
                register_key,
            },
        )
        .map_err(|e| anyhow!("registration failed: {}", e))?;
    match resp {
        Response::Register {
            status: 0,
            machinenum,
        } => Ok(machinenum),
        Response::Register { status: 1, .. } => bail!("no such user: {}", user),
        Response::Register { status: 2, .. } => bail!("incorrect password"),
        Response::Register { status: 3, .. } => {
            bail!("account balance is not positive; add funds and try again")
        }
        _ => bail!("registration failed: unexpected server response"),
    }
}

/// Generate a fresh key set, register the machine, and write the key
/// file.
pub fn keygen(options: &Opt, user: &str, machine: &str, root_key: Option<&Path>) -> Result<()> {
    let mut keys = KeySet::new();
    keys.generate(MASK_USER & !MASK_ROOT_PUB)
        .context("key generation failed")?;

    let mut mask = MASK_USER & !MASK_ROOT_PUB;
    if let Some(path) = root_key {
        let blob = fs::read(path)
            .with_context(|| format!("cannot read root key {}", path.display()))?;
        keys.import(&blob, MASK_ROOT_PUB)
            .context("root key blob is invalid")?;
        mask |= MASK_ROOT_PUB;
    }

    let machinenum = register_machine(options, &keys, user, machine)?;
    keyfile::write(&options.keyfile, &keys, mask, machinenum)
        .with_context(|| format!("cannot write key file {}", options.keyfile.display()))?;
    println!(
        "registered machine {:#018x}; keys written to {}",
        machinenum,
        options.keyfile.display()
    );
    println!("KEEP A COPY OF THIS FILE SOMEWHERE SAFE: without it your archives are unreadable.");
    Ok(())
}

/// Generate a fresh key set for an existing machine number, re-running
/// the registration handshake to install the new authorization keys.
pub fn keyregen(options: &Opt, oldkey: &Path, user: &str, machine: &str) -> Result<()> {
    let mut old = KeySet::new();
    let machinenum = keyfile::read(oldkey, &mut old, MASK_USER)
        .with_context(|| format!("cannot read key file {}", oldkey.display()))?;

    let mut keys = KeySet::new();
    keys.generate(MASK_USER & !MASK_ROOT_PUB)
        .context("key generation failed")?;
    // The server root key carries over; it identifies the service, not
    // the machine.
    let mut mask = MASK_USER & !MASK_ROOT_PUB;
    if let Ok(blob) = old.export(MASK_ROOT_PUB) {
        keys.import(&blob, MASK_ROOT_PUB)?;
        mask |= MASK_ROOT_PUB;
    }

    let newnum = register_machine(options, &keys, user, machine)?;
    if newnum != machinenum {
        tracing::warn!(
            old = machinenum,
            new = newnum,
            "server assigned a different machine number"
        );
    }
    keyfile::write(&options.keyfile, &keys, mask, newnum)
        .with_context(|| format!("cannot write key file {}", options.keyfile.display()))?;
    println!("new keys written to {}", options.keyfile.display());
    Ok(())
}
