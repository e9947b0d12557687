//! Rebuilding the local chunk directory from the server's authoritative
//! state.

use tracing::{info, warn};

use std::collections::HashSet;
use std::path::Path;
use std::rc::Rc;

use tarmac_core::keys::KeySet;

use crate::chunks::{ChunksDeleter, ChunksReader};
use crate::netpacket::Dialer;
use crate::storage::directory::directory_read;
use crate::storage::{
    StorageDeleter, StorageReader, TxnType, CLASS_CHUNK, CLASS_METADATA, CLASS_METAINDEX,
};

use super::chunkiter::iterate_tape;
use super::{metadata, metaindex, state, MultitapeError, Result, MAXCHUNK};

/// Verify the server's state against every archive and regenerate the
/// chunk directory from scratch.
///
/// Every archive's metadata is read and verified, its chunk graph is
/// walked to rebuild reference counts, and the server's chunk list is
/// checked both ways: a referenced-but-missing chunk is an integrity
/// error; unreferenced files are reported, and deleted when `prune` is
/// set.  On success the directory and sequence number are written fresh.
pub fn fsck(
    dialer: Rc<dyn Dialer>,
    keys: &KeySet,
    machinenum: u64,
    cachedir: &Path,
    prune: bool,
) -> Result<()> {
    let lastseq = state::sequence(cachedir)?;

    let storage_d = StorageDeleter::start(
        Box::new(Rc::clone(&dialer)),
        keys,
        machinenum,
        &lastseq,
        TxnType::Fsck,
    )?;
    let mut deleter = ChunksDeleter::start(cachedir, storage_d)?;
    // Zero state: refcounts are rebuilt from the archives alone.
    deleter.directory_mut().clear();

    let storage_r = StorageReader::new(Box::new(Rc::clone(&dialer)), keys, machinenum);
    let mut chunks_r = ChunksReader::new(keys, storage_r, MAXCHUNK as usize);

    // Walk every archive.
    let mlist = directory_read(
        deleter.storage_mut().conn_mut(),
        keys,
        machinenum,
        CLASS_METADATA,
        true,
        [0; 32],
    )?;
    let mut expected_index: HashSet<[u8; 32]> = HashSet::new();
    for mhash in &mlist {
        let md = match metadata::get_by_hash(chunks_r.storage_mut(), keys, mhash) {
            Ok(md) => md,
            Err(MultitapeError::Corrupt) => {
                warn!(hash = %hex::encode(mhash), "archive metadata is corrupt");
                if prune {
                    deleter.storage_mut().delete_file(CLASS_METADATA, mhash)?;
                    continue;
                }
                return Err(MultitapeError::Corrupt);
            }
            Err(e) => return Err(e),
        };
        info!(name = %md.name, "checking archive");

        let nfrags = (md.indexlen as usize + metaindex::MAXIFRAG - 1) / metaindex::MAXIFRAG;
        for i in 0..nfrags.max(1) {
            expected_index.insert(metaindex::frag_name(&md.indexhash, i));
        }

        iterate_tape(&mut chunks_r, keys, &md, &mut |ch| {
            deleter
                .directory_mut()
                .insert_committed(ch.hash, ch.len, ch.zlen, 1);
            Ok(())
        })?;
    }

    // Check the chunk class both ways.
    let clist = directory_read(
        deleter.storage_mut().conn_mut(),
        keys,
        machinenum,
        CLASS_CHUNK,
        true,
        [0; 32],
    )?;
    let stored: HashSet<[u8; 32]> = clist.iter().copied().collect();
    for (hash, _) in deleter.directory_mut().iter() {
        if !stored.contains(hash) {
            warn!(hash = %hex::encode(hash), "referenced chunk missing from server");
            return Err(MultitapeError::Corrupt);
        }
    }
    let orphans: Vec<[u8; 32]> = clist
        .iter()
        .filter(|name| deleter.directory_mut().get(name).is_none())
        .copied()
        .collect();
    for name in &orphans {
        if prune {
            warn!(hash = %hex::encode(name), "deleting unreferenced chunk");
            deleter.storage_mut().delete_file(CLASS_CHUNK, name)?;
        } else {
            warn!(hash = %hex::encode(name), "unreferenced chunk on server");
        }
    }

    // And the metaindex class.
    let ilist = directory_read(
        deleter.storage_mut().conn_mut(),
        keys,
        machinenum,
        CLASS_METAINDEX,
        true,
        [0; 32],
    )?;
    for name in &ilist {
        if !expected_index.contains(name) {
            if prune {
                warn!(hash = %hex::encode(name), "deleting unreferenced metaindex file");
                deleter.storage_mut().delete_file(CLASS_METAINDEX, name)?;
            } else {
                warn!(hash = %hex::encode(name), "unreferenced metaindex file on server");
            }
        }
    }

    let seqnum = deleter.storage_mut().seqnum();
    let whichkey = deleter.storage_mut().whichkey();
    deleter.end()?;

    state::write_marker(cachedir, &seqnum, whichkey)?;
    state::commit(
        Box::new(dialer),
        keys,
        cachedir,
        machinenum,
        &seqnum,
        whichkey,
    )?;
    info!(archives = mlist.len(), "fsck complete");
    Ok(())
}
