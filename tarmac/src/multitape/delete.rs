//! Deleting archives, and the nuclear option.

use tracing::info;

use std::path::Path;
use std::rc::Rc;

use tarmac_core::keys::KeySet;

use crate::chunks::directory::ChunkDirectory;
use crate::chunks::{ChunkStats, ChunksDeleter, ChunksReader};
use crate::netpacket::Dialer;
use crate::storage::directory::directory_read;
use crate::storage::{
    StorageDeleter, StorageReader, TxnType, CLASS_CHUNK, CLASS_METADATA, CLASS_METAINDEX,
};

use super::chunkiter::iterate_tape;
use super::{metadata, metaindex, state, Result, MAXCHUNK};

/// Delete the named archive: drop every chunk reference it holds, remove
/// its metaindex and metadata files, and commit.
pub fn delete_tape(
    dialer: Rc<dyn Dialer>,
    keys: &KeySet,
    machinenum: u64,
    cachedir: &Path,
    name: &str,
) -> Result<ChunkStats> {
    let factory = {
        let dialer = Rc::clone(&dialer);
        move || Box::new(Rc::clone(&dialer)) as Box<dyn Dialer>
    };
    state::cleanstate(&factory, keys, cachedir, machinenum, 1)?;
    let lastseq = state::sequence(cachedir)?;

    let storage_r = StorageReader::new(Box::new(Rc::clone(&dialer)), keys, machinenum);
    let mut chunks_r = ChunksReader::new(keys, storage_r, MAXCHUNK as usize);
    let md = metadata::get_by_name(chunks_r.storage_mut(), keys, name)?;

    let storage_d = StorageDeleter::start(
        Box::new(Rc::clone(&dialer)),
        keys,
        machinenum,
        &lastseq,
        TxnType::Delete,
    )?;
    let mut deleter = ChunksDeleter::start(cachedir, storage_d)?;

    iterate_tape(&mut chunks_r, keys, &md, &mut |ch| {
        deleter.delete_chunk(&ch.hash).map_err(Into::into)
    })?;
    metaindex::delete(&mut deleter, keys, &md)?;
    metadata::delete(&mut deleter, keys, &md)?;

    let seqnum = deleter.storage_mut().seqnum();
    let whichkey = deleter.storage_mut().whichkey();
    let stats = deleter.end()?;

    state::write_marker(cachedir, &seqnum, whichkey)?;
    state::commit(
        Box::new(dialer),
        keys,
        cachedir,
        machinenum,
        &seqnum,
        whichkey,
    )?;
    info!(name, "archive deleted");
    Ok(stats)
}

/// Delete every file of every class this machine has stored, and reset
/// the local cache directory to match.
pub fn nuke(
    dialer: Rc<dyn Dialer>,
    keys: &KeySet,
    machinenum: u64,
    cachedir: &Path,
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
    deleter.directory_mut().clear();

    for class in [CLASS_METADATA, CLASS_METAINDEX, CLASS_CHUNK] {
        let names = directory_read(
            deleter.storage_mut().conn_mut(),
            keys,
            machinenum,
            class,
            true,
            [0; 32],
        )?;
        for name in names {
            deleter.storage_mut().delete_file(class, &name)?;
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

    // Nothing is left server-side; the directory must agree.
    let mut dir = ChunkDirectory::open(cachedir)?;
    dir.clear();
    dir.save_direct()?;
    info!("all stored data deleted");
    Ok(())
}
