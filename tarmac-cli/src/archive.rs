//! Archive commands: create, extract, list, delete, fsck, nuke, stats.

use anyhow::{anyhow, Context, Result};
use chrono::{TimeZone, Utc};

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

use tarmac::chunks::directory::ChunkDirectory;
use tarmac::chunks::ChunkStats;
use tarmac::multitape::write::Mode;
use tarmac::multitape::{self, TapeWriter};
use tarmac::storage::{StopRequest, WriteLimits};
use tarmac_core::keys::{MASK_DELETE, MASK_READ, MASK_WRITE};

use crate::cli::Opt;
use crate::keys::{dialer, load};

fn write_limits(options: &Opt) -> WriteLimits {
    WriteLimits {
        aggressive: options.aggressive,
        max_bytes_out: options.maxbw,
        checkpoint_bytes: options.checkpoint_bytes,
    }
}

fn print_chunk_stats(stats: &ChunkStats) {
    println!("                       All archives  Unique data");
    println!(
        "Total size        {:>16}  {:>12}",
        stats.total_bytes, stats.unique_bytes
    );
    println!(
        "Compressed size   {:>16}  {:>12}",
        stats.total_compressed, stats.unique_compressed
    );
    println!(
        "Chunk count       {:>16}  {:>12}",
        stats.total_chunks, stats.unique_chunks
    );
    println!("Metadata bytes    {:>16}", stats.extra_bytes);
}

/// Create an archive from an input stream.
pub fn create(
    options: &Opt,
    archive: &str,
    input: Option<&Path>,
    dry_run: bool,
    print_stats: bool,
) -> Result<()> {
    let (keys, machinenum) = load(options, MASK_WRITE)?;
    let dialer = dialer(options, &keys)?;

    let mut source: Box<dyn Read> = match input {
        Some(path) => Box::new(
            File::open(path).with_context(|| format!("cannot open {}", path.display()))?,
        ),
        None => Box::new(io::stdin()),
    };

    let args: Vec<String> = std::env::args().collect();
    let mut tape = TapeWriter::open(
        dialer,
        &keys,
        machinenum,
        &options.cachedir,
        archive,
        args,
        dry_run,
        write_limits(options),
    )
    .map_err(|e| anyhow!("cannot create archive: {}", e))?;

    // The stream is archived as a single opaque entry; entry structure
    // is the concern of whatever produced the stream.
    tape.set_mode(Mode::Header)
        .map_err(|e| anyhow!("archive setup failed: {}", e))?;
    tape.set_mode(Mode::Data)
        .map_err(|e| anyhow!("archive setup failed: {}", e))?;

    let mut buf = vec![0_u8; 65536];
    loop {
        let n = source.read(&mut buf).context("cannot read input stream")?;
        if n == 0 {
            break;
        }
        tape.write(&buf[..n])
            .map_err(|e| anyhow!("archive write failed: {}", e))?;

        match tape.poll_stop() {
            Some(StopRequest::Budget) => {
                tracing::warn!("byte budget exhausted; truncating archive");
                tape.truncate();
                break;
            }
            Some(StopRequest::Checkpoint) => {
                tape.checkpoint()
                    .map_err(|e| anyhow!("checkpoint failed: {}", e))?;
            }
            None => {}
        }
    }

    tape.set_mode(Mode::EndOfEntry)
        .map_err(|e| anyhow!("archive close failed: {}", e))?;
    let stats = tape
        .close()
        .map_err(|e| anyhow!("archive close failed: {}", e))?;
    if print_stats {
        print_chunk_stats(&stats);
    }
    Ok(())
}

/// Write an archive's byte stream back out.
pub fn extract(options: &Opt, archive: &str, output: Option<&Path>) -> Result<()> {
    let (keys, machinenum) = load(options, MASK_READ)?;
    let dialer = dialer(options, &keys)?;

    let mut sink: Box<dyn Write> = match output {
        Some(path) => Box::new(
            File::create(path).with_context(|| format!("cannot create {}", path.display()))?,
        ),
        None => Box::new(io::stdout()),
    };

    multitape::extract_tape(Box::new(dialer), &keys, machinenum, archive, &mut sink)
        .map_err(|e| anyhow!("extract failed: {}", e))?;
    sink.flush().context("cannot flush output")?;
    Ok(())
}

/// List archives with their creation times.
pub fn list(options: &Opt) -> Result<()> {
    let (keys, machinenum) = load(options, MASK_READ)?;
    let dialer = dialer(options, &keys)?;

    let mut tapes = multitape::list_tapes(Box::new(dialer), &keys, machinenum)
        .map_err(|e| anyhow!("cannot list archives: {}", e))?;
    tapes.sort_by(|a, b| a.name.cmp(&b.name));
    for tape in tapes {
        let when = Utc
            .timestamp_opt(tape.ctime as i64, 0)
            .single()
            .map_or_else(|| "-".to_owned(), |t| t.format("%Y-%m-%d %H:%M:%S").to_string());
        println!("{}\t{}", tape.name, when);
    }
    Ok(())
}

/// Delete an archive.
pub fn delete(options: &Opt, archive: &str, print_stats: bool) -> Result<()> {
    let (keys, machinenum) = load(options, MASK_DELETE)?;
    let dialer = dialer(options, &keys)?;

    let stats = multitape::delete::delete_tape(
        dialer,
        &keys,
        machinenum,
        &options.cachedir,
        archive,
    )
    .map_err(|e| anyhow!("delete failed: {}", e))?;
    if print_stats {
        print_chunk_stats(&stats);
    }
    Ok(())
}

/// Verify server state and rebuild the chunk directory.
pub fn fsck(options: &Opt, prune: bool) -> Result<()> {
    let (keys, machinenum) = load(options, MASK_DELETE)?;
    let dialer = dialer(options, &keys)?;

    multitape::fsck::fsck(dialer, &keys, machinenum, &options.cachedir, prune)
        .map_err(|e| anyhow!("fsck failed: {}", e))?;
    Ok(())
}

/// Delete everything this machine has stored.
pub fn nuke(options: &Opt) -> Result<()> {
    let (keys, machinenum) = load(options, MASK_DELETE)?;

    // An irreversible operation wants explicit confirmation.
    eprint!("Type 'No Tomorrow' to delete every archive: ");
    io::stderr().flush().ok();
    let mut answer = String::new();
    io::stdin()
        .read_line(&mut answer)
        .context("cannot read confirmation")?;
    if answer.trim() != "No Tomorrow" {
        anyhow::bail!("not confirmed; nothing deleted");
    }

    let dialer = dialer(options, &keys)?;
    multitape::delete::nuke(dialer, &keys, machinenum, &options.cachedir)
        .map_err(|e| anyhow!("nuke failed: {}", e))?;
    Ok(())
}

/// Print statistics from the local chunk directory.
pub fn print_stats(options: &Opt) -> Result<()> {
    let dir = ChunkDirectory::open(&options.cachedir)
        .map_err(|e| anyhow!("cannot open cache directory: {}", e))?;

    let mut stats = ChunkStats::default();
    for (_, record) in dir.iter() {
        for _ in 0..record.nrefs {
            stats.total_chunks += 1;
            stats.total_bytes += u64::from(record.len);
            stats.total_compressed += u64::from(record.zlen);
        }
        stats.unique_chunks += 1;
        stats.unique_bytes += u64::from(record.len);
        stats.unique_compressed += u64::from(record.zlen);
    }
    print_chunk_stats(&stats);
    Ok(())
}
