//! End-to-end archive scenarios over the loopback server.

mod common;

use common::{expected_stream, extract_archive, full_keys, server, write_archive, MACHINENUM};

use std::rc::Rc;

use tarmac::multitape::{self, MultitapeError};
use tarmac::storage::{CLASS_CHUNK, CLASS_METADATA, CLASS_METAINDEX};

fn body(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 256) as u8).collect()
}

#[test]
fn two_entry_archive_layout_and_round_trip() {
    let keys = full_keys();
    let server = server(&keys);
    let cachedir = tempfile::tempdir().unwrap();

    let small = body(100);
    let large = body(200_000);
    let entries: &[(&[u8], &[u8])] = &[(b"header-one", &small), (b"header-two", &large)];
    write_archive(&server, &keys, cachedir.path(), "two-files", entries);

    // Exactly one metadata file and one metaindex file.
    assert_eq!(server.count_files(CLASS_METADATA), 1);
    assert_eq!(server.count_files(CLASS_METAINDEX), 1);
    // Chunks exist: the large body's chunks plus the stream chunks.  The
    // small body lives in the trailer stream, not in chunks of its own.
    assert!(server.count_files(CLASS_CHUNK) >= 2);

    let out = extract_archive(&server, &keys, "two-files").unwrap();
    assert_eq!(out, expected_stream(entries));
}

#[test]
fn small_entry_lands_in_trailer_stream() {
    let keys = full_keys();
    let server = server(&keys);
    let cachedir = tempfile::tempdir().unwrap();

    // A single sub-threshold entry: its body must not become a chunk, so
    // the only stored chunks are stream chunks (H and T; C is empty).
    let small = body(100);
    let entries: &[(&[u8], &[u8])] = &[(b"hdr", &small)];
    write_archive(&server, &keys, cachedir.path(), "tiny", entries);

    let nchunks = server.count_files(CLASS_CHUNK);
    assert_eq!(nchunks, 2, "expected only H and T stream chunks");

    let out = extract_archive(&server, &keys, "tiny").unwrap();
    assert_eq!(out, expected_stream(entries));
}

#[test]
fn second_archive_fully_deduplicates() {
    let keys = full_keys();
    let server = server(&keys);
    let cachedir = tempfile::tempdir().unwrap();

    let large = body(200_000);
    let entries: &[(&[u8], &[u8])] = &[(b"same-header", &large)];

    write_archive(&server, &keys, cachedir.path(), "first", entries);
    let chunks_before = server.count_files(CLASS_CHUNK);

    write_archive(&server, &keys, cachedir.path(), "second", entries);
    let chunks_after = server.count_files(CLASS_CHUNK);

    // Identical content: every chunk, including the stream chunks, is
    // already stored.
    assert_eq!(chunks_before, chunks_after);
    // But each archive has its own metadata and metaindex.
    assert_eq!(server.count_files(CLASS_METADATA), 2);
    assert_eq!(server.count_files(CLASS_METAINDEX), 2);

    let out = extract_archive(&server, &keys, "second").unwrap();
    assert_eq!(out, expected_stream(entries));
}

#[test]
fn corrupted_chunk_detected_on_extract() {
    let keys = full_keys();
    let server = server(&keys);
    let cachedir = tempfile::tempdir().unwrap();

    let large = body(150_000);
    let entries: &[(&[u8], &[u8])] = &[(b"hdr", &large)];
    write_archive(&server, &keys, cachedir.path(), "fragile", entries);

    // Flip one byte in every stored chunk; extraction must notice no
    // matter which chunk it touches first.
    for name in server.file_names(CLASS_CHUNK) {
        assert!(server.corrupt_file(CLASS_CHUNK, &name, 40));
    }

    match extract_archive(&server, &keys, "fragile") {
        Err(MultitapeError::Corrupt) | Err(MultitapeError::Chunks(_)) | Err(MultitapeError::Storage(_)) => {}
        other => panic!("corruption not detected: {:?}", other),
    }
}

#[test]
fn delete_archive_releases_only_unshared_chunks() {
    let keys = full_keys();
    let server = server(&keys);
    let cachedir = tempfile::tempdir().unwrap();

    let shared = body(120_000);
    let unique = {
        let mut v = body(120_000);
        for b in &mut v {
            *b ^= 0xa5;
        }
        v
    };
    let entries_one: &[(&[u8], &[u8])] = &[(b"hdr", &shared)];
    let entries_two: &[(&[u8], &[u8])] = &[(b"hdr", &shared), (b"hdr2", &unique)];

    write_archive(&server, &keys, cachedir.path(), "one", entries_one);
    write_archive(&server, &keys, cachedir.path(), "two", entries_two);

    multitape::delete::delete_tape(
        Rc::new(server.clone()),
        &keys,
        MACHINENUM,
        cachedir.path(),
        "two",
    )
    .unwrap();

    // Archive one still extracts; its chunks survived the delete.
    let out = extract_archive(&server, &keys, "one").unwrap();
    assert_eq!(out, expected_stream(entries_one));
    assert_eq!(server.count_files(CLASS_METADATA), 1);
    assert_eq!(server.count_files(CLASS_METAINDEX), 1);

    // Deleting the last archive empties every class.
    multitape::delete::delete_tape(
        Rc::new(server.clone()),
        &keys,
        MACHINENUM,
        cachedir.path(),
        "one",
    )
    .unwrap();
    assert_eq!(server.count_files(CLASS_METADATA), 0);
    assert_eq!(server.count_files(CLASS_METAINDEX), 0);
    assert_eq!(server.count_files(CLASS_CHUNK), 0);
}

#[test]
fn deleting_a_missing_archive_fails_cleanly() {
    let keys = full_keys();
    let server = server(&keys);
    let cachedir = tempfile::tempdir().unwrap();

    assert!(matches!(
        multitape::delete::delete_tape(
            Rc::new(server),
            &keys,
            MACHINENUM,
            cachedir.path(),
            "no-such-archive",
        ),
        Err(MultitapeError::NotFound)
    ));
}

#[test]
fn list_names_every_archive() {
    let keys = full_keys();
    let server = server(&keys);
    let cachedir = tempfile::tempdir().unwrap();

    let data = body(30_000);
    for name in ["alpha", "beta", "gamma"] {
        let entries: &[(&[u8], &[u8])] = &[(name.as_bytes(), &data)];
        write_archive(&server, &keys, cachedir.path(), name, entries);
    }

    let mut tapes = multitape::list_tapes(Box::new(server), &keys, MACHINENUM).unwrap();
    tapes.sort_by(|a, b| a.name.cmp(&b.name));
    let names: Vec<&str> = tapes.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, ["alpha", "beta", "gamma"]);
}
