//! Cache checkpointing under bulk insert and index build.

mod common;

use common::{build_name_index, count_kind, insert_records, pages_for};
use tempfile::tempdir;
use vellum::{FileOptions, PagedFile};

const DOCS: u32 = 60_000;

fn options() -> FileOptions {
    FileOptions {
        checkpoint_threshold_pages: 128,
        ..FileOptions::default()
    }
}

#[test]
fn bulk_insert_triggers_checkpoint() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("bulk.db");
    let file = PagedFile::open(&path, options()).unwrap();

    insert_records(&file, DOCS, 1, 16).unwrap();
    let stats = file.stats();
    assert!(
        stats.checkpoints >= 1,
        "bulk insert must cross the log threshold and checkpoint (stats: {stats:?})"
    );
    assert_eq!(count_kind(&file, DOCS, 1).unwrap(), DOCS as u64);
}

#[test]
fn index_build_checkpoints_and_count_survives() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("index.db");
    let file = PagedFile::open(&path, options()).unwrap();

    insert_records(&file, DOCS, 1, 16).unwrap();
    let before = file.stats().checkpoints;

    let index_base = pages_for(DOCS) + 8;
    let entries = build_name_index(&file, DOCS, index_base, 16).unwrap();
    assert_eq!(entries, DOCS as u64);
    assert!(
        file.stats().checkpoints > before,
        "index build must emit a further checkpoint"
    );
    assert_eq!(count_kind(&file, DOCS, 1).unwrap(), DOCS as u64);
}

#[test]
fn bulk_insert_survives_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("reopen.db");
    {
        let file = PagedFile::open(&path, options()).unwrap();
        insert_records(&file, DOCS, 1, 16).unwrap();
        file.close().unwrap();
    }
    let file = PagedFile::open(&path, options()).unwrap();
    assert_eq!(count_kind(&file, DOCS, 1).unwrap(), DOCS as u64);
    assert_eq!(
        file.length(),
        pages_for(DOCS) * vellum::types::page::PAGE_SIZE as u64
    );
}
