//! Encrypted page round-trips and wrong-key detection.

mod common;

use common::{count_kind, insert_records};
use tempfile::tempdir;
use vellum::types::page::PAGE_HDR_LEN;
use vellum::{FileOptions, PageKind, PagePos, PagedFile, VellumError};

fn options(key: [u8; 32]) -> FileOptions {
    FileOptions {
        encryption_key: Some(key),
        checkpoint_threshold_pages: 128,
        ..FileOptions::default()
    }
}

#[test]
fn same_key_roundtrip_across_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("cipher.db");
    let key = [42u8; 32];
    {
        let file = PagedFile::open(&path, options(key)).unwrap();
        insert_records(&file, 5_000, 1, 16).unwrap();
        assert_eq!(count_kind(&file, 5_000, 1).unwrap(), 5_000);
        file.close().unwrap();
    }
    let file = PagedFile::open(&path, options(key)).unwrap();
    assert_eq!(count_kind(&file, 5_000, 1).unwrap(), 5_000);
}

#[test]
fn data_file_is_not_plaintext() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("opaque.db");
    let key = [9u8; 32];
    {
        let file = PagedFile::open(&path, options(key)).unwrap();
        let tx = file.begin_tx();
        let mut reader = file.reader(true);
        let buf = reader.new_page(PagePos(0), PageKind::Data).unwrap();
        {
            let mut data = buf.data_mut();
            data[PAGE_HDR_LEN..].fill(0xAA);
            vellum::types::page::write_tx_id(&mut data, tx);
            vellum::types::page::write_confirmed(&mut data, true);
        }
        drop(reader);
        file.write(vec![buf]).unwrap();
        file.close().unwrap();
    }
    let raw = std::fs::read(&path).unwrap();
    assert!(
        !raw[PAGE_HDR_LEN..].iter().all(|&b| b == 0xAA),
        "page body must not be stored as plaintext"
    );
}

#[test]
fn wrong_key_reports_checksum_mismatch() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("wrongkey.db");
    {
        let file = PagedFile::open(&path, options([1u8; 32])).unwrap();
        insert_records(&file, 200, 1, 8).unwrap();
        file.close().unwrap();
    }
    let file = PagedFile::open(&path, options([2u8; 32])).unwrap();
    let mut reader = file.reader(false);
    match reader.read_page(PagePos(0)) {
        Err(VellumError::ChecksumMismatch { position }) => assert_eq!(position, 0),
        other => panic!("expected checksum mismatch, got {other:?}"),
    }
}
