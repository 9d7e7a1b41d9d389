#![allow(dead_code)]

//! Minimal fixed-layout record harness used by the scenario tests.
//!
//! Records are 100 bytes under a 4-field schema (`id`, `kind`, `age`,
//! `name`), packed into data pages in id order. The document model proper
//! lives above this crate; the harness only exercises the page API.

use vellum::types::page::{self, PAGE_HDR_LEN, PAGE_SIZE};
use vellum::{PageKind, PagePos, PagedFile, Result};

pub const RECORD_SIZE: usize = 100;
pub const NAME_LEN: usize = RECORD_SIZE - 12;
pub const RECORDS_PER_PAGE: usize = (PAGE_SIZE - PAGE_HDR_LEN) / RECORD_SIZE;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    pub id: u32,
    pub kind: u32,
    pub age: u32,
    pub name: Vec<u8>,
}

pub fn make_name(id: u32) -> Vec<u8> {
    let mut name = format!("name-{id:07}").into_bytes();
    name.resize(NAME_LEN, 0);
    name
}

pub fn encode_record(dst: &mut [u8], record: &Record) {
    dst[0..4].copy_from_slice(&record.id.to_be_bytes());
    dst[4..8].copy_from_slice(&record.kind.to_be_bytes());
    dst[8..12].copy_from_slice(&record.age.to_be_bytes());
    dst[12..RECORD_SIZE].copy_from_slice(&record.name);
}

pub fn decode_record(src: &[u8]) -> Record {
    Record {
        id: u32::from_be_bytes(src[0..4].try_into().unwrap()),
        kind: u32::from_be_bytes(src[4..8].try_into().unwrap()),
        age: u32::from_be_bytes(src[8..12].try_into().unwrap()),
        name: src[12..RECORD_SIZE].to_vec(),
    }
}

pub fn pages_for(records: u32) -> u64 {
    (records as u64 + RECORDS_PER_PAGE as u64 - 1) / RECORDS_PER_PAGE as u64
}

fn record_slot(data: &mut [u8], slot: usize) -> &mut [u8] {
    let start = PAGE_HDR_LEN + slot * RECORD_SIZE;
    &mut data[start..start + RECORD_SIZE]
}

/// Inserts `count` records with ids `1..=count` and the given `kind`,
/// committing `pages_per_tx` pages per transaction.
pub fn insert_records(file: &PagedFile, count: u32, kind: u32, pages_per_tx: usize) -> Result<()> {
    let total_pages = pages_for(count);
    let mut next_page = 0u64;
    while next_page < total_pages {
        let tx = file.begin_tx();
        let chunk_end = (next_page + pages_per_tx as u64).min(total_pages);
        let mut batch = Vec::new();
        {
            let mut reader = file.reader(true);
            for page_index in next_page..chunk_end {
                let buf = reader.new_page(PagePos::from_index(page_index), PageKind::Data)?;
                {
                    let mut data = buf.data_mut();
                    for slot in 0..RECORDS_PER_PAGE {
                        let id = page_index * RECORDS_PER_PAGE as u64 + slot as u64 + 1;
                        if id > count as u64 {
                            break;
                        }
                        let record = Record {
                            id: id as u32,
                            kind,
                            age: (id % 90) as u32,
                            name: make_name(id as u32),
                        };
                        encode_record(record_slot(&mut data, slot), &record);
                    }
                    page::write_tx_id(&mut data, tx);
                }
                batch.push(buf);
            }
        }
        if let Some(last) = batch.last() {
            let mut data = last.data_mut();
            page::write_confirmed(&mut data, true);
        }
        file.write(batch)?;
        next_page = chunk_end;
    }
    Ok(())
}

/// Rewrites the `kind` field of every record as one atomic transaction,
/// submitting `pages_per_batch` pages per write call. Nothing is confirmed
/// until the very last page, so aborting after `abort_after_pages` leaves
/// the update with no observable effect, like a producer that raises
/// halfway through.
pub fn update_kind(
    file: &PagedFile,
    count: u32,
    new_kind: u32,
    pages_per_batch: usize,
    abort_after_pages: Option<u64>,
) -> Result<bool> {
    let total_pages = pages_for(count);
    let tx = file.begin_tx();
    let mut rewritten = 0u64;
    let mut next_page = 0u64;
    while next_page < total_pages {
        let chunk_end = (next_page + pages_per_batch as u64).min(total_pages);
        let mut batch = Vec::new();
        let mut abort_now = false;
        {
            let mut reader = file.reader(true);
            for page_index in next_page..chunk_end {
                let position = PagePos::from_index(page_index);
                let current = reader.read_page(position)?;
                let buf = reader.new_page(position, PageKind::Data)?;
                {
                    let mut data = buf.data_mut();
                    data[PAGE_HDR_LEN..].copy_from_slice(&current.data()[PAGE_HDR_LEN..]);
                    for slot in 0..RECORDS_PER_PAGE {
                        let start = PAGE_HDR_LEN + slot * RECORD_SIZE;
                        let record = decode_record(&data[start..start + RECORD_SIZE]);
                        if record.id == 0 {
                            continue;
                        }
                        data[start + 4..start + 8].copy_from_slice(&new_kind.to_be_bytes());
                    }
                    page::write_tx_id(&mut data, tx);
                }
                batch.push(buf);
                rewritten += 1;
                if let Some(limit) = abort_after_pages {
                    if rewritten >= limit {
                        abort_now = true;
                        break;
                    }
                }
            }
        }
        if abort_now {
            // the unconfirmed pages reach the log but never become visible
            file.write(batch)?;
            file.abort(tx);
            return Ok(true);
        }
        if chunk_end == total_pages {
            if let Some(last) = batch.last() {
                let mut data = last.data_mut();
                page::write_confirmed(&mut data, true);
            }
        }
        file.write(batch)?;
        next_page = chunk_end;
    }
    Ok(false)
}

/// Counts records with the given `kind` across the record pages.
pub fn count_kind(file: &PagedFile, count: u32, kind: u32) -> Result<u64> {
    let total_pages = pages_for(count);
    let mut matches = 0u64;
    let mut reader = file.reader(false);
    for page_index in 0..total_pages {
        let buf = reader.read_page(PagePos::from_index(page_index))?;
        {
            let data = buf.data();
            for slot in 0..RECORDS_PER_PAGE {
                let start = PAGE_HDR_LEN + slot * RECORD_SIZE;
                let record = decode_record(&data[start..start + RECORD_SIZE]);
                if record.id != 0 && record.kind == kind {
                    matches += 1;
                }
            }
        }
        if page_index % 64 == 63 {
            reader.release_pages();
        }
    }
    Ok(matches)
}

/// Builds a sorted name index over the records and writes it as index pages
/// after the data region, `pages_per_tx` pages per transaction. Returns the
/// number of index entries written.
pub fn build_name_index(
    file: &PagedFile,
    count: u32,
    index_base_page: u64,
    pages_per_tx: usize,
) -> Result<u64> {
    let total_pages = pages_for(count);
    let mut entries: Vec<(Vec<u8>, u32)> = Vec::with_capacity(count as usize);
    {
        let mut reader = file.reader(false);
        for page_index in 0..total_pages {
            let buf = reader.read_page(PagePos::from_index(page_index))?;
            {
                let data = buf.data();
                for slot in 0..RECORDS_PER_PAGE {
                    let start = PAGE_HDR_LEN + slot * RECORD_SIZE;
                    let record = decode_record(&data[start..start + RECORD_SIZE]);
                    if record.id != 0 {
                        entries.push((record.name, record.id));
                    }
                }
            }
            if page_index % 64 == 63 {
                reader.release_pages();
            }
        }
    }
    entries.sort();

    let index_pages = pages_for(entries.len() as u32);
    let mut next_page = 0u64;
    while next_page < index_pages {
        let tx = file.begin_tx();
        let chunk_end = (next_page + pages_per_tx as u64).min(index_pages);
        let mut batch = Vec::new();
        {
            let mut reader = file.reader(true);
            for page_index in next_page..chunk_end {
                let buf = reader.new_page(
                    PagePos::from_index(index_base_page + page_index),
                    PageKind::Index,
                )?;
                {
                    let mut data = buf.data_mut();
                    for slot in 0..RECORDS_PER_PAGE {
                        let entry_index = page_index as usize * RECORDS_PER_PAGE + slot;
                        if entry_index >= entries.len() {
                            break;
                        }
                        let (name, id) = &entries[entry_index];
                        let start = PAGE_HDR_LEN + slot * RECORD_SIZE;
                        data[start..start + 4].copy_from_slice(&id.to_be_bytes());
                        data[start + 12..start + RECORD_SIZE].copy_from_slice(name);
                    }
                    page::write_tx_id(&mut data, tx);
                }
                batch.push(buf);
            }
        }
        if let Some(last) = batch.last() {
            let mut data = last.data_mut();
            page::write_confirmed(&mut data, true);
        }
        file.write(batch)?;
        next_page = chunk_end;
    }
    Ok(entries.len() as u64)
}
