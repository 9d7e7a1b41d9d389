#![forbid(unsafe_code)]

use aes::cipher::{KeyIvInit, StreamCipher};
use aes::Aes256;
use ctr::Ctr128BE;

use crate::types::page::{PAGE_HDR_LEN, PAGE_SIZE};
use crate::types::PagePos;

type Aes256Ctr = Ctr128BE<Aes256>;

/// Symmetric page-body cipher.
///
/// Each page body is AES-256-CTR encrypted under an IV built from the
/// instance salt and the page's logical position, so identical plaintext at
/// different positions (or in different database instances) produces
/// different ciphertext, and pages can be transformed independently. The
/// salt is the one persisted in the log header; because both files derive
/// the IV from the logical position, a page's ciphertext is identical in the
/// log and the data file. The 32-byte header is never encrypted; the content
/// checksum is computed over plaintext before encryption.
///
/// CTR is an involution: applying the keystream twice restores the input, so
/// one routine serves both directions.
pub struct PageCipher {
    key: [u8; 32],
    salt: u64,
}

impl PageCipher {
    pub fn new(key: [u8; 32], salt: u64) -> Self {
        Self { key, salt }
    }

    /// Encrypts or decrypts the body of `page` in place.
    pub fn apply(&self, logical_pos: PagePos, page: &mut [u8]) {
        debug_assert_eq!(page.len(), PAGE_SIZE);
        let mut iv = [0u8; 16];
        iv[0..8].copy_from_slice(&self.salt.to_be_bytes());
        iv[8..16].copy_from_slice(&logical_pos.0.to_be_bytes());
        let mut cipher = Aes256Ctr::new(&self.key.into(), &iv.into());
        cipher.apply_keystream(&mut page[PAGE_HDR_LEN..]);
    }
}
