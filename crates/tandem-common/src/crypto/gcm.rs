//! Incremental AES-256-GCM (empty AAD) over arbitrary chunk boundaries

use aes::{
    Aes256,
    cipher::{BlockEncrypt, KeyInit, KeyIvInit, StreamCipher as _, generic_array::GenericArray},
};
use ctr::Ctr32BE;
use ghash::{GHash, universal_hash::UniversalHash};
use subtle::ConstantTimeEq;

use super::kem::KEY_LEN;

pub(crate) const BLOCK_LEN: usize = 16;

pub(crate) struct Gcm {
    ctr: Ctr32BE<Aes256>,
    ghash: GHash,
    pending: Vec<u8>,
    ciphertext_len: u64,
    tag_mask: [u8; BLOCK_LEN],
}

impl Gcm {
    pub(crate) fn new(key: &[u8; KEY_LEN], nonce: &[u8; 12]) -> Self {
        let cipher = Aes256::new(GenericArray::from_slice(key));

        let mut h = GenericArray::clone_from_slice(&[0u8; BLOCK_LEN]);
        cipher.encrypt_block(&mut h);

        let mut j0 = [0u8; BLOCK_LEN];
        j0[..12].copy_from_slice(nonce);
        j0[15] = 1;
        let mut tag_mask = GenericArray::clone_from_slice(&j0);
        cipher.encrypt_block(&mut tag_mask);

        let mut counter = j0;
        counter[15] = 2;

        Self {
            ctr: Ctr32BE::<Aes256>::new(
                GenericArray::from_slice(key),
                GenericArray::from_slice(&counter),
            ),
            ghash: GHash::new(&h),
            pending: Vec::with_capacity(BLOCK_LEN),
            ciphertext_len: 0,
            tag_mask: tag_mask.into(),
        }
    }

    pub(crate) fn encrypt_in_place(&mut self, buf: &mut [u8]) {
        self.ctr.apply_keystream(buf);
        self.absorb(buf);
    }

    pub(crate) fn decrypt_in_place(&mut self, buf: &mut [u8]) {
        self.absorb(buf);
        self.ctr.apply_keystream(buf);
    }

    pub(crate) fn finalize(mut self) -> [u8; BLOCK_LEN] {
        if !self.pending.is_empty() {
            self.ghash.update_padded(&self.pending);
        }

        let mut lengths = [0u8; BLOCK_LEN];
        lengths[8..].copy_from_slice(&(self.ciphertext_len * 8).to_be_bytes());
        self.ghash.update_padded(&lengths);

        let mut tag: [u8; BLOCK_LEN] = self.ghash.finalize().into();
        for (t, m) in tag.iter_mut().zip(self.tag_mask.iter()) {
            *t ^= m;
        }
        tag
    }

    fn absorb(&mut self, mut data: &[u8]) {
        self.ciphertext_len += data.len() as u64;

        if !self.pending.is_empty() {
            let take = (BLOCK_LEN - self.pending.len()).min(data.len());
            self.pending.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.pending.len() < BLOCK_LEN {
                return;
            }
            self.ghash.update_padded(&self.pending);
            self.pending.clear();
        }

        let whole = data.len() - data.len() % BLOCK_LEN;
        if whole > 0 {
            self.ghash.update_padded(&data[..whole]);
        }
        self.pending.extend_from_slice(&data[whole..]);
    }
}

/// Constant-time tag comparison
pub(crate) fn tags_equal(a: &[u8; BLOCK_LEN], b: &[u8; BLOCK_LEN]) -> bool {
    a[..].ct_eq(&b[..]).into()
}
