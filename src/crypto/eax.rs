// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! AES-128 EAX mode, built directly on CMAC (OMAC1) and CTR rather than on
//! an opaque AEAD crate, because the wire format truncates the 128-bit EAX
//! tag to 4 bytes (§4.C) and verification needs the tag recomputed from the
//! ciphertext alone, not compared inside a black-box decrypt call that
//! expects the full tag up front.
//!
//! Construction (Bellare/Rogaway/Wagner):
//! `N' = OMAC^0(nonce)`, `H' = OMAC^1(header)`, `C' = OMAC^2(ciphertext)`,
//! `tag = N' xor H' xor C'`; the ciphertext itself is `plaintext` XOR
//! `CTR_K(N')`.

use aes::Aes128;
use cipher::{KeyIvInit, StreamCipher};
use cmac::{Cmac, Mac};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

type Aes128Ctr = ctr::Ctr128BE<Aes128>;
type Aes128Cmac = Cmac<Aes128>;

pub const KEY_SIZE: usize = 16;
pub const BLOCK_SIZE: usize = 16;
/// Truncated tag length carried on the wire (§4.C).
pub const TAG_SIZE: usize = 4;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("security key must be exactly {KEY_SIZE} bytes, got {0}")]
    BadKeyLength(usize),
    #[error("authentication tag mismatch")]
    TagMismatch,
}

/// Zero-on-drop AES-128 key used for EAX authentication/encryption.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EaxKey([u8; KEY_SIZE]);

impl EaxKey {
    pub fn new(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; KEY_SIZE] = bytes
            .try_into()
            .map_err(|_| CryptoError::BadKeyLength(bytes.len()))?;
        Ok(Self(arr))
    }
}

impl std::fmt::Debug for EaxKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EaxKey(..)")
    }
}

/// `OMAC_K^t(M) = CMAC_K([0u8;15] ++ [t] ++ M)`.
fn omac(key: &EaxKey, tweak: u8, msg: &[u8]) -> [u8; BLOCK_SIZE] {
    let mut mac =
        Aes128Cmac::new_from_slice(&key.0).expect("AES-128 key is always 16 bytes");
    let mut block0 = [0u8; BLOCK_SIZE];
    block0[BLOCK_SIZE - 1] = tweak;
    mac.update(&block0);
    mac.update(msg);
    let tag = mac.finalize().into_bytes();
    let mut out = [0u8; BLOCK_SIZE];
    out.copy_from_slice(&tag);
    out
}

fn xor_in_place(a: &mut [u8; BLOCK_SIZE], b: &[u8; BLOCK_SIZE]) {
    for i in 0..BLOCK_SIZE {
        a[i] ^= b[i];
    }
}

fn ctr_apply(key: &EaxKey, counter_block: &[u8; BLOCK_SIZE], buffer: &mut [u8]) {
    let mut cipher = Aes128Ctr::new(&key.0.into(), counter_block.into());
    cipher.apply_keystream(buffer);
}

/// Combined nonce-and-header MAC state shared by encrypt/authenticate/verify,
/// so each caller only has to supply the piece that differs: the ciphertext.
struct PartialTag {
    n_prime: [u8; BLOCK_SIZE],
    h_prime: [u8; BLOCK_SIZE],
}

impl PartialTag {
    fn compute(key: &EaxKey, nonce: &[u8], header: &[u8]) -> Self {
        Self {
            n_prime: omac(key, 0, nonce),
            h_prime: omac(key, 1, header),
        }
    }

    fn finish(&self, key: &EaxKey, ciphertext: &[u8]) -> [u8; BLOCK_SIZE] {
        let mut tag = self.n_prime;
        xor_in_place(&mut tag, &self.h_prime);
        let c_prime = omac(key, 2, ciphertext);
        xor_in_place(&mut tag, &c_prime);
        tag
    }
}

/// Encrypts `buffer` in place (plaintext -> ciphertext) and returns the
/// truncated tag computed over the resulting ciphertext. Used for
/// cipher+auth traffic.
pub fn encrypt_in_place(
    key: &EaxKey,
    nonce: &[u8],
    header: &[u8],
    buffer: &mut [u8],
) -> [u8; TAG_SIZE] {
    let partial = PartialTag::compute(key, nonce, header);
    ctr_apply(key, &partial.n_prime, buffer);
    let full = partial.finish(key, buffer);
    let mut out = [0u8; TAG_SIZE];
    out.copy_from_slice(&full[..TAG_SIZE]);
    out
}

/// Decrypts `buffer` in place (ciphertext -> plaintext). Callers must call
/// [`verify`] on the original ciphertext bytes first; this function performs
/// no authentication of its own.
pub fn decrypt_in_place(key: &EaxKey, nonce: &[u8], header: &[u8], buffer: &mut [u8]) {
    let n_prime = omac(key, 0, nonce);
    let _ = header;
    ctr_apply(key, &n_prime, buffer);
}

/// Computes the truncated tag over a plaintext body without ciphering it, by
/// running the same EAX construction on a scratch copy and discarding the
/// resulting ciphertext. Used for clear+auth traffic, where the body is
/// transmitted unencrypted but still authenticated.
pub fn authenticate(key: &EaxKey, nonce: &[u8], header: &[u8], body: &[u8]) -> [u8; TAG_SIZE] {
    let mut scratch = body.to_vec();
    encrypt_in_place(key, nonce, header, &mut scratch)
}

/// Recomputes the truncated tag over `ciphertext` (or, for clear+auth, over
/// the received plaintext body) and compares it against `expected_tag` in
/// constant time.
pub fn verify(
    key: &EaxKey,
    nonce: &[u8],
    header: &[u8],
    ciphertext: &[u8],
    expected_tag: &[u8],
) -> Result<(), CryptoError> {
    let partial = PartialTag::compute(key, nonce, header);
    let full = partial.finish(key, ciphertext);
    if expected_tag.len() != TAG_SIZE {
        return Err(CryptoError::TagMismatch);
    }
    let mut diff = 0u8;
    for (a, b) in full[..TAG_SIZE].iter().zip(expected_tag) {
        diff |= a ^ b;
    }
    if diff == 0 {
        Ok(())
    } else {
        Err(CryptoError::TagMismatch)
    }
}

/// Builds the EAX nonce from the 4-byte initialization vector and the
/// calling AP title's packed octets, as the association context requires
/// (§4.C).
pub fn build_nonce(iv: u32, calling_ap_title_octets: &[u8]) -> Vec<u8> {
    let mut nonce = Vec::with_capacity(4 + calling_ap_title_octets.len());
    nonce.extend_from_slice(&iv.to_be_bytes());
    nonce.extend_from_slice(calling_ap_title_octets);
    nonce
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> EaxKey {
        EaxKey::new(&[0x2Bu8; KEY_SIZE]).unwrap()
    }

    #[test]
    fn encrypt_then_decrypt_round_trips() {
        let key = test_key();
        let nonce = build_nonce(0x1234_5678, &[0xAA, 0xBB, 0xCC]);
        let header = b"header-aad";
        let plaintext = b"table read response body".to_vec();

        let mut buffer = plaintext.clone();
        let tag = encrypt_in_place(&key, &nonce, header, &mut buffer);
        assert_ne!(buffer, plaintext);

        verify(&key, &nonce, header, &buffer, &tag).unwrap();

        decrypt_in_place(&key, &nonce, header, &mut buffer);
        assert_eq!(buffer, plaintext);
    }

    #[test]
    fn tampered_ciphertext_fails_verification() {
        let key = test_key();
        let nonce = build_nonce(1, &[0x01]);
        let header = b"hdr";
        let mut buffer = b"secret payload".to_vec();
        let tag = encrypt_in_place(&key, &nonce, header, &mut buffer);

        buffer[0] ^= 0x01;
        assert_eq!(
            verify(&key, &nonce, header, &buffer, &tag),
            Err(CryptoError::TagMismatch)
        );
    }

    #[test]
    fn authenticate_does_not_alter_wire_bytes() {
        let key = test_key();
        let nonce = build_nonce(7, &[0x02, 0x03]);
        let header = b"hdr2";
        let body = b"clear-auth body stays readable".to_vec();

        let tag = authenticate(&key, &nonce, header, &body);
        verify(&key, &nonce, header, &body, &tag).unwrap();
    }

    #[test]
    fn bad_key_length_rejected() {
        assert_eq!(
            EaxKey::new(&[0u8; 10]).err(),
            Some(CryptoError::BadKeyLength(10))
        );
    }
}
