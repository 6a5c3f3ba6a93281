//! ID generation, key generation, and streaming symmetric encryption.
//!
//! Two unrelated concerns share this crate because the original system
//! treats them as one module: generating opaque identifiers (node IDs,
//! encryption keys) and turning arbitrary byte streams into ciphertext and
//! back. The cipher is AES-256 in counter mode; the IV is generated fresh
//! per call and prepended to the ciphertext so a receiver never needs an
//! out-of-band channel to learn it.

#![warn(missing_docs)]

use std::io::{Read, Write};

use ctr::cipher::generic_array::GenericArray;
use ctr::cipher::{KeyIvInit, StreamCipher};
use rand::RngCore;
use thiserror::Error;

/// AES-256 key size in bytes.
pub const KEY_SIZE: usize = 32;
/// Node ID size in bytes, before hex encoding.
pub const ID_SIZE: usize = 16;
/// CTR-mode IV size in bytes.
pub const IV_SIZE: usize = 16;

const STREAM_BUFFER_SIZE: usize = 32 * 1024;

type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

/// Errors surfaced by the streaming cipher.
#[derive(Debug, Error)]
pub enum Error {
    /// The IV could not be fully read from the source or written to the destination.
    #[error("short IV read/write: {0}")]
    Iv(std::io::Error),
    /// The underlying reader or writer failed mid-stream.
    #[error("stream io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Generate a fresh 16-byte node/peer identifier, hex-encoded to 32 characters.
pub fn generate_id() -> String {
    let mut buf = [0u8; ID_SIZE];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

/// Generate a fresh random 256-bit key for [`copy_encrypt`]/[`copy_decrypt`].
pub fn new_encryption_key() -> [u8; KEY_SIZE] {
    let mut buf = [0u8; KEY_SIZE];
    rand::thread_rng().fill_bytes(&mut buf);
    buf
}

/// Lowercase hex-encoded MD5 of `key`, used as the wire-safe key identifier.
///
/// This is a one-way, non-cryptographic-strength obfuscation, not a security
/// boundary: its only job is to keep the original key string off the wire.
pub fn hash_key(key: &str) -> String {
    format!("{:x}", md5::compute(key.as_bytes()))
}

fn cipher_for(key: &[u8; KEY_SIZE], iv: &[u8; IV_SIZE]) -> Aes256Ctr {
    let key = GenericArray::from_slice(key);
    let iv = GenericArray::from_slice(iv);
    Aes256Ctr::new(key, iv)
}

/// Encrypt `src` into `dst`, prepending a fresh random IV ahead of the
/// ciphertext. Returns the total byte count written to `dst`, including the
/// IV — so `n == plaintext_len + IV_SIZE`.
pub fn copy_encrypt<R: Read, W: Write>(
    key: &[u8; KEY_SIZE],
    mut src: R,
    mut dst: W,
) -> Result<u64, Error> {
    let mut iv = [0u8; IV_SIZE];
    rand::thread_rng().fill_bytes(&mut iv);
    dst.write_all(&iv).map_err(Error::Iv)?;

    let mut cipher = cipher_for(key, &iv);
    let mut total = IV_SIZE as u64;
    let mut buf = vec![0u8; STREAM_BUFFER_SIZE];
    loop {
        let n = src.read(&mut buf)?;
        if n == 0 {
            break;
        }
        cipher.apply_keystream(&mut buf[..n]);
        dst.write_all(&buf[..n])?;
        total += n as u64;
    }
    Ok(total)
}

/// Decrypt `src` (IV followed by ciphertext) into `dst`. Returns the same
/// accounting as [`copy_encrypt`]: `IV_SIZE + plaintext_len`, even though no
/// IV bytes are themselves written to `dst`.
pub fn copy_decrypt<R: Read, W: Write>(
    key: &[u8; KEY_SIZE],
    mut src: R,
    mut dst: W,
) -> Result<u64, Error> {
    let mut iv = [0u8; IV_SIZE];
    src.read_exact(&mut iv).map_err(Error::Iv)?;

    let mut cipher = cipher_for(key, &iv);
    let mut total = IV_SIZE as u64;
    let mut buf = vec![0u8; STREAM_BUFFER_SIZE];
    loop {
        let n = src.read(&mut buf)?;
        if n == 0 {
            break;
        }
        cipher.apply_keystream(&mut buf[..n]);
        dst.write_all(&buf[..n])?;
        total += n as u64;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn id_is_32_hex_chars() {
        let id = generate_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn ids_are_not_constant() {
        assert_ne!(generate_id(), generate_id());
    }

    #[test]
    fn hash_key_matches_known_vector() {
        // md5("") = d41d8cd98f00b204e9800998ecf8427e
        assert_eq!(hash_key(""), "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[test]
    fn encrypt_then_decrypt_roundtrips() {
        let key = new_encryption_key();
        let plaintext = b"my big data file here!".to_vec();

        let mut ciphertext = Vec::new();
        let n = copy_encrypt(&key, plaintext.as_slice(), &mut ciphertext).unwrap();
        assert_eq!(n as usize, plaintext.len() + IV_SIZE);
        assert_eq!(ciphertext.len(), plaintext.len() + IV_SIZE);

        let mut recovered = Vec::new();
        let m = copy_decrypt(&key, ciphertext.as_slice(), &mut recovered).unwrap();
        assert_eq!(m, n);
        assert_eq!(recovered, plaintext);
    }

    #[test]
    fn wrong_key_does_not_panic_and_does_not_recover_plaintext() {
        let key = new_encryption_key();
        let other_key = new_encryption_key();
        let plaintext = b"some bytes".to_vec();

        let mut ciphertext = Vec::new();
        copy_encrypt(&key, plaintext.as_slice(), &mut ciphertext).unwrap();

        let mut recovered = Vec::new();
        copy_decrypt(&other_key, ciphertext.as_slice(), &mut recovered).unwrap();
        assert_ne!(recovered, plaintext);
    }

    proptest! {
        #[test]
        fn roundtrip_arbitrary_bytes(data in proptest::collection::vec(any::<u8>(), 0..4096)) {
            let key = new_encryption_key();
            let mut ciphertext = Vec::new();
            copy_encrypt(&key, data.as_slice(), &mut ciphertext).unwrap();
            prop_assert_eq!(ciphertext.len(), data.len() + IV_SIZE);

            let mut recovered = Vec::new();
            copy_decrypt(&key, ciphertext.as_slice(), &mut recovered).unwrap();
            prop_assert_eq!(recovered, data);
        }
    }
}
