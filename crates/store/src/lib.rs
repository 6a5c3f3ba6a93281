//! Content-addressed local object store.
//!
//! Every object lives under `<root>/<owner_id>/<pathname>/<filename>`, where
//! `owner_id` namespaces one logical node's objects within a storage root
//! that may be shared by several nodes, and `(pathname, filename)` come from
//! a [`path_key::PathTransform`]. Writes are whole-file replace-on-write;
//! there is no compaction, no index, and no metadata beyond the tree itself.

#![warn(missing_docs)]

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use path_key::{CasTransform, PathTransform};
use thiserror::Error;
use tracing::{instrument, warn};

const DIR_MODE: u32 = 0o755;

/// Errors surfaced by store operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Underlying filesystem failure.
    #[error("io: {0}")]
    Io(#[from] io::Error),
    /// Decryption failed while streaming a replicated write to disk.
    #[error("decrypt: {0}")]
    Decrypt(#[from] crypto::Error),
}

#[cfg(unix)]
fn create_dir_all_with_mode(dir: &Path) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new().recursive(true).mode(DIR_MODE).create(dir)
}

#[cfg(not(unix))]
fn create_dir_all_with_mode(dir: &Path) -> io::Result<()> {
    fs::create_dir_all(dir)
}

/// A writer wrapper that counts bytes actually written to the inner sink,
/// used so [`Store::write_decrypt`] can report plaintext bytes written
/// rather than the IV-inclusive count `crypto::copy_decrypt` returns.
struct CountingWriter<W> {
    inner: W,
    count: u64,
}

impl<W: Write> CountingWriter<W> {
    fn new(inner: W) -> Self {
        Self { inner, count: 0 }
    }

    fn finish(self) -> (W, u64) {
        (self.inner, self.count)
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// A node's local, namespaced object tree.
///
/// Generic over the [`PathTransform`] so tests can substitute
/// [`path_key::IdentityTransform`] for a human-readable layout; production
/// code uses the default [`CasTransform`].
pub struct Store<T: PathTransform = CasTransform> {
    root: PathBuf,
    transform: T,
}

impl Store<CasTransform> {
    /// Open (creating if necessary) a store rooted at `root`, using the
    /// canonical content-addressed transform.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, Error> {
        Self::with_transform(root, CasTransform)
    }
}

impl<T: PathTransform> Store<T> {
    /// Open (creating if necessary) a store rooted at `root`, using a custom
    /// path transform.
    pub fn with_transform(root: impl Into<PathBuf>, transform: T) -> Result<Self, Error> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root, transform })
    }

    /// Storage root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn paths(&self, owner_id: &str, key: &str) -> (PathBuf, PathBuf, String) {
        let path_key = self.transform.transform(key);
        let owner_dir = self.root.join(owner_id);
        let dir = owner_dir.join(&path_key.pathname);
        let file = dir.join(&path_key.filename);
        (dir, file, path_key.first_segment().to_string())
    }

    /// Stream `reader` into the object named `key` under `owner_id`,
    /// returning the number of bytes written. Any I/O failure after the file
    /// was created removes the partial file before the error is returned.
    #[instrument(skip(self, reader), fields(owner_id = %owner_id))]
    pub fn write<R: Read>(&self, owner_id: &str, key: &str, mut reader: R) -> Result<u64, Error> {
        let (dir, file_path, _) = self.paths(owner_id, key);
        create_dir_all_with_mode(&dir)?;

        let result = (|| -> Result<u64, Error> {
            let mut file = File::create(&file_path)?;
            let n = io::copy(&mut reader, &mut file)?;
            file.sync_all()?;
            Ok(n)
        })();

        if result.is_err() {
            if let Err(cleanup_err) = fs::remove_file(&file_path) {
                if cleanup_err.kind() != io::ErrorKind::NotFound {
                    warn!(path = %file_path.display(), error = %cleanup_err, "failed to remove partial write");
                }
            }
        }
        result
    }

    /// Like [`Store::write`], but `reader` carries IV-prefixed ciphertext
    /// that is decrypted on the fly with `enc_key` before hitting disk.
    /// Returns the number of *decrypted* bytes written.
    #[instrument(skip(self, enc_key, reader), fields(owner_id = %owner_id))]
    pub fn write_decrypt<R: Read>(
        &self,
        enc_key: &[u8; crypto::KEY_SIZE],
        owner_id: &str,
        key: &str,
        reader: R,
    ) -> Result<u64, Error> {
        let (dir, file_path, _) = self.paths(owner_id, key);
        create_dir_all_with_mode(&dir)?;

        let result = (|| -> Result<u64, Error> {
            let file = File::create(&file_path)?;
            let counting = CountingWriter::new(file);
            let mut counting = counting;
            crypto::copy_decrypt(enc_key, reader, &mut counting)?;
            let (file, n) = counting.finish();
            file.sync_all()?;
            Ok(n)
        })();

        if result.is_err() {
            if let Err(cleanup_err) = fs::remove_file(&file_path) {
                if cleanup_err.kind() != io::ErrorKind::NotFound {
                    warn!(path = %file_path.display(), error = %cleanup_err, "failed to remove partial write");
                }
            }
        }
        result
    }

    /// Open the object named `key` under `owner_id`, returning its size (via
    /// stat) and an open handle the caller owns and must close.
    pub fn read(&self, owner_id: &str, key: &str) -> Result<(u64, File), Error> {
        let (_, file_path, _) = self.paths(owner_id, key);
        let file = File::open(&file_path)?;
        let size = file.metadata()?.len();
        Ok((size, file))
    }

    /// True iff the object exists and is a regular file.
    pub fn has(&self, owner_id: &str, key: &str) -> bool {
        let (_, file_path, _) = self.paths(owner_id, key);
        fs::metadata(&file_path).map(|m| m.is_file()).unwrap_or(false)
    }

    /// Remove the subtree rooted at the object's first path segment.
    /// Idempotent: deleting a non-existent key still returns success.
    #[instrument(skip(self), fields(owner_id = %owner_id))]
    pub fn delete(&self, owner_id: &str, key: &str) -> Result<(), Error> {
        let (_, _, first_segment) = self.paths(owner_id, key);
        let victim = self.root.join(owner_id).join(first_segment);
        match fs::remove_dir_all(&victim) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove the entire storage root. Intended for test teardown.
    pub fn clear(&self) -> Result<(), Error> {
        match fs::remove_dir_all(&self.root) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn write_read_has_delete_cycle() {
        let (_dir, store) = store();
        let owner = "owner-a";

        for i in 0..200 {
            let key = format!("food_{i}");
            let n = store.write(owner, &key, Cursor::new(b"test data".to_vec())).unwrap();
            assert_eq!(n, 9);

            let (size, mut file) = store.read(owner, &key).unwrap();
            assert_eq!(size, 9);
            let mut got = Vec::new();
            file.read_to_end(&mut got).unwrap();
            assert_eq!(got, b"test data");

            assert!(store.has(owner, &key));
            store.delete(owner, &key).unwrap();
            assert!(!store.has(owner, &key));
        }
    }

    #[test]
    fn delete_is_idempotent() {
        let (_dir, store) = store();
        store.delete("owner-a", "never-written").unwrap();
        store.delete("owner-a", "never-written").unwrap();
    }

    #[test]
    fn write_overwrites_existing_object() {
        let (_dir, store) = store();
        store.write("owner-a", "k", Cursor::new(b"first".to_vec())).unwrap();
        store.write("owner-a", "k", Cursor::new(b"second value".to_vec())).unwrap();
        let (size, mut file) = store.read("owner-a", "k").unwrap();
        let mut got = Vec::new();
        file.read_to_end(&mut got).unwrap();
        assert_eq!(size as usize, got.len());
        assert_eq!(got, b"second value");
    }

    struct FailingReader {
        good_bytes: &'static [u8],
        served: bool,
    }

    impl Read for FailingReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if !self.served {
                self.served = true;
                let n = self.good_bytes.len().min(buf.len());
                buf[..n].copy_from_slice(&self.good_bytes[..n]);
                return Ok(n);
            }
            Err(io::Error::other("simulated mid-stream failure"))
        }
    }

    #[test]
    fn failed_write_removes_partial_file() {
        let (_dir, store) = store();
        let reader = FailingReader { good_bytes: b"partial", served: false };
        let err = store.write("owner-a", "broken", reader);
        assert!(err.is_err());
        assert!(!store.has("owner-a", "broken"));
    }

    #[test]
    fn write_decrypt_round_trips_with_encrypt() {
        let (_dir, store) = store();
        let key = crypto::new_encryption_key();
        let plaintext = b"my big data file here!".to_vec();

        let mut ciphertext = Vec::new();
        crypto::copy_encrypt(&key, plaintext.as_slice(), &mut ciphertext).unwrap();

        let n = store.write_decrypt(&key, "owner-b", "picture_0.png", ciphertext.as_slice()).unwrap();
        assert_eq!(n as usize, plaintext.len());

        let (_, mut file) = store.read("owner-b", "picture_0.png").unwrap();
        let mut got = Vec::new();
        file.read_to_end(&mut got).unwrap();
        assert_eq!(got, plaintext);
    }

    #[test]
    fn distinct_owners_do_not_collide() {
        let (_dir, store) = store();
        store.write("owner-a", "k", Cursor::new(b"a".to_vec())).unwrap();
        store.write("owner-b", "k", Cursor::new(b"b".to_vec())).unwrap();
        assert!(store.has("owner-a", "k"));
        assert!(store.has("owner-b", "k"));
        store.delete("owner-a", "k").unwrap();
        assert!(!store.has("owner-a", "k"));
        assert!(store.has("owner-b", "k"));
    }

    #[test]
    fn clear_removes_entire_root() {
        let (dir, store) = store();
        store.write("owner-a", "k", Cursor::new(b"x".to_vec())).unwrap();
        store.clear().unwrap();
        assert!(!dir.path().join("owner-a").exists());
    }
}
