//! Content-addressed path derivation.
//!
//! A [`PathTransform`] maps an arbitrary user key to a [`PathKey`] — the
//! on-disk location under a node's storage root. The canonical transform
//! ([`CasTransform`]) is a pure function of the key's SHA-1 digest; an
//! [`IdentityTransform`] is kept around for tests that want a readable
//! on-disk layout instead of a sharded hash tree.

#![warn(missing_docs)]

use sha1::{Digest, Sha1};

/// Number of hex characters per path segment in the canonical transform.
const SEGMENT_LEN: usize = 5;
/// Number of segments the 40-character SHA-1 hex digest is split into.
const SEGMENT_COUNT: usize = 8;

/// An immutable `(pathname, filename)` pair identifying where an object lives
/// on disk, relative to a node's namespaced storage root.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct PathKey {
    /// Slash-joined directory prefix under which the object lives.
    pub pathname: String,
    /// Terminal path component.
    pub filename: String,
}

impl PathKey {
    /// `pathname + "/" + filename`.
    pub fn full_path(&self) -> String {
        format!("{}/{}", self.pathname, self.filename)
    }

    /// The top-level directory of `pathname`, used for deletion pruning.
    ///
    /// Falls back to `pathname` itself if it has no `/` separator.
    pub fn first_segment(&self) -> &str {
        self.pathname.split('/').next().unwrap_or(&self.pathname)
    }
}

/// A pluggable, deterministic, side-effect-free key-to-path mapping.
///
/// Implementations must be stable across runs and across processes: callers
/// depend on the same key always producing the same [`PathKey`].
pub trait PathTransform: Send + Sync {
    /// Derive the on-disk location for `key`.
    fn transform(&self, key: &str) -> PathKey;
}

/// Canonical content-addressed transform: `sha1(key)` hex-encoded and split
/// into 8 five-character segments.
#[derive(Clone, Copy, Debug, Default)]
pub struct CasTransform;

impl PathTransform for CasTransform {
    fn transform(&self, key: &str) -> PathKey {
        let mut hasher = Sha1::new();
        hasher.update(key.as_bytes());
        let digest = hasher.finalize();
        let hex = hex::encode(digest);
        debug_assert_eq!(hex.len(), SEGMENT_LEN * SEGMENT_COUNT);

        let segments: Vec<&str> =
            (0..SEGMENT_COUNT).map(|i| &hex[i * SEGMENT_LEN..(i + 1) * SEGMENT_LEN]).collect();

        PathKey { pathname: segments.join("/"), filename: hex }
    }
}

/// Identity transform used by tests: `pathname = filename = key`.
#[derive(Clone, Copy, Debug, Default)]
pub struct IdentityTransform;

impl PathTransform for IdentityTransform {
    fn transform(&self, key: &str) -> PathKey {
        PathKey { pathname: key.to_string(), filename: key.to_string() }
    }
}
