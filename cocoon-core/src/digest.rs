//! Content-addressing digest type shared by both image backends.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

/// An opaque `"sha256:<64 hex>"` content identifier.
///
/// Used to name blobs and manifests; the hex form (without the `sha256:`
/// prefix) is what appears in on-disk file names (`<hex>.erofs`,
/// `<hex>.qcow2`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Digest(String);

impl Digest {
    /// Wraps an existing `"sha256:<hex>"` string without validation, for
    /// values already known to be well-formed (e.g. from a registry
    /// manifest).
    #[must_use]
    pub fn new(full: impl Into<String>) -> Self {
        Self(full.into())
    }

    /// Builds a digest from raw hex (no `sha256:` prefix), prefixing it.
    #[must_use]
    pub fn from_hex(hex: impl AsRef<str>) -> Self {
        Self(format!("sha256:{}", hex.as_ref()))
    }

    /// Computes the digest of a byte slice.
    #[must_use]
    pub fn of(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self::from_hex(hex_encode(&hasher.finalize()))
    }

    /// Returns the hex-only form, stripping the `sha256:` prefix if present.
    #[must_use]
    pub fn hex(&self) -> &str {
        self.0.strip_prefix("sha256:").unwrap_or(&self.0)
    }

    /// Returns the full `"sha256:<hex>"` form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for Digest {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// A streaming SHA-256 accumulator used by both the OCI tar pipeline and
/// the cloud-image downloader to compute a digest without buffering the
/// whole payload in memory.
#[derive(Debug, Default)]
pub struct StreamingHasher(Sha256);

impl StreamingHasher {
    /// Creates an empty hasher.
    #[must_use]
    pub fn new() -> Self {
        Self(Sha256::new())
    }

    /// Feeds a chunk of bytes.
    pub fn update(&mut self, chunk: &[u8]) {
        self.0.update(chunk);
    }

    /// Finalizes and returns the resulting [`Digest`].
    #[must_use]
    pub fn finish(self) -> Digest {
        Digest::from_hex(hex_encode(&self.0.finalize()))
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(s, "{b:02x}");
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_strips_prefix() {
        let d = Digest::new("sha256:abcd");
        assert_eq!(d.hex(), "abcd");
        assert_eq!(d.as_str(), "sha256:abcd");
    }

    #[test]
    fn of_matches_streaming() {
        let whole = Digest::of(b"hello world");
        let mut hasher = StreamingHasher::new();
        hasher.update(b"hello ");
        hasher.update(b"world");
        assert_eq!(whole, hasher.finish());
    }
}
