//! Persisted cloud-image index (spec §3: `ImageEntry (cloudimg)`).

use std::collections::HashMap;

use cocoon_core::Document;
use serde::{Deserialize, Serialize};

/// One converted cloud image, keyed by the source URL it was pulled from.
///
/// Paths are never stored; callers derive `<blobs_dir>/<hex>.qcow2` from
/// `content_sum` at query time, same convention as the OCI index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageEntry {
    /// The source URL this entry was pulled from.
    pub r#ref: String,
    /// Full `"sha256:<hex>"` digest of the converted qcow2 blob.
    pub content_sum: String,
    /// Size in bytes of the converted qcow2 blob.
    pub size: u64,
    /// Unix millis at pull time.
    pub created_at: i64,
}

/// `{images: url -> entry}`.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ImageIndex {
    /// Keyed by the exact URL the user pulled.
    pub images: HashMap<String, ImageEntry>,
}

impl Document for ImageIndex {
    fn init(&mut self) {}
}

impl ImageIndex {
    /// Exact URL lookup, falling back to content-sum lookup so `inspect`
    /// accepts either form, mirroring the OCI index's ref/digest duality.
    #[must_use]
    pub fn resolve(&self, r#ref: &str) -> Option<&ImageEntry> {
        if let Some(e) = self.images.get(r#ref) {
            return Some(e);
        }
        self.images.values().find(|e| e.content_sum == r#ref)
    }

    /// Every hex digest referenced by any entry — the "keep set" half of
    /// I1 for this backend.
    #[must_use]
    pub fn referenced_hexes(&self) -> std::collections::BTreeSet<String> {
        self.images
            .values()
            .map(|e| e.content_sum.trim_start_matches("sha256:").to_owned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_matches_content_sum() {
        let mut index = ImageIndex::default();
        index.images.insert(
            "https://example.com/ubuntu.img".to_owned(),
            ImageEntry {
                r#ref: "https://example.com/ubuntu.img".to_owned(),
                content_sum: "sha256:deadbeef".to_owned(),
                size: 1024,
                created_at: 0,
            },
        );
        assert!(index.resolve("https://example.com/ubuntu.img").is_some());
        assert!(index.resolve("sha256:deadbeef").is_some());
        assert!(index.resolve("https://example.com/missing.img").is_none());
        assert_eq!(
            index.referenced_hexes(),
            std::collections::BTreeSet::from(["deadbeef".to_owned()])
        );
    }
}
