//! Persisted OCI image index (spec §3: `ImageEntry (OCI)`, `ImageIndex`).

use std::collections::HashMap;

use cocoon_core::Document;
use serde::{Deserialize, Serialize};

/// One pulled OCI image.
///
/// Paths are never stored; callers derive `<blobs_dir>/<hex>.erofs` and
/// `<boot>/<hex>/{vmlinuz,initrd.img}` from the digests at query time, so
/// moving `root_dir` never invalidates the index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageEntry {
    /// The (possibly unnormalized) reference this entry was pulled under.
    pub r#ref: String,
    /// Manifest digest, used for the idempotency check on re-pull.
    pub manifest_digest: String,
    /// Layer digests, top layer last (OCI order). Hex only.
    pub layers: Vec<String>,
    /// Hex digest of the layer containing the selected kernel image, if
    /// any layer provided one.
    pub kernel_layer: Option<String>,
    /// Hex digest of the layer containing the selected initrd image.
    pub initrd_layer: Option<String>,
    /// Unix millis at pull time.
    pub created_at: i64,
}

/// Whether a layer (identified by hex digest) was found, on a previous
/// pull, to contain a boot file. Cached independently of any single image
/// entry since layers are shared across images (spec §4.3 step 4: "an
/// entry in the index recording this digest as a boot layer").
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerBootFiles {
    /// This layer contains a `vmlinuz*` file.
    pub kernel: bool,
    /// This layer contains an `initrd.img*` file.
    pub initrd: bool,
}

impl LayerBootFiles {
    /// `true` if this layer is evidence of nothing — the common case for
    /// the overwhelming majority of OCI layers.
    #[must_use]
    pub const fn is_none(self) -> bool {
        !self.kernel && !self.initrd
    }
}

/// `{images: ref -> entry}`, plus lookup by normalized ref and by manifest
/// digest.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ImageIndex {
    /// Keyed by the exact reference string the user pulled.
    pub images: HashMap<String, ImageEntry>,
    /// Keyed by layer hex digest. Populated the first time a layer is
    /// scanned for boot files; consulted on later pulls so a cached layer
    /// never needs re-downloading just to learn it has none.
    #[serde(default)]
    pub layer_boot: HashMap<String, LayerBootFiles>,
}

impl Document for ImageIndex {
    fn init(&mut self) {
        // serde's `HashMap` default already deserializes `null` to an empty
        // map, but an explicit init keeps this symmetric with VMIndex/
        // NetworkIndex, whose nested maps need it.
    }
}

impl ImageIndex {
    /// Exact → normalized → manifest-digest lookup, per spec §4.3 Config.
    #[must_use]
    pub fn resolve(&self, r#ref: &str) -> Option<&ImageEntry> {
        if let Some(e) = self.images.get(r#ref) {
            return Some(e);
        }
        let normalized = normalize_ref(r#ref);
        if let Some(e) = self.images.get(&normalized) {
            return Some(e);
        }
        self.images
            .values()
            .find(|e| e.manifest_digest == r#ref || normalize_ref(&e.r#ref) == normalized)
    }

    /// Every hex digest referenced by any entry (layers, kernel, initrd) —
    /// the "keep set" half of I1.
    #[must_use]
    pub fn referenced_hexes(&self) -> std::collections::BTreeSet<String> {
        let mut set = std::collections::BTreeSet::new();
        for entry in self.images.values() {
            set.extend(entry.layers.iter().cloned());
        }
        set
    }
}

/// Normalizes a short ref like `ubuntu:24.04` to its canonical
/// `docker.io/library/ubuntu:24.04` form, so `image pull ubuntu:24.04` and
/// a later `image inspect docker.io/library/ubuntu:24.04` agree.
#[must_use]
pub fn normalize_ref(r#ref: &str) -> String {
    if r#ref.contains('/') {
        return r#ref.to_owned();
    }
    let (name, tag) = r#ref.split_once(':').unwrap_or((r#ref, "latest"));
    format!("docker.io/library/{name}:{tag}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_short_refs() {
        assert_eq!(
            normalize_ref("ubuntu:24.04"),
            "docker.io/library/ubuntu:24.04"
        );
        assert_eq!(normalize_ref("ubuntu"), "docker.io/library/ubuntu:latest");
        assert_eq!(
            normalize_ref("ghcr.io/foo/bar:tag"),
            "ghcr.io/foo/bar:tag"
        );
    }

    #[test]
    fn resolve_matches_normalized_ref() {
        let mut index = ImageIndex::default();
        index.images.insert(
            "docker.io/library/ubuntu:24.04".to_owned(),
            ImageEntry {
                r#ref: "docker.io/library/ubuntu:24.04".to_owned(),
                manifest_digest: "sha256:abc".to_owned(),
                layers: vec!["deadbeef".to_owned()],
                kernel_layer: Some("deadbeef".to_owned()),
                initrd_layer: Some("deadbeef".to_owned()),
                created_at: 0,
            },
        );
        assert!(index.resolve("ubuntu:24.04").is_some());
        assert!(index.resolve("sha256:abc").is_some());
        assert!(index.resolve("nope:latest").is_none());
    }
}
