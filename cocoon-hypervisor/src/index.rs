//! Persisted VM index (spec §3: `VMIndex`) and `ref` resolution.

use std::collections::HashMap;

use cocoon_core::error::{Error, Result};
use cocoon_core::model::VmRecord;
use cocoon_core::Document;
use serde::{Deserialize, Serialize};

/// Shortest id prefix `resolve` accepts, below which ambiguity is too
/// likely to be useful (spec §4.6: "an id prefix of ≥3 chars").
const MIN_PREFIX_LEN: usize = 3;

/// `{vms: id -> record, names: name -> id}` (spec §3).
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct VmIndex {
    /// Every persisted VM record, keyed by id.
    pub vms: HashMap<String, VmRecord>,
    /// Name uniqueness index (I2): `names[r.config.name] == r.id`.
    pub names: HashMap<String, String>,
}

impl Document for VmIndex {
    fn init(&mut self) {
        // serde already defaults missing maps to empty; nothing to repair.
    }
}

impl VmIndex {
    /// Resolves `reference` to a single record: exact id, exact name, or an
    /// id prefix of at least [`MIN_PREFIX_LEN`] chars matching exactly one
    /// id. Ambiguous prefixes are rejected rather than picking arbitrarily.
    pub fn resolve(&self, reference: &str) -> Result<&VmRecord> {
        if let Some(record) = self.vms.get(reference) {
            return Ok(record);
        }
        if let Some(id) = self.names.get(reference) {
            return self.vms.get(id).ok_or_else(|| Error::NotFound(reference.to_owned()));
        }
        if reference.len() >= MIN_PREFIX_LEN {
            let mut matches = self.vms.iter().filter(|(id, _)| id.starts_with(reference));
            if let Some((_, record)) = matches.next() {
                if matches.next().is_some() {
                    return Err(Error::Ambiguous(reference.to_owned()));
                }
                return Ok(record);
            }
        }
        Err(Error::NotFound(reference.to_owned()))
    }

    /// Resolves `reference` the same way as [`VmIndex::resolve`] but
    /// returns the id rather than borrowing the record, for callers that
    /// need to mutate `self` afterwards.
    pub fn resolve_id(&self, reference: &str) -> Result<String> {
        self.resolve(reference).map(|r| r.vm.id.clone())
    }

    /// `true` if `name` is already taken by a different id (I2).
    #[must_use]
    pub fn name_taken(&self, name: &str) -> bool {
        self.names.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cocoon_core::model::{Vm, VmConfig, VmState};

    fn record(id: &str, name: &str) -> VmRecord {
        VmRecord {
            vm: Vm {
                id: id.to_owned(),
                state: VmState::Created,
                config: VmConfig {
                    name: name.to_owned(),
                    cpu: 1,
                    memory_bytes: 1 << 30,
                    storage_bytes: 1 << 30,
                    image: "ubuntu:24.04".to_owned(),
                },
                created_at: 0,
                updated_at: 0,
                started_at: None,
                stopped_at: None,
                console_path: None,
            },
            storage_configs: Vec::new(),
            network_configs: Vec::new(),
            boot_config: None,
            image_blob_ids: std::collections::BTreeSet::new(),
        }
    }

    #[test]
    fn resolves_by_exact_id_name_or_unambiguous_prefix() {
        let mut idx = VmIndex::default();
        idx.vms.insert("abcdef0123456789".to_owned(), record("abcdef0123456789", "web"));
        idx.names.insert("web".to_owned(), "abcdef0123456789".to_owned());

        assert_eq!(idx.resolve("abcdef0123456789").unwrap().vm.id, "abcdef0123456789");
        assert_eq!(idx.resolve("web").unwrap().vm.id, "abcdef0123456789");
        assert_eq!(idx.resolve("abc").unwrap().vm.id, "abcdef0123456789");
    }

    #[test]
    fn rejects_prefix_shorter_than_three_chars_with_no_exact_match() {
        let mut idx = VmIndex::default();
        idx.vms.insert("abcdef0123456789".to_owned(), record("abcdef0123456789", "web"));
        assert!(matches!(idx.resolve("ab"), Err(Error::NotFound(_))));
    }

    #[test]
    fn rejects_ambiguous_prefix() {
        let mut idx = VmIndex::default();
        idx.vms.insert("abc1111111111111".to_owned(), record("abc1111111111111", "a"));
        idx.vms.insert("abc2222222222222".to_owned(), record("abc2222222222222", "b"));
        assert!(matches!(idx.resolve("abc"), Err(Error::Ambiguous(_))));
    }

    #[test]
    fn name_taken_reflects_names_map() {
        let mut idx = VmIndex::default();
        idx.names.insert("web".to_owned(), "abc".to_owned());
        assert!(idx.name_taken("web"));
        assert!(!idx.name_taken("db"));
    }
}
