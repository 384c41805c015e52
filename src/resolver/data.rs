//! Uniform access to Secret and ConfigMap payloads

use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Objects whose payload is a map of named entries
pub trait DataObject {
    /// All entries, decoded to bytes and sorted by key
    fn entries(&self) -> BTreeMap<String, Vec<u8>>;
}

impl DataObject for Secret {
    fn entries(&self) -> BTreeMap<String, Vec<u8>> {
        let mut entries: BTreeMap<String, Vec<u8>> = self
            .data
            .iter()
            .flatten()
            .map(|(k, v)| (k.clone(), v.0.clone()))
            .collect();
        for (k, v) in self.string_data.iter().flatten() {
            entries.insert(k.clone(), v.clone().into_bytes());
        }
        entries
    }
}

impl DataObject for ConfigMap {
    fn entries(&self) -> BTreeMap<String, Vec<u8>> {
        let mut entries: BTreeMap<String, Vec<u8>> = self
            .data
            .iter()
            .flatten()
            .map(|(k, v)| (k.clone(), v.clone().into_bytes()))
            .collect();
        for (k, v) in self.binary_data.iter().flatten() {
            entries.insert(k.clone(), v.0.clone());
        }
        entries
    }
}

/// Stable digest of a set of entries, 16 hex characters
pub fn content_hash(entries: &BTreeMap<String, Vec<u8>>) -> String {
    let mut hasher = Sha256::new();
    for (key, value) in entries {
        hasher.update(key.as_bytes());
        hasher.update((value.len() as u64).to_be_bytes());
        hasher.update(value);
    }
    format!("{:x}", hasher.finalize())[..16].to_string()
}

/// Full sha256 of `bytes` as lowercase hex
pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Stable digest of `(label, token)` pairs, independent of input order
pub fn aggregate_token<'a>(tokens: impl IntoIterator<Item = (&'a str, &'a str)>) -> String {
    let mut pairs: Vec<_> = tokens.into_iter().collect();
    pairs.sort();
    let mut hasher = Sha256::new();
    for (label, token) in pairs {
        hasher.update(label.as_bytes());
        hasher.update(b"=");
        hasher.update(token.as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())[..16].to_string()
}
