use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::model::content::is_primary_hash;
use crate::storage::paths::normalize_relative_path;

pub const MAX_MANIFEST_ENTRIES: usize = 50_000;

/// One `(relativePath, contentHash)` pair of a client manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub path: String,
    pub hash: String,
}

impl ManifestEntry {
    pub fn new(path: impl Into<String>, hash: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            hash: hash.into(),
        }
    }
}

/// The desired file tree of a deploy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Manifest {
    pub entries: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn new(entries: Vec<ManifestEntry>) -> Self {
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Validate and normalize in place: paths become canonical relative keys,
    /// duplicate paths and malformed hashes are rejected.
    pub fn normalize(&mut self) -> Result<(), String> {
        if self.entries.is_empty() {
            return Err("manifest is empty".to_string());
        }
        if self.entries.len() > MAX_MANIFEST_ENTRIES {
            return Err(format!(
                "manifest has {} entries, limit is {}",
                self.entries.len(),
                MAX_MANIFEST_ENTRIES
            ));
        }

        let mut seen = HashSet::with_capacity(self.entries.len());
        for entry in &mut self.entries {
            entry.path = normalize_relative_path(&entry.path)?;
            if !is_primary_hash(&entry.hash) {
                return Err(format!(
                    "hash for '{}' is not a lowercase sha256 hex digest",
                    entry.path
                ));
            }
            if !seen.insert(entry.path.clone()) {
                return Err(format!("duplicate manifest path '{}'", entry.path));
            }
        }
        Ok(())
    }

    /// Distinct hashes in first-seen order
    pub fn unique_hashes(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|e| e.hash.clone())
            .unique()
            .collect()
    }

    pub fn find(&self, path: &str) -> Option<&ManifestEntry> {
        self.entries.iter().find(|e| e.path == path)
    }
}
