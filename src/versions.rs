//! File version store
//!
//! Tracks every spec file the run touches under one shared version counter.
//! Any content change bumps the counter by one and re-stamps every tracked
//! file, so a version number identifies the state of the whole file set.

use crate::util::{hash_str, line_count};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use tracing::debug;

pub const MAX_HISTORY_ENTRIES: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub path: String,
    pub line_count: usize,
    pub version: u64,
    pub content_hash: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileHistoryEntry {
    pub version: u64,
    pub content: String,
    pub content_hash: String,
    pub reason: String,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct VersionStore {
    files: HashMap<String, FileMetadata>,
    history: HashMap<String, VecDeque<FileHistoryEntry>>,
    version: u64,
}

impl VersionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_version(&self) -> u64 {
        self.version
    }

    /// Register `file` at the current version. An already tracked file is
    /// returned unchanged, whatever `content` says.
    pub fn get_or_create(&mut self, file: &str, content: &str) -> FileMetadata {
        let version = self.version;
        self.files
            .entry(file.to_string())
            .or_insert_with(|| FileMetadata {
                path: file.to_string(),
                line_count: line_count(content),
                version,
                content_hash: hash_str(content),
            })
            .clone()
    }

    /// Record new content for `file`. The counter moves only when the file is
    /// new or its hash changed.
    pub fn update(&mut self, file: &str, content: &str) -> FileMetadata {
        let hash = hash_str(content);
        if let Some(meta) = self.files.get(file) {
            if meta.content_hash == hash {
                return meta.clone();
            }
        }

        self.version += 1;
        let version = self.version;
        let meta = FileMetadata {
            path: file.to_string(),
            line_count: line_count(content),
            version,
            content_hash: hash,
        };
        self.files.insert(file.to_string(), meta.clone());
        for tracked in self.files.values_mut() {
            tracked.version = version;
        }
        debug!(file, version, "File content changed");
        meta
    }

    /// Append `content` to the file's history unless that exact content is
    /// already recorded. Returns whether an entry was added.
    pub fn save_to_history(&mut self, file: &str, content: &str, reason: &str) -> bool {
        let hash = hash_str(content);
        let entries = self.history.entry(file.to_string()).or_default();
        if entries.iter().any(|e| e.content_hash == hash) {
            return false;
        }
        if entries.len() >= MAX_HISTORY_ENTRIES {
            entries.pop_front();
        }
        entries.push_back(FileHistoryEntry {
            version: self.version,
            content: content.to_string(),
            content_hash: hash,
            reason: reason.to_string(),
            recorded_at: Utc::now(),
        });
        true
    }

    pub fn metadata(&self, file: &str) -> Option<&FileMetadata> {
        self.files.get(file)
    }

    /// Oldest first.
    pub fn history(&self, file: &str) -> Vec<&FileHistoryEntry> {
        self.history
            .get(file)
            .map(|entries| entries.iter().collect())
            .unwrap_or_default()
    }

    /// Most recent entry recorded at `version`.
    pub fn history_entry(&self, file: &str, version: u64) -> Option<&FileHistoryEntry> {
        self.history
            .get(file)?
            .iter()
            .rev()
            .find(|e| e.version == version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_file_gets_current_version_without_bump() {
        let mut store = VersionStore::new();
        let meta = store.get_or_create("main.tsp", "a\nb\n");
        assert_eq!(meta.version, 0);
        assert_eq!(meta.line_count, 2);
        assert_eq!(store.current_version(), 0);
    }

    #[test]
    fn test_change_restamps_every_tracked_file() {
        let mut store = VersionStore::new();
        store.update("main.tsp", "model A {}");
        store.update("client.tsp", "import \"./main.tsp\";");
        let before = store.current_version();

        let meta = store.update(
            "client.tsp",
            "import \"./main.tsp\";\n@@access(A, Access.public);",
        );

        assert_eq!(store.current_version(), before + 1);
        assert_eq!(meta.version, before + 1);
        assert_eq!(store.metadata("main.tsp").unwrap().version, before + 1);
        assert_eq!(
            store.metadata("main.tsp").unwrap().content_hash,
            hash_str("model A {}")
        );
    }

    #[test]
    fn test_identical_content_is_idempotent() {
        let mut store = VersionStore::new();
        store.update("main.tsp", "model A {}");
        store.save_to_history("main.tsp", "model A {}", "initial");
        let version = store.current_version();

        store.update("main.tsp", "model A {}");
        store.get_or_create("main.tsp", "model A {}");
        let added = store.save_to_history("main.tsp", "model A {}", "again");

        assert_eq!(store.current_version(), version);
        assert!(!added);
        assert_eq!(store.history("main.tsp").len(), 1);
    }

    #[test]
    fn test_get_or_create_does_not_overwrite() {
        let mut store = VersionStore::new();
        store.update("main.tsp", "one");
        let meta = store.get_or_create("main.tsp", "two");
        assert_eq!(meta.content_hash, hash_str("one"));
    }

    #[test]
    fn test_history_is_capped_and_evicts_oldest() {
        let mut store = VersionStore::new();
        for i in 0..=MAX_HISTORY_ENTRIES {
            let content = format!("version {}", i);
            store.update("client.tsp", &content);
            store.save_to_history("client.tsp", &content, "edit");
        }

        let history = store.history("client.tsp");
        assert_eq!(history.len(), MAX_HISTORY_ENTRIES);
        assert_eq!(history[0].content, "version 1");
        assert_eq!(history.last().unwrap().content, format!("version {}", MAX_HISTORY_ENTRIES));
    }

    #[test]
    fn test_history_entry_lookup_by_version() {
        let mut store = VersionStore::new();
        store.update("client.tsp", "first");
        store.save_to_history("client.tsp", "first", "initial");
        let first_version = store.current_version();
        store.update("client.tsp", "second");
        store.save_to_history("client.tsp", "second", "fix");

        let entry = store.history_entry("client.tsp", first_version).unwrap();
        assert_eq!(entry.content, "first");
        assert_eq!(entry.reason, "initial");
        assert!(store.history_entry("client.tsp", 99).is_none());
    }
}
