#![forbid(unsafe_code)]

//! JSON-file storage backend: the default persistent medium.
//!
//! One file holds the whole `key -> encoded string` map as a JSON object.
//! Writes go through a sibling temp file and a rename, so a crash mid-write
//! leaves the previous file intact. [`FileStorage::poll_external`] re-reads
//! the file and diffs it against the last snapshot this handle saw, so a
//! write by another process (the analog of another browser tab touching the
//! same `localStorage`) surfaces as per-key [`ExternalChange`] events.
//!
//! # Failure Modes
//!
//! | Failure | Cause | Behavior |
//! |---------|-------|----------|
//! | Missing file | First run | Start empty, no error |
//! | Corrupt file | Partial write by a non-conforming writer | Warn, start empty |
//! | Unreadable file | Permissions, I/O | Warn, start empty |
//! | Write failure | Disk full, permissions | `StorageError::Write` to caller |

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use crate::error::StorageError;
use crate::storage::{ExternalChange, StorageBackend};

/// Persistent key-value backend over a single JSON file.
///
/// Cloning shares the snapshot; create a second `FileStorage` on the same
/// path to model a separate process.
#[derive(Debug, Clone)]
pub struct FileStorage {
    path: PathBuf,
    entries: Rc<RefCell<BTreeMap<String, String>>>,
}

impl FileStorage {
    /// Open (or lazily create) the store file at `path`.
    ///
    /// A missing file starts empty; a corrupt or unreadable one is logged
    /// and treated as empty rather than failing construction.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = Self::load(&path);
        Self {
            path,
            entries: Rc::new(RefCell::new(entries)),
        }
    }

    /// The backing file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(path: &Path) -> BTreeMap<String, String> {
        match fs::read_to_string(path) {
            Ok(body) => match serde_json::from_str(&body) {
                Ok(entries) => entries,
                Err(err) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %err,
                        "store file is corrupt; starting empty"
                    );
                    BTreeMap::new()
                }
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %err,
                    "store file is unreadable; starting empty"
                );
                BTreeMap::new()
            }
        }
    }

    /// Write the full map out atomically: temp file in the same directory,
    /// then rename over the target.
    fn persist(&self) -> Result<(), StorageError> {
        let body = serde_json::to_string_pretty(&*self.entries.borrow()).map_err(|err| {
            StorageError::Write {
                detail: err.to_string(),
            }
        })?;
        let tmp = self.tmp_path();
        fs::write(&tmp, body).map_err(|err| StorageError::Write {
            detail: format!("{}: {err}", tmp.display()),
        })?;
        fs::rename(&tmp, &self.path).map_err(|err| StorageError::Write {
            detail: format!("{}: {err}", self.path.display()),
        })
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map_or_else(|| OsString::from("keyhold-store.json"), OsString::from);
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl StorageBackend for FileStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.entries.borrow().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.entries
            .borrow_mut()
            .insert(key.to_string(), value.to_string());
        self.persist()
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let removed = self.entries.borrow_mut().remove(key).is_some();
        if removed { self.persist() } else { Ok(()) }
    }

    /// Re-read the file and report every key whose stored string differs
    /// from the last snapshot this handle saw. The handle's own writes went
    /// through the snapshot, so they never echo back.
    fn poll_external(&self) -> Vec<ExternalChange> {
        let disk = Self::load(&self.path);
        let mut entries = self.entries.borrow_mut();
        let mut changes = Vec::new();

        for (key, value) in &disk {
            if entries.get(key) != Some(value) {
                changes.push(ExternalChange {
                    key: key.clone(),
                    value: Some(value.clone()),
                });
            }
        }
        for key in entries.keys() {
            if !disk.contains_key(key) {
                changes.push(ExternalChange {
                    key: key.clone(),
                    value: None,
                });
            }
        }

        *entries = disk;
        changes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_path(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join("store.json")
    }

    #[test]
    fn missing_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(store_path(&dir));
        assert_eq!(storage.get("k").unwrap(), None);
    }

    #[test]
    fn set_then_reopen_survives() {
        let dir = tempfile::tempdir().unwrap();
        let path = store_path(&dir);

        let storage = FileStorage::new(&path);
        storage.set("k", "\"v\"").unwrap();
        drop(storage);

        let reopened = FileStorage::new(&path);
        assert_eq!(reopened.get("k").unwrap(), Some("\"v\"".to_string()));
    }

    #[test]
    fn corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = store_path(&dir);
        fs::write(&path, "{truncated").unwrap();

        let storage = FileStorage::new(&path);
        assert_eq!(storage.get("k").unwrap(), None);
    }

    #[test]
    fn remove_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = store_path(&dir);

        let storage = FileStorage::new(&path);
        storage.set("k", "1").unwrap();
        storage.remove("k").unwrap();

        let reopened = FileStorage::new(&path);
        assert_eq!(reopened.get("k").unwrap(), None);
    }

    #[test]
    fn own_writes_do_not_echo_as_external() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(store_path(&dir));
        storage.set("k", "1").unwrap();
        assert!(storage.poll_external().is_empty());
    }

    #[test]
    fn foreign_write_surfaces_as_external_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = store_path(&dir);

        let ours = FileStorage::new(&path);
        ours.set("k", "1").unwrap();

        // Another "process" opens the same file and writes.
        let theirs = FileStorage::new(&path);
        theirs.set("k", "2").unwrap();
        theirs.set("other", "9").unwrap();

        let mut events = ours.poll_external();
        events.sort_by(|a, b| a.key.cmp(&b.key));
        assert_eq!(
            events,
            vec![
                ExternalChange {
                    key: "k".into(),
                    value: Some("2".into()),
                },
                ExternalChange {
                    key: "other".into(),
                    value: Some("9".into()),
                },
            ]
        );
        // Snapshot caught up; nothing further.
        assert!(ours.poll_external().is_empty());
    }

    #[test]
    fn foreign_removal_surfaces_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = store_path(&dir);

        let ours = FileStorage::new(&path);
        ours.set("k", "1").unwrap();

        let theirs = FileStorage::new(&path);
        theirs.remove("k").unwrap();

        assert_eq!(
            ours.poll_external(),
            vec![ExternalChange {
                key: "k".into(),
                value: None,
            }]
        );
    }

    #[test]
    fn no_temp_file_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(store_path(&dir));
        storage.set("k", "1").unwrap();

        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![OsString::from("store.json")]);
    }
}
