/*
 * SPDX-FileCopyrightText: 2024-2025 The delta-applier Authors
 * SPDX-License-Identifier: GPL-3.0-only
 */

//! Typed access to the persistent key-value preferences store used for
//! update progress checkpoints.

use std::{
    collections::HashMap,
    fs::{self, File},
    io::{self, Write},
    path::PathBuf,
    sync::Mutex,
};

use thiserror::Error;

pub const MANIFEST_METADATA_SIZE: &str = "manifest-metadata-size";
pub const UPDATE_STATE_NEXT_OPERATION: &str = "update-state-next-operation";
pub const UPDATE_STATE_NEXT_DATA_OFFSET: &str = "update-state-next-data-offset";
pub const UPDATE_STATE_SHA256_CONTEXT: &str = "update-state-sha256-context";
pub const UPDATE_STATE_SIGNED_SHA256_CONTEXT: &str = "update-state-signed-sha256-context";
pub const UPDATE_CHECK_RESPONSE_HASH: &str = "update-check-response-hash";

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid preference key: {0:?}")]
    InvalidKey(String),
    #[error("Invalid value for key {key:?}: {value:?}")]
    InvalidValue { key: String, value: String },
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Typed get/set interface over the preferences store. Absent keys read as
/// `None`; unparseable values are errors.
pub trait Prefs {
    fn get_string(&self, key: &str) -> Result<Option<String>>;
    fn set_string(&self, key: &str, value: &str) -> Result<()>;

    fn get_i64(&self, key: &str) -> Result<Option<i64>> {
        match self.get_string(key)? {
            Some(value) => match value.trim().parse() {
                Ok(parsed) => Ok(Some(parsed)),
                Err(_) => Err(Error::InvalidValue {
                    key: key.to_owned(),
                    value,
                }),
            },
            None => Ok(None),
        }
    }

    fn set_i64(&self, key: &str, value: i64) -> Result<()> {
        self.set_string(key, &value.to_string())
    }
}

/// Directory-backed store: one file per key. Writes are synced so that a
/// checkpoint that reports success survives a crash.
pub struct FilePrefs {
    prefs_dir: PathBuf,
}

impl FilePrefs {
    pub fn new(prefs_dir: impl Into<PathBuf>) -> Self {
        Self {
            prefs_dir: prefs_dir.into(),
        }
    }

    fn key_path(&self, key: &str) -> Result<PathBuf> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(Error::InvalidKey(key.to_owned()));
        }

        Ok(self.prefs_dir.join(key))
    }
}

impl Prefs for FilePrefs {
    fn get_string(&self, key: &str) -> Result<Option<String>> {
        let path = self.key_path(key)?;

        match fs::read_to_string(&path) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set_string(&self, key: &str, value: &str) -> Result<()> {
        let path = self.key_path(key)?;
        fs::create_dir_all(&self.prefs_dir)?;

        let mut file = File::create(&path)?;
        file.write_all(value.as_bytes())?;
        file.sync_all()?;

        Ok(())
    }
}

/// In-memory store for tests and dry runs.
#[derive(Default)]
pub struct MemoryPrefs {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryPrefs {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Prefs for MemoryPrefs {
    fn get_string(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.lock().unwrap().get(key).cloned())
    }

    fn set_string(&self, key: &str, value: &str) -> Result<()> {
        self.values
            .lock()
            .unwrap()
            .insert(key.to_owned(), value.to_owned());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_prefs_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let prefs = FilePrefs::new(dir.path());

        assert_eq!(prefs.get_string(UPDATE_CHECK_RESPONSE_HASH).unwrap(), None);
        assert_eq!(prefs.get_i64(UPDATE_STATE_NEXT_OPERATION).unwrap(), None);

        prefs.set_string(UPDATE_CHECK_RESPONSE_HASH, "abc123").unwrap();
        prefs.set_i64(UPDATE_STATE_NEXT_OPERATION, -1).unwrap();

        assert_eq!(
            prefs.get_string(UPDATE_CHECK_RESPONSE_HASH).unwrap().as_deref(),
            Some("abc123"),
        );
        assert_eq!(prefs.get_i64(UPDATE_STATE_NEXT_OPERATION).unwrap(), Some(-1));
    }

    #[test]
    fn file_prefs_rejects_path_keys() {
        let dir = tempfile::tempdir().unwrap();
        let prefs = FilePrefs::new(dir.path());

        assert!(matches!(
            prefs.get_string("../escape"),
            Err(Error::InvalidKey(_)),
        ));
        assert!(matches!(prefs.set_i64("", 1), Err(Error::InvalidKey(_))));
    }

    #[test]
    fn unparseable_int_is_an_error() {
        let prefs = MemoryPrefs::new();
        prefs.set_string(UPDATE_STATE_NEXT_DATA_OFFSET, "not a number").unwrap();

        assert!(matches!(
            prefs.get_i64(UPDATE_STATE_NEXT_DATA_OFFSET),
            Err(Error::InvalidValue { .. }),
        ));
    }

    #[test]
    fn memory_prefs_round_trip() {
        let prefs = MemoryPrefs::new();

        assert_eq!(prefs.get_i64(MANIFEST_METADATA_SIZE).unwrap(), None);
        prefs.set_i64(MANIFEST_METADATA_SIZE, 1234).unwrap();
        assert_eq!(prefs.get_i64(MANIFEST_METADATA_SIZE).unwrap(), Some(1234));
    }
}
