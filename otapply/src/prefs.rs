// SPDX-FileCopyrightText: 2025 The otapply Authors
// SPDX-License-Identifier: GPL-3.0-only

//! Small key/value store for update state that must survive process and
//! system restarts. Values are stored one file per key so that each write is
//! independent and a torn write corrupts at most one key.

use std::{
    collections::HashMap,
    fs, io,
    path::{Path, PathBuf},
};

use thiserror::Error;

pub const MANIFEST_METADATA_SIZE: &str = "manifest-metadata-size";
pub const UPDATE_STATE_NEXT_OPERATION: &str = "update-state-next-operation";
pub const UPDATE_STATE_NEXT_DATA_OFFSET: &str = "update-state-next-data-offset";
pub const UPDATE_STATE_SHA256_CONTEXT: &str = "update-state-sha256-context";
pub const UPDATE_STATE_SIGNED_SHA256_CONTEXT: &str = "update-state-signed-sha256-context";
pub const UPDATE_STATE_SIGNATURE_BLOB: &str = "update-state-signature-blob";
pub const UPDATE_CHECK_RESPONSE_HASH: &str = "update-check-response-hash";
pub const RESUMED_UPDATE_FAILURES: &str = "resumed-update-failures";

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to read pref {0:?}")]
    Read(String, #[source] io::Error),
    #[error("Failed to write pref {0:?}")]
    Write(String, #[source] io::Error),
    #[error("Failed to remove pref {0:?}")]
    Remove(String, #[source] io::Error),
    #[error("Pref {0:?} is not a valid integer")]
    ParseInt(String, #[source] std::num::ParseIntError),
}

pub type Result<T> = std::result::Result<T, Error>;

pub trait PrefStore {
    /// Returns the stored value or `None` if the key has never been set.
    fn get_string(&self, key: &str) -> Result<Option<String>>;

    fn set_string(&mut self, key: &str, value: &str) -> Result<()>;

    /// Removes the key. Removing an absent key is not an error.
    fn remove(&mut self, key: &str) -> Result<()>;

    fn get_i64(&self, key: &str) -> Result<Option<i64>> {
        self.get_string(key)?
            .map(|v| {
                v.trim()
                    .parse()
                    .map_err(|e| Error::ParseInt(key.to_owned(), e))
            })
            .transpose()
    }

    fn set_i64(&mut self, key: &str, value: i64) -> Result<()> {
        self.set_string(key, &value.to_string())
    }
}

/// Pref store backed by a directory with one file per key.
#[derive(Debug)]
pub struct FilePrefs {
    directory: PathBuf,
}

impl FilePrefs {
    pub fn new(directory: &Path) -> Result<Self> {
        fs::create_dir_all(directory)
            .map_err(|e| Error::Write(directory.to_string_lossy().into_owned(), e))?;

        Ok(Self {
            directory: directory.to_owned(),
        })
    }

    fn key_path(&self, key: &str) -> PathBuf {
        self.directory.join(key)
    }
}

impl PrefStore for FilePrefs {
    fn get_string(&self, key: &str) -> Result<Option<String>> {
        match fs::read_to_string(self.key_path(key)) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Read(key.to_owned(), e)),
        }
    }

    fn set_string(&mut self, key: &str, value: &str) -> Result<()> {
        fs::write(self.key_path(key), value).map_err(|e| Error::Write(key.to_owned(), e))
    }

    fn remove(&mut self, key: &str) -> Result<()> {
        match fs::remove_file(self.key_path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Remove(key.to_owned(), e)),
        }
    }
}

/// In-memory pref store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemPrefs {
    values: HashMap<String, String>,
}

impl MemPrefs {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PrefStore for MemPrefs {
    fn get_string(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.get(key).cloned())
    }

    fn set_string(&mut self, key: &str, value: &str) -> Result<()> {
        self.values.insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<()> {
        self.values.remove(key);
        Ok(())
    }
}
