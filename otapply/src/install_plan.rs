// SPDX-FileCopyrightText: 2025 The otapply Authors
// SPDX-License-Identifier: GPL-3.0-only

//! Trusted description of the update to apply. In production this comes from
//! the update server's signed response; here it can also be loaded from a
//! TOML file. Everything the payload itself claims is cross-checked against
//! this plan.

use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to read plan: {path:?}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse plan: {path:?}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml_edit::de::Error,
    },
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct InstallPlan {
    /// Block device or image file receiving the rootfs operations.
    pub partition_path: PathBuf,
    /// Block device or image file receiving the kernel operations, if any.
    #[serde(default)]
    pub kernel_path: Option<PathBuf>,

    /// Expected total payload size, signatures included.
    pub payload_size: u64,
    /// Expected SHA-256 of the payload, excluding the trailing signatures.
    #[serde(with = "hex")]
    pub payload_hash: Vec<u8>,

    /// Expected size of the payload metadata (header plus manifest).
    pub metadata_size: u64,
    /// Base64-encoded detached signature of the metadata bytes.
    #[serde(default)]
    pub metadata_signature: Option<String>,

    /// When true, missing or mismatched sizes and hashes are fatal instead of
    /// logged. Set for payloads fetched over untrusted transports.
    #[serde(default)]
    pub hash_checks_mandatory: bool,

    /// Expected SHA-256 of the rootfs before a delta payload is applied.
    #[serde(default, with = "hex_opt")]
    pub old_partition_hash: Option<Vec<u8>>,
    /// Expected SHA-256 of the kernel before a delta payload is applied.
    #[serde(default, with = "hex_opt")]
    pub old_kernel_hash: Option<Vec<u8>>,
}

impl InstallPlan {
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|e| Error::Read {
            path: path.to_owned(),
            source: e,
        })?;

        toml_edit::de::from_str(&contents).map_err(|e| Error::Parse {
            path: path.to_owned(),
            source: e,
        })
    }
}

mod hex_opt {
    use serde::{Deserialize, Deserializer, Serializer, de};

    pub fn serialize<S: Serializer>(
        value: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(data) => serializer.serialize_some(&hex::encode(data)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|s| hex::decode(s).map_err(de::Error::custom))
            .transpose()
    }
}
