// SPDX-FileCopyrightText: 2025 The otapply Authors
// SPDX-License-Identifier: GPL-3.0-only

//! Codec for the update payload container. The layout is:
//!
//! - `magic`: "CrAU" (4 bytes)
//! - `version`: u64 big endian
//! - `manifest_size`: u64 big endian
//! - `manifest`: [`DeltaArchiveManifest`] protobuf
//! - operation blobs, in stream order, followed by an optional `Signatures`
//!   protobuf at `manifest.signatures_offset`
//!
//! Everything before the first blob is the payload metadata.

use num_traits::ToPrimitive;
use prost::Message;
use thiserror::Error;

use crate::protobuf::update_engine::DeltaArchiveManifest;

pub const PAYLOAD_MAGIC: &[u8; 4] = b"CrAU";
pub const PAYLOAD_VERSION: u64 = 1;

/// Fixed-size portion of the metadata: magic, version, and manifest size.
pub const PAYLOAD_HEADER_SIZE: usize = 4 + 8 + 8;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid payload magic: {0:?}")]
    InvalidMagic([u8; 4]),
    #[error("Unsupported payload version: {0}")]
    UnsupportedVersion(u64),
    #[error("Manifest size too large: {0}")]
    ManifestTooLarge(u64),
    #[error("Failed to decode manifest protobuf")]
    ManifestParse(#[from] prost::DecodeError),
}

type Result<T> = std::result::Result<T, Error>;

/// Outcome of a metadata parse attempt against a partial stream prefix.
#[derive(Debug)]
pub enum ParsedMetadata {
    /// The prefix is valid so far, but too short to hold the full metadata.
    NeedMoreData,
    Parsed {
        manifest: DeltaArchiveManifest,
        /// Total size of the metadata, i.e. the offset of the first blob.
        metadata_size: u64,
    },
}

/// Parses the payload metadata from a stream prefix. Structural errors (bad
/// magic, unsupported version, undecodable manifest) are fatal. A prefix
/// that's merely too short is reported as [`ParsedMetadata::NeedMoreData`].
pub fn parse_payload_metadata(data: &[u8]) -> Result<ParsedMetadata> {
    if data.len() < PAYLOAD_HEADER_SIZE {
        // Validate whatever fixed fields are already present so that garbage
        // input fails on the first chunk, not after buffering the header.
        let magic_avail = data.len().min(4);
        if data[..magic_avail] != PAYLOAD_MAGIC[..magic_avail] {
            let mut magic = [0u8; 4];
            magic[..magic_avail].copy_from_slice(&data[..magic_avail]);
            return Err(Error::InvalidMagic(magic));
        }

        return Ok(ParsedMetadata::NeedMoreData);
    }

    let magic: [u8; 4] = data[0..4].try_into().unwrap();
    if &magic != PAYLOAD_MAGIC {
        return Err(Error::InvalidMagic(magic));
    }

    let version = u64::from_be_bytes(data[4..12].try_into().unwrap());
    if version != PAYLOAD_VERSION {
        return Err(Error::UnsupportedVersion(version));
    }

    let manifest_size = u64::from_be_bytes(data[12..20].try_into().unwrap());
    let manifest_size_usize = manifest_size
        .to_usize()
        .ok_or(Error::ManifestTooLarge(manifest_size))?;
    let metadata_size = PAYLOAD_HEADER_SIZE
        .checked_add(manifest_size_usize)
        .ok_or(Error::ManifestTooLarge(manifest_size))?;

    if data.len() < metadata_size {
        return Ok(ParsedMetadata::NeedMoreData);
    }

    let manifest = DeltaArchiveManifest::decode(&data[PAYLOAD_HEADER_SIZE..metadata_size])?;

    Ok(ParsedMetadata::Parsed {
        manifest,
        metadata_size: metadata_size as u64,
    })
}
