// SPDX-FileCopyrightText: 2025 The otapply Authors
// SPDX-License-Identifier: GPL-3.0-only

//! RSA-2048 signature handling for payloads.
//!
//! Signatures are not standard PKCS#1 v1.5 signatures of the data. The signer
//! pads the SHA-256 digest with the fixed PKCS#1 v1.5 + ASN.1 prefix below and
//! encrypts the padded block directly with the private key. Verification runs
//! the raw public key operation and compares the full 256-byte result against
//! the locally computed padded digest, padding bytes included.

use std::path::Path;

use num_bigint_dig::BigUint;
use prost::Message;
use rsa::{RsaPublicKey, pkcs8::DecodePublicKey, traits::PublicKeyParts};
use thiserror::Error;

use crate::protobuf::update_engine::Signatures;

/// Modulus size this implementation supports, in bytes.
pub const SIGNATURE_SIZE: usize = 256;

/// ASN.1 DigestInfo prefix for SHA-256 (NIST OID 2.16.840.1.101.3.4.2.1).
const SHA256_DIGEST_INFO_PREFIX: [u8; 19] = [
    0x30, 0x31, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x01,
    0x05, 0x00, 0x04, 0x20,
];

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to load public key: {path:?}")]
    LoadKey {
        path: std::path::PathBuf,
        #[source]
        source: rsa::pkcs8::spki::Error,
    },
    #[error("Unsupported public key size: {0} bytes")]
    UnsupportedKeySize(usize),
    #[error("Failed to decode signatures protobuf")]
    SignaturesParse(#[from] prost::DecodeError),
    #[error("No signature found for version {0}")]
    NoMatchingSignature(u32),
    #[error("Invalid signature size: {0} bytes")]
    InvalidSignatureSize(usize),
    #[error("Recovered signature does not match expected digest")]
    DigestMismatch,
}

type Result<T> = std::result::Result<T, Error>;

/// Loads an RSA-2048 public key from a PEM-encoded SPKI file.
pub fn load_public_key(path: &Path) -> Result<RsaPublicKey> {
    let key = RsaPublicKey::read_public_key_pem_file(path).map_err(|e| Error::LoadKey {
        path: path.to_owned(),
        source: e,
    })?;

    if key.size() != SIGNATURE_SIZE {
        return Err(Error::UnsupportedKeySize(key.size()));
    }

    Ok(key)
}

/// Pads a SHA-256 digest into the full RSA block that the signer encrypts:
/// `0x00 0x01 <0xff...> 0x00 <DigestInfo> <digest>`.
pub fn pad_sha256_digest(digest: &[u8; 32]) -> [u8; SIGNATURE_SIZE] {
    const PREFIX_END: usize = SIGNATURE_SIZE - 32 - SHA256_DIGEST_INFO_PREFIX.len();

    let mut padded = [0xffu8; SIGNATURE_SIZE];
    padded[0] = 0x00;
    padded[1] = 0x01;
    padded[PREFIX_END - 1] = 0x00;
    padded[PREFIX_END..SIGNATURE_SIZE - 32].copy_from_slice(&SHA256_DIGEST_INFO_PREFIX);
    padded[SIGNATURE_SIZE - 32..].copy_from_slice(digest);
    padded
}

/// Raw RSA public key operation (modular exponentiation with the public
/// exponent), with no padding applied or checked.
pub fn raw_public_op(key: &RsaPublicKey, data: &[u8; SIGNATURE_SIZE]) -> [u8; SIGNATURE_SIZE] {
    let recovered = BigUint::from_bytes_be(data).modpow(key.e(), key.n());

    // Restore leading zeros stripped by the bignum representation.
    let bytes = recovered.to_bytes_be();
    let mut out = [0u8; SIGNATURE_SIZE];
    out[SIGNATURE_SIZE - bytes.len()..].copy_from_slice(&bytes);
    out
}

/// Decodes a `Signatures` protobuf, selects the signature matching `version`,
/// and recovers the padded digest block with the public key.
pub fn recover_signed_digest(
    signatures_blob: &[u8],
    key: &RsaPublicKey,
    version: u32,
) -> Result<[u8; SIGNATURE_SIZE]> {
    let signatures = Signatures::decode(signatures_blob)?;

    let signature = signatures
        .signatures
        .iter()
        .find(|s| s.version() == version)
        .ok_or(Error::NoMatchingSignature(version))?;

    let data: &[u8; SIGNATURE_SIZE] = signature
        .data()
        .try_into()
        .map_err(|_| Error::InvalidSignatureSize(signature.data().len()))?;

    Ok(raw_public_op(key, data))
}

/// Verifies a detached signature of `digest`: the raw public key operation on
/// `signature` must reproduce the padded digest block exactly.
pub fn verify_raw_signature(
    key: &RsaPublicKey,
    digest: &[u8; 32],
    signature: &[u8],
) -> Result<()> {
    let signature: &[u8; SIGNATURE_SIZE] = signature
        .try_into()
        .map_err(|_| Error::InvalidSignatureSize(signature.len()))?;

    let recovered = raw_public_op(key, signature);
    if recovered != pad_sha256_digest(digest) {
        return Err(Error::DigestMismatch);
    }

    Ok(())
}
