// SPDX-FileCopyrightText: 2025 The otapply Authors
// SPDX-License-Identifier: GPL-3.0-only

//! Streaming payload application engine.
//!
//! [`PayloadProcessor`] consumes the payload as an incremental byte stream:
//! the transport calls [`PayloadProcessor::write`] with chunks of any size
//! and the processor applies install operations as soon as their data is
//! fully buffered. Progress is checkpointed to a [`PrefStore`] after every
//! operation so that an interrupted update can resume from where it stopped
//! instead of refetching and reapplying everything.

use std::{
    fmt, io,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use base64::{Engine, engine::general_purpose::STANDARD};
use ring::digest;
use rsa::RsaPublicKey;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    buffer::SlidingBuffer,
    crypto,
    format::{
        extents::is_idempotent_operation,
        payload::{self, ParsedMetadata, parse_payload_metadata},
    },
    hasher::PayloadHasher,
    install_plan::InstallPlan,
    performer::{self, BlockPatcher, PartitionPerformer},
    prefs::{
        self, MANIFEST_METADATA_SIZE, PrefStore, RESUMED_UPDATE_FAILURES,
        UPDATE_CHECK_RESPONSE_HASH, UPDATE_STATE_NEXT_DATA_OFFSET, UPDATE_STATE_NEXT_OPERATION,
        UPDATE_STATE_SHA256_CONTEXT, UPDATE_STATE_SIGNATURE_BLOB,
        UPDATE_STATE_SIGNED_SHA256_CONTEXT,
    },
    protobuf::update_engine::{DeltaArchiveManifest, InstallOperation},
};

/// Version of the signature entry expected in the trailing signatures blob.
pub const SIGNATURE_MESSAGE_VERSION: u32 = 2;

/// Resume is abandoned once this many resumed attempts have failed.
pub const MAX_RESUMED_UPDATE_FAILURES: i64 = 10;

/// Sentinel stored in the next-operation pref while an applied operation has
/// not been checkpointed yet.
const UPDATE_STATE_OPERATION_INVALID: i64 = -1;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Target {
    Rootfs,
    Kernel,
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rootfs => f.write_str("Rootfs"),
            Self::Kernel => f.write_str("Kernel"),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to parse payload")]
    Payload(#[from] payload::Error),
    #[error("Metadata size {actual} does not match expected {expected}")]
    MetadataSizeMismatch { expected: u64, actual: u64 },
    #[error("Mandatory metadata signature is missing from the install plan")]
    MetadataSignatureMissing,
    #[error("Metadata signature does not match the metadata")]
    MetadataSignatureMismatch,
    #[error("Payload contains kernel operations, but no kernel target was configured")]
    MissingKernelTarget,
    #[error("{0} source does not match the hash expected by the payload")]
    SourcePartitionMismatch(Target),
    #[error("Operation {index} has no data hash and hash checks are mandatory")]
    OperationHashMissing { index: usize },
    #[error("Operation {index} data does not match its expected hash")]
    OperationHashMismatch { index: usize },
    #[error("Failed to apply operation {index}")]
    OperationExecution {
        index: usize,
        #[source]
        source: performer::Error,
    },
    #[error("Signatures found at offset {actual}, expected {expected}")]
    SignatureOffsetMismatch { expected: u64, actual: u64 },
    #[error("Payload size {actual} does not match expected {expected}")]
    PayloadSizeMismatch { expected: u64, actual: u64 },
    #[error("Install plan does not specify the expected payload hash")]
    MissingPayloadHash,
    #[error("Payload hash does not match the expected hash")]
    PayloadHashMismatch,
    #[error("Public key is configured, but the payload is not signed")]
    SignedPayloadExpected,
    #[error("Payload signature verification failed")]
    PubKeyVerification(#[source] crypto::Error),
    #[error("Update was cancelled")]
    Cancelled,
    #[error("Stream ended with {0} unprocessed bytes")]
    UnconsumedData(usize),
    #[error("Stream ended after {applied} of {total} operations")]
    IncompleteOperations { applied: usize, total: usize },
    #[error("Failed to persist update state")]
    Prefs(#[from] prefs::Error),
    #[error("I/O error on target device")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Coarse classification used by callers to decide whether to retry, resume,
/// or abandon the update.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    /// Malformed payload. Retrying the same payload will fail the same way.
    Format,
    /// A hash or signature did not match what the install plan promised.
    Integrity,
    /// Transient environment failure. The update may be resumable.
    Environment,
    /// Persisted update state could not be written.
    State,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Payload(_)
            | Self::MissingKernelTarget
            | Self::SignatureOffsetMismatch { .. }
            | Self::UnconsumedData(_)
            | Self::IncompleteOperations { .. } => ErrorKind::Format,
            Self::MetadataSizeMismatch { .. }
            | Self::MetadataSignatureMissing
            | Self::MetadataSignatureMismatch
            | Self::SourcePartitionMismatch(_)
            | Self::OperationHashMissing { .. }
            | Self::OperationHashMismatch { .. }
            | Self::PayloadSizeMismatch { .. }
            | Self::MissingPayloadHash
            | Self::PayloadHashMismatch
            | Self::SignedPayloadExpected
            | Self::PubKeyVerification(_) => ErrorKind::Integrity,
            Self::OperationExecution {
                source: performer::Error::Io(_),
                ..
            }
            | Self::Cancelled
            | Self::Io(_) => ErrorKind::Environment,
            Self::OperationExecution { .. } => ErrorKind::Format,
            Self::Prefs(_) => ErrorKind::State,
        }
    }
}

/// Optional collaborators for a [`PayloadProcessor`].
#[derive(Default)]
pub struct Options {
    /// Public key for metadata and payload signature verification. Without
    /// it, signature checks are skipped with a warning.
    pub public_key: Option<RsaPublicKey>,
    /// Patcher for binary diff operations. Full payloads don't need one.
    pub patcher: Option<Box<dyn BlockPatcher>>,
    /// Checked at operation boundaries; when set, processing stops with
    /// [`Error::Cancelled`] and the update stays resumable.
    pub cancel_signal: Option<Arc<AtomicBool>>,
}

struct ResumeState {
    next_operation: usize,
    next_data_offset: u64,
    hasher: PayloadHasher,
    signed_hasher: Option<PayloadHasher>,
    signature_blob: Vec<u8>,
}

pub struct PayloadProcessor<'a, P: PrefStore> {
    prefs: &'a mut P,
    plan: &'a InstallPlan,
    public_key: Option<RsaPublicKey>,
    patcher: Option<Box<dyn BlockPatcher>>,
    cancel_signal: Option<Arc<AtomicBool>>,

    rootfs: PartitionPerformer,
    kernel: Option<PartitionPerformer>,

    manifest: Option<DeltaArchiveManifest>,
    metadata_size: u64,
    /// Rootfs operations followed by kernel operations, in stream order.
    operations: Vec<(Target, InstallOperation)>,
    next_operation: usize,
    /// Offset and size of the signatures blob within the blob section.
    signatures: Option<(u64, u64)>,

    buffer: SlidingBuffer,
    /// Offset within the blob section that the head of `buffer` maps to.
    buffer_offset: u64,
    /// Last buffer offset whose hash context was checkpointed.
    checkpointed_offset: Option<u64>,

    hasher: PayloadHasher,
    signed_hasher: Option<PayloadHasher>,
    signature_blob: Vec<u8>,

    closed: bool,
}

impl<'a, P: PrefStore> PayloadProcessor<'a, P> {
    pub fn new(prefs: &'a mut P, plan: &'a InstallPlan, options: Options) -> Self {
        Self {
            prefs,
            plan,
            public_key: options.public_key,
            patcher: options.patcher,
            cancel_signal: options.cancel_signal,
            rootfs: PartitionPerformer::new(&plan.partition_path),
            kernel: plan
                .kernel_path
                .as_deref()
                .map(PartitionPerformer::new),
            manifest: None,
            metadata_size: 0,
            operations: vec![],
            next_operation: 0,
            signatures: None,
            buffer: SlidingBuffer::new(),
            buffer_offset: 0,
            checkpointed_offset: None,
            hasher: PayloadHasher::new(),
            signed_hasher: None,
            signature_blob: vec![],
            closed: false,
        }
    }

    /// Opens the target devices. Must be called once before [`Self::write`].
    pub fn open(&mut self) -> io::Result<()> {
        self.rootfs.open()?;

        if let Some(kernel) = &mut self.kernel
            && let Err(e) = kernel.open()
        {
            let _ = self.rootfs.close();
            return Err(e);
        }

        Ok(())
    }

    /// Feeds the next chunk of the payload stream. Chunks can have any size,
    /// down to a single byte. Fully buffered operations are applied and
    /// checkpointed before the call returns.
    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.buffer.extend(bytes);

        if self.manifest.is_none() && !self.load_manifest()? {
            return Ok(());
        }

        while self.next_operation < self.operations.len() {
            self.check_cancel()?;

            if !self.perform_next_operation()? {
                return Ok(());
            }
        }

        if let Some((offset, size)) = self.signatures
            && self.signature_blob.is_empty()
        {
            if offset != self.buffer_offset {
                return Err(Error::SignatureOffsetMismatch {
                    expected: offset,
                    actual: self.buffer_offset,
                });
            }

            if (self.buffer.len() as u64) < size {
                return Ok(());
            }

            self.check_cancel()?;
            self.extract_signature_blob(size as usize);

            if let Err(e) = self.checkpoint_update_progress() {
                warn!("Failed to checkpoint update state: {e}");
            }
        }

        Ok(())
    }

    /// Closes the target devices. Idempotent; only the first call reports
    /// whether the stream stopped short of a complete payload.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        self.rootfs.close()?;
        if let Some(kernel) = &mut self.kernel {
            kernel.close()?;
        }

        if !self.buffer.is_empty() {
            return Err(Error::UnconsumedData(self.buffer.len()));
        }
        if self.next_operation != self.operations.len() {
            return Err(Error::IncompleteOperations {
                applied: self.next_operation,
                total: self.operations.len(),
            });
        }

        Ok(())
    }

    /// Verifies the fully received payload against the install plan: total
    /// size, rolling hash, and the embedded signature when a public key is
    /// configured. Call after [`Self::close`].
    pub fn verify_payload(&self) -> Result<()> {
        let total_size = self.metadata_size + self.buffer_offset;
        if self.plan.payload_size != total_size {
            return Err(Error::PayloadSizeMismatch {
                expected: self.plan.payload_size,
                actual: total_size,
            });
        }

        if self.plan.payload_hash.is_empty() {
            return Err(Error::MissingPayloadHash);
        }

        let payload_hash = self.hasher.clone().finalize();
        if payload_hash[..] != self.plan.payload_hash[..] {
            return Err(Error::PayloadHashMismatch);
        }

        let Some(public_key) = &self.public_key else {
            warn!("No public key; skipping payload signature verification");
            return Ok(());
        };

        let (Some(signed_hasher), false) = (&self.signed_hasher, self.signature_blob.is_empty())
        else {
            return Err(Error::SignedPayloadExpected);
        };

        let recovered =
            crypto::recover_signed_digest(&self.signature_blob, public_key, SIGNATURE_MESSAGE_VERSION)
                .map_err(Error::PubKeyVerification)?;

        let signed_digest = signed_hasher.clone().finalize();
        if recovered != crypto::pad_sha256_digest(&signed_digest) {
            return Err(Error::PubKeyVerification(crypto::Error::DigestMismatch));
        }

        info!("Payload signature verified");
        Ok(())
    }

    /// Size and hash the rootfs is expected to have after the update, as
    /// declared by the manifest.
    pub fn new_partition_info(&self) -> Option<(u64, &[u8])> {
        let info = self.manifest.as_ref()?.new_partition_info.as_ref()?;
        Some((info.size(), info.hash()))
    }

    /// Size and hash the kernel is expected to have after the update.
    pub fn new_kernel_info(&self) -> Option<(u64, &[u8])> {
        let info = self.manifest.as_ref()?.new_kernel_info.as_ref()?;
        Some((info.size(), info.hash()))
    }

    fn check_cancel(&self) -> Result<()> {
        if self
            .cancel_signal
            .as_ref()
            .is_some_and(|c| c.load(Ordering::SeqCst))
        {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    /// Consumes metadata bytes from the buffer, feeding the rolling hash.
    fn discard_metadata(&mut self, size: usize) {
        self.hasher.update(&self.buffer.as_slice()[..size]);
        self.buffer.consume(size);
    }

    /// Consumes blob-section bytes from the buffer, advancing the stream
    /// offset. Signature bytes are the only ones excluded from the hash.
    fn discard_blob(&mut self, size: usize, hash: bool) {
        if hash {
            self.hasher.update(&self.buffer.as_slice()[..size]);
        }
        self.buffer.consume(size);
        self.buffer_offset += size as u64;
    }

    /// Returns false if the buffered prefix is too short to hold the full
    /// metadata yet.
    fn load_manifest(&mut self) -> Result<bool> {
        let (mut manifest, metadata_size) = match parse_payload_metadata(self.buffer.as_slice())? {
            ParsedMetadata::NeedMoreData => return Ok(false),
            ParsedMetadata::Parsed {
                manifest,
                metadata_size,
            } => (manifest, metadata_size),
        };

        info!("Loaded manifest; metadata size: {metadata_size}");

        if self.plan.metadata_size != metadata_size {
            if self.plan.hash_checks_mandatory {
                return Err(Error::MetadataSizeMismatch {
                    expected: self.plan.metadata_size,
                    actual: metadata_size,
                });
            }
            warn!(
                "Metadata size {metadata_size} differs from expected {}; continuing",
                self.plan.metadata_size,
            );
        }

        self.verify_metadata_signature(metadata_size as usize)?;

        if !manifest.kernel_install_operations.is_empty() && self.kernel.is_none() {
            return Err(Error::MissingKernelTarget);
        }

        self.signatures = match (manifest.signatures_offset, manifest.signatures_size) {
            (Some(offset), Some(size)) => Some((offset, size)),
            (Some(_), None) => {
                warn!("Manifest declares a signature offset but no size; ignoring");
                None
            }
            _ => None,
        };

        let block_size = u64::from(manifest.block_size());
        self.rootfs.set_block_size(block_size);
        if let Some(kernel) = &mut self.kernel {
            kernel.set_block_size(block_size);
        }

        self.operations = std::mem::take(&mut manifest.install_operations)
            .into_iter()
            .map(|op| (Target::Rootfs, op))
            .chain(
                std::mem::take(&mut manifest.kernel_install_operations)
                    .into_iter()
                    .map(|op| (Target::Kernel, op)),
            )
            .collect();

        self.metadata_size = metadata_size;
        self.discard_metadata(metadata_size as usize);

        if let Err(e) = self
            .prefs
            .set_i64(MANIFEST_METADATA_SIZE, metadata_size as i64)
        {
            warn!("Failed to persist metadata size: {e}");
        }

        self.prime_update_state(&manifest)?;
        self.manifest = Some(manifest);

        Ok(true)
    }

    fn verify_metadata_signature(&self, metadata_size: usize) -> Result<()> {
        let Some(public_key) = &self.public_key else {
            debug!("No public key; skipping metadata signature verification");
            return Ok(());
        };

        let Some(signature_b64) = &self.plan.metadata_signature else {
            if self.plan.hash_checks_mandatory {
                return Err(Error::MetadataSignatureMissing);
            }
            warn!("Install plan carries no metadata signature; continuing");
            return Ok(());
        };

        let signature = STANDARD.decode(signature_b64).map_err(|e| {
            warn!("Metadata signature is not valid base64: {e}");
            Error::MetadataSignatureMismatch
        })?;

        let mut metadata_hash = [0u8; 32];
        metadata_hash.copy_from_slice(
            digest::digest(&digest::SHA256, &self.buffer.as_slice()[..metadata_size]).as_ref(),
        );

        crypto::verify_raw_signature(public_key, &metadata_hash, &signature).map_err(|e| {
            warn!("Metadata signature verification failed: {e}");
            Error::MetadataSignatureMismatch
        })?;

        info!("Metadata signature verified");
        Ok(())
    }

    /// Decides between a fresh start and a resume based on persisted state.
    /// Inconsistent state falls back to a fresh start instead of failing the
    /// whole update.
    fn prime_update_state(&mut self, manifest: &DeltaArchiveManifest) -> Result<()> {
        let next_operation = self
            .prefs
            .get_i64(UPDATE_STATE_NEXT_OPERATION)
            .unwrap_or_default()
            .unwrap_or(UPDATE_STATE_OPERATION_INVALID);

        if next_operation == UPDATE_STATE_OPERATION_INVALID || next_operation <= 0 {
            debug!("Starting a fresh update");
            self.verify_source_partitions(manifest)?;
            return Ok(());
        }

        let Some(state) = self.read_resume_state(next_operation) else {
            warn!("Persisted update state is unusable; restarting from the beginning");
            reset_update_progress(self.prefs, false)?;
            self.verify_source_partitions(manifest)?;
            return Ok(());
        };

        info!(
            "Resuming update at operation {} / data offset {}",
            state.next_operation, state.next_data_offset,
        );

        self.next_operation = state.next_operation;
        self.buffer_offset = state.next_data_offset;
        self.checkpointed_offset = Some(state.next_data_offset);
        self.hasher = state.hasher;
        self.signed_hasher = state.signed_hasher;
        self.signature_blob = state.signature_blob;

        // Count the resume attempt up front. Only a fully successful update
        // clears the counter, so repeated crashes eventually stop resuming.
        let failures = self
            .prefs
            .get_i64(RESUMED_UPDATE_FAILURES)
            .unwrap_or_default()
            .unwrap_or(0);
        if let Err(e) = self.prefs.set_i64(RESUMED_UPDATE_FAILURES, failures + 1) {
            warn!("Failed to persist resumed failure count: {e}");
        }

        Ok(())
    }

    fn read_resume_state(&self, next_operation: i64) -> Option<ResumeState> {
        let next_operation = usize::try_from(next_operation).ok()?;

        let next_data_offset = self
            .prefs
            .get_i64(UPDATE_STATE_NEXT_DATA_OFFSET)
            .ok()
            .flatten()
            .and_then(|v| u64::try_from(v).ok())?;

        let context = self
            .prefs
            .get_string(UPDATE_STATE_SHA256_CONTEXT)
            .ok()
            .flatten()
            .filter(|c| !c.is_empty())?;
        let hasher = PayloadHasher::from_context(&context).ok()?;

        let signed_hasher = match self
            .prefs
            .get_string(UPDATE_STATE_SIGNED_SHA256_CONTEXT)
            .ok()
            .flatten()
        {
            Some(context) if !context.is_empty() => {
                Some(PayloadHasher::from_context(&context).ok()?)
            }
            _ => None,
        };

        let signature_blob = match self
            .prefs
            .get_string(UPDATE_STATE_SIGNATURE_BLOB)
            .ok()
            .flatten()
        {
            Some(blob) => STANDARD.decode(blob).ok()?,
            None => vec![],
        };

        // The metadata size was persisted by the interrupted attempt and must
        // agree with the payload we're being fed now.
        let metadata_size = self
            .prefs
            .get_i64(MANIFEST_METADATA_SIZE)
            .ok()
            .flatten()
            .and_then(|v| u64::try_from(v).ok())
            .filter(|v| *v > 0)?;
        if metadata_size != self.metadata_size {
            return None;
        }

        Some(ResumeState {
            next_operation,
            next_data_offset,
            hasher,
            signed_hasher,
            signature_blob,
        })
    }

    /// For delta payloads, checks that the pre-update device contents match
    /// what the payload was generated against.
    fn verify_source_partitions(&self, manifest: &DeltaArchiveManifest) -> Result<()> {
        if let Some(info) = &manifest.old_partition_info {
            let expected = self.plan.old_partition_hash.as_deref();
            if expected != Some(info.hash()) {
                warn!(
                    "Rootfs hash {:?} does not match payload's source hash {}",
                    expected.map(hex::encode),
                    hex::encode(info.hash()),
                );
                return Err(Error::SourcePartitionMismatch(Target::Rootfs));
            }
        }

        if let Some(info) = &manifest.old_kernel_info {
            let expected = self.plan.old_kernel_hash.as_deref();
            if expected != Some(info.hash()) {
                warn!(
                    "Kernel hash {:?} does not match payload's source hash {}",
                    expected.map(hex::encode),
                    hex::encode(info.hash()),
                );
                return Err(Error::SourcePartitionMismatch(Target::Kernel));
            }
        }

        Ok(())
    }

    /// Returns false if the next operation's data is not fully buffered yet.
    fn perform_next_operation(&mut self) -> Result<bool> {
        let index = self.next_operation;
        let (target, op) = self.operations[index].clone();

        if op.data_length() > 0 {
            if op.data_offset() != self.buffer_offset {
                return Err(Error::OperationExecution {
                    index,
                    source: performer::Error::UnexpectedDataOffset {
                        actual: op.data_offset(),
                        expected: self.buffer_offset,
                    },
                });
            }

            if (self.buffer.len() as u64) < op.data_length() {
                return Ok(false);
            }
        }

        // In range: the buffer length check above just passed.
        let data_length = op.data_length() as usize;

        // Some signers wrap the signatures blob in a trailing hash-less
        // REPLACE operation. Its data is consumed as the signatures and never
        // written to the device.
        if op.data_length() > 0
            && self
                .signatures
                .is_some_and(|(offset, _)| op.data_offset() == offset)
        {
            self.extract_signature_blob(data_length);
            self.next_operation += 1;

            if let Err(e) = self.checkpoint_update_progress() {
                warn!("Failed to checkpoint update state: {e}");
            }

            return Ok(true);
        }

        let blob = &self.buffer.as_slice()[..data_length];

        self.validate_operation_hash(index, &op, blob)?;

        if !is_idempotent_operation(&op) {
            // A crash between this operation and its checkpoint would leave
            // the device unrecoverable, so invalidate the resume state first.
            if let Err(e) = reset_update_progress(self.prefs, true) {
                warn!("Failed to invalidate update state: {e}");
            }
        }

        let performer = match target {
            Target::Rootfs => &mut self.rootfs,
            Target::Kernel => self.kernel.as_mut().ok_or(Error::MissingKernelTarget)?,
        };
        performer
            .perform(&op, blob, self.patcher.as_deref())
            .map_err(|source| Error::OperationExecution { index, source })?;

        self.discard_blob(data_length, true);
        self.next_operation += 1;

        info!(
            "Applied {target} operation {}/{}",
            self.next_operation,
            self.operations.len(),
        );

        if let Err(e) = self.checkpoint_update_progress() {
            warn!("Failed to checkpoint update state: {e}");
        }

        Ok(true)
    }

    fn validate_operation_hash(
        &self,
        index: usize,
        op: &InstallOperation,
        blob: &[u8],
    ) -> Result<()> {
        if op.data_sha256_hash().is_empty() {
            if op.data_length() == 0 {
                return Ok(());
            }

            if self.plan.hash_checks_mandatory {
                return Err(Error::OperationHashMissing { index });
            }

            warn!("Operation {index} has no data hash; skipping verification");
            return Ok(());
        }

        let blob_hash = digest::digest(&digest::SHA256, blob);
        if blob_hash.as_ref() != op.data_sha256_hash() {
            return Err(Error::OperationHashMismatch { index });
        }

        Ok(())
    }

    fn extract_signature_blob(&mut self, size: usize) {
        // Snapshot of the rolling hash over everything before the signatures,
        // which is exactly what the signer signed.
        self.signed_hasher = Some(self.hasher.clone());
        self.signature_blob = self.buffer.as_slice()[..size].to_vec();

        if let Err(e) = self
            .prefs
            .set_string(UPDATE_STATE_SIGNATURE_BLOB, &STANDARD.encode(&self.signature_blob))
        {
            warn!("Failed to persist signature blob: {e}");
        }

        // Signature bytes count toward the total payload size but are
        // excluded from the payload hash, which the signer computed without
        // them.
        self.discard_blob(size, false);

        info!("Extracted signature blob ({size} bytes)");
    }

    fn checkpoint_update_progress(&mut self) -> prefs::Result<()> {
        if self.checkpointed_offset != Some(self.buffer_offset) {
            // Invalidate the operation index first. A crash mid-checkpoint
            // then resumes from scratch rather than from an index whose hash
            // context was never written.
            reset_update_progress(self.prefs, true)?;

            self.prefs
                .set_string(UPDATE_STATE_SHA256_CONTEXT, &self.hasher.context())?;
            if let Some(signed_hasher) = &self.signed_hasher {
                self.prefs
                    .set_string(UPDATE_STATE_SIGNED_SHA256_CONTEXT, &signed_hasher.context())?;
            }
            self.prefs
                .set_i64(UPDATE_STATE_NEXT_DATA_OFFSET, self.buffer_offset as i64)?;

            self.checkpointed_offset = Some(self.buffer_offset);
        }

        self.prefs
            .set_i64(UPDATE_STATE_NEXT_OPERATION, self.next_operation as i64)
    }
}

/// Whether the persisted state allows resuming an update for the response
/// identified by `update_check_response_hash`. Any missing or malformed field
/// means no.
pub fn can_resume_update(prefs: &impl PrefStore, update_check_response_hash: &str) -> bool {
    let Ok(Some(next_operation)) = prefs.get_i64(UPDATE_STATE_NEXT_OPERATION) else {
        return false;
    };
    if next_operation == UPDATE_STATE_OPERATION_INVALID || next_operation <= 0 {
        return false;
    }

    let Ok(Some(stored_hash)) = prefs.get_string(UPDATE_CHECK_RESPONSE_HASH) else {
        return false;
    };
    if stored_hash != update_check_response_hash {
        return false;
    }

    if let Ok(Some(failures)) = prefs.get_i64(RESUMED_UPDATE_FAILURES)
        && failures >= MAX_RESUMED_UPDATE_FAILURES
    {
        return false;
    }

    let Ok(Some(next_data_offset)) = prefs.get_i64(UPDATE_STATE_NEXT_DATA_OFFSET) else {
        return false;
    };
    if next_data_offset < 0 {
        return false;
    }

    let Ok(Some(context)) = prefs.get_string(UPDATE_STATE_SHA256_CONTEXT) else {
        return false;
    };
    if context.is_empty() {
        return false;
    }

    let Ok(Some(metadata_size)) = prefs.get_i64(MANIFEST_METADATA_SIZE) else {
        return false;
    };

    metadata_size > 0
}

/// Resets persisted update progress. A quick reset only invalidates the
/// next-operation index; a full reset clears every field, including the
/// resumed-failure counter and the response hash.
pub fn reset_update_progress(prefs: &mut impl PrefStore, quick: bool) -> prefs::Result<()> {
    prefs.set_i64(UPDATE_STATE_NEXT_OPERATION, UPDATE_STATE_OPERATION_INVALID)?;

    if !quick {
        for key in [
            MANIFEST_METADATA_SIZE,
            UPDATE_STATE_NEXT_DATA_OFFSET,
            UPDATE_STATE_SHA256_CONTEXT,
            UPDATE_STATE_SIGNED_SHA256_CONTEXT,
            UPDATE_STATE_SIGNATURE_BLOB,
            UPDATE_CHECK_RESPONSE_HASH,
            RESUMED_UPDATE_FAILURES,
        ] {
            prefs.remove(key)?;
        }
    }

    Ok(())
}
