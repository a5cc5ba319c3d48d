// SPDX-FileCopyrightText: 2025 The otapply Authors
// SPDX-License-Identifier: GPL-3.0-only

//! Applies individual install operations to a single target device.

use std::{
    fs::{File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
};

use bzip2::write::BzDecoder;
use thiserror::Error;

use crate::{
    format::extents::block_count,
    protobuf::update_engine::{InstallOperation, install_operation::Type},
    writer::{ExtentWriter, read_extents},
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Target device is not open")]
    NotOpen,
    #[error("Unknown operation type: {0}")]
    UnknownOperationType(i32),
    #[error("Operation data offset {actual} does not match stream offset {expected}")]
    UnexpectedDataOffset { actual: u64, expected: u64 },
    #[error("Copy operation carries {data_length} bytes of unexpected data")]
    UnexpectedData { data_length: u64 },
    #[error("Copy operation source ({src} blocks) and destination ({dst} blocks) differ")]
    CopyBlockMismatch { src: u64, dst: u64 },
    #[error("Patch produced {actual} bytes, expected {expected}")]
    PatchOutputMismatch { expected: u64, actual: u64 },
    #[error("No patcher configured for delta operations")]
    MissingPatcher,
    #[error("I/O error on target device")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Applies a binary diff. Delta payloads require one; full payloads don't.
pub trait BlockPatcher {
    /// Produces the patched bytes from the source bytes and the patch blob.
    fn patch(&self, source: &[u8], patch: &[u8]) -> io::Result<Vec<u8>>;
}

/// Executes install operations against one target device or image file.
#[derive(Debug)]
pub struct PartitionPerformer {
    path: PathBuf,
    file: Option<File>,
    block_size: u64,
}

impl PartitionPerformer {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_owned(),
            file: None,
            block_size: 4096,
        }
    }

    pub fn open(&mut self) -> io::Result<()> {
        let file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        self.file = Some(file);
        Ok(())
    }

    pub fn close(&mut self) -> io::Result<()> {
        if let Some(file) = self.file.take() {
            file.sync_all()?;
        }
        Ok(())
    }

    /// Must be called before the first operation once the manifest's block
    /// size is known.
    pub fn set_block_size(&mut self, block_size: u64) {
        self.block_size = block_size;
    }

    /// Applies one operation. `blob` holds exactly the operation's data, or
    /// is empty for operations that carry none.
    pub fn perform(
        &mut self,
        op: &InstallOperation,
        blob: &[u8],
        patcher: Option<&dyn BlockPatcher>,
    ) -> Result<()> {
        let op_type =
            Type::try_from(op.r#type).map_err(|_| Error::UnknownOperationType(op.r#type))?;

        match op_type {
            Type::Replace | Type::ReplaceBz => self.perform_replace(op, op_type, blob),
            Type::Move | Type::SourceCopy => self.perform_copy(op),
            Type::Bsdiff | Type::SourceBsdiff => self.perform_patch(op, blob, patcher),
        }
    }

    fn file(&mut self) -> Result<&mut File> {
        self.file.as_mut().ok_or(Error::NotOpen)
    }

    fn perform_replace(
        &mut self,
        op: &InstallOperation,
        op_type: Type,
        blob: &[u8],
    ) -> Result<()> {
        let block_size = self.block_size;
        let file = self.file()?;
        let writer = ExtentWriter::new(file, &op.dst_extents, block_size);

        if op_type == Type::ReplaceBz {
            let mut decoder = BzDecoder::new(writer);
            decoder.write_all(blob)?;
            decoder.finish()?.finish()?;
        } else {
            let mut writer = writer;
            writer.write_all(blob)?;
            writer.finish()?;
        }

        Ok(())
    }

    fn perform_copy(&mut self, op: &InstallOperation) -> Result<()> {
        if op.data_length() != 0 {
            return Err(Error::UnexpectedData {
                data_length: op.data_length(),
            });
        }

        let src_blocks = block_count(&op.src_extents);
        let dst_blocks = block_count(&op.dst_extents);
        if src_blocks != dst_blocks {
            return Err(Error::CopyBlockMismatch {
                src: src_blocks,
                dst: dst_blocks,
            });
        }

        let block_size = self.block_size;
        let file = self.file()?;

        let data = read_extents(file, &op.src_extents, block_size, src_blocks * block_size)?;

        let mut writer = ExtentWriter::new(file, &op.dst_extents, block_size);
        writer.write_all(&data)?;
        writer.finish()?;

        Ok(())
    }

    fn perform_patch(
        &mut self,
        op: &InstallOperation,
        blob: &[u8],
        patcher: Option<&dyn BlockPatcher>,
    ) -> Result<()> {
        let patcher = patcher.ok_or(Error::MissingPatcher)?;

        let block_size = self.block_size;
        let file = self.file()?;

        let source = read_extents(file, &op.src_extents, block_size, op.src_length())?;
        let patched = patcher.patch(&source, blob)?;

        if patched.len() as u64 != op.dst_length() {
            return Err(Error::PatchOutputMismatch {
                expected: op.dst_length(),
                actual: patched.len() as u64,
            });
        }

        let mut writer = ExtentWriter::new(file, &op.dst_extents, block_size);
        writer.write_all(&patched)?;
        writer.finish()?;

        Ok(())
    }
}
