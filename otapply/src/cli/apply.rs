// SPDX-FileCopyrightText: 2025 The otapply Authors
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs::File,
    io::{Read, Seek, SeekFrom},
    path::PathBuf,
    sync::{Arc, atomic::AtomicBool},
};

use anyhow::{Context, Result};
use clap::Args;

use crate::{
    cli::status,
    crypto,
    install_plan::InstallPlan,
    prefs::{
        FilePrefs, MANIFEST_METADATA_SIZE, PrefStore, UPDATE_CHECK_RESPONSE_HASH,
        UPDATE_STATE_NEXT_DATA_OFFSET,
    },
    processor::{self, Options, PayloadProcessor},
};

/// Apply an update payload to the target devices.
#[derive(Debug, Args)]
pub struct ApplyCli {
    /// Path to update payload.
    #[arg(short, long, value_name = "FILE", value_parser)]
    pub payload: PathBuf,

    /// Path to TOML install plan describing the expected payload.
    #[arg(long, value_name = "FILE", value_parser)]
    pub plan: PathBuf,

    /// Directory for persistent update state.
    #[arg(long, value_name = "DIR", value_parser)]
    pub state_dir: PathBuf,

    /// Path to PEM-encoded RSA public key for signature verification.
    #[arg(long, value_name = "FILE", value_parser)]
    pub public_key: Option<PathBuf>,

    /// Chunk size for feeding the payload to the engine.
    #[arg(long, value_name = "BYTES", default_value_t = 1024 * 1024)]
    pub chunk_size: usize,
}

/// Byte ranges of the payload file that a resumed update still needs: the
/// metadata prefix plus everything from the next unapplied operation's data
/// onwards. Already-applied blob data is skipped entirely.
fn resume_ranges(prefs: &impl PrefStore) -> Result<Option<(u64, u64)>> {
    let Some(metadata_size) = prefs.get_i64(MANIFEST_METADATA_SIZE)? else {
        return Ok(None);
    };
    let Some(data_offset) = prefs.get_i64(UPDATE_STATE_NEXT_DATA_OFFSET)? else {
        return Ok(None);
    };

    if metadata_size <= 0 || data_offset < 0 {
        return Ok(None);
    }

    Ok(Some((metadata_size as u64, data_offset as u64)))
}

pub fn apply_main(cli: &ApplyCli, cancel_signal: &Arc<AtomicBool>) -> Result<()> {
    let plan = InstallPlan::from_file(&cli.plan)
        .with_context(|| format!("Failed to load install plan: {:?}", cli.plan))?;

    let mut prefs = FilePrefs::new(&cli.state_dir)
        .with_context(|| format!("Failed to open state directory: {:?}", cli.state_dir))?;

    let public_key = cli
        .public_key
        .as_deref()
        .map(crypto::load_public_key)
        .transpose()?;

    // Resume only applies to the exact same update; anything else starts
    // over from clean state.
    let response_hash = hex::encode(&plan.payload_hash);
    let resume = if processor::can_resume_update(&prefs, &response_hash) {
        status!("Resuming interrupted update");
        resume_ranges(&prefs)?
    } else {
        processor::reset_update_progress(&mut prefs, false)?;
        prefs.set_string(UPDATE_CHECK_RESPONSE_HASH, &response_hash)?;
        None
    };

    let mut payload = File::open(&cli.payload)
        .with_context(|| format!("Failed to open payload: {:?}", cli.payload))?;

    {
        let options = Options {
            public_key,
            patcher: None,
            cancel_signal: Some(cancel_signal.clone()),
        };
        let mut processor = PayloadProcessor::new(&mut prefs, &plan, options);
        processor.open().context("Failed to open target devices")?;

        // On resume, replay the metadata so the engine can reload the
        // manifest, then jump straight to the unapplied data.
        if let Some((metadata_size, data_offset)) = resume {
            let mut metadata = vec![0u8; metadata_size as usize];
            payload
                .read_exact(&mut metadata)
                .context("Failed to read payload metadata")?;
            processor.write(&metadata)?;

            payload.seek(SeekFrom::Start(metadata_size + data_offset))?;
        }

        let mut chunk = vec![0u8; cli.chunk_size.max(1)];
        loop {
            let n = payload.read(&mut chunk).context("Failed to read payload")?;
            if n == 0 {
                break;
            }
            processor.write(&chunk[..n])?;
        }

        processor.close()?;
        processor.verify_payload()?;

        if let Some((size, hash)) = processor.new_partition_info() {
            status!("New rootfs: {size} bytes, sha256 {}", hex::encode(hash));
        }
        if let Some((size, hash)) = processor.new_kernel_info() {
            status!("New kernel: {size} bytes, sha256 {}", hex::encode(hash));
        }
    }

    // The update is fully applied and verified; drop all resume state.
    processor::reset_update_progress(&mut prefs, false)?;

    status!("Update applied successfully");
    Ok(())
}
