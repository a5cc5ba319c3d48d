// SPDX-FileCopyrightText: 2025 The otapply Authors
// SPDX-License-Identifier: GPL-3.0-only

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::cli::apply;

#[derive(Debug, Subcommand)]
pub enum Command {
    Apply(apply::ApplyCli),
}

#[derive(Debug, Parser)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

pub fn main(logging_initialized: &AtomicBool, cancel_signal: &Arc<AtomicBool>) -> Result<()> {
    // Errors before this point are printed by the caller directly.
    let cli = Cli::parse();

    init_logging();
    logging_initialized.store(true, Ordering::SeqCst);

    match cli.command {
        Command::Apply(c) => apply::apply_main(&c, cancel_signal),
    }
}
