// SPDX-FileCopyrightText: 2025 The otapply Authors
// SPDX-License-Identifier: GPL-3.0-only

pub mod buffer;
pub mod cli;
pub mod crypto;
pub mod format;
pub mod hasher;
pub mod install_plan;
pub mod performer;
pub mod prefs;
pub mod processor;
pub mod protobuf;
pub mod writer;
