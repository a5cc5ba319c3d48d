// SPDX-FileCopyrightText: 2025 The otapply Authors
// SPDX-License-Identifier: GPL-3.0-only

pub mod update_engine {
    include!(concat!(env!("OUT_DIR"), "/update_engine.rs"));
}
