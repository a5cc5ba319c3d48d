// SPDX-FileCopyrightText: 2025 The otapply Authors
// SPDX-License-Identifier: GPL-3.0-only

pub mod apply;
pub mod args;

macro_rules! status {
    ($($arg:tt)*) => {
        println!("\x1b[1m[*] {}\x1b[0m", format!($($arg)*))
    }
}

pub(crate) use status;
