// SPDX-FileCopyrightText: 2025 The otapply Authors
// SPDX-License-Identifier: GPL-3.0-only

pub mod extents;
pub mod payload;
