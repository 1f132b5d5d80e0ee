/*
 * SPDX-FileCopyrightText: 2023-2024 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

//! Format-aware read/write engine for Android-family boot images: the base
//! Android layout, the Bump variant, and the MTK variant with its embedded
//! per-section headers and trailer digest.
//!
//! The [`reader::Reader`] and [`writer::Writer`] façades drive one format
//! codec at a time over a caller-provided seekable file. Reading can either
//! force a format or let every enabled codec bid on the stream and pick the
//! best match.

pub mod entry;
pub mod error;
pub mod format;
pub mod header;
pub mod reader;
pub mod segment;
pub mod stream;
pub mod util;
pub mod writer;

pub use error::{Error, Result};
