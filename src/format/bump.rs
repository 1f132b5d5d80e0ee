// SPDX-FileCopyrightText: 2023 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Bump variant: a base Android image followed by a fixed magic immediately
//! after the last page-aligned section. The codecs share all of their
//! machinery with the Android codecs; only the trailer differs.

use crate::format::android::{AndroidReader, AndroidWriter, Variant};

pub const BUMP_MAGIC: [u8; 16] = [
    0x41, 0xa9, 0xe4, 0x67, 0x74, 0x4d, 0x1d, 0x1b, 0xa4, 0x29, 0xf2, 0xec, 0xea, 0x65, 0x52,
    0x79,
];
pub const BUMP_MAGIC_SIZE: usize = 16;

/// Reader codec for the Bump variant. The bid probes for [`BUMP_MAGIC`] at
/// the computed tail offset instead of the Samsung SEAndroid magic.
pub fn reader() -> AndroidReader {
    AndroidReader::with_variant(Variant::Bump)
}

/// Writer codec for the Bump variant. Finalization appends [`BUMP_MAGIC`]
/// after the last section before the trailing digest pass.
pub fn writer() -> AndroidWriter {
    AndroidWriter::with_variant(Variant::Bump)
}

const _: () = assert!(BUMP_MAGIC.len() == BUMP_MAGIC_SIZE);
