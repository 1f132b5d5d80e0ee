// SPDX-FileCopyrightText: 2023-2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use serde::{Deserialize, Serialize};

/// Typed sections that can appear in a boot image, in stream order.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Deserialize, Serialize)]
pub enum EntryType {
    Kernel,
    Ramdisk,
    SecondBoot,
    DeviceTree,
    /// MTK sub-header sitting flush against the kernel payload.
    MtkKernelHeader,
    /// MTK sub-header sitting flush against the ramdisk payload.
    MtkRamdiskHeader,
}

/// A single typed section handed to or received from a streaming façade.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct Entry {
    pub kind: EntryType,
    /// Size in bytes. Always known when reading. When writing, it may be set
    /// before [`crate::writer::Writer::write_entry`] to commit the segment
    /// size ahead of streaming any data.
    pub size: Option<u64>,
}
