/*
 * SPDX-FileCopyrightText: 2023 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

pub mod android;
pub mod bump;
pub mod mtk;
pub mod padding;

/// Identifies one of the supported boot image formats.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub enum Format {
    Android,
    Bump,
    Mtk,
}

impl Format {
    pub fn name(self) -> &'static str {
        match self {
            Self::Android => "android",
            Self::Bump => "bump",
            Self::Mtk => "mtk",
        }
    }
}
