// SPDX-FileCopyrightText: 2023-2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{io, str::Utf8Error};

use bstr::ByteSlice;
use thiserror::Error;

use crate::{entry::EntryType, format::Format};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unknown boot image format")]
    UnknownFormat,
    #[error("Unknown option: {0:?}")]
    UnknownOption(String),
    #[error("Format {0:?} is already enabled")]
    FormatAlreadyEnabled(Format),
    #[error("Format {0:?} has no {1} support")]
    UnsupportedFormat(Format, &'static str),
    #[error("No formats enabled")]
    NoFormatsEnabled,
    #[error("Invalid state: {0}")]
    InvalidState(&'static str),
    #[error("{0:?} field is not supported by this format")]
    UnsupportedField(&'static str),
    #[error("{0:?} field is required")]
    MissingField(&'static str),
    #[error("{0:?} field is too long: {1:?}")]
    StringTooLong(&'static str, String),
    #[error("{0:?} field is not UTF-8 encoded: {data:?}", data = .1.as_bstr())]
    StringNotUtf8(&'static str, Vec<u8>, #[source] Utf8Error),
    #[error("Invalid page size: {0}")]
    InvalidPageSize(u32),
    #[error("Entry type {0:?} is already present")]
    DuplicateEntryType(EntryType),
    #[error("Alignment is not a power of two: {0}")]
    InvalidAlignment(u64),
    #[error("No more entries")]
    EndOfEntries,
    #[error("Entry type {0:?} not found")]
    EntryNotFound(EntryType),
    #[error("Entry type {0:?} does not match the current entry")]
    UnexpectedEntryType(EntryType),
    #[error("Data written exceeds the declared entry size: {0}")]
    ExcessData(u64),
    #[error("Entry size does not fit in the header field: {0}")]
    EntryTooLarge(u64),
    #[error("Entry size too large to accommodate MTK header")]
    EntryTooLargeForMtk,
    #[error("Invalid size for MTK header entry: {0}")]
    InvalidMtkHeaderSize(u64),
    #[error("Unexpected EOF when reading {0:?} entry")]
    UnexpectedEof(EntryType),
    #[error("Segment layout overflows file offsets")]
    OffsetOverflow,
    #[error("Internal error: {0}")]
    Internal(&'static str),
    #[error("Failed to read {0:?}")]
    ReadError(&'static str, #[source] io::Error),
    #[error("Failed to write {0:?}")]
    WriteError(&'static str, #[source] io::Error),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

impl Error {
    /// Whether the error leaves the owning reader or writer unusable. Fatal
    /// errors cover call-order violations and format errors discovered after
    /// data has already been committed to disk; plain I/O failures are
    /// recoverable and the caller may reseek and retry.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::InvalidState(_)
                | Self::Internal(_)
                | Self::EntryTooLarge(_)
                | Self::EntryTooLargeForMtk
                | Self::InvalidMtkHeaderSize(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
