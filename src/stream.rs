// SPDX-FileCopyrightText: 2023 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs::File,
    io::{self, Cursor, Read, Seek, Write},
};

use crate::util;

/// A trait for seekable readers. This is only needed because `dyn Read + Seek`
/// is not a valid construct in Rust yet.
pub trait ReadSeek: Read + Seek {}

impl<R: Read + Seek> ReadSeek for R {}

/// A trait for seekable writers. This is only needed because `dyn Write + Seek`
/// is not a valid construct in Rust yet.
pub trait WriteSeek: Write + Seek {}

impl<W: Write + Seek> WriteSeek for W {}

/// A file-like store offering random-access reads and writes plus truncation.
/// Writers need all three: finalization re-reads the streamed payloads and
/// trims the file to its final length.
pub trait RandomAccessFile: Read + Write + Seek {
    /// Truncate or extend the file to `size` bytes.
    fn set_len(&mut self, size: u64) -> io::Result<()>;
}

impl RandomAccessFile for File {
    fn set_len(&mut self, size: u64) -> io::Result<()> {
        File::set_len(self, size)
    }
}

impl RandomAccessFile for Cursor<Vec<u8>> {
    fn set_len(&mut self, size: u64) -> io::Result<()> {
        let size = usize::try_from(size)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "Size exceeds usize"))?;

        self.get_mut().resize(size, 0);

        Ok(())
    }
}

/// Read until `buf` is filled or the reader reaches EOF. A short count is only
/// returned at EOF.
pub fn read_fully(mut reader: impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut total = 0;

    while total < buf.len() {
        let n = reader.read(&mut buf[total..])?;
        if n == 0 {
            break;
        }

        total += n;
    }

    Ok(total)
}

/// Write all of `buf`. A short count is only returned if the writer reaches
/// EOF.
pub fn write_fully(mut writer: impl Write, buf: &[u8]) -> io::Result<usize> {
    let mut total = 0;

    while total < buf.len() {
        let n = writer.write(&buf[total..])?;
        if n == 0 {
            break;
        }

        total += n;
    }

    Ok(total)
}

/// Extensions for writers to easily write zeros (eg. for padding).
pub trait WriteZerosExt {
    fn write_zeros(&mut self, size: u64) -> io::Result<u64>;

    fn write_zeros_exact(&mut self, size: u64) -> io::Result<()> {
        let n = self.write_zeros(size)?;
        if n != size {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("Expected to write {size} bytes, but reached EOF after {n} bytes"),
            ));
        }
        Ok(())
    }
}

impl<W: Write> WriteZerosExt for W {
    fn write_zeros(&mut self, size: u64) -> io::Result<u64> {
        // We don't use std::io::copy() on std::io::repeat(0) because it fails
        // if the writer hits EOF before all data is written.
        let mut written = 0;

        while written < size {
            let to_write = (size - written).min(util::ZEROS.len() as u64) as usize;
            let n = self.write(&util::ZEROS[..to_write])?;
            written += n as u64;

            if n < to_write {
                break;
            }
        }

        Ok(written)
    }
}
