// SPDX-FileCopyrightText: 2023-2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Writer façade. One format is set up front; the caller then streams each
//! entry in table order and closes, at which point the codec truncates the
//! file, computes the id digest, and patches the header in place.

use tracing::debug;

use crate::{
    entry::Entry,
    error::{Error, Result},
    format::{android::AndroidWriter, bump, mtk::MtkWriter, Format},
    header::{Header, HeaderFields},
    stream::RandomAccessFile,
};

/// Interface every writer codec implements.
pub trait FormatWriter {
    fn format(&self) -> Format;

    fn supported_fields(&self) -> HeaderFields;

    fn write_header(&mut self, file: &mut dyn RandomAccessFile, header: &Header) -> Result<()>;

    fn get_entry(&mut self, file: &mut dyn RandomAccessFile) -> Result<Entry>;

    fn write_entry(&mut self, file: &mut dyn RandomAccessFile, entry: &Entry) -> Result<()>;

    fn write_data(&mut self, file: &mut dyn RandomAccessFile, buf: &[u8]) -> Result<usize>;

    fn finish_entry(&mut self, file: &mut dyn RandomAccessFile) -> Result<()>;

    fn close(&mut self, file: &mut dyn RandomAccessFile) -> Result<()>;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum State {
    New,
    Header,
    Entries,
    Closed,
}

pub struct Writer {
    codec: Option<Box<dyn FormatWriter>>,
    state: State,
    entry_open: bool,
    poisoned: bool,
}

impl Writer {
    pub fn new() -> Self {
        Self {
            codec: None,
            state: State::New,
            entry_open: false,
            poisoned: false,
        }
    }

    pub fn format(&self) -> Option<Format> {
        self.codec.as_ref().map(|c| c.format())
    }

    /// Select the output format. Must be called exactly once, before anything
    /// else.
    pub fn set_format(&mut self, format: Format) -> Result<()> {
        self.ensure_usable()?;

        if self.state != State::New {
            return Err(Error::InvalidState("format has already been set"));
        }

        let codec: Box<dyn FormatWriter> = match format {
            Format::Android => Box::new(AndroidWriter::new()),
            Format::Bump => Box::new(bump::writer()),
            Format::Mtk => Box::new(MtkWriter::new()),
        };

        self.codec = Some(codec);
        self.state = State::Header;

        Ok(())
    }

    /// A fresh logical header advertising the fields the selected format
    /// accepts.
    pub fn header(&self) -> Result<Header> {
        let codec = self
            .codec
            .as_ref()
            .ok_or(Error::InvalidState("no format has been set"))?;

        Ok(Header::new(codec.supported_fields()))
    }

    pub fn write_header(&mut self, file: &mut dyn RandomAccessFile, header: &Header) -> Result<()> {
        self.ensure_usable()?;

        if self.state != State::Header {
            return self.fatal_guard(Err(Error::InvalidState(
                "header cannot be written in this state",
            )));
        }

        let codec = self
            .codec
            .as_mut()
            .ok_or(Error::Internal("no codec present"))?;

        let result = codec.write_header(file, header);
        if result.is_ok() {
            self.state = State::Entries;
        }

        self.fatal_guard(result)
    }

    /// Start the next entry in table order. Any entry still open is finished
    /// first. Fails with [`Error::EndOfEntries`] after the last entry.
    pub fn get_entry(&mut self, file: &mut dyn RandomAccessFile) -> Result<Entry> {
        self.ensure_usable()?;
        self.ensure_streaming()?;

        let result = self.get_entry_inner(file);
        self.fatal_guard(result)
    }

    fn get_entry_inner(&mut self, file: &mut dyn RandomAccessFile) -> Result<Entry> {
        let codec = self
            .codec
            .as_mut()
            .ok_or(Error::Internal("no codec present"))?;

        if self.entry_open {
            codec.finish_entry(file)?;
            self.entry_open = false;
        }

        let entry = codec.get_entry(file)?;
        self.entry_open = true;

        Ok(entry)
    }

    /// Commit the caller-provided entry metadata for the current entry.
    pub fn write_entry(&mut self, file: &mut dyn RandomAccessFile, entry: &Entry) -> Result<()> {
        self.ensure_usable()?;
        self.ensure_open_entry()?;

        let codec = self
            .codec
            .as_mut()
            .ok_or(Error::Internal("no codec present"))?;

        let result = codec.write_entry(file, entry);
        self.fatal_guard(result)
    }

    pub fn write_data(&mut self, file: &mut dyn RandomAccessFile, buf: &[u8]) -> Result<usize> {
        self.ensure_usable()?;
        self.ensure_open_entry()?;

        let codec = self
            .codec
            .as_mut()
            .ok_or(Error::Internal("no codec present"))?;

        let result = codec.write_data(file, buf);
        self.fatal_guard(result)
    }

    pub fn finish_entry(&mut self, file: &mut dyn RandomAccessFile) -> Result<()> {
        self.ensure_usable()?;
        self.ensure_open_entry()?;

        let codec = self
            .codec
            .as_mut()
            .ok_or(Error::Internal("no codec present"))?;

        let result = codec.finish_entry(file);
        if result.is_ok() {
            self.entry_open = false;
        }

        self.fatal_guard(result)
    }

    /// Finalize the image. Any open entry is finished and entries never
    /// streamed are finished with zero size, then the codec truncates the
    /// file, computes the id digest, and writes the header.
    pub fn close(&mut self, file: &mut dyn RandomAccessFile) -> Result<()> {
        self.ensure_usable()?;
        self.ensure_streaming()?;

        let result = self.close_inner(file);
        if result.is_ok() {
            self.state = State::Closed;
        }

        self.fatal_guard(result)
    }

    fn close_inner(&mut self, file: &mut dyn RandomAccessFile) -> Result<()> {
        let codec = self
            .codec
            .as_mut()
            .ok_or(Error::Internal("no codec present"))?;

        if self.entry_open {
            codec.finish_entry(file)?;
            self.entry_open = false;
        }

        loop {
            match codec.get_entry(file) {
                Ok(_) => codec.finish_entry(file)?,
                Err(Error::EndOfEntries) => break,
                Err(e) => return Err(e),
            }
        }

        debug!("Finalizing {} image", codec.format().name());

        codec.close(file)
    }

    fn ensure_streaming(&mut self) -> Result<()> {
        if self.state != State::Entries {
            self.poisoned = true;
            return Err(Error::InvalidState("entries cannot be streamed in this state"));
        }

        Ok(())
    }

    fn ensure_open_entry(&mut self) -> Result<()> {
        self.ensure_streaming()?;

        if !self.entry_open {
            self.poisoned = true;
            return Err(Error::InvalidState("no entry is active"));
        }

        Ok(())
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.poisoned {
            Err(Error::InvalidState("a fatal error has occurred"))
        } else {
            Ok(())
        }
    }

    fn fatal_guard<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_fatal() {
                self.poisoned = true;
            }
        }

        result
    }
}

impl Default for Writer {
    fn default() -> Self {
        Self::new()
    }
}
