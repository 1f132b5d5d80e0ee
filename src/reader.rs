// SPDX-FileCopyrightText: 2023-2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Reader façade and probe dispatcher. Callers either force a single format
//! or enable several and let them bid on the stream: each codec reports how
//! many bits of the file conform to its format and the best score wins.

use tracing::{debug, trace};

use crate::{
    entry::{Entry, EntryType},
    error::{Error, Result},
    format::{android::AndroidReader, bump, Format},
    header::Header,
    stream::ReadSeek,
};

/// Outcome of a probe. `Score` carries the number of matched bits; zero never
/// wins an auction.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Bid {
    Score(u32),
    /// The stream is definitely not in this codec's format.
    NoMatch,
    /// The best score so far already exceeds this codec's maximum, so probing
    /// would be wasted work.
    CannotWin,
}

/// Interface every reader codec implements. The façade owns a set of these
/// and delegates all operations to the winning one.
pub trait FormatReader {
    fn format(&self) -> Format;

    fn bid(&mut self, file: &mut dyn ReadSeek, best_bid: u32) -> Result<Bid>;

    fn set_option(&mut self, key: &str, _value: &str) -> Result<()> {
        Err(Error::UnknownOption(key.to_owned()))
    }

    fn read_header(&mut self, file: &mut dyn ReadSeek) -> Result<Header>;

    fn read_entry(&mut self, file: &mut dyn ReadSeek) -> Result<Entry>;

    fn go_to_entry(&mut self, file: &mut dyn ReadSeek, kind: EntryType) -> Result<Entry>;

    fn read_data(&mut self, file: &mut dyn ReadSeek, buf: &mut [u8]) -> Result<usize>;
}

pub struct Reader {
    formats: Vec<Box<dyn FormatReader>>,
    selected: Option<usize>,
    header_read: bool,
    poisoned: bool,
}

impl Reader {
    pub fn new() -> Self {
        Self {
            formats: vec![],
            selected: None,
            header_read: false,
            poisoned: false,
        }
    }

    /// The format that won the bid or was forced, once known.
    pub fn format(&self) -> Option<Format> {
        self.selected.map(|index| self.formats[index].format())
    }

    /// Register a codec for bidding. Formats are probed in registration
    /// order, which also breaks bid ties.
    pub fn enable_format(&mut self, format: Format) -> Result<()> {
        if self.formats.iter().any(|f| f.format() == format) {
            return Err(Error::FormatAlreadyEnabled(format));
        }

        let codec: Box<dyn FormatReader> = match format {
            Format::Android => Box::new(AndroidReader::new()),
            Format::Bump => Box::new(bump::reader()),
            Format::Mtk => return Err(Error::UnsupportedFormat(format, "reader")),
        };

        self.formats.push(codec);

        Ok(())
    }

    /// Register every format with reader support.
    pub fn enable_all_formats(&mut self) -> Result<()> {
        for format in [Format::Android, Format::Bump] {
            match self.enable_format(format) {
                Ok(()) | Err(Error::FormatAlreadyEnabled(_)) => {}
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    /// Force a format, skipping the bid auction. The codec performs its header
    /// scan lazily on the first [`Self::read_header`] call.
    pub fn set_format(&mut self, format: Format) -> Result<()> {
        self.ensure_usable()?;

        if self.header_read {
            return Err(Error::InvalidState("header has already been read"));
        }

        if let Some(index) = self.formats.iter().position(|f| f.format() == format) {
            self.selected = Some(index);
        } else {
            self.enable_format(format)?;
            self.selected = Some(self.formats.len() - 1);
        }

        Ok(())
    }

    /// Offer an option to every enabled format. Fails with
    /// [`Error::UnknownOption`] only if no format recognizes the key.
    pub fn set_option(&mut self, key: &str, value: &str) -> Result<()> {
        self.ensure_usable()?;

        if self.header_read {
            return Err(Error::InvalidState("header has already been read"));
        }

        let mut accepted = false;

        for codec in &mut self.formats {
            match codec.set_option(key, value) {
                Ok(()) => accepted = true,
                Err(Error::UnknownOption(_)) => {}
                Err(e) => return Err(e),
            }
        }

        if accepted {
            Ok(())
        } else {
            Err(Error::UnknownOption(key.to_owned()))
        }
    }

    pub fn read_header(&mut self, file: &mut dyn ReadSeek) -> Result<Header> {
        self.ensure_usable()?;

        if self.header_read {
            return self.fatal_guard(Err(Error::InvalidState("header has already been read")));
        }
        if self.formats.is_empty() {
            return Err(Error::NoFormatsEnabled);
        }

        let result = self.read_header_inner(file);
        self.fatal_guard(result)
    }

    fn read_header_inner(&mut self, file: &mut dyn ReadSeek) -> Result<Header> {
        let index = match self.selected {
            Some(index) => index,
            None => {
                let index = self.run_bids(file)?;
                self.selected = Some(index);
                index
            }
        };

        debug!("Reading header with {} format", self.formats[index].format().name());

        let header = self.formats[index].read_header(file)?;
        self.header_read = true;

        Ok(header)
    }

    fn run_bids(&mut self, file: &mut dyn ReadSeek) -> Result<usize> {
        let mut best = None;
        let mut best_bid = 0u32;

        for index in 0..self.formats.len() {
            let format = self.formats[index].format();

            match self.formats[index].bid(file, best_bid)? {
                Bid::Score(score) => {
                    trace!("{} format bid {score} bits", format.name());

                    // Strictly greater, so ties go to registration order.
                    if score > best_bid {
                        best = Some(index);
                        best_bid = score;
                    }
                }
                Bid::NoMatch => trace!("{} format did not match", format.name()),
                Bid::CannotWin => trace!("{} format cannot win the bid", format.name()),
            }
        }

        best.ok_or(Error::UnknownFormat)
    }

    pub fn read_entry(&mut self, file: &mut dyn ReadSeek) -> Result<Entry> {
        self.ensure_usable()?;
        let index = self.selected_format()?;

        let result = self.formats[index].read_entry(file);
        self.fatal_guard(result)
    }

    pub fn go_to_entry(&mut self, file: &mut dyn ReadSeek, kind: EntryType) -> Result<Entry> {
        self.ensure_usable()?;
        let index = self.selected_format()?;

        let result = self.formats[index].go_to_entry(file, kind);
        self.fatal_guard(result)
    }

    pub fn read_data(&mut self, file: &mut dyn ReadSeek, buf: &mut [u8]) -> Result<usize> {
        self.ensure_usable()?;
        let index = self.selected_format()?;

        let result = self.formats[index].read_data(file, buf);
        self.fatal_guard(result)
    }

    fn selected_format(&mut self) -> Result<usize> {
        if !self.header_read {
            self.poisoned = true;
            return Err(Error::InvalidState("header has not been read yet"));
        }

        self.selected
            .ok_or(Error::Internal("no format selected"))
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

impl Default for Reader {
    fn default() -> Self {
        Self::new()
    }
}
