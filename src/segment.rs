// SPDX-FileCopyrightText: 2023-2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Segment engine: the ordered table of typed, page-aligned sections making up
//! a boot image, plus the streaming cursors the format codecs drive. Reading
//! and writing keep separate tables because their lifecycles differ: a reader
//! knows every offset and size up front, while a writer discovers them as
//! entries are streamed and finished.

use std::io::{Seek, SeekFrom, Write};

use crate::{
    entry::{Entry, EntryType},
    error::{Error, Result},
    format::padding,
    stream::{self, ReadSeek, WriteSeek, WriteZerosExt},
};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Cursor {
    Begin,
    At(usize),
    End,
}

/// One typed, contiguous byte range of an existing image.
#[derive(Clone, Copy, Debug)]
pub struct ReaderSegment {
    pub kind: EntryType,
    pub offset: u64,
    pub size: u64,
    /// A short read against EOF is treated as the end of the segment instead
    /// of an error.
    pub can_truncate: bool,
}

pub struct SegmentReader {
    segments: Vec<ReaderSegment>,
    cursor: Cursor,
    remaining: u64,
}

impl SegmentReader {
    pub fn new() -> Self {
        Self {
            segments: vec![],
            cursor: Cursor::Begin,
            remaining: 0,
        }
    }

    pub fn entries_clear(&mut self) {
        self.segments.clear();
        self.cursor = Cursor::Begin;
        self.remaining = 0;
    }

    pub fn entries_add(
        &mut self,
        kind: EntryType,
        offset: u64,
        size: u64,
        can_truncate: bool,
    ) -> Result<()> {
        if self.segments.iter().any(|s| s.kind == kind) {
            return Err(Error::DuplicateEntryType(kind));
        }

        offset.checked_add(size).ok_or(Error::OffsetOverflow)?;

        self.segments.push(ReaderSegment {
            kind,
            offset,
            size,
            can_truncate,
        });

        Ok(())
    }

    pub fn entries(&self) -> &[ReaderSegment] {
        &self.segments
    }

    /// Most recently positioned segment, if any.
    pub fn entry(&self) -> Option<&ReaderSegment> {
        match self.cursor {
            Cursor::At(index) => self.segments.get(index),
            _ => None,
        }
    }

    fn move_to(&mut self, mut file: impl ReadSeek, index: usize) -> Result<Entry> {
        let segment = self.segments[index];

        file.seek(SeekFrom::Start(segment.offset))?;

        self.cursor = Cursor::At(index);
        self.remaining = segment.size;

        Ok(Entry {
            kind: segment.kind,
            size: Some(segment.size),
        })
    }

    /// Advance to the next segment and seek the file to its start.
    pub fn read_entry(&mut self, file: impl ReadSeek) -> Result<Entry> {
        let next = match self.cursor {
            Cursor::Begin => 0,
            Cursor::At(index) => index + 1,
            Cursor::End => return Err(Error::EndOfEntries),
        };

        if next >= self.segments.len() {
            self.cursor = Cursor::End;
            return Err(Error::EndOfEntries);
        }

        self.move_to(file, next)
    }

    /// Position the cursor at the segment of the given type.
    pub fn go_to_entry(&mut self, file: impl ReadSeek, kind: EntryType) -> Result<Entry> {
        let index = self
            .segments
            .iter()
            .position(|s| s.kind == kind)
            .ok_or(Error::EntryNotFound(kind))?;

        self.move_to(file, index)
    }

    /// Read up to `buf.len()` bytes from the current segment. A zero return
    /// means the segment is exhausted.
    pub fn read_data(&mut self, file: impl ReadSeek, buf: &mut [u8]) -> Result<usize> {
        let segment = match self.cursor {
            Cursor::At(index) => self.segments[index],
            _ => return Err(Error::InvalidState("no entry is active")),
        };

        let to_read = self.remaining.min(buf.len() as u64) as usize;
        if to_read == 0 {
            return Ok(0);
        }

        let n = stream::read_fully(file, &mut buf[..to_read])?;
        if n < to_read {
            if !segment.can_truncate {
                return Err(Error::UnexpectedEof(segment.kind));
            }

            self.remaining = 0;
            return Ok(n);
        }

        self.remaining -= n as u64;

        Ok(n)
    }
}

impl Default for SegmentReader {
    fn default() -> Self {
        Self::new()
    }
}

/// One typed byte range of an image being produced. `offset` becomes
/// meaningful when the segment is started and `size` once it is finished.
#[derive(Clone, Copy, Debug)]
pub struct WriterSegment {
    pub kind: EntryType,
    pub offset: u64,
    pub size: u64,
    /// Padding alignment applied after the segment finishes. Zero means the
    /// next segment sits flush against this one.
    pub align: u64,
}

pub struct SegmentWriter {
    segments: Vec<WriterSegment>,
    cursor: Cursor,
    open: bool,
    committed_size: Option<u64>,
    bytes_written: u64,
}

impl SegmentWriter {
    pub fn new() -> Self {
        Self {
            segments: vec![],
            cursor: Cursor::Begin,
            open: false,
            committed_size: None,
            bytes_written: 0,
        }
    }

    pub fn entries_clear(&mut self) {
        self.segments.clear();
        self.cursor = Cursor::Begin;
        self.open = false;
        self.committed_size = None;
        self.bytes_written = 0;
    }

    pub fn entries_add(&mut self, kind: EntryType, align: u64) -> Result<()> {
        if self.segments.iter().any(|s| s.kind == kind) {
            return Err(Error::DuplicateEntryType(kind));
        }

        if align != 0 && !align.is_power_of_two() {
            return Err(Error::InvalidAlignment(align));
        }

        self.segments.push(WriterSegment {
            kind,
            offset: 0,
            size: 0,
            align,
        });

        Ok(())
    }

    pub fn entries(&self) -> &[WriterSegment] {
        &self.segments
    }

    /// Most recently started segment, if any.
    pub fn entry(&self) -> Option<&WriterSegment> {
        match self.cursor {
            Cursor::At(index) => self.segments.get(index),
            _ => None,
        }
    }

    /// Start the next segment at the current file position.
    pub fn get_entry(&mut self, mut file: impl WriteSeek) -> Result<Entry> {
        if self.open {
            return Err(Error::InvalidState("an entry is already open"));
        }

        let next = match self.cursor {
            Cursor::Begin => 0,
            Cursor::At(index) => index + 1,
            Cursor::End => return Err(Error::EndOfEntries),
        };

        if next >= self.segments.len() {
            self.cursor = Cursor::End;
            return Err(Error::EndOfEntries);
        }

        let offset = file.stream_position()?;

        self.cursor = Cursor::At(next);
        self.segments[next].offset = offset;
        self.open = true;
        self.committed_size = None;
        self.bytes_written = 0;

        Ok(Entry {
            kind: self.segments[next].kind,
            size: None,
        })
    }

    /// Commit the caller-provided size, if any, for the current segment.
    pub fn write_entry(&mut self, entry: &Entry) -> Result<()> {
        let current = match (self.cursor, self.open) {
            (Cursor::At(index), true) => self.segments[index],
            _ => return Err(Error::InvalidState("no entry is active")),
        };

        if entry.kind != current.kind {
            return Err(Error::UnexpectedEntryType(entry.kind));
        }

        if let Some(size) = entry.size {
            u32::try_from(size).map_err(|_| Error::EntryTooLarge(size))?;
        }

        self.committed_size = entry.size;

        Ok(())
    }

    /// Write data into the current segment, accumulating its size.
    pub fn write_data(&mut self, mut file: impl WriteSeek, buf: &[u8]) -> Result<usize> {
        if !self.open {
            return Err(Error::InvalidState("no entry is active"));
        }

        if let Some(committed) = self.committed_size {
            if self.bytes_written + buf.len() as u64 > committed {
                return Err(Error::ExcessData(committed));
            }
        }

        file.write_all(buf)?;

        self.bytes_written += buf.len() as u64;

        Ok(buf.len())
    }

    /// Record the final segment size and pad the file so the next segment
    /// starts aligned.
    pub fn finish_entry(&mut self, mut file: impl WriteSeek) -> Result<()> {
        let index = match (self.cursor, self.open) {
            (Cursor::At(index), true) => index,
            _ => return Err(Error::InvalidState("no entry is active")),
        };

        let size = self.committed_size.unwrap_or(self.bytes_written);
        let segment = &mut self.segments[index];

        segment.size = size;

        let end = segment.offset.checked_add(size).ok_or(Error::OffsetOverflow)?;
        file.seek(SeekFrom::Start(end))?;

        if segment.align > 0 {
            let pad = padding::calc(end, segment.align);
            file.write_zeros_exact(pad)
                .map_err(|e| Error::WriteError("padding", e))?;
        }

        self.open = false;

        Ok(())
    }
}

impl Default for SegmentWriter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, Seek, Write};

    use assert_matches::assert_matches;

    use super::{SegmentReader, SegmentWriter};
    use crate::{
        entry::{Entry, EntryType},
        error::Error,
    };

    #[test]
    fn reader_streams_in_table_order() {
        let mut file = Cursor::new(b"0123456789abcdef".to_vec());
        let mut seg = SegmentReader::new();

        seg.entries_add(EntryType::Kernel, 0, 4, false).unwrap();
        seg.entries_add(EntryType::Ramdisk, 8, 4, false).unwrap();

        let entry = seg.read_entry(&mut file).unwrap();
        assert_eq!(entry.kind, EntryType::Kernel);
        assert_eq!(entry.size, Some(4));
        assert_eq!(file.stream_position().unwrap(), 0);

        let mut buf = [0u8; 16];
        let n = seg.read_data(&mut file, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"0123");
        assert_eq!(seg.read_data(&mut file, &mut buf).unwrap(), 0);

        let entry = seg.read_entry(&mut file).unwrap();
        assert_eq!(entry.kind, EntryType::Ramdisk);
        assert_eq!(file.stream_position().unwrap(), 8);

        assert_matches!(seg.read_entry(&mut file), Err(Error::EndOfEntries));
        assert_matches!(seg.read_entry(&mut file), Err(Error::EndOfEntries));
    }

    #[test]
    fn reader_random_access() {
        let mut file = Cursor::new(b"0123456789abcdef".to_vec());
        let mut seg = SegmentReader::new();

        seg.entries_add(EntryType::Kernel, 0, 4, false).unwrap();
        seg.entries_add(EntryType::Ramdisk, 8, 4, false).unwrap();

        let entry = seg.go_to_entry(&mut file, EntryType::Ramdisk).unwrap();
        assert_eq!(entry.kind, EntryType::Ramdisk);

        let mut buf = [0u8; 4];
        seg.read_data(&mut file, &mut buf).unwrap();
        assert_eq!(&buf, b"89ab");

        // Jumping backwards is allowed.
        seg.go_to_entry(&mut file, EntryType::Kernel).unwrap();
        seg.read_data(&mut file, &mut buf).unwrap();
        assert_eq!(&buf, b"0123");

        assert_matches!(
            seg.go_to_entry(&mut file, EntryType::DeviceTree),
            Err(Error::EntryNotFound(EntryType::DeviceTree))
        );
    }

    #[test]
    fn reader_truncated_segment() {
        // Segment claims 8 bytes, but only 4 exist.
        let mut file = Cursor::new(b"0123".to_vec());

        let mut seg = SegmentReader::new();
        seg.entries_add(EntryType::DeviceTree, 0, 8, true).unwrap();
        seg.read_entry(&mut file).unwrap();

        let mut buf = [0u8; 16];
        let n = seg.read_data(&mut file, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"0123");
        assert_eq!(seg.read_data(&mut file, &mut buf).unwrap(), 0);

        let mut seg = SegmentReader::new();
        seg.entries_add(EntryType::DeviceTree, 0, 8, false).unwrap();
        seg.read_entry(&mut file).unwrap();

        assert_matches!(
            seg.read_data(&mut file, &mut buf),
            Err(Error::UnexpectedEof(EntryType::DeviceTree))
        );
    }

    #[test]
    fn reader_rejects_duplicate_types() {
        let mut seg = SegmentReader::new();

        seg.entries_add(EntryType::Kernel, 0, 4, false).unwrap();
        assert_matches!(
            seg.entries_add(EntryType::Kernel, 8, 4, false),
            Err(Error::DuplicateEntryType(EntryType::Kernel))
        );
    }

    #[test]
    fn writer_pads_to_alignment() {
        let mut file = Cursor::new(Vec::new());
        let mut seg = SegmentWriter::new();

        seg.entries_add(EntryType::Kernel, 8).unwrap();
        seg.entries_add(EntryType::Ramdisk, 8).unwrap();

        let entry = seg.get_entry(&mut file).unwrap();
        assert_eq!(entry.kind, EntryType::Kernel);
        seg.write_data(&mut file, b"abc").unwrap();
        seg.finish_entry(&mut file).unwrap();

        assert_eq!(file.stream_position().unwrap(), 8);

        let entry = seg.get_entry(&mut file).unwrap();
        assert_eq!(entry.kind, EntryType::Ramdisk);
        seg.write_data(&mut file, b"defgh").unwrap();
        seg.finish_entry(&mut file).unwrap();

        assert_eq!(file.stream_position().unwrap(), 16);
        assert_eq!(file.get_ref(), b"abc\0\0\0\0\0defgh\0\0\0");

        assert_eq!(seg.entries()[0].offset, 0);
        assert_eq!(seg.entries()[0].size, 3);
        assert_eq!(seg.entries()[1].offset, 8);
        assert_eq!(seg.entries()[1].size, 5);

        assert_matches!(seg.get_entry(&mut file), Err(Error::EndOfEntries));
    }

    #[test]
    fn writer_unaligned_segments_sit_flush() {
        let mut file = Cursor::new(Vec::new());
        let mut seg = SegmentWriter::new();

        seg.entries_add(EntryType::MtkKernelHeader, 0).unwrap();
        seg.entries_add(EntryType::Kernel, 8).unwrap();

        seg.get_entry(&mut file).unwrap();
        seg.write_data(&mut file, b"abc").unwrap();
        seg.finish_entry(&mut file).unwrap();

        // No padding after an unaligned segment.
        assert_eq!(file.stream_position().unwrap(), 3);

        seg.get_entry(&mut file).unwrap();
        assert_eq!(seg.entries()[1].offset, 3);
    }

    #[test]
    fn writer_committed_size() {
        let mut file = Cursor::new(Vec::new());
        let mut seg = SegmentWriter::new();

        seg.entries_add(EntryType::Kernel, 4).unwrap();

        let mut entry = seg.get_entry(&mut file).unwrap();
        entry.size = Some(6);
        seg.write_entry(&entry).unwrap();

        assert_matches!(
            seg.write_data(&mut file, b"0123456789"),
            Err(Error::ExcessData(6))
        );

        seg.write_data(&mut file, b"012345").unwrap();
        seg.finish_entry(&mut file).unwrap();

        assert_eq!(seg.entries()[0].size, 6);
        assert_eq!(file.stream_position().unwrap(), 8);
    }

    #[test]
    fn writer_commits_size_without_data() {
        let mut file = Cursor::new(Vec::new());
        let mut seg = SegmentWriter::new();

        seg.entries_add(EntryType::Kernel, 0).unwrap();

        let mut entry = seg.get_entry(&mut file).unwrap();
        entry.size = Some(16);
        seg.write_entry(&entry).unwrap();
        seg.finish_entry(&mut file).unwrap();

        assert_eq!(seg.entries()[0].size, 16);
        assert_eq!(file.stream_position().unwrap(), 16);
    }

    #[test]
    fn writer_rejects_mismatched_entry() {
        let mut file = Cursor::new(Vec::new());
        let mut seg = SegmentWriter::new();

        seg.entries_add(EntryType::Kernel, 4).unwrap();
        seg.get_entry(&mut file).unwrap();

        let entry = Entry {
            kind: EntryType::Ramdisk,
            size: None,
        };
        assert_matches!(
            seg.write_entry(&entry),
            Err(Error::UnexpectedEntryType(EntryType::Ramdisk))
        );
    }

    #[test]
    fn writer_rejects_bad_alignment() {
        let mut seg = SegmentWriter::new();

        assert_matches!(
            seg.entries_add(EntryType::Kernel, 3),
            Err(Error::InvalidAlignment(3))
        );

        // Zero alignment is valid and means "no padding".
        seg.entries_add(EntryType::Kernel, 0).unwrap();
    }

    #[test]
    fn writer_requires_open_entry() {
        let mut file = Cursor::new(Vec::new());
        let mut seg = SegmentWriter::new();

        seg.entries_add(EntryType::Kernel, 4).unwrap();

        assert_matches!(
            seg.write_data(&mut file, b"abc"),
            Err(Error::InvalidState(_))
        );
        assert_matches!(seg.finish_entry(&mut file), Err(Error::InvalidState(_)));

        seg.get_entry(&mut file).unwrap();
        assert_matches!(seg.get_entry(&mut file), Err(Error::InvalidState(_)));
    }

    #[test]
    fn writer_offsets_follow_file_position() {
        let mut file = Cursor::new(Vec::new());
        file.write_all(&[0u8; 32]).unwrap();

        let mut seg = SegmentWriter::new();
        seg.entries_add(EntryType::Kernel, 16).unwrap();

        seg.get_entry(&mut file).unwrap();
        assert_eq!(seg.entry().map(|s| s.offset), Some(32));
    }
}
