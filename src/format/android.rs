// SPDX-FileCopyrightText: 2023-2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    io::{Seek, SeekFrom, Write},
    mem, str,
};

use memchr::memmem;
use ring::digest::Context;
use zerocopy::{little_endian, FromBytes, FromZeros, IntoBytes};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::{
    entry::{Entry, EntryType},
    error::{Error, Result},
    format::{bump, padding, Format},
    header::{Header, HeaderFields},
    reader::{Bid, FormatReader},
    segment::{SegmentReader, SegmentWriter},
    stream::{self, RandomAccessFile, ReadSeek},
    util,
    writer::FormatWriter,
};

pub const BOOT_MAGIC: [u8; 8] = *b"ANDROID!";
pub const BOOT_MAGIC_SIZE: usize = 8;
pub const BOOT_NAME_SIZE: usize = 16;
pub const BOOT_ARGS_SIZE: usize = 512;

pub const SAMSUNG_SEANDROID_MAGIC: [u8; 16] = *b"SEANDROIDENFORCE";
pub const SAMSUNG_SEANDROID_MAGIC_SIZE: usize = 16;

/// Maximum number of bytes that may precede the boot magic. Some vendor tools
/// prepend a stub before the real header.
pub const MAX_HEADER_OFFSET: usize = 512;

/// Page sizes accepted when producing an image.
pub const PAGE_SIZES: [u32; 7] = [2048, 4096, 8192, 16384, 32768, 65536, 131072];

pub const SUPPORTED_FIELDS: HeaderFields = HeaderFields::BOARD_NAME
    .union(HeaderFields::KERNEL_CMDLINE)
    .union(HeaderFields::PAGE_SIZE)
    .union(HeaderFields::KERNEL_ADDRESS)
    .union(HeaderFields::RAMDISK_ADDRESS)
    .union(HeaderFields::SECONDBOOT_ADDRESS)
    .union(HeaderFields::KERNEL_TAGS_ADDRESS);

/// Raw on-disk layout for the image header.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(packed)]
pub(crate) struct RawHeader {
    /// Magic value. This should be equal to [`BOOT_MAGIC`].
    pub magic: [u8; BOOT_MAGIC_SIZE],
    pub kernel_size: little_endian::U32,
    pub kernel_addr: little_endian::U32,
    pub ramdisk_size: little_endian::U32,
    pub ramdisk_addr: little_endian::U32,
    pub second_size: little_endian::U32,
    pub second_addr: little_endian::U32,
    pub tags_addr: little_endian::U32,
    pub page_size: little_endian::U32,
    pub dt_size: little_endian::U32,
    pub unused: little_endian::U32,
    pub name: [u8; BOOT_NAME_SIZE],
    pub cmdline: [u8; BOOT_ARGS_SIZE],
    /// Digest material. Only the first 20 bytes are ever populated.
    pub id: [u8; 32],
}

/// Which trailer magic a codec instance probes for or appends. The Bump codecs
/// are the Android codecs with a different trailer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Variant {
    Android,
    Bump,
}

impl Variant {
    fn format(self) -> Format {
        match self {
            Self::Android => Format::Android,
            Self::Bump => Format::Bump,
        }
    }

    fn trailer_magic(self) -> &'static [u8] {
        match self {
            Self::Android => &SAMSUNG_SEANDROID_MAGIC,
            Self::Bump => &bump::BUMP_MAGIC,
        }
    }

    fn max_bid(self) -> u32 {
        ((BOOT_MAGIC_SIZE + self.trailer_magic().len()) * 8) as u32
    }
}

/// Scan the head of the file for the boot magic and decode the header starting
/// there. Returns the header and its offset, or [`None`] if no full header is
/// present within the scan window. The file position is undefined afterwards.
fn find_header(mut file: impl ReadSeek) -> Result<Option<(RawHeader, u64)>> {
    let mut buf = [0u8; MAX_HEADER_OFFSET + mem::size_of::<RawHeader>()];

    file.rewind()?;
    let n = stream::read_fully(&mut file, &mut buf).map_err(|e| Error::ReadError("header", e))?;

    let Some(offset) = memmem::find(&buf[..n], &BOOT_MAGIC) else {
        return Ok(None);
    };

    match RawHeader::read_from_prefix(&buf[offset..n]) {
        Ok((raw, _)) => Ok(Some((raw, offset as u64))),
        // The magic sits too close to the end of the scan window for a full
        // header to follow it.
        Err(_) => Ok(None),
    }
}

/// Byte position immediately after the last page-aligned section, where a
/// trailer magic would live.
pub(crate) fn tail_offset(raw: &RawHeader) -> Result<u64> {
    let page_size = u64::from(raw.page_size.get());
    if page_size == 0 {
        return Err(Error::InvalidPageSize(0));
    }

    // The header page, then each section rounded up to the page size. These
    // sums cannot overflow a u64.
    let mut pos = page_size;

    for size in [
        raw.kernel_size.get(),
        raw.ramdisk_size.get(),
        raw.second_size.get(),
        raw.dt_size.get(),
    ] {
        pos += u64::from(size);
        pos = padding::round(pos, page_size).ok_or(Error::OffsetOverflow)?;
    }

    Ok(pos)
}

/// Probe for a trailer magic at the tail offset computed from the header
/// sizes. The file position is undefined afterwards.
pub(crate) fn find_trailer_magic(
    mut file: impl ReadSeek,
    raw: &RawHeader,
    magic: &[u8],
) -> Result<Option<u64>> {
    let pos = tail_offset(raw)?;

    file.seek(SeekFrom::Start(pos))?;

    let mut buf = vec![0u8; magic.len()];
    let n = stream::read_fully(&mut file, &mut buf)?;

    if n == magic.len() && buf == magic {
        Ok(Some(pos))
    } else {
        Ok(None)
    }
}

fn padded_cstr<const N: usize>(field: &'static str, value: &str) -> Result<[u8; N]> {
    // One byte is reserved for the NUL terminator.
    if value.len() >= N {
        return Err(Error::StringTooLong(field, value.to_owned()));
    }

    let mut buf = [0u8; N];
    buf[..value.len()].copy_from_slice(value.as_bytes());

    Ok(buf)
}

/// Serialize the logical header into the on-disk layout. Section sizes and the
/// id digest remain zero until finalization.
pub(crate) fn raw_header_from(header: &Header) -> Result<RawHeader> {
    let page_size = header.page_size().ok_or(Error::MissingField("page_size"))?;
    if !PAGE_SIZES.contains(&page_size) {
        return Err(Error::InvalidPageSize(page_size));
    }

    let name = padded_cstr::<BOOT_NAME_SIZE>("board_name", header.board_name().unwrap_or(""))?;
    let cmdline =
        padded_cstr::<BOOT_ARGS_SIZE>("kernel_cmdline", header.kernel_cmdline().unwrap_or(""))?;

    Ok(RawHeader {
        magic: BOOT_MAGIC,
        kernel_size: 0.into(),
        kernel_addr: header.kernel_address().unwrap_or(0).into(),
        ramdisk_size: 0.into(),
        ramdisk_addr: header.ramdisk_address().unwrap_or(0).into(),
        second_size: 0.into(),
        second_addr: header.secondboot_address().unwrap_or(0).into(),
        tags_addr: header.kernel_tags_address().unwrap_or(0).into(),
        page_size: page_size.into(),
        dt_size: 0.into(),
        unused: 0.into(),
        name,
        cmdline,
        id: [0u8; 32],
    })
}

/// Reader codec for the base Android format. Also serves the Bump variant,
/// which probes for a different trailer magic.
pub struct AndroidReader {
    variant: Variant,
    raw: Option<(RawHeader, u64)>,
    trailer_offset: Option<u64>,
    allow_truncated_dt: bool,
    seg: SegmentReader,
}

impl AndroidReader {
    pub fn new() -> Self {
        Self::with_variant(Variant::Android)
    }

    pub(crate) fn with_variant(variant: Variant) -> Self {
        Self {
            variant,
            raw: None,
            trailer_offset: None,
            // Allow truncated dt images by default.
            allow_truncated_dt: true,
            seg: SegmentReader::new(),
        }
    }

    /// Offset of the decoded header within the file, once known.
    pub fn header_offset(&self) -> Option<u64> {
        self.raw.as_ref().map(|(_, offset)| *offset)
    }

    /// Offset of the trailer magic, if the bid found one.
    pub fn trailer_offset(&self) -> Option<u64> {
        self.trailer_offset
    }
}

impl Default for AndroidReader {
    fn default() -> Self {
        Self::new()
    }
}

impl FormatReader for AndroidReader {
    fn format(&self) -> Format {
        self.variant.format()
    }

    fn bid(&mut self, file: &mut dyn ReadSeek, best_bid: u32) -> Result<Bid> {
        if best_bid >= self.variant.max_bid() {
            // This is a bid we can't win, so bail out.
            return Ok(Bid::CannotWin);
        }

        let Some(found) = find_header(&mut *file)? else {
            // No header. This can't be an Android boot image.
            return Ok(Bid::NoMatch);
        };

        let mut bits = (BOOT_MAGIC_SIZE * 8) as u32;

        if found.0.page_size.get() != 0 {
            if let Some(offset) =
                find_trailer_magic(&mut *file, &found.0, self.variant.trailer_magic())?
            {
                self.trailer_offset = Some(offset);
                bits += (self.variant.trailer_magic().len() * 8) as u32;
            }
        }

        self.raw = Some(found);

        Ok(Bid::Score(bits))
    }

    fn set_option(&mut self, key: &str, value: &str) -> Result<()> {
        if key == "strict" {
            let strict = value.eq_ignore_ascii_case("true")
                || value.eq_ignore_ascii_case("yes")
                || value.eq_ignore_ascii_case("y")
                || value == "1";
            self.allow_truncated_dt = !strict;
            Ok(())
        } else {
            Err(Error::UnknownOption(key.to_owned()))
        }
    }

    fn read_header(&mut self, file: &mut dyn ReadSeek) -> Result<Header> {
        let (raw, header_offset) = match self.raw {
            Some(found) => found,
            None => {
                // A bid might not have run if the caller forced this format.
                let found = find_header(&mut *file)?.ok_or(Error::UnknownFormat)?;
                self.raw = Some(found);
                found
            }
        };

        let page_size = raw.page_size.get();
        if page_size == 0 {
            return Err(Error::InvalidPageSize(0));
        }

        let mut header = Header::new(SUPPORTED_FIELDS);

        let name = util::cstr_bytes(&raw.name);
        let name = str::from_utf8(name)
            .map_err(|e| Error::StringNotUtf8("board_name", name.to_vec(), e))?;
        header.set_board_name(name.to_owned())?;

        let cmdline = util::cstr_bytes(&raw.cmdline);
        let cmdline = str::from_utf8(cmdline)
            .map_err(|e| Error::StringNotUtf8("kernel_cmdline", cmdline.to_vec(), e))?;
        header.set_kernel_cmdline(cmdline.to_owned())?;

        header.set_page_size(page_size)?;
        header.set_kernel_address(raw.kernel_addr.get())?;
        header.set_ramdisk_address(raw.ramdisk_addr.get())?;
        header.set_secondboot_address(raw.second_addr.get())?;
        header.set_kernel_tags_address(raw.tags_addr.get())?;

        // Section offsets: header first, then each section page-aligned.
        let page = u64::from(page_size);

        let mut pos = header_offset + mem::size_of::<RawHeader>() as u64;
        pos = padding::round(pos, page).ok_or(Error::OffsetOverflow)?;

        let kernel_offset = pos;
        pos += u64::from(raw.kernel_size.get());
        pos = padding::round(pos, page).ok_or(Error::OffsetOverflow)?;

        let ramdisk_offset = pos;
        pos += u64::from(raw.ramdisk_size.get());
        pos = padding::round(pos, page).ok_or(Error::OffsetOverflow)?;

        let second_offset = pos;
        pos += u64::from(raw.second_size.get());
        pos = padding::round(pos, page).ok_or(Error::OffsetOverflow)?;

        let dt_offset = pos;

        self.seg.entries_clear();

        self.seg.entries_add(
            EntryType::Kernel,
            kernel_offset,
            u64::from(raw.kernel_size.get()),
            false,
        )?;
        self.seg.entries_add(
            EntryType::Ramdisk,
            ramdisk_offset,
            u64::from(raw.ramdisk_size.get()),
            false,
        )?;

        if raw.second_size.get() > 0 {
            self.seg.entries_add(
                EntryType::SecondBoot,
                second_offset,
                u64::from(raw.second_size.get()),
                false,
            )?;
        }

        if raw.dt_size.get() > 0 {
            self.seg.entries_add(
                EntryType::DeviceTree,
                dt_offset,
                u64::from(raw.dt_size.get()),
                self.allow_truncated_dt,
            )?;
        }

        Ok(header)
    }

    fn read_entry(&mut self, file: &mut dyn ReadSeek) -> Result<Entry> {
        self.seg.read_entry(&mut *file)
    }

    fn go_to_entry(&mut self, file: &mut dyn ReadSeek, kind: EntryType) -> Result<Entry> {
        self.seg.go_to_entry(&mut *file, kind)
    }

    fn read_data(&mut self, file: &mut dyn ReadSeek, buf: &mut [u8]) -> Result<usize> {
        self.seg.read_data(&mut *file, buf)
    }
}

/// Writer codec for the base Android format. Also serves the Bump variant,
/// which appends its trailer magic at close.
pub struct AndroidWriter {
    variant: Variant,
    hdr: RawHeader,
    seg: SegmentWriter,
    file_size: Option<u64>,
    trailer_written: bool,
}

impl AndroidWriter {
    pub fn new() -> Self {
        Self::with_variant(Variant::Android)
    }

    pub(crate) fn with_variant(variant: Variant) -> Self {
        Self {
            variant,
            hdr: RawHeader::new_zeroed(),
            seg: SegmentWriter::new(),
            file_size: None,
            trailer_written: false,
        }
    }
}

impl Default for AndroidWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl FormatWriter for AndroidWriter {
    fn format(&self) -> Format {
        self.variant.format()
    }

    fn supported_fields(&self) -> HeaderFields {
        SUPPORTED_FIELDS
    }

    fn write_header(&mut self, file: &mut dyn RandomAccessFile, header: &Header) -> Result<()> {
        self.hdr = raw_header_from(header)?;

        let page = u64::from(self.hdr.page_size.get());

        self.seg.entries_clear();
        self.seg.entries_add(EntryType::Kernel, page)?;
        self.seg.entries_add(EntryType::Ramdisk, page)?;
        self.seg.entries_add(EntryType::SecondBoot, page)?;
        self.seg.entries_add(EntryType::DeviceTree, page)?;

        // Leave the first page for the header, which is written at close once
        // the section sizes and the id digest are known.
        file.seek(SeekFrom::Start(page))?;

        Ok(())
    }

    fn get_entry(&mut self, file: &mut dyn RandomAccessFile) -> Result<Entry> {
        self.seg.get_entry(&mut *file)
    }

    fn write_entry(&mut self, _file: &mut dyn RandomAccessFile, entry: &Entry) -> Result<()> {
        self.seg.write_entry(entry)
    }

    fn write_data(&mut self, file: &mut dyn RandomAccessFile, buf: &[u8]) -> Result<usize> {
        self.seg.write_data(&mut *file, buf)
    }

    fn finish_entry(&mut self, file: &mut dyn RandomAccessFile) -> Result<()> {
        self.seg.finish_entry(&mut *file)?;

        let segment = self
            .seg
            .entry()
            .copied()
            .ok_or(Error::Internal("no entry was finished"))?;

        let size = u32::try_from(segment.size).map_err(|_| Error::EntryTooLarge(segment.size))?;

        match segment.kind {
            EntryType::Kernel => self.hdr.kernel_size = size.into(),
            EntryType::Ramdisk => self.hdr.ramdisk_size = size.into(),
            EntryType::SecondBoot => self.hdr.second_size = size.into(),
            EntryType::DeviceTree => self.hdr.dt_size = size.into(),
            _ => {}
        }

        Ok(())
    }

    fn close(&mut self, file: &mut dyn RandomAccessFile) -> Result<()> {
        let mut file_size = match self.file_size {
            Some(size) => size,
            None => {
                let size = file.stream_position()?;
                self.file_size = Some(size);
                size
            }
        };

        if self.variant == Variant::Bump && !self.trailer_written {
            file.seek(SeekFrom::Start(file_size))?;
            file.write_all(&bump::BUMP_MAGIC)
                .map_err(|e| Error::WriteError("bump_magic", e))?;

            file_size += bump::BUMP_MAGIC.len() as u64;
            self.file_size = Some(file_size);
            self.trailer_written = true;
        }

        file.set_len(file_size)?;

        let digest = compute_id_digest(&self.seg, &mut *file)?;
        self.hdr.id[..digest.len()].copy_from_slice(&digest);

        file.rewind()?;
        self.hdr
            .write_to_io(&mut *file)
            .map_err(|e| Error::WriteError("header", e))?;

        Ok(())
    }
}

/// Compute the id digest over the segment table: each segment's raw bytes,
/// then its size as a little-endian u32. MTK sub-headers contribute no size of
/// their own, but are counted into their payload's size term.
pub(crate) fn compute_id_digest(
    seg: &SegmentWriter,
    mut file: impl ReadSeek,
) -> Result<[u8; 20]> {
    let mut context = Context::new(&ring::digest::SHA1_FOR_LEGACY_USE_ONLY);
    let mut buf = [0u8; 10240];

    let mut kernel_hdr_size = 0u32;
    let mut ramdisk_hdr_size = 0u32;

    for segment in seg.entries() {
        file.seek(SeekFrom::Start(segment.offset))?;

        let mut remain = segment.size;
        while remain > 0 {
            let to_read = remain.min(buf.len() as u64) as usize;
            let n = stream::read_fully(&mut file, &mut buf[..to_read])
                .map_err(|e| Error::ReadError("entry data", e))?;
            if n != to_read {
                return Err(Error::UnexpectedEof(segment.kind));
            }

            context.update(&buf[..n]);
            remain -= n as u64;
        }

        let size = u32::try_from(segment.size).map_err(|_| Error::EntryTooLarge(segment.size))?;

        let size_term = match segment.kind {
            EntryType::MtkKernelHeader => {
                kernel_hdr_size = size;
                continue;
            }
            EntryType::MtkRamdiskHeader => {
                ramdisk_hdr_size = size;
                continue;
            }
            EntryType::Kernel => size
                .checked_add(kernel_hdr_size)
                .ok_or(Error::EntryTooLargeForMtk)?,
            EntryType::Ramdisk => size
                .checked_add(ramdisk_hdr_size)
                .ok_or(Error::EntryTooLargeForMtk)?,
            EntryType::SecondBoot => size,
            EntryType::DeviceTree => {
                if size == 0 {
                    continue;
                }
                size
            }
        };

        context.update(&size_term.to_le_bytes());
    }

    let mut digest = [0u8; 20];
    digest.copy_from_slice(context.finish().as_ref());

    Ok(digest)
}

const _: () = assert!(mem::size_of::<RawHeader>() == 608);
