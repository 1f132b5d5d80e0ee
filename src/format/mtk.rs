// SPDX-FileCopyrightText: 2023-2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! MTK variant: a base Android image whose kernel and ramdisk payloads are
//! each preceded by a 512-byte sub-header carrying its own magic and the
//! payload size. The Android header's size fields count the sub-headers, and
//! the id digest covers both the payloads and their sub-headers.

use std::{
    io::{Seek, SeekFrom, Write},
    mem,
};

use zerocopy::{little_endian, FromZeros, IntoBytes};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::{
    entry::{Entry, EntryType},
    error::{Error, Result},
    format::{
        android::{self, RawHeader},
        Format,
    },
    header::{Header, HeaderFields},
    segment::SegmentWriter,
    stream::{RandomAccessFile, WriteSeek},
    writer::FormatWriter,
};

pub const MTK_MAGIC: [u8; 4] = [0x88, 0x16, 0x88, 0x58];
pub const MTK_TYPE_SIZE: usize = 32;

/// Raw on-disk layout for the per-section sub-header.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(packed)]
pub(crate) struct RawMtkHeader {
    /// Magic value. This should be equal to [`MTK_MAGIC`].
    pub magic: [u8; 4],
    /// Size of the payload that follows, excluding this sub-header.
    pub size: little_endian::U32,
    /// Section label, eg. `KERNEL` or `ROOTFS`.
    pub mtk_type: [u8; MTK_TYPE_SIZE],
    pub unused: [u8; 472],
}

/// Total size of a sub-header on disk.
pub const MTK_HEADER_SIZE: usize = mem::size_of::<RawMtkHeader>();

const _: () = assert!(MTK_HEADER_SIZE == 512);

/// Overwrite the size field of the sub-header at `offset` with the payload
/// size.
fn update_size_field(mut file: impl WriteSeek, offset: u64, size: u32) -> Result<()> {
    let field_offset = offset
        .checked_add(mem::offset_of!(RawMtkHeader, size) as u64)
        .ok_or(Error::OffsetOverflow)?;

    file.seek(SeekFrom::Start(field_offset))?;
    file.write_all(&size.to_le_bytes())
        .map_err(|e| Error::WriteError("mtk_size", e))?;

    Ok(())
}

/// Writer codec for the MTK variant.
pub struct MtkWriter {
    hdr: RawHeader,
    seg: SegmentWriter,
    file_size: Option<u64>,
}

impl MtkWriter {
    pub fn new() -> Self {
        Self {
            hdr: RawHeader::new_zeroed(),
            seg: SegmentWriter::new(),
            file_size: None,
        }
    }
}

impl Default for MtkWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl FormatWriter for MtkWriter {
    fn format(&self) -> Format {
        Format::Mtk
    }

    fn supported_fields(&self) -> HeaderFields {
        android::SUPPORTED_FIELDS
    }

    fn write_header(&mut self, file: &mut dyn RandomAccessFile, header: &Header) -> Result<()> {
        self.hdr = android::raw_header_from(header)?;

        let page = u64::from(self.hdr.page_size.get());

        // The sub-headers sit flush against their payloads, so they carry no
        // alignment of their own.
        self.seg.entries_clear();
        self.seg.entries_add(EntryType::MtkKernelHeader, 0)?;
        self.seg.entries_add(EntryType::Kernel, page)?;
        self.seg.entries_add(EntryType::MtkRamdiskHeader, 0)?;
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

        match segment.kind {
            EntryType::Kernel | EntryType::Ramdisk
                if segment.size == u64::from(u32::MAX) - MTK_HEADER_SIZE as u64 =>
            {
                return Err(Error::EntryTooLargeForMtk);
            }
            EntryType::MtkKernelHeader | EntryType::MtkRamdiskHeader
                if segment.size != MTK_HEADER_SIZE as u64 =>
            {
                return Err(Error::InvalidMtkHeaderSize(segment.size));
            }
            _ => {}
        }

        let size = u32::try_from(segment.size).map_err(|_| Error::EntryTooLarge(segment.size))?;
        let hdr_size = MTK_HEADER_SIZE as u32;

        match segment.kind {
            EntryType::Kernel => {
                let total = size.checked_add(hdr_size).ok_or(Error::EntryTooLargeForMtk)?;
                self.hdr.kernel_size = total.into();
            }
            EntryType::Ramdisk => {
                let total = size.checked_add(hdr_size).ok_or(Error::EntryTooLargeForMtk)?;
                self.hdr.ramdisk_size = total.into();
            }
            EntryType::SecondBoot => self.hdr.second_size = size.into(),
            EntryType::DeviceTree => self.hdr.dt_size = size.into(),
            EntryType::MtkKernelHeader | EntryType::MtkRamdiskHeader => {}
        }

        Ok(())
    }

    fn close(&mut self, file: &mut dyn RandomAccessFile) -> Result<()> {
        let file_size = match self.file_size {
            Some(size) => size,
            None => {
                let size = file.stream_position()?;
                self.file_size = Some(size);
                size
            }
        };

        file.set_len(file_size)?;

        // The sub-header size fields could not be filled in while streaming;
        // patch them now that the payload sizes are authoritative. The digest
        // pass below must see the patched bytes.
        let hdr_size = MTK_HEADER_SIZE as u32;

        for segment in self.seg.entries() {
            let payload_size = match segment.kind {
                EntryType::MtkKernelHeader => self.hdr.kernel_size.get().checked_sub(hdr_size),
                EntryType::MtkRamdiskHeader => self.hdr.ramdisk_size.get().checked_sub(hdr_size),
                _ => continue,
            }
            .ok_or(Error::Internal("MTK section size not finalized"))?;

            update_size_field(&mut *file, segment.offset, payload_size)?;
        }

        let digest = android::compute_id_digest(&self.seg, &mut *file)?;
        self.hdr.id[..digest.len()].copy_from_slice(&digest);

        file.rewind()?;
        self.hdr
            .write_to_io(&mut *file)
            .map_err(|e| Error::WriteError("header", e))?;

        Ok(())
    }
}
