/*
 * SPDX-FileCopyrightText: 2023-2024 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};

use assert_matches::assert_matches;

use bootimg::{
    entry::EntryType,
    format::{
        mtk::{MTK_HEADER_SIZE, MTK_MAGIC},
        Format,
    },
    stream::RandomAccessFile,
    writer::Writer,
    Error,
};

const PAGE_SIZE: u32 = 2048;

fn mtk_sub_header() -> Vec<u8> {
    let mut data = vec![0u8; MTK_HEADER_SIZE];
    data[..4].copy_from_slice(&MTK_MAGIC);
    data
}

fn le32_at(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap())
}

fn write_mtk_image(board_name: &str, kernel: &[u8], ramdisk: &[u8]) -> Vec<u8> {
    let mut writer = Writer::new();
    writer.set_format(Format::Mtk).unwrap();

    let mut header = writer.header().unwrap();
    header.set_page_size(PAGE_SIZE).unwrap();
    header.set_board_name(board_name.to_owned()).unwrap();
    header.set_kernel_cmdline(String::new()).unwrap();

    let mut file = Cursor::new(Vec::new());
    writer.write_header(&mut file, &header).unwrap();

    let entry = writer.get_entry(&mut file).unwrap();
    assert_eq!(entry.kind, EntryType::MtkKernelHeader);
    writer.write_data(&mut file, &mtk_sub_header()).unwrap();

    let entry = writer.get_entry(&mut file).unwrap();
    assert_eq!(entry.kind, EntryType::Kernel);
    writer.write_data(&mut file, kernel).unwrap();

    let entry = writer.get_entry(&mut file).unwrap();
    assert_eq!(entry.kind, EntryType::MtkRamdiskHeader);
    writer.write_data(&mut file, &mtk_sub_header()).unwrap();

    let entry = writer.get_entry(&mut file).unwrap();
    assert_eq!(entry.kind, EntryType::Ramdisk);
    writer.write_data(&mut file, ramdisk).unwrap();

    // SECONDBOOT and DEVICE_TREE are never streamed; close finishes them with
    // zero size.
    writer.close(&mut file).unwrap();

    file.into_inner()
}

/// The digest the trailer carries: each section's bytes in table order, then
/// its size as a little-endian u32, where the MTK sub-headers fold into their
/// payload's size term.
fn expected_digest(kernel: &[u8], ramdisk: &[u8]) -> [u8; 20] {
    let mut context = ring::digest::Context::new(&ring::digest::SHA1_FOR_LEGACY_USE_ONLY);

    let mut kernel_hdr = mtk_sub_header();
    kernel_hdr[4..8].copy_from_slice(&(kernel.len() as u32).to_le_bytes());
    let mut ramdisk_hdr = mtk_sub_header();
    ramdisk_hdr[4..8].copy_from_slice(&(ramdisk.len() as u32).to_le_bytes());

    context.update(&kernel_hdr);
    context.update(kernel);
    context.update(&((kernel.len() + MTK_HEADER_SIZE) as u32).to_le_bytes());
    context.update(&ramdisk_hdr);
    context.update(ramdisk);
    context.update(&((ramdisk.len() + MTK_HEADER_SIZE) as u32).to_le_bytes());
    context.update(&0u32.to_le_bytes()); // second bootloader size
    // Empty device tree contributes nothing.

    let mut digest = [0u8; 20];
    digest.copy_from_slice(context.finish().as_ref());
    digest
}

#[test]
fn mtk_write_layout() {
    let kernel = [0xaa; 1024];
    let ramdisk = [0xbb; 2048];
    let data = write_mtk_image("test", &kernel, &ramdisk);

    // header page + kernel sub-header + kernel + padding, then ramdisk
    // sub-header + ramdisk + padding.
    assert_eq!(data.len(), 8192);

    assert_eq!(&data[..8], b"ANDROID!");
    assert_eq!(le32_at(&data, 8), 1024 + 512); // kernel_size
    assert_eq!(le32_at(&data, 16), 2048 + 512); // ramdisk_size
    assert_eq!(le32_at(&data, 24), 0); // second_size
    assert_eq!(le32_at(&data, 36), PAGE_SIZE); // page_size
    assert_eq!(le32_at(&data, 40), 0); // dt_size
    assert_eq!(&data[48..52], b"test");

    // Kernel sub-header at the start of the second page, payload flush
    // against it.
    assert_eq!(&data[2048..2052], &MTK_MAGIC);
    assert_eq!(le32_at(&data, 2048 + 4), 1024);
    assert_eq!(&data[2560..3584], &kernel);

    // Ramdisk sub-header on the next page boundary.
    assert_eq!(&data[4096..4100], &MTK_MAGIC);
    assert_eq!(le32_at(&data, 4096 + 4), 2048);
    assert_eq!(&data[4608..6656], &ramdisk);

    // id carries the digest in its first 20 bytes; the rest stays zero.
    assert_eq!(&data[576..596], &expected_digest(&kernel, &ramdisk));
    assert_eq!(&data[596..608], &[0u8; 12]);
}

#[test]
fn digest_is_deterministic() {
    let first = write_mtk_image("test", &[0xaa; 1024], &[0xbb; 2048]);
    let second = write_mtk_image("test", &[0xaa; 1024], &[0xbb; 2048]);

    assert_eq!(first, second);
}

#[test]
fn digest_covers_payload_bytes() {
    let base = write_mtk_image("test", &[0xaa; 1024], &[0xbb; 2048]);

    let mut kernel = [0xaa; 1024];
    kernel[512] ^= 0x01;
    let flipped = write_mtk_image("test", &kernel, &[0xbb; 2048]);

    assert_ne!(&base[576..596], &flipped[576..596]);
}

#[test]
fn digest_ignores_header_only_fields() {
    // The board name lives outside every section, so it must not influence
    // the digest.
    let first = write_mtk_image("test", &[0xaa; 1024], &[0xbb; 2048]);
    let second = write_mtk_image("prod", &[0xaa; 1024], &[0xbb; 2048]);

    assert_eq!(&first[576..596], &second[576..596]);
    assert_ne!(first, second);
}

/// A file that tracks position and length without storing data, so tests can
/// exercise entry sizes far beyond what fits in memory.
#[derive(Default)]
struct NullFile {
    pos: u64,
    len: u64,
}

impl Read for NullFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.len.saturating_sub(self.pos).min(buf.len() as u64) as usize;
        buf[..n].fill(0);
        self.pos += n as u64;
        Ok(n)
    }
}

impl Write for NullFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pos += buf.len() as u64;
        self.len = self.len.max(self.pos);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for NullFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let new_pos = match pos {
            SeekFrom::Start(offset) => i128::from(offset),
            SeekFrom::End(offset) => i128::from(self.len) + i128::from(offset),
            SeekFrom::Current(offset) => i128::from(self.pos) + i128::from(offset),
        };

        if new_pos < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Seek before start of file",
            ));
        }

        self.pos = new_pos as u64;
        Ok(self.pos)
    }
}

impl RandomAccessFile for NullFile {
    fn set_len(&mut self, size: u64) -> io::Result<()> {
        self.len = size;
        Ok(())
    }
}

#[test]
fn oversized_kernel_is_fatal() {
    let mut writer = Writer::new();
    writer.set_format(Format::Mtk).unwrap();

    let mut header = writer.header().unwrap();
    header.set_page_size(PAGE_SIZE).unwrap();

    let mut file = NullFile::default();
    writer.write_header(&mut file, &header).unwrap();

    writer.get_entry(&mut file).unwrap();
    writer.write_data(&mut file, &mtk_sub_header()).unwrap();

    // Declare a kernel size that would overflow the on-disk size field once
    // the sub-header is counted in.
    let mut entry = writer.get_entry(&mut file).unwrap();
    assert_eq!(entry.kind, EntryType::Kernel);
    entry.size = Some(u64::from(u32::MAX) - MTK_HEADER_SIZE as u64);
    writer.write_entry(&mut file, &entry).unwrap();

    let err = writer.finish_entry(&mut file).unwrap_err();
    assert_matches!(err, Error::EntryTooLargeForMtk);
    assert!(err.is_fatal());

    // The writer is unusable afterwards.
    assert_matches!(writer.get_entry(&mut file), Err(Error::InvalidState(_)));
    assert_matches!(writer.close(&mut file), Err(Error::InvalidState(_)));
}

#[test]
fn sub_header_entry_must_be_full_size() {
    let mut writer = Writer::new();
    writer.set_format(Format::Mtk).unwrap();

    let mut header = writer.header().unwrap();
    header.set_page_size(PAGE_SIZE).unwrap();

    let mut file = Cursor::new(Vec::new());
    writer.write_header(&mut file, &header).unwrap();

    let entry = writer.get_entry(&mut file).unwrap();
    assert_eq!(entry.kind, EntryType::MtkKernelHeader);
    writer.write_data(&mut file, &[0u8; 100]).unwrap();

    let err = writer.finish_entry(&mut file).unwrap_err();
    assert_matches!(err, Error::InvalidMtkHeaderSize(100));
    assert!(err.is_fatal());
}

#[test]
fn page_size_is_required() {
    let mut writer = Writer::new();
    writer.set_format(Format::Mtk).unwrap();

    let header = writer.header().unwrap();
    let mut file = Cursor::new(Vec::new());

    assert_matches!(
        writer.write_header(&mut file, &header),
        Err(Error::MissingField("page_size"))
    );
}

#[test]
fn page_size_must_be_allowed() {
    let mut writer = Writer::new();
    writer.set_format(Format::Mtk).unwrap();

    let mut header = writer.header().unwrap();
    header.set_page_size(1000).unwrap();

    let mut file = Cursor::new(Vec::new());
    assert_matches!(
        writer.write_header(&mut file, &header),
        Err(Error::InvalidPageSize(1000))
    );
}

#[test]
fn board_name_must_fit() {
    let mut writer = Writer::new();
    writer.set_format(Format::Mtk).unwrap();

    let mut header = writer.header().unwrap();
    header.set_page_size(PAGE_SIZE).unwrap();
    // 16 bytes: no room left for the NUL terminator.
    header.set_board_name("abcdefghijklmnop".to_owned()).unwrap();

    let mut file = Cursor::new(Vec::new());
    assert_matches!(
        writer.write_header(&mut file, &header),
        Err(Error::StringTooLong("board_name", _))
    );
}

#[test]
fn format_must_be_set_first() {
    let writer = Writer::new();
    assert_matches!(writer.header(), Err(Error::InvalidState(_)));
}

#[test]
fn close_requires_streaming_state() {
    let mut writer = Writer::new();
    writer.set_format(Format::Mtk).unwrap();

    let mut file = Cursor::new(Vec::new());
    let err = writer.close(&mut file).unwrap_err();
    assert_matches!(err, Error::InvalidState(_));
}
