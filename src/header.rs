// SPDX-FileCopyrightText: 2023-2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

bitflags! {
    /// Logical header fields a format accepts.
    #[repr(transparent)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
    pub struct HeaderFields: u32 {
        const BOARD_NAME = 1 << 0;
        const KERNEL_CMDLINE = 1 << 1;
        const PAGE_SIZE = 1 << 2;
        const KERNEL_ADDRESS = 1 << 3;
        const RAMDISK_ADDRESS = 1 << 4;
        const SECONDBOOT_ADDRESS = 1 << 5;
        const KERNEL_TAGS_ADDRESS = 1 << 6;
    }
}

/// Format-neutral view of a boot image header. Instances advertise the subset
/// of fields the active format accepts; setting a field outside that subset
/// fails at the call site. Length and value validation happens in the codecs
/// when the header is serialized.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct Header {
    supported_fields: HeaderFields,
    board_name: Option<String>,
    kernel_cmdline: Option<String>,
    page_size: Option<u32>,
    kernel_address: Option<u32>,
    ramdisk_address: Option<u32>,
    secondboot_address: Option<u32>,
    kernel_tags_address: Option<u32>,
}

impl Header {
    pub fn new(supported_fields: HeaderFields) -> Self {
        Self {
            supported_fields,
            board_name: None,
            kernel_cmdline: None,
            page_size: None,
            kernel_address: None,
            ramdisk_address: None,
            secondboot_address: None,
            kernel_tags_address: None,
        }
    }

    pub fn supported_fields(&self) -> HeaderFields {
        self.supported_fields
    }

    fn check_supported(&self, field: HeaderFields, name: &'static str) -> Result<()> {
        if self.supported_fields.contains(field) {
            Ok(())
        } else {
            Err(Error::UnsupportedField(name))
        }
    }

    pub fn board_name(&self) -> Option<&str> {
        self.board_name.as_deref()
    }

    pub fn set_board_name(&mut self, value: String) -> Result<()> {
        self.check_supported(HeaderFields::BOARD_NAME, "board_name")?;
        self.board_name = Some(value);
        Ok(())
    }

    pub fn kernel_cmdline(&self) -> Option<&str> {
        self.kernel_cmdline.as_deref()
    }

    pub fn set_kernel_cmdline(&mut self, value: String) -> Result<()> {
        self.check_supported(HeaderFields::KERNEL_CMDLINE, "kernel_cmdline")?;
        self.kernel_cmdline = Some(value);
        Ok(())
    }

    pub fn page_size(&self) -> Option<u32> {
        self.page_size
    }

    pub fn set_page_size(&mut self, value: u32) -> Result<()> {
        self.check_supported(HeaderFields::PAGE_SIZE, "page_size")?;
        self.page_size = Some(value);
        Ok(())
    }

    pub fn kernel_address(&self) -> Option<u32> {
        self.kernel_address
    }

    pub fn set_kernel_address(&mut self, value: u32) -> Result<()> {
        self.check_supported(HeaderFields::KERNEL_ADDRESS, "kernel_address")?;
        self.kernel_address = Some(value);
        Ok(())
    }

    pub fn ramdisk_address(&self) -> Option<u32> {
        self.ramdisk_address
    }

    pub fn set_ramdisk_address(&mut self, value: u32) -> Result<()> {
        self.check_supported(HeaderFields::RAMDISK_ADDRESS, "ramdisk_address")?;
        self.ramdisk_address = Some(value);
        Ok(())
    }

    pub fn secondboot_address(&self) -> Option<u32> {
        self.secondboot_address
    }

    pub fn set_secondboot_address(&mut self, value: u32) -> Result<()> {
        self.check_supported(HeaderFields::SECONDBOOT_ADDRESS, "secondboot_address")?;
        self.secondboot_address = Some(value);
        Ok(())
    }

    pub fn kernel_tags_address(&self) -> Option<u32> {
        self.kernel_tags_address
    }

    pub fn set_kernel_tags_address(&mut self, value: u32) -> Result<()> {
        self.check_supported(HeaderFields::KERNEL_TAGS_ADDRESS, "kernel_tags_address")?;
        self.kernel_tags_address = Some(value);
        Ok(())
    }
}
