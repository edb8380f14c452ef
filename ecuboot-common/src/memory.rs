// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Absolute-address storage used by the bootloader.

use crate::checksum::FIRMWARE_CRC;
use crate::flash::{FlashDriver, FlashError, FlashPages};

/// Read size used when a region is checksummed through [`Memory::crc32`].
pub const CRC_READ_CHUNK: usize = 256;

/// Storage holding the installed-firmware records and the image slots.
pub trait Memory {
    fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<(), FlashError>;

    /// Persist `data` at `address`, preserving every byte outside the range.
    fn write(&mut self, address: u32, data: &[u8]) -> Result<(), FlashError>;

    /// Copy `size` bytes between two non-overlapping regions.
    fn copy(&mut self, src: u32, dst: u32, size: u32) -> Result<(), FlashError>;

    /// Firmware CRC of `size` bytes starting at `address`.
    fn crc32(&mut self, address: u32, size: u32) -> Result<u32, FlashError> {
        let mut digest = FIRMWARE_CRC.digest();
        let mut buf = [0u8; CRC_READ_CHUNK];
        let mut done = 0;
        while done < size {
            let n = (size - done).min(CRC_READ_CHUNK as u32);
            let chunk = &mut buf[..n as usize];
            self.read(address + done, chunk)?;
            digest.update(chunk);
            done += n;
        }
        Ok(digest.finalize())
    }
}

/// [`Memory`] backed by the page engine, always backing up untouched bytes.
pub struct PagedMemory<'a, D> {
    pages: FlashPages<'a, D>,
}

impl<'a, D: FlashDriver> PagedMemory<'a, D> {
    pub fn new(pages: FlashPages<'a, D>) -> Self {
        Self { pages }
    }

    pub fn pages(&self) -> &FlashPages<'a, D> {
        &self.pages
    }

    pub fn pages_mut(&mut self) -> &mut FlashPages<'a, D> {
        &mut self.pages
    }
}

impl<D: FlashDriver> Memory for PagedMemory<'_, D> {
    fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        self.pages.read(address, buf)
    }

    fn write(&mut self, address: u32, data: &[u8]) -> Result<(), FlashError> {
        self.pages.write(address, data, true)
    }

    fn copy(&mut self, src: u32, dst: u32, size: u32) -> Result<(), FlashError> {
        self.pages.copy(src, dst, size, true)
    }
}
