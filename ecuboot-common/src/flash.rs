// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Page engine for erase-before-write storage.
//!
//! Writes can start at any offset. For every page touched, the engine:
//! - compares the stored bytes with the desired bytes;
//! - erases only when the driver reports that a bit must go back to 1;
//! - restores the untouched part of the page from the scratch buffer;
//! - checks the result with a CRC.
//!
//! Pages larger than the scratch buffer cannot be backed up. They are
//! written in place, or rejected when the caller asks for a backup.

use thiserror::Error;

use crate::checksum::FIRMWARE_CRC;

/// Bytes streamed through the stack when the data source is flash itself.
const STREAM_CHUNK: usize = 64;

/// Errors reported by the page engine and its drivers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FlashError {
    #[error("flash write failed")]
    Write,
    #[error("flash read failed")]
    Read,
    #[error("flash erase failed")]
    Erase,
    #[error("flash move failed")]
    Move,
    #[error("address is outside every flash page")]
    OutOfBounds,
    #[error("no scratch buffer available")]
    NoBuffer,
    #[error("CRC mismatch after write")]
    CrcMismatch,
    #[error("scratch buffer too small to back up the page")]
    InsufficientBuffer,
    #[error("invalid parameter")]
    InvalidParam,
}

impl FlashError {
    /// Stable numeric code, 0 being reserved for success.
    pub fn code(self) -> u8 {
        match self {
            FlashError::Write => 1,
            FlashError::Read => 2,
            FlashError::Erase => 3,
            FlashError::Move => 4,
            FlashError::OutOfBounds => 5,
            FlashError::NoBuffer => 6,
            FlashError::CrcMismatch => 7,
            FlashError::InsufficientBuffer => 8,
            FlashError::InvalidParam => 9,
        }
    }
}

/// One erasable unit of the device, offsets relative to the device base.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Page {
    pub index: u32,
    pub start: u32,
    pub size: u32,
}

impl Page {
    pub fn end(&self) -> u32 {
        self.start + self.size
    }
}

/// Page geometry of a device.
#[derive(Clone, Copy, Debug)]
pub enum PageLayout<'a> {
    /// `count` pages of `size` bytes starting at `start`.
    Regular { start: u32, size: u32, count: u32 },
    /// Contiguous pages with individual sizes, e.g. mixed 16K/64K/128K sectors.
    Irregular { start: u32, sizes: &'a [u32] },
}

impl PageLayout<'_> {
    /// Page containing `offset`, if any.
    pub fn page_at(&self, offset: u32) -> Option<Page> {
        match *self {
            PageLayout::Regular { start, size, count } => {
                if offset < start || size == 0 {
                    return None;
                }
                let index = (offset - start) / size;
                (index < count).then(|| Page {
                    index,
                    start: start + index * size,
                    size,
                })
            }
            PageLayout::Irregular { start, sizes } => {
                let mut page_start = start;
                for (index, &size) in sizes.iter().enumerate() {
                    if offset >= page_start && offset - page_start < size {
                        return Some(Page {
                            index: index as u32,
                            start: page_start,
                            size,
                        });
                    }
                    page_start += size;
                }
                None
            }
        }
    }

    /// One past the last byte covered by the layout.
    pub fn end(&self) -> u32 {
        match *self {
            PageLayout::Regular { start, size, count } => start + size * count,
            PageLayout::Irregular { start, sizes } => start + sizes.iter().sum::<u32>(),
        }
    }
}

/// Raw device access. Offsets are relative to the engine's base address.
pub trait FlashDriver {
    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), FlashError>;

    fn write(&mut self, offset: u32, data: &[u8]) -> Result<(), FlashError>;

    /// Erase `len` bytes at `offset` inside `page`. Devices that can only
    /// erase whole pages erase the page.
    fn erase(&mut self, page: &Page, offset: u32, len: u32) -> Result<(), FlashError>;

    /// Whether storing `desired` over `current` needs an erase first.
    fn needs_erase(&self, current: u8, desired: u8) -> bool {
        current & desired != desired
    }
}

/// Where the bytes of a write come from.
#[derive(Clone, Copy)]
enum Source<'s> {
    Bytes(&'s [u8]),
    Erased,
    Flash(u32),
}

impl Source<'_> {
    fn advance(self, n: u32) -> Self {
        match self {
            Source::Bytes(data) => Source::Bytes(&data[n as usize..]),
            Source::Erased => Source::Erased,
            Source::Flash(offset) => Source::Flash(offset + n),
        }
    }

    fn load<D: FlashDriver>(&self, driver: &mut D, from: u32, out: &mut [u8]) -> Result<(), FlashError> {
        match *self {
            Source::Bytes(data) => {
                let from = from as usize;
                out.copy_from_slice(&data[from..from + out.len()]);
                Ok(())
            }
            Source::Erased => {
                out.fill(0xFF);
                Ok(())
            }
            Source::Flash(offset) => driver.read(offset + from, out),
        }
    }
}

/// What a page needs before its new content can be stored.
struct Survey {
    erase: bool,
    changed: bool,
    page_crc: u32,
    footprint_crc: u32,
}

/// Erase-avoiding writer over a paged device.
pub struct FlashPages<'a, D> {
    driver: D,
    layout: PageLayout<'a>,
    scratch: &'a mut [u8],
    base_address: u32,
}

impl<'a, D: FlashDriver> FlashPages<'a, D> {
    pub fn new(driver: D, layout: PageLayout<'a>, scratch: &'a mut [u8], base_address: u32) -> Self {
        Self {
            driver,
            layout,
            scratch,
            base_address,
        }
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    pub fn layout(&self) -> &PageLayout<'a> {
        &self.layout
    }

    pub fn base_address(&self) -> u32 {
        self.base_address
    }

    fn offset_of(&self, address: u32, size: u32) -> Result<u32, FlashError> {
        let offset = address
            .checked_sub(self.base_address)
            .ok_or(FlashError::OutOfBounds)?;
        let end = offset.checked_add(size).ok_or(FlashError::OutOfBounds)?;
        if end > self.layout.end() {
            return Err(FlashError::OutOfBounds);
        }
        Ok(offset)
    }

    /// Raw read of `buf.len()` bytes at the absolute `address`.
    pub fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        let offset = self.offset_of(address, buf.len() as u32)?;
        self.driver.read(offset, buf)
    }

    pub fn write(&mut self, address: u32, data: &[u8], always_backup: bool) -> Result<(), FlashError> {
        self.write_or_erase(address, Some(data), data.len() as u32, always_backup)
    }

    pub fn erase(&mut self, address: u32, size: u32, always_backup: bool) -> Result<(), FlashError> {
        self.write_or_erase(address, None, size, always_backup)
    }

    /// Store `size` bytes of `data` at `address`, or reset the range to the
    /// erased state when `data` is `None`.
    pub fn write_or_erase(
        &mut self,
        address: u32,
        data: Option<&[u8]>,
        size: u32,
        always_backup: bool,
    ) -> Result<(), FlashError> {
        let source = match data {
            Some(data) if data.len() < size as usize => return Err(FlashError::InvalidParam),
            Some(data) => Source::Bytes(data),
            None => Source::Erased,
        };
        self.program(address, source, size, always_backup)
    }

    /// Copy `size` bytes from one flash range to another. The ranges must
    /// not share a page; use [`FlashPages::move_region`] for overlapping data.
    pub fn copy(&mut self, src: u32, dst: u32, size: u32, always_backup: bool) -> Result<(), FlashError> {
        let src_offset = self.offset_of(src, size)?;
        self.program(dst, Source::Flash(src_offset), size, always_backup)
    }

    fn program(&mut self, address: u32, source: Source<'_>, size: u32, always_backup: bool) -> Result<(), FlashError> {
        if size == 0 {
            return Ok(());
        }
        debug!("flash: program 0x{:x} size {} backup {}", address, size, always_backup);

        let mut offset = self.offset_of(address, size)?;
        let mut done = 0;
        while done < size {
            let page = self.layout.page_at(offset).ok_or(FlashError::OutOfBounds)?;
            let in_page = offset - page.start;
            let len = (size - done).min(page.size - in_page);
            self.program_page(&page, in_page, source.advance(done), len, always_backup)?;
            done += len;
            offset += len;
        }
        Ok(())
    }

    fn program_page(
        &mut self,
        page: &Page,
        in_page: u32,
        source: Source<'_>,
        len: u32,
        always_backup: bool,
    ) -> Result<(), FlashError> {
        if self.scratch.is_empty() {
            error!("flash: no scratch buffer");
            return Err(FlashError::NoBuffer);
        }
        let survey = self.survey(page, in_page, source, len)?;
        let footprint = page.start + in_page;

        if self.scratch.len() < page.size as usize {
            if survey.erase && always_backup {
                error!(
                    "flash: page {} needs erase but scratch {} < page {}",
                    page.index,
                    self.scratch.len(),
                    page.size
                );
                return Err(FlashError::InsufficientBuffer);
            }
            if survey.erase {
                info!("flash: erasing without backup in page {}", page.index);
                self.driver.erase(page, footprint, len)?;
            }
            if survey.erase || survey.changed {
                self.store(footprint, source, len)?;
            }
            return self.verify(footprint, len, survey.footprint_crc);
        }

        if !survey.erase {
            if survey.changed {
                self.store(footprint, source, len)?;
            }
        } else {
            debug!("flash: erasing page {}", page.index);
            self.driver.erase(page, page.start, page.size)?;
            let whole_page_erase = matches!(source, Source::Erased) && in_page == 0 && len == page.size;
            if !whole_page_erase {
                self.driver.write(page.start, &self.scratch[..page.size as usize])?;
            }
        }
        self.verify(page.start, page.size, survey.page_crc)
    }

    /// Walk the page through the scratch buffer, merging the desired bytes
    /// over the stored ones. When the scratch holds the whole page it ends
    /// up containing the final page image.
    fn survey(&mut self, page: &Page, in_page: u32, source: Source<'_>, len: u32) -> Result<Survey, FlashError> {
        let Self { driver, scratch, .. } = &mut *self;
        let capacity = scratch.len() as u32;
        let mut page_digest = FIRMWARE_CRC.digest();
        let mut footprint_digest = FIRMWARE_CRC.digest();
        let mut survey = Survey {
            erase: false,
            changed: false,
            page_crc: 0,
            footprint_crc: 0,
        };

        let mut pos = 0;
        while pos < page.size {
            let n = (page.size - pos).min(capacity);
            let buf = &mut scratch[..n as usize];
            driver.read(page.start + pos, buf)?;

            let lo = pos.max(in_page);
            let hi = (pos + n).min(in_page + len);
            if lo < hi {
                let window = &mut buf[(lo - pos) as usize..(hi - pos) as usize];
                merge(driver, source, lo - in_page, window, &mut survey)?;
                footprint_digest.update(window);
            }
            page_digest.update(buf);
            pos += n;
        }

        survey.page_crc = page_digest.finalize();
        survey.footprint_crc = footprint_digest.finalize();
        Ok(survey)
    }

    fn store(&mut self, offset: u32, source: Source<'_>, len: u32) -> Result<(), FlashError> {
        match source {
            Source::Bytes(data) => self.driver.write(offset, &data[..len as usize]),
            Source::Erased => Ok(()),
            Source::Flash(_) => {
                let mut tmp = [0u8; STREAM_CHUNK];
                let mut done = 0;
                while done < len {
                    let n = (len - done).min(STREAM_CHUNK as u32);
                    let piece = &mut tmp[..n as usize];
                    source.load(&mut self.driver, done, piece)?;
                    self.driver.write(offset + done, piece)?;
                    done += n;
                }
                Ok(())
            }
        }
    }

    fn verify(&mut self, offset: u32, len: u32, expected: u32) -> Result<(), FlashError> {
        let actual = stored_crc(&mut self.driver, &mut self.scratch[..], offset, len)?;
        if actual != expected {
            error!("flash: CRC 0x{:x} != 0x{:x} at 0x{:x}", actual, expected, offset);
            return Err(FlashError::CrcMismatch);
        }
        Ok(())
    }

    /// Shift `size` bytes from `src` to `dst`. The ranges may overlap in
    /// either direction. Every destination page is rebuilt in the scratch
    /// buffer, so pages larger than the scratch cannot be moved.
    pub fn move_region(&mut self, src: u32, dst: u32, size: u32) -> Result<(), FlashError> {
        if src == dst || size == 0 {
            return Ok(());
        }
        let src_offset = self.offset_of(src, size)?;
        let dst_offset = self.offset_of(dst, size)?;
        info!("flash: move 0x{:x} -> 0x{:x} size {}", src, dst, size);

        let mut remaining = size;
        if src_offset > dst_offset {
            let (mut dst_pos, mut src_pos) = (dst_offset, src_offset);
            while remaining > 0 {
                let page = self.layout.page_at(dst_pos).ok_or(FlashError::OutOfBounds)?;
                let n = (page.end() - dst_pos).min(remaining);
                self.rebuild_page(&page, dst_pos - page.start, src_pos, n)?;
                remaining -= n;
                dst_pos += n;
                src_pos += n;
            }
        } else {
            let (mut dst_end, mut src_end) = (dst_offset + size, src_offset + size);
            while remaining > 0 {
                let page = self.layout.page_at(dst_end - 1).ok_or(FlashError::OutOfBounds)?;
                let start = (dst_end - remaining).max(page.start);
                let n = dst_end - start;
                self.rebuild_page(&page, start - page.start, src_end - n, n)?;
                remaining -= n;
                dst_end -= n;
                src_end -= n;
            }
        }
        Ok(())
    }

    fn rebuild_page(&mut self, page: &Page, in_page: u32, src: u32, len: u32) -> Result<(), FlashError> {
        let size = page.size as usize;
        if self.scratch.is_empty() {
            return Err(FlashError::NoBuffer);
        }
        if self.scratch.len() < size {
            return Err(FlashError::InsufficientBuffer);
        }
        let head = in_page as usize;
        let body = head + len as usize;
        let Self { driver, scratch, .. } = &mut *self;
        let buf = &mut scratch[..size];

        if let Err(e) = load_relocated(driver, buf, page.start, head, body, src) {
            error!("flash: move backup of page {} failed: {:?}", page.index, e);
            return Err(FlashError::Move);
        }
        let expected = FIRMWARE_CRC.checksum(buf);

        let rewritten = match driver.erase(page, page.start, page.size) {
            Ok(()) => driver.write(page.start, buf),
            Err(e) => Err(e),
        };
        if let Err(e) = rewritten {
            error!("flash: move rewrite of page {} failed: {:?}", page.index, e);
            return Err(FlashError::Move);
        }
        self.verify(page.start, page.size, expected)
    }
}

/// Fill `buf` with the page image after relocation: the stored head, `body - head`
/// bytes read from `src`, then the stored tail.
fn load_relocated<D: FlashDriver>(
    driver: &mut D,
    buf: &mut [u8],
    page_start: u32,
    head: usize,
    body: usize,
    src: u32,
) -> Result<(), FlashError> {
    driver.read(page_start, &mut buf[..head])?;
    driver.read(src, &mut buf[head..body])?;
    driver.read(page_start + body as u32, &mut buf[body..])
}

fn merge<D: FlashDriver>(
    driver: &mut D,
    source: Source<'_>,
    from: u32,
    current: &mut [u8],
    survey: &mut Survey,
) -> Result<(), FlashError> {
    let mut tmp = [0u8; STREAM_CHUNK];
    for (i, piece) in current.chunks_mut(STREAM_CHUNK).enumerate() {
        let desired = &mut tmp[..piece.len()];
        source.load(driver, from + (i * STREAM_CHUNK) as u32, desired)?;
        for (stored, &wanted) in piece.iter_mut().zip(desired.iter()) {
            if *stored != wanted {
                survey.changed = true;
                if !survey.erase && driver.needs_erase(*stored, wanted) {
                    survey.erase = true;
                }
            }
            *stored = wanted;
        }
    }
    Ok(())
}

fn stored_crc<D: FlashDriver>(driver: &mut D, scratch: &mut [u8], offset: u32, len: u32) -> Result<u32, FlashError> {
    let mut digest = FIRMWARE_CRC.digest();
    let capacity = scratch.len() as u32;
    let mut pos = 0;
    while pos < len {
        let n = (len - pos).min(capacity);
        let buf = &mut scratch[..n as usize];
        driver.read(offset + pos, buf)?;
        digest.update(buf);
        pos += n;
    }
    Ok(digest.finalize())
}
