// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! In-process CAN link between the sender and a bootloader on RAM flash.

use core::mem::size_of;

use ecuboot_common::bootloader::{Bootloader, Platform, Section, Sections};
use ecuboot_common::flash::{FlashDriver, FlashError, Page};
use ecuboot_common::frame::{decode_frame, dispatch, CanTransport, FrameQueue, Inbound, MAX_PAYLOAD};
use ecuboot_common::memory::PagedMemory;
use ecuboot_common::protocol::PacketHeader;
use ecuboot_common::sender::Sender;

/// Base address of the simulated flash.
pub const FLASH_BASE: u32 = 0x0800_0000;
pub const PAGE_SIZE: u32 = 2048;
/// Burst buffer of the simulated bootloader.
pub const BURST_SIZE: usize = 256;
/// Data bytes per packet once the device id and the sequence are in the frame.
pub const PACKET_SIZE: u16 = (MAX_PAYLOAD - size_of::<PacketHeader>()) as u16;

const QUEUE_DEPTH: usize = 64;

pub type SimTransport = CanTransport<FrameQueue<QUEUE_DEPTH>>;
pub type SimBootloader<'a> = Bootloader<'a, PagedMemory<'a, RamFlash>, SimTransport, SimPlatform>;

/// NOR flash in RAM: writes can only clear bits.
pub struct RamFlash {
    mem: Vec<u8>,
    pub writes: usize,
    pub erases: usize,
}

impl RamFlash {
    pub fn new(size: usize) -> Self {
        Self {
            mem: vec![0xFF; size],
            writes: 0,
            erases: 0,
        }
    }

    fn range(&self, offset: u32, len: usize) -> Result<core::ops::Range<usize>, FlashError> {
        let start = offset as usize;
        let end = start.checked_add(len).ok_or(FlashError::OutOfBounds)?;
        if end > self.mem.len() {
            return Err(FlashError::OutOfBounds);
        }
        Ok(start..end)
    }
}

impl FlashDriver for RamFlash {
    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        let range = self.range(offset, buf.len())?;
        buf.copy_from_slice(&self.mem[range]);
        Ok(())
    }

    fn write(&mut self, offset: u32, data: &[u8]) -> Result<(), FlashError> {
        let range = self.range(offset, data.len())?;
        for (stored, &byte) in self.mem[range].iter_mut().zip(data) {
            *stored &= byte;
        }
        self.writes += 1;
        Ok(())
    }

    fn erase(&mut self, _page: &Page, offset: u32, len: u32) -> Result<(), FlashError> {
        let range = self.range(offset, len as usize)?;
        self.mem[range].fill(0xFF);
        self.erases += 1;
        Ok(())
    }
}

/// Records the jump instead of leaving the bootloader.
#[derive(Default)]
pub struct SimPlatform {
    pub jumped: bool,
}

impl Platform for SimPlatform {
    fn jump_to_app(&mut self) {
        self.jumped = true;
    }
}

/// Section map for a binary of `size` bytes: one info page in front of
/// each slot. Also returns the page count of the whole device.
pub fn sections_for(size: u32) -> (Sections, u32) {
    let slot_pages = size.div_ceil(PAGE_SIZE).max(1);
    let slot = slot_pages * PAGE_SIZE;
    let sections = Sections {
        app_info: Section {
            address: FLASH_BASE,
            size: PAGE_SIZE,
        },
        app: Section {
            address: FLASH_BASE + PAGE_SIZE,
            size: slot,
        },
        upgrade_info: Section {
            address: FLASH_BASE + PAGE_SIZE + slot,
            size: PAGE_SIZE,
        },
        upgrade: Section {
            address: FLASH_BASE + 2 * PAGE_SIZE + slot,
            size: slot,
        },
    };
    (sections, 2 * (slot_pages + 1))
}

/// Shuttles frames between the host-side sender and the bootloader.
pub struct Link {
    host: SimTransport,
    device_id: u8,
    frames: u64,
}

impl Link {
    pub fn new(device_id: u8) -> Self {
        Self {
            host: CanTransport::new(FrameQueue::new()),
            device_id,
            frames: 0,
        }
    }

    /// Frames carried so far in both directions.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Run one simulated millisecond on both ends.
    pub fn step(&mut self, now: u32, boot: &mut SimBootloader<'_>, sender: &mut Sender<'_>) {
        boot.tick(now);
        while let Some(frame) = boot.transport_mut().bus_mut().pop() {
            self.frames += 1;
            if let Some(Inbound::Protocol { msg_type, id, payload }) = decode_frame(&frame, self.device_id) {
                sender.process_message(now, msg_type, id, payload);
            }
        }

        sender.tick(now, &mut self.host);
        while let Some(frame) = self.host.bus_mut().pop() {
            self.frames += 1;
            dispatch(boot, now, &frame);
        }
    }
}
