// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Fakes and builders shared by the integration tests.

#![allow(dead_code)]

use ecuboot_common::bootloader::{Bootloader, BootloaderConfig, Platform, Section, Sections};
use ecuboot_common::checksum::{BURST_CRC_POLY, FIRMWARE_CRC};
use ecuboot_common::cipher::{encrypt_image, Xxtea};
use ecuboot_common::flash::{FlashDriver, FlashError, FlashPages, Page, PageLayout};
use ecuboot_common::frame::{decode_frame, dispatch, CanFrame, CanTransport, FrameQueue, Inbound};
use ecuboot_common::image::{FirmwareHeader, FirmwareInfo, PublicKey, HEADER_SIZE};
use ecuboot_common::memory::PagedMemory;
use ecuboot_common::protocol::{MsgType, SendError, Transport};
use ecuboot_common::sender::{Sender, SenderConfig};
use ecuboot_common::verify::{header_digest, P256Verifier};
use p256::ecdsa::signature::hazmat::PrehashSigner;
use p256::ecdsa::{Signature, SigningKey};
use sha2::{Digest, Sha256};

pub const DEVICE_ID: u8 = 4;
pub const MAGIC: u32 = 0xEC0B_007A;
pub const CIPHER_KEY: [u32; 4] = [0x0BAD_F00D, 0xC0FF_EE00, 0x1234_5678, 0x9ABC_DEF0];
pub const PAGE_SIZE: u32 = 256;
pub const PAGE_COUNT: u32 = 64;
pub const FLASH_BASE: u32 = 0x0800_0000;
pub const CHUNK_SIZE: usize = 64;
pub const BURST_SIZE: usize = 96;
/// Data bytes per packet on CAN: 8 minus the id byte and the sequence.
pub const PACKET_SIZE: u16 = 4;

pub static VERIFIER: P256Verifier = P256Verifier;
pub static CIPHER: Xxtea = Xxtea::new(CIPHER_KEY);

// =============================================================================
// RAM NOR flash
// =============================================================================

/// NOR-like flash in RAM: writes can only clear bits.
pub struct RamFlash {
    pub mem: Vec<u8>,
    pub reads: usize,
    pub writes: usize,
    pub erases: usize,
    pub erased_pages: Vec<u32>,
    pub fail_writes: bool,
    pub fail_reads: bool,
    /// Report writes as done without storing them.
    pub drop_writes: bool,
}

impl RamFlash {
    pub fn new(size: usize) -> Self {
        Self {
            mem: vec![0xFF; size],
            reads: 0,
            writes: 0,
            erases: 0,
            erased_pages: Vec::new(),
            fail_writes: false,
            fail_reads: false,
            drop_writes: false,
        }
    }

    pub fn reset_counters(&mut self) {
        self.reads = 0;
        self.writes = 0;
        self.erases = 0;
        self.erased_pages.clear();
    }

    fn range(&self, offset: u32, len: usize) -> Result<std::ops::Range<usize>, FlashError> {
        let start = offset as usize;
        let end = start + len;
        if end > self.mem.len() {
            return Err(FlashError::OutOfBounds);
        }
        Ok(start..end)
    }
}

impl FlashDriver for RamFlash {
    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        if self.fail_reads {
            return Err(FlashError::Read);
        }
        let range = self.range(offset, buf.len())?;
        self.reads += 1;
        buf.copy_from_slice(&self.mem[range]);
        Ok(())
    }

    fn write(&mut self, offset: u32, data: &[u8]) -> Result<(), FlashError> {
        if self.fail_writes {
            return Err(FlashError::Write);
        }
        let range = self.range(offset, data.len())?;
        self.writes += 1;
        if self.drop_writes {
            return Ok(());
        }
        for (stored, &byte) in self.mem[range].iter_mut().zip(data) {
            *stored &= byte;
        }
        Ok(())
    }

    fn erase(&mut self, page: &Page, offset: u32, len: u32) -> Result<(), FlashError> {
        let range = self.range(offset, len as usize)?;
        self.erases += 1;
        self.erased_pages.push(page.index);
        self.mem[range].fill(0xFF);
        Ok(())
    }
}

pub fn layout() -> PageLayout<'static> {
    PageLayout::Regular {
        start: 0,
        size: PAGE_SIZE,
        count: PAGE_COUNT,
    }
}

pub fn leak_buffer(len: usize) -> &'static mut [u8] {
    Box::leak(vec![0u8; len].into_boxed_slice())
}

/// Page engine over a fresh, fully erased RAM flash.
pub fn make_pages(scratch_len: usize) -> FlashPages<'static, RamFlash> {
    FlashPages::new(
        RamFlash::new((PAGE_SIZE * PAGE_COUNT) as usize),
        layout(),
        leak_buffer(scratch_len),
        FLASH_BASE,
    )
}

// =============================================================================
// Recording transport
// =============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub msg_type: MsgType,
    pub id: u8,
    pub payload: Vec<u8>,
}

/// Transport keeping every message until drained.
#[derive(Default)]
pub struct Outbox {
    pub messages: Vec<Message>,
    pub fail: bool,
}

impl Outbox {
    pub fn drain(&mut self) -> Vec<Message> {
        std::mem::take(&mut self.messages)
    }

    pub fn count(&self, msg_type: MsgType) -> usize {
        self.messages.iter().filter(|m| m.msg_type == msg_type).count()
    }
}

impl Transport for Outbox {
    fn send(&mut self, msg_type: MsgType, id: u8, header: &[u8], data: &[u8]) -> Result<(), SendError> {
        if self.fail {
            return Err(SendError::Bus);
        }
        let mut payload = header.to_vec();
        payload.extend_from_slice(data);
        self.messages.push(Message { msg_type, id, payload });
        Ok(())
    }
}

// =============================================================================
// Platform
// =============================================================================

#[derive(Default)]
pub struct FakePlatform {
    pub jumps: u32,
}

impl Platform for FakePlatform {
    fn jump_to_app(&mut self) {
        self.jumps += 1;
    }
}

// =============================================================================
// Signed image builder
// =============================================================================

pub fn signing_key() -> SigningKey {
    SigningKey::from_slice(&[0x42; 32]).unwrap()
}

pub fn public_key() -> PublicKey {
    let point = signing_key().verifying_key().to_encoded_point(false);
    let mut key = [0u8; 64];
    key.copy_from_slice(&point.as_bytes()[1..]);
    key
}

pub fn sign_header(header: &mut FirmwareHeader) {
    let signature: Signature = signing_key().sign_prehash(&header_digest(header)).unwrap();
    header.signature.copy_from_slice(&signature.to_bytes());
}

pub fn make_binary(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed) ^ (i >> 8) as u8)
        .collect()
}

pub fn make_header(binary: &[u8], version: u32) -> FirmwareHeader {
    let info = FirmwareInfo::new(
        binary.len() as u32,
        FIRMWARE_CRC.checksum(binary),
        version,
        0,
        b"test image",
    );
    let mut header = FirmwareHeader::unsigned(Sha256::digest(binary).into(), info);
    sign_header(&mut header);
    header
}

/// Transport image: signed header then the binary enciphered per chunk.
pub fn make_image(binary: &[u8], version: u32) -> Vec<u8> {
    image_from_header(&make_header(binary, version), binary)
}

pub fn image_from_header(header: &FirmwareHeader, binary: &[u8]) -> Vec<u8> {
    use zerocopy::IntoBytes;
    let mut encrypted = binary.to_vec();
    encrypt_image(&CIPHER, CHUNK_SIZE, &mut encrypted);
    let mut image = Vec::with_capacity(HEADER_SIZE + binary.len());
    image.extend_from_slice(header.as_bytes());
    image.extend_from_slice(&encrypted);
    image
}

// =============================================================================
// Bootloader rig
// =============================================================================

pub type BusTransport = CanTransport<FrameQueue<32>>;
pub type TestBootloader = Bootloader<'static, PagedMemory<'static, RamFlash>, BusTransport, FakePlatform>;

/// 16 KiB device: one info page and 31 image pages per slot.
pub fn sections() -> Sections {
    Sections {
        app_info: Section {
            address: FLASH_BASE,
            size: PAGE_SIZE,
        },
        app: Section {
            address: FLASH_BASE + 0x100,
            size: 0x1F00,
        },
        upgrade_info: Section {
            address: FLASH_BASE + 0x2000,
            size: PAGE_SIZE,
        },
        upgrade: Section {
            address: FLASH_BASE + 0x2100,
            size: 0x1F00,
        },
    }
}

pub fn boot_config() -> BootloaderConfig<'static> {
    let mut config = BootloaderConfig::new(public_key(), &VERIFIER, &CIPHER);
    config.device_id = DEVICE_ID;
    config.magic = MAGIC;
    config
}

pub fn make_bootloader_with(memory: PagedMemory<'static, RamFlash>, config: BootloaderConfig<'static>) -> TestBootloader {
    Bootloader::new(
        config,
        sections(),
        memory,
        CanTransport::new(FrameQueue::new()),
        FakePlatform::default(),
        leak_buffer(CHUNK_SIZE),
        leak_buffer(BURST_SIZE),
    )
    .unwrap()
}

pub fn make_bootloader() -> TestBootloader {
    make_bootloader_with(PagedMemory::new(make_pages(PAGE_SIZE as usize)), boot_config())
}

pub fn flash(boot: &TestBootloader) -> &RamFlash {
    boot.memory().pages().driver()
}

pub fn flash_mut(boot: &mut TestBootloader) -> &mut RamFlash {
    boot.memory_mut().pages_mut().driver_mut()
}

/// Bytes of flash at an absolute address.
pub fn flash_bytes(boot: &TestBootloader, address: u32, len: usize) -> Vec<u8> {
    let start = (address - FLASH_BASE) as usize;
    flash(boot).mem[start..start + len].to_vec()
}

/// Tick the bootloader alone for `ms` milliseconds.
pub fn run_for(boot: &mut TestBootloader, now: &mut u32, ms: u32) {
    for _ in 0..ms {
        boot.tick(*now);
        boot.transport_mut().bus_mut().clear();
        *now += 1;
    }
}

/// Frames from the host side, decoded for the sender.
fn deliver_to_sender(frames: &mut FrameQueue<32>, sender: &mut Sender<'_>, now: u32) {
    while let Some(frame) = frames.pop() {
        if let Some(Inbound::Protocol { msg_type, id, payload }) = decode_frame(&frame, DEVICE_ID) {
            sender.process_message(now, msg_type, id, payload);
        }
    }
}

/// Push `image` through the CAN framing into the bootloader. Every frame
/// from the sender goes through `tamper` first, which may change or drop
/// it. Returns the sender's outcome, `None` if the time ran out.
pub fn transfer_with(
    boot: &mut TestBootloader,
    now: &mut u32,
    image: &[u8],
    max_ms: u32,
    mut tamper: impl FnMut(CanFrame) -> Option<CanFrame>,
) -> Option<u8> {
    let mut sender = Sender::new(
        SenderConfig::default(),
        DEVICE_ID,
        BURST_CRC_POLY,
        image,
        BURST_SIZE as u16,
        PACKET_SIZE,
    )
    .unwrap();
    let mut host = CanTransport::new(FrameQueue::<32>::new());
    sender.start(*now).unwrap();

    let deadline = *now + max_ms;
    while *now < deadline {
        boot.tick(*now);
        deliver_to_sender(boot.transport_mut().bus_mut(), &mut sender, *now);
        sender.tick(*now, &mut host);
        while let Some(frame) = host.bus_mut().pop() {
            if let Some(frame) = tamper(frame) {
                dispatch(boot, *now, &frame);
            }
        }
        *now += 1;
        if !sender.is_running() {
            if let Some(outcome) = sender.outcome() {
                return Some(outcome);
            }
        }
    }
    None
}

pub fn transfer(boot: &mut TestBootloader, now: &mut u32, image: &[u8]) -> Option<u8> {
    transfer_with(boot, now, image, 60_000, Some)
}
