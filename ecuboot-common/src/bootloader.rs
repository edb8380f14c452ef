// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Bootloader orchestrator.
//!
//! On every pass through `Init` the bootloader reads the installed records
//! of the app and upgrade slots and checksums the images they describe. It
//! installs a verified upgrade over the app, then waits for a new image on
//! the transfer receiver. It jumps to a verified app when asked or once the
//! jump delay expires.
//!
//! Received images are a signed [`FirmwareHeader`] followed by the binary,
//! enciphered per staging chunk. The binary is deciphered into the upgrade
//! slot as it arrives. It is committed by writing its record to the
//! upgrade-info section only after the whole slot has been checked against
//! the header.

use thiserror::Error;
use zerocopy::IntoBytes;

use crate::boot_fsm::{classify_image, fits_section, select_action, SlotAction, SlotState, SlotStatus, Slots};
use crate::checksum::BURST_CRC_POLY;
use crate::cipher::ChunkCipher;
use crate::image::{FirmwareHeader, InstalledRecord, PublicKey, HEADER_SIZE, RECORD_SIZE};
use crate::memory::Memory;
use crate::protocol::{MsgType, TransferStatus, Transport};
use crate::receiver::{FinishOutcome, Receiver, ReceiverConfig, TransferSink, WriteOutcome};
use crate::staging::{ChunkStage, StageState};
use crate::status::AppStatus;
use crate::verify::{verify_header, FirmwareVerifier, Progress, SignatureVerifier};

/// Version reported in the status broadcast.
pub const BOOTLOADER_VERSION: u8 = 0x03;
pub const DEFAULT_MAGIC: u32 = 0xEC0B_007A;
pub const DEFAULT_DEVICE_ID: u8 = 4;

/// Bootloader state, numbered as reported in the status byte.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BootState {
    Init = 0,
    WaitAppVerification = 1,
    CopyUpgrade = 2,
    StartDataComm = 3,
    Idle = 4,
    GoToApp = 5,
}

/// Failures reported to the sender in the finish report.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BootError {
    #[error("firmware header verification failed")]
    HeaderVerification,
    #[error("firmware CRC mismatch")]
    CrcMismatch,
    #[error("firmware hash verification failed")]
    Verification,
    #[error("flash read failed")]
    Read,
    #[error("flash write failed")]
    Write,
    #[error("image larger than the upgrade section")]
    ImageTooLarge,
    #[error("unknown error")]
    Unknown,
}

impl BootError {
    pub fn code(self) -> u8 {
        match self {
            BootError::HeaderVerification => 0x81,
            BootError::CrcMismatch => 0x82,
            BootError::Verification => 0x83,
            BootError::Read => 0x84,
            BootError::Write => 0x85,
            BootError::ImageTooLarge => 0x86,
            BootError::Unknown => 0xFF,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConfigError {
    #[error("app and upgrade sections must not be empty")]
    EmptySlot,
    #[error("upgrade section larger than the app section")]
    UpgradeLargerThanApp,
    #[error("upgrade-info section larger than the app-info section")]
    UpgradeInfoLargerThanAppInfo,
    #[error("info section cannot hold an installed record")]
    InfoSectionTooSmall,
    #[error("staging and burst buffers must not be empty")]
    EmptyBuffer,
    #[error("staging buffer is not a multiple of the padding alignment")]
    InvalidAlignment,
}

impl ConfigError {
    pub fn code(self) -> u8 {
        match self {
            ConfigError::EmptySlot => 1,
            ConfigError::UpgradeLargerThanApp => 2,
            ConfigError::UpgradeInfoLargerThanAppInfo => 3,
            ConfigError::InfoSectionTooSmall => 4,
            ConfigError::EmptyBuffer => 5,
            ConfigError::InvalidAlignment => 6,
        }
    }
}

/// Contiguous flash range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Section {
    pub address: u32,
    pub size: u32,
}

/// Address map of the two firmware slots and their info sections.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Sections {
    pub app_info: Section,
    pub app: Section,
    pub upgrade_info: Section,
    pub upgrade: Section,
}

impl Sections {
    /// 1 MiB STM32H5 part: bootloader in the first 8 KiB sector, then two
    /// 448 KiB slots each preceded by one info sector.
    pub const STM32H5: Sections = Sections {
        app_info: Section { address: 0x0800_2000, size: 0x2000 },
        app: Section { address: 0x0800_4000, size: 0x0007_0000 },
        upgrade_info: Section { address: 0x0807_4000, size: 0x2000 },
        upgrade: Section { address: 0x0807_6000, size: 0x0007_0000 },
    };

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.app.size == 0 || self.upgrade.size == 0 {
            return Err(ConfigError::EmptySlot);
        }
        if self.upgrade.size > self.app.size {
            return Err(ConfigError::UpgradeLargerThanApp);
        }
        if self.upgrade_info.size > self.app_info.size {
            return Err(ConfigError::UpgradeInfoLargerThanAppInfo);
        }
        if (self.upgrade_info.size as usize) < RECORD_SIZE {
            return Err(ConfigError::InfoSectionTooSmall);
        }
        Ok(())
    }
}

pub struct BootloaderConfig<'a> {
    /// Id expected from the sender and used on every reply.
    pub device_id: u8,
    pub public_key: PublicKey,
    pub verifier: &'a dyn SignatureVerifier,
    pub cipher: &'a dyn ChunkCipher,
    /// Fill byte of the staging buffer and of the final chunk padding.
    pub padding_byte: u8,
    /// Flash write granularity the final chunk is padded to.
    pub padding_alignment: u32,
    pub max_copy_retries: u32,
    /// Delay before a verified app is started; 0 waits for an explicit start.
    pub jump_delay: u32,
    pub magic: u32,
    pub burst_crc_poly: u16,
    pub receiver: ReceiverConfig,
}

impl<'a> BootloaderConfig<'a> {
    pub fn new(public_key: PublicKey, verifier: &'a dyn SignatureVerifier, cipher: &'a dyn ChunkCipher) -> Self {
        Self {
            device_id: DEFAULT_DEVICE_ID,
            public_key,
            verifier,
            cipher,
            padding_byte: 0xFF,
            padding_alignment: 16,
            max_copy_retries: 3,
            jump_delay: 200,
            magic: DEFAULT_MAGIC,
            burst_crc_poly: BURST_CRC_POLY,
            receiver: ReceiverConfig::default(),
        }
    }
}

/// Hand-off to the application.
pub trait Platform {
    /// Does not return on target.
    fn jump_to_app(&mut self);
}

/// Progress of the image being received.
struct Download<'a> {
    header_bytes: [u8; HEADER_SIZE],
    header_len: usize,
    header: Option<FirmwareHeader>,
    stage: ChunkStage<'a>,
    /// Image bytes accepted so far, header included.
    received: u32,
    /// Binary bytes written to the upgrade slot.
    fw_index: u32,
    info_cleared: bool,
    /// Set once a received image has been authenticated and recorded.
    committed: bool,
}

impl Download<'_> {
    fn restart(&mut self) {
        self.header_bytes = [0; HEADER_SIZE];
        self.header_len = 0;
        self.header = None;
        self.stage.reset();
        self.received = 0;
        self.fw_index = 0;
    }
}

pub struct Bootloader<'a, M, T, P> {
    config: BootloaderConfig<'a>,
    sections: Sections,
    memory: M,
    transport: T,
    platform: P,
    receiver: Receiver<'a>,
    download: Download<'a>,
    state: BootState,
    slots: Slots,
    copy_retries: u32,
    stay: bool,
    start_app: bool,
    start_time: u32,
    receiving: bool,
}

impl<'a, M: Memory, T: Transport, P: Platform> Bootloader<'a, M, T, P> {
    /// `chunk_buffer` is the decipher staging buffer and fixes the cipher
    /// chunk size. Its length must be a multiple of the padding alignment
    /// so every chunk lands at an aligned offset. `burst_buffer` bounds the
    /// burst size.
    pub fn new(
        config: BootloaderConfig<'a>,
        sections: Sections,
        memory: M,
        transport: T,
        platform: P,
        chunk_buffer: &'a mut [u8],
        burst_buffer: &'a mut [u8],
    ) -> Result<Self, ConfigError> {
        sections.validate()?;
        if chunk_buffer.is_empty() || burst_buffer.is_empty() {
            return Err(ConfigError::EmptyBuffer);
        }
        let align = config.padding_alignment as usize;
        if align != 0 && chunk_buffer.len() % align != 0 {
            return Err(ConfigError::InvalidAlignment);
        }

        let receiver = Receiver::new(config.receiver, config.device_id, config.burst_crc_poly, burst_buffer);
        let download = Download {
            header_bytes: [0; HEADER_SIZE],
            header_len: 0,
            header: None,
            stage: ChunkStage::new(chunk_buffer, config.padding_byte),
            received: 0,
            fw_index: 0,
            info_cleared: false,
            committed: false,
        };
        Ok(Self {
            config,
            sections,
            memory,
            transport,
            platform,
            receiver,
            download,
            state: BootState::Init,
            slots: Slots::default(),
            copy_retries: 0,
            stay: false,
            start_app: false,
            start_time: 0,
            receiving: false,
        })
    }

    pub fn state(&self) -> BootState {
        self.state
    }

    pub fn device_id(&self) -> u8 {
        self.config.device_id
    }

    pub fn slots(&self) -> &Slots {
        &self.slots
    }

    pub fn sections(&self) -> &Sections {
        &self.sections
    }

    pub fn receiver(&self) -> &Receiver<'a> {
        &self.receiver
    }

    pub fn memory(&self) -> &M {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut M {
        &mut self.memory
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    /// Keep the bootloader running instead of starting the app on timeout.
    pub fn stay_in_bootloader(&mut self, stay: bool) {
        self.stay = stay;
    }

    /// Start a verified app at the next tick.
    pub fn start_application(&mut self, start: bool) {
        self.start_app = start;
    }

    pub fn app_status(&self) -> u8 {
        AppStatus {
            state: self.state as u8,
            upgrade: self.slots.upgrade.status,
            app: self.slots.app.status,
        }
        .pack()
    }

    /// Version from the app record, 0 without a valid one.
    pub fn installed_version(&self) -> u32 {
        let record = &self.slots.app.record;
        if record.is_valid(self.config.magic) {
            record.info.version()
        } else {
            0
        }
    }

    pub fn is_receiving(&self) -> bool {
        self.receiving
    }

    /// Inbound protocol message. Returns whether the receiver consumed it.
    pub fn message_received(&mut self, now: u32, msg_type: MsgType, id: u8, payload: &[u8]) -> bool {
        self.receiver.process_message(now, msg_type, id, payload)
    }

    fn set_state(&mut self, state: BootState) {
        info!("boot: {:?} -> {:?}", self.state, state);
        self.state = state;
    }

    pub fn tick(&mut self, now: u32) {
        match self.state {
            BootState::Init => {
                self.download.info_cleared = false;
                self.receiving = false;
                self.slots.app = self.read_slot(self.sections.app_info);
                self.slots.upgrade = self.read_slot(self.sections.upgrade_info);
                if self.slots.any_found() {
                    self.set_state(BootState::WaitAppVerification);
                } else {
                    self.set_state(BootState::StartDataComm);
                }
            }
            BootState::WaitAppVerification => {
                self.slots.app.status = self.verify_slot(self.slots.app, self.sections.app);
                self.slots.upgrade.status = self.verify_slot(self.slots.upgrade, self.sections.upgrade);
                info!(
                    "boot: app {:?}, upgrade {:?}",
                    self.slots.app.status, self.slots.upgrade.status
                );
                match select_action(&self.slots, self.copy_retries, self.config.max_copy_retries) {
                    SlotAction::CopyUpgrade => {
                        self.copy_retries += 1;
                        self.set_state(BootState::CopyUpgrade);
                    }
                    SlotAction::AbandonUpgrade => {
                        warn!("boot: upgrade not installed after {} copies", self.copy_retries);
                        self.slots.upgrade.status = SlotStatus::Corrupted;
                        self.set_state(BootState::StartDataComm);
                    }
                    SlotAction::StartDataComm => self.set_state(BootState::StartDataComm),
                }
            }
            BootState::CopyUpgrade => {
                let record = self.slots.upgrade.record;
                self.slots.invalidate();
                if let Err(e) = self.install_upgrade(&record) {
                    error!("boot: upgrade copy failed: {:?}", e);
                }
                self.set_state(BootState::Init);
            }
            BootState::StartDataComm => {
                self.download.restart();
                if self.receiver.start(now).is_err() {
                    warn!("boot: receiver already running");
                }
                self.start_time = now;
                self.set_state(BootState::Idle);
            }
            BootState::Idle => self.idle(now),
            BootState::GoToApp => self.platform.jump_to_app(),
        }
    }

    /// Serve the transfer and start a verified app once the jump delay
    /// has passed. The delay does not expire while an image is being
    /// received, so an update started over a running app is never cut off
    /// by the jump; an explicit start request still jumps at once.
    fn idle(&mut self, now: u32) {
        if self.slots.app.is_verified() {
            let timeout = !self.stay
                && !self.receiving
                && self.config.jump_delay > 0
                && now.wrapping_sub(self.start_time) >= self.config.jump_delay;
            if self.start_app || timeout {
                self.set_state(BootState::GoToApp);
                return;
            }
        }

        let mut installer = Installer {
            config: &self.config,
            sections: &self.sections,
            memory: &mut self.memory,
            download: &mut self.download,
            slots: &mut self.slots,
        };
        self.receiver.tick(now, &mut self.transport, &mut installer);
        if self.download.committed {
            // A fresh upgrade gets the full copy budget again
            self.download.committed = false;
            self.copy_retries = 0;
        }
        if !self.receiver.is_running() {
            self.set_state(BootState::Init);
        }
        self.receiving = self.receiver.is_receiving();
    }

    fn read_slot(&mut self, info: Section) -> SlotState {
        let mut buf = [0u8; RECORD_SIZE];
        let record = match self.memory.read(info.address, &mut buf) {
            Ok(()) => InstalledRecord::parse(&buf).unwrap_or_else(InstalledRecord::erased),
            Err(e) => {
                error!("boot: record read at 0x{:x} failed: {:?}", info.address, e);
                InstalledRecord::erased()
            }
        };
        SlotState::from_record(record, self.config.magic)
    }

    fn verify_slot(&mut self, slot: SlotState, section: Section) -> SlotStatus {
        if slot.status != SlotStatus::Found {
            return slot.status;
        }
        if !fits_section(&slot.record, section.size) {
            warn!(
                "boot: declared size {} exceeds section at 0x{:x}",
                slot.record.info.size(),
                section.address
            );
            return SlotStatus::Corrupted;
        }
        classify_image(&slot.record, self.memory.crc32(section.address, slot.record.info.size()))
    }

    fn install_upgrade(&mut self, record: &InstalledRecord) -> Result<(), crate::flash::FlashError> {
        info!("boot: copying {} bytes to the app slot", record.info.size());
        self.memory
            .copy(self.sections.upgrade.address, self.sections.app.address, record.info.size())?;
        self.memory.write(self.sections.app_info.address, record.as_bytes())
    }
}

/// Receiver sink writing the image into the upgrade slot.
struct Installer<'s, 'a, M> {
    config: &'s BootloaderConfig<'a>,
    sections: &'s Sections,
    memory: &'s mut M,
    download: &'s mut Download<'a>,
    slots: &'s mut Slots,
}

impl<M: Memory> Installer<'_, '_, M> {
    /// Collect header bytes from the front of `data` and return the rest.
    /// Once the header is complete it is authenticated and size-checked.
    fn take_header<'d>(&mut self, data: &'d [u8]) -> Result<&'d [u8], WriteOutcome> {
        let download = &mut *self.download;
        if download.header.is_some() {
            return Ok(data);
        }
        let n = (HEADER_SIZE - download.header_len).min(data.len());
        download.header_bytes[download.header_len..download.header_len + n].copy_from_slice(&data[..n]);
        download.header_len += n;
        if download.header_len < HEADER_SIZE {
            return Ok(&data[n..]);
        }

        let header = FirmwareHeader::parse(&download.header_bytes).ok_or(WriteOutcome::Abort(BootError::Unknown.code()))?;
        if verify_header(&header, &self.config.public_key, self.config.verifier).is_err() {
            warn!("boot: image header rejected");
            return Err(WriteOutcome::RestartFromBeginning);
        }
        if header.info.size() > self.sections.upgrade.size {
            warn!(
                "boot: image of {} bytes exceeds upgrade section of {}",
                header.info.size(),
                self.sections.upgrade.size
            );
            return Err(WriteOutcome::Abort(BootError::ImageTooLarge.code()));
        }
        info!(
            "boot: receiving version {} ({} bytes)",
            header.info.version(),
            header.info.size()
        );
        download.header = Some(header);
        Ok(&data[n..])
    }

    /// Invalidate the upgrade record before the slot is first overwritten.
    fn clear_upgrade_info(&mut self) -> Result<(), WriteOutcome> {
        if self.download.info_cleared {
            return Ok(());
        }
        self.slots.invalidate();
        if let Err(e) = self
            .memory
            .write(self.sections.upgrade_info.address, InstalledRecord::erased().as_bytes())
        {
            error!("boot: upgrade-info invalidation failed: {:?}", e);
            return Err(WriteOutcome::RestartFromBeginning);
        }
        self.download.info_cleared = true;
        Ok(())
    }

    /// Decipher the staged chunk and write it to the upgrade slot. A final
    /// chunk is padded to the write alignment.
    fn flush(&mut self, last: bool) -> Result<(), WriteOutcome> {
        self.clear_upgrade_info()?;
        let download = &mut *self.download;
        let address = self.sections.upgrade.address + download.fw_index;

        let chunk = download.stage.chunk_mut();
        let len = chunk.len() as u32;
        self.config.cipher.decrypt(chunk);
        let block: &[u8] = if last {
            download.stage.seal(self.config.padding_alignment as usize)
        } else {
            download.stage.chunk_mut()
        };
        if let Err(e) = self.memory.write(address, block) {
            error!("boot: write at 0x{:x} failed: {:?}", address, e);
            return Err(WriteOutcome::RestartFromBeginning);
        }
        download.fw_index += len;
        download.stage.reset();
        Ok(())
    }

    fn write_image(&mut self, offset: u32, data: &[u8], last: bool) -> Result<(), WriteOutcome> {
        if offset == 0 {
            self.download.restart();
        } else if offset != self.download.received {
            warn!(
                "boot: write at {} while expecting {}",
                offset, self.download.received
            );
            return Err(WriteOutcome::RestartFromBeginning);
        }
        self.download.received += data.len() as u32;

        let mut data = self.take_header(data)?;
        if self.download.header.is_none() {
            return if last {
                warn!("boot: image ended inside its header");
                Err(WriteOutcome::Abort(BootError::HeaderVerification.code()))
            } else {
                Ok(())
            };
        }

        let written = self.download.fw_index as u64 + self.download.stage.len() as u64 + data.len() as u64;
        if written > self.sections.upgrade.size as u64 {
            warn!("boot: image runs past the upgrade section");
            return Err(WriteOutcome::Abort(BootError::ImageTooLarge.code()));
        }

        while !data.is_empty() {
            let n = self.download.stage.push(data);
            data = &data[n..];
            if self.download.stage.state() == StageState::Full {
                self.flush(false)?;
            }
        }
        if last && !self.download.stage.is_empty() {
            self.flush(true)?;
        }
        Ok(())
    }

    /// Authenticate the slot content against the header and commit its record.
    fn commit(&mut self) -> Result<(), FinishOutcome> {
        let header = self
            .download
            .header
            .ok_or(FinishOutcome::Abort(BootError::HeaderVerification.code()))?;
        let mut verifier = FirmwareVerifier::new(&header, &self.config.public_key, self.config.verifier)
            .map_err(|_| FinishOutcome::Abort(BootError::HeaderVerification.code()))?;

        let address = self.sections.upgrade.address;
        let size = header.info.size();
        match self.memory.crc32(address, size) {
            Ok(crc) if crc == header.info.crc() => {}
            Ok(crc) => {
                warn!("boot: slot CRC 0x{:x}, header says 0x{:x}", crc, header.info.crc());
                return Err(FinishOutcome::Retry(BootError::CrcMismatch.code()));
            }
            Err(_) => return Err(FinishOutcome::Abort(BootError::Read.code())),
        }

        let scratch = self.download.stage.scratch();
        let mut offset = 0u32;
        loop {
            let n = (size - offset).min(scratch.len() as u32);
            let chunk = &mut scratch[..n as usize];
            if self.memory.read(address + offset, chunk).is_err() {
                return Err(FinishOutcome::Abort(BootError::Read.code()));
            }
            match verifier.update(chunk) {
                Ok(Progress::Complete) => break,
                Ok(Progress::Incomplete) => offset += n,
                Err(e) => {
                    warn!("boot: {:?}", e);
                    return Err(FinishOutcome::Retry(BootError::Verification.code()));
                }
            }
        }
        self.download.stage.reset();

        let record = InstalledRecord::new(self.config.magic, header.info);
        if let Err(e) = self.memory.write(self.sections.upgrade_info.address, record.as_bytes()) {
            error!("boot: record write failed: {:?}", e);
            return Err(FinishOutcome::Abort(BootError::Write.code()));
        }
        info!("boot: upgrade version {} committed", header.info.version());
        self.download.committed = true;
        Ok(())
    }
}

impl<M: Memory> TransferSink for Installer<'_, '_, M> {
    fn write(&mut self, offset: u32, data: &[u8], last: bool) -> WriteOutcome {
        match self.write_image(offset, data, last) {
            Ok(()) => WriteOutcome::Success,
            Err(outcome) => outcome,
        }
    }

    fn finish(&mut self, status: u8) -> FinishOutcome {
        if status != TransferStatus::Ok.code() {
            warn!("boot: transfer ended with 0x{:x}", status);
            return FinishOutcome::Abort(status);
        }
        match self.commit() {
            Ok(()) => FinishOutcome::Success,
            Err(outcome) => outcome,
        }
    }
}
