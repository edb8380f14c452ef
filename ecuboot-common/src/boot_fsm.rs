// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Slot classification and copy decision - pure logic without flash access.
//!
//! The bootloader reads the installed records and checksums the slots; the
//! functions here only turn those results into slot statuses and into the
//! next action, so they can be tested on their own.

use crate::flash::FlashError;
use crate::image::InstalledRecord;

/// Status of a firmware slot, as packed in the status byte.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SlotStatus {
    #[default]
    NotFound = 0,
    /// A valid record exists; the image has not been checked yet.
    Found = 1,
    Verified = 2,
    Corrupted = 3,
}

impl SlotStatus {
    /// Decode the two low bits.
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => SlotStatus::NotFound,
            1 => SlotStatus::Found,
            2 => SlotStatus::Verified,
            _ => SlotStatus::Corrupted,
        }
    }
}

/// Cached record of a slot and what is known about its image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotState {
    pub record: InstalledRecord,
    pub status: SlotStatus,
}

impl Default for SlotState {
    fn default() -> Self {
        Self {
            record: InstalledRecord::erased(),
            status: SlotStatus::NotFound,
        }
    }
}

impl SlotState {
    /// Record just read from an info section.
    pub fn from_record(record: InstalledRecord, magic: u32) -> Self {
        Self {
            record,
            status: classify_record(&record, magic),
        }
    }

    pub fn is_verified(&self) -> bool {
        self.status == SlotStatus::Verified
    }
}

/// The running application and the staged upgrade.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Slots {
    pub app: SlotState,
    pub upgrade: SlotState,
}

impl Slots {
    /// Forget both slots until the records are read again.
    pub fn invalidate(&mut self) {
        self.app.status = SlotStatus::NotFound;
        self.upgrade.status = SlotStatus::NotFound;
    }

    pub fn any_found(&self) -> bool {
        self.app.status == SlotStatus::Found || self.upgrade.status == SlotStatus::Found
    }
}

/// What the bootloader does once the slots are verified.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SlotAction {
    CopyUpgrade,
    /// The upgrade could not be installed within the retry budget.
    AbandonUpgrade,
    StartDataComm,
}

/// Decision rules in priority order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotRule {
    RetriesExhausted,
    InstallUpgrade,
    Receive,
}

pub const SLOT_RULES: [SlotRule; 3] = [SlotRule::RetriesExhausted, SlotRule::InstallUpgrade, SlotRule::Receive];

pub fn classify_record(record: &InstalledRecord, magic: u32) -> SlotStatus {
    if record.is_valid(magic) {
        SlotStatus::Found
    } else {
        SlotStatus::NotFound
    }
}

/// Whether the declared image fits in a section of `section_size` bytes.
pub fn fits_section(record: &InstalledRecord, section_size: u32) -> bool {
    record.info.size() <= section_size
}

/// Turn the checksum of a slot image into a status.
pub fn classify_image(record: &InstalledRecord, computed: Result<u32, FlashError>) -> SlotStatus {
    match computed {
        Ok(crc) if crc == record.info.crc() => SlotStatus::Verified,
        _ => SlotStatus::Corrupted,
    }
}

/// The upgrade is verified and the app is either unusable or different.
pub fn needs_copy(slots: &Slots) -> bool {
    slots.upgrade.is_verified() && (!slots.app.is_verified() || slots.app.record != slots.upgrade.record)
}

pub fn try_slot_rule(rule: SlotRule, slots: &Slots, copy_retries: u32, max_copy_retries: u32) -> Option<SlotAction> {
    match rule {
        SlotRule::RetriesExhausted if needs_copy(slots) && copy_retries >= max_copy_retries => {
            Some(SlotAction::AbandonUpgrade)
        }
        SlotRule::InstallUpgrade if needs_copy(slots) => Some(SlotAction::CopyUpgrade),
        SlotRule::Receive => Some(SlotAction::StartDataComm),
        _ => None,
    }
}

/// Pick the action following slot verification.
pub fn select_action(slots: &Slots, copy_retries: u32, max_copy_retries: u32) -> SlotAction {
    SLOT_RULES
        .iter()
        .find_map(|rule| try_slot_rule(*rule, slots, copy_retries, max_copy_retries))
        .unwrap_or(SlotAction::StartDataComm)
}
