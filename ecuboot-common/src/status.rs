// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Packed status byte broadcast by the bootloader.
//!
//! ```text
//!  7   6   5   4   3   2   1   0
//! [ app ] [upgr ] [    state     ]
//! ```

use crate::boot_fsm::SlotStatus;

const STATE_MASK: u8 = 0x0F;
const UPGRADE_SHIFT: u8 = 4;
const APP_SHIFT: u8 = 6;
const SLOT_MASK: u8 = 0x03;

/// Bootloader state plus the status of both slots.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AppStatus {
    /// Numeric bootloader state, 4 bits.
    pub state: u8,
    pub upgrade: SlotStatus,
    pub app: SlotStatus,
}

impl AppStatus {
    pub fn pack(&self) -> u8 {
        (self.state & STATE_MASK)
            | ((self.upgrade as u8 & SLOT_MASK) << UPGRADE_SHIFT)
            | ((self.app as u8 & SLOT_MASK) << APP_SHIFT)
    }

    pub fn unpack(byte: u8) -> Self {
        Self {
            state: byte & STATE_MASK,
            upgrade: SlotStatus::from_bits(byte >> UPGRADE_SHIFT),
            app: SlotStatus::from_bits(byte >> APP_SHIFT),
        }
    }
}
