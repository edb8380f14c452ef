// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Core of the ecuboot secure firmware-update bootloader.
//!
//! This crate supports both `no_std` (embedded) and `std` (host) environments:
//! - Default: `no_std`, with the `p256` signature verifier
//! - `std` feature: host tools and tests
//! - `defmt` feature: log through `defmt` instead of the `log` facade
//!
//! Hardware is reached only through traits ([`flash::FlashDriver`],
//! [`memory::Memory`], [`protocol::Transport`], [`bootloader::Platform`]),
//! so everything here also runs on the host.

#![cfg_attr(not(any(test, feature = "std")), no_std)]

// Must come first so the logging macros are visible to every module.
#[macro_use]
mod fmt;

pub mod boot_fsm;
pub mod bootloader;
pub mod checksum;
pub mod cipher;
pub mod flash;
pub mod frame;
pub mod image;
pub mod memory;
pub mod protocol;
pub mod receiver;
pub mod sender;
pub mod staging;
pub mod status;
pub mod verify;

// Re-export commonly used types
pub use bootloader::{BootError, BootState, Bootloader, BootloaderConfig, ConfigError, Platform, Section, Sections};
pub use cipher::{ChunkCipher, Xxtea};
pub use flash::{FlashDriver, FlashError, FlashPages, Page, PageLayout};
pub use image::{FirmwareHeader, FirmwareInfo, InstalledRecord, PublicKey, HEADER_SIZE};
pub use memory::{Memory, PagedMemory};
pub use protocol::{MsgType, SendError, TransferStatus, Transport};
pub use receiver::{FinishOutcome, Receiver, ReceiverConfig, TransferSink, WriteOutcome};
pub use sender::{Sender, SenderConfig};
pub use verify::{FirmwareVerifier, SignatureVerifier, VerifyError};

#[cfg(feature = "p256")]
pub use verify::P256Verifier;
