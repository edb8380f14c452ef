// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! On-flash and on-wire image layouts.
//!
//! A transport image is a [`FirmwareHeader`] followed by the (encrypted)
//! binary. Once an image is verified, an [`InstalledRecord`] describing it
//! is written to the slot's info section.

use core::mem::size_of;

use zerocopy::byteorder::{LittleEndian, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::checksum::FIRMWARE_CRC;

pub const HASH_LEN: usize = 32;
pub const SIGNATURE_LEN: usize = 64;
pub const PUBLIC_KEY_LEN: usize = 64;
pub const INFO_TEXT_LEN: usize = 19;

/// Raw P-256 public key, x then y, big-endian coordinates.
pub type PublicKey = [u8; PUBLIC_KEY_LEN];

/// Description of a firmware binary.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct FirmwareInfo {
    pub size: U32<LittleEndian>,
    pub crc: U32<LittleEndian>,
    pub version: U32<LittleEndian>,
    pub flags: u8,
    pub info: [u8; INFO_TEXT_LEN],
}

impl FirmwareInfo {
    /// Build an info block; `text` is truncated to the info field.
    pub fn new(size: u32, crc: u32, version: u32, flags: u8, text: &[u8]) -> Self {
        let mut info = [0u8; INFO_TEXT_LEN];
        let n = text.len().min(INFO_TEXT_LEN);
        info[..n].copy_from_slice(&text[..n]);
        Self {
            size: U32::new(size),
            crc: U32::new(crc),
            version: U32::new(version),
            flags,
            info,
        }
    }

    pub fn size(&self) -> u32 {
        self.size.get()
    }

    pub fn crc(&self) -> u32 {
        self.crc.get()
    }

    pub fn version(&self) -> u32 {
        self.version.get()
    }
}

/// Signed header preceding the binary in a transport image.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct FirmwareHeader {
    /// SHA-256 of the plaintext binary.
    pub hash: [u8; HASH_LEN],
    pub info: FirmwareInfo,
    /// ECDSA P-256 signature over the SHA-256 of [`FirmwareHeader::signed_bytes`].
    pub signature: [u8; SIGNATURE_LEN],
}

pub const INFO_SIZE: usize = size_of::<FirmwareInfo>();
pub const HEADER_SIZE: usize = size_of::<FirmwareHeader>();
pub const SIGNED_LEN: usize = HEADER_SIZE - SIGNATURE_LEN;

const _: () = assert!(INFO_SIZE == 32);
const _: () = assert!(HEADER_SIZE == 128);

impl FirmwareHeader {
    /// Header with an empty signature, ready to be signed.
    pub fn unsigned(hash: [u8; HASH_LEN], info: FirmwareInfo) -> Self {
        Self {
            hash,
            info,
            signature: [0; SIGNATURE_LEN],
        }
    }

    /// Decode a header from the first [`HEADER_SIZE`] bytes of `bytes`.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        Self::read_from_prefix(bytes).ok().map(|(header, _)| header)
    }

    /// Bytes covered by the signature.
    pub fn signed_bytes(&self) -> &[u8] {
        &self.as_bytes()[..SIGNED_LEN]
    }
}

/// Installed-firmware record stored in an info section.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct InstalledRecord {
    pub magic: U32<LittleEndian>,
    pub info: FirmwareInfo,
    /// Firmware CRC over `magic` and `info`.
    pub crc: U32<LittleEndian>,
}

pub const RECORD_SIZE: usize = size_of::<InstalledRecord>();

const _: () = assert!(RECORD_SIZE == 40);

impl InstalledRecord {
    pub fn new(magic: u32, info: FirmwareInfo) -> Self {
        let mut record = Self {
            magic: U32::new(magic),
            info,
            crc: U32::new(0),
        };
        record.crc = U32::new(record.computed_crc());
        record
    }

    /// Content of an info section after it has been invalidated.
    pub fn erased() -> Self {
        Self {
            magic: U32::new(u32::MAX),
            info: FirmwareInfo {
                size: U32::new(u32::MAX),
                crc: U32::new(u32::MAX),
                version: U32::new(u32::MAX),
                flags: 0xFF,
                info: [0xFF; INFO_TEXT_LEN],
            },
            crc: U32::new(u32::MAX),
        }
    }

    pub fn parse(bytes: &[u8]) -> Option<Self> {
        Self::read_from_prefix(bytes).ok().map(|(record, _)| record)
    }

    pub fn computed_crc(&self) -> u32 {
        FIRMWARE_CRC.checksum(&self.as_bytes()[..RECORD_SIZE - size_of::<u32>()])
    }

    /// A record counts only when both the magic and its own CRC match.
    pub fn is_valid(&self, magic: u32) -> bool {
        self.magic.get() == magic && self.crc.get() == self.computed_crc()
    }
}
