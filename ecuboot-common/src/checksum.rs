// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! CRC helpers.
//!
//! All CRCs here are MSB-first, non-reflected and without output XOR, so a
//! running value can be fed back in as the seed of the next call. The
//! `crc` crate algorithms below describe the same functions for the fixed
//! polynomials used on flash and on the wire.

use crc::{Algorithm, Crc};

/// Polynomial protecting firmware images, installed records and flash writes.
pub const FIRMWARE_CRC_POLY: u32 = 0xDEAD_BEEF;
/// Polynomial protecting transfer bursts.
pub const BURST_CRC_POLY: u16 = 0xDEAD;
/// Polynomial of the short frame-header checksum.
pub const HEADER_CRC_POLY: u8 = 0xA1;

pub const CRC_32_FIRMWARE: Algorithm<u32> = Algorithm {
    width: 32,
    poly: FIRMWARE_CRC_POLY,
    init: 0,
    refin: false,
    refout: false,
    xorout: 0,
    check: 0xF989_5947,
    residue: 0,
};

pub const CRC_16_BURST: Algorithm<u16> = Algorithm {
    width: 16,
    poly: BURST_CRC_POLY,
    init: 0,
    refin: false,
    refout: false,
    xorout: 0,
    check: 0xE15D,
    residue: 0,
};

pub const CRC_8_HEADER: Algorithm<u8> = Algorithm {
    width: 8,
    poly: HEADER_CRC_POLY,
    init: 0,
    refin: false,
    refout: false,
    xorout: 0,
    check: 0x91,
    residue: 0,
};

pub const FIRMWARE_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_FIRMWARE);
pub const BURST_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_BURST);
pub const HEADER_CRC: Crc<u8> = Crc::<u8>::new(&CRC_8_HEADER);

/// Bitwise CRC-32 of `data` with polynomial `poly`, continuing from `crc`.
pub fn crc32(data: &[u8], poly: u32, mut crc: u32) -> u32 {
    for &byte in data {
        crc ^= (byte as u32) << 24;
        for _ in 0..8 {
            crc = if crc & 0x8000_0000 != 0 {
                (crc << 1) ^ poly
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// Bitwise CRC-16 of `data` with polynomial `poly`, continuing from `crc`.
pub fn crc16(data: &[u8], poly: u16, mut crc: u16) -> u16 {
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ poly
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// Bitwise CRC-8 of `data` with polynomial `poly`, continuing from `crc`.
pub fn crc8(data: &[u8], poly: u8, mut crc: u8) -> u8 {
    for &byte in data {
        crc ^= byte;
        for _ in 0..8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ poly
            } else {
                crc << 1
            };
        }
    }
    crc
}
