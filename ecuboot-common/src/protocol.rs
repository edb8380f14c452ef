// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Chunked-transfer protocol shared by the receiver and the host tools.
//!
//! Every payload is a fixed little-endian layout, small enough to travel
//! in one bus frame next to the device id byte.

use thiserror::Error;
use zerocopy::byteorder::{LittleEndian, U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

// --- Message types ---

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MsgType {
    PrepareRequest = 0,
    ReadyReport = 1,
    Info = 2,
    BurstRequest = 3,
    BurstCrc = 4,
    BurstPacket = 5,
    BurstCompletion = 6,
    Completion = 7,
    ErrorResponse = 8,
    FinishReport = 9,
}

impl TryFrom<u8> for MsgType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        Ok(match value {
            0 => MsgType::PrepareRequest,
            1 => MsgType::ReadyReport,
            2 => MsgType::Info,
            3 => MsgType::BurstRequest,
            4 => MsgType::BurstCrc,
            5 => MsgType::BurstPacket,
            6 => MsgType::BurstCompletion,
            7 => MsgType::Completion,
            8 => MsgType::ErrorResponse,
            9 => MsgType::FinishReport,
            other => return Err(other),
        })
    }
}

// --- Status codes ---

/// Status carried by ready and finish reports. Codes 0x80 and above are
/// reserved for the application behind the receiver.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransferStatus {
    Ok = 0x00,
    PrepareTimeout = 0x01,
    ReadyTimeout = 0x02,
    InfoTimeout = 0x03,
    FinishTimeout = 0x04,
    RequestTimeout = 0x05,
    MaxInfoRetries = 0x06,
    MaxBurstRetries = 0x07,
    MaxFullRetries = 0x08,
    UnexpectedCompletion = 0x09,
    CrcMismatch = 0x0A,
    PeerError = 0x0B,
    CommError = 0x0C,
    ReadError = 0x0D,
    BufferTooSmall = 0x0E,
    SequenceOutOfBounds = 0x0F,
    BurstSizeTooBig = 0x10,
    UnknownWriteResult = 0x11,
    Unknown = 0xFF,
}

impl TransferStatus {
    pub const fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        use TransferStatus::*;
        [
            Ok,
            PrepareTimeout,
            ReadyTimeout,
            InfoTimeout,
            FinishTimeout,
            RequestTimeout,
            MaxInfoRetries,
            MaxBurstRetries,
            MaxFullRetries,
            UnexpectedCompletion,
            CrcMismatch,
            PeerError,
            CommError,
            ReadError,
            BufferTooSmall,
            SequenceOutOfBounds,
            BurstSizeTooBig,
            UnknownWriteResult,
            Unknown,
        ]
        .into_iter()
        .find(|status| status.code() == code)
    }
}

/// Status byte of a ready report.
pub const READY_STATUS: u8 = 0xFF;

// --- Sequence numbers ---

/// Largest byte sequence a transfer can address.
pub const MAX_SEQUENCE: u32 = 0x00FF_FFFF;

/// 24-bit little-endian byte sequence.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct Seq24([u8; 3]);

impl Seq24 {
    /// Truncates to 24 bits.
    pub fn new(value: u32) -> Self {
        let [b0, b1, b2, _] = value.to_le_bytes();
        Self([b0, b1, b2])
    }

    pub fn get(self) -> u32 {
        u32::from_le_bytes([self.0[0], self.0[1], self.0[2], 0])
    }
}

// --- Payloads ---

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct InfoPayload {
    pub total_size: U32<LittleEndian>,
    pub buffer_size: U16<LittleEndian>,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct BurstRequestPayload {
    pub sequence: Seq24,
    pub size: U16<LittleEndian>,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct BurstCrcPayload {
    pub sequence: Seq24,
    pub crc: U16<LittleEndian>,
    pub size: U16<LittleEndian>,
}

/// Header in front of the data of a burst packet.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct PacketHeader {
    pub sequence: Seq24,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct BurstCompletionPayload {
    pub sequence: Seq24,
    pub size: U16<LittleEndian>,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct ErrorPayload {
    pub status: u8,
    pub detail: U32<LittleEndian>,
}

impl InfoPayload {
    pub fn new(total_size: u32, buffer_size: u16) -> Self {
        Self {
            total_size: U32::new(total_size),
            buffer_size: U16::new(buffer_size),
        }
    }
}

impl BurstRequestPayload {
    pub fn new(sequence: u32, size: u16) -> Self {
        Self {
            sequence: Seq24::new(sequence),
            size: U16::new(size),
        }
    }
}

impl BurstCrcPayload {
    pub fn new(sequence: u32, crc: u16, size: u16) -> Self {
        Self {
            sequence: Seq24::new(sequence),
            crc: U16::new(crc),
            size: U16::new(size),
        }
    }
}

impl PacketHeader {
    pub fn new(sequence: u32) -> Self {
        Self {
            sequence: Seq24::new(sequence),
        }
    }
}

impl BurstCompletionPayload {
    pub fn new(sequence: u32, size: u16) -> Self {
        Self {
            sequence: Seq24::new(sequence),
            size: U16::new(size),
        }
    }
}

impl ErrorPayload {
    pub fn new(status: TransferStatus, detail: u32) -> Self {
        Self {
            status: status.code(),
            detail: U32::new(detail),
        }
    }
}

/// Decode a fixed layout from the start of `payload`; trailing bytes are
/// left to the caller.
pub fn decode<T: FromBytes>(payload: &[u8]) -> Option<(T, &[u8])> {
    T::read_from_prefix(payload).ok()
}

// --- Transport ---

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SendError {
    #[error("message does not fit in one frame")]
    TooLarge,
    #[error("message type has no outbound mapping")]
    Unsupported,
    #[error("transmit queue full")]
    Busy,
    #[error("bus error")]
    Bus,
}

/// Outbound side of the protocol.
pub trait Transport {
    /// Send one message made of `header` followed by `data`, addressed
    /// with the local device `id`.
    fn send(&mut self, msg_type: MsgType, id: u8, header: &[u8], data: &[u8]) -> Result<(), SendError>;
}
