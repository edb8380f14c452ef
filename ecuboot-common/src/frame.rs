// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! CAN framing of the transfer protocol.
//!
//! Each protocol message travels in one extended-id frame. Byte 0 holds
//! the device id, the message payload follows. Message type `t` uses id
//! `PROTOCOL_BASE_ID + t`. The run-mode request and the status broadcast
//! have their own ids.

use heapless::Deque;

use crate::bootloader::{Bootloader, Platform, BOOTLOADER_VERSION};
use crate::memory::Memory;
use crate::protocol::{MsgType, SendError, Transport};

/// Data bytes in a classic CAN frame.
pub const MAX_FRAME_DATA: usize = 8;
/// Payload bytes left after the device id.
pub const MAX_PAYLOAD: usize = MAX_FRAME_DATA - 1;

pub const STATUS_ID: u32 = 0x0001_F000;
pub const RUN_MODE_ID: u32 = 0x0001_F001;
/// Id of [`MsgType::PrepareRequest`]; the other types follow in order.
pub const PROTOCOL_BASE_ID: u32 = 0x0001_F100;

pub const STATUS_PERIOD_MS: u32 = 100;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CanFrame {
    pub id: u32,
    pub extended: bool,
    len: u8,
    data: [u8; MAX_FRAME_DATA],
}

impl CanFrame {
    /// Extended-id frame, `None` when `data` exceeds 8 bytes.
    pub fn new(id: u32, data: &[u8]) -> Option<Self> {
        Self::with_format(id, true, data)
    }

    /// Standard-id frame.
    pub fn standard(id: u32, data: &[u8]) -> Option<Self> {
        Self::with_format(id, false, data)
    }

    fn with_format(id: u32, extended: bool, data: &[u8]) -> Option<Self> {
        if data.len() > MAX_FRAME_DATA {
            return None;
        }
        let mut buf = [0u8; MAX_FRAME_DATA];
        buf[..data.len()].copy_from_slice(data);
        Some(Self {
            id,
            extended,
            len: data.len() as u8,
            data: buf,
        })
    }

    pub fn data(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }
}

/// Requested behaviour of the bootloader.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RunMode {
    StayInBootloader,
    StartApplication,
}

/// Decoded frame addressed to this device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Inbound<'f> {
    RunMode(RunMode),
    Protocol { msg_type: MsgType, id: u8, payload: &'f [u8] },
}

pub fn msg_type_for_id(id: u32) -> Option<MsgType> {
    let offset = id.checked_sub(PROTOCOL_BASE_ID)?;
    u8::try_from(offset).ok().and_then(|t| MsgType::try_from(t).ok())
}

pub fn id_for_msg_type(msg_type: MsgType) -> u32 {
    PROTOCOL_BASE_ID + msg_type as u32
}

/// Decode a received frame. Standard-id frames, frames without a payload
/// byte and frames for other devices yield `None`.
pub fn decode_frame(frame: &CanFrame, device_id: u8) -> Option<Inbound<'_>> {
    if !frame.extended {
        return None;
    }
    let (&target, payload) = frame.data().split_first()?;
    if target != device_id {
        return None;
    }
    if frame.id == RUN_MODE_ID {
        return match payload.first()? {
            0 => Some(Inbound::RunMode(RunMode::StayInBootloader)),
            1 => Some(Inbound::RunMode(RunMode::StartApplication)),
            _ => None,
        };
    }
    let msg_type = msg_type_for_id(frame.id)?;
    Some(Inbound::Protocol {
        msg_type,
        id: target,
        payload,
    })
}

/// Build the frame of a protocol message.
pub fn encode_frame(msg_type: MsgType, id: u8, header: &[u8], data: &[u8]) -> Result<CanFrame, SendError> {
    if header.len() + data.len() > MAX_PAYLOAD {
        return Err(SendError::TooLarge);
    }
    let mut buf = [0u8; MAX_FRAME_DATA];
    buf[0] = id;
    buf[1..1 + header.len()].copy_from_slice(header);
    buf[1 + header.len()..1 + header.len() + data.len()].copy_from_slice(data);
    CanFrame::new(id_for_msg_type(msg_type), &buf[..1 + header.len() + data.len()]).ok_or(SendError::TooLarge)
}

/// Run-mode request as sent by a tester.
pub fn run_mode_frame(device_id: u8, mode: RunMode) -> CanFrame {
    let flag = match mode {
        RunMode::StayInBootloader => 0,
        RunMode::StartApplication => 1,
    };
    CanFrame {
        id: RUN_MODE_ID,
        extended: true,
        len: 2,
        data: [device_id, flag, 0, 0, 0, 0, 0, 0],
    }
}

/// Something frames can be handed to for transmission.
pub trait FrameBus {
    fn transmit(&mut self, frame: &CanFrame) -> Result<(), SendError>;
}

impl<B: FrameBus + ?Sized> FrameBus for &mut B {
    fn transmit(&mut self, frame: &CanFrame) -> Result<(), SendError> {
        (**self).transmit(frame)
    }
}

/// [`Transport`] sending protocol messages as CAN frames.
pub struct CanTransport<B> {
    bus: B,
}

impl<B: FrameBus> CanTransport<B> {
    pub fn new(bus: B) -> Self {
        Self { bus }
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    pub fn into_inner(self) -> B {
        self.bus
    }
}

impl<B: FrameBus> Transport for CanTransport<B> {
    fn send(&mut self, msg_type: MsgType, id: u8, header: &[u8], data: &[u8]) -> Result<(), SendError> {
        let frame = encode_frame(msg_type, id, header, data)?;
        self.bus.transmit(&frame)
    }
}

/// Bounded FIFO of frames, between an interrupt handler and the main
/// loop or in front of a transmit mailbox.
pub struct FrameQueue<const N: usize> {
    frames: Deque<CanFrame, N>,
}

impl<const N: usize> Default for FrameQueue<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> FrameQueue<N> {
    pub const fn new() -> Self {
        Self { frames: Deque::new() }
    }

    /// Queue a frame; hands it back when the queue is full.
    pub fn push(&mut self, frame: CanFrame) -> Result<(), CanFrame> {
        self.frames.push_back(frame)
    }

    pub fn pop(&mut self) -> Option<CanFrame> {
        self.frames.pop_front()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }
}

impl<const N: usize> FrameBus for FrameQueue<N> {
    fn transmit(&mut self, frame: &CanFrame) -> Result<(), SendError> {
        self.push(*frame).map_err(|_| SendError::Busy)
    }
}

/// Periodic status frame.
#[derive(Clone, Copy, Debug)]
pub struct StatusBroadcaster {
    period: u32,
    last: Option<u32>,
}

impl Default for StatusBroadcaster {
    fn default() -> Self {
        Self::new(STATUS_PERIOD_MS)
    }
}

impl StatusBroadcaster {
    pub const fn new(period: u32) -> Self {
        Self { period, last: None }
    }

    /// The status frame, once per period. The first call always emits.
    pub fn poll(&mut self, now: u32, device_id: u8, status: u8, version: u32) -> Option<CanFrame> {
        if let Some(last) = self.last {
            if now.wrapping_sub(last) < self.period {
                return None;
            }
        }
        self.last = Some(now);
        Some(status_frame(device_id, status, version))
    }
}

/// Status broadcast: device id, 0, packed status, installed version, bootloader version.
pub fn status_frame(device_id: u8, status: u8, version: u32) -> CanFrame {
    let v = version.to_le_bytes();
    CanFrame {
        id: STATUS_ID,
        extended: true,
        len: 8,
        data: [device_id, 0x00, status, v[0], v[1], v[2], v[3], BOOTLOADER_VERSION],
    }
}

/// Route a received frame to the bootloader. Returns whether it was used.
pub fn dispatch<M, T, P>(bootloader: &mut Bootloader<'_, M, T, P>, now: u32, frame: &CanFrame) -> bool
where
    M: Memory,
    T: Transport,
    P: Platform,
{
    match decode_frame(frame, bootloader.device_id()) {
        Some(Inbound::RunMode(RunMode::StartApplication)) => {
            info!("frame: start application requested");
            bootloader.stay_in_bootloader(false);
            bootloader.start_application(true);
            true
        }
        Some(Inbound::RunMode(RunMode::StayInBootloader)) => {
            info!("frame: stay in bootloader requested");
            bootloader.start_application(false);
            bootloader.stay_in_bootloader(true);
            true
        }
        Some(Inbound::Protocol { msg_type, id, payload }) => bootloader.message_received(now, msg_type, id, payload),
        None => false,
    }
}
