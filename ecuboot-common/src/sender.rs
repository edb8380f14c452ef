// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Sending side of the chunked transfer, as run by a flashing tool.
//!
//! The sender announces a payload and then serves whatever bursts the
//! receiver asks for until the receiver reports the end of the session
//! twice: once when the transfer is finished and once more to confirm.

use thiserror::Error;
use zerocopy::IntoBytes;

use crate::checksum::crc16;
use crate::protocol::{
    decode, BurstCompletionPayload, BurstCrcPayload, BurstRequestPayload, ErrorPayload, InfoPayload, MsgType,
    PacketHeader, TransferStatus, Transport, MAX_SEQUENCE, READY_STATUS,
};

/// Timing of the sender, durations in milliseconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SenderConfig {
    pub ready_timeout: u32,
    /// Silence tolerated between two receiver requests.
    pub packets_timeout: u32,
    pub finished_timeout: u32,
    pub prepare_delay: u32,
    pub info_delay: u32,
    pub crc_delay: u32,
    pub packets_delay: u32,
    pub error_delay: u32,
    pub crc_count: u32,
    pub packets_count: u32,
    pub error_count: u32,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            ready_timeout: 5000,
            packets_timeout: 3000,
            finished_timeout: 3000,
            prepare_delay: 20,
            info_delay: 10,
            crc_delay: 1,
            packets_delay: 0,
            error_delay: 2,
            crc_count: 1,
            packets_count: 1,
            error_count: 3,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SenderError {
    #[error("packet size must not be zero")]
    EmptyPacket,
    #[error("burst buffer size must not be zero")]
    EmptyBuffer,
    #[error("payload larger than the 24-bit sequence range")]
    PayloadTooLarge,
    #[error("a transfer is already running")]
    Busy,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TxState {
    Idle,
    PrepareAndWait,
    WaitForMessages,
    SendCrc,
    SendPackets,
    PeerFinishWait,
    Error,
    Done,
}

pub struct Sender<'a> {
    config: SenderConfig,
    peer_id: u8,
    crc_poly: u16,
    payload: &'a [u8],
    buffer_size: u16,
    packet_size: u16,

    state: TxState,
    status: u8,
    outcome: Option<u8>,
    info_sent_once: bool,
    burst_served: bool,
    pending_error: Option<ErrorPayload>,

    requested_sequence: u32,
    requested_size: u16,
    burst_index: u16,
    burst_crc: u16,

    timeout_timer: u32,
    delay_timer: u32,
    count: u32,
}

impl<'a> Sender<'a> {
    /// `buffer_size` is the largest burst the sender serves and
    /// `packet_size` the data bytes carried by one packet.
    pub fn new(
        config: SenderConfig,
        peer_id: u8,
        crc_poly: u16,
        payload: &'a [u8],
        buffer_size: u16,
        packet_size: u16,
    ) -> Result<Self, SenderError> {
        if packet_size == 0 {
            return Err(SenderError::EmptyPacket);
        }
        if buffer_size == 0 {
            return Err(SenderError::EmptyBuffer);
        }
        if payload.len() as u64 > MAX_SEQUENCE as u64 + 1 {
            return Err(SenderError::PayloadTooLarge);
        }
        Ok(Self {
            config,
            peer_id,
            crc_poly,
            payload,
            buffer_size,
            packet_size,
            state: TxState::Idle,
            status: TransferStatus::Unknown.code(),
            outcome: None,
            info_sent_once: false,
            burst_served: false,
            pending_error: None,
            requested_sequence: 0,
            requested_size: 0,
            burst_index: 0,
            burst_crc: 0,
            timeout_timer: 0,
            delay_timer: 0,
            count: 0,
        })
    }

    pub fn state(&self) -> TxState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state != TxState::Idle
    }

    /// Final status of the last session, once it is over.
    pub fn outcome(&self) -> Option<u8> {
        self.outcome
    }

    pub fn total_size(&self) -> u32 {
        self.payload.len() as u32
    }

    /// Highest payload offset served so far.
    pub fn progress(&self) -> u32 {
        self.requested_sequence + self.burst_index as u32
    }

    pub fn start(&mut self, now: u32) -> Result<(), SenderError> {
        if self.state != TxState::Idle {
            warn!("tx: still running");
            return Err(SenderError::Busy);
        }
        self.outcome = None;
        self.status = TransferStatus::Unknown.code();
        self.requested_sequence = 0;
        self.requested_size = 0;
        self.burst_index = 0;
        self.set_state(now, TxState::PrepareAndWait);
        Ok(())
    }

    fn set_state(&mut self, now: u32, state: TxState) {
        if self.state != state {
            debug!("tx: {:?} -> {:?}", self.state, state);
        }
        self.state = state;
        self.timeout_timer = now;
        self.delay_timer = now;
        self.count = 0;
    }

    fn delay_elapsed(&mut self, now: u32, delay: u32) -> bool {
        if now.wrapping_sub(self.delay_timer) <= delay {
            return false;
        }
        self.delay_timer = now;
        true
    }

    fn timed_out(&self, now: u32, timeout: u32) -> bool {
        now.wrapping_sub(self.timeout_timer) > timeout
    }

    /// Count one more copy; true once `count` copies went out.
    fn copies_sent(&mut self, count: u32) -> bool {
        if self.count < count {
            self.count += 1;
        }
        self.count >= count
    }

    fn fail(&mut self, now: u32, status: TransferStatus) {
        warn!("tx: failing with {:?}", status);
        self.status = status.code();
        self.set_state(now, TxState::Error);
    }

    fn send<T: Transport + ?Sized>(&mut self, now: u32, transport: &mut T, msg_type: MsgType, header: &[u8], data: &[u8]) -> bool {
        match transport.send(msg_type, self.peer_id, header, data) {
            Ok(()) => true,
            Err(e) => {
                error!("tx: sending {:?} failed: {:?}", msg_type, e);
                self.fail(now, TransferStatus::CommError);
                false
            }
        }
    }

    pub fn tick<T: Transport + ?Sized>(&mut self, now: u32, transport: &mut T) {
        let config = self.config;
        match self.state {
            TxState::Idle => {}
            TxState::PrepareAndWait => {
                self.burst_served = false;
                self.info_sent_once = false;
                if self.timed_out(now, config.ready_timeout) {
                    self.fail(now, TransferStatus::ReadyTimeout);
                } else if self.delay_elapsed(now, config.prepare_delay) {
                    info!("tx: prepare request");
                    self.send(now, transport, MsgType::PrepareRequest, &[], &[]);
                }
            }
            TxState::WaitForMessages => self.wait_for_messages(now, transport),
            TxState::SendCrc => self.send_crc(now, transport),
            TxState::SendPackets => self.send_packets(now, transport),
            TxState::PeerFinishWait => {
                if self.timed_out(now, config.finished_timeout) {
                    self.fail(now, TransferStatus::FinishTimeout);
                }
            }
            TxState::Error => {
                error!("tx: transfer failed with 0x{:x}", self.status);
                self.outcome = Some(self.status);
                self.set_state(now, TxState::Idle);
            }
            TxState::Done => {
                info!("tx: transfer of {} bytes done", self.payload.len());
                self.status = TransferStatus::Ok.code();
                self.outcome = Some(self.status);
                self.set_state(now, TxState::Idle);
            }
        }
    }

    fn wait_for_messages<T: Transport + ?Sized>(&mut self, now: u32, transport: &mut T) {
        let config = self.config;
        if let Some(error) = self.pending_error {
            self.timeout_timer = now;
            if !self.delay_elapsed(now, config.error_delay) {
                return;
            }
            if !self.send(now, transport, MsgType::ErrorResponse, error.as_bytes(), &[]) {
                return;
            }
            if self.copies_sent(config.error_count) {
                self.pending_error = None;
                self.count = 0;
            }
            return;
        }

        if self.timed_out(now, config.packets_timeout) {
            self.fail(now, TransferStatus::RequestTimeout);
            return;
        }
        if !self.delay_elapsed(now, config.info_delay) || self.burst_served {
            return;
        }
        let info = InfoPayload::new(self.payload.len() as u32, self.buffer_size);
        if !self.info_sent_once {
            info!("tx: info total {} buffer {}", self.payload.len(), self.buffer_size);
            self.info_sent_once = true;
        }
        self.send(now, transport, MsgType::Info, info.as_bytes(), &[]);
    }

    fn send_crc<T: Transport + ?Sized>(&mut self, now: u32, transport: &mut T) {
        let config = self.config;
        if !self.delay_elapsed(now, config.crc_delay) {
            return;
        }
        let total = self.payload.len() as u32;
        let sequence = self.requested_sequence;
        if sequence >= total {
            warn!("tx: burst request at {} beyond {}", sequence, total);
            self.pending_error = Some(ErrorPayload::new(TransferStatus::SequenceOutOfBounds, sequence));
            self.set_state(now, TxState::WaitForMessages);
            return;
        }
        let size = self.requested_size.min(self.buffer_size) as u32;
        let size = size.min(total - sequence) as u16;
        self.requested_size = size;

        if self.count == 0 {
            let burst = &self.payload[sequence as usize..sequence as usize + size as usize];
            self.burst_crc = crc16(burst, self.crc_poly, 0);
        }
        debug!("tx: burst {} crc 0x{:x} size {}", sequence, self.burst_crc, size);
        let crc = BurstCrcPayload::new(sequence, self.burst_crc, size);
        if !self.send(now, transport, MsgType::BurstCrc, crc.as_bytes(), &[]) {
            return;
        }
        self.burst_served = true;
        if self.copies_sent(config.crc_count) {
            self.burst_index = 0;
            self.set_state(now, TxState::SendPackets);
        }
    }

    fn send_packets<T: Transport + ?Sized>(&mut self, now: u32, transport: &mut T) {
        let config = self.config;
        if !self.delay_elapsed(now, config.packets_delay) {
            return;
        }
        let size = (self.requested_size - self.burst_index).min(self.packet_size);
        let sent = if size == 0 {
            let done = BurstCompletionPayload::new(self.requested_sequence, self.burst_index);
            self.send(now, transport, MsgType::BurstCompletion, done.as_bytes(), &[])
        } else {
            let sequence = self.requested_sequence + self.burst_index as u32;
            let start = sequence as usize;
            let data = &self.payload[start..start + size as usize];
            let header = PacketHeader::new(sequence);
            self.send(now, transport, MsgType::BurstPacket, header.as_bytes(), data)
        };
        if !sent || !self.copies_sent(config.packets_count) {
            return;
        }
        if size == 0 {
            self.set_state(now, TxState::WaitForMessages);
        } else {
            self.burst_index += size;
            self.count = 0;
        }
    }

    /// Feed one message from the receiver. Returns whether it was consumed.
    pub fn process_message(&mut self, now: u32, msg_type: MsgType, id: u8, payload: &[u8]) -> bool {
        if id != self.peer_id {
            return false;
        }
        match (self.state, msg_type) {
            (TxState::PrepareAndWait, MsgType::ReadyReport) => match payload.first() {
                Some(&READY_STATUS) => {
                    info!("tx: peer {} ready", id);
                    self.set_state(now, TxState::WaitForMessages);
                    true
                }
                _ => false,
            },
            (TxState::WaitForMessages, MsgType::BurstRequest) => match decode::<BurstRequestPayload>(payload) {
                Some((request, _)) => {
                    self.requested_sequence = request.sequence.get();
                    self.requested_size = request.size.get();
                    self.burst_index = 0;
                    debug!(
                        "tx: burst request {} size {}",
                        self.requested_sequence, self.requested_size
                    );
                    self.set_state(now, TxState::SendCrc);
                    true
                }
                None => false,
            },
            (TxState::WaitForMessages | TxState::PeerFinishWait, MsgType::FinishReport) => {
                let Some(&status) = payload.first() else {
                    return false;
                };
                if status != TransferStatus::Ok.code() {
                    warn!("tx: peer finished with 0x{:x}", status);
                    self.status = status;
                    self.set_state(now, TxState::Error);
                } else if self.state == TxState::WaitForMessages {
                    info!("tx: peer finished, waiting for confirmation");
                    self.set_state(now, TxState::PeerFinishWait);
                } else {
                    self.set_state(now, TxState::Done);
                }
                true
            }
            (_, MsgType::ErrorResponse) if self.state != TxState::Idle => match decode::<ErrorPayload>(payload) {
                Some((error, _)) => {
                    warn!("tx: peer error 0x{:x} detail {}", error.status, error.detail.get());
                    self.fail(now, TransferStatus::PeerError);
                    true
                }
                None => false,
            },
            _ => {
                debug!("tx: {:?} ignored in {:?}", msg_type, self.state);
                false
            }
        }
    }
}
