// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Receiving side of the chunked transfer.
//!
//! The receiver pulls a payload from a peer in bursts. For each burst it:
//! 1. asks for a range by byte sequence;
//! 2. gets the burst CRC and then the data packets;
//! 3. checks the reassembled burst against the CRC;
//! 4. hands it to a [`TransferSink`].
//!
//! Nothing blocks. [`Receiver::tick`] drives delays, timeouts and outbound
//! messages. [`Receiver::process_message`] consumes inbound messages and
//! ignores anything the current state does not expect.

use zerocopy::IntoBytes;

use crate::checksum::crc16;
use crate::protocol::{
    decode, BurstCompletionPayload, BurstCrcPayload, BurstRequestPayload, ErrorPayload, InfoPayload,
    MsgType, PacketHeader, TransferStatus, Transport, MAX_SEQUENCE, READY_STATUS,
};

/// Timing and retry policy, all durations in milliseconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ReceiverConfig {
    /// Restarts of the whole transfer allowed per session.
    pub max_full_retries: u32,
    /// Re-requests allowed for one burst.
    pub max_retries_burst: u32,
    /// Wait for a prepare request once started; 0 waits forever.
    pub prepare_timeout: u32,
    pub info_timeout: u32,
    pub packets_timeout: u32,
    pub ready_status_delay: u32,
    pub request_count: u32,
    pub request_delay: u32,
    pub complete_delay: u32,
    pub complete_count: u32,
    pub finish_delay: u32,
    pub finish_count: u32,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            max_full_retries: 3,
            max_retries_burst: 20,
            prepare_timeout: 0,
            info_timeout: 1000,
            packets_timeout: 1000,
            ready_status_delay: 5,
            request_count: 10,
            request_delay: 2,
            complete_delay: 2,
            complete_count: 5,
            finish_delay: 5,
            finish_count: 5,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RxState {
    Idle,
    SendReadyWaitInfo,
    SendBurstRequestWaitCrc,
    WaitBurstData,
    BurstComplete,
    SendComplete,
    Process,
    SendFinishReport,
}

/// Answer of a sink to a verified burst.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WriteOutcome {
    Success,
    RepeatLastBurst,
    RestartFromBeginning,
    /// Give up with the given status code.
    Abort(u8),
}

/// Answer of a sink once the transfer is over.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FinishOutcome {
    Success,
    /// Transfer everything again; the code is only reported in logs.
    Retry(u8),
    Abort(u8),
}

/// Consumer of the received payload.
pub trait TransferSink {
    /// Bytes `offset..offset + data.len()` of the payload, passed in order.
    /// `last` is set on the burst that ends the payload.
    fn write(&mut self, offset: u32, data: &[u8], last: bool) -> WriteOutcome;

    /// Called once per transfer attempt with the terminal status.
    fn finish(&mut self, status: u8) -> FinishOutcome;
}

/// The receiver was already started or is still busy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ReceiverBusy;

pub struct Receiver<'a> {
    config: ReceiverConfig,
    id: u8,
    crc_poly: u16,
    buffer: &'a mut [u8],

    state: RxState,
    started: bool,
    status: u8,
    pending_error: Option<ErrorPayload>,

    total_size: u32,
    max_burst_size: u16,
    requested_burst_size: u16,
    burst_sequence: u32,
    burst_size: u16,
    burst_crc: u16,
    burst_index: u16,
    expected_sequence: u32,

    burst_retries: u32,
    full_retries: u32,

    timeout_timer: u32,
    delay_timer: u32,
    count: u32,
}

impl<'a> Receiver<'a> {
    /// `id` is both the expected sender id and the id stamped on replies.
    /// `crc_poly` is the polynomial of the burst CRC-16.
    pub fn new(config: ReceiverConfig, id: u8, crc_poly: u16, buffer: &'a mut [u8]) -> Self {
        Self {
            config,
            id,
            crc_poly,
            buffer,
            state: RxState::Idle,
            started: false,
            status: TransferStatus::Unknown.code(),
            pending_error: None,
            total_size: 0,
            max_burst_size: 0,
            requested_burst_size: 0,
            burst_sequence: 0,
            burst_size: 0,
            burst_crc: 0,
            burst_index: 0,
            expected_sequence: 0,
            burst_retries: 0,
            full_retries: 0,
            timeout_timer: 0,
            delay_timer: 0,
            count: 0,
        }
    }

    pub fn config(&self) -> &ReceiverConfig {
        &self.config
    }

    pub fn state(&self) -> RxState {
        self.state
    }

    /// Last terminal status.
    pub fn status(&self) -> u8 {
        self.status
    }

    pub fn total_size(&self) -> u32 {
        self.total_size
    }

    /// Payload bytes accepted by the sink so far.
    pub fn progress(&self) -> u32 {
        self.burst_sequence
    }

    /// Wait for a peer's prepare request.
    pub fn start(&mut self, now: u32) -> Result<(), ReceiverBusy> {
        if self.state != RxState::Idle || self.started {
            warn!("rx: start refused in {:?}", self.state);
            return Err(ReceiverBusy);
        }
        self.started = true;
        self.set_state(now, RxState::Idle);
        info!("rx: started");
        Ok(())
    }

    /// Started and waiting, or in the middle of a session.
    pub fn is_running(&self) -> bool {
        self.state != RxState::Idle || self.started
    }

    /// Past the handshake, i.e. payload bytes are being exchanged.
    pub fn is_receiving(&self) -> bool {
        !matches!(self.state, RxState::Idle | RxState::SendReadyWaitInfo)
    }

    fn local_capacity(&self) -> u16 {
        u16::try_from(self.buffer.len()).unwrap_or(u16::MAX)
    }

    fn set_state(&mut self, now: u32, state: RxState) {
        if self.state != state {
            debug!("rx: {:?} -> {:?}", self.state, state);
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

    /// Take one of `count` repetitions; false once they are used up.
    fn repeat(&mut self, count: u32) -> bool {
        if self.count < count {
            self.count += 1;
            true
        } else {
            false
        }
    }

    fn fail(&mut self, now: u32, status: TransferStatus) {
        warn!("rx: failing with {:?}", status);
        self.status = status.code();
        self.set_state(now, RxState::Process);
    }

    fn request_burst(&mut self, now: u32, sequence: u32) {
        self.burst_size = 0;
        self.burst_sequence = sequence;
        self.burst_index = 0;
        self.expected_sequence = sequence;
        self.set_state(now, RxState::SendBurstRequestWaitCrc);
    }

    fn retry_burst(&mut self, now: u32) -> bool {
        if self.burst_retries >= self.config.max_retries_burst {
            return false;
        }
        self.burst_retries += 1;
        warn!(
            "rx: retrying burst at {} ({}/{})",
            self.burst_sequence, self.burst_retries, self.config.max_retries_burst
        );
        self.request_burst(now, self.burst_sequence);
        true
    }

    fn retry_burst_or(&mut self, now: u32, status: TransferStatus) {
        if !self.retry_burst(now) {
            self.fail(now, status);
        }
    }

    fn retry_full(&mut self, now: u32) -> bool {
        if self.full_retries >= self.config.max_full_retries {
            return false;
        }
        self.full_retries += 1;
        self.burst_retries = 0;
        warn!(
            "rx: restarting transfer ({}/{})",
            self.full_retries, self.config.max_full_retries
        );
        self.request_burst(now, 0);
        true
    }

    /// Advance timers and send whatever the current state owes the peer.
    pub fn tick<T, S>(&mut self, now: u32, transport: &mut T, sink: &mut S)
    where
        T: Transport + ?Sized,
        S: TransferSink + ?Sized,
    {
        if let Some(error) = self.pending_error.take() {
            if transport
                .send(MsgType::ErrorResponse, self.id, error.as_bytes(), &[])
                .is_err()
            {
                warn!("rx: error response not sent");
            }
        }

        let config = self.config;
        match self.state {
            RxState::Idle => {
                if !self.started {
                    self.timeout_timer = now;
                } else if config.prepare_timeout != 0 && self.timed_out(now, config.prepare_timeout) {
                    self.fail(now, TransferStatus::PrepareTimeout);
                }
            }
            RxState::SendReadyWaitInfo => {
                if self.timed_out(now, config.info_timeout) {
                    self.fail(now, TransferStatus::InfoTimeout);
                } else if self.delay_elapsed(now, config.ready_status_delay)
                    && transport
                        .send(MsgType::ReadyReport, self.id, &[READY_STATUS], &[])
                        .is_err()
                {
                    self.fail(now, TransferStatus::CommError);
                }
            }
            RxState::SendBurstRequestWaitCrc => {
                if self.delay_elapsed(now, config.request_delay) && self.repeat(config.request_count) {
                    self.timeout_timer = now;
                    let remaining = self.total_size - self.burst_sequence;
                    self.requested_burst_size = remaining.min(self.max_burst_size as u32) as u16;
                    let request = BurstRequestPayload::new(self.burst_sequence, self.requested_burst_size);
                    debug!(
                        "rx: burst request {} size {}",
                        self.burst_sequence, self.requested_burst_size
                    );
                    if transport
                        .send(MsgType::BurstRequest, self.id, request.as_bytes(), &[])
                        .is_err()
                    {
                        self.fail(now, TransferStatus::CommError);
                    }
                } else if self.timed_out(now, config.packets_timeout) {
                    self.retry_burst_or(now, TransferStatus::RequestTimeout);
                }
            }
            RxState::WaitBurstData => {
                if self.timed_out(now, config.packets_timeout) {
                    self.retry_burst_or(now, TransferStatus::RequestTimeout);
                }
            }
            RxState::BurstComplete => self.complete_burst(now, sink),
            RxState::SendComplete => {
                if self.delay_elapsed(now, config.complete_delay) {
                    if !self.repeat(config.complete_count) {
                        self.status = TransferStatus::Ok.code();
                        self.set_state(now, RxState::Process);
                    } else if transport.send(MsgType::Completion, self.id, &[], &[]).is_err() {
                        self.fail(now, TransferStatus::CommError);
                    }
                }
            }
            RxState::Process => self.process(now, sink),
            RxState::SendFinishReport => {
                if self.delay_elapsed(now, config.finish_delay) {
                    if self.repeat(config.finish_count) {
                        if transport
                            .send(MsgType::FinishReport, self.id, &[self.status], &[])
                            .is_err()
                        {
                            debug!("rx: finish report not sent");
                        }
                    } else {
                        info!("rx: session over, status 0x{:x}", self.status);
                        self.started = false;
                        self.set_state(now, RxState::Idle);
                    }
                }
            }
        }
    }

    fn complete_burst<S: TransferSink + ?Sized>(&mut self, now: u32, sink: &mut S) {
        let data = &self.buffer[..self.burst_size as usize];
        let crc = crc16(data, self.crc_poly, 0);
        if crc != self.burst_crc {
            warn!(
                "rx: burst {} CRC 0x{:x} != 0x{:x}",
                self.burst_sequence, crc, self.burst_crc
            );
            self.retry_burst_or(now, TransferStatus::CrcMismatch);
            return;
        }

        let next = self.burst_sequence + self.burst_size as u32;
        let last = next >= self.total_size;
        match sink.write(self.burst_sequence, data, last) {
            WriteOutcome::Success if last => {
                self.burst_sequence = next;
                self.set_state(now, RxState::SendComplete);
            }
            WriteOutcome::Success => {
                self.burst_retries = 0;
                self.request_burst(now, next);
            }
            WriteOutcome::RepeatLastBurst => self.retry_burst_or(now, TransferStatus::MaxBurstRetries),
            WriteOutcome::RestartFromBeginning => {
                if !self.retry_full(now) {
                    self.fail(now, TransferStatus::MaxFullRetries);
                }
            }
            WriteOutcome::Abort(code) => {
                warn!("rx: sink aborted with 0x{:x}", code);
                self.status = code;
                self.set_state(now, RxState::Process);
            }
        }
    }

    fn process<S: TransferSink + ?Sized>(&mut self, now: u32, sink: &mut S) {
        let outcome = sink.finish(self.status);
        let outcome = if self.status != TransferStatus::Ok.code() {
            FinishOutcome::Abort(self.status)
        } else {
            outcome
        };
        match outcome {
            FinishOutcome::Success => {
                info!("rx: transfer of {} bytes accepted", self.total_size);
                self.status = TransferStatus::Ok.code();
                self.set_state(now, RxState::SendFinishReport);
            }
            FinishOutcome::Retry(code) => {
                warn!("rx: sink asked for a retry (0x{:x})", code);
                self.status = TransferStatus::Unknown.code();
                if !self.retry_full(now) {
                    self.status = TransferStatus::MaxFullRetries.code();
                    self.set_state(now, RxState::SendFinishReport);
                }
            }
            FinishOutcome::Abort(code) => {
                self.status = code;
                self.set_state(now, RxState::SendFinishReport);
            }
        }
    }

    /// Feed one inbound message. Returns whether it was consumed.
    pub fn process_message(&mut self, now: u32, msg_type: MsgType, id: u8, payload: &[u8]) -> bool {
        if id != self.id {
            debug!("rx: message for id {} ignored", id);
            return false;
        }
        match (self.state, msg_type) {
            (RxState::Idle, MsgType::PrepareRequest) if self.started => {
                self.prepare(now);
                true
            }
            (RxState::SendReadyWaitInfo, MsgType::Info) => match decode::<InfoPayload>(payload) {
                Some((info, _)) => {
                    self.accept_info(now, info);
                    true
                }
                None => false,
            },
            (RxState::SendBurstRequestWaitCrc, MsgType::BurstCrc) => match decode::<BurstCrcPayload>(payload) {
                Some((crc, _)) => self.accept_crc(now, crc),
                None => false,
            },
            (RxState::WaitBurstData, MsgType::BurstPacket) => match decode::<PacketHeader>(payload) {
                Some((header, data)) => self.accept_packet(now, header, data),
                None => false,
            },
            (RxState::WaitBurstData, MsgType::BurstCompletion) => {
                match decode::<BurstCompletionPayload>(payload) {
                    Some((done, _)) if done.sequence.get() == self.burst_sequence => {
                        warn!(
                            "rx: peer completed burst {} with {}/{} bytes received",
                            self.burst_sequence, self.burst_index, self.burst_size
                        );
                        self.retry_burst_or(now, TransferStatus::UnexpectedCompletion);
                        true
                    }
                    _ => false,
                }
            }
            (RxState::SendBurstRequestWaitCrc | RxState::WaitBurstData, MsgType::ErrorResponse) => {
                match decode::<ErrorPayload>(payload) {
                    Some((error, _)) => {
                        warn!("rx: peer reported error 0x{:x}", error.status);
                        self.fail(now, TransferStatus::PeerError);
                        true
                    }
                    None => false,
                }
            }
            _ => {
                debug!("rx: {:?} ignored in {:?}", msg_type, self.state);
                false
            }
        }
    }

    fn prepare(&mut self, now: u32) {
        info!("rx: prepare request");
        self.status = TransferStatus::Unknown.code();
        self.total_size = 0;
        self.max_burst_size = 0;
        self.requested_burst_size = 0;
        self.burst_sequence = 0;
        self.burst_size = 0;
        self.burst_crc = 0;
        self.burst_index = 0;
        self.expected_sequence = 0;
        self.burst_retries = 0;
        self.full_retries = 0;
        self.set_state(now, RxState::SendReadyWaitInfo);
    }

    fn accept_info(&mut self, now: u32, info: InfoPayload) {
        let total = info.total_size.get();
        let peer_buffer = info.buffer_size.get();
        info!("rx: info total {} peer buffer {}", total, peer_buffer);

        if total == 0 || total > MAX_SEQUENCE + 1 {
            self.pending_error = Some(ErrorPayload::new(TransferStatus::SequenceOutOfBounds, total));
            self.fail(now, TransferStatus::SequenceOutOfBounds);
            return;
        }
        let max_burst = peer_buffer.min(self.local_capacity());
        if max_burst == 0 {
            self.pending_error = Some(ErrorPayload::new(TransferStatus::BufferTooSmall, peer_buffer as u32));
            self.fail(now, TransferStatus::BufferTooSmall);
            return;
        }
        self.total_size = total;
        self.max_burst_size = max_burst;
        self.request_burst(now, 0);
    }

    fn accept_crc(&mut self, now: u32, crc: BurstCrcPayload) -> bool {
        if crc.sequence.get() != self.burst_sequence {
            return false;
        }
        let size = crc.size.get();
        if size == 0 || size > self.requested_burst_size {
            warn!(
                "rx: burst size {} outside 1..={}",
                size, self.requested_burst_size
            );
            self.retry_burst_or(now, TransferStatus::BurstSizeTooBig);
            return true;
        }
        self.burst_crc = crc.crc.get();
        self.burst_size = size;
        self.burst_index = 0;
        self.expected_sequence = self.burst_sequence;
        self.set_state(now, RxState::WaitBurstData);
        true
    }

    fn accept_packet(&mut self, now: u32, header: PacketHeader, data: &[u8]) -> bool {
        if data.is_empty() || header.sequence.get() != self.expected_sequence {
            return false;
        }
        let start = self.burst_index as usize;
        let end = start + data.len();
        if end > self.burst_size as usize {
            debug!("rx: packet overflows burst, dropped");
            return false;
        }
        self.buffer[start..end].copy_from_slice(data);
        self.burst_index = end as u16;
        self.expected_sequence += data.len() as u32;
        if self.burst_index == self.burst_size {
            self.set_state(now, RxState::BurstComplete);
        }
        true
    }
}
