//! Inbound reassembly of ISO-TP messages
//!
//! ```text
//! Empty --SF--> Complete
//! Empty --FF--> Collecting --CF (in order)--> Collecting --last CF--> Complete
//!                   |
//!                   +--CF out of order / N_Cr expired--> Error
//! Empty --CF--> Error
//! ```
//!
//! `Complete` and `Error` fall back to `Empty` on the next SF/FF or on [ReceiveReassembler::clear].

use std::{
    cmp::min,
    mem,
    time::{Duration, Instant},
};

use log::{debug, error, warn};

use crate::{
    flow_control::{FlowControlFrame, FlowStatus},
    frame::{decode_pci, Pci},
    ProtocolViolation, TimeoutKind, TransportError, TransportResult,
};

/// State of a [ReceiveReassembler]
#[derive(Debug, Copy, Clone, PartialEq, Eq, strum_macros::Display)]
pub enum RxState {
    /// Nothing received
    Empty,
    /// First frame received, consecutive frames outstanding
    Collecting,
    /// A complete message is waiting to be taken
    Complete,
    /// Reception failed, the partial message was discarded
    Error,
}

/// What the owner of the reassembler has to do after a frame
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RxEvent {
    /// Nothing
    None,
    /// A message is complete, see [ReceiveReassembler::take_message]
    Completed,
    /// A flow control frame with this flag is due
    FlowControl(FlowStatus),
}

/// Inbound reassembly state machine
#[derive(Debug)]
pub struct ReceiveReassembler {
    state: RxState,
    expected_total_length: usize,
    expected_sequence_number: u8,
    buffer: Vec<u8>,
    block_size: u8,
    // Granted by the last CONTINUE sent, counts the current block
    active_block_size: u8,
    frames_in_block: u8,
    max_message_length: usize,
    last_frame_at: Instant,
}

impl ReceiveReassembler {
    /// Creates an empty reassembler
    ///
    /// ## Parameters
    /// * max_message_length - First frames declaring more than this are refused with OVERFLOW
    /// * block_size - Consecutive frames to accept before another flow control is due (0 = unlimited)
    pub fn new(max_message_length: usize, block_size: u8) -> Self {
        Self {
            state: RxState::Empty,
            expected_total_length: 0,
            expected_sequence_number: 1,
            buffer: Vec::new(),
            block_size,
            active_block_size: block_size,
            frames_in_block: 0,
            max_message_length,
            last_frame_at: Instant::now(),
        }
    }

    /// Current state
    pub fn state(&self) -> RxState {
        self.state
    }

    /// Length declared by the current first frame
    pub fn expected_total_length(&self) -> usize {
        self.expected_total_length
    }

    /// Bytes collected so far
    pub fn received_length(&self) -> usize {
        self.buffer.len()
    }

    /// Sequence counter the next consecutive frame must carry
    pub fn expected_sequence_number(&self) -> u8 {
        self.expected_sequence_number
    }

    /// Changes the block size requested from senders, from the next first frame on.
    ///
    /// A block already granted is counted with the block size it was granted with
    pub fn set_block_size(&mut self, block_size: u8) {
        self.block_size = block_size;
    }

    /// Block size of the block currently being received
    pub fn active_block_size(&self) -> u8 {
        self.active_block_size
    }

    /// Discards everything and returns to `Empty`
    pub fn clear(&mut self) {
        self.state = RxState::Empty;
        self.expected_total_length = 0;
        self.expected_sequence_number = 1;
        self.frames_in_block = 0;
        self.buffer.clear();
    }

    fn fail(&mut self) {
        self.clear();
        self.state = RxState::Error;
    }

    /// Takes the completed message, returning to `Empty`
    pub fn take_message(&mut self) -> Option<Vec<u8>> {
        if self.state != RxState::Complete {
            return None;
        }
        let msg = mem::take(&mut self.buffer);
        self.clear();
        Some(msg)
    }

    /// Restarts the N_Cr timer, for when a flow control frame has been sent.
    ///
    /// A CONTINUE frame starts a new block of `fc.block_size` frames
    pub fn on_flow_control_sent(&mut self, fc: &FlowControlFrame) {
        self.last_frame_at = Instant::now();
        if fc.flag == FlowStatus::Continue {
            self.active_block_size = fc.block_size;
            self.frames_in_block = 0;
        }
    }

    /// Fails a stalled collection once more than `n_cr` passed since the last frame
    pub fn check_timeout(&mut self, n_cr: Duration) -> TransportResult<()> {
        if self.state == RxState::Collecting && self.last_frame_at.elapsed() > n_cr {
            error!(
                "N_Cr expired with {}/{} bytes received",
                self.received_length(),
                self.expected_total_length
            );
            self.fail();
            return Err(TransportError::ChannelTimeout(TimeoutKind::ConsecutiveFrame));
        }
        Ok(())
    }

    /// Feeds one raw frame
    pub fn on_frame(&mut self, frame: &[u8]) -> TransportResult<RxEvent> {
        let pci = decode_pci(frame).inspect_err(|e| {
            error!("Dropping frame {frame:02X?}: {e}");
        })?;
        match pci {
            Pci::Single { data } => {
                if self.state == RxState::Collecting {
                    warn!(
                        "Single frame interrupted reception after {}/{} bytes",
                        self.received_length(),
                        self.expected_total_length
                    );
                }
                self.clear();
                debug!("RX SF {data:02X?}");
                self.buffer.extend_from_slice(data);
                self.expected_total_length = data.len();
                self.state = RxState::Complete;
                Ok(RxEvent::Completed)
            }
            Pci::First { total_len, data } => {
                if self.state == RxState::Collecting {
                    warn!(
                        "First frame restarted reception after {}/{} bytes",
                        self.received_length(),
                        self.expected_total_length
                    );
                }
                self.clear();
                if total_len > self.max_message_length {
                    error!(
                        "First frame declares {total_len} bytes, limit is {}",
                        self.max_message_length
                    );
                    self.expected_total_length = total_len;
                    self.state = RxState::Error;
                    return Ok(RxEvent::FlowControl(FlowStatus::Overflow));
                }
                if data.len() >= total_len {
                    self.state = RxState::Error;
                    return Err(TransportError::MalformedFrame(
                        "first frame length fits in a single frame",
                    ));
                }
                debug!("RX FF, length: {total_len}, data {data:02X?}");
                self.expected_total_length = total_len;
                self.active_block_size = self.block_size;
                self.buffer.reserve(total_len);
                self.buffer.extend_from_slice(data);
                self.last_frame_at = Instant::now();
                self.state = RxState::Collecting;
                Ok(RxEvent::FlowControl(FlowStatus::Continue))
            }
            Pci::Consecutive { sequence, data } => {
                if self.state != RxState::Collecting {
                    error!("Consecutive frame 0x{sequence:X} received in state {}", self.state);
                    self.fail();
                    return Err(ProtocolViolation::UnexpectedConsecutiveFrame.into());
                }
                if sequence != self.expected_sequence_number {
                    error!(
                        "Consecutive frame out of order, expected 0x{:X}, received 0x{sequence:X}",
                        self.expected_sequence_number
                    );
                    let expected = self.expected_sequence_number;
                    self.fail();
                    return Err(ProtocolViolation::SequenceMismatch {
                        expected,
                        received: sequence,
                    }
                    .into());
                }
                let take = min(self.expected_total_length - self.buffer.len(), data.len());
                self.buffer.extend_from_slice(&data[..take]);
                self.expected_sequence_number = (self.expected_sequence_number + 1) & 0x0F;
                self.last_frame_at = Instant::now();
                debug!(
                    "RX CF 0x{sequence:X}, {}/{} bytes",
                    self.buffer.len(),
                    self.expected_total_length
                );

                if self.buffer.len() == self.expected_total_length {
                    self.state = RxState::Complete;
                    return Ok(RxEvent::Completed);
                }
                self.frames_in_block += 1;
                if self.active_block_size != 0
                    && self.frames_in_block == self.active_block_size
                {
                    self.frames_in_block = 0;
                    return Ok(RxEvent::FlowControl(FlowStatus::Continue));
                }
                Ok(RxEvent::None)
            }
            Pci::FlowControl(fc) => {
                warn!("Unexpected {} flow control frame in reassembler", fc.flag);
                Err(ProtocolViolation::UnexpectedFlowControl.into())
            }
        }
    }
}
