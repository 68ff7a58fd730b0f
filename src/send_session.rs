//! Outbound multi-frame transmission
//!
//! A [SendSession] is created for every message which does not fit into a single frame.
//! It walks through the following states:
//!
//! ```text
//! Idle --FF sent--> AwaitingFc --CONTINUE--> SendingBlock --block done--> AwaitingFc
//!                    |  ^   |                     |
//!                    |  |   +--WAIT (bounded)     +--last CF--> Complete
//!                    +--+--OVERFLOW / bad FC / N_Bs--> Aborted
//! ```
//!
//! The session itself only decides what to send next. [SendSession::run] drives it against a
//! [FrameLink] (where frames go) and a [FlowControlSource] (where flow control comes from).

use std::{
    sync::mpsc,
    thread,
    time::{Duration, Instant},
};

use log::{debug, error, warn};

use crate::{
    flow_control::{FlowControlFrame, FlowStatus},
    frame::{encode_multi_frame, FrameSettings},
    ProtocolViolation, TimeoutKind, TransportError, TransportResult,
};

/// State of a [SendSession]
#[derive(Debug, Copy, Clone, PartialEq, Eq, strum_macros::Display)]
pub enum SendState {
    /// First frame not sent yet
    Idle,
    /// First frame or a full block sent, waiting for flow control
    AwaitingFc,
    /// Clear to send consecutive frames
    SendingBlock,
    /// Every frame has been sent
    Complete,
    /// Transmission was abandoned
    Aborted,
}

/// Destination of outgoing frames
pub trait FrameLink {
    /// Transmits one raw CAN frame
    fn transmit(&mut self, frame: &[u8]) -> TransportResult<()>;
}

impl<F: FnMut(&[u8]) -> TransportResult<()>> FrameLink for F {
    fn transmit(&mut self, frame: &[u8]) -> TransportResult<()> {
        self(frame)
    }
}

/// Origin of flow control frames for a transmission
pub trait FlowControlSource {
    /// Blocks up to `timeout` for the next flow control frame.
    ///
    /// Must return [TransportError::ChannelTimeout] when nothing arrives in time
    fn next_flow_control(&mut self, timeout: Duration) -> TransportResult<FlowControlFrame>;

    /// Returns a flow control frame that is already waiting, without blocking
    fn take_pending(&mut self) -> Option<FlowControlFrame> {
        None
    }
}

/// Flow control forwarded by a receive worker. Malformed flow control frames are forwarded as
/// errors so the session aborts on them
impl FlowControlSource for mpsc::Receiver<TransportResult<FlowControlFrame>> {
    fn next_flow_control(&mut self, timeout: Duration) -> TransportResult<FlowControlFrame> {
        match self.recv_timeout(timeout) {
            Ok(fc) => fc,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                Err(TransportError::ChannelTimeout(TimeoutKind::FlowControl))
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(TransportError::ChannelClosed),
        }
    }

    fn take_pending(&mut self) -> Option<FlowControlFrame> {
        take_pending_flow_control(self)
    }
}

/// Takes the next well-formed flow control frame already queued, logging and skipping
/// malformed ones
pub(crate) fn take_pending_flow_control(
    queue: &mpsc::Receiver<TransportResult<FlowControlFrame>>,
) -> Option<FlowControlFrame> {
    loop {
        match queue.try_recv() {
            Ok(Ok(fc)) => return Some(fc),
            Ok(Err(e)) => debug!("Skipping malformed flow control received mid-block: {e}"),
            Err(_) => return None,
        }
    }
}

/// Flow control synthesised locally instead of waiting for the peer
#[derive(Debug, Copy, Clone)]
pub struct LocalFlowControl(pub FlowControlFrame);

impl FlowControlSource for LocalFlowControl {
    fn next_flow_control(&mut self, _timeout: Duration) -> TransportResult<FlowControlFrame> {
        Ok(self.0)
    }
}

/// Sender side timing
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SendTiming {
    /// N_Bs, how long to wait for each flow control frame
    pub n_bs: Duration,
    /// Most WAIT flow control frames accepted in a row before aborting
    pub max_wait_frames: u8,
}

impl Default for SendTiming {
    fn default() -> Self {
        Self {
            n_bs: Duration::from_millis(1000),
            max_wait_frames: 10,
        }
    }
}

/// Outbound multi-frame state machine
#[derive(Debug)]
pub struct SendSession {
    frames: Vec<Vec<u8>>,
    next_index: usize,
    block_remaining: Option<u8>,
    last_flow_control: Option<FlowControlFrame>,
    wait_count: u16,
    max_wait_frames: u8,
    state: SendState,
}

impl SendSession {
    /// Segments `payload` into a first frame and its consecutive frames
    pub fn new(
        payload: &[u8],
        settings: &FrameSettings,
        max_wait_frames: u8,
    ) -> TransportResult<Self> {
        Ok(Self {
            frames: encode_multi_frame(payload, settings)?,
            next_index: 0,
            block_remaining: None,
            last_flow_control: None,
            wait_count: 0,
            max_wait_frames,
            state: SendState::Idle,
        })
    }

    /// Current state
    pub fn state(&self) -> SendState {
        self.state
    }

    /// Number of frames handed out so far
    pub fn frames_sent(&self) -> usize {
        self.next_index
    }

    /// Number of frames not yet handed out
    pub fn remaining_frames(&self) -> usize {
        self.frames.len() - self.next_index
    }

    /// Number of WAIT frames received since the last CONTINUE
    pub fn wait_count(&self) -> u16 {
        self.wait_count
    }

    /// Last flow control frame accepted by the session
    pub fn last_flow_control(&self) -> Option<FlowControlFrame> {
        self.last_flow_control
    }

    /// Separation time negotiated by the last flow control frame
    pub fn separation_time(&self) -> Duration {
        self.last_flow_control
            .map(|fc| fc.separation_time())
            .unwrap_or_default()
    }

    /// Hands out the first frame. `Idle -> AwaitingFc`
    pub fn start(&mut self) -> TransportResult<&[u8]> {
        if self.state != SendState::Idle {
            return Err(TransportError::InvalidState(self.state.to_string()));
        }
        self.state = SendState::AwaitingFc;
        self.next_index = 1;
        Ok(&self.frames[0])
    }

    /// Applies a flow control frame received from the peer
    pub fn on_flow_control(&mut self, fc: FlowControlFrame) -> TransportResult<()> {
        if self.state != SendState::AwaitingFc {
            warn!("Ignoring {} flow control received in state {}", fc.flag, self.state);
            return Err(ProtocolViolation::UnexpectedFlowControl.into());
        }
        match fc.flag {
            FlowStatus::Continue => {
                debug!(
                    "FC CONTINUE, BS: {}, ST: 0x{:02X}",
                    fc.block_size, fc.separation_time
                );
                self.wait_count = 0;
                self.block_remaining = fc.block_limit();
                self.last_flow_control = Some(fc);
                self.state = SendState::SendingBlock;
                Ok(())
            }
            FlowStatus::Wait => {
                self.wait_count += 1;
                if self.wait_count > u16::from(self.max_wait_frames) {
                    error!(
                        "Receiver sent {} WAIT frames, limit is {}",
                        self.wait_count, self.max_wait_frames
                    );
                    self.abort();
                    return Err(TransportError::WaitLimitExceeded(self.max_wait_frames));
                }
                debug!("FC WAIT ({}/{})", self.wait_count, self.max_wait_frames);
                Ok(())
            }
            FlowStatus::Overflow => {
                error!(
                    "Receiver signalled OVERFLOW, discarding {} unsent frames",
                    self.remaining_frames()
                );
                self.abort();
                Err(TransportError::OverflowAbort)
            }
        }
    }

    /// Hands out the next consecutive frame of the current block
    pub fn next_frame(&mut self) -> Option<&[u8]> {
        if self.state != SendState::SendingBlock {
            return None;
        }
        let idx = self.next_index;
        self.next_index += 1;
        if self.next_index == self.frames.len() {
            self.state = SendState::Complete;
        } else if let Some(remaining) = self.block_remaining.as_mut() {
            *remaining -= 1;
            if *remaining == 0 {
                self.state = SendState::AwaitingFc;
            }
        }
        Some(&self.frames[idx])
    }

    /// Abandons the transfer, discarding every unsent frame
    pub fn abort(&mut self) {
        self.state = SendState::Aborted;
        self.frames.truncate(self.next_index);
    }

    /// Drives the session until every frame is sent, or it aborts.
    ///
    /// Returns the number of frames sent
    pub fn run<L: FrameLink, S: FlowControlSource>(
        &mut self,
        link: &mut L,
        source: &mut S,
        timing: &SendTiming,
    ) -> TransportResult<usize> {
        let ff = self.start()?.to_vec();
        debug!("TX FF {ff:02X?}");
        if let Err(e) = link.transmit(&ff) {
            error!("Failed to send first frame: {e}");
            self.abort();
            return Err(e);
        }

        let mut last_cf: Option<Instant> = None;
        loop {
            match self.state {
                SendState::AwaitingFc => {
                    last_cf = None;
                    let fc = match source.next_flow_control(timing.n_bs) {
                        Ok(fc) => fc,
                        Err(e) => {
                            error!("No flow control after frame {}: {e}", self.next_index);
                            self.abort();
                            return Err(e);
                        }
                    };
                    self.on_flow_control(fc)?;
                }
                SendState::SendingBlock => {
                    while let Some(fc) = source.take_pending() {
                        if let Err(e) = self.on_flow_control(fc) {
                            debug!("Flow control ignored while sending a block: {e}");
                        }
                    }
                    if let Some(sent_at) = last_cf {
                        let st = self.separation_time();
                        let elapsed = sent_at.elapsed();
                        if elapsed < st {
                            thread::sleep(st - elapsed);
                        }
                    }
                    let Some(cf) = self.next_frame().map(|f| f.to_vec()) else {
                        break;
                    };
                    debug!("TX CF {cf:02X?}");
                    if let Err(e) = link.transmit(&cf) {
                        error!("Failed to send consecutive frame: {e}");
                        self.abort();
                        return Err(e);
                    }
                    last_cf = Some(Instant::now());
                }
                SendState::Complete => break,
                SendState::Idle | SendState::Aborted => {
                    return Err(TransportError::ChannelClosed);
                }
            }
        }
        debug!("TX done, {} frames", self.frames_sent());
        Ok(self.frames_sent())
    }
}
