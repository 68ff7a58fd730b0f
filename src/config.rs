//! Channel configuration
//!
//! With the `serde` feature enabled every type here can be deserialized, so a rig loader can
//! read channel definitions straight from its platform files.

use std::time::Duration;

use crate::{
    broker::SignalId,
    flow_control::FlowControlPolicy,
    frame::{FrameSettings, MAX_12BIT_MESSAGE_LEN},
    send_session::SendTiming,
    TransportError, TransportResult,
};

/// ISO-TP timing of a channel
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TimingConfig {
    /// N_Bs - Time to wait for a flow control frame after a first frame or a full block
    pub n_bs: Duration,
    /// N_Cr - Time to wait for the next consecutive frame
    pub n_cr: Duration,
    /// WAIT flow control frames accepted in a row before a transmission is aborted
    pub max_wait_frames: u8,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            n_bs: Duration::from_millis(1000),
            n_cr: Duration::from_millis(1000),
            max_wait_frames: 10,
        }
    }
}

impl TimingConfig {
    /// Sender side part of the timing
    pub fn send_timing(&self) -> SendTiming {
        SendTiming {
            n_bs: self.n_bs,
            max_wait_frames: self.max_wait_frames,
        }
    }
}

/// Configuration of one [crate::channel::TransportChannel]
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ChannelConfig {
    /// Name the channel is registered under
    pub name: String,
    /// Signal requests are published on
    pub send_signal: SignalId,
    /// Signal responses arrive on
    pub receive_signal: SignalId,
    /// Maximum CAN frame length (8 classic, up to 64 for CAN-FD)
    pub max_frame_length: usize,
    /// Pad frames to `max_frame_length`
    pub padding_enabled: bool,
    /// Byte used for padding
    pub padding_byte: u8,
    /// Flow control this side requests, and whether it is sent automatically
    pub flow_control: FlowControlPolicy,
    /// When true, the sender does not wait for the peer's flow control and uses
    /// `flow_control` instead
    pub synthesize_flow_control: bool,
    /// ISO-TP timers
    pub timing: TimingConfig,
    /// Longest message accepted on receive
    pub max_message_length: usize,
}

impl ChannelConfig {
    /// Creates a classic CAN configuration with default flow control and timing
    pub fn new(
        name: impl Into<String>,
        send_signal: impl Into<String>,
        receive_signal: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Self {
        let namespace = namespace.into();
        Self {
            name: name.into(),
            send_signal: SignalId::new(send_signal, namespace.clone()),
            receive_signal: SignalId::new(receive_signal, namespace),
            max_frame_length: FrameSettings::default().max_frame_length,
            padding_enabled: true,
            padding_byte: 0x00,
            flow_control: FlowControlPolicy::default(),
            synthesize_flow_control: false,
            timing: TimingConfig::default(),
            max_message_length: MAX_12BIT_MESSAGE_LEN,
        }
    }

    /// Frame layout of this channel
    pub fn frame_settings(&self) -> FrameSettings {
        FrameSettings {
            max_frame_length: self.max_frame_length,
            padding_enabled: self.padding_enabled,
            padding_byte: self.padding_byte,
        }
    }

    /// Checks the configuration is usable
    pub fn validate(&self) -> TransportResult<()> {
        if self.name.is_empty() {
            return Err(TransportError::InvalidConfig("channel name is empty".into()));
        }
        if self.send_signal == self.receive_signal {
            return Err(TransportError::InvalidConfig(format!(
                "send and receive signal are both {}",
                self.send_signal
            )));
        }
        self.frame_settings().validate()?;
        self.flow_control
            .validate()
            .map_err(|e| TransportError::InvalidConfig(e.to_string()))?;
        if self.max_message_length == 0 || self.max_message_length > u32::MAX as usize {
            return Err(TransportError::InvalidConfig(format!(
                "max message length {} is outside 1..={}",
                self.max_message_length,
                u32::MAX
            )));
        }
        if self.timing.n_bs.is_zero() || self.timing.n_cr.is_zero() {
            return Err(TransportError::InvalidConfig(
                "N_Bs and N_Cr must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}
