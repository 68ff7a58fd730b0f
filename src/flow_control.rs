//! Flow control frames and the flow control policy of a channel
//!
//! A flow control (FC) frame is sent by the receiver of a multi-frame message after the
//! first frame, and again after every `block_size` consecutive frames. Both the
//! [crate::send_session::SendSession] and the [crate::reassembler::ReceiveReassembler]
//! go through this module so that they agree on what WAIT, CONTINUE and OVERFLOW mean.

use std::time::Duration;

use strum_macros::{Display, EnumString, FromRepr};

use crate::{TransportError, TransportResult};

/// Length of a stand-alone flow control frame
pub const FLOW_CONTROL_FRAME_LEN: usize = 8;

/// Largest separation time which is expressed in milliseconds
pub const MAX_SEPARATION_TIME_MS: u8 = 0x7F;

/// Flow status carried in byte 0 of a flow control frame.
///
/// Parses from its name, EG: `"WAIT".parse::<FlowStatus>()`
#[derive(Debug, Copy, Clone, PartialEq, Eq, Display, EnumString, FromRepr)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum FlowStatus {
    /// Clear to send `block_size` more consecutive frames
    #[strum(serialize = "CONTINUE")]
    Continue = 0x30,
    /// Receiver is busy, sender must wait for another flow control frame
    #[strum(serialize = "WAIT")]
    Wait = 0x31,
    /// Receiver cannot take the message, sender must abort
    #[strum(serialize = "OVERFLOW")]
    Overflow = 0x32,
}

/// Checks that a raw separation time byte is either 0-127ms or one of the 100-900us codes
pub fn is_valid_separation_time(st: u8) -> bool {
    st <= MAX_SEPARATION_TIME_MS || (0xF1..=0xF9).contains(&st)
}

/// Converts a raw separation time byte into the delay required between consecutive frames.
///
/// Reserved values are treated as the longest separation time (127ms)
pub fn separation_time(st: u8) -> Duration {
    match st {
        0x00..=0x7F => Duration::from_millis((st & MAX_SEPARATION_TIME_MS) as u64),
        0xF1..=0xF9 => Duration::from_micros((st - 0xF0) as u64 * 100),
        _ => Duration::from_millis(MAX_SEPARATION_TIME_MS as u64),
    }
}

/// A decoded (or to be encoded) flow control frame
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FlowControlFrame {
    /// Flow status
    pub flag: FlowStatus,
    /// Consecutive frames allowed before the next flow control frame. 0 means unlimited
    pub block_size: u8,
    /// Raw separation time byte (STmin)
    pub separation_time: u8,
}

impl FlowControlFrame {
    /// Creates a flow control frame, rejecting reserved separation time values
    pub fn new(flag: FlowStatus, block_size: u8, separation_time: u8) -> TransportResult<Self> {
        if !is_valid_separation_time(separation_time) {
            return Err(TransportError::InvalidFlowControl(format!(
                "separation time 0x{separation_time:02X} is reserved"
            )));
        }
        Ok(Self {
            flag,
            block_size,
            separation_time,
        })
    }

    /// Reads flag, block size and separation time from a received flow control frame
    pub fn interpret(frame: &[u8]) -> TransportResult<Self> {
        if frame.len() < 3 {
            return Err(TransportError::InvalidFlowControl(format!(
                "frame too short ({} bytes)",
                frame.len()
            )));
        }
        let flag = FlowStatus::from_repr(frame[0]).ok_or_else(|| {
            TransportError::InvalidFlowControl(format!("unknown flag 0x{:02X}", frame[0]))
        })?;
        if !is_valid_separation_time(frame[2]) {
            log::warn!(
                "Flow control carries reserved separation time 0x{:02X}, using {}ms",
                frame[2],
                MAX_SEPARATION_TIME_MS
            );
        }
        Ok(Self {
            flag,
            block_size: frame[1],
            separation_time: frame[2],
        })
    }

    /// Delay to apply between consecutive frames
    pub fn separation_time(&self) -> Duration {
        separation_time(self.separation_time)
    }

    /// Block size as a limit, [None] meaning unlimited
    pub fn block_limit(&self) -> Option<u8> {
        match self.block_size {
            0 => None,
            bs => Some(bs),
        }
    }

    /// Encodes the frame, padded to `frame_len` with `padding` when given
    pub fn to_bytes(&self, frame_len: usize, padding: Option<u8>) -> Vec<u8> {
        let mut buf = vec![self.flag as u8, self.block_size, self.separation_time];
        if let Some(pad) = padding {
            buf.resize(frame_len.max(buf.len()), pad);
        }
        buf
    }
}

/// Validates the raw flow control parameters and builds an 8 byte, zero padded flow control frame.
///
/// ## Parameters
/// * flag - Raw flag byte, one of 0x30 (CONTINUE), 0x31 (WAIT) or 0x32 (OVERFLOW)
/// * block_size - 0-255, 0 meaning unlimited
/// * separation_time_ms - 0-127ms, or 0xF1-0xF9 (100-900us)
pub fn build_flow_control(
    flag: u8,
    block_size: usize,
    separation_time_ms: u8,
) -> TransportResult<[u8; FLOW_CONTROL_FRAME_LEN]> {
    let flag = FlowStatus::from_repr(flag)
        .ok_or_else(|| TransportError::InvalidFlowControl(format!("unknown flag 0x{flag:02X}")))?;
    let block_size = u8::try_from(block_size).map_err(|_| {
        TransportError::InvalidFlowControl(format!("block size {block_size} exceeds 255"))
    })?;
    let fc = FlowControlFrame::new(flag, block_size, separation_time_ms)?;
    let mut out = [0u8; FLOW_CONTROL_FRAME_LEN];
    out[..3].copy_from_slice(&[fc.flag as u8, fc.block_size, fc.separation_time]);
    Ok(out)
}

/// Flow control knobs of one channel
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FlowControlPolicy {
    /// Flag this side answers a first frame with
    pub flag: FlowStatus,
    /// Block size this side requests from a sender
    pub block_size: u8,
    /// Separation time this side requests from a sender
    pub separation_time_ms: u8,
    /// When true, a first frame is answered with this policy's flow control frame as soon as it
    /// arrives. When false, the caller sends flow control itself with
    /// [crate::channel::TransportChannel::send_flow_control]
    pub frame_control_auto: bool,
}

impl Default for FlowControlPolicy {
    fn default() -> Self {
        Self {
            flag: FlowStatus::Continue,
            block_size: 0,
            separation_time_ms: 0,
            frame_control_auto: true,
        }
    }
}

impl FlowControlPolicy {
    /// Checks the separation time of the policy
    pub fn validate(&self) -> TransportResult<()> {
        FlowControlFrame::new(self.flag, self.block_size, self.separation_time_ms).map(|_| ())
    }

    /// The flow control frame this policy produces
    pub fn to_frame(&self) -> FlowControlFrame {
        FlowControlFrame {
            flag: self.flag,
            block_size: self.block_size,
            separation_time: self.separation_time_ms,
        }
    }

    /// Same policy, but answering with a different flag
    pub fn with_flag(&self, flag: FlowStatus) -> FlowControlFrame {
        FlowControlFrame {
            flag,
            ..self.to_frame()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_continue_frame() {
        let fc = build_flow_control(0x30, 0, 10).unwrap();
        assert_eq!(fc, [0x30, 0x00, 0x0A, 0x00, 0x00, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn build_rejects_invalid_parameters() {
        assert!(matches!(
            build_flow_control(0x33, 0, 0),
            Err(TransportError::InvalidFlowControl(_))
        ));
        assert!(matches!(
            build_flow_control(0x30, 256, 0),
            Err(TransportError::InvalidFlowControl(_))
        ));
        assert!(matches!(
            build_flow_control(0x30, 8, 0x80),
            Err(TransportError::InvalidFlowControl(_))
        ));
        assert!(build_flow_control(0x31, 255, 0xF9).is_ok());
    }

    #[test]
    fn interpret_wait_frame() {
        let fc = FlowControlFrame::interpret(&[0x31, 0x04, 0x14, 0xAA, 0xAA]).unwrap();
        assert_eq!(fc.flag, FlowStatus::Wait);
        assert_eq!(fc.block_limit(), Some(4));
        assert_eq!(fc.separation_time(), Duration::from_millis(20));
    }

    #[test]
    fn interpret_rejects_unknown_flag() {
        assert!(FlowControlFrame::interpret(&[0x3F, 0x00, 0x00]).is_err());
        assert!(FlowControlFrame::interpret(&[0x30, 0x00]).is_err());
    }

    #[test]
    fn flow_status_names() {
        assert_eq!("WAIT".parse::<FlowStatus>(), Ok(FlowStatus::Wait));
        assert!("PAUSE".parse::<FlowStatus>().is_err());
        assert_eq!(FlowStatus::Overflow.to_string(), "OVERFLOW");
    }

    #[test]
    fn separation_time_codes() {
        assert_eq!(separation_time(0x00), Duration::ZERO);
        assert_eq!(separation_time(0x7F), Duration::from_millis(127));
        assert_eq!(separation_time(0xF1), Duration::from_micros(100));
        assert_eq!(separation_time(0xF9), Duration::from_micros(900));
        assert_eq!(separation_time(0xA0), Duration::from_millis(127));
    }

    #[test]
    fn policy_frame_is_padded() {
        let policy = FlowControlPolicy {
            block_size: 2,
            separation_time_ms: 5,
            ..Default::default()
        };
        assert_eq!(
            policy.to_frame().to_bytes(8, Some(0xCC)),
            vec![0x30, 0x02, 0x05, 0xCC, 0xCC, 0xCC, 0xCC, 0xCC]
        );
        assert_eq!(
            policy.with_flag(FlowStatus::Overflow).to_bytes(8, None),
            vec![0x32, 0x02, 0x05]
        );
    }
}
