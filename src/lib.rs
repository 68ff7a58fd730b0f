#![warn(
    missing_docs,
    missing_debug_implementations,
    missing_copy_implementations,
    trivial_numeric_casts,
    unused_import_braces,
    unused_qualifications,
    clippy::uninlined_format_args
)]

//! A crate which provides an ISO-TP (ISO 15765-2) transport engine for
//! Hardware-In-the-Loop rigs that talk UDS (ISO 14229) to ECUs through a CAN signal broker.
//!
//! ## Layers
//!
//! The crate is built bottom-up:
//!
//! * [frame] - Stateless encoding and decoding of Single, First, Consecutive and Flow Control frames
//! * [flow_control] - Flow control frames and the per-channel flow control policy
//! * [send_session] - Outbound multi-frame state machine (FF, FC handshake, CF blocks)
//! * [reassembler] - Inbound reassembly state machine (SF/FF/CF into complete messages)
//! * [channel] - [channel::TransportChannel], which owns one of each of the above per signal pair
//!   and runs the background receive worker
//! * [registry] - Owns every open channel of a rig, keyed by channel name
//!
//! The signal broker itself (publish/subscribe of raw CAN frames) is an external collaborator,
//! described by the [broker::SignalBroker] trait. An in-memory [broker::simulation::SimulatedBroker]
//! is provided for bench setups and unit testing.
//!
//! ## Example
//!
//! ```rust
//! use std::{sync::Arc, time::Duration};
//! use hil_isotp::{broker::simulation::SimulatedBroker, channel::TransportChannel, config::ChannelConfig};
//!
//! let broker = Arc::new(SimulatedBroker::new());
//! let tester = TransportChannel::open(broker.clone(), ChannelConfig::new("tester", "TesterReq", "EcuResp", "DiagNs")).unwrap();
//! let ecu = TransportChannel::open(broker, ChannelConfig::new("ecu", "EcuResp", "TesterReq", "DiagNs")).unwrap();
//!
//! let request = (0..64).collect::<Vec<u8>>();
//! tester.send(&request).unwrap();
//! assert_eq!(request, ecu.wait_message(Duration::from_secs(1)).unwrap());
//! ```

pub mod broker;
pub mod channel;
pub mod config;
pub mod flow_control;
pub mod frame;
pub mod reassembler;
pub mod registry;
pub mod send_session;

/// Transport result
pub type TransportResult<T> = Result<T, TransportError>;

/// ISO-TP timer which expired
#[derive(Debug, Copy, Clone, PartialEq, Eq, strum_macros::Display)]
pub enum TimeoutKind {
    /// N_Bs - Sender waiting for a flow control frame
    #[strum(serialize = "N_Bs")]
    FlowControl,
    /// N_Cr - Receiver waiting for the next consecutive frame
    #[strum(serialize = "N_Cr")]
    ConsecutiveFrame,
    /// Caller waiting for a complete message
    #[strum(serialize = "response")]
    Message,
}

/// Protocol violation observed on the wire
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolViolation {
    /// A flow control frame arrived while no transmission was waiting for one
    #[error("unexpected flow control frame")]
    UnexpectedFlowControl,
    /// A consecutive frame arrived without a preceding first frame
    #[error("consecutive frame without a preceding first frame")]
    UnexpectedConsecutiveFrame,
    /// Consecutive frame sequence counter did not match
    #[error("sequence mismatch, expected 0x{expected:X}, received 0x{received:X}")]
    SequenceMismatch {
        /// Sequence counter the reassembler expected
        expected: u8,
        /// Sequence counter found in the frame
        received: u8,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
/// Transport error
pub enum TransportError {
    /// Frame could not be parsed, or a frame could not be built from the input
    #[error("Malformed ISO-TP frame: {0}")]
    MalformedFrame(&'static str),
    /// Flow control frame has an invalid flag, block size or separation time
    #[error("Invalid flow control: {0}")]
    InvalidFlowControl(String),
    /// Timer expired before the peer responded
    #[error("Channel timeout ({0})")]
    ChannelTimeout(TimeoutKind),
    /// Peer violated the protocol
    #[error("Protocol violation: {0}")]
    ProtocolViolation(#[from] ProtocolViolation),
    /// Receiver answered with an OVERFLOW flow control frame
    #[error("Receiver aborted the transfer with flow control OVERFLOW")]
    OverflowAbort,
    /// Receiver kept answering with WAIT beyond the configured limit
    #[error("Receiver sent more than {0} WAIT flow control frames")]
    WaitLimitExceeded(u8),
    /// Payload cannot be carried by the transport
    #[error("Payload of {len} bytes exceeds the limit of {max} bytes")]
    PayloadTooLarge {
        /// Payload length
        len: usize,
        /// Maximum allowed length
        max: usize,
    },
    /// Empty payloads cannot be sent
    #[error("Payload is empty")]
    EmptyPayload,
    /// Channel configuration was rejected
    #[error("Invalid channel configuration: {0}")]
    InvalidConfig(String),
    /// A channel with the same name is already registered
    #[error("Channel '{0}' is already open")]
    DuplicateChannel(String),
    /// Operation is not allowed in the current state
    #[error("Not allowed in state {0}")]
    InvalidState(String),
    /// The channel was closed
    #[error("Channel is closed")]
    ChannelClosed,
    /// Error reported by the signal broker
    #[error("Signal broker error: {0}")]
    Broker(String),
}
