//! Signal broker interface
//!
//! The rig's signal broker forwards raw CAN frames between the test framework and the bus.
//! Frames are addressed out-of-band by signal name and namespace, and every published or
//! received payload is exactly one CAN frame.

use std::{fmt, sync::mpsc};

use crate::TransportResult;

pub mod simulation;

/// A signal on the broker
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SignalId {
    /// Signal name, EG: 'Vcu1ToAllFuncFront1DiagReqFrame'
    pub name: String,
    /// Namespace (bus) the signal lives on
    pub namespace: String,
}

impl SignalId {
    /// Creates a signal id
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
        }
    }
}

impl fmt::Display for SignalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Stream of raw frames received on a subscribed signal.
///
/// The stream ends (the sender is dropped) when the broker ends the subscription
pub type Subscription = mpsc::Receiver<Vec<u8>>;

/// Publish/subscribe access to CAN signals
pub trait SignalBroker: Send + Sync + fmt::Debug {
    /// Publishes one raw CAN frame on a signal
    fn publish(&self, signal: &SignalId, frame: &[u8]) -> TransportResult<()>;

    /// Subscribes to a signal
    fn subscribe(&self, signal: &SignalId) -> TransportResult<Subscription>;

    /// Ends every subscription to a signal
    fn unsubscribe(&self, signal: &SignalId) -> TransportResult<()>;
}
