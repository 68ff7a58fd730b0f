//! In-memory signal broker for bench setups and unit testing

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Mutex, PoisonError,
    },
};

use super::{SignalBroker, SignalId, Subscription};
use crate::{TransportError, TransportResult};

/// Broker which loops every published frame back to the subscribers of the same signal,
/// and keeps a log of everything published
#[derive(Debug, Default)]
pub struct SimulatedBroker {
    subscribers: Mutex<HashMap<SignalId, Vec<mpsc::Sender<Vec<u8>>>>>,
    published: Mutex<Vec<(SignalId, Vec<u8>)>>,
    fail_publish: AtomicBool,
}

impl SimulatedBroker {
    /// Creates a broker without subscribers
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames published on `signal` so far, oldest first
    pub fn published(&self, signal: &SignalId) -> Vec<Vec<u8>> {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(s, _)| s == signal)
            .map(|(_, f)| f.clone())
            .collect()
    }

    /// Forgets the publish log
    pub fn clear_log(&self) {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Makes every following publish fail, to emulate a broken broker connection
    pub fn set_publish_failure(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::Relaxed);
    }

    /// Number of live subscriptions on `signal`
    pub fn subscriber_count(&self, signal: &SignalId) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(signal)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

impl SignalBroker for SimulatedBroker {
    fn publish(&self, signal: &SignalId, frame: &[u8]) -> TransportResult<()> {
        if self.fail_publish.load(Ordering::Relaxed) {
            return Err(TransportError::Broker(format!("publish on {signal} rejected")));
        }
        log::debug!("{signal} <- {frame:02X?}");
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((signal.clone(), frame.to_vec()));
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(senders) = subscribers.get_mut(signal) {
            senders.retain(|tx| tx.send(frame.to_vec()).is_ok());
        }
        Ok(())
    }

    fn subscribe(&self, signal: &SignalId) -> TransportResult<Subscription> {
        let (tx, rx) = mpsc::channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(signal.clone())
            .or_default()
            .push(tx);
        Ok(rx)
    }

    fn unsubscribe(&self, signal: &SignalId) -> TransportResult<()> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(signal);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_reaches_subscribers() {
        let broker = SimulatedBroker::new();
        let signal = SignalId::new("EcuResp", "Diag");
        let sub = broker.subscribe(&signal).unwrap();
        broker.publish(&signal, &[0x02, 0x7E, 0x00]).unwrap();
        broker
            .publish(&SignalId::new("Other", "Diag"), &[0x01])
            .unwrap();
        assert_eq!(sub.try_recv().unwrap(), vec![0x02, 0x7E, 0x00]);
        assert!(sub.try_recv().is_err());
        assert_eq!(broker.published(&signal).len(), 1);
    }

    #[test]
    fn unsubscribe_ends_stream() {
        let broker = SimulatedBroker::new();
        let signal = SignalId::new("EcuResp", "Diag");
        let sub = broker.subscribe(&signal).unwrap();
        assert_eq!(broker.subscriber_count(&signal), 1);
        broker.unsubscribe(&signal).unwrap();
        assert_eq!(broker.subscriber_count(&signal), 0);
        assert_eq!(sub.recv(), Err(mpsc::RecvError));
    }

    #[test]
    fn publish_failure() {
        let broker = SimulatedBroker::new();
        broker.set_publish_failure(true);
        assert!(matches!(
            broker.publish(&SignalId::new("A", "B"), &[0x01, 0x3E]),
            Err(TransportError::Broker(_))
        ));
    }
}
