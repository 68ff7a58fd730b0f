//! Registry of the open channels of a rig

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use log::{info, warn};

use crate::{
    broker::SignalBroker, channel::TransportChannel, config::ChannelConfig, TransportError,
    TransportResult,
};

/// Owns every [TransportChannel] opened on one broker, keyed by channel name
#[derive(Debug)]
pub struct ChannelRegistry {
    broker: Arc<dyn SignalBroker>,
    channels: Mutex<HashMap<String, Arc<TransportChannel>>>,
}

impl ChannelRegistry {
    /// Creates an empty registry on `broker`
    pub fn new(broker: Arc<dyn SignalBroker>) -> Self {
        Self {
            broker,
            channels: Mutex::new(HashMap::new()),
        }
    }

    fn channels(&self) -> MutexGuard<'_, HashMap<String, Arc<TransportChannel>>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Opens a channel and registers it under its configured name
    pub fn open(&self, config: ChannelConfig) -> TransportResult<Arc<TransportChannel>> {
        let mut channels = self.channels();
        if channels.contains_key(&config.name) {
            return Err(TransportError::DuplicateChannel(config.name));
        }
        let name = config.name.clone();
        let channel = Arc::new(TransportChannel::open(self.broker.clone(), config)?);
        channels.insert(name.clone(), channel.clone());
        info!("Channel '{name}' registered");
        Ok(channel)
    }

    /// Looks up an open channel
    pub fn get(&self, name: &str) -> Option<Arc<TransportChannel>> {
        self.channels().get(name).cloned()
    }

    /// Closes and removes a channel. Returns false if no channel has this name
    pub fn close(&self, name: &str) -> TransportResult<bool> {
        // Not closed under the lock, closing joins the receive worker
        let Some(channel) = self.channels().remove(name) else {
            return Ok(false);
        };
        channel.close()?;
        info!("Channel '{name}' closed");
        Ok(true)
    }

    /// Closes every channel
    pub fn close_all(&self) {
        let channels = self.channels().drain().collect::<Vec<_>>();
        for (name, channel) in channels {
            if let Err(e) = channel.close() {
                warn!("Error closing channel '{name}': {e}");
            }
        }
    }

    /// Names of the open channels, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names = self.channels().keys().cloned().collect::<Vec<_>>();
        names.sort();
        names
    }
}

impl Drop for ChannelRegistry {
    fn drop(&mut self) {
        self.close_all();
    }
}
