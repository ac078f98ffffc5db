//! Per-session subscription index
//!
//! Maps channel identifiers to the set of streams the channel listens on.
//! Mutations happen under the session's command lock.

use std::collections::{HashMap, HashSet};

#[derive(Debug, Default)]
pub struct SubscriptionState {
    channels: HashMap<String, HashSet<String>>,
}

impl SubscriptionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_channel(&self, channel: &str) -> bool {
        self.channels.contains_key(channel)
    }

    /// Register a channel. A second add for the same channel is a no-op.
    pub fn add_channel(&mut self, channel: String) {
        self.channels.entry(channel).or_default();
    }

    pub fn remove_channel(&mut self, channel: &str) -> bool {
        self.channels.remove(channel).is_some()
    }

    pub fn add_channel_stream(&mut self, channel: &str, stream: String) {
        if let Some(streams) = self.channels.get_mut(channel) {
            streams.insert(stream);
        }
    }

    pub fn remove_channel_stream(&mut self, channel: &str, stream: &str) {
        if let Some(streams) = self.channels.get_mut(channel) {
            streams.remove(stream);
        }
    }

    /// Drop every stream recorded under a channel, keeping the channel.
    pub fn remove_channel_streams(&mut self, channel: &str) {
        if let Some(streams) = self.channels.get_mut(channel) {
            streams.clear();
        }
    }

    pub fn channels(&self) -> Vec<String> {
        self.channels.keys().cloned().collect()
    }

    pub fn streams_for(&self, channel: &str) -> Vec<String> {
        self.channels
            .get(channel)
            .map(|streams| streams.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has_stream(&self, channel: &str, stream: &str) -> bool {
        self.channels
            .get(channel)
            .is_some_and(|streams| streams.contains(stream))
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}
