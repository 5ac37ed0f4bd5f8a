//! Subscription Index
//!
//! Channel name → subscribed identities. Owned by the hub loop; nothing else
//! holds a reference to it. Channel names are matched exactly and
//! case-sensitively. A channel whose last subscriber leaves is dropped.

use std::collections::{HashMap, HashSet};

use crate::auth::Identity;

#[derive(Debug, Default)]
pub struct SubscriptionIndex {
    channels: HashMap<String, HashSet<Identity>>,
}

impl SubscriptionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if `identity` was not already subscribed
    pub fn subscribe(&mut self, channel: &str, identity: &Identity) -> bool {
        self.channels
            .entry(channel.to_string())
            .or_default()
            .insert(identity.clone())
    }

    /// Returns true if `identity` was subscribed
    pub fn unsubscribe(&mut self, channel: &str, identity: &Identity) -> bool {
        let Some(subscribers) = self.channels.get_mut(channel) else {
            return false;
        };
        let removed = subscribers.remove(identity);
        if subscribers.is_empty() {
            self.channels.remove(channel);
        }
        removed
    }

    /// Remove `identity` from every channel, returning how many it left
    pub fn remove_everywhere(&mut self, identity: &Identity) -> usize {
        let mut removed = 0;
        self.channels.retain(|_, subscribers| {
            if subscribers.remove(identity) {
                removed += 1;
            }
            !subscribers.is_empty()
        });
        removed
    }

    /// Snapshot of the identities subscribed to `channel`
    pub fn subscribers(&self, channel: &str) -> Vec<Identity> {
        self.channels
            .get(channel)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_subscribed(&self, channel: &str, identity: &Identity) -> bool {
        self.channels
            .get(channel)
            .is_some_and(|s| s.contains(identity))
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Total (channel, identity) pairs
    pub fn subscription_count(&self) -> usize {
        self.channels.values().map(HashSet::len).sum()
    }

    /// Channel names, for prefix scans
    pub fn channels(&self) -> impl Iterator<Item = &str> {
        self.channels.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> Identity {
        Identity::from(s)
    }

    #[test]
    fn test_subscribe_is_idempotent() {
        let mut index = SubscriptionIndex::new();
        assert!(index.subscribe("orders:42", &id("a")));
        assert!(!index.subscribe("orders:42", &id("a")));
        assert_eq!(index.subscription_count(), 1);
        assert_eq!(index.subscribers("orders:42"), vec![id("a")]);
    }

    #[test]
    fn test_channels_are_case_sensitive() {
        let mut index = SubscriptionIndex::new();
        index.subscribe("Orders:42", &id("a"));
        assert!(index.subscribers("orders:42").is_empty());
        assert!(index.is_subscribed("Orders:42", &id("a")));
    }

    #[test]
    fn test_unsubscribe_drops_empty_channel() {
        let mut index = SubscriptionIndex::new();
        index.subscribe("orders:42", &id("a"));
        index.subscribe("orders:42", &id("b"));

        assert!(index.unsubscribe("orders:42", &id("a")));
        assert_eq!(index.channel_count(), 1);
        assert!(index.unsubscribe("orders:42", &id("b")));
        assert_eq!(index.channel_count(), 0);
        assert!(!index.unsubscribe("orders:42", &id("b")));
    }

    #[test]
    fn test_remove_everywhere() {
        let mut index = SubscriptionIndex::new();
        index.subscribe("orders:42", &id("a"));
        index.subscribe("orders:99", &id("a"));
        index.subscribe("orders:99", &id("b"));

        assert_eq!(index.remove_everywhere(&id("a")), 2);
        assert_eq!(index.channel_count(), 1);
        assert!(!index.is_subscribed("orders:42", &id("a")));
        assert!(!index.is_subscribed("orders:99", &id("a")));
        assert_eq!(index.subscribers("orders:99"), vec![id("b")]);
        assert_eq!(index.remove_everywhere(&id("a")), 0);
    }
}
