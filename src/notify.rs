use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::model::Event;
use crate::store::Scope;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for change notifications, one channel per watched scope.
///
/// A channel exists only while somebody holds a receiver for it; idle
/// channels are dropped by [`NotifyHub::release`] or on the next send.
pub struct NotifyHub {
    channels: DashMap<Scope, broadcast::Sender<Event>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to changes under a scope. Creates the channel if needed.
    pub fn subscribe(&self, scope: Scope) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(scope)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Fan an event out to its date channel and the whole-tree channel.
    pub fn send(&self, event: &Event) {
        for scope in [Scope::Date(event.key().date), Scope::All] {
            let delivered = match self.channels.get(&scope) {
                Some(sender) => sender.send(event.clone()).is_ok(),
                None => continue,
            };
            if !delivered {
                self.release(&scope);
            }
        }
    }

    /// Drop the channel for a scope if it has no receivers left.
    pub fn release(&self, scope: &Scope) {
        self.channels
            .remove_if(scope, |_, sender| sender.receiver_count() == 0);
    }

    /// Number of live channels.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}
