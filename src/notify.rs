use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::{Event, ResourceKind};

const CHANNEL_CAPACITY: usize = 256;

/// Change feed: broadcasts booking events to subscribers of a class or teacher.
pub struct NotifyHub {
    channels: DashMap<(ResourceKind, Ulid), broadcast::Sender<Event>>,
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

    /// Subscribe to changes touching a resource. Creates the channel if needed.
    pub fn subscribe(&self, kind: ResourceKind, resource_id: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry((kind, resource_id))
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, kind: ResourceKind, resource_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&(kind, resource_id)) {
            let _ = sender.send(event.clone());
        }
    }

    /// Drop channels whose subscribers have all gone away.
    pub fn prune(&self) {
        self.channels.retain(|_, sender| sender.receiver_count() > 0);
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let teacher = Ulid::new();
        let mut rx = hub.subscribe(ResourceKind::Teacher, teacher);

        let event = Event::BookingDeleted { id: Ulid::new() };
        hub.send(ResourceKind::Teacher, teacher, &event);

        let received = rx.recv().await.unwrap();
        assert_eq!(received, event);
    }

    #[tokio::test]
    async fn channels_are_per_kind() {
        let hub = NotifyHub::new();
        let id = Ulid::new();
        let mut class_rx = hub.subscribe(ResourceKind::Class, id);
        hub.send(ResourceKind::Teacher, id, &Event::BookingDeleted { id });
        assert!(class_rx.try_recv().is_err());
    }

    #[test]
    fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        let rid = Ulid::new();
        hub.send(ResourceKind::Class, rid, &Event::BookingDeleted { id: rid });
        assert_eq!(hub.channel_count(), 0);
    }

    #[test]
    fn prune_drops_abandoned_channels() {
        let hub = NotifyHub::new();
        let rx = hub.subscribe(ResourceKind::Class, Ulid::new());
        let _kept = hub.subscribe(ResourceKind::Teacher, Ulid::new());
        drop(rx);
        hub.prune();
        assert_eq!(hub.channel_count(), 1);
    }
}
