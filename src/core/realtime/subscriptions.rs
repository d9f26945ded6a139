// Subscription manager - live listeners per topic.
//
// Each topic is a bounded broadcast channel created on first subscribe and
// pruned once its last listener unsubscribes, or on the first delivery that
// finds every listener dropped. Events sent while nobody is listening are
// dropped: there is no backlog replay.

use super::realtime_models::{Event, Topic};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::broadcast;

pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SubscriptionError {
    #[error("Subscription dropped after missing {0} events; resync required")]
    Dropped(u64),

    #[error("Event does not belong on topic {0}")]
    TopicMismatch(Topic),
}

/// A listener attached to one topic.
pub struct Subscription {
    id: u64,
    topic: Topic,
    receiver: broadcast::Receiver<Event>,
}

impl Subscription {
    pub fn topic(&self) -> Topic {
        self.topic
    }

    /// Wait for the next event. `Ok(None)` means the topic is gone.
    pub async fn recv(&mut self) -> Result<Option<Event>, SubscriptionError> {
        match self.receiver.recv().await {
            Ok(event) => Ok(Some(event)),
            Err(broadcast::error::RecvError::Closed) => Ok(None),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                Err(SubscriptionError::Dropped(missed))
            }
        }
    }

    /// Non-blocking variant of `recv`. `Ok(None)` means nothing is queued.
    pub fn try_recv(&mut self) -> Result<Option<Event>, SubscriptionError> {
        match self.receiver.try_recv() {
            Ok(event) => Ok(Some(event)),
            Err(broadcast::error::TryRecvError::Empty)
            | Err(broadcast::error::TryRecvError::Closed) => Ok(None),
            Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                Err(SubscriptionError::Dropped(missed))
            }
        }
    }
}

pub struct SubscriptionManager {
    topics: DashMap<Topic, broadcast::Sender<Event>>,
    capacity: usize,
    next_id: AtomicU64,
}

impl SubscriptionManager {
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: DashMap::new(),
            capacity: capacity.max(1),
            next_id: AtomicU64::new(1),
        }
    }

    /// Attach a listener. Only events delivered after this returns reach it.
    pub fn subscribe(&self, topic: Topic) -> Subscription {
        let receiver = self
            .topics
            .entry(topic)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(subscription_id = id, %topic, "Listener attached");

        Subscription {
            id,
            topic,
            receiver,
        }
    }

    /// Detach a listener and prune its topic if nobody else listens.
    pub fn unsubscribe(&self, subscription: Subscription) {
        let topic = subscription.topic;
        let id = subscription.id;
        drop(subscription);

        self.topics
            .remove_if(&topic, |_, sender| sender.receiver_count() == 0);
        tracing::debug!(subscription_id = id, %topic, "Listener detached");
    }

    /// Deliver an event to every current listener of `topic`.
    ///
    /// Returns how many listeners it reached.
    pub fn deliver(&self, topic: Topic, event: Event) -> Result<usize, SubscriptionError> {
        if !topic.accepts(&event) {
            return Err(SubscriptionError::TopicMismatch(topic));
        }

        let reached = match self.topics.get(&topic) {
            // send only fails when there are no receivers left
            Some(sender) => sender.send(event).unwrap_or(0),
            None => return Ok(0),
        };

        // Listeners dropped without `unsubscribe` leave their sender behind.
        if reached == 0 {
            self.topics
                .remove_if(&topic, |_, sender| sender.receiver_count() == 0);
        }
        Ok(reached)
    }

    pub fn listener_count(&self, topic: Topic) -> usize {
        self.topics
            .get(&topic)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }

    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }
}

impl Default for SubscriptionManager {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::moderation::Message;
    use chrono::Utc;

    fn accepted(id: u64, room_id: u64) -> Event {
        Event::MessageAccepted {
            message: Message {
                id,
                room_id,
                author_id: 1,
                content: format!("message {}", id),
                toxicity_score: 0.0,
                is_flagged: false,
                created_at: Utc::now(),
            },
        }
    }

    #[tokio::test]
    async fn delivers_in_publish_order() {
        let manager = SubscriptionManager::default();
        let mut sub = manager.subscribe(Topic::Room(1));

        for id in 1..=3 {
            assert_eq!(manager.deliver(Topic::Room(1), accepted(id, 1)).unwrap(), 1);
        }

        for id in 1..=3 {
            let event = sub.recv().await.unwrap().unwrap();
            assert_eq!(event.sequence(), id);
        }
    }

    #[test]
    fn no_backlog_for_late_subscribers() {
        let manager = SubscriptionManager::default();
        let early = manager.subscribe(Topic::Room(1));
        manager.deliver(Topic::Room(1), accepted(1, 1)).unwrap();

        let mut late = manager.subscribe(Topic::Room(1));
        assert_eq!(late.try_recv().unwrap(), None);
        drop(early);
    }

    #[test]
    fn rejects_events_for_other_topics() {
        let manager = SubscriptionManager::default();
        let _sub = manager.subscribe(Topic::Room(1));

        assert_eq!(
            manager.deliver(Topic::Room(2), accepted(1, 1)),
            Err(SubscriptionError::TopicMismatch(Topic::Room(2)))
        );
        assert_eq!(
            manager.deliver(Topic::Moderation, accepted(1, 1)),
            Err(SubscriptionError::TopicMismatch(Topic::Moderation))
        );
    }

    #[test]
    fn rooms_are_isolated() {
        let manager = SubscriptionManager::default();
        let mut room_one = manager.subscribe(Topic::Room(1));
        let mut room_two = manager.subscribe(Topic::Room(2));

        manager.deliver(Topic::Room(2), accepted(7, 2)).unwrap();

        assert_eq!(room_one.try_recv().unwrap(), None);
        assert_eq!(room_two.try_recv().unwrap().unwrap().sequence(), 7);
    }

    #[test]
    fn unsubscribe_prunes_empty_topics() {
        let manager = SubscriptionManager::default();
        let first = manager.subscribe(Topic::Moderation);
        let second = manager.subscribe(Topic::Moderation);
        assert_eq!(manager.listener_count(Topic::Moderation), 2);

        manager.unsubscribe(first);
        assert_eq!(manager.topic_count(), 1);

        manager.unsubscribe(second);
        assert_eq!(manager.topic_count(), 0);
        assert_eq!(manager.deliver(Topic::Room(5), accepted(1, 5)).unwrap(), 0);
    }

    #[test]
    fn delivery_prunes_topics_whose_listeners_were_dropped() {
        let manager = SubscriptionManager::default();
        let sub = manager.subscribe(Topic::Room(4));
        assert_eq!(manager.topic_count(), 1);

        drop(sub);
        assert_eq!(manager.deliver(Topic::Room(4), accepted(1, 4)).unwrap(), 0);
        assert_eq!(manager.topic_count(), 0);
    }

    #[test]
    fn lagging_listener_is_dropped() {
        let manager = SubscriptionManager::new(2);
        let mut sub = manager.subscribe(Topic::Room(1));

        for id in 1..=5 {
            manager.deliver(Topic::Room(1), accepted(id, 1)).unwrap();
        }

        assert_eq!(sub.try_recv(), Err(SubscriptionError::Dropped(3)));
    }
}
