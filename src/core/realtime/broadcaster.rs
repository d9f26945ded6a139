// Fan-out broadcaster and the snapshot + tail feed built on top of it.

use super::realtime_models::{Event, Topic};
use super::subscriptions::{Subscription, SubscriptionError, SubscriptionManager};
use std::sync::Arc;

/// Publishes committed records to their topic.
#[derive(Clone)]
pub struct Broadcaster {
    subscriptions: Arc<SubscriptionManager>,
}

impl Broadcaster {
    pub fn new(subscriptions: Arc<SubscriptionManager>) -> Self {
        Self { subscriptions }
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionManager> {
        &self.subscriptions
    }

    /// Route an event to the topic it belongs on.
    ///
    /// Returns how many listeners received it. Events with no listeners are
    /// not kept anywhere.
    pub fn publish(&self, event: Event) -> usize {
        let topic = event.topic();
        let sequence = event.sequence();
        match self.subscriptions.deliver(topic, event) {
            Ok(reached) => {
                tracing::debug!(%topic, sequence, reached, "Event published");
                reached
            }
            Err(err) => {
                // Unreachable while topics are derived from the event itself.
                tracing::error!(%topic, sequence, "Failed to publish event: {}", err);
                0
            }
        }
    }
}

/// Live tail of a topic that skips anything already covered by a snapshot.
pub struct LiveFeed {
    subscription: Subscription,
    high_water: u64,
}

impl LiveFeed {
    /// `high_water` is the largest record id contained in the snapshot
    /// fetched after `subscription` was attached.
    pub fn new(subscription: Subscription, high_water: u64) -> Self {
        Self {
            subscription,
            high_water,
        }
    }

    pub fn topic(&self) -> Topic {
        self.subscription.topic()
    }

    pub fn high_water(&self) -> u64 {
        self.high_water
    }

    /// Next event not already in the snapshot. `Ok(None)` means the topic
    /// closed; `Err(Dropped)` means the caller must resync.
    ///
    /// The high-water mark stays fixed at the snapshot because concurrent
    /// publishers may deliver ids out of order.
    pub async fn next(&mut self) -> Result<Option<Event>, SubscriptionError> {
        loop {
            match self.subscription.recv().await? {
                Some(event) if event.sequence() <= self.high_water => continue,
                Some(event) => return Ok(Some(event)),
                None => return Ok(None),
            }
        }
    }

    /// Non-blocking variant of `next`.
    #[allow(dead_code)]
    pub fn try_next(&mut self) -> Result<Option<Event>, SubscriptionError> {
        loop {
            match self.subscription.try_recv()? {
                Some(event) if event.sequence() <= self.high_water => continue,
                Some(event) => return Ok(Some(event)),
                None => return Ok(None),
            }
        }
    }

    pub fn into_subscription(self) -> Subscription {
        self.subscription
    }
}

/// Current state of a topic plus the live tail that continues it.
pub struct FeedSnapshot<T> {
    pub items: Vec<T>,
    pub live: LiveFeed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::moderation::Message;
    use chrono::Utc;

    fn accepted(id: u64) -> Event {
        Event::MessageAccepted {
            message: Message {
                id,
                room_id: 3,
                author_id: 1,
                content: "hi".to_string(),
                toxicity_score: 0.0,
                is_flagged: false,
                created_at: Utc::now(),
            },
        }
    }

    #[test]
    fn publish_routes_by_event_topic() {
        let manager = Arc::new(SubscriptionManager::default());
        let broadcaster = Broadcaster::new(Arc::clone(&manager));
        let mut room = manager.subscribe(Topic::Room(3));
        let mut moderation = manager.subscribe(Topic::Moderation);

        assert_eq!(broadcaster.publish(accepted(1)), 1);

        assert_eq!(room.try_recv().unwrap().unwrap().sequence(), 1);
        assert_eq!(moderation.try_recv().unwrap(), None);
    }

    #[test]
    fn publish_without_listeners_reaches_nobody() {
        let broadcaster = Broadcaster::new(Arc::new(SubscriptionManager::default()));
        assert_eq!(broadcaster.publish(accepted(1)), 0);
    }

    #[test]
    fn live_feed_skips_snapshot_records() {
        let manager = Arc::new(SubscriptionManager::default());
        let broadcaster = Broadcaster::new(Arc::clone(&manager));
        let mut feed = LiveFeed::new(manager.subscribe(Topic::Room(3)), 2);

        // Late publishes for records already in the snapshot
        broadcaster.publish(accepted(2));
        broadcaster.publish(accepted(1));
        broadcaster.publish(accepted(3));

        assert_eq!(feed.try_next().unwrap().unwrap().sequence(), 3);
        assert_eq!(feed.try_next().unwrap(), None);
        assert_eq!(feed.high_water(), 2);
    }
}
