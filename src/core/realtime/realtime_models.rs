// Realtime topics and the closed set of events they carry.

use crate::core::moderation::{FlaggedMessage, Message};
use serde::{Deserialize, Serialize};

/// Where an event is published.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "room_id", rename_all = "snake_case")]
pub enum Topic {
    /// Accepted messages for one room.
    Room(u64),
    /// Flagged messages across all rooms.
    Moderation,
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Topic::Room(id) => write!(f, "room:{}", id),
            Topic::Moderation => write!(f, "moderation"),
        }
    }
}

impl Topic {
    /// Whether `event` may be delivered on this topic.
    pub fn accepts(&self, event: &Event) -> bool {
        event.topic() == *self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    MessageAccepted { message: Message },
    MessageFlagged { flagged: FlaggedMessage },
}

impl Event {
    /// The only topic this event belongs on.
    pub fn topic(&self) -> Topic {
        match self {
            Event::MessageAccepted { message } => Topic::Room(message.room_id),
            Event::MessageFlagged { .. } => Topic::Moderation,
        }
    }

    /// Store-assigned id of the record the event announces. Increases with
    /// commit order within a topic, so it doubles as a resume position.
    pub fn sequence(&self) -> u64 {
        match self {
            Event::MessageAccepted { message } => message.id,
            Event::MessageFlagged { flagged } => flagged.flag.id,
        }
    }
}
