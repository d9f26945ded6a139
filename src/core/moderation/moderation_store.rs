// Storage ports for the moderation pipeline.
//
// The core defines WHAT it needs; infra provides SQLite and in-memory
// implementations. All stores are append-only: nothing here updates or
// deletes a message or a flag.

use super::moderation_models::{FlagEntry, Message, NewMessage, Room, Severity};
use async_trait::async_trait;
use thiserror::Error;

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Message {0} not found")]
    MessageNotFound(u64),

    #[allow(dead_code)]
    #[error("Message {0} is not flagged")]
    NotFlagged(u64),

    #[allow(dead_code)]
    #[error("Message {0} already has a flag entry")]
    AlreadyFlagged(u64),

    #[error("Toxicity score {0} is outside [0, 1]")]
    InvalidScore(f64),
}

/// Reject scores that would break the stored-score invariant.
pub fn validate_score(score: f64) -> Result<(), StoreError> {
    if (0.0..=1.0).contains(&score) {
        Ok(())
    } else {
        Err(StoreError::InvalidScore(score))
    }
}

// ============================================================================
// STORAGE TRAITS (PORTS)
// ============================================================================

/// Append-only record of accepted messages, per room, in arrival order.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Insert a message. The store assigns `id` and `created_at`; both
    /// increase with insert order.
    async fn insert_message(&self, message: NewMessage) -> Result<Message, StoreError>;

    /// All messages in a room, oldest first.
    async fn list_messages(&self, room_id: u64) -> Result<Vec<Message>, StoreError>;

    async fn get_message(&self, id: u64) -> Result<Option<Message>, StoreError>;

    async fn count_messages(&self, room_id: u64) -> Result<u64, StoreError>;
}

/// Append-only log of moderation entries.
#[async_trait]
pub trait FlagStore: Send + Sync {
    /// Flag an existing, flagged message that has no entry yet.
    #[allow(dead_code)]
    async fn insert_flag(&self, message_id: u64, severity: Severity)
        -> Result<FlagEntry, StoreError>;

    /// Most recent entries first, at most `limit`.
    async fn list_flags(&self, limit: usize) -> Result<Vec<FlagEntry>, StoreError>;

    async fn get_flag_by_id(&self, id: u64) -> Result<Option<FlagEntry>, StoreError>;
}

/// Both stores together, with the one write that must touch both atomically.
#[async_trait]
pub trait ModerationStore: MessageStore + FlagStore {
    /// Insert a flagged message and its flag entry as one unit: either both
    /// are visible afterwards or neither is.
    async fn insert_flagged_message(
        &self,
        message: NewMessage,
        severity: Severity,
    ) -> Result<(Message, FlagEntry), StoreError>;
}

/// Read-only reference data owned by the surrounding application.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn get_room(&self, id: u64) -> Result<Option<Room>, StoreError>;

    /// All rooms, ordered by name.
    async fn list_rooms(&self) -> Result<Vec<Room>, StoreError>;

    async fn get_username(&self, author_id: u64) -> Result<Option<String>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_bounds_are_inclusive() {
        assert!(validate_score(0.0).is_ok());
        assert!(validate_score(1.0).is_ok());
        assert!(matches!(validate_score(1.01), Err(StoreError::InvalidScore(_))));
        assert!(validate_score(-0.01).is_err());
        assert!(validate_score(f64::NAN).is_err());
    }
}
