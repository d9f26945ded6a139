// In-memory implementation of the moderation stores.
//
// Messages and flags live under one lock so ids, timestamps and the
// message+flag pair are assigned in a single critical section. Rooms and
// profiles are reference data and sit in DashMaps.

use crate::core::moderation::{
    validate_score, Directory, FlagEntry, FlagStore, Message, MessageStore, ModerationStore,
    NewMessage, Room, Severity, StoreError,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

#[derive(Default)]
struct ChatLog {
    messages: Vec<Message>,
    flags: Vec<FlagEntry>,
    // message id -> index into `messages`
    message_index: HashMap<u64, usize>,
    // message id -> flag id
    flagged: HashMap<u64, u64>,
    last_timestamp: Option<DateTime<Utc>>,
}

impl ChatLog {
    // Never goes backwards, so insert order and timestamp order agree.
    fn next_timestamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let ts = match self.last_timestamp {
            Some(last) if last > now => last,
            _ => now,
        };
        self.last_timestamp = Some(ts);
        ts
    }

    fn push_message(&mut self, new: NewMessage) -> Result<Message, StoreError> {
        validate_score(new.toxicity_score)?;
        let message = Message {
            id: self.messages.len() as u64 + 1,
            room_id: new.room_id,
            author_id: new.author_id,
            content: new.content,
            toxicity_score: new.toxicity_score,
            is_flagged: new.is_flagged,
            created_at: self.next_timestamp(),
        };
        self.message_index.insert(message.id, self.messages.len());
        self.messages.push(message.clone());
        Ok(message)
    }

    fn check_flaggable(&self, message_id: u64) -> Result<(), StoreError> {
        let index = self
            .message_index
            .get(&message_id)
            .ok_or(StoreError::MessageNotFound(message_id))?;
        if !self.messages[*index].is_flagged {
            return Err(StoreError::NotFlagged(message_id));
        }
        if self.flagged.contains_key(&message_id) {
            return Err(StoreError::AlreadyFlagged(message_id));
        }
        Ok(())
    }

    fn push_flag(&mut self, message_id: u64, severity: Severity) -> FlagEntry {
        let flag = FlagEntry {
            id: self.flags.len() as u64 + 1,
            message_id,
            severity,
            flagged_at: self.next_timestamp(),
        };
        self.flagged.insert(message_id, flag.id);
        self.flags.push(flag.clone());
        flag
    }
}

/// Process-local chat store. Nothing survives a restart.
pub struct InMemoryChatStore {
    log: RwLock<ChatLog>,
    rooms: DashMap<u64, Room>,
    usernames: DashMap<u64, String>,
    next_room_id: AtomicU64,
}

impl InMemoryChatStore {
    pub fn new() -> Self {
        Self {
            log: RwLock::new(ChatLog::default()),
            rooms: DashMap::new(),
            usernames: DashMap::new(),
            next_room_id: AtomicU64::new(1),
        }
    }

    /// Seed a room. Rooms are created out-of-band, never by the pipeline.
    pub fn add_room(&self, name: &str) -> Room {
        if let Some(existing) = self.rooms.iter().find(|entry| entry.name == name) {
            return existing.value().clone();
        }
        let room = Room {
            id: self.next_room_id.fetch_add(1, Ordering::SeqCst),
            name: name.to_string(),
        };
        self.rooms.insert(room.id, room.clone());
        room
    }

    pub fn set_username(&self, author_id: u64, username: &str) {
        self.usernames.insert(author_id, username.to_string());
    }
}

impl Default for InMemoryChatStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageStore for InMemoryChatStore {
    async fn insert_message(&self, message: NewMessage) -> Result<Message, StoreError> {
        self.log.write().await.push_message(message)
    }

    async fn list_messages(&self, room_id: u64) -> Result<Vec<Message>, StoreError> {
        let log = self.log.read().await;
        Ok(log
            .messages
            .iter()
            .filter(|m| m.room_id == room_id)
            .cloned()
            .collect())
    }

    async fn get_message(&self, id: u64) -> Result<Option<Message>, StoreError> {
        let log = self.log.read().await;
        Ok(log
            .message_index
            .get(&id)
            .map(|index| log.messages[*index].clone()))
    }

    async fn count_messages(&self, room_id: u64) -> Result<u64, StoreError> {
        let log = self.log.read().await;
        Ok(log.messages.iter().filter(|m| m.room_id == room_id).count() as u64)
    }
}

#[async_trait]
impl FlagStore for InMemoryChatStore {
    async fn insert_flag(
        &self,
        message_id: u64,
        severity: Severity,
    ) -> Result<FlagEntry, StoreError> {
        let mut log = self.log.write().await;
        log.check_flaggable(message_id)?;
        Ok(log.push_flag(message_id, severity))
    }

    async fn list_flags(&self, limit: usize) -> Result<Vec<FlagEntry>, StoreError> {
        let log = self.log.read().await;
        Ok(log.flags.iter().rev().take(limit).cloned().collect())
    }

    async fn get_flag_by_id(&self, id: u64) -> Result<Option<FlagEntry>, StoreError> {
        let log = self.log.read().await;
        Ok(log.flags.iter().find(|f| f.id == id).cloned())
    }
}

#[async_trait]
impl ModerationStore for InMemoryChatStore {
    async fn insert_flagged_message(
        &self,
        message: NewMessage,
        severity: Severity,
    ) -> Result<(Message, FlagEntry), StoreError> {
        if !message.is_flagged {
            return Err(StoreError::StorageError(
                "insert_flagged_message called with an unflagged message".to_string(),
            ));
        }
        let mut log = self.log.write().await;
        let message = log.push_message(message)?;
        let flag = log.push_flag(message.id, severity);
        Ok((message, flag))
    }
}

#[async_trait]
impl Directory for InMemoryChatStore {
    async fn get_room(&self, id: u64) -> Result<Option<Room>, StoreError> {
        Ok(self.rooms.get(&id).map(|room| room.clone()))
    }

    async fn list_rooms(&self) -> Result<Vec<Room>, StoreError> {
        let mut rooms: Vec<Room> = self.rooms.iter().map(|room| room.clone()).collect();
        rooms.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        Ok(rooms)
    }

    async fn get_username(&self, author_id: u64) -> Result<Option<String>, StoreError> {
        Ok(self.usernames.get(&author_id).map(|name| name.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_message(room_id: u64, content: &str, flagged: bool) -> NewMessage {
        NewMessage {
            room_id,
            author_id: 1,
            content: content.to_string(),
            toxicity_score: if flagged { 0.7 } else { 0.0 },
            is_flagged: flagged,
        }
    }

    #[tokio::test]
    async fn messages_are_listed_per_room_in_insert_order() {
        let store = InMemoryChatStore::new();
        store.insert_message(new_message(1, "a", false)).await.unwrap();
        store.insert_message(new_message(2, "b", false)).await.unwrap();
        store.insert_message(new_message(1, "c", false)).await.unwrap();

        let room_one = store.list_messages(1).await.unwrap();
        let contents: Vec<&str> = room_one.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["a", "c"]);
        assert!(room_one[0].created_at <= room_one[1].created_at);
        assert_eq!(store.count_messages(2).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn rejects_scores_outside_unit_interval() {
        let store = InMemoryChatStore::new();
        let mut message = new_message(1, "x", false);
        message.toxicity_score = 1.5;

        let err = store.insert_message(message).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidScore(_)));
        assert_eq!(store.count_messages(1).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn flagged_insert_writes_both_records() {
        let store = InMemoryChatStore::new();
        let (message, flag) = store
            .insert_flagged_message(new_message(1, "rude", true), Severity::Medium)
            .await
            .unwrap();

        assert_eq!(flag.message_id, message.id);
        assert_eq!(store.get_flag_by_id(flag.id).await.unwrap(), Some(flag));
        assert_eq!(store.get_message(message.id).await.unwrap(), Some(message));
    }

    #[tokio::test]
    async fn insert_flag_enforces_one_flag_per_flagged_message() {
        let store = InMemoryChatStore::new();
        let clean = store.insert_message(new_message(1, "ok", false)).await.unwrap();
        let rude = store.insert_message(new_message(1, "rude", true)).await.unwrap();

        assert!(matches!(
            store.insert_flag(clean.id, Severity::Low).await,
            Err(StoreError::NotFlagged(_))
        ));
        assert!(matches!(
            store.insert_flag(99, Severity::Low).await,
            Err(StoreError::MessageNotFound(99))
        ));

        store.insert_flag(rude.id, Severity::Low).await.unwrap();
        assert!(matches!(
            store.insert_flag(rude.id, Severity::High).await,
            Err(StoreError::AlreadyFlagged(_))
        ));
    }

    #[tokio::test]
    async fn failed_flagged_insert_leaves_nothing_behind() {
        let store = InMemoryChatStore::new();
        let mut message = new_message(1, "rude", true);
        message.toxicity_score = -1.0;

        assert!(store
            .insert_flagged_message(message, Severity::Low)
            .await
            .is_err());
        assert_eq!(store.count_messages(1).await.unwrap(), 0);
        assert!(store.list_flags(50).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rooms_are_listed_by_name() {
        let store = InMemoryChatStore::new();
        store.add_room("random");
        let general = store.add_room("general");
        assert_eq!(store.add_room("general"), general);

        let names: Vec<String> = store
            .list_rooms()
            .await
            .unwrap()
            .into_iter()
            .map(|room| room.name)
            .collect();
        assert_eq!(names, vec!["general", "random"]);
    }
}
