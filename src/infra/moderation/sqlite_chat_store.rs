// SQLite-backed chat store for persistent messages and moderation records.
//
// Tables:
// - chat_rooms: Rooms (reference data, seeded out-of-band)
// - profiles: Author display names (reference data)
// - messages: Accepted messages, append-only
// - flagged_messages: One moderation entry per flagged message, append-only
//
// Timestamps are stored as microseconds since the epoch. Each insert takes
// max(now, newest stored timestamp) inside the write, so timestamp order and
// id order never disagree.

use crate::core::moderation::{
    validate_score, Directory, FlagEntry, FlagStore, Message, MessageStore, ModerationStore,
    NewMessage, Room, Severity, StoreError,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, Row, Sqlite, SqliteConnection};
use std::path::Path;

pub struct SqliteChatStore {
    pool: Pool<Sqlite>,
}

fn storage_error(e: sqlx::Error) -> StoreError {
    StoreError::StorageError(e.to_string())
}

fn from_micros(micros: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_micros(micros).unwrap_or_else(Utc::now)
}

fn message_from_row(row: &SqliteRow) -> Message {
    Message {
        id: row.get::<i64, _>("id") as u64,
        room_id: row.get::<i64, _>("room_id") as u64,
        author_id: row.get::<i64, _>("user_id") as u64,
        content: row.get("content"),
        toxicity_score: row.get("toxicity_score"),
        is_flagged: row.get("is_flagged"),
        created_at: from_micros(row.get("created_at")),
    }
}

fn flag_from_row(row: &SqliteRow) -> Result<FlagEntry, StoreError> {
    let severity_str: String = row.get("severity");
    let severity = Severity::parse(&severity_str).ok_or_else(|| {
        StoreError::StorageError(format!("unknown severity '{}' in store", severity_str))
    })?;
    Ok(FlagEntry {
        id: row.get::<i64, _>("id") as u64,
        message_id: row.get::<i64, _>("message_id") as u64,
        severity,
        flagged_at: from_micros(row.get("flagged_at")),
    })
}

impl SqliteChatStore {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    /// Open (creating if needed) the database at `database_url` and migrate it.
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let in_memory = database_url.contains(":memory:");
        let path_str = database_url.trim_start_matches("sqlite://");
        if !in_memory {
            if let Some(parent) = Path::new(path_str).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
        }

        let conn_str = if database_url.starts_with("sqlite:") {
            if in_memory || database_url.contains('?') {
                database_url.to_string()
            } else {
                format!("{}?mode=rwc", database_url)
            }
        } else {
            format!("sqlite://{}?mode=rwc", database_url)
        };

        // Every connection to :memory: gets its own database, so keep one.
        let max_connections = if in_memory { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(&conn_str)
            .await?;

        let store = Self::new(pool);
        store.migrate().await?;
        Ok(store)
    }

    /// Run database migrations to create required tables.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chat_rooms (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS profiles (
                user_id INTEGER PRIMARY KEY,
                username TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                room_id INTEGER NOT NULL REFERENCES chat_rooms(id),
                user_id INTEGER NOT NULL,
                content TEXT NOT NULL,
                toxicity_score REAL NOT NULL
                    CHECK (toxicity_score >= 0 AND toxicity_score <= 1),
                is_flagged BOOLEAN NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_room ON messages(room_id, created_at, id)",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS flagged_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                message_id INTEGER NOT NULL UNIQUE REFERENCES messages(id),
                severity TEXT NOT NULL CHECK (severity IN ('low', 'medium', 'high')),
                flagged_at INTEGER NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_flagged_messages_time ON flagged_messages(flagged_at, id)",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;

        Ok(())
    }

    /// Seed a room, returning the existing one if the name is taken.
    pub async fn create_room(&self, name: &str) -> Result<Room, StoreError> {
        sqlx::query("INSERT INTO chat_rooms (name) VALUES (?) ON CONFLICT(name) DO NOTHING")
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(storage_error)?;

        let row = sqlx::query("SELECT id, name FROM chat_rooms WHERE name = ?")
            .bind(name)
            .fetch_one(&self.pool)
            .await
            .map_err(storage_error)?;

        Ok(Room {
            id: row.get::<i64, _>("id") as u64,
            name: row.get("name"),
        })
    }

    pub async fn upsert_profile(&self, author_id: u64, username: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO profiles (user_id, username)
            VALUES (?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                username = excluded.username
            "#,
        )
        .bind(author_id as i64)
        .bind(username)
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;
        Ok(())
    }

    async fn insert_message_on(
        conn: &mut SqliteConnection,
        message: NewMessage,
    ) -> Result<Message, StoreError> {
        validate_score(message.toxicity_score)?;

        let row = sqlx::query(
            r#"
            INSERT INTO messages (room_id, user_id, content, toxicity_score, is_flagged, created_at)
            SELECT ?, ?, ?, ?, ?, MAX(?, COALESCE(MAX(created_at), 0)) FROM messages
            RETURNING id, created_at
            "#,
        )
        .bind(message.room_id as i64)
        .bind(message.author_id as i64)
        .bind(&message.content)
        .bind(message.toxicity_score)
        .bind(message.is_flagged)
        .bind(Utc::now().timestamp_micros())
        .fetch_one(&mut *conn)
        .await
        .map_err(storage_error)?;

        Ok(Message {
            id: row.get::<i64, _>("id") as u64,
            room_id: message.room_id,
            author_id: message.author_id,
            content: message.content,
            toxicity_score: message.toxicity_score,
            is_flagged: message.is_flagged,
            created_at: from_micros(row.get("created_at")),
        })
    }

    async fn insert_flag_on(
        conn: &mut SqliteConnection,
        message_id: u64,
        severity: Severity,
    ) -> Result<FlagEntry, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO flagged_messages (message_id, severity, flagged_at)
            SELECT ?, ?, MAX(?, COALESCE(MAX(flagged_at), 0)) FROM flagged_messages
            RETURNING id, flagged_at
            "#,
        )
        .bind(message_id as i64)
        .bind(severity.as_str())
        .bind(Utc::now().timestamp_micros())
        .fetch_one(&mut *conn)
        .await
        .map_err(storage_error)?;

        Ok(FlagEntry {
            id: row.get::<i64, _>("id") as u64,
            message_id,
            severity,
            flagged_at: from_micros(row.get("flagged_at")),
        })
    }
}

#[async_trait]
impl MessageStore for SqliteChatStore {
    async fn insert_message(&self, message: NewMessage) -> Result<Message, StoreError> {
        let mut conn = self.pool.acquire().await.map_err(storage_error)?;
        Self::insert_message_on(&mut conn, message).await
    }

    async fn list_messages(&self, room_id: u64) -> Result<Vec<Message>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, room_id, user_id, content, toxicity_score, is_flagged, created_at
            FROM messages
            WHERE room_id = ?
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(room_id as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_error)?;

        Ok(rows.iter().map(message_from_row).collect())
    }

    async fn get_message(&self, id: u64) -> Result<Option<Message>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, room_id, user_id, content, toxicity_score, is_flagged, created_at
            FROM messages
            WHERE id = ?
            "#,
        )
        .bind(id as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_error)?;

        Ok(row.as_ref().map(message_from_row))
    }

    async fn count_messages(&self, room_id: u64) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS total FROM messages WHERE room_id = ?")
            .bind(room_id as i64)
            .fetch_one(&self.pool)
            .await
            .map_err(storage_error)?;

        Ok(row.get::<i64, _>("total") as u64)
    }
}

#[async_trait]
impl FlagStore for SqliteChatStore {
    async fn insert_flag(
        &self,
        message_id: u64,
        severity: Severity,
    ) -> Result<FlagEntry, StoreError> {
        let mut tx = self.pool.begin().await.map_err(storage_error)?;

        let row = sqlx::query(
            r#"
            SELECT m.is_flagged, f.id AS flag_id
            FROM messages m
            LEFT JOIN flagged_messages f ON f.message_id = m.id
            WHERE m.id = ?
            "#,
        )
        .bind(message_id as i64)
        .fetch_optional(&mut *tx)
        .await
        .map_err(storage_error)?
        .ok_or(StoreError::MessageNotFound(message_id))?;

        if !row.get::<bool, _>("is_flagged") {
            return Err(StoreError::NotFlagged(message_id));
        }
        if row.get::<Option<i64>, _>("flag_id").is_some() {
            return Err(StoreError::AlreadyFlagged(message_id));
        }

        let flag = Self::insert_flag_on(&mut tx, message_id, severity).await?;
        tx.commit().await.map_err(storage_error)?;
        Ok(flag)
    }

    async fn list_flags(&self, limit: usize) -> Result<Vec<FlagEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, message_id, severity, flagged_at
            FROM flagged_messages
            ORDER BY flagged_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_error)?;

        rows.iter().map(flag_from_row).collect()
    }

    async fn get_flag_by_id(&self, id: u64) -> Result<Option<FlagEntry>, StoreError> {
        let row = sqlx::query(
            "SELECT id, message_id, severity, flagged_at FROM flagged_messages WHERE id = ?",
        )
        .bind(id as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_error)?;

        row.as_ref().map(flag_from_row).transpose()
    }
}

#[async_trait]
impl ModerationStore for SqliteChatStore {
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

        // Dropping the transaction without commit rolls both inserts back.
        let mut tx = self.pool.begin().await.map_err(storage_error)?;
        let message = Self::insert_message_on(&mut tx, message).await?;
        let flag = Self::insert_flag_on(&mut tx, message.id, severity).await?;
        tx.commit().await.map_err(storage_error)?;

        Ok((message, flag))
    }
}

#[async_trait]
impl Directory for SqliteChatStore {
    async fn get_room(&self, id: u64) -> Result<Option<Room>, StoreError> {
        let row = sqlx::query("SELECT id, name FROM chat_rooms WHERE id = ?")
            .bind(id as i64)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_error)?;

        Ok(row.map(|row| Room {
            id: row.get::<i64, _>("id") as u64,
            name: row.get("name"),
        }))
    }

    async fn list_rooms(&self) -> Result<Vec<Room>, StoreError> {
        let rows = sqlx::query("SELECT id, name FROM chat_rooms ORDER BY name ASC, id ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(storage_error)?;

        Ok(rows
            .into_iter()
            .map(|row| Room {
                id: row.get::<i64, _>("id") as u64,
                name: row.get("name"),
            })
            .collect())
    }

    async fn get_username(&self, author_id: u64) -> Result<Option<String>, StoreError> {
        let row = sqlx::query("SELECT username FROM profiles WHERE user_id = ?")
            .bind(author_id as i64)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_error)?;

        Ok(row.map(|row| row.get("username")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    async fn file_store() -> (SqliteChatStore, NamedTempFile) {
        let tmp = NamedTempFile::new().unwrap();
        let path = tmp.path().to_str().unwrap().to_string();
        let store = SqliteChatStore::connect(&path).await.unwrap();
        (store, tmp)
    }

    fn new_message(room_id: u64, content: &str, score: f64, flagged: bool) -> NewMessage {
        NewMessage {
            room_id,
            author_id: 7,
            content: content.to_string(),
            toxicity_score: score,
            is_flagged: flagged,
        }
    }

    #[tokio::test]
    async fn messages_round_trip_in_room_order() {
        let (store, _tmp) = file_store().await;
        let general = store.create_room("general").await.unwrap();
        let random = store.create_room("random").await.unwrap();

        let first = store
            .insert_message(new_message(general.id, "hello", 0.0, false))
            .await
            .unwrap();
        store
            .insert_message(new_message(random.id, "elsewhere", 0.0, false))
            .await
            .unwrap();
        let second = store
            .insert_message(new_message(general.id, "again", 0.0, false))
            .await
            .unwrap();

        let history = store.list_messages(general.id).await.unwrap();
        assert_eq!(history, vec![first.clone(), second]);
        assert_eq!(store.get_message(first.id).await.unwrap(), Some(first));
        assert_eq!(store.count_messages(random.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn flagged_insert_is_atomic() {
        let (store, _tmp) = file_store().await;
        let room = store.create_room("general").await.unwrap();

        let (message, flag) = store
            .insert_flagged_message(new_message(room.id, "rude", 0.85, true), Severity::High)
            .await
            .unwrap();
        assert_eq!(flag.message_id, message.id);
        assert_eq!(store.get_flag_by_id(flag.id).await.unwrap(), Some(flag));

        // Out-of-range score aborts the whole write
        let err = store
            .insert_flagged_message(new_message(room.id, "bad", 1.2, true), Severity::High)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidScore(_)));
        assert_eq!(store.count_messages(room.id).await.unwrap(), 1);
        assert_eq!(store.list_flags(50).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn flag_for_missing_message_rolls_back() {
        let (store, _tmp) = file_store().await;
        let room = store.create_room("general").await.unwrap();

        let clean = store
            .insert_message(new_message(room.id, "ok", 0.0, false))
            .await
            .unwrap();
        assert!(matches!(
            store.insert_flag(clean.id, Severity::Low).await,
            Err(StoreError::NotFlagged(_))
        ));
        assert!(matches!(
            store.insert_flag(12345, Severity::Low).await,
            Err(StoreError::MessageNotFound(12345))
        ));

        let rude = store
            .insert_message(new_message(room.id, "rude", 0.6, true))
            .await
            .unwrap();
        store.insert_flag(rude.id, Severity::Medium).await.unwrap();
        assert!(matches!(
            store.insert_flag(rude.id, Severity::Medium).await,
            Err(StoreError::AlreadyFlagged(_))
        ));
    }

    #[tokio::test]
    async fn recent_flags_are_newest_first_and_limited() {
        let (store, _tmp) = file_store().await;
        let room = store.create_room("general").await.unwrap();

        let mut ids = Vec::new();
        for i in 0..60 {
            let (_, flag) = store
                .insert_flagged_message(
                    new_message(room.id, &format!("rude {}", i), 0.6, true),
                    Severity::Medium,
                )
                .await
                .unwrap();
            ids.push(flag.id);
        }

        let recent = store.list_flags(50).await.unwrap();
        assert_eq!(recent.len(), 50);
        let expected: Vec<u64> = ids.iter().rev().take(50).copied().collect();
        assert_eq!(recent.iter().map(|f| f.id).collect::<Vec<_>>(), expected);
        assert!(recent
            .windows(2)
            .all(|pair| pair[0].flagged_at >= pair[1].flagged_at));
    }

    #[tokio::test]
    async fn directory_lookups() {
        let (store, _tmp) = file_store().await;
        store.create_room("random").await.unwrap();
        let general = store.create_room("general").await.unwrap();
        assert_eq!(store.create_room("general").await.unwrap(), general);

        let names: Vec<String> = store
            .list_rooms()
            .await
            .unwrap()
            .into_iter()
            .map(|room| room.name)
            .collect();
        assert_eq!(names, vec!["general", "random"]);
        assert_eq!(store.get_room(general.id).await.unwrap(), Some(general));

        store.upsert_profile(7, "alice").await.unwrap();
        store.upsert_profile(7, "alice2").await.unwrap();
        assert_eq!(store.get_username(7).await.unwrap().as_deref(), Some("alice2"));
        assert_eq!(store.get_username(8).await.unwrap(), None);
    }

    #[tokio::test]
    async fn data_survives_reconnect() {
        let tmp = NamedTempFile::new().unwrap();
        let path = tmp.path().to_str().unwrap().to_string();

        let room_id = {
            let store = SqliteChatStore::connect(&path).await.unwrap();
            let room = store.create_room("general").await.unwrap();
            store
                .insert_message(new_message(room.id, "persisted", 0.0, false))
                .await
                .unwrap();
            room.id
        };

        let reopened = SqliteChatStore::connect(&path).await.unwrap();
        let history = reopened.list_messages(room_id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content, "persisted");
    }

    #[tokio::test]
    async fn in_memory_database_keeps_a_single_connection() {
        let store = SqliteChatStore::connect("sqlite::memory:").await.unwrap();
        let room = store.create_room("general").await.unwrap();
        store
            .insert_message(new_message(room.id, "hi", 0.0, false))
            .await
            .unwrap();
        assert_eq!(store.count_messages(room.id).await.unwrap(), 1);
    }
}
