// Moderation service - the submission pipeline and the moderator views.
//
// submit: classify -> decide -> (reject | store) -> publish
//
// NO transport dependencies here. The console layer (or any other front end)
// calls `submit` and consumes the feeds.

use super::classifier::{ClassifierBackend, ClassifierError, ToxicityDetector};
use super::decision::decide;
use super::moderation_models::{
    Decision, FlagEntry, FlaggedMessage, Message, NewMessage, Room, Submission, Thresholds,
    ANONYMOUS_AUTHOR, RECENT_FLAGS_LIMIT, UNKNOWN_ROOM,
};
use super::moderation_store::{Directory, ModerationStore, StoreError};
use crate::core::realtime::{
    Broadcaster, Event, FeedSnapshot, LiveFeed, SubscriptionManager, Topic,
};
use std::sync::Arc;
use thiserror::Error;

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("Message is empty")]
    EmptyMessage,

    #[error("Room {0} does not exist")]
    UnknownRoom(u64),

    #[error("Message blocked: toxicity score {score:.2} is above the block threshold")]
    Blocked { score: f64 },

    #[error("Classifier unavailable: {0}")]
    ClassifierUnavailable(#[from] ClassifierError),

    #[error("Failed to store message: {0}")]
    StoreWriteFailure(#[from] StoreError),
}

// ============================================================================
// CORE SERVICE
// ============================================================================

pub struct ModerationService<S, B>
where
    S: ModerationStore + Directory + 'static,
    B: ClassifierBackend,
{
    store: Arc<S>,
    detector: Arc<ToxicityDetector<B>>,
    broadcaster: Broadcaster,
    thresholds: Thresholds,
}

impl<S, B> ModerationService<S, B>
where
    S: ModerationStore + Directory + 'static,
    B: ClassifierBackend,
{
    pub fn new(
        store: Arc<S>,
        detector: Arc<ToxicityDetector<B>>,
        subscriptions: Arc<SubscriptionManager>,
        thresholds: Thresholds,
    ) -> Self {
        Self {
            store,
            detector,
            broadcaster: Broadcaster::new(subscriptions),
            thresholds,
        }
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionManager> {
        self.broadcaster.subscriptions()
    }

    pub fn detector(&self) -> &Arc<ToxicityDetector<B>> {
        &self.detector
    }

    /// Screen and post a message.
    ///
    /// Blocked content is never stored or published. Once a message passes
    /// the block check, storing and publishing run in their own task so they
    /// finish even if the caller stops waiting.
    pub async fn submit(
        &self,
        room_id: u64,
        author_id: u64,
        text: &str,
    ) -> Result<Submission, SubmitError> {
        if text.trim().is_empty() {
            return Err(SubmitError::EmptyMessage);
        }

        let room = self
            .store
            .get_room(room_id)
            .await?
            .ok_or(SubmitError::UnknownRoom(room_id))?;

        let classification = self.detector.classify(text).await?;
        let decision = decide(&classification, &self.thresholds);

        if decision.blocked {
            tracing::warn!(
                room_id,
                author_id,
                score = decision.score,
                "Message blocked"
            );
            return Err(SubmitError::Blocked {
                score: decision.score,
            });
        }

        let new_message = NewMessage {
            room_id,
            author_id,
            content: text.to_string(),
            toxicity_score: decision.score,
            is_flagged: decision.flagged,
        };

        let store = Arc::clone(&self.store);
        let broadcaster = self.broadcaster.clone();
        let pipeline = tokio::spawn(async move {
            commit_and_publish(store.as_ref(), &broadcaster, &room, new_message, decision).await
        });

        pipeline.await.map_err(|e| {
            StoreError::StorageError(format!("submission task did not complete: {}", e))
        })?
    }

    /// Display name for an author, `Anonymous` when they have no profile.
    pub async fn display_name(&self, author_id: u64) -> String {
        author_name(self.store.as_ref(), author_id).await
    }

    /// Every room, by name.
    pub async fn rooms(&self) -> Result<Vec<Room>, StoreError> {
        self.store.list_rooms().await
    }

    pub async fn room(&self, room_id: u64) -> Result<Option<Room>, StoreError> {
        self.store.get_room(room_id).await
    }

    /// Room history, oldest first.
    pub async fn room_history(&self, room_id: u64) -> Result<Vec<Message>, StoreError> {
        self.store.list_messages(room_id).await
    }

    pub async fn message_count(&self, room_id: u64) -> Result<u64, StoreError> {
        self.store.count_messages(room_id).await
    }

    /// Most recent flag entries, newest first. `limit` is capped at 50.
    pub async fn recent_flags(&self, limit: usize) -> Result<Vec<FlagEntry>, StoreError> {
        self.store.list_flags(limit.min(RECENT_FLAGS_LIMIT)).await
    }

    /// One flag joined with its message, author and room.
    pub async fn flagged_message(&self, flag_id: u64) -> Result<Option<FlaggedMessage>, StoreError> {
        match self.store.get_flag_by_id(flag_id).await? {
            Some(flag) => Ok(Some(self.join_flag(flag).await?)),
            None => Ok(None),
        }
    }

    /// Recent flags joined with their message, author and room.
    pub async fn flagged_messages(&self, limit: usize) -> Result<Vec<FlaggedMessage>, StoreError> {
        let flags = self.recent_flags(limit).await?;
        let mut views = Vec::with_capacity(flags.len());
        for flag in flags {
            views.push(self.join_flag(flag).await?);
        }
        Ok(views)
    }

    async fn join_flag(&self, flag: FlagEntry) -> Result<FlaggedMessage, StoreError> {
        let message = self
            .store
            .get_message(flag.message_id)
            .await?
            .ok_or(StoreError::MessageNotFound(flag.message_id))?;
        let room_name = self
            .store
            .get_room(message.room_id)
            .await?
            .map(|room| room.name)
            .unwrap_or_else(|| UNKNOWN_ROOM.to_string());
        let author_name = author_name(self.store.as_ref(), message.author_id).await;
        Ok(flagged_view(flag, &message, author_name, room_name))
    }

    /// Attach to a room, then fetch its history.
    ///
    /// Attaching first means nothing committed between the two steps is
    /// lost; the live feed drops anything the history already contains.
    pub async fn open_room_feed(&self, room_id: u64) -> Result<FeedSnapshot<Message>, StoreError> {
        let subscription = self.subscriptions().subscribe(Topic::Room(room_id));
        let items = match self.store.list_messages(room_id).await {
            Ok(items) => items,
            Err(err) => {
                self.subscriptions().unsubscribe(subscription);
                return Err(err);
            }
        };
        let high_water = items.iter().map(|m| m.id).max().unwrap_or(0);
        Ok(FeedSnapshot {
            items,
            live: LiveFeed::new(subscription, high_water),
        })
    }

    /// Attach to the moderation topic, then fetch the 50 most recent flags.
    pub async fn open_moderation_feed(&self) -> Result<FeedSnapshot<FlaggedMessage>, StoreError> {
        let subscription = self.subscriptions().subscribe(Topic::Moderation);
        let items = match self.flagged_messages(RECENT_FLAGS_LIMIT).await {
            Ok(items) => items,
            Err(err) => {
                self.subscriptions().unsubscribe(subscription);
                return Err(err);
            }
        };
        let high_water = items.iter().map(|f| f.flag.id).max().unwrap_or(0);
        Ok(FeedSnapshot {
            items,
            live: LiveFeed::new(subscription, high_water),
        })
    }

    /// Detach a feed's live tail.
    pub fn close_feed(&self, feed: LiveFeed) {
        self.subscriptions().unsubscribe(feed.into_subscription());
    }

    /// Re-fetch the snapshot and re-attach after a dropped subscription.
    pub async fn resync(&self, feed: LiveFeed) -> Result<ResyncedFeed, StoreError> {
        let topic = feed.topic();
        let high_water = feed.high_water();
        self.close_feed(feed);
        tracing::info!(%topic, high_water, "Resyncing feed");
        match topic {
            Topic::Room(room_id) => Ok(ResyncedFeed::Room(self.open_room_feed(room_id).await?)),
            Topic::Moderation => Ok(ResyncedFeed::Moderation(
                self.open_moderation_feed().await?,
            )),
        }
    }
}

/// Fresh snapshot + tail returned by `resync`.
pub enum ResyncedFeed {
    Room(FeedSnapshot<Message>),
    Moderation(FeedSnapshot<FlaggedMessage>),
}

// ============================================================================
// PIPELINE STAGES
// ============================================================================

async fn commit_and_publish<S>(
    store: &S,
    broadcaster: &Broadcaster,
    room: &Room,
    new_message: NewMessage,
    decision: Decision,
) -> Result<Submission, SubmitError>
where
    S: ModerationStore + Directory,
{
    if !decision.flagged {
        let message = store.insert_message(new_message).await.map_err(|e| {
            tracing::error!(room_id = room.id, "Failed to store message: {}", e);
            e
        })?;
        tracing::debug!(room_id = room.id, message_id = message.id, "Message accepted");
        broadcaster.publish(Event::MessageAccepted {
            message: message.clone(),
        });
        return Ok(Submission {
            message,
            flag: None,
        });
    }

    let (message, flag) = store
        .insert_flagged_message(new_message, decision.severity)
        .await
        .map_err(|e| {
            tracing::error!(room_id = room.id, "Failed to store flagged message: {}", e);
            e
        })?;

    tracing::info!(
        room_id = room.id,
        message_id = message.id,
        flag_id = flag.id,
        severity = %flag.severity,
        score = message.toxicity_score,
        "Message flagged for review"
    );

    broadcaster.publish(Event::MessageAccepted {
        message: message.clone(),
    });

    let author = author_name(store, message.author_id).await;
    broadcaster.publish(Event::MessageFlagged {
        flagged: flagged_view(flag.clone(), &message, author, room.name.clone()),
    });

    Ok(Submission {
        message,
        flag: Some(flag),
    })
}

// The message is already committed when this runs, so a failed lookup only
// degrades the display name.
async fn author_name<S: Directory + ?Sized>(store: &S, author_id: u64) -> String {
    match store.get_username(author_id).await {
        Ok(Some(name)) => name,
        Ok(None) => ANONYMOUS_AUTHOR.to_string(),
        Err(err) => {
            tracing::warn!(author_id, "Failed to look up author name: {}", err);
            ANONYMOUS_AUTHOR.to_string()
        }
    }
}

fn flagged_view(
    flag: FlagEntry,
    message: &Message,
    author_name: String,
    room_name: String,
) -> FlaggedMessage {
    FlaggedMessage {
        flag,
        content: message.content.clone(),
        toxicity_score: message.toxicity_score,
        message_created_at: message.created_at,
        author_id: message.author_id,
        author_name,
        room_id: message.room_id,
        room_name,
    }
}

// ============================================================================
// TESTS
// ============================================================================
