// Console session - reads commands from stdin and keeps two feeds running:
// the current room and the moderation queue.
//
// Everything the user sees goes through an `Output` channel; `run` drains it
// to stdout.

use super::commands::{self, Command, HELP};
use crate::core::moderation::{
    ClassifierBackend, Directory, FlaggedMessage, Message, ModerationService, ModerationStore,
    ResyncedFeed, Room, StoreError, Submission, SubmitError, RECENT_FLAGS_LIMIT,
};
use crate::core::realtime::{Event, LiveFeed, SubscriptionError, Topic};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Lines for the user.
pub type Output = mpsc::UnboundedSender<String>;

fn emit(out: &Output, line: impl Into<String>) {
    // Only fails once the printer is gone at exit.
    let _ = out.send(line.into());
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

/// A background task printing one feed until cancelled.
struct FeedTask {
    cancel: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl FeedTask {
    async fn stop(self) {
        // The task may already have finished on its own.
        let _ = self.cancel.send(());
        if let Err(e) = self.handle.await {
            tracing::warn!("Feed task ended abnormally: {}", e);
        }
    }
}

pub struct ConsoleSession<S, B>
where
    S: ModerationStore + Directory + 'static,
    B: ClassifierBackend + 'static,
{
    service: Arc<ModerationService<S, B>>,
    out: Output,
    author_id: u64,
    room: Option<Room>,
    room_feed: Option<FeedTask>,
    moderation_feed: Option<FeedTask>,
}

impl<S, B> ConsoleSession<S, B>
where
    S: ModerationStore + Directory + 'static,
    B: ClassifierBackend + 'static,
{
    pub fn new(service: Arc<ModerationService<S, B>>, author_id: u64, out: Output) -> Self {
        Self {
            service,
            out,
            author_id,
            room: None,
            room_feed: None,
            moderation_feed: None,
        }
    }

    pub fn author_id(&self) -> u64 {
        self.author_id
    }

    pub fn current_room(&self) -> Option<&Room> {
        self.room.as_ref()
    }

    /// Start the moderation feed and join the first room, if any.
    pub async fn start(&mut self) -> Result<(), StoreError> {
        let snapshot = self.service.open_moderation_feed().await?;
        emit(
            &self.out,
            format!("-- moderation queue ({} recent) --", snapshot.items.len()),
        );
        // Snapshot is newest first; print oldest first like the live tail.
        for flagged in snapshot.items.iter().rev() {
            emit(&self.out, render_flag(flagged));
        }
        self.moderation_feed = Some(spawn_moderation_feed(
            Arc::clone(&self.service),
            snapshot.live,
            self.out.clone(),
        ));

        if let Some(first) = self.service.rooms().await?.into_iter().next() {
            self.join(first).await?;
        }
        Ok(())
    }

    /// Run one command.
    pub async fn handle(&mut self, command: Command) -> Result<Flow, StoreError> {
        match command {
            Command::Say(text) => self.say(&text).await,
            Command::Rooms => {
                let current = self.room.as_ref().map(|room| room.id);
                for room in self.service.rooms().await? {
                    let marker = if Some(room.id) == current { "*" } else { " " };
                    let count = self.service.message_count(room.id).await?;
                    emit(
                        &self.out,
                        format!("{} #{} (id {}, {} messages)", marker, room.name, room.id, count),
                    );
                }
            }
            Command::Join(target) => match self.find_room(&target).await? {
                Some(room) => self.join(room).await?,
                None => emit(&self.out, format!("No room named '{}'", target)),
            },
            Command::As(author_id) => {
                self.author_id = author_id;
                let name = self.service.display_name(author_id).await;
                emit(&self.out, format!("Now posting as {} (id {})", name, author_id));
            }
            Command::Flags(None) => {
                let flagged = self.service.flagged_messages(RECENT_FLAGS_LIMIT).await?;
                if flagged.is_empty() {
                    emit(&self.out, "No flagged messages");
                }
                for item in &flagged {
                    emit(&self.out, render_flag(item));
                }
            }
            Command::Flags(Some(flag_id)) => match self.service.flagged_message(flag_id).await? {
                Some(item) => emit(&self.out, render_flag(&item)),
                None => emit(&self.out, format!("No flag #{}", flag_id)),
            },
            Command::History => match self.room.clone() {
                Some(room) => {
                    let history = self.service.room_history(room.id).await?;
                    emit(&self.out, format!("-- #{} --", room.name));
                    print_messages(&self.service, &self.out, &history).await;
                }
                None => emit(&self.out, "Join a room first (/rooms, /join <room>)"),
            },
            Command::Status => self.status().await,
            Command::Help => emit(&self.out, HELP),
            Command::Quit => return Ok(Flow::Quit),
        }
        Ok(Flow::Continue)
    }

    /// Stop both feeds and detach their subscriptions.
    pub async fn shutdown(mut self) {
        if let Some(task) = self.room_feed.take() {
            task.stop().await;
        }
        if let Some(task) = self.moderation_feed.take() {
            task.stop().await;
        }
    }

    async fn say(&self, text: &str) {
        let Some(room) = self.room.as_ref() else {
            emit(&self.out, "Join a room first (/rooms, /join <room>)");
            return;
        };

        match self.service.submit(room.id, self.author_id, text).await {
            Ok(submission) => {
                if let Some(notice) = submission_notice(&submission) {
                    emit(&self.out, notice);
                }
            }
            Err(err) => emit(&self.out, render_submit_error(&err)),
        }
    }

    async fn status(&self) {
        let name = self.service.display_name(self.author_id()).await;
        let room = match self.current_room() {
            Some(room) => format!("#{}", room.name),
            None => "no room".to_string(),
        };
        emit(
            &self.out,
            format!("Posting as {} (id {}) in {}", name, self.author_id(), room),
        );

        let detector = self.service.detector();
        let state = if detector.is_loaded() { "loaded" } else { "not loaded" };
        emit(
            &self.out,
            format!("Classifier: {}, {}", state, detector.policy().as_str()),
        );

        let subscriptions = self.service.subscriptions();
        let here = self
            .current_room()
            .map(|room| subscriptions.listener_count(Topic::Room(room.id)))
            .unwrap_or(0);
        emit(
            &self.out,
            format!(
                "Live topics: {}, listeners in this room: {}",
                subscriptions.topic_count(),
                here
            ),
        );
    }

    async fn find_room(&self, target: &str) -> Result<Option<Room>, StoreError> {
        let target = target.trim_start_matches('#');
        if let Ok(room_id) = target.parse::<u64>() {
            if let Some(room) = self.service.room(room_id).await? {
                return Ok(Some(room));
            }
        }
        Ok(self
            .service
            .rooms()
            .await?
            .into_iter()
            .find(|room| room.name.eq_ignore_ascii_case(target)))
    }

    async fn join(&mut self, room: Room) -> Result<(), StoreError> {
        if let Some(task) = self.room_feed.take() {
            task.stop().await;
        }

        let snapshot = self.service.open_room_feed(room.id).await?;
        emit(&self.out, format!("-- #{} --", room.name));
        print_messages(&self.service, &self.out, &snapshot.items).await;

        tracing::debug!(room_id = room.id, history = snapshot.items.len(), "Joined room");
        self.room_feed = Some(spawn_room_feed(
            Arc::clone(&self.service),
            snapshot.live,
            self.out.clone(),
        ));
        self.room = Some(room);
        Ok(())
    }
}

/// Read commands from stdin until `/quit` or end of input.
pub async fn run<S, B>(service: Arc<ModerationService<S, B>>, author_id: u64) -> anyhow::Result<()>
where
    S: ModerationStore + Directory + 'static,
    B: ClassifierBackend + 'static,
{
    let (out, mut pending) = mpsc::unbounded_channel::<String>();
    let printer = tokio::spawn(async move {
        while let Some(line) = pending.recv().await {
            println!("{}", line);
        }
    });

    let mut session = ConsoleSession::new(service, author_id, out.clone());
    session.start().await?;
    emit(&out, "Type /help for commands.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let command = match commands::parse(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(err) => {
                emit(&out, err.to_string());
                continue;
            }
        };

        match session.handle(command).await {
            Ok(Flow::Continue) => {}
            Ok(Flow::Quit) => break,
            Err(err) => {
                tracing::error!("Command failed: {}", err);
                emit(&out, format!("Something went wrong: {}", err));
            }
        }
    }

    session.shutdown().await;
    // Last sender gone: the printer flushes what is queued and stops.
    drop(out);
    if let Err(e) = printer.await {
        tracing::warn!("Console printer ended abnormally: {}", e);
    }
    Ok(())
}

async fn print_messages<S, B>(service: &ModerationService<S, B>, out: &Output, messages: &[Message])
where
    S: ModerationStore + Directory + 'static,
    B: ClassifierBackend + 'static,
{
    for message in messages {
        let author = service.display_name(message.author_id).await;
        emit(out, render_message(message, &author));
    }
}

// ============================================================================
// FEED TASKS
// ============================================================================

fn spawn_room_feed<S, B>(
    service: Arc<ModerationService<S, B>>,
    live: LiveFeed,
    out: Output,
) -> FeedTask
where
    S: ModerationStore + Directory + 'static,
    B: ClassifierBackend + 'static,
{
    let (cancel, mut cancelled) = oneshot::channel();
    let handle = tokio::spawn(async move {
        let mut live = live;
        loop {
            let next = tokio::select! {
                _ = &mut cancelled => break,
                next = live.next() => next,
            };

            match next {
                Ok(Some(Event::MessageAccepted { message })) => {
                    let author = service.display_name(message.author_id).await;
                    emit(&out, render_message(&message, &author));
                }
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(SubscriptionError::Dropped(missed)) => {
                    tracing::warn!(topic = %live.topic(), missed, "Room feed fell behind");
                    match service.resync(live).await {
                        Ok(ResyncedFeed::Room(snapshot)) => {
                            emit(
                                &out,
                                format!("-- resynced, {} messages --", snapshot.items.len()),
                            );
                            print_messages(&service, &out, &snapshot.items).await;
                            live = snapshot.live;
                        }
                        Ok(ResyncedFeed::Moderation(snapshot)) => live = snapshot.live,
                        Err(err) => {
                            tracing::error!("Failed to resync room feed: {}", err);
                            return;
                        }
                    }
                }
                Err(err) => {
                    tracing::error!("Room feed failed: {}", err);
                    break;
                }
            }
        }
        service.close_feed(live);
    });

    FeedTask { cancel, handle }
}

fn spawn_moderation_feed<S, B>(
    service: Arc<ModerationService<S, B>>,
    live: LiveFeed,
    out: Output,
) -> FeedTask
where
    S: ModerationStore + Directory + 'static,
    B: ClassifierBackend + 'static,
{
    let (cancel, mut cancelled) = oneshot::channel();
    let handle = tokio::spawn(async move {
        let mut live = live;
        loop {
            let next = tokio::select! {
                _ = &mut cancelled => break,
                next = live.next() => next,
            };

            match next {
                Ok(Some(Event::MessageFlagged { flagged })) => {
                    emit(&out, render_flag(&flagged));
                }
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(SubscriptionError::Dropped(missed)) => {
                    tracing::warn!(missed, "Moderation feed fell behind");
                    match service.resync(live).await {
                        Ok(ResyncedFeed::Moderation(snapshot)) => {
                            emit(&out, "-- moderation queue resynced --");
                            for flagged in snapshot.items.iter().rev() {
                                emit(&out, render_flag(flagged));
                            }
                            live = snapshot.live;
                        }
                        Ok(ResyncedFeed::Room(snapshot)) => live = snapshot.live,
                        Err(err) => {
                            tracing::error!("Failed to resync moderation feed: {}", err);
                            return;
                        }
                    }
                }
                Err(err) => {
                    tracing::error!("Moderation feed failed: {}", err);
                    break;
                }
            }
        }
        service.close_feed(live);
    });

    FeedTask { cancel, handle }
}

// ============================================================================
// RENDERING
// ============================================================================

pub fn render_message(message: &Message, author: &str) -> String {
    let mut line = format!(
        "[{}] {}: {}",
        message.created_at.format("%H:%M:%S"),
        author,
        message.content
    );
    let mut notes = Vec::new();
    if message.toxicity_score > 0.0 {
        notes.push(format!("{:.0}% toxic", message.toxicity_score * 100.0));
    }
    if message.is_flagged {
        notes.push("flagged".to_string());
    }
    if !notes.is_empty() {
        line.push_str(&format!("  ({})", notes.join(", ")));
    }
    line
}

pub fn render_flag(flagged: &FlaggedMessage) -> String {
    format!(
        "[mod #{}] {} {:.2} in #{} by {}: {}",
        flagged.flag.id,
        flagged.flag.severity.as_str().to_uppercase(),
        flagged.toxicity_score,
        flagged.room_name,
        flagged.author_name,
        flagged.content
    )
}

/// What the author is told after a successful submit, if anything.
pub fn submission_notice(submission: &Submission) -> Option<String> {
    submission.flag.as_ref().map(|flag| {
        format!(
            "Your message was flagged for {} toxicity",
            flag.severity.as_str()
        )
    })
}

pub fn render_submit_error(err: &SubmitError) -> String {
    match err {
        SubmitError::Blocked { .. } => {
            "Your message was blocked for severe toxicity and was not posted".to_string()
        }
        SubmitError::ClassifierUnavailable(_) => {
            "Messages cannot be screened right now, please try again later".to_string()
        }
        other => other.to_string(),
    }
}
