// This is the entry point of the moderated chat console.
//
// **Architecture Overview:**
// - `core/` = Business logic (classifier adapter, decision engine, realtime fan-out)
// - `infra/` = Implementations of core traits (SQLite, in-memory, inference API)
// - `console/` = Line-oriented front end (commands, feed printing)
//
// This file's job is to:
// 1. Load configuration
// 2. Initialize services (dependency injection)
// 3. Hand the service to the console

// These attrs point each module declaration at a more descriptive root file
// so we don't end up with half a dozen mod.rs files that all look the same.
#[path = "console/console_layer.rs"]
mod console;
#[path = "core/core_layer.rs"]
mod core;
#[path = "infra/infra_layer.rs"]
mod infra;
mod settings;

use crate::core::moderation::{
    ClassifierBackend, Directory, FallbackBackend, ModerationService, ModerationStore,
    ToxicityDetector,
};
use crate::core::realtime::SubscriptionManager;
use crate::infra::classifier::{InferenceApiBackend, LexiconBackend};
use crate::infra::moderation::{InMemoryChatStore, SqliteChatStore};
use crate::settings::{Settings, StoreKind};
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so they don't interleave with the chat on stdout
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    // Load environment variables from .env file (if it exists)
    dotenv::dotenv().ok();
    let settings = Settings::from_env();

    // Rooms and profiles are reference data; seed them before anything posts.
    match settings.store {
        StoreKind::Sqlite => {
            let store = SqliteChatStore::connect(&settings.database_url).await?;
            tracing::info!(database = %settings.database_url, "SQLite chat store ready");
            for name in &settings.rooms {
                let room = store.create_room(name).await?;
                tracing::debug!(room_id = room.id, room = %room.name, "Room ready");
            }
            for (author_id, username) in &settings.profiles {
                store.upsert_profile(*author_id, username).await?;
            }
            serve(Arc::new(store), &settings).await
        }
        StoreKind::Memory => {
            let store = InMemoryChatStore::new();
            tracing::info!("In-memory chat store ready, history is lost on exit");
            for name in &settings.rooms {
                let room = store.add_room(name);
                tracing::debug!(room_id = room.id, room = %room.name, "Room ready");
            }
            for (author_id, username) in &settings.profiles {
                store.set_username(*author_id, username);
            }
            serve(Arc::new(store), &settings).await
        }
    }
}

/// Wire the classifier, fan-out and service around `store`, then run the
/// console until it exits.
async fn serve<S>(store: Arc<S>, settings: &Settings) -> anyhow::Result<()>
where
    S: ModerationStore + Directory + 'static,
{
    // ========================================================================
    // DEPENDENCY INJECTION
    // ========================================================================

    let backend: Box<dyn ClassifierBackend> = match &settings.classifier.endpoint {
        Some(endpoint) => {
            let remote =
                InferenceApiBackend::new(endpoint.clone(), settings.classifier.model.clone())
                    .with_api_token(settings.classifier.api_token.clone())
                    .with_request_timeout(settings.moderation.classify_timeout);
            Box::new(FallbackBackend::new(remote, LexiconBackend::new()))
        }
        None => {
            tracing::info!("CLASSIFIER_ENDPOINT not set, using the offline lexicon classifier");
            Box::new(LexiconBackend::new())
        }
    };

    let detector = Arc::new(ToxicityDetector::new(
        backend,
        settings.moderation.classify_timeout,
        settings.moderation.failure_policy,
    ));

    // Load the model in the background so the console is usable right away.
    // Messages sent before it finishes wait on the same load.
    let warm_up = Arc::clone(&detector);
    tokio::spawn(async move {
        if let Err(e) = warm_up.warm_up().await {
            tracing::warn!("Classifier warm-up failed, will retry on first message: {}", e);
        }
    });

    let subscriptions = Arc::new(SubscriptionManager::new(settings.channel_capacity));
    let service = Arc::new(ModerationService::new(
        store,
        detector,
        subscriptions,
        settings.moderation.thresholds,
    ));

    println!("🛡️ chat_guard is ready");
    console::run(service, settings.author_id).await
}
