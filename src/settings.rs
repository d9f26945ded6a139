// Runtime settings, read from the environment (after `.env` is loaded).

use crate::core::moderation::{FailurePolicy, ModerationConfig, Thresholds};
use crate::core::realtime::DEFAULT_CHANNEL_CAPACITY;
use std::time::Duration;

pub const DEFAULT_DATABASE_URL: &str = "data/chat.db";
pub const DEFAULT_ROOMS: &str = "general,random";
pub const DEFAULT_CLASSIFIER_MODEL: &str = "unitary/toxic-bert";
pub const DEFAULT_AUTHOR_ID: u64 = 1;

#[derive(Debug, Clone, PartialEq)]
pub struct ClassifierSettings {
    /// Inference endpoint; `None` means the offline lexicon classifier.
    pub endpoint: Option<String>,
    pub model: String,
    pub api_token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Sqlite,
    /// Process-local; nothing survives a restart.
    Memory,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub store: StoreKind,
    pub database_url: String,
    pub rooms: Vec<String>,
    /// `(author id, display name)` pairs seeded as profiles.
    pub profiles: Vec<(u64, String)>,
    pub author_id: u64,
    pub classifier: ClassifierSettings,
    pub moderation: ModerationConfig,
    pub channel_capacity: usize,
}

impl Settings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from any key lookup. Missing or unparsable values fall
    /// back to their defaults with a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let defaults = Thresholds::default();
        let in_unit_range = |value: &f64| value.is_finite() && (0.0..=1.0).contains(value);
        let mut thresholds = Thresholds {
            block: parse_checked(&get, "MODERATION_BLOCK_THRESHOLD", defaults.block, in_unit_range),
            high: parse_checked(&get, "MODERATION_HIGH_THRESHOLD", defaults.high, in_unit_range),
            medium: parse_checked(&get, "MODERATION_MEDIUM_THRESHOLD", defaults.medium, in_unit_range),
        };
        if !(thresholds.medium <= thresholds.high && thresholds.high <= thresholds.block) {
            tracing::warn!(
                medium = thresholds.medium,
                high = thresholds.high,
                block = thresholds.block,
                "Moderation thresholds must satisfy medium <= high <= block, using defaults"
            );
            thresholds = defaults;
        }

        let failure_policy = match get("CLASSIFIER_FAILURE_POLICY") {
            Some(raw) => FailurePolicy::parse(&raw).unwrap_or_else(|| {
                tracing::warn!(value = %raw, "Unknown CLASSIFIER_FAILURE_POLICY, using fail_open");
                FailurePolicy::FailOpen
            }),
            None => FailurePolicy::FailOpen,
        };

        let timeout_ms: u64 = parse_checked(&get, "CLASSIFIER_TIMEOUT_MS", 5000, |ms| *ms > 0);

        let profiles = get("CHAT_PROFILES")
            .map(|raw| parse_profiles(&raw))
            .unwrap_or_default();
        let author_id = get("CHAT_AUTHOR_ID")
            .and_then(|raw| raw.parse().ok())
            .or_else(|| profiles.first().map(|(id, _)| *id))
            .unwrap_or(DEFAULT_AUTHOR_ID);

        let store = match get("CHAT_STORE").as_deref() {
            None | Some("sqlite") => StoreKind::Sqlite,
            Some("memory") => StoreKind::Memory,
            Some(other) => {
                tracing::warn!(value = %other, "Unknown CHAT_STORE, using sqlite");
                StoreKind::Sqlite
            }
        };

        Self {
            store,
            database_url: get("CHAT_DATABASE_URL")
                .unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
            rooms: parse_list(&get("CHAT_ROOMS").unwrap_or_else(|| DEFAULT_ROOMS.to_string())),
            profiles,
            author_id,
            classifier: ClassifierSettings {
                endpoint: get("CLASSIFIER_ENDPOINT"),
                model: get("CLASSIFIER_MODEL")
                    .unwrap_or_else(|| DEFAULT_CLASSIFIER_MODEL.to_string()),
                api_token: get("CLASSIFIER_API_TOKEN"),
            },
            moderation: ModerationConfig {
                thresholds,
                failure_policy,
                classify_timeout: Duration::from_millis(timeout_ms),
            },
            channel_capacity: parse_checked(
                &get,
                "REALTIME_CHANNEL_CAPACITY",
                DEFAULT_CHANNEL_CAPACITY,
                |capacity| *capacity > 0,
            ),
        }
    }
}

// Values that fail to parse or fail `valid` fall back to `default`.
fn parse_checked<T: std::str::FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
    valid: impl Fn(&T) -> bool,
) -> T {
    let Some(raw) = get(key) else {
        return default;
    };
    match raw.parse::<T>() {
        Ok(value) if valid(&value) => value,
        _ => {
            tracing::warn!(key, value = %raw, "Invalid setting, using default");
            default
        }
    }
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|item| item.trim())
        .filter(|item| !item.is_empty())
        .map(|item| item.to_string())
        .collect()
}

// "1:alice,2:bob"
fn parse_profiles(raw: &str) -> Vec<(u64, String)> {
    parse_list(raw)
        .into_iter()
        .filter_map(|entry| {
            let (id, name) = entry.split_once(':')?;
            match id.trim().parse::<u64>() {
                Ok(id) if !name.trim().is_empty() => Some((id, name.trim().to_string())),
                _ => {
                    tracing::warn!(entry = %entry, "Ignoring malformed CHAT_PROFILES entry");
                    None
                }
            }
        })
        .collect()
}
