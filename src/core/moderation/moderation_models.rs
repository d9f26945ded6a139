// Moderation domain models - data structures for the content-safety pipeline.
//
// These are pure domain types with no storage or transport dependencies.
// The infra layer persists them, the console layer renders them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Display name used when an author has no profile.
pub const ANONYMOUS_AUTHOR: &str = "Anonymous";
/// Display name used when a room id cannot be resolved.
pub const UNKNOWN_ROOM: &str = "Unknown";
/// Hard cap on any "recent flags" projection.
pub const RECENT_FLAGS_LIMIT: usize = 50;

/// A chat room. Created out-of-band, read-only to the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: u64,
    pub name: String,
}

/// An accepted message. Created exactly once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: u64,
    pub room_id: u64,
    pub author_id: u64,
    pub content: String,
    /// Always within [0, 1].
    pub toxicity_score: f64,
    pub is_flagged: bool,
    pub created_at: DateTime<Utc>,
}

/// Fields the caller supplies when inserting a message.
/// The store assigns `id` and `created_at`.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub room_id: u64,
    pub author_id: u64,
    pub content: String,
    pub toxicity_score: f64,
    pub is_flagged: bool,
}

/// Severity bucket for flagged content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "low" => Some(Severity::Low),
            "medium" => Some(Severity::Medium),
            "high" => Some(Severity::High),
            _ => None,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A moderation record linked 1:1 to a flagged message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagEntry {
    pub id: u64,
    pub message_id: u64,
    pub severity: Severity,
    pub flagged_at: DateTime<Utc>,
}

/// Moderator-facing view of a flag: the entry joined with its message,
/// author and room. Built on demand, never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlaggedMessage {
    pub flag: FlagEntry,
    pub content: String,
    pub toxicity_score: f64,
    pub message_created_at: DateTime<Utc>,
    pub author_id: u64,
    pub author_name: String,
    pub room_id: u64,
    pub room_name: String,
}

/// Normalized classifier output. Ephemeral, one per submission.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub score: f64,
    pub is_toxic: bool,
}

impl ClassificationResult {
    /// The result substituted when the classifier cannot answer.
    pub fn fail_open() -> Self {
        Self {
            score: 0.0,
            is_toxic: false,
        }
    }
}

/// What the pipeline should do with a classified message.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decision {
    pub blocked: bool,
    pub flagged: bool,
    /// Only meaningful when `flagged` is true.
    pub severity: Severity,
    /// The score that gets stored: the classifier score for toxic content, 0 otherwise.
    pub score: f64,
}

/// Score cut-offs used by the decision engine.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    /// Scores strictly above this are rejected outright.
    pub block: f64,
    /// Scores strictly above this are `high` severity.
    pub high: f64,
    /// Scores strictly above this (and not high) are `medium` severity.
    pub medium: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            block: 0.9,
            high: 0.8,
            medium: 0.5,
        }
    }
}

/// What to do when the classifier cannot produce a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Treat the message as non-toxic and let it through.
    FailOpen,
    /// Reject the submission.
    FailClosed,
}

impl FailurePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailurePolicy::FailOpen => "fail_open",
            FailurePolicy::FailClosed => "fail_closed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "fail_open" | "open" => Some(FailurePolicy::FailOpen),
            "fail_closed" | "closed" => Some(FailurePolicy::FailClosed),
            _ => None,
        }
    }
}

/// Configuration for the moderation pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct ModerationConfig {
    pub thresholds: Thresholds,
    pub failure_policy: FailurePolicy,
    /// Upper bound on a single classification call.
    pub classify_timeout: Duration,
}

impl Default for ModerationConfig {
    fn default() -> Self {
        Self {
            thresholds: Thresholds::default(),
            failure_policy: FailurePolicy::FailOpen,
            classify_timeout: Duration::from_secs(5),
        }
    }
}

/// Result of a successful submission.
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub message: Message,
    /// Present when the message was flagged for review.
    pub flag: Option<FlagEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_round_trips_through_its_name() {
        for severity in [Severity::Low, Severity::Medium, Severity::High] {
            assert_eq!(Severity::parse(severity.as_str()), Some(severity));
        }
        assert_eq!(Severity::parse("critical"), None);
    }

    #[test]
    fn failure_policy_parsing_is_lenient() {
        assert_eq!(
            FailurePolicy::parse(" Fail_Closed "),
            Some(FailurePolicy::FailClosed)
        );
        assert_eq!(FailurePolicy::parse("open"), Some(FailurePolicy::FailOpen));
        assert_eq!(FailurePolicy::parse("maybe"), None);
    }

    #[test]
    fn default_config_fails_open() {
        let config = ModerationConfig::default();
        assert_eq!(config.failure_policy, FailurePolicy::FailOpen);
        assert_eq!(config.thresholds.block, 0.9);
    }
}
