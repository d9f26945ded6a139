// Decision engine - maps a classification result to block/flag/severity.
//
// Pure function, no I/O. The pipeline calls this between classification
// and persistence.

use super::moderation_models::{ClassificationResult, Decision, Severity, Thresholds};

/// Bucket a score into a severity.
pub fn severity_for(score: f64, thresholds: &Thresholds) -> Severity {
    if score > thresholds.high {
        Severity::High
    } else if score > thresholds.medium {
        Severity::Medium
    } else {
        Severity::Low
    }
}

/// Decide what happens to a classified message.
///
/// The score is zeroed for non-toxic results before the block check, so a
/// message the classifier labels non-toxic can never be blocked.
pub fn decide(result: &ClassificationResult, thresholds: &Thresholds) -> Decision {
    let score = if result.is_toxic {
        result.score.clamp(0.0, 1.0)
    } else {
        0.0
    };

    let severity = severity_for(score, thresholds);

    if score > thresholds.block {
        return Decision {
            blocked: true,
            flagged: false,
            severity,
            score,
        };
    }

    Decision {
        blocked: false,
        flagged: result.is_toxic,
        severity,
        score,
    }
}
