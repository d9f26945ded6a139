// Classifier adapter - wraps an external text-classification capability.
//
// The capability is split in two:
// - `ClassifierBackend::load()` does the expensive one-time setup (model load,
//   HTTP client + warm-up) and hands back a loaded model
// - `TextClassifier::classify()` runs one inference
//
// `ToxicityDetector` owns the memoized model, serializes calls into models
// that are not reentrant, bounds every call with a timeout and applies the
// configured failure policy.

use super::moderation_models::{ClassificationResult, FailurePolicy};
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, OnceCell};

/// Label the classifier uses for harmful content.
pub const TOXIC_LABEL: &str = "toxic";

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ClassifierError {
    #[error("Classifier failed to load: {0}")]
    Load(String),

    #[error("Classification failed: {0}")]
    Inference(String),

    #[error("Classification timed out after {0:?}")]
    Timeout(Duration),
}

// ============================================================================
// CAPABILITY TRAITS (PORTS)
// ============================================================================

/// One label/score pair as reported by the underlying model.
#[derive(Debug, Clone, PartialEq)]
pub struct RawPrediction {
    pub label: String,
    pub score: f64,
}

impl RawPrediction {
    pub fn new(label: impl Into<String>, score: f64) -> Self {
        Self {
            label: label.into(),
            score,
        }
    }
}

/// A loaded, ready-to-run text classifier.
#[async_trait]
pub trait TextClassifier: Send + Sync {
    /// Whether concurrent `classify` calls are safe.
    /// Models that return `false` are called one at a time.
    fn is_reentrant(&self) -> bool {
        true
    }

    async fn classify(&self, text: &str) -> Result<Vec<RawPrediction>, ClassifierError>;
}

/// Something that can produce a `TextClassifier`, usually expensively.
#[async_trait]
pub trait ClassifierBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn load(&self) -> Result<Box<dyn TextClassifier>, ClassifierError>;
}

// Lets main pick a backend at runtime and still hand a concrete type to
// the detector.
#[async_trait]
impl ClassifierBackend for Box<dyn ClassifierBackend> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn load(&self) -> Result<Box<dyn TextClassifier>, ClassifierError> {
        (**self).load().await
    }
}

/// Loads `secondary` when `primary` fails to load.
pub struct FallbackBackend<P, S> {
    primary: P,
    secondary: S,
}

impl<P: ClassifierBackend, S: ClassifierBackend> FallbackBackend<P, S> {
    pub fn new(primary: P, secondary: S) -> Self {
        Self { primary, secondary }
    }
}

#[async_trait]
impl<P: ClassifierBackend, S: ClassifierBackend> ClassifierBackend for FallbackBackend<P, S> {
    fn name(&self) -> &str {
        self.primary.name()
    }

    async fn load(&self) -> Result<Box<dyn TextClassifier>, ClassifierError> {
        match self.primary.load().await {
            Ok(model) => Ok(model),
            Err(err) => {
                tracing::warn!(
                    primary = self.primary.name(),
                    secondary = self.secondary.name(),
                    "Primary classifier failed to load, falling back: {}",
                    err
                );
                self.secondary.load().await
            }
        }
    }
}

// ============================================================================
// NORMALIZATION
// ============================================================================

/// Collapse raw predictions into a score/label pair.
///
/// The highest-scoring prediction wins; its label decides toxicity and its
/// score is clamped into [0, 1].
pub fn normalize(predictions: &[RawPrediction]) -> Result<ClassificationResult, ClassifierError> {
    let score_of = |p: &RawPrediction| if p.score.is_nan() { 0.0 } else { p.score };
    let top = predictions
        .iter()
        .max_by(|a, b| score_of(a).total_cmp(&score_of(b)))
        .ok_or_else(|| ClassifierError::Inference("classifier returned no predictions".into()))?;

    Ok(ClassificationResult {
        score: score_of(top).clamp(0.0, 1.0),
        is_toxic: top.label.eq_ignore_ascii_case(TOXIC_LABEL),
    })
}

// ============================================================================
// ADAPTER
// ============================================================================

struct LoadedModel {
    model: Box<dyn TextClassifier>,
    // Present only for non-reentrant models.
    gate: Option<Mutex<()>>,
}

/// Shared, lazily initialized handle to the toxicity classifier.
///
/// Wrap it in an `Arc` and inject it wherever classification is needed.
pub struct ToxicityDetector<B: ClassifierBackend> {
    backend: B,
    model: OnceCell<LoadedModel>,
    timeout: Duration,
    policy: FailurePolicy,
}

impl<B: ClassifierBackend> ToxicityDetector<B> {
    pub fn new(backend: B, timeout: Duration, policy: FailurePolicy) -> Self {
        Self {
            backend,
            model: OnceCell::new(),
            timeout,
            policy,
        }
    }

    /// Whether the model has been loaded yet.
    pub fn is_loaded(&self) -> bool {
        self.model.initialized()
    }

    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    /// Load the model now instead of on first use.
    pub async fn warm_up(&self) -> Result<(), ClassifierError> {
        self.loaded().await.map(|_| ())
    }

    // Concurrent first callers wait on the same initialization. A failed
    // load leaves the cell empty so the next call tries again.
    async fn loaded(&self) -> Result<&LoadedModel, ClassifierError> {
        self.model
            .get_or_try_init(|| async {
                tracing::info!(backend = self.backend.name(), "Loading toxicity classifier...");
                let model = self.backend.load().await?;
                let gate = if model.is_reentrant() {
                    None
                } else {
                    Some(Mutex::new(()))
                };
                tracing::info!(backend = self.backend.name(), "Toxicity classifier loaded");
                Ok::<_, ClassifierError>(LoadedModel { model, gate })
            })
            .await
    }

    async fn run(&self, text: &str) -> Result<ClassificationResult, ClassifierError> {
        let loaded = self.loaded().await?;
        let _guard = match &loaded.gate {
            Some(gate) => Some(gate.lock().await),
            None => None,
        };
        let predictions = loaded.model.classify(text).await?;
        normalize(&predictions)
    }

    /// Classify text without applying the failure policy.
    pub async fn try_classify(&self, text: &str) -> Result<ClassificationResult, ClassifierError> {
        tokio::time::timeout(self.timeout, self.run(text))
            .await
            .map_err(|_| ClassifierError::Timeout(self.timeout))?
    }

    /// Classify text, applying the failure policy.
    ///
    /// Under `FailOpen` this never returns an error: failures become
    /// `{score: 0, is_toxic: false}`.
    pub async fn classify(&self, text: &str) -> Result<ClassificationResult, ClassifierError> {
        match self.try_classify(text).await {
            Ok(result) => Ok(result),
            Err(err) => match self.policy {
                FailurePolicy::FailOpen => {
                    tracing::warn!(
                        backend = self.backend.name(),
                        "Classifier unavailable, letting message through unmoderated: {}",
                        err
                    );
                    Ok(ClassificationResult::fail_open())
                }
                FailurePolicy::FailClosed => {
                    tracing::warn!(
                        backend = self.backend.name(),
                        "Classifier unavailable, rejecting message: {}",
                        err
                    );
                    Err(err)
                }
            },
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
