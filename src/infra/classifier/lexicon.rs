// Offline keyword classifier.
//
// Each listed term carries a weight in (0, 1). Hits combine as independent
// evidence: score = 1 - prod(1 - weight). Used when no inference endpoint is
// configured and as the fallback when the endpoint cannot be loaded.

use crate::core::moderation::{
    ClassifierBackend, ClassifierError, RawPrediction, TextClassifier, TOXIC_LABEL,
};
use async_trait::async_trait;
use std::collections::HashMap;

pub const NON_TOXIC_LABEL: &str = "non-toxic";

const DEFAULT_TERMS: &[(&str, f64)] = &[
    ("idiot", 0.6),
    ("idiots", 0.6),
    ("moron", 0.65),
    ("stupid", 0.55),
    ("dumb", 0.45),
    ("loser", 0.55),
    ("pathetic", 0.5),
    ("trash", 0.4),
    ("hate", 0.45),
    ("shut", 0.3),
    ("kill", 0.7),
    ("die", 0.6),
];

#[derive(Clone)]
pub struct LexiconBackend {
    terms: HashMap<String, f64>,
}

impl LexiconBackend {
    pub fn new() -> Self {
        Self::with_terms(DEFAULT_TERMS.iter().map(|(term, weight)| (*term, *weight)))
    }

    /// Build a backend from custom `(term, weight)` pairs. Weights are
    /// clamped to [0, 1].
    pub fn with_terms<'a>(terms: impl IntoIterator<Item = (&'a str, f64)>) -> Self {
        Self {
            terms: terms
                .into_iter()
                .map(|(term, weight)| (term.to_lowercase(), weight.clamp(0.0, 1.0)))
                .collect(),
        }
    }
}

impl Default for LexiconBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClassifierBackend for LexiconBackend {
    fn name(&self) -> &str {
        "lexicon"
    }

    async fn load(&self) -> Result<Box<dyn TextClassifier>, ClassifierError> {
        Ok(Box::new(LexiconClassifier {
            terms: self.terms.clone(),
        }))
    }
}

pub struct LexiconClassifier {
    terms: HashMap<String, f64>,
}

impl LexiconClassifier {
    fn score(&self, text: &str) -> f64 {
        let clean = text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter_map(|word| self.terms.get(word))
            .fold(1.0, |clean, weight| clean * (1.0 - weight));
        1.0 - clean
    }
}

#[async_trait]
impl TextClassifier for LexiconClassifier {
    async fn classify(&self, text: &str) -> Result<Vec<RawPrediction>, ClassifierError> {
        let score = self.score(text);
        Ok(vec![
            RawPrediction::new(TOXIC_LABEL, score),
            RawPrediction::new(NON_TOXIC_LABEL, 1.0 - score),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::moderation::normalize;

    async fn classify(backend: &LexiconBackend, text: &str) -> (f64, bool) {
        let model = backend.load().await.unwrap();
        let result = normalize(&model.classify(text).await.unwrap()).unwrap();
        (result.score, result.is_toxic)
    }

    #[tokio::test]
    async fn clean_text_is_not_toxic() {
        let backend = LexiconBackend::new();
        let (score, is_toxic) = classify(&backend, "good morning everyone").await;
        assert!(!is_toxic);
        assert_eq!(score, 1.0);
    }

    #[tokio::test]
    async fn single_hit_uses_term_weight() {
        let backend = LexiconBackend::with_terms([("jerk", 0.7)]);
        let (score, is_toxic) = classify(&backend, "You JERK!").await;
        assert!(is_toxic);
        assert!((score - 0.7).abs() < 1e-9);
    }

    #[tokio::test]
    async fn hits_accumulate() {
        let backend = LexiconBackend::with_terms([("jerk", 0.7), ("clown", 0.6)]);
        let (score, is_toxic) = classify(&backend, "jerk, clown, jerk").await;
        assert!(is_toxic);
        // 1 - 0.3 * 0.4 * 0.3
        assert!((score - 0.964).abs() < 1e-9);
    }

    #[tokio::test]
    async fn matches_whole_words_only() {
        let backend = LexiconBackend::with_terms([("die", 0.9)]);
        let (_, is_toxic) = classify(&backend, "the diet starts tomorrow").await;
        assert!(!is_toxic);
    }
}
