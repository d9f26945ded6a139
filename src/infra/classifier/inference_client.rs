use crate::core::moderation::{ClassifierBackend, ClassifierError, RawPrediction, TextClassifier};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

const WARM_UP_TEXT: &str = "hello";

/// Hosted text-classification endpoint (Hugging Face inference API shape).
///
/// `load()` builds the HTTP client and sends one warm-up request so a cold
/// model is spun up before the first real message.
pub struct InferenceApiBackend {
    endpoint: String,
    model: String,
    api_token: Option<String>,
    request_timeout: Duration,
}

impl InferenceApiBackend {
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            model: model.into(),
            api_token: None,
            request_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_api_token(mut self, token: Option<String>) -> Self {
        self.api_token = token;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    fn url(&self) -> String {
        format!(
            "{}/{}",
            self.endpoint.trim_end_matches('/'),
            self.model.trim_start_matches('/')
        )
    }

    fn build_client(&self) -> Result<Client, ClassifierError> {
        let mut headers = HeaderMap::new();
        headers.insert("Content-Type", HeaderValue::from_static("application/json"));
        if let Some(token) = &self.api_token {
            headers.insert(
                "Authorization",
                HeaderValue::from_str(&format!("Bearer {}", token))
                    .map_err(|e| ClassifierError::Load(e.to_string()))?,
            );
        }

        Client::builder()
            .default_headers(headers)
            .timeout(self.request_timeout)
            .build()
            .map_err(|e| ClassifierError::Load(e.to_string()))
    }
}

#[async_trait]
impl ClassifierBackend for InferenceApiBackend {
    fn name(&self) -> &str {
        &self.model
    }

    async fn load(&self) -> Result<Box<dyn TextClassifier>, ClassifierError> {
        let client = InferenceApiClient {
            client: self.build_client()?,
            url: self.url(),
        };

        client
            .classify(WARM_UP_TEXT)
            .await
            .map_err(|e| ClassifierError::Load(format!("warm-up request failed: {}", e)))?;

        Ok(Box::new(client))
    }
}

pub struct InferenceApiClient {
    client: Client,
    url: String,
}

#[async_trait]
impl TextClassifier for InferenceApiClient {
    async fn classify(&self, text: &str) -> Result<Vec<RawPrediction>, ClassifierError> {
        let payload = json!({
            "inputs": text,
            "options": { "wait_for_model": true },
        });

        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| ClassifierError::Inference(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ClassifierError::Inference(e.to_string()))?;

        if !status.is_success() {
            return Err(ClassifierError::Inference(format!(
                "inference API error: {} - {}",
                status, body
            )));
        }

        parse_predictions(&body)
    }
}

#[derive(Debug, Deserialize)]
struct ApiPrediction {
    label: String,
    score: f64,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum InferenceResponse {
    // One list per input; we only ever send one input.
    Nested(Vec<Vec<ApiPrediction>>),
    Flat(Vec<ApiPrediction>),
    Error { error: String },
}

/// Parse an inference API body into raw predictions.
pub fn parse_predictions(body: &str) -> Result<Vec<RawPrediction>, ClassifierError> {
    let parsed: InferenceResponse = serde_json::from_str(body)
        .map_err(|e| ClassifierError::Inference(format!("unexpected response: {}", e)))?;

    let predictions = match parsed {
        InferenceResponse::Nested(batches) => batches.into_iter().next().unwrap_or_default(),
        InferenceResponse::Flat(predictions) => predictions,
        InferenceResponse::Error { error } => return Err(ClassifierError::Inference(error)),
    };

    Ok(predictions
        .into_iter()
        .map(|p| RawPrediction::new(p.label, p.score))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nested_response() {
        let body = r#"[[{"label":"toxic","score":0.93},{"label":"insult","score":0.41}]]"#;
        let predictions = parse_predictions(body).unwrap();
        assert_eq!(
            predictions,
            vec![
                RawPrediction::new("toxic", 0.93),
                RawPrediction::new("insult", 0.41)
            ]
        );
    }

    #[test]
    fn parses_flat_response() {
        let body = r#"[{"label":"non-toxic","score":0.99}]"#;
        let predictions = parse_predictions(body).unwrap();
        assert_eq!(predictions, vec![RawPrediction::new("non-toxic", 0.99)]);
    }

    #[test]
    fn surfaces_api_errors() {
        let body = r#"{"error":"Model unitary/toxic-bert is currently loading","estimated_time":20.0}"#;
        let err = parse_predictions(body).unwrap_err();
        assert_eq!(
            err,
            ClassifierError::Inference("Model unitary/toxic-bert is currently loading".into())
        );
    }

    #[test]
    fn rejects_unknown_shapes() {
        assert!(matches!(
            parse_predictions(r#"{"labels":["toxic"]}"#),
            Err(ClassifierError::Inference(_))
        ));
        assert!(parse_predictions("not json").is_err());
    }

    #[test]
    fn joins_endpoint_and_model() {
        let backend = InferenceApiBackend::new(
            "https://api-inference.huggingface.co/models/",
            "unitary/toxic-bert",
        );
        assert_eq!(
            backend.url(),
            "https://api-inference.huggingface.co/models/unitary/toxic-bert"
        );
    }

    #[tokio::test]
    async fn unreachable_endpoint_fails_to_load() {
        let backend = InferenceApiBackend::new("http://127.0.0.1:1", "toxic-bert")
            .with_request_timeout(Duration::from_secs(2));

        let err = backend.load().await.err().unwrap();
        assert!(matches!(err, ClassifierError::Load(_)));
    }
}
