use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::embedding_provider::{EmbeddingBatch, EmbeddingProvider, ProviderError};
use crate::config::EmbeddingConfig;

/// Per-request limit of the batchEmbedContents endpoint.
pub const GEMINI_MAX_BATCH: usize = 100;

const TASK_TYPE: &str = "SEMANTIC_SIMILARITY";

#[derive(Debug, Clone)]
pub struct GeminiProvider {
    api_url: String,
    api_key: String,
    model_id: String,
    dimension: usize,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchEmbedRequest {
    pub requests: Vec<EmbedContentRequest>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbedContentRequest {
    pub model: String,
    pub content: Content,
    pub task_type: &'static str,
    pub output_dimensionality: usize,
}

#[derive(Debug, Serialize)]
pub struct Content {
    pub parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
pub struct Part {
    pub text: String,
}

#[derive(Debug, Deserialize)]
struct BatchEmbedResponse {
    #[serde(default)]
    embeddings: Vec<ContentEmbedding>,
}

#[derive(Debug, Deserialize)]
struct ContentEmbedding {
    #[serde(default)]
    values: Vec<f32>,
}

impl GeminiProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ProviderError::Network(format!("failed to build http client: {e}")))?;
        Ok(Self {
            api_url: config.api_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model_id: config.model_id.clone(),
            dimension: config.dimension,
            client,
        })
    }

    pub fn endpoint(&self) -> String {
        format!("{}/models/{}:batchEmbedContents", self.api_url, self.model_id)
    }
}

pub fn build_batch_request(model_id: &str, dimension: usize, texts: &[String]) -> BatchEmbedRequest {
    let model = format!("models/{model_id}");
    BatchEmbedRequest {
        requests: texts
            .iter()
            .map(|text| EmbedContentRequest {
                model: model.clone(),
                content: Content {
                    parts: vec![Part { text: text.clone() }],
                },
                task_type: TASK_TYPE,
                output_dimensionality: dimension,
            })
            .collect(),
    }
}

/// Empty `values` arrays map to `None`.
pub fn parse_batch_response(body: &str, expected: usize) -> Result<EmbeddingBatch, ProviderError> {
    let parsed: BatchEmbedResponse = serde_json::from_str(body)
        .map_err(|e| ProviderError::MalformedResponse(format!("invalid json: {e}")))?;

    if parsed.embeddings.len() != expected {
        return Err(ProviderError::MalformedResponse(format!(
            "expected {expected} embeddings, got {}",
            parsed.embeddings.len()
        )));
    }

    Ok(parsed
        .embeddings
        .into_iter()
        .map(|e| (!e.values.is_empty()).then_some(e.values))
        .collect())
}

pub fn classify_status(status: u16, body: &str) -> ProviderError {
    let message: String = body.chars().take(500).collect();
    match status {
        401 | 403 => ProviderError::Auth(message),
        429 => ProviderError::Quota(message),
        _ => ProviderError::Api { status, message },
    }
}

fn classify_transport(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout
    } else {
        ProviderError::Network(err.to_string())
    }
}

#[async_trait]
impl EmbeddingProvider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn max_batch_size(&self) -> usize {
        GEMINI_MAX_BATCH
    }

    async fn embed(&self, texts: &[String]) -> Result<EmbeddingBatch, ProviderError> {
        let request = build_batch_request(&self.model_id, self.dimension, texts);

        let response = self
            .client
            .post(self.endpoint())
            .header("x-goog-api-key", &self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        let body = response.text().await.map_err(classify_transport)?;
        if !status.is_success() {
            return Err(classify_status(status.as_u16(), &body));
        }

        tracing::debug!(count = texts.len(), "Gemini batch embedded");
        parse_batch_response(&body, texts.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_shape() {
        let req = build_batch_request("text-embedding-004", 768, &["cat".to_string()]);
        let json = serde_json::to_value(&req).unwrap();
        let first = &json["requests"][0];
        assert_eq!(first["model"], "models/text-embedding-004");
        assert_eq!(first["content"]["parts"][0]["text"], "cat");
        assert_eq!(first["taskType"], "SEMANTIC_SIMILARITY");
        assert_eq!(first["outputDimensionality"], 768);
    }

    #[test]
    fn parses_embeddings_in_order() {
        let body = r#"{"embeddings":[{"values":[0.1,0.2]},{"values":[]},{"values":[1.0,-1.0]}]}"#;
        let out = parse_batch_response(body, 3).unwrap();
        assert_eq!(out, vec![Some(vec![0.1, 0.2]), None, Some(vec![1.0, -1.0])]);
    }

    #[test]
    fn count_mismatch_is_malformed() {
        let body = r#"{"embeddings":[{"values":[0.1]}]}"#;
        assert!(matches!(
            parse_batch_response(body, 2),
            Err(ProviderError::MalformedResponse(_))
        ));
        assert!(matches!(
            parse_batch_response("not json", 1),
            Err(ProviderError::MalformedResponse(_))
        ));
    }

    #[test]
    fn status_classification() {
        assert!(matches!(classify_status(401, ""), ProviderError::Auth(_)));
        assert!(matches!(classify_status(403, ""), ProviderError::Auth(_)));
        assert!(matches!(classify_status(429, ""), ProviderError::Quota(_)));
        let server = classify_status(502, "bad gateway");
        assert!(server.is_transient());
        assert!(!classify_status(400, "").is_transient());
    }

    #[test]
    fn endpoint_strips_trailing_slash() {
        let cfg = EmbeddingConfig {
            api_url: "https://example.test/v1beta/".to_string(),
            model_id: "m".to_string(),
            ..crate::config::EmbeddingConfig::default()
        };
        let provider = GeminiProvider::new(&cfg).unwrap();
        assert_eq!(
            provider.endpoint(),
            "https://example.test/v1beta/models/m:batchEmbedContents"
        );
    }
}
