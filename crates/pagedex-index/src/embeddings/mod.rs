//! Embedding provider trait and the HTTP implementation.
//!
//! Units are embedded in [`EmbedMode::Document`] mode and search strings in
//! [`EmbedMode::Query`] mode; most embedding services tune the two
//! differently, so the mode is part of every call.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::retry::RetryPolicy;

/// Errors that can occur during embedding generation.
#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("API request failed ({status}): {body}")]
    ApiError { status: u16, body: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Rate limited, retry after {0} seconds")]
    RateLimited(u64),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Model returned {actual} dimensions, expected {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Embedding failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<EmbeddingError>,
    },
}

/// Whether text is being embedded for storage or for a search query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbedMode {
    Query,
    Document,
}

impl EmbedMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Query => "query",
            Self::Document => "document",
        }
    }
}

/// Trait for embedding providers.
///
/// Implementations should be Send + Sync to allow use in async contexts.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a single text. Empty input yields an empty vector.
    async fn embed(&self, text: &str, mode: EmbedMode) -> Result<Vec<f32>, EmbeddingError>;

    /// Get the number of dimensions
    fn dimensions(&self) -> usize;

    /// Get the model name
    fn model_name(&self) -> &str;
}

/// Request body for the embedding service
#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    text: &'a str,
    mode: EmbedMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
}

/// Response from the embedding service
#[derive(Deserialize)]
struct EmbeddingResponse {
    vector: Vec<f32>,
}

/// Embedding provider backed by an HTTP service.
///
/// The service receives `{"text": ..., "mode": "query"|"document"}` and
/// answers `{"vector": [...]}`.
pub struct HttpEmbeddings {
    base_url: String,
    api_key: Option<String>,
    model: Option<String>,
    dimensions: usize,
    timeout: Duration,
    retry: RetryPolicy,
    client: Client,
}

impl HttpEmbeddings {
    /// Create a new provider for the service at `base_url`.
    pub fn new(base_url: impl Into<String>, dimensions: usize) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: None,
            model: None,
            dimensions,
            timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            client: Client::new(),
        }
    }

    /// Send a bearer token with every request.
    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key;
        self
    }

    /// Ask the service for a specific model.
    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    /// Override the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Override the per-attempt timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Get the retry policy.
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Single request, no retries.
    async fn send_once(&self, text: &str, mode: EmbedMode) -> Result<Vec<f32>, EmbeddingError> {
        let body = EmbeddingRequest {
            text,
            mode,
            model: self.model.as_deref(),
        };

        let mut request = self
            .client
            .post(&self.base_url)
            .timeout(self.timeout)
            .json(&body);
        if let Some(ref key) = self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| EmbeddingError::NetworkError(e.to_string()))?;
        let status = response.status();

        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(0);
            return Err(EmbeddingError::RateLimited(retry_after));
        }

        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(EmbeddingError::ApiError {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| EmbeddingError::InvalidResponse(e.to_string()))?;

        if parsed.vector.len() != self.dimensions {
            return Err(EmbeddingError::DimensionMismatch {
                expected: self.dimensions,
                actual: parsed.vector.len(),
            });
        }

        Ok(parsed.vector)
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddings {
    async fn embed(&self, text: &str, mode: EmbedMode) -> Result<Vec<f32>, EmbeddingError> {
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }

        let started = Instant::now();
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            debug!(
                "Embedding {} chars in {} mode (attempt {}/{})",
                text.len(),
                mode.as_str(),
                attempt,
                max_attempts
            );

            let err = match self.send_once(text, mode).await {
                Ok(vector) => return Ok(vector),
                // A misconfigured model answers the same way every time
                Err(e @ EmbeddingError::DimensionMismatch { .. }) => return Err(e),
                Err(e) => e,
            };

            if attempt >= max_attempts {
                return Err(EmbeddingError::RetriesExhausted {
                    attempts: attempt,
                    last: Box::new(err),
                });
            }

            let delay = match &err {
                EmbeddingError::RateLimited(secs) if *secs > 0 => {
                    Duration::from_secs(*secs).min(self.retry.max_delay)
                }
                _ => self.retry.delay_for(attempt),
            };

            if started.elapsed() + delay > self.retry.max_elapsed {
                warn!("Embedding retry window exhausted after {} attempts", attempt);
                return Err(EmbeddingError::RetriesExhausted {
                    attempts: attempt,
                    last: Box::new(err),
                });
            }

            warn!(
                "Embedding request failed: {}, retrying in {:?} (attempt {}/{})",
                err, delay, attempt, max_attempts
            );
            tokio::time::sleep(delay).await;
        }
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_name(&self) -> &str {
        self.model.as_deref().unwrap_or("default")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{FailureKind, IndexError};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one scripted response per connection and record request bodies.
    async fn scripted_server(
        responses: Vec<(u16, String)>,
    ) -> (String, Arc<AtomicUsize>, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let bodies = Arc::new(Mutex::new(Vec::new()));

        let hits_task = hits.clone();
        let bodies_task = bodies.clone();
        tokio::spawn(async move {
            for (status, body) in responses {
                let (mut socket, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => return,
                };
                let request = read_request(&mut socket).await;
                hits_task.fetch_add(1, Ordering::SeqCst);
                bodies_task.lock().unwrap().push(request);

                let response = format!(
                    "HTTP/1.1 {} Scripted\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });

        (format!("http://{}/embed", addr), hits, bodies)
    }

    /// Read one HTTP request and return its body.
    async fn read_request(socket: &mut tokio::net::TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = socket.read(&mut chunk).await.unwrap_or(0);
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);

            let text = String::from_utf8_lossy(&buf).to_string();
            if let Some(header_end) = text.find("\r\n\r\n") {
                let content_length = text[..header_end]
                    .lines()
                    .find_map(|line| {
                        let lower = line.to_ascii_lowercase();
                        lower
                            .strip_prefix("content-length:")
                            .and_then(|v| v.trim().parse::<usize>().ok())
                    })
                    .unwrap_or(0);
                if buf.len() >= header_end + 4 + content_length {
                    return text[header_end + 4..].to_string();
                }
            }
        }
        String::new()
    }

    fn ok_body(dims: usize) -> String {
        serde_json::json!({ "vector": vec![0.5f32; dims] }).to_string()
    }

    #[test]
    fn test_provider_creation() {
        let provider = HttpEmbeddings::new("http://localhost:8080/embed", 384);
        assert_eq!(provider.dimensions(), 384);
        assert_eq!(provider.model_name(), "default");
        assert_eq!(provider.retry_policy().max_attempts, 3);
    }

    #[test]
    fn test_provider_custom_model() {
        let provider = HttpEmbeddings::new("http://localhost:8080/embed", 1024)
            .with_model(Some("custom/model".to_string()));
        assert_eq!(provider.model_name(), "custom/model");
    }

    #[test]
    fn test_embed_mode_serialization() {
        assert_eq!(serde_json::to_string(&EmbedMode::Query).unwrap(), "\"query\"");
        assert_eq!(
            serde_json::to_string(&EmbedMode::Document).unwrap(),
            "\"document\""
        );
    }

    #[tokio::test]
    async fn test_empty_input_makes_no_call() {
        // Nothing listens here; a request would fail.
        let provider = HttpEmbeddings::new("http://127.0.0.1:9/embed", 4)
            .with_retry(RetryPolicy::immediate(1));
        assert!(provider.embed("", EmbedMode::Document).await.unwrap().is_empty());
        assert!(provider.embed("   ", EmbedMode::Query).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_retries_transient_failures() {
        let (url, hits, _) = scripted_server(vec![
            (500, "boom".to_string()),
            (503, "busy".to_string()),
            (200, ok_body(4)),
        ])
        .await;

        let provider = HttpEmbeddings::new(url, 4).with_retry(RetryPolicy::immediate(3));
        let vector = provider.embed("hello world", EmbedMode::Document).await.unwrap();

        assert_eq!(vector, vec![0.5; 4]);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let (url, hits, _) = scripted_server(vec![
            (500, "a".to_string()),
            (500, "b".to_string()),
            (500, "c".to_string()),
            (200, ok_body(4)),
        ])
        .await;

        let provider = HttpEmbeddings::new(url, 4).with_retry(RetryPolicy::immediate(3));
        let err = provider
            .embed("hello world", EmbedMode::Document)
            .await
            .unwrap_err();

        match err {
            EmbeddingError::RetriesExhausted { attempts, last } => {
                assert_eq!(attempts, 3);
                assert!(matches!(*last, EmbeddingError::ApiError { status: 500, .. }));
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_wrong_dimensions_fail_without_retry() {
        let (url, hits, _) = scripted_server(vec![
            (200, ok_body(3)),
            (200, ok_body(3)),
            (200, ok_body(3)),
        ])
        .await;

        let provider = HttpEmbeddings::new(url, 4).with_retry(RetryPolicy::immediate(3));
        let err = provider
            .embed("hello world", EmbedMode::Document)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            EmbeddingError::DimensionMismatch {
                expected: 4,
                actual: 3
            }
        ));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let err: IndexError = err.into();
        assert!(matches!(err, IndexError::DimensionMismatch { .. }));
        assert_eq!(err.kind(), FailureKind::Fatal);
    }

    #[tokio::test]
    async fn test_malformed_body_is_retried() {
        let (url, hits, _) = scripted_server(vec![
            (200, "{\"nope\": true}".to_string()),
            (200, ok_body(2)),
        ])
        .await;

        let provider = HttpEmbeddings::new(url, 2).with_retry(RetryPolicy::immediate(3));
        assert!(provider.embed("hello world", EmbedMode::Query).await.is_ok());
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_request_carries_mode_and_model() {
        let (url, _, bodies) = scripted_server(vec![(200, ok_body(2))]).await;

        let provider = HttpEmbeddings::new(url, 2)
            .with_model(Some("mini".to_string()))
            .with_retry(RetryPolicy::immediate(1));
        provider.embed("find foxes", EmbedMode::Query).await.unwrap();

        let bodies = bodies.lock().unwrap();
        let sent: serde_json::Value = serde_json::from_str(&bodies[0]).unwrap();
        assert_eq!(sent["mode"], "query");
        assert_eq!(sent["text"], "find foxes");
        assert_eq!(sent["model"], "mini");
    }
}
