//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use pagedex_index::{
    Database, EmbedMode, EmbeddingError, EmbeddingProvider, MemoryVectorStore, PageIndex,
    PageIndexConfig, QueueConfig, RetryPolicy,
};

pub const DIMS: usize = 256;

/// Bag-of-words embedder: every word bumps one hashed bucket.
pub struct MockEmbeddingProvider {
    dimensions: usize,
    failing: AtomicBool,
    calls: AtomicUsize,
    document_texts: Mutex<Vec<String>>,
}

impl MockEmbeddingProvider {
    pub fn new(dimensions: usize) -> Arc<Self> {
        Arc::new(Self {
            dimensions,
            failing: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
            document_texts: Mutex::new(Vec::new()),
        })
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Successful embedding calls in either mode.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Texts embedded in document mode, in call order.
    pub fn document_texts(&self) -> Vec<String> {
        self.document_texts.lock().unwrap().clone()
    }
}

#[async_trait]
impl EmbeddingProvider for MockEmbeddingProvider {
    async fn embed(&self, text: &str, mode: EmbedMode) -> Result<Vec<f32>, EmbeddingError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(EmbeddingError::NetworkError("connection refused".to_string()));
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        if mode == EmbedMode::Document {
            self.document_texts.lock().unwrap().push(text.to_string());
        }
        Ok(bag_of_words(text, self.dimensions))
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_name(&self) -> &str {
        "mock-bag-of-words"
    }
}

pub fn bag_of_words(text: &str, dimensions: usize) -> Vec<f32> {
    let mut vector = vec![0.0; dimensions];
    for word in text.split_whitespace() {
        let word: String = word
            .chars()
            .filter(|c| c.is_alphanumeric())
            .flat_map(char::to_lowercase)
            .collect();
        if word.is_empty() {
            continue;
        }
        // FNV-1a
        let mut hash: u64 = 0xcbf29ce484222325;
        for byte in word.bytes() {
            hash ^= byte as u64;
            hash = hash.wrapping_mul(0x100000001b3);
        }
        vector[(hash % dimensions as u64) as usize] += 1.0;
    }
    if vector.iter().all(|v| *v == 0.0) {
        vector[0] = 1.0;
    }
    vector
}

pub struct Harness {
    pub index: PageIndex,
    pub embeddings: Arc<MockEmbeddingProvider>,
    pub vectors: Arc<MemoryVectorStore>,
}

pub fn config(max_attempts: u32, backoff: Duration) -> PageIndexConfig {
    PageIndexConfig {
        queue: QueueConfig {
            max_attempts,
            backoff: RetryPolicy {
                base_delay: backoff,
                max_delay: backoff,
                jitter: 0.0,
                ..RetryPolicy::default()
            },
        },
        ..PageIndexConfig::default()
    }
}

pub async fn harness() -> Harness {
    harness_with(
        Database::in_memory().unwrap(),
        DIMS,
        DIMS,
        config(5, Duration::from_secs(3600)),
    )
    .await
}

pub async fn harness_with(
    db: Database,
    store_dims: usize,
    embed_dims: usize,
    config: PageIndexConfig,
) -> Harness {
    let embeddings = MockEmbeddingProvider::new(embed_dims);
    let vectors = Arc::new(MemoryVectorStore::new(store_dims));
    let index = PageIndex::open(db, vectors.clone(), embeddings.clone(), config, None)
        .await
        .unwrap();
    Harness {
        index,
        embeddings,
        vectors,
    }
}

pub fn text(value: &str) -> Value {
    json!({ "type": "text", "text": value })
}

pub fn paragraph(id: &str, content: Vec<Value>) -> Value {
    json!({ "type": "paragraph", "id": id, "content": content })
}

pub fn page_ref(page_id: &str, label: &str) -> Value {
    json!({ "type": "pageRef", "attrs": { "pageId": page_id, "label": label } })
}

pub fn block_ref(page_id: &str, block_id: &str) -> Value {
    json!({ "type": "blockRef", "attrs": { "pageId": page_id, "blockId": block_id } })
}

/// Serialized page of plain paragraphs.
pub fn page(paragraphs: &[(&str, &str)]) -> String {
    doc(paragraphs
        .iter()
        .map(|(id, body)| paragraph(id, vec![text(body)]))
        .collect())
}

pub fn doc(content: Vec<Value>) -> String {
    json!({ "type": "doc", "content": content }).to_string()
}

/// Embedding service that answers every request with a vector of
/// `dimensions` zeros-and-ones. Returns its URL and a request counter.
pub async fn fixed_length_embedding_server(dimensions: usize) -> (String, Arc<AtomicUsize>) {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let hits_task = hits.clone();

    tokio::spawn(async move {
        let vector: Vec<f32> = (0..dimensions).map(|i| (i % 2) as f32).collect();
        let body = json!({ "vector": vector }).to_string();
        while let Ok((mut socket, _)) = listener.accept().await {
            // Requests are small; wait for the end of the body
            let mut buf = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                let n = socket.read(&mut chunk).await.unwrap_or(0);
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
                let text = String::from_utf8_lossy(&buf).to_string();
                if let Some(end) = text.find("\r\n\r\n") {
                    let length = text[..end]
                        .lines()
                        .find_map(|l| {
                            l.to_ascii_lowercase()
                                .strip_prefix("content-length:")
                                .and_then(|v| v.trim().parse::<usize>().ok())
                        })
                        .unwrap_or(0);
                    if buf.len() >= end + 4 + length {
                        break;
                    }
                }
            }
            hits_task.fetch_add(1, Ordering::SeqCst);

            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            let _ = socket.write_all(response.as_bytes()).await;
            let _ = socket.shutdown().await;
        }
    });

    (format!("http://{}/embed", addr), hits)
}
