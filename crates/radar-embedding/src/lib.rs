//! Text embedding for affiliation similarity: the service trait, cosine
//! utilities, an HTTP client for a remote embedding model, and
//! deterministic local embedders for offline sweeps and tests.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info_span, Instrument};

pub const CRATE_NAME: &str = "radar-embedding";

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("embedding service returned status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("embedding response malformed: {0}")]
    Decode(String),
    #[error("embedding dimension mismatch: {left} vs {right}")]
    DimensionMismatch { left: usize, right: usize },
    #[error("no fixture vector registered for {0:?}")]
    UnknownInput(String),
}

/// Text-to-vector encoder. The resolution engine is agnostic to the model
/// behind this trait as long as cosine similarity over its output is
/// meaningful.
#[async_trait]
pub trait EmbeddingService: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    /// Batch encode, returning one vector per input in input order. The
    /// default implementation loops `embed`; remote services override it
    /// to cut request counts.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let mut vectors = Vec::with_capacity(texts.len());
        for text in texts {
            vectors.push(self.embed(text).await?);
        }
        Ok(vectors)
    }
}

/// Cosine similarity clamped into `[0, 1]`. Accumulates in f64 and
/// normalizes by both magnitudes, so inputs need not be unit length.
/// Zero-magnitude inputs score 0.0 rather than erroring.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f64, EmbeddingError> {
    if a.len() != b.len() {
        return Err(EmbeddingError::DimensionMismatch {
            left: a.len(),
            right: b.len(),
        });
    }
    if a.is_empty() {
        return Ok(0.0);
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (&x, &y) in a.iter().zip(b.iter()) {
        let xf = f64::from(x);
        let yf = f64::from(y);
        dot += xf * yf;
        norm_a += xf * xf;
        norm_b += yf * yf;
    }
    if norm_a <= 0.0 || norm_b <= 0.0 {
        return Ok(0.0);
    }

    let similarity = dot / (norm_a.sqrt() * norm_b.sqrt());
    if similarity.is_finite() {
        Ok(similarity.clamp(0.0, 1.0))
    } else {
        Ok(0.0)
    }
}

/// Scale a vector to unit length in place. Zero vectors are left as-is.
pub fn l2_normalize(vector: &mut [f32]) {
    let norm_squared: f64 = vector.iter().map(|&v| f64::from(v) * f64::from(v)).sum();
    if norm_squared <= 0.0 {
        return;
    }
    let inverse = 1.0 / norm_squared.sqrt();
    for value in vector.iter_mut() {
        *value = (f64::from(*value) * inverse) as f32;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_transport_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpEmbeddingConfig {
    pub endpoint: String,
    pub model: Option<String>,
    pub timeout: Duration,
    pub backoff: BackoffPolicy,
    pub user_agent: Option<String>,
}

impl HttpEmbeddingConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            model: None,
            timeout: Duration::from_secs(20),
            backoff: BackoffPolicy::default(),
            user_agent: None,
        }
    }

    /// Endpoint, model, and retry knobs from `RADAR_EMBEDDING_*` variables,
    /// with defaults for anything unset.
    pub fn from_env() -> Self {
        let backoff = BackoffPolicy {
            max_retries: std::env::var("RADAR_EMBEDDING_MAX_RETRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3),
            ..BackoffPolicy::default()
        };
        Self {
            endpoint: std::env::var("RADAR_EMBEDDING_URL")
                .unwrap_or_else(|_| "http://localhost:8601/embed".to_string()),
            model: std::env::var("RADAR_EMBEDDING_MODEL").ok(),
            timeout: std::env::var("RADAR_EMBEDDING_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or_else(|| Duration::from_secs(20)),
            backoff,
            user_agent: std::env::var("RADAR_USER_AGENT").ok(),
        }
    }
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

/// Client for a remote embedding service speaking a plain JSON protocol:
/// POST `{"model"?, "input": [text, ...]}` answered with
/// `{"embeddings": [[f32, ...], ...]}`. Server-side failures (5xx, 429)
/// and transport errors are retried with exponential backoff.
#[derive(Debug)]
pub struct HttpEmbeddingClient {
    client: reqwest::Client,
    config: HttpEmbeddingConfig,
}

impl HttpEmbeddingClient {
    pub fn new(config: HttpEmbeddingConfig) -> Result<Self, EmbeddingError> {
        let mut builder = reqwest::Client::builder().timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build()?;
        Ok(Self { client, config })
    }

    async fn post_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let request = EmbedRequest {
            model: self.config.model.as_deref(),
            input: texts,
        };
        let mut last_transport_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.config.backoff.max_retries {
            let send = self
                .client
                .post(&self.config.endpoint)
                .json(&request)
                .send()
                .instrument(info_span!("embed_request", attempt, inputs = texts.len()));

            match send.await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let body: EmbedResponse = response
                            .json()
                            .await
                            .map_err(|err| EmbeddingError::Decode(err.to_string()))?;
                        if body.embeddings.len() != texts.len() {
                            return Err(EmbeddingError::Decode(format!(
                                "expected {} embeddings, got {}",
                                texts.len(),
                                body.embeddings.len()
                            )));
                        }
                        return Ok(body.embeddings);
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.config.backoff.max_retries
                    {
                        tokio::time::sleep(self.config.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(EmbeddingError::HttpStatus {
                        status: status.as_u16(),
                        url: self.config.endpoint.clone(),
                    });
                }
                Err(err) => {
                    if classify_transport_error(&err) == RetryDisposition::Retryable
                        && attempt < self.config.backoff.max_retries
                    {
                        last_transport_error = Some(err);
                        tokio::time::sleep(self.config.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(EmbeddingError::Request(err));
                }
            }
        }

        match last_transport_error {
            Some(err) => Err(EmbeddingError::Request(err)),
            None => Err(EmbeddingError::Decode(
                "retry loop exhausted without a response".to_string(),
            )),
        }
    }
}

#[async_trait]
impl EmbeddingService for HttpEmbeddingClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let inputs = vec![text.to_string()];
        let mut vectors = self.post_batch(&inputs).await?;
        vectors
            .pop()
            .ok_or_else(|| EmbeddingError::Decode("empty embedding response".to_string()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        self.post_batch(texts).await
    }
}

pub const DEFAULT_HASH_DIMENSION: usize = 256;

const WORD_WEIGHT: f32 = 1.0;
const TRIGRAM_WEIGHT: f32 = 0.5;
const ACRONYM_WEIGHT: f32 = 2.0;

const ACRONYM_STOPWORDS: [&str; 6] = ["of", "the", "and", "for", "de", "la"];

/// Deterministic local embedder: word, character-trigram, and acronym
/// features hashed into a fixed-dimension vector, L2-normalized. No
/// network and stable across runs, which makes it usable for offline
/// sweeps and as a test double.
///
/// The acronym feature is shared between an abbreviation ("MIT") and the
/// initials of its expanded form ("Massachusetts Institute of
/// Technology"), so such pairs score moderately instead of zero.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimension: usize,
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self {
            dimension: DEFAULT_HASH_DIMENSION,
        }
    }
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(8),
        }
    }

    pub fn encode(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        let lowered = text.to_lowercase();
        let words: Vec<&str> = lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .collect();
        if words.is_empty() {
            return vector;
        }

        for word in &words {
            self.bump(&mut vector, &format!("w:{word}"), WORD_WEIGHT);
            for trigram in trigrams(word) {
                self.bump(&mut vector, &format!("t:{trigram}"), TRIGRAM_WEIGHT);
            }
        }
        if let Some(acronym) = acronym_of(&words) {
            self.bump(&mut vector, &format!("a:{acronym}"), ACRONYM_WEIGHT);
        }

        l2_normalize(&mut vector);
        vector
    }

    fn bump(&self, vector: &mut [f32], feature: &str, weight: f32) {
        let digest = Sha256::digest(feature.as_bytes());
        let bucket = u64::from_be_bytes([
            digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6],
            digest[7],
        ]) as usize
            % self.dimension;
        vector[bucket] += weight;
    }
}

#[async_trait]
impl EmbeddingService for HashingEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        Ok(self.encode(text))
    }
}

fn trigrams(word: &str) -> Vec<String> {
    let chars: Vec<char> = word.chars().collect();
    if chars.len() <= 3 {
        return vec![word.to_string()];
    }
    chars
        .windows(3)
        .map(|window| window.iter().collect())
        .collect()
}

/// The acronym feature key for a word list: collapsed initials of a
/// multi-word phrase (stopwords skipped), or a short single token taken
/// as already being an abbreviation.
fn acronym_of(words: &[&str]) -> Option<String> {
    if words.len() == 1 {
        let word = words[0];
        let len = word.chars().count();
        if (2..=6).contains(&len) && word.chars().all(|c| c.is_alphabetic()) {
            return Some(word.to_string());
        }
        return None;
    }

    let initials: String = words
        .iter()
        .filter(|word| !ACRONYM_STOPWORDS.contains(word))
        .filter_map(|word| word.chars().next())
        .collect();
    if initials.chars().count() >= 2 {
        Some(initials)
    } else {
        None
    }
}

/// Test embedder with pinned vectors per input text. Inputs are keyed
/// exactly as given; an unregistered input is an error so fixtures cannot
/// drift silently.
#[derive(Debug, Clone, Default)]
pub struct FixtureEmbedder {
    vectors: HashMap<String, Vec<f32>>,
}

impl FixtureEmbedder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_vector(mut self, text: impl Into<String>, vector: Vec<f32>) -> Self {
        self.vectors.insert(text.into(), vector);
        self
    }
}

#[async_trait]
impl EmbeddingService for FixtureEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.vectors
            .get(text)
            .cloned()
            .ok_or_else(|| EmbeddingError::UnknownInput(text.to_string()))
    }
}
