//! LLM backend implementations
//!
//! The Ollama-compatible backend supports unary generation with retry and
//! NDJSON streaming into an mpsc channel. Closing the receiver cancels the
//! stream: the reader task notices the send failure and abandons the upstream
//! response, which drops the HTTP connection.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::prompt::Message;
use crate::LlmError;

/// Backend configuration
#[derive(Debug, Clone)]
pub struct RuntimeLlmConfig {
    /// Model name/ID
    pub model: String,
    /// API endpoint
    pub endpoint: String,
    /// API key (optional)
    pub api_key: Option<String>,
    /// Temperature
    pub temperature: f32,
    /// Top-p sampling
    pub top_p: f32,
    /// Request timeout (covers the whole stream)
    pub timeout: Duration,
    /// Maximum retry attempts for transient unary failures
    pub max_retries: u32,
    /// Initial backoff duration (doubles each retry)
    pub initial_backoff: Duration,
    /// Keep model loaded between calls ("5m", "1h", "-1", "0")
    pub keep_alive: String,
}

impl Default for RuntimeLlmConfig {
    fn default() -> Self {
        Self {
            model: "qwen3:4b-instruct".to_string(),
            endpoint: "http://localhost:11434".to_string(),
            api_key: None,
            temperature: 0.2,
            top_p: 0.9,
            timeout: Duration::from_secs(90),
            max_retries: 1,
            initial_backoff: Duration::from_millis(200),
            keep_alive: "5m".to_string(),
        }
    }
}

impl RuntimeLlmConfig {
    pub fn from_settings(cfg: &quarry_config::LlmConfig) -> Self {
        Self {
            model: cfg.model.clone(),
            endpoint: cfg.endpoint.clone(),
            api_key: cfg.api_key.clone(),
            temperature: cfg.temperature,
            top_p: cfg.top_p,
            timeout: Duration::from_secs(cfg.timeout_secs),
            ..Self::default()
        }
    }
}

/// Per-call options
#[derive(Debug, Clone, Default)]
pub struct GenerateOptions {
    pub max_tokens: usize,
    /// JSON schema for constrained decoding, when the backend supports it
    pub format: Option<serde_json::Value>,
}

/// Unary generation result
#[derive(Debug, Clone)]
pub struct GenerationResult {
    pub text: String,
    pub tokens: usize,
    pub total_time_ms: u64,
    pub finish_reason: FinishReason,
}

/// Stats returned after a stream ends
#[derive(Debug, Clone)]
pub struct StreamStats {
    pub tokens: usize,
    pub time_to_first_token_ms: Option<u64>,
    pub total_time_ms: u64,
    pub finish_reason: FinishReason,
}

/// Finish reason
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
    Cancelled,
}

/// One streamed chunk. `content` carries answer text; `thinking` carries
/// model reasoning traces, which callers may discard.
#[derive(Debug, Clone, Default)]
pub struct StreamChunk {
    pub content: String,
    pub thinking: Option<String>,
    pub done: bool,
    pub eval_count: Option<u64>,
}

/// LLM capability
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Unary generation
    async fn generate(
        &self,
        messages: &[Message],
        opts: &GenerateOptions,
    ) -> Result<GenerationResult, LlmError>;

    /// Streaming generation. Chunks are pushed into `tx`; the call returns
    /// stats once the stream ends. A closed receiver cancels the stream with
    /// `LlmError::Cancelled`.
    async fn chat_stream(
        &self,
        messages: &[Message],
        opts: &GenerateOptions,
        tx: mpsc::Sender<StreamChunk>,
    ) -> Result<StreamStats, LlmError>;

    /// Check if the backend is reachable
    async fn is_available(&self) -> bool;

    fn model_name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// Ollama wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct OllamaChatRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<OllamaOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    keep_alive: Option<String>,
    /// JSON schema for constrained decoding
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    think: Option<bool>,
}

#[derive(Debug, Serialize)]
struct OllamaMessage {
    role: String,
    content: String,
}

impl From<&Message> for OllamaMessage {
    fn from(msg: &Message) -> Self {
        Self {
            role: msg.role.to_string(),
            content: msg.content.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<i32>,
}

#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    message: OllamaResponseMessage,
    done: bool,
    eval_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct OllamaResponseMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    thinking: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OllamaStreamChunk {
    message: OllamaResponseMessage,
    done: bool,
    eval_count: Option<u64>,
}

// ---------------------------------------------------------------------------
// Ollama backend
// ---------------------------------------------------------------------------

/// Ollama-compatible backend
#[derive(Clone)]
pub struct OllamaBackend {
    client: Client,
    config: RuntimeLlmConfig,
}

impl OllamaBackend {
    pub fn new(config: RuntimeLlmConfig) -> Result<Self, LlmError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| LlmError::Configuration(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client, config })
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/api{}", self.config.endpoint, path)
    }

    fn build_request(
        &self,
        messages: &[Message],
        opts: &GenerateOptions,
        stream: bool,
    ) -> OllamaChatRequest {
        OllamaChatRequest {
            model: self.config.model.clone(),
            messages: messages.iter().map(|m| m.into()).collect(),
            stream,
            options: Some(OllamaOptions {
                temperature: Some(self.config.temperature),
                top_p: Some(self.config.top_p),
                num_predict: Some(opts.max_tokens as i32),
            }),
            keep_alive: Some(self.config.keep_alive.clone()),
            format: opts.format.clone(),
            think: Some(false),
        }
    }

    async fn execute_request(
        &self,
        request: &OllamaChatRequest,
    ) -> Result<OllamaChatResponse, LlmError> {
        let mut builder = self.client.post(self.api_url("/chat")).json(request);
        if let Some(ref key) = self.config.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder.send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let error = response.text().await.unwrap_or_default();
            // 5xx is retryable, 4xx is not
            if status.is_server_error() {
                return Err(LlmError::Network(format!("server error {}: {}", status, error)));
            }
            return Err(LlmError::Api(error));
        }

        response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl LlmBackend for OllamaBackend {
    async fn generate(
        &self,
        messages: &[Message],
        opts: &GenerateOptions,
    ) -> Result<GenerationResult, LlmError> {
        let start = std::time::Instant::now();
        let request = self.build_request(messages, opts, false);

        let mut last_error = None;
        let mut backoff = self.config.initial_backoff;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                tracing::warn!(
                    "LLM request failed, retrying in {:?} (attempt {}/{})",
                    backoff,
                    attempt,
                    self.config.max_retries
                );
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }

            match self.execute_request(&request).await {
                Ok(result) => {
                    return Ok(GenerationResult {
                        text: result.message.content,
                        tokens: result.eval_count.unwrap_or(0) as usize,
                        total_time_ms: start.elapsed().as_millis() as u64,
                        finish_reason: if result.done {
                            FinishReason::Stop
                        } else {
                            FinishReason::Length
                        },
                    });
                }
                Err(e) if e.is_transient() => {
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| LlmError::Network("max retries exceeded".to_string())))
    }

    async fn chat_stream(
        &self,
        messages: &[Message],
        opts: &GenerateOptions,
        tx: mpsc::Sender<StreamChunk>,
    ) -> Result<StreamStats, LlmError> {
        let start = std::time::Instant::now();
        let mut first_token_time = None;
        let mut total_tokens = 0;

        let request = self.build_request(messages, opts, true);

        let mut builder = self.client.post(self.api_url("/chat")).json(&request);
        if let Some(ref key) = self.config.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder.send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let error = response.text().await.unwrap_or_default();
            if status.is_server_error() {
                return Err(LlmError::Network(format!("server error {}: {}", status, error)));
            }
            return Err(LlmError::Api(error));
        }

        let mut stream = response.bytes_stream();
        // NDJSON lines can straddle network chunks
        let mut buffer = String::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(newline) = buffer.find('\n') {
                let line = buffer[..newline].trim().to_string();
                buffer.drain(..=newline);
                if line.is_empty() {
                    continue;
                }

                let parsed: OllamaStreamChunk = serde_json::from_str(&line)
                    .map_err(|e| LlmError::InvalidResponse(format!("bad stream line: {}", e)))?;

                if first_token_time.is_none() && !parsed.message.content.is_empty() {
                    first_token_time = Some(start.elapsed());
                }
                if !parsed.message.content.is_empty() {
                    total_tokens += 1;
                }

                let done = parsed.done;
                let out = StreamChunk {
                    content: parsed.message.content,
                    thinking: parsed.message.thinking,
                    done,
                    eval_count: parsed.eval_count,
                };

                if tx.send(out).await.is_err() {
                    // Receiver dropped; abandon the upstream stream
                    tracing::debug!("LLM stream receiver dropped, cancelling");
                    return Err(LlmError::Cancelled);
                }

                if done {
                    return Ok(StreamStats {
                        tokens: total_tokens,
                        time_to_first_token_ms: first_token_time.map(|t| t.as_millis() as u64),
                        total_time_ms: start.elapsed().as_millis() as u64,
                        finish_reason: FinishReason::Stop,
                    });
                }
            }
        }

        // Upstream closed without a done marker
        Ok(StreamStats {
            tokens: total_tokens,
            time_to_first_token_ms: first_token_time.map(|t| t.as_millis() as u64),
            total_time_ms: start.elapsed().as_millis() as u64,
            finish_reason: FinishReason::Length,
        })
    }

    async fn is_available(&self) -> bool {
        let url = format!("{}/api/tags", self.config.endpoint);
        matches!(
            tokio::time::timeout(Duration::from_secs(2), self.client.get(&url).send()).await,
            Ok(Ok(resp)) if resp.status().is_success()
        )
    }

    fn model_name(&self) -> &str {
        &self.config.model
    }
}
