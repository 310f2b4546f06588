//! Ollama provider implementation using the native REST API.
//!
//! - Listing: `GET {base}/api/tags` (no auth, local server)
//! - Streaming: `POST {base}/api/chat`, answered with newline-delimited JSON records
//!
//! Ollama has no multipart content. Text parts are flattened into one string and
//! images ride along as a base64 list on the most recent user message.

use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::Sender;

use crate::inference::provider::{check_status, drain_lines, forward};
use crate::inference::{
    ChatCompletionRequest, ChatProvider, ClientType, ContentPart, Message, MessageContent, Model,
    ProviderError, Role, StreamChunk,
};

pub const DEFAULT_OLLAMA_BASE_URL: &str = "http://localhost:11434";
pub const DEFAULT_OLLAMA_MAX_TOKENS: u32 = 2048;

/// Ollama's tag listing doesn't always report a context length.
const DEFAULT_CONTEXT_WINDOW: u32 = 4096;

/// Prompt used when a message carries images but no text.
const IMAGE_ONLY_PROMPT: &str = "What's in this image?";

// ============================================================================
// Ollama API Types
// ============================================================================

#[derive(Serialize, Debug, PartialEq)]
struct WireMessage {
    role: Role,
    content: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    images: Vec<String>,
}

#[derive(Serialize, Debug)]
struct ChatOptions {
    num_predict: u32,
}

#[derive(Serialize, Debug)]
struct ChatBody {
    model: String,
    messages: Vec<WireMessage>,
    stream: bool,
    options: ChatOptions,
}

#[derive(Deserialize, Debug)]
struct TagList {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Deserialize, Debug)]
struct TagEntry {
    name: String,
    context_length: Option<u32>,
}

/// One NDJSON record from `/api/chat`.
#[derive(Deserialize, Debug)]
struct ChatRecord {
    message: Option<RecordMessage>,
    #[serde(default)]
    done: bool,
    error: Option<String>,
}

#[derive(Deserialize, Debug)]
struct RecordMessage {
    #[serde(default)]
    content: String,
}

// ============================================================================
// Translation Layer
// ============================================================================

/// Flattens messages into Ollama's `{role, content, images?}` shape.
///
/// All image payloads, in order, are attached to the last user message. If there
/// is no user message the request goes out text-only.
fn to_wire(messages: &[Message]) -> Vec<WireMessage> {
    let mut images = Vec::new();
    let mut wire: Vec<WireMessage> = messages
        .iter()
        .map(|message| {
            let content = match &message.content {
                MessageContent::Text(text) => text.clone(),
                MessageContent::Parts(parts) => {
                    let mut text = String::new();
                    let mut had_images = false;
                    for part in parts {
                        match part {
                            ContentPart::Text(t) => text.push_str(t),
                            ContentPart::Image(image) => {
                                had_images = true;
                                images.push(image.base64.clone());
                            }
                        }
                    }
                    let trimmed = text.trim();
                    if had_images && trimmed.is_empty() {
                        IMAGE_ONLY_PROMPT.to_string()
                    } else {
                        trimmed.to_string()
                    }
                }
            };
            WireMessage {
                role: message.role,
                content,
                images: Vec::new(),
            }
        })
        .collect();

    if !images.is_empty() {
        match wire.iter_mut().rev().find(|m| m.role == Role::User) {
            Some(last_user) => {
                info!("Attaching {} images to the last user message", images.len());
                last_user.images = images;
            }
            None => warn!(
                "Dropping {} images: no user message to attach them to",
                images.len()
            ),
        }
    }
    wire
}

fn to_models(list: TagList) -> Vec<Model> {
    list.models
        .into_iter()
        .map(|entry| Model {
            client_type: ClientType::Ollama,
            model_id: entry.name,
            context_window: entry.context_length.unwrap_or(DEFAULT_CONTEXT_WINDOW),
            owned_by: "ollama".to_string(),
        })
        .collect()
}

/// What a single NDJSON line means for the stream.
#[derive(Debug, PartialEq)]
enum RecordLine {
    Delta(String),
    DeltaThenDone(String),
    Done,
    Skip,
}

fn parse_record(line: &str) -> Result<RecordLine, ProviderError> {
    let record = match serde_json::from_str::<ChatRecord>(line) {
        Ok(record) => record,
        Err(e) => {
            warn!("Error parsing Ollama response chunk ({e}): {line}");
            return Ok(RecordLine::Skip);
        }
    };
    if let Some(error) = record.error {
        return Err(ProviderError::Stream(error));
    }
    let text = record.message.map(|m| m.content).unwrap_or_default();
    Ok(match (text.is_empty(), record.done) {
        (false, false) => RecordLine::Delta(text),
        (false, true) => RecordLine::DeltaThenDone(text),
        (true, true) => RecordLine::Done,
        (true, false) => RecordLine::Skip,
    })
}

// ============================================================================
// Provider Implementation
// ============================================================================

/// Ollama provider (local inference server)
pub struct OllamaProvider {
    base_url: String,
    timeout: Duration,
    default_max_tokens: u32,
    client: reqwest::Client,
}

impl OllamaProvider {
    pub fn new(base_url: Option<String>, timeout: Duration, default_max_tokens: u32) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .read_timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                warn!("Failed to build Ollama HTTP client ({e}), using defaults");
                reqwest::Client::new()
            });
        Self {
            base_url: base_url
                .unwrap_or_else(|| DEFAULT_OLLAMA_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            timeout,
            default_max_tokens,
            client,
        }
    }
}

#[async_trait]
impl ChatProvider for OllamaProvider {
    fn client_type(&self) -> ClientType {
        ClientType::Ollama
    }

    async fn list_models(&self) -> Result<Vec<Model>, ProviderError> {
        let url = format!("{}/api/tags", self.base_url);
        debug!("Fetching Ollama models from: {url}");

        let response = self
            .client
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await?;
        let list: TagList = check_status(response).await?.json().await?;
        debug!("Received {} models from Ollama API", list.models.len());

        let models = to_models(list);
        info!("Successfully loaded {} Ollama models", models.len());
        Ok(models)
    }

    async fn stream_chat(
        &self,
        request: ChatCompletionRequest<'_>,
        sender: Sender<StreamChunk>,
    ) -> Result<(), ProviderError> {
        let body = ChatBody {
            model: request.model.to_string(),
            messages: to_wire(request.messages),
            stream: true,
            options: ChatOptions {
                num_predict: request.max_tokens.unwrap_or(self.default_max_tokens),
            },
        };

        info!(
            "Ollama chat request: model={}, messages={}, num_predict={}",
            request.model,
            body.messages.len(),
            body.options.num_predict
        );

        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&body)
            .send()
            .await?;
        debug!("Ollama response status: {}", response.status());
        let mut response = check_status(response).await?;

        let mut buffer: Vec<u8> = Vec::new();
        let mut chunk_count = 0usize;

        while let Some(chunk) = response.chunk().await? {
            buffer.extend_from_slice(&chunk);

            for line in drain_lines(&mut buffer) {
                match parse_record(&line)? {
                    RecordLine::Delta(text) => {
                        chunk_count += 1;
                        forward(&sender, StreamChunk::Content(text)).await?;
                    }
                    RecordLine::DeltaThenDone(text) => {
                        chunk_count += 1;
                        forward(&sender, StreamChunk::Content(text)).await?;
                        info!("Completed Ollama chat stream with {chunk_count} chunks");
                        return forward(&sender, StreamChunk::Done).await;
                    }
                    RecordLine::Done => {
                        info!("Completed Ollama chat stream with {chunk_count} chunks");
                        return forward(&sender, StreamChunk::Done).await;
                    }
                    RecordLine::Skip => {}
                }
            }
        }

        // A final record without a trailing newline.
        let tail = String::from_utf8_lossy(&buffer);
        if !tail.trim().is_empty() {
            match parse_record(tail.trim())? {
                RecordLine::Delta(text) | RecordLine::DeltaThenDone(text) => {
                    forward(&sender, StreamChunk::Content(text)).await?;
                }
                RecordLine::Done | RecordLine::Skip => {}
            }
        }

        info!("Ollama stream ended without done flag: {chunk_count} chunks");
        Ok(())
    }
}
