//! Groq provider implementation using the OpenAI-compatible Chat Completions API.
//!
//! - Listing: `GET {base}/models`, bearer auth
//! - Streaming: `POST {base}/chat/completions` with `stream: true`, answered with
//!   SSE `data:` lines and terminated by `data: [DONE]`

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

pub const DEFAULT_GROQ_BASE_URL: &str = "https://api.groq.com/openai/v1";

/// Listing calls are small; they get a tighter bound than streaming calls.
const LIST_TIMEOUT: Duration = Duration::from_secs(10);

/// Model id markers for speech and moderation models that cannot chat.
const NON_CHAT_MARKERS: [&str; 3] = ["tts", "whisper", "guard"];

// ============================================================================
// Chat Completions API Types
// ============================================================================

#[derive(Serialize, Debug)]
struct WireMessage {
    role: Role,
    content: WireContent,
}

#[derive(Serialize, Debug)]
#[serde(untagged)]
enum WireContent {
    Text(String),
    Parts(Vec<WirePart>),
}

#[derive(Serialize, Debug)]
#[serde(tag = "type")]
enum WirePart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image_url")]
    ImageUrl { image_url: ImageUrl },
}

#[derive(Serialize, Debug)]
struct ImageUrl {
    url: String,
}

/// The request body for a streaming completion.
#[derive(Serialize, Debug)]
struct CompletionBody {
    model: String,
    messages: Vec<WireMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Deserialize, Debug)]
struct ModelList {
    data: Vec<ModelDescriptor>,
}

#[derive(Deserialize, Debug)]
struct ModelDescriptor {
    id: String,
    #[serde(default)]
    context_window: u32,
    #[serde(default = "unknown_owner")]
    owned_by: String,
}

fn unknown_owner() -> String {
    "unknown".to_string()
}

/// One SSE event. Either carries choices or an error object.
#[derive(Deserialize, Debug)]
struct CompletionEvent {
    #[serde(default)]
    choices: Vec<EventChoice>,
    error: Option<EventError>,
}

#[derive(Deserialize, Debug)]
struct EventChoice {
    #[serde(default)]
    delta: Delta,
}

#[derive(Deserialize, Debug, Default)]
struct Delta {
    content: Option<String>,
}

#[derive(Deserialize, Debug)]
struct EventError {
    #[serde(default)]
    message: String,
}

// ============================================================================
// Translation Layer
// ============================================================================

fn to_wire(messages: &[Message]) -> Vec<WireMessage> {
    messages
        .iter()
        .map(|message| WireMessage {
            role: message.role,
            content: match &message.content {
                MessageContent::Text(text) => WireContent::Text(text.clone()),
                MessageContent::Parts(parts) => WireContent::Parts(
                    parts
                        .iter()
                        .map(|part| match part {
                            ContentPart::Text(text) => WirePart::Text { text: text.clone() },
                            ContentPart::Image(image) => WirePart::ImageUrl {
                                image_url: ImageUrl {
                                    url: image.data_url(),
                                },
                            },
                        })
                        .collect(),
                ),
            },
        })
        .collect()
}

fn is_chat_model(id: &str) -> bool {
    let lower = id.to_lowercase();
    !NON_CHAT_MARKERS.iter().any(|marker| lower.contains(marker))
}

fn to_models(list: ModelList) -> Vec<Model> {
    list.data
        .into_iter()
        .filter(|descriptor| is_chat_model(&descriptor.id))
        .map(|descriptor| Model {
            client_type: ClientType::Groq,
            model_id: descriptor.id,
            context_window: descriptor.context_window,
            owned_by: descriptor.owned_by,
        })
        .collect()
}

/// What a single SSE line means for the stream.
#[derive(Debug, PartialEq)]
enum SseLine {
    Delta(String),
    Done,
    Skip,
}

fn parse_sse_line(line: &str) -> Result<SseLine, ProviderError> {
    let Some(data) = line.strip_prefix("data:").map(str::trim) else {
        // `event:`, `id:` and `:` comment lines carry nothing we need.
        return Ok(SseLine::Skip);
    };
    if data == "[DONE]" {
        return Ok(SseLine::Done);
    }
    let event = match serde_json::from_str::<CompletionEvent>(data) {
        Ok(event) => event,
        Err(e) => {
            warn!("Skipping malformed Groq event ({e}): {data}");
            return Ok(SseLine::Skip);
        }
    };
    if let Some(error) = event.error {
        return Err(ProviderError::Stream(error.message));
    }
    match event.choices.into_iter().next().and_then(|c| c.delta.content) {
        Some(text) if !text.is_empty() => Ok(SseLine::Delta(text)),
        _ => Ok(SseLine::Skip),
    }
}

// ============================================================================
// Provider Implementation
// ============================================================================

/// Groq cloud inference API provider
pub struct GroqProvider {
    api_key: Option<String>,
    base_url: String,
    client: reqwest::Client,
}

impl GroqProvider {
    /// Creates a new Groq provider.
    ///
    /// # Arguments
    /// * `api_key` - Groq API key; `None` or blank leaves the provider unavailable
    /// * `base_url` - Optional custom base URL (defaults to Groq's OpenAI-compatible API)
    /// * `timeout` - Connect and idle-read timeout for every call
    pub fn new(api_key: Option<String>, base_url: Option<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .read_timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                warn!("Failed to build Groq HTTP client ({e}), using defaults");
                reqwest::Client::new()
            });
        Self {
            api_key: api_key.filter(|key| !key.trim().is_empty()),
            base_url: base_url
                .unwrap_or_else(|| DEFAULT_GROQ_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            client,
        }
    }

    fn api_key(&self) -> Result<&str, ProviderError> {
        self.api_key
            .as_deref()
            .ok_or_else(|| ProviderError::Config("Groq API key not configured".to_string()))
    }
}

#[async_trait]
impl ChatProvider for GroqProvider {
    fn client_type(&self) -> ClientType {
        ClientType::Groq
    }

    async fn list_models(&self) -> Result<Vec<Model>, ProviderError> {
        let api_key = self.api_key()?;
        let url = format!("{}/models", self.base_url);
        debug!("Fetching Groq models from: {url}");

        let response = self
            .client
            .get(&url)
            .bearer_auth(api_key)
            .timeout(LIST_TIMEOUT)
            .send()
            .await?;
        let list: ModelList = check_status(response).await?.json().await?;
        debug!("Received {} models from Groq API", list.data.len());

        let models = to_models(list);
        info!("Successfully loaded {} Groq models", models.len());
        Ok(models)
    }

    async fn stream_chat(
        &self,
        request: ChatCompletionRequest<'_>,
        sender: Sender<StreamChunk>,
    ) -> Result<(), ProviderError> {
        let api_key = self.api_key()?;
        let body = CompletionBody {
            model: request.model.to_string(),
            messages: to_wire(request.messages),
            stream: true,
            max_tokens: request.max_tokens,
        };

        info!(
            "Groq chat request: model={}, messages={}, max_tokens={:?}",
            request.model,
            body.messages.len(),
            request.max_tokens
        );

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await?;
        debug!("Groq response status: {}", response.status());
        let mut response = check_status(response).await?;

        let mut buffer: Vec<u8> = Vec::new();
        let mut chunk_count = 0usize;

        while let Some(chunk) = response.chunk().await? {
            buffer.extend_from_slice(&chunk);

            for line in drain_lines(&mut buffer) {
                match parse_sse_line(&line)? {
                    SseLine::Delta(text) => {
                        chunk_count += 1;
                        forward(&sender, StreamChunk::Content(text)).await?;
                    }
                    SseLine::Done => {
                        info!("Groq stream complete: {chunk_count} deltas");
                        return forward(&sender, StreamChunk::Done).await;
                    }
                    SseLine::Skip => {}
                }
            }
        }

        info!("Groq stream ended without [DONE]: {chunk_count} deltas");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::ImageData;

    #[test]
    fn test_non_chat_models_are_filtered() {
        let list: ModelList = serde_json::from_str(
            r#"{"data":[
                {"id":"llama-3.3-70b-versatile","context_window":131072,"owned_by":"Meta"},
                {"id":"whisper-large-v3","context_window":448,"owned_by":"OpenAI"},
                {"id":"playai-TTS","context_window":8192,"owned_by":"PlayAI"},
                {"id":"meta-llama/Llama-Guard-4-12B","context_window":131072,"owned_by":"Meta"}
            ]}"#,
        )
        .unwrap();

        let models = to_models(list);
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].model_id, "llama-3.3-70b-versatile");
        assert_eq!(models[0].client_type, ClientType::Groq);
        assert_eq!(models[0].context_window, 131072);
    }

    #[test]
    fn test_descriptor_defaults() {
        let list: ModelList = serde_json::from_str(r#"{"data":[{"id":"m"}]}"#).unwrap();
        let models = to_models(list);
        assert_eq!(models[0].context_window, 0);
        assert_eq!(models[0].owned_by, "unknown");
    }

    #[test]
    fn test_multipart_message_serializes_to_openai_shape() {
        let messages = vec![
            Message::system("Be brief."),
            Message::user_parts(vec![
                ContentPart::Text("What is this?".to_string()),
                ContentPart::Image(ImageData {
                    media_type: "image/png".to_string(),
                    base64: "QUJD".to_string(),
                }),
            ]),
        ];
        let json = serde_json::to_value(to_wire(&messages)).unwrap();
        assert_eq!(
            json,
            serde_json::json!([
                {"role": "system", "content": "Be brief."},
                {"role": "user", "content": [
                    {"type": "text", "text": "What is this?"},
                    {"type": "image_url", "image_url": {"url": "data:image/png;base64,QUJD"}}
                ]}
            ])
        );
    }

    #[test]
    fn test_body_omits_unset_max_tokens() {
        let body = CompletionBody {
            model: "m".to_string(),
            messages: vec![],
            stream: true,
            max_tokens: None,
        };
        let json = serde_json::to_string(&body).unwrap();
        assert_eq!(json, r#"{"model":"m","messages":[],"stream":true}"#);
    }

    #[test]
    fn test_parse_sse_line_variants() {
        assert_eq!(
            parse_sse_line(r#"data: {"choices":[{"delta":{"content":"Hi"}}]}"#).unwrap(),
            SseLine::Delta("Hi".to_string())
        );
        assert_eq!(
            parse_sse_line(r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#).unwrap(),
            SseLine::Skip
        );
        assert_eq!(
            parse_sse_line(r#"data: {"choices":[{"delta":{"content":""}}]}"#).unwrap(),
            SseLine::Skip
        );
        assert_eq!(parse_sse_line("data: [DONE]").unwrap(), SseLine::Done);
        assert_eq!(parse_sse_line("data: {not json").unwrap(), SseLine::Skip);
        assert_eq!(parse_sse_line(": keep-alive").unwrap(), SseLine::Skip);
    }

    #[test]
    fn test_parse_sse_line_error_payload() {
        let result = parse_sse_line(r#"data: {"error":{"message":"model overloaded"}}"#);
        assert!(matches!(result, Err(ProviderError::Stream(msg)) if msg == "model overloaded"));
    }

    #[tokio::test]
    async fn test_missing_api_key_is_config_error() {
        let provider = GroqProvider::new(Some("   ".to_string()), None, Duration::from_secs(1));
        assert!(matches!(
            provider.list_models().await,
            Err(ProviderError::Config(_))
        ));
    }
}
