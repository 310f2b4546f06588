use std::fmt;

use async_trait::async_trait;
use tokio::sync::mpsc::Sender;

use super::types::{ClientType, Message, Model, StreamChunk};

/// Errors that can occur during provider operations.
#[derive(Debug)]
pub enum ProviderError {
    /// Provider misconfigured (missing API key, bad URL).
    Config(String),
    /// Network-level failure (timeout, DNS, connection refused, dropped body).
    Network(String),
    /// API returned a non-success status.
    Api { status: u16, message: String },
    /// Failed to parse the provider's response.
    Parse(String),
    /// The provider reported an error in the middle of a stream.
    Stream(String),
    /// The mpsc channel was closed (the relay dropped the receiver).
    ChannelClosed,
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderError::Config(msg) => write!(f, "config error: {msg}"),
            ProviderError::Network(msg) => write!(f, "network error: {msg}"),
            ProviderError::Api { status, message } => {
                write!(f, "API error (HTTP {status}): {message}")
            }
            ProviderError::Parse(msg) => write!(f, "parse error: {msg}"),
            ProviderError::Stream(msg) => write!(f, "provider error: {msg}"),
            ProviderError::ChannelClosed => write!(f, "channel closed"),
        }
    }
}

impl std::error::Error for ProviderError {}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ProviderError::Network(format!("request timed out: {e}"))
        } else if e.is_decode() {
            ProviderError::Parse(e.to_string())
        } else {
            ProviderError::Network(e.to_string())
        }
    }
}

/// Everything a provider needs to fulfill a streaming chat request.
pub struct ChatCompletionRequest<'a> {
    pub model: &'a str,
    pub messages: &'a [Message],
    pub max_tokens: Option<u32>,
}

#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Which provider this adapter talks to.
    fn client_type(&self) -> ClientType;

    /// Fetches the provider's current model listing.
    async fn list_models(&self) -> Result<Vec<Model>, ProviderError>;

    /// Streams a chat completion, sending text deltas to the provided channel.
    ///
    /// Returns `Ok(())` once the provider's stream has ended normally.
    async fn stream_chat(
        &self,
        request: ChatCompletionRequest<'_>,
        sender: Sender<StreamChunk>,
    ) -> Result<(), ProviderError>;
}

/// Sends a chunk to the relay, mapping a dropped receiver to `ChannelClosed`.
pub(crate) async fn forward(
    sender: &Sender<StreamChunk>,
    chunk: StreamChunk,
) -> Result<(), ProviderError> {
    sender
        .send(chunk)
        .await
        .map_err(|_| ProviderError::ChannelClosed)
}

/// Turns a non-success response into `ProviderError::Api`, keeping the body for context.
pub(crate) async fn check_status(
    response: reqwest::Response,
) -> Result<reqwest::Response, ProviderError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let message = response
        .text()
        .await
        .unwrap_or_else(|_| "unknown error".to_string());
    Err(ProviderError::Api { status, message })
}

/// Splits complete lines off the front of a streaming byte buffer.
///
/// Partial trailing data stays in `buffer` until the next network chunk
/// arrives. Lines are decoded only once complete, so a multi-byte character
/// split across two chunks survives intact.
pub(crate) fn drain_lines(buffer: &mut Vec<u8>) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
        let raw: Vec<u8> = buffer.drain(..=pos).collect();
        let line = String::from_utf8_lossy(&raw).trim().to_string();
        if !line.is_empty() {
            lines.push(line);
        }
    }
    lines
}
