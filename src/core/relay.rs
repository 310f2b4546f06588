//! # Streaming Relay
//!
//! Drives one provider stream and forwards its text to a client connection in
//! batches, then closes the exchange with exactly one terminal status.
//!
//! ```text
//! provider task ──StreamChunk──▶ mpsc ──▶ ChunkBatcher ──{chunk}──▶ ChatSink
//!                                               │
//!                      end of stream ───────────┴──▶ {finish_reason}
//! ```
//!
//! The batching policy is the same for every provider:
//! flush when the buffer reaches 20 characters, when 50ms have passed since
//! the last flush, or when a fragment is nothing but whitespace/punctuation.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::inference::{ChatCompletionRequest, ChatProvider, Message, ProviderError, StreamChunk};

pub const BATCH_SIZE: usize = 20;
pub const BATCH_TIMEOUT: Duration = Duration::from_millis(50);
/// Pause after each flushed chunk so a fast provider can't flood the client.
pub const SEND_PAUSE: Duration = Duration::from_millis(1);

const CHANNEL_CAPACITY: usize = 100;

// ============================================================================
// Client-facing messages
// ============================================================================

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FinishReason {
    Completed,
    Error,
}

/// Everything the server sends during one exchange.
///
/// Serialized untagged, so each variant is a single-key JSON object:
/// `{"chunk": ...}`, `{"error": ...}` or `{"finish_reason": ...}`.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum ServerMessage {
    Chunk { chunk: String },
    Error { error: String },
    Finish { finish_reason: FinishReason },
}

impl ServerMessage {
    pub fn chunk(text: impl Into<String>) -> Self {
        ServerMessage::Chunk { chunk: text.into() }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            error: message.into(),
        }
    }

    pub fn finish(reason: FinishReason) -> Self {
        ServerMessage::Finish {
            finish_reason: reason,
        }
    }
}

/// Why a message could not be delivered to the client.
#[derive(Debug)]
pub enum SinkError {
    /// The connection is gone. Nothing more can be sent on it.
    Closed,
    /// The message could not be encoded for the wire.
    Encode(String),
}

impl fmt::Display for SinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SinkError::Closed => write!(f, "client connection closed"),
            SinkError::Encode(msg) => write!(f, "encode error: {msg}"),
        }
    }
}

impl std::error::Error for SinkError {}

/// The client side of an exchange.
#[async_trait]
pub trait ChatSink: Send {
    async fn send(&mut self, message: ServerMessage) -> Result<(), SinkError>;
}

/// Sends `{error}` then `{finish_reason: "error"}`.
pub async fn send_failure<S: ChatSink + ?Sized>(
    sink: &mut S,
    message: impl Into<String>,
) -> Result<(), SinkError> {
    sink.send(ServerMessage::error(message)).await?;
    sink.send(ServerMessage::finish(FinishReason::Error)).await
}

// ============================================================================
// Batching
// ============================================================================

#[derive(Debug, Clone)]
pub struct BatchPolicy {
    pub max_chars: usize,
    pub max_delay: Duration,
    pub send_pause: Duration,
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self {
            max_chars: BATCH_SIZE,
            max_delay: BATCH_TIMEOUT,
            send_pause: SEND_PAUSE,
        }
    }
}

/// Non-ASCII punctuation that models commonly emit in prose and CJK text.
fn is_unicode_punctuation(c: char) -> bool {
    matches!(
        c,
        '\u{2010}'..='\u{2027}'
            | '\u{2030}'..='\u{205E}'
            | '\u{3001}'..='\u{3003}'
            | '\u{3008}'..='\u{3011}'
            | '\u{FF01}'..='\u{FF0F}'
            | '\u{FF1A}'..='\u{FF1F}'
            | '\u{FF5E}'
            | '¡'
            | '¿'
            | '«'
            | '»'
            | '·'
    )
}

/// True for fragments that should reach the client right away.
fn flushes_immediately(fragment: &str) -> bool {
    fragment
        .chars()
        .all(|c| c.is_whitespace() || c.is_ascii_punctuation() || is_unicode_punctuation(c))
}

/// Accumulates fragments and decides when a batch is ready.
///
/// Pure state machine: the caller supplies the clock, which keeps the
/// thresholds testable without sleeping.
#[derive(Debug)]
pub struct ChunkBatcher {
    policy: BatchPolicy,
    buffer: String,
    buffered_chars: usize,
    last_flush: Instant,
}

impl ChunkBatcher {
    pub fn new(policy: BatchPolicy, started: Instant) -> Self {
        Self {
            policy,
            buffer: String::new(),
            buffered_chars: 0,
            last_flush: started,
        }
    }

    /// Appends a fragment. Returns the batch to send if a flush rule fired.
    pub fn push(&mut self, fragment: &str, now: Instant) -> Option<String> {
        if fragment.is_empty() {
            return None;
        }
        self.buffer.push_str(fragment);
        self.buffered_chars += fragment.chars().count();

        let should_send = self.buffered_chars >= self.policy.max_chars
            || now.saturating_duration_since(self.last_flush) >= self.policy.max_delay
            || flushes_immediately(fragment);

        if should_send {
            self.last_flush = now;
            self.take()
        } else {
            None
        }
    }

    /// Whatever is left once the stream has ended.
    pub fn finish(&mut self) -> Option<String> {
        self.take()
    }

    fn take(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        self.buffered_chars = 0;
        Some(std::mem::take(&mut self.buffer))
    }
}

// ============================================================================
// Relay
// ============================================================================

/// An owned chat request, ready to be moved into the provider task.
#[derive(Debug, Clone)]
pub struct RelayRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub max_tokens: Option<u32>,
}

/// Aborts the provider task if the relay is dropped mid-stream
/// (client disconnect, or the exchange future being cancelled).
struct AbortOnDrop(JoinHandle<Result<(), ProviderError>>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[derive(Debug, Clone, Default)]
pub struct StreamingRelay {
    policy: BatchPolicy,
}

impl StreamingRelay {
    pub fn new(policy: BatchPolicy) -> Self {
        Self { policy }
    }

    /// Streams `request` through `provider` into `sink`.
    ///
    /// Provider failures are reported to the client and return
    /// `Ok(FinishReason::Error)`. `Err` means the client itself is gone.
    pub async fn run<S: ChatSink + ?Sized>(
        &self,
        provider: Arc<dyn ChatProvider>,
        request: RelayRequest,
        sink: &mut S,
    ) -> Result<FinishReason, SinkError> {
        let client_type = provider.client_type();
        let model_id = request.model.clone();
        info!("Using {client_type} client for model: {model_id}");

        let (tx, mut rx) = mpsc::channel::<StreamChunk>(CHANNEL_CAPACITY);
        let mut task = AbortOnDrop(tokio::spawn(async move {
            let RelayRequest {
                model,
                messages,
                max_tokens,
            } = request;
            provider
                .stream_chat(
                    ChatCompletionRequest {
                        model: &model,
                        messages: &messages,
                        max_tokens,
                    },
                    tx,
                )
                .await
        }));

        let mut batcher = ChunkBatcher::new(self.policy.clone(), Instant::now());
        let mut sent_chunks = 0usize;

        while let Some(chunk) = rx.recv().await {
            match chunk {
                StreamChunk::Content(text) => {
                    if let Some(batch) = batcher.push(&text, Instant::now()) {
                        debug!("Sending batched chunk of {} characters", batch.chars().count());
                        sink.send(ServerMessage::chunk(batch)).await?;
                        sent_chunks += 1;
                        tokio::time::sleep(self.policy.send_pause).await;
                    }
                }
                StreamChunk::Done => break,
            }
        }
        // Stop accepting chunks so a provider still writing sees ChannelClosed.
        drop(rx);

        let outcome = match (&mut task.0).await {
            Ok(result) => result,
            Err(join_error) => Err(ProviderError::Stream(format!(
                "provider task failed: {join_error}"
            ))),
        };

        match outcome {
            Ok(()) | Err(ProviderError::ChannelClosed) => {
                if let Some(rest) = batcher.finish() {
                    debug!("Sending final chunk of {} characters", rest.chars().count());
                    sink.send(ServerMessage::chunk(rest)).await?;
                    sent_chunks += 1;
                }
                sink.send(ServerMessage::finish(FinishReason::Completed))
                    .await?;
                info!("Completed {client_type} chat response for model: {model_id} ({sent_chunks} chunks)");
                Ok(FinishReason::Completed)
            }
            Err(e) => {
                error!("Error streaming {model_id} from {client_type}: {e}");
                if !batcher.buffer.is_empty() {
                    warn!(
                        "Discarding {} undelivered characters after stream error",
                        batcher.buffered_chars
                    );
                }
                send_failure(sink, format!("Error: {e}")).await?;
                Ok(FinishReason::Error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::ClientType;
    use crate::test_support::{RecordingSink, ScriptedProvider};

    fn request() -> RelayRequest {
        RelayRequest {
            model: "llama3".to_string(),
            messages: vec![Message::user("hi")],
            max_tokens: None,
        }
    }

    async fn relay(provider: ScriptedProvider, sink: &mut RecordingSink) -> Result<FinishReason, SinkError> {
        StreamingRelay::default()
            .run(Arc::new(provider), request(), sink)
            .await
    }

    #[test]
    fn test_server_message_wire_shape() {
        let cases = [
            (ServerMessage::chunk("Hi"), r#"{"chunk":"Hi"}"#),
            (ServerMessage::error("boom"), r#"{"error":"boom"}"#),
            (ServerMessage::finish(FinishReason::Completed), r#"{"finish_reason":"completed"}"#),
            (ServerMessage::finish(FinishReason::Error), r#"{"finish_reason":"error"}"#),
        ];
        for (message, expected) in cases {
            assert_eq!(serde_json::to_string(&message).unwrap(), expected);
        }
    }

    #[test]
    fn test_flushes_immediately() {
        assert!(flushes_immediately("."));
        assert!(flushes_immediately(" \n"));
        assert!(flushes_immediately(", "));
        assert!(!flushes_immediately("a."));
        assert!(!flushes_immediately("world"));
        assert!(flushes_immediately("…"));
        assert!(flushes_immediately("。"));
        assert!(flushes_immediately("」、"));
        assert!(flushes_immediately(" ¿"));
        assert!(!flushes_immediately("é"));
        assert!(!flushes_immediately("日本"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_batcher_size_threshold_counts_chars() {
        let now = Instant::now();
        let mut batcher = ChunkBatcher::new(BatchPolicy::default(), now);

        assert_eq!(batcher.push("abcdefghij", now), None);
        assert_eq!(batcher.push("ééééééééé", now), None);
        assert_eq!(batcher.push("k", now), Some("abcdefghijééééééééék".to_string()));
        assert_eq!(batcher.finish(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batcher_time_threshold() {
        let start = Instant::now();
        let mut batcher = ChunkBatcher::new(BatchPolicy::default(), start);

        assert_eq!(batcher.push("ab", start + Duration::from_millis(10)), None);
        assert_eq!(
            batcher.push("cd", start + Duration::from_millis(50)),
            Some("abcd".to_string())
        );
        // The clock restarts at the flush.
        assert_eq!(batcher.push("ef", start + Duration::from_millis(90)), None);
        assert_eq!(batcher.finish(), Some("ef".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_batcher_punctuation_flushes_buffer() {
        let now = Instant::now();
        let mut batcher = ChunkBatcher::new(BatchPolicy::default(), now);

        assert_eq!(batcher.push("Hi", now), None);
        assert_eq!(batcher.push(".", now), Some("Hi.".to_string()));
        assert_eq!(batcher.push("", now), None);
        assert_eq!(batcher.finish(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batcher_unicode_punctuation_flushes_buffer() {
        let now = Instant::now();
        let mut batcher = ChunkBatcher::new(BatchPolicy::default(), now);

        assert_eq!(batcher.push("Hi", now), None);
        assert_eq!(batcher.push("…", now), Some("Hi…".to_string()));
        assert_eq!(batcher.push("こんにちは", now), None);
        assert_eq!(batcher.push("。", now), Some("こんにちは。".to_string()));
        assert_eq!(batcher.finish(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_relay_concatenates_fragments_in_order() {
        let provider = ScriptedProvider::new(ClientType::Ollama, &[])
            .with_fragments(&["Hel", "lo", ",", " world", "!"]);
        let mut sink = RecordingSink::new();

        let reason = relay(provider, &mut sink).await.unwrap();

        assert_eq!(reason, FinishReason::Completed);
        assert_eq!(sink.chunks(), vec!["Hello,", " world!"]);
        assert_eq!(sink.text(), "Hello, world!");
        assert_eq!(
            sink.messages.last(),
            Some(&ServerMessage::finish(FinishReason::Completed))
        );
        assert!(sink.errors().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_relay_flushes_slow_fragments_individually() {
        let provider = ScriptedProvider::new(ClientType::Groq, &[])
            .with_fragments(&["a", "b", "c"])
            .with_fragment_delay(Duration::from_millis(60));
        let mut sink = RecordingSink::new();

        relay(provider, &mut sink).await.unwrap();

        assert_eq!(sink.chunks(), vec!["a", "b", "c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_relay_holds_fast_fragments_until_end() {
        let provider = ScriptedProvider::new(ClientType::Groq, &[])
            .with_fragments(&["ab", "cd", "ef"]);
        let mut sink = RecordingSink::new();

        relay(provider, &mut sink).await.unwrap();

        assert_eq!(sink.chunks(), vec!["abcdef"]);
        assert_eq!(sink.finish_reasons(), vec![FinishReason::Completed]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_relay_empty_stream_completes_without_chunks() {
        let provider = ScriptedProvider::new(ClientType::Ollama, &[]);
        let mut sink = RecordingSink::new();

        relay(provider, &mut sink).await.unwrap();

        assert_eq!(
            sink.messages,
            vec![ServerMessage::finish(FinishReason::Completed)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_relay_provider_error_ends_with_single_error_finish() {
        let provider = ScriptedProvider::new(ClientType::Groq, &[])
            .with_fragments(&["Hel", "lo"])
            .failing_stream_after(2, "model overloaded");
        let mut sink = RecordingSink::new();

        let reason = relay(provider, &mut sink).await.unwrap();

        assert_eq!(reason, FinishReason::Error);
        assert_eq!(sink.errors(), vec!["Error: provider error: model overloaded"]);
        assert_eq!(sink.finish_reasons(), vec![FinishReason::Error]);
        assert_eq!(
            sink.messages.last(),
            Some(&ServerMessage::finish(FinishReason::Error))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_relay_stops_when_client_disconnects() {
        let provider = Arc::new(
            ScriptedProvider::new(ClientType::Groq, &[])
                .with_fragments(&["one.", "two.", "three."])
                .with_fragment_delay(Duration::from_millis(60)),
        );
        let mut sink = RecordingSink::closing_after(1);

        let result = StreamingRelay::default()
            .run(provider.clone(), request(), &mut sink)
            .await;

        assert!(matches!(result, Err(SinkError::Closed)));
        assert_eq!(sink.chunks(), vec!["one."]);
        assert!(sink.finish_reasons().is_empty());

        // The provider task was aborted while waiting to produce "three.".
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(provider.sent_fragments(), 2);
    }
}
