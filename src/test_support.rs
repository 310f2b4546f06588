//! Test utilities shared across the crate.
//!
//! This module is only compiled during tests (`#[cfg(test)]`).

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::Sender;

use crate::core::relay::{ChatSink, FinishReason, ServerMessage, SinkError};
use crate::inference::{
    ChatCompletionRequest, ChatProvider, ClientType, Message, Model, ProviderError, StreamChunk,
};

pub fn model(client_type: ClientType, id: &str) -> Model {
    Model {
        client_type,
        model_id: id.to_string(),
        context_window: 8192,
        owned_by: client_type.as_str().to_string(),
    }
}

/// What the provider saw on its last `stream_chat` call.
#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub max_tokens: Option<u32>,
}

/// An in-memory provider with a scripted listing and scripted stream.
pub struct ScriptedProvider {
    client_type: ClientType,
    models: Mutex<Vec<String>>,
    listing_fails: bool,
    list_delay: Option<Duration>,
    fragments: Vec<String>,
    fragment_delay: Option<Duration>,
    fail_after: Option<(usize, String)>,
    list_calls: AtomicUsize,
    stream_calls: AtomicUsize,
    sent_fragments: AtomicUsize,
    last_request: Mutex<Option<SeenRequest>>,
}

impl ScriptedProvider {
    pub fn new(client_type: ClientType, model_ids: &[&str]) -> Self {
        Self {
            client_type,
            models: Mutex::new(model_ids.iter().map(|s| s.to_string()).collect()),
            listing_fails: false,
            list_delay: None,
            fragments: Vec::new(),
            fragment_delay: None,
            fail_after: None,
            list_calls: AtomicUsize::new(0),
            stream_calls: AtomicUsize::new(0),
            sent_fragments: AtomicUsize::new(0),
            last_request: Mutex::new(None),
        }
    }

    pub fn failing_listing(client_type: ClientType) -> Self {
        Self {
            listing_fails: true,
            ..Self::new(client_type, &[])
        }
    }

    pub fn with_list_delay(mut self, delay: Duration) -> Self {
        self.list_delay = Some(delay);
        self
    }

    pub fn with_fragments(mut self, fragments: &[&str]) -> Self {
        self.fragments = fragments.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_fragment_delay(mut self, delay: Duration) -> Self {
        self.fragment_delay = Some(delay);
        self
    }

    /// Streams the first `sent` fragments, then fails with `message`.
    pub fn failing_stream_after(mut self, sent: usize, message: &str) -> Self {
        self.fail_after = Some((sent, message.to_string()));
        self
    }

    pub fn set_models(&self, model_ids: &[&str]) {
        *self.models.lock().unwrap() = model_ids.iter().map(|s| s.to_string()).collect();
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn stream_calls(&self) -> usize {
        self.stream_calls.load(Ordering::SeqCst)
    }

    /// Fragments that made it into the relay channel, across all calls.
    pub fn sent_fragments(&self) -> usize {
        self.sent_fragments.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<SeenRequest> {
        self.last_request.lock().unwrap().clone()
    }

    fn failure_at(&self, index: usize) -> Option<ProviderError> {
        match &self.fail_after {
            Some((sent, message)) if *sent == index => Some(ProviderError::Stream(message.clone())),
            _ => None,
        }
    }
}

#[async_trait]
impl ChatProvider for ScriptedProvider {
    fn client_type(&self) -> ClientType {
        self.client_type
    }

    async fn list_models(&self) -> Result<Vec<Model>, ProviderError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.list_delay {
            tokio::time::sleep(delay).await;
        }
        if self.listing_fails {
            return Err(ProviderError::Network("connection refused".to_string()));
        }
        let ids = self.models.lock().unwrap().clone();
        Ok(ids.iter().map(|id| model(self.client_type, id)).collect())
    }

    async fn stream_chat(
        &self,
        request: ChatCompletionRequest<'_>,
        sender: Sender<StreamChunk>,
    ) -> Result<(), ProviderError> {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock().unwrap() = Some(SeenRequest {
            model: request.model.to_string(),
            messages: request.messages.to_vec(),
            max_tokens: request.max_tokens,
        });

        for (i, fragment) in self.fragments.iter().enumerate() {
            if let Some(err) = self.failure_at(i) {
                return Err(err);
            }
            if let Some(delay) = self.fragment_delay {
                tokio::time::sleep(delay).await;
            }
            sender
                .send(StreamChunk::Content(fragment.clone()))
                .await
                .map_err(|_| ProviderError::ChannelClosed)?;
            self.sent_fragments.fetch_add(1, Ordering::SeqCst);
        }
        if let Some(err) = self.failure_at(self.fragments.len()) {
            return Err(err);
        }
        sender
            .send(StreamChunk::Done)
            .await
            .map_err(|_| ProviderError::ChannelClosed)
    }
}

/// Collects everything sent to a client. Optionally refuses after N messages.
#[derive(Debug, Default)]
pub struct RecordingSink {
    pub messages: Vec<ServerMessage>,
    closed_after: Option<usize>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink whose connection drops once `accepted` messages went through.
    pub fn closing_after(accepted: usize) -> Self {
        Self {
            messages: Vec::new(),
            closed_after: Some(accepted),
        }
    }

    pub fn chunks(&self) -> Vec<String> {
        self.messages
            .iter()
            .filter_map(|m| match m {
                ServerMessage::Chunk { chunk } => Some(chunk.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn text(&self) -> String {
        self.chunks().concat()
    }

    pub fn errors(&self) -> Vec<String> {
        self.messages
            .iter()
            .filter_map(|m| match m {
                ServerMessage::Error { error } => Some(error.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn finish_reasons(&self) -> Vec<FinishReason> {
        self.messages
            .iter()
            .filter_map(|m| match m {
                ServerMessage::Finish { finish_reason } => Some(*finish_reason),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl ChatSink for RecordingSink {
    async fn send(&mut self, message: ServerMessage) -> Result<(), SinkError> {
        if self.closed_after.is_some_and(|n| self.messages.len() >= n) {
            return Err(SinkError::Closed);
        }
        self.messages.push(message);
        Ok(())
    }
}
