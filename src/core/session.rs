//! # Chat Session Handler
//!
//! One exchange per inbound frame: check the request, pick the provider that
//! owns the model, and hand the stream to the relay.
//!
//! Every failure inside an exchange ends as `{error}` + `{finish_reason:"error"}`
//! on the sink. Only a dead sink is returned to the caller, which ends the
//! connection loop.

use std::sync::Arc;

use log::{info, warn};
use serde::Deserialize;
use serde_json::Value;

use crate::core::registry::ModelRegistry;
use crate::core::relay::{
    BatchPolicy, ChatSink, FinishReason, RelayRequest, SinkError, StreamingRelay, send_failure,
};
use crate::core::vision::{ImageAttachment, VisionPolicy, validate_images, vision_parts};
use crate::inference::Message;

pub const MISSING_FIELDS_MESSAGE: &str = "Please enter a message and select a model.";

/// An inbound chat frame, as the client sends it.
#[derive(Deserialize, Debug, Default)]
pub struct ChatRequest {
    #[serde(default)]
    pub message: Option<Value>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub images: Option<Vec<ImageAttachment>>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

/// Extracts the user text from the `message` field.
///
/// Strings are used as-is. Objects contribute their `content` string, or
/// their JSON text when there is none. Empty values, `false` and zero count
/// as missing.
fn message_text(message: &Value) -> Option<String> {
    match message {
        Value::Null | Value::Bool(false) => None,
        Value::Number(n) if n.as_f64() == Some(0.0) => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        Value::Object(map) if map.is_empty() => None,
        Value::Object(map) => match map.get("content") {
            Some(Value::String(content)) => Some(content.clone()),
            _ => Some(message.to_string()),
        },
        Value::Array(items) if items.is_empty() => None,
        other => Some(other.to_string()),
    }
}

pub struct ChatSession {
    registry: Arc<ModelRegistry>,
    vision: VisionPolicy,
    system_prompt: String,
    relay: StreamingRelay,
}

impl ChatSession {
    pub fn new(
        registry: Arc<ModelRegistry>,
        vision: VisionPolicy,
        system_prompt: String,
        policy: BatchPolicy,
    ) -> Self {
        Self {
            registry,
            vision,
            system_prompt,
            relay: StreamingRelay::new(policy),
        }
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    /// Runs one exchange for a raw text frame.
    pub async fn handle_frame<S: ChatSink + ?Sized>(
        &self,
        frame: &str,
        sink: &mut S,
    ) -> Result<FinishReason, SinkError> {
        match serde_json::from_str::<ChatRequest>(frame) {
            Ok(request) => self.handle(request, sink).await,
            Err(e) => {
                warn!("Rejected malformed chat frame: {e}");
                send_failure(sink, format!("Invalid request: {e}")).await?;
                Ok(FinishReason::Error)
            }
        }
    }

    /// Runs one exchange for an already-decoded request.
    pub async fn handle<S: ChatSink + ?Sized>(
        &self,
        request: ChatRequest,
        sink: &mut S,
    ) -> Result<FinishReason, SinkError> {
        let text = request.message.as_ref().and_then(message_text);
        let model_id = request.model.filter(|m| !m.is_empty());
        let (Some(text), Some(model_id)) = (text, model_id) else {
            return reject(sink, MISSING_FIELDS_MESSAGE).await;
        };

        let images = request.images.unwrap_or_default();
        if let Err(problem) = validate_images(&images) {
            return reject(sink, format!("Image validation failed: {problem}")).await;
        }

        let user_message = if images.is_empty() {
            Message::user(text)
        } else if self.vision.supports_vision(&model_id) {
            info!("Sending {} image(s) to vision model {model_id}", images.len());
            Message::user_parts(vision_parts(&text, &images))
        } else {
            let message = self.vision.unsupported_message(&model_id, images.len());
            return reject(sink, message).await;
        };

        let provider = match self.registry.get_model_provider(&model_id).await {
            Some(client_type) => self.registry.provider(client_type),
            None => None,
        };
        let Some(provider) = provider else {
            return reject(
                sink,
                format!("Model '{model_id}' not found in available models."),
            )
            .await;
        };

        let relay_request = RelayRequest {
            model: model_id,
            messages: vec![Message::system(self.system_prompt.clone()), user_message],
            max_tokens: request.max_tokens,
        };
        self.relay.run(provider, relay_request, sink).await
    }
}

async fn reject<S: ChatSink + ?Sized>(
    sink: &mut S,
    message: impl Into<String>,
) -> Result<FinishReason, SinkError> {
    let message = message.into();
    warn!("Rejected chat request: {message}");
    send_failure(sink, message).await?;
    Ok(FinishReason::Error)
}
