use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifies which upstream provider owns a model.
///
/// The declaration order is the routing order: when a model id is advertised
/// by more than one provider, the earlier variant wins.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ClientType {
    Groq,
    Ollama,
}

impl ClientType {
    pub fn as_str(self) -> &'static str {
        match self {
            ClientType::Groq => "groq",
            ClientType::Ollama => "ollama",
        }
    }
}

impl fmt::Display for ClientType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A provider-advertised inference target.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Model {
    pub client_type: ClientType,
    pub model_id: String,
    pub context_window: u32,
    pub owned_by: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// An image already split out of its data URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageData {
    /// MIME type, e.g. `image/png`.
    pub media_type: String,
    /// Base64 payload without the `data:...;base64,` header.
    pub base64: String,
}

impl ImageData {
    /// Rebuilds the data URL form (`data:<type>;base64,<payload>`).
    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.media_type, self.base64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentPart {
    Text(String),
    Image(ImageData),
}

/// Message content is either plain text or an ordered list of typed parts.
/// Adapters translate this into their provider's wire shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn user_parts(parts: Vec<ContentPart>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Parts(parts),
        }
    }
}

/// Represents a chunk of streamed content from a provider.
#[derive(Debug, PartialEq, Eq)]
pub enum StreamChunk {
    /// A non-empty text delta.
    Content(String),
    /// The provider signalled the end of the stream; nothing follows.
    Done,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_type_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&ClientType::Groq).unwrap(), "\"groq\"");
        assert_eq!(serde_json::to_string(&ClientType::Ollama).unwrap(), "\"ollama\"");
    }

    #[test]
    fn test_client_type_routing_order() {
        assert!(ClientType::Groq < ClientType::Ollama);
    }

    /// Contract test for the catalog record shape sent to clients.
    #[test]
    fn test_model_serialization() {
        let model = Model {
            client_type: ClientType::Ollama,
            model_id: "llama3:8b".to_string(),
            context_window: 4096,
            owned_by: "ollama".to_string(),
        };
        let json = serde_json::to_string(&model).unwrap();
        assert_eq!(
            json,
            r#"{"client_type":"ollama","model_id":"llama3:8b","context_window":4096,"owned_by":"ollama"}"#
        );
    }

    #[test]
    fn test_image_data_url() {
        let image = ImageData {
            media_type: "image/png".to_string(),
            base64: "AAAA".to_string(),
        };
        assert_eq!(image.data_url(), "data:image/png;base64,AAAA");
    }
}
