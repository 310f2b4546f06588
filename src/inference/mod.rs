pub mod provider;
pub mod providers;
pub mod types;

pub use provider::{ChatCompletionRequest, ChatProvider, ProviderError};
pub use providers::{GroqProvider, OllamaProvider};
pub use types::{ClientType, ContentPart, ImageData, Message, MessageContent, Model, Role, StreamChunk};
