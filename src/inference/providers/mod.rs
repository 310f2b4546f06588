pub mod groq;
pub mod ollama;

pub use groq::GroqProvider;
pub use ollama::OllamaProvider;
