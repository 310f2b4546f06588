//! # Core Application Logic
//!
//! Konexion's business logic. It knows nothing about HTTP or WebSockets; the
//! server adapter drives it through [`session::ChatSession`] and the
//! [`relay::ChatSink`] trait.
//!
//! ```text
//!                    ┌─────────────────────────┐
//!                    │         CORE            │
//!                    │  (this module)          │
//!                    │                         │
//!                    │  • registry (models)    │
//!                    │  • session (exchanges)  │
//!                    │  • relay (batching)     │
//!                    │                         │
//!                    │  No sockets. No routes. │
//!                    └───────────┬─────────────┘
//!                                │
//!            ┌───────────────────┴───────────────────┐
//!            ▼                                       ▼
//!     ┌────────────┐                          ┌────────────┐
//!     │   server   │                          │ inference  │
//!     │  (axum)    │                          │ Groq/Ollama│
//!     └────────────┘                          └────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`config`]: file + env + CLI configuration
//! - [`registry`]: cached model listings and model → provider routing
//! - [`relay`]: provider stream → batched client messages
//! - [`session`]: one chat exchange, from inbound frame to terminal status
//! - [`vision`]: image checks and multimodal message shaping

pub mod config;
pub mod registry;
pub mod relay;
pub mod session;
pub mod vision;
