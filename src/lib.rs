//! Xiaozhi Server - Conversational Voice Pipeline
//!
//! A real-time voice-assistant server. Each connected device streams Opus
//! audio over a WebSocket; the server detects speech boundaries, transcribes
//! the utterance, routes it through an intent layer or a tool-enabled LLM,
//! and streams a synthesized, paced reply back, cancellable the instant the
//! user speaks again.
//!
//! # Example
//!
//! ```ignore
//! use xiaozhi_server::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load(std::path::Path::new("config.yaml"))?;
//!     xiaozhi_server::server::start(config).await
//! }
//! ```

// Core modules (order matters for cross-module dependencies)
pub mod utils;
pub mod audio;
pub mod config;
pub mod dialogue;
pub mod providers; // must come before server since server depends on providers
pub mod music;
pub mod tools;
pub mod server;

// Fakes shared between unit and integration tests
pub mod test_support;

// Re-export commonly used types for convenience
pub use config::Config;
pub use dialogue::{Dialogue, Role, Turn};
pub use server::{start as start_server, ServerState};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
