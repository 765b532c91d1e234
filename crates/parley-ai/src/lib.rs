//! Parley AI - Generation adapters
//!
//! Implementations of `parley_traits::GenerationAdapter`:
//! - [`GeminiAdapter`] streams from the Gemini `streamGenerateContent` SSE endpoint
//! - [`ScriptedAdapter`] replays scripted token/terminal/failure sequences

pub mod error;
pub mod gemini;
pub mod scripted;

mod http_client;

pub use error::{AiError, Result};
pub use gemini::GeminiAdapter;
pub use scripted::{ScriptStep, ScriptStepKind, ScriptedAdapter};
