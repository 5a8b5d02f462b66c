//! # Session Manager
//!
//! Drives conversations end to end: user message → extension hooks →
//! pipeline → new turn in the conversation tree. See [`ConversationService`].

pub mod error;
pub mod service;
pub mod structs;

// Re-exports
pub use error::{Result, ServiceError};
pub use service::ConversationService;
pub use structs::TurnOutcome;
