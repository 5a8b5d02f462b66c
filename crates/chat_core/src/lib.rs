//! chat_core - Core types shared by the branching conversation crates
//!
//! - `state` - VariableState and the snapshot/diff codec
//! - `config` - Config, ModelConfig, SnapshotPolicy and friends
//! - `paths` - well-known locations on disk

pub mod config;
pub mod paths;
pub mod state;

// Re-export commonly used types
pub use config::{Config, ExtensionSettings, ModelConfig, PipelineSettings, SnapshotPolicy};
pub use state::{ChangeOp, StateChange, VariableState};
