//! Extensions for the conversation pipeline
//!
//! Extensions are built by factories registered on an [`ExtensionLoader`],
//! managed by an [`ExtensionHost`] and invoked at fixed points by the
//! [`HookDispatcher`]. Tools registered by extensions are called from model
//! responses through the inline grammar in [`tools::grammar`].

pub mod dispatcher;
pub mod error;
pub mod extension;
pub mod host;
pub mod loader;
pub mod manifest;
pub mod message;
pub mod tools;

pub use dispatcher::{HookDispatcher, HookFailure, HookOutcome, HookPoint, ToolPassOutcome};
pub use error::{ExtensionError, Result};
pub use extension::{Extension, ExtensionApi};
pub use host::{ExtensionHost, ExtensionSummary};
pub use loader::{ExtensionFactory, ExtensionLoader};
pub use manifest::{Capability, ExtensionManifest};
pub use message::HookMessage;
pub use tools::{Tool, ToolError, ToolExecutionContext, ToolParams, ToolRegistry};
