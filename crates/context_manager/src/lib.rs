//! `context_manager` keeps branching conversation histories: a tree of turns
//! per conversation, each turn carrying its variable state as a snapshot or a
//! diff against its parent.

pub mod branch_state;
pub mod error;
pub mod structs;
pub mod tree_store;

// Re-export the public API
pub use branch_state::{
    BranchStateManager, ChainIssue, StorageStatistics, ValidationReport, VariableRecord,
};
pub use error::{ContextError, Result};
pub use structs::tree::ConversationTree;
pub use structs::turn::{NewTurn, ParsedFields, StateMetadata, Turn, TurnId, TurnUpdate};
pub use tree_store::{BranchSwitch, ConversationTreeStore, TREES_COLLECTION};
