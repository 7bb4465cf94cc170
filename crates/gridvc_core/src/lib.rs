#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

/// Error (common error types)
pub mod error;

/// Document state values (normalization, sanitization)
pub mod state;

/// Structural patches (diff, apply)
pub mod patch;

/// Core types (commits, branches, configuration)
pub mod types;

/// Backend contract and shared commit-graph mechanics
pub mod store;

/// In-memory backend
pub mod memory;

/// SQLite backend
pub mod sqlite;

/// Replicated backend over a shared CRDT document
pub mod replicated;

/// Cross-backend history migration
pub mod migrate;

pub use error::{GridvcError, Result};
pub use memory::MemoryBranchStore;
pub use migrate::copy_document;
pub use patch::{Patch, apply, diff};
pub use replicated::ReplicatedBranchStore;
pub use sqlite::SqliteBranchStore;
pub use state::{DocState, empty_state, normalize, sanitize};
pub use store::{BranchStore, MAIN_BRANCH};
pub use types::{Branch, Commit, NewBranch, NewCommit, PayloadEncoding, StoreConfig};
