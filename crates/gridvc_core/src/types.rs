//! Core types for branch/commit storage.

use serde::{Deserialize, Serialize};

use crate::patch::Patch;
use crate::state::DocState;

/// An immutable node in the commit graph.
///
/// Commits form a DAG: `parent_commit_id` is `None` only for the single root
/// commit of a document, and merge commits additionally carry a
/// `merge_parent_commit_id`. Once fully written a commit is never updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Commit {
    /// Globally unique commit id.
    pub id: String,

    /// Document this commit belongs to.
    pub doc_id: String,

    /// Parent commit, or `None` for the root commit.
    pub parent_commit_id: Option<String>,

    /// Second parent for merge commits.
    pub merge_parent_commit_id: Option<String>,

    /// Actor that created the commit.
    pub created_by: String,

    /// Caller-supplied creation time (Unix milliseconds). Untrustworthy in
    /// multi-writer backends; never used for durability decisions.
    pub created_at: i64,

    /// Commit message.
    pub message: String,

    /// Structural delta relative to the parent commit's state.
    pub patch: Patch,

    /// Full document state embedded at snapshot points (bounds replay depth).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<DocState>,
}

/// Input for [`crate::store::BranchStore::create_commit`].
#[derive(Debug, Clone)]
pub struct NewCommit {
    /// Document the commit belongs to.
    pub doc_id: String,
    /// Parent commit id, or `None` for a root commit.
    pub parent_commit_id: Option<String>,
    /// Second parent for merge commits.
    pub merge_parent_commit_id: Option<String>,
    /// Actor creating the commit.
    pub created_by: String,
    /// Creation time (Unix milliseconds).
    pub created_at: i64,
    /// Commit message.
    pub message: String,
    /// Delta relative to the parent's state.
    pub patch: Patch,
    /// The state after applying `patch`, when the caller already has it.
    /// Saves a replay when the snapshot policy fires.
    pub next_state: Option<DocState>,
}

/// A named, mutable pointer into the commit graph, unique per document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    /// Unique branch id.
    pub id: String,
    /// Document the branch belongs to.
    pub doc_id: String,
    /// Branch name, unique within the document.
    pub name: String,
    /// Actor that created the branch.
    pub created_by: String,
    /// Creation time (Unix milliseconds).
    pub created_at: i64,
    /// Optional free-form description.
    pub description: Option<String>,
    /// Commit this branch currently points at.
    pub head_commit_id: String,
}

/// Input for [`crate::store::BranchStore::create_branch`].
#[derive(Debug, Clone)]
pub struct NewBranch {
    /// Document the branch belongs to.
    pub doc_id: String,
    /// Branch name, unique within the document.
    pub name: String,
    /// Actor creating the branch.
    pub created_by: String,
    /// Creation time (Unix milliseconds).
    pub created_at: i64,
    /// Optional free-form description.
    pub description: Option<String>,
    /// Commit the new branch points at.
    pub head_commit_id: String,
}

/// How commit payloads (patches and snapshots) are persisted in the
/// replicated backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PayloadEncoding {
    /// Payload stored as one inline JSON string inside the record.
    Inline,
    /// Payload gzip-compressed and split into fixed-size byte chunks that
    /// are appended across multiple transactions.
    GzipChunks,
}

impl std::fmt::Display for PayloadEncoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PayloadEncoding::Inline => write!(f, "inline"),
            PayloadEncoding::GzipChunks => write!(f, "gzip-chunks"),
        }
    }
}

impl std::str::FromStr for PayloadEncoding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inline" => Ok(PayloadEncoding::Inline),
            "gzip-chunks" => Ok(PayloadEncoding::GzipChunks),
            _ => Err(format!("Unknown payload encoding: {}", s)),
        }
    }
}

/// Store configuration shared by all backends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Embed a full snapshot whenever replay depth would otherwise reach
    /// this many commits.
    #[serde(default = "default_snapshot_every_n_commits")]
    pub snapshot_every_n_commits: u32,

    /// Snapshot immediately when a serialized patch exceeds this many bytes.
    /// `None` disables the size trigger.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_when_patch_exceeds_bytes: Option<usize>,

    /// Payload encoding used by the replicated backend for new commits.
    #[serde(default = "default_payload_encoding")]
    pub payload_encoding: PayloadEncoding,

    /// Chunk size in bytes for chunked payloads.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Upper bound on chunks appended within a single transaction, keeping
    /// each transaction small.
    #[serde(default = "default_max_chunks_per_transaction")]
    pub max_chunks_per_transaction: usize,

    /// How long an incomplete commit may linger (measured from its
    /// `write_started_at`) before stale cleanup may delete it, provided it
    /// is unreachable.
    #[serde(default = "default_incomplete_commit_ttl_ms")]
    pub incomplete_commit_ttl_ms: i64,
}

fn default_snapshot_every_n_commits() -> u32 {
    50
}

fn default_payload_encoding() -> PayloadEncoding {
    PayloadEncoding::Inline
}

fn default_chunk_size() -> usize {
    64 * 1024
}

fn default_max_chunks_per_transaction() -> usize {
    16
}

fn default_incomplete_commit_ttl_ms() -> i64 {
    15 * 60 * 1000
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            snapshot_every_n_commits: default_snapshot_every_n_commits(),
            snapshot_when_patch_exceeds_bytes: None,
            payload_encoding: default_payload_encoding(),
            chunk_size: default_chunk_size(),
            max_chunks_per_transaction: default_max_chunks_per_transaction(),
            incomplete_commit_ttl_ms: default_incomplete_commit_ttl_ms(),
        }
    }
}
