//! Replicated backend over a shared CRDT document.
//!
//! This backend persists the commit graph inside a yrs [`Doc`] that peers
//! synchronize through the usual update exchange, so every instance that
//! holds the same document converges on the same history.
//!
//! # Structure
//!
//! The store claims three root maps inside the shared document, prefixed by
//! a namespace (default "gridvc"):
//!
//! ```text
//! Y.Doc
//! ├── Y.Map "gridvc.branches"   branch name → branch record
//! ├── Y.Map "gridvc.commits"    commit id   → commit record
//! └── Y.Map "gridvc.meta"       doc_id, root_commit_id, current_branch
//! ```
//!
//! A commit record is a nested Y.Map. Payloads (patch and optional snapshot)
//! are either one inline JSON string or a gzip-compressed byte stream split
//! into a Y.Array of chunks, appended across bounded transactions. The
//! record carries `commit_complete`; until that flag is set the commit is a
//! write in progress and readers treat it as unreadable.
//!
//! # Cross-instance tolerance
//!
//! Records written by a different instance of the replication library can
//! arrive as plain JSON-like values instead of native shared types. Reads
//! decode both shapes structurally, and construction re-hosts plain records
//! into native maps so chunk appends keep working.

mod chunks;
mod repair;

use std::collections::HashMap;

use chrono::Utc;
use uuid::Uuid;
use yrs::types::ToJson;
use yrs::updates::decoder::Decode;
use yrs::{
    Any, Array, ArrayPrelim, ArrayRef, Doc, Map, MapPrelim, MapRef, Out, ReadTxn, StateVector,
    Transact, TransactionMut, Update,
};

use crate::error::{GridvcError, Result};
use crate::patch::{Patch, diff, sanitize_patch};
use crate::state::{DocState, empty_state, normalize, sanitize};
use crate::store::{
    BranchStore, MAIN_BRANCH, replay_state_at, resolve_commit_state, snapshot_distance,
    wants_snapshot,
};
use crate::types::{Branch, Commit, NewBranch, NewCommit, PayloadEncoding, StoreConfig};

/// Default root-map namespace inside the shared document.
const DEFAULT_NAMESPACE: &str = "gridvc";

/// A [`BranchStore`] backed by a shared, replicated document.
pub struct ReplicatedBranchStore {
    /// The underlying shared document.
    doc: Doc,
    /// Document id this store is bound to.
    doc_id: String,
    /// Branch records, keyed by branch name (cached root).
    branches: MapRef,
    /// Commit records, keyed by commit id (cached root).
    commits: MapRef,
    /// Document-level pointers (cached root).
    meta: MapRef,
    config: StoreConfig,
}

/// A commit record as it sits in the shared document, before readability is
/// decided. `patch: None` means the payload is not (yet) readable.
pub(super) struct RawCommit {
    pub id: String,
    pub doc_id: String,
    pub parent_commit_id: Option<String>,
    pub merge_parent_commit_id: Option<String>,
    pub created_by: String,
    pub created_at: i64,
    pub message: String,
    /// The writer finished all payload appends.
    pub complete: bool,
    /// Substrate-local clock sample taken when the write began. Used only
    /// for stale-write cleanup, never for ordering history.
    pub write_started_at: i64,
    pub patch: Option<Patch>,
    pub snapshot: Option<DocState>,
}

impl RawCommit {
    /// Fully readable: the writer finished and the patch payload decodes.
    pub(super) fn readable(&self) -> bool {
        self.complete && self.patch.is_some()
    }

    /// The patch payload is whole, finalized or not. This is the predicate
    /// the read path serves by, so reads must keep working for any commit
    /// that satisfies it.
    pub(super) fn has_payload(&self) -> bool {
        self.patch.is_some()
    }

    /// Convert into an API-level [`Commit`], sanitizing payloads on the way
    /// out. `None` when the patch payload is unreadable.
    fn into_commit(self) -> Option<Commit> {
        let patch = self.patch?;
        Some(Commit {
            id: self.id,
            doc_id: self.doc_id,
            parent_commit_id: self.parent_commit_id,
            merge_parent_commit_id: self.merge_parent_commit_id,
            created_by: self.created_by,
            created_at: self.created_at,
            message: self.message,
            patch: sanitize_patch(&patch),
            snapshot: self.snapshot.as_ref().map(sanitize),
        })
    }
}

// ==================== Structural record decoding ====================

/// Lower a map value to a plain [`Any`] tree, whichever shape it arrived in.
fn record_to_any<T: ReadTxn>(txn: &T, value: Out) -> Option<Any> {
    match value {
        Out::YMap(map) => Some(map.to_json(txn)),
        Out::Any(any) => Some(any),
        _ => None,
    }
}

fn field_str(fields: &HashMap<String, Any>, key: &str) -> Option<String> {
    match fields.get(key)? {
        Any::String(s) => Some(s.to_string()),
        _ => None,
    }
}

fn field_i64(fields: &HashMap<String, Any>, key: &str) -> Option<i64> {
    match fields.get(key)? {
        Any::BigInt(v) => Some(*v),
        Any::Number(v) => Some(*v as i64),
        _ => None,
    }
}

fn field_bool(fields: &HashMap<String, Any>, key: &str) -> Option<bool> {
    match fields.get(key)? {
        Any::Bool(v) => Some(*v),
        _ => None,
    }
}

fn field_chunks(fields: &HashMap<String, Any>, key: &str) -> Option<Vec<Vec<u8>>> {
    match fields.get(key)? {
        Any::Array(items) => items
            .iter()
            .map(|item| match item {
                Any::Buffer(bytes) => Some(bytes.to_vec()),
                _ => None,
            })
            .collect(),
        _ => None,
    }
}

/// Decode one payload (patch or snapshot) from a commit record.
///
/// `Ok(None)` means "no readable payload here" (absent, or chunk appends
/// still in flight); corrupt data in a fully-written payload is an error.
fn decode_payload(fields: &HashMap<String, Any>, prefix: &str) -> Result<Option<String>> {
    let encoding = field_str(fields, &format!("{prefix}_encoding"));
    match encoding.as_deref() {
        None => Ok(None),
        Some("inline") => Ok(field_str(fields, &format!("{prefix}_inline"))),
        Some("gzip-chunks") => {
            let total = field_i64(fields, &format!("{prefix}_chunks_total")).unwrap_or(-1);
            let written = field_chunks(fields, &format!("{prefix}_chunks")).unwrap_or_default();
            if total < 0 || (written.len() as i64) < total {
                return Ok(None);
            }
            chunks::decode_chunked(&written[..total as usize]).map(Some)
        }
        Some(other) => Err(GridvcError::Encoding(format!(
            "unknown payload encoding '{}'",
            other
        ))),
    }
}

/// Decode a commit record from either shape: a structured field map, or the
/// single-JSON-string form pre-chunking versions wrote.
fn decode_raw_commit(key: &str, any: &Any) -> Result<Option<RawCommit>> {
    match any {
        Any::String(json) => {
            let commit: Commit = serde_json::from_str(json)?;
            Ok(Some(RawCommit {
                id: commit.id,
                doc_id: commit.doc_id,
                parent_commit_id: commit.parent_commit_id,
                merge_parent_commit_id: commit.merge_parent_commit_id,
                created_by: commit.created_by,
                created_at: commit.created_at,
                message: commit.message,
                complete: true,
                write_started_at: commit.created_at,
                patch: Some(commit.patch),
                snapshot: commit.snapshot,
            }))
        }
        Any::Map(fields) => {
            let doc_id = field_str(fields, "doc_id").ok_or_else(|| {
                GridvcError::Encoding(format!("commit record {} is missing doc_id", key))
            })?;
            let patch = match decode_payload(fields, "patch")? {
                Some(json) => Some(serde_json::from_str(&json)?),
                None => None,
            };
            // A corrupt snapshot never blocks reads; the patch chain can
            // still reconstruct the state.
            let snapshot = match decode_payload(fields, "snapshot") {
                Ok(Some(json)) => serde_json::from_str(&json).ok(),
                Ok(None) => None,
                Err(e) => {
                    log::warn!("Ignoring unreadable snapshot on commit {}: {}", key, e);
                    None
                }
            };
            let created_at = field_i64(fields, "created_at").unwrap_or(0);
            Ok(Some(RawCommit {
                id: field_str(fields, "id").unwrap_or_else(|| key.to_string()),
                doc_id,
                parent_commit_id: field_str(fields, "parent_commit_id"),
                merge_parent_commit_id: field_str(fields, "merge_parent_commit_id"),
                created_by: field_str(fields, "created_by").unwrap_or_default(),
                created_at,
                message: field_str(fields, "message").unwrap_or_default(),
                complete: field_bool(fields, "commit_complete").unwrap_or(false),
                write_started_at: field_i64(fields, "write_started_at").unwrap_or(created_at),
                patch,
                snapshot,
            }))
        }
        _ => Ok(None),
    }
}

/// Decode a branch record from either shape.
fn decode_branch(name: &str, any: &Any) -> Option<Branch> {
    match any {
        Any::String(json) => serde_json::from_str(json).ok(),
        Any::Map(fields) => Some(Branch {
            id: field_str(fields, "id")?,
            doc_id: field_str(fields, "doc_id")?,
            name: field_str(fields, "name").unwrap_or_else(|| name.to_string()),
            created_by: field_str(fields, "created_by").unwrap_or_default(),
            created_at: field_i64(fields, "created_at").unwrap_or(0),
            description: field_str(fields, "description"),
            head_commit_id: field_str(fields, "head_commit_id")?,
        }),
        _ => None,
    }
}

// ==================== Record writing ====================

/// Write a branch as a nested native map, replacing any previous record
/// under the same name.
fn write_branch_record(branches: &MapRef, txn: &mut TransactionMut, branch: &Branch) {
    let rec = branches.insert(txn, branch.name.as_str(), MapPrelim::default());
    rec.insert(txn, "id", branch.id.as_str());
    rec.insert(txn, "doc_id", branch.doc_id.as_str());
    rec.insert(txn, "name", branch.name.as_str());
    rec.insert(txn, "created_by", branch.created_by.as_str());
    rec.insert(txn, "created_at", branch.created_at);
    if let Some(description) = &branch.description {
        rec.insert(txn, "description", description.as_str());
    }
    rec.insert(txn, "head_commit_id", branch.head_commit_id.as_str());
}

/// Rewrite a plain JSON-like record as a native nested map with the same
/// fields, so this instance can mutate it incrementally.
fn rehost_record(root: &MapRef, txn: &mut TransactionMut, key: &str, fields: &HashMap<String, Any>) {
    let rec = root.insert(txn, key, MapPrelim::default());
    for (field, value) in fields {
        match value {
            Any::Array(items) => {
                let arr = rec.insert(txn, field.as_str(), ArrayPrelim::default());
                for item in items.iter() {
                    arr.push_back(txn, item.clone());
                }
            }
            other => {
                rec.insert(txn, field.as_str(), other.clone());
            }
        }
    }
}

fn meta_str<T: ReadTxn>(meta: &MapRef, txn: &T, key: &str) -> Option<String> {
    match meta.get(txn, key)? {
        Out::Any(Any::String(s)) => Some(s.to_string()),
        _ => None,
    }
}

impl ReplicatedBranchStore {
    /// Bind a store to a shared document under the default namespace.
    ///
    /// Cloning a [`Doc`] shares the underlying document, so several stores
    /// (or a store plus a sync pipeline) can be bound to the same instance.
    pub fn new(doc: Doc, doc_id: &str, config: StoreConfig) -> Result<Self> {
        Self::with_namespace(doc, doc_id, DEFAULT_NAMESPACE, config)
    }

    /// Bind a store using a custom namespace for its root maps.
    ///
    /// Fails with [`GridvcError::DocIdMismatch`] if the shared document is
    /// already claimed by a different document id.
    pub fn with_namespace(
        doc: Doc,
        doc_id: &str,
        namespace: &str,
        config: StoreConfig,
    ) -> Result<Self> {
        let branches = doc.get_or_insert_map(format!("{namespace}.branches"));
        let commits = doc.get_or_insert_map(format!("{namespace}.commits"));
        let meta = doc.get_or_insert_map(format!("{namespace}.meta"));

        let store = Self {
            doc,
            doc_id: doc_id.to_string(),
            branches,
            commits,
            meta,
            config,
        };

        {
            let txn = store.doc.transact();
            if let Some(bound) = meta_str(&store.meta, &txn, "doc_id")
                && bound != store.doc_id
            {
                return Err(GridvcError::DocIdMismatch {
                    expected: bound,
                    actual: store.doc_id,
                });
            }
        }

        store.rehost_foreign_records();
        Ok(store)
    }

    /// Get the underlying shared document.
    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    // ==================== Sync Operations ====================

    /// Encode the full document state as an update for another peer.
    pub fn encode_state_as_update(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Integrate a binary update received from a remote peer.
    pub fn apply_update(&self, update: &[u8]) -> Result<()> {
        let update = Update::decode_v1(update)
            .map_err(|e| GridvcError::Encoding(format!("failed to decode update: {}", e)))?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| GridvcError::Encoding(format!("failed to apply update: {}", e)))?;
        Ok(())
    }

    // ==================== Internal plumbing ====================

    fn guard_doc(&self, doc_id: &str) -> Result<()> {
        if doc_id != self.doc_id {
            return Err(GridvcError::DocIdMismatch {
                expected: self.doc_id.clone(),
                actual: doc_id.to_string(),
            });
        }
        Ok(())
    }

    /// Convert plain JSON-like records (written by a foreign instance of the
    /// replication library) into native nested maps.
    fn rehost_foreign_records(&self) {
        let mut txn = self.doc.transact_mut();
        for root in [&self.branches, &self.commits] {
            let foreign: Vec<(String, HashMap<String, Any>)> = root
                .iter(&txn)
                .filter_map(|(key, value)| match value {
                    Out::Any(Any::Map(fields)) => {
                        Some((key.to_string(), fields.as_ref().clone()))
                    }
                    _ => None,
                })
                .collect();
            for (key, fields) in foreign {
                log::debug!("Re-hosting foreign record '{}' as a native map", key);
                rehost_record(root, &mut txn, &key, &fields);
            }
        }
    }

    pub(super) fn read_raw_commit(&self, commit_id: &str) -> Result<Option<RawCommit>> {
        let txn = self.doc.transact();
        let Some(value) = self.commits.get(&txn, commit_id) else {
            return Ok(None);
        };
        let Some(any) = record_to_any(&txn, value) else {
            return Ok(None);
        };
        decode_raw_commit(commit_id, &any)
    }

    /// Decode every commit record, skipping (with a warning) records that
    /// fail to decode at all. Used by repair scans.
    pub(super) fn scan_raw_commits(&self) -> Vec<RawCommit> {
        let txn = self.doc.transact();
        let mut out = Vec::new();
        for (key, value) in self.commits.iter(&txn) {
            let key = key.to_string();
            let Some(any) = record_to_any(&txn, value) else {
                continue;
            };
            match decode_raw_commit(&key, &any) {
                Ok(Some(raw)) => out.push(raw),
                Ok(None) => {}
                Err(e) => log::warn!("Skipping undecodable commit record '{}': {}", key, e),
            }
        }
        out
    }

    /// Commit lookup used for replay and snapshot policy. An existing but
    /// unreadable commit is an error, never silently absent.
    fn load_commit(&self, commit_id: &str) -> Result<Option<Commit>> {
        match self.read_raw_commit(commit_id)? {
            None => Ok(None),
            Some(raw) => match raw.into_commit() {
                Some(commit) => Ok(Some(commit)),
                None => Err(GridvcError::CommitIncomplete(commit_id.to_string())),
            },
        }
    }

    pub(super) fn root_commit_id(&self) -> Option<String> {
        let txn = self.doc.transact();
        meta_str(&self.meta, &txn, "root_commit_id")
    }

    pub(super) fn branches_snapshot(&self) -> Vec<Branch> {
        let txn = self.doc.transact();
        self.branches
            .iter(&txn)
            .filter_map(|(name, value)| {
                let name = name.to_string();
                let any = record_to_any(&txn, value)?;
                decode_branch(&name, &any)
            })
            .collect()
    }

    fn branch_by_name(&self, name: &str) -> Option<Branch> {
        let txn = self.doc.transact();
        let value = self.branches.get(&txn, name)?;
        let any = record_to_any(&txn, value)?;
        decode_branch(name, &any)
    }

    /// Allocate an id and decide on a snapshot per the configured policy.
    fn build_commit(&self, input: NewCommit) -> Result<Commit> {
        let patch_bytes = serde_json::to_vec(&input.patch)?.len();
        let snapshot = {
            let mut lookup = |id: &str| self.load_commit(id);
            let distance = snapshot_distance(&mut lookup, input.parent_commit_id.as_deref())?;
            if wants_snapshot(&self.config, patch_bytes, distance) {
                Some(resolve_commit_state(&mut lookup, &input)?)
            } else {
                None
            }
        };
        Ok(Commit {
            id: Uuid::new_v4().to_string(),
            doc_id: input.doc_id,
            parent_commit_id: input.parent_commit_id,
            merge_parent_commit_id: input.merge_parent_commit_id,
            created_by: input.created_by,
            created_at: input.created_at,
            message: input.message,
            patch: input.patch,
            snapshot,
        })
    }

    // ==================== Commit record writing ====================

    /// Insert the metadata fields of a fresh commit record.
    fn insert_commit_meta(
        rec: &MapRef,
        txn: &mut TransactionMut,
        commit: &Commit,
        complete: bool,
        started_at: i64,
    ) {
        rec.insert(txn, "id", commit.id.as_str());
        rec.insert(txn, "doc_id", commit.doc_id.as_str());
        if let Some(parent) = &commit.parent_commit_id {
            rec.insert(txn, "parent_commit_id", parent.as_str());
        }
        if let Some(merge_parent) = &commit.merge_parent_commit_id {
            rec.insert(txn, "merge_parent_commit_id", merge_parent.as_str());
        }
        rec.insert(txn, "created_by", commit.created_by.as_str());
        rec.insert(txn, "created_at", commit.created_at);
        rec.insert(txn, "message", commit.message.as_str());
        rec.insert(txn, "commit_complete", complete);
        rec.insert(txn, "write_started_at", started_at);
    }

    /// Durably write a commit record using the configured payload encoding.
    fn write_commit_record(&self, commit: &Commit) -> Result<()> {
        let started_at = Utc::now().timestamp_millis();
        let patch_json = serde_json::to_string(&commit.patch)?;
        let snapshot_json = commit
            .snapshot
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        match self.config.payload_encoding {
            PayloadEncoding::Inline => {
                let mut txn = self.doc.transact_mut();
                let rec = self
                    .commits
                    .insert(&mut txn, commit.id.as_str(), MapPrelim::default());
                Self::insert_commit_meta(&rec, &mut txn, commit, true, started_at);
                rec.insert(&mut txn, "patch_encoding", "inline");
                rec.insert(&mut txn, "patch_inline", patch_json.as_str());
                if let Some(snapshot) = &snapshot_json {
                    rec.insert(&mut txn, "snapshot_encoding", "inline");
                    rec.insert(&mut txn, "snapshot_inline", snapshot.as_str());
                }
                Ok(())
            }
            PayloadEncoding::GzipChunks => {
                let patch_chunks = chunks::encode_chunked(&patch_json, self.config.chunk_size)?;
                let snapshot_chunks = snapshot_json
                    .as_deref()
                    .map(|json| chunks::encode_chunked(json, self.config.chunk_size))
                    .transpose()?;
                self.begin_chunked_record(
                    commit,
                    started_at,
                    patch_chunks.len(),
                    snapshot_chunks.as_ref().map(Vec::len),
                )?;
                self.append_payload_chunks(&commit.id, "patch_chunks", &patch_chunks)?;
                if let Some(snapshot_chunks) = &snapshot_chunks {
                    self.append_payload_chunks(&commit.id, "snapshot_chunks", snapshot_chunks)?;
                }
                self.finalize_commit_record(
                    &commit.id,
                    patch_chunks.len(),
                    snapshot_chunks.as_ref().map(Vec::len),
                )
            }
        }
    }

    /// First transaction of a chunked write: full metadata, declared chunk
    /// totals, empty chunk arrays, `commit_complete = false`.
    fn begin_chunked_record(
        &self,
        commit: &Commit,
        started_at: i64,
        patch_total: usize,
        snapshot_total: Option<usize>,
    ) -> Result<()> {
        let mut txn = self.doc.transact_mut();
        let rec = self
            .commits
            .insert(&mut txn, commit.id.as_str(), MapPrelim::default());
        Self::insert_commit_meta(&rec, &mut txn, commit, false, started_at);
        rec.insert(&mut txn, "patch_encoding", "gzip-chunks");
        rec.insert(&mut txn, "patch_chunks_total", patch_total as i64);
        rec.insert(&mut txn, "patch_chunks", ArrayPrelim::default());
        if let Some(total) = snapshot_total {
            rec.insert(&mut txn, "snapshot_encoding", "gzip-chunks");
            rec.insert(&mut txn, "snapshot_chunks_total", total as i64);
            rec.insert(&mut txn, "snapshot_chunks", ArrayPrelim::default());
        }
        Ok(())
    }

    fn chunk_array<T: ReadTxn>(&self, txn: &T, commit_id: &str, field: &str) -> Result<ArrayRef> {
        let rec = match self.commits.get(txn, commit_id) {
            Some(Out::YMap(rec)) => rec,
            _ => {
                return Err(GridvcError::Encoding(format!(
                    "commit record {} vanished during chunked write",
                    commit_id
                )));
            }
        };
        match rec.get(txn, field) {
            Some(Out::YArray(arr)) => Ok(arr),
            _ => Err(GridvcError::Encoding(format!(
                "commit record {} has no chunk array '{}'",
                commit_id, field
            ))),
        }
    }

    /// Append payload chunks across as many transactions as needed, each
    /// bounded by `max_chunks_per_transaction`.
    ///
    /// Resumable: the already-written array length is re-read inside every
    /// transaction, so retrying after an interruption continues where the
    /// previous attempt stopped instead of duplicating chunks.
    fn append_payload_chunks(
        &self,
        commit_id: &str,
        field: &str,
        payload_chunks: &[Vec<u8>],
    ) -> Result<()> {
        let per_txn = self.config.max_chunks_per_transaction.max(1);
        loop {
            let mut txn = self.doc.transact_mut();
            let arr = self.chunk_array(&txn, commit_id, field)?;
            let written = arr.len(&txn) as usize;
            if written >= payload_chunks.len() {
                return Ok(());
            }
            let end = (written + per_txn).min(payload_chunks.len());
            for chunk in &payload_chunks[written..end] {
                arr.push_back(&mut txn, Any::Buffer(chunk.clone().into_boxed_slice().into()));
            }
        }
    }

    /// Final transaction of a chunked write: re-verify the chunk counts
    /// inside the transaction, then flip `commit_complete`.
    fn finalize_commit_record(
        &self,
        commit_id: &str,
        patch_total: usize,
        snapshot_total: Option<usize>,
    ) -> Result<()> {
        let mut txn = self.doc.transact_mut();
        let rec = match self.commits.get(&txn, commit_id) {
            Some(Out::YMap(rec)) => rec,
            _ => {
                return Err(GridvcError::Encoding(format!(
                    "commit record {} vanished during chunked write",
                    commit_id
                )));
            }
        };
        let patch_written = match rec.get(&txn, "patch_chunks") {
            Some(Out::YArray(arr)) => arr.len(&txn) as usize,
            _ => 0,
        };
        let snapshot_ok = match snapshot_total {
            None => true,
            Some(total) => match rec.get(&txn, "snapshot_chunks") {
                Some(Out::YArray(arr)) => arr.len(&txn) as usize >= total,
                _ => false,
            },
        };
        if patch_written >= patch_total && snapshot_ok {
            rec.insert(&mut txn, "commit_complete", true);
            Ok(())
        } else {
            Err(GridvcError::CommitIncomplete(commit_id.to_string()))
        }
    }
}

impl BranchStore for ReplicatedBranchStore {
    fn ensure_document(&self, doc_id: &str, actor: &str, initial_state: &DocState) -> Result<()> {
        self.guard_doc(doc_id)?;
        self.run_repairs();
        if self.root_commit_id().is_some() {
            return Ok(());
        }

        let now = Utc::now().timestamp_millis();
        let initial = normalize(initial_state);
        let commit = self.build_commit(NewCommit {
            doc_id: doc_id.to_string(),
            parent_commit_id: None,
            merge_parent_commit_id: None,
            created_by: actor.to_string(),
            created_at: now,
            message: "Initial commit".to_string(),
            patch: diff(&empty_state(), &initial),
            next_state: Some(initial),
        })?;
        self.write_commit_record(&commit)?;

        // Adopt as root only if no concurrent bootstrap won in the meantime.
        let mut txn = self.doc.transact_mut();
        if meta_str(&self.meta, &txn, "root_commit_id").is_none() {
            self.meta.insert(&mut txn, "doc_id", self.doc_id.as_str());
            self.meta
                .insert(&mut txn, "root_commit_id", commit.id.as_str());
            if self.branches.get(&txn, MAIN_BRANCH).is_none() {
                let main = Branch {
                    id: Uuid::new_v4().to_string(),
                    doc_id: doc_id.to_string(),
                    name: MAIN_BRANCH.to_string(),
                    created_by: actor.to_string(),
                    created_at: now,
                    description: None,
                    head_commit_id: commit.id.clone(),
                };
                write_branch_record(&self.branches, &mut txn, &main);
            }
            if meta_str(&self.meta, &txn, "current_branch").is_none() {
                self.meta.insert(&mut txn, "current_branch", MAIN_BRANCH);
            }
        }
        Ok(())
    }

    fn list_branches(&self, doc_id: &str) -> Result<Vec<Branch>> {
        self.guard_doc(doc_id)?;
        Ok(self.branches_snapshot())
    }

    fn get_branch(&self, doc_id: &str, name: &str) -> Result<Option<Branch>> {
        self.guard_doc(doc_id)?;
        Ok(self.branch_by_name(name))
    }

    fn create_branch(&self, input: NewBranch) -> Result<Branch> {
        self.guard_doc(&input.doc_id)?;
        let branch = Branch {
            id: Uuid::new_v4().to_string(),
            doc_id: input.doc_id,
            name: input.name,
            created_by: input.created_by,
            created_at: input.created_at,
            description: input.description,
            head_commit_id: input.head_commit_id,
        };
        let mut txn = self.doc.transact_mut();
        // The uniqueness fact is re-checked inside the write transaction.
        if self.branches.get(&txn, branch.name.as_str()).is_some() {
            return Err(GridvcError::BranchExists {
                doc_id: branch.doc_id,
                name: branch.name,
            });
        }
        write_branch_record(&self.branches, &mut txn, &branch);
        drop(txn);
        Ok(branch)
    }

    fn rename_branch(&self, doc_id: &str, old_name: &str, new_name: &str) -> Result<()> {
        self.guard_doc(doc_id)?;
        let mut txn = self.doc.transact_mut();
        let existing = self
            .branches
            .get(&txn, old_name)
            .and_then(|value| record_to_any(&txn, value))
            .and_then(|any| decode_branch(old_name, &any));
        let Some(mut branch) = existing else {
            return Err(GridvcError::BranchNotFound {
                doc_id: doc_id.to_string(),
                name: old_name.to_string(),
            });
        };
        if self.branches.get(&txn, new_name).is_some() {
            return Err(GridvcError::BranchExists {
                doc_id: doc_id.to_string(),
                name: new_name.to_string(),
            });
        }
        branch.name = new_name.to_string();
        write_branch_record(&self.branches, &mut txn, &branch);
        self.branches.remove(&mut txn, old_name);
        if meta_str(&self.meta, &txn, "current_branch").as_deref() == Some(old_name) {
            self.meta.insert(&mut txn, "current_branch", new_name);
        }
        Ok(())
    }

    fn delete_branch(&self, doc_id: &str, name: &str) -> Result<()> {
        self.guard_doc(doc_id)?;
        let mut txn = self.doc.transact_mut();
        if self.branches.get(&txn, name).is_none() {
            return Err(GridvcError::BranchNotFound {
                doc_id: doc_id.to_string(),
                name: name.to_string(),
            });
        }
        // Commits stay; only the pointer goes away.
        self.branches.remove(&mut txn, name);
        if meta_str(&self.meta, &txn, "current_branch").as_deref() == Some(name) {
            self.meta.insert(&mut txn, "current_branch", MAIN_BRANCH);
        }
        Ok(())
    }

    fn update_branch_head(&self, doc_id: &str, name: &str, commit_id: &str) -> Result<()> {
        self.guard_doc(doc_id)?;
        let mut txn = self.doc.transact_mut();
        let existing = self
            .branches
            .get(&txn, name)
            .and_then(|value| record_to_any(&txn, value))
            .and_then(|any| decode_branch(name, &any));
        let Some(mut branch) = existing else {
            return Err(GridvcError::BranchNotFound {
                doc_id: doc_id.to_string(),
                name: name.to_string(),
            });
        };
        branch.head_commit_id = commit_id.to_string();
        write_branch_record(&self.branches, &mut txn, &branch);
        Ok(())
    }

    fn create_commit(&self, input: NewCommit) -> Result<Commit> {
        self.guard_doc(&input.doc_id)?;
        let commit = self.build_commit(input)?;
        self.write_commit_record(&commit)?;
        Ok(commit)
    }

    fn get_commit(&self, commit_id: &str) -> Result<Option<Commit>> {
        self.load_commit(commit_id)
    }

    fn put_commit(&self, commit: &Commit) -> Result<()> {
        self.guard_doc(&commit.doc_id)?;
        if self.read_raw_commit(&commit.id)?.is_some() {
            return Ok(());
        }
        self.write_commit_record(commit)?;
        // A migrated root commit also claims the root pointer if the
        // document has none yet.
        if commit.parent_commit_id.is_none() {
            let mut txn = self.doc.transact_mut();
            if meta_str(&self.meta, &txn, "root_commit_id").is_none() {
                self.meta.insert(&mut txn, "doc_id", self.doc_id.as_str());
                self.meta
                    .insert(&mut txn, "root_commit_id", commit.id.as_str());
            }
        }
        Ok(())
    }

    fn document_state_at(&self, commit_id: &str) -> Result<DocState> {
        replay_state_at(&mut |id: &str| self.load_commit(id), commit_id)
    }

    fn current_branch_name(&self, doc_id: &str) -> Result<String> {
        self.guard_doc(doc_id)?;
        let txn = self.doc.transact();
        Ok(meta_str(&self.meta, &txn, "current_branch")
            .unwrap_or_else(|| MAIN_BRANCH.to_string()))
    }

    fn set_current_branch_name(&self, doc_id: &str, name: &str) -> Result<()> {
        self.guard_doc(doc_id)?;
        let mut txn = self.doc.transact_mut();
        if self.branches.get(&txn, name).is_none() {
            return Err(GridvcError::BranchNotFound {
                doc_id: doc_id.to_string(),
                name: name.to_string(),
            });
        }
        self.meta.insert(&mut txn, "current_branch", name);
        Ok(())
    }
}

impl std::fmt::Debug for ReplicatedBranchStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicatedBranchStore")
            .field("doc_id", &self.doc_id)
            .finish_non_exhaustive()
    }
}
