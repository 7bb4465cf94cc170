//! Crash repair and stale-write cleanup for the replicated backend.
//!
//! Peers can disappear mid-write: a bootstrap that crashed before adopting
//! the root pointer, a chunked payload that never finished, a branch head
//! pointing at a commit whose payload never arrived. Repairs run on every
//! document bootstrap, are idempotent, and only act on facts re-checked
//! inside the transaction that mutates them.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use chrono::Utc;
use yrs::{Map, ReadTxn, Transact};

use super::{
    RawCommit, ReplicatedBranchStore, decode_branch, decode_raw_commit, meta_str, record_to_any,
    write_branch_record,
};
use crate::store::MAIN_BRANCH;

/// Preference order when inferring a root: fully-written commits first, then
/// readable payloads, then the oldest, then the lowest id as a deterministic
/// tiebreak.
fn root_preference(a: &RawCommit, b: &RawCommit) -> Ordering {
    b.complete
        .cmp(&a.complete)
        .then(b.patch.is_some().cmp(&a.patch.is_some()))
        .then(a.created_at.cmp(&b.created_at))
        .then(a.id.cmp(&b.id))
}

/// Preference order when repointing a dangling branch head: like
/// [`root_preference`] but newest first.
fn latest_preference(a: &RawCommit, b: &RawCommit) -> Ordering {
    b.complete
        .cmp(&a.complete)
        .then(b.patch.is_some().cmp(&a.patch.is_some()))
        .then(b.created_at.cmp(&a.created_at))
        .then(a.id.cmp(&b.id))
}

fn infer_latest_commit(raws: &[RawCommit]) -> Option<String> {
    let mut candidates: Vec<&RawCommit> = raws.iter().collect();
    candidates.sort_by(|a, b| latest_preference(a, b));
    candidates
        .into_iter()
        .find(|raw| raw.readable())
        .map(|raw| raw.id.clone())
}

impl ReplicatedBranchStore {
    pub(super) fn run_repairs(&self) {
        self.repair_root_pointer();
        // Sweep before head repair: a head repointed in this pass still
        // keeps its old target reachable for the sweep, so the record is
        // only collected by a later pass.
        self.sweep_stale_commits(Utc::now().timestamp_millis());
        self.repair_branch_heads();
    }

    /// Restore a missing or dangling root pointer from the commit graph.
    fn repair_root_pointer(&self) {
        let raws = self.scan_raw_commits();
        if raws.is_empty() {
            return;
        }
        let by_id: HashMap<&str, &RawCommit> =
            raws.iter().map(|raw| (raw.id.as_str(), raw)).collect();
        if let Some(root) = self.root_commit_id()
            && by_id.get(root.as_str()).is_some_and(|raw| raw.readable())
        {
            return;
        }
        let Some(inferred) = self.infer_root_commit(&raws, &by_id) else {
            return;
        };
        log::warn!(
            "Root pointer missing or dangling; adopting commit {} as root",
            inferred
        );
        let mut txn = self.doc.transact_mut();
        // Another peer may have repaired it already.
        let current = meta_str(&self.meta, &txn, "root_commit_id");
        if current
            .as_deref()
            .is_none_or(|id| !by_id.get(id).is_some_and(|raw| raw.readable()))
        {
            self.meta.insert(&mut txn, "doc_id", self.doc_id.as_str());
            self.meta
                .insert(&mut txn, "root_commit_id", inferred.as_str());
        }
    }

    /// Walk the main branch's parent chain to its origin; fall back to the
    /// best parentless commit when the chain is broken or absent.
    fn infer_root_commit(
        &self,
        raws: &[RawCommit],
        by_id: &HashMap<&str, &RawCommit>,
    ) -> Option<String> {
        if let Some(main) = self.branch_by_name(MAIN_BRANCH) {
            let mut seen = HashSet::new();
            let mut cursor = main.head_commit_id;
            while seen.insert(cursor.clone()) {
                match by_id.get(cursor.as_str()) {
                    Some(raw) => match &raw.parent_commit_id {
                        Some(parent) => cursor = parent.clone(),
                        None => {
                            if raw.readable() {
                                return Some(raw.id.clone());
                            }
                            break;
                        }
                    },
                    None => break,
                }
            }
        }
        let mut candidates: Vec<&RawCommit> = raws
            .iter()
            .filter(|raw| raw.parent_commit_id.is_none())
            .collect();
        candidates.sort_by(|a, b| root_preference(a, b));
        candidates
            .into_iter()
            .find(|raw| raw.readable())
            .map(|raw| raw.id.clone())
    }

    /// Repoint branch heads that reference missing commits or commits whose
    /// patch payload never fully arrived, and reset a current-branch pointer
    /// that names a missing branch.
    ///
    /// The gate is payload presence, not the finalization flag: a commit
    /// whose payload is whole is served by reads even before the writer
    /// flips `commit_complete`, and a head pointing at it must stay put.
    fn repair_branch_heads(&self) {
        let raws = self.scan_raw_commits();
        let by_id: HashMap<&str, &RawCommit> =
            raws.iter().map(|raw| (raw.id.as_str(), raw)).collect();
        let Some(latest) = infer_latest_commit(&raws) else {
            return;
        };
        for branch in self.branches_snapshot() {
            if by_id
                .get(branch.head_commit_id.as_str())
                .is_some_and(|raw| raw.has_payload())
            {
                continue;
            }
            log::warn!(
                "Branch '{}' head {} is unreadable; repointing to {}",
                branch.name,
                branch.head_commit_id,
                latest
            );
            let mut txn = self.doc.transact_mut();
            // Re-check under the write transaction: a peer may have moved it.
            let current = self
                .branches
                .get(&txn, branch.name.as_str())
                .and_then(|value| record_to_any(&txn, value))
                .and_then(|any| decode_branch(&branch.name, &any));
            if let Some(mut current) = current
                && !by_id
                    .get(current.head_commit_id.as_str())
                    .is_some_and(|raw| raw.has_payload())
            {
                current.head_commit_id = latest.clone();
                write_branch_record(&self.branches, &mut txn, &current);
            }
        }

        let names: HashSet<String> = self
            .branches_snapshot()
            .into_iter()
            .map(|branch| branch.name)
            .collect();
        if !names.contains(MAIN_BRANCH) {
            return;
        }
        let mut txn = self.doc.transact_mut();
        let current = meta_str(&self.meta, &txn, "current_branch");
        if current.is_some_and(|name| !names.contains(&name)) {
            log::warn!("Current-branch pointer named a missing branch; resetting to main");
            self.meta.insert(&mut txn, "current_branch", MAIN_BRANCH);
        }
    }

    /// Delete incomplete commits whose write started longer than the
    /// configured TTL ago, provided nothing references them. Returns how
    /// many records were removed.
    ///
    /// Reachability (root pointer, branch heads, parent links) is recomputed
    /// inside the deleting transaction so a concurrent head move cannot race
    /// the sweep.
    pub(super) fn sweep_stale_commits(&self, now_ms: i64) -> usize {
        let ttl = self.config.incomplete_commit_ttl_ms;
        let stale: Vec<String> = self
            .scan_raw_commits()
            .iter()
            .filter(|raw| !raw.complete && now_ms - raw.write_started_at >= ttl)
            .map(|raw| raw.id.clone())
            .collect();
        if stale.is_empty() {
            return 0;
        }
        let mut removed = 0;
        let mut txn = self.doc.transact_mut();
        let reachable = self.reachable_ids(&txn);
        for id in stale {
            if reachable.contains(&id) {
                continue;
            }
            let still_incomplete = self
                .commits
                .get(&txn, id.as_str())
                .and_then(|value| record_to_any(&txn, value))
                .and_then(|any| decode_raw_commit(&id, &any).ok().flatten())
                .is_some_and(|raw| !raw.complete);
            if still_incomplete {
                log::debug!("Removing stale incomplete commit {}", id);
                self.commits.remove(&mut txn, id.as_str());
                removed += 1;
            }
        }
        removed
    }

    /// Every commit id referenced by the root pointer, a branch head, or a
    /// parent link of any record.
    fn reachable_ids<T: ReadTxn>(&self, txn: &T) -> HashSet<String> {
        let mut reachable = HashSet::new();
        if let Some(root) = meta_str(&self.meta, txn, "root_commit_id") {
            reachable.insert(root);
        }
        for (name, value) in self.branches.iter(txn) {
            if let Some(any) = record_to_any(txn, value)
                && let Some(branch) = decode_branch(&name.to_string(), &any)
            {
                reachable.insert(branch.head_commit_id);
            }
        }
        for (key, value) in self.commits.iter(txn) {
            let Some(any) = record_to_any(txn, value) else {
                continue;
            };
            if let Ok(Some(raw)) = decode_raw_commit(&key.to_string(), &any) {
                if let Some(parent) = raw.parent_commit_id {
                    reachable.insert(parent);
                }
                if let Some(parent) = raw.merge_parent_commit_id {
                    reachable.insert(parent);
                }
            }
        }
        reachable
    }
}
