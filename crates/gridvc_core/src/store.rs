//! The backend contract and shared commit-graph mechanics.
//!
//! Every persistence backend (in-memory, SQLite, replicated) implements
//! [`BranchStore`]. The backends share no mutable state; the commit-graph
//! traversal helpers in this module operate through a commit-lookup closure
//! so each backend can plug in its own storage reads.

use crate::error::{GridvcError, Result};
use crate::patch::apply;
use crate::state::{DocState, empty_state};
use crate::types::{Branch, Commit, NewBranch, NewCommit, StoreConfig};

/// Name of the branch created at document bootstrap.
pub const MAIN_BRANCH: &str = "main";

/// Contract implemented by every persistence backend.
///
/// Operations are synchronous `&self` methods; backends are `Send + Sync`
/// and internally serialize access to their substrate. The substrate's
/// transaction is the unit of atomicity throughout.
pub trait BranchStore: Send + Sync {
    /// Idempotent document bootstrap.
    ///
    /// If the document already has a root commit this returns without side
    /// effects (backends may first run backward-compatible repairs).
    /// Otherwise it creates a root commit whose patch is
    /// `diff(empty, initial_state)`, a "main" branch pointing at it, and the
    /// current-branch pointer.
    fn ensure_document(&self, doc_id: &str, actor: &str, initial_state: &DocState) -> Result<()>;

    /// List all branches of a document. Returns detached copies.
    fn list_branches(&self, doc_id: &str) -> Result<Vec<Branch>>;

    /// Look up one branch by name. Returns a detached copy.
    fn get_branch(&self, doc_id: &str, name: &str) -> Result<Option<Branch>>;

    /// Create a branch. Fails with [`GridvcError::BranchExists`] if the name
    /// is already taken for this document.
    fn create_branch(&self, input: NewBranch) -> Result<Branch>;

    /// Rename a branch. Fails with [`GridvcError::BranchNotFound`] if the
    /// old name does not exist and [`GridvcError::BranchExists`] on
    /// collision. If the current-branch pointer referenced the old name it
    /// is moved in the same atomic step.
    fn rename_branch(&self, doc_id: &str, old_name: &str, new_name: &str) -> Result<()>;

    /// Delete a branch. Fails with [`GridvcError::BranchNotFound`] if it
    /// does not exist. Never deletes commits. If the current-branch pointer
    /// referenced the deleted branch it falls back to "main" in the same
    /// atomic step.
    fn delete_branch(&self, doc_id: &str, name: &str) -> Result<()>;

    /// Move a branch's head to another commit. Fails with
    /// [`GridvcError::BranchNotFound`] if the branch does not exist.
    fn update_branch_head(&self, doc_id: &str, name: &str, commit_id: &str) -> Result<()>;

    /// Allocate an id, decide on a snapshot per the configured policy, and
    /// durably write a new commit.
    fn create_commit(&self, input: NewCommit) -> Result<Commit>;

    /// Look up a commit by id, or `None` if absent. Fails with
    /// [`GridvcError::CommitIncomplete`] when the commit exists but its
    /// write was interrupted and no readable payload remains.
    fn get_commit(&self, commit_id: &str) -> Result<Option<Commit>>;

    /// Insert a fully-formed commit, keeping its id and snapshot as-is.
    ///
    /// Idempotent: inserting a commit whose id already exists is success.
    /// This is the migration primitive; regular callers use
    /// [`BranchStore::create_commit`].
    fn put_commit(&self, commit: &Commit) -> Result<()>;

    /// Reconstruct the full document state at a commit.
    ///
    /// Walks parent links until an embedded snapshot (or the root), then
    /// replays patches forward in chain order. Fails with
    /// [`GridvcError::CommitNotFound`] if any link in the chain is missing.
    fn document_state_at(&self, commit_id: &str) -> Result<DocState>;

    /// Name of the document's current branch.
    fn current_branch_name(&self, doc_id: &str) -> Result<String>;

    /// Point the current-branch pointer at another branch. Fails with
    /// [`GridvcError::BranchNotFound`] if the branch does not exist.
    fn set_current_branch_name(&self, doc_id: &str, name: &str) -> Result<()>;
}

/// Reconstruct the document state at `commit_id` through a backend's
/// commit-lookup function.
///
/// Walks the parent chain backwards until a commit with an embedded snapshot
/// (or the root), then replays the collected patches forward. The snapshot
/// state already includes its own commit's patch, so replay resumes strictly
/// after it.
pub(crate) fn replay_state_at<F>(lookup: &mut F, commit_id: &str) -> Result<DocState>
where
    F: FnMut(&str) -> Result<Option<Commit>>,
{
    let mut pending: Vec<Commit> = Vec::new();
    let mut base = empty_state();
    let mut cursor = Some(commit_id.to_string());

    while let Some(id) = cursor {
        let commit = lookup(&id)?.ok_or_else(|| GridvcError::CommitNotFound(id.clone()))?;
        if let Some(snapshot) = &commit.snapshot {
            base = snapshot.clone();
            break;
        }
        cursor = commit.parent_commit_id.clone();
        pending.push(commit);
    }

    for commit in pending.iter().rev() {
        base = apply(&base, &commit.patch);
    }
    Ok(base)
}

/// Count commits on the parent chain from `parent_id` (inclusive) back to
/// the nearest snapshot-bearing commit, stopping at the root.
///
/// A parent that itself embeds a snapshot yields distance 0; a missing
/// parent (root commit being created) also yields 0.
pub(crate) fn snapshot_distance<F>(lookup: &mut F, parent_id: Option<&str>) -> Result<u32>
where
    F: FnMut(&str) -> Result<Option<Commit>>,
{
    let mut distance = 0u32;
    let mut cursor = parent_id.map(str::to_string);

    while let Some(id) = cursor {
        let commit = lookup(&id)?.ok_or_else(|| GridvcError::CommitNotFound(id.clone()))?;
        if commit.snapshot.is_some() {
            break;
        }
        distance += 1;
        cursor = commit.parent_commit_id.clone();
    }
    Ok(distance)
}

/// Decide whether a new commit should embed a full snapshot.
///
/// Two independent triggers (spec'd by policy, not backend): the serialized
/// patch size, and the replay distance since the last snapshot.
pub(crate) fn wants_snapshot(
    config: &StoreConfig,
    patch_bytes: usize,
    snapshot_distance: u32,
) -> bool {
    if let Some(limit) = config.snapshot_when_patch_exceeds_bytes
        && patch_bytes > limit
    {
        return true;
    }
    snapshot_distance + 1 >= config.snapshot_every_n_commits
}

/// The full state after applying a new commit's patch.
///
/// Prefers the caller-supplied `next_state` (cheap), otherwise replays from
/// the parent's reconstructed state.
pub(crate) fn resolve_commit_state<F>(lookup: &mut F, input: &NewCommit) -> Result<DocState>
where
    F: FnMut(&str) -> Result<Option<Commit>>,
{
    if let Some(next) = &input.next_state {
        return Ok(crate::state::normalize(next));
    }
    let parent_state = match &input.parent_commit_id {
        Some(parent) => replay_state_at(lookup, parent)?,
        None => empty_state(),
    };
    Ok(apply(&parent_state, &input.patch))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::{Patch, diff};
    use serde_json::json;
    use std::collections::HashMap;

    fn commit(id: &str, parent: Option<&str>, patch: Patch, snapshot: Option<DocState>) -> Commit {
        Commit {
            id: id.to_string(),
            doc_id: "doc".to_string(),
            parent_commit_id: parent.map(str::to_string),
            merge_parent_commit_id: None,
            created_by: "tester".to_string(),
            created_at: 0,
            message: String::new(),
            patch,
            snapshot,
        }
    }

    fn lookup_in(
        commits: &HashMap<String, Commit>,
    ) -> impl FnMut(&str) -> Result<Option<Commit>> + '_ {
        move |id| Ok(commits.get(id).cloned())
    }

    #[test]
    fn test_replay_from_root() {
        let s0 = json!({"a": 1});
        let s1 = json!({"a": 1, "b": 2});
        let mut commits = HashMap::new();
        commits.insert(
            "c0".to_string(),
            commit("c0", None, diff(&empty_state(), &s0), None),
        );
        commits.insert("c1".to_string(), commit("c1", Some("c0"), diff(&s0, &s1), None));

        assert_eq!(replay_state_at(&mut lookup_in(&commits), "c1").unwrap(), s1);
    }

    #[test]
    fn test_replay_resumes_after_snapshot() {
        let s1 = json!({"a": 1});
        let s2 = json!({"a": 2});
        let mut commits = HashMap::new();
        // c1 embeds a snapshot; its (bogus) patch must not be replayed again.
        commits.insert(
            "c1".to_string(),
            commit("c1", None, Patch::Set(json!("never applied")), Some(s1.clone())),
        );
        commits.insert("c2".to_string(), commit("c2", Some("c1"), diff(&s1, &s2), None));

        assert_eq!(replay_state_at(&mut lookup_in(&commits), "c2").unwrap(), s2);
        assert_eq!(replay_state_at(&mut lookup_in(&commits), "c1").unwrap(), s1);
    }

    #[test]
    fn test_replay_missing_link_fails() {
        let mut commits = HashMap::new();
        commits.insert(
            "c1".to_string(),
            commit("c1", Some("ghost"), Patch::empty(), None),
        );
        let err = replay_state_at(&mut lookup_in(&commits), "c1").unwrap_err();
        assert!(matches!(err, GridvcError::CommitNotFound(id) if id == "ghost"));
    }

    #[test]
    fn test_snapshot_distance_counts_to_nearest_snapshot() {
        let mut commits = HashMap::new();
        commits.insert(
            "c0".to_string(),
            commit("c0", None, Patch::empty(), Some(json!({}))),
        );
        commits.insert("c1".to_string(), commit("c1", Some("c0"), Patch::empty(), None));
        commits.insert("c2".to_string(), commit("c2", Some("c1"), Patch::empty(), None));

        let mut lookup = lookup_in(&commits);
        assert_eq!(snapshot_distance(&mut lookup, None).unwrap(), 0);
        assert_eq!(snapshot_distance(&mut lookup, Some("c0")).unwrap(), 0);
        assert_eq!(snapshot_distance(&mut lookup, Some("c1")).unwrap(), 1);
        assert_eq!(snapshot_distance(&mut lookup, Some("c2")).unwrap(), 2);
    }

    #[test]
    fn test_wants_snapshot_triggers() {
        let mut config = StoreConfig::default();
        config.snapshot_every_n_commits = 3;
        assert!(!wants_snapshot(&config, 10, 0));
        assert!(!wants_snapshot(&config, 10, 1));
        assert!(wants_snapshot(&config, 10, 2));

        config.snapshot_when_patch_exceeds_bytes = Some(100);
        assert!(wants_snapshot(&config, 101, 0));
        assert!(!wants_snapshot(&config, 100, 0));
    }
}
