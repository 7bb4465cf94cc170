//! Cross-backend history migration.
//!
//! Copies a document's commit graph and branches from one backend into
//! another, preserving commit ids and embedded snapshots. The operation is
//! idempotent and resumable: commits that already exist in the destination
//! are skipped, branches are upserted.

use std::collections::{HashMap, HashSet};

use crate::error::{GridvcError, Result};
use crate::store::BranchStore;
use crate::types::{Commit, NewBranch};

/// Copy `doc_id` from `src` into `dst`. Returns the number of commits newly
/// written to the destination.
///
/// Every commit reachable from the source's branch heads is copied in
/// parent-before-child order via [`BranchStore::put_commit`], then branches
/// and the current-branch pointer are brought over. Fails with
/// [`GridvcError::RootCommitMissing`] when the source document has no
/// branches to copy from.
pub fn copy_document(src: &dyn BranchStore, dst: &dyn BranchStore, doc_id: &str) -> Result<usize> {
    let branches = src.list_branches(doc_id)?;
    if branches.is_empty() {
        return Err(GridvcError::RootCommitMissing(doc_id.to_string()));
    }

    let ordered = collect_history(src, branches.iter().map(|b| b.head_commit_id.clone()))?;

    let mut copied = 0;
    for commit in &ordered {
        match dst.get_commit(&commit.id) {
            Ok(Some(_)) => {}
            Ok(None) => {
                dst.put_commit(commit)?;
                copied += 1;
                log::debug!("Copied commit {} of document {}", commit.id, doc_id);
            }
            // A half-written record already owns this id in the destination;
            // put_commit leaves it alone.
            Err(GridvcError::CommitIncomplete(_)) => dst.put_commit(commit)?,
            Err(e) => return Err(e),
        }
    }

    for branch in &branches {
        match dst.get_branch(doc_id, &branch.name)? {
            Some(existing) => {
                if existing.head_commit_id != branch.head_commit_id {
                    dst.update_branch_head(doc_id, &branch.name, &branch.head_commit_id)?;
                }
            }
            None => {
                dst.create_branch(NewBranch {
                    doc_id: doc_id.to_string(),
                    name: branch.name.clone(),
                    created_by: branch.created_by.clone(),
                    created_at: branch.created_at,
                    description: branch.description.clone(),
                    head_commit_id: branch.head_commit_id.clone(),
                })?;
            }
        }
    }

    let current = src.current_branch_name(doc_id)?;
    if dst.current_branch_name(doc_id)? != current {
        dst.set_current_branch_name(doc_id, &current)?;
    }

    log::debug!("Migrated {} new commits of document {}", copied, doc_id);
    Ok(copied)
}

/// Collect every commit reachable from `heads`, ordered parents before
/// children. A broken parent link in the source is an error.
fn collect_history(
    src: &dyn BranchStore,
    heads: impl Iterator<Item = String>,
) -> Result<Vec<Commit>> {
    let mut by_id: HashMap<String, Commit> = HashMap::new();
    let mut ordered: Vec<Commit> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    let mut stack: Vec<(String, bool)> = heads.map(|head| (head, false)).collect();

    while let Some((id, expanded)) = stack.pop() {
        if expanded {
            if let Some(commit) = by_id.remove(&id) {
                ordered.push(commit);
            }
            continue;
        }
        if !seen.insert(id.clone()) {
            continue;
        }
        let commit = src
            .get_commit(&id)?
            .ok_or_else(|| GridvcError::CommitNotFound(id.clone()))?;
        stack.push((id.clone(), true));
        for parent in [&commit.parent_commit_id, &commit.merge_parent_commit_id]
            .into_iter()
            .flatten()
        {
            if !seen.contains(parent) {
                stack.push((parent.clone(), false));
            }
        }
        by_id.insert(id, commit);
    }
    Ok(ordered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBranchStore;
    use crate::patch::diff;
    use crate::replicated::ReplicatedBranchStore;
    use crate::sqlite::SqliteBranchStore;
    use crate::store::MAIN_BRANCH;
    use crate::types::{NewCommit, StoreConfig};
    use serde_json::json;
    use yrs::Doc;

    fn seeded_source() -> (MemoryBranchStore, String, serde_json::Value) {
        let src = MemoryBranchStore::new(StoreConfig::default());
        let s0 = json!({"cells": {"A1": 1}});
        src.ensure_document("doc", "alice", &s0).unwrap();

        let mut head = src
            .get_branch("doc", MAIN_BRANCH)
            .unwrap()
            .unwrap()
            .head_commit_id;
        let mut state = s0;
        for i in 2..5 {
            let next = json!({"cells": {"A1": i}});
            let commit = src
                .create_commit(NewCommit {
                    doc_id: "doc".to_string(),
                    parent_commit_id: Some(head.clone()),
                    merge_parent_commit_id: None,
                    created_by: "alice".to_string(),
                    created_at: i,
                    message: format!("set A1 to {}", i),
                    patch: diff(&state, &next),
                    next_state: Some(next.clone()),
                })
                .unwrap();
            src.update_branch_head("doc", MAIN_BRANCH, &commit.id)
                .unwrap();
            state = next;
            head = commit.id;
        }
        src.create_branch(crate::types::NewBranch {
            doc_id: "doc".to_string(),
            name: "review".to_string(),
            created_by: "bob".to_string(),
            created_at: 9,
            description: Some("review copy".to_string()),
            head_commit_id: head.clone(),
        })
        .unwrap();
        src.set_current_branch_name("doc", "review").unwrap();
        (src, head, state)
    }

    #[test]
    fn test_copy_between_memory_stores_is_idempotent() {
        let (src, head, state) = seeded_source();
        let dst = MemoryBranchStore::new(StoreConfig::default());

        let copied = copy_document(&src, &dst, "doc").unwrap();
        assert_eq!(copied, 4);
        assert_eq!(dst.document_state_at(&head).unwrap(), state);
        assert_eq!(dst.current_branch_name("doc").unwrap(), "review");
        assert_eq!(dst.list_branches("doc").unwrap().len(), 2);

        // Commit ids survive as-is, so a re-run copies nothing.
        assert_eq!(copy_document(&src, &dst, "doc").unwrap(), 0);
        assert_eq!(dst.list_branches("doc").unwrap().len(), 2);
    }

    #[test]
    fn test_copy_into_replicated_store_adopts_root() {
        let (src, head, state) = seeded_source();
        let dst = ReplicatedBranchStore::new(Doc::new(), "doc", StoreConfig::default()).unwrap();

        copy_document(&src, &dst, "doc").unwrap();
        assert_eq!(dst.document_state_at(&head).unwrap(), state);
        assert_eq!(
            dst.get_branch("doc", MAIN_BRANCH)
                .unwrap()
                .unwrap()
                .head_commit_id,
            head
        );

        // Bootstrapping after migration must not create a second root.
        dst.ensure_document("doc", "carol", &json!({"fresh": true}))
            .unwrap();
        assert_eq!(dst.document_state_at(&head).unwrap(), state);
        let src_root = src
            .get_commit(&head)
            .unwrap()
            .map(|mut c| {
                while let Some(parent) = c.parent_commit_id.clone() {
                    c = src.get_commit(&parent).unwrap().unwrap();
                }
                c.id
            })
            .unwrap();
        assert_eq!(dst.get_commit(&src_root).unwrap().unwrap().parent_commit_id, None);
    }

    #[test]
    fn test_copy_into_sqlite_store_keeps_current_branch() {
        let (src, head, state) = seeded_source();
        let dst = SqliteBranchStore::in_memory(StoreConfig::default()).unwrap();

        copy_document(&src, &dst, "doc").unwrap();
        assert_eq!(dst.current_branch_name("doc").unwrap(), "review");
        assert_eq!(dst.document_state_at(&head).unwrap(), state);

        // A later bootstrap adopts the migrated history and keeps the
        // pointer where the migration set it.
        dst.ensure_document("doc", "carol", &json!({"fresh": true}))
            .unwrap();
        assert_eq!(dst.current_branch_name("doc").unwrap(), "review");
        assert_eq!(dst.list_branches("doc").unwrap().len(), 2);
    }

    #[test]
    fn test_copy_of_unknown_document_fails() {
        let src = MemoryBranchStore::new(StoreConfig::default());
        let dst = MemoryBranchStore::new(StoreConfig::default());
        let err = copy_document(&src, &dst, "nope").unwrap_err();
        assert!(matches!(err, GridvcError::RootCommitMissing(_)));
    }
}
