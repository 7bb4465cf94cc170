//! In-memory backend: the reference implementation.
//!
//! No durability; source of truth for the interface semantics. All data
//! lives in `HashMap`s behind an `RwLock`, and every read returns detached
//! clones so callers cannot mutate store-internal state.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::{GridvcError, Result};
use crate::patch::diff;
use crate::state::{DocState, empty_state, normalize};
use crate::store::{
    BranchStore, MAIN_BRANCH, replay_state_at, resolve_commit_state, snapshot_distance,
    wants_snapshot,
};
use crate::types::{Branch, Commit, NewBranch, NewCommit, StoreConfig};

#[derive(Debug, Default)]
struct Inner {
    /// Commit graph, keyed by commit id.
    commits: HashMap<String, Commit>,
    /// Branches keyed by (doc_id, name).
    branches: HashMap<(String, String), Branch>,
    /// Root commit id per document.
    roots: HashMap<String, String>,
    /// Current-branch pointer per document.
    current: HashMap<String, String>,
}

/// In-memory [`BranchStore`].
#[derive(Debug, Default)]
pub struct MemoryBranchStore {
    config: StoreConfig,
    inner: RwLock<Inner>,
}

impl MemoryBranchStore {
    /// Create an empty store with the given configuration.
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            inner: RwLock::new(Inner::default()),
        }
    }
}

/// Decide on a snapshot and insert a new commit into `commits`.
fn commit_with_policy(
    config: &StoreConfig,
    commits: &mut HashMap<String, Commit>,
    input: NewCommit,
) -> Result<Commit> {
    let patch_bytes = serde_json::to_vec(&input.patch)?.len();
    let snapshot = {
        let mut lookup = |id: &str| Ok(commits.get(id).cloned());
        let distance = snapshot_distance(&mut lookup, input.parent_commit_id.as_deref())?;
        if wants_snapshot(config, patch_bytes, distance) {
            Some(resolve_commit_state(&mut lookup, &input)?)
        } else {
            None
        }
    };

    let commit = Commit {
        id: uuid::Uuid::new_v4().to_string(),
        doc_id: input.doc_id,
        parent_commit_id: input.parent_commit_id,
        merge_parent_commit_id: input.merge_parent_commit_id,
        created_by: input.created_by,
        created_at: input.created_at,
        message: input.message,
        patch: input.patch,
        snapshot,
    };
    commits.insert(commit.id.clone(), commit.clone());
    Ok(commit)
}

impl BranchStore for MemoryBranchStore {
    fn ensure_document(&self, doc_id: &str, actor: &str, initial_state: &DocState) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        if inner.roots.contains_key(doc_id) {
            return Ok(());
        }

        // History imported through put_commit has no registered root yet;
        // adopt it instead of creating a second root commit.
        let adopted = {
            let doc_commits = || inner.commits.values().filter(|c| c.doc_id == doc_id);
            let root = doc_commits()
                .filter(|c| c.parent_commit_id.is_none())
                .min_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)))
                .map(|c| c.id.clone());
            root.map(|root_id| {
                let head = doc_commits()
                    .max_by(|a, b| a.created_at.cmp(&b.created_at).then(b.id.cmp(&a.id)))
                    .map(|c| c.id.clone())
                    .unwrap_or_else(|| root_id.clone());
                (root_id, head)
            })
        };
        if let Some((root_id, head)) = adopted {
            let now = chrono::Utc::now().timestamp_millis();
            inner
                .branches
                .entry((doc_id.to_string(), MAIN_BRANCH.to_string()))
                .or_insert_with(|| Branch {
                    id: uuid::Uuid::new_v4().to_string(),
                    doc_id: doc_id.to_string(),
                    name: MAIN_BRANCH.to_string(),
                    created_by: actor.to_string(),
                    created_at: now,
                    description: None,
                    head_commit_id: head,
                });
            inner.roots.insert(doc_id.to_string(), root_id);
            inner
                .current
                .entry(doc_id.to_string())
                .or_insert_with(|| MAIN_BRANCH.to_string());
            return Ok(());
        }

        let initial = normalize(initial_state);
        let now = chrono::Utc::now().timestamp_millis();
        let root = commit_with_policy(
            &self.config,
            &mut inner.commits,
            NewCommit {
                doc_id: doc_id.to_string(),
                parent_commit_id: None,
                merge_parent_commit_id: None,
                created_by: actor.to_string(),
                created_at: now,
                message: "Initial commit".to_string(),
                patch: diff(&empty_state(), &initial),
                next_state: Some(initial),
            },
        )?;

        inner.branches.insert(
            (doc_id.to_string(), MAIN_BRANCH.to_string()),
            Branch {
                id: uuid::Uuid::new_v4().to_string(),
                doc_id: doc_id.to_string(),
                name: MAIN_BRANCH.to_string(),
                created_by: actor.to_string(),
                created_at: now,
                description: None,
                head_commit_id: root.id.clone(),
            },
        );
        inner.roots.insert(doc_id.to_string(), root.id);
        inner
            .current
            .insert(doc_id.to_string(), MAIN_BRANCH.to_string());
        Ok(())
    }

    fn list_branches(&self, doc_id: &str) -> Result<Vec<Branch>> {
        let inner = self.inner.read().unwrap();
        let mut branches: Vec<Branch> = inner
            .branches
            .values()
            .filter(|b| b.doc_id == doc_id)
            .cloned()
            .collect();
        branches.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(branches)
    }

    fn get_branch(&self, doc_id: &str, name: &str) -> Result<Option<Branch>> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .branches
            .get(&(doc_id.to_string(), name.to_string()))
            .cloned())
    }

    fn create_branch(&self, input: NewBranch) -> Result<Branch> {
        let mut inner = self.inner.write().unwrap();
        let key = (input.doc_id.clone(), input.name.clone());
        if inner.branches.contains_key(&key) {
            return Err(GridvcError::BranchExists {
                doc_id: input.doc_id,
                name: input.name,
            });
        }
        let branch = Branch {
            id: uuid::Uuid::new_v4().to_string(),
            doc_id: input.doc_id,
            name: input.name,
            created_by: input.created_by,
            created_at: input.created_at,
            description: input.description,
            head_commit_id: input.head_commit_id,
        };
        inner.branches.insert(key, branch.clone());
        Ok(branch)
    }

    fn rename_branch(&self, doc_id: &str, old_name: &str, new_name: &str) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        let new_key = (doc_id.to_string(), new_name.to_string());
        if inner.branches.contains_key(&new_key) {
            return Err(GridvcError::BranchExists {
                doc_id: doc_id.to_string(),
                name: new_name.to_string(),
            });
        }
        let mut branch = inner
            .branches
            .remove(&(doc_id.to_string(), old_name.to_string()))
            .ok_or_else(|| GridvcError::BranchNotFound {
                doc_id: doc_id.to_string(),
                name: old_name.to_string(),
            })?;
        branch.name = new_name.to_string();
        inner.branches.insert(new_key, branch);
        if inner.current.get(doc_id).map(String::as_str) == Some(old_name) {
            inner
                .current
                .insert(doc_id.to_string(), new_name.to_string());
        }
        Ok(())
    }

    fn delete_branch(&self, doc_id: &str, name: &str) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        inner
            .branches
            .remove(&(doc_id.to_string(), name.to_string()))
            .ok_or_else(|| GridvcError::BranchNotFound {
                doc_id: doc_id.to_string(),
                name: name.to_string(),
            })?;
        if inner.current.get(doc_id).map(String::as_str) == Some(name) {
            inner
                .current
                .insert(doc_id.to_string(), MAIN_BRANCH.to_string());
        }
        Ok(())
    }

    fn update_branch_head(&self, doc_id: &str, name: &str, commit_id: &str) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        let branch = inner
            .branches
            .get_mut(&(doc_id.to_string(), name.to_string()))
            .ok_or_else(|| GridvcError::BranchNotFound {
                doc_id: doc_id.to_string(),
                name: name.to_string(),
            })?;
        branch.head_commit_id = commit_id.to_string();
        Ok(())
    }

    fn create_commit(&self, input: NewCommit) -> Result<Commit> {
        let mut inner = self.inner.write().unwrap();
        commit_with_policy(&self.config, &mut inner.commits, input)
    }

    fn get_commit(&self, commit_id: &str) -> Result<Option<Commit>> {
        let inner = self.inner.read().unwrap();
        Ok(inner.commits.get(commit_id).cloned())
    }

    fn put_commit(&self, commit: &Commit) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        inner
            .commits
            .entry(commit.id.clone())
            .or_insert_with(|| commit.clone());
        Ok(())
    }

    fn document_state_at(&self, commit_id: &str) -> Result<DocState> {
        let inner = self.inner.read().unwrap();
        replay_state_at(&mut |id| Ok(inner.commits.get(id).cloned()), commit_id)
    }

    fn current_branch_name(&self, doc_id: &str) -> Result<String> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .current
            .get(doc_id)
            .cloned()
            .unwrap_or_else(|| MAIN_BRANCH.to_string()))
    }

    fn set_current_branch_name(&self, doc_id: &str, name: &str) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        if !inner
            .branches
            .contains_key(&(doc_id.to_string(), name.to_string()))
        {
            return Err(GridvcError::BranchNotFound {
                doc_id: doc_id.to_string(),
                name: name.to_string(),
            });
        }
        inner.current.insert(doc_id.to_string(), name.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn new_commit(doc_id: &str, parent: Option<&str>, patch: crate::patch::Patch) -> NewCommit {
        NewCommit {
            doc_id: doc_id.to_string(),
            parent_commit_id: parent.map(str::to_string),
            merge_parent_commit_id: None,
            created_by: "tester".to_string(),
            created_at: chrono::Utc::now().timestamp_millis(),
            message: "edit".to_string(),
            patch,
            next_state: None,
        }
    }

    #[test]
    fn test_bootstrap_is_idempotent() {
        let store = MemoryBranchStore::new(StoreConfig::default());
        let s0 = json!({"sheets": {}});
        store.ensure_document("doc", "alice", &s0).unwrap();
        store.ensure_document("doc", "bob", &s0).unwrap();

        let branches = store.list_branches("doc").unwrap();
        assert_eq!(branches.len(), 1);
        assert_eq!(branches[0].name, "main");

        let inner = store.inner.read().unwrap();
        let roots: Vec<_> = inner
            .commits
            .values()
            .filter(|c| c.parent_commit_id.is_none())
            .collect();
        assert_eq!(roots.len(), 1);
    }

    #[test]
    fn test_bootstrap_state_round_trips() {
        let store = MemoryBranchStore::new(StoreConfig::default());
        let s0 = json!({"sheets": {"Sheet1": {"A1": 1}}});
        store.ensure_document("doc", "alice", &s0).unwrap();

        let main = store.get_branch("doc", "main").unwrap().unwrap();
        assert_eq!(store.document_state_at(&main.head_commit_id).unwrap(), s0);
        assert_eq!(store.current_branch_name("doc").unwrap(), "main");
    }

    #[test]
    fn test_branch_name_unique_per_document() {
        let store = MemoryBranchStore::new(StoreConfig::default());
        store.ensure_document("doc-a", "alice", &json!({})).unwrap();
        store.ensure_document("doc-b", "alice", &json!({})).unwrap();

        let head = store.get_branch("doc-a", "main").unwrap().unwrap().head_commit_id;
        let input = |doc: &str| NewBranch {
            doc_id: doc.to_string(),
            name: "draft".to_string(),
            created_by: "alice".to_string(),
            created_at: 0,
            description: None,
            head_commit_id: head.clone(),
        };
        store.create_branch(input("doc-a")).unwrap();
        // Same name on another document is fine.
        store.create_branch(input("doc-b")).unwrap();

        let err = store.create_branch(input("doc-a")).unwrap_err();
        assert!(matches!(err, GridvcError::BranchExists { .. }));
    }

    #[test]
    fn test_rename_moves_current_pointer() {
        let store = MemoryBranchStore::new(StoreConfig::default());
        store.ensure_document("doc", "alice", &json!({})).unwrap();

        store.rename_branch("doc", "main", "trunk").unwrap();
        assert_eq!(store.current_branch_name("doc").unwrap(), "trunk");
        assert!(store.get_branch("doc", "main").unwrap().is_none());

        let err = store.rename_branch("doc", "ghost", "x").unwrap_err();
        assert!(matches!(err, GridvcError::BranchNotFound { .. }));
    }

    #[test]
    fn test_delete_branch_keeps_commits() {
        let store = MemoryBranchStore::new(StoreConfig::default());
        store.ensure_document("doc", "alice", &json!({"v": 1})).unwrap();
        let head = store.get_branch("doc", "main").unwrap().unwrap().head_commit_id;

        store
            .create_branch(NewBranch {
                doc_id: "doc".to_string(),
                name: "draft".to_string(),
                created_by: "alice".to_string(),
                created_at: 0,
                description: None,
                head_commit_id: head.clone(),
            })
            .unwrap();
        store.set_current_branch_name("doc", "draft").unwrap();
        store.delete_branch("doc", "draft").unwrap();

        // Deleting a branch never deletes commits; pointer falls back to main.
        assert!(store.get_commit(&head).unwrap().is_some());
        assert_eq!(store.current_branch_name("doc").unwrap(), "main");
    }

    #[test]
    fn test_snapshot_policy_does_not_change_reconstruction() {
        let states: Vec<serde_json::Value> = (0..12)
            .map(|i| json!({"cells": {"A1": i, "label": format!("row {}", i)}}))
            .collect();

        let mut heads = Vec::new();
        for every_n in [1u32, 1000u32] {
            let mut config = StoreConfig::default();
            config.snapshot_every_n_commits = every_n;
            let store = MemoryBranchStore::new(config);
            store.ensure_document("doc", "alice", &states[0]).unwrap();

            let mut head = store.get_branch("doc", "main").unwrap().unwrap().head_commit_id;
            let mut prev = states[0].clone();
            for next in &states[1..] {
                let commit = store
                    .create_commit(new_commit("doc", Some(&head), diff(&prev, next)))
                    .unwrap();
                head = commit.id;
                prev = next.clone();
            }
            assert_eq!(store.document_state_at(&head).unwrap(), states[11]);
            heads.push(store.document_state_at(&head).unwrap());
        }
        assert_eq!(heads[0], heads[1]);
    }

    #[test]
    fn test_size_trigger_embeds_snapshot() {
        let mut config = StoreConfig::default();
        config.snapshot_when_patch_exceeds_bytes = Some(64);
        let store = MemoryBranchStore::new(config);
        store.ensure_document("doc", "alice", &json!({})).unwrap();
        let head = store.get_branch("doc", "main").unwrap().unwrap().head_commit_id;

        let big = json!({"cells": {"A1": "x".repeat(200)}});
        let commit = store
            .create_commit(new_commit("doc", Some(&head), diff(&json!({}), &big)))
            .unwrap();
        assert_eq!(commit.snapshot, Some(big));
    }

    #[test]
    fn test_update_head_unknown_branch_fails() {
        let store = MemoryBranchStore::new(StoreConfig::default());
        store.ensure_document("doc", "alice", &json!({})).unwrap();
        let err = store.update_branch_head("doc", "ghost", "c1").unwrap_err();
        assert!(matches!(err, GridvcError::BranchNotFound { .. }));
    }

    #[test]
    fn test_end_to_end_edit_and_branch() {
        let store = MemoryBranchStore::new(StoreConfig::default());
        let s0 = json!({"sheets": {"Sheet1": {"cells": {}}}});
        store.ensure_document("doc", "alice", &s0).unwrap();
        let c0 = store.get_branch("doc", "main").unwrap().unwrap().head_commit_id;

        let s1 = json!({"sheets": {"Sheet1": {"cells": {"A1": "=SUM(B1:B9)"}}}});
        let c1 = store
            .create_commit(new_commit("doc", Some(&c0), diff(&s0, &s1)))
            .unwrap();
        store.update_branch_head("doc", "main", &c1.id).unwrap();
        assert_eq!(store.document_state_at(&c1.id).unwrap(), s1);

        store
            .create_branch(NewBranch {
                doc_id: "doc".to_string(),
                name: "draft".to_string(),
                created_by: "alice".to_string(),
                created_at: 0,
                description: Some("experiment".to_string()),
                head_commit_id: c1.id.clone(),
            })
            .unwrap();
        assert_eq!(store.list_branches("doc").unwrap().len(), 2);
    }
}
