//! SQLite-backed durable backend.
//!
//! Single-writer, transactional, file-persisted. The substrate has no
//! payload-size ceiling, so patches and snapshots are stored as inline JSON
//! text and no chunking is needed.
//!
//! # Thread Safety
//!
//! The connection is wrapped in a `Mutex` for thread-safe access.
//! SQLite itself is used in serialized threading mode.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension, params};

use crate::error::{GridvcError, Result};
use crate::patch::{Patch, diff};
use crate::state::{DocState, empty_state, normalize};
use crate::store::{
    BranchStore, MAIN_BRANCH, replay_state_at, resolve_commit_state, snapshot_distance,
    wants_snapshot,
};
use crate::types::{Branch, Commit, NewBranch, NewCommit, StoreConfig};

/// SQLite-backed [`BranchStore`].
pub struct SqliteBranchStore {
    conn: Mutex<Connection>,
    config: StoreConfig,
}

impl SqliteBranchStore {
    /// Open or create a database at the given path.
    pub fn open<P: AsRef<Path>>(path: P, config: StoreConfig) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
            config,
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Create an in-memory database for testing.
    ///
    /// Data is lost when the store is dropped.
    pub fn in_memory(config: StoreConfig) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
            config,
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS commits (
                id TEXT PRIMARY KEY,
                doc_id TEXT NOT NULL,
                parent_commit_id TEXT,
                merge_parent_commit_id TEXT,
                created_by TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                message TEXT NOT NULL,
                patch_payload TEXT NOT NULL,
                snapshot_payload TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_commits_doc ON commits(doc_id, created_at);

            CREATE TABLE IF NOT EXISTS branches (
                id TEXT PRIMARY KEY,
                doc_id TEXT NOT NULL,
                name TEXT NOT NULL,
                created_by TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                description TEXT,
                head_commit_id TEXT NOT NULL,
                UNIQUE(doc_id, name)
            );

            -- Per-document pointers: root commit and the current branch.
            CREATE TABLE IF NOT EXISTS docs (
                doc_id TEXT PRIMARY KEY,
                root_commit_id TEXT NOT NULL,
                current_branch TEXT NOT NULL
            );
            "#,
        )?;
        Ok(())
    }
}

fn row_to_commit(row: &rusqlite::Row<'_>) -> rusqlite::Result<(Commit, String, Option<String>)> {
    let commit = Commit {
        id: row.get(0)?,
        doc_id: row.get(1)?,
        parent_commit_id: row.get(2)?,
        merge_parent_commit_id: row.get(3)?,
        created_by: row.get(4)?,
        created_at: row.get(5)?,
        message: row.get(6)?,
        patch: Patch::empty(),
        snapshot: None,
    };
    Ok((commit, row.get(7)?, row.get(8)?))
}

fn commit_by_id(conn: &Connection, commit_id: &str) -> Result<Option<Commit>> {
    let row = conn
        .query_row(
            "SELECT id, doc_id, parent_commit_id, merge_parent_commit_id, created_by,
                    created_at, message, patch_payload, snapshot_payload
             FROM commits WHERE id = ?",
            params![commit_id],
            row_to_commit,
        )
        .optional()?;

    match row {
        None => Ok(None),
        Some((mut commit, patch_json, snapshot_json)) => {
            commit.patch = serde_json::from_str(&patch_json)?;
            commit.snapshot = match snapshot_json {
                Some(json) => Some(serde_json::from_str(&json)?),
                None => None,
            };
            Ok(Some(commit))
        }
    }
}

fn row_to_branch(row: &rusqlite::Row<'_>) -> rusqlite::Result<Branch> {
    Ok(Branch {
        id: row.get(0)?,
        doc_id: row.get(1)?,
        name: row.get(2)?,
        created_by: row.get(3)?,
        created_at: row.get(4)?,
        description: row.get(5)?,
        head_commit_id: row.get(6)?,
    })
}

fn insert_commit(conn: &Connection, commit: &Commit, or_ignore: bool) -> Result<()> {
    let patch_json = serde_json::to_string(&commit.patch)?;
    let snapshot_json = commit
        .snapshot
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    let sql = if or_ignore {
        "INSERT OR IGNORE INTO commits (id, doc_id, parent_commit_id, merge_parent_commit_id,
             created_by, created_at, message, patch_payload, snapshot_payload)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"
    } else {
        "INSERT INTO commits (id, doc_id, parent_commit_id, merge_parent_commit_id,
             created_by, created_at, message, patch_payload, snapshot_payload)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"
    };
    conn.execute(
        sql,
        params![
            commit.id,
            commit.doc_id,
            commit.parent_commit_id,
            commit.merge_parent_commit_id,
            commit.created_by,
            commit.created_at,
            commit.message,
            patch_json,
            snapshot_json,
        ],
    )?;
    Ok(())
}

/// Decide on a snapshot and build the commit row (does not insert).
fn build_commit(conn: &Connection, config: &StoreConfig, input: NewCommit) -> Result<Commit> {
    let patch_bytes = serde_json::to_vec(&input.patch)?.len();
    let mut lookup = |id: &str| commit_by_id(conn, id);
    let distance = snapshot_distance(&mut lookup, input.parent_commit_id.as_deref())?;
    let snapshot = if wants_snapshot(config, patch_bytes, distance) {
        Some(resolve_commit_state(&mut lookup, &input)?)
    } else {
        None
    };

    Ok(Commit {
        id: uuid::Uuid::new_v4().to_string(),
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

impl BranchStore for SqliteBranchStore {
    fn ensure_document(&self, doc_id: &str, actor: &str, initial_state: &DocState) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let bootstrapped: Option<String> = tx
            .query_row(
                "SELECT root_commit_id FROM docs WHERE doc_id = ?",
                params![doc_id],
                |row| row.get(0),
            )
            .optional()?;
        if bootstrapped.is_some() {
            return Ok(());
        }

        let now = chrono::Utc::now().timestamp_millis();

        // A document migrated in through put_commit has commits but no docs
        // row yet; adopt its existing root instead of minting a second one.
        let existing_root: Option<String> = tx
            .query_row(
                "SELECT id FROM commits WHERE doc_id = ? AND parent_commit_id IS NULL
                 ORDER BY created_at ASC, id ASC LIMIT 1",
                params![doc_id],
                |row| row.get(0),
            )
            .optional()?;

        let (root_id, head_id) = match existing_root {
            Some(root_id) => {
                let head_id: String = tx.query_row(
                    "SELECT id FROM commits WHERE doc_id = ?
                     ORDER BY created_at DESC, id ASC LIMIT 1",
                    params![doc_id],
                    |row| row.get(0),
                )?;
                (root_id, head_id)
            }
            None => {
                let initial = normalize(initial_state);
                let commit = build_commit(
                    &tx,
                    &self.config,
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
                insert_commit(&tx, &commit, false)?;
                (commit.id.clone(), commit.id)
            }
        };

        tx.execute(
            "INSERT OR IGNORE INTO branches (id, doc_id, name, created_by, created_at,
                 description, head_commit_id)
             VALUES (?, ?, ?, ?, ?, NULL, ?)",
            params![
                uuid::Uuid::new_v4().to_string(),
                doc_id,
                MAIN_BRANCH,
                actor,
                now,
                head_id,
            ],
        )?;
        tx.execute(
            "INSERT INTO docs (doc_id, root_commit_id, current_branch) VALUES (?, ?, ?)",
            params![doc_id, root_id, MAIN_BRANCH],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn list_branches(&self, doc_id: &str) -> Result<Vec<Branch>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, doc_id, name, created_by, created_at, description, head_commit_id
             FROM branches WHERE doc_id = ? ORDER BY name",
        )?;
        let branches = stmt
            .query_map(params![doc_id], row_to_branch)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(branches)
    }

    fn get_branch(&self, doc_id: &str, name: &str) -> Result<Option<Branch>> {
        let conn = self.conn.lock().unwrap();
        let branch = conn
            .query_row(
                "SELECT id, doc_id, name, created_by, created_at, description, head_commit_id
                 FROM branches WHERE doc_id = ? AND name = ?",
                params![doc_id, name],
                row_to_branch,
            )
            .optional()?;
        Ok(branch)
    }

    fn create_branch(&self, input: NewBranch) -> Result<Branch> {
        let conn = self.conn.lock().unwrap();
        let branch = Branch {
            id: uuid::Uuid::new_v4().to_string(),
            doc_id: input.doc_id,
            name: input.name,
            created_by: input.created_by,
            created_at: input.created_at,
            description: input.description,
            head_commit_id: input.head_commit_id,
        };
        let result = conn.execute(
            "INSERT INTO branches (id, doc_id, name, created_by, created_at,
                 description, head_commit_id)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![
                branch.id,
                branch.doc_id,
                branch.name,
                branch.created_by,
                branch.created_at,
                branch.description,
                branch.head_commit_id,
            ],
        );
        match result {
            Ok(_) => Ok(branch),
            // UNIQUE(doc_id, name) violation is the name-collision signal.
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(GridvcError::BranchExists {
                    doc_id: branch.doc_id,
                    name: branch.name,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    fn rename_branch(&self, doc_id: &str, old_name: &str, new_name: &str) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let collision: Option<String> = tx
            .query_row(
                "SELECT id FROM branches WHERE doc_id = ? AND name = ?",
                params![doc_id, new_name],
                |row| row.get(0),
            )
            .optional()?;
        if collision.is_some() {
            return Err(GridvcError::BranchExists {
                doc_id: doc_id.to_string(),
                name: new_name.to_string(),
            });
        }

        let updated = tx.execute(
            "UPDATE branches SET name = ? WHERE doc_id = ? AND name = ?",
            params![new_name, doc_id, old_name],
        )?;
        if updated == 0 {
            return Err(GridvcError::BranchNotFound {
                doc_id: doc_id.to_string(),
                name: old_name.to_string(),
            });
        }

        tx.execute(
            "UPDATE docs SET current_branch = ? WHERE doc_id = ? AND current_branch = ?",
            params![new_name, doc_id, old_name],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn delete_branch(&self, doc_id: &str, name: &str) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let deleted = tx.execute(
            "DELETE FROM branches WHERE doc_id = ? AND name = ?",
            params![doc_id, name],
        )?;
        if deleted == 0 {
            return Err(GridvcError::BranchNotFound {
                doc_id: doc_id.to_string(),
                name: name.to_string(),
            });
        }
        tx.execute(
            "UPDATE docs SET current_branch = ? WHERE doc_id = ? AND current_branch = ?",
            params![MAIN_BRANCH, doc_id, name],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn update_branch_head(&self, doc_id: &str, name: &str, commit_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE branches SET head_commit_id = ? WHERE doc_id = ? AND name = ?",
            params![commit_id, doc_id, name],
        )?;
        if updated == 0 {
            return Err(GridvcError::BranchNotFound {
                doc_id: doc_id.to_string(),
                name: name.to_string(),
            });
        }
        Ok(())
    }

    fn create_commit(&self, input: NewCommit) -> Result<Commit> {
        let conn = self.conn.lock().unwrap();
        let commit = build_commit(&conn, &self.config, input)?;
        insert_commit(&conn, &commit, false)?;
        Ok(commit)
    }

    fn get_commit(&self, commit_id: &str) -> Result<Option<Commit>> {
        let conn = self.conn.lock().unwrap();
        commit_by_id(&conn, commit_id)
    }

    fn put_commit(&self, commit: &Commit) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        insert_commit(&conn, commit, true)
    }

    fn document_state_at(&self, commit_id: &str) -> Result<DocState> {
        let conn = self.conn.lock().unwrap();
        replay_state_at(&mut |id| commit_by_id(&conn, id), commit_id)
    }

    fn current_branch_name(&self, doc_id: &str) -> Result<String> {
        let conn = self.conn.lock().unwrap();
        let name: Option<String> = conn
            .query_row(
                "SELECT current_branch FROM docs WHERE doc_id = ?",
                params![doc_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(name.unwrap_or_else(|| MAIN_BRANCH.to_string()))
    }

    fn set_current_branch_name(&self, doc_id: &str, name: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let exists: Option<String> = conn
            .query_row(
                "SELECT id FROM branches WHERE doc_id = ? AND name = ?",
                params![doc_id, name],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Err(GridvcError::BranchNotFound {
                doc_id: doc_id.to_string(),
                name: name.to_string(),
            });
        }
        // A document migrated in through put_commit may not have a docs row
        // yet; create it, inferring the root the same way bootstrap
        // adoption does.
        conn.execute(
            "INSERT INTO docs (doc_id, root_commit_id, current_branch)
             SELECT ?1, id, ?2 FROM commits
             WHERE doc_id = ?1 AND parent_commit_id IS NULL
             ORDER BY created_at ASC, id ASC LIMIT 1
             ON CONFLICT(doc_id) DO UPDATE SET current_branch = excluded.current_branch",
            params![doc_id, name],
        )?;
        Ok(())
    }
}

impl std::fmt::Debug for SqliteBranchStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteBranchStore").finish_non_exhaustive()
    }
}
