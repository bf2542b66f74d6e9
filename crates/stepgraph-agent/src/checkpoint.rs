use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use stepgraph_core::error::{Result, StepGraphError};
use stepgraph_core::traits::CheckpointStore;
use stepgraph_core::types::{Checkpoint, RunId};

/// In-process checkpoint store. Snapshots are lost when the process exits.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    checkpoints: Mutex<HashMap<RunId, Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(e: std::sync::PoisonError<T>) -> StepGraphError {
    StepGraphError::Checkpoint(e.to_string())
}

impl CheckpointStore for MemoryCheckpointStore {
    fn load(&self, run_id: &RunId) -> BoxFuture<'_, Result<Option<Checkpoint>>> {
        let run_id = run_id.clone();
        Box::pin(async move {
            let checkpoints = self.checkpoints.lock().map_err(poisoned)?;
            Ok(checkpoints.get(&run_id).cloned())
        })
    }

    fn save(&self, checkpoint: &Checkpoint) -> BoxFuture<'_, Result<()>> {
        let checkpoint = checkpoint.clone();
        Box::pin(async move {
            let mut checkpoints = self.checkpoints.lock().map_err(poisoned)?;
            checkpoints.insert(checkpoint.run_id.clone(), checkpoint);
            Ok(())
        })
    }

    fn delete(&self, run_id: &RunId) -> BoxFuture<'_, Result<bool>> {
        let run_id = run_id.clone();
        Box::pin(async move {
            let mut checkpoints = self.checkpoints.lock().map_err(poisoned)?;
            Ok(checkpoints.remove(&run_id).is_some())
        })
    }
}

/// Persistent checkpoint store backed by SQLite. One row per run; saving
/// replaces the previous snapshot.
pub struct SqliteCheckpointStore {
    conn: Mutex<Connection>,
}

fn db_err(e: rusqlite::Error) -> StepGraphError {
    StepGraphError::Checkpoint(e.to_string())
}

impl SqliteCheckpointStore {
    /// Open or create the checkpoint database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StepGraphError::Checkpoint(format!("Failed to create checkpoint directory: {}", e))
            })?;
        }

        let conn = Connection::open(path).map_err(db_err)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        Self::init(&conn)?;

        debug!(path = %path.display(), "Checkpoint store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::init(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS checkpoints (
                 run_id TEXT PRIMARY KEY,
                 graph TEXT NOT NULL,
                 status_json TEXT NOT NULL,
                 state_json TEXT NOT NULL,
                 steps INTEGER NOT NULL,
                 updated_at TEXT NOT NULL
             );",
        )
        .map_err(db_err)
    }

    /// Run ids of every stored snapshot, most recently updated first.
    pub fn list(&self) -> Result<Vec<RunId>> {
        let conn = self.conn.lock().map_err(poisoned)?;
        let mut stmt = conn
            .prepare("SELECT run_id FROM checkpoints ORDER BY updated_at DESC")
            .map_err(db_err)?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(db_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err)?;
        Ok(ids.into_iter().map(RunId).collect())
    }
}

struct Row {
    run_id: String,
    graph: String,
    status_json: String,
    state_json: String,
    steps: i64,
    updated_at: String,
}

impl Row {
    fn into_checkpoint(self) -> Result<Checkpoint> {
        Ok(Checkpoint {
            run_id: RunId(self.run_id),
            graph: self.graph,
            state: serde_json::from_str(&self.state_json)?,
            status: serde_json::from_str(&self.status_json)?,
            steps: self.steps.max(0) as usize,
            updated_at: DateTime::parse_from_rfc3339(&self.updated_at)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
        })
    }
}

impl CheckpointStore for SqliteCheckpointStore {
    fn load(&self, run_id: &RunId) -> BoxFuture<'_, Result<Option<Checkpoint>>> {
        let run_id = run_id.0.clone();
        Box::pin(async move {
            let row = {
                let conn = self.conn.lock().map_err(poisoned)?;
                conn.query_row(
                    "SELECT run_id, graph, status_json, state_json, steps, updated_at
                     FROM checkpoints WHERE run_id = ?1",
                    params![run_id],
                    |row| {
                        Ok(Row {
                            run_id: row.get(0)?,
                            graph: row.get(1)?,
                            status_json: row.get(2)?,
                            state_json: row.get(3)?,
                            steps: row.get(4)?,
                            updated_at: row.get(5)?,
                        })
                    },
                )
                .optional()
                .map_err(db_err)?
            };
            row.map(Row::into_checkpoint).transpose()
        })
    }

    fn save(&self, checkpoint: &Checkpoint) -> BoxFuture<'_, Result<()>> {
        let encoded = serde_json::to_string(&checkpoint.status).and_then(|status| {
            serde_json::to_string(&checkpoint.state).map(|state| (status, state))
        });
        let run_id = checkpoint.run_id.0.clone();
        let graph = checkpoint.graph.clone();
        let steps = checkpoint.steps as i64;
        let updated_at = checkpoint.updated_at.to_rfc3339();

        Box::pin(async move {
            let (status_json, state_json) = encoded?;
            let conn = self.conn.lock().map_err(poisoned)?;
            conn.execute(
                "INSERT OR REPLACE INTO checkpoints (run_id, graph, status_json, state_json, steps, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![run_id, graph, status_json, state_json, steps, updated_at],
            )
            .map_err(db_err)?;
            debug!(run_id = %run_id, steps, "Checkpoint saved");
            Ok(())
        })
    }

    fn delete(&self, run_id: &RunId) -> BoxFuture<'_, Result<bool>> {
        let run_id = run_id.0.clone();
        Box::pin(async move {
            let conn = self.conn.lock().map_err(poisoned)?;
            let deleted = conn
                .execute("DELETE FROM checkpoints WHERE run_id = ?1", params![run_id])
                .map_err(db_err)?;
            Ok(deleted > 0)
        })
    }
}
