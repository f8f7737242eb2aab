//! Conversation memory for the agent, keyed by thread id.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Mutex, RwLock};

use rusqlite::{Connection, params};

use crate::{AgentMessage, CheckpointError};

pub trait CheckpointStore: Send + Sync {
    /// Stored turns for `thread_id`, oldest first. Unknown threads are empty.
    fn load(&self, thread_id: &str) -> Result<Vec<AgentMessage>, CheckpointError>;

    /// Appends `turns` after whatever the thread already holds.
    fn append(&self, thread_id: &str, turns: &[AgentMessage]) -> Result<(), CheckpointError>;
}

#[derive(Default)]
pub struct MemoryCheckpointStore {
    threads: RwLock<HashMap<String, Vec<AgentMessage>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn load(&self, thread_id: &str) -> Result<Vec<AgentMessage>, CheckpointError> {
        let threads = self.threads.read().unwrap_or_else(|e| e.into_inner());
        Ok(threads.get(thread_id).cloned().unwrap_or_default())
    }

    fn append(&self, thread_id: &str, turns: &[AgentMessage]) -> Result<(), CheckpointError> {
        let mut threads = self.threads.write().unwrap_or_else(|e| e.into_inner());
        threads
            .entry(thread_id.to_string())
            .or_default()
            .extend_from_slice(turns);
        Ok(())
    }
}

const CHECKPOINT_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS turns (
    thread_id TEXT NOT NULL,
    seq INTEGER NOT NULL,
    turn TEXT NOT NULL,
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
    PRIMARY KEY (thread_id, seq)
);
";

pub struct SqliteCheckpointStore {
    conn: Mutex<Connection>,
}

impl SqliteCheckpointStore {
    pub fn open(path: &Path) -> Result<Self, CheckpointError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        conn.execute_batch(CHECKPOINT_SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl CheckpointStore for SqliteCheckpointStore {
    fn load(&self, thread_id: &str) -> Result<Vec<AgentMessage>, CheckpointError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare("SELECT turn FROM turns WHERE thread_id = ?1 ORDER BY seq")?;
        let rows = stmt.query_map(params![thread_id], |row| row.get::<_, String>(0))?;
        let mut turns = Vec::new();
        for raw in rows {
            turns.push(serde_json::from_str(&raw?)?);
        }
        Ok(turns)
    }

    fn append(&self, thread_id: &str, turns: &[AgentMessage]) -> Result<(), CheckpointError> {
        if turns.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let tx = conn.transaction()?;
        let next: i64 = tx.query_row(
            "SELECT COALESCE(MAX(seq) + 1, 0) FROM turns WHERE thread_id = ?1",
            params![thread_id],
            |row| row.get(0),
        )?;
        {
            let mut insert =
                tx.prepare("INSERT INTO turns (thread_id, seq, turn) VALUES (?1, ?2, ?3)")?;
            for (offset, turn) in turns.iter().enumerate() {
                let json = serde_json::to_string(turn)?;
                insert.execute(params![thread_id, next + offset as i64, json])?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<AgentMessage> {
        vec![
            AgentMessage::user("Where does Vikram sit?"),
            AgentMessage::assistant("Answer: aisle"),
        ]
    }

    #[test]
    fn memory_store_keeps_threads_apart() {
        let store = MemoryCheckpointStore::new();
        assert!(store.load("a").expect("load").is_empty());
        store.append("a", &sample()).expect("append");
        store.append("a", &[AgentMessage::user("and Layla?")]).expect("append");
        assert_eq!(store.load("a").expect("load").len(), 3);
        assert!(store.load("b").expect("load").is_empty());
    }

    #[test]
    fn sqlite_store_survives_reopen_in_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("checkpoints.sqlite");
        {
            let store = SqliteCheckpointStore::open(&path).expect("open");
            store.append("t1", &sample()).expect("append");
            store.append("t2", &[AgentMessage::user("other")]).expect("append");
        }
        let store = SqliteCheckpointStore::open(&path).expect("reopen");
        store.append("t1", &[AgentMessage::user("follow up")]).expect("append");

        let turns = store.load("t1").expect("load");
        let texts: Vec<&str> = turns.iter().map(|t| t.content_str()).collect();
        assert_eq!(texts, vec!["Where does Vikram sit?", "Answer: aisle", "follow up"]);
        assert_eq!(store.load("t2").expect("load").len(), 1);
        assert!(store.load("fresh").expect("load").is_empty());
    }
}
