//! Checkpoint persistence and per-thread serialization

use crate::error::{FlowError, FlowResult};
use crate::models::workflow::ExecutionState;
use anyhow::{Context, Result};
use dashmap::DashMap;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

/// Durable storage of the latest state of every thread
pub trait CheckpointStore: Send + Sync {
    /// Persist a full state snapshot, replacing the previous one for the thread
    fn save(&self, state: &ExecutionState) -> FlowResult<()>;

    fn load(&self, thread_id: Uuid) -> FlowResult<Option<ExecutionState>>;

    /// Load a thread only if it belongs to `workflow_id`
    fn load_for(&self, workflow_id: &str, thread_id: Uuid) -> FlowResult<Option<ExecutionState>> {
        Ok(self
            .load(thread_id)?
            .filter(|state| state.workflow_id == workflow_id))
    }

    fn list(&self) -> FlowResult<Vec<ExecutionState>>;

    fn delete(&self, thread_id: Uuid) -> FlowResult<()>;
}

/// Process-local store, lost on restart
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    states: DashMap<Uuid, ExecutionState>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn save(&self, state: &ExecutionState) -> FlowResult<()> {
        self.states.insert(state.execution_id, state.clone());
        Ok(())
    }

    fn load(&self, thread_id: Uuid) -> FlowResult<Option<ExecutionState>> {
        Ok(self.states.get(&thread_id).map(|s| s.clone()))
    }

    fn list(&self) -> FlowResult<Vec<ExecutionState>> {
        Ok(self.states.iter().map(|entry| entry.value().clone()).collect())
    }

    fn delete(&self, thread_id: Uuid) -> FlowResult<()> {
        self.states.remove(&thread_id);
        Ok(())
    }
}

/// On-disk layout of the JSON checkpoint file
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct CheckpointFile {
    checkpoints: BTreeMap<Uuid, ExecutionState>,
}

/// Single JSON file store with advisory file locking
pub struct JsonCheckpointStore {
    store_path: PathBuf,
    store: Mutex<CheckpointFile>,
}

impl JsonCheckpointStore {
    /// Open (or create) the store at `store_path`
    pub fn new<P: AsRef<Path>>(store_path: P) -> Result<Self> {
        let store_path = store_path.as_ref().to_path_buf();

        if let Some(parent) = store_path.parent() {
            std::fs::create_dir_all(parent)
                .context("Failed to create checkpoint store directory")?;
        }

        let store = if store_path.exists() {
            Self::load_store(&store_path)?
        } else {
            CheckpointFile::default()
        };

        Ok(Self {
            store_path,
            store: Mutex::new(store),
        })
    }

    pub fn path(&self) -> &Path {
        &self.store_path
    }

    fn load_store(path: &Path) -> Result<CheckpointFile> {
        let file = File::open(path).context("Failed to open checkpoint store file")?;
        file.lock_shared()
            .context("Failed to acquire read lock on checkpoint store")?;

        let mut contents = String::new();
        let mut reader = std::io::BufReader::new(file);
        reader
            .read_to_string(&mut contents)
            .context("Failed to read checkpoint store")?;
        drop(reader);

        if contents.trim().is_empty() {
            return Ok(CheckpointFile::default());
        }
        serde_json::from_str(&contents).context("Failed to parse checkpoint store JSON")
    }

    fn write_store(&self, store: &CheckpointFile) -> Result<()> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.store_path)
            .context("Failed to open checkpoint store file for writing")?;
        file.lock_exclusive()
            .context("Failed to acquire write lock on checkpoint store")?;

        let json =
            serde_json::to_string_pretty(store).context("Failed to serialize checkpoint store")?;
        let mut writer = std::io::BufWriter::new(file);
        writer
            .write_all(json.as_bytes())
            .context("Failed to write checkpoint store")?;
        writer
            .flush()
            .context("Failed to flush checkpoint store to disk")?;
        Ok(())
    }

    fn lock(&self) -> FlowResult<std::sync::MutexGuard<'_, CheckpointFile>> {
        self.store
            .lock()
            .map_err(|_| FlowError::Storage("checkpoint store lock poisoned".to_string()))
    }
}

impl CheckpointStore for JsonCheckpointStore {
    fn save(&self, state: &ExecutionState) -> FlowResult<()> {
        let mut store = self.lock()?;
        let previous = store.checkpoints.insert(state.execution_id, state.clone());
        if let Err(e) = self.write_store(&store) {
            // Keep memory consistent with what is on disk
            match previous {
                Some(previous) => store.checkpoints.insert(state.execution_id, previous),
                None => store.checkpoints.remove(&state.execution_id),
            };
            return Err(FlowError::CheckpointWrite(format!("{:#}", e)));
        }
        Ok(())
    }

    fn load(&self, thread_id: Uuid) -> FlowResult<Option<ExecutionState>> {
        Ok(self.lock()?.checkpoints.get(&thread_id).cloned())
    }

    fn list(&self) -> FlowResult<Vec<ExecutionState>> {
        Ok(self.lock()?.checkpoints.values().cloned().collect())
    }

    fn delete(&self, thread_id: Uuid) -> FlowResult<()> {
        let mut store = self.lock()?;
        if store.checkpoints.remove(&thread_id).is_some() {
            self.write_store(&store)
                .map_err(|e| FlowError::Storage(format!("{:#}", e)))?;
        }
        Ok(())
    }
}

/// Per-thread async mutexes: at most one writer per thread at a time
#[derive(Debug, Default)]
pub struct ThreadLocks {
    locks: DashMap<Uuid, Arc<tokio::sync::Mutex<()>>>,
}

impl ThreadLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, thread_id: Uuid) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(thread_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Drop the lock entry of a finished thread
    pub fn forget(&self, thread_id: Uuid) {
        self.locks
            .remove_if(&thread_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::workflow::{StepDefinition, WorkflowDefinition};
    use serde_json::{json, Map};
    use std::time::Duration;
    use tempfile::tempdir;

    fn state() -> ExecutionState {
        let workflow = WorkflowDefinition {
            id: "wf".into(),
            version: 1,
            description: None,
            entry_step: "start".into(),
            steps: vec![StepDefinition::new("start", "echo")],
            escalation_step: None,
            category_routes: Default::default(),
            input_schema: None,
        };
        ExecutionState::new(Uuid::new_v4(), &workflow, &json!("hi"), Map::new())
    }

    #[test]
    fn test_json_store_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("checkpoints.json");
        let state = state();

        {
            let store = JsonCheckpointStore::new(&path).unwrap();
            store.save(&state).unwrap();
        }

        let reopened = JsonCheckpointStore::new(&path).unwrap();
        assert_eq!(reopened.load(state.execution_id).unwrap(), Some(state.clone()));
        assert_eq!(reopened.list().unwrap().len(), 1);

        reopened.delete(state.execution_id).unwrap();
        let again = JsonCheckpointStore::new(&path).unwrap();
        assert!(again.load(state.execution_id).unwrap().is_none());
    }

    #[test]
    fn test_memory_store_replaces_snapshot() {
        let store = MemoryCheckpointStore::new();
        let mut state = state();
        store.save(&state).unwrap();
        state.current_step = "next".into();
        store.save(&state).unwrap();

        let loaded = store.load(state.execution_id).unwrap().unwrap();
        assert_eq!(loaded.current_step, "next");
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_thread_lock_serializes_writers() {
        let locks = Arc::new(ThreadLocks::new());
        let thread = Uuid::new_v4();
        let guard = locks.acquire(thread).await;

        let locks2 = locks.clone();
        let waiter = tokio::spawn(async move {
            let _guard = locks2.acquire(thread).await;
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        drop(guard);
        waiter.await.unwrap();

        locks.forget(thread);
    }
}
