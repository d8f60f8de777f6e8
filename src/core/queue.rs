//! File-based per-agent message queues.
//!
//! Queue structure:
//! - `<base>/<agent-id>/` : one directory per agent
//! - `<timestamp-ns>_<message-id>.json` : one file per pending message
//!
//! Lexicographic filename order is delivery order.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use crate::core::message::Message;
use crate::error::{Error, Result};

/// Record file extension.
const RECORD_EXT: &str = "json";

/// Filename for a message record: `<timestamp-ns>_<id>.json`.
///
/// The timestamp is zero-padded to 20 digits so lexicographic order matches
/// time order. Pre-epoch timestamps clamp to zero.
pub fn record_name(msg: &Message) -> String {
    let nanos = msg.timestamp.timestamp_nanos_opt().unwrap_or(i64::MAX).max(0);
    format!("{:020}_{}.{}", nanos, msg.id, RECORD_EXT)
}

/// Check that an agent id names a single directory under the queue root.
pub fn validate_agent_id(agent_id: &str) -> Result<()> {
    let invalid = agent_id.trim().is_empty()
        || agent_id == "."
        || agent_id == ".."
        || agent_id.contains(['/', '\\', '\0']);
    if invalid {
        return Err(Error::Validation(format!("invalid agent id: {:?}", agent_id)));
    }
    Ok(())
}

/// A durable FIFO mailbox for one agent.
#[derive(Debug)]
pub struct Queue {
    agent_id: String,
    dir: PathBuf,
    lock: RwLock<()>,
}

impl Queue {
    fn new(agent_id: &str, dir: PathBuf) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            dir,
            lock: RwLock::new(()),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persist a message as a new record. Never overwrites an existing one.
    pub fn enqueue(&self, msg: &Message) -> Result<()> {
        let _guard = self.lock.write().unwrap_or_else(PoisonError::into_inner);

        let content = msg.to_json()?;
        let name = record_name(msg);
        let path = self.dir.join(&name);

        // Dot-prefixed temp files are invisible to readers in other processes.
        // Linking fails with AlreadyExists instead of replacing a record.
        let tmp = self.dir.join(format!(".{}.tmp", name));
        fs::write(&tmp, content).map_err(|e| Error::storage(&tmp, e))?;
        let linked = fs::hard_link(&tmp, &path);
        let _ = fs::remove_file(&tmp);
        linked.map_err(|e| Error::storage(&path, e))?;

        tracing::debug!(agent = %self.agent_id, id = %msg.id, "Enqueued message");
        Ok(())
    }

    /// Remove and return the oldest message, or `None` when empty.
    ///
    /// A record that fails to parse is left in place and reported; it keeps
    /// blocking the head of the queue until cleared.
    pub fn dequeue(&self) -> Result<Option<Message>> {
        let _guard = self.lock.write().unwrap_or_else(PoisonError::into_inner);

        let Some(path) = self.list_files()?.into_iter().next() else {
            return Ok(None);
        };
        let msg = read_record(&path)?;
        fs::remove_file(&path).map_err(|e| Error::storage(&path, e))?;

        tracing::debug!(agent = %self.agent_id, id = %msg.id, "Dequeued message");
        Ok(Some(msg))
    }

    /// Return the oldest message without removing it.
    pub fn peek(&self) -> Result<Option<Message>> {
        let _guard = self.lock.read().unwrap_or_else(PoisonError::into_inner);

        match self.list_files()?.into_iter().next() {
            Some(path) => read_record(&path).map(Some),
            None => Ok(None),
        }
    }

    pub fn len(&self) -> Result<usize> {
        let _guard = self.lock.read().unwrap_or_else(PoisonError::into_inner);
        Ok(self.list_files()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Snapshot of all pending messages in delivery order.
    pub fn list(&self) -> Result<Vec<Message>> {
        let _guard = self.lock.read().unwrap_or_else(PoisonError::into_inner);

        self.list_files()?
            .iter()
            .map(|path| read_record(path))
            .collect()
    }

    /// Delete every pending record, corrupt ones included.
    pub fn clear(&self) -> Result<usize> {
        let _guard = self.lock.write().unwrap_or_else(PoisonError::into_inner);

        let files = self.list_files()?;
        for path in &files {
            fs::remove_file(path).map_err(|e| Error::storage(path, e))?;
        }

        tracing::debug!(agent = %self.agent_id, removed = files.len(), "Cleared queue");
        Ok(files.len())
    }

    /// Record paths sorted by filename. Caller holds the lock.
    fn list_files(&self) -> Result<Vec<PathBuf>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(Error::storage(&self.dir, e)),
        };

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| Error::storage(&self.dir, e))?;
            let path = entry.path();
            let is_record = path.extension().map_or(false, |ext| ext == RECORD_EXT)
                && !entry.file_name().to_string_lossy().starts_with('.');
            if is_record && path.is_file() {
                files.push(path);
            }
        }

        files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
        Ok(files)
    }
}

fn read_record(path: &Path) -> Result<Message> {
    let content = fs::read_to_string(path).map_err(|e| Error::storage(path, e))?;
    serde_json::from_str(&content)
        .map_err(|e| Error::serialization(format!("queue record {}", path.display()), e))
}

/// Owns one lazily created [`Queue`] per agent.
#[derive(Debug)]
pub struct QueueManager {
    base_dir: PathBuf,
    queues: Mutex<HashMap<String, Arc<Queue>>>,
}

impl QueueManager {
    /// Create a manager rooted at `base_dir`, creating the directory.
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir).map_err(|e| Error::storage(&base_dir, e))?;

        Ok(Self {
            base_dir,
            queues: Mutex::new(HashMap::new()),
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Get the queue for an agent, creating its directory on first access.
    pub fn get_queue(&self, agent_id: &str) -> Result<Arc<Queue>> {
        validate_agent_id(agent_id)?;
        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(queue) = queues.get(agent_id) {
            return Ok(Arc::clone(queue));
        }

        let dir = self.base_dir.join(agent_id);
        fs::create_dir_all(&dir).map_err(|e| Error::storage(&dir, e))?;
        tracing::debug!("Created queue directory: {}", dir.display());

        let queue = Arc::new(Queue::new(agent_id, dir));
        queues.insert(agent_id.to_string(), Arc::clone(&queue));
        Ok(queue)
    }
}
