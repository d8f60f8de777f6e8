//! Per-agent conversation sessions with snapshot persistence.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Snapshot filename inside the session directory.
pub const SESSIONS_FILE: &str = "sessions.json";

/// Continuation state for one agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Session {
    pub agent_id: String,
    /// Opaque collaborator token; empty until the first completed turn.
    pub session_id: String,
    pub turn_number: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(agent_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            agent_id: agent_id.into(),
            session_id: String::new(),
            turn_number: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether a conversation has been established.
    pub fn is_started(&self) -> bool {
        !self.session_id.is_empty()
    }
}

/// Session manager. One lock guards the whole map.
#[derive(Debug)]
pub struct SessionManager {
    dir: PathBuf,
    sessions: RwLock<HashMap<String, Session>>,
}

impl SessionManager {
    /// Create a manager persisting into `dir`, creating the directory.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| Error::storage(&dir, e))?;

        Ok(Self {
            dir,
            sessions: RwLock::new(HashMap::new()),
        })
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.dir.join(SESSIONS_FILE)
    }

    pub fn has_snapshot(&self) -> bool {
        self.snapshot_path().is_file()
    }

    /// Install a fresh session, replacing any existing one for the agent.
    pub fn create_session(&self, agent_id: &str) -> Session {
        let session = Session::new(agent_id);
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        sessions.insert(agent_id.to_string(), session.clone());

        tracing::debug!(agent = agent_id, "Created session");
        session
    }

    pub fn get_session(&self, agent_id: &str) -> Result<Session> {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        sessions
            .get(agent_id)
            .cloned()
            .ok_or_else(|| not_found(agent_id))
    }

    pub fn set_session_id(&self, agent_id: &str, session_id: &str) -> Result<()> {
        self.update(agent_id, |session| {
            session.session_id = session_id.to_string();
        })
    }

    pub fn increment_turn(&self, agent_id: &str) -> Result<()> {
        self.update(agent_id, |session| {
            session.turn_number += 1;
        })
    }

    /// All sessions, in no particular order.
    pub fn list_sessions(&self) -> Vec<Session> {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        sessions.values().cloned().collect()
    }

    /// Write the whole map to the snapshot file, replacing the previous one.
    pub fn save(&self) -> Result<()> {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        let content = serde_json::to_string_pretty(&*sessions)
            .map_err(|e| Error::serialization("session snapshot", e))?;

        let path = self.snapshot_path();
        write_atomic(&path, &content)?;

        tracing::debug!(count = sessions.len(), "Saved sessions to {}", path.display());
        Ok(())
    }

    /// Replace the in-memory map with the snapshot. No snapshot is not an error.
    pub fn load(&self) -> Result<()> {
        let path = self.snapshot_path();
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(Error::storage(&path, e)),
        };

        let loaded: HashMap<String, Session> = serde_json::from_str(&content)
            .map_err(|e| Error::serialization(format!("session snapshot {}", path.display()), e))?;

        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        *sessions = loaded;

        tracing::debug!(count = sessions.len(), "Loaded sessions from {}", path.display());
        Ok(())
    }

    fn update(&self, agent_id: &str, f: impl FnOnce(&mut Session)) -> Result<()> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let session = sessions.get_mut(agent_id).ok_or_else(|| not_found(agent_id))?;
        f(session);
        session.updated_at = Utc::now();
        Ok(())
    }
}

fn not_found(agent_id: &str) -> Error {
    Error::NotFound(format!("session for agent {}", agent_id))
}

fn write_atomic(path: &Path, content: &str) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, content).map_err(|e| Error::storage(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| Error::storage(path, e))
}
