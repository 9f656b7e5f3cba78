//! Login session persisted between invocations

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// File name of the saved session inside the config directory
pub const SESSION_FILE: &str = "session.json";

/// A saved login
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedSession {
    pub token: String,
    pub email: String,
    pub saved_at: DateTime<Utc>,
}

impl SavedSession {
    pub fn new(token: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            email: email.into(),
            saved_at: Utc::now(),
        }
    }
}

/// Reads and writes `session.json`
#[derive(Clone, Debug)]
pub struct SessionFile {
    path: PathBuf,
}

impl SessionFile {
    /// Session file inside `dir`
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            path: dir.join(SESSION_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the saved session, if any
    pub fn load(&self) -> Result<Option<SavedSession>> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", self.path.display()))
            }
        };
        let session = serde_json::from_slice(&bytes)
            .with_context(|| format!("corrupt session file {}", self.path.display()))?;
        Ok(Some(session))
    }

    /// Save a session, creating the directory if needed
    pub fn save(&self, session: &SavedSession) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_vec_pretty(session)?;
        fs::write(&self.path, json)
            .with_context(|| format!("failed to write {}", self.path.display()))
    }

    /// Remove the saved session; returns whether one existed
    pub fn clear(&self) -> Result<bool> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("failed to remove {}", self.path.display())),
        }
    }
}
