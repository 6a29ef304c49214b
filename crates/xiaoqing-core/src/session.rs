//! Login session shared by the account API and the chat transport.
//!
//! A [`Session`] is built once by the application and handed to every component
//! that needs the token. Clones share the same state. When opened from a file,
//! every change is written back so the login survives restarts.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::Config;
use crate::state::TokenResponse;

/// What is persisted between runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionState {
    pub is_logged_in: bool,
    pub user_phone: String,
    pub user_token: Option<String>,
    pub token_type: String,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            is_logged_in: false,
            user_phone: String::new(),
            user_token: None,
            token_type: "Bearer".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Session {
    state: Arc<RwLock<SessionState>>,
    path: Option<Arc<PathBuf>>,
}

impl Session {
    /// A session that is never written to disk.
    pub fn in_memory() -> Self {
        Self {
            state: Arc::new(RwLock::new(SessionState::default())),
            path: None,
        }
    }

    /// Opens (or starts) a session persisted at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let state = if path.exists() {
            let content = fs::read_to_string(&path)?;
            serde_json::from_str(&content)?
        } else {
            SessionState::default()
        };

        Ok(Self {
            state: Arc::new(RwLock::new(state)),
            path: Some(Arc::new(path)),
        })
    }

    /// Opens the session stored next to the user's config file.
    pub fn open_default() -> Result<Self> {
        Self::open(Self::default_path()?)
    }

    pub fn default_path() -> Result<PathBuf> {
        Ok(Config::config_dir()?.join("session.json"))
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref().map(PathBuf::as_path)
    }

    pub fn save_login(&self, phone: &str, token: &TokenResponse) {
        let snapshot = {
            let mut state = self.write();
            state.is_logged_in = true;
            state.user_phone = phone.to_string();
            state.user_token = Some(token.access_token.clone());
            if !token.token_type.trim().is_empty() {
                state.token_type = token.token_type.clone();
            }
            state.clone()
        };
        debug!(phone, "login session saved");
        self.persist(&snapshot);
    }

    /// Forgets everything (logout, expired token).
    pub fn clear(&self) {
        let snapshot = {
            let mut state = self.write();
            *state = SessionState::default();
            state.clone()
        };
        debug!("login session cleared");
        self.persist(&snapshot);
    }

    pub fn is_logged_in(&self) -> bool {
        self.read().is_logged_in
    }

    pub fn user_phone(&self) -> String {
        self.read().user_phone.clone()
    }

    pub fn token(&self) -> Option<String> {
        self.read()
            .user_token
            .clone()
            .filter(|token| !token.is_empty())
    }

    /// `"<token_type> <access_token>"`, or `None` without a usable token.
    pub fn auth_header(&self) -> Option<String> {
        let state = self.read();
        let token = state.user_token.as_deref().filter(|t| !t.is_empty())?;
        Some(format!("{} {}", state.token_type, token))
    }

    pub fn snapshot(&self) -> SessionState {
        self.read().clone()
    }

    fn persist(&self, state: &SessionState) {
        let Some(path) = self.path.as_deref() else {
            return;
        };
        if let Err(err) = write_state(path, state) {
            warn!(path = %path.display(), error = %err, "failed to persist session");
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, SessionState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, SessionState> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn write_state(path: &Path, state: &SessionState) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_json::to_string_pretty(state)?)?;
    Ok(())
}
