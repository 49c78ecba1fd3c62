//! What the client remembers between runs: the highest sequence id it has
//! shown, the session it may resume, and the nickname it wants.

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use shared::models::SequenceId;
use url::Url;
use uuid::Uuid;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientState {
    /// Server the offset and session belong to.
    pub server: Option<String>,
    pub session: Option<Uuid>,
    pub last_offset: SequenceId,
    pub nickname: Option<String>,
}

impl ClientState {
    /// Reads the state file; a missing file is an empty state.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read client state {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("client state {} is corrupt", path.display()))
    }

    /// Writes the state through a temporary file so a crash never leaves it half written.
    ///
    /// # Errors
    /// Returns an error if the directory or file cannot be written.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create state directory {}", parent.display()))?;
        }
        let serialized = serde_json::to_string_pretty(self).context("serializing client state")?;
        let temporary = path.with_extension("json.tmp");
        fs::write(&temporary, serialized)
            .with_context(|| format!("failed to write client state {}", temporary.display()))?;
        fs::rename(&temporary, path)
            .with_context(|| format!("failed to replace client state {}", path.display()))
    }

    /// Offsets and sessions mean nothing to another server; keep only the nickname.
    #[must_use]
    pub fn for_server(self, server: &Url) -> Self {
        if self.server.as_deref() == Some(server.as_str()) {
            return self;
        }
        Self {
            server: Some(server.to_string()),
            nickname: self.nickname,
            ..Self::default()
        }
    }

    /// Raises the resume offset to `sequence_id`. Returns whether it moved.
    ///
    /// Live messages may arrive out of id order, so this says nothing about
    /// whether a message was already shown.
    pub fn advance(&mut self, sequence_id: SequenceId) -> bool {
        if sequence_id <= self.last_offset {
            return false;
        }
        self.last_offset = sequence_id;
        true
    }
}

pub fn default_path() -> PathBuf {
    BaseDirs::new()
        .map(|dirs| dirs.data_dir().join("relay").join("state.json"))
        .unwrap_or_else(|| PathBuf::from("./relay-state.json"))
}
