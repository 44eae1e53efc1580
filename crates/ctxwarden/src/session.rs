//! The session persistence contract.
//!
//! A [`SessionContext`] is what an external session store saves and
//! restores: the items plus a project path and timestamps. Timestamps are
//! ISO-8601 strings on the wire and come back as `DateTime<Utc>`.

use crate::error::Result;
use crate::item::ContextItem;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionContext {
    pub session_id: String,
    pub project_path: PathBuf,
    pub items: Vec<ContextItem>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionContext {
    pub fn new(session_id: impl Into<String>, project_path: impl Into<PathBuf>) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            project_path: project_path.into(),
            items: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_items(mut self, items: Vec<ContextItem>) -> Self {
        self.items = items;
        self
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Write the session as pretty JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn total_tokens(&self) -> usize {
        self.items.iter().map(|i| i.token_count).sum()
    }
}
