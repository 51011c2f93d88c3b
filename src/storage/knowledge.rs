//! Knowledge store abstraction
//!
//! The sync engine reads local entries from a `KnowledgeStore` and writes
//! what peers send into it. Entries are keyed by id; imports keep whichever
//! copy was updated last.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use thiserror::Error;

/// Store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("Invalid data: {0}")]
    InvalidData(String),
    #[error("Store lock poisoned")]
    Poisoned,
}

fn default_confidence() -> f64 {
    1.0
}

/// One unit of shared knowledge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeEntry {
    pub id: String,
    pub category: String,
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_confidence")]
    pub confidence_score: f64,
    #[serde(default)]
    pub source: String,
    pub updated_at: DateTime<Utc>,
}

impl KnowledgeEntry {
    pub fn new(
        category: impl Into<String>,
        title: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            category: category.into(),
            title: title.into(),
            content: content.into(),
            tags: Vec::new(),
            confidence_score: default_confidence(),
            source: "local".to_string(),
            updated_at: Utc::now(),
        }
    }

    pub fn with_tags(mut self, tags: &[&str]) -> Self {
        self.tags = tags.iter().map(|t| t.to_string()).collect();
        self
    }
}

/// What a peer sent us, for the journal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalKind {
    Experience,
    ErrorReport,
    Milestone,
    FacilityUpdate,
    SupportRequest,
}

impl fmt::Display for JournalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JournalKind::Experience => "experience",
            JournalKind::ErrorReport => "error_report",
            JournalKind::Milestone => "milestone",
            JournalKind::FacilityUpdate => "facility_update",
            JournalKind::SupportRequest => "support_request",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub peer_id: String,
    pub kind: JournalKind,
    pub payload: Value,
    pub received_at: DateTime<Utc>,
}

/// Backing store for knowledge entries and the peer journal
pub trait KnowledgeStore: Send + Sync {
    /// Entries in `category` (all categories when `None`), updated at or after `since`
    fn entries(
        &self,
        category: Option<&str>,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<KnowledgeEntry>, StoreError>;

    /// Add or replace a local entry
    fn upsert(&self, entry: KnowledgeEntry) -> Result<(), StoreError>;

    /// Merge entries received from a peer. Returns how many were new or newer.
    fn import(&self, peer_id: &str, entries: Vec<KnowledgeEntry>) -> Result<usize, StoreError>;

    /// Append an inbound payload to the peer journal
    fn record(&self, peer_id: &str, kind: JournalKind, payload: Value) -> Result<(), StoreError>;

    /// Journal entries, optionally of one kind, oldest first
    fn journal(&self, kind: Option<JournalKind>) -> Result<Vec<JournalEntry>, StoreError>;
}

/// Plain data behind both store implementations
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KnowledgeSnapshot {
    pub entries: Vec<KnowledgeEntry>,
    pub journal: Vec<JournalEntry>,
}

impl KnowledgeSnapshot {
    pub fn select(&self, category: Option<&str>, since: Option<DateTime<Utc>>) -> Vec<KnowledgeEntry> {
        self.entries
            .iter()
            .filter(|e| category.map_or(true, |c| e.category == c))
            .filter(|e| since.map_or(true, |s| e.updated_at >= s))
            .cloned()
            .collect()
    }

    pub fn upsert(&mut self, entry: KnowledgeEntry) {
        match self.entries.iter_mut().find(|e| e.id == entry.id) {
            Some(existing) => *existing = entry,
            None => self.entries.push(entry),
        }
    }

    pub fn import(&mut self, peer_id: &str, entries: Vec<KnowledgeEntry>) -> usize {
        let positions: HashMap<String, usize> = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.id.clone(), i))
            .collect();

        let mut changed = 0;
        for mut entry in entries {
            // Unsourced entries are credited to whoever sent this copy
            if entry.source.is_empty() {
                entry.source = peer_id.to_string();
            }
            match positions.get(&entry.id) {
                Some(&i) if self.entries[i].updated_at >= entry.updated_at => {}
                Some(&i) => {
                    self.entries[i] = entry;
                    changed += 1;
                }
                None => {
                    self.entries.push(entry);
                    changed += 1;
                }
            }
        }
        changed
    }

    pub fn record(&mut self, peer_id: &str, kind: JournalKind, payload: Value) {
        self.journal.push(JournalEntry {
            peer_id: peer_id.to_string(),
            kind,
            payload,
            received_at: Utc::now(),
        });
    }

    pub fn journal(&self, kind: Option<JournalKind>) -> Vec<JournalEntry> {
        self.journal
            .iter()
            .filter(|j| kind.map_or(true, |k| j.kind == k))
            .cloned()
            .collect()
    }
}

/// In-memory store
#[derive(Default)]
pub struct MemoryKnowledgeStore {
    inner: Mutex<KnowledgeSnapshot>,
}

impl MemoryKnowledgeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entries(entries: Vec<KnowledgeEntry>) -> Self {
        Self {
            inner: Mutex::new(KnowledgeSnapshot {
                entries,
                journal: Vec::new(),
            }),
        }
    }

    fn with<T>(&self, f: impl FnOnce(&mut KnowledgeSnapshot) -> T) -> Result<T, StoreError> {
        let mut inner = self.inner.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(f(&mut inner))
    }
}

impl KnowledgeStore for MemoryKnowledgeStore {
    fn entries(
        &self,
        category: Option<&str>,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<KnowledgeEntry>, StoreError> {
        self.with(|s| s.select(category, since))
    }

    fn upsert(&self, entry: KnowledgeEntry) -> Result<(), StoreError> {
        self.with(|s| s.upsert(entry))
    }

    fn import(&self, peer_id: &str, entries: Vec<KnowledgeEntry>) -> Result<usize, StoreError> {
        self.with(|s| s.import(peer_id, entries))
    }

    fn record(&self, peer_id: &str, kind: JournalKind, payload: Value) -> Result<(), StoreError> {
        self.with(|s| s.record(peer_id, kind, payload))
    }

    fn journal(&self, kind: Option<JournalKind>) -> Result<Vec<JournalEntry>, StoreError> {
        self.with(|s| s.journal(kind))
    }
}
