//! File-backed knowledge store
//!
//! Keeps the whole store as one JSON document, rewritten atomically after
//! every change, with rotating backups.

use crate::storage::knowledge::{
    JournalEntry, JournalKind, KnowledgeEntry, KnowledgeSnapshot, KnowledgeStore, StoreError,
};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::fs;
use std::io::{BufReader, BufWriter};
use std::path::PathBuf;
use std::sync::Mutex;

/// Storage configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    pub file_name: String,
    pub backup_enabled: bool,
    pub max_backups: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".bridge_data"),
            file_name: "knowledge.json".to_string(),
            backup_enabled: true,
            max_backups: 5,
        }
    }
}

pub struct JsonKnowledgeStore {
    config: StorageConfig,
    inner: Mutex<KnowledgeSnapshot>,
}

impl JsonKnowledgeStore {
    /// Open the store, loading existing data if present
    pub fn open(config: StorageConfig) -> Result<Self, StoreError> {
        fs::create_dir_all(&config.data_dir)?;

        let path = config.data_dir.join(&config.file_name);
        let snapshot = if path.exists() {
            let reader = BufReader::new(fs::File::open(&path)?);
            let snapshot: KnowledgeSnapshot = serde_json::from_reader(reader)?;
            log::info!(
                "Loaded {} knowledge entries from {:?}",
                snapshot.entries.len(),
                path
            );
            snapshot
        } else {
            KnowledgeSnapshot::default()
        };

        Ok(Self {
            config,
            inner: Mutex::new(snapshot),
        })
    }

    fn store_path(&self) -> PathBuf {
        self.config.data_dir.join(&self.config.file_name)
    }

    fn backup_path(&self, index: usize) -> PathBuf {
        self.config
            .data_dir
            .join(format!("{}.backup.{}", self.config.file_name, index))
    }

    fn save(&self, snapshot: &KnowledgeSnapshot) -> Result<(), StoreError> {
        let path = self.store_path();

        if self.config.backup_enabled && self.config.max_backups > 0 && path.exists() {
            self.rotate_backups()?;
            fs::copy(&path, self.backup_path(0))?;
        }

        let temp_path = self
            .config
            .data_dir
            .join(format!("{}.tmp", self.config.file_name));
        let writer = BufWriter::new(fs::File::create(&temp_path)?);
        serde_json::to_writer_pretty(writer, snapshot)?;

        fs::rename(&temp_path, &path)?;
        Ok(())
    }

    fn rotate_backups(&self) -> Result<(), StoreError> {
        let oldest = self.backup_path(self.config.max_backups - 1);
        if oldest.exists() {
            fs::remove_file(&oldest)?;
        }

        for i in (0..self.config.max_backups - 1).rev() {
            let current = self.backup_path(i);
            if current.exists() {
                fs::rename(&current, self.backup_path(i + 1))?;
            }
        }

        Ok(())
    }

    /// Backup indices present on disk
    pub fn list_backups(&self) -> Vec<usize> {
        (0..self.config.max_backups)
            .filter(|i| self.backup_path(*i).exists())
            .collect()
    }

    fn read<T>(&self, f: impl FnOnce(&KnowledgeSnapshot) -> T) -> Result<T, StoreError> {
        let inner = self.inner.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(f(&inner))
    }

    /// Apply a change and persist it
    fn write<T>(&self, f: impl FnOnce(&mut KnowledgeSnapshot) -> T) -> Result<T, StoreError> {
        let mut inner = self.inner.lock().map_err(|_| StoreError::Poisoned)?;
        let result = f(&mut inner);
        self.save(&inner)?;
        Ok(result)
    }
}

impl KnowledgeStore for JsonKnowledgeStore {
    fn entries(
        &self,
        category: Option<&str>,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<KnowledgeEntry>, StoreError> {
        self.read(|s| s.select(category, since))
    }

    fn upsert(&self, entry: KnowledgeEntry) -> Result<(), StoreError> {
        self.write(|s| s.upsert(entry))
    }

    fn import(&self, peer_id: &str, entries: Vec<KnowledgeEntry>) -> Result<usize, StoreError> {
        self.write(|s| s.import(peer_id, entries))
    }

    fn record(&self, peer_id: &str, kind: JournalKind, payload: Value) -> Result<(), StoreError> {
        self.write(|s| s.record(peer_id, kind, payload))
    }

    fn journal(&self, kind: Option<JournalKind>) -> Result<Vec<JournalEntry>, StoreError> {
        self.read(|s| s.journal(kind))
    }
}
