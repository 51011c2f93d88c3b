//! Knowledge storage for the sync engine

pub mod knowledge;
pub mod persistence;

pub use knowledge::{
    JournalEntry, JournalKind, KnowledgeEntry, KnowledgeSnapshot, KnowledgeStore,
    MemoryKnowledgeStore, StoreError,
};
pub use persistence::{JsonKnowledgeStore, StorageConfig};
