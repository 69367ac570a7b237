pub mod embedding;
pub mod hash_cache;
pub mod journal;
pub mod vector;

pub use embedding::{Embedder, HashingEmbedder};
pub use hash_cache::FileHashCache;
pub use journal::{EntryFilter, EventType, Journal, JournalEntry};
pub use vector::{ChunkRecord, ScoredChunk, SqliteVectorStore, VectorStore};
