//! facefind-store — persistence for face embeddings.
//!
//! Embedding files are partitioned by (detector, model) and written
//! atomically; a partition is loaded whole into an immutable [`Corpus`].

pub mod codec;
pub mod corpus;
pub mod fsutil;
pub mod mirror;

pub use codec::{EmbeddingStore, Partition, SkippedFile, StoreError, DEFAULT_EMBEDDING_EXT};
pub use corpus::{Corpus, CorpusError, CorpusHandle, CorpusLoader};
pub use mirror::{FilesystemStore, MirrorError, MirrorReport, ObjectStore};
