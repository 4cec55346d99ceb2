//! facefind-service — serving face searches over ingested photo projects.
//!
//! The face model lives on one engine thread; queries talk to it through an
//! async handle and search the current corpus snapshot.

pub mod config;
pub mod engine;
pub mod project;
pub mod query;

pub use config::{ConfigError, Settings};
pub use engine::{spawn_engine, EngineError, EngineHandle};
pub use project::{Project, ProjectCatalog, ProjectError, ResolvedImage};
pub use query::{CorpusSource, MatchRow, QueryConfig, QueryError, QueryService, Upload};
