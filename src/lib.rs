//! Proxy Pipeline - proxy ingestion and validation
//!
//! Candidates from any number of sources are deduplicated, pre-screened,
//! enriched with geolocation and persisted, while a bounded worker pool
//! runs the full validation protocol (connectivity, speed, anonymity,
//! geolocation) on each of them.

pub mod config;
pub mod error;
pub mod pipeline;
pub mod proxy;
pub mod sources;
pub mod storage;
pub mod validation;

pub use config::PipelineConfig;
pub use error::{CandidateError, ConfigError, ProbeError, StorageError};
pub use pipeline::{IngestCoordinator, PipelineEvent};
pub use proxy::{Proxy, ProxyType, RawCandidate};
pub use storage::{FileStore, PersistenceStore, Session, SqliteStore};
pub use validation::{ProxyValidator, ValidationResult, ValidationScheduler, ValidationStats};

/// Application result type
pub type Result<T> = anyhow::Result<T>;
