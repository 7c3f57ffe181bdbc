//! Ingestion pipeline: dedup, pre-screen, enrichment and persistence

pub mod coordinator;
pub mod events;
pub mod summary;

pub use coordinator::{IngestCoordinator, STATE_KEY};
pub use events::{EventReceiver, EventSender, PipelineEvent};
