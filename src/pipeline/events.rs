//! Pipeline event stream
//!
//! Delivery is best-effort: a send with no live subscriber is dropped, and
//! a subscriber that falls behind by more than [`EVENT_CAPACITY`] events
//! observes a `Lagged` error and skips ahead.

use crate::proxy::models::Proxy;
use crate::validation::models::ValidationResult;
use tokio::sync::broadcast;

/// Events buffered per subscriber
pub const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// A new candidate passed dedup and entered the pending queue
    Discovered(Proxy),
    /// The pending queue changed size
    Update { queue_len: usize },
    /// A validation reached its terminal outcome
    ValidationComplete(Box<ValidationResult>),
}

pub type EventSender = broadcast::Sender<PipelineEvent>;
pub type EventReceiver = broadcast::Receiver<PipelineEvent>;

/// Create the shared event channel
pub fn channel() -> EventSender {
    let (sender, _) = broadcast::channel(EVENT_CAPACITY);
    sender
}
