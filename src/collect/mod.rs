pub mod orchestrator;
pub mod paginator;
pub mod window;

use crate::transport::TransportError;
use thiserror::Error;

pub use orchestrator::{
    CollectionReport, Collector, CollectorError, CollectorSettings, RunOutcome, RunPhase, SyncOptions,
};
pub use paginator::{CursorStats, RecordCursor};
pub use window::{CollectionWindow, Floor, LogReader, SearchStrategy, StartPoint};

#[derive(Debug, Error)]
pub enum InterruptReason {
    #[error("transport failure: {0}")]
    Transport(TransportError),

    #[error("cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum CollectError {
    /// The log could not be read to the end. `last_index` is the highest
    /// index handed out before the stop.
    #[error("collection interrupted after index {last_index:?}: {reason}")]
    Interrupted {
        last_index: Option<u64>,
        reason: InterruptReason,
    },
}
