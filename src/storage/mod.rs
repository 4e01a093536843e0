pub mod traits;
pub mod duckdb;
pub mod resume;

pub use traits::{MeterRecord, ResumeState, Storage, StorageError};
pub use resume::{CheckpointTimer, ResumeStore};
