//! examsync-core: shared path/outcome types, config schema, and error taxonomy

pub mod config;
pub mod error;
pub mod types;

pub use error::{SyncError, SyncResult};
pub use types::{Ack, OpKind, Record, RecordPath};
