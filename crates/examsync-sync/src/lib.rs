//! examsync-sync: offline-tolerant record store with a durable replay queue

pub mod connectivity;
pub mod queue;
pub mod state;
pub mod store;

pub use connectivity::{Connectivity, ConnectivityState, HealthProbe, Link};
pub use queue::{PendingOperation, PendingQueue};
pub use state::{DeadLetter, LocalState};
pub use store::{Appended, DrainReport, StorageStats, Subscription, SyncOptions, SyncStore};
