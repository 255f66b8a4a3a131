//! examsync-storage: remote record store over OpenDAL, JSON tree ops, and the local cache

pub mod cache;
pub mod health;
pub mod object;
pub mod operator;
pub mod remote;
pub mod tree;

pub use cache::{CacheError, JsonFileCache, LocalCache, MemoryCache};
pub use health::check_health;
pub use object::OperatorStore;
pub use remote::{ChangeEvent, RemoteError, RemoteFeed, RemoteStore};
