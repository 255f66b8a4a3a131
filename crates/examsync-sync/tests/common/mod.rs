//! Shared fixtures: a remote store whose failures the test controls.

#![allow(dead_code)]

use async_trait::async_trait;
use examsync_core::{Record, RecordPath};
use examsync_storage::{operator, MemoryCache, OperatorStore, RemoteError, RemoteFeed, RemoteStore};
use examsync_sync::{Connectivity, ConnectivityState, SyncOptions, SyncStore};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// In-memory remote that can be taken down, slowed, or made to drop acks.
pub struct FlakyRemote {
    inner: OperatorStore,
    available: AtomicBool,
    lose_acks: AtomicBool,
    failing_prefix: Mutex<Option<String>>,
    delay: Mutex<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    pub sets: AtomicUsize,
    pub removes: AtomicUsize,
    pub ids_minted: AtomicUsize,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FlakyRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(FlakyRemote {
            inner: OperatorStore::new(operator::build_memory_operator().unwrap(), "db.json"),
            available: AtomicBool::new(true),
            lose_acks: AtomicBool::new(false),
            failing_prefix: Mutex::new(None),
            delay: Mutex::new(Duration::ZERO),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            sets: AtomicUsize::new(0),
            removes: AtomicUsize::new(0),
            ids_minted: AtomicUsize::new(0),
        })
    }

    pub fn set_available(&self, up: bool) {
        self.available.store(up, Ordering::SeqCst);
    }

    /// Apply writes but report them as failed.
    pub fn set_lose_acks(&self, lose: bool) {
        self.lose_acks.store(lose, Ordering::SeqCst);
    }

    /// Fail every mutation under `prefix`.
    pub fn fail_under(&self, prefix: Option<&str>) {
        *self.failing_prefix.lock().unwrap() = prefix.map(str::to_string);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Read straight from the backing store, bypassing fault injection.
    pub async fn peek(&self, path: &str) -> Option<Record> {
        self.inner.get(&p(path)).await.unwrap()
    }

    /// Write straight to the backing store, as another client would.
    pub async fn poke(&self, path: &str, value: Record) {
        self.inner.set(&p(path), value).await.unwrap();
    }

    async fn enter(&self, path: &RecordPath) -> Result<InFlight<'_>, RemoteError> {
        let delay = *self.delay.lock().unwrap();
        let n = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(n, Ordering::SeqCst);
        let guard = InFlight(&self.in_flight);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if !self.available.load(Ordering::SeqCst) {
            return Err(RemoteError::Unavailable("simulated outage".into()));
        }
        let failing = self.failing_prefix.lock().unwrap().clone();
        if let Some(prefix) = failing {
            if path.to_string().starts_with(&prefix) {
                return Err(RemoteError::Unavailable(format!("simulated failure at {path}")));
            }
        }
        Ok(guard)
    }

    fn ack(&self) -> Result<(), RemoteError> {
        if self.lose_acks.load(Ordering::SeqCst) {
            Err(RemoteError::Unavailable("simulated lost ack".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RemoteStore for FlakyRemote {
    async fn set(&self, path: &RecordPath, value: Record) -> Result<(), RemoteError> {
        let _g = self.enter(path).await?;
        self.inner.set(path, value).await?;
        self.sets.fetch_add(1, Ordering::SeqCst);
        self.ack()
    }

    async fn get(&self, path: &RecordPath) -> Result<Option<Record>, RemoteError> {
        let _g = self.enter(path).await?;
        self.inner.get(path).await
    }

    async fn generate_id(&self, parent: &RecordPath) -> Result<String, RemoteError> {
        let _g = self.enter(parent).await?;
        self.ids_minted.fetch_add(1, Ordering::SeqCst);
        self.inner.generate_id(parent).await
    }

    async fn remove(&self, path: &RecordPath) -> Result<(), RemoteError> {
        let _g = self.enter(path).await?;
        self.inner.remove(path).await?;
        self.removes.fetch_add(1, Ordering::SeqCst);
        self.ack()
    }

    async fn subscribe(&self, path: &RecordPath) -> Result<RemoteFeed, RemoteError> {
        let _g = self.enter(path).await?;
        self.inner.subscribe(path).await
    }

    async fn ping(&self) -> Result<(), RemoteError> {
        let _g = self.enter(&RecordPath::root()).await?;
        Ok(())
    }
}

pub fn p(s: &str) -> RecordPath {
    RecordPath::parse(s).unwrap()
}

/// A store over `remote` with an in-memory cache.
pub fn open_store(remote: Arc<FlakyRemote>, state: ConnectivityState) -> (SyncStore, Connectivity) {
    let conn = Connectivity::new(state);
    let store = SyncStore::open(
        remote,
        Box::new(MemoryCache::new()),
        conn.subscribe(),
        SyncOptions::default(),
    )
    .unwrap();
    (store, conn)
}

/// Poll `cond` until it holds or two seconds pass.
pub async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
