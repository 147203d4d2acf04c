//! Backend wrapper that counts calls and injects faults.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::backend::{BackendError, BackendErrorKind, BackendResult, MemoryBackend, ObjectBackend, ObjectMeta};

/// One backend capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Stat,
    Get,
    Put,
    Delete,
    List,
    Copy,
    Rename,
}

impl Capability {
    const ALL: [Capability; 7] = [
        Capability::Stat,
        Capability::Get,
        Capability::Put,
        Capability::Delete,
        Capability::List,
        Capability::Copy,
        Capability::Rename,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

/// Snapshot of call counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub stat: u64,
    pub get: u64,
    pub put: u64,
    pub delete: u64,
    pub list: u64,
    pub copy: u64,
    pub rename: u64,
}

#[derive(Debug, Clone)]
struct Fault {
    /// `None` fails forever.
    remaining: Option<u32>,
    kind: BackendErrorKind,
    key_prefix: Option<String>,
}

/// Wraps another backend, counting every call and optionally failing or
/// delaying some of them.
///
/// Faults are checked before the inner backend is reached, so a failed
/// call has no side effects.
#[derive(Debug)]
pub struct InstrumentedBackend {
    inner: Arc<dyn ObjectBackend>,
    calls: [AtomicU64; 7],
    faults: Mutex<HashMap<Capability, Fault>>,
    delays: Mutex<HashMap<Capability, Duration>>,
    reply_delays: Mutex<HashMap<Capability, Duration>>,
}

impl InstrumentedBackend {
    pub fn new(inner: Arc<dyn ObjectBackend>) -> Self {
        Self {
            inner,
            calls: Default::default(),
            faults: Mutex::new(HashMap::new()),
            delays: Mutex::new(HashMap::new()),
            reply_delays: Mutex::new(HashMap::new()),
        }
    }

    /// Instrumented in-memory backend; the inner store is returned for seeding.
    pub fn memory() -> (Arc<MemoryBackend>, Arc<Self>) {
        let store = Arc::new(MemoryBackend::new());
        let instrumented = Arc::new(Self::new(store.clone()));
        (store, instrumented)
    }

    pub fn inner(&self) -> &Arc<dyn ObjectBackend> {
        &self.inner
    }

    /// Fails the next `times` calls of `capability` with `kind`.
    pub fn fail_next(&self, capability: Capability, times: u32, kind: BackendErrorKind) {
        self.faults.lock().insert(
            capability,
            Fault {
                remaining: Some(times),
                kind,
                key_prefix: None,
            },
        );
    }

    /// Fails every call of `capability` until [`clear_faults`](Self::clear_faults).
    pub fn fail_always(&self, capability: Capability, kind: BackendErrorKind) {
        self.faults.lock().insert(
            capability,
            Fault {
                remaining: None,
                kind,
                key_prefix: None,
            },
        );
    }

    /// Fails every call of `capability` whose key starts with `prefix`.
    pub fn fail_keys(&self, capability: Capability, prefix: impl Into<String>, kind: BackendErrorKind) {
        self.faults.lock().insert(
            capability,
            Fault {
                remaining: None,
                kind,
                key_prefix: Some(prefix.into()),
            },
        );
    }

    pub fn clear_faults(&self) {
        self.faults.lock().clear();
    }

    /// Delays every call of `capability` by `delay` before it reaches the
    /// inner backend. `None` removes the delay.
    pub fn set_delay(&self, capability: Capability, delay: Option<Duration>) {
        let mut delays = self.delays.lock();
        match delay {
            Some(delay) => delays.insert(capability, delay),
            None => delays.remove(&capability),
        };
    }

    /// Delays the answer of every call of `capability` by `delay` after the
    /// inner backend has served it, so the caller holds a snapshot that may
    /// be out of date by the time it arrives. `None` removes the delay.
    pub fn set_reply_delay(&self, capability: Capability, delay: Option<Duration>) {
        let mut delays = self.reply_delays.lock();
        match delay {
            Some(delay) => delays.insert(capability, delay),
            None => delays.remove(&capability),
        };
    }

    pub fn calls(&self, capability: Capability) -> u64 {
        self.calls[capability.index()].load(Ordering::SeqCst)
    }

    pub fn counts(&self) -> CallCounts {
        CallCounts {
            stat: self.calls(Capability::Stat),
            get: self.calls(Capability::Get),
            put: self.calls(Capability::Put),
            delete: self.calls(Capability::Delete),
            list: self.calls(Capability::List),
            copy: self.calls(Capability::Copy),
            rename: self.calls(Capability::Rename),
        }
    }

    pub fn reset_counts(&self) {
        for capability in Capability::ALL {
            self.calls[capability.index()].store(0, Ordering::SeqCst);
        }
    }

    fn enter(&self, capability: Capability, key: &str) -> BackendResult<()> {
        self.calls[capability.index()].fetch_add(1, Ordering::SeqCst);
        let mut faults = self.faults.lock();
        let Some(fault) = faults.get_mut(&capability) else {
            return Ok(());
        };
        if let Some(prefix) = &fault.key_prefix
            && !key.starts_with(prefix.as_str())
        {
            return Ok(());
        }
        let kind = fault.kind;
        match fault.remaining {
            None => {}
            Some(0) => {
                faults.remove(&capability);
                return Ok(());
            }
            Some(1) => {
                faults.remove(&capability);
            }
            Some(n) => fault.remaining = Some(n - 1),
        }
        Err(BackendError::new(kind, format!("injected {capability:?} failure on {key:?}")))
    }

    async fn pause(&self, capability: Capability) {
        let delay = self.delays.lock().get(&capability).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    async fn reply<T>(&self, capability: Capability, result: BackendResult<T>) -> BackendResult<T> {
        let delay = self.reply_delays.lock().get(&capability).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        result
    }
}

#[async_trait]
impl ObjectBackend for InstrumentedBackend {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn stat(&self, key: &str) -> BackendResult<ObjectMeta> {
        self.enter(Capability::Stat, key)?;
        self.pause(Capability::Stat).await;
        let result = self.inner.stat(key).await;
        self.reply(Capability::Stat, result).await
    }

    async fn get(&self, key: &str, range: Option<Range<u64>>) -> BackendResult<Bytes> {
        self.enter(Capability::Get, key)?;
        self.pause(Capability::Get).await;
        let result = self.inner.get(key, range).await;
        self.reply(Capability::Get, result).await
    }

    async fn put(&self, key: &str, data: Bytes) -> BackendResult<()> {
        self.enter(Capability::Put, key)?;
        self.pause(Capability::Put).await;
        let result = self.inner.put(key, data).await;
        self.reply(Capability::Put, result).await
    }

    async fn delete(&self, key: &str) -> BackendResult<()> {
        self.enter(Capability::Delete, key)?;
        self.pause(Capability::Delete).await;
        let result = self.inner.delete(key).await;
        self.reply(Capability::Delete, result).await
    }

    async fn list(&self, prefix: &str, recursive: bool) -> BackendResult<Vec<ObjectMeta>> {
        self.enter(Capability::List, prefix)?;
        self.pause(Capability::List).await;
        let result = self.inner.list(prefix, recursive).await;
        self.reply(Capability::List, result).await
    }

    async fn copy(&self, from: &str, to: &str) -> BackendResult<()> {
        self.enter(Capability::Copy, from)?;
        self.pause(Capability::Copy).await;
        let result = self.inner.copy(from, to).await;
        self.reply(Capability::Copy, result).await
    }

    async fn rename(&self, from: &str, to: &str) -> BackendResult<()> {
        self.enter(Capability::Rename, from)?;
        self.pause(Capability::Rename).await;
        let result = self.inner.rename(from, to).await;
        self.reply(Capability::Rename, result).await
    }
}
