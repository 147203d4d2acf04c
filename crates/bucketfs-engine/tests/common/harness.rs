//! Engine over an instrumented in-memory store, with path-based helpers.
//!
//! Helpers walk paths from the root with `lookup`, the way a transport
//! would, and panic on unexpected replies so tests stay short.

#![allow(dead_code)]

use std::sync::Arc;

use bucketfs_core::testing::InstrumentedBackend;
use bucketfs_core::{BackendExecutor, FsPath, FsResult, MemoryBackend, RetryPolicy};
use bucketfs_engine::{Attributes, DirEntryReply, Engine, EngineConfig, HandleId, OpenMode, Operation, Response};
use bytes::Bytes;

pub struct TestEngine {
    pub store: Arc<MemoryBackend>,
    pub backend: Arc<InstrumentedBackend>,
    pub engine: Arc<Engine>,
}

impl TestEngine {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self::with_retry(config, RetryPolicy::none())
    }

    pub fn with_retry(config: EngineConfig, retry: RetryPolicy) -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let (store, backend) = InstrumentedBackend::memory();
        let exec = BackendExecutor::object_store(backend.clone(), "", retry);
        let engine = Arc::new(Engine::new(exec, config).expect("valid engine config"));
        Self { store, backend, engine }
    }

    pub async fn exec(&self, op: Operation) -> FsResult<Response> {
        self.engine.execute(op).await
    }

    fn split(path: &str) -> (FsPath, String) {
        let path = FsPath::parse(path).expect("valid path");
        let parent = path.parent().expect("not the root");
        let name = path.name().expect("has a name").to_string();
        (parent, name)
    }

    /// Handle of an existing path (one lookup reference per call).
    pub async fn handle(&self, path: &str) -> FsResult<HandleId> {
        let path = FsPath::parse(path)?;
        let mut current = self.engine.root();
        for name in path.components() {
            match self
                .exec(Operation::Lookup {
                    parent: current,
                    name: name.to_string(),
                })
                .await?
            {
                Response::Entry(entry) => current = entry.handle,
                other => panic!("unexpected lookup reply {other:?}"),
            }
        }
        Ok(current)
    }

    async fn parent_handle(&self, path: &str) -> FsResult<(HandleId, String)> {
        let (parent, name) = Self::split(path);
        let handle = self.handle(parent.as_str()).await?;
        Ok((handle, name))
    }

    pub async fn mkdir(&self, path: &str) -> FsResult<HandleId> {
        let (parent, name) = self.parent_handle(path).await?;
        match self.exec(Operation::Mkdir { parent, name }).await? {
            Response::Entry(entry) => Ok(entry.handle),
            other => panic!("unexpected mkdir reply {other:?}"),
        }
    }

    pub async fn create_with(&self, path: &str, mode: OpenMode, exclusive: bool) -> FsResult<HandleId> {
        let (parent, name) = self.parent_handle(path).await?;
        match self
            .exec(Operation::Create {
                parent,
                name,
                mode,
                exclusive,
            })
            .await?
        {
            Response::Created(entry) => Ok(entry.handle),
            other => panic!("unexpected create reply {other:?}"),
        }
    }

    pub async fn create(&self, path: &str) -> FsResult<HandleId> {
        self.create_with(path, OpenMode::READ_WRITE, true).await
    }

    pub async fn open(&self, path: &str, mode: OpenMode) -> FsResult<HandleId> {
        let handle = self.handle(path).await?;
        self.exec(Operation::Open { handle, mode }).await?;
        Ok(handle)
    }

    pub async fn write_at(&self, handle: HandleId, offset: u64, data: &[u8]) -> FsResult<u32> {
        match self
            .exec(Operation::Write {
                handle,
                offset,
                data: Bytes::copy_from_slice(data),
            })
            .await?
        {
            Response::Written { size } => Ok(size),
            other => panic!("unexpected write reply {other:?}"),
        }
    }

    pub async fn read_at(&self, handle: HandleId, offset: u64, length: u32) -> FsResult<Bytes> {
        match self.exec(Operation::Read { handle, offset, length }).await? {
            Response::Data(data) => Ok(data),
            other => panic!("unexpected read reply {other:?}"),
        }
    }

    /// Whole file through the cache, in 64 KiB reads.
    pub async fn read_all(&self, handle: HandleId) -> FsResult<Vec<u8>> {
        let mut out = Vec::new();
        loop {
            let chunk = self.read_at(handle, out.len() as u64, 64 << 10).await?;
            if chunk.is_empty() {
                return Ok(out);
            }
            out.extend_from_slice(&chunk);
        }
    }

    pub async fn fsync(&self, handle: HandleId) -> FsResult<()> {
        self.exec(Operation::Fsync {
            handle,
            datasync: false,
        })
        .await
        .map(|_| ())
    }

    pub async fn getattr(&self, handle: HandleId) -> FsResult<Attributes> {
        match self.exec(Operation::GetAttr { handle }).await? {
            Response::Attr(attr) => Ok(attr),
            other => panic!("unexpected getattr reply {other:?}"),
        }
    }

    pub async fn readdir(&self, path: &str, offset: u64) -> FsResult<Vec<DirEntryReply>> {
        let handle = self.handle(path).await?;
        match self.exec(Operation::ReadDir { handle, offset }).await? {
            Response::Entries { entries } => Ok(entries),
            other => panic!("unexpected readdir reply {other:?}"),
        }
    }

    pub async fn unlink(&self, path: &str) -> FsResult<()> {
        let (parent, name) = self.parent_handle(path).await?;
        self.exec(Operation::Unlink { parent, name }).await.map(|_| ())
    }

    pub async fn rmdir(&self, path: &str) -> FsResult<()> {
        let (parent, name) = self.parent_handle(path).await?;
        self.exec(Operation::Rmdir { parent, name }).await.map(|_| ())
    }

    pub async fn rename(&self, from: &str, to: &str) -> FsResult<()> {
        let (parent, name) = self.parent_handle(from).await?;
        let (new_parent, new_name) = self.parent_handle(to).await?;
        self.exec(Operation::Rename {
            parent,
            name,
            new_parent,
            new_name,
        })
        .await
        .map(|_| ())
    }

    /// Backend copy of a file key, bypassing the cache.
    pub fn stored(&self, key: &str) -> Option<Bytes> {
        self.store.object(key)
    }
}
