//! One engine plus dispatcher for the lifetime of a command.
//!
//! Commands speak to the engine only through [`DispatchClient`], the same
//! way a transport does, and walk paths one `lookup` at a time.

use std::sync::Arc;

use anyhow::{Context, Result};
use bucketfs_core::{FsError, FsPath, FsResult};
use bucketfs_engine::{
    Attributes, DirEntryReply, DispatchClient, Engine, EntryReply, HandleId, OpenMode, Operation, PoolStatsSnapshot,
    Response, spawn_dispatcher,
};
use bytes::Bytes;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use crate::config::FileConfig;

const DISPATCH_QUEUE: usize = 64;

/// Bytes requested per read or write call.
pub const IO_CHUNK: usize = 128 << 10;

pub struct Session {
    engine: Arc<Engine>,
    client: DispatchClient,
    dispatcher: JoinHandle<()>,
}

impl Session {
    /// Connects the configured backend and starts a session.
    pub async fn open(config: &FileConfig) -> Result<Self> {
        let backend = config.backend.build().await.context("Failed to set up backend")?;
        let engine = Arc::new(Engine::new(backend, config.engine.clone()).context("Invalid engine configuration")?);
        let (client, dispatcher) = spawn_dispatcher(Arc::clone(&engine), DISPATCH_QUEUE);
        client.call(Operation::Init).await?;
        Ok(Self {
            engine,
            client,
            dispatcher,
        })
    }

    /// Ends the session, flushing everything still dirty.
    pub async fn close(self) -> Result<()> {
        let flushed = self.client.call(Operation::Destroy).await;
        drop(self.client);
        if let Err(e) = self.dispatcher.await {
            warn!(error = %e, "Dispatcher task ended abnormally");
        }
        flushed.context("Failed to flush pending writes")?;
        Ok(())
    }

    pub fn stats(&self) -> PoolStatsSnapshot {
        self.engine.stats()
    }

    pub fn root(&self) -> HandleId {
        self.engine.root()
    }

    pub async fn call(&self, op: Operation) -> FsResult<Response> {
        self.client.call(op).await
    }

    /// Resolves `path`, returning its entry with one lookup reference held.
    #[instrument(level = "debug", skip(self), fields(path = %path))]
    pub async fn lookup(&self, path: &FsPath) -> FsResult<EntryReply> {
        if path.is_root() {
            return self.root_entry().await;
        }
        let mut parent = self.root();
        let mut components = path.components().peekable();
        while let Some(name) = components.next() {
            let entry = match self
                .call(Operation::Lookup {
                    parent,
                    name: name.to_string(),
                })
                .await
            {
                Ok(Response::Entry(entry)) => entry,
                Ok(other) => return Err(unexpected("lookup", &other)),
                Err(e) => {
                    self.forget(parent).await;
                    return Err(e);
                }
            };
            self.forget(parent).await;
            if components.peek().is_none() {
                return Ok(entry);
            }
            parent = entry.handle;
        }
        self.root_entry().await
    }

    /// Resolves the parent of `path` and returns it with the final name.
    pub async fn lookup_parent(&self, path: &FsPath) -> FsResult<(HandleId, String)> {
        let (Some(parent), Some(name)) = (path.parent(), path.name()) else {
            return Err(FsError::InvalidArgument(format!("{path} has no parent")));
        };
        let parent = self.lookup(&parent).await?;
        Ok((parent.handle, name.to_string()))
    }

    async fn root_entry(&self) -> FsResult<EntryReply> {
        let attributes = self.getattr(self.root()).await?;
        Ok(EntryReply {
            handle: attributes.handle,
            entry_ttl: attributes.attr_ttl,
            attributes,
        })
    }

    /// Drops one lookup reference. The root is never forgotten.
    pub async fn forget(&self, handle: HandleId) {
        if handle == self.root() {
            return;
        }
        if let Err(e) = self.call(Operation::Forget { handle, nlookup: 1 }).await {
            debug!(handle = %handle, error = %e, "Forget failed");
        }
    }

    pub async fn getattr(&self, handle: HandleId) -> FsResult<Attributes> {
        match self.call(Operation::GetAttr { handle }).await? {
            Response::Attr(attributes) => Ok(attributes),
            other => Err(unexpected("getattr", &other)),
        }
    }

    pub async fn open_file(&self, handle: HandleId, mode: OpenMode) -> FsResult<()> {
        self.call(Operation::Open { handle, mode }).await.map(|_| ())
    }

    pub async fn release(&self, handle: HandleId) {
        if let Err(e) = self.call(Operation::Release { handle }).await {
            debug!(handle = %handle, error = %e, "Release failed");
        }
    }

    pub async fn read(&self, handle: HandleId, offset: u64) -> FsResult<Bytes> {
        let length = IO_CHUNK as u32;
        match self.call(Operation::Read { handle, offset, length }).await? {
            Response::Data(data) => Ok(data),
            other => Err(unexpected("read", &other)),
        }
    }

    pub async fn write(&self, handle: HandleId, offset: u64, data: Bytes) -> FsResult<u32> {
        match self.call(Operation::Write { handle, offset, data }).await? {
            Response::Written { size } => Ok(size),
            other => Err(unexpected("write", &other)),
        }
    }

    /// Lists a directory, following readdir offsets until exhausted.
    pub async fn read_dir(&self, handle: HandleId) -> FsResult<Vec<DirEntryReply>> {
        self.call(Operation::OpenDir { handle }).await?;
        let mut out: Vec<DirEntryReply> = Vec::new();
        let result = loop {
            let offset = out.last().map_or(0, |e| e.offset);
            match self.call(Operation::ReadDir { handle, offset }).await {
                Ok(Response::Entries { entries }) if entries.is_empty() => break Ok(out),
                Ok(Response::Entries { entries }) => out.extend(entries),
                Ok(other) => break Err(unexpected("readdir", &other)),
                Err(e) => break Err(e),
            }
        };
        if let Err(e) = self.call(Operation::ReleaseDir { handle }).await {
            debug!(handle = %handle, error = %e, "Releasedir failed");
        }
        result
    }
}

fn unexpected(op: &'static str, reply: &Response) -> FsError {
    FsError::BackendFatal {
        op,
        key: String::new(),
        message: format!("unexpected reply {reply:?}"),
    }
}
