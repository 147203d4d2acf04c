//! The operation engine.
//!
//! [`Engine::execute`] answers one decoded [`Operation`]: it resolves
//! handles through the [`HandleTable`], moves file data through the
//! [`CachePool`] and sends namespace changes straight to the
//! [`BackendExecutor`]. Entries and attributes are always built from a live
//! backend stat, overlaid with lengths the cache has not flushed yet.

use std::sync::Arc;

use bucketfs_core::path::resolve;
use bucketfs_core::{BackendExecutor, ConfigError, DirectoryEntry, EntryKind, FsError, FsPath, FsResult};
use parking_lot::Mutex;
use tracing::{debug, info, instrument, trace, warn};

use crate::cache::{CachePool, Sweeper};
use crate::config::EngineConfig;
use crate::handle_table::{HandleId, HandleTable, OpenMode, ResolvedHandle};
use crate::request::{Attributes, DirEntryReply, EntryReply, Operation, Reply, Response};
use crate::stats::PoolStatsSnapshot;

/// One namespace: a backend, its cache and the handles issued against it.
#[derive(Debug)]
pub struct Engine {
    config: EngineConfig,
    backend: Arc<BackendExecutor>,
    handles: HandleTable,
    cache: Arc<CachePool>,
    sweeper: Mutex<Option<Sweeper>>,
}

impl Engine {
    pub fn new(backend: BackendExecutor, config: EngineConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let backend = Arc::new(backend);
        let cache = Arc::new(CachePool::new(config.cache.clone(), Arc::clone(&backend))?);
        info!(
            backend = backend.backend().name(),
            strategy = ?backend.strategy(),
            prefix = backend.mapper().prefix(),
            "Engine created"
        );
        Ok(Self {
            config,
            backend,
            handles: HandleTable::new(),
            cache,
            sweeper: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<BackendExecutor> {
        &self.backend
    }

    pub fn handles(&self) -> &HandleTable {
        &self.handles
    }

    pub fn cache(&self) -> &Arc<CachePool> {
        &self.cache
    }

    pub fn root(&self) -> HandleId {
        self.handles.root()
    }

    pub fn stats(&self) -> PoolStatsSnapshot {
        self.cache.stats()
    }

    /// Answers one operation.
    #[instrument(level = "debug", skip_all, fields(op = op.name()))]
    pub async fn execute(&self, op: Operation) -> Reply {
        let name = op.name();
        let reply = match op {
            Operation::Init => self.init(),
            Operation::Destroy => self.destroy().await,
            Operation::Lookup { parent, name } => self.lookup(parent, &name).await,
            Operation::Forget { handle, nlookup } => self.release(handle, nlookup),
            Operation::GetAttr { handle } => self.getattr(handle).await,
            Operation::SetAttr { handle, size } => self.setattr(handle, size).await,
            Operation::Mkdir { parent, name } => self.mkdir(parent, &name).await,
            Operation::Rmdir { parent, name } => self.rmdir(parent, &name).await,
            Operation::Create {
                parent,
                name,
                mode,
                exclusive,
            } => self.create(parent, &name, mode, exclusive).await,
            Operation::Unlink { parent, name } => self.unlink(parent, &name).await,
            Operation::Rename {
                parent,
                name,
                new_parent,
                new_name,
            } => self.rename(parent, &name, new_parent, &new_name).await,
            Operation::Open { handle, mode } => self.open(handle, mode).await,
            Operation::OpenDir { handle } => self.opendir(handle),
            Operation::Read { handle, offset, length } => self.read(handle, offset, length).await,
            Operation::Write { handle, offset, data } => self.write(handle, offset, &data).await,
            Operation::ReadDir { handle, offset } => self.readdir(handle, offset).await,
            Operation::Release { handle } | Operation::ReleaseDir { handle } => self.release(handle, 1),
            Operation::Flush { handle } | Operation::Fsync { handle, .. } => self.fsync(handle).await,
            Operation::FsyncDir { handle } => self.fsyncdir(handle).await,
            Operation::Access { handle, .. } => self.access(handle).await,
            Operation::Other { opcode } => Err(FsError::Unsupported(format!("opcode {opcode}"))),
        };
        match &reply {
            Ok(_) => trace!(op = name, "Operation completed"),
            Err(e) => debug!(op = name, error = %e, "Operation failed"),
        }
        reply
    }

    // ---- session ------------------------------------------------------

    fn init(&self) -> Reply {
        let mut sweeper = self.sweeper.lock();
        if sweeper.is_none() {
            *sweeper = Some(Sweeper::spawn(&self.cache));
        }
        Ok(Response::Empty)
    }

    async fn destroy(&self) -> Reply {
        let sweeper = self.sweeper.lock().take();
        if let Some(sweeper) = sweeper {
            sweeper.stop().await;
        }
        let flushed = self.cache.flush_all().await?;
        info!(flushed, "Engine shut down");
        Ok(Response::Empty)
    }

    // ---- helpers ------------------------------------------------------

    fn child(&self, parent: HandleId, name: &str) -> FsResult<FsPath> {
        let parent = self.handles.resolve(parent)?;
        if !parent.kind.is_dir() {
            return Err(FsError::not_a_directory(parent.path.as_str()));
        }
        resolve(&parent.path, name)
    }

    fn file_handle(&self, handle: HandleId) -> FsResult<ResolvedHandle> {
        let resolved = self.handles.resolve(handle)?;
        if resolved.kind.is_dir() {
            return Err(FsError::is_a_directory(resolved.path.as_str()));
        }
        Ok(resolved)
    }

    fn dir_handle(&self, handle: HandleId) -> FsResult<ResolvedHandle> {
        let resolved = self.handles.resolve(handle)?;
        if !resolved.kind.is_dir() {
            return Err(FsError::not_a_directory(resolved.path.as_str()));
        }
        Ok(resolved)
    }

    /// Backend stat of `path` with the cache's unflushed length on top.
    async fn live_entry(&self, path: &FsPath) -> FsResult<DirectoryEntry> {
        let pending = self.cache.known_size(path).await;
        match self.backend.lookup(path).await {
            Ok(mut entry) => {
                if !entry.is_dir()
                    && let Some(size) = pending
                {
                    entry.size = size;
                }
                Ok(entry)
            }
            // Written locally, removed remotely: the next flush recreates it.
            Err(FsError::NotFound(_)) if pending.is_some() => Ok(DirectoryEntry {
                name: path.name().unwrap_or_default().to_string(),
                path: path.clone(),
                kind: EntryKind::File,
                size: pending.unwrap_or_default(),
                mtime: None,
            }),
            Err(e) => Err(e),
        }
    }

    fn attributes(&self, handle: HandleId, entry: &DirectoryEntry) -> Attributes {
        Attributes {
            handle,
            kind: entry.kind,
            size: entry.size,
            mtime: entry.mtime,
            attr_ttl: self.config.attr_ttl,
        }
    }

    fn entry_reply(&self, handle: HandleId, entry: &DirectoryEntry) -> EntryReply {
        EntryReply {
            handle,
            attributes: self.attributes(handle, entry),
            entry_ttl: self.config.entry_ttl,
        }
    }

    // ---- namespace ----------------------------------------------------

    async fn lookup(&self, parent: HandleId, name: &str) -> Reply {
        let path = self.child(parent, name)?;
        let entry = self.live_entry(&path).await?;
        let handle = self.handles.allocate(&path, entry.kind);
        Ok(Response::Entry(self.entry_reply(handle, &entry)))
    }

    fn release(&self, handle: HandleId, count: u64) -> Reply {
        self.handles.release(handle, count)?;
        Ok(Response::Empty)
    }

    async fn getattr(&self, handle: HandleId) -> Reply {
        let resolved = self.handles.resolve(handle)?;
        let entry = self.live_entry(&resolved.path).await?;
        Ok(Response::Attr(self.attributes(handle, &entry)))
    }

    async fn setattr(&self, handle: HandleId, size: Option<u64>) -> Reply {
        if let Some(size) = size {
            let resolved = self.file_handle(handle)?;
            self.cache.truncate(&resolved.path, size).await?;
        }
        self.getattr(handle).await
    }

    async fn mkdir(&self, parent: HandleId, name: &str) -> Reply {
        let path = self.child(parent, name)?;
        let entry = self.backend.mkdir(&path).await?;
        let handle = self.handles.allocate(&path, EntryKind::Directory);
        Ok(Response::Entry(self.entry_reply(handle, &entry)))
    }

    async fn rmdir(&self, parent: HandleId, name: &str) -> Reply {
        let path = self.child(parent, name)?;
        self.backend.rmdir(&path).await?;
        self.cache.discard_prefix(&path).await;
        Ok(Response::Empty)
    }

    /// Creates (or, without `exclusive`, opens) a file.
    ///
    /// The returned handle counts as one lookup plus one open.
    async fn create(&self, parent: HandleId, name: &str, mode: OpenMode, exclusive: bool) -> Reply {
        let path = self.child(parent, name)?;
        let (mut entry, created) = self.backend.create_file(&path, exclusive).await?;
        if created {
            self.cache.mark_created(&path).await;
        } else if mode.truncate {
            self.cache.truncate(&path, 0).await?;
            entry.size = 0;
        } else if let Some(size) = self.cache.known_size(&path).await {
            entry.size = size;
        }
        let handle = self.handles.allocate(&path, EntryKind::File);
        self.handles.retain(handle)?;
        self.handles.set_open_mode(handle, mode)?;
        debug!(path = %path, handle = %handle, created, "Created file");
        Ok(Response::Created(self.entry_reply(handle, &entry)))
    }

    async fn unlink(&self, parent: HandleId, name: &str) -> Reply {
        let path = self.child(parent, name)?;
        let guard = self.cache.lock_key(&path).await;
        self.backend.unlink(&path).await?;
        guard.discard();
        Ok(Response::Empty)
    }

    async fn rename(&self, parent: HandleId, name: &str, new_parent: HandleId, new_name: &str) -> Reply {
        let src = self.child(parent, name)?;
        let dst = self.child(new_parent, new_name)?;
        let source = self.backend.lookup(&src).await?;
        if src == dst {
            return Ok(Response::Empty);
        }

        if source.is_dir() {
            // Nothing below a directory being moved may stay unflushed, or the
            // copy would miss it. Writes racing with the move are not blocked.
            self.cache.flush_prefix(&src).await?;
            self.backend.rename(&src, &dst).await?;
            self.cache.discard_prefix(&src).await;
            self.cache.discard_prefix(&dst).await;
        } else {
            let (first, second) = if src.as_str() <= dst.as_str() { (&src, &dst) } else { (&dst, &src) };
            let first = self.cache.lock_key(first).await;
            let second = self.cache.lock_key(second).await;
            let (mut src_key, dst_key) = if first.path() == &src { (first, second) } else { (second, first) };
            src_key.flush().await?;
            self.backend.rename(&src, &dst).await?;
            src_key.discard();
            dst_key.discard();
        }

        let moved = self.handles.rename_path(&src, &dst);
        debug!(src = %src, dst = %dst, moved_handles = moved, "Renamed");
        Ok(Response::Empty)
    }

    // ---- files --------------------------------------------------------

    async fn open(&self, handle: HandleId, mode: OpenMode) -> Reply {
        let resolved = self.file_handle(handle)?;
        self.handles.retain(handle)?;
        self.handles.set_open_mode(handle, mode)?;
        if mode.truncate && mode.write
            && let Err(e) = self.cache.truncate(&resolved.path, 0).await
        {
            if let Err(release) = self.handles.release(handle, 1) {
                warn!(handle = %handle, error = %release, "Could not drop reference after failed open");
            }
            return Err(e);
        }
        Ok(Response::Opened { handle })
    }

    fn opendir(&self, handle: HandleId) -> Reply {
        self.dir_handle(handle)?;
        self.handles.retain(handle)?;
        Ok(Response::Opened { handle })
    }

    async fn read(&self, handle: HandleId, offset: u64, length: u32) -> Reply {
        let resolved = self.file_handle(handle)?;
        let data = self.cache.read(&resolved.path, offset, length).await?;
        Ok(Response::Data(data))
    }

    async fn write(&self, handle: HandleId, offset: u64, data: &[u8]) -> Reply {
        let resolved = self.file_handle(handle)?;
        let size = u32::try_from(data.len())
            .map_err(|_| FsError::InvalidArgument(format!("write of {} bytes is too large", data.len())))?;
        self.cache
            .write(&resolved.path, offset, data, resolved.open_mode.append)
            .await?;
        Ok(Response::Written { size })
    }

    async fn fsync(&self, handle: HandleId) -> Reply {
        let resolved = self.handles.resolve(handle)?;
        if !resolved.kind.is_dir() {
            self.cache.fsync(&resolved.path).await?;
        }
        Ok(Response::Empty)
    }

    // ---- directories --------------------------------------------------

    /// Entries after the first `offset`, sorted by name.
    async fn readdir(&self, handle: HandleId, offset: u64) -> Reply {
        let resolved = self.dir_handle(handle)?;
        let listed = self.backend.read_dir(&resolved.path).await?;
        let mut entries = Vec::with_capacity(listed.len());
        for (index, mut entry) in listed.into_iter().enumerate().skip(offset as usize) {
            if !entry.is_dir()
                && let Some(size) = self.cache.known_size(&entry.path).await
            {
                entry.size = size;
            }
            entries.push(DirEntryReply::from_entry(&entry, index as u64 + 1));
        }
        Ok(Response::Entries { entries })
    }

    async fn fsyncdir(&self, handle: HandleId) -> Reply {
        let resolved = self.dir_handle(handle)?;
        self.cache.flush_prefix(&resolved.path).await?;
        Ok(Response::Empty)
    }

    async fn access(&self, handle: HandleId) -> Reply {
        let resolved = self.handles.resolve(handle)?;
        self.live_entry(&resolved.path).await?;
        Ok(Response::Empty)
    }
}
