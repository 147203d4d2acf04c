//! Path-level namespace operations over an [`ObjectBackend`].
//!
//! The executor owns the three things a raw backend lacks: the key
//! mapping, the directory policy for object stores, and retries. Every
//! backend error leaves here as an [`FsError`]; transient failures that
//! outlive the retry budget become `BackendFatal`.
//!
//! # Directory policy (object stores)
//!
//! A directory is a zero-byte marker at `key/`. When both `key` and `key/`
//! exist, the directory wins. A prefix with children but no marker
//! (written by some other tool) is treated as an implicit directory.
//! Nothing is repaired.

use std::ops::Range;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, instrument, warn};

use crate::backend::{BackendError, BackendErrorKind, ObjectBackend, ObjectMeta};
use crate::entry::{DirectoryEntry, EntryKind};
use crate::error::{FsError, FsResult};
use crate::path::{FsPath, KeyMapper};
use crate::retry::RetryPolicy;

/// How keys relate to directories on the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Flat keys; directories are emulated with marker objects.
    ObjectStore,
    /// The backend has real directories; operations pass straight through.
    Native,
}

/// Retrying, directory-aware front end to a backend.
#[derive(Debug, Clone)]
pub struct BackendExecutor {
    backend: Arc<dyn ObjectBackend>,
    mapper: KeyMapper,
    strategy: Strategy,
    retry: RetryPolicy,
}

impl BackendExecutor {
    pub fn new(
        backend: Arc<dyn ObjectBackend>,
        mapper: KeyMapper,
        strategy: Strategy,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            backend,
            mapper,
            strategy,
            retry,
        }
    }

    /// Executor with the object-store directory policy.
    pub fn object_store(backend: Arc<dyn ObjectBackend>, root_dir: &str, retry: RetryPolicy) -> Self {
        Self::new(backend, KeyMapper::new(root_dir), Strategy::ObjectStore, retry)
    }

    /// Passthrough executor for backends with native directories.
    pub fn native(backend: Arc<dyn ObjectBackend>, retry: RetryPolicy) -> Self {
        Self::new(backend, KeyMapper::default(), Strategy::Native, retry)
    }

    pub fn mapper(&self) -> &KeyMapper {
        &self.mapper
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn backend(&self) -> &Arc<dyn ObjectBackend> {
        &self.backend
    }

    fn file_key(&self, path: &FsPath) -> String {
        self.mapper.to_backend_key(path, false)
    }

    fn dir_key(&self, path: &FsPath) -> String {
        self.mapper.to_backend_key(path, true)
    }

    /// Translates a backend error for `path` into the namespace taxonomy.
    fn map_error(&self, op: &'static str, path: &FsPath, key: &str, err: BackendError, attempts: u32) -> FsError {
        match err.kind() {
            BackendErrorKind::NotFound => FsError::NotFound(path.to_string()),
            BackendErrorKind::AlreadyExists => FsError::AlreadyExists(path.to_string()),
            BackendErrorKind::NotEmpty => FsError::NotEmpty(path.to_string()),
            BackendErrorKind::Unsupported => FsError::Unsupported(format!("{op} on {}", self.backend.name())),
            BackendErrorKind::Transient => {
                warn!(op, key, attempts, error = %err, "Retries exhausted");
                FsError::BackendFatal {
                    op,
                    key: key.to_string(),
                    message: format!("gave up after {attempts} attempts: {}", err.message()),
                }
            }
            BackendErrorKind::Fatal => FsError::BackendFatal {
                op,
                key: key.to_string(),
                message: err.message().to_string(),
            },
        }
    }

    // ---- retried raw capabilities -------------------------------------

    async fn stat_key(&self, path: &FsPath, key: &str) -> FsResult<Option<ObjectMeta>> {
        let backend = &self.backend;
        match self.retry.run("stat", key, move || backend.stat(key)).await {
            Ok(meta) => Ok(Some(meta)),
            Err((e, _)) if e.is_not_found() => Ok(None),
            Err((e, attempts)) => Err(self.map_error("stat", path, key, e, attempts)),
        }
    }

    async fn list_key(&self, path: &FsPath, prefix: &str, recursive: bool) -> FsResult<Vec<ObjectMeta>> {
        let backend = &self.backend;
        match self
            .retry
            .run("list", prefix, move || backend.list(prefix, recursive))
            .await
        {
            Ok(entries) => Ok(entries),
            Err((e, _)) if e.is_not_found() => Ok(Vec::new()),
            Err((e, attempts)) => Err(self.map_error("list", path, prefix, e, attempts)),
        }
    }

    async fn put_key(&self, path: &FsPath, key: &str, data: Bytes) -> FsResult<()> {
        let backend = &self.backend;
        self.retry
            .run("put", key, move || backend.put(key, data.clone()))
            .await
            .map_err(|(e, attempts)| self.map_error("put", path, key, e, attempts))
    }

    async fn delete_key(&self, path: &FsPath, key: &str) -> FsResult<()> {
        let backend = &self.backend;
        self.retry
            .run("delete", key, move || backend.delete(key))
            .await
            .map_err(|(e, attempts)| self.map_error("delete", path, key, e, attempts))
    }

    async fn copy_key(&self, path: &FsPath, from: &str, to: &str) -> FsResult<()> {
        let backend = &self.backend;
        self.retry
            .run("copy", from, move || backend.copy(from, to))
            .await
            .map_err(|(e, attempts)| self.map_error("copy", path, from, e, attempts))
    }

    fn entry_from_meta(path: FsPath, meta: &ObjectMeta, kind: EntryKind) -> DirectoryEntry {
        DirectoryEntry {
            name: path.name().unwrap_or("/").to_string(),
            path,
            kind,
            size: if kind.is_dir() { 0 } else { meta.size },
            mtime: meta.last_modified,
        }
    }

    // ---- namespace operations -----------------------------------------

    /// Looks up `path`, applying the directory-wins policy.
    #[instrument(level = "trace", skip_all, fields(path = %path))]
    pub async fn lookup(&self, path: &FsPath) -> FsResult<DirectoryEntry> {
        if path.is_root() {
            return Ok(DirectoryEntry::directory(path.clone()));
        }
        match self.strategy {
            Strategy::Native => {
                let key = self.file_key(path);
                let meta = self
                    .stat_key(path, &key)
                    .await?
                    .ok_or_else(|| FsError::NotFound(path.to_string()))?;
                let kind = if meta.is_dir { EntryKind::Directory } else { EntryKind::File };
                Ok(Self::entry_from_meta(path.clone(), &meta, kind))
            }
            Strategy::ObjectStore => {
                let dir_key = self.dir_key(path);
                if let Some(meta) = self.stat_key(path, &dir_key).await? {
                    return Ok(Self::entry_from_meta(path.clone(), &meta, EntryKind::Directory));
                }
                let file_key = self.file_key(path);
                if let Some(meta) = self.stat_key(path, &file_key).await? {
                    return Ok(Self::entry_from_meta(path.clone(), &meta, EntryKind::File));
                }
                if !self.list_key(path, &dir_key, false).await?.is_empty() {
                    debug!(path = %path, "Implicit directory (no marker object)");
                    return Ok(DirectoryEntry::directory(path.clone()));
                }
                Err(FsError::NotFound(path.to_string()))
            }
        }
    }

    /// Like [`lookup`](Self::lookup) but maps `NotFound` to `None`.
    pub async fn probe(&self, path: &FsPath) -> FsResult<Option<DirectoryEntry>> {
        match self.lookup(path).await {
            Ok(entry) => Ok(Some(entry)),
            Err(FsError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Creates a directory marker. Fails if either key shape already exists.
    #[instrument(level = "debug", skip_all, fields(path = %path))]
    pub async fn mkdir(&self, path: &FsPath) -> FsResult<DirectoryEntry> {
        if path.is_root() {
            return Err(FsError::AlreadyExists(path.to_string()));
        }
        if self.strategy == Strategy::ObjectStore {
            let file_key = self.file_key(path);
            let dir_key = self.dir_key(path);
            if self.stat_key(path, &dir_key).await?.is_some()
                || self.stat_key(path, &file_key).await?.is_some()
            {
                return Err(FsError::AlreadyExists(path.to_string()));
            }
        }
        self.put_key(path, &self.dir_key(path), Bytes::new()).await?;
        debug!(path = %path, "Created directory");
        Ok(DirectoryEntry::directory(path.clone()))
    }

    /// Removes an empty directory.
    #[instrument(level = "debug", skip_all, fields(path = %path))]
    pub async fn rmdir(&self, path: &FsPath) -> FsResult<()> {
        if path.is_root() {
            return Err(FsError::InvalidArgument("cannot remove the root directory".into()));
        }
        let entry = self.lookup(path).await?;
        if !entry.is_dir() {
            return Err(FsError::not_a_directory(path.as_str()));
        }
        let dir_key = self.dir_key(path);
        let children = self.list_key(path, &dir_key, false).await?;
        if children.iter().any(|m| m.key != dir_key) {
            return Err(FsError::NotEmpty(path.to_string()));
        }
        if self.strategy == Strategy::ObjectStore && children.is_empty() {
            // Neither a marker nor children: an implicit directory that
            // vanished between lookup and list.
            if self.stat_key(path, &dir_key).await?.is_none() {
                return Err(FsError::NotFound(path.to_string()));
            }
        }
        self.delete_key(path, &dir_key).await?;
        debug!(path = %path, "Removed directory");
        Ok(())
    }

    /// Creates an empty file object.
    ///
    /// With `exclusive`, an existing file is `AlreadyExists`; otherwise the
    /// existing entry is returned untouched. Directories always conflict.
    /// The flag is true when this call created the object.
    #[instrument(level = "debug", skip_all, fields(path = %path))]
    pub async fn create_file(&self, path: &FsPath, exclusive: bool) -> FsResult<(DirectoryEntry, bool)> {
        if let Some(existing) = self.probe(path).await? {
            if existing.is_dir() {
                return Err(FsError::is_a_directory(path.as_str()));
            }
            if exclusive {
                return Err(FsError::AlreadyExists(path.to_string()));
            }
            return Ok((existing, false));
        }
        self.put_key(path, &self.file_key(path), Bytes::new()).await?;
        let entry = DirectoryEntry {
            name: path.name().unwrap_or_default().to_string(),
            path: path.clone(),
            kind: EntryKind::File,
            size: 0,
            mtime: Some(std::time::SystemTime::now()),
        };
        Ok((entry, true))
    }

    /// Deletes a file key.
    #[instrument(level = "debug", skip_all, fields(path = %path))]
    pub async fn unlink(&self, path: &FsPath) -> FsResult<()> {
        let file_key = self.file_key(path);
        match self.stat_key(path, &file_key).await? {
            Some(meta) if !meta.is_dir => self.delete_key(path, &file_key).await,
            Some(_) => Err(FsError::is_a_directory(path.as_str())),
            None => match self.probe(path).await? {
                Some(entry) if entry.is_dir() => Err(FsError::is_a_directory(path.as_str())),
                _ => Err(FsError::NotFound(path.to_string())),
            },
        }
    }

    /// Immediate children of a directory, sorted by name.
    ///
    /// A name present both as a file and as a directory is listed once, as
    /// a directory.
    #[instrument(level = "trace", skip_all, fields(path = %path))]
    pub async fn read_dir(&self, path: &FsPath) -> FsResult<Vec<DirectoryEntry>> {
        let entry = self.lookup(path).await?;
        if !entry.is_dir() {
            return Err(FsError::not_a_directory(path.as_str()));
        }
        let dir_key = self.dir_key(path);
        let mut entries: Vec<DirectoryEntry> = Vec::new();
        for meta in self.list_key(path, &dir_key, false).await? {
            let Some((name, dir_shaped)) = KeyMapper::child_name(&dir_key, &meta.key) else {
                continue;
            };
            let Ok(child) = path.join(name) else {
                debug!(key = %meta.key, "Skipping key with unrepresentable name");
                continue;
            };
            let kind = if dir_shaped || meta.is_dir { EntryKind::Directory } else { EntryKind::File };
            entries.push(Self::entry_from_meta(child, &meta, kind));
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| b.is_dir().cmp(&a.is_dir())));
        entries.dedup_by(|later, first| later.name == first.name);
        Ok(entries)
    }

    /// Reads a file object, optionally a sub-range of it.
    pub async fn read(&self, path: &FsPath, range: Option<Range<u64>>) -> FsResult<Bytes> {
        let key = self.file_key(path);
        let backend = &self.backend;
        let key_ref = key.as_str();
        self.retry
            .run("get", key_ref, move || backend.get(key_ref, range.clone()))
            .await
            .map_err(|(e, attempts)| self.map_error("get", path, key_ref, e, attempts))
    }

    /// Replaces a file object with `data`.
    pub async fn write(&self, path: &FsPath, data: Bytes) -> FsResult<()> {
        self.put_key(path, &self.file_key(path), data).await
    }

    /// Renames `src` to `dst`.
    ///
    /// Native backends use their own atomic rename. Object stores copy
    /// every object first and delete the sources afterwards, so a failure
    /// part way through leaves both trees present. The error is returned
    /// as is; nothing is rolled back.
    #[instrument(level = "debug", skip_all, fields(src = %src, dst = %dst))]
    pub async fn rename(&self, src: &FsPath, dst: &FsPath) -> FsResult<()> {
        if src == dst {
            return Ok(());
        }
        if src.is_root() || dst.is_root() {
            return Err(FsError::InvalidArgument("cannot rename the root directory".into()));
        }
        let source = self.lookup(src).await?;
        if source.is_dir() && dst.starts_with(src) {
            return Err(FsError::InvalidArgument(format!("cannot move {src} into itself")));
        }
        if let Some(target) = self.probe(dst).await? {
            match (source.kind, target.kind) {
                (EntryKind::File, EntryKind::Directory) => {
                    return Err(FsError::is_a_directory(dst.as_str()));
                }
                (EntryKind::Directory, EntryKind::File) => {
                    return Err(FsError::not_a_directory(dst.as_str()));
                }
                (EntryKind::Directory, EntryKind::Directory) => {
                    let dst_key = self.dir_key(dst);
                    let children = self.list_key(dst, &dst_key, false).await?;
                    if children.iter().any(|m| m.key != dst_key) {
                        return Err(FsError::NotEmpty(dst.to_string()));
                    }
                }
                (EntryKind::File, EntryKind::File) => {}
            }
        }

        if self.strategy == Strategy::Native {
            let (from, to) = (self.file_key(src), self.file_key(dst));
            let backend = &self.backend;
            let (from_ref, to_ref) = (from.as_str(), to.as_str());
            return self
                .retry
                .run("rename", from_ref, move || backend.rename(from_ref, to_ref))
                .await
                .map_err(|(e, attempts)| self.map_error("rename", src, from_ref, e, attempts));
        }

        if source.is_dir() {
            self.rename_tree(src, dst).await
        } else {
            let (from, to) = (self.file_key(src), self.file_key(dst));
            self.copy_key(src, &from, &to).await?;
            self.delete_key(src, &from).await
        }
    }

    async fn rename_tree(&self, src: &FsPath, dst: &FsPath) -> FsResult<()> {
        let src_key = self.dir_key(src);
        let dst_key = self.dir_key(dst);
        let mut objects = self.list_key(src, &src_key, true).await?;
        // Markers and files alike; the source marker may be absent.
        objects.retain(|m| m.key.starts_with(&src_key));

        self.put_key(dst, &dst_key, Bytes::new()).await?;
        for meta in &objects {
            let suffix = &meta.key[src_key.len()..];
            if suffix.is_empty() {
                continue;
            }
            let target = format!("{dst_key}{suffix}");
            if meta.key.ends_with('/') {
                self.put_key(dst, &target, Bytes::new()).await?;
            } else {
                self.copy_key(src, &meta.key, &target).await?;
            }
        }
        debug!(src = %src, dst = %dst, objects = objects.len(), "Copied tree, deleting source");

        // Deepest keys first so markers go after their contents.
        objects.sort_by(|a, b| b.key.len().cmp(&a.key.len()).then_with(|| b.key.cmp(&a.key)));
        for meta in &objects {
            self.delete_key(src, &meta.key).await?;
        }
        if !objects.iter().any(|m| m.key == src_key) {
            match self.delete_key(src, &src_key).await {
                Ok(()) | Err(FsError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    fn object_store() -> (Arc<MemoryBackend>, BackendExecutor) {
        let backend = Arc::new(MemoryBackend::new());
        let exec = BackendExecutor::object_store(backend.clone(), "", RetryPolicy::none());
        (backend, exec)
    }

    fn p(s: &str) -> FsPath {
        FsPath::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_directory_wins_over_file() {
        let (backend, exec) = object_store();
        backend.insert("both", "file bytes");
        backend.insert("both/", "");
        let entry = exec.lookup(&p("/both")).await.unwrap();
        assert_eq!(entry.kind, EntryKind::Directory);

        let listed = exec.read_dir(&FsPath::root()).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(listed[0].is_dir());
    }

    #[tokio::test]
    async fn test_implicit_directory() {
        let (backend, exec) = object_store();
        backend.insert("photos/2024/img.jpg", "jpg");
        let entry = exec.lookup(&p("/photos")).await.unwrap();
        assert!(entry.is_dir());
        let listed = exec.read_dir(&p("/photos")).await.unwrap();
        assert_eq!(listed[0].name, "2024");
        assert!(listed[0].is_dir());
    }

    #[tokio::test]
    async fn test_mkdir_conflicts_with_either_shape() {
        let (backend, exec) = object_store();
        backend.insert("taken", "x");
        assert!(matches!(exec.mkdir(&p("/taken")).await, Err(FsError::AlreadyExists(_))));
        exec.mkdir(&p("/fresh")).await.unwrap();
        assert!(backend.contains("fresh/"));
        assert!(matches!(exec.mkdir(&p("/fresh")).await, Err(FsError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn test_unlink_directory_is_type_mismatch() {
        let (_backend, exec) = object_store();
        exec.mkdir(&p("/d")).await.unwrap();
        let err = exec.unlink(&p("/d")).await.unwrap_err();
        assert_eq!(err.to_errno(), libc::EISDIR);
        assert!(matches!(exec.unlink(&p("/missing")).await, Err(FsError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_rename_tree_moves_everything() {
        let (backend, exec) = object_store();
        exec.mkdir(&p("/src")).await.unwrap();
        exec.mkdir(&p("/src/inner")).await.unwrap();
        exec.write(&p("/src/inner/f"), Bytes::from_static(b"data")).await.unwrap();

        exec.rename(&p("/src"), &p("/dst")).await.unwrap();

        assert_eq!(backend.keys(), vec!["dst/", "dst/inner/", "dst/inner/f"]);
        assert_eq!(backend.object("dst/inner/f").unwrap(), "data");
    }

    #[tokio::test]
    async fn test_rename_into_own_subtree_rejected() {
        let (_backend, exec) = object_store();
        exec.mkdir(&p("/a")).await.unwrap();
        let err = exec.rename(&p("/a"), &p("/a/b")).await.unwrap_err();
        assert!(matches!(err, FsError::InvalidArgument(_)));
    }
}
