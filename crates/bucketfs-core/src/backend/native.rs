//! Passthrough backend over a local (or network-mounted) directory tree.

use std::io::SeekFrom;
use std::ops::Range;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::trace;

use super::{BackendError, BackendErrorKind, BackendResult, ObjectBackend, ObjectMeta};

/// Backend whose keys are paths relative to `root`.
///
/// A trailing `/` on a key addresses a directory. The filesystem already
/// has POSIX semantics, so directory keys map to real directories and
/// `rename` is the filesystem's own atomic rename.
#[derive(Debug, Clone)]
pub struct NativeBackend {
    root: PathBuf,
}

impl NativeBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, key: &str) -> BackendResult<(PathBuf, bool)> {
        let is_dir = key.is_empty() || key.ends_with('/');
        let relative = key.trim_end_matches('/');
        if relative.split('/').any(|c| c == ".." || c == ".") {
            return Err(BackendError::new(
                BackendErrorKind::Fatal,
                format!("key {key:?} escapes the backend root"),
            ));
        }
        Ok((self.root.join(relative), is_dir))
    }

    fn meta(key: String, metadata: &std::fs::Metadata) -> ObjectMeta {
        let is_dir = metadata.is_dir();
        ObjectMeta {
            key,
            size: if is_dir { 0 } else { metadata.len() },
            last_modified: metadata.modified().ok(),
            is_dir,
        }
    }

    async fn list_dir(&self, prefix: &str, out: &mut Vec<ObjectMeta>) -> BackendResult<Vec<String>> {
        let (dir, _) = self.resolve(prefix)?;
        let mut entries = fs::read_dir(&dir).await?;
        let mut subdirs = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let Ok(name) = entry.file_name().into_string() else {
                trace!(dir = %dir.display(), "skipping non-UTF-8 entry");
                continue;
            };
            let metadata = entry.metadata().await?;
            let mut key = format!("{prefix}{name}");
            if metadata.is_dir() {
                key.push('/');
                subdirs.push(key.clone());
            }
            out.push(Self::meta(key, &metadata));
        }
        Ok(subdirs)
    }
}

#[async_trait]
impl ObjectBackend for NativeBackend {
    fn name(&self) -> &'static str {
        "native"
    }

    async fn stat(&self, key: &str) -> BackendResult<ObjectMeta> {
        let (path, is_dir) = self.resolve(key)?;
        let metadata = fs::metadata(&path).await?;
        if is_dir && !metadata.is_dir() {
            return Err(BackendError::not_found(key));
        }
        Ok(Self::meta(key.to_string(), &metadata))
    }

    async fn get(&self, key: &str, range: Option<Range<u64>>) -> BackendResult<Bytes> {
        let (path, _) = self.resolve(key)?;
        let mut file = fs::File::open(&path).await?;
        if file.metadata().await?.is_dir() {
            return Err(BackendError::fatal(format!("{key:?} is a directory")));
        }
        let mut buf = Vec::new();
        match range {
            None => {
                file.read_to_end(&mut buf).await?;
            }
            Some(r) => {
                file.seek(SeekFrom::Start(r.start)).await?;
                file.take(r.end.saturating_sub(r.start)).read_to_end(&mut buf).await?;
            }
        }
        Ok(Bytes::from(buf))
    }

    async fn put(&self, key: &str, data: Bytes) -> BackendResult<()> {
        let (path, is_dir) = self.resolve(key)?;
        if is_dir {
            fs::create_dir(&path).await?;
        } else {
            fs::write(&path, &data).await?;
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> BackendResult<()> {
        let (path, is_dir) = self.resolve(key)?;
        if is_dir {
            fs::remove_dir(&path).await?;
        } else {
            fs::remove_file(&path).await?;
        }
        Ok(())
    }

    async fn list(&self, prefix: &str, recursive: bool) -> BackendResult<Vec<ObjectMeta>> {
        let mut out = Vec::new();
        let mut pending = self.list_dir(prefix, &mut out).await?;
        while recursive && let Some(dir) = pending.pop() {
            pending.extend(self.list_dir(&dir, &mut out).await?);
        }
        Ok(out)
    }

    async fn copy(&self, from: &str, to: &str) -> BackendResult<()> {
        let (src, _) = self.resolve(from)?;
        let (dst, _) = self.resolve(to)?;
        fs::copy(&src, &dst).await?;
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> BackendResult<()> {
        let (src, _) = self.resolve(from)?;
        let (dst, _) = self.resolve(to)?;
        fs::rename(&src, &dst).await?;
        Ok(())
    }
}
