//! In-memory object store with S3-style listing semantics.

use std::collections::BTreeMap;
use std::ops::Range;
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;

use super::{BackendError, BackendResult, ObjectBackend, ObjectMeta, clamp_range};

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    modified: SystemTime,
}

/// Flat key/value object store held in a `BTreeMap`.
///
/// Behaves like a bucket: there are no real directories, only keys, and a
/// delimiter listing folds deeper keys into common prefixes. Unlike S3,
/// deleting a missing key reports `NotFound`.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    objects: RwLock<BTreeMap<String, StoredObject>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an object directly, bypassing any engine.
    ///
    /// Handy for simulating writes by another application.
    pub fn insert(&self, key: impl Into<String>, data: impl Into<Bytes>) {
        self.objects.write().insert(
            key.into(),
            StoredObject {
                data: data.into(),
                modified: SystemTime::now(),
            },
        );
    }

    /// Current bytes of `key`, if present.
    pub fn object(&self, key: &str) -> Option<Bytes> {
        self.objects.read().get(key).map(|o| o.data.clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.read().contains_key(key)
    }

    /// All keys in lexical order.
    pub fn keys(&self) -> Vec<String> {
        self.objects.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    fn meta(key: &str, obj: &StoredObject) -> ObjectMeta {
        ObjectMeta {
            key: key.to_string(),
            size: obj.data.len() as u64,
            last_modified: Some(obj.modified),
            is_dir: key.ends_with('/'),
        }
    }
}

#[async_trait]
impl ObjectBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn stat(&self, key: &str) -> BackendResult<ObjectMeta> {
        self.objects
            .read()
            .get(key)
            .map(|obj| Self::meta(key, obj))
            .ok_or_else(|| BackendError::not_found(key))
    }

    async fn get(&self, key: &str, range: Option<Range<u64>>) -> BackendResult<Bytes> {
        let objects = self.objects.read();
        let obj = objects.get(key).ok_or_else(|| BackendError::not_found(key))?;
        Ok(obj.data.slice(clamp_range(range, obj.data.len())))
    }

    async fn put(&self, key: &str, data: Bytes) -> BackendResult<()> {
        self.insert(key, data);
        Ok(())
    }

    async fn delete(&self, key: &str) -> BackendResult<()> {
        self.objects
            .write()
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| BackendError::not_found(key))
    }

    async fn list(&self, prefix: &str, recursive: bool) -> BackendResult<Vec<ObjectMeta>> {
        let objects = self.objects.read();
        let mut out: Vec<ObjectMeta> = Vec::new();
        for (key, obj) in objects.range(prefix.to_string()..) {
            let Some(rest) = key.strip_prefix(prefix) else {
                break;
            };
            if recursive {
                out.push(Self::meta(key, obj));
                continue;
            }
            match rest.find('/') {
                Some(idx) if idx + 1 < rest.len() => {
                    let common = &key[..prefix.len() + idx + 1];
                    if out.last().is_none_or(|m| m.key != common) {
                        out.push(ObjectMeta::prefix(common));
                    }
                }
                _ => {
                    // Direct child file, or a child marker `prefix/name/`.
                    if out.last().is_none_or(|m| m.key != *key) {
                        out.push(Self::meta(key, obj));
                    }
                }
            }
        }
        Ok(out)
    }
}
