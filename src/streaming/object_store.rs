//! Object Store Abstraction
//!
//! The only component that performs physical I/O against durable storage.
//! Everything above it treats an acknowledged write as durable.
//!
//! Implementations:
//! - `InMemoryObjectStore`: unit tests, DST, single-process clusters
//! - `LocalFsObjectStore`: development and local clusters
//! - `S3ObjectStore`: production (feature `s3`)
//!
//! `put` is an overwrite, so repeating it with identical bytes is a no-op
//! from the caller's side. `put_if_absent` is a create-only write and the
//! basis of manifest publication.

use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{Error as IoError, ErrorKind, Result as IoResult};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Objects returned per `list` page
pub const LIST_PAGE_SIZE: usize = 1000;

/// Metadata for a stored object
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ObjectMeta {
    pub key: String,
    pub size_bytes: u64,
    /// Last modification (Unix ms)
    pub created_at_ms: u64,
    pub etag: Option<String>,
}

/// One page of a list operation
#[derive(Debug, Clone, Default)]
pub struct ListResult {
    pub objects: Vec<ObjectMeta>,
    /// Pass back to `list` to fetch the next page
    pub continuation_token: Option<String>,
}

/// Object store abstraction.
///
/// Object-safe so nodes can share an `Arc<dyn ObjectStore>` and tests can
/// swap in fault-injecting wrappers.
pub trait ObjectStore: Send + Sync + 'static {
    /// Create or overwrite an object
    fn put<'a>(&'a self, key: &'a str, data: &'a [u8]) -> BoxFuture<'a, IoResult<()>>;

    /// Create an object only if the key is unused.
    ///
    /// Fails with `ErrorKind::AlreadyExists` when the key is taken, whatever
    /// its content.
    fn put_if_absent<'a>(&'a self, key: &'a str, data: &'a [u8]) -> BoxFuture<'a, IoResult<()>>;

    /// Fails with `ErrorKind::NotFound` for a missing key
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, IoResult<Vec<u8>>>;

    fn exists<'a>(&'a self, key: &'a str) -> BoxFuture<'a, IoResult<bool>>;

    /// Idempotent: deleting a missing key succeeds
    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, IoResult<()>>;

    /// One page of keys under `prefix`, in key order
    fn list<'a>(
        &'a self,
        prefix: &'a str,
        continuation_token: Option<&'a str>,
    ) -> BoxFuture<'a, IoResult<ListResult>>;

    fn head<'a>(&'a self, key: &'a str) -> BoxFuture<'a, IoResult<ObjectMeta>>;

    /// Every key under `prefix`, following continuation tokens
    fn list_all<'a>(&'a self, prefix: &'a str) -> BoxFuture<'a, IoResult<Vec<ObjectMeta>>> {
        Box::pin(async move {
            let mut objects = Vec::new();
            let mut token: Option<String> = None;
            loop {
                let page = self.list(prefix, token.as_deref()).await?;
                objects.extend(page.objects);
                match page.continuation_token {
                    Some(next) => token = Some(next),
                    None => return Ok(objects),
                }
            }
        })
    }
}

impl<T: ObjectStore + ?Sized> ObjectStore for Arc<T> {
    fn put<'a>(&'a self, key: &'a str, data: &'a [u8]) -> BoxFuture<'a, IoResult<()>> {
        (**self).put(key, data)
    }

    fn put_if_absent<'a>(&'a self, key: &'a str, data: &'a [u8]) -> BoxFuture<'a, IoResult<()>> {
        (**self).put_if_absent(key, data)
    }

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, IoResult<Vec<u8>>> {
        (**self).get(key)
    }

    fn exists<'a>(&'a self, key: &'a str) -> BoxFuture<'a, IoResult<bool>> {
        (**self).exists(key)
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, IoResult<()>> {
        (**self).delete(key)
    }

    fn list<'a>(
        &'a self,
        prefix: &'a str,
        continuation_token: Option<&'a str>,
    ) -> BoxFuture<'a, IoResult<ListResult>> {
        (**self).list(prefix, continuation_token)
    }

    fn head<'a>(&'a self, key: &'a str) -> BoxFuture<'a, IoResult<ObjectMeta>> {
        (**self).head(key)
    }
}

pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn not_found(key: &str) -> IoError {
    IoError::new(ErrorKind::NotFound, format!("Key not found: {}", key))
}

fn already_exists(key: &str) -> IoError {
    IoError::new(ErrorKind::AlreadyExists, format!("Key already exists: {}", key))
}

// ============================================================================
// InMemoryObjectStore - For tests and DST
// ============================================================================

/// In-memory object store. Clones share the same contents, so several
/// in-process nodes can use one instance as their "durable" store.
#[derive(Debug, Clone, Default)]
pub struct InMemoryObjectStore {
    data: Arc<RwLock<BTreeMap<String, StoredObject>>>,
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Vec<u8>,
    created_at_ms: u64,
}

impl StoredObject {
    fn meta(&self, key: &str) -> ObjectMeta {
        ObjectMeta {
            key: key.to_string(),
            size_bytes: self.data.len() as u64,
            created_at_ms: self.created_at_ms,
            etag: Some(format!("{:08x}", crc32fast::hash(&self.data))),
        }
    }
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// All keys under a prefix (test helper)
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.data
            .read()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect()
    }
}

impl ObjectStore for InMemoryObjectStore {
    fn put<'a>(&'a self, key: &'a str, data: &'a [u8]) -> BoxFuture<'a, IoResult<()>> {
        Box::pin(async move {
            let obj = StoredObject {
                data: data.to_vec(),
                created_at_ms: now_ms(),
            };
            self.data.write().insert(key.to_string(), obj);
            Ok(())
        })
    }

    fn put_if_absent<'a>(&'a self, key: &'a str, data: &'a [u8]) -> BoxFuture<'a, IoResult<()>> {
        Box::pin(async move {
            let mut map = self.data.write();
            if map.contains_key(key) {
                return Err(already_exists(key));
            }
            map.insert(
                key.to_string(),
                StoredObject {
                    data: data.to_vec(),
                    created_at_ms: now_ms(),
                },
            );
            Ok(())
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, IoResult<Vec<u8>>> {
        Box::pin(async move {
            self.data
                .read()
                .get(key)
                .map(|obj| obj.data.clone())
                .ok_or_else(|| not_found(key))
        })
    }

    fn exists<'a>(&'a self, key: &'a str) -> BoxFuture<'a, IoResult<bool>> {
        Box::pin(async move { Ok(self.data.read().contains_key(key)) })
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, IoResult<()>> {
        Box::pin(async move {
            self.data.write().remove(key);
            Ok(())
        })
    }

    fn list<'a>(
        &'a self,
        prefix: &'a str,
        continuation_token: Option<&'a str>,
    ) -> BoxFuture<'a, IoResult<ListResult>> {
        Box::pin(async move {
            let data = self.data.read();
            let start = match continuation_token {
                Some(after) => Bound::Excluded(after.to_string()),
                None => Bound::Included(prefix.to_string()),
            };
            let mut objects = Vec::new();
            let mut continuation_token = None;
            for (key, obj) in data.range((start, Bound::Unbounded)) {
                if !key.starts_with(prefix) {
                    break;
                }
                if objects.len() == LIST_PAGE_SIZE {
                    continuation_token = objects.last().map(|m: &ObjectMeta| m.key.clone());
                    break;
                }
                objects.push(obj.meta(key));
            }
            Ok(ListResult {
                objects,
                continuation_token,
            })
        })
    }

    fn head<'a>(&'a self, key: &'a str) -> BoxFuture<'a, IoResult<ObjectMeta>> {
        Box::pin(async move {
            self.data
                .read()
                .get(key)
                .map(|obj| obj.meta(key))
                .ok_or_else(|| not_found(key))
        })
    }
}

// ============================================================================
// LocalFsObjectStore - For development
// ============================================================================

/// Marker in temporary file names; such files are never listed
const TEMP_MARKER: &str = ".tmp-";

/// Local filesystem object store.
///
/// Writes go to a temporary sibling first so readers never observe a torn
/// object. `put_if_absent` publishes the temporary file with a hard link,
/// which fails atomically if the target exists.
#[derive(Debug, Clone)]
pub struct LocalFsObjectStore {
    base_path: PathBuf,
    temp_counter: Arc<AtomicU64>,
}

impl LocalFsObjectStore {
    pub fn new(base_path: PathBuf) -> Self {
        LocalFsObjectStore {
            base_path,
            temp_counter: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn full_path(&self, key: &str) -> PathBuf {
        self.base_path.join(key)
    }

    fn temp_path(&self, path: &Path) -> PathBuf {
        let n = self.temp_counter.fetch_add(1, Ordering::Relaxed);
        let mut name = path.as_os_str().to_owned();
        name.push(format!("{}{}-{}", TEMP_MARKER, std::process::id(), n));
        PathBuf::from(name)
    }

    async fn write_temp(&self, path: &Path, data: &[u8]) -> IoResult<PathBuf> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let temp = self.temp_path(path);
        tokio::fs::write(&temp, data).await?;
        Ok(temp)
    }

    fn meta_from(key: String, metadata: &std::fs::Metadata) -> ObjectMeta {
        let created_at_ms = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        ObjectMeta {
            key,
            size_bytes: metadata.len(),
            created_at_ms,
            etag: None,
        }
    }

    /// Recursively collect objects under `dir`, skipping temporary files.
    fn walk(base: &Path, dir: &Path, prefix: &str, out: &mut Vec<ObjectMeta>) -> IoResult<()> {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            let metadata = entry.metadata()?;
            if metadata.is_dir() {
                Self::walk(base, &path, prefix, out)?;
                continue;
            }
            let Ok(relative) = path.strip_prefix(base) else {
                continue;
            };
            let key = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if key.contains(TEMP_MARKER) || !key.starts_with(prefix) {
                continue;
            }
            out.push(Self::meta_from(key, &metadata));
        }
        Ok(())
    }
}

impl ObjectStore for LocalFsObjectStore {
    fn put<'a>(&'a self, key: &'a str, data: &'a [u8]) -> BoxFuture<'a, IoResult<()>> {
        Box::pin(async move {
            let path = self.full_path(key);
            let temp = self.write_temp(&path, data).await?;
            if let Err(e) = tokio::fs::rename(&temp, &path).await {
                let _ = tokio::fs::remove_file(&temp).await;
                return Err(e);
            }
            Ok(())
        })
    }

    fn put_if_absent<'a>(&'a self, key: &'a str, data: &'a [u8]) -> BoxFuture<'a, IoResult<()>> {
        Box::pin(async move {
            let path = self.full_path(key);
            let temp = self.write_temp(&path, data).await?;
            let linked = tokio::fs::hard_link(&temp, &path).await;
            let _ = tokio::fs::remove_file(&temp).await;
            match linked {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(already_exists(key)),
                Err(e) => Err(e),
            }
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, IoResult<Vec<u8>>> {
        Box::pin(async move {
            match tokio::fs::read(self.full_path(key)).await {
                Err(e) if e.kind() == ErrorKind::NotFound => Err(not_found(key)),
                other => other,
            }
        })
    }

    fn exists<'a>(&'a self, key: &'a str) -> BoxFuture<'a, IoResult<bool>> {
        Box::pin(async move {
            match tokio::fs::metadata(self.full_path(key)).await {
                Ok(_) => Ok(true),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
                Err(e) => Err(e),
            }
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, IoResult<()>> {
        Box::pin(async move {
            match tokio::fs::remove_file(self.full_path(key)).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e),
            }
        })
    }

    fn list<'a>(
        &'a self,
        prefix: &'a str,
        continuation_token: Option<&'a str>,
    ) -> BoxFuture<'a, IoResult<ListResult>> {
        Box::pin(async move {
            let base = self.base_path.clone();
            let owned_prefix = prefix.to_string();
            // Walk from the deepest directory the prefix names.
            let start_dir = match owned_prefix.rfind('/') {
                Some(idx) => base.join(&owned_prefix[..idx]),
                None => base.clone(),
            };
            let mut objects = tokio::task::spawn_blocking(move || {
                let mut out = Vec::new();
                Self::walk(&base, &start_dir, &owned_prefix, &mut out).map(|_| out)
            })
            .await
            .map_err(|e| IoError::new(ErrorKind::Other, e))??;

            objects.sort_by(|a, b| a.key.cmp(&b.key));
            if let Some(after) = continuation_token {
                objects.retain(|m| m.key.as_str() > after);
            }
            let continuation_token = if objects.len() > LIST_PAGE_SIZE {
                objects.truncate(LIST_PAGE_SIZE);
                objects.last().map(|m| m.key.clone())
            } else {
                None
            };
            Ok(ListResult {
                objects,
                continuation_token,
            })
        })
    }

    fn head<'a>(&'a self, key: &'a str) -> BoxFuture<'a, IoResult<ObjectMeta>> {
        Box::pin(async move {
            match tokio::fs::metadata(self.full_path(key)).await {
                Ok(metadata) => Ok(Self::meta_from(key.to_string(), &metadata)),
                Err(e) if e.kind() == ErrorKind::NotFound => Err(not_found(key)),
                Err(e) => Err(e),
            }
        })
    }
}
