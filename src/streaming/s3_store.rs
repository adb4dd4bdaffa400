//! S3 Object Store Implementation
//!
//! Production adapter built on the `object_store` crate. Works against AWS S3
//! and S3-compatible services (MinIO, LocalStack) through a custom endpoint.
//!
//! Create-only writes map to `PutMode::Create`, which S3 implements with a
//! conditional `If-None-Match: *` request.

use crate::config::S3Config;
use crate::streaming::object_store::{ListResult, ObjectMeta, ObjectStore, LIST_PAGE_SIZE};
use futures::future::BoxFuture;
use futures::TryStreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore as ObjectStoreTrait, PutMode, PutOptions, PutPayload};
use std::io::{Error as IoError, ErrorKind, Result as IoResult};
use std::sync::Arc;

#[derive(Clone)]
pub struct S3ObjectStore {
    store: Arc<dyn ObjectStoreTrait>,
    prefix: String,
}

impl S3ObjectStore {
    /// Credentials come from `AWS_ACCESS_KEY_ID` / `AWS_SECRET_ACCESS_KEY`.
    pub fn new(config: &S3Config) -> IoResult<Self> {
        let mut builder = AmazonS3Builder::from_env()
            .with_bucket_name(&config.bucket)
            .with_region(&config.region)
            .with_conditional_put(object_store::aws::S3ConditionalPut::ETagMatch);

        if let Some(endpoint) = &config.endpoint {
            builder = builder
                .with_endpoint(endpoint)
                .with_allow_http(endpoint.starts_with("http://"));
        }

        let store = builder.build().map_err(|e| {
            IoError::new(
                ErrorKind::InvalidInput,
                format!("Failed to create S3 store: {}", e),
            )
        })?;

        Ok(S3ObjectStore {
            store: Arc::new(store),
            prefix: config.prefix.trim_matches('/').to_string(),
        })
    }

    /// Wrap any `object_store` backend
    pub fn from_store(store: Arc<dyn ObjectStoreTrait>, prefix: &str) -> Self {
        S3ObjectStore {
            store,
            prefix: prefix.trim_matches('/').to_string(),
        }
    }

    fn full_path(&self, key: &str) -> ObjectPath {
        if self.prefix.is_empty() {
            ObjectPath::from(key)
        } else {
            ObjectPath::from(format!("{}/{}", self.prefix, key))
        }
    }

    fn strip_prefix(&self, path: &ObjectPath) -> String {
        let path = path.to_string();
        if self.prefix.is_empty() {
            return path;
        }
        match path.strip_prefix(&format!("{}/", self.prefix)) {
            Some(stripped) => stripped.to_string(),
            None => path,
        }
    }

    fn to_meta(&self, meta: object_store::ObjectMeta) -> ObjectMeta {
        ObjectMeta {
            key: self.strip_prefix(&meta.location),
            size_bytes: meta.size as u64,
            created_at_ms: u64::try_from(meta.last_modified.timestamp_millis()).unwrap_or(0),
            etag: meta.e_tag,
        }
    }

    fn map_error(err: object_store::Error) -> IoError {
        match &err {
            object_store::Error::NotFound { .. } => IoError::new(ErrorKind::NotFound, err.to_string()),
            object_store::Error::AlreadyExists { .. } | object_store::Error::Precondition { .. } => {
                IoError::new(ErrorKind::AlreadyExists, err.to_string())
            }
            object_store::Error::NotSupported { .. } | object_store::Error::NotImplemented => {
                IoError::new(ErrorKind::Unsupported, err.to_string())
            }
            _ => IoError::new(ErrorKind::Other, err.to_string()),
        }
    }
}

impl std::fmt::Debug for S3ObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3ObjectStore")
            .field("prefix", &self.prefix)
            .finish()
    }
}

impl ObjectStore for S3ObjectStore {
    fn put<'a>(&'a self, key: &'a str, data: &'a [u8]) -> BoxFuture<'a, IoResult<()>> {
        Box::pin(async move {
            let payload = PutPayload::from(bytes::Bytes::copy_from_slice(data));
            self.store
                .put(&self.full_path(key), payload)
                .await
                .map_err(Self::map_error)?;
            Ok(())
        })
    }

    fn put_if_absent<'a>(&'a self, key: &'a str, data: &'a [u8]) -> BoxFuture<'a, IoResult<()>> {
        Box::pin(async move {
            let payload = PutPayload::from(bytes::Bytes::copy_from_slice(data));
            let opts = PutOptions {
                mode: PutMode::Create,
                ..Default::default()
            };
            self.store
                .put_opts(&self.full_path(key), payload, opts)
                .await
                .map_err(Self::map_error)?;
            Ok(())
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, IoResult<Vec<u8>>> {
        Box::pin(async move {
            let result = self
                .store
                .get(&self.full_path(key))
                .await
                .map_err(Self::map_error)?;
            let data = result.bytes().await.map_err(Self::map_error)?;
            Ok(data.to_vec())
        })
    }

    fn exists<'a>(&'a self, key: &'a str) -> BoxFuture<'a, IoResult<bool>> {
        Box::pin(async move {
            match self.store.head(&self.full_path(key)).await {
                Ok(_) => Ok(true),
                Err(object_store::Error::NotFound { .. }) => Ok(false),
                Err(e) => Err(Self::map_error(e)),
            }
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, IoResult<()>> {
        Box::pin(async move {
            match self.store.delete(&self.full_path(key)).await {
                Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
                Err(e) => Err(Self::map_error(e)),
            }
        })
    }

    /// The continuation token is the last key of the previous page.
    fn list<'a>(
        &'a self,
        prefix: &'a str,
        continuation_token: Option<&'a str>,
    ) -> BoxFuture<'a, IoResult<ListResult>> {
        Box::pin(async move {
            let full_prefix = self.full_path(prefix);
            let stream = match continuation_token {
                Some(token) => self
                    .store
                    .list_with_offset(Some(&full_prefix), &self.full_path(token)),
                None => self.store.list(Some(&full_prefix)),
            };
            let mut metas: Vec<object_store::ObjectMeta> =
                stream.try_collect().await.map_err(Self::map_error)?;
            metas.sort_by(|a, b| a.location.cmp(&b.location));

            let more = metas.len() > LIST_PAGE_SIZE;
            metas.truncate(LIST_PAGE_SIZE);
            let objects: Vec<ObjectMeta> = metas.into_iter().map(|m| self.to_meta(m)).collect();
            let continuation_token = if more {
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
            let meta = self
                .store
                .head(&self.full_path(key))
                .await
                .map_err(Self::map_error)?;
            Ok(self.to_meta(meta))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;

    fn store(prefix: &str) -> S3ObjectStore {
        S3ObjectStore::from_store(Arc::new(InMemory::new()), prefix)
    }

    #[test]
    fn test_full_path_with_prefix() {
        let s = store("/vault/");
        assert_eq!(
            s.full_path("c/segments/shard-00001/x.seg").to_string(),
            "vault/c/segments/shard-00001/x.seg"
        );
        assert_eq!(
            s.strip_prefix(&s.full_path("c/manifests/v-1.json")),
            "c/manifests/v-1.json"
        );
    }

    #[test]
    fn test_full_path_without_prefix() {
        let s = store("");
        assert_eq!(s.full_path("a/b").to_string(), "a/b");
    }

    #[tokio::test]
    async fn test_create_only_write() {
        let s = store("vault");
        s.put_if_absent("m/v-1.json", b"one").await.unwrap();
        let err = s.put_if_absent("m/v-1.json", b"two").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
        assert_eq!(s.get("m/v-1.json").await.unwrap(), b"one");
    }

    #[tokio::test]
    async fn test_list_strips_prefix_and_deletes_idempotently() {
        let s = store("vault");
        s.put("c/manifests/shard-00000/v-1.json", b"a").await.unwrap();
        s.put("c/manifests/shard-00000/v-2.json", b"b").await.unwrap();
        s.put("c/manifests/shard-00001/v-1.json", b"c").await.unwrap();

        let listed = s.list_all("c/manifests/shard-00000/").await.unwrap();
        let keys: Vec<_> = listed.iter().map(|m| m.key.as_str()).collect();
        assert_eq!(
            keys,
            vec![
                "c/manifests/shard-00000/v-1.json",
                "c/manifests/shard-00000/v-2.json"
            ]
        );

        s.delete("c/manifests/shard-00000/v-1.json").await.unwrap();
        s.delete("c/manifests/shard-00000/v-1.json").await.unwrap();
        assert!(!s.exists("c/manifests/shard-00000/v-1.json").await.unwrap());
    }
}
