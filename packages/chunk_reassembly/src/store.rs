use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use futures::stream::BoxStream;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

use crate::error::StoreError;

/// A body handed to [`ObjectStore::upload`]; pulled lazily by the store.
pub type ByteStream = BoxStream<'static, Result<Bytes, StoreError>>;

#[derive(Clone, Debug, Default)]
pub struct UploadOptions {
    /// Replace an existing object instead of failing with `AlreadyExists`.
    pub overwrite: bool,
    pub content_type: Option<String>,
}

impl UploadOptions {
    pub fn overwrite() -> Self {
        Self {
            overwrite: true,
            content_type: None,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

/// Minimal object storage capability the reassembler depends on.
///
/// `upload` must be all-or-nothing: if the body stream yields an error the
/// destination key is left untouched.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn download(&self, key: &str) -> Result<Bytes, StoreError>;

    /// Consume `body` and store it under `key`. Returns the number of bytes written.
    async fn upload(
        &self,
        key: &str,
        body: ByteStream,
        options: UploadOptions,
    ) -> Result<u64, StoreError>;

    /// Delete every key in `keys`. Keys that do not exist are ignored.
    async fn delete_many(&self, keys: &[String]) -> Result<(), StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    async fn put(&self, key: &str, data: Bytes, options: UploadOptions) -> Result<u64, StoreError> {
        let body: ByteStream = futures::stream::once(async move { Ok(data) }).boxed();
        self.upload(key, body, options).await
    }
}

/// Object store backed by a map, for tests and single-process deployments.
#[derive(Debug, Default)]
pub struct InMemoryObjectStore {
    objects: RwLock<BTreeMap<String, Bytes>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn keys(&self) -> Vec<String> {
        self.objects.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn download(&self, key: &str) -> Result<Bytes, StoreError> {
        self.objects
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn upload(
        &self,
        key: &str,
        mut body: ByteStream,
        options: UploadOptions,
    ) -> Result<u64, StoreError> {
        if key.is_empty() {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        if !options.overwrite && self.objects.read().await.contains_key(key) {
            return Err(StoreError::AlreadyExists(key.to_string()));
        }

        // Buffer the whole body first so a failing stream never commits
        let mut buffer = BytesMut::new();
        while let Some(piece) = body.next().await {
            buffer.extend_from_slice(&piece?);
        }

        let size = buffer.len() as u64;
        let mut objects = self.objects.write().await;
        if !options.overwrite && objects.contains_key(key) {
            return Err(StoreError::AlreadyExists(key.to_string()));
        }
        objects.insert(key.to_string(), buffer.freeze());
        Ok(size)
    }

    async fn delete_many(&self, keys: &[String]) -> Result<(), StoreError> {
        let mut objects = self.objects.write().await;
        for key in keys {
            objects.remove(key);
        }
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.objects.read().await.contains_key(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_and_download() {
        let store = InMemoryObjectStore::new();
        store
            .put("a/b", Bytes::from_static(b"hello"), UploadOptions::default())
            .await
            .unwrap();
        assert_eq!(store.download("a/b").await.unwrap(), Bytes::from_static(b"hello"));
        assert!(store.exists("a/b").await.unwrap());
    }

    #[tokio::test]
    async fn download_missing() {
        let store = InMemoryObjectStore::new();
        let err = store.download("nope").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn upload_without_overwrite_rejects_existing() {
        let store = InMemoryObjectStore::new();
        store
            .put("k", Bytes::from_static(b"1"), UploadOptions::default())
            .await
            .unwrap();
        let err = store
            .put("k", Bytes::from_static(b"2"), UploadOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));

        store
            .put("k", Bytes::from_static(b"2"), UploadOptions::overwrite())
            .await
            .unwrap();
        assert_eq!(store.download("k").await.unwrap(), Bytes::from_static(b"2"));
    }

    #[tokio::test]
    async fn failing_body_does_not_commit() {
        let store = InMemoryObjectStore::new();
        let body: ByteStream = futures::stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(StoreError::Aborted("producer gave up".into())),
        ])
        .boxed();

        let err = store
            .upload("dest", body, UploadOptions::overwrite())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Aborted(_)));
        assert!(!store.exists("dest").await.unwrap());
    }

    #[tokio::test]
    async fn delete_many_ignores_missing() {
        let store = InMemoryObjectStore::new();
        store
            .put("x", Bytes::from_static(b"1"), UploadOptions::default())
            .await
            .unwrap();
        store
            .delete_many(&["x".to_string(), "y".to_string()])
            .await
            .unwrap();
        assert!(store.is_empty().await);
    }
}
