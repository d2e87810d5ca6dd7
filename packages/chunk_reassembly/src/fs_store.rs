use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::path::{Component, Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::store::{ByteStream, ObjectStore, UploadOptions};

/// Object store that maps keys onto files below a root directory.
///
/// Uploads are written to a sibling temp file and renamed into place, so
/// readers never observe a half-written object.
#[derive(Clone, Debug)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        if key.is_empty() {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        let relative = Path::new(key);
        for component in relative.components() {
            match component {
                Component::Normal(_) => {}
                _ => return Err(StoreError::InvalidKey(key.to_string())),
            }
        }
        Ok(self.root.join(relative))
    }

    async fn write_temp(&self, temp: &Path, mut body: ByteStream) -> Result<u64, StoreError> {
        let mut file = tokio::fs::File::create(temp).await?;
        let mut written = 0u64;
        while let Some(piece) = body.next().await {
            let piece = piece?;
            file.write_all(&piece).await?;
            written += piece.len() as u64;
        }
        file.flush().await?;
        file.sync_all().await?;
        Ok(written)
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn download(&self, key: &str) -> Result<Bytes, StoreError> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(key.to_string()))
            }
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    async fn upload(
        &self,
        key: &str,
        body: ByteStream,
        options: UploadOptions,
    ) -> Result<u64, StoreError> {
        let path = self.path_for(key)?;
        if !options.overwrite && tokio::fs::try_exists(&path).await? {
            return Err(StoreError::AlreadyExists(key.to_string()));
        }

        let parent = path
            .parent()
            .ok_or_else(|| StoreError::InvalidKey(key.to_string()))?;
        tokio::fs::create_dir_all(parent).await?;

        let file_name = path
            .file_name()
            .ok_or_else(|| StoreError::InvalidKey(key.to_string()))?
            .to_string_lossy()
            .to_string();
        let temp = parent.join(format!(".{}.partial-{}", file_name, uuid::Uuid::new_v4()));

        let written = match self.write_temp(&temp, body).await {
            Ok(n) => n,
            Err(e) => {
                if let Err(rm) = tokio::fs::remove_file(&temp).await {
                    warn!("Failed to remove partial upload {}: {}", temp.display(), rm);
                }
                return Err(e);
            }
        };

        if !options.overwrite && tokio::fs::try_exists(&path).await? {
            if let Err(rm) = tokio::fs::remove_file(&temp).await {
                warn!("Failed to remove partial upload {}: {}", temp.display(), rm);
            }
            return Err(StoreError::AlreadyExists(key.to_string()));
        }
        tokio::fs::rename(&temp, &path).await?;

        debug!("Stored {} ({} bytes)", key, written);
        Ok(written)
    }

    async fn delete_many(&self, keys: &[String]) -> Result<(), StoreError> {
        let mut first_error = None;
        for key in keys {
            let path = self.path_for(key)?;
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!("Failed to delete {}: {}", key, e);
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(StoreError::Io(e)),
            None => Ok(()),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let path = self.path_for(key)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (FsObjectStore, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(tmp.path().join("objects")).unwrap();
        (store, tmp)
    }

    #[tokio::test]
    async fn put_creates_nested_directories() {
        let (store, _tmp) = store();
        store
            .put(
                "chunks/s1/chunk_000000",
                Bytes::from_static(b"abc"),
                UploadOptions::default(),
            )
            .await
            .unwrap();
        assert!(store.root().join("chunks/s1/chunk_000000").exists());
        assert_eq!(
            store.download("chunks/s1/chunk_000000").await.unwrap(),
            Bytes::from_static(b"abc")
        );
    }

    #[tokio::test]
    async fn rejects_escaping_keys() {
        let (store, _tmp) = store();
        for key in ["", "../etc/passwd", "/abs", "a/../../b"] {
            let err = store.download(key).await.unwrap_err();
            assert!(matches!(err, StoreError::InvalidKey(_)), "key {:?}", key);
        }
    }

    #[tokio::test]
    async fn missing_object_is_not_found() {
        let (store, _tmp) = store();
        assert!(store.download("nothing").await.unwrap_err().is_not_found());
        assert!(!store.exists("nothing").await.unwrap());
    }

    #[tokio::test]
    async fn failed_body_leaves_no_file_behind() {
        let (store, _tmp) = store();
        let body: ByteStream = futures::stream::iter(vec![
            Ok(Bytes::from_static(b"one")),
            Err(StoreError::Aborted("gone".into())),
        ])
        .boxed();
        assert!(
            store
                .upload("out/video.mp4", body, UploadOptions::overwrite())
                .await
                .is_err()
        );

        assert!(!store.exists("out/video.mp4").await.unwrap());
        let leftovers: Vec<_> = std::fs::read_dir(store.root().join("out"))
            .unwrap()
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn overwrite_replaces_content() {
        let (store, _tmp) = store();
        store
            .put("f", Bytes::from_static(b"old"), UploadOptions::default())
            .await
            .unwrap();
        assert!(matches!(
            store
                .put("f", Bytes::from_static(b"new"), UploadOptions::default())
                .await,
            Err(StoreError::AlreadyExists(_))
        ));
        store
            .put("f", Bytes::from_static(b"new"), UploadOptions::overwrite())
            .await
            .unwrap();
        assert_eq!(store.download("f").await.unwrap(), Bytes::from_static(b"new"));
    }

    #[tokio::test]
    async fn refused_overwrite_removes_its_temp_file() {
        let (store, _tmp) = store();
        store
            .put("keep/f", Bytes::from_static(b"old"), UploadOptions::default())
            .await
            .unwrap();
        assert!(
            store
                .put("keep/f", Bytes::from_static(b"new"), UploadOptions::default())
                .await
                .is_err()
        );

        let names: Vec<String> = std::fs::read_dir(store.root().join("keep"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["f".to_string()]);
        assert_eq!(store.download("keep/f").await.unwrap(), Bytes::from_static(b"old"));
    }

    #[tokio::test]
    async fn delete_many_removes_files() {
        let (store, _tmp) = store();
        for key in ["d/1", "d/2"] {
            store
                .put(key, Bytes::from_static(b"x"), UploadOptions::default())
                .await
                .unwrap();
        }
        store
            .delete_many(&["d/1".into(), "d/2".into(), "d/3".into()])
            .await
            .unwrap();
        assert!(!store.exists("d/1").await.unwrap());
        assert!(!store.exists("d/2").await.unwrap());
    }
}
