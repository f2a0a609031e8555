use crate::{Error, Result};
use std::path::{Path, PathBuf};
use tokio::fs;
use uuid::Uuid;

/// Local persistent cache of snapshot METADATA and INDEX envelopes, keyed
/// by repository UUID and snapshot UUID. Entries are the ciphertext as
/// fetched from the backend, so a lost cache leaks nothing.
#[derive(Debug, Clone)]
pub struct Cache {
    root: PathBuf,
}

impl Cache {
    pub async fn create(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    fn snapshot_dir(&self, repository: Uuid, snapshot: Uuid) -> PathBuf {
        let snapshot = snapshot.to_string();
        self.root
            .join(repository.to_string())
            .join(&snapshot[0..2])
            .join(snapshot)
    }

    pub async fn get_metadata(&self, repository: Uuid, snapshot: Uuid) -> Result<Vec<u8>> {
        self.read(repository, snapshot, "METADATA").await
    }

    pub async fn put_metadata(&self, repository: Uuid, snapshot: Uuid, data: &[u8]) -> Result<()> {
        self.write(repository, snapshot, "METADATA", data).await
    }

    pub async fn get_index(&self, repository: Uuid, snapshot: Uuid) -> Result<Vec<u8>> {
        self.read(repository, snapshot, "INDEX").await
    }

    pub async fn put_index(&self, repository: Uuid, snapshot: Uuid, data: &[u8]) -> Result<()> {
        self.write(repository, snapshot, "INDEX", data).await
    }

    async fn read(&self, repository: Uuid, snapshot: Uuid, name: &str) -> Result<Vec<u8>> {
        let path = self.snapshot_dir(repository, snapshot).join(name);
        match fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::not_found("cache entry", snapshot))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, repository: Uuid, snapshot: Uuid, name: &str, data: &[u8]) -> Result<()> {
        let dir = self.snapshot_dir(repository, snapshot);
        fs::create_dir_all(&dir).await?;
        fs::write(dir.join(name), data).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn roundtrip_and_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::create(dir.path().join("cache")).await.unwrap();

        let repository = Uuid::new_v4();
        let snapshot = Uuid::new_v4();

        assert!(matches!(
            cache.get_metadata(repository, snapshot).await,
            Err(Error::NotFound { .. })
        ));

        cache
            .put_metadata(repository, snapshot, b"envelope-metadata")
            .await
            .unwrap();
        cache
            .put_index(repository, snapshot, b"envelope-index")
            .await
            .unwrap();

        assert_eq!(
            cache.get_metadata(repository, snapshot).await.unwrap(),
            b"envelope-metadata"
        );
        assert_eq!(
            cache.get_index(repository, snapshot).await.unwrap(),
            b"envelope-index"
        );
    }
}
