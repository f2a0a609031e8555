use async_trait::async_trait;
use bytes::Bytes;
use coffre_core::{Backend, Checksum, Error, RepositoryConfig, Result, Transaction, VERSION};
use std::collections::HashSet;
use std::io::ErrorKind;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::fs;
use tokio::sync::Semaphore;
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Local filesystem backend. Canonical blobs live under 256-way sharded
/// bucket directories; reference counting piggybacks on hard-link counts;
/// snapshot publication is a single atomic directory rename.
pub struct LocalBackend {
    inner: Arc<Inner>,
}

struct Inner {
    root: PathBuf,
    config: RepositoryConfig,
    dirty: AtomicBool,
}

fn uuid_bucket(uuid: Uuid) -> String {
    uuid.to_string()[0..2].to_string()
}

impl Inner {
    fn path_chunks(&self) -> PathBuf {
        self.root.join("chunks")
    }

    fn path_objects(&self) -> PathBuf {
        self.root.join("objects")
    }

    fn path_transactions(&self) -> PathBuf {
        self.root.join("transactions")
    }

    fn path_snapshots(&self) -> PathBuf {
        self.root.join("snapshots")
    }

    fn path_purge(&self) -> PathBuf {
        self.root.join("purge")
    }

    fn path_chunk_bucket(&self, checksum: Checksum) -> PathBuf {
        self.path_chunks().join(checksum.bucket())
    }

    fn path_chunk(&self, checksum: Checksum) -> PathBuf {
        self.path_chunk_bucket(checksum).join(checksum.to_hex())
    }

    fn path_object_bucket(&self, checksum: Checksum) -> PathBuf {
        self.path_objects().join(checksum.bucket())
    }

    fn path_object(&self, checksum: Checksum) -> PathBuf {
        self.path_object_bucket(checksum).join(checksum.to_hex())
    }

    fn path_snapshot(&self, uuid: Uuid) -> PathBuf {
        self.path_snapshots()
            .join(uuid_bucket(uuid))
            .join(uuid.to_string())
    }

    fn path_transaction(&self, uuid: Uuid) -> PathBuf {
        self.path_transactions()
            .join(uuid_bucket(uuid))
            .join(uuid.to_string())
    }

    /// Write data to a temp file in the canonical bucket, optionally hard
    /// link it into a transaction, then atomically rename it into place.
    /// The rename is idempotent under same-checksum races.
    async fn put_blob(&self, canonical: &Path, data: &[u8], link: Option<&Path>) -> Result<()> {
        let bucket = canonical.parent().ok_or_else(|| {
            Error::Backend(format!("blob path has no bucket: {}", canonical.display()))
        })?;
        let tmp = bucket.join(format!(
            "{}.{}",
            canonical
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            Uuid::new_v4()
        ));

        fs::write(&tmp, data).await?;
        if let Some(link) = link {
            if let Err(e) = fs::hard_link(&tmp, link).await {
                fs::remove_file(&tmp).await.ok();
                return Err(e.into());
            }
        }
        fs::rename(&tmp, canonical).await?;
        Ok(())
    }

    async fn list_bucketed<T, F>(&self, dir: PathBuf, parse: F) -> Result<Vec<T>>
    where
        F: Fn(&str) -> Option<T>,
    {
        let mut out = Vec::new();
        let mut buckets = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        while let Some(bucket) = buckets.next_entry().await? {
            if !bucket.file_type().await?.is_dir() {
                continue;
            }
            let mut entries = fs::read_dir(bucket.path()).await?;
            while let Some(entry) = entries.next_entry().await? {
                if let Some(parsed) = entry.file_name().to_str().and_then(&parse) {
                    out.push(parsed);
                }
            }
        }
        Ok(out)
    }

    async fn stat_blob(&self, path: &Path, kind: &'static str, id: String) -> Result<std::fs::Metadata> {
        match fs::metadata(path).await {
            Ok(metadata) => Ok(metadata),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(Error::NotFound { kind, id }),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_blob(&self, path: &Path, kind: &'static str, id: String) -> Result<Bytes> {
        match fs::read(path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(Error::NotFound { kind, id }),
            Err(e) => Err(e.into()),
        }
    }

    /// Sweep canonical blobs whose link count dropped to one (no snapshot
    /// references them anymore), after clearing any staging directory left
    /// behind by a crashed transaction. Only safe while no transaction is
    /// active. One worker per logical core plus one.
    async fn tidy(&self) -> Result<()> {
        let mut buckets = fs::read_dir(self.path_transactions()).await?;
        while let Some(bucket) = buckets.next_entry().await? {
            if !bucket.file_type().await?.is_dir() {
                continue;
            }
            let mut entries = fs::read_dir(bucket.path()).await?;
            while let Some(entry) = entries.next_entry().await? {
                trace!(path = %entry.path().display(), "tidy: removing stale transaction");
                fs::remove_dir_all(entry.path()).await.ok();
            }
        }

        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            + 1;
        let semaphore = Arc::new(Semaphore::new(workers));

        for dir in [self.path_objects(), self.path_chunks()] {
            let mut tasks = tokio::task::JoinSet::new();
            let mut buckets = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(bucket) = buckets.next_entry().await? {
                if !bucket.file_type().await?.is_dir() {
                    continue;
                }
                let semaphore = Arc::clone(&semaphore);
                let bucket_path = bucket.path();
                tasks.spawn(async move {
                    let _permit = semaphore.acquire().await;
                    let mut entries = fs::read_dir(&bucket_path).await?;
                    while let Some(entry) = entries.next_entry().await? {
                        let metadata = entry.metadata().await?;
                        if metadata.is_file() && metadata.nlink() == 1 {
                            trace!(path = %entry.path().display(), "tidy: reclaiming");
                            fs::remove_file(entry.path()).await.ok();
                        }
                    }
                    Ok::<(), Error>(())
                });
            }
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!("tidy worker failed: {}", e),
                    Err(e) => warn!("tidy worker panicked: {}", e),
                }
            }
        }
        Ok(())
    }
}

impl LocalBackend {
    /// Create a repository at `location`: the bucket tree plus the
    /// compressed CONFIG record.
    pub async fn create(location: impl AsRef<Path>, config: RepositoryConfig) -> Result<Self> {
        let root = location.as_ref().to_path_buf();

        if fs::try_exists(root.join("CONFIG")).await? {
            return Err(Error::AlreadyExists {
                path: root.display().to_string(),
            });
        }

        fs::create_dir_all(&root).await?;
        for top in ["chunks", "objects", "transactions", "snapshots", "purge"] {
            fs::create_dir_all(root.join(top)).await?;
        }
        for i in 0..256u16 {
            let bucket = format!("{:02x}", i);
            for top in ["chunks", "objects", "transactions", "snapshots"] {
                fs::create_dir_all(root.join(top).join(&bucket)).await?;
            }
        }

        let serialized = serde_json::to_vec(&config).map_err(Error::from)?;
        fs::write(root.join("CONFIG"), coffre_core::compress::deflate(&serialized)).await?;

        debug!(root = %root.display(), uuid = %config.uuid, "created repository");
        Ok(Self {
            inner: Arc::new(Inner {
                root,
                config,
                dirty: AtomicBool::new(false),
            }),
        })
    }

    pub async fn open(location: impl AsRef<Path>) -> Result<Self> {
        let root = location.as_ref().to_path_buf();

        let compressed = match fs::read(root.join("CONFIG")).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Error::not_found("repository", root.display()))
            }
            Err(e) => return Err(e.into()),
        };
        let serialized = coffre_core::compress::inflate(&compressed)?;
        let config: RepositoryConfig = serde_json::from_slice(&serialized)
            .map_err(|e| Error::Corrupt(format!("malformed CONFIG: {}", e)))?;

        if config.version != VERSION {
            return Err(Error::VersionMismatch {
                version: config.version,
            });
        }

        Ok(Self {
            inner: Arc::new(Inner {
                root,
                config,
                dirty: AtomicBool::new(false),
            }),
        })
    }

    /// Repository-level chunk write, used by the sync engine: the payload
    /// is an envelope copied verbatim from another repository.
    pub async fn put_chunk(&self, checksum: Checksum, data: &[u8]) -> Result<()> {
        self.inner
            .put_blob(&self.inner.path_chunk(checksum), data, None)
            .await
    }

    pub async fn put_object(&self, checksum: Checksum, data: &[u8]) -> Result<()> {
        self.inner
            .put_blob(&self.inner.path_object(checksum), data, None)
            .await
    }

    /// Materialize a snapshot directory directly (sync destination path);
    /// unlike the transactional flow there is no staging rename.
    pub async fn put_snapshot_metadata(&self, uuid: Uuid, data: &[u8]) -> Result<()> {
        let dir = self.inner.path_snapshot(uuid);
        fs::create_dir_all(dir.join("chunks")).await?;
        fs::create_dir_all(dir.join("objects")).await?;
        fs::write(dir.join("METADATA"), data).await?;
        Ok(())
    }

    pub async fn put_snapshot_index(&self, uuid: Uuid, data: &[u8]) -> Result<()> {
        let dir = self.inner.path_snapshot(uuid);
        fs::create_dir_all(dir.join("chunks")).await?;
        fs::create_dir_all(dir.join("objects")).await?;
        fs::write(dir.join("INDEX"), data).await?;
        Ok(())
    }

    /// Re-establish a snapshot's hard link on a canonical chunk so the
    /// reference count reflects the synced snapshot.
    pub async fn reference_snapshot_chunk(&self, uuid: Uuid, checksum: Checksum) -> Result<()> {
        let bucket = self
            .inner
            .path_snapshot(uuid)
            .join("chunks")
            .join(checksum.bucket());
        fs::create_dir_all(&bucket).await?;
        match fs::hard_link(self.inner.path_chunk(checksum), bucket.join(checksum.to_hex())).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(Error::not_found("chunk", checksum))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn reference_snapshot_object(&self, uuid: Uuid, checksum: Checksum) -> Result<()> {
        let bucket = self
            .inner
            .path_snapshot(uuid)
            .join("objects")
            .join(checksum.bucket());
        fs::create_dir_all(&bucket).await?;
        match fs::hard_link(
            self.inner.path_object(checksum),
            bucket.join(checksum.to_hex()),
        )
        .await
        {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(Error::not_found("object", checksum))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Reclaim unreferenced canonical blobs. Safe whenever no transaction
    /// is in flight; idempotent.
    pub async fn tidy(&self) -> Result<()> {
        self.inner.tidy().await
    }
}

#[async_trait]
impl Backend for LocalBackend {
    fn configuration(&self) -> RepositoryConfig {
        self.inner.config.clone()
    }

    async fn transaction(&self) -> Result<Arc<dyn Transaction>> {
        let tx = LocalTransaction::begin(Arc::clone(&self.inner)).await?;
        Ok(Arc::new(tx))
    }

    async fn get_indexes(&self) -> Result<Vec<Uuid>> {
        self.inner
            .list_bucketed(self.inner.path_snapshots(), |name| {
                Uuid::parse_str(name).ok()
            })
            .await
    }

    async fn get_chunks(&self) -> Result<Vec<Checksum>> {
        self.inner
            .list_bucketed(self.inner.path_chunks(), |name| name.parse().ok())
            .await
    }

    async fn get_objects(&self) -> Result<Vec<Checksum>> {
        self.inner
            .list_bucketed(self.inner.path_objects(), |name| name.parse().ok())
            .await
    }

    async fn get_metadata(&self, uuid: Uuid) -> Result<Bytes> {
        let path = self.inner.path_snapshot(uuid).join("METADATA");
        self.inner.read_blob(&path, "snapshot", uuid.to_string()).await
    }

    async fn get_index(&self, uuid: Uuid) -> Result<Bytes> {
        let path = self.inner.path_snapshot(uuid).join("INDEX");
        self.inner.read_blob(&path, "snapshot", uuid.to_string()).await
    }

    async fn get_chunk(&self, checksum: Checksum) -> Result<Bytes> {
        let path = self.inner.path_chunk(checksum);
        self.inner.read_blob(&path, "chunk", checksum.to_hex()).await
    }

    async fn get_object(&self, checksum: Checksum) -> Result<Bytes> {
        let path = self.inner.path_object(checksum);
        self.inner.read_blob(&path, "object", checksum.to_hex()).await
    }

    async fn check_chunk(&self, checksum: Checksum) -> Result<bool> {
        match fs::metadata(self.inner.path_chunk(checksum)).await {
            Ok(metadata) => Ok(metadata.is_file()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn check_object(&self, checksum: Checksum) -> Result<bool> {
        match fs::metadata(self.inner.path_object(checksum)).await {
            Ok(metadata) => Ok(metadata.is_file()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_chunk_size(&self, checksum: Checksum) -> Result<u64> {
        let path = self.inner.path_chunk(checksum);
        let metadata = self.inner.stat_blob(&path, "chunk", checksum.to_hex()).await?;
        Ok(metadata.len())
    }

    async fn get_object_size(&self, checksum: Checksum) -> Result<u64> {
        let path = self.inner.path_object(checksum);
        let metadata = self.inner.stat_blob(&path, "object", checksum.to_hex()).await?;
        Ok(metadata.len())
    }

    async fn get_chunk_ref_count(&self, checksum: Checksum) -> Result<u64> {
        let path = self.inner.path_chunk(checksum);
        let metadata = self.inner.stat_blob(&path, "chunk", checksum.to_hex()).await?;
        Ok(metadata.nlink().saturating_sub(1))
    }

    async fn get_object_ref_count(&self, checksum: Checksum) -> Result<u64> {
        let path = self.inner.path_object(checksum);
        let metadata = self.inner.stat_blob(&path, "object", checksum.to_hex()).await?;
        Ok(metadata.nlink().saturating_sub(1))
    }

    async fn purge(&self, uuid: Uuid) -> Result<()> {
        let source = self.inner.path_snapshot(uuid);
        if !fs::try_exists(&source).await? {
            return Err(Error::not_found("snapshot", uuid));
        }
        let dest = self.inner.path_purge().join(uuid.to_string());
        fs::rename(&source, &dest).await?;
        fs::remove_dir_all(&dest).await?;
        self.inner.dirty.store(true, Ordering::SeqCst);
        debug!(%uuid, "purged snapshot");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.inner.dirty.swap(false, Ordering::SeqCst) {
            self.inner.tidy().await?;
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// A staging directory under `transactions/<xx>/<uuid>`. Blob writes land
/// in the canonical buckets with a hard link back into the staging tree;
/// commit renames the staging directory into the snapshot namespace.
pub struct LocalTransaction {
    uuid: Uuid,
    inner: Arc<Inner>,
    chunk_buckets: Mutex<HashSet<String>>,
    object_buckets: Mutex<HashSet<String>>,
}

impl LocalTransaction {
    async fn begin(inner: Arc<Inner>) -> Result<Self> {
        let uuid = Uuid::new_v4();
        let tx = Self {
            uuid,
            inner,
            chunk_buckets: Mutex::new(HashSet::new()),
            object_buckets: Mutex::new(HashSet::new()),
        };
        let root = tx.path();
        fs::create_dir_all(root.join("chunks")).await?;
        fs::create_dir_all(root.join("objects")).await?;
        trace!(transaction = %uuid, "begin");
        Ok(tx)
    }

    fn path(&self) -> PathBuf {
        self.inner.path_transaction(self.uuid)
    }

    fn path_chunk(&self, checksum: Checksum) -> PathBuf {
        self.path()
            .join("chunks")
            .join(checksum.bucket())
            .join(checksum.to_hex())
    }

    fn path_object(&self, checksum: Checksum) -> PathBuf {
        self.path()
            .join("objects")
            .join(checksum.bucket())
            .join(checksum.to_hex())
    }

    /// First-creation of a staging bucket directory, gated per bucket so
    /// concurrent writers race on at most one mkdir each.
    async fn ensure_bucket(
        &self,
        kind: &str,
        guard: &Mutex<HashSet<String>>,
        bucket: String,
    ) -> Result<()> {
        {
            let mut seen = guard.lock().unwrap();
            if !seen.insert(bucket.clone()) {
                return Ok(());
            }
        }
        fs::create_dir_all(self.path().join(kind).join(bucket)).await?;
        Ok(())
    }

    async fn ensure_chunk_bucket(&self, checksum: Checksum) -> Result<()> {
        self.ensure_bucket("chunks", &self.chunk_buckets, checksum.bucket())
            .await
    }

    async fn ensure_object_bucket(&self, checksum: Checksum) -> Result<()> {
        self.ensure_bucket("objects", &self.object_buckets, checksum.bucket())
            .await
    }
}

#[async_trait]
impl Transaction for LocalTransaction {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    async fn reference_chunks(&self, keys: &[Checksum]) -> Result<Vec<bool>> {
        let mut exists = Vec::with_capacity(keys.len());
        for key in keys {
            self.ensure_chunk_bucket(*key).await?;
            match fs::hard_link(self.inner.path_chunk(*key), self.path_chunk(*key)).await {
                Ok(()) => exists.push(true),
                Err(e) if e.kind() == ErrorKind::NotFound => exists.push(false),
                Err(_) => exists.push(true),
            }
        }
        Ok(exists)
    }

    async fn reference_objects(&self, keys: &[Checksum]) -> Result<Vec<bool>> {
        let mut exists = Vec::with_capacity(keys.len());
        for key in keys {
            self.ensure_object_bucket(*key).await?;
            match fs::hard_link(self.inner.path_object(*key), self.path_object(*key)).await {
                Ok(()) => exists.push(true),
                Err(e) if e.kind() == ErrorKind::NotFound => exists.push(false),
                Err(_) => exists.push(true),
            }
        }
        Ok(exists)
    }

    async fn put_chunk(&self, checksum: Checksum, data: Bytes) -> Result<()> {
        self.ensure_chunk_bucket(checksum).await?;
        self.inner
            .put_blob(
                &self.inner.path_chunk(checksum),
                &data,
                Some(&self.path_chunk(checksum)),
            )
            .await?;
        self.inner.dirty.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn put_object(&self, checksum: Checksum, data: Bytes) -> Result<()> {
        self.ensure_object_bucket(checksum).await?;
        self.inner
            .put_blob(
                &self.inner.path_object(checksum),
                &data,
                Some(&self.path_object(checksum)),
            )
            .await?;
        self.inner.dirty.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn put_index(&self, data: Bytes) -> Result<()> {
        fs::write(self.path().join("INDEX"), &data).await?;
        Ok(())
    }

    async fn put_metadata(&self, data: Bytes) -> Result<()> {
        fs::write(self.path().join("METADATA"), &data).await?;
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        self.inner.dirty.store(false, Ordering::SeqCst);
        fs::rename(self.path(), self.inner.path_snapshot(self.uuid)).await?;
        trace!(transaction = %self.uuid, "committed");
        Ok(())
    }
}
