use crate::index::{Index, IndexBuilder};
use crate::metadata::Metadata;
use crate::pipeline::Pipeline;
use crate::storage::{Repository, Transaction};
use crate::types::{Checksum, Object};
use crate::{Error, Result};
use bytes::Bytes;
use std::sync::{Arc, Mutex};
use tracing::trace;
use uuid::Uuid;

/// A committed snapshot loaded for reading: its metadata, its index, and
/// the repository handle needed to fetch content.
pub struct Snapshot {
    repository: Arc<Repository>,
    pub metadata: Metadata,
    pub index: Index,
}

impl Snapshot {
    pub async fn load(repository: Arc<Repository>, uuid: Uuid) -> Result<Self> {
        let metadata = fetch_metadata(&repository, uuid).await?;
        let (index, checksum) = fetch_index(&repository, uuid).await?;

        if checksum != metadata.checksum {
            return Err(Error::Corrupt(format!(
                "snapshot {}: index mismatches metadata checksum",
                uuid
            )));
        }

        Ok(Self {
            repository,
            metadata,
            index,
        })
    }

    pub async fn list(repository: &Repository) -> Result<Vec<Uuid>> {
        repository.get_indexes().await
    }

    pub fn uuid(&self) -> Uuid {
        self.metadata.uuid
    }

    /// Fetch and unseal one chunk, verifying its content address. Wrong
    /// bytes are never returned: tamper surfaces as `AuthFailed` on an
    /// encrypted repository, `Corrupt` otherwise.
    pub async fn get_chunk(&self, checksum: Checksum) -> Result<Vec<u8>> {
        trace!(snapshot = %self.uuid(), chunk = %checksum, "get_chunk");
        let envelope = self.repository.get_chunk(checksum).await?;
        let data = self.repository.pipeline().unseal(&envelope)?;
        if Checksum::from_data(&data) != checksum {
            return Err(Error::Corrupt(format!(
                "chunk {} fails checksum verification",
                checksum
            )));
        }
        Ok(data)
    }

    pub async fn get_object(&self, checksum: Checksum) -> Result<Object> {
        trace!(snapshot = %self.uuid(), object = %checksum, "get_object");
        let envelope = self.repository.get_object(checksum).await?;
        let data = self.repository.pipeline().unseal(&envelope)?;
        Object::from_bytes(&data)
    }

    pub async fn check_chunk(&self, checksum: Checksum) -> Result<bool> {
        self.repository.check_chunk(checksum).await
    }

    pub async fn check_object(&self, checksum: Checksum) -> Result<bool> {
        self.repository.check_object(checksum).await
    }

    /// Reassemble one file's plaintext from its object's ordered chunks.
    pub async fn read_file(&self, pathname: &str) -> Result<Vec<u8>> {
        let object = self
            .index
            .lookup_pathname(pathname)
            .ok_or_else(|| Error::not_found("pathname", pathname))?
            .clone();
        let mut contents = Vec::new();
        for chunk in &object.chunks {
            contents.extend_from_slice(&self.get_chunk(*chunk).await?);
        }
        Ok(contents)
    }
}

/// A snapshot under construction: one open transaction, a concurrent index
/// builder, and metadata accumulating statistics. `commit` seals the index
/// and metadata through the pipeline and atomically publishes.
pub struct SnapshotBuilder {
    repository: Arc<Repository>,
    transaction: Arc<dyn Transaction>,
    pipeline: Pipeline,
    pub metadata: Mutex<Metadata>,
    pub index: IndexBuilder,
}

impl SnapshotBuilder {
    pub async fn new(repository: Arc<Repository>) -> Result<Self> {
        let transaction = repository.transaction().await?;

        let mut metadata = Metadata::new(transaction.uuid());
        metadata.hostname = repository.hostname().to_string();
        metadata.username = repository.username().to_string();
        metadata.command_line = repository.command_line().to_string();
        metadata.machine_id = repository.machine_id().to_string();
        if let Some(keypair) = repository.keypair() {
            metadata.public_key = keypair.public_key_base64();
        }

        trace!(snapshot = %metadata.uuid, "new");
        let pipeline = repository.pipeline();
        Ok(Self {
            repository,
            transaction,
            pipeline,
            metadata: Mutex::new(metadata),
            index: IndexBuilder::new(),
        })
    }

    pub fn uuid(&self) -> Uuid {
        self.transaction.uuid()
    }

    pub async fn put_chunk(&self, checksum: Checksum, data: &[u8]) -> Result<()> {
        trace!(snapshot = %self.uuid(), chunk = %checksum, "put_chunk");
        let envelope = self.pipeline.seal(data)?;
        self.transaction
            .put_chunk(checksum, Bytes::from(envelope))
            .await
    }

    pub async fn put_object(&self, object: &Object) -> Result<()> {
        trace!(snapshot = %self.uuid(), object = %object.checksum, "put_object");
        let envelope = self.pipeline.seal(&object.to_bytes()?)?;
        self.transaction
            .put_object(object.checksum, Bytes::from(envelope))
            .await
    }

    pub async fn reference_chunks(&self, keys: &[Checksum]) -> Result<Vec<bool>> {
        trace!(snapshot = %self.uuid(), keys = keys.len(), "reference_chunks");
        self.transaction.reference_chunks(keys).await
    }

    pub async fn reference_objects(&self, keys: &[Checksum]) -> Result<Vec<bool>> {
        trace!(snapshot = %self.uuid(), keys = keys.len(), "reference_objects");
        self.transaction.reference_objects(keys).await
    }

    /// Seal and publish: serialize the index, bind its checksum into the
    /// metadata, stage both envelopes, then atomically commit. The fresh
    /// envelopes are mirrored into the client cache on the way out.
    pub async fn commit(self) -> Result<Metadata> {
        let index = self.index.freeze();
        let serialized_index = index.to_bytes()?;

        let mut metadata = self.metadata.into_inner().unwrap();
        metadata.checksum = Checksum::from_data(&serialized_index);
        metadata.index_size = serialized_index.len() as u64;
        metadata.statistics.chunks = index.chunks.len() as u64;
        metadata.statistics.objects = index.objects.len() as u64;
        metadata.statistics.files = index.filesystem.files.len() as u64;
        metadata.statistics.directories = index.filesystem.directories.len() as u64;
        metadata.statistics.compute_percentages();
        let serialized_metadata = metadata.to_bytes()?;

        let metadata_envelope = self.pipeline.seal(&serialized_metadata)?;
        let index_envelope = self.pipeline.seal(&serialized_index)?;

        self.transaction
            .put_metadata(Bytes::from(metadata_envelope.clone()))
            .await?;
        self.transaction
            .put_index(Bytes::from(index_envelope.clone()))
            .await?;

        trace!(snapshot = %metadata.uuid, "commit");
        self.transaction.commit().await?;

        if let Some(cache) = self.repository.cache() {
            let repository_uuid = self.repository.configuration().uuid;
            cache
                .put_metadata(repository_uuid, metadata.uuid, &metadata_envelope)
                .await
                .ok();
            cache
                .put_index(repository_uuid, metadata.uuid, &index_envelope)
                .await
                .ok();
        }

        Ok(metadata)
    }
}

/// Fetch a snapshot's metadata, preferring the client cache; a miss is
/// filled back with the envelope exactly as the backend returned it.
pub async fn fetch_metadata(repository: &Repository, uuid: Uuid) -> Result<Metadata> {
    let repository_uuid = repository.configuration().uuid;

    let mut cache_miss = false;
    let envelope = match repository.cache() {
        Some(cache) => match cache.get_metadata(repository_uuid, uuid).await {
            Ok(data) => data,
            Err(_) => {
                cache_miss = true;
                trace!(snapshot = %uuid, "metadata cache miss");
                repository.get_metadata(uuid).await?.to_vec()
            }
        },
        None => repository.get_metadata(uuid).await?.to_vec(),
    };

    let plaintext = repository.pipeline().unseal(&envelope)?;
    let metadata = Metadata::from_bytes(&plaintext)?;

    if cache_miss {
        if let Some(cache) = repository.cache() {
            cache
                .put_metadata(repository_uuid, metadata.uuid, &envelope)
                .await
                .ok();
        }
    }

    Ok(metadata)
}

/// Fetch a snapshot's index; returns the decoded index and the SHA-256 of
/// its plaintext for verification against the metadata.
pub async fn fetch_index(repository: &Repository, uuid: Uuid) -> Result<(Index, Checksum)> {
    let repository_uuid = repository.configuration().uuid;

    let mut cache_miss = false;
    let envelope = match repository.cache() {
        Some(cache) => match cache.get_index(repository_uuid, uuid).await {
            Ok(data) => data,
            Err(_) => {
                cache_miss = true;
                trace!(snapshot = %uuid, "index cache miss");
                repository.get_index(uuid).await?.to_vec()
            }
        },
        None => repository.get_index(uuid).await?.to_vec(),
    };

    let plaintext = repository.pipeline().unseal(&envelope)?;
    let index = Index::from_bytes(&plaintext)?;
    let checksum = Checksum::from_data(&plaintext);

    if cache_miss {
        if let Some(cache) = repository.cache() {
            cache.put_index(repository_uuid, uuid, &envelope).await.ok();
        }
    }

    Ok((index, checksum))
}
