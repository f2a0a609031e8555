use crate::cache::Cache;
use crate::crypto::{Keypair, Secret};
use crate::pipeline::Pipeline;
use crate::types::Checksum;
use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// On-disk format version; `open` fails with `VersionMismatch` on anything
/// else.
pub const VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Compression {
    #[serde(rename = "")]
    #[default]
    None,
    #[serde(rename = "gzip")]
    Gzip,
}

/// Immutable repository-wide configuration, written once at create time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    pub version: u32,
    pub uuid: Uuid,
    pub compression: Compression,
    /// UUID of the master secret when encryption is enabled, empty string
    /// otherwise.
    #[serde(default)]
    pub encryption: String,
}

impl RepositoryConfig {
    pub fn new(compression: Compression, secret_uuid: Option<Uuid>) -> Self {
        Self {
            version: VERSION,
            uuid: Uuid::new_v4(),
            compression,
            encryption: secret_uuid.map(|u| u.to_string()).unwrap_or_default(),
        }
    }

    pub fn encrypted(&self) -> bool {
        !self.encryption.is_empty()
    }
}

/// A staging area accumulating one snapshot's blobs and references until
/// the atomic commit publishes them.
#[async_trait]
pub trait Transaction: Send + Sync {
    fn uuid(&self) -> Uuid;

    /// Mark pre-existing chunks as referenced by this transaction. Returns,
    /// per key, whether the canonical chunk already existed; a `false`
    /// obliges the caller to `put_chunk` that checksum before commit.
    async fn reference_chunks(&self, keys: &[Checksum]) -> Result<Vec<bool>>;

    async fn reference_objects(&self, keys: &[Checksum]) -> Result<Vec<bool>>;

    async fn put_chunk(&self, checksum: Checksum, data: Bytes) -> Result<()>;

    async fn put_object(&self, checksum: Checksum, data: Bytes) -> Result<()>;

    async fn put_index(&self, data: Bytes) -> Result<()>;

    async fn put_metadata(&self, data: Bytes) -> Result<()>;

    /// Atomically publish the staged snapshot.
    async fn commit(&self) -> Result<()>;
}

/// Narrow interface every concrete backend implements. Blob payloads are
/// opaque envelopes; the backend never sees plaintext.
#[async_trait]
pub trait Backend: Send + Sync {
    fn configuration(&self) -> RepositoryConfig;

    async fn transaction(&self) -> Result<Arc<dyn Transaction>>;

    async fn get_indexes(&self) -> Result<Vec<Uuid>>;
    async fn get_chunks(&self) -> Result<Vec<Checksum>>;
    async fn get_objects(&self) -> Result<Vec<Checksum>>;

    async fn get_metadata(&self, uuid: Uuid) -> Result<Bytes>;
    async fn get_index(&self, uuid: Uuid) -> Result<Bytes>;
    async fn get_chunk(&self, checksum: Checksum) -> Result<Bytes>;
    async fn get_object(&self, checksum: Checksum) -> Result<Bytes>;

    async fn check_chunk(&self, checksum: Checksum) -> Result<bool>;
    async fn check_object(&self, checksum: Checksum) -> Result<bool>;
    async fn get_chunk_size(&self, checksum: Checksum) -> Result<u64>;
    async fn get_object_size(&self, checksum: Checksum) -> Result<u64>;
    async fn get_chunk_ref_count(&self, checksum: Checksum) -> Result<u64>;
    async fn get_object_ref_count(&self, checksum: Checksum) -> Result<u64>;

    async fn purge(&self, uuid: Uuid) -> Result<()>;

    async fn close(&self) -> Result<()>;

    fn as_any(&self) -> &dyn std::any::Any;
}

/// An open repository: a backend plus the client-side state threaded
/// through every operation (secret, cache, provenance).
pub struct Repository {
    backend: Box<dyn Backend>,
    secret: Option<Secret>,
    keypair: Option<Keypair>,
    cache: Option<Cache>,
    username: String,
    hostname: String,
    command_line: String,
    machine_id: String,
}

impl Repository {
    pub fn new(backend: Box<dyn Backend>) -> Self {
        Self {
            backend,
            secret: None,
            keypair: None,
            cache: None,
            username: String::new(),
            hostname: String::new(),
            command_line: String::new(),
            machine_id: String::new(),
        }
    }

    pub fn configuration(&self) -> RepositoryConfig {
        self.backend.configuration()
    }

    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    pub fn set_secret(&mut self, secret: Option<Secret>) {
        self.secret = secret;
    }

    pub fn secret(&self) -> Option<&Secret> {
        self.secret.as_ref()
    }

    pub fn set_keypair(&mut self, keypair: Option<Keypair>) {
        self.keypair = keypair;
    }

    pub fn keypair(&self) -> Option<&Keypair> {
        self.keypair.as_ref()
    }

    pub fn set_cache(&mut self, cache: Option<Cache>) {
        self.cache = cache;
    }

    pub fn cache(&self) -> Option<&Cache> {
        self.cache.as_ref()
    }

    pub fn set_username(&mut self, username: impl Into<String>) {
        self.username = username.into();
    }

    pub fn set_hostname(&mut self, hostname: impl Into<String>) {
        self.hostname = hostname.into();
    }

    pub fn set_command_line(&mut self, command_line: impl Into<String>) {
        self.command_line = command_line.into();
    }

    pub fn set_machine_id(&mut self, machine_id: impl Into<String>) {
        self.machine_id = machine_id.into();
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn command_line(&self) -> &str {
        &self.command_line
    }

    pub fn machine_id(&self) -> &str {
        &self.machine_id
    }

    /// The envelope codec for this repository; the only place the
    /// compression and encryption choices are consulted.
    pub fn pipeline(&self) -> Pipeline {
        Pipeline::new(&self.configuration(), self.secret.clone())
    }

    pub async fn transaction(&self) -> Result<Arc<dyn Transaction>> {
        self.backend.transaction().await
    }

    pub async fn get_indexes(&self) -> Result<Vec<Uuid>> {
        self.backend.get_indexes().await
    }

    pub async fn get_chunks(&self) -> Result<Vec<Checksum>> {
        self.backend.get_chunks().await
    }

    pub async fn get_objects(&self) -> Result<Vec<Checksum>> {
        self.backend.get_objects().await
    }

    pub async fn get_metadata(&self, uuid: Uuid) -> Result<Bytes> {
        self.backend.get_metadata(uuid).await
    }

    pub async fn get_index(&self, uuid: Uuid) -> Result<Bytes> {
        self.backend.get_index(uuid).await
    }

    pub async fn get_chunk(&self, checksum: Checksum) -> Result<Bytes> {
        self.backend.get_chunk(checksum).await
    }

    pub async fn get_object(&self, checksum: Checksum) -> Result<Bytes> {
        self.backend.get_object(checksum).await
    }

    pub async fn check_chunk(&self, checksum: Checksum) -> Result<bool> {
        self.backend.check_chunk(checksum).await
    }

    pub async fn check_object(&self, checksum: Checksum) -> Result<bool> {
        self.backend.check_object(checksum).await
    }

    pub async fn get_chunk_ref_count(&self, checksum: Checksum) -> Result<u64> {
        self.backend.get_chunk_ref_count(checksum).await
    }

    pub async fn get_object_ref_count(&self, checksum: Checksum) -> Result<u64> {
        self.backend.get_object_ref_count(checksum).await
    }

    pub async fn purge(&self, uuid: Uuid) -> Result<()> {
        tracing::trace!(%uuid, "purge");
        self.backend.purge(uuid).await
    }

    pub async fn close(&self) -> Result<()> {
        self.backend.close().await
    }
}
