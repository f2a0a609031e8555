use crate::protocol::{self, Message, Packet, DEFAULT_PORT};
use async_trait::async_trait;
use bytes::Bytes;
use coffre_core::{Backend, Checksum, Error, RepositoryConfig, Result, Transaction};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

/// Client backend speaking the framed RPC over one logical stream. A
/// dedicated reader task decodes responses and hands each to its waiting
/// caller through a per-request oneshot channel keyed by request UUID, so
/// many callers multiplex the connection without ordering constraints.
pub struct RemoteBackend {
    inner: Arc<Inner>,
}

struct Inner {
    outgoing: mpsc::UnboundedSender<Message>,
    inflight: Mutex<HashMap<Uuid, oneshot::Sender<Packet>>>,
    closed: AtomicBool,
    config: Mutex<Option<RepositoryConfig>>,
}

impl Inner {
    async fn call(&self, packet: Packet) -> Result<Packet> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::TransportClosed);
        }

        let uuid = Uuid::new_v4();
        let (sender, receiver) = oneshot::channel();
        self.inflight.lock().unwrap().insert(uuid, sender);

        if self.outgoing.send(Message { uuid, packet }).is_err()
            || self.closed.load(Ordering::SeqCst)
        {
            self.inflight.lock().unwrap().remove(&uuid);
            return Err(Error::TransportClosed);
        }

        receiver.await.map_err(|_| Error::TransportClosed)
    }

    fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        // Dropping the senders fails every in-flight request.
        self.inflight.lock().unwrap().clear();
    }
}

fn unexpected(packet: Packet) -> Error {
    Error::Backend(format!("unexpected response: {:?}", packet))
}

fn reply<T>(value: T, err: Option<String>) -> Result<T> {
    match err {
        None => Ok(value),
        Some(message) => Err(Error::Backend(message)),
    }
}

impl RemoteBackend {
    /// Open a repository behind `coffre://`, `ssh://` or `stdio://`.
    pub async fn open(location: &Url) -> Result<Self> {
        let backend = Self::connect(location).await?;
        backend.open_path(location.path()).await?;
        Ok(backend)
    }

    pub async fn create(location: &Url, config: RepositoryConfig) -> Result<Self> {
        let backend = Self::connect(location).await?;
        backend.create_path(location.path(), config).await?;
        Ok(backend)
    }

    /// Issue the open request on an already-connected transport.
    pub async fn open_path(&self, path: &str) -> Result<()> {
        match self
            .inner
            .call(Packet::ReqOpen {
                path: path.to_string(),
            })
            .await?
        {
            Packet::ResOpen { config: Some(config), err: None } => {
                *self.inner.config.lock().unwrap() = Some(config);
                Ok(())
            }
            Packet::ResOpen { err: Some(e), .. } => Err(Error::Backend(e)),
            other => Err(unexpected(other)),
        }
    }

    /// Issue the create request on an already-connected transport.
    pub async fn create_path(&self, path: &str, config: RepositoryConfig) -> Result<()> {
        match self
            .inner
            .call(Packet::ReqCreate {
                path: path.to_string(),
                config: config.clone(),
            })
            .await?
        {
            Packet::ResCreate { err: None } => {
                *self.inner.config.lock().unwrap() = Some(config);
                Ok(())
            }
            Packet::ResCreate { err: Some(e) } => Err(Error::Backend(e)),
            other => Err(unexpected(other)),
        }
    }

    async fn connect(location: &Url) -> Result<Self> {
        match location.scheme() {
            "coffre" => {
                let host = location
                    .host_str()
                    .ok_or_else(|| Error::Backend("missing host in location".to_string()))?;
                let port = location.port().unwrap_or(DEFAULT_PORT);
                debug!(host, port, "connecting");
                let stream = TcpStream::connect((host, port)).await?;
                let (reader, writer) = stream.into_split();
                Ok(Self::from_transport(reader, writer))
            }
            "stdio" => {
                let mut child = Command::new("coffre")
                    .args(["--no-cache", "stdio"])
                    .stdin(Stdio::piped())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::inherit())
                    .spawn()?;
                let stdin = child.stdin.take().ok_or_else(|| {
                    Error::Backend("child stdin unavailable".to_string())
                })?;
                let stdout = child.stdout.take().ok_or_else(|| {
                    Error::Backend("child stdout unavailable".to_string())
                })?;
                tokio::spawn(async move {
                    let _ = child.wait().await;
                });
                Ok(Self::from_transport(stdout, stdin))
            }
            "ssh" => {
                let mut target = String::from("ssh://");
                if !location.username().is_empty() {
                    target.push_str(location.username());
                    target.push('@');
                }
                target.push_str(location.host_str().unwrap_or_default());
                if let Some(port) = location.port() {
                    target.push_str(&format!(":{}", port));
                }
                let mut child = Command::new("ssh")
                    .arg(target)
                    .arg("coffre --no-cache stdio")
                    .stdin(Stdio::piped())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::inherit())
                    .spawn()?;
                let stdin = child.stdin.take().ok_or_else(|| {
                    Error::Backend("ssh stdin unavailable".to_string())
                })?;
                let stdout = child.stdout.take().ok_or_else(|| {
                    Error::Backend("ssh stdout unavailable".to_string())
                })?;
                tokio::spawn(async move {
                    let _ = child.wait().await;
                });
                Ok(Self::from_transport(stdout, stdin))
            }
            other => Err(Error::Backend(format!("unsupported protocol: {}", other))),
        }
    }

    /// Wire a backend onto an arbitrary transport: one writer task owns
    /// the sink, one reader task owns the source and fans responses out.
    pub fn from_transport<R, W>(mut reader: R, mut writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Message>();
        let inner = Arc::new(Inner {
            outgoing,
            inflight: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            config: Mutex::new(None),
        });

        // The tasks hold weak handles so dropping the backend drops the
        // outgoing sender, unblocks the writer, and closes the transport.
        let writer_inner = Arc::downgrade(&inner);
        tokio::spawn(async move {
            while let Some(message) = outgoing_rx.recv().await {
                if let Err(e) = protocol::write_message(&mut writer, &message).await {
                    warn!("transport write failed: {}", e);
                    break;
                }
            }
            if let Some(inner) = writer_inner.upgrade() {
                inner.shutdown();
            }
        });

        let reader_inner = Arc::downgrade(&inner);
        tokio::spawn(async move {
            loop {
                match protocol::read_message(&mut reader).await {
                    Ok(message) => {
                        let Some(inner) = reader_inner.upgrade() else {
                            break;
                        };
                        let sender = inner.inflight.lock().unwrap().remove(&message.uuid);
                        match sender {
                            Some(sender) => {
                                let _ = sender.send(message.packet);
                            }
                            None => warn!(uuid = %message.uuid, "response for unknown request"),
                        }
                    }
                    Err(Error::TransportClosed) => break,
                    Err(e) => {
                        warn!("transport read failed: {}", e);
                        break;
                    }
                }
            }
            if let Some(inner) = reader_inner.upgrade() {
                inner.shutdown();
            }
        });

        Self { inner }
    }
}

#[async_trait]
impl Backend for RemoteBackend {
    fn configuration(&self) -> RepositoryConfig {
        self.inner
            .config
            .lock()
            .unwrap()
            .clone()
            .expect("remote backend used before open")
    }

    async fn transaction(&self) -> Result<Arc<dyn Transaction>> {
        match self.inner.call(Packet::ReqTransaction).await? {
            Packet::ResTransaction { uuid, err: None } => Ok(Arc::new(RemoteTransaction {
                uuid,
                inner: Arc::clone(&self.inner),
            })),
            Packet::ResTransaction { err: Some(e), .. } => Err(Error::Backend(e)),
            other => Err(unexpected(other)),
        }
    }

    async fn get_indexes(&self) -> Result<Vec<Uuid>> {
        match self.inner.call(Packet::ReqGetIndexes).await? {
            Packet::ResGetIndexes { indexes, err } => reply(indexes, err),
            other => Err(unexpected(other)),
        }
    }

    async fn get_chunks(&self) -> Result<Vec<Checksum>> {
        match self.inner.call(Packet::ReqGetChunks).await? {
            Packet::ResGetChunks { chunks, err } => reply(chunks, err),
            other => Err(unexpected(other)),
        }
    }

    async fn get_objects(&self) -> Result<Vec<Checksum>> {
        match self.inner.call(Packet::ReqGetObjects).await? {
            Packet::ResGetObjects { objects, err } => reply(objects, err),
            other => Err(unexpected(other)),
        }
    }

    async fn get_metadata(&self, uuid: Uuid) -> Result<Bytes> {
        match self.inner.call(Packet::ReqGetMetadata { uuid }).await? {
            Packet::ResGetMetadata { data, err } => reply(Bytes::from(data), err),
            other => Err(unexpected(other)),
        }
    }

    async fn get_index(&self, uuid: Uuid) -> Result<Bytes> {
        match self.inner.call(Packet::ReqGetIndex { uuid }).await? {
            Packet::ResGetIndex { data, err } => reply(Bytes::from(data), err),
            other => Err(unexpected(other)),
        }
    }

    async fn get_chunk(&self, checksum: Checksum) -> Result<Bytes> {
        match self.inner.call(Packet::ReqGetChunk { checksum }).await? {
            Packet::ResGetChunk { data, err } => reply(Bytes::from(data), err),
            other => Err(unexpected(other)),
        }
    }

    async fn get_object(&self, checksum: Checksum) -> Result<Bytes> {
        match self.inner.call(Packet::ReqGetObject { checksum }).await? {
            Packet::ResGetObject { data, err } => reply(Bytes::from(data), err),
            other => Err(unexpected(other)),
        }
    }

    async fn check_chunk(&self, checksum: Checksum) -> Result<bool> {
        match self.inner.call(Packet::ReqCheckChunk { checksum }).await? {
            Packet::ResCheckChunk { exists, err } => reply(exists, err),
            other => Err(unexpected(other)),
        }
    }

    async fn check_object(&self, checksum: Checksum) -> Result<bool> {
        match self.inner.call(Packet::ReqCheckObject { checksum }).await? {
            Packet::ResCheckObject { exists, err } => reply(exists, err),
            other => Err(unexpected(other)),
        }
    }

    async fn get_chunk_size(&self, checksum: Checksum) -> Result<u64> {
        match self.inner.call(Packet::ReqGetChunkSize { checksum }).await? {
            Packet::ResGetChunkSize { size, err } => reply(size, err),
            other => Err(unexpected(other)),
        }
    }

    async fn get_object_size(&self, checksum: Checksum) -> Result<u64> {
        match self.inner.call(Packet::ReqGetObjectSize { checksum }).await? {
            Packet::ResGetObjectSize { size, err } => reply(size, err),
            other => Err(unexpected(other)),
        }
    }

    async fn get_chunk_ref_count(&self, checksum: Checksum) -> Result<u64> {
        match self
            .inner
            .call(Packet::ReqGetChunkRefCount { checksum })
            .await?
        {
            Packet::ResGetChunkRefCount { ref_count, err } => reply(ref_count, err),
            other => Err(unexpected(other)),
        }
    }

    async fn get_object_ref_count(&self, checksum: Checksum) -> Result<u64> {
        match self
            .inner
            .call(Packet::ReqGetObjectRefCount { checksum })
            .await?
        {
            Packet::ResGetObjectRefCount { ref_count, err } => reply(ref_count, err),
            other => Err(unexpected(other)),
        }
    }

    async fn purge(&self, uuid: Uuid) -> Result<()> {
        match self.inner.call(Packet::ReqPurge { uuid }).await? {
            Packet::ResPurge { err } => reply((), err),
            other => Err(unexpected(other)),
        }
    }

    async fn close(&self) -> Result<()> {
        match self.inner.call(Packet::ReqClose).await? {
            Packet::ResClose { err } => reply((), err),
            other => Err(unexpected(other)),
        }
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Client-side handle on a transaction living in the server process,
/// identified by the UUID from the transaction-create response.
pub struct RemoteTransaction {
    uuid: Uuid,
    inner: Arc<Inner>,
}

#[async_trait]
impl Transaction for RemoteTransaction {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    async fn reference_chunks(&self, keys: &[Checksum]) -> Result<Vec<bool>> {
        match self
            .inner
            .call(Packet::ReqReferenceChunks {
                transaction: self.uuid,
                keys: keys.to_vec(),
            })
            .await?
        {
            Packet::ResReferenceChunks { exists, err } => reply(exists, err),
            other => Err(unexpected(other)),
        }
    }

    async fn reference_objects(&self, keys: &[Checksum]) -> Result<Vec<bool>> {
        match self
            .inner
            .call(Packet::ReqReferenceObjects {
                transaction: self.uuid,
                keys: keys.to_vec(),
            })
            .await?
        {
            Packet::ResReferenceObjects { exists, err } => reply(exists, err),
            other => Err(unexpected(other)),
        }
    }

    async fn put_chunk(&self, checksum: Checksum, data: Bytes) -> Result<()> {
        match self
            .inner
            .call(Packet::ReqPutChunk {
                transaction: self.uuid,
                checksum,
                data: data.to_vec(),
            })
            .await?
        {
            Packet::ResPutChunk { err } => reply((), err),
            other => Err(unexpected(other)),
        }
    }

    async fn put_object(&self, checksum: Checksum, data: Bytes) -> Result<()> {
        match self
            .inner
            .call(Packet::ReqPutObject {
                transaction: self.uuid,
                checksum,
                data: data.to_vec(),
            })
            .await?
        {
            Packet::ResPutObject { err } => reply((), err),
            other => Err(unexpected(other)),
        }
    }

    async fn put_index(&self, data: Bytes) -> Result<()> {
        match self
            .inner
            .call(Packet::ReqPutIndex {
                transaction: self.uuid,
                data: data.to_vec(),
            })
            .await?
        {
            Packet::ResPutIndex { err } => reply((), err),
            other => Err(unexpected(other)),
        }
    }

    async fn put_metadata(&self, data: Bytes) -> Result<()> {
        match self
            .inner
            .call(Packet::ReqPutMetadata {
                transaction: self.uuid,
                data: data.to_vec(),
            })
            .await?
        {
            Packet::ResPutMetadata { err } => reply((), err),
            other => Err(unexpected(other)),
        }
    }

    async fn commit(&self) -> Result<()> {
        match self
            .inner
            .call(Packet::ReqCommit {
                transaction: self.uuid,
            })
            .await?
        {
            Packet::ResCommit { err } => reply((), err),
            other => Err(unexpected(other)),
        }
    }
}
