use crate::local::LocalBackend;
use crate::protocol::{self, Message, Packet};
use coffre_core::{Backend, Error, Result, Transaction};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Serve repositories over TCP. Each connection gets its own handler and
/// holds at most one repository open for the connection's lifetime.
pub async fn serve(listener: TcpListener, basedir: Option<PathBuf>) -> Result<()> {
    let basedir = Arc::new(basedir);
    info!(addr = ?listener.local_addr().ok(), "serving");
    loop {
        let (stream, peer) = listener.accept().await?;
        debug!(%peer, "connection accepted");
        let basedir = Arc::clone(&basedir);
        tokio::spawn(async move {
            let (reader, writer) = stream.into_split();
            handle_connection(reader, writer, basedir).await;
            debug!(%peer, "connection closed");
        });
    }
}

/// Serve one session over stdin/stdout, for `stdio://` and SSH clients.
pub async fn serve_stdio(basedir: Option<PathBuf>) -> Result<()> {
    handle_connection(tokio::io::stdin(), tokio::io::stdout(), Arc::new(basedir)).await;
    Ok(())
}

struct Session {
    backend: Mutex<Option<Arc<LocalBackend>>>,
    transactions: Mutex<HashMap<Uuid, Arc<dyn Transaction>>>,
}

impl Session {
    fn backend(&self) -> Result<Arc<LocalBackend>> {
        self.backend
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::Backend("no repository open".to_string()))
    }

    fn transaction(&self, uuid: Uuid) -> Result<Arc<dyn Transaction>> {
        self.transactions
            .lock()
            .unwrap()
            .get(&uuid)
            .cloned()
            .ok_or_else(|| Error::Backend(format!("unknown transaction {}", uuid)))
    }
}

fn resolve(basedir: &Option<PathBuf>, path: &str) -> PathBuf {
    match basedir {
        Some(base) => base.join(path.trim_start_matches('/')),
        None => PathBuf::from(path),
    }
}

/// Decode requests off the stream, dispatching each to its own task so
/// responses may return out of order; a writer task serializes frames.
pub async fn handle_connection<R, W>(mut reader: R, mut writer: W, basedir: Arc<Option<PathBuf>>)
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();

    let writer_task = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            if let Err(e) = protocol::write_message(&mut writer, &message).await {
                warn!("response write failed: {}", e);
                break;
            }
        }
    });

    let session = Arc::new(Session {
        backend: Mutex::new(None),
        transactions: Mutex::new(HashMap::new()),
    });

    loop {
        let message = match protocol::read_message(&mut reader).await {
            Ok(message) => message,
            Err(Error::TransportClosed) => break,
            Err(e) => {
                warn!("request read failed: {}", e);
                break;
            }
        };

        let session = Arc::clone(&session);
        let basedir = Arc::clone(&basedir);
        let out_tx = out_tx.clone();
        tokio::spawn(async move {
            if let Some(packet) = dispatch(&session, &basedir, message.packet).await {
                let _ = out_tx.send(Message {
                    uuid: message.uuid,
                    packet,
                });
            }
        });
    }

    drop(out_tx);
    let _ = writer_task.await;

    let backend = session.backend.lock().unwrap().take();
    if let Some(backend) = backend {
        if let Err(e) = backend.close().await {
            warn!("close on disconnect failed: {}", e);
        }
    }
}

fn fail(result: Result<()>) -> Option<String> {
    result.err().map(|e| e.to_string())
}

async fn dispatch(
    session: &Arc<Session>,
    basedir: &Option<PathBuf>,
    packet: Packet,
) -> Option<Packet> {
    let response = match packet {
        Packet::ReqCreate { path, config } => {
            let resolved = resolve(basedir, &path);
            debug!(path = %resolved.display(), "create");
            match LocalBackend::create(&resolved, config).await {
                Ok(backend) => {
                    *session.backend.lock().unwrap() = Some(Arc::new(backend));
                    Packet::ResCreate { err: None }
                }
                Err(e) => Packet::ResCreate {
                    err: Some(e.to_string()),
                },
            }
        }

        Packet::ReqOpen { path } => {
            let resolved = resolve(basedir, &path);
            debug!(path = %resolved.display(), "open");
            match LocalBackend::open(&resolved).await {
                Ok(backend) => {
                    let config = backend.configuration();
                    *session.backend.lock().unwrap() = Some(Arc::new(backend));
                    Packet::ResOpen {
                        config: Some(config),
                        err: None,
                    }
                }
                Err(e) => Packet::ResOpen {
                    config: None,
                    err: Some(e.to_string()),
                },
            }
        }

        Packet::ReqGetIndexes => match session.backend() {
            Ok(backend) => match backend.get_indexes().await {
                Ok(indexes) => Packet::ResGetIndexes { indexes, err: None },
                Err(e) => Packet::ResGetIndexes {
                    indexes: Vec::new(),
                    err: Some(e.to_string()),
                },
            },
            Err(e) => Packet::ResGetIndexes {
                indexes: Vec::new(),
                err: Some(e.to_string()),
            },
        },

        Packet::ReqGetChunks => match session.backend() {
            Ok(backend) => match backend.get_chunks().await {
                Ok(chunks) => Packet::ResGetChunks { chunks, err: None },
                Err(e) => Packet::ResGetChunks {
                    chunks: Vec::new(),
                    err: Some(e.to_string()),
                },
            },
            Err(e) => Packet::ResGetChunks {
                chunks: Vec::new(),
                err: Some(e.to_string()),
            },
        },

        Packet::ReqGetObjects => match session.backend() {
            Ok(backend) => match backend.get_objects().await {
                Ok(objects) => Packet::ResGetObjects { objects, err: None },
                Err(e) => Packet::ResGetObjects {
                    objects: Vec::new(),
                    err: Some(e.to_string()),
                },
            },
            Err(e) => Packet::ResGetObjects {
                objects: Vec::new(),
                err: Some(e.to_string()),
            },
        },

        Packet::ReqGetMetadata { uuid } => {
            let result = match session.backend() {
                Ok(backend) => backend.get_metadata(uuid).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(data) => Packet::ResGetMetadata {
                    data: data.to_vec(),
                    err: None,
                },
                Err(e) => Packet::ResGetMetadata {
                    data: Vec::new(),
                    err: Some(e.to_string()),
                },
            }
        }

        Packet::ReqGetIndex { uuid } => {
            let result = match session.backend() {
                Ok(backend) => backend.get_index(uuid).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(data) => Packet::ResGetIndex {
                    data: data.to_vec(),
                    err: None,
                },
                Err(e) => Packet::ResGetIndex {
                    data: Vec::new(),
                    err: Some(e.to_string()),
                },
            }
        }

        Packet::ReqGetChunk { checksum } => {
            let result = match session.backend() {
                Ok(backend) => backend.get_chunk(checksum).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(data) => Packet::ResGetChunk {
                    data: data.to_vec(),
                    err: None,
                },
                Err(e) => Packet::ResGetChunk {
                    data: Vec::new(),
                    err: Some(e.to_string()),
                },
            }
        }

        Packet::ReqGetObject { checksum } => {
            let result = match session.backend() {
                Ok(backend) => backend.get_object(checksum).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(data) => Packet::ResGetObject {
                    data: data.to_vec(),
                    err: None,
                },
                Err(e) => Packet::ResGetObject {
                    data: Vec::new(),
                    err: Some(e.to_string()),
                },
            }
        }

        Packet::ReqCheckChunk { checksum } => {
            let result = match session.backend() {
                Ok(backend) => backend.check_chunk(checksum).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(exists) => Packet::ResCheckChunk { exists, err: None },
                Err(e) => Packet::ResCheckChunk {
                    exists: false,
                    err: Some(e.to_string()),
                },
            }
        }

        Packet::ReqCheckObject { checksum } => {
            let result = match session.backend() {
                Ok(backend) => backend.check_object(checksum).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(exists) => Packet::ResCheckObject { exists, err: None },
                Err(e) => Packet::ResCheckObject {
                    exists: false,
                    err: Some(e.to_string()),
                },
            }
        }

        Packet::ReqGetChunkSize { checksum } => {
            let result = match session.backend() {
                Ok(backend) => backend.get_chunk_size(checksum).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(size) => Packet::ResGetChunkSize { size, err: None },
                Err(e) => Packet::ResGetChunkSize {
                    size: 0,
                    err: Some(e.to_string()),
                },
            }
        }

        Packet::ReqGetObjectSize { checksum } => {
            let result = match session.backend() {
                Ok(backend) => backend.get_object_size(checksum).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(size) => Packet::ResGetObjectSize { size, err: None },
                Err(e) => Packet::ResGetObjectSize {
                    size: 0,
                    err: Some(e.to_string()),
                },
            }
        }

        Packet::ReqGetChunkRefCount { checksum } => {
            let result = match session.backend() {
                Ok(backend) => backend.get_chunk_ref_count(checksum).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(ref_count) => Packet::ResGetChunkRefCount {
                    ref_count,
                    err: None,
                },
                Err(e) => Packet::ResGetChunkRefCount {
                    ref_count: 0,
                    err: Some(e.to_string()),
                },
            }
        }

        Packet::ReqGetObjectRefCount { checksum } => {
            let result = match session.backend() {
                Ok(backend) => backend.get_object_ref_count(checksum).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(ref_count) => Packet::ResGetObjectRefCount {
                    ref_count,
                    err: None,
                },
                Err(e) => Packet::ResGetObjectRefCount {
                    ref_count: 0,
                    err: Some(e.to_string()),
                },
            }
        }

        Packet::ReqPurge { uuid } => {
            let result = match session.backend() {
                Ok(backend) => backend.purge(uuid).await,
                Err(e) => Err(e),
            };
            Packet::ResPurge { err: fail(result) }
        }

        Packet::ReqTransaction => match session.backend() {
            Ok(backend) => match backend.transaction().await {
                Ok(tx) => {
                    let uuid = tx.uuid();
                    session.transactions.lock().unwrap().insert(uuid, tx);
                    Packet::ResTransaction { uuid, err: None }
                }
                Err(e) => Packet::ResTransaction {
                    uuid: Uuid::nil(),
                    err: Some(e.to_string()),
                },
            },
            Err(e) => Packet::ResTransaction {
                uuid: Uuid::nil(),
                err: Some(e.to_string()),
            },
        },

        Packet::ReqReferenceChunks { transaction, keys } => {
            let result = match session.transaction(transaction) {
                Ok(tx) => tx.reference_chunks(&keys).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(exists) => Packet::ResReferenceChunks { exists, err: None },
                Err(e) => Packet::ResReferenceChunks {
                    exists: Vec::new(),
                    err: Some(e.to_string()),
                },
            }
        }

        Packet::ReqReferenceObjects { transaction, keys } => {
            let result = match session.transaction(transaction) {
                Ok(tx) => tx.reference_objects(&keys).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(exists) => Packet::ResReferenceObjects { exists, err: None },
                Err(e) => Packet::ResReferenceObjects {
                    exists: Vec::new(),
                    err: Some(e.to_string()),
                },
            }
        }

        Packet::ReqPutChunk {
            transaction,
            checksum,
            data,
        } => {
            let result = match session.transaction(transaction) {
                Ok(tx) => tx.put_chunk(checksum, data.into()).await,
                Err(e) => Err(e),
            };
            Packet::ResPutChunk { err: fail(result) }
        }

        Packet::ReqPutObject {
            transaction,
            checksum,
            data,
        } => {
            let result = match session.transaction(transaction) {
                Ok(tx) => tx.put_object(checksum, data.into()).await,
                Err(e) => Err(e),
            };
            Packet::ResPutObject { err: fail(result) }
        }

        Packet::ReqPutIndex { transaction, data } => {
            let result = match session.transaction(transaction) {
                Ok(tx) => tx.put_index(data.into()).await,
                Err(e) => Err(e),
            };
            Packet::ResPutIndex { err: fail(result) }
        }

        Packet::ReqPutMetadata { transaction, data } => {
            let result = match session.transaction(transaction) {
                Ok(tx) => tx.put_metadata(data.into()).await,
                Err(e) => Err(e),
            };
            Packet::ResPutMetadata { err: fail(result) }
        }

        Packet::ReqCommit { transaction } => {
            let result = match session.transaction(transaction) {
                Ok(tx) => {
                    let result = tx.commit().await;
                    if result.is_ok() {
                        session.transactions.lock().unwrap().remove(&transaction);
                    }
                    result
                }
                Err(e) => Err(e),
            };
            Packet::ResCommit { err: fail(result) }
        }

        Packet::ReqClose => {
            let backend = session.backend.lock().unwrap().take();
            let result = match backend {
                Some(backend) => backend.close().await,
                None => Ok(()),
            };
            Packet::ResClose { err: fail(result) }
        }

        other => {
            warn!("ignoring unhandled packet: {:?}", other);
            return None;
        }
    };

    Some(response)
}
