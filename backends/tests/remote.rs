use coffre_backends::remote::RemoteBackend;
use coffre_backends::server;
use coffre_core::storage::Compression;
use coffre_core::{
    Backend, Checksum, Error, Repository, RepositoryConfig, Snapshot, SnapshotBuilder,
};
use std::sync::Arc;

/// Wire a client backend to an in-process server over a duplex pipe, the
/// same handler that serves TCP and stdio sessions.
fn loopback() -> (RemoteBackend, tokio::task::JoinHandle<()>) {
    let (client_side, server_side) = tokio::io::duplex(1024 * 1024);
    let (server_reader, server_writer) = tokio::io::split(server_side);
    let server = tokio::spawn(server::handle_connection(
        server_reader,
        server_writer,
        Arc::new(None),
    ));
    let (client_reader, client_writer) = tokio::io::split(client_side);
    (
        RemoteBackend::from_transport(client_reader, client_writer),
        server,
    )
}

#[tokio::test]
async fn create_commit_and_read_over_rpc() {
    let dir = tempfile::tempdir().unwrap();
    let (backend, _server) = loopback();

    let config = RepositoryConfig::new(Compression::None, None);
    backend
        .create_path(dir.path().join("repo").to_str().unwrap(), config.clone())
        .await
        .unwrap();
    assert_eq!(backend.configuration().uuid, config.uuid);

    let tx = backend.transaction().await.unwrap();
    let uuid = tx.uuid();

    let checksum = Checksum::from_data(b"remote chunk");
    let exists = tx.reference_chunks(&[checksum]).await.unwrap();
    assert_eq!(exists, vec![false]);
    tx.put_chunk(checksum, bytes::Bytes::from_static(b"remote chunk"))
        .await
        .unwrap();
    tx.put_metadata(bytes::Bytes::from_static(b"metadata"))
        .await
        .unwrap();
    tx.put_index(bytes::Bytes::from_static(b"index"))
        .await
        .unwrap();
    tx.commit().await.unwrap();

    assert_eq!(backend.get_indexes().await.unwrap(), vec![uuid]);
    assert_eq!(backend.get_chunks().await.unwrap(), vec![checksum]);
    assert_eq!(
        backend.get_chunk(checksum).await.unwrap(),
        &b"remote chunk"[..]
    );
    assert!(backend.check_chunk(checksum).await.unwrap());
    assert_eq!(
        backend.get_chunk_size(checksum).await.unwrap(),
        b"remote chunk".len() as u64
    );
    assert_eq!(backend.get_chunk_ref_count(checksum).await.unwrap(), 1);
    assert_eq!(backend.get_metadata(uuid).await.unwrap(), &b"metadata"[..]);

    backend.close().await.unwrap();
}

#[tokio::test]
async fn open_missing_repository_reports_error() {
    let dir = tempfile::tempdir().unwrap();
    let (backend, _server) = loopback();

    let err = backend
        .open_path(dir.path().join("absent").to_str().unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Backend(_)));
}

#[tokio::test]
async fn concurrent_requests_multiplex_one_connection() {
    let dir = tempfile::tempdir().unwrap();
    let (backend, _server) = loopback();

    backend
        .create_path(
            dir.path().join("repo").to_str().unwrap(),
            RepositoryConfig::new(Compression::None, None),
        )
        .await
        .unwrap();

    let tx = backend.transaction().await.unwrap();
    let mut handles = Vec::new();
    for i in 0..32u32 {
        let tx = Arc::clone(&tx);
        handles.push(tokio::spawn(async move {
            let data = i.to_be_bytes().repeat(100);
            let checksum = Checksum::from_data(&data);
            tx.put_chunk(checksum, data.into()).await.unwrap();
            checksum
        }));
    }
    let mut expected = Vec::new();
    for handle in handles {
        expected.push(handle.await.unwrap());
    }
    tx.put_metadata(bytes::Bytes::from_static(b"m")).await.unwrap();
    tx.put_index(bytes::Bytes::from_static(b"i")).await.unwrap();
    tx.commit().await.unwrap();

    let mut chunks = backend.get_chunks().await.unwrap();
    chunks.sort();
    expected.sort();
    assert_eq!(chunks, expected);
}

#[tokio::test]
async fn dead_transport_fails_requests() {
    let (backend, server) = loopback();
    server.abort();
    let _ = server.await;

    // The reader task notices the closed pipe and every call from then on
    // reports the transport gone.
    let mut saw_closed = false;
    for _ in 0..10 {
        match backend.get_chunks().await {
            Err(Error::TransportClosed) => {
                saw_closed = true;
                break;
            }
            _ => tokio::time::sleep(std::time::Duration::from_millis(10)).await,
        }
    }
    assert!(saw_closed);
}

#[tokio::test]
async fn snapshot_lifecycle_through_remote_repository() {
    let dir = tempfile::tempdir().unwrap();
    let (backend, _server) = loopback();

    let secret = coffre_core::crypto::Secret::generate();
    let config = RepositoryConfig::new(Compression::Gzip, Some(secret.uuid));
    backend
        .create_path(dir.path().join("repo").to_str().unwrap(), config)
        .await
        .unwrap();

    let mut repository = Repository::new(Box::new(backend));
    repository.set_secret(Some(secret));
    let repository = Arc::new(repository);

    let snapshot = SnapshotBuilder::new(Arc::clone(&repository)).await.unwrap();
    let data = b"over the wire".to_vec();
    let checksum = Checksum::from_data(&data);
    snapshot.index.add_chunk(coffre_core::Chunk {
        checksum,
        start: 0,
        length: data.len() as u32,
    });
    let exists = snapshot.reference_chunks(&[checksum]).await.unwrap();
    assert_eq!(exists, vec![false]);
    snapshot.put_chunk(checksum, &data).await.unwrap();

    let object = coffre_core::Object::new(vec![checksum], "text/plain".to_string());
    snapshot.index.add_object(object.clone());
    snapshot.put_object(&object).await.unwrap();
    snapshot.index.set_pathname("/wire.txt", object.checksum);
    snapshot.index.record_file(
        "/wire.txt",
        coffre_core::index::FileInfo {
            name: "wire.txt".into(),
            size: data.len() as u64,
            ..Default::default()
        },
    );

    let uuid = snapshot.commit().await.unwrap().uuid;

    let loaded = Snapshot::load(Arc::clone(&repository), uuid).await.unwrap();
    assert_eq!(loaded.read_file("/wire.txt").await.unwrap(), data);
}
