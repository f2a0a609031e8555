use coffre_backends::local::LocalBackend;
use coffre_core::chunker::Chunker;
use coffre_core::crypto::Secret;
use coffre_core::index::FileInfo;
use coffre_core::storage::Compression;
use coffre_core::{
    Backend, Checksum, Chunk, Error, Object, Repository, RepositoryConfig, Snapshot,
    SnapshotBuilder,
};
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

async fn make_repository(
    root: &Path,
    compression: Compression,
    secret: Option<Secret>,
) -> Arc<Repository> {
    let config = RepositoryConfig::new(compression, secret.as_ref().map(|s| s.uuid));
    let backend = LocalBackend::create(root, config).await.unwrap();
    let mut repository = Repository::new(Box::new(backend));
    repository.set_secret(secret);
    repository.set_username("tester");
    repository.set_hostname("testhost");
    Arc::new(repository)
}

/// Mirror of the push path: chunk, reference, store misses, record the
/// object and pathname.
async fn store_file(snapshot: &SnapshotBuilder, pathname: &str, data: &[u8]) {
    let chunker = Chunker::new(64 * 1024);
    let file_chunks = chunker.chunk_data(data);

    let mut object_chunks = Vec::new();
    let mut fresh = Vec::new();
    for chunk in &file_chunks {
        object_chunks.push(chunk.checksum);
        if snapshot.index.add_chunk(Chunk {
            checksum: chunk.checksum,
            start: chunk.offset,
            length: chunk.data.len() as u32,
        }) {
            fresh.push(chunk);
        }
    }

    if !fresh.is_empty() {
        let keys: Vec<Checksum> = fresh.iter().map(|c| c.checksum).collect();
        let exists = snapshot.reference_chunks(&keys).await.unwrap();
        for (chunk, exists) in fresh.iter().zip(exists) {
            if !exists {
                snapshot.put_chunk(chunk.checksum, &chunk.data).await.unwrap();
            }
        }
    }

    let object = Object::new(object_chunks, "application/octet-stream".to_string());
    if snapshot.index.add_object(object.clone()) {
        let exists = snapshot.reference_objects(&[object.checksum]).await.unwrap();
        if !exists[0] {
            snapshot.put_object(&object).await.unwrap();
        }
    }
    snapshot.index.set_pathname(pathname, object.checksum);
    snapshot.index.record_file(
        pathname,
        FileInfo {
            name: pathname.rsplit('/').next().unwrap_or(pathname).to_string(),
            size: data.len() as u64,
            mode: 0o644,
            ..Default::default()
        },
    );
    snapshot
        .metadata
        .lock()
        .unwrap()
        .statistics
        .record_file("application/octet-stream", "");
}

async fn push_files(repository: &Arc<Repository>, files: &[(&str, Vec<u8>)]) -> Uuid {
    let snapshot = SnapshotBuilder::new(Arc::clone(repository)).await.unwrap();
    for (pathname, data) in files {
        store_file(&snapshot, pathname, data).await;
    }
    snapshot.commit().await.unwrap().uuid
}

fn corrupt_one_chunk(repo_root: &Path) {
    for bucket in std::fs::read_dir(repo_root.join("chunks")).unwrap() {
        let bucket = bucket.unwrap();
        for entry in std::fs::read_dir(bucket.path()).unwrap() {
            let entry = entry.unwrap();
            let mut data = std::fs::read(entry.path()).unwrap();
            if data.is_empty() {
                continue;
            }
            let mid = data.len() / 2;
            data[mid] ^= 0xff;
            std::fs::write(entry.path(), data).unwrap();
            return;
        }
    }
    panic!("no chunk to corrupt");
}

#[tokio::test]
async fn encrypted_push_pull_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let repository = make_repository(
        &dir.path().join("repo"),
        Compression::Gzip,
        Some(Secret::generate()),
    )
    .await;

    let hello = b"hello".to_vec();
    let zeros = vec![0u8; 1024 * 1024];
    let uuid = push_files(
        &repository,
        &[("/src/a.txt", hello.clone()), ("/src/b.bin", zeros.clone())],
    )
    .await;

    assert_eq!(repository.get_indexes().await.unwrap(), vec![uuid]);
    assert!(!repository.get_chunks().await.unwrap().is_empty());

    let snapshot = Snapshot::load(Arc::clone(&repository), uuid).await.unwrap();
    assert_eq!(snapshot.read_file("/src/a.txt").await.unwrap(), hello);
    assert_eq!(snapshot.read_file("/src/b.bin").await.unwrap(), zeros);
    assert_eq!(snapshot.metadata.statistics.files, 2);
    assert!(snapshot.metadata.statistics.chunks >= 2);
    assert_eq!(snapshot.metadata.username, "tester");

    // The object descriptor fetched from the store matches the index copy.
    let object_checksum = snapshot.index.pathnames["/src/a.txt"];
    assert!(snapshot.check_object(object_checksum).await.unwrap());
    let object = snapshot.get_object(object_checksum).await.unwrap();
    assert_eq!(object.checksum, object_checksum);
    assert_eq!(
        object.chunks,
        snapshot.index.objects[&object_checksum].chunks
    );
    for chunk in &object.chunks {
        assert!(snapshot.check_chunk(*chunk).await.unwrap());
    }
    assert!(!snapshot
        .check_chunk(Checksum::from_data(b"never stored"))
        .await
        .unwrap());
}

#[tokio::test]
async fn pushing_twice_dedups_blobs() {
    let dir = tempfile::tempdir().unwrap();
    let repository = make_repository(
        &dir.path().join("repo"),
        Compression::Gzip,
        Some(Secret::generate()),
    )
    .await;

    let files = [
        ("/data/one", vec![1u8; 300 * 1024]),
        ("/data/two", vec![2u8; 300 * 1024]),
    ];
    let first = push_files(&repository, &files).await;
    let chunks_after_first = repository.get_chunks().await.unwrap().len();
    let objects_after_first = repository.get_objects().await.unwrap().len();

    let second = push_files(&repository, &files).await;
    assert_ne!(first, second);

    let mut indexes = repository.get_indexes().await.unwrap();
    indexes.sort();
    let mut expected = vec![first, second];
    expected.sort();
    assert_eq!(indexes, expected);

    // Identical plaintexts, identical blob population.
    assert_eq!(repository.get_chunks().await.unwrap().len(), chunks_after_first);
    assert_eq!(
        repository.get_objects().await.unwrap().len(),
        objects_after_first
    );

    // Every chunk of a committed snapshot carries the canonical link plus
    // one per referencing snapshot.
    for checksum in repository.get_chunks().await.unwrap() {
        assert_eq!(repository.get_chunk_ref_count(checksum).await.unwrap(), 2);
    }
}

#[tokio::test]
async fn tampered_chunk_fails_auth_on_encrypted_repository() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("repo");
    let repository =
        make_repository(&root, Compression::Gzip, Some(Secret::generate())).await;

    let uuid = push_files(&repository, &[("/f", b"sensitive payload".to_vec())]).await;
    corrupt_one_chunk(&root);

    let snapshot = Snapshot::load(Arc::clone(&repository), uuid).await.unwrap();
    assert!(matches!(
        snapshot.read_file("/f").await,
        Err(Error::AuthFailed)
    ));
}

#[tokio::test]
async fn tampered_chunk_fails_corrupt_on_plaintext_repository() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("repo");
    let repository = make_repository(&root, Compression::None, None).await;

    let uuid = push_files(&repository, &[("/f", vec![7u8; 4096])]).await;
    corrupt_one_chunk(&root);

    let snapshot = Snapshot::load(Arc::clone(&repository), uuid).await.unwrap();
    assert!(matches!(
        snapshot.read_file("/f").await,
        Err(Error::Corrupt(_))
    ));
}

#[tokio::test]
async fn index_checksum_binds_metadata() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("repo");
    let repository = make_repository(&root, Compression::None, None).await;

    let uuid = push_files(&repository, &[("/f", b"bound".to_vec())]).await;

    // Overwrite the published INDEX with a valid but different envelope;
    // the metadata checksum no longer matches.
    let snapshot_dir = root
        .join("snapshots")
        .join(&uuid.to_string()[0..2])
        .join(uuid.to_string());
    let mut index = coffre_core::index::Index::default();
    index
        .filesystem
        .scanned_directories
        .push("/elsewhere".to_string());
    std::fs::write(snapshot_dir.join("INDEX"), index.to_bytes().unwrap()).unwrap();

    assert!(matches!(
        Snapshot::load(Arc::clone(&repository), uuid).await,
        Err(Error::Corrupt(_))
    ));
}

#[tokio::test]
async fn crash_before_commit_leaves_no_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("repo");
    let repository = make_repository(&root, Compression::Gzip, None).await;

    let snapshot = SnapshotBuilder::new(Arc::clone(&repository)).await.unwrap();
    store_file(&snapshot, "/f", b"staged but never committed").await;
    // Simulated crash: the builder is dropped without commit.
    drop(snapshot);

    assert!(repository.get_indexes().await.unwrap().is_empty());
    let staged: Vec<Checksum> = repository.get_chunks().await.unwrap();
    assert!(!staged.is_empty());

    // Reopen and tidy: the orphan staging directory goes away and the
    // canonical chunks are reclaimed.
    let backend = LocalBackend::open(&root).await.unwrap();
    backend.tidy().await.unwrap();
    for checksum in staged {
        assert!(!backend.check_chunk(checksum).await.unwrap());
    }
}

#[tokio::test]
async fn sync_replicates_snapshots_and_references() {
    let dir = tempfile::tempdir().unwrap();
    let secret = Secret::generate();

    let source = make_repository(
        &dir.path().join("source"),
        Compression::Gzip,
        Some(secret.clone()),
    )
    .await;

    // Two snapshots sharing most of their content.
    let shared = vec![5u8; 500 * 1024];
    let u1 = push_files(
        &source,
        &[("/shared", shared.clone()), ("/only-in-one", b"one".to_vec())],
    )
    .await;
    let u2 = push_files(
        &source,
        &[("/shared", shared.clone()), ("/only-in-two", b"two".to_vec())],
    )
    .await;

    let destination = make_repository(
        &dir.path().join("dest"),
        Compression::Gzip,
        Some(secret.clone()),
    )
    .await;

    let report = coffre_backends::synchronize(&source, &destination)
        .await
        .unwrap();
    assert_eq!(report.snapshots, 2);

    let mut source_chunks = source.get_chunks().await.unwrap();
    let mut dest_chunks = destination.get_chunks().await.unwrap();
    source_chunks.sort();
    dest_chunks.sort();
    assert_eq!(source_chunks, dest_chunks);

    let mut dest_indexes = destination.get_indexes().await.unwrap();
    dest_indexes.sort();
    let mut expected = vec![u1, u2];
    expected.sort();
    assert_eq!(dest_indexes, expected);

    // Restoring from the destination reproduces the bytes.
    let snapshot = Snapshot::load(Arc::clone(&destination), u1).await.unwrap();
    assert_eq!(snapshot.read_file("/shared").await.unwrap(), shared);

    // References were rematerialized: chunks survive purging one snapshot
    // but not both.
    for checksum in destination.get_chunks().await.unwrap() {
        assert!(
            destination.get_chunk_ref_count(checksum).await.unwrap() >= 1,
            "chunk {} has no references at destination",
            checksum
        );
    }

    // A second run has nothing to do.
    let report = coffre_backends::synchronize(&source, &destination)
        .await
        .unwrap();
    assert_eq!(report.chunks, 0);
    assert_eq!(report.snapshots, 0);
}

#[tokio::test]
async fn sync_refuses_mismatched_configuration() {
    let dir = tempfile::tempdir().unwrap();
    let source = make_repository(
        &dir.path().join("source"),
        Compression::Gzip,
        Some(Secret::generate()),
    )
    .await;
    let destination = make_repository(&dir.path().join("dest"), Compression::None, None).await;

    assert!(coffre_backends::synchronize(&source, &destination)
        .await
        .is_err());
}

#[tokio::test]
async fn commit_mirrors_envelopes_into_cache() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("repo");
    let secret = Secret::generate();

    let config = RepositoryConfig::new(Compression::Gzip, Some(secret.uuid));
    let backend = LocalBackend::create(&root, config).await.unwrap();
    let mut repository = Repository::new(Box::new(backend));
    repository.set_secret(Some(secret));
    repository.set_cache(Some(
        coffre_core::cache::Cache::create(dir.path().join("cache"))
            .await
            .unwrap(),
    ));
    let repository = Arc::new(repository);

    let uuid = push_files(&repository, &[("/f", b"cached".to_vec())]).await;

    // Remove the published envelopes; the cache alone can satisfy a load.
    let snapshot_dir = root
        .join("snapshots")
        .join(&uuid.to_string()[0..2])
        .join(uuid.to_string());
    std::fs::remove_file(snapshot_dir.join("METADATA")).unwrap();
    std::fs::remove_file(snapshot_dir.join("INDEX")).unwrap();

    let snapshot = Snapshot::load(Arc::clone(&repository), uuid).await.unwrap();
    assert_eq!(snapshot.read_file("/f").await.unwrap(), b"cached");
}
