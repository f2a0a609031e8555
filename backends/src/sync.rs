use crate::local::LocalBackend;
use coffre_core::snapshot;
use coffre_core::{Error, Repository, Result};
use std::collections::HashSet;
use tracing::{debug, info};

/// What a synchronization run copied.
#[derive(Debug, Default, Clone, Copy)]
pub struct SyncReport {
    pub chunks: usize,
    pub objects: usize,
    pub snapshots: usize,
}

/// Copy every chunk, object and snapshot the destination is missing.
/// Payloads travel verbatim as envelopes; only the index is decoded at the
/// destination, to re-walk references. Both repositories must therefore
/// share the same compression choice and encryption secret. The
/// destination must be a local repository.
pub async fn synchronize(source: &Repository, destination: &Repository) -> Result<SyncReport> {
    let local = destination
        .backend()
        .as_any()
        .downcast_ref::<LocalBackend>()
        .ok_or_else(|| {
            Error::Backend("sync destination must be a local repository".to_string())
        })?;

    let source_config = source.configuration();
    let destination_config = destination.configuration();
    if source_config.compression != destination_config.compression
        || source_config.encryption != destination_config.encryption
    {
        return Err(Error::Backend(
            "source and destination must share compression and encryption secret".to_string(),
        ));
    }

    let mut report = SyncReport::default();

    let have_chunks: HashSet<_> = destination.get_chunks().await?.into_iter().collect();
    for checksum in source.get_chunks().await? {
        if have_chunks.contains(&checksum) {
            continue;
        }
        let data = source.get_chunk(checksum).await?;
        local.put_chunk(checksum, &data).await?;
        report.chunks += 1;
    }

    let have_objects: HashSet<_> = destination.get_objects().await?.into_iter().collect();
    for checksum in source.get_objects().await? {
        if have_objects.contains(&checksum) {
            continue;
        }
        let data = source.get_object(checksum).await?;
        local.put_object(checksum, &data).await?;
        report.objects += 1;
    }

    let have_snapshots: HashSet<_> = destination.get_indexes().await?.into_iter().collect();
    for uuid in source.get_indexes().await? {
        if have_snapshots.contains(&uuid) {
            continue;
        }
        debug!(%uuid, "syncing snapshot");

        let metadata = source.get_metadata(uuid).await?;
        local.put_snapshot_metadata(uuid, &metadata).await?;
        let index = source.get_index(uuid).await?;
        local.put_snapshot_index(uuid, &index).await?;

        // Decode through the destination pipeline and re-establish the
        // hard links so reference counts come out right.
        let (index, _) = snapshot::fetch_index(destination, uuid).await?;
        for checksum in index.chunks.keys() {
            local.reference_snapshot_chunk(uuid, *checksum).await?;
        }
        for checksum in index.objects.keys() {
            local.reference_snapshot_object(uuid, *checksum).await?;
        }
        report.snapshots += 1;
    }

    info!(
        chunks = report.chunks,
        objects = report.objects,
        snapshots = report.snapshots,
        "synchronized"
    );
    Ok(report)
}
