use crate::context::Context;
use anyhow::{anyhow, Result};
use clap::Args;
use coffre_core::chunker::Chunker;
use coffre_core::index::FileInfo;
use coffre_core::{Checksum, Chunk, Object, SnapshotBuilder};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info};
use walkdir::WalkDir;

#[derive(Args)]
pub struct PushCommand {
    #[arg(help = "Paths to snapshot (defaults to the current directory)")]
    paths: Vec<PathBuf>,
}

#[derive(Default)]
struct Scan {
    directories: Vec<(String, FileInfo)>,
    files: Vec<(String, FileInfo)>,
    symlinks: Vec<(String, String)>,
    non_regular: Vec<(String, FileInfo)>,
}

impl PushCommand {
    pub async fn run(&self, ctx: &Context) -> Result<()> {
        let repository = ctx.open_repository().await?;
        let snapshot = Arc::new(SnapshotBuilder::new(Arc::clone(&repository)).await?);

        let mut roots = Vec::new();
        if self.paths.is_empty() {
            roots.push(std::env::current_dir()?);
        } else {
            for path in &self.paths {
                roots.push(path.canonicalize()?);
            }
        }

        for root in &roots {
            snapshot
                .index
                .record_scanned_directory(root.to_string_lossy().into_owned());
        }

        let scan = {
            let roots = roots.clone();
            tokio::task::spawn_blocking(move || scan(&roots)).await??
        };
        debug!(
            files = scan.files.len(),
            directories = scan.directories.len(),
            "scan complete"
        );

        for (pathname, info) in scan.directories {
            snapshot.index.record_directory(pathname, info);
        }
        for (pathname, target) in scan.symlinks {
            snapshot.index.record_symlink(pathname, target);
        }
        for (pathname, info) in scan.non_regular {
            snapshot.index.record_non_regular(pathname, info);
        }

        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let semaphore = Arc::new(Semaphore::new(workers));
        let chunker = Arc::new(Chunker::default());

        let mut tasks = JoinSet::new();
        for (pathname, info) in scan.files {
            let snapshot = Arc::clone(&snapshot);
            let semaphore = Arc::clone(&semaphore);
            let chunker = Arc::clone(&chunker);
            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| anyhow!("worker pool closed"))?;
                store_file(&snapshot, &chunker, &pathname, info).await
            });
        }
        while let Some(joined) = tasks.join_next().await {
            joined??;
        }

        let snapshot =
            Arc::into_inner(snapshot).ok_or_else(|| anyhow!("snapshot still in use"))?;
        let metadata = snapshot.commit().await?;

        info!(
            chunks = metadata.statistics.chunks,
            objects = metadata.statistics.objects,
            files = metadata.statistics.files,
            "created snapshot"
        );
        println!("{}", metadata.uuid);

        repository.close().await?;
        Ok(())
    }
}

async fn store_file(
    snapshot: &SnapshotBuilder,
    chunker: &Chunker,
    pathname: &str,
    info: FileInfo,
) -> Result<()> {
    let data = tokio::fs::read(pathname).await?;
    let file_chunks = chunker.chunk_data(&data);

    // Chunks already claimed by a concurrent worker in this snapshot are
    // someone else's to reference and store.
    let mut object_chunks = Vec::with_capacity(file_chunks.len());
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
        let keys: Vec<Checksum> = fresh.iter().map(|chunk| chunk.checksum).collect();
        let exists = snapshot.reference_chunks(&keys).await?;
        for (chunk, exists) in fresh.iter().zip(exists) {
            if !exists {
                snapshot.put_chunk(chunk.checksum, &chunk.data).await?;
            }
        }
    }

    let content_type = mime_guess::from_path(pathname)
        .first_raw()
        .unwrap_or("application/octet-stream")
        .to_string();

    let object = Object::new(object_chunks, content_type.clone());
    if snapshot.index.add_object(object.clone()) {
        let exists = snapshot.reference_objects(&[object.checksum]).await?;
        if !exists[0] {
            snapshot.put_object(&object).await?;
        }
    }
    snapshot.index.set_pathname(pathname, object.checksum);
    snapshot.index.record_file(pathname, info);

    let extension = Path::new(pathname)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_string();
    snapshot
        .metadata
        .lock()
        .unwrap()
        .statistics
        .record_file(&content_type, &extension);

    Ok(())
}

fn scan(roots: &[PathBuf]) -> Result<Scan> {
    use std::os::unix::fs::MetadataExt;

    let mut scan = Scan::default();
    for root in roots {
        for entry in WalkDir::new(root).follow_links(false) {
            let entry = entry?;
            let metadata = entry.metadata()?;
            let pathname = entry.path().to_string_lossy().into_owned();

            let info = FileInfo {
                name: entry.file_name().to_string_lossy().into_owned(),
                size: metadata.len(),
                mode: metadata.mode(),
                mod_time: metadata.modified().ok().map(Into::into),
                dev: metadata.dev(),
                ino: metadata.ino(),
                uid: metadata.uid(),
                gid: metadata.gid(),
            };

            let file_type = entry.file_type();
            if file_type.is_dir() {
                scan.directories.push((pathname, info));
            } else if file_type.is_symlink() {
                let target = std::fs::read_link(entry.path())?;
                scan.symlinks
                    .push((pathname, target.to_string_lossy().into_owned()));
            } else if file_type.is_file() {
                scan.files.push((pathname, info));
            } else {
                scan.non_regular.push((pathname, info));
            }
        }
    }
    Ok(scan)
}
