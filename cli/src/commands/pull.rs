use crate::commands::{parse_snapshot_id, resolve_snapshot};
use crate::context::Context;
use anyhow::Result;
use clap::Args;
use coffre_core::Snapshot;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Args)]
pub struct PullCommand {
    #[arg(help = "Snapshots to restore, as <id>[:<path-prefix>]", required = true)]
    snapshots: Vec<String>,

    #[arg(long, help = "Base directory where the restore lands")]
    path: Option<PathBuf>,

    #[arg(long, help = "Strip the matched prefix from restored pathnames")]
    rebase: bool,
}

impl PullCommand {
    pub async fn run(&self, ctx: &Context) -> Result<()> {
        let repository = ctx.open_repository().await?;
        let base = match &self.path {
            Some(path) => path.clone(),
            None => std::env::current_dir()?,
        };

        for arg in &self.snapshots {
            let (id, pattern) = parse_snapshot_id(arg);
            let uuid = resolve_snapshot(&repository, id).await?;
            let snapshot = Snapshot::load(Arc::clone(&repository), uuid).await?;
            info!(%uuid, "restoring");
            pull(&snapshot, &base, self.rebase, pattern).await?;
        }

        repository.close().await?;
        Ok(())
    }
}

fn destination(base: &Path, pathname: &str, rebase: bool, pattern: Option<&str>) -> PathBuf {
    let mut relative = pathname;
    if rebase {
        if let Some(pattern) = pattern {
            relative = pathname.strip_prefix(pattern).unwrap_or(pathname);
        }
    }
    base.join(relative.trim_start_matches('/'))
}

fn selected(pathname: &str, pattern: Option<&str>) -> bool {
    pattern.map_or(true, |prefix| pathname.starts_with(prefix))
}

async fn pull(snapshot: &Snapshot, base: &Path, rebase: bool, pattern: Option<&str>) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    // BTreeMap ordering visits parents before their children.
    for (pathname, info) in &snapshot.index.filesystem.directories {
        if !selected(pathname, pattern) {
            continue;
        }
        let dest = destination(base, pathname, rebase, pattern);
        tokio::fs::create_dir_all(&dest).await?;
        tokio::fs::set_permissions(&dest, std::fs::Permissions::from_mode(info.mode)).await?;
    }

    for (pathname, info) in &snapshot.index.filesystem.files {
        if !selected(pathname, pattern) {
            continue;
        }
        let dest = destination(base, pathname, rebase, pattern);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let contents = snapshot.read_file(pathname).await?;
        tokio::fs::write(&dest, contents).await?;
        tokio::fs::set_permissions(&dest, std::fs::Permissions::from_mode(info.mode)).await?;
    }

    for (pathname, target) in &snapshot.index.filesystem.symlinks {
        if !selected(pathname, pattern) {
            continue;
        }
        let dest = destination(base, pathname, rebase, pattern);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if let Err(e) = tokio::fs::symlink(target, &dest).await {
            if e.kind() != std::io::ErrorKind::AlreadyExists {
                return Err(e.into());
            }
            warn!(path = %dest.display(), "symlink already exists");
        }
    }

    Ok(())
}
