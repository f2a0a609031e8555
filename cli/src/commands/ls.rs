use crate::commands::resolve_snapshot;
use crate::context::Context;
use anyhow::Result;
use clap::Args;
use coffre_core::snapshot;
use coffre_core::Snapshot;
use std::sync::Arc;

#[derive(Args)]
pub struct LsCommand {
    #[arg(help = "Snapshot to list; all snapshots when omitted")]
    snapshot: Option<String>,
}

impl LsCommand {
    pub async fn run(&self, ctx: &Context) -> Result<()> {
        let repository = ctx.open_repository().await?;

        match &self.snapshot {
            None => {
                let mut snapshots = Vec::new();
                for uuid in Snapshot::list(&repository).await? {
                    snapshots.push(snapshot::fetch_metadata(&repository, uuid).await?);
                }
                snapshots.sort_by_key(|metadata| metadata.creation_time);

                for metadata in snapshots {
                    println!(
                        "{} {} {}@{} {} files",
                        metadata.creation_time.format("%Y-%m-%d %H:%M:%S %Z"),
                        metadata.uuid,
                        metadata.username,
                        metadata.hostname,
                        metadata.statistics.files,
                    );
                }
            }
            Some(id) => {
                let uuid = resolve_snapshot(&repository, id).await?;
                let snapshot = Snapshot::load(Arc::clone(&repository), uuid).await?;
                for (pathname, checksum) in &snapshot.index.pathnames {
                    println!("{} {}", checksum.short_string(), pathname);
                }
            }
        }

        repository.close().await?;
        Ok(())
    }
}
