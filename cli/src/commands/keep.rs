use crate::context::Context;
use anyhow::Result;
use clap::Args;
use coffre_core::snapshot;
use coffre_core::Snapshot;
use tracing::info;

#[derive(Args)]
pub struct KeepCommand {
    #[arg(help = "Number of recent snapshots to keep")]
    count: usize,
}

impl KeepCommand {
    pub async fn run(&self, ctx: &Context) -> Result<()> {
        let repository = ctx.open_repository().await?;

        let mut snapshots = Vec::new();
        for uuid in Snapshot::list(&repository).await? {
            snapshots.push(snapshot::fetch_metadata(&repository, uuid).await?);
        }

        if snapshots.len() > self.count {
            snapshots.sort_by_key(|metadata| metadata.creation_time);
            let doomed = snapshots.len() - self.count;
            for metadata in &snapshots[..doomed] {
                info!(uuid = %metadata.uuid, "purging");
                repository.purge(metadata.uuid).await?;
            }
            println!("purged {} snapshots", doomed);
        }

        repository.close().await?;
        Ok(())
    }
}
