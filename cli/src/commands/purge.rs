use crate::commands::resolve_snapshot;
use crate::context::Context;
use anyhow::Result;
use clap::Args;
use coffre_core::Snapshot;
use tracing::info;

#[derive(Args)]
pub struct PurgeCommand {
    #[arg(help = "Snapshots to remove; every snapshot when omitted")]
    snapshots: Vec<String>,
}

impl PurgeCommand {
    pub async fn run(&self, ctx: &Context) -> Result<()> {
        let repository = ctx.open_repository().await?;

        let uuids = if self.snapshots.is_empty() {
            Snapshot::list(&repository).await?
        } else {
            let mut uuids = Vec::new();
            for id in &self.snapshots {
                uuids.push(resolve_snapshot(&repository, id).await?);
            }
            uuids
        };

        for uuid in uuids {
            info!(%uuid, "purging");
            repository.purge(uuid).await?;
        }

        repository.close().await?;
        Ok(())
    }
}
