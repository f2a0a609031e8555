use crate::commands::{parse_snapshot_id, resolve_snapshot};
use crate::context::Context;
use anyhow::{anyhow, Result};
use clap::Args;
use coffre_core::Snapshot;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

#[derive(Args)]
pub struct CatCommand {
    #[arg(help = "File to print, as <snapshot>:<path>", required = true)]
    targets: Vec<String>,
}

impl CatCommand {
    pub async fn run(&self, ctx: &Context) -> Result<()> {
        let repository = ctx.open_repository().await?;
        let mut stdout = tokio::io::stdout();

        for target in &self.targets {
            let (id, pathname) = parse_snapshot_id(target);
            let pathname =
                pathname.ok_or_else(|| anyhow!("{}: expected <snapshot>:<path>", target))?;

            let uuid = resolve_snapshot(&repository, id).await?;
            let snapshot = Snapshot::load(Arc::clone(&repository), uuid).await?;

            let object = snapshot
                .index
                .lookup_pathname(pathname)
                .ok_or_else(|| anyhow!("{}: no such file in snapshot {}", pathname, uuid))?
                .clone();
            for chunk in &object.chunks {
                let data = snapshot.get_chunk(*chunk).await?;
                stdout.write_all(&data).await?;
            }
        }

        stdout.flush().await?;
        repository.close().await?;
        Ok(())
    }
}
