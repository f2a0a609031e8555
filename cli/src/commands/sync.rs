use crate::context::Context;
use anyhow::Result;
use clap::Args;

#[derive(Args)]
pub struct SyncCommand {
    #[arg(help = "Destination repositories", required = true)]
    destinations: Vec<String>,
}

impl SyncCommand {
    pub async fn run(&self, ctx: &Context) -> Result<()> {
        let source = ctx.open_repository().await?;

        for destination in &self.destinations {
            let dest = ctx.open_repository_at(destination).await?;
            let report = coffre_backends::synchronize(&source, &dest).await?;
            println!(
                "{}: {} chunks, {} objects, {} snapshots",
                destination, report.chunks, report.objects, report.snapshots
            );
            dest.close().await?;
        }

        source.close().await?;
        Ok(())
    }
}
