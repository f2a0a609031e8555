use crate::commands::resolve_snapshot;
use crate::context::Context;
use anyhow::Result;
use clap::Args;
use coffre_core::Snapshot;
use std::sync::Arc;

#[derive(Args)]
pub struct DiffCommand {
    #[arg(help = "Older snapshot")]
    before: String,

    #[arg(help = "Newer snapshot")]
    after: String,
}

impl DiffCommand {
    pub async fn run(&self, ctx: &Context) -> Result<()> {
        let repository = ctx.open_repository().await?;

        let before_uuid = resolve_snapshot(&repository, &self.before).await?;
        let after_uuid = resolve_snapshot(&repository, &self.after).await?;
        let before = Snapshot::load(Arc::clone(&repository), before_uuid).await?;
        let after = Snapshot::load(Arc::clone(&repository), after_uuid).await?;

        for (pathname, checksum) in &before.index.pathnames {
            match after.index.pathnames.get(pathname) {
                None => println!("- {}", pathname),
                Some(other) if other != checksum => println!("M {}", pathname),
                Some(_) => {}
            }
        }
        for pathname in after.index.pathnames.keys() {
            if !before.index.pathnames.contains_key(pathname) {
                println!("+ {}", pathname);
            }
        }

        repository.close().await?;
        Ok(())
    }
}
