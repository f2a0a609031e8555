use crate::context::Context;
use anyhow::Result;
use clap::Args;
use coffre_core::crypto::Secret;
use coffre_core::storage::{Compression, RepositoryConfig};
use tracing::info;

#[derive(Args)]
pub struct CreateCommand {
    #[arg(help = "Repository locations (defaults to the configured repository)")]
    locations: Vec<String>,

    #[arg(long, help = "Disable transparent encryption")]
    no_encryption: bool,

    #[arg(long, help = "Disable transparent compression")]
    no_compression: bool,
}

impl CreateCommand {
    pub async fn run(&self, ctx: &Context) -> Result<()> {
        let compression = if self.no_compression {
            Compression::None
        } else {
            Compression::Gzip
        };

        let secret_uuid = if self.no_encryption {
            None
        } else {
            let workdir = ctx.workdir()?;
            let keypair = ctx.unlock_keypair(&workdir)?;

            let secret = Secret::generate();
            workdir.save_secret(secret.uuid, &secret.seal(&keypair)?)?;
            info!(uuid = %secret.uuid, "generated master secret");
            Some(secret.uuid)
        };

        let locations: Vec<&str> = if self.locations.is_empty() {
            vec![ctx.repository.as_str()]
        } else {
            self.locations.iter().map(String::as_str).collect()
        };

        for location in locations {
            let config = RepositoryConfig::new(compression, secret_uuid);
            let repository = coffre_backends::create(location, config).await?;
            println!("created repository {}", location);
            repository.close().await?;
        }

        Ok(())
    }
}
