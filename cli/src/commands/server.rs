use crate::context::Context;
use anyhow::Result;
use clap::Args;
use coffre_backends::protocol::DEFAULT_PORT;
use std::path::PathBuf;
use tokio::net::TcpListener;

#[derive(Args)]
pub struct ServerCommand {
    #[arg(long, help = "Address to listen on")]
    listen: Option<String>,

    #[arg(long, help = "Resolve requested repository paths under this directory")]
    basedir: Option<PathBuf>,
}

impl ServerCommand {
    pub async fn run(&self, _ctx: &Context) -> Result<()> {
        let addr = self
            .listen
            .clone()
            .unwrap_or_else(|| format!("0.0.0.0:{}", DEFAULT_PORT));
        let listener = TcpListener::bind(&addr).await?;
        coffre_backends::server::serve(listener, self.basedir.clone()).await?;
        Ok(())
    }
}
