use crate::context::Context;
use anyhow::Result;

pub async fn run(_ctx: &Context) -> Result<()> {
    coffre_backends::server::serve_stdio(None).await?;
    Ok(())
}
