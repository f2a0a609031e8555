use crate::context::Context;
use crate::workdir::Workdir;
use anyhow::Result;
use coffre_core::crypto::Keypair;
use tracing::info;

pub fn run(ctx: &Context) -> Result<()> {
    let workdir = Workdir::create(&ctx.workdir_path)?;
    std::fs::create_dir_all(&ctx.cache_path)?;

    let keypair = Keypair::generate();
    let passphrase = ctx.new_passphrase()?;
    workdir.save_keypair(&keypair.seal(passphrase.as_bytes())?)?;

    info!(uuid = %keypair.uuid, "generated keypair");
    println!("initialized workdir at {}", ctx.workdir_path.display());
    Ok(())
}
