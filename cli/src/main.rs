mod commands;
mod context;
mod workdir;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{
    cat::CatCommand, create::CreateCommand, diff::DiffCommand, keep::KeepCommand, ls::LsCommand,
    pull::PullCommand, purge::PurgeCommand, push::PushCommand, server::ServerCommand,
    sync::SyncCommand,
};
use context::Context;
use std::path::PathBuf;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(
    name = "coffre",
    about = "Content-addressed, deduplicating, encrypted snapshot backups"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long, env = "COFFRE_WORKDIR", help = "Work directory", global = true)]
    workdir: Option<PathBuf>,

    #[arg(
        long,
        short = 'r',
        env = "COFFRE_REPO",
        help = "Repository location (path or URL)",
        global = true
    )]
    repo: Option<String>,

    #[arg(
        long,
        env = "COFFRE_PASSPHRASE",
        help = "Keypair passphrase (prompted when omitted)",
        global = true
    )]
    passphrase: Option<String>,

    #[arg(long, help = "Disable the snapshot cache", global = true)]
    no_cache: bool,

    #[arg(short, long, help = "Enable verbose output", global = true)]
    verbose: bool,

    #[arg(long, help = "Enable trace output", global = true)]
    trace: bool,

    #[arg(short, long, help = "Enable quiet mode", global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Initialize the workdir and generate a keypair")]
    Init,

    #[command(about = "Create a new repository")]
    Create(CreateCommand),

    #[command(about = "Create a snapshot of one or more paths")]
    Push(PushCommand),

    #[command(about = "Restore snapshots into a directory")]
    Pull(PullCommand),

    #[command(about = "List snapshots, or the contents of one")]
    Ls(LsCommand),

    #[command(about = "Write one file of a snapshot to stdout")]
    Cat(CatCommand),

    #[command(about = "Compare two snapshots")]
    Diff(DiffCommand),

    #[command(about = "Replicate snapshots into another repository")]
    Sync(SyncCommand),

    #[command(about = "Keep the N most recent snapshots, purge the rest")]
    Keep(KeepCommand),

    #[command(about = "Remove snapshots")]
    Purge(PurgeCommand),

    #[command(about = "Serve repositories over TCP")]
    Server(ServerCommand),

    #[command(about = "Serve one session over stdin/stdout")]
    Stdio,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.verbose, cli.trace, cli.quiet);

    let ctx = Context::new(
        cli.workdir.clone(),
        cli.repo.clone(),
        cli.no_cache,
        cli.passphrase.clone(),
    )?;

    match cli.command {
        Commands::Init => commands::init::run(&ctx),
        Commands::Create(ref cmd) => cmd.run(&ctx).await,
        Commands::Push(ref cmd) => cmd.run(&ctx).await,
        Commands::Pull(ref cmd) => cmd.run(&ctx).await,
        Commands::Ls(ref cmd) => cmd.run(&ctx).await,
        Commands::Cat(ref cmd) => cmd.run(&ctx).await,
        Commands::Diff(ref cmd) => cmd.run(&ctx).await,
        Commands::Sync(ref cmd) => cmd.run(&ctx).await,
        Commands::Keep(ref cmd) => cmd.run(&ctx).await,
        Commands::Purge(ref cmd) => cmd.run(&ctx).await,
        Commands::Server(ref cmd) => cmd.run(&ctx).await,
        Commands::Stdio => commands::stdio::run(&ctx).await,
    }
}

fn init_tracing(verbose: bool, trace: bool, quiet: bool) {
    let level = if quiet {
        "warn"
    } else if trace {
        "trace"
    } else if verbose {
        "debug"
    } else {
        "info"
    };

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::new(format!(
            "coffre_cli={0},coffre_core={0},coffre_backends={0}",
            level
        )))
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");
}
