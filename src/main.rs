//! Armazon CLI — declarative stack provisioning.

use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "armazon",
    version,
    about = "Declarative stack provisioning — template model, intrinsic expressions, dependency-ordered apply with rollback"
)]
struct Cli {
    #[command(subcommand)]
    command: armazon::cli::Commands,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = armazon::cli::dispatch(cli.command).await {
        eprintln!("error: {e}");
        std::process::exit(e.exit_code());
    }
}
