//! Gantry CLI: declarative resource-graph reconciler.

use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "gantry",
    version,
    about = "Declarative resource-graph reconciler: plan, then converge, a stack of cloud resources"
)]
struct Cli {
    #[command(subcommand)]
    command: gantry::cli::Commands,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("GANTRY_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    if let Err(e) = gantry::cli::dispatch(cli.command).await {
        eprintln!("error: {}", e);
        std::process::exit(e.exit_code());
    }
}
