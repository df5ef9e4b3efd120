use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use maelstrom_node::{cli::Cli, dispatch::Registry, engine::Engine};

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    // stdout carries the protocol, so logs go to stderr.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let registry = Registry::with_defaults();
    info!(handlers = ?registry.tags(), "starting node");

    let engine = Engine::new(registry, cli.engine_config());
    match engine.run(tokio::io::stdin(), tokio::io::stdout()).await {
        Ok(summary) => {
            info!(?summary, "node exiting");
            Ok(())
        }
        Err(err) => {
            error!(error = %err, "node failed");
            eprintln!("Error: {err}");
            // A blocked stdin read would keep the runtime from shutting down.
            std::process::exit(1);
        }
    }
}
