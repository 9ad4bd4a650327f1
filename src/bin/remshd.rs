use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use remsh::Server;

/// Multi-user remote shell server.
#[derive(Debug, Parser)]
#[clap(name = "remshd")]
struct Cli {
    /// TCP port to listen on.
    port: u16,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?,
        )
        .with_writer(std::io::stderr)
        .try_init();

    let mut server =
        Server::bind(cli.port).with_context(|| format!("cannot listen on port {}", cli.port))?;
    server.run().context("server loop failed")
}
