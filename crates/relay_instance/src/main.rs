// Relay instance binary entry point.

use std::io::IsTerminal;

use clap::{Parser, Subcommand};
use relay_instance::node::{self, NodeArgs, StoreArgs};

/// CLI entry point wrapper.
#[derive(Parser, Debug)]
#[command(name = "relay-instance")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run an instance node.
    Node(NodeArgs),
    /// Run an in-memory tracking store for development clusters.
    Store(StoreArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Enable ANSI colors only when stdout is a terminal and NO_COLOR is unset.
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,h2=warn,hyper=warn,tokio_postgres=warn".into()),
        )
        .init();

    let args = Args::parse();
    match args.cmd {
        Command::Node(args) => node::run_node(args).await,
        Command::Store(args) => node::run_store(args).await,
    }
}
