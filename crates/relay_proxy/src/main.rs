// Relay proxy binary entry point.

use std::io::IsTerminal;

use clap::Parser;
use relay_proxy::node::{self, ProxyArgs};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Enable ANSI colors only when stdout is a terminal and NO_COLOR is unset.
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,h2=warn,hyper=warn".into()),
        )
        .init();

    node::run_proxy(ProxyArgs::parse()).await
}
