// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use gh_download::{GatewayConfig, Server};

/// gh-download - stable download URLs for GitHub release assets.
#[derive(Parser)]
#[command(name = "gh-download")]
#[command(version)]
#[command(about = "Resolve GitHub release tags and stream the matching asset.")]
#[command(long_about = "gh-download - release asset gateway\n\n\
    Configured from the environment:\n\
    \x20 GITHUB_OWNER (required), GITHUB_ACCESS_TOKEN, PORT, BIND_ADDRESS,\n\
    \x20 GITHUB_API_URL, GITHUB_DOWNLOAD_URL, GITHUB_API_TIMEOUT_SECS,\n\
    \x20 UPSTREAM_CONNECT_TIMEOUT_SECS, KEEN_PROJECT, KEEN_WRITE_KEY,\n\
    \x20 KEEN_API_URL, KEEN_FLUSH_INTERVAL_MS\n\n\
    Routes:\n\
    \x20 GET /{repo}/latest/version.txt\n\
    \x20 GET /{repo}/{tag}.{ext}\n\
    \x20 GET /{repo}/{tag}/{platform}.{ext}")]
struct Cli {
    /// Listen port (overrides PORT)
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address (overrides BIND_ADDRESS)
    #[arg(short, long)]
    bind: Option<String>,

    /// Verbose mode: debug logging unless RUST_LOG is set
    #[arg(short = 'v', long)]
    verbose: bool,
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose {
        "debug,hyper=info,reqwest=info"
    } else {
        "info"
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = GatewayConfig::from_env().context("Invalid configuration")?;
    tracing::debug!("Loaded {:?}", config);

    let mut server = Server::new(config);
    if let Some(port) = cli.port {
        server = server.with_port(port);
    }
    if let Some(bind) = cli.bind {
        server = server.with_bind_address(bind);
    }

    server.start().await?;

    tracing::info!("Shut down cleanly");
    Ok(())
}
