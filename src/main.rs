// src/main.rs
use anyhow::Result;
use clap::Parser;

use nmt_attn::cli::Cli;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("nmt_attn=info")),
        )
        .init();

    tracing::info!(cpus = num_cpus::get(), cuda = tch::Cuda::is_available(), "starting");
    Cli::parse().run()
}
