// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
use anyhow::Result;
use clap::Parser;
use fabstir_text_curator::cli::{execute, init_tracing, load_config, Cli};
use fabstir_text_curator::version;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("❌ Error: {:#}", e);
            std::process::exit(2);
        }
    };
    init_tracing(&config)?;

    tracing::info!(
        package = version::PACKAGE,
        features = ?version::FEATURES,
        "📦 {}",
        version::get_version_string()
    );

    // Execute the command
    match execute(cli, config).await {
        Ok(()) => Ok(()),
        Err(e) => {
            eprintln!("❌ Error: {:#}", e);
            std::process::exit(1);
        }
    }
}
