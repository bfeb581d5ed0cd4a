// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// printrelay: LAN printer discovery and print relay
//
// Entry point. Initialises logging, resolves configuration, and runs one
// subcommand against the relay.

mod cli;
mod commands;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use printrelay_core::error::PrintRelayError;

use crate::cli::Cli;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.global.verbose);

    tracing::debug!(command = ?cli.command, "printrelay starting");

    if let Err(err) = commands::dispatch(cli.command, &cli.global).await {
        tracing::error!(error = %err, "command failed");
        eprintln!("error: {err}");
        std::process::exit(exit_code(&err));
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn exit_code(err: &PrintRelayError) -> i32 {
    match err {
        PrintRelayError::Config(_) | PrintRelayError::InvalidAddress(_) => 2,
        PrintRelayError::UnknownPrinter(_) | PrintRelayError::NoPrinterFound(_) => 4,
        PrintRelayError::AlreadyExists(_) => 6,
        PrintRelayError::Transmission(_) | PrintRelayError::IppRequest(_) => 7,
        _ => 1,
    }
}
