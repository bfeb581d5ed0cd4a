// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Command-line arguments.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use printrelay_core::config::RelayConfig;
use printrelay_core::error::Result;

#[derive(Debug, Parser)]
#[command(name = "printrelay", version, about = "Discover LAN printers and relay print jobs to them")]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

/// Options shared by every subcommand.
#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Path to the JSON configuration file
    #[arg(
        long,
        short = 'c',
        env = "PRINTRELAY_CONFIG",
        default_value = "printrelay.json",
        global = true
    )]
    pub config: PathBuf,

    /// Maximum concurrent probes during a scan
    #[arg(long, global = true)]
    pub concurrency: Option<usize>,

    /// Connect timeout for a single port probe, in milliseconds
    #[arg(long, global = true)]
    pub probe_timeout_ms: Option<u64>,

    /// Local IPv4 address to scan from (auto-detected when omitted)
    #[arg(long, env = "PRINTRELAY_LOCAL_ADDRESS", global = true)]
    pub local_address: Option<Ipv4Addr>,

    /// Print results as JSON
    #[arg(long, global = true)]
    pub json: bool,

    /// Enable debug logging
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,
}

impl GlobalOpts {
    /// The configuration file with command-line overrides applied.
    pub fn resolve_config(&self) -> Result<RelayConfig> {
        let mut config = RelayConfig::load(&self.config)?;
        self.apply_overrides(&mut config);
        Ok(config.normalized())
    }

    fn apply_overrides(&self, config: &mut RelayConfig) {
        if let Some(limit) = self.concurrency {
            config.concurrency_limit = limit;
        }
        if let Some(timeout) = self.probe_timeout_ms {
            config.probe_timeout_ms = timeout;
        }
        if self.local_address.is_some() {
            config.local_address = self.local_address;
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Scan the local /24 subnet once and list the printers found
    Scan,

    /// Start the relay and log job activity until interrupted
    Serve {
        /// Re-scan the subnet at this interval, in seconds
        #[arg(long)]
        rescan_secs: Option<u64>,
    },

    /// Send a file to a printer
    Print {
        /// Document to print
        file: PathBuf,

        /// Address of the target printer
        #[arg(long, short = 'p')]
        printer: IpAddr,

        /// Client identifier recorded on the job
        #[arg(long, default_value = "printrelay-cli")]
        client: String,
    },

    /// Probe a single address and show the printer found there
    Add {
        address: IpAddr,
    },

    /// Show the effective configuration
    Config {
        /// Write it back to the configuration file
        #[arg(long)]
        write: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn print_requires_a_printer() {
        let err = Cli::try_parse_from(["printrelay", "print", "doc.pdf"]).expect_err("missing --printer");
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);

        let cli = Cli::try_parse_from(["printrelay", "print", "doc.pdf", "--printer", "192.168.1.5"])
            .expect("parse");
        match cli.command {
            Command::Print { file, printer, client } => {
                assert_eq!(file, PathBuf::from("doc.pdf"));
                assert_eq!(printer, IpAddr::V4(Ipv4Addr::new(192, 168, 1, 5)));
                assert_eq!(client, "printrelay-cli");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn global_flags_follow_the_subcommand() {
        let cli = Cli::try_parse_from([
            "printrelay",
            "scan",
            "--concurrency",
            "8",
            "--local-address",
            "10.0.0.7",
            "-v",
        ])
        .expect("parse");
        assert!(matches!(cli.command, Command::Scan));
        assert_eq!(cli.global.concurrency, Some(8));
        assert_eq!(cli.global.local_address, Some(Ipv4Addr::new(10, 0, 0, 7)));
        assert!(cli.global.verbose);
    }

    #[test]
    fn overrides_apply_on_top_of_the_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("relay.json");
        let stored = RelayConfig {
            concurrency_limit: 16,
            lpd_queue: "raw".into(),
            ..RelayConfig::default()
        };
        stored.save(&path).expect("save");

        let cli = Cli::try_parse_from([
            "printrelay",
            "--config",
            path.to_str().expect("utf-8 path"),
            "--probe-timeout-ms",
            "150",
            "scan",
        ])
        .expect("parse");
        let config = cli.global.resolve_config().expect("resolve");

        assert_eq!(config.concurrency_limit, 16);
        assert_eq!(config.probe_timeout_ms, 150);
        assert_eq!(config.lpd_queue, "raw");
    }

    #[test]
    fn zero_concurrency_is_clamped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("missing.json");
        let cli = Cli::try_parse_from([
            "printrelay",
            "--config",
            path.to_str().expect("utf-8 path"),
            "--concurrency",
            "0",
            "scan",
        ])
        .expect("parse");

        let config = cli.global.resolve_config().expect("resolve");
        assert_eq!(config.concurrency_limit, 1);
    }
}
