// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Relay configuration.

use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{PrintRelayError, Result};

/// Ports conventionally associated with print services, probed on every host
/// during a subnet scan.
pub const DEFAULT_CANDIDATE_PORTS: [u16; 9] = [631, 9100, 515, 721, 35, 2000, 8080, 80, 443];

/// Ports probed when a printer is added by address.
pub const DEFAULT_MANUAL_PORTS: [u16; 7] = [631, 9100, 515, 721, 35, 2000, 8080];

/// Runtime settings for discovery and dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Ports probed on every host of the subnet, in identification order.
    pub candidate_ports: Vec<u16>,
    /// Ports probed for a manually added printer.
    pub manual_ports: Vec<u16>,
    /// Maximum number of in-flight probe/identify operations across a scan.
    pub concurrency_limit: usize,
    /// Connect timeout for a single port probe.
    pub probe_timeout_ms: u64,
    /// Budget for a single protocol identification exchange.
    pub identify_timeout_ms: u64,
    /// Upper bound for a whole subnet scan; partial results are kept.
    pub scan_timeout_secs: u64,
    /// Upper bound for transmitting one job to a printer.
    pub transmit_timeout_secs: u64,
    /// Number of recent jobs retained in history.
    pub job_history_capacity: usize,
    /// Local IPv4 address override (auto-detected when absent).
    pub local_address: Option<Ipv4Addr>,
    /// LPD queue name used for status queries and job submission.
    pub lpd_queue: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            candidate_ports: DEFAULT_CANDIDATE_PORTS.to_vec(),
            manual_ports: DEFAULT_MANUAL_PORTS.to_vec(),
            concurrency_limit: 48,
            probe_timeout_ms: 500,
            identify_timeout_ms: 2000,
            scan_timeout_secs: 60,
            transmit_timeout_secs: 60,
            job_history_capacity: 5,
            local_address: None,
            lpd_queue: "lp".into(),
        }
    }
}

impl RelayConfig {
    /// Load configuration from a JSON file.
    ///
    /// A missing file yields the defaults.  A file that exists but cannot be
    /// parsed is an error rather than a silent fallback.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = match std::fs::read_to_string(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(PrintRelayError::Io(e)),
        };

        let config: Self = serde_json::from_str(&data)
            .map_err(|e| PrintRelayError::Config(format!("{}: {e}", path.display())))?;
        info!(path = %path.display(), "configuration loaded");
        Ok(config.normalized())
    }

    /// Persist configuration as pretty-printed JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Clamp values that would make discovery or dispatch degenerate.
    pub fn normalized(mut self) -> Self {
        self.concurrency_limit = self.concurrency_limit.max(1);
        self.job_history_capacity = self.job_history_capacity.max(1);
        self.probe_timeout_ms = self.probe_timeout_ms.max(1);
        dedup_in_order(&mut self.candidate_ports);
        dedup_in_order(&mut self.manual_ports);
        self
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn identify_timeout(&self) -> Duration {
        Duration::from_millis(self.identify_timeout_ms)
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs)
    }

    pub fn transmit_timeout(&self) -> Duration {
        Duration::from_secs(self.transmit_timeout_secs)
    }
}

/// Remove repeated ports while keeping the first occurrence's position.
fn dedup_in_order(ports: &mut Vec<u16>) {
    let mut seen = std::collections::HashSet::new();
    ports.retain(|p| seen.insert(*p));
}
