// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Print server lifecycle.
//
//   stopped -[start]-> starting -[scan completes]-> running -[stop]-> stopped
//
// `start` owns the scan; the registry is only populated, and the status only
// becomes `running`, once the scan has returned.  Each run has one root
// token and every scan of the run (start, rescan, manual add) holds a child
// of it, so `stop` cancels all of them at once.  Tokens are taken and
// results committed under the lifecycle lock, which `stop` also holds, and
// a scan whose token was cancelled commits nothing.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use printrelay_core::config::RelayConfig;
use printrelay_core::error::{PrintRelayError, Result};
use printrelay_core::types::{
    FailureReason, JobEvent, JobId, NetworkInfo, PrintJob, Printer, PrinterId, ServerState,
    ServerStatus,
};
use printrelay_net::network::resolve_network_info;
use printrelay_net::scanner::{NetworkScanner, ScanReport, ScanRequest};

use crate::dispatcher::{JobDispatcher, JobTransport, ProtocolTransport};
use crate::registry::{AddMode, PrinterRegistry};

/// The print relay: discovery, registry and dispatch behind one handle.
///
/// Cheaply cloneable via `Arc<ServerInner>`.
#[derive(Clone)]
pub struct PrintServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    config: RelayConfig,
    network: NetworkInfo,
    scanner: NetworkScanner,
    registry: Arc<PrinterRegistry>,
    dispatcher: JobDispatcher,
    status: watch::Sender<ServerStatus>,
    clients: Mutex<HashSet<String>>,
    /// Root of every scan token of the current run.
    run_cancel: Mutex<CancellationToken>,
    lifecycle: Mutex<()>,
}

impl PrintServer {
    /// A server on the real network, at the configured or detected address.
    pub fn new(config: RelayConfig) -> Result<Self> {
        let config = config.normalized();
        let network = resolve_network_info(config.local_address)?;
        let scanner = NetworkScanner::tcp(&config);
        let transport = Arc::new(ProtocolTransport::new(&config));
        Ok(Self::from_parts(config, network, scanner, transport))
    }

    /// Assemble a server from explicit collaborators.
    pub fn from_parts(
        config: RelayConfig,
        network: NetworkInfo,
        scanner: NetworkScanner,
        transport: Arc<dyn JobTransport>,
    ) -> Self {
        let config = config.normalized();
        let registry = Arc::new(PrinterRegistry::new());
        let dispatcher =
            JobDispatcher::new(Arc::clone(&registry), transport, config.job_history_capacity);
        let (status, _) = watch::channel(ServerStatus::Stopped);

        Self {
            inner: Arc::new(ServerInner {
                config,
                network,
                scanner,
                registry,
                dispatcher,
                status,
                clients: Mutex::new(HashSet::new()),
                run_cancel: Mutex::new(CancellationToken::new()),
                lifecycle: Mutex::new(()),
            }),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.inner.config
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Start the server: scan the subnet, register what was found, then
    /// report `running`.
    ///
    /// A no-op returning the current state if the server is already
    /// starting or running.
    pub async fn start(&self) -> ServerState {
        let inner = &self.inner;
        let cancel = {
            let _lifecycle = inner.lock_lifecycle();
            if self.status() != ServerStatus::Stopped {
                debug!(status = %self.status(), "start ignored");
                return self.state();
            }
            let run = CancellationToken::new();
            *inner.lock_run_cancel() = run.clone();
            inner.status.send_replace(ServerStatus::Starting);
            run.child_token()
        };
        info!(subnet = %inner.network.subnet, "server starting");

        let request = ScanRequest::from_network(&inner.network, &inner.config);
        let report = inner.scanner.scan(&request, &cancel).await;
        let complete = report.is_complete();

        {
            let _lifecycle = inner.lock_lifecycle();
            if cancel.is_cancelled() || self.status() != ServerStatus::Starting {
                info!("start interrupted by stop");
                return self.state();
            }
            for printer in report.printers {
                let _ = inner.registry.add(printer, AddMode::Merge);
            }
            inner.status.send_replace(ServerStatus::Running);
        }

        info!(
            printers = inner.registry.len(),
            partial = !complete,
            "server running"
        );
        self.state()
    }

    /// Stop the server.  Idempotent.
    ///
    /// Cancels any scan, fails every queued or printing job with
    /// `ServerStopped`, clears the registry and disconnects all clients.
    pub fn stop(&self) -> ServerState {
        let inner = &self.inner;
        {
            let _lifecycle = inner.lock_lifecycle();
            inner.lock_run_cancel().cancel();
            inner.dispatcher.cancel_all(FailureReason::ServerStopped);
            inner.registry.clear();
            inner.lock_clients().clear();
            let previous = inner.status.send_replace(ServerStatus::Stopped);
            if previous != ServerStatus::Stopped {
                info!(from = %previous, "server stopped");
            }
        }
        self.state()
    }

    pub fn status(&self) -> ServerStatus {
        *self.inner.status.borrow()
    }

    pub fn state(&self) -> ServerState {
        ServerState {
            status: self.status(),
            connected_clients: self.inner.lock_clients().len(),
            local_address: self.inner.network.local_address,
            subnet: self.inner.network.subnet,
        }
    }

    pub fn network_info(&self) -> NetworkInfo {
        self.inner.network
    }

    /// Observe status changes.
    pub fn watch_status(&self) -> watch::Receiver<ServerStatus> {
        self.inner.status.subscribe()
    }

    // ── Printers ─────────────────────────────────────────────────

    pub fn list_printers(&self) -> Vec<Printer> {
        self.inner.registry.list()
    }

    /// Probe `address` on the manual port list and register it if any port
    /// answers.  Requires a running server; a `stop` during the probe
    /// cancels it and nothing is registered.
    pub async fn add_printer_manually(&self, address: IpAddr) -> Result<Printer> {
        let inner = &self.inner;
        let cancel = inner.running_scan_token()?;
        if inner.registry.contains(address) {
            return Err(PrintRelayError::AlreadyExists(address));
        }

        let found = inner.scanner.scan_host(address, &inner.config, &cancel).await;

        let _lifecycle = inner.lock_lifecycle();
        if cancel.is_cancelled() || self.status() != ServerStatus::Running {
            return Err(PrintRelayError::ServerNotRunning);
        }
        let mut printer = found.ok_or(PrintRelayError::NoPrinterFound(address))?;
        printer.manually_added = true;

        let printer = inner.registry.add(printer, AddMode::Reject)?;
        info!(addr = %address, ports = ?printer.open_ports, "printer added manually");
        Ok(printer)
    }

    pub fn remove_printer(&self, address: IpAddr) -> Result<Printer> {
        self.inner
            .registry
            .remove(address)
            .ok_or(PrintRelayError::UnknownPrinter(PrinterId(address)))
    }

    /// Re-scan the subnet while running.
    ///
    /// New information is merged over existing entries, new printers are
    /// added, and registered printers the scan did not find are marked
    /// offline.  Nothing is removed.
    pub async fn rescan(&self) -> Result<ScanReport> {
        let inner = &self.inner;
        let cancel = inner.running_scan_token()?;
        let request = ScanRequest::from_network(&inner.network, &inner.config);
        let report = inner.scanner.scan(&request, &cancel).await;

        let _lifecycle = inner.lock_lifecycle();
        if cancel.is_cancelled() || self.status() != ServerStatus::Running {
            return Err(PrintRelayError::ServerNotRunning);
        }
        let seen: HashSet<IpAddr> = report.printers.iter().map(|p| p.address).collect();
        for printer in &report.printers {
            let _ = inner.registry.add(printer.clone(), AddMode::Merge);
        }
        if report.is_complete() {
            let gone = inner.registry.mark_offline_except(&seen);
            if !gone.is_empty() {
                info!(count = gone.len(), "printers no longer answering");
            }
        }
        Ok(report)
    }

    // ── Jobs ─────────────────────────────────────────────────────

    /// Queue `document` for printing.
    pub fn submit_job(
        &self,
        file_name: impl Into<String>,
        document: Vec<u8>,
        printer_id: PrinterId,
        client_id: impl Into<String>,
    ) -> Result<JobId> {
        if self.status() != ServerStatus::Running {
            return Err(PrintRelayError::ServerNotRunning);
        }
        self.inner
            .dispatcher
            .submit(file_name, document, printer_id, client_id)
    }

    /// Recent jobs, most recent first.
    pub fn list_recent_jobs(&self) -> Vec<PrintJob> {
        self.inner.dispatcher.recent_jobs()
    }

    pub fn job(&self, id: JobId) -> Option<PrintJob> {
        self.inner.dispatcher.get_job(id)
    }

    pub fn subscribe_jobs(&self) -> broadcast::Receiver<JobEvent> {
        self.inner.dispatcher.subscribe()
    }

    // ── Clients ──────────────────────────────────────────────────

    /// Record a connected client.  Returns the number of distinct clients.
    pub fn connect_client(&self, client_id: impl Into<String>) -> Result<usize> {
        if self.status() != ServerStatus::Running {
            return Err(PrintRelayError::ServerNotRunning);
        }
        let client_id = client_id.into();
        let mut clients = self.inner.lock_clients();
        if clients.insert(client_id.clone()) {
            debug!(client = %client_id, "client connected");
        }
        Ok(clients.len())
    }

    /// Forget a client.  Returns the number of distinct clients left.
    pub fn disconnect_client(&self, client_id: &str) -> usize {
        let mut clients = self.inner.lock_clients();
        if clients.remove(client_id) {
            debug!(client = %client_id, "client disconnected");
        }
        clients.len()
    }
}

impl ServerInner {
    fn lock_lifecycle(&self) -> MutexGuard<'_, ()> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_clients(&self) -> MutexGuard<'_, HashSet<String>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_run_cancel(&self) -> MutexGuard<'_, CancellationToken> {
        self.run_cancel.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A token for one scan of the current run.  `stop` cancels it.
    fn running_scan_token(&self) -> Result<CancellationToken> {
        let _lifecycle = self.lock_lifecycle();
        if *self.status.borrow() != ServerStatus::Running {
            return Err(PrintRelayError::ServerNotRunning);
        }
        Ok(self.lock_run_cancel().child_token())
    }
}
