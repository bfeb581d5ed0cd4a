// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Bounded subnet scanner.
//
// Every (host, port) pair becomes one task.  All tasks share a single
// semaphore sized to the concurrency limit, so the bound holds across the
// whole scan rather than per host.  A task that finds its port open
// identifies the device while still holding its permit.
//
// Results are collected into a shared map as they arrive, which is what lets
// a timed-out or cancelled scan return everything found so far.

use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use printrelay_core::config::RelayConfig;
use printrelay_core::types::{NetworkInfo, Printer, PrinterInfo, Subnet};

use crate::identify::{PrinterIdentifier, ProtocolIdentifier};
use crate::prober::{PortProber, TcpProber};

/// One host and the ports to probe on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanTask {
    pub address: IpAddr,
    pub candidate_ports: Vec<u16>,
}

/// Parameters of one scan.
#[derive(Debug, Clone)]
pub struct ScanRequest {
    pub hosts: Vec<IpAddr>,
    /// Probed in this order; identification results merge in this order too.
    pub candidate_ports: Vec<u16>,
    pub concurrency_limit: usize,
    pub probe_timeout: Duration,
    pub scan_timeout: Duration,
}

impl ScanRequest {
    /// Every host of `subnet` except `exclude`, probed on the configured
    /// candidate ports.
    pub fn subnet(subnet: Subnet, exclude: Option<Ipv4Addr>, config: &RelayConfig) -> Self {
        let hosts = subnet
            .hosts()
            .filter(|host| Some(*host) != exclude)
            .map(IpAddr::V4)
            .collect();
        Self {
            hosts,
            candidate_ports: config.candidate_ports.clone(),
            concurrency_limit: config.concurrency_limit,
            probe_timeout: config.probe_timeout(),
            scan_timeout: config.scan_timeout(),
        }
    }

    /// The relay's own subnet, skipping the relay itself.
    pub fn from_network(network: &NetworkInfo, config: &RelayConfig) -> Self {
        Self::subnet(network.subnet, Some(network.local_address), config)
    }

    /// A single address probed on the manual-add port list.
    pub fn single_host(address: IpAddr, config: &RelayConfig) -> Self {
        Self {
            hosts: vec![address],
            candidate_ports: config.manual_ports.clone(),
            concurrency_limit: config.concurrency_limit,
            probe_timeout: config.probe_timeout(),
            scan_timeout: config.scan_timeout(),
        }
    }

    pub fn tasks(&self) -> Vec<ScanTask> {
        self.hosts
            .iter()
            .map(|&address| ScanTask {
                address,
                candidate_ports: self.candidate_ports.clone(),
            })
            .collect()
    }
}

/// Outcome of a scan, including partial results.
#[derive(Debug, Clone)]
pub struct ScanReport {
    /// Detected printers, sorted by address.
    pub printers: Vec<Printer>,
    pub hosts_scanned: usize,
    pub probes_issued: usize,
    /// The scan timeout elapsed before every task finished.
    pub timed_out: bool,
    /// The scan was cancelled before every task finished.
    pub cancelled: bool,
    pub elapsed: Duration,
}

impl ScanReport {
    pub fn is_complete(&self) -> bool {
        !self.timed_out && !self.cancelled
    }
}

/// What the tasks have learned about one host.  Keys are candidate-port
/// ranks so merging does not depend on completion order.
#[derive(Debug, Default)]
struct HostFindings {
    open_ports: BTreeMap<usize, u16>,
    infos: BTreeMap<usize, PrinterInfo>,
}

impl HostFindings {
    fn into_printer(self, address: IpAddr) -> Printer {
        let mut merged = PrinterInfo::default();
        for info in self.infos.into_values() {
            merged.fill_missing(info);
        }
        Printer::from_findings(address, self.open_ports.into_values(), merged)
    }
}

/// State shared by every task of one scan.
struct ScanContext {
    prober: Arc<dyn PortProber>,
    identifier: Arc<dyn PrinterIdentifier>,
    semaphore: Semaphore,
    probe_timeout: Duration,
    probes: AtomicUsize,
    findings: Mutex<HashMap<IpAddr, HostFindings>>,
}

impl ScanContext {
    async fn probe_and_identify(&self, address: IpAddr, rank: usize, port: u16) {
        let Ok(_permit) = self.semaphore.acquire().await else {
            return;
        };

        self.probes.fetch_add(1, Ordering::Relaxed);
        let socket = SocketAddr::new(address, port);
        if !self.prober.probe(socket, self.probe_timeout).await {
            return;
        }
        debug!(%socket, "open print port");
        self.record(address, |host| {
            host.open_ports.insert(rank, port);
        });

        match self.identifier.identify(address, port).await {
            Some(info) => self.record(address, |host| {
                host.infos.insert(rank, info);
            }),
            None => debug!(%socket, "no identification response"),
        }
    }

    fn record(&self, address: IpAddr, update: impl FnOnce(&mut HostFindings)) {
        let mut findings = self.findings.lock().unwrap_or_else(PoisonError::into_inner);
        update(findings.entry(address).or_default());
    }

    fn take_printers(&self) -> Vec<Printer> {
        let findings =
            std::mem::take(&mut *self.findings.lock().unwrap_or_else(PoisonError::into_inner));
        let mut printers: Vec<Printer> = findings
            .into_iter()
            .filter(|(_, host)| !host.open_ports.is_empty())
            .map(|(address, host)| host.into_printer(address))
            .collect();
        printers.sort_by_key(|p| p.address);
        printers
    }
}

/// Discovers printers by probing candidate ports and identifying open ones.
#[derive(Clone)]
pub struct NetworkScanner {
    prober: Arc<dyn PortProber>,
    identifier: Arc<dyn PrinterIdentifier>,
}

impl NetworkScanner {
    pub fn new(prober: Arc<dyn PortProber>, identifier: Arc<dyn PrinterIdentifier>) -> Self {
        Self { prober, identifier }
    }

    /// A scanner that talks to the real network.
    pub fn tcp(config: &RelayConfig) -> Self {
        Self::new(
            Arc::new(TcpProber),
            Arc::new(ProtocolIdentifier::new(
                config.identify_timeout(),
                config.lpd_queue.clone(),
            )),
        )
    }

    /// Scan every host of the request.
    ///
    /// Never fails: unreachable hosts are simply absent from the report, and
    /// a timeout or cancellation returns what was found up to that point.
    pub async fn scan(&self, request: &ScanRequest, cancel: &CancellationToken) -> ScanReport {
        let started = Instant::now();
        let tasks = request.tasks();
        let hosts_scanned = tasks.len();
        info!(
            hosts = hosts_scanned,
            ports = request.candidate_ports.len(),
            limit = request.concurrency_limit,
            "scan started"
        );

        let context = Arc::new(ScanContext {
            prober: Arc::clone(&self.prober),
            identifier: Arc::clone(&self.identifier),
            semaphore: Semaphore::new(request.concurrency_limit.max(1)),
            probe_timeout: request.probe_timeout,
            probes: AtomicUsize::new(0),
            findings: Mutex::new(HashMap::new()),
        });

        let mut set = JoinSet::new();
        for task in tasks {
            for (rank, &port) in task.candidate_ports.iter().enumerate() {
                let context = Arc::clone(&context);
                let address = task.address;
                set.spawn(async move { context.probe_and_identify(address, rank, port).await });
            }
        }

        let deadline = tokio::time::sleep(request.scan_timeout);
        tokio::pin!(deadline);

        let mut timed_out = false;
        let mut cancelled = false;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                _ = &mut deadline => {
                    timed_out = true;
                    break;
                }
                joined = set.join_next() => match joined {
                    Some(Err(e)) if e.is_panic() => warn!(error = %e, "scan task panicked"),
                    Some(_) => {}
                    None => break,
                },
            }
        }
        set.shutdown().await;

        let printers = context.take_printers();
        let report = ScanReport {
            printers,
            hosts_scanned,
            probes_issued: context.probes.load(Ordering::Relaxed),
            timed_out,
            cancelled,
            elapsed: started.elapsed(),
        };

        if timed_out {
            warn!(
                found = report.printers.len(),
                timeout_secs = request.scan_timeout.as_secs_f64(),
                "scan timed out, returning partial results"
            );
        } else if cancelled {
            info!(found = report.printers.len(), "scan cancelled");
        } else {
            info!(
                found = report.printers.len(),
                probes = report.probes_issued,
                elapsed_ms = report.elapsed.as_millis() as u64,
                "scan complete"
            );
        }
        report
    }

    /// Probe one address and return it as a printer if any port is open.
    pub async fn scan_host(
        &self,
        address: IpAddr,
        config: &RelayConfig,
        cancel: &CancellationToken,
    ) -> Option<Printer> {
        let request = ScanRequest::single_host(address, config);
        self.scan(&request, cancel).await.printers.into_iter().next()
    }
}
