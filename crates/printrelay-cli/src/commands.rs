// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Subcommand handlers.

use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::{Instant, Interval};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use printrelay_core::config::RelayConfig;
use printrelay_core::error::{PrintRelayError, Result};
use printrelay_core::types::{JobEvent, JobId, JobStatus, PrintJob, Printer, PrinterId};
use printrelay_net::network::resolve_network_info;
use printrelay_net::scanner::{NetworkScanner, ScanReport, ScanRequest};
use printrelay_server::PrintServer;

use crate::cli::{Command, GlobalOpts};

pub async fn dispatch(command: Command, global: &GlobalOpts) -> Result<()> {
    let config = global.resolve_config()?;
    match command {
        Command::Scan => scan(config, global.json).await,
        Command::Serve { rescan_secs } => serve(config, rescan_secs.map(Duration::from_secs)).await,
        Command::Print {
            file,
            printer,
            client,
        } => print(config, &file, printer, &client, global.json).await,
        Command::Add { address } => add(config, address, global.json).await,
        Command::Config { write } => show_config(&config, global, write),
    }
}

async fn scan(config: RelayConfig, json: bool) -> Result<()> {
    let network = resolve_network_info(config.local_address)?;
    let scanner = NetworkScanner::tcp(&config);
    let request = ScanRequest::from_network(&network, &config);

    let cancel = interrupt_token();
    info!(subnet = %network.subnet, local = %network.local_address, "scanning");
    let report = scanner.scan(&request, &cancel).await;

    if json {
        print_json(&report_json(&report))
    } else {
        print_printers(&report.printers);
        println!("{}", report_summary(&report));
        Ok(())
    }
}

async fn serve(config: RelayConfig, rescan_every: Option<Duration>) -> Result<()> {
    let server = PrintServer::new(config)?;
    let mut events = server.subscribe_jobs();

    let state = server.start().await;
    info!(
        status = %state.status,
        subnet = %state.subnet,
        printers = server.list_printers().len(),
        "relay ready"
    );
    print_printers(&server.list_printers());

    let mut rescan = rescan_every
        .filter(|period| !period.is_zero())
        .map(|period| tokio::time::interval_at(Instant::now() + period, period));

    let interrupt = interrupt_token();
    loop {
        tokio::select! {
            () = interrupt.cancelled() => break,
            event = events.recv() => match event {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "job events dropped"),
                Err(RecvError::Closed) => break,
            },
            () = next_tick(&mut rescan) => match rescan_unless_interrupted(&server, &interrupt).await {
                Some(Ok(report)) => info!(
                    printers = server.list_printers().len(),
                    found = report.printers.len(),
                    partial = !report.is_complete(),
                    "rescan finished"
                ),
                Some(Err(e)) => warn!(error = %e, "rescan skipped"),
                None => break,
            },
        }
    }

    let state = server.stop();
    info!(status = %state.status, "relay shut down");
    Ok(())
}

async fn print(
    config: RelayConfig,
    file: &Path,
    printer: IpAddr,
    client: &str,
    json: bool,
) -> Result<()> {
    let document = tokio::fs::read(file).await?;
    let file_name = file
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| PrintRelayError::Config(format!("not a file: {}", file.display())))?;

    let server = PrintServer::new(config)?;
    server.start().await;
    if !server.list_printers().iter().any(|p| p.address == printer) {
        server.add_printer_manually(printer).await?;
    }

    let mut events = server.subscribe_jobs();
    let job_id = server.submit_job(file_name, document, PrinterId(printer), client)?;
    info!(job_id = %job_id, printer = %printer, "job submitted");

    let job = wait_for_outcome(&server, job_id, &mut events).await;
    server.stop();

    let job = job.ok_or_else(|| PrintRelayError::Transmission(format!("job {job_id} was lost")))?;
    if json {
        print_json(&job)?;
    } else {
        println!("{}", job_summary(&job));
    }
    match job.failure {
        Some(reason) if job.status == JobStatus::Failed => {
            Err(PrintRelayError::Transmission(reason.to_string()))
        }
        _ => Ok(()),
    }
}

async fn add(config: RelayConfig, address: IpAddr, json: bool) -> Result<()> {
    let scanner = NetworkScanner::tcp(&config);
    let mut printer = scanner
        .scan_host(address, &config, &interrupt_token())
        .await
        .ok_or(PrintRelayError::NoPrinterFound(address))?;
    printer.manually_added = true;
    if json {
        print_json(&printer)
    } else {
        print_printers(std::slice::from_ref(&printer));
        Ok(())
    }
}

fn show_config(config: &RelayConfig, global: &GlobalOpts, write: bool) -> Result<()> {
    print_json(config)?;
    if write {
        config.save(&global.config)?;
        info!(path = %global.config.display(), "configuration written");
    }
    Ok(())
}

/// A token cancelled on the first interrupt signal.
fn interrupt_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => on_interrupt.cancel(),
            Err(e) => warn!(error = %e, "could not listen for interrupt"),
        }
    });
    cancel
}

/// Run one rescan unless `interrupt` fires first.  `None` when interrupted;
/// the abandoned scan is dropped with its tasks.
async fn rescan_unless_interrupted(
    server: &PrintServer,
    interrupt: &CancellationToken,
) -> Option<Result<ScanReport>> {
    tokio::select! {
        biased;
        () = interrupt.cancelled() => None,
        outcome = server.rescan() => Some(outcome),
    }
}

/// Block until the job reaches a terminal state.  `None` if it left the
/// history before that could be observed.
async fn wait_for_outcome(
    server: &PrintServer,
    job_id: JobId,
    events: &mut broadcast::Receiver<JobEvent>,
) -> Option<PrintJob> {
    loop {
        match server.job(job_id) {
            Some(job) if job.status.is_terminal() => return Some(job),
            None => return None,
            Some(_) => {}
        }
        match events.recv().await {
            Ok(event) => log_event(&event),
            Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => return server.job(job_id),
        }
    }
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn log_event(event: &JobEvent) {
    match &event.failure {
        Some(reason) => error!(
            job_id = %event.job_id,
            printer = %event.printer_id,
            %reason,
            "job failed"
        ),
        None => info!(
            job_id = %event.job_id,
            printer = %event.printer_id,
            status = %event.status,
            "job update"
        ),
    }
}

// ── Output ───────────────────────────────────────────────────────

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_printers(printers: &[Printer]) {
    if printers.is_empty() {
        println!("no printers found");
        return;
    }
    for printer in printers {
        println!("{}", printer_line(printer));
    }
}

fn printer_line(printer: &Printer) -> String {
    let ports: Vec<String> = printer.open_ports.iter().map(u16::to_string).collect();
    let capabilities: Vec<String> = printer.capabilities.iter().map(ToString::to_string).collect();
    let mut line = format!(
        "{:<15}  {:<28}  ports {:<16}  {:<8}  {}",
        printer.address,
        printer.display_name(),
        ports.join(","),
        printer.status,
        capabilities.join(","),
    );
    if let Some(model) = &printer.model {
        line.push_str("  ");
        line.push_str(model);
    }
    line
}

fn report_summary(report: &ScanReport) -> String {
    let mut summary = format!(
        "{} printer(s) on {} host(s), {} probe(s) in {:.1}s",
        report.printers.len(),
        report.hosts_scanned,
        report.probes_issued,
        report.elapsed.as_secs_f64(),
    );
    if report.timed_out {
        summary.push_str(" (timed out, partial results)");
    } else if report.cancelled {
        summary.push_str(" (interrupted, partial results)");
    }
    summary
}

fn report_json(report: &ScanReport) -> serde_json::Value {
    serde_json::json!({
        "printers": report.printers,
        "hosts_scanned": report.hosts_scanned,
        "probes_issued": report.probes_issued,
        "timed_out": report.timed_out,
        "cancelled": report.cancelled,
        "elapsed_ms": u64::try_from(report.elapsed.as_millis()).unwrap_or(u64::MAX),
    })
}

fn job_summary(job: &PrintJob) -> String {
    let mut summary = format!(
        "job {} {} -> {}: {} ({} bytes, sha256 {})",
        job.id, job.file_name, job.target_printer_id, job.status, job.total_bytes, job.document_hash,
    );
    if let Some(reason) = &job.failure {
        summary.push_str(&format!(": {reason}"));
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    use std::sync::Arc;

    use printrelay_core::types::{Capability, NetworkInfo, PrinterInfo, ServerStatus};
    use printrelay_net::SimulatedNetwork;
    use printrelay_server::ProtocolTransport;

    fn office() -> Printer {
        Printer::from_findings(
            IpAddr::V4(Ipv4Addr::new(192, 168, 1, 5)),
            [631, 9100],
            PrinterInfo {
                name: Some("Office-IPP".into()),
                model: Some("LaserJet 400".into()),
                ..PrinterInfo::generic([Capability::Duplex])
            },
        )
    }

    fn report(timed_out: bool) -> ScanReport {
        ScanReport {
            printers: vec![office()],
            hosts_scanned: 253,
            probes_issued: 2277,
            timed_out,
            cancelled: false,
            elapsed: Duration::from_millis(1500),
        }
    }

    /// A running server over a simulated subnet where every exchange takes
    /// `latency`.
    async fn slow_server(latency: Duration) -> PrintServer {
        let net = Arc::new(
            SimulatedNetwork::new()
                .with_port(Ipv4Addr::new(10, 0, 0, 5), 631, None)
                .with_latency(latency),
        );
        let config = RelayConfig {
            candidate_ports: vec![631],
            concurrency_limit: 512,
            ..RelayConfig::default()
        };
        let transport = Arc::new(ProtocolTransport::new(&config));
        let server = PrintServer::from_parts(
            config,
            NetworkInfo::new(Ipv4Addr::new(10, 0, 0, 1)),
            NetworkScanner::new(net.clone(), net),
            transport,
        );
        server.start().await;
        server
    }

    #[tokio::test]
    async fn rescan_completes_without_interrupt() {
        let server = slow_server(Duration::from_millis(10)).await;
        let outcome = rescan_unless_interrupted(&server, &CancellationToken::new())
            .await
            .expect("not interrupted");
        assert_eq!(outcome.expect("rescan").printers.len(), 1);
    }

    #[tokio::test]
    async fn interrupt_cuts_a_rescan_short() {
        let server = slow_server(Duration::from_millis(200)).await;
        assert_eq!(server.status(), ServerStatus::Running);

        let interrupt = CancellationToken::new();
        let trigger = interrupt.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        assert!(rescan_unless_interrupted(&server, &interrupt).await.is_none());
        assert!(started.elapsed() < Duration::from_millis(150));

        server.stop();
        assert!(server.list_printers().is_empty());
    }

    #[test]
    fn printer_line_shows_ports_and_model() {
        let line = printer_line(&office());
        assert!(line.starts_with("192.168.1.5"));
        assert!(line.contains("Office-IPP"));
        assert!(line.contains("631,9100"));
        assert!(line.ends_with("LaserJet 400"));
    }

    #[test]
    fn summary_flags_partial_scans() {
        assert_eq!(
            report_summary(&report(false)),
            "1 printer(s) on 253 host(s), 2277 probe(s) in 1.5s"
        );
        assert!(report_summary(&report(true)).ends_with("(timed out, partial results)"));
    }

    #[test]
    fn report_json_carries_counts() {
        let value = report_json(&report(false));
        assert_eq!(value["hosts_scanned"], 253);
        assert_eq!(value["elapsed_ms"], 1500);
        assert_eq!(value["printers"][0]["name"], "Office-IPP");
    }

    #[test]
    fn failed_job_summary_names_the_reason() {
        let mut job = PrintJob::new(
            "report.pdf".into(),
            office().id,
            "cli".into(),
            "ab12".into(),
            4,
        );
        job.status = JobStatus::Failed;
        job.failure = Some(printrelay_core::types::FailureReason::PrinterUnavailable);

        let summary = job_summary(&job);
        assert!(summary.contains("report.pdf -> printer_192_168_1_5: failed"));
        assert!(summary.ends_with(": printer unavailable"));
    }
}
