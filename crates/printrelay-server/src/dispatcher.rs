// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Print job dispatcher.
//
// Each printer gets its own worker task fed by an unbounded channel, which
// gives FIFO ordering per printer and none across printers.  A job moves
// through `Queued -> Printing -> {Completed, Failed}`; every transition goes
// through `transition`, which refuses anything the state machine does not
// allow, so a job failed by `cancel_all` stays failed.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use printrelay_core::config::RelayConfig;
use printrelay_core::error::{PrintRelayError, Result};
use printrelay_core::types::{
    FailureReason, JobEvent, JobId, JobStatus, PrintJob, Printer, PrinterId, PrinterStatus,
};
use printrelay_net::protocol::{self, Delivery};

const EVENT_CHANNEL_SIZE: usize = 256;

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Delivers a document to a printer.
#[async_trait]
pub trait JobTransport: Send + Sync {
    /// Transmit `document` for `job` to `printer`, returning once the printer
    /// has accepted it or the attempt has failed.
    async fn transmit(&self, printer: &Printer, job: &PrintJob, document: &[u8]) -> Result<()>;
}

/// Sends jobs over IPP, LPR or raw TCP, picked from the printer's open ports.
#[derive(Debug, Clone)]
pub struct ProtocolTransport {
    lpd_queue: String,
    timeout: std::time::Duration,
}

impl ProtocolTransport {
    pub fn new(config: &RelayConfig) -> Self {
        Self {
            lpd_queue: config.lpd_queue.clone(),
            timeout: config.transmit_timeout(),
        }
    }
}

#[async_trait]
impl JobTransport for ProtocolTransport {
    async fn transmit(&self, printer: &Printer, job: &PrintJob, document: &[u8]) -> Result<()> {
        let delivery = Delivery {
            document,
            document_type: job.document_type,
            job_name: &job.file_name,
            lpd_queue: &self.lpd_queue,
            timeout: self.timeout,
        };
        let used = protocol::deliver(printer.address, &printer.open_ports, &delivery).await?;
        debug!(job_id = %job.id, protocol = used.display_name(), "transmitted");
        Ok(())
    }
}

/// SHA-256 hex digest of a document.
pub fn hash_document(document: &[u8]) -> String {
    hex::encode(Sha256::digest(document))
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

/// Recent jobs, oldest first.  Only terminal jobs are ever evicted, so a job
/// stays observable until it finishes.
#[derive(Debug)]
struct JobHistory {
    capacity: usize,
    jobs: VecDeque<PrintJob>,
}

impl JobHistory {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            jobs: VecDeque::new(),
        }
    }

    fn push(&mut self, job: PrintJob) {
        self.jobs.push_back(job);
        self.evict();
    }

    fn get(&self, id: JobId) -> Option<&PrintJob> {
        self.jobs.iter().find(|job| job.id == id)
    }

    fn get_mut(&mut self, id: JobId) -> Option<&mut PrintJob> {
        self.jobs.iter_mut().find(|job| job.id == id)
    }

    fn evict(&mut self) {
        while self.jobs.len() > self.capacity {
            let Some(oldest_terminal) = self.jobs.iter().position(|job| job.status.is_terminal())
            else {
                break;
            };
            if let Some(evicted) = self.jobs.remove(oldest_terminal) {
                debug!(job_id = %evicted.id, "evicted from history");
            }
        }
    }

    fn active_ids(&self) -> Vec<JobId> {
        self.jobs
            .iter()
            .filter(|job| !job.status.is_terminal())
            .map(|job| job.id)
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// A job waiting in a printer's queue.
struct QueuedJob {
    id: JobId,
    document: Vec<u8>,
    /// Cancelled by `cancel_all`; the job record is failed at that moment.
    cancel: CancellationToken,
}

/// Accepts jobs and drives them to completion.  Cheap to clone.
#[derive(Clone)]
pub struct JobDispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    registry: Arc<crate::registry::PrinterRegistry>,
    transport: Arc<dyn JobTransport>,
    history: Mutex<JobHistory>,
    queues: Mutex<HashMap<PrinterId, mpsc::UnboundedSender<QueuedJob>>>,
    events: broadcast::Sender<JobEvent>,
    cancel: Mutex<CancellationToken>,
}

impl JobDispatcher {
    pub fn new(
        registry: Arc<crate::registry::PrinterRegistry>,
        transport: Arc<dyn JobTransport>,
        history_capacity: usize,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        Self {
            inner: Arc::new(DispatcherInner {
                registry,
                transport,
                history: Mutex::new(JobHistory::new(history_capacity)),
                queues: Mutex::new(HashMap::new()),
                events,
                cancel: Mutex::new(CancellationToken::new()),
            }),
        }
    }

    /// Queue a document for `printer_id` and return the new job's id.
    ///
    /// Returns as soon as the job is queued; progress is observed through
    /// `get_job`, `recent_jobs` or `subscribe`.  Must be called from within a
    /// Tokio runtime.
    pub fn submit(
        &self,
        file_name: impl Into<String>,
        document: Vec<u8>,
        printer_id: PrinterId,
        client_id: impl Into<String>,
    ) -> Result<JobId> {
        let inner = &self.inner;
        if !inner.registry.contains(printer_id.address()) {
            return Err(PrintRelayError::UnknownPrinter(printer_id));
        }

        let job = PrintJob::new(
            file_name.into(),
            printer_id,
            client_id.into(),
            hash_document(&document),
            document.len() as u64,
        );
        let id = job.id;
        info!(
            job_id = %id,
            printer = %printer_id,
            file = %job.file_name,
            bytes = job.total_bytes,
            "job queued"
        );

        inner.lock_history().push(job);
        inner.registry.update(printer_id.address(), |p| p.jobs_in_queue += 1);
        inner.publish(JobEvent {
            job_id: id,
            printer_id,
            status: JobStatus::Queued,
            failure: None,
        });

        let queued = QueuedJob {
            id,
            document,
            cancel: inner.lock_cancel().clone(),
        };
        inner.enqueue(printer_id, queued);
        Ok(id)
    }

    /// Recent jobs, most recent first.
    pub fn recent_jobs(&self) -> Vec<PrintJob> {
        self.inner.lock_history().jobs.iter().rev().cloned().collect()
    }

    pub fn get_job(&self, id: JobId) -> Option<PrintJob> {
        self.inner.lock_history().get(id).cloned()
    }

    /// Receive every job transition from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.inner.events.subscribe()
    }

    /// Fail every queued or printing job with `reason` and abort in-flight
    /// transmissions.  Returns the number of jobs failed.
    pub fn cancel_all(&self, reason: FailureReason) -> usize {
        let inner = &self.inner;
        let previous = std::mem::replace(&mut *inner.lock_cancel(), CancellationToken::new());
        previous.cancel();
        inner.lock_queues().clear();

        let active = inner.lock_history().active_ids();
        let failed: Vec<PrintJob> = active
            .into_iter()
            .filter_map(|id| inner.transition(id, JobStatus::Failed, Some(reason.clone()), None))
            .collect();
        for job in &failed {
            inner.registry.update(job.target_printer_id.address(), |printer| {
                if printer.status == PrinterStatus::Busy {
                    printer.status = PrinterStatus::Online;
                }
            });
        }
        let failed = failed.len();
        if failed > 0 {
            warn!(failed, %reason, "active jobs cancelled");
        }
        failed
    }
}

impl DispatcherInner {
    fn lock_history(&self) -> std::sync::MutexGuard<'_, JobHistory> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_queues(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<PrinterId, mpsc::UnboundedSender<QueuedJob>>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_cancel(&self) -> std::sync::MutexGuard<'_, CancellationToken> {
        self.cancel.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, event: JobEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Hand a job to its printer's worker, starting one if needed.
    fn enqueue(self: &Arc<Self>, printer_id: PrinterId, mut job: QueuedJob) {
        let mut queues = self.lock_queues();
        if let Some(sender) = queues.get(&printer_id) {
            match sender.send(job) {
                Ok(()) => return,
                Err(mpsc::error::SendError(returned)) => job = returned,
            }
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        // A fresh channel with its receiver alive cannot refuse a send.
        let _ = sender.send(job);
        queues.insert(printer_id, sender);
        tokio::spawn(printer_worker(Arc::downgrade(self), printer_id, receiver));
        debug!(printer = %printer_id, "printer worker started");
    }

    /// Apply a status change if the state machine allows it, together with
    /// the printer bookkeeping that goes with it.
    ///
    /// The registry is updated while the history lock is held, so a reader
    /// that sees the new job status also sees the printer's.  Returns the
    /// updated job, or `None` if the job is unknown or the transition is
    /// illegal (for instance, completing a job already failed).
    fn transition(
        &self,
        id: JobId,
        next: JobStatus,
        failure: Option<FailureReason>,
        printer_status: Option<PrinterStatus>,
    ) -> Option<PrintJob> {
        let updated = {
            let mut history = self.lock_history();
            let job = history.get_mut(id)?;
            if !job.status.can_transition_to(next) {
                debug!(job_id = %id, from = %job.status, to = %next, "transition refused");
                return None;
            }
            job.status = next;
            if next.is_terminal() {
                job.completed_at = Some(Utc::now());
                job.failure = failure.clone();
            }
            let updated = job.clone();

            self.registry.update(updated.target_printer_id.address(), |printer| {
                if next.is_terminal() {
                    printer.jobs_in_queue = printer.jobs_in_queue.saturating_sub(1);
                }
                if let Some(status) = printer_status {
                    printer.status = status;
                }
            });
            if next.is_terminal() {
                history.evict();
            }
            updated
        };

        self.publish(JobEvent {
            job_id: id,
            printer_id: updated.target_printer_id,
            status: next,
            failure,
        });
        Some(updated)
    }

    async fn run_job(&self, printer_id: PrinterId, queued: QueuedJob) {
        if queued.cancel.is_cancelled() {
            return;
        }

        let Some(printer) = self.registry.get_by_id(printer_id) else {
            warn!(job_id = %queued.id, printer = %printer_id, "printer no longer registered");
            self.transition(
                queued.id,
                JobStatus::Failed,
                Some(FailureReason::PrinterUnavailable),
                None,
            );
            return;
        };

        let Some(job) = self.transition(
            queued.id,
            JobStatus::Printing,
            None,
            Some(PrinterStatus::Busy),
        ) else {
            return;
        };
        info!(job_id = %job.id, printer = %printer_id, "printing");

        let outcome = tokio::select! {
            _ = queued.cancel.cancelled() => {
                debug!(job_id = %job.id, "transmission aborted");
                return;
            }
            result = self.transport.transmit(&printer, &job, &queued.document) => result,
        };

        match outcome {
            Ok(()) => {
                if self
                    .transition(job.id, JobStatus::Completed, None, Some(PrinterStatus::Online))
                    .is_some()
                {
                    info!(job_id = %job.id, "job completed");
                }
            }
            Err(e) => {
                error!(job_id = %job.id, printer = %printer_id, error = %e, "job failed");
                let reason = FailureReason::Transmission(e.to_string());
                self.transition(
                    job.id,
                    JobStatus::Failed,
                    Some(reason),
                    Some(PrinterStatus::Offline),
                );
            }
        }
    }
}

/// Processes one printer's queue in order until the dispatcher drops the
/// sender (on `cancel_all`) or is itself dropped.
async fn printer_worker(
    inner: Weak<DispatcherInner>,
    printer_id: PrinterId,
    mut receiver: mpsc::UnboundedReceiver<QueuedJob>,
) {
    while let Some(job) = receiver.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.run_job(printer_id, job).await;
    }
    debug!(printer = %printer_id, "printer worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    use printrelay_core::types::PrinterInfo;

    use crate::registry::{AddMode, PrinterRegistry};
    use crate::test_support::{ScriptedTransport, wait_for_job};

    fn printer_id(last: u8) -> PrinterId {
        PrinterId(IpAddr::V4(Ipv4Addr::new(10, 0, 0, last)))
    }

    fn registry_with(lasts: &[u8]) -> Arc<PrinterRegistry> {
        let registry = Arc::new(PrinterRegistry::new());
        for &last in lasts {
            let printer =
                Printer::from_findings(printer_id(last).address(), [9100], PrinterInfo::default());
            registry.add(printer, AddMode::Reject).expect("add");
        }
        registry
    }

    fn dispatcher(
        registry: &Arc<PrinterRegistry>,
        transport: &Arc<ScriptedTransport>,
        capacity: usize,
    ) -> JobDispatcher {
        JobDispatcher::new(Arc::clone(registry), transport.clone(), capacity)
    }

    #[tokio::test]
    async fn unknown_printer_is_rejected() {
        let registry = registry_with(&[5]);
        let transport = Arc::new(ScriptedTransport::new());
        let dispatcher = dispatcher(&registry, &transport, 5);

        let err = dispatcher
            .submit("a.pdf", vec![1], printer_id(6), "alice")
            .expect_err("unknown");
        assert!(matches!(err, PrintRelayError::UnknownPrinter(id) if id == printer_id(6)));
        assert!(dispatcher.recent_jobs().is_empty());
    }

    #[tokio::test]
    async fn job_records_hash_and_size() {
        let registry = registry_with(&[5]);
        let transport = Arc::new(ScriptedTransport::new());
        let dispatcher = dispatcher(&registry, &transport, 5);

        let id = dispatcher
            .submit("hello.txt", b"hello".to_vec(), printer_id(5), "alice")
            .expect("submit");
        let job = wait_for_job(&dispatcher, id, JobStatus::Completed).await;

        assert_eq!(job.total_bytes, 5);
        assert_eq!(
            job.document_hash,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert!(job.completed_at.is_some());
        assert_eq!(transport.delivered(), vec![(printer_id(5), "hello.txt".to_string())]);
    }

    #[tokio::test]
    async fn lifecycle_events_are_ordered() {
        let registry = registry_with(&[5]);
        let transport = Arc::new(ScriptedTransport::new());
        let dispatcher = dispatcher(&registry, &transport, 5);
        let mut events = dispatcher.subscribe();

        let id = dispatcher
            .submit("a.pdf", vec![0; 16], printer_id(5), "alice")
            .expect("submit");

        let mut seen = Vec::new();
        while seen.last() != Some(&JobStatus::Completed) {
            let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
                .await
                .expect("event in time")
                .expect("channel open");
            assert_eq!(event.job_id, id);
            seen.push(event.status);
        }
        assert_eq!(
            seen,
            vec![JobStatus::Queued, JobStatus::Printing, JobStatus::Completed]
        );
    }

    #[tokio::test]
    async fn jobs_for_one_printer_run_in_submission_order() {
        let registry = registry_with(&[5, 6]);
        let transport = Arc::new(ScriptedTransport::new().with_latency(Duration::from_millis(5)));
        let dispatcher = dispatcher(&registry, &transport, 20);

        let mut ids = Vec::new();
        for n in 0..6 {
            let target = if n % 2 == 0 { 5 } else { 6 };
            ids.push(
                dispatcher
                    .submit(format!("doc-{n}.pdf"), vec![n], printer_id(target), "alice")
                    .expect("submit"),
            );
        }
        for id in &ids {
            wait_for_job(&dispatcher, *id, JobStatus::Completed).await;
        }

        let to_five: Vec<String> = transport
            .delivered()
            .into_iter()
            .filter(|(printer, _)| *printer == printer_id(5))
            .map(|(_, name)| name)
            .collect();
        assert_eq!(to_five, vec!["doc-0.pdf", "doc-2.pdf", "doc-4.pdf"]);
    }

    #[tokio::test]
    async fn history_keeps_most_recent_terminal_jobs() {
        let registry = registry_with(&[5]);
        let transport = Arc::new(ScriptedTransport::new());
        let dispatcher = dispatcher(&registry, &transport, 2);

        let mut ids = Vec::new();
        for n in 0..4 {
            let id = dispatcher
                .submit(format!("{n}.txt"), vec![n], printer_id(5), "alice")
                .expect("submit");
            wait_for_job(&dispatcher, id, JobStatus::Completed).await;
            ids.push(id);
        }

        let recent: Vec<JobId> = dispatcher.recent_jobs().iter().map(|j| j.id).collect();
        assert_eq!(recent, vec![ids[3], ids[2]]);
        assert!(dispatcher.get_job(ids[0]).is_none());
    }

    #[tokio::test]
    async fn transmission_failure_marks_printer_offline() {
        let registry = registry_with(&[5]);
        let transport = Arc::new(ScriptedTransport::new().failing_for(printer_id(5)));
        let dispatcher = dispatcher(&registry, &transport, 5);

        let id = dispatcher
            .submit("a.pdf", vec![1], printer_id(5), "alice")
            .expect("submit");
        let job = wait_for_job(&dispatcher, id, JobStatus::Failed).await;

        assert!(matches!(job.failure, Some(FailureReason::Transmission(_))));
        let printer = registry.get_by_id(printer_id(5)).expect("printer");
        assert_eq!(printer.status, PrinterStatus::Offline);
        assert_eq!(printer.jobs_in_queue, 0);
    }

    #[tokio::test]
    async fn removed_printer_fails_queued_job() {
        let registry = registry_with(&[5]);
        let transport = Arc::new(ScriptedTransport::new().with_latency(Duration::from_millis(100)));
        let dispatcher = dispatcher(&registry, &transport, 5);

        let first = dispatcher
            .submit("first.pdf", vec![1], printer_id(5), "alice")
            .expect("submit");
        let second = dispatcher
            .submit("second.pdf", vec![2], printer_id(5), "alice")
            .expect("submit");
        wait_for_job(&dispatcher, first, JobStatus::Printing).await;
        registry.remove(printer_id(5).address());

        let job = wait_for_job(&dispatcher, second, JobStatus::Failed).await;
        assert_eq!(job.failure, Some(FailureReason::PrinterUnavailable));
    }

    #[tokio::test]
    async fn busy_while_printing_and_queue_counted() {
        let registry = registry_with(&[5]);
        let transport = Arc::new(ScriptedTransport::new().with_latency(Duration::from_millis(100)));
        let dispatcher = dispatcher(&registry, &transport, 5);

        let first = dispatcher
            .submit("a.pdf", vec![1], printer_id(5), "alice")
            .expect("submit");
        let second = dispatcher
            .submit("b.pdf", vec![2], printer_id(5), "bob")
            .expect("submit");
        wait_for_job(&dispatcher, first, JobStatus::Printing).await;

        let printer = registry.get_by_id(printer_id(5)).expect("printer");
        assert_eq!(printer.status, PrinterStatus::Busy);
        assert_eq!(printer.jobs_in_queue, 2);

        wait_for_job(&dispatcher, second, JobStatus::Completed).await;
        let printer = registry.get_by_id(printer_id(5)).expect("printer");
        assert_eq!(printer.status, PrinterStatus::Online);
        assert_eq!(printer.jobs_in_queue, 0);
    }

    #[tokio::test]
    async fn cancel_all_fails_queued_and_printing_jobs() {
        let registry = registry_with(&[5]);
        let transport = Arc::new(ScriptedTransport::new().with_latency(Duration::from_secs(30)));
        let dispatcher = dispatcher(&registry, &transport, 5);

        let printing = dispatcher
            .submit("a.pdf", vec![1], printer_id(5), "alice")
            .expect("submit");
        let queued = dispatcher
            .submit("b.pdf", vec![2], printer_id(5), "alice")
            .expect("submit");
        wait_for_job(&dispatcher, printing, JobStatus::Printing).await;

        assert_eq!(dispatcher.cancel_all(FailureReason::ServerStopped), 2);

        for id in [printing, queued] {
            let job = dispatcher.get_job(id).expect("job");
            assert_eq!(job.status, JobStatus::Failed);
            assert_eq!(job.failure, Some(FailureReason::ServerStopped));
        }
        let printer = registry.get_by_id(printer_id(5)).expect("printer");
        assert_eq!(printer.status, PrinterStatus::Online);
        assert_eq!(printer.jobs_in_queue, 0);

        // The dispatcher keeps working after a cancel.
        let fresh = dispatcher
            .submit("c.pdf", vec![3], printer_id(5), "alice")
            .expect("submit");
        assert_eq!(
            dispatcher.get_job(fresh).map(|j| j.status),
            Some(JobStatus::Queued)
        );
    }
}
