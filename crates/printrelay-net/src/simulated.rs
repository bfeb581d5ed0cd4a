// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// In-memory network for exercising discovery without sockets.
//
// Hosts and their open ports are declared up front (and may change while a
// scan is running).  Every probe is counted, and the number of concurrent
// probe/identify calls is tracked so callers can check the scanner's bound.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;

use printrelay_core::types::PrinterInfo;

use crate::identify::PrinterIdentifier;
use crate::prober::PortProber;

/// What an open port answers to identification.
pub type PortResponse = Option<PrinterInfo>;

/// A scripted network of hosts and open ports.
#[derive(Debug, Default)]
pub struct SimulatedNetwork {
    hosts: RwLock<HashMap<IpAddr, HashMap<u16, PortResponse>>>,
    latency: Duration,
    probes: AtomicUsize,
    identifies: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    visits: Mutex<HashMap<SocketAddr, usize>>,
}

impl SimulatedNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every probe and identification by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Open `port` on `addr`; `response` is what identification returns.
    pub fn with_port(self, addr: impl Into<IpAddr>, port: u16, response: PortResponse) -> Self {
        self.open_port(addr, port, response);
        self
    }

    pub fn open_port(&self, addr: impl Into<IpAddr>, port: u16, response: PortResponse) {
        self.hosts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(addr.into())
            .or_default()
            .insert(port, response);
    }

    /// Take a host off the network entirely.
    pub fn remove_host(&self, addr: impl Into<IpAddr>) {
        self.hosts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&addr.into());
    }

    /// Total probes issued.
    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    /// Total identification calls.
    pub fn identify_count(&self) -> usize {
        self.identifies.load(Ordering::SeqCst)
    }

    /// Highest number of probe/identify calls observed running at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// How many times `addr` was probed.
    pub fn visits(&self, addr: SocketAddr) -> usize {
        self.visits
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&addr)
            .copied()
            .unwrap_or(0)
    }

    /// Every probed socket address with its probe count.
    pub fn all_visits(&self) -> HashMap<SocketAddr, usize> {
        self.visits
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn reset_counters(&self) {
        self.probes.store(0, Ordering::SeqCst);
        self.identifies.store(0, Ordering::SeqCst);
        self.max_in_flight.store(0, Ordering::SeqCst);
        self.visits
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn response(&self, addr: SocketAddr) -> Option<PortResponse> {
        self.hosts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&addr.ip())
            .and_then(|ports| ports.get(&addr.port()).cloned())
    }

    fn enter(&self) -> InFlight<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        InFlight(&self.in_flight)
    }
}

/// Decrements the in-flight gauge on drop, including when the call is aborted.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl PortProber for SimulatedNetwork {
    async fn probe(&self, addr: SocketAddr, timeout: Duration) -> bool {
        let _guard = self.enter();
        self.probes.fetch_add(1, Ordering::SeqCst);
        *self
            .visits
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(addr)
            .or_insert(0) += 1;

        if self.latency > timeout {
            tokio::time::sleep(timeout).await;
            return false;
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.response(addr).is_some()
    }
}

#[async_trait]
impl PrinterIdentifier for SimulatedNetwork {
    async fn identify(&self, addr: IpAddr, port: u16) -> Option<PrinterInfo> {
        let _guard = self.enter();
        self.identifies.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.response(SocketAddr::new(addr, port)).flatten()
    }
}
