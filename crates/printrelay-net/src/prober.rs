// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// TCP reachability probe for a single (host, port) pair.
//
// A refused connection, an unreachable host, and a timeout all mean "closed".
// None of them is an error: most addresses on a subnet are not printers.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::trace;

/// Tests whether a TCP port accepts connections.
#[async_trait]
pub trait PortProber: Send + Sync {
    /// Return `true` if a connection to `addr` succeeds within `timeout`.
    ///
    /// Implementations must return within `timeout` and must be safe to
    /// drop mid-flight (a cancelled scan aborts outstanding probes).
    async fn probe(&self, addr: SocketAddr, timeout: Duration) -> bool;
}

/// Probes with a real `connect()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpProber;

#[async_trait]
impl PortProber for TcpProber {
    async fn probe(&self, addr: SocketAddr, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(_stream)) => {
                trace!(%addr, "port open");
                true
            }
            Ok(Err(e)) => {
                trace!(%addr, error = %e, "port closed");
                false
            }
            Err(_elapsed) => {
                trace!(%addr, "probe timed out");
                false
            }
        }
    }
}
