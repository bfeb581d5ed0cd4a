// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Protocol selection and fallback for job transmission.
//
// Chain: IPP (631) → LPR/LPD (515) → Raw TCP (9100)
//
// Only protocols whose port the scan found open are attempted.  A printer
// exposing none of the three ports cannot be delivered to.

use std::collections::BTreeSet;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tracing::{debug, info, warn};

use printrelay_core::error::{PrintRelayError, Result};
use printrelay_core::types::DocumentType;

use crate::ipp_client::IppClient;
use crate::{lpr_client, raw_client};

/// Supported print protocols, in preference order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrintProtocol {
    /// IPP/1.1 plain (port 631, ipp://).
    Ipp,
    /// LPR/LPD (RFC 1179, port 515).
    Lpr,
    /// Raw TCP socket (port 9100, JetDirect).
    RawTcp,
}

impl PrintProtocol {
    /// All protocols in preference order.
    pub fn chain() -> &'static [PrintProtocol] {
        &[PrintProtocol::Ipp, PrintProtocol::Lpr, PrintProtocol::RawTcp]
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Ipp => "IPP",
            Self::Lpr => "LPR/LPD",
            Self::RawTcp => "Direct TCP",
        }
    }

    /// Default port for this protocol.
    pub fn default_port(&self) -> u16 {
        match self {
            Self::Ipp => 631,
            Self::Lpr => lpr_client::LPR_PORT,
            Self::RawTcp => raw_client::RAW_PORT,
        }
    }
}

/// A protocol paired with the port it will be spoken on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub protocol: PrintProtocol,
    pub port: u16,
}

/// Order the ways a printer with `open_ports` can be reached.
pub fn select_routes(open_ports: &BTreeSet<u16>) -> Vec<Route> {
    PrintProtocol::chain()
        .iter()
        .filter(|p| open_ports.contains(&p.default_port()))
        .map(|&protocol| Route {
            protocol,
            port: protocol.default_port(),
        })
        .collect()
}

/// Everything needed to deliver one document.
#[derive(Debug, Clone, Copy)]
pub struct Delivery<'a> {
    pub document: &'a [u8],
    pub document_type: DocumentType,
    pub job_name: &'a str,
    pub lpd_queue: &'a str,
    pub timeout: Duration,
}

/// Send a print job using the specified protocol.
pub async fn send_via_protocol(addr: IpAddr, route: Route, delivery: &Delivery<'_>) -> Result<()> {
    let socket = SocketAddr::new(addr, route.port);
    match route.protocol {
        PrintProtocol::Ipp => {
            let client = IppClient::for_address(addr, route.port)?;
            let send = client.print_job(
                delivery.document.to_vec(),
                delivery.document_type,
                delivery.job_name,
            );
            tokio::time::timeout(delivery.timeout, send)
                .await
                .map_err(|_| {
                    PrintRelayError::Transmission(format!(
                        "IPP job to {socket} timed out after {}s",
                        delivery.timeout.as_secs()
                    ))
                })??;
            Ok(())
        }
        PrintProtocol::Lpr => {
            lpr_client::send_lpr(
                socket,
                delivery.lpd_queue,
                delivery.document,
                delivery.job_name,
                delivery.timeout,
            )
            .await
        }
        PrintProtocol::RawTcp => {
            raw_client::send_raw(socket, delivery.document, delivery.timeout).await
        }
    }
}

/// Deliver a document, stepping down the chain until one protocol succeeds.
///
/// Returns the protocol that delivered the job, or the last error.
pub async fn deliver(
    addr: IpAddr,
    open_ports: &BTreeSet<u16>,
    delivery: &Delivery<'_>,
) -> Result<PrintProtocol> {
    let routes = select_routes(open_ports);
    let mut last_error = PrintRelayError::Transmission(format!("no usable print port on {addr}"));

    for route in routes {
        match send_via_protocol(addr, route, delivery).await {
            Ok(()) => {
                info!(
                    protocol = route.protocol.display_name(),
                    %addr,
                    port = route.port,
                    "job delivered"
                );
                return Ok(route.protocol);
            }
            Err(e) => {
                debug!(
                    protocol = route.protocol.display_name(),
                    error = %e,
                    "delivery failed, trying next protocol"
                );
                last_error = e;
            }
        }
    }

    warn!(%addr, error = %last_error, "no protocol delivered the job");
    Err(last_error)
}
