// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Local network detection.

use std::net::{IpAddr, Ipv4Addr, UdpSocket};

use tracing::{debug, info};

use printrelay_core::error::{PrintRelayError, Result};
use printrelay_core::types::NetworkInfo;

/// Public address used only to select the outbound route; no packet is sent.
const ROUTE_PROBE_TARGET: &str = "8.8.8.8:53";

/// Find the IPv4 address of the interface that carries the default route.
///
/// Connecting a UDP socket only asks the kernel to pick a source address,
/// so this works offline as long as a default route exists.
pub fn detect_local_ipv4() -> Result<Ipv4Addr> {
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.connect(ROUTE_PROBE_TARGET)?;

    match socket.local_addr()?.ip() {
        IpAddr::V4(addr) if !addr.is_loopback() && !addr.is_unspecified() => {
            debug!(%addr, "detected local address");
            Ok(addr)
        }
        other => Err(PrintRelayError::InvalidAddress(format!(
            "no usable IPv4 interface (kernel chose {other})"
        ))),
    }
}

/// Resolve the relay's network position, preferring an explicit override.
pub fn resolve_network_info(local_override: Option<Ipv4Addr>) -> Result<NetworkInfo> {
    let local = match local_override {
        Some(addr) => addr,
        None => detect_local_ipv4()?,
    };
    let info = NetworkInfo::new(local);
    info!(local = %info.local_address, subnet = %info.subnet, "network resolved");
    Ok(info)
}
