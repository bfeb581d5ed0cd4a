// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Printer identification over the protocol behind an open port.
//
//   631  IPP        Get-Printer-Attributes
//   9100 JetDirect  PJL INFO ID
//   515  LPD        short queue state
//
// Every field in the returned `PrinterInfo` was reported by the device.  A
// silent JetDirect or LPD port yields no record at all, and the scanner keeps
// the host with unknown identity.  A failed IPP exchange still yields the
// generic IPP record.  Nothing is derived from the address.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use printrelay_core::types::{Capability, PrinterInfo};

use crate::ipp_client::{IppClient, PrinterAttributes};
use crate::{lpr_client, raw_client};

/// Learns what a device behind an open port is.
#[async_trait]
pub trait PrinterIdentifier: Send + Sync {
    /// Identify the device at `addr` through `port`.
    ///
    /// `None` means the exchange produced nothing usable; the caller keeps the
    /// host as a printer of unknown identity.
    async fn identify(&self, addr: IpAddr, port: u16) -> Option<PrinterInfo>;
}

/// Identifies printers by speaking IPP, PJL and LPD.
#[derive(Debug, Clone)]
pub struct ProtocolIdentifier {
    timeout: Duration,
    lpd_queue: String,
}

impl ProtocolIdentifier {
    pub fn new(timeout: Duration, lpd_queue: impl Into<String>) -> Self {
        Self {
            timeout,
            lpd_queue: lpd_queue.into(),
        }
    }

    /// Query IPP attributes, falling back to generic IPP capabilities.
    pub async fn identify_ipp(&self, addr: SocketAddr) -> PrinterInfo {
        let generic = || PrinterInfo::generic([Capability::Print, Capability::Duplex]);

        let client = match IppClient::for_address(addr.ip(), addr.port()) {
            Ok(client) => client,
            Err(e) => {
                debug!(%addr, error = %e, "IPP client construction failed");
                return generic();
            }
        };

        match tokio::time::timeout(self.timeout, client.get_printer_attributes()).await {
            Ok(Ok(attrs)) => info_from_ipp_attributes(&attrs),
            Ok(Err(e)) => {
                debug!(%addr, error = %e, "IPP identification failed");
                generic()
            }
            Err(_) => {
                debug!(%addr, "IPP identification timed out");
                generic()
            }
        }
    }

    /// Ask a JetDirect port for its PJL model string.
    ///
    /// `None` when the device stays silent.  Color is never reported here:
    /// PJL `INFO ID` does not say.
    pub async fn identify_jetdirect(&self, addr: SocketAddr) -> Option<PrinterInfo> {
        let model = raw_client::query_pjl_id(addr, self.timeout)
            .await
            .unwrap_or_else(|e| {
                debug!(%addr, error = %e, "PJL identification failed");
                None
            })?;
        Some(PrinterInfo {
            model: Some(model),
            ..PrinterInfo::generic([Capability::Print])
        })
    }

    /// Request the LPD short queue state and keep it as status text.
    ///
    /// `None` when the daemon answers with nothing.
    pub async fn identify_lpd(&self, addr: SocketAddr) -> Option<PrinterInfo> {
        let status_text = lpr_client::query_queue_state(addr, &self.lpd_queue, self.timeout)
            .await
            .unwrap_or_else(|e| {
                debug!(%addr, error = %e, "LPD identification failed");
                None
            })?;
        Some(PrinterInfo {
            status_text: Some(status_text),
            ..PrinterInfo::generic([Capability::Print])
        })
    }
}

#[async_trait]
impl PrinterIdentifier for ProtocolIdentifier {
    async fn identify(&self, addr: IpAddr, port: u16) -> Option<PrinterInfo> {
        let socket = SocketAddr::new(addr, port);
        match port {
            631 => Some(self.identify_ipp(socket).await),
            raw_client::RAW_PORT => self.identify_jetdirect(socket).await,
            lpr_client::LPR_PORT => self.identify_lpd(socket).await,
            _ => Some(PrinterInfo::generic([Capability::Print])),
        }
    }
}

/// Map Get-Printer-Attributes values onto a `PrinterInfo`.
pub fn info_from_ipp_attributes(attrs: &PrinterAttributes) -> PrinterInfo {
    let text = |name: &str| {
        attrs
            .get(name)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };

    let mut info = PrinterInfo {
        name: text("printer-name"),
        model: text("printer-make-and-model"),
        location: text("printer-location"),
        manufacturer: text("printer-device-id").and_then(|id| device_id_field(&id, "MFG")),
        status_text: text("printer-state-message"),
        ..Default::default()
    };

    info.capabilities.insert(Capability::Print);
    if text("sides-supported").is_some_and(|sides| sides.contains("two-sided")) {
        info.capabilities.insert(Capability::Duplex);
    }
    if text("color-supported").is_some_and(|c| c.eq_ignore_ascii_case("true")) {
        info.capabilities.insert(Capability::Color);
    }
    info
}

/// Read one key from an IEEE 1284 device id (`MFG:HP;MDL:LaserJet;`).
/// Both long (`MANUFACTURER`) and short (`MFG`) keys are accepted.
fn device_id_field(device_id: &str, key: &str) -> Option<String> {
    let long = match key {
        "MFG" => Some("MANUFACTURER"),
        "MDL" => Some("MODEL"),
        _ => None,
    };
    device_id
        .split(';')
        .filter_map(|pair| pair.split_once(':'))
        .find(|(k, _)| {
            let k = k.trim();
            k.eq_ignore_ascii_case(key) || long.is_some_and(|l| k.eq_ignore_ascii_case(l))
        })
        .map(|(_, v)| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::net::Ipv4Addr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn identifier() -> ProtocolIdentifier {
        ProtocolIdentifier::new(Duration::from_millis(500), "lp")
    }

    fn attrs(pairs: &[(&str, &str)]) -> PrinterAttributes {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn ipp_attributes_map_to_info() {
        let info = info_from_ipp_attributes(&attrs(&[
            ("printer-name", "Office-IPP"),
            ("printer-make-and-model", "HP Color LaserJet MFP M283fdw"),
            ("printer-location", "2nd floor"),
            ("printer-device-id", "MFG:HP;MDL:Color LaserJet;CMD:PCL,PDF;"),
            ("sides-supported", "one-sided, two-sided-long-edge, two-sided-short-edge"),
            ("color-supported", "true"),
        ]));

        assert_eq!(info.name.as_deref(), Some("Office-IPP"));
        assert_eq!(info.model.as_deref(), Some("HP Color LaserJet MFP M283fdw"));
        assert_eq!(info.location.as_deref(), Some("2nd floor"));
        assert_eq!(info.manufacturer.as_deref(), Some("HP"));
        assert_eq!(
            info.capabilities,
            BTreeSet::from([Capability::Print, Capability::Duplex, Capability::Color])
        );
    }

    #[test]
    fn one_sided_monochrome_printer_has_print_only() {
        let info = info_from_ipp_attributes(&attrs(&[
            ("printer-name", "Basement"),
            ("sides-supported", "one-sided"),
            ("color-supported", "false"),
            ("printer-location", "  "),
        ]));
        assert_eq!(info.capabilities, BTreeSet::from([Capability::Print]));
        assert_eq!(info.location, None);
        assert_eq!(info.manufacturer, None);
    }

    #[test]
    fn device_id_accepts_long_keys() {
        assert_eq!(
            device_id_field("MANUFACTURER:Brother;MODEL:HL-L2350DW;", "MFG").as_deref(),
            Some("Brother")
        );
        assert_eq!(device_id_field("MDL:X;", "MFG"), None);
    }

    #[tokio::test]
    async fn ipp_failure_falls_back_to_generic_ipp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            // Accept and hang up without an HTTP response.
            let (socket, _) = listener.accept().await.expect("accept");
            drop(socket);
        });

        let info = identifier().identify_ipp(addr).await;
        assert!(!info.has_identity());
        assert_eq!(
            info.capabilities,
            BTreeSet::from([Capability::Print, Capability::Duplex])
        );
    }

    #[tokio::test]
    async fn jetdirect_reports_pjl_model_without_color() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accept");
            let mut buf = [0u8; 128];
            let _ = socket.read(&mut buf).await;
            socket
                .write_all(b"@PJL INFO ID\r\n\"HP Color LaserJet CP2025\"\r\n\x0c")
                .await
                .expect("write");
        });

        let info = identifier().identify_jetdirect(addr).await.expect("reply");
        assert_eq!(info.model.as_deref(), Some("HP Color LaserJet CP2025"));
        assert!(!info.capabilities.contains(&Capability::Color));
        assert_eq!(info.manufacturer, None);
    }

    #[tokio::test]
    async fn silent_jetdirect_is_not_identified() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.expect("accept");
            tokio::time::sleep(Duration::from_secs(2)).await;
            drop(socket);
        });

        assert_eq!(identifier().identify_jetdirect(addr).await, None);
    }

    #[tokio::test]
    async fn lpd_status_text_is_kept() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accept");
            let mut buf = [0u8; 64];
            let _ = socket.read(&mut buf).await;
            socket.write_all(b"lp is ready and printing\n").await.expect("write");
        });

        let info = identifier().identify_lpd(addr).await.expect("reply");
        assert_eq!(info.status_text.as_deref(), Some("lp is ready and printing"));
        assert!(!info.has_identity());
    }

    #[tokio::test]
    async fn empty_lpd_reply_is_not_identified() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accept");
            let mut buf = [0u8; 64];
            let _ = socket.read(&mut buf).await;
        });

        assert_eq!(identifier().identify_lpd(addr).await, None);
    }

    #[tokio::test]
    async fn other_ports_get_generic_print_record() {
        let info = identifier()
            .identify(IpAddr::V4(Ipv4Addr::LOCALHOST), 2000)
            .await
            .expect("generic record");
        assert_eq!(info, PrinterInfo::generic([Capability::Print]));
    }
}
