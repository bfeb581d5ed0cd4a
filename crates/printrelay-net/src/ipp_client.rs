// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// IPP client.
//
// The relay needs two operations: Get-Printer-Attributes to identify a
// printer on port 631, and Print-Job to hand it a document.

use std::collections::HashMap;
use std::io::Cursor;
use std::net::{IpAddr, SocketAddr};

use ipp::operation::IppOperation;
use ipp::prelude::*;
use tracing::{debug, info, instrument, warn};

use printrelay_core::error::{PrintRelayError, Result};
use printrelay_core::types::DocumentType;

/// Resource path used by IPP Everywhere printers and CUPS queues alike.
pub const DEFAULT_RESOURCE_PATH: &str = "ipp/print";

/// Printer attributes by name, each rendered as display text.
pub type PrinterAttributes = HashMap<String, String>;

/// Talks IPP to one printer.
pub struct IppClient {
    uri: Uri,
}

impl IppClient {
    pub fn new(uri: &str) -> Result<Self> {
        let uri: Uri = uri
            .parse()
            .map_err(|e| PrintRelayError::IppRequest(format!("invalid URI '{uri}': {e}")))?;
        Ok(Self { uri })
    }

    /// Client for `ipp://<addr>:<port>/ipp/print`.
    pub fn for_address(addr: IpAddr, port: u16) -> Result<Self> {
        Self::new(&printer_uri(addr, port))
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// Get-Printer-Attributes, flattened across all groups.
    #[instrument(skip(self), fields(uri = %self.uri))]
    pub async fn get_printer_attributes(&self) -> Result<PrinterAttributes> {
        let request = IppOperationBuilder::get_printer_attributes(self.uri.clone()).build();
        let response = self.exchange("Get-Printer-Attributes", request).await?;

        let attrs: PrinterAttributes = response
            .attributes()
            .groups()
            .iter()
            .flat_map(|group| group.attributes().iter())
            .map(|(name, attr)| (name.clone(), attr.value().to_string()))
            .collect();
        debug!(count = attrs.len(), "printer attributes received");
        Ok(attrs)
    }

    /// Print-Job.  Returns the job-id the printer assigned.
    #[instrument(skip(self, document), fields(uri = %self.uri, bytes = document.len()))]
    pub async fn print_job(
        &self,
        document: Vec<u8>,
        document_type: DocumentType,
        job_name: &str,
    ) -> Result<i32> {
        let request =
            IppOperationBuilder::print_job(self.uri.clone(), IppPayload::new(Cursor::new(document)))
                .job_title(job_name)
                .document_format(document_type.mime_type())
                .build();
        let response = self.exchange("Print-Job", request).await?;

        let job_id = assigned_job_id(response.attributes()).ok_or_else(|| {
            PrintRelayError::IppRequest("Print-Job response carried no job-id".into())
        })?;
        info!(job_id, job_name, "printer accepted job");
        Ok(job_id)
    }

    /// Send one operation and insist on a successful status code.
    async fn exchange<T: IppOperation>(
        &self,
        operation: &str,
        request: T,
    ) -> Result<IppRequestResponse> {
        let response = AsyncIppClient::new(self.uri.clone())
            .send(request)
            .await
            .map_err(|e| PrintRelayError::IppRequest(format!("{operation}: {e}")))?;

        let status = response.header().status_code();
        if !status.is_success() {
            warn!(operation, ?status, "IPP request rejected");
            return Err(PrintRelayError::IppRequest(format!(
                "{operation} returned status {status:?}"
            )));
        }
        Ok(response)
    }
}

/// Printer URI for an address, with IPv6 hosts bracketed.
pub fn printer_uri(addr: IpAddr, port: u16) -> String {
    format!("ipp://{}/{DEFAULT_RESOURCE_PATH}", SocketAddr::new(addr, port))
}

fn assigned_job_id(attrs: &IppAttributes) -> Option<i32> {
    attrs
        .groups_of(DelimiterTag::JobAttributes)
        .find_map(|group| match group.attributes().get("job-id")?.value() {
            IppValue::Integer(id) => Some(*id),
            _ => None,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn new_rejects_invalid_uri() {
        assert!(IppClient::new("not a valid uri %%%").is_err());
    }

    #[test]
    fn uri_for_ipv4_address() {
        let uri = printer_uri(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)), 631);
        assert_eq!(uri, "ipp://10.0.0.5:631/ipp/print");
        assert!(IppClient::new(&uri).is_ok());
    }

    #[test]
    fn uri_brackets_ipv6_address() {
        let uri = printer_uri(IpAddr::V6(Ipv6Addr::LOCALHOST), 631);
        assert_eq!(uri, "ipp://[::1]:631/ipp/print");
    }

    #[tokio::test]
    async fn dropped_connection_is_an_ipp_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.expect("accept");
            drop(socket);
        });

        let client = IppClient::for_address(addr.ip(), addr.port()).expect("client");
        let err = client
            .get_printer_attributes()
            .await
            .expect_err("no IPP response");
        assert!(matches!(err, PrintRelayError::IppRequest(_)));
    }
}
