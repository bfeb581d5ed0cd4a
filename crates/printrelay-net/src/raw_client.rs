// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Raw TCP print client (JetDirect, port 9100).
//
// The protocol has no negotiation: open a socket and stream bytes.  The only
// query available is vendor-specific; we use PJL `INFO ID`, which most
// laser printers on 9100 answer with their model string.  Silence is normal
// and means "unknown", never a reason to guess.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, instrument};

use printrelay_core::error::{PrintRelayError, Result};

/// Default raw TCP port (HP JetDirect).
pub const RAW_PORT: u16 = 9100;

/// PJL identification request wrapped in Universal Exit Language sequences.
const PJL_INFO_ID: &[u8] = b"\x1B%-12345X@PJL INFO ID\r\n\x1B%-12345X";

/// Largest PJL reply we read.
const MAX_PJL_REPLY: usize = 1024;

/// Chunk size for streaming documents.
const CHUNK_SIZE: usize = 8192;

/// Stream document bytes to a printer via raw TCP.
///
/// `timeout` bounds the whole exchange, so a printer that accepts the
/// connection and then stops reading fails the job.
#[instrument(skip(document_bytes), fields(total = document_bytes.len()))]
pub async fn send_raw(addr: SocketAddr, document_bytes: &[u8], timeout: Duration) -> Result<()> {
    info!(%addr, "connecting via raw TCP");
    let exchange = async {
        let mut stream = TcpStream::connect(addr).await.map_err(|e| {
            PrintRelayError::Transmission(format!("raw TCP connect to {addr}: {e}"))
        })?;

        let mut sent = 0usize;
        for chunk in document_bytes.chunks(CHUNK_SIZE) {
            stream.write_all(chunk).await.map_err(|e| {
                PrintRelayError::Transmission(format!("raw TCP send failed at byte {sent}: {e}"))
            })?;
            sent += chunk.len();
            debug!(sent, total = document_bytes.len(), "raw TCP progress");
        }

        stream
            .flush()
            .await
            .map_err(|e| PrintRelayError::Transmission(format!("raw TCP flush: {e}")))?;
        stream
            .shutdown()
            .await
            .map_err(|e| PrintRelayError::Transmission(format!("raw TCP shutdown: {e}")))?;
        Ok::<_, PrintRelayError>(())
    };

    tokio::time::timeout(timeout, exchange).await.map_err(|_| {
        PrintRelayError::Transmission(format!(
            "raw TCP exchange with {addr} timed out after {}ms",
            timeout.as_millis()
        ))
    })??;

    info!(total = document_bytes.len(), "raw TCP job sent");
    Ok(())
}

/// Ask a JetDirect port for its PJL model string.
///
/// Returns `Ok(None)` if the device accepts the connection but does not
/// answer (or answers with something that is not a PJL ID reply).
pub async fn query_pjl_id(addr: SocketAddr, timeout: Duration) -> Result<Option<String>> {
    let exchange = async {
        let mut stream = TcpStream::connect(addr).await?;
        stream.write_all(PJL_INFO_ID).await?;

        let mut buf = vec![0u8; MAX_PJL_REPLY];
        let mut filled = 0;
        // Replies end with a form feed; stop there or when the peer closes.
        while filled < buf.len() {
            let n = stream.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
            if buf[..filled].contains(&0x0c) {
                break;
            }
        }
        Ok::<_, std::io::Error>(String::from_utf8_lossy(&buf[..filled]).into_owned())
    };

    match tokio::time::timeout(timeout, exchange).await {
        Ok(Ok(reply)) => Ok(parse_pjl_id(&reply)),
        Ok(Err(e)) => Err(PrintRelayError::Identify(format!("PJL query to {addr}: {e}"))),
        Err(_) => {
            debug!(%addr, "no PJL reply before timeout");
            Ok(None)
        }
    }
}

/// Extract the model string from a PJL `INFO ID` reply.
///
/// A well-formed reply echoes the command and puts the (usually quoted)
/// model on the next line:
///
/// ```text
/// @PJL INFO ID
/// "HP LaserJet 4250"
/// <FF>
/// ```
pub fn parse_pjl_id(reply: &str) -> Option<String> {
    let mut lines = reply
        .split(['\r', '\n', '\x0c'])
        .map(str::trim)
        .filter(|l| !l.is_empty());

    lines.find(|l| l.to_ascii_uppercase().starts_with("@PJL INFO ID"))?;
    let model = lines.next()?.trim_matches('"').trim();

    if model.is_empty() || model.starts_with('@') || model.chars().any(char::is_control) {
        return None;
    }
    Some(model.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn parses_quoted_model() {
        let reply = "@PJL INFO ID\r\n\"HP LaserJet 4250\"\r\n\x0c";
        assert_eq!(parse_pjl_id(reply).as_deref(), Some("HP LaserJet 4250"));
    }

    #[test]
    fn rejects_reply_without_echo() {
        assert_eq!(parse_pjl_id("HP LaserJet\r\n"), None);
        assert_eq!(parse_pjl_id(""), None);
    }

    #[test]
    fn rejects_echo_without_model() {
        assert_eq!(parse_pjl_id("@PJL INFO ID\r\n\x0c"), None);
    }

    #[tokio::test]
    async fn send_raw_delivers_all_bytes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");

        let receiver = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accept");
            let mut received = Vec::new();
            socket.read_to_end(&mut received).await.expect("read");
            received
        });

        let document: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        send_raw(addr, &document, Duration::from_secs(5))
            .await
            .expect("send");

        assert_eq!(receiver.await.expect("join"), document);
    }

    #[tokio::test]
    async fn stalled_printer_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");

        // Accept, then never read, so the send buffers fill up.
        let holder = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.expect("accept");
            tokio::time::sleep(Duration::from_secs(10)).await;
            drop(socket);
        });

        let document = vec![0u8; 64 * 1024 * 1024];
        let started = std::time::Instant::now();
        let err = send_raw(addr, &document, Duration::from_millis(200))
            .await
            .expect_err("stalled send");

        assert!(matches!(err, PrintRelayError::Transmission(_)));
        assert!(started.elapsed() < Duration::from_secs(2));
        holder.abort();
    }

    #[tokio::test]
    async fn query_pjl_id_reads_model() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accept");
            let mut buf = [0u8; 128];
            let _ = socket.read(&mut buf).await;
            socket
                .write_all(b"@PJL INFO ID\r\n\"Brother HL-L2350DW\"\r\n\x0c")
                .await
                .expect("write");
        });

        let model = query_pjl_id(addr, Duration::from_secs(2)).await.expect("query");
        assert_eq!(model.as_deref(), Some("Brother HL-L2350DW"));
    }

    #[tokio::test]
    async fn silent_device_yields_none() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");

        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.expect("accept");
            tokio::time::sleep(Duration::from_secs(2)).await;
            drop(socket);
        });

        let model = query_pjl_id(addr, Duration::from_millis(200))
            .await
            .expect("query");
        assert_eq!(model, None);
    }
}
