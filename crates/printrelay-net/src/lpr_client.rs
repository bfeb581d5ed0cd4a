// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// LPR/LPD client (RFC 1179) for legacy printers.
//
// Two exchanges are supported: "receive a printer job" (0x02) for dispatch,
// and "send queue state (short)" (0x03) for identification.  Every stage of a
// job submission must be acknowledged with a single zero byte.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, instrument};

use printrelay_core::error::{PrintRelayError, Result};

/// Default LPR port.
pub const LPR_PORT: u16 = 515;

/// Host name announced in control files.
const HOSTNAME: &str = "printrelay";

/// Largest queue-state listing we read.
const MAX_QUEUE_STATE: usize = 4096;

/// RFC 1179 job numbers are three digits.
static NEXT_JOB_NUMBER: AtomicU16 = AtomicU16::new(1);

fn next_job_number() -> u16 {
    NEXT_JOB_NUMBER.fetch_add(1, Ordering::Relaxed) % 1000
}

/// Send a document via the LPR protocol.
#[instrument(skip(document_bytes), fields(total = document_bytes.len()))]
pub async fn send_lpr(
    addr: SocketAddr,
    queue: &str,
    document_bytes: &[u8],
    job_name: &str,
    timeout: Duration,
) -> Result<()> {
    let exchange = async {
        info!(%addr, queue, "connecting via LPR");
        let mut stream = TcpStream::connect(addr)
            .await
            .map_err(|e| lpr_error("connect", e))?;

        let job_number = next_job_number();
        let control_file = control_file(job_name, job_number);

        send_stage(&mut stream, format!("\x02{queue}\n").as_bytes(), "receive job").await?;

        let cf_header = format!("\x02{} cfA{job_number:03}{HOSTNAME}\n", control_file.len());
        send_stage(&mut stream, cf_header.as_bytes(), "control header").await?;
        send_terminated(&mut stream, control_file.as_bytes(), "control file").await?;

        let df_header = format!(
            "\x03{} dfA{job_number:03}{HOSTNAME}\n",
            document_bytes.len()
        );
        send_stage(&mut stream, df_header.as_bytes(), "data header").await?;
        send_terminated(&mut stream, document_bytes, "data file").await?;

        Ok::<_, PrintRelayError>(())
    };

    tokio::time::timeout(timeout, exchange).await.map_err(|_| {
        PrintRelayError::Transmission(format!(
            "LPR exchange with {addr} timed out after {}s",
            timeout.as_secs()
        ))
    })??;

    info!(job = job_name, "LPR job sent");
    Ok(())
}

/// Request the short queue state for `queue`.
///
/// Returns the trimmed listing, or `None` if the daemon answered with
/// nothing (or did not answer within `timeout`).
pub async fn query_queue_state(
    addr: SocketAddr,
    queue: &str,
    timeout: Duration,
) -> Result<Option<String>> {
    let exchange = async {
        let mut stream = TcpStream::connect(addr).await?;
        stream.write_all(format!("\x03{queue}\n").as_bytes()).await?;

        let mut buf = Vec::with_capacity(256);
        (&mut stream)
            .take(MAX_QUEUE_STATE as u64)
            .read_to_end(&mut buf)
            .await?;
        Ok::<_, std::io::Error>(String::from_utf8_lossy(&buf).trim().to_string())
    };

    match tokio::time::timeout(timeout, exchange).await {
        Ok(Ok(text)) if text.is_empty() => Ok(None),
        Ok(Ok(text)) => Ok(Some(text)),
        Ok(Err(e)) => Err(PrintRelayError::Identify(format!("LPD query to {addr}: {e}"))),
        Err(_) => {
            debug!(%addr, "no LPD queue state before timeout");
            Ok(None)
        }
    }
}

fn control_file(job_name: &str, job_number: u16) -> String {
    format!(
        "H{HOSTNAME}\nP{HOSTNAME}\nJ{job_name}\nldfA{job_number:03}{HOSTNAME}\n\
         UdfA{job_number:03}{HOSTNAME}\nN{job_name}\n"
    )
}

async fn send_stage(stream: &mut TcpStream, bytes: &[u8], stage: &str) -> Result<()> {
    stream
        .write_all(bytes)
        .await
        .map_err(|e| lpr_error(stage, e))?;
    expect_ack(stream, stage).await
}

/// Send a file body followed by the zero-byte terminator, then wait for the ack.
async fn send_terminated(stream: &mut TcpStream, bytes: &[u8], stage: &str) -> Result<()> {
    stream
        .write_all(bytes)
        .await
        .map_err(|e| lpr_error(stage, e))?;
    send_stage(stream, &[0], stage).await
}

async fn expect_ack(stream: &mut TcpStream, stage: &str) -> Result<()> {
    let mut ack = [0u8; 1];
    stream
        .read_exact(&mut ack)
        .await
        .map_err(|e| lpr_error(stage, e))?;
    if ack[0] != 0 {
        return Err(PrintRelayError::Transmission(format!(
            "LPR {stage} rejected (ack {:#04x})",
            ack[0]
        )));
    }
    Ok(())
}

fn lpr_error(stage: &str, e: std::io::Error) -> PrintRelayError {
    PrintRelayError::Transmission(format!("LPR {stage}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;

    /// Minimal LPD that acknowledges every stage and returns the data file.
    async fn fake_lpd(listener: TcpListener, reject_job: bool) -> Vec<u8> {
        let (socket, _) = listener.accept().await.expect("accept");
        let mut reader = BufReader::new(socket);

        let mut line = String::new();
        reader.read_line(&mut line).await.expect("command");
        assert_eq!(line, "\x02lp\n");
        if reject_job {
            reader.get_mut().write_all(&[1]).await.expect("nack");
            return Vec::new();
        }
        reader.get_mut().write_all(&[0]).await.expect("ack");

        let mut data = Vec::new();
        for _ in 0..2 {
            line.clear();
            reader.read_line(&mut line).await.expect("subcommand");
            let len: usize = line[1..]
                .split(' ')
                .next()
                .and_then(|n| n.parse().ok())
                .expect("length");
            reader.get_mut().write_all(&[0]).await.expect("ack");

            let mut body = vec![0u8; len + 1];
            reader.read_exact(&mut body).await.expect("body");
            assert_eq!(body.pop(), Some(0));
            reader.get_mut().write_all(&[0]).await.expect("ack");
            data = body;
        }
        data
    }

    #[tokio::test]
    async fn send_lpr_completes_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let server = tokio::spawn(fake_lpd(listener, false));

        send_lpr(addr, "lp", b"%!PS\nshowpage\n", "memo.ps", Duration::from_secs(5))
            .await
            .expect("send");

        assert_eq!(server.await.expect("join"), b"%!PS\nshowpage\n");
    }

    #[tokio::test]
    async fn rejected_job_is_transmission_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(fake_lpd(listener, true));

        let err = send_lpr(addr, "lp", b"data", "job", Duration::from_secs(5))
            .await
            .expect_err("should be rejected");
        assert!(matches!(err, PrintRelayError::Transmission(_)));
    }

    #[tokio::test]
    async fn queue_state_returns_listing() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accept");
            let mut buf = [0u8; 64];
            let _ = socket.read(&mut buf).await;
            socket.write_all(b"lp is ready\nno entries\n").await.expect("write");
        });

        let state = query_queue_state(addr, "lp", Duration::from_secs(2))
            .await
            .expect("query");
        assert_eq!(state.as_deref(), Some("lp is ready\nno entries"));
    }

    #[tokio::test]
    async fn empty_queue_state_is_none() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accept");
            let mut buf = [0u8; 64];
            let _ = socket.read(&mut buf).await;
            drop(socket);
        });

        let state = query_queue_state(addr, "lp", Duration::from_secs(2))
            .await
            .expect("query");
        assert_eq!(state, None);
    }
}
