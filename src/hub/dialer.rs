//! Dialing and the NTRIP handshake.
//!
//! Opening a source is a TCP connect bounded by the source's configured
//! timeout, followed (for `ntrip://` sources) by an HTTP/1.0 GET on the
//! mountpoint path with Basic auth. The caster's reply is validated
//! three ways before the stream is accepted:
//!
//! - a reply starting with `HTTP` is a status line, i.e. a denial
//! - a reply containing `SOURCETABLE` means the mountpoint carries no
//!   live data
//! - anything not starting with `ICY 200 OK` is not an NTRIP stream
//!
//! Failures are retried a fixed number of times with a fixed delay, all
//! within one reconciliation cycle; giving up here is what feeds the
//! poller's circuit breaker.

use crate::source::{Scheme, SourceUrl};
use crate::{HubError, Result};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::warn;

/// Size of each socket read, for the handshake reply and for streaming.
pub const RECV_BUFFER_SIZE: usize = 4096;

/// How long to wait for the caster's handshake reply.
const HANDSHAKE_WAIT: Duration = Duration::from_secs(1);

const USER_AGENT: &str = "Ntrip NtripHub/0.1";

/// Dial a source, retrying up to `attempts` times with `retry_delay`
/// between tries. Returns the connected, handshake-validated socket.
pub async fn dial(
    url: &SourceUrl,
    connect_timeout: Duration,
    attempts: u32,
    retry_delay: Duration,
) -> Result<TcpStream> {
    let mut last_err = HubError::Handshake("no dial attempts made".to_string());

    for attempt in 1..=attempts {
        match dial_once(url, connect_timeout).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                warn!(
                    "{}: dial attempt {}/{} failed: {}",
                    url.path(),
                    attempt,
                    attempts,
                    e
                );
                last_err = e;
                if attempt < attempts {
                    tokio::time::sleep(retry_delay).await;
                }
            }
        }
    }

    Err(last_err)
}

async fn dial_once(url: &SourceUrl, connect_timeout: Duration) -> Result<TcpStream> {
    let mut stream = timeout(
        connect_timeout,
        TcpStream::connect((url.host.as_str(), url.port)),
    )
    .await
    .map_err(|_| HubError::DialTimeout(connect_timeout))??;

    if url.scheme == Scheme::Ntrip {
        handshake(&mut stream, url).await?;
    }

    Ok(stream)
}

async fn handshake(stream: &mut TcpStream, url: &SourceUrl) -> Result<()> {
    let mut request = format!(
        "GET {} HTTP/1.0\r\nUser-Agent: {}\r\nConnection: close\r\nHost: {}\r\n",
        url.path(),
        USER_AGENT,
        url.host
    );
    if let Some(auth) = url.basic_auth() {
        request.push_str(&format!("Authorization: Basic {}\r\n", auth));
    }
    request.push_str("\r\n");

    stream.write_all(request.as_bytes()).await?;

    let mut buf = vec![0u8; RECV_BUFFER_SIZE];
    let n = timeout(HANDSHAKE_WAIT, stream.read(&mut buf))
        .await
        .map_err(|_| {
            HubError::Handshake(format!(
                "{}: no response within {} sec(s)",
                url.path(),
                HANDSHAKE_WAIT.as_secs()
            ))
        })??;
    let reply = &buf[..n];

    if reply.starts_with(b"HTTP") {
        return Err(HubError::Handshake(format!(
            "{}: response error {}",
            url.path(),
            String::from_utf8_lossy(&reply[..reply.len().min(20)])
        )));
    }
    if reply
        .windows(b"SOURCETABLE".len())
        .any(|w| w == b"SOURCETABLE")
    {
        return Err(HubError::Handshake(format!(
            "{}: no data available (sourcetable reply)",
            url.path()
        )));
    }
    if !reply.starts_with(b"ICY 200 OK") {
        return Err(HubError::Handshake(format!(
            "{}: no ntrip response",
            url.path()
        )));
    }

    Ok(())
}
