//! Per-connection orchestration.
//!
//! Drives one accepted client: read the preamble, obtain a tunnel port,
//! replay the consumed bytes to the backend in protocol order, then copy
//! bytes both ways until either side closes.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, error, info};

use crate::proxy::preamble::{read_preamble, Preamble};
use crate::tunnel::manager::TunnelManager;

/// TLS alert sent when the preamble cannot be parsed: content type alert,
/// TLS 1.2, length 2, level fatal, description unrecognized_name (112).
pub const TLS_ALERT_UNRECOGNIZED_NAME: [u8; 7] = [0x15, 0x03, 0x03, 0x00, 0x02, 0x02, 0x70];

/// Copy buffer size for the duplex loops.
const COPY_BUF_SIZE: usize = 8192;

/// Handle a single accepted client connection end to end.
pub async fn handle_connection(
    mut client: TcpStream,
    peer_addr: SocketAddr,
    manager: Arc<TunnelManager>,
    read_hello_timeout: Duration,
) {
    debug!(peer = %peer_addr, "incoming connection");

    let preamble = match read_preamble(&mut client, read_hello_timeout).await {
        Ok(preamble) => preamble,
        Err(err) => {
            error!(peer = %peer_addr, error = %err, "SNI extraction failed, rejecting");
            if let Err(err) = client.write_all(&TLS_ALERT_UNRECOGNIZED_NAME).await {
                debug!(peer = %peer_addr, error = %err, "failed to send TLS alert");
            }
            return;
        }
    };

    info!(peer = %peer_addr, sni = %preamble.sni, "resolved SNI");

    let port = match manager.get_or_start(&preamble.sni).await {
        Ok(port) => port,
        Err(err) => {
            error!(peer = %peer_addr, sni = %preamble.sni, error = %err, "tunnel prep failed");
            return;
        }
    };

    if let Err(err) = proxy_to_backend(client, peer_addr, &preamble, port, read_hello_timeout).await
    {
        error!(peer = %peer_addr, sni = %preamble.sni, port, error = %err, "proxy failed");
    }
    manager.release(&preamble.sni).await;
}

/// Dial the tunnel's loopback port, replay the preamble, and run the duplex
/// copy until both directions finish.
async fn proxy_to_backend(
    mut client: TcpStream,
    peer_addr: SocketAddr,
    preamble: &Preamble,
    port: u16,
    read_hello_timeout: Duration,
) -> io::Result<()> {
    let mut backend = TcpStream::connect(("127.0.0.1", port)).await?;

    // PROXY header and/or SSLRequest go first so the backend's SSL answer can
    // be observed before the TLS bytes follow.
    if !preamble.prelude.is_empty() {
        backend.write_all(&preamble.prelude).await?;
    }

    let mut injected = None;
    if preamble.saw_pg_ssl_request {
        match consume_backend_ssl_response(&mut backend, read_hello_timeout).await {
            Ok(answer) => injected = answer,
            // Not fatal: an EOF here means the backend closed, which the
            // copy loop observes on its own.
            Err(err) => {
                debug!(peer = %peer_addr, port, error = %err, "backend SSL response read failed")
            }
        }
    }

    if !preamble.tls_initial.is_empty() {
        backend.write_all(&preamble.tls_initial).await?;
    }

    debug!(peer = %peer_addr, sni = %preamble.sni, port, "proxying");

    let (mut client_read, mut client_write) = client.split();
    let (mut backend_read, mut backend_write) = backend.split();

    let client_to_backend = async {
        let mut total = 0u64;
        let mut buf = vec![0u8; COPY_BUF_SIZE];
        loop {
            match client_read.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    backend_write.write_all(&buf[..n]).await?;
                    total += n as u64;
                }
                Err(err) => return Err(err),
            }
        }
        backend_write.shutdown().await?;
        Ok(total)
    };

    let backend_to_client = async {
        let mut total = 0u64;
        // The backend's declined-TLS byte was consumed above and belongs at
        // the front of the client-bound stream.
        if let Some(byte) = injected {
            client_write.write_all(&[byte]).await?;
            total += 1;
        }
        let mut buf = vec![0u8; COPY_BUF_SIZE];
        loop {
            match backend_read.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    client_write.write_all(&buf[..n]).await?;
                    total += n as u64;
                }
                Err(err) => return Err(err),
            }
        }
        client_write.shutdown().await?;
        Ok(total)
    };

    let (to_backend, to_client) = tokio::join!(client_to_backend, backend_to_client);
    let bytes_to_backend: u64 = to_backend.unwrap_or(0);
    let bytes_to_client: u64 = to_client.unwrap_or(0);

    info!(
        peer = %peer_addr,
        sni = %preamble.sni,
        bytes_to_backend,
        bytes_to_client,
        "connection closed"
    );
    Ok(())
}

/// Consume the backend's one-byte answer to a replayed SSLRequest.
///
/// Returns `None` when the backend accepted TLS with `'S'` (nothing is
/// injected into the client-bound stream) or closed without answering, and
/// `Some(byte)` for anything else, notably `'N'`.
async fn consume_backend_ssl_response(
    backend: &mut TcpStream,
    read_hello_timeout: Duration,
) -> io::Result<Option<u8>> {
    let mut buf = [0u8; 1];
    let n = timeout(read_hello_timeout, backend.read(&mut buf))
        .await
        .map_err(|_| {
            io::Error::new(io::ErrorKind::TimedOut, "backend SSL response timed out")
        })??;
    if n == 0 {
        return Ok(None);
    }
    if buf[0] == b'S' {
        debug!("backend accepted TLS after SSLRequest");
        return Ok(None);
    }
    debug!(byte = buf[0], "backend declined TLS after SSLRequest");
    Ok(Some(buf[0]))
}
