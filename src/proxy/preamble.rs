//! Staged reader for a client's initial bytes.
//!
//! Consumes, in order: an optional PROXY protocol v1/v2 envelope, an optional
//! PostgreSQL `SSLRequest` (answered locally with `'S'`), and finally the TLS
//! ClientHello record the SNI is parsed from. Every byte taken off the socket
//! is retained verbatim so the backend sees an unbroken stream; the bytes
//! before TLS land in `prelude` and the TLS record (plus anything over-read
//! past it) in `tls_initial`, because the PostgreSQL dance later injects a
//! backend handshake between the two.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::debug;

use crate::error::PreambleError;
use crate::proxy::sni::parse_client_hello_sni;

/// PROXY protocol v2 signature.
const PROXY_V2_SIGNATURE: [u8; 12] = [
    0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A,
];

/// PostgreSQL SSLRequest: length 8, magic 80877103.
const PG_SSL_REQUEST: [u8; 8] = [0x00, 0x00, 0x00, 0x08, 0x04, 0xD2, 0x16, 0x2F];

/// Maximum PROXY v1 line length, delimiter included.
const PROXY_V1_MAX_LINE: usize = 107;

/// Largest accepted TLS record body.
const MAX_TLS_RECORD_LEN: usize = 1 << 15;

/// Everything learned from a client's initial bytes.
#[derive(Debug)]
pub struct Preamble {
    /// SNI host name from the ClientHello.
    pub sni: String,
    /// Bytes that preceded TLS: PROXY header(s) and/or the SSLRequest.
    pub prelude: Vec<u8>,
    /// The TLS ClientHello record plus any bytes buffered past it.
    pub tls_initial: Vec<u8>,
    /// Whether the client opened with a PostgreSQL SSLRequest.
    pub saw_pg_ssl_request: bool,
}

/// Read the preamble from a client stream.
///
/// Each read is bounded by `read_hello_timeout` from the first byte; an
/// accepted SSLRequest resets the window so the client has a full timeout to
/// send its ClientHello.
pub async fn read_preamble<S>(
    stream: &mut S,
    read_hello_timeout: Duration,
) -> Result<Preamble, PreambleError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut sniffer = Sniffer::new(stream, read_hello_timeout);
    let mut prelude = Vec::with_capacity(64);
    let mut tls_initial = Vec::with_capacity(512);

    sniffer.consume_proxy_header(&mut prelude).await?;
    let saw_pg_ssl_request = sniffer.handle_pg_ssl_request(&mut prelude).await?;

    sniffer.read_exact_into(5, &mut tls_initial).await?;
    if tls_initial[0] != 0x16 {
        return Err(PreambleError::NotTlsHandshake);
    }
    let length = u16::from_be_bytes([tls_initial[3], tls_initial[4]]) as usize;
    if length == 0 || length > MAX_TLS_RECORD_LEN {
        return Err(PreambleError::InvalidRecordLength(length));
    }

    sniffer.read_exact_into(length, &mut tls_initial).await?;
    let sni = parse_client_hello_sni(&tls_initial[5..5 + length])?;
    if sni.is_empty() {
        return Err(PreambleError::NoSni);
    }

    // Bytes already pulled past the record belong to the client's stream.
    sniffer.drain_into(&mut tls_initial);

    Ok(Preamble {
        sni,
        prelude,
        tls_initial,
        saw_pg_ssl_request,
    })
}

/// Buffered reader that never loses a byte: peeked data stays in `pending`
/// until explicitly claimed into one of the replay buffers.
struct Sniffer<'a, S> {
    stream: &'a mut S,
    pending: Vec<u8>,
    deadline: Instant,
    read_hello_timeout: Duration,
}

impl<'a, S> Sniffer<'a, S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn new(stream: &'a mut S, read_hello_timeout: Duration) -> Self {
        Self {
            stream,
            pending: Vec::with_capacity(1024),
            deadline: Instant::now() + read_hello_timeout,
            read_hello_timeout,
        }
    }

    /// Detect and consume a PROXY protocol v1 or v2 header.
    ///
    /// Absence is not an error; a timeout while peeking is treated the same
    /// so the TLS stage reports the real deadline failure.
    async fn consume_proxy_header(&mut self, prelude: &mut Vec<u8>) -> Result<(), PreambleError> {
        match self.peek(PROXY_V2_SIGNATURE.len()).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::TimedOut => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        if self.pending.starts_with(b"PROXY ") {
            let line_len = self.read_until_lf().await?;
            if line_len > PROXY_V1_MAX_LINE {
                return Err(PreambleError::ProxyV1TooLong);
            }
            self.claim(line_len, prelude);
            return Ok(());
        }

        if self.pending.len() >= PROXY_V2_SIGNATURE.len()
            && self.pending[..PROXY_V2_SIGNATURE.len()] == PROXY_V2_SIGNATURE
        {
            self.read_exact_into(16, prelude).await?;
            let header = &prelude[prelude.len() - 16..];
            let addr_len = u16::from_be_bytes([header[14], header[15]]) as usize;
            if addr_len > 0 {
                self.read_exact_into(addr_len, prelude).await?;
            }
        }

        Ok(())
    }

    /// Detect a PostgreSQL SSLRequest; on match consume it, answer `'S'`, and
    /// grant the client a fresh window for the ClientHello that follows.
    async fn handle_pg_ssl_request(&mut self, prelude: &mut Vec<u8>) -> Result<bool, PreambleError> {
        match self.peek(PG_SSL_REQUEST.len()).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::TimedOut => return Ok(false),
            Err(e) => return Err(e.into()),
        }
        if self.pending.len() < PG_SSL_REQUEST.len()
            || self.pending[..PG_SSL_REQUEST.len()] != PG_SSL_REQUEST
        {
            return Ok(false);
        }

        debug!("PostgreSQL SSLRequest detected, accepting");
        self.claim(PG_SSL_REQUEST.len(), prelude);
        self.stream.write_all(b"S").await?;
        self.deadline = Instant::now() + self.read_hello_timeout;
        Ok(true)
    }

    /// Buffer at least `n` bytes, stopping early at EOF.
    async fn peek(&mut self, n: usize) -> io::Result<()> {
        let mut chunk = [0u8; 1024];
        while self.pending.len() < n {
            let read = tokio::time::timeout_at(self.deadline, self.stream.read(&mut chunk))
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "preamble read timed out"))??;
            if read == 0 {
                break;
            }
            self.pending.extend_from_slice(&chunk[..read]);
        }
        Ok(())
    }

    /// Read exactly `n` bytes off the stream and append them to `out`.
    async fn read_exact_into(&mut self, n: usize, out: &mut Vec<u8>) -> io::Result<()> {
        self.peek(n).await?;
        if self.pending.len() < n {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "stream closed mid-preamble",
            ));
        }
        self.claim(n, out);
        Ok(())
    }

    /// Buffer until an LF is present and return the line length including it.
    async fn read_until_lf(&mut self) -> io::Result<usize> {
        let mut searched = 0;
        loop {
            if let Some(idx) = self.pending[searched..].iter().position(|&b| b == b'\n') {
                return Ok(searched + idx + 1);
            }
            searched = self.pending.len();
            let before = self.pending.len();
            self.peek(before + 1).await?;
            if self.pending.len() == before {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream closed inside proxy v1 header",
                ));
            }
        }
    }

    /// Move the first `n` pending bytes into `out`.
    fn claim(&mut self, n: usize, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
    }

    /// Hand any remaining buffered bytes to `out`.
    fn drain_into(&mut self, out: &mut Vec<u8>) {
        out.append(&mut self.pending);
    }
}
