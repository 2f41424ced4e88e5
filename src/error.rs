//! Error types for the tunnel ingress.

use thiserror::Error;

/// Failures while reading or parsing a client's initial bytes.
#[derive(Debug, Error)]
pub enum PreambleError {
    /// I/O failure (including the read-hello deadline expiring).
    #[error("preamble read failed: {0}")]
    Io(#[from] std::io::Error),

    /// PROXY protocol v1 line longer than the protocol allows.
    #[error("proxy v1 header too long")]
    ProxyV1TooLong,

    /// First record is not a TLS handshake record.
    #[error("not a TLS handshake record")]
    NotTlsHandshake,

    /// TLS record length field outside the accepted range.
    #[error("invalid TLS record length {0}")]
    InvalidRecordLength(usize),

    /// A length field inside the ClientHello overflows the record.
    #[error("malformed ClientHello ({0})")]
    MalformedClientHello(&'static str),

    /// server_name extension present but without a host_name entry.
    #[error("SNI extension present but no host name found")]
    SniWithoutHostName,

    /// ClientHello parsed cleanly but carries no server_name extension.
    #[error("no SNI present in ClientHello")]
    NoSni,
}

/// Failures preparing or operating a tunnel for a backend hostname.
///
/// Cloneable because a single launch outcome is broadcast to every
/// connection waiting on the same tunnel.
#[derive(Debug, Clone, Error)]
pub enum TunnelError {
    /// The client's SNI (or the hostname derived from it) fails DNS rules.
    #[error("invalid SNI {sni:?}: {reason}")]
    InvalidSni { sni: String, reason: String },

    /// Every port in the configured range is reserved or OS-busy.
    #[error("no free ports in range {start}-{end}")]
    PoolExhausted { start: u16, end: u16 },

    /// Reserve, spawn, or readiness-probe failure before the tunnel was usable.
    #[error("tunnel startup failed: {0}")]
    StartupFailed(String),

    /// The helper child exited while the tunnel was expected to be running.
    #[error("tunnel exited: {0}")]
    Exited(String),

    /// The helper kept dying; the restart cap was reached with connections attached.
    #[error("tunnel restarts exhausted: {0}")]
    ExhaustedRestarts(String),

    /// The tunnel was torn down (idle timeout or shutdown).
    #[error("tunnel stopped")]
    Stopped,

    /// Request arrived after the manager shut down.
    #[error("tunnel manager is closed")]
    ManagerClosed,
}
