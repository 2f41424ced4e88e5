//! TCP accept loop.
//!
//! Accepts connections on the public address and spawns one handler task per
//! client. Shutdown is coordinated through a watch channel: the loop stops
//! accepting, then drains outstanding handlers with a bounded wait.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, info, Instrument};

use crate::proxy::handler::handle_connection;
use crate::tunnel::manager::TunnelManager;

/// Bounded wait for in-flight handlers after the accept loop stops.
const HANDLER_DRAIN_GRACE: Duration = Duration::from_secs(5);

pub struct ProxyListener {
    listener: TcpListener,
    manager: Arc<TunnelManager>,
    read_hello_timeout: Duration,
}

impl ProxyListener {
    pub async fn bind(
        addr: SocketAddr,
        manager: Arc<TunnelManager>,
        read_hello_timeout: Duration,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(listen_addr = %listener.local_addr()?, "listener bound");
        Ok(Self {
            listener,
            manager,
            read_hello_timeout,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Run the accept loop until shutdown is signalled or the listener fails.
    ///
    /// Returns `Ok` on a clean shutdown; a fatal accept error is returned so
    /// the caller can initiate the same shutdown path.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> io::Result<()> {
        let mut handlers = JoinSet::new();

        let result = loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer_addr)) => {
                            let manager = Arc::clone(&self.manager);
                            let read_hello_timeout = self.read_hello_timeout;
                            handlers.spawn(
                                handle_connection(stream, peer_addr, manager, read_hello_timeout)
                                    .instrument(tracing::info_span!("connection", peer = %peer_addr)),
                            );
                        }
                        Err(err) if is_transient_accept_error(&err) => {
                            error!(error = %err, "transient accept error");
                        }
                        Err(err) => {
                            error!(error = %err, "accept failed, shutting down");
                            break Err(err);
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break Ok(());
                    }
                }
            }
            // Reap handlers that have already finished.
            while handlers.try_join_next().is_some() {}
        };

        let outstanding = handlers.len();
        if outstanding > 0 {
            debug!(outstanding, "draining connection handlers");
            let drain = async {
                while handlers.join_next().await.is_some() {}
            };
            if timeout(HANDLER_DRAIN_GRACE, drain).await.is_err() {
                debug!("handler drain grace elapsed, aborting the rest");
            }
        }
        // Dropping the set aborts anything still running; tunnel teardown
        // closes their backends as well.
        drop(handlers);

        result
    }
}

/// Errors worth retrying the accept loop on rather than shutting down.
fn is_transient_accept_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::TimedOut
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}
