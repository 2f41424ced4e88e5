//! Bounded loopback port pool.
//!
//! Ports are handed out from an inclusive range. A candidate port is only
//! returned if an OS probe (bind a throwaway listener, then drop it) succeeds,
//! so ports held by unrelated processes are skipped. The probe cannot rule out
//! another process grabbing the port before the helper binds it; that window
//! surfaces as a tunnel start failure and the reservation is released.

use std::collections::HashSet;

use tokio::net::TcpListener;
use tokio::sync::Mutex;

use crate::error::TunnelError;

pub struct PortPool {
    start: u16,
    end: u16,
    used: Mutex<HashSet<u16>>,
}

impl PortPool {
    /// Create a pool over the inclusive range `[start, end]`.
    pub fn new(start: u16, end: u16) -> Self {
        Self {
            start,
            end,
            used: Mutex::new(HashSet::new()),
        }
    }

    /// Reserve the first free, OS-available port in the range.
    ///
    /// The scan holds the pool lock so two reservations can never race onto
    /// the same port.
    pub async fn reserve(&self) -> Result<u16, TunnelError> {
        let mut used = self.used.lock().await;
        for port in self.start..=self.end {
            if used.contains(&port) {
                continue;
            }
            if !port_available(port).await {
                continue;
            }
            used.insert(port);
            return Ok(port);
        }
        Err(TunnelError::PoolExhausted {
            start: self.start,
            end: self.end,
        })
    }

    /// Return a port to the pool. Unknown ports are ignored; calling twice
    /// for the same port is harmless.
    pub async fn release(&self, port: u16) {
        self.used.lock().await.remove(&port);
    }
}

async fn port_available(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn free_local_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_reserve_and_release() {
        let port = free_local_port().await;
        let pool = PortPool::new(port, port);

        let first = pool.reserve().await.unwrap();
        assert_eq!(first, port);

        assert!(matches!(
            pool.reserve().await,
            Err(TunnelError::PoolExhausted { .. })
        ));

        pool.release(first).await;
        let second = pool.reserve().await.unwrap();
        assert_eq!(second, port);
    }

    #[tokio::test]
    async fn test_busy_port_is_skipped() {
        let holder = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = holder.local_addr().unwrap().port();

        let pool = PortPool::new(port, port);
        assert!(matches!(
            pool.reserve().await,
            Err(TunnelError::PoolExhausted { .. })
        ));
        drop(holder);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let port = free_local_port().await;
        let pool = PortPool::new(port, port);

        let reserved = pool.reserve().await.unwrap();
        pool.release(reserved).await;
        pool.release(reserved).await;
        pool.release(0).await;

        assert_eq!(pool.reserve().await.unwrap(), port);
    }
}
