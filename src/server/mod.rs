//! TCP front end of a broker.
//!
//! # Example
//! ```rust,no_run
//! use std::sync::Arc;
//! use bundlemq::cluster::{Broker, BrokerConfig, MemoryCoordinator, MemoryLogStore};
//! use bundlemq::server::RpcServer;
//!
//! #[tokio::main]
//! async fn main() -> bundlemq::Result<()> {
//!     let config = BrokerConfig::default();
//!     let addr = format!("{}:{}", config.host, config.port);
//!     let broker = Broker::start(
//!         config,
//!         Arc::new(MemoryCoordinator::new()),
//!         Arc::new(MemoryLogStore::new()),
//!     )
//!     .await?;
//!     let server = RpcServer::new(&addr, broker).await?;
//!     server.run().await
//! }
//! ```

mod connection;
pub mod health;

pub use connection::ClientConnection;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::cluster::Broker;
use crate::error::{Error, Result};

/// Accepts client connections and feeds their requests to a [`Broker`].
pub struct RpcServer {
    listener: TcpListener,
    broker: Arc<Broker>,
    /// Shutdown signal sender
    shutdown_tx: broadcast::Sender<()>,
    /// Canceled on shutdown; ends every open connection.
    connections_cancel: CancellationToken,
    active_connections: Arc<AtomicUsize>,
}

impl RpcServer {
    pub async fn new(addr: &str, broker: Arc<Broker>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Transport(format!("bind {addr}: {e}")))?;

        let (shutdown_tx, _) = broadcast::channel(1);

        tracing::info!(addr = %addr, broker = %broker.name(), "RPC server listening");

        Ok(Self {
            listener,
            broker,
            shutdown_tx,
            connections_cancel: CancellationToken::new(),
            active_connections: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::SeqCst)
    }

    /// Stop accepting and close open connections.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        self.connections_cancel.cancel();
        tracing::info!("Shutdown signal sent");
    }

    /// Initiate shutdown and wait up to `timeout` for connections to drain.
    ///
    /// Returns `true` if all connections drained in time.
    pub async fn shutdown_and_wait(&self, timeout: Duration) -> bool {
        self.shutdown();

        let start = Instant::now();
        let check_interval = Duration::from_millis(50);

        while start.elapsed() < timeout {
            let active = self.active_connections();
            if active == 0 {
                tracing::info!("All connections drained");
                return true;
            }
            tracing::debug!(active_connections = active, "Waiting for connections to drain");
            tokio::time::sleep(check_interval).await;
        }

        tracing::warn!(
            remaining_connections = self.active_connections(),
            "Shutdown timeout, connections still active"
        );
        false
    }

    /// Accept connections until [`RpcServer::shutdown`] is called.
    pub async fn run(&self) -> Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    tracing::info!("Server shutting down, no longer accepting connections");
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            tracing::warn!(error = %e, "Accept failed");
                            continue;
                        }
                    };
                    tracing::debug!(client_addr = %addr, "Accepted connection");

                    let broker = Arc::clone(&self.broker);
                    let active_connections = Arc::clone(&self.active_connections);
                    let cancel = self.connections_cancel.clone();
                    active_connections.fetch_add(1, Ordering::SeqCst);

                    tokio::spawn(async move {
                        let conn = ClientConnection::new(stream, addr);
                        if let Err(e) = conn.handle_requests(broker, cancel).await {
                            tracing::warn!(client_addr = %addr, error = %e, "Connection ended with error");
                        }
                        active_connections.fetch_sub(1, Ordering::SeqCst);
                    });
                }
            }
        }
    }
}

impl std::fmt::Debug for RpcServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcServer")
            .field("local_addr", &self.listener.local_addr().ok())
            .field("active_connections", &self.active_connections())
            .finish_non_exhaustive()
    }
}
