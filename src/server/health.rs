//! HTTP health, readiness and metrics endpoints.
//!
//! # Endpoints
//!
//! - `GET /health` - Liveness check (200 while the process runs)
//! - `GET /ready` - Readiness check (503 once the broker is shutting down)
//! - `GET /metrics` - Prometheus metrics in text format

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::cluster::metrics::gather_metrics;
use crate::cluster::Broker;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    /// Alive but not taking traffic.
    NotReady,
    Unhealthy,
}

impl HealthStatus {
    pub fn http_status_code(&self) -> u16 {
        match self {
            HealthStatus::Healthy => 200,
            HealthStatus::NotReady => 503,
            HealthStatus::Unhealthy => 500,
        }
    }

    pub fn http_status_text(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "OK",
            HealthStatus::NotReady => "Service Unavailable",
            HealthStatus::Unhealthy => "Internal Server Error",
        }
    }
}

/// Minimal HTTP listener next to the RPC server.
pub struct HealthServer {
    listener: TcpListener,
    broker: Arc<Broker>,
    shutdown_tx: broadcast::Sender<()>,
}

impl HealthServer {
    pub async fn new(addr: &str, broker: Arc<Broker>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Transport(format!("bind {addr}: {e}")))?;
        let (shutdown_tx, _) = broadcast::channel(1);
        info!(addr = %addr, "Health server listening");
        Ok(Self {
            listener,
            broker,
            shutdown_tx,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    pub fn health_status(&self) -> HealthStatus {
        if self.broker.is_stopping() {
            HealthStatus::NotReady
        } else {
            HealthStatus::Healthy
        }
    }

    pub async fn run(&self) -> Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Health server shutting down");
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    let (mut stream, addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!(error = %e, "Failed to accept health check connection");
                            continue;
                        }
                    };
                    debug!(client_addr = %addr, "Health check connection");
                    let status = self.health_status();
                    let broker = self.broker.name().to_string();

                    tokio::spawn(async move {
                        let mut buf = [0u8; 1024];
                        match stream.read(&mut buf).await {
                            Ok(n) if n > 0 => {
                                let request = String::from_utf8_lossy(&buf[..n]);
                                let response = handle_request(&request, status, &broker);
                                if let Err(e) = stream.write_all(response.as_bytes()).await {
                                    debug!(error = %e, "Failed to write health response");
                                }
                            }
                            Ok(_) => debug!("Empty health request"),
                            Err(e) => debug!(error = %e, "Failed to read health request"),
                        }
                    });
                }
            }
        }
    }
}

fn handle_request(request: &str, status: HealthStatus, broker: &str) -> String {
    let path = request
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("/");

    match path {
        "/health" | "/healthz" | "/live" => {
            http_response(HealthStatus::Healthy, "text/plain", &format!("status: alive\nbroker: {broker}\n"))
        }
        "/ready" | "/readyz" => {
            let body = match status {
                HealthStatus::Healthy => format!("status: ready\nbroker: {broker}\n"),
                _ => format!("status: not_ready\nbroker: {broker}\n"),
            };
            http_response(status, "text/plain", &body)
        }
        "/metrics" => match gather_metrics() {
            Ok(body) => http_response(
                HealthStatus::Healthy,
                "text/plain; version=0.0.4; charset=utf-8",
                &body,
            ),
            Err(e) => {
                error!(error = %e, "Failed to encode metrics");
                http_response(HealthStatus::Unhealthy, "text/plain", "error: failed to encode metrics\n")
            }
        },
        _ => "HTTP/1.1 404 Not Found\r\n\
              Content-Type: text/plain\r\n\
              Connection: close\r\n\
              \r\n\
              endpoints: /health /ready /metrics\n"
            .to_string(),
    }
}

fn http_response(status: HealthStatus, content_type: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {} {}\r\n\
         Content-Type: {content_type}\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {body}",
        status.http_status_code(),
        status.http_status_text(),
        body.len()
    )
}
