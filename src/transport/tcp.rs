//! Client side of the TCP transport.
//!
//! One [`RpcClient`] owns one connection. Requests are multiplexed by
//! correlation id; broker pushes (`Deliver`, `AliveCheck`) arriving on the
//! same connection are answered by the endpoint the connection was dialed
//! with.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncRead;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::codec::{read_frame, round_trip, spawn_writer, PendingCalls, OUTBOUND_QUEUE_DEPTH};
use super::{BrokerDialer, BrokerService, ClientLink, RequestChannel};
use crate::error::{Error, Result};
use crate::protocol::{
    BrokerRequest, BrokerResponse, ClientRequest, ClientResponse, Envelope, FrameBody, WireError,
};

/// Dials brokers over TCP.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpDialer;

#[async_trait]
impl BrokerDialer for TcpDialer {
    async fn dial(&self, url: &str, endpoint: Arc<dyn ClientLink>) -> Result<Arc<dyn BrokerService>> {
        let client = RpcClient::connect(url, endpoint).await?;
        Ok(Arc::new(client))
    }
}

pub struct RpcClient {
    url: String,
    outbound: mpsc::Sender<Envelope>,
    pending: Arc<PendingCalls<BrokerResponse>>,
    cancel: CancellationToken,
}

impl RpcClient {
    pub async fn connect(url: &str, endpoint: Arc<dyn ClientLink>) -> Result<Self> {
        let stream = TcpStream::connect(url)
            .await
            .map_err(|e| Error::Transport(format!("connect to {url}: {e}")))?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();

        let cancel = CancellationToken::new();
        let (outbound, rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        let pending = PendingCalls::new();
        spawn_writer(writer, rx, cancel.clone());
        tokio::spawn(read_loop(
            reader,
            Arc::clone(&pending),
            outbound.clone(),
            endpoint,
            cancel.clone(),
        ));

        debug!(url, "Connected to broker");
        Ok(Self {
            url: url.to_string(),
            outbound,
            pending,
            cancel,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("url", &self.url)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[async_trait]
impl RequestChannel for RpcClient {
    async fn call(&self, request: BrokerRequest) -> Result<BrokerResponse> {
        if self.is_closed() {
            return Err(Error::Transport(format!("connection to {} closed", self.url)));
        }
        round_trip(&self.outbound, &self.pending, |correlation_id| Envelope {
            correlation_id,
            body: FrameBody::Request(request),
        })
        .await
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn read_loop<R: AsyncRead + Unpin>(
    mut reader: R,
    pending: Arc<PendingCalls<BrokerResponse>>,
    outbound: mpsc::Sender<Envelope>,
    endpoint: Arc<dyn ClientLink>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = read_frame(&mut reader) => frame,
        };
        let envelope = match frame {
            Ok(Some(envelope)) => envelope,
            Ok(None) => {
                debug!("Broker closed connection");
                break;
            }
            Err(e) => {
                warn!(error = %e, "Failed to read from broker");
                break;
            }
        };

        match envelope.body {
            FrameBody::Response(response) => {
                if !pending.complete(envelope.correlation_id, response) {
                    debug!(correlation_id = envelope.correlation_id, "Dropped late response");
                }
            }
            FrameBody::Push(push) => {
                let endpoint = Arc::clone(&endpoint);
                let outbound = outbound.clone();
                let correlation_id = envelope.correlation_id;
                tokio::spawn(async move {
                    let outcome = match push {
                        ClientRequest::Deliver(delivery) => endpoint.deliver(delivery).await,
                        ClientRequest::AliveCheck => endpoint.alive_check().await,
                    };
                    let reply = match outcome {
                        Ok(()) => ClientResponse::Ok,
                        Err(e) => ClientResponse::Error(WireError::from(&e)),
                    };
                    let _ = outbound
                        .send(Envelope {
                            correlation_id,
                            body: FrameBody::PushReply(reply),
                        })
                        .await;
                });
            }
            other => warn!(frame = ?other, "Unexpected frame from broker"),
        }
    }
    cancel.cancel();
    pending.fail_all();
}
