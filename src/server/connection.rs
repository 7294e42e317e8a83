//! One client connection on the broker side.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::cluster::{Broker, ClientSession};
use crate::error::{Error, Result};
use crate::protocol::{ClientRequest, ClientResponse, Envelope, FrameBody};
use crate::transport::codec::{
    read_frame, round_trip, spawn_writer, PendingCalls, OUTBOUND_QUEUE_DEPTH,
};
use crate::transport::ClientLink;
use crate::types::Delivery;

/// Pushes broker-initiated calls onto the client's own connection.
pub(crate) struct TcpClientLink {
    url: String,
    outbound: mpsc::Sender<Envelope>,
    pending: Arc<PendingCalls<ClientResponse>>,
}

impl TcpClientLink {
    async fn push(&self, request: ClientRequest) -> Result<()> {
        let reply = round_trip(&self.outbound, &self.pending, |correlation_id| Envelope {
            correlation_id,
            body: FrameBody::Push(request),
        })
        .await?;
        match reply {
            ClientResponse::Ok => Ok(()),
            ClientResponse::Error(e) => Err(e.into_error()),
        }
    }
}

#[async_trait]
impl ClientLink for TcpClientLink {
    fn url(&self) -> &str {
        &self.url
    }

    async fn deliver(&self, delivery: Delivery) -> Result<()> {
        self.push(ClientRequest::Deliver(delivery)).await
    }

    async fn alive_check(&self) -> Result<()> {
        self.push(ClientRequest::AliveCheck).await
    }
}

pub struct ClientConnection {
    stream: TcpStream,
    addr: SocketAddr,
}

impl ClientConnection {
    pub fn new(stream: TcpStream, addr: SocketAddr) -> Self {
        Self { stream, addr }
    }

    /// Serve requests until the client goes away or `shutdown` fires.
    ///
    /// Each request runs on its own task so a blocking pull or failover
    /// subscribe does not hold up the connection.
    pub async fn handle_requests(self, broker: Arc<Broker>, shutdown: CancellationToken) -> Result<()> {
        let addr = self.addr;
        self.stream.set_nodelay(true)?;
        let (mut reader, writer) = self.stream.into_split();

        let cancel = shutdown.child_token();
        let (outbound, rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        let pushes = PendingCalls::new();
        let writer_task = spawn_writer(writer, rx, cancel.clone());

        let link = TcpClientLink {
            url: addr.to_string(),
            outbound: outbound.clone(),
            pending: Arc::clone(&pushes),
        };
        let session = ClientSession::new(Arc::new(link));
        broker.session_opened();

        let result = loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                frame = read_frame(&mut reader) => frame,
            };
            let envelope = match frame {
                Ok(Some(envelope)) => envelope,
                Ok(None) => {
                    tracing::debug!(client = %addr, "Client disconnected");
                    break Ok(());
                }
                Err(e) => break Err(e),
            };

            match envelope.body {
                FrameBody::Request(request) => {
                    let broker = Arc::clone(&broker);
                    let session = session.clone();
                    let outbound = outbound.clone();
                    let correlation_id = envelope.correlation_id;
                    tokio::spawn(async move {
                        let response = broker.handle(&session, request).await;
                        let _ = outbound
                            .send(Envelope {
                                correlation_id,
                                body: FrameBody::Response(response),
                            })
                            .await;
                    });
                }
                FrameBody::PushReply(reply) => {
                    pushes.complete(envelope.correlation_id, reply);
                }
                other => {
                    break Err(Error::Transport(format!("unexpected frame from client: {other:?}")));
                }
            }
        };

        broker.session_closed(&session);
        cancel.cancel();
        pushes.fail_all();
        let _ = writer_task.await;
        result
    }
}
