use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{Client, ConnectSpec, Connection};
use crate::error::{Error, Result};
use crate::protocol::PublishRequest;
use crate::types::{ClientRole, Mid, Msid, PartitionId, PublishMode};

/// A publisher bound to one partition.
///
/// Message ids (`mid`) are assigned by the publisher, starting at 1 and
/// increasing by one per publish. A redone publish keeps its mid.
pub struct Publisher {
    client: Client,
    topic: String,
    partition: PartitionId,
    mode: PublishMode,
    connection: Connection,
    next_mid: AtomicI64,
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("name", &self.connection.name)
            .field("topic", &self.topic)
            .field("partition", &self.partition)
            .field("mode", &self.mode)
            .finish()
    }
}

impl Publisher {
    /// Register as a publisher of `topic`/`partition`.
    ///
    /// A `WaitExclusive` publisher blocks here until the current lead goes
    /// away or the operation timeout passes.
    pub async fn connect(
        client: &Client,
        topic: &str,
        partition: PartitionId,
        name: &str,
        mode: PublishMode,
    ) -> Result<Self> {
        Self::connect_as(client, topic, partition, name, mode, ClientRole::Publisher).await
    }

    pub(crate) async fn connect_as(
        client: &Client,
        topic: &str,
        partition: PartitionId,
        name: &str,
        mode: PublishMode,
        role: ClientRole,
    ) -> Result<Self> {
        let connection = client
            .connect(ConnectSpec {
                topic,
                partition,
                name,
                role,
                publish_mode: mode,
                wait: client.config().operation_timeout(),
            })
            .await?;
        Ok(Self {
            client: client.clone(),
            topic: topic.to_string(),
            partition,
            mode,
            connection,
            next_mid: AtomicI64::new(1),
        })
    }

    /// Broker-assigned full name.
    pub fn name(&self) -> &str {
        &self.connection.name
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    pub fn mode(&self) -> PublishMode {
        self.mode
    }

    /// Publish and wait for the assigned msid.
    pub async fn publish(&self, payload: impl Into<Bytes>) -> Result<Msid> {
        self.publish_with_key(None, payload).await
    }

    /// Publish with a routing key for key-shared subscriptions.
    pub async fn publish_with_key(&self, key: Option<String>, payload: impl Into<Bytes>) -> Result<Msid> {
        let mid = self.next_mid.fetch_add(1, Ordering::SeqCst);
        self.send(mid, key, payload.into()).await
    }

    async fn send(&self, mid: Mid, key: Option<String>, payload: Bytes) -> Result<Msid> {
        let request = PublishRequest {
            name: self.connection.name.clone(),
            topic: self.topic.clone(),
            partition: self.partition,
            mid,
            key,
            payload,
        };
        let msid = self
            .client
            .call(&self.connection.url, "publish", self.client.redo(), |service| {
                let request = request.clone();
                async move { service.publish(request).await }
            })
            .await?;
        debug!(name = %self.connection.name, mid, msid, "Published");
        Ok(msid)
    }

    /// Move this publisher behind a bounded queue of `capacity` messages.
    ///
    /// Queued messages are published in order by a background task.
    pub fn into_async(self, capacity: usize) -> AsyncPublisher {
        let (tx, mut rx) = mpsc::channel::<QueuedPublish>(capacity.max(1));
        let publisher = Arc::new(self);
        let worker = Arc::clone(&publisher);
        let task = tokio::spawn(async move {
            while let Some(queued) = rx.recv().await {
                let mid = worker.next_mid.fetch_add(1, Ordering::SeqCst);
                let result = worker.send(mid, queued.key, queued.payload).await;
                if let Err(e) = &result {
                    warn!(name = %worker.connection.name, mid, error = %e, "Queued publish failed");
                }
                let _ = queued.reply.send(result);
            }
        });
        AsyncPublisher {
            publisher,
            queue: Some(tx),
            task: Some(task),
        }
    }

    /// Give up the name (and the lead role, if held).
    pub async fn close(self) -> Result<()> {
        self.client.disconnect(&self.connection).await
    }
}

struct QueuedPublish {
    key: Option<String>,
    payload: Bytes,
    reply: oneshot::Sender<Result<Msid>>,
}

/// Completion of a queued publish.
pub struct PendingPublish(oneshot::Receiver<Result<Msid>>);

impl PendingPublish {
    pub async fn wait(self) -> Result<Msid> {
        self.0
            .await
            .map_err(|_| Error::Canceled)?
    }
}

/// A [`Publisher`] with a bounded send queue.
pub struct AsyncPublisher {
    publisher: Arc<Publisher>,
    queue: Option<mpsc::Sender<QueuedPublish>>,
    task: Option<JoinHandle<()>>,
}

impl AsyncPublisher {
    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    fn queue(&self) -> Result<&mpsc::Sender<QueuedPublish>> {
        self.queue
            .as_ref()
            .ok_or_else(|| Error::InvalidArgument("publisher is closed".to_string()))
    }

    /// Enqueue, waiting for room when the queue is full.
    pub async fn publish(&self, key: Option<String>, payload: impl Into<Bytes>) -> Result<PendingPublish> {
        let (reply, rx) = oneshot::channel();
        let queued = QueuedPublish {
            key,
            payload: payload.into(),
            reply,
        };
        self.queue()?
            .send(queued)
            .await
            .map_err(|_| Error::Canceled)?;
        Ok(PendingPublish(rx))
    }

    /// Enqueue without waiting; `BufferFull` when the queue has no room.
    pub fn try_publish(&self, key: Option<String>, payload: impl Into<Bytes>) -> Result<PendingPublish> {
        let (reply, rx) = oneshot::channel();
        let queued = QueuedPublish {
            key,
            payload: payload.into(),
            reply,
        };
        self.queue()?.try_send(queued).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => Error::BufferFull,
            mpsc::error::TrySendError::Closed(_) => Error::Canceled,
        })?;
        Ok(PendingPublish(rx))
    }

    /// Publish everything queued so far, then stop the worker.
    pub async fn flush(&mut self) -> Result<()> {
        self.queue.take();
        if let Some(task) = self.task.take() {
            task.await
                .map_err(|e| Error::Transport(format!("publish worker failed: {e}")))?;
        }
        Ok(())
    }

    /// Flush and give up the publisher's name.
    pub async fn close(mut self) -> Result<()> {
        self.flush().await?;
        self.publisher.client.disconnect(&self.publisher.connection).await
    }
}
