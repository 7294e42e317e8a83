//! Pull-driven subscriber.
//!
//! One pull loop runs per joined partition. Each pull asks the broker for at
//! most as many messages as the shared receive queue has room for; the
//! broker pushes them over the client's connection while the pull is open.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Client, ConnectSpec, Connection};
use crate::error::{Error, Result};
use crate::protocol::{AckRequest, PullRequest, PullStatus, SubscribeRequest, UnsubscribeRequest};
use crate::types::{ClientRole, Message, Msid, PartitionId, PublishMode, SubscribeMode};

/// Pause before re-pulling after a full queue or a failed pull.
const PULL_RETRY_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeOptions {
    pub subscription: String,
    pub mode: SubscribeMode,
    /// Client name; defaults to the subscription name.
    pub name: Option<String>,
    /// First msid wanted when the subscription is created; `0` starts after
    /// the partition push offset.
    pub sub_offset: Msid,
    /// How long a failover waiter may wait for the lead role.
    pub wait: Option<Duration>,
}

impl SubscribeOptions {
    pub fn new(subscription: impl Into<String>, mode: SubscribeMode) -> Self {
        Self {
            subscription: subscription.into(),
            mode,
            name: None,
            sub_offset: 0,
            wait: None,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn sub_offset(mut self, offset: Msid) -> Self {
        self.sub_offset = offset;
        self
    }

    pub fn wait(mut self, wait: Duration) -> Self {
        self.wait = Some(wait);
        self
    }
}

struct Joined {
    partition: PartitionId,
    connection: Connection,
}

pub struct Subscriber {
    client: Client,
    topic: String,
    options: SubscribeOptions,
    joined: Vec<Joined>,
    messages: mpsc::Receiver<Message>,
    cancel: CancellationToken,
    pullers: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("topic", &self.topic)
            .field("subscription", &self.options.subscription)
            .field("mode", &self.options.mode)
            .field("partitions", &self.partitions())
            .finish()
    }
}

impl Subscriber {
    /// Join `partition` of `topic`, or every partition when `None`.
    pub async fn subscribe(
        client: &Client,
        topic: &str,
        partition: Option<PartitionId>,
        options: SubscribeOptions,
    ) -> Result<Self> {
        let partitions: Vec<PartitionId> = match partition {
            Some(p) => vec![p],
            None => (1..=client.topic_partitions(topic).await?).collect(),
        };
        let (queue, messages) = mpsc::channel(client.config().receive_queue_size.max(1));

        let mut subscriber = Self {
            client: client.clone(),
            topic: topic.to_string(),
            options,
            joined: Vec::with_capacity(partitions.len()),
            messages,
            cancel: CancellationToken::new(),
            pullers: Vec::new(),
        };
        for partition in partitions {
            if let Err(e) = subscriber.join(partition, queue.clone()).await {
                subscriber.leave_all().await;
                return Err(e);
            }
        }
        info!(
            topic,
            subscription = %subscriber.options.subscription,
            partitions = ?subscriber.partitions(),
            "Subscribed"
        );
        Ok(subscriber)
    }

    async fn join(&mut self, partition: PartitionId, queue: mpsc::Sender<Message>) -> Result<()> {
        let name = self
            .options
            .name
            .clone()
            .unwrap_or_else(|| self.options.subscription.clone());
        let wait = self
            .options
            .wait
            .unwrap_or_else(|| self.client.config().operation_timeout());

        let connection = self
            .client
            .connect(ConnectSpec {
                topic: &self.topic,
                partition,
                name: &name,
                role: ClientRole::Subscriber,
                publish_mode: PublishMode::default(),
                wait,
            })
            .await?;

        self.client
            .register_queue(&self.topic, partition, &self.options.subscription, queue.clone());
        let request = SubscribeRequest {
            name: connection.name.clone(),
            topic: self.topic.clone(),
            partition,
            subscription: self.options.subscription.clone(),
            mode: self.options.mode,
            sub_offset: self.options.sub_offset,
            timeout_ms: wait.as_millis() as u64,
        };
        let subscribed = self
            .client
            .call(&connection.url, "subscribe", self.client.waiting_redo(wait), |service| {
                let request = request.clone();
                async move { service.subscribe(request).await }
            })
            .await;
        if let Err(e) = subscribed {
            self.client
                .remove_queue(&self.topic, partition, &self.options.subscription);
            let _ = self.client.disconnect(&connection).await;
            return Err(e);
        }

        let puller = PullLoop {
            client: self.client.clone(),
            url: connection.url.clone(),
            request: PullRequest {
                name: connection.name.clone(),
                topic: self.topic.clone(),
                partition,
                subscription: self.options.subscription.clone(),
                buf_size: 0,
                timeout_ms: self.client.config().pull_timeout_ms,
            },
            queue,
            cancel: self.cancel.child_token(),
        };
        self.pullers.push(tokio::spawn(puller.run()));
        self.joined.push(Joined {
            partition,
            connection,
        });
        Ok(())
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn subscription(&self) -> &str {
        &self.options.subscription
    }

    pub fn partitions(&self) -> Vec<PartitionId> {
        self.joined.iter().map(|j| j.partition).collect()
    }

    /// Next delivered message, in msid order per partition.
    pub async fn receive(&mut self) -> Result<Message> {
        self.messages.recv().await.ok_or(Error::Canceled)
    }

    /// Like [`Subscriber::receive`] but gives up after `timeout`.
    pub async fn receive_timeout(&mut self, timeout: Duration) -> Result<Message> {
        tokio::time::timeout(timeout, self.receive()).await?
    }

    /// Acknowledge `message` and everything before it on its partition.
    pub async fn ack(&self, message: &Message) -> Result<()> {
        self.ack_offset(message.partition, message.msid).await
    }

    pub async fn ack_offset(&self, partition: PartitionId, offset: Msid) -> Result<()> {
        let joined = self
            .joined
            .iter()
            .find(|j| j.partition == partition)
            .ok_or_else(|| Error::NotFound(format!("partition {partition} not joined")))?;
        let request = AckRequest {
            topic: self.topic.clone(),
            partition,
            subscription: self.options.subscription.clone(),
            ack_offset: offset,
        };
        self.client
            .call(&joined.connection.url, "ack", self.client.redo(), |service| {
                let request = request.clone();
                async move { service.ack(request).await }
            })
            .await
    }

    /// Stop pulling and leave the subscription on every partition.
    pub async fn unsubscribe(mut self) -> Result<()> {
        let mut first_error = None;
        self.stop_pulling().await;
        for joined in std::mem::take(&mut self.joined) {
            if let Err(e) = self.leave(&joined).await {
                warn!(partition = joined.partition, error = %e, "Unsubscribe failed");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn stop_pulling(&mut self) {
        self.cancel.cancel();
        for puller in self.pullers.drain(..) {
            let _ = puller.await;
        }
    }

    async fn leave(&self, joined: &Joined) -> Result<()> {
        let request = UnsubscribeRequest {
            name: joined.connection.name.clone(),
            topic: self.topic.clone(),
            partition: joined.partition,
            subscription: self.options.subscription.clone(),
        };
        let result = self
            .client
            .call(&joined.connection.url, "unsubscribe", self.client.redo(), |service| {
                let request = request.clone();
                async move { service.unsubscribe(request).await }
            })
            .await;
        self.client
            .remove_queue(&self.topic, joined.partition, &self.options.subscription);
        result?;
        self.client.disconnect(&joined.connection).await
    }

    async fn leave_all(&mut self) {
        self.stop_pulling().await;
        for joined in std::mem::take(&mut self.joined) {
            if let Err(e) = self.leave(&joined).await {
                debug!(partition = joined.partition, error = %e, "Leave after failed subscribe");
            }
        }
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct PullLoop {
    client: Client,
    url: String,
    request: PullRequest,
    queue: mpsc::Sender<Message>,
    cancel: CancellationToken,
}

impl PullLoop {
    async fn run(mut self) {
        let policy = self.client.waiting_redo(self.client.config().pull_timeout());
        while !self.cancel.is_cancelled() {
            let free = self.queue.capacity();
            if free == 0 {
                self.pause().await;
                continue;
            }
            self.request.buf_size = free as u32;

            let request = self.request.clone();
            let pulled = tokio::select! {
                _ = self.cancel.cancelled() => break,
                pulled = self.client.call(&self.url, "pull", policy, |service| {
                    let request = request.clone();
                    async move { service.pull(request).await }
                }) => pulled,
            };
            match pulled {
                Ok(reply) => {
                    debug!(
                        partition = self.request.partition,
                        delivered = reply.delivered,
                        full = reply.status == PullStatus::BufferFull,
                        "Pull finished"
                    );
                }
                Err(Error::BufferFull) => self.pause().await,
                Err(e) => {
                    warn!(
                        topic = %self.request.topic,
                        partition = self.request.partition,
                        error = %e,
                        "Pull failed"
                    );
                    self.pause().await;
                }
            }
        }
    }

    async fn pause(&self) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep(PULL_RETRY_BACKOFF) => {}
        }
    }
}
