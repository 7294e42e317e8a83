//! Subscribe, pull, ack and unsubscribe.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use super::{Broker, ClientSession, PartitionEntry};
use crate::cluster::connections::ClientHandle;
use crate::cluster::delivery::{self, PullParams};
use crate::cluster::subscription::Subscription;
use crate::cluster::validation::validate_subscription_name;
use crate::error::{Error, Result};
use crate::protocol::{AckRequest, PullReply, PullRequest, SubscribeRequest, UnsubscribeRequest};
use crate::types::PartitionId;

impl Broker {
    /// Join `req.subscription`, creating it on first use.
    ///
    /// Blocks for a failover waiter until it takes the lead, the request
    /// timeout passes or the session ends. A `Conflict` re-reads the
    /// subscription descriptor before it is returned.
    pub async fn subscribe(&self, session: &ClientSession, req: SubscribeRequest) -> Result<()> {
        validate_subscription_name(&req.subscription)?;
        let entry = self.partition(&req.topic, req.partition).await?;

        let handle = match self.connections.take(&req.name) {
            Some(handle) => handle,
            None => {
                let client_id = self
                    .connections
                    .client_id(&req.name)
                    .ok_or_else(|| Error::NotFound(format!("client {}", req.name)))?;
                ClientHandle {
                    name: req.name.clone(),
                    client_id,
                    link: Arc::clone(&session.link),
                }
            }
        };

        let (sub, ticket) = {
            let mut subs = entry.subscriptions.lock().await;
            let sub = match subs.get(&req.subscription) {
                Some(sub) => Arc::clone(sub),
                None => {
                    let sub = Subscription::open(
                        self.subscription_context(),
                        &req.topic,
                        req.partition,
                        &req.subscription,
                        req.mode,
                    )
                    .await?;
                    subs.insert(req.subscription.clone(), Arc::clone(&sub));
                    sub
                }
            };
            let ticket = sub.join_ticket();
            (sub, ticket)
        };

        let result = sub
            .join(
                ticket,
                &entry.state,
                handle,
                req.mode,
                req.sub_offset,
                Duration::from_millis(req.timeout_ms),
                &session.cancel,
            )
            .await;
        if let Err(e) = result {
            if matches!(e, Error::Conflict(_)) {
                sub.refresh().await?;
            }
            self.close_if_idle(&entry, &sub).await?;
            return Err(e);
        }

        info!(
            name = %req.name,
            subscription = %req.subscription,
            mode = %req.mode,
            "Subscribed"
        );
        Ok(())
    }

    /// Push messages to the subscription's recipients until the buffer
    /// budget is used up or no message arrives before the timeout.
    pub async fn pull(&self, session: &ClientSession, req: PullRequest) -> Result<PullReply> {
        let entry = self.partition(&req.topic, req.partition).await?;
        let sub = self.registered(&entry, &req.subscription, req.partition).await?;
        let reply = delivery::pull(
            &sub,
            &entry.state,
            PullParams {
                puller: &req.name,
                buf_size: req.buf_size,
                timeout: Duration::from_millis(req.timeout_ms),
            },
            self.send_policy,
            &session.cancel,
        )
        .await?;
        debug!(name = %req.name, subscription = %req.subscription, ?reply, "Pull finished");
        Ok(reply)
    }

    pub async fn ack(&self, req: AckRequest) -> Result<()> {
        let entry = self.partition(&req.topic, req.partition).await?;
        let sub = self.registered(&entry, &req.subscription, req.partition).await?;
        let acked = delivery::ack(&sub, &entry.state, req.ack_offset).await?;
        debug!(subscription = %req.subscription, requested = req.ack_offset, acked, "Acked");
        Ok(())
    }

    pub async fn unsubscribe(&self, req: UnsubscribeRequest) -> Result<()> {
        let entry = self.partition(&req.topic, req.partition).await?;
        let sub = self.registered(&entry, &req.subscription, req.partition).await?;
        let empty = match sub.leave(&req.name).await {
            Ok(empty) => empty,
            Err(Error::Conflict(msg)) => {
                sub.refresh().await?;
                return Err(Error::Conflict(msg));
            }
            Err(e) => return Err(e),
        };
        if empty {
            self.close_if_idle(&entry, &sub).await?;
        }
        info!(name = %req.name, subscription = %req.subscription, "Unsubscribed");
        Ok(())
    }

    async fn registered(
        &self,
        entry: &PartitionEntry,
        name: &str,
        partition: PartitionId,
    ) -> Result<Arc<Subscription>> {
        entry
            .subscriptions
            .lock()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "subscription {name} on {}/p{partition}",
                    entry.state.topic()
                ))
            })
    }

    /// Drop `sub` from the registry once nobody is attached or joining.
    pub(crate) async fn close_if_idle(&self, entry: &PartitionEntry, sub: &Arc<Subscription>) -> Result<()> {
        let mut subs = entry.subscriptions.lock().await;
        let registered = subs
            .get(sub.name())
            .is_some_and(|current| Arc::ptr_eq(current, sub));
        if registered && sub.try_close().await? {
            subs.remove(sub.name());
        }
        Ok(())
    }
}
