//! Pull-driven delivery.
//!
//! A pull drains the subscription from its push offset up to the partition's
//! message count, pushing each message to its recipient over the recipient's
//! [`ClientLink`](crate::transport::ClientLink). When the partition is
//! drained the pull parks on the partition's publish notification until a
//! new message is committed, the deadline passes or the caller cancels.
//!
//! Each message consumes one unit of `buf_size`, whether it reached the
//! client or was dead-lettered. Any send failure other than cancellation is
//! a dead letter once the redo policy gives up on it.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use super::metrics::{CAS_CONFLICTS, DEAD_LETTERS, MESSAGES_DELIVERED};
use super::partition_state::PartitionState;
use super::subscription::Subscription;
use crate::error::{Error, Result};
use crate::protocol::{PullReply, PullStatus};
use crate::redo::RedoPolicy;
use crate::types::{Delivery, Msid};

pub struct PullParams<'a> {
    pub puller: &'a str,
    pub buf_size: u32,
    pub timeout: Duration,
}

/// Run one pull to completion.
pub async fn pull(
    sub: &Subscription,
    partition: &PartitionState,
    params: PullParams<'_>,
    send: RedoPolicy,
    cancel: &CancellationToken,
) -> Result<PullReply> {
    let deadline = tokio::time::Instant::now() + params.timeout;
    let mut published = partition.watch_published();
    let mut budget = params.buf_size;
    let mut delivered = 0u32;

    loop {
        {
            let mut inner = sub.lock().await;
            inner.check_puller(sub.mode(), params.puller)?;

            loop {
                if budget == 0 {
                    debug!(subscription = sub.name(), delivered, "Pull buffer exhausted");
                    return Ok(PullReply {
                        delivered,
                        status: PullStatus::BufferFull,
                    });
                }
                let next = inner.push_offset();
                if next == 0 || next > partition.message_count() {
                    break;
                }

                let outcome = match partition.read_message(next).await {
                    Ok(message) => {
                        let recipient =
                            inner.recipient(sub.mode(), params.puller, &message, sub.key_router())?;
                        let delivery = Delivery {
                            subscription: sub.name().to_string(),
                            message,
                        };
                        send.run("deliver", |_| {
                            let link = recipient.link.clone();
                            let delivery = delivery.clone();
                            async move { link.deliver(delivery).await }
                        })
                        .await
                        .map(|()| recipient.name)
                    }
                    // A missing body is dead-lettered; any other read failure
                    // is the store's and leaves the cursor where it is.
                    Err(e @ Error::NotFound(_)) => Err(e),
                    Err(e) => return Err(e),
                };

                match outcome {
                    Ok(recipient) => {
                        delivered += 1;
                        MESSAGES_DELIVERED
                            .with_label_values(&[sub.topic()])
                            .inc();
                        debug!(subscription = sub.name(), msid = next, %recipient, "Delivered");
                    }
                    Err(Error::Canceled) => return Err(Error::Canceled),
                    Err(e) => {
                        DEAD_LETTERS.with_label_values(&[sub.topic()]).inc();
                        error!(
                            topic = sub.topic(),
                            partition = sub.partition(),
                            subscription = sub.name(),
                            msid = next,
                            error = %e,
                            "Dead letter"
                        );
                    }
                }
                budget -= 1;

                inner.advance(next);
                advance_partition(partition, next).await?;
                sub.persist_record(&inner).await?;
            }
        }

        tokio::select! {
            changed = published.changed() => {
                if changed.is_err() {
                    return Ok(PullReply { delivered, status: PullStatus::Timeout });
                }
            }
            _ = tokio::time::sleep_until(deadline) => {
                debug!(subscription = sub.name(), delivered, "Pull timed out");
                return Ok(PullReply { delivered, status: PullStatus::Timeout });
            }
            _ = cancel.cancelled() => return Err(Error::Canceled),
        }
    }
}

/// Raise the partition push offset, re-reading the descriptor once on a
/// concurrent update.
async fn advance_partition(partition: &PartitionState, msid: Msid) -> Result<()> {
    match partition.advance_push_offset(msid).await {
        Err(Error::Conflict(_)) => {
            CAS_CONFLICTS.inc();
            partition.refresh().await?;
            partition.advance_push_offset(msid).await
        }
        other => other,
    }
}

/// Acknowledge up to `offset` on the subscription and the partition.
///
/// Returns the subscription's ack offset afterwards.
pub async fn ack(sub: &Subscription, partition: &PartitionState, offset: Msid) -> Result<Msid> {
    let acked = sub.ack(offset).await?;
    match partition.raise_ack_offset(acked).await {
        Err(Error::Conflict(_)) => {
            CAS_CONFLICTS.inc();
            partition.refresh().await?;
            partition.raise_ack_offset(acked).await?;
        }
        other => {
            other?;
        }
    }
    Ok(acked)
}
