//! Per-partition counters and the publish path.
//!
//! [`PartitionState`] mirrors the persisted [`PartitionDescriptor`] in memory.
//! Every committed mutation is written through to the coordination store with
//! a compare-and-swap on the descriptor version:
//!
//! ```text
//!   lock ─▶ compute next descriptor ─▶ CAS(version) ─ok─▶ install in memory
//!                                           │
//!                                           └─Conflict─▶ leave memory untouched,
//!                                                        caller refreshes
//! ```
//!
//! The lock is local to this broker. It is only sufficient because a single
//! broker owns the publish path of a partition at a time; the CAS is what
//! catches a second writer.
//!
//! # Invariant
//!
//! `ack_offset <= push_offset <= message_count` holds for every installed
//! descriptor.

use std::sync::Arc;

use bytes::Bytes;
use moka::sync::Cache as MokaCache;
use tokio::sync::{watch, Mutex};
use tracing::{debug, warn};

use super::keys::message_key;
use super::metadata::MetadataStore;
use super::metrics::{CAS_CONFLICTS, MESSAGES_PUBLISHED};
use super::traits::{LogStore, Version};
use crate::error::{Error, Result};
use crate::types::{Message, Mid, Msid, PartitionDescriptor, PartitionId};

/// Shared cache of recently published messages, keyed by log-store key.
pub type MessageCache = MokaCache<String, Message>;

pub fn new_message_cache(capacity: u64) -> MessageCache {
    MokaCache::builder().max_capacity(capacity).build()
}

struct Mirror {
    descriptor: PartitionDescriptor,
    version: Version,
}

pub struct PartitionState {
    topic: String,
    partition: PartitionId,
    metadata: MetadataStore,
    log: Arc<dyn LogStore>,
    cache: MessageCache,
    mirror: Mutex<Mirror>,
    /// Latest committed `message_count`; pulls wait on this.
    published: watch::Sender<Msid>,
}

impl std::fmt::Debug for PartitionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionState")
            .field("topic", &self.topic)
            .field("partition", &self.partition)
            .field("message_count", &self.message_count())
            .finish_non_exhaustive()
    }
}

impl PartitionState {
    /// Load (or create) the persisted descriptor.
    pub async fn open(
        topic: &str,
        partition: PartitionId,
        metadata: MetadataStore,
        log: Arc<dyn LogStore>,
        cache: MessageCache,
    ) -> Result<Self> {
        let (descriptor, version) = metadata.ensure_partition(topic, partition).await?;
        let (published, _) = watch::channel(descriptor.message_count);
        debug!(
            topic,
            partition,
            message_count = descriptor.message_count,
            push_offset = descriptor.push_offset,
            ack_offset = descriptor.ack_offset,
            "Partition opened"
        );
        Ok(Self {
            topic: topic.to_string(),
            partition,
            metadata,
            log,
            cache,
            mirror: Mutex::new(Mirror { descriptor, version }),
            published,
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    /// Latest committed message count.
    pub fn message_count(&self) -> Msid {
        *self.published.borrow()
    }

    /// Notified with the new message count after every committed publish.
    pub fn watch_published(&self) -> watch::Receiver<Msid> {
        self.published.subscribe()
    }

    pub async fn snapshot(&self) -> PartitionDescriptor {
        self.mirror.lock().await.descriptor.clone()
    }

    /// Assign the next msid, persist the body, then CAS the descriptor.
    ///
    /// The body is written create-only, so a committed message is never
    /// replaced. On `Conflict` (from either write) nothing is installed in
    /// memory; call [`Self::refresh`] before retrying.
    pub async fn apply_publish(&self, mid: Mid, key: Option<String>, payload: Bytes) -> Result<Msid> {
        let mut mirror = self.mirror.lock().await;
        let msid = mirror.descriptor.message_count + 1;
        let message = Message {
            topic: self.topic.clone(),
            partition: self.partition,
            msid,
            mid,
            key,
            payload,
        };
        let store_key = message_key(&self.topic, self.partition, msid);
        // A body already at this msid belongs to another writer.
        self.log
            .put_if_absent(&store_key, Bytes::from(serde_json::to_vec(&message)?))
            .await
            .inspect_err(|e| {
                if matches!(e, Error::Conflict(_)) {
                    CAS_CONFLICTS.inc();
                }
            })?;

        let mut next = mirror.descriptor.clone();
        next.message_count = msid;
        let version = match self.commit(&next, mirror.version).await {
            Ok(version) => version,
            Err(e) => {
                // The body was created by this call; an uncommitted msid must
                // stay free for the next attempt.
                if let Err(cleanup) = self.log.delete(&store_key).await {
                    warn!(key = %store_key, error = %cleanup, "Failed to remove uncommitted message body");
                }
                return Err(e);
            }
        };
        mirror.descriptor = next;
        mirror.version = version;

        self.cache.insert(store_key, message);
        self.published.send_replace(msid);
        MESSAGES_PUBLISHED.with_label_values(&[&self.topic]).inc();
        Ok(msid)
    }

    /// Raise the partition push offset. Lower or equal values are a no-op.
    pub async fn advance_push_offset(&self, offset: Msid) -> Result<()> {
        let mut mirror = self.mirror.lock().await;
        if offset <= mirror.descriptor.push_offset {
            return Ok(());
        }
        if offset > mirror.descriptor.message_count {
            return Err(Error::InvalidArgument(format!(
                "push offset {offset} beyond message count {} of {}/p{}",
                mirror.descriptor.message_count, self.topic, self.partition
            )));
        }
        let mut next = mirror.descriptor.clone();
        next.push_offset = offset;
        mirror.version = self.commit(&next, mirror.version).await?;
        mirror.descriptor = next;
        Ok(())
    }

    /// Raise the partition ack floor, clamped to the push offset.
    ///
    /// Returns the ack offset in effect afterwards.
    pub async fn raise_ack_offset(&self, offset: Msid) -> Result<Msid> {
        let mut mirror = self.mirror.lock().await;
        let target = offset.min(mirror.descriptor.push_offset);
        if target <= mirror.descriptor.ack_offset {
            return Ok(mirror.descriptor.ack_offset);
        }
        let mut next = mirror.descriptor.clone();
        next.ack_offset = target;
        mirror.version = self.commit(&next, mirror.version).await?;
        mirror.descriptor = next;
        Ok(target)
    }

    /// Replace the in-memory mirror with the persisted descriptor.
    pub async fn refresh(&self) -> Result<()> {
        let (descriptor, version) = self
            .metadata
            .get_partition(&self.topic, self.partition)
            .await?
            .ok_or_else(|| Error::NotFound(format!("partition {}/p{}", self.topic, self.partition)))?;
        let mut mirror = self.mirror.lock().await;
        self.published.send_replace(descriptor.message_count);
        mirror.descriptor = descriptor;
        mirror.version = version;
        Ok(())
    }

    /// Message `msid`, from the cache or the log store.
    pub async fn read_message(&self, msid: Msid) -> Result<Message> {
        let store_key = message_key(&self.topic, self.partition, msid);
        if let Some(message) = self.cache.get(&store_key) {
            return Ok(message);
        }
        let bytes = self
            .log
            .get(&store_key)
            .await?
            .ok_or_else(|| Error::NotFound(format!("message {store_key}")))?;
        let message: Message = serde_json::from_slice(&bytes)?;
        self.cache.insert(store_key, message.clone());
        Ok(message)
    }

    async fn commit(&self, next: &PartitionDescriptor, version: Version) -> Result<Version> {
        debug_assert!(next.ack_offset <= next.push_offset && next.push_offset <= next.message_count);
        match self.metadata.update_partition(next, version).await {
            Ok(v) => Ok(v),
            Err(Error::Conflict(msg)) => {
                CAS_CONFLICTS.inc();
                warn!(
                    topic = %self.topic,
                    partition = self.partition,
                    expected_version = version,
                    "Partition descriptor changed underneath us"
                );
                Err(Error::Conflict(msg))
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::keys::StorePaths;
    use crate::cluster::{MemoryCoordinator, MemoryLogStore};

    async fn open(meta: &MetadataStore, log: Arc<dyn LogStore>) -> PartitionState {
        PartitionState::open("t", 1, meta.clone(), log, new_message_cache(100))
            .await
            .unwrap()
    }

    fn metadata() -> MetadataStore {
        MetadataStore::new(Arc::new(MemoryCoordinator::new()), StorePaths::default())
    }

    #[tokio::test]
    async fn test_publish_assigns_increasing_msids() {
        let meta = metadata();
        let state = open(&meta, Arc::new(MemoryLogStore::new())).await;
        for mid in 1..=5 {
            let msid = state
                .apply_publish(mid, None, Bytes::from(format!("m{mid}")))
                .await
                .unwrap();
            assert_eq!(msid, mid as u64);
        }
        assert_eq!(state.message_count(), 5);
        let (persisted, version) = meta.get_partition("t", 1).await.unwrap().unwrap();
        assert_eq!(persisted.message_count, 5);
        assert_eq!(version, 5);
    }

    #[tokio::test]
    async fn test_read_falls_back_to_store() {
        let meta = metadata();
        let log: Arc<dyn LogStore> = Arc::new(MemoryLogStore::new());
        let writer = open(&meta, log.clone()).await;
        writer.apply_publish(9, Some("k".into()), Bytes::from_static(b"body")).await.unwrap();

        // A fresh state with an empty cache reads from the log store.
        let reader = open(&meta, log).await;
        let message = reader.read_message(1).await.unwrap();
        assert_eq!(message.mid, 9);
        assert_eq!(message.key.as_deref(), Some("k"));
        assert!(reader.read_message(2).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_conflict_is_surfaced_not_retried() {
        let meta = metadata();
        let log: Arc<dyn LogStore> = Arc::new(MemoryLogStore::new());
        let a = open(&meta, log.clone()).await;
        let b = open(&meta, log).await;

        a.apply_publish(1, None, Bytes::from_static(b"a")).await.unwrap();
        let err = b.apply_publish(2, None, Bytes::from_static(b"b")).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        assert_eq!(b.message_count(), 0);

        b.refresh().await.unwrap();
        assert_eq!(b.message_count(), 1);
        assert_eq!(b.apply_publish(2, None, Bytes::from_static(b"b")).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_stale_writer_cannot_replace_committed_body() {
        let meta = metadata();
        let log: Arc<dyn LogStore> = Arc::new(MemoryLogStore::new());
        let a = open(&meta, log.clone()).await;
        let b = open(&meta, log.clone()).await;

        assert_eq!(a.apply_publish(1, None, Bytes::from_static(b"from-a")).await.unwrap(), 1);
        let err = b
            .apply_publish(2, None, Bytes::from_static(b"from-b"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)), "{err:?}");

        let reader = open(&meta, log).await;
        let committed = reader.read_message(1).await.unwrap();
        assert_eq!(committed.mid, 1);
        assert_eq!(committed.payload, Bytes::from_static(b"from-a"));
    }

    #[tokio::test]
    async fn test_descriptor_conflict_frees_the_msid() {
        let meta = metadata();
        let log: Arc<dyn LogStore> = Arc::new(MemoryLogStore::new());
        let state = open(&meta, log.clone()).await;
        state.apply_publish(1, None, Bytes::from_static(b"one")).await.unwrap();

        // Another writer bumps the descriptor version without adding a message.
        let (descriptor, version) = meta.get_partition("t", 1).await.unwrap().unwrap();
        meta.update_partition(&descriptor, version).await.unwrap();

        let err = state.apply_publish(2, None, Bytes::from_static(b"two")).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)), "{err:?}");
        assert_eq!(log.get(&message_key("t", 1, 2)).await.unwrap(), None);

        state.refresh().await.unwrap();
        assert_eq!(state.apply_publish(2, None, Bytes::from_static(b"two")).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_push_offset_is_monotone_and_bounded() {
        let meta = metadata();
        let state = open(&meta, Arc::new(MemoryLogStore::new())).await;
        for mid in 0..3 {
            state.apply_publish(mid, None, Bytes::new()).await.unwrap();
        }
        state.advance_push_offset(2).await.unwrap();
        state.advance_push_offset(1).await.unwrap();
        assert_eq!(state.snapshot().await.push_offset, 2);
        assert!(state.advance_push_offset(4).await.is_err());
    }

    #[tokio::test]
    async fn test_ack_clamped_to_push_offset() {
        let meta = metadata();
        let state = open(&meta, Arc::new(MemoryLogStore::new())).await;
        for mid in 0..4 {
            state.apply_publish(mid, None, Bytes::new()).await.unwrap();
        }
        state.advance_push_offset(2).await.unwrap();
        assert_eq!(state.raise_ack_offset(10).await.unwrap(), 2);
        assert_eq!(state.raise_ack_offset(1).await.unwrap(), 2);

        let snap = state.snapshot().await;
        assert!(snap.ack_offset <= snap.push_offset && snap.push_offset <= snap.message_count);
    }

    #[tokio::test]
    async fn test_publish_notifies_watchers() {
        let meta = metadata();
        let state = open(&meta, Arc::new(MemoryLogStore::new())).await;
        let mut rx = state.watch_published();
        state.apply_publish(1, None, Bytes::new()).await.unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), 1);
    }

    #[tokio::test]
    async fn test_failed_body_write_assigns_nothing() {
        let meta = metadata();
        let log = Arc::new(MemoryLogStore::new());
        let state = open(&meta, log.clone()).await;
        log.set_fail_writes(true);
        assert!(state.apply_publish(1, None, Bytes::new()).await.is_err());
        log.set_fail_writes(false);
        assert_eq!(state.apply_publish(1, None, Bytes::new()).await.unwrap(), 1);
    }
}
