//! Bundle routing.
//!
//! The u32 hash space is cut into a fixed number of contiguous, half-open
//! ranges ("bundles"). A partition is routed by hashing its routing key with
//! CRC32 and finding the bundle whose `[start, end)` contains the hash. Every
//! broker computes the same mapping; only bundle *ownership* lives in the
//! coordination store.
//!
//! `u32::MAX` is never inside a half-open range ending at `u32::MAX`; it is
//! routed to the first bundle.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info};

use super::keys::routing_key;
use super::metadata::MetadataStore;
use super::traits::Version;
use crate::error::{Error, Result};
use crate::types::{BundleDescriptor, PartitionId};

/// CRC32 (IEEE) of a routing key.
pub fn hash_key(key: &str) -> u32 {
    crc32fast::hash(key.as_bytes())
}

/// One bundle's id and hash range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BundleRange {
    pub id: u32,
    pub start: u32,
    /// Exclusive.
    pub end: u32,
}

impl BundleRange {
    pub fn contains(&self, hash: u32) -> bool {
        self.start <= hash && hash < self.end
    }
}

/// The fixed, sorted set of bundle ranges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleTable {
    ranges: Vec<BundleRange>,
}

impl BundleTable {
    /// Split the hash space into `count` equal ranges; the last one absorbs
    /// the remainder. Ids start at 1.
    pub fn even(count: u32) -> Result<Self> {
        if count == 0 {
            return Err(Error::InvalidArgument("bundle count must be at least 1".into()));
        }
        let width = u32::MAX / count;
        let ranges = (0..count)
            .map(|i| BundleRange {
                id: i + 1,
                start: i * width,
                end: if i + 1 == count { u32::MAX } else { (i + 1) * width },
            })
            .collect();
        Ok(Self { ranges })
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn ranges(&self) -> &[BundleRange] {
        &self.ranges
    }

    /// Bundle containing `hash`, by binary search over the range starts.
    pub fn find(&self, hash: u32) -> &BundleRange {
        if hash == u32::MAX {
            return &self.ranges[0];
        }
        let idx = self.ranges.partition_point(|r| r.start <= hash);
        // ranges[0].start == 0, so idx >= 1.
        &self.ranges[idx - 1]
    }

    pub fn bundle_for(&self, topic: &str, partition: PartitionId) -> &BundleRange {
        self.find(hash_key(&routing_key(topic, partition)))
    }
}

/// A cached owner and the bundle node version it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
struct CachedOwner {
    url: String,
    version: Version,
}

/// Resolves and assigns bundle owners.
///
/// Owned bundles are cached. Every cache entry is backed by a one-shot watch
/// on its bundle node; any change to the node evicts the entry, so the next
/// resolve reads the new owner. Unowned bundles are always re-read so an
/// allocation made by the leader becomes visible on the next lookup.
pub struct BundleRouter {
    table: BundleTable,
    metadata: MetadataStore,
    owners: Arc<DashMap<u32, CachedOwner>>,
}

impl BundleRouter {
    pub fn new(table: BundleTable, metadata: MetadataStore) -> Self {
        Self {
            table,
            metadata,
            owners: Arc::new(DashMap::new()),
        }
    }

    pub fn table(&self) -> &BundleTable {
        &self.table
    }

    /// Create any missing bundle nodes.
    pub async fn initialize(&self) -> Result<()> {
        for range in self.table.ranges() {
            let (stored, _) = self
                .metadata
                .ensure_bundle(&BundleDescriptor {
                    id: range.id,
                    start: range.start,
                    end: range.end,
                    owner_url: None,
                })
                .await?;
            if stored.start != range.start || stored.end != range.end {
                return Err(Error::Config(format!(
                    "bundle {} is stored as [{}, {}) but configured as [{}, {})",
                    range.id, stored.start, stored.end, range.start, range.end
                )));
            }
        }
        info!(bundles = self.table.len(), "Bundle table initialized");
        Ok(())
    }

    /// Owner URL of the bundle serving `(topic, partition)`, if any.
    pub async fn resolve(&self, topic: &str, partition: PartitionId) -> Result<(u32, Option<String>)> {
        let id = self.table.bundle_for(topic, partition).id;
        if let Some(cached) = self.owners.get(&id) {
            return Ok((id, Some(cached.url.clone())));
        }
        Ok((id, self.load(id).await?))
    }

    /// Persist `url` as owner of bundle `id` with a version bump.
    ///
    /// If the bundle already has an owner (someone else allocated first),
    /// that owner is returned unchanged.
    pub async fn assign(&self, id: u32, url: &str) -> Result<String> {
        let (mut bundle, version) = self
            .metadata
            .get_bundle(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("bundle {id}")))?;

        if let Some(existing) = bundle.owner_url.clone() {
            return Ok(self.load(id).await?.unwrap_or(existing));
        }

        bundle.owner_url = Some(url.to_string());
        match self.metadata.update_bundle(&bundle, version).await {
            Ok(new_version) => {
                debug!(bundle = id, owner = %url, version = new_version, "Bundle assigned");
                Ok(self.load(id).await?.unwrap_or_else(|| url.to_string()))
            }
            Err(Error::Conflict(msg)) => {
                // Someone else allocated concurrently; use their owner if set.
                self.load(id).await?.ok_or(Error::Conflict(msg))
            }
            Err(e) => Err(e),
        }
    }

    /// Drop a cached owner.
    pub fn invalidate(&self, id: u32) {
        self.owners.remove(&id);
    }

    /// Read the bundle node and cache its owner, arming a watch that evicts
    /// the entry once the node changes.
    async fn load(&self, id: u32) -> Result<Option<String>> {
        let path = self.metadata.paths().bundle(id);
        // Armed before the read so no change between the two is missed.
        let watch = self.metadata.store().watch(&path).await?;
        let Some((bundle, version)) = self.metadata.get_bundle(id).await? else {
            return Ok(None);
        };
        let Some(url) = bundle.owner_url else {
            return Ok(None);
        };

        let cached = CachedOwner { url: url.clone(), version };
        match self.owners.entry(id) {
            Entry::Occupied(mut slot) => {
                if slot.get().version >= version {
                    return Ok(Some(slot.get().url.clone()));
                }
                slot.insert(cached);
            }
            Entry::Vacant(slot) => {
                slot.insert(cached);
            }
        }

        let owners = Arc::clone(&self.owners);
        tokio::spawn(async move {
            let _ = watch.events.await;
            if owners.remove_if(&id, |_, c| c.version == version).is_some() {
                debug!(bundle = id, version, "Bundle node changed; cached owner evicted");
            }
        });
        Ok(Some(url))
    }
}
