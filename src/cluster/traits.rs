//! Store traits the broker is written against.
//!
//! These traits abstract the two external stores, allowing for:
//! - Different backend implementations (in-memory, object storage)
//! - Easier testing with in-process stores that expose fault hooks
//!
//! # Available Implementations
//!
//! - [`MemoryCoordinator`](super::MemoryCoordinator): in-process coordination
//!   store with sessions, ephemeral nodes and one-shot watches
//! - [`ObjectLogStore`](super::ObjectLogStore): log store on `object_store`
//! - [`MemoryLogStore`](super::MemoryLogStore): log store on a `DashMap`
//!
//! # Trait Hierarchy
//!
//! - [`CoordinationStore`]: versioned tree of persistent and ephemeral nodes
//! - [`LogStore`]: flat key-value store for message bodies and cursors

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::oneshot;

use crate::error::Result;

/// Optimistic-concurrency counter carried by every coordination node.
pub type Version = u64;

/// Value and version of a coordination node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeData {
    pub value: Bytes,
    pub version: Version,
}

/// Lifetime of a coordination node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Lives until deleted.
    Persistent,
    /// Removed when the creating session ends.
    Ephemeral,
}

/// What happened to a watched node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEvent {
    Created,
    Deleted,
    DataChanged,
}

/// A one-shot watch registered on a path.
///
/// `exists` is the state observed atomically with registration, so a caller
/// that sees `exists == true` is guaranteed to be notified of the deletion.
#[derive(Debug)]
pub struct Watch {
    pub exists: bool,
    pub events: oneshot::Receiver<WatchEvent>,
}

/// Coordination service (ZooKeeper-like).
///
/// One handle corresponds to one session: ephemeral nodes created through a
/// handle disappear when that session ends.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    // ========================================================================
    // Node lifecycle
    // ========================================================================

    /// Create a node. Fails with `NodeExists` if the path is taken.
    async fn create(&self, path: &str, value: Bytes, kind: NodeKind) -> Result<()>;

    /// Read a node. Fails with `NotFound` if absent.
    async fn get(&self, path: &str) -> Result<NodeData>;

    /// Replace a node's value if its version still equals `expected`.
    ///
    /// Returns the new version. Fails with `Conflict` on a stale version.
    async fn update(&self, path: &str, value: Bytes, expected: Version) -> Result<Version>;

    /// Delete a node, checking the version when one is given.
    async fn delete(&self, path: &str, expected: Option<Version>) -> Result<()>;

    async fn exists(&self, path: &str) -> Result<bool>;

    // ========================================================================
    // Observation
    // ========================================================================

    /// Register a one-shot watch fired on creation, deletion or data change.
    async fn watch(&self, path: &str) -> Result<Watch>;

    /// Names (last path segment) of the direct children of `path`, sorted.
    async fn list_children(&self, path: &str) -> Result<Vec<String>>;

    // ========================================================================
    // Convenience
    // ========================================================================

    async fn create_persistent(&self, path: &str, value: Bytes) -> Result<()> {
        self.create(path, value, NodeKind::Persistent).await
    }

    async fn create_ephemeral(&self, path: &str, value: Bytes) -> Result<()> {
        self.create(path, value, NodeKind::Ephemeral).await
    }
}

/// Flat key-value store holding message bodies and subscription cursors.
#[async_trait]
pub trait LogStore: Send + Sync {
    async fn put(&self, key: &str, value: Bytes) -> Result<()>;

    /// Write `key` only if it does not exist yet. Fails with `Conflict` when
    /// it does; the stored value is left untouched.
    async fn put_if_absent(&self, key: &str, value: Bytes) -> Result<()>;

    /// `Ok(None)` when the key is absent.
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Deleting an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;
}
