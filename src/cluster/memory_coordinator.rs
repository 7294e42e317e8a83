//! In-process coordination store.
//!
//! A full implementation of [`CoordinationStore`] over a shared node tree.
//! Every [`MemoryCoordinator`] handle is one session; [`MemoryCoordinator::new_session`]
//! opens another session against the same tree, the way a second broker would
//! connect to the same ZooKeeper ensemble. Ephemeral nodes are owned by the
//! session that created them and disappear on [`MemoryCoordinator::expire_session`].
//!
//! Used by the single-node broker binary and by the test suite, which relies
//! on the session and deletion-count hooks.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{oneshot, RwLock};
use tracing::debug;

use super::traits::{CoordinationStore, NodeData, NodeKind, Version, Watch, WatchEvent};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
struct Node {
    value: Bytes,
    version: Version,
    kind: NodeKind,
    session: u64,
}

#[derive(Debug, Default)]
struct Tree {
    nodes: BTreeMap<String, Node>,
    watches: HashMap<String, Vec<oneshot::Sender<WatchEvent>>>,
    expired: BTreeSet<u64>,
    /// Deletions per path, for tests asserting "removed exactly once".
    deletions: HashMap<String, u64>,
}

impl Tree {
    fn fire(&mut self, path: &str, event: WatchEvent) {
        if let Some(watchers) = self.watches.remove(path) {
            for tx in watchers {
                let _ = tx.send(event);
            }
        }
    }

    fn remove(&mut self, path: &str) {
        if self.nodes.remove(path).is_some() {
            *self.deletions.entry(path.to_string()).or_default() += 1;
            self.fire(path, WatchEvent::Deleted);
        }
    }
}

#[derive(Debug, Clone)]
pub struct MemoryCoordinator {
    session: u64,
    tree: Arc<RwLock<Tree>>,
    next_session: Arc<AtomicU64>,
}

impl Default for MemoryCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCoordinator {
    pub fn new() -> Self {
        Self {
            session: 1,
            tree: Arc::new(RwLock::new(Tree::default())),
            next_session: Arc::new(AtomicU64::new(2)),
        }
    }

    /// Open a new session on the same tree.
    pub fn new_session(&self) -> Self {
        Self {
            session: self.next_session.fetch_add(1, Ordering::SeqCst),
            tree: Arc::clone(&self.tree),
            next_session: Arc::clone(&self.next_session),
        }
    }

    pub fn session_id(&self) -> u64 {
        self.session
    }

    /// End this session: its ephemeral nodes are removed and watchers fire.
    ///
    /// Later calls through this handle fail with a store error.
    pub async fn expire_session(&self) {
        let mut tree = self.tree.write().await;
        tree.expired.insert(self.session);
        let owned: Vec<String> = tree
            .nodes
            .iter()
            .filter(|(_, n)| n.kind == NodeKind::Ephemeral && n.session == self.session)
            .map(|(p, _)| p.clone())
            .collect();
        for path in &owned {
            tree.remove(path);
        }
        debug!(session = self.session, removed = owned.len(), "Session expired");
    }

    /// How many times `path` has been deleted.
    pub async fn deletion_count(&self, path: &str) -> u64 {
        self.tree.read().await.deletions.get(path).copied().unwrap_or(0)
    }

    /// Number of nodes in the tree.
    pub async fn node_count(&self) -> usize {
        self.tree.read().await.nodes.len()
    }

    fn check_session(&self, tree: &Tree) -> Result<()> {
        if tree.expired.contains(&self.session) {
            return Err(Error::Store(format!("session {} expired", self.session)));
        }
        Ok(())
    }
}

#[async_trait]
impl CoordinationStore for MemoryCoordinator {
    async fn create(&self, path: &str, value: Bytes, kind: NodeKind) -> Result<()> {
        let mut tree = self.tree.write().await;
        self.check_session(&tree)?;
        if tree.nodes.contains_key(path) {
            return Err(Error::NodeExists(path.to_string()));
        }
        tree.nodes.insert(
            path.to_string(),
            Node {
                value,
                version: 0,
                kind,
                session: self.session,
            },
        );
        tree.fire(path, WatchEvent::Created);
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<NodeData> {
        let tree = self.tree.read().await;
        self.check_session(&tree)?;
        tree.nodes
            .get(path)
            .map(|n| NodeData {
                value: n.value.clone(),
                version: n.version,
            })
            .ok_or_else(|| Error::NotFound(path.to_string()))
    }

    async fn update(&self, path: &str, value: Bytes, expected: Version) -> Result<Version> {
        let mut tree = self.tree.write().await;
        self.check_session(&tree)?;
        let node = tree
            .nodes
            .get_mut(path)
            .ok_or_else(|| Error::NotFound(path.to_string()))?;
        if node.version != expected {
            return Err(Error::Conflict(format!(
                "{path}: expected version {expected}, found {}",
                node.version
            )));
        }
        node.value = value;
        node.version += 1;
        let version = node.version;
        tree.fire(path, WatchEvent::DataChanged);
        Ok(version)
    }

    async fn delete(&self, path: &str, expected: Option<Version>) -> Result<()> {
        let mut tree = self.tree.write().await;
        self.check_session(&tree)?;
        let node = tree
            .nodes
            .get(path)
            .ok_or_else(|| Error::NotFound(path.to_string()))?;
        if let Some(expected) = expected {
            if node.version != expected {
                return Err(Error::Conflict(format!(
                    "{path}: expected version {expected}, found {}",
                    node.version
                )));
            }
        }
        tree.remove(path);
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let tree = self.tree.read().await;
        self.check_session(&tree)?;
        Ok(tree.nodes.contains_key(path))
    }

    async fn watch(&self, path: &str) -> Result<Watch> {
        let mut tree = self.tree.write().await;
        self.check_session(&tree)?;
        let (tx, rx) = oneshot::channel();
        let exists = tree.nodes.contains_key(path);
        let watchers = tree.watches.entry(path.to_string()).or_default();
        watchers.retain(|w| !w.is_closed());
        watchers.push(tx);
        Ok(Watch { exists, events: rx })
    }

    async fn list_children(&self, path: &str) -> Result<Vec<String>> {
        let tree = self.tree.read().await;
        self.check_session(&tree)?;
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let children: BTreeSet<String> = tree
            .nodes
            .range(prefix.clone()..)
            .take_while(|(p, _)| p.starts_with(&prefix))
            .filter_map(|(p, _)| p[prefix.len()..].split('/').next().map(str::to_string))
            .filter(|c| !c.is_empty())
            .collect();
        Ok(children.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_get_update_with_version() {
        let store = MemoryCoordinator::new();
        store
            .create_persistent("/topics/t", Bytes::from_static(b"a"))
            .await
            .unwrap();

        let data = store.get("/topics/t").await.unwrap();
        assert_eq!(data.version, 0);

        let v = store
            .update("/topics/t", Bytes::from_static(b"b"), 0)
            .await
            .unwrap();
        assert_eq!(v, 1);

        let stale = store.update("/topics/t", Bytes::from_static(b"c"), 0).await;
        assert!(matches!(stale, Err(Error::Conflict(_))));
        assert_eq!(store.get("/topics/t").await.unwrap().value, Bytes::from_static(b"b"));
    }

    #[tokio::test]
    async fn test_create_existing_fails() {
        let store = MemoryCoordinator::new();
        store.create_persistent("/a", Bytes::new()).await.unwrap();
        let err = store.create_persistent("/a", Bytes::new()).await.unwrap_err();
        assert_eq!(err, Error::NodeExists("/a".into()));
    }

    #[tokio::test]
    async fn test_delete_checks_version() {
        let store = MemoryCoordinator::new();
        store.create_persistent("/a", Bytes::new()).await.unwrap();
        assert!(matches!(store.delete("/a", Some(3)).await, Err(Error::Conflict(_))));
        store.delete("/a", Some(0)).await.unwrap();
        assert!(!store.exists("/a").await.unwrap());
        assert!(store.delete("/a", None).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_watch_fires_on_delete() {
        let store = MemoryCoordinator::new();
        store.create_ephemeral("/leader", Bytes::new()).await.unwrap();

        let watch = store.watch("/leader").await.unwrap();
        assert!(watch.exists);

        store.delete("/leader", None).await.unwrap();
        assert_eq!(watch.events.await.unwrap(), WatchEvent::Deleted);
    }

    #[tokio::test]
    async fn test_watch_fires_on_create() {
        let store = MemoryCoordinator::new();
        let watch = store.watch("/x").await.unwrap();
        assert!(!watch.exists);
        store.create_persistent("/x", Bytes::new()).await.unwrap();
        assert_eq!(watch.events.await.unwrap(), WatchEvent::Created);
    }

    #[tokio::test]
    async fn test_expire_session_removes_only_its_ephemerals() {
        let a = MemoryCoordinator::new();
        let b = a.new_session();

        a.create_ephemeral("/brokers/a", Bytes::new()).await.unwrap();
        a.create_persistent("/topics/t", Bytes::new()).await.unwrap();
        b.create_ephemeral("/brokers/b", Bytes::new()).await.unwrap();

        let watch = b.watch("/brokers/a").await.unwrap();
        a.expire_session().await;

        assert_eq!(watch.events.await.unwrap(), WatchEvent::Deleted);
        assert!(!b.exists("/brokers/a").await.unwrap());
        assert!(b.exists("/brokers/b").await.unwrap());
        assert!(b.exists("/topics/t").await.unwrap());
        assert!(a.exists("/topics/t").await.is_err());
    }

    #[tokio::test]
    async fn test_list_children() {
        let store = MemoryCoordinator::new();
        for p in [
            "/topics/t/p1",
            "/topics/t/p2",
            "/topics/t/p1/subscription/s",
            "/topics/u",
        ] {
            store.create_persistent(p, Bytes::new()).await.unwrap();
        }
        assert_eq!(store.list_children("/topics").await.unwrap(), vec!["t", "u"]);
        assert_eq!(store.list_children("/topics/t").await.unwrap(), vec!["p1", "p2"]);
        assert!(store.list_children("/nothing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_deletion_count() {
        let store = MemoryCoordinator::new();
        store.create_ephemeral("/l", Bytes::new()).await.unwrap();
        store.delete("/l", None).await.unwrap();
        let _ = store.delete("/l", None).await;
        assert_eq!(store.deletion_count("/l").await, 1);
    }
}
