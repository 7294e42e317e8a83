//! Broker-side cluster machinery.
//!
//! # Architecture
//!
//! ```text
//!              ┌────────┐   lookup / alloc   ┌──────────────┐
//!              │ Client │ ─────────────────▶ │ BundleRouter │
//!              └───┬────┘                    └──────┬───────┘
//!      connect     │                                │ owner
//!      publish     ▼                                ▼
//!      subscribe ┌────────┐  leases, CAS   ┌─────────────────────┐
//!      pull/ack  │ Broker │ ─────────────▶ │ CoordinationStore   │
//!                └───┬────┘                └─────────────────────┘
//!                    │ bodies, cursors     ┌─────────────────────┐
//!                    └───────────────────▶ │ LogStore            │
//!                                          └─────────────────────┘
//! ```
//!
//! - **Bundles** ([`bundle`]): the u32 hash space is split into a fixed
//!   number of ranges. A partition belongs to the bundle its routing key
//!   hashes into, and a bundle is owned by one broker at a time. The cluster
//!   leader ([`leader`]) assigns unowned bundles to the least loaded broker.
//! - **Partitions** ([`partition_state`]): message count and offsets,
//!   written through with CAS on every mutation.
//! - **Subscriptions** ([`subscription`], [`delivery`]): membership per
//!   mode, cursors, pull-driven delivery.
//! - **Liveness** ([`lease`], [`heartbeat`]): every lead role is an
//!   ephemeral node held through a lease and watched by a heartbeat monitor.
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use bundlemq::cluster::{Broker, BrokerConfig, MemoryCoordinator, MemoryLogStore};
//!
//! # async fn run() -> bundlemq::Result<()> {
//! let broker = Broker::start(
//!     BrokerConfig::default(),
//!     Arc::new(MemoryCoordinator::new()),
//!     Arc::new(MemoryLogStore::new()),
//! )
//! .await?;
//! assert!(broker.is_leader().await);
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod bundle;
pub mod config;
pub mod connections;
pub mod delivery;
pub mod heartbeat;
pub mod keys;
pub mod leader;
pub mod lease;
mod memory_coordinator;
pub mod metadata;
pub mod metrics;
mod object_store;
pub mod partition_state;
pub mod subscription;
mod traits;
mod validation;

pub use broker::{Broker, ClientSession};
pub use bundle::{hash_key, BundleRange, BundleRouter, BundleTable};
pub use config::{
    BrokerConfig, BundleConfig, CoordinationConfig, DeliveryConfig, HeartbeatConfig,
    PersistenceConfig, RedoConfig,
};
pub use heartbeat::{FailureCounter, HeartbeatMonitor, MonitorExit};
pub use lease::Lease;
pub use memory_coordinator::MemoryCoordinator;
pub use metadata::MetadataStore;
pub use object_store::{create_object_store, open_log_store, MemoryLogStore, ObjectLogStore};
pub use partition_state::PartitionState;
pub use subscription::{Crc32KeyRouter, KeyRouter, Subscription};
pub use traits::{CoordinationStore, LogStore, NodeData, NodeKind, Version, Watch, WatchEvent};
pub use validation::{
    validate_client_name, validate_partition, validate_subscription_name, validate_topic_name,
};
